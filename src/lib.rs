//! Shared helpers for the end-to-end suites under `tests/`

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use appmerge_core::{EventBus, EventKind, InitiateOptions, MergeEvent};

/// Events captured from a bus in publication order
pub type EventLog = Arc<Mutex<Vec<MergeEvent>>>;

/// Subscribe to every event published on `bus`
pub fn record(bus: &EventBus) -> EventLog {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    bus.on_any(move |event| {
        sink.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone())
    });
    events
}

pub fn count(events: &EventLog, kind: EventKind) -> usize {
    events
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .iter()
        .filter(|event| event.kind() == kind)
        .count()
}

/// Poll `condition` until it holds or two seconds pass
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// Initiate options that poll every 20ms
pub fn fast_polling() -> InitiateOptions {
    InitiateOptions {
        start_monitoring: true,
        poll_interval: Duration::from_millis(20),
    }
}
