//! Merge execution monitoring tests
//!
//! Timer-driven tests run on a paused clock; sleeping advances it instantly.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use appmerge_core::mocks::{EventRecorder, MockReply, MockTransport};
use appmerge_core::{
    EventBus, EventKind, ExecutionMonitor, InitiateOptions, MergeEvent, MergeGateway,
    MergeRequest, ResourceSelection, StateStore, WorkflowStatus,
};
use appmerge_http::Method;
use serde_json::json;

const START_PATH: &str = "v1/apps/1/merge";
const STATUS_PATH: &str = "v1/apps/1/merge/5000";

struct Harness {
    monitor: ExecutionMonitor,
    store: Arc<StateStore>,
    bus: EventBus,
    recorder: EventRecorder,
    transport: Arc<MockTransport>,
}

fn harness() -> Harness {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let transport = Arc::new(MockTransport::new());
    let bus = EventBus::new();
    let store = Arc::new(StateStore::new(bus.clone()));
    let recorder = EventRecorder::attach(&bus);
    let monitor = ExecutionMonitor::new(
        MergeGateway::new(transport.clone()),
        Arc::clone(&store),
        bus.clone(),
    );
    Harness {
        monitor,
        store,
        bus,
        recorder,
        transport,
    }
}

fn ready_to_merge(store: &StateStore) {
    for status in [
        WorkflowStatus::DestinationSelected,
        WorkflowStatus::ConfiguringResources,
        WorkflowStatus::ReviewingPreview,
    ] {
        store.update_merge_status(status, None);
    }
}

fn request() -> MergeRequest {
    MergeRequest {
        destination_app_id: 2,
        pages: ResourceSelection::All,
        ..Default::default()
    }
}

#[tokio::test(start_paused = true)]
async fn test_completed_tick_emits_one_complete_and_stops() {
    let h = harness();
    ready_to_merge(&h.store);
    h.transport
        .reply(
            Method::POST,
            START_PATH,
            json!({ "mergeId": 5000, "status": "in_progress" }),
        )
        .reply(
            Method::GET,
            STATUS_PATH,
            json!({ "status": "completed", "progress": 100, "result": { "pagesCopied": 4 } }),
        );

    let started = h
        .monitor
        .initiate_merge(1, &request(), InitiateOptions::default())
        .await
        .unwrap();
    assert_eq!(started.merge_id, 5000);
    assert_eq!(started.status, "in_progress");
    assert_eq!(h.store.merge_status().merge_id, Some(5000));
    assert_eq!(h.recorder.count(EventKind::MergeInitiated), 1);

    tokio::time::sleep(Duration::from_millis(2100)).await;

    assert_eq!(h.recorder.count(EventKind::MergeComplete), 1);
    assert_eq!(h.recorder.count(EventKind::MergeError), 0);
    assert!(!h.monitor.is_monitoring(1));
    assert!(!h.monitor.stop_monitoring(1));

    let status = h.store.merge_status();
    assert_eq!(status.status, WorkflowStatus::Completed);
    assert_eq!(status.progress, 100);
    assert_eq!(status.result, Some(json!({ "pagesCopied": 4 })));

    tokio::time::sleep(Duration::from_secs(20)).await;
    assert_eq!(h.recorder.count(EventKind::MergeComplete), 1);
    assert_eq!(h.transport.calls_to(Method::GET, STATUS_PATH), 1);
}

#[tokio::test(start_paused = true)]
async fn test_complete_handler_sees_final_state() {
    let h = harness();
    ready_to_merge(&h.store);
    h.transport
        .reply(Method::POST, START_PATH, json!({ "mergeId": 5000, "status": "queued" }))
        .reply(Method::GET, STATUS_PATH, json!({ "status": "completed", "progress": 100 }));

    let seen = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&seen);
    let store = Arc::clone(&h.store);
    let monitor = h.monitor.clone();
    h.bus.on(EventKind::MergeComplete, move |_| {
        *sink.lock().unwrap() = Some((store.workflow_status(), monitor.is_monitoring(1)));
    });

    h.monitor
        .initiate_merge(1, &request(), InitiateOptions::default())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(3)).await;

    assert_eq!(
        *seen.lock().unwrap(),
        Some((WorkflowStatus::Completed, false))
    );
}

#[tokio::test(start_paused = true)]
async fn test_failed_ticks_keep_polling() {
    let h = harness();
    h.transport
        .script(Method::GET, STATUS_PATH, MockReply::Timeout)
        .script(
            Method::GET,
            STATUS_PATH,
            MockReply::Status(503, json!({ "message": "unavailable" })),
        )
        .script(Method::GET, STATUS_PATH, MockReply::Timeout)
        .reply(
            Method::GET,
            STATUS_PATH,
            json!({ "status": "in_progress", "progress": 30 }),
        );

    h.monitor
        .monitor_progress(1, 5000, Duration::from_secs(2))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(6100)).await;

    assert_eq!(h.recorder.count(EventKind::MergeMonitoringError), 3);
    assert_eq!(h.recorder.count(EventKind::MergeError), 0);
    assert!(h.monitor.is_monitoring(1));

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(h.recorder.count(EventKind::MergeProgress), 1);
    assert_eq!(h.recorder.count(EventKind::MergeMonitoringError), 3);
    assert_eq!(h.store.merge_status().progress, 30);
    assert!(h.monitor.is_monitoring(1));

    h.monitor.cleanup();
    assert_eq!(h.monitor.active_pollers(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_restarting_monitor_leaves_one_poller() {
    let h = harness();
    h.transport.reply(
        Method::GET,
        STATUS_PATH,
        json!({ "status": "in_progress", "progress": 10 }),
    );

    h.monitor
        .monitor_progress(1, 5000, Duration::from_secs(2))
        .unwrap();
    h.monitor
        .monitor_progress(1, 5000, Duration::from_secs(2))
        .unwrap();
    assert_eq!(h.monitor.active_pollers(), 1);

    tokio::time::sleep(Duration::from_millis(4100)).await;

    assert_eq!(h.transport.calls_to(Method::GET, STATUS_PATH), 2);
    assert_eq!(h.recorder.count(EventKind::MergeProgress), 2);

    assert!(h.monitor.stop_monitoring(1));
    assert!(!h.monitor.stop_monitoring(1));
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(h.transport.calls_to(Method::GET, STATUS_PATH), 2);
}

#[tokio::test(start_paused = true)]
async fn test_progress_event_carries_stage() {
    let h = harness();
    h.transport.reply(
        Method::GET,
        STATUS_PATH,
        json!({ "status": "in_progress", "progress": 55.4, "currentStage": "dataSources" }),
    );

    h.monitor
        .monitor_progress(1, 5000, Duration::from_secs(1))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(1100)).await;
    h.monitor.cleanup();

    match &h.recorder.of_kind(EventKind::MergeProgress)[0] {
        MergeEvent::MergeProgress {
            source_app_id,
            merge_id,
            status,
            progress,
            current_stage,
        } => {
            assert_eq!((*source_app_id, *merge_id), (1, 5000));
            assert_eq!(status, "in_progress");
            assert_eq!(*progress, 55);
            assert_eq!(current_stage.as_deref(), Some("dataSources"));
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_stage_complete_in_poll_reply_is_announced() {
    let h = harness();
    h.transport
        .reply(
            Method::GET,
            STATUS_PATH,
            json!({ "status": "in_progress", "progress": 35, "currentStage": "dataSources",
                    "stageComplete": { "name": "pages", "copied": 12 } }),
        )
        .reply(
            Method::GET,
            STATUS_PATH,
            json!({ "status": "in_progress", "progress": 50 }),
        );

    h.monitor
        .monitor_progress(1, 5000, Duration::from_secs(2))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(4500)).await;

    let stages = h.recorder.of_kind(EventKind::MergeStageComplete);
    assert_eq!(stages.len(), 1);
    match &stages[0] {
        MergeEvent::MergeStageComplete {
            source_app_id,
            merge_id,
            stage,
        } => {
            assert_eq!((*source_app_id, *merge_id), (1, 5000));
            assert_eq!(stage["name"], "pages");
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert_eq!(h.recorder.count(EventKind::MergeProgress), 2);
    assert!(h.monitor.is_monitoring(1));

    h.monitor.cleanup();
}
