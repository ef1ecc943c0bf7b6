//! Mock implementations for testing and offline usage

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use appmerge_http::{ApiRequest, HttpError, Method, StatusCode, Transport};
use async_trait::async_trait;
use serde_json::Value;

use crate::bus::{EventBus, EventKind, MergeEvent, SubscriptionId};

/// A scripted reply
#[derive(Debug, Clone, PartialEq)]
pub enum MockReply {
    Ok(Value),
    /// Non-2xx response with its JSON payload
    Status(u16, Value),
    /// Network failure, no response
    Timeout,
    /// Successful reply that takes this long to arrive
    Slow(Duration, Value),
}

impl MockReply {
    fn into_result(self) -> Result<Value, HttpError> {
        match self {
            MockReply::Ok(body) => Ok(body),
            MockReply::Status(code, payload) => {
                let status =
                    StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                let message = payload
                    .get("message")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| status.to_string());
                Err(HttpError::HttpStatus {
                    status,
                    message,
                    payload: Some(payload),
                })
            }
            MockReply::Timeout => Err(HttpError::Timeout(Duration::from_secs(30))),
            MockReply::Slow(_, body) => Ok(body),
        }
    }
}

/// Transport that answers from per-route scripts and records every request
///
/// Replies for a route are consumed in order; the last one repeats. An
/// unscripted route answers 404.
#[derive(Default)]
pub struct MockTransport {
    routes: Mutex<HashMap<(Method, String), VecDeque<MockReply>>>,
    requests: Mutex<Vec<ApiRequest>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a successful reply
    pub fn reply(&self, method: Method, path: &str, body: Value) -> &Self {
        self.script(method, path, MockReply::Ok(body))
    }

    /// Queue a non-2xx reply
    pub fn fail(&self, method: Method, path: &str, status: u16, payload: Value) -> &Self {
        self.script(method, path, MockReply::Status(status, payload))
    }

    pub fn script(&self, method: Method, path: &str, reply: MockReply) -> &Self {
        self.routes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry((method, path.to_string()))
            .or_default()
            .push_back(reply);
        self
    }

    /// Every request received so far, oldest first
    pub fn requests(&self) -> Vec<ApiRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn calls_to(&self, method: Method, path: &str) -> usize {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|request| request.method == method && request.path == path)
            .count()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, request: ApiRequest) -> Result<Value, HttpError> {
        let key = (request.method.clone(), request.path.clone());
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request);

        let reply = {
            let mut routes = self.routes.lock().unwrap_or_else(PoisonError::into_inner);
            match routes.get_mut(&key) {
                Some(queue) if queue.len() > 1 => queue.pop_front(),
                Some(queue) => queue.front().cloned(),
                None => None,
            }
        };

        if let Some(MockReply::Slow(delay, _)) = &reply {
            tokio::time::sleep(*delay).await;
        }
        match reply {
            Some(reply) => reply.into_result(),
            None => MockReply::Status(404, serde_json::json!({ "message": "No such route" }))
                .into_result(),
        }
    }
}

/// Collects every event published on a bus
pub struct EventRecorder {
    bus: EventBus,
    subscription: SubscriptionId,
    events: Arc<Mutex<Vec<MergeEvent>>>,
}

impl EventRecorder {
    pub fn attach(bus: &EventBus) -> Self {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let subscription = bus.on_any(move |event| {
            sink.lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(event.clone());
        });
        Self {
            bus: bus.clone(),
            subscription,
            events,
        }
    }

    pub fn events(&self) -> Vec<MergeEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Recorded events of one kind, oldest first
    pub fn of_kind(&self, kind: EventKind) -> Vec<MergeEvent> {
        self.events()
            .into_iter()
            .filter(|event| event.kind() == kind)
            .collect()
    }

    pub fn count(&self, kind: EventKind) -> usize {
        self.of_kind(kind).len()
    }

    /// Wire names in emission order
    pub fn names(&self) -> Vec<&'static str> {
        self.events().iter().map(MergeEvent::name).collect()
    }

    pub fn clear(&self) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl Drop for EventRecorder {
    fn drop(&mut self) {
        self.bus.off_any(self.subscription);
    }
}
