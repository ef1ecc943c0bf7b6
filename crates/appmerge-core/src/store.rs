//! Workflow state store
//!
//! Owns the single [`WorkflowState`] tree. Reads hand out owned copies;
//! writes go through [`StateStore::set`] (path-addressed JSON) or
//! [`StateStore::update`] (typed closure announced under a path). Each write
//! completes before its `state:change` event fires, and the internal lock is
//! released before handlers run so they can read or write the store.

use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::bus::{EventBus, MergeEvent};
use crate::error::{MergeError, MergeResult};
use crate::models::{
    ConfigurationRecord, LockStatus, MergeConfiguration, MergeStatus, ValidationState,
    WorkflowState, WorkflowStatus,
};

#[derive(Debug)]
pub struct StateStore {
    state: Mutex<WorkflowState>,
    bus: EventBus,
}

impl StateStore {
    pub fn new(bus: EventBus) -> Self {
        Self {
            state: Mutex::new(WorkflowState::default()),
            bus,
        }
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Copy of the whole tree
    pub fn get_state(&self) -> WorkflowState {
        self.lock().clone()
    }

    /// Copy of the value at a dot-separated path
    ///
    /// An empty path returns the whole tree. `None` when a segment is missing
    /// or an intermediate value is not an object.
    pub fn get(&self, path: &str) -> Option<Value> {
        let tree = serde_json::to_value(&*self.lock()).ok()?;
        lookup(&tree, path).cloned()
    }

    pub fn merge_configuration(&self) -> MergeConfiguration {
        self.lock().merge_configuration.clone()
    }

    pub fn lock_status(&self) -> Option<LockStatus> {
        self.lock().lock_status.clone()
    }

    pub fn merge_status(&self) -> MergeStatus {
        self.lock().merge_status.clone()
    }

    pub fn validation_state(&self) -> ValidationState {
        self.lock().validation_state.clone()
    }

    pub fn configuration(&self) -> Option<ConfigurationRecord> {
        self.lock().configuration.clone()
    }

    pub fn workflow_status(&self) -> WorkflowStatus {
        self.lock().merge_status.status
    }

    /// Replace the value at `path`, creating intermediate objects as needed
    ///
    /// The resulting tree must still fit the typed schema; otherwise nothing
    /// changes and [`MergeError::InvalidValue`] is returned. Changing
    /// `mergeStatus.status` this way is refused with
    /// [`MergeError::StatusGuarded`].
    pub fn set(&self, path: &str, value: Value) -> MergeResult<&Self> {
        if path.is_empty() {
            return Err(MergeError::InvalidPath(path.to_string()));
        }

        let old_value = {
            let mut state = self.lock();
            let mut tree = serde_json::to_value(&*state)?;
            let old_value = lookup(&tree, path).cloned().unwrap_or(Value::Null);

            assign(&mut tree, path, value.clone())?;
            let next: WorkflowState =
                serde_json::from_value(tree).map_err(|e| MergeError::InvalidValue {
                    path: path.to_string(),
                    reason: e.to_string(),
                })?;

            if next.merge_status.status != state.merge_status.status {
                return Err(MergeError::StatusGuarded);
            }

            *state = next;
            old_value
        };

        debug!(path, "State updated");
        self.bus.emit(MergeEvent::StateChange {
            path: path.to_string(),
            old_value,
            new_value: value,
            timestamp: Utc::now(),
        });
        Ok(self)
    }

    /// Apply a typed mutation and announce it under `path`
    ///
    /// The change event carries the serialized values at `path` from before
    /// and after the mutation.
    pub fn update<F>(&self, path: &str, mutate: F) -> MergeResult<()>
    where
        F: FnOnce(&mut WorkflowState),
    {
        let (old_value, new_value) = {
            let mut state = self.lock();
            let mut next = state.clone();
            mutate(&mut next);

            if next.merge_status.status != state.merge_status.status {
                return Err(MergeError::StatusGuarded);
            }

            let old_value = value_at(&state, path);
            let new_value = value_at(&next, path);
            *state = next;
            (old_value, new_value)
        };

        debug!(path, "State updated");
        self.bus.emit(MergeEvent::StateChange {
            path: path.to_string(),
            old_value,
            new_value,
            timestamp: Utc::now(),
        });
        Ok(())
    }

    /// Reset to the initial tree
    pub fn clear_state(&self) {
        *self.lock() = WorkflowState::default();
        debug!("State cleared");
        self.bus.emit(MergeEvent::StateCleared {
            timestamp: Utc::now(),
        });
    }

    pub fn validate_state_transition(&self, from: WorkflowStatus, to: WorkflowStatus) -> bool {
        from.can_transition_to(to)
    }

    /// Transition check by status name; unknown names are never valid
    pub fn validate_transition_names(&self, from: &str, to: &str) -> bool {
        match (from.parse::<WorkflowStatus>(), to.parse::<WorkflowStatus>()) {
            (Ok(from), Ok(to)) => self.validate_state_transition(from, to),
            _ => false,
        }
    }

    /// Move `mergeStatus.status` along the transition table
    ///
    /// `extra` is an object of further `mergeStatus` fields (camelCase) written
    /// together with the status. Returns `false`, logs a warning and changes
    /// nothing when the transition is not allowed or `extra` does not fit.
    pub fn update_merge_status(&self, new_status: WorkflowStatus, extra: Option<Value>) -> bool {
        let (from, old_value, new_value) = {
            let mut state = self.lock();
            let from = state.merge_status.status;

            if !self.validate_state_transition(from, new_status) {
                warn!(from = %from, to = %new_status, "Refused invalid merge status transition");
                return false;
            }

            let next_status = match with_status(&state.merge_status, new_status, extra.as_ref()) {
                Ok(next) => next,
                Err(e) => {
                    warn!(from = %from, to = %new_status, "Refused merge status update: {e}");
                    return false;
                }
            };

            let old_value = serde_json::to_value(&state.merge_status).unwrap_or(Value::Null);
            let new_value = serde_json::to_value(&next_status).unwrap_or(Value::Null);
            state.merge_status = next_status;
            (from, old_value, new_value)
        };

        let timestamp = Utc::now();
        debug!(from = %from, to = %new_status, "Merge status changed");
        self.bus.emit(MergeEvent::StateChange {
            path: "mergeStatus".to_string(),
            old_value,
            new_value,
            timestamp,
        });
        self.bus.emit(MergeEvent::MergeStatusChange {
            from,
            to: new_status,
            data: extra,
            timestamp,
        });
        true
    }

    fn lock(&self) -> MutexGuard<'_, WorkflowState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn value_at(state: &WorkflowState, path: &str) -> Value {
    serde_json::to_value(state)
        .ok()
        .and_then(|tree| lookup(&tree, path).cloned())
        .unwrap_or(Value::Null)
}

fn with_status(
    current: &MergeStatus,
    status: WorkflowStatus,
    extra: Option<&Value>,
) -> MergeResult<MergeStatus> {
    let mut next = current.clone();
    next.status = status;

    let Some(extra) = extra else {
        return Ok(next);
    };
    let Value::Object(fields) = extra else {
        return Err(MergeError::InvalidValue {
            path: "mergeStatus".to_string(),
            reason: "extra fields must be an object".to_string(),
        });
    };

    let mut tree = serde_json::to_value(&next)?;
    if let Value::Object(target) = &mut tree {
        for (key, value) in fields.iter().filter(|(key, _)| key.as_str() != "status") {
            target.insert(key.clone(), value.clone());
        }
    }
    serde_json::from_value(tree).map_err(|e| MergeError::InvalidValue {
        path: "mergeStatus".to_string(),
        reason: e.to_string(),
    })
}

fn lookup<'a>(tree: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(tree);
    }
    path.split('.')
        .try_fold(tree, |node, segment| node.as_object()?.get(segment))
}

fn assign(tree: &mut Value, path: &str, value: Value) -> MergeResult<()> {
    let segments: Vec<&str> = path.split('.').collect();
    if segments.iter().any(|segment| segment.is_empty()) {
        return Err(MergeError::InvalidPath(path.to_string()));
    }

    let (leaf, parents) = segments
        .split_last()
        .ok_or_else(|| MergeError::InvalidPath(path.to_string()))?;

    let mut node = tree;
    for segment in parents {
        let object = node
            .as_object_mut()
            .ok_or_else(|| MergeError::InvalidPath(path.to_string()))?;
        let child = object
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if child.is_null() {
            *child = Value::Object(Map::new());
        }
        node = child;
    }

    node.as_object_mut()
        .ok_or_else(|| MergeError::InvalidPath(path.to_string()))?
        .insert(leaf.to_string(), value);
    Ok(())
}
