//! Property-based tests for the workflow state store

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use appmerge_core::mocks::EventRecorder;
use appmerge_core::{EventBus, EventKind, StateStore, WorkflowStatus};
use proptest::prelude::*;
use serde_json::{json, Value};

const TABLE: [(WorkflowStatus, &[WorkflowStatus]); 8] = {
    use WorkflowStatus::*;
    [
        (NotStarted, &[DestinationSelected, Cancelled]),
        (DestinationSelected, &[ConfiguringResources, NotStarted, Cancelled]),
        (ConfiguringResources, &[ReviewingPreview, DestinationSelected, Cancelled]),
        (ReviewingPreview, &[MergeInProgress, ConfiguringResources, Cancelled]),
        (MergeInProgress, &[Completed, Error, Cancelled]),
        (Completed, &[NotStarted]),
        (Error, &[NotStarted, Cancelled]),
        (Cancelled, &[NotStarted]),
    ]
};

fn status_strategy() -> impl Strategy<Value = WorkflowStatus> {
    prop::sample::select(WorkflowStatus::ALL.to_vec())
}

fn allowed(from: WorkflowStatus, to: WorkflowStatus) -> bool {
    TABLE
        .iter()
        .find(|(status, _)| *status == from)
        .is_some_and(|(_, targets)| targets.contains(&to))
}

/// Shortest chain of valid transitions from `not_started` to `target`
fn path_to(target: WorkflowStatus) -> Vec<WorkflowStatus> {
    let mut previous: HashMap<WorkflowStatus, WorkflowStatus> = HashMap::new();
    let mut queue = VecDeque::from([WorkflowStatus::NotStarted]);

    while let Some(status) = queue.pop_front() {
        if status == target {
            break;
        }
        for next in status.allowed_transitions() {
            if *next != WorkflowStatus::NotStarted && !previous.contains_key(next) {
                previous.insert(*next, status);
                queue.push_back(*next);
            }
        }
    }

    let mut path = Vec::new();
    let mut current = target;
    while current != WorkflowStatus::NotStarted {
        path.push(current);
        current = previous[&current];
    }
    path.reverse();
    path
}

fn store_at(status: WorkflowStatus) -> (StateStore, EventRecorder) {
    let bus = EventBus::new();
    let store = StateStore::new(bus.clone());
    for step in path_to(status) {
        assert!(store.update_merge_status(step, None));
    }
    (store, EventRecorder::attach(&bus))
}

/// Property: the transition check agrees with the fixed table for every pair
#[test]
fn prop_transition_check_matches_table() {
    proptest!(|(from in status_strategy(), to in status_strategy())| {
        let store = StateStore::new(EventBus::new());
        prop_assert_eq!(store.validate_state_transition(from, to), allowed(from, to));
        prop_assert_eq!(
            store.validate_transition_names(from.as_str(), to.as_str()),
            allowed(from, to)
        );
    });
}

/// Property: an invalid status update changes nothing; a valid one always announces itself
#[test]
fn prop_update_merge_status_mutates_only_on_valid_transition() {
    proptest!(|(from in status_strategy(), to in status_strategy())| {
        let (store, recorder) = store_at(from);
        let before = store.get_state();

        let applied = store.update_merge_status(to, Some(json!({ "currentStage": "stage-one" })));

        prop_assert_eq!(applied, allowed(from, to));
        if applied {
            prop_assert_eq!(store.workflow_status(), to);
            let stage = store.merge_status().current_stage;
            prop_assert_eq!(stage.as_deref(), Some("stage-one"));
            prop_assert_eq!(recorder.count(EventKind::MergeStatusChange), 1);
        } else {
            prop_assert_eq!(store.get_state(), before);
            prop_assert!(recorder.events().is_empty());
        }
    });
}

/// Property: values handed out by the store never alias the live tree
#[test]
fn prop_reads_are_independent_of_later_mutation() {
    proptest!(|(
        keys in prop::collection::vec("[a-z]{1,8}", 1..6),
        values in prop::collection::vec(any::<i64>(), 1..6)
    )| {
        let store = Arc::new(StateStore::new(EventBus::new()));
        for (key, value) in keys.iter().zip(&values) {
            store.set(&format!("cache.key_{key}"), json!(value)).unwrap();
        }

        let snapshot = store.get("cache").unwrap();
        let state = store.get_state();

        let mut copy = snapshot.clone();
        if let Value::Object(fields) = &mut copy {
            fields.clear();
        }
        store.set("cache.late", json!("written after the read")).unwrap();

        let expected = store.get("cache").unwrap();
        prop_assert_eq!(expected.get("late"), Some(&json!("written after the read")));
        prop_assert!(snapshot.get("late").is_none());
        prop_assert!(state.cache.get("late").is_none());
        prop_assert_eq!(snapshot.as_object().map(|m| m.len()), Some(state.cache.len()));
    });
}

#[test]
fn every_status_is_reachable_from_not_started() {
    for status in WorkflowStatus::ALL {
        let (store, _) = store_at(status);
        assert_eq!(store.workflow_status(), status);
    }
}
