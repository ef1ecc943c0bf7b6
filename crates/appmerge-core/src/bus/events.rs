//! Event types for the merge event bus
//!
//! Every event has a stable wire name (`lock:acquired`, `merge:progress`, ...)
//! exposed through [`EventKind::as_str`]. Consumers subscribe by kind.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::MergeError;
use crate::models::{AppId, ConfigurationRecord, ConfigurationStep, MergeId, WorkflowStatus};

/// Subscription key for [`MergeEvent`]s
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    LockAcquired,
    LockFailed,
    LockReleased,
    LockReleaseFailed,
    LockExtended,
    LockExtendFailed,
    LockExpiring,
    LockExpired,
    LockAutoExtendFailed,
    ConfigurationStarted,
    ConfigurationStepChanged,
    ConfigurationCompleted,
    ConfigurationCancelled,
    ConfigurationCancelFailed,
    ConfigurationUpdated,
    MergeInitiated,
    MergePreviewed,
    MergeProgress,
    MergeStageComplete,
    MergeComplete,
    MergeError,
    MergeMonitoringError,
    MergeFailed,
    MergeLogsFetched,
    StateChange,
    StateCleared,
    MergeStatusChange,
}

impl EventKind {
    pub const ALL: [EventKind; 27] = [
        EventKind::LockAcquired,
        EventKind::LockFailed,
        EventKind::LockReleased,
        EventKind::LockReleaseFailed,
        EventKind::LockExtended,
        EventKind::LockExtendFailed,
        EventKind::LockExpiring,
        EventKind::LockExpired,
        EventKind::LockAutoExtendFailed,
        EventKind::ConfigurationStarted,
        EventKind::ConfigurationStepChanged,
        EventKind::ConfigurationCompleted,
        EventKind::ConfigurationCancelled,
        EventKind::ConfigurationCancelFailed,
        EventKind::ConfigurationUpdated,
        EventKind::MergeInitiated,
        EventKind::MergePreviewed,
        EventKind::MergeProgress,
        EventKind::MergeStageComplete,
        EventKind::MergeComplete,
        EventKind::MergeError,
        EventKind::MergeMonitoringError,
        EventKind::MergeFailed,
        EventKind::MergeLogsFetched,
        EventKind::StateChange,
        EventKind::StateCleared,
        EventKind::MergeStatusChange,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::LockAcquired => "lock:acquired",
            EventKind::LockFailed => "lock:failed",
            EventKind::LockReleased => "lock:released",
            EventKind::LockReleaseFailed => "lock:release-failed",
            EventKind::LockExtended => "lock:extended",
            EventKind::LockExtendFailed => "lock:extend-failed",
            EventKind::LockExpiring => "lock:expiring",
            EventKind::LockExpired => "lock:expired",
            EventKind::LockAutoExtendFailed => "lock:auto-extend-failed",
            EventKind::ConfigurationStarted => "configuration:started",
            EventKind::ConfigurationStepChanged => "configuration:step-changed",
            EventKind::ConfigurationCompleted => "configuration:completed",
            EventKind::ConfigurationCancelled => "configuration:cancelled",
            EventKind::ConfigurationCancelFailed => "configuration:cancel-failed",
            EventKind::ConfigurationUpdated => "configuration:updated",
            EventKind::MergeInitiated => "merge:initiated",
            EventKind::MergePreviewed => "merge:previewed",
            EventKind::MergeProgress => "merge:progress",
            EventKind::MergeStageComplete => "merge:stage-complete",
            EventKind::MergeComplete => "merge:complete",
            EventKind::MergeError => "merge:error",
            EventKind::MergeMonitoringError => "merge:monitoring-error",
            EventKind::MergeFailed => "merge:failed",
            EventKind::MergeLogsFetched => "merge:logs-fetched",
            EventKind::StateChange => "state:change",
            EventKind::StateCleared => "state:cleared",
            EventKind::MergeStatusChange => "merge:status:change",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = MergeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| MergeError::InvalidInput(format!("Unknown event: {s}")))
    }
}

/// Events published by the orchestration core
#[derive(Debug, Clone, PartialEq)]
pub enum MergeEvent {
    LockAcquired {
        source_id: AppId,
        destination_id: AppId,
        locked_until: DateTime<Utc>,
    },
    LockFailed {
        source_id: AppId,
        destination_id: AppId,
        error: String,
    },
    LockReleased {
        source_id: AppId,
        destination_id: AppId,
    },
    LockReleaseFailed {
        source_id: AppId,
        destination_id: AppId,
        error: String,
    },
    LockExtended {
        source_id: AppId,
        destination_id: AppId,
        locked_until: DateTime<Utc>,
    },
    LockExtendFailed {
        source_id: AppId,
        destination_id: AppId,
        error: String,
    },
    LockExpiring {
        app_id: AppId,
        remaining_seconds: u64,
    },
    LockExpired {
        app_id: AppId,
    },
    LockAutoExtendFailed {
        app_id: AppId,
        destination_id: AppId,
        error: String,
    },
    ConfigurationStarted {
        config: ConfigurationRecord,
    },
    ConfigurationStepChanged {
        from: ConfigurationStep,
        to: ConfigurationStep,
        step_index: usize,
    },
    ConfigurationCompleted {
        config: ConfigurationRecord,
    },
    ConfigurationCancelled {
        source_app_id: Option<AppId>,
    },
    ConfigurationCancelFailed {
        error: String,
    },
    ConfigurationUpdated {
        updates: Value,
        config: ConfigurationRecord,
    },
    MergeInitiated {
        source_app_id: AppId,
        merge_id: MergeId,
        status: String,
    },
    MergePreviewed {
        source_app_id: AppId,
        preview: Value,
    },
    MergeProgress {
        source_app_id: AppId,
        merge_id: MergeId,
        status: String,
        progress: u8,
        current_stage: Option<String>,
    },
    MergeStageComplete {
        source_app_id: AppId,
        merge_id: MergeId,
        stage: Value,
    },
    MergeComplete {
        source_app_id: AppId,
        merge_id: MergeId,
        result: Value,
    },
    MergeError {
        source_app_id: AppId,
        merge_id: MergeId,
        error: String,
    },
    MergeMonitoringError {
        source_app_id: AppId,
        merge_id: MergeId,
        error: String,
    },
    MergeFailed {
        source_app_id: AppId,
        error: String,
    },
    MergeLogsFetched {
        app_id: AppId,
        merge_id: MergeId,
        count: usize,
    },
    StateChange {
        path: String,
        old_value: Value,
        new_value: Value,
        timestamp: DateTime<Utc>,
    },
    StateCleared {
        timestamp: DateTime<Utc>,
    },
    MergeStatusChange {
        from: WorkflowStatus,
        to: WorkflowStatus,
        data: Option<Value>,
        timestamp: DateTime<Utc>,
    },
}

impl MergeEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            MergeEvent::LockAcquired { .. } => EventKind::LockAcquired,
            MergeEvent::LockFailed { .. } => EventKind::LockFailed,
            MergeEvent::LockReleased { .. } => EventKind::LockReleased,
            MergeEvent::LockReleaseFailed { .. } => EventKind::LockReleaseFailed,
            MergeEvent::LockExtended { .. } => EventKind::LockExtended,
            MergeEvent::LockExtendFailed { .. } => EventKind::LockExtendFailed,
            MergeEvent::LockExpiring { .. } => EventKind::LockExpiring,
            MergeEvent::LockExpired { .. } => EventKind::LockExpired,
            MergeEvent::LockAutoExtendFailed { .. } => EventKind::LockAutoExtendFailed,
            MergeEvent::ConfigurationStarted { .. } => EventKind::ConfigurationStarted,
            MergeEvent::ConfigurationStepChanged { .. } => EventKind::ConfigurationStepChanged,
            MergeEvent::ConfigurationCompleted { .. } => EventKind::ConfigurationCompleted,
            MergeEvent::ConfigurationCancelled { .. } => EventKind::ConfigurationCancelled,
            MergeEvent::ConfigurationCancelFailed { .. } => EventKind::ConfigurationCancelFailed,
            MergeEvent::ConfigurationUpdated { .. } => EventKind::ConfigurationUpdated,
            MergeEvent::MergeInitiated { .. } => EventKind::MergeInitiated,
            MergeEvent::MergePreviewed { .. } => EventKind::MergePreviewed,
            MergeEvent::MergeProgress { .. } => EventKind::MergeProgress,
            MergeEvent::MergeStageComplete { .. } => EventKind::MergeStageComplete,
            MergeEvent::MergeComplete { .. } => EventKind::MergeComplete,
            MergeEvent::MergeError { .. } => EventKind::MergeError,
            MergeEvent::MergeMonitoringError { .. } => EventKind::MergeMonitoringError,
            MergeEvent::MergeFailed { .. } => EventKind::MergeFailed,
            MergeEvent::MergeLogsFetched { .. } => EventKind::MergeLogsFetched,
            MergeEvent::StateChange { .. } => EventKind::StateChange,
            MergeEvent::StateCleared { .. } => EventKind::StateCleared,
            MergeEvent::MergeStatusChange { .. } => EventKind::MergeStatusChange,
        }
    }

    /// Stable wire name of this event
    pub fn name(&self) -> &'static str {
        self.kind().as_str()
    }
}
