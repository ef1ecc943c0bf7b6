//! Merge execution monitor
//!
//! Starts the server-side merge job and polls it until the server reports a
//! terminal status, mirroring each reply into `mergeStatus` and translating
//! it into local status transitions and events.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::bus::{EventBus, MergeEvent};
use crate::error::{MergeError, MergeResult};
use crate::gateway::{LogQuery, MergeGateway, MergeRequest, MergeStartResponse, MergeStatusResponse};
use crate::models::{require_id, AppId, LogEntry, MergeId, WorkflowStatus};
use crate::store::StateStore;
use crate::tasks::{TaskRegistry, TaskTicket};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitiateOptions {
    pub start_monitoring: bool,
    pub poll_interval: Duration,
}

impl Default for InitiateOptions {
    fn default() -> Self {
        Self {
            start_monitoring: true,
            poll_interval: Duration::from_secs(2),
        }
    }
}

/// Starts merge jobs and follows them to completion
#[derive(Clone)]
pub struct ExecutionMonitor {
    gateway: MergeGateway,
    store: Arc<StateStore>,
    bus: EventBus,
    pollers: TaskRegistry<AppId>,
}

impl ExecutionMonitor {
    pub fn new(gateway: MergeGateway, store: Arc<StateStore>, bus: EventBus) -> Self {
        Self {
            gateway,
            store,
            bus,
            pollers: TaskRegistry::new("merge-pollers"),
        }
    }

    /// Start the merge job for `source` and, unless suppressed, poll it
    pub async fn initiate_merge(
        &self,
        source: AppId,
        request: &MergeRequest,
        options: InitiateOptions,
    ) -> MergeResult<MergeStartResponse> {
        require_id("Source app id", source)?;
        require_id("Destination app id", request.destination_app_id)?;
        if options.start_monitoring && options.poll_interval.is_zero() {
            return Err(MergeError::InvalidInput(
                "Poll interval must be greater than zero".to_string(),
            ));
        }

        let started = match self.gateway.initiate(source, request).await {
            Ok(response) if response.merge_id == 0 => Err(MergeError::MalformedReply(
                "start-merge reply carries no mergeId".to_string(),
            )),
            Ok(response) => Ok(response),
            Err(e) => Err(MergeError::from(e)),
        };
        let response = match started {
            Ok(response) => response,
            Err(e) => {
                error!(source, "Failed to start merge: {e}");
                self.bus.emit(MergeEvent::MergeFailed {
                    source_app_id: source,
                    error: e.to_string(),
                });
                return Err(e);
            }
        };

        let now = Utc::now();
        let started = response.clone();
        self.store.update("mergeStatus", move |state| {
            let status = &mut state.merge_status;
            status.merge_id = Some(started.merge_id);
            status.progress = started.progress_percent();
            status.remote_status = Some(started.status);
            status.current_stage = None;
            status.started_at = Some(now);
            status.last_updated = Some(now);
            status.result = None;
            status.error = None;
            status.logs.clear();
        })?;
        self.store
            .update_merge_status(WorkflowStatus::MergeInProgress, None);

        info!(source, merge_id = response.merge_id, "Merge started");
        self.bus.emit(MergeEvent::MergeInitiated {
            source_app_id: source,
            merge_id: response.merge_id,
            status: response.status.clone(),
        });

        if options.start_monitoring {
            self.monitor_progress(source, response.merge_id, options.poll_interval)?;
        }
        Ok(response)
    }

    /// Poll `merge_id` every `poll_interval`, replacing any poller for `source`
    pub fn monitor_progress(
        &self,
        source: AppId,
        merge_id: MergeId,
        poll_interval: Duration,
    ) -> MergeResult<()> {
        require_id("Source app id", source)?;
        require_id("Merge id", merge_id)?;
        if poll_interval.is_zero() {
            return Err(MergeError::InvalidInput(
                "Poll interval must be greater than zero".to_string(),
            ));
        }

        let monitor = self.clone();
        self.pollers.spawn(source, move |ticket| async move {
            let mut ticker = interval_at(Instant::now() + poll_interval, poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if monitor.poll_once(&ticket, merge_id).await {
                    break;
                }
            }
        });
        debug!(source, merge_id, interval = ?poll_interval, "Merge poller started");
        Ok(())
    }

    /// One poll; returns `true` once the job has reached a terminal status
    async fn poll_once(&self, ticket: &TaskTicket<AppId>, merge_id: MergeId) -> bool {
        let source = *ticket.key();

        let response = match self.gateway.status(source, merge_id).await {
            Ok(response) => response,
            Err(e) => {
                warn!(source, merge_id, "Merge status poll failed: {e}");
                self.bus.emit(MergeEvent::MergeMonitoringError {
                    source_app_id: source,
                    merge_id,
                    error: e.to_string(),
                });
                return false;
            }
        };

        if let Err(e) = self.record_progress(source, merge_id, &response) {
            warn!(source, merge_id, "Could not record merge progress: {e}");
        }

        if let Some(stage) = response.stage_complete.clone() {
            self.bus.emit(MergeEvent::MergeStageComplete {
                source_app_id: source,
                merge_id,
                stage,
            });
        }

        if !response.is_terminal() {
            return false;
        }

        ticket.finish();
        if let Err(e) = self.finish(source, merge_id, response) {
            warn!(source, merge_id, "Could not record merge outcome: {e}");
        }
        true
    }

    fn record_progress(
        &self,
        source: AppId,
        merge_id: MergeId,
        response: &MergeStatusResponse,
    ) -> MergeResult<()> {
        let progress = response.progress_percent();
        let remote = response.status.clone();
        let stage = response.current_stage.clone();
        let now = Utc::now();

        self.store.update("mergeStatus", move |state| {
            let status = &mut state.merge_status;
            status.remote_status = Some(remote);
            status.progress = progress;
            if stage.is_some() {
                status.current_stage = stage;
            }
            status.last_updated = Some(now);
        })?;

        debug!(source, merge_id, progress, status = %response.status, "Merge progress");
        self.bus.emit(MergeEvent::MergeProgress {
            source_app_id: source,
            merge_id,
            status: response.status.clone(),
            progress,
            current_stage: self.store.merge_status().current_stage,
        });
        Ok(())
    }

    fn finish(
        &self,
        source: AppId,
        merge_id: MergeId,
        response: MergeStatusResponse,
    ) -> MergeResult<()> {
        if response.is_success() {
            let result = response.result.unwrap_or(Value::Null);
            let stored = result.clone();
            self.store
                .update("mergeStatus.result", move |state| {
                    state.merge_status.result = Some(stored)
                })?;
            self.store
                .update_merge_status(WorkflowStatus::Completed, None);

            info!(source, merge_id, "Merge completed");
            self.bus.emit(MergeEvent::MergeComplete {
                source_app_id: source,
                merge_id,
                result,
            });
        } else {
            let message = response.error_message();
            let stored = message.clone();
            self.store
                .update("mergeStatus.error", move |state| {
                    state.merge_status.error = Some(stored)
                })?;
            self.store.update_merge_status(WorkflowStatus::Error, None);

            error!(source, merge_id, "Merge failed: {message}");
            self.bus.emit(MergeEvent::MergeError {
                source_app_id: source,
                merge_id,
                error: message,
            });
        }
        Ok(())
    }

    /// Stop the poller for `source`; returns whether one was running
    pub fn stop_monitoring(&self, source: AppId) -> bool {
        self.pollers.stop(&source)
    }

    pub fn is_monitoring(&self, source: AppId) -> bool {
        self.pollers.is_active(&source)
    }

    pub fn active_pollers(&self) -> usize {
        self.pollers.len()
    }

    /// Stop every poller
    pub fn cleanup(&self) {
        let stopped = self.pollers.stop_all();
        debug!(stopped, "Merge pollers cleaned up");
    }

    /// One-shot status fetch
    pub async fn get_merge_result(
        &self,
        source: AppId,
        merge_id: MergeId,
    ) -> MergeResult<MergeStatusResponse> {
        require_id("Source app id", source)?;
        require_id("Merge id", merge_id)?;

        self.gateway
            .status(source, merge_id)
            .await
            .map_err(|e| MergeError::Context {
                context: format!("Failed to get result of merge {merge_id}"),
                source: e,
            })
    }

    /// One-shot log fetch; the entries replace `mergeStatus.logs`
    pub async fn fetch_logs(
        &self,
        app_id: AppId,
        merge_id: MergeId,
        query: &LogQuery,
    ) -> MergeResult<Vec<LogEntry>> {
        require_id("App id", app_id)?;
        require_id("Merge id", merge_id)?;

        let logs = self
            .gateway
            .logs(app_id, merge_id, query)
            .await
            .map_err(|e| MergeError::Context {
                context: format!("Failed to fetch logs for merge {merge_id}"),
                source: e,
            })?;

        let stored = logs.clone();
        self.store
            .update("mergeStatus.logs", move |state| state.merge_status.logs = stored)?;

        self.bus.emit(MergeEvent::MergeLogsFetched {
            app_id,
            merge_id,
            count: logs.len(),
        });
        Ok(logs)
    }

    /// Ask the server what a merge would change; the diff is cached under `cache.preview`
    pub async fn preview_merge(&self, source: AppId, request: &MergeRequest) -> MergeResult<Value> {
        require_id("Source app id", source)?;
        require_id("Destination app id", request.destination_app_id)?;

        let preview = self
            .gateway
            .preview(source, request)
            .await
            .map_err(|e| MergeError::Context {
                context: format!("Failed to preview merge of app {source}"),
                source: e,
            })?;

        let cached = preview.clone();
        self.store.update("cache.preview", move |state| {
            state.cache.insert("preview".to_string(), cached);
        })?;

        self.bus.emit(MergeEvent::MergePreviewed {
            source_app_id: source,
            preview: preview.clone(),
        });
        Ok(preview)
    }
}
