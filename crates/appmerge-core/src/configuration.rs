//! Configuration orchestrator
//!
//! Drives the three-step configuration workflow
//! (`destination-selection → resource-configuration → review`), gating
//! forward moves on validation and keeping the workflow status in step with
//! the current position.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::bus::{EventBus, MergeEvent};
use crate::error::{MergeError, MergeResult};
use crate::gateway::{MergeGateway, MergeRequest};
use crate::lock::LockManager;
use crate::models::{
    require_id, AppId, AppInfo, AppLevelSettings, ConfigurationRecord, ConfigurationStep,
    DuplicateName, ResourceSelection, WorkflowStatus,
};
use crate::store::StateStore;
use crate::validation::{self, SourceChecks, ValidationResult};

/// Statuses the forward path walks through, in order
const FORWARD_PATH: [WorkflowStatus; 4] = [
    WorkflowStatus::NotStarted,
    WorkflowStatus::DestinationSelected,
    WorkflowStatus::ConfiguringResources,
    WorkflowStatus::ReviewingPreview,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartOptions {
    /// Check the source app for duplicate names and edit permission first
    pub validate_source: bool,
}

impl Default for StartOptions {
    fn default() -> Self {
        Self {
            validate_source: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProceedOptions {
    pub auto_validate: bool,
}

impl Default for ProceedOptions {
    fn default() -> Self {
        Self {
            auto_validate: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CancelOptions {
    /// Release the lock when one is held
    pub auto_unlock: bool,
}

impl Default for CancelOptions {
    fn default() -> Self {
        Self { auto_unlock: true }
    }
}

/// Partial update of the configuration record; unset fields are left alone
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigurationUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_app_id: Option<AppId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_organization_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_pages: Option<ResourceSelection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_data_sources: Option<ResourceSelection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_files: Option<ResourceSelection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_folders: Option<ResourceSelection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_level_settings: Option<AppLevelSettings>,
}

/// How much of one resource type is selected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionCount {
    All,
    Count(usize),
}

impl Serialize for SelectionCount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            SelectionCount::All => serializer.serialize_str("all"),
            SelectionCount::Count(count) => serializer.serialize_u64(*count as u64),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSummary {
    pub has_any: bool,
    pub count: SelectionCount,
}

impl From<&ResourceSelection> for ResourceSummary {
    fn from(selection: &ResourceSelection) -> Self {
        Self {
            has_any: !selection.is_empty(),
            count: selection
                .count()
                .map_or(SelectionCount::All, SelectionCount::Count),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigurationSummary {
    pub pages: ResourceSummary,
    pub data_sources: ResourceSummary,
    pub files: ResourceSummary,
    pub folders: ResourceSummary,
    pub app_level_settings: AppLevelSettings,
}

impl From<&ConfigurationRecord> for ConfigurationSummary {
    fn from(record: &ConfigurationRecord) -> Self {
        Self {
            pages: (&record.selected_pages).into(),
            data_sources: (&record.selected_data_sources).into(),
            files: (&record.selected_files).into(),
            folders: (&record.selected_folders).into(),
            app_level_settings: record.app_level_settings,
        }
    }
}

/// The active record, optionally with a per-type summary
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigurationSnapshot {
    #[serde(flatten)]
    pub config: ConfigurationRecord,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<ConfigurationSummary>,
}

/// Step-by-step merge configuration
#[derive(Clone)]
pub struct ConfigurationOrchestrator {
    gateway: MergeGateway,
    store: Arc<StateStore>,
    bus: EventBus,
    locks: LockManager,
}

impl ConfigurationOrchestrator {
    pub fn new(
        gateway: MergeGateway,
        store: Arc<StateStore>,
        bus: EventBus,
        locks: LockManager,
    ) -> Self {
        Self {
            gateway,
            store,
            bus,
            locks,
        }
    }

    /// Begin a fresh configuration for `source`
    ///
    /// Any previous record is replaced and a finished or cancelled workflow
    /// is reset to `not_started`.
    pub async fn start_configuration(
        &self,
        source: AppId,
        options: StartOptions,
    ) -> MergeResult<ConfigurationRecord> {
        require_id("Source app id", source)?;

        let mut source_app = None;
        if options.validate_source {
            let overview = self.gateway.app_overview(source).await?;
            let outcome = validation::validate_source_app(&overview, SourceChecks::default());
            self.record_validation(&outcome.result, Some(outcome.duplicates))?;

            if !outcome.result.is_valid {
                let message = outcome.result.aggregate_message();
                warn!(source, "Source app failed validation: {message}");
                return Err(MergeError::ValidationFailed(message));
            }
            source_app = Some(AppInfo {
                id: overview.id,
                name: overview.name,
                organization_id: overview.organization_id,
                region: overview.region,
            });
        }

        self.reset_status();

        let record = ConfigurationRecord::new(source);
        let stored = record.clone();
        self.store.update("configuration", move |state| {
            state.configuration = Some(stored);
            state.merge_configuration = Default::default();
            state.merge_configuration.source_app = source_app;
        })?;

        info!(source, "Configuration started");
        self.bus.emit(MergeEvent::ConfigurationStarted {
            config: record.clone(),
        });
        Ok(record)
    }

    /// Validate one step against the current record
    pub fn validate_step(&self, step: ConfigurationStep) -> MergeResult<ValidationResult> {
        let record = self.active()?;
        Ok(validation::validate_step(step, &record))
    }

    /// Same as [`Self::validate_step`], with the step given by name
    pub fn validate_step_named(&self, step: &str) -> MergeResult<ValidationResult> {
        self.validate_step(step.parse()?)
    }

    /// Advance one step, or complete the configuration at the last step
    ///
    /// A configuration that is already complete is returned unchanged.
    pub fn proceed_to_next_step(&self, options: ProceedOptions) -> MergeResult<ConfigurationRecord> {
        let record = self.active()?;
        if record.is_complete {
            debug!(source = record.source_app_id, "Configuration already complete");
            return Ok(record);
        }

        let from = record.current_step;
        if options.auto_validate {
            let result = validation::validate_step(from, &record);
            self.record_validation(&result, None)?;
            if !result.is_valid {
                return Err(MergeError::ValidationFailed(result.aggregate_message()));
            }
        }

        match from.next() {
            Some(to) => {
                match from {
                    ConfigurationStep::DestinationSelection => {
                        self.advance_status(WorkflowStatus::ConfiguringResources)
                    }
                    _ => self.advance_status(WorkflowStatus::ReviewingPreview),
                }

                let updated = self.move_to(to, false)?;
                debug!(from = %from, to = %to, "Configuration step changed");
                self.bus.emit(MergeEvent::ConfigurationStepChanged {
                    from,
                    to,
                    step_index: to.index(),
                });
                Ok(updated)
            }
            None => self.complete(),
        }
    }

    /// Move back one step; fails at the first step
    pub fn return_to_previous_step(&self) -> MergeResult<ConfigurationRecord> {
        let record = self.active()?;
        let from = record.current_step;
        let to = from.previous().ok_or(MergeError::AtFirstStep)?;

        let status = match to {
            ConfigurationStep::DestinationSelection => WorkflowStatus::DestinationSelected,
            _ => WorkflowStatus::ConfiguringResources,
        };
        if self.store.workflow_status() != status {
            self.store.update_merge_status(status, None);
        }

        let updated = self.move_to(to, true)?;
        debug!(from = %from, to = %to, "Configuration step changed");
        self.bus.emit(MergeEvent::ConfigurationStepChanged {
            from,
            to,
            step_index: to.index(),
        });
        Ok(updated)
    }

    /// Abandon the active configuration, releasing the lock if asked to
    pub async fn cancel_configuration(&self, options: CancelOptions) -> MergeResult<()> {
        match self.cancel(options).await {
            Ok(source_app_id) => {
                info!(source = ?source_app_id, "Configuration cancelled");
                self.bus
                    .emit(MergeEvent::ConfigurationCancelled { source_app_id });
                Ok(())
            }
            Err(e) => {
                error!("Failed to cancel configuration: {e}");
                self.bus.emit(MergeEvent::ConfigurationCancelFailed {
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    async fn cancel(&self, options: CancelOptions) -> MergeResult<Option<AppId>> {
        let record = self.store.configuration();

        if options.auto_unlock {
            if let Some(lock) = self.store.lock_status() {
                let source = record
                    .as_ref()
                    .map_or(lock.source_app_id, |record| record.source_app_id);
                let destination = record
                    .as_ref()
                    .and_then(|record| record.destination_app_id)
                    .unwrap_or(lock.destination_app_id);
                self.locks.unlock_apps(source, destination).await?;
            }
        }

        self.store
            .update("configuration", |state| state.configuration = None)?;
        if self.store.workflow_status() != WorkflowStatus::Cancelled {
            self.store.update_merge_status(WorkflowStatus::Cancelled, None);
        }

        Ok(record.map(|record| record.source_app_id))
    }

    /// The active record, or `None` when no configuration is in progress
    pub fn get_configuration(&self, include_summary: bool) -> Option<ConfigurationSnapshot> {
        self.store.configuration().map(|config| ConfigurationSnapshot {
            summary: include_summary.then(|| ConfigurationSummary::from(&config)),
            config,
        })
    }

    /// Write each set field under `configuration.<field>`
    pub fn update_configuration(
        &self,
        update: ConfigurationUpdate,
    ) -> MergeResult<ConfigurationRecord> {
        self.active()?;

        let updates = serde_json::to_value(&update)?;
        if let Value::Object(fields) = &updates {
            for (key, value) in fields {
                self.store.set(&format!("configuration.{key}"), value.clone())?;
            }
        }

        let now = Utc::now();
        self.store.update("configuration.updatedAt", move |state| {
            if let Some(record) = state.configuration.as_mut() {
                record.updated_at = Some(now);
            }
        })?;

        let config = self.active()?;
        debug!(source = config.source_app_id, "Configuration updated");
        self.bus.emit(MergeEvent::ConfigurationUpdated {
            updates,
            config: config.clone(),
        });
        Ok(config)
    }

    /// Payload for the preview and start-merge calls
    pub fn merge_request(&self) -> MergeResult<MergeRequest> {
        let record = self.active()?;
        let destination_app_id = record
            .destination_app_id
            .filter(|id| *id != 0)
            .ok_or_else(|| MergeError::InvalidInput("Destination app id is required".to_string()))?;

        Ok(MergeRequest {
            destination_app_id,
            destination_organization_id: record.destination_organization_id,
            pages: record.selected_pages,
            data_sources: record.selected_data_sources,
            files: record.selected_files,
            folders: record.selected_folders,
            app_level_settings: record.app_level_settings,
            custom_data_sources_in_use: self
                .store
                .merge_configuration()
                .custom_data_sources_in_use,
        })
    }

    fn active(&self) -> MergeResult<ConfigurationRecord> {
        self.store
            .configuration()
            .ok_or(MergeError::NoActiveConfiguration)
    }

    fn move_to(&self, step: ConfigurationStep, reopen: bool) -> MergeResult<ConfigurationRecord> {
        let now = Utc::now();
        self.store.update("configuration", move |state| {
            if let Some(record) = state.configuration.as_mut() {
                record.current_step = step;
                record.step_index = step.index();
                record.updated_at = Some(now);
                if reopen {
                    record.is_complete = false;
                    record.completed_at = None;
                }
            }
        })?;
        self.active()
    }

    fn complete(&self) -> MergeResult<ConfigurationRecord> {
        let now = Utc::now();
        self.store.update("configuration", move |state| {
            let Some(record) = state.configuration.as_mut() else {
                return;
            };
            record.is_complete = true;
            record.completed_at = Some(now);
            record.updated_at = Some(now);

            let merge = &mut state.merge_configuration;
            merge.destination_app = record.destination_app_id.map(|id| AppInfo {
                id,
                organization_id: record.destination_organization_id,
                ..AppInfo::default()
            });
            merge.selected_pages = record.selected_pages.clone();
            merge.selected_data_sources = record.selected_data_sources.clone();
            merge.selected_files = record.selected_files.clone();
            merge.selected_folders = record.selected_folders.clone();
            merge.app_level_settings = record.app_level_settings;
        })?;

        let config = self.active()?;
        info!(source = config.source_app_id, "Configuration completed");
        self.bus.emit(MergeEvent::ConfigurationCompleted {
            config: config.clone(),
        });
        Ok(config)
    }

    /// Walk the status forward along the configuration path up to `target`
    fn advance_status(&self, target: WorkflowStatus) {
        let current = self.store.workflow_status();
        let position = |status| FORWARD_PATH.iter().position(|s| *s == status);

        match (position(current), position(target)) {
            (Some(from), Some(to)) if from < to => {
                for status in &FORWARD_PATH[from + 1..=to] {
                    self.store.update_merge_status(*status, None);
                }
            }
            (Some(_), Some(_)) => {}
            _ => warn!(from = %current, to = %target, "Workflow status is off the configuration path"),
        }
    }

    /// Bring a used workflow back to `not_started`
    fn reset_status(&self) {
        let current = self.store.workflow_status();
        if current == WorkflowStatus::NotStarted {
            return;
        }
        if !current.can_transition_to(WorkflowStatus::NotStarted) {
            self.store.update_merge_status(WorkflowStatus::Cancelled, None);
        }
        self.store.update_merge_status(WorkflowStatus::NotStarted, None);
    }

    fn record_validation(
        &self,
        result: &ValidationResult,
        source_duplicates: Option<Vec<DuplicateName>>,
    ) -> MergeResult<()> {
        let errors = result.errors.clone();
        let has_errors = !result.is_valid;
        self.store.update("validationState", move |state| {
            let validation = &mut state.validation_state;
            validation.has_errors = has_errors;
            validation.errors = errors;
            if let Some(duplicates) = source_duplicates {
                validation.source_app_duplicates = duplicates;
            }
        })
    }
}
