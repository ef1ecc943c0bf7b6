//! Workflow state data model
//!
//! Everything here serializes with camelCase field names so a dot-separated
//! path such as `mergeStatus.status` addresses the same field the typed
//! accessors do.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::MergeError;
use crate::validation::ValidationError;

/// Remote application identifier
pub type AppId = u64;

/// Remote merge job identifier
pub type MergeId = u64;

/// Reject the zero id, which stands for "not provided"
pub(crate) fn require_id(label: &str, id: u64) -> Result<u64, MergeError> {
    if id == 0 {
        Err(MergeError::InvalidInput(format!("{label} is required")))
    } else {
        Ok(id)
    }
}

/// Local workflow status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    #[default]
    NotStarted,
    DestinationSelected,
    ConfiguringResources,
    ReviewingPreview,
    MergeInProgress,
    Completed,
    Error,
    Cancelled,
}

impl WorkflowStatus {
    pub const ALL: [WorkflowStatus; 8] = [
        WorkflowStatus::NotStarted,
        WorkflowStatus::DestinationSelected,
        WorkflowStatus::ConfiguringResources,
        WorkflowStatus::ReviewingPreview,
        WorkflowStatus::MergeInProgress,
        WorkflowStatus::Completed,
        WorkflowStatus::Error,
        WorkflowStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStatus::NotStarted => "not_started",
            WorkflowStatus::DestinationSelected => "destination_selected",
            WorkflowStatus::ConfiguringResources => "configuring_resources",
            WorkflowStatus::ReviewingPreview => "reviewing_preview",
            WorkflowStatus::MergeInProgress => "merge_in_progress",
            WorkflowStatus::Completed => "completed",
            WorkflowStatus::Error => "error",
            WorkflowStatus::Cancelled => "cancelled",
        }
    }

    /// Statuses reachable from this one in a single step
    pub fn allowed_transitions(&self) -> &'static [WorkflowStatus] {
        use WorkflowStatus::*;
        match self {
            NotStarted => &[DestinationSelected, Cancelled],
            DestinationSelected => &[ConfiguringResources, NotStarted, Cancelled],
            ConfiguringResources => &[ReviewingPreview, DestinationSelected, Cancelled],
            ReviewingPreview => &[MergeInProgress, ConfiguringResources, Cancelled],
            MergeInProgress => &[Completed, Error, Cancelled],
            Completed => &[NotStarted],
            Error => &[NotStarted, Cancelled],
            Cancelled => &[NotStarted],
        }
    }

    pub fn can_transition_to(&self, to: WorkflowStatus) -> bool {
        self.allowed_transitions().contains(&to)
    }

    /// Terminal until the workflow is manually reset
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkflowStatus::Completed | WorkflowStatus::Error)
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkflowStatus {
    type Err = MergeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        WorkflowStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| MergeError::InvalidInput(format!("Unknown workflow status: {s}")))
    }
}

/// Summary of a remote app
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AppInfo {
    pub id: AppId,
    pub name: String,
    pub organization_id: Option<u64>,
    pub region: Option<String>,
}

/// A resource selection: every resource of the type, or an ordered list of ids
///
/// Serialized as the string `"all"` or as an array of ids.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "SelectionRepr", into = "SelectionRepr")]
pub enum ResourceSelection {
    All,
    Items(Vec<u64>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum SelectionRepr {
    Keyword(String),
    Items(Vec<u64>),
}

impl TryFrom<SelectionRepr> for ResourceSelection {
    type Error = String;

    fn try_from(repr: SelectionRepr) -> Result<Self, Self::Error> {
        match repr {
            SelectionRepr::Keyword(keyword) if keyword == "all" => Ok(ResourceSelection::All),
            SelectionRepr::Keyword(other) => Err(format!(
                "expected \"all\" or a list of ids, found \"{other}\""
            )),
            SelectionRepr::Items(ids) => Ok(ResourceSelection::Items(ids)),
        }
    }
}

impl From<ResourceSelection> for SelectionRepr {
    fn from(selection: ResourceSelection) -> Self {
        match selection {
            ResourceSelection::All => SelectionRepr::Keyword("all".to_string()),
            ResourceSelection::Items(ids) => SelectionRepr::Items(ids),
        }
    }
}

impl Default for ResourceSelection {
    fn default() -> Self {
        ResourceSelection::Items(Vec::new())
    }
}

impl ResourceSelection {
    pub fn is_empty(&self) -> bool {
        match self {
            ResourceSelection::All => false,
            ResourceSelection::Items(ids) => ids.is_empty(),
        }
    }

    /// Number of selected ids, `None` when everything is selected
    pub fn count(&self) -> Option<usize> {
        match self {
            ResourceSelection::All => None,
            ResourceSelection::Items(ids) => Some(ids.len()),
        }
    }
}

impl From<Vec<u64>> for ResourceSelection {
    fn from(ids: Vec<u64>) -> Self {
        ResourceSelection::Items(ids)
    }
}

/// App-wide settings that can be copied alongside the selected resources
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AppLevelSettings {
    pub app_settings: bool,
    pub menu: bool,
    pub appearance: bool,
    pub global_code: bool,
}

impl AppLevelSettings {
    pub fn any(&self) -> bool {
        self.app_settings || self.menu || self.appearance || self.global_code
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MergeConfiguration {
    pub source_app: Option<AppInfo>,
    pub destination_app: Option<AppInfo>,
    pub selected_pages: ResourceSelection,
    pub selected_data_sources: ResourceSelection,
    pub selected_files: ResourceSelection,
    pub selected_folders: ResourceSelection,
    pub app_level_settings: AppLevelSettings,
    pub custom_data_sources_in_use: Vec<u64>,
}

/// Local view of the remote reservation on both apps
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LockStatus {
    pub source_app_id: AppId,
    pub destination_app_id: AppId,
    pub source_app_locked_until: Option<DateTime<Utc>>,
    pub destination_app_locked_until: Option<DateTime<Utc>>,
    pub lock_owner: Option<String>,
    pub duration_seconds: u64,
    pub auto_extend: bool,
    pub acquired_at: Option<DateTime<Utc>>,
}

impl LockStatus {
    pub fn involves(&self, app_id: AppId) -> bool {
        self.source_app_id == app_id || self.destination_app_id == app_id
    }

    /// Locked-until timestamp recorded for one side of the reservation
    pub fn locked_until_for(&self, app_id: AppId) -> Option<DateTime<Utc>> {
        if app_id == self.source_app_id {
            self.source_app_locked_until
        } else if app_id == self.destination_app_id {
            self.destination_app_locked_until
        } else {
            None
        }
    }
}

/// One line of the server-side merge log
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LogEntry {
    pub timestamp: Option<DateTime<Utc>>,
    pub level: String,
    pub message: String,
    pub stage: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MergeStatus {
    pub merge_id: Option<MergeId>,
    pub status: WorkflowStatus,
    /// Last status string reported by the server (`in_progress`, `completed`, ...)
    pub remote_status: Option<String>,
    pub current_stage: Option<String>,
    pub progress: u8,
    pub started_at: Option<DateTime<Utc>>,
    pub last_updated: Option<DateTime<Utc>>,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub logs: Vec<LogEntry>,
}

/// A name shared by more than one resource of the same kind
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DuplicateName {
    pub kind: String,
    pub name: String,
    pub ids: Vec<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ValidationState {
    pub source_app_duplicates: Vec<DuplicateName>,
    pub destination_app_duplicates: Vec<DuplicateName>,
    pub has_errors: bool,
    pub errors: Vec<ValidationError>,
}

/// Steps of the configuration workflow, in order
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConfigurationStep {
    #[default]
    DestinationSelection,
    ResourceConfiguration,
    Review,
}

impl ConfigurationStep {
    pub const ALL: [ConfigurationStep; 3] = [
        ConfigurationStep::DestinationSelection,
        ConfigurationStep::ResourceConfiguration,
        ConfigurationStep::Review,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ConfigurationStep::DestinationSelection => "destination-selection",
            ConfigurationStep::ResourceConfiguration => "resource-configuration",
            ConfigurationStep::Review => "review",
        }
    }

    pub fn index(&self) -> usize {
        match self {
            ConfigurationStep::DestinationSelection => 0,
            ConfigurationStep::ResourceConfiguration => 1,
            ConfigurationStep::Review => 2,
        }
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    pub fn next(&self) -> Option<Self> {
        Self::from_index(self.index() + 1)
    }

    pub fn previous(&self) -> Option<Self> {
        self.index().checked_sub(1).and_then(Self::from_index)
    }
}

impl fmt::Display for ConfigurationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConfigurationStep {
    type Err = MergeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ConfigurationStep::ALL
            .into_iter()
            .find(|step| step.as_str() == s)
            .ok_or_else(|| MergeError::UnknownStep(s.to_string()))
    }
}

/// The configuration orchestrator's record of an in-flight configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigurationRecord {
    pub source_app_id: AppId,
    #[serde(default)]
    pub destination_app_id: Option<AppId>,
    #[serde(default)]
    pub destination_organization_id: Option<u64>,
    #[serde(default)]
    pub selected_pages: ResourceSelection,
    #[serde(default)]
    pub selected_data_sources: ResourceSelection,
    #[serde(default)]
    pub selected_files: ResourceSelection,
    #[serde(default)]
    pub selected_folders: ResourceSelection,
    #[serde(default)]
    pub app_level_settings: AppLevelSettings,
    pub current_step: ConfigurationStep,
    pub step_index: usize,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_complete: bool,
}

impl ConfigurationRecord {
    pub fn new(source_app_id: AppId) -> Self {
        Self {
            source_app_id,
            destination_app_id: None,
            destination_organization_id: None,
            selected_pages: ResourceSelection::default(),
            selected_data_sources: ResourceSelection::default(),
            selected_files: ResourceSelection::default(),
            selected_folders: ResourceSelection::default(),
            app_level_settings: AppLevelSettings::default(),
            current_step: ConfigurationStep::DestinationSelection,
            step_index: 0,
            started_at: Utc::now(),
            updated_at: None,
            completed_at: None,
            is_complete: false,
        }
    }

    pub fn has_any_resource(&self) -> bool {
        [
            &self.selected_pages,
            &self.selected_data_sources,
            &self.selected_files,
            &self.selected_folders,
        ]
        .iter()
        .any(|selection| !selection.is_empty())
    }
}

/// Root of all workflow state
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WorkflowState {
    pub merge_configuration: MergeConfiguration,
    pub lock_status: Option<LockStatus>,
    pub merge_status: MergeStatus,
    pub validation_state: ValidationState,
    pub configuration: Option<ConfigurationRecord>,
    /// Scratch space for consumers; never interpreted here
    pub cache: Map<String, Value>,
}
