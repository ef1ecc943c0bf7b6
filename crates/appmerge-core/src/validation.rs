//! Validation engine
//!
//! Pure, synchronous checks over configuration snapshots. Every check
//! collects all of its violations before reporting so callers see the
//! complete list rather than the first failure.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::gateway::{AppOverview, NamedResource};
use crate::models::{ConfigurationRecord, ConfigurationStep, DuplicateName};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
}

impl ValidationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            field: None,
        }
    }

    pub fn for_field(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            field: Some(field.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationResult {
    pub is_valid: bool,
    pub errors: Vec<ValidationError>,
}

impl ValidationResult {
    pub fn from_errors(errors: Vec<ValidationError>) -> Self {
        Self {
            is_valid: errors.is_empty(),
            errors,
        }
    }

    pub fn valid() -> Self {
        Self::from_errors(Vec::new())
    }

    /// Union of two results
    pub fn merge(mut self, other: ValidationResult) -> Self {
        self.errors.extend(other.errors);
        Self::from_errors(self.errors)
    }

    /// All messages joined into one line
    pub fn aggregate_message(&self) -> String {
        self.errors
            .iter()
            .map(|e| e.message.as_str())
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// A destination must be chosen and must differ from the source
pub fn validate_destination_selection(record: &ConfigurationRecord) -> ValidationResult {
    let mut errors = Vec::new();

    match record.destination_app_id {
        None | Some(0) => errors.push(ValidationError::for_field(
            "destinationAppId",
            "Please select a destination app",
        )),
        Some(id) if id == record.source_app_id => errors.push(ValidationError::for_field(
            "destinationAppId",
            "The destination app must be different from the source app",
        )),
        Some(_) => {}
    }

    if matches!(record.destination_organization_id, None | Some(0)) {
        errors.push(ValidationError::for_field(
            "destinationOrganizationId",
            "Please select a destination organization",
        ));
    }

    ValidationResult::from_errors(errors)
}

/// Something must be merged: a resource or an app-level setting
pub fn validate_resource_configuration(record: &ConfigurationRecord) -> ValidationResult {
    if record.has_any_resource() || record.app_level_settings.any() {
        ValidationResult::valid()
    } else {
        ValidationResult::from_errors(vec![ValidationError::new(
            "Select at least one page, data source, file, folder or app-level setting to merge",
        )])
    }
}

pub fn validate_review(record: &ConfigurationRecord) -> ValidationResult {
    validate_destination_selection(record).merge(validate_resource_configuration(record))
}

pub fn validate_step(step: ConfigurationStep, record: &ConfigurationRecord) -> ValidationResult {
    match step {
        ConfigurationStep::DestinationSelection => validate_destination_selection(record),
        ConfigurationStep::ResourceConfiguration => validate_resource_configuration(record),
        ConfigurationStep::Review => validate_review(record),
    }
}

/// Which source-app checks to run
///
/// Lock state is not among them: the local lock record only mirrors this
/// client's own reservation, and the lock endpoint itself refuses a pair
/// held elsewhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceChecks {
    pub duplicates: bool,
    pub permissions: bool,
}

impl Default for SourceChecks {
    fn default() -> Self {
        Self {
            duplicates: true,
            permissions: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SourceValidation {
    pub result: ValidationResult,
    pub duplicates: Vec<DuplicateName>,
}

pub fn validate_source_app(
    overview: &AppOverview,
    checks: SourceChecks,
) -> SourceValidation {
    let mut errors = Vec::new();
    let mut duplicates = Vec::new();

    if checks.duplicates {
        duplicates.extend(find_duplicates("page", &overview.pages));
        duplicates.extend(find_duplicates("dataSource", &overview.data_sources));

        for duplicate in &duplicates {
            let label = if duplicate.kind == "page" {
                "screen"
            } else {
                "data source"
            };
            errors.push(ValidationError::new(format!(
                "More than one {label} is named \"{}\"; rename them before merging",
                duplicate.name
            )));
        }
    }

    if checks.permissions && !overview.permissions.can_edit {
        errors.push(ValidationError::new(format!(
            "You need edit permission on \"{}\" to merge it",
            overview.name
        )));
    }

    SourceValidation {
        result: ValidationResult::from_errors(errors),
        duplicates,
    }
}

/// Resources whose names collide, compared case-insensitively, in first-seen order
pub fn find_duplicates(kind: &str, resources: &[NamedResource]) -> Vec<DuplicateName> {
    let mut groups: Vec<DuplicateName> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for resource in resources {
        let key = resource.name.trim().to_lowercase();
        if key.is_empty() {
            continue;
        }
        match index.get(&key) {
            Some(&position) => groups[position].ids.push(resource.id),
            None => {
                index.insert(key, groups.len());
                groups.push(DuplicateName {
                    kind: kind.to_string(),
                    name: resource.name.trim().to_string(),
                    ids: vec![resource.id],
                });
            }
        }
    }

    groups.retain(|group| group.ids.len() > 1);
    groups
}
