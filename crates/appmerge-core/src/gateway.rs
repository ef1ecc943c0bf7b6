//! Remote resource gateway
//!
//! Typed wrappers over the merge endpoints. Every call goes through the
//! shared [`Transport`], so retries and timeouts are configured once.

use std::sync::Arc;

use appmerge_http::{ApiRequest, HttpError, Transport};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use crate::models::{AppId, AppLevelSettings, LogEntry, MergeId, ResourceSelection};

/// Reply to a lock or extend call
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LockResponse {
    pub locked_until: Option<DateTime<Utc>>,
    pub locked_by: Option<String>,
}

/// Reply to a start-merge call
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MergeStartResponse {
    pub merge_id: MergeId,
    pub status: String,
    pub progress: f64,
}

impl MergeStartResponse {
    pub fn progress_percent(&self) -> u8 {
        clamp_percent(self.progress)
    }
}

/// Reply to a merge status poll
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MergeStatusResponse {
    pub status: String,
    pub progress: f64,
    pub current_stage: Option<String>,
    pub stage_complete: Option<Value>,
    pub result: Option<Value>,
    pub error: Option<Value>,
}

impl MergeStatusResponse {
    pub const TERMINAL: [&'static str; 3] = ["completed", "failed", "error"];

    pub fn is_terminal(&self) -> bool {
        Self::TERMINAL.contains(&self.status.as_str())
    }

    pub fn is_success(&self) -> bool {
        self.status == "completed"
    }

    /// Progress clamped to 0..=100
    pub fn progress_percent(&self) -> u8 {
        clamp_percent(self.progress)
    }

    /// Human-readable failure reason, falling back to the remote status
    pub fn error_message(&self) -> String {
        match &self.error {
            Some(Value::String(message)) => message.clone(),
            Some(Value::Object(fields)) => fields
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| Value::Object(fields.clone()).to_string()),
            Some(Value::Null) | None => format!("Merge ended with status {}", self.status),
            Some(other) => other.to_string(),
        }
    }
}

/// Body of the preview and start-merge calls
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MergeRequest {
    pub destination_app_id: AppId,
    pub destination_organization_id: Option<u64>,
    pub pages: ResourceSelection,
    pub data_sources: ResourceSelection,
    pub files: ResourceSelection,
    pub folders: ResourceSelection,
    pub app_level_settings: AppLevelSettings,
    pub custom_data_sources_in_use: Vec<u64>,
}

/// Anything listed by name in an app overview
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NamedResource {
    pub id: u64,
    #[serde(alias = "title")]
    pub name: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AppPermissions {
    pub can_edit: bool,
}

/// What the server reports about an app before a merge
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AppOverview {
    pub id: AppId,
    pub name: String,
    pub organization_id: Option<u64>,
    pub region: Option<String>,
    pub pages: Vec<NamedResource>,
    pub data_sources: Vec<NamedResource>,
    pub permissions: AppPermissions,
}

/// Paging and filtering for a log fetch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogQuery {
    pub limit: Option<u32>,
    pub offset: Option<u32>,
    pub level: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum LogsReply {
    Entries(Vec<LogEntry>),
    Wrapped { logs: Vec<LogEntry> },
}

/// Typed access to the merge endpoints
#[derive(Clone)]
pub struct MergeGateway {
    transport: Arc<dyn Transport>,
    /// Status polls only; the poller's next tick stands in for retries
    poll_transport: Arc<dyn Transport>,
}

impl MergeGateway {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            poll_transport: Arc::clone(&transport),
            transport,
        }
    }

    /// Send status polls through `transport` instead of the main one
    pub fn with_poll_transport(self, transport: Arc<dyn Transport>) -> Self {
        Self {
            poll_transport: transport,
            ..self
        }
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub async fn lock(
        &self,
        source: AppId,
        destination: AppId,
        duration_secs: u64,
    ) -> Result<LockResponse, HttpError> {
        let request = ApiRequest::post(lock_path(source))
            .with_payload(json!({ "targetAppId": destination, "duration": duration_secs }));
        self.call(request).await
    }

    pub async fn extend_lock(
        &self,
        source: AppId,
        destination: AppId,
        additional_secs: u64,
    ) -> Result<LockResponse, HttpError> {
        let request = ApiRequest::put(lock_path(source))
            .with_payload(json!({ "targetAppId": destination, "duration": additional_secs }));
        self.call(request).await
    }

    pub async fn unlock(&self, source: AppId, destination: AppId) -> Result<(), HttpError> {
        let request = ApiRequest::delete(lock_path(source))
            .with_payload(json!({ "targetAppId": destination }));
        self.transport.send(request).await.map(|_| ())
    }

    pub async fn app_overview(&self, app_id: AppId) -> Result<AppOverview, HttpError> {
        self.call(ApiRequest::get(format!("v1/apps/{app_id}/merge/overview")))
            .await
    }

    /// Dry run; the server's diff is returned untouched
    pub async fn preview(&self, source: AppId, request: &MergeRequest) -> Result<Value, HttpError> {
        let request = ApiRequest::post(format!("v1/apps/{source}/merge/preview"))
            .with_payload(serde_json::to_value(request)?);
        self.transport.send(request).await
    }

    pub async fn initiate(
        &self,
        source: AppId,
        request: &MergeRequest,
    ) -> Result<MergeStartResponse, HttpError> {
        let request = ApiRequest::post(format!("v1/apps/{source}/merge"))
            .with_payload(serde_json::to_value(request)?);
        self.call(request).await
    }

    pub async fn status(
        &self,
        source: AppId,
        merge_id: MergeId,
    ) -> Result<MergeStatusResponse, HttpError> {
        let request = ApiRequest::get(format!("v1/apps/{source}/merge/{merge_id}"));
        decode(&self.poll_transport, request).await
    }

    /// Accepts either a bare array or `{ "logs": [...] }`
    pub async fn logs(
        &self,
        app_id: AppId,
        merge_id: MergeId,
        query: &LogQuery,
    ) -> Result<Vec<LogEntry>, HttpError> {
        let mut request = ApiRequest::get(format!("v1/apps/{app_id}/merge/{merge_id}/logs"));
        if let Some(limit) = query.limit {
            request = request.with_query("limit", limit);
        }
        if let Some(offset) = query.offset {
            request = request.with_query("offset", offset);
        }
        if let Some(level) = &query.level {
            request = request.with_query("level", level);
        }

        let reply: LogsReply = self.call(request).await?;
        Ok(match reply {
            LogsReply::Entries(entries) | LogsReply::Wrapped { logs: entries } => entries,
        })
    }

    async fn call<T>(&self, request: ApiRequest) -> Result<T, HttpError>
    where
        T: serde::de::DeserializeOwned,
    {
        decode(&self.transport, request).await
    }
}

async fn decode<T>(transport: &Arc<dyn Transport>, request: ApiRequest) -> Result<T, HttpError>
where
    T: serde::de::DeserializeOwned,
{
    debug!(method = %request.method, path = %request.path, "Calling merge endpoint");
    let body = transport.send(request).await?;
    Ok(serde_json::from_value(body)?)
}

fn clamp_percent(progress: f64) -> u8 {
    if progress.is_nan() {
        0
    } else {
        progress.round().clamp(0.0, 100.0) as u8
    }
}

fn lock_path(source: AppId) -> String {
    format!("v1/apps/{source}/merge/lock")
}
