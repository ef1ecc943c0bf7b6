//! AppMerge orchestration core
//!
//! Drives the "merge one app into another" workflow against the remote merge
//! API: the workflow state machine, the app lock lifecycle, step-by-step
//! configuration and execution monitoring.
//!
//! ## Components
//!
//! - [`bus::EventBus`]: synchronous publish/subscribe for [`MergeEvent`]s
//! - [`store::StateStore`]: the single workflow state tree
//! - [`lock::LockManager`]: acquire, extend, release and watch app locks
//! - [`configuration::ConfigurationOrchestrator`]: the three configuration steps
//! - [`execution::ExecutionMonitor`]: start the merge job and poll it
//! - [`client::MergeClient`]: all of the above wired together
//!
//! ## Example
//!
//! ```rust,no_run
//! use appmerge_core::{EventKind, MergeClient, SettingsLoader};
//!
//! # async fn run() -> appmerge_core::MergeResult<()> {
//! let settings = SettingsLoader::new().load()?;
//! let client = MergeClient::new(settings)?;
//!
//! client.bus().on(EventKind::MergeProgress, |event| {
//!     println!("{event:?}");
//! });
//!
//! let options = client.settings().lock_options();
//! client.locks().lock_apps(1, 2, options).await?;
//! # Ok(())
//! # }
//! ```

pub mod bus;
pub mod client;
pub mod configuration;
pub mod error;
pub mod execution;
pub mod gateway;
pub mod lock;
pub mod mocks;
pub mod models;
pub mod settings;
pub mod store;
pub mod tasks;
pub mod validation;

pub use bus::{EventBus, EventKind, MergeEvent, SubscriptionId};
pub use client::MergeClient;
pub use configuration::{
    CancelOptions, ConfigurationOrchestrator, ConfigurationSnapshot, ConfigurationSummary,
    ConfigurationUpdate, ProceedOptions, ResourceSummary, SelectionCount, StartOptions,
};
pub use error::{MergeError, MergeResult};
pub use execution::{ExecutionMonitor, InitiateOptions};
pub use gateway::{
    AppOverview, AppPermissions, LockResponse, LogQuery, MergeGateway, MergeRequest,
    MergeStartResponse, MergeStatusResponse, NamedResource,
};
pub use lock::{ExtendOptions, LockCheck, LockManager, LockOptions, MonitorOptions};
pub use models::{
    AppId, AppInfo, AppLevelSettings, ConfigurationRecord, ConfigurationStep, DuplicateName,
    LockStatus, LogEntry, MergeConfiguration, MergeId, MergeStatus, ResourceSelection,
    ValidationState, WorkflowState, WorkflowStatus,
};
pub use settings::{MergeSettings, SettingsLoader};
pub use store::StateStore;
pub use tasks::{TaskRegistry, TaskTicket};
pub use validation::{ValidationError, ValidationResult};
