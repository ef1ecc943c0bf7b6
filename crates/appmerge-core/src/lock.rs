//! Lock lifecycle manager
//!
//! Reserves a source/destination app pair on the server, mirrors the
//! reservation into `lockStatus`, and optionally watches it for expiry. The
//! server is authoritative: the local record is only a cache, and a
//! locked-until timestamp at or before now always reads as unlocked.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::bus::{EventBus, MergeEvent};
use crate::error::{MergeError, MergeResult};
use crate::gateway::MergeGateway;
use crate::models::{require_id, AppId, LockStatus};
use crate::store::StateStore;
use crate::tasks::{TaskRegistry, TaskTicket};

/// Options for [`LockManager::lock_apps`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockOptions {
    pub duration: Duration,
    /// Start an expiry monitor that extends the lock when it runs low
    pub auto_extend: bool,
    pub warning_threshold: Duration,
    pub check_interval: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            duration: Duration::from_secs(600),
            auto_extend: false,
            warning_threshold: Duration::from_secs(60),
            check_interval: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtendOptions {
    pub additional_duration: Duration,
}

impl Default for ExtendOptions {
    fn default() -> Self {
        Self {
            additional_duration: Duration::from_secs(300),
        }
    }
}

/// Options for [`LockManager::monitor_lock_expiration`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorOptions {
    /// Other side of the reservation; taken from `lockStatus` when unset
    pub destination_app_id: Option<AppId>,
    pub warning_threshold: Duration,
    pub auto_extend: bool,
    pub check_interval: Duration,
    /// How much an automatic extension asks for
    pub extend_by: Duration,
}

impl Default for MonitorOptions {
    fn default() -> Self {
        Self {
            destination_app_id: None,
            warning_threshold: Duration::from_secs(60),
            auto_extend: false,
            check_interval: Duration::from_secs(10),
            extend_by: ExtendOptions::default().additional_duration,
        }
    }
}

/// Result of a local lock check
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LockCheck {
    pub is_locked: bool,
    pub lock_status: Option<LockStatus>,
    pub remaining_seconds: u64,
}

/// Acquires, extends, releases and watches app locks
#[derive(Clone)]
pub struct LockManager {
    gateway: MergeGateway,
    store: Arc<StateStore>,
    bus: EventBus,
    monitors: TaskRegistry<AppId>,
}

impl LockManager {
    pub fn new(gateway: MergeGateway, store: Arc<StateStore>, bus: EventBus) -> Self {
        Self {
            gateway,
            store,
            bus,
            monitors: TaskRegistry::new("lock-monitors"),
        }
    }

    /// Reserve both apps for `options.duration`
    pub async fn lock_apps(
        &self,
        source: AppId,
        destination: AppId,
        options: LockOptions,
    ) -> MergeResult<LockStatus> {
        require_id("Source app id", source)?;
        require_id("Destination app id", destination)?;
        if options.duration.is_zero() {
            return Err(MergeError::InvalidInput(
                "Lock duration must be greater than zero".to_string(),
            ));
        }
        let span = lock_span("Lock duration", options.duration)?;

        let response = match self
            .gateway
            .lock(source, destination, options.duration.as_secs())
            .await
        {
            Ok(response) => response,
            Err(e) => {
                error!(source, destination, "Failed to lock apps: {e}");
                self.bus.emit(MergeEvent::LockFailed {
                    source_id: source,
                    destination_id: destination,
                    error: e.to_string(),
                });
                return Err(e.into());
            }
        };

        let now = Utc::now();
        let locked_until = response
            .locked_until
            .unwrap_or_else(|| offset(now, span));
        let status = LockStatus {
            source_app_id: source,
            destination_app_id: destination,
            source_app_locked_until: Some(locked_until),
            destination_app_locked_until: Some(locked_until),
            lock_owner: response.locked_by,
            duration_seconds: options.duration.as_secs(),
            auto_extend: options.auto_extend,
            acquired_at: Some(now),
        };

        let record = status.clone();
        self.store
            .update("lockStatus", move |state| state.lock_status = Some(record))?;

        info!(source, destination, %locked_until, "Apps locked");
        self.bus.emit(MergeEvent::LockAcquired {
            source_id: source,
            destination_id: destination,
            locked_until,
        });

        if options.auto_extend {
            self.monitor_lock_expiration(
                source,
                MonitorOptions {
                    destination_app_id: Some(destination),
                    warning_threshold: options.warning_threshold,
                    auto_extend: true,
                    check_interval: options.check_interval,
                    ..MonitorOptions::default()
                },
            )?;
        }

        Ok(status)
    }

    /// Release both apps; the expiry monitor for `source` stops first
    ///
    /// On failure the local lock record is kept.
    pub async fn unlock_apps(&self, source: AppId, destination: AppId) -> MergeResult<()> {
        require_id("Source app id", source)?;
        require_id("Destination app id", destination)?;

        self.stop_monitoring(source);

        if let Err(e) = self.gateway.unlock(source, destination).await {
            error!(source, destination, "Failed to unlock apps: {e}");
            self.bus.emit(MergeEvent::LockReleaseFailed {
                source_id: source,
                destination_id: destination,
                error: e.to_string(),
            });
            return Err(e.into());
        }

        self.store
            .update("lockStatus", |state| state.lock_status = None)?;

        info!(source, destination, "Apps unlocked");
        self.bus.emit(MergeEvent::LockReleased {
            source_id: source,
            destination_id: destination,
        });
        Ok(())
    }

    /// Push the expiry out; returns the new locked-until
    pub async fn extend_lock(
        &self,
        source: AppId,
        destination: AppId,
        options: ExtendOptions,
    ) -> MergeResult<DateTime<Utc>> {
        require_id("Source app id", source)?;
        require_id("Destination app id", destination)?;
        let span = lock_span("Lock extension", options.additional_duration)?;

        let response = match self
            .gateway
            .extend_lock(source, destination, options.additional_duration.as_secs())
            .await
        {
            Ok(response) => response,
            Err(e) => {
                error!(source, destination, "Failed to extend lock: {e}");
                self.bus.emit(MergeEvent::LockExtendFailed {
                    source_id: source,
                    destination_id: destination,
                    error: e.to_string(),
                });
                return Err(e.into());
            }
        };

        let locked_until = match response.locked_until {
            Some(locked_until) => locked_until,
            None => {
                let base = self
                    .store
                    .lock_status()
                    .filter(|lock| lock.source_app_id == source)
                    .and_then(|lock| lock.locked_until_for(source))
                    .filter(|until| *until > Utc::now())
                    .unwrap_or_else(Utc::now);
                offset(base, span)
            }
        };

        self.store.update("lockStatus", move |state| {
            if state
                .lock_status
                .as_ref()
                .is_some_and(|lock| lock.source_app_id != source)
            {
                state.lock_status = None;
            }
            let lock = state.lock_status.get_or_insert_with(|| LockStatus {
                source_app_id: source,
                destination_app_id: destination,
                duration_seconds: options.additional_duration.as_secs(),
                acquired_at: Some(Utc::now()),
                ..LockStatus::default()
            });
            lock.destination_app_id = destination;
            lock.source_app_locked_until = Some(locked_until);
            lock.destination_app_locked_until = Some(locked_until);
        })?;

        info!(source, destination, %locked_until, "Lock extended");
        self.bus.emit(MergeEvent::LockExtended {
            source_id: source,
            destination_id: destination,
            locked_until,
        });
        Ok(locked_until)
    }

    pub fn check_lock_status(&self, app_id: AppId) -> LockCheck {
        self.check_lock_status_at(app_id, Utc::now())
    }

    /// Lock check against an explicit clock reading
    pub fn check_lock_status_at(&self, app_id: AppId, now: DateTime<Utc>) -> LockCheck {
        let lock_status = self.store.lock_status();
        let locked_until = lock_status
            .as_ref()
            .and_then(|lock| lock.locked_until_for(app_id));

        let remaining_seconds = match locked_until {
            Some(until) if until > now => {
                let millis = (until - now).num_milliseconds().max(0) as u64;
                millis.div_ceil(1000).max(1)
            }
            _ => 0,
        };

        LockCheck {
            is_locked: remaining_seconds > 0,
            lock_status,
            remaining_seconds,
        }
    }

    /// Watch the lock on `app_id`, replacing any monitor already running for it
    pub fn monitor_lock_expiration(&self, app_id: AppId, options: MonitorOptions) -> MergeResult<()> {
        require_id("App id", app_id)?;
        if options.check_interval.is_zero() {
            return Err(MergeError::InvalidInput(
                "Lock check interval must be greater than zero".to_string(),
            ));
        }

        let manager = self.clone();
        self.monitors.spawn(app_id, move |ticket| async move {
            manager.run_monitor(ticket, options).await;
        });
        debug!(app_id, interval = ?options.check_interval, "Lock monitor started");
        Ok(())
    }

    async fn run_monitor(&self, ticket: TaskTicket<AppId>, options: MonitorOptions) {
        let app_id = *ticket.key();
        let period = options.check_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            let check = self.check_lock_status(app_id);
            if !check.is_locked {
                ticket.finish();
                warn!(app_id, "Lock expired");
                self.bus.emit(MergeEvent::LockExpired { app_id });
                return;
            }

            if check.remaining_seconds <= options.warning_threshold.as_secs() {
                self.warn_expiring(app_id, &check, &options).await;
            }
        }
    }

    async fn warn_expiring(&self, app_id: AppId, check: &LockCheck, options: &MonitorOptions) {
        warn!(app_id, remaining = check.remaining_seconds, "Lock expiring soon");
        self.bus.emit(MergeEvent::LockExpiring {
            app_id,
            remaining_seconds: check.remaining_seconds,
        });

        if !options.auto_extend {
            return;
        }
        let destination = options.destination_app_id.or_else(|| {
            check
                .lock_status
                .as_ref()
                .filter(|lock| lock.source_app_id == app_id)
                .map(|lock| lock.destination_app_id)
        });
        let Some(destination) = destination.filter(|id| *id != 0) else {
            debug!(app_id, "No destination known, skipping auto-extend");
            return;
        };

        let extend = ExtendOptions {
            additional_duration: options.extend_by,
        };
        if let Err(e) = self.extend_lock(app_id, destination, extend).await {
            self.bus.emit(MergeEvent::LockAutoExtendFailed {
                app_id,
                destination_id: destination,
                error: e.to_string(),
            });
        }
    }

    /// Stop the monitor for `app_id`; returns whether one was running
    pub fn stop_monitoring(&self, app_id: AppId) -> bool {
        self.monitors.stop(&app_id)
    }

    pub fn is_monitoring(&self, app_id: AppId) -> bool {
        self.monitors.is_active(&app_id)
    }

    pub fn active_monitors(&self) -> usize {
        self.monitors.len()
    }

    /// Stop every monitor
    pub fn cleanup(&self) {
        let stopped = self.monitors.stop_all();
        debug!(stopped, "Lock monitors cleaned up");
    }
}

/// Longest lock the server is asked for
pub const MAX_LOCK_DURATION: Duration = Duration::from_secs(10 * 365 * 24 * 60 * 60);

/// Converts a requested duration, refusing anything the clock arithmetic
/// could not represent
fn lock_span(what: &str, duration: Duration) -> MergeResult<chrono::Duration> {
    if duration > MAX_LOCK_DURATION {
        return Err(MergeError::InvalidInput(format!(
            "{what} must not exceed {} seconds",
            MAX_LOCK_DURATION.as_secs()
        )));
    }
    chrono::Duration::from_std(duration)
        .map_err(|e| MergeError::InvalidInput(format!("{what} is out of range: {e}")))
}

fn offset(base: DateTime<Utc>, span: chrono::Duration) -> DateTime<Utc> {
    base.checked_add_signed(span)
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventKind;
    use crate::mocks::{EventRecorder, MockTransport};
    use appmerge_http::Method;
    use serde_json::json;

    const LOCK_PATH: &str = "v1/apps/1/merge/lock";

    fn manager(transport: Arc<MockTransport>) -> (LockManager, Arc<StateStore>, EventRecorder) {
        let bus = EventBus::new();
        let store = Arc::new(StateStore::new(bus.clone()));
        let recorder = EventRecorder::attach(&bus);
        let manager = LockManager::new(MergeGateway::new(transport), Arc::clone(&store), bus);
        (manager, store, recorder)
    }

    fn locked_until(store: &StateStore, until: DateTime<Utc>) {
        store
            .update("lockStatus", move |state| {
                state.lock_status = Some(LockStatus {
                    source_app_id: 1,
                    destination_app_id: 2,
                    source_app_locked_until: Some(until),
                    destination_app_locked_until: Some(until),
                    ..LockStatus::default()
                })
            })
            .unwrap();
    }

    #[tokio::test]
    async fn test_missing_ids_fail_before_any_request() {
        let transport = Arc::new(MockTransport::new());
        let (manager, _, _) = manager(transport.clone());

        let err = manager
            .lock_apps(0, 2, LockOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, MergeError::InvalidInput(_)));
        assert!(manager.unlock_apps(1, 0).await.is_err());
        assert!(transport.requests().is_empty());
    }

    #[tokio::test]
    async fn test_lock_without_server_expiry_uses_duration() {
        let transport = Arc::new(MockTransport::new());
        transport.reply(Method::POST, LOCK_PATH, json!({}));
        let (manager, store, recorder) = manager(transport);

        let before = Utc::now();
        let status = manager
            .lock_apps(1, 2, LockOptions::default())
            .await
            .unwrap();

        let until = status.source_app_locked_until.unwrap();
        assert!(until >= before + chrono::Duration::seconds(600));
        assert_eq!(store.lock_status(), Some(status));
        assert_eq!(recorder.count(EventKind::LockAcquired), 1);
        assert!(!manager.is_monitoring(1));
    }

    #[tokio::test]
    async fn test_failed_unlock_keeps_lock_record() {
        let transport = Arc::new(MockTransport::new());
        transport.fail(Method::DELETE, LOCK_PATH, 500, json!({ "message": "boom" }));
        let (manager, store, recorder) = manager(transport);
        locked_until(&store, Utc::now() + chrono::Duration::seconds(120));

        assert!(manager.unlock_apps(1, 2).await.is_err());

        assert!(store.lock_status().is_some());
        assert_eq!(recorder.count(EventKind::LockReleaseFailed), 1);
        assert_eq!(recorder.count(EventKind::LockReleased), 0);
    }

    #[tokio::test]
    async fn test_extend_preserves_other_fields() {
        let transport = Arc::new(MockTransport::new());
        transport.reply(
            Method::PUT,
            LOCK_PATH,
            json!({ "lockedUntil": "2040-01-01T00:00:00Z" }),
        );
        let (manager, store, recorder) = manager(transport);
        store
            .update("lockStatus", |state| {
                state.lock_status = Some(LockStatus {
                    source_app_id: 1,
                    destination_app_id: 2,
                    lock_owner: Some("ana".to_string()),
                    duration_seconds: 600,
                    ..LockStatus::default()
                })
            })
            .unwrap();

        let until = manager
            .extend_lock(1, 2, ExtendOptions::default())
            .await
            .unwrap();

        let lock = store.lock_status().unwrap();
        assert_eq!(lock.source_app_locked_until, Some(until));
        assert_eq!(lock.destination_app_locked_until, Some(until));
        assert_eq!(lock.lock_owner.as_deref(), Some("ana"));
        assert_eq!(lock.duration_seconds, 600);
        assert_eq!(recorder.count(EventKind::LockExtended), 1);
    }

    #[tokio::test]
    async fn test_oversized_durations_are_rejected_before_any_request() {
        let transport = Arc::new(MockTransport::new());
        transport.reply(Method::POST, LOCK_PATH, json!({}));
        let (manager, store, recorder) = manager(transport.clone());

        for duration in [Duration::from_secs(u64::MAX), MAX_LOCK_DURATION + Duration::from_secs(1)] {
            let err = manager
                .lock_apps(
                    1,
                    2,
                    LockOptions {
                        duration,
                        ..LockOptions::default()
                    },
                )
                .await
                .unwrap_err();
            assert!(matches!(err, MergeError::InvalidInput(_)));
        }
        let err = manager
            .extend_lock(
                1,
                2,
                ExtendOptions {
                    additional_duration: Duration::from_secs(u64::MAX),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, MergeError::InvalidInput(_)));

        assert!(transport.requests().is_empty());
        assert!(store.lock_status().is_none());
        assert!(recorder.events().is_empty());
    }

    #[tokio::test]
    async fn test_longest_lock_reads_as_locked() {
        let transport = Arc::new(MockTransport::new());
        transport.reply(Method::POST, LOCK_PATH, json!({}));
        let (manager, _, _) = manager(transport);

        manager
            .lock_apps(
                1,
                2,
                LockOptions {
                    duration: MAX_LOCK_DURATION,
                    ..LockOptions::default()
                },
            )
            .await
            .unwrap();

        let check = manager.check_lock_status(1);
        assert!(check.is_locked);
        assert!(check.remaining_seconds > MAX_LOCK_DURATION.as_secs() - 60);
    }

    #[tokio::test]
    async fn test_failed_extend_is_broadcast_and_returned() {
        let transport = Arc::new(MockTransport::new());
        transport.fail(Method::PUT, LOCK_PATH, 409, json!({ "message": "not owner" }));
        let (manager, store, recorder) = manager(transport);
        let until = Utc::now() + chrono::Duration::seconds(120);
        locked_until(&store, until);

        let err = manager
            .extend_lock(1, 2, ExtendOptions::default())
            .await
            .unwrap_err();

        assert!(err.to_string().contains("not owner"));
        assert_eq!(recorder.count(EventKind::LockExtendFailed), 1);
        assert_eq!(recorder.count(EventKind::LockExtended), 0);
        assert_eq!(
            store.lock_status().unwrap().source_app_locked_until,
            Some(until)
        );
    }

    #[tokio::test]
    async fn test_extend_for_another_pair_replaces_the_record() {
        let transport = Arc::new(MockTransport::new());
        transport.reply(Method::PUT, "v1/apps/5/merge/lock", json!({}));
        let (manager, store, _) = manager(transport);
        let other_until = Utc::now() + chrono::Duration::seconds(3000);
        locked_until(&store, other_until);

        let until = manager
            .extend_lock(
                5,
                6,
                ExtendOptions {
                    additional_duration: Duration::from_secs(60),
                },
            )
            .await
            .unwrap();

        let lock = store.lock_status().unwrap();
        assert_eq!(lock.source_app_id, 5);
        assert_eq!(lock.destination_app_id, 6);
        assert_eq!(lock.source_app_locked_until, Some(until));
        assert!(until < other_until);
    }

    #[test]
    fn test_check_lock_status_boundaries() {
        let (manager, store, _) = manager(Arc::new(MockTransport::new()));
        let now = Utc::now();

        assert!(!manager.check_lock_status_at(1, now).is_locked);

        locked_until(&store, now);
        let check = manager.check_lock_status_at(1, now);
        assert!(!check.is_locked);
        assert_eq!(check.remaining_seconds, 0);
        assert!(check.lock_status.is_some());

        let check = manager.check_lock_status_at(1, now - chrono::Duration::milliseconds(1));
        assert!(check.is_locked);
        assert_eq!(check.remaining_seconds, 1);

        let check = manager.check_lock_status_at(2, now - chrono::Duration::milliseconds(1500));
        assert_eq!(check.remaining_seconds, 2);

        assert!(!manager.check_lock_status_at(3, now - chrono::Duration::seconds(10)).is_locked);
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_reports_expiry_and_stops() {
        let (manager, store, recorder) = manager(Arc::new(MockTransport::new()));
        locked_until(&store, Utc::now() - chrono::Duration::seconds(1));

        manager
            .monitor_lock_expiration(1, MonitorOptions::default())
            .unwrap();
        assert!(manager.is_monitoring(1));

        tokio::time::sleep(Duration::from_secs(11)).await;

        assert_eq!(recorder.count(EventKind::LockExpired), 1);
        assert!(!manager.is_monitoring(1));
        assert!(!manager.stop_monitoring(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_auto_extend_failure_keeps_monitoring() {
        let transport = Arc::new(MockTransport::new());
        transport.fail(Method::PUT, LOCK_PATH, 409, json!({ "message": "not owner" }));
        let (manager, store, recorder) = manager(transport.clone());
        locked_until(&store, Utc::now() + chrono::Duration::seconds(30));

        manager
            .monitor_lock_expiration(
                1,
                MonitorOptions {
                    auto_extend: true,
                    ..MonitorOptions::default()
                },
            )
            .unwrap();

        tokio::time::sleep(Duration::from_secs(21)).await;

        assert_eq!(recorder.count(EventKind::LockExpiring), 2);
        assert_eq!(recorder.count(EventKind::LockAutoExtendFailed), 2);
        assert_eq!(transport.calls_to(Method::PUT, LOCK_PATH), 2);
        assert!(manager.is_monitoring(1));

        manager.cleanup();
        assert_eq!(manager.active_monitors(), 0);
    }

    #[test]
    fn test_zero_interval_is_rejected() {
        let (manager, _, _) = manager(Arc::new(MockTransport::new()));
        let err = manager
            .monitor_lock_expiration(
                1,
                MonitorOptions {
                    check_interval: Duration::ZERO,
                    ..MonitorOptions::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, MergeError::InvalidInput(_)));
    }
}
