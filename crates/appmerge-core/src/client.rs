//! One-stop merge client
//!
//! Wires a single bus, store and gateway into the three controllers so they
//! all observe and update the same workflow.

use std::sync::Arc;

use appmerge_http::{shared_client, Transport};

use crate::bus::EventBus;
use crate::configuration::ConfigurationOrchestrator;
use crate::error::MergeResult;
use crate::execution::ExecutionMonitor;
use crate::gateway::MergeGateway;
use crate::lock::LockManager;
use crate::settings::MergeSettings;
use crate::store::StateStore;

pub struct MergeClient {
    settings: MergeSettings,
    bus: EventBus,
    store: Arc<StateStore>,
    gateway: MergeGateway,
    locks: LockManager,
    configuration: ConfigurationOrchestrator,
    execution: ExecutionMonitor,
}

impl MergeClient {
    /// Build an HTTP-backed client; settings are validated first
    pub fn new(settings: MergeSettings) -> MergeResult<Self> {
        settings.validate()?;
        let gateway = MergeGateway::new(shared_client(settings.http_config())?)
            .with_poll_transport(shared_client(settings.polling_http_config())?);
        Ok(Self::with_gateway(settings, gateway))
    }

    /// Build on an existing transport, e.g. a mock
    pub fn with_transport(settings: MergeSettings, transport: Arc<dyn Transport>) -> Self {
        Self::with_gateway(settings, MergeGateway::new(transport))
    }

    fn with_gateway(settings: MergeSettings, gateway: MergeGateway) -> Self {
        let bus = EventBus::new();
        let store = Arc::new(StateStore::new(bus.clone()));
        let locks = LockManager::new(gateway.clone(), Arc::clone(&store), bus.clone());
        let configuration = ConfigurationOrchestrator::new(
            gateway.clone(),
            Arc::clone(&store),
            bus.clone(),
            locks.clone(),
        );
        let execution = ExecutionMonitor::new(gateway.clone(), Arc::clone(&store), bus.clone());

        Self {
            settings,
            bus,
            store,
            gateway,
            locks,
            configuration,
            execution,
        }
    }

    pub fn settings(&self) -> &MergeSettings {
        &self.settings
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    pub fn gateway(&self) -> &MergeGateway {
        &self.gateway
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    pub fn configuration(&self) -> &ConfigurationOrchestrator {
        &self.configuration
    }

    pub fn execution(&self) -> &ExecutionMonitor {
        &self.execution
    }

    /// Stop every lock monitor and merge poller
    pub fn cleanup(&self) {
        self.locks.cleanup();
        self.execution.cleanup();
    }
}

impl Drop for MergeClient {
    fn drop(&mut self) {
        self.cleanup();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventKind;
    use crate::mocks::MockTransport;

    #[test]
    fn test_new_rejects_invalid_settings() {
        assert!(MergeClient::new(MergeSettings::default()).is_err());
    }

    #[test]
    fn test_components_share_one_bus_and_store() {
        let client = MergeClient::with_transport(
            MergeSettings::default(),
            Arc::new(MockTransport::new()),
        );

        client.bus().on(EventKind::StateCleared, |_| {});
        client.store().clear_state();

        assert_eq!(client.bus().listener_count(EventKind::StateCleared), 1);
        assert!(client.locks().check_lock_status(1).lock_status.is_none());
        assert!(client.configuration().get_configuration(false).is_none());
        assert_eq!(client.execution().active_pollers(), 0);
    }
}
