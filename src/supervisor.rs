use crate::broadcast::Hub;
use crate::config::WatchConfig;
use crate::discovery::{ProcessDiscovery, Role};
use crate::lifecycle::Controller;
use crate::process_table::{ProcessEnumerator, PsEnumerator};
use crate::registry::{LogRegistry, RegistryError};
use crate::signals::{OsSignaller, Signaller};
use crate::status::{HealthReport, StatusReport};
use std::sync::Arc;
use std::time::Duration;

/// Owns every long-lived component. Handlers reach shared state only
/// through this object.
pub struct Supervisor {
    pub discovery: Arc<ProcessDiscovery>,
    pub registry: Arc<LogRegistry>,
    pub controller: Arc<Controller>,
    pub hub: Hub,
    active_window: Duration,
}

impl Supervisor {
    /// Build a supervisor backed by `ps` and real signals.
    pub fn new(config: &WatchConfig) -> Result<Self, RegistryError> {
        Self::with_adapters(config, Arc::new(PsEnumerator), Arc::new(OsSignaller))
    }

    pub fn with_adapters(
        config: &WatchConfig,
        enumerator: Arc<dyn ProcessEnumerator>,
        signaller: Arc<dyn Signaller>,
    ) -> Result<Self, RegistryError> {
        let discovery = Arc::new(ProcessDiscovery::new(
            enumerator,
            &config.discovery,
            &config.agent,
        ));
        let registry = Arc::new(LogRegistry::new(&config.logs, Arc::clone(&discovery))?);
        let controller = Arc::new(Controller::new(
            &config.agent,
            &config.lifecycle,
            Arc::clone(&discovery),
            signaller,
        ));
        let active_window = config.logs.active_window();
        let hub = Hub::new(
            &config.stream,
            &config.tail,
            active_window,
            Arc::clone(&discovery),
            Arc::clone(&registry),
            Arc::clone(&controller),
        );
        Ok(Self {
            discovery,
            registry,
            controller,
            hub,
            active_window,
        })
    }

    pub fn active_window(&self) -> Duration {
        self.active_window
    }

    pub async fn status(&self) -> StatusReport {
        let records = self.discovery.enumerate(false).await;
        StatusReport::new(
            records,
            self.controller.phase(),
            self.controller.managed_pid(),
        )
    }

    pub async fn health(&self) -> HealthReport {
        let records = self.discovery.enumerate(false).await;
        let main_processes = records.iter().filter(|r| r.role == Role::Main).count();
        let active_log_files = self
            .registry
            .list(self.active_window)
            .await
            .iter()
            .filter(|f| f.is_active)
            .count();
        HealthReport {
            ok: true,
            main_processes,
            sub_workers: records.len() - main_processes,
            active_log_files,
            subscriptions: self.hub.len(),
        }
    }
}
