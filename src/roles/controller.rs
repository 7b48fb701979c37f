use crate::config::{ConfigError, LoadSettings, QueryCatalog};
use crate::driver::Driver;
use crate::metrics::snapshot::{EndpointSummary, GlobalSnapshot, rank_endpoints};
use crate::metrics::stats::{LatencySummary, empty_histogram};
use crate::probe::{ProbeResult, probe_endpoints};
use crate::queue::QueueManager;
use crate::roles::group::GroupDeps;
use crate::roles::supervisor::EndpointSupervisor;
use crate::store::{EndpointKey, StoreConfig};
use futures::future::join_all;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{info, warn};

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ControllerError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(#[from] ConfigError),
}

/// Owns the admission queues and one supervisor per endpoint.
pub struct LoadController {
    settings: LoadSettings,
    catalog: Arc<QueryCatalog>,
    driver: Arc<dyn Driver>,
    queue: Arc<QueueManager>,
    supervisors: RwLock<Vec<Arc<EndpointSupervisor>>>,
    probes: RwLock<Vec<ProbeResult>>,
    running: AtomicBool,
    lifecycle: tokio::sync::Mutex<()>,
}

impl LoadController {
    pub fn new(settings: LoadSettings, catalog: QueryCatalog, driver: Arc<dyn Driver>) -> Self {
        let queue = Arc::new(QueueManager::new(settings.max_concurrency_per_endpoint));
        Self {
            settings,
            catalog: Arc::new(catalog),
            driver,
            queue,
            supervisors: RwLock::new(Vec::new()),
            probes: RwLock::new(Vec::new()),
            running: AtomicBool::new(false),
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    pub fn settings(&self) -> &LoadSettings {
        &self.settings
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Partition `stores`, then start one supervisor per endpoint.
    ///
    /// Only configuration problems are errors. An empty store list leaves
    /// the controller idle; a second call while running is ignored.
    pub async fn start(&self, stores: &[StoreConfig]) -> Result<(), ControllerError> {
        let _guard = self.lifecycle.lock().await;
        if self.is_running() {
            warn!("load already running, start ignored");
            return Ok(());
        }
        self.settings.validate()?;
        self.catalog.validate()?;
        if stores.is_empty() {
            warn!("no stores configured, nothing to load");
            return Ok(());
        }

        if self.settings.preflight {
            let results = probe_endpoints(
                self.driver.clone(),
                stores,
                self.settings.preflight_max_endpoints,
                self.settings.connect_timeout(),
            )
            .await;
            *self.probes.write().unwrap_or_else(|e| e.into_inner()) = results;
        }

        self.queue.initialize(stores);
        let deps = GroupDeps::new(&self.settings, self.catalog.clone(), self.driver.clone());
        let supervisors: Vec<Arc<EndpointSupervisor>> = self
            .queue
            .endpoints()
            .into_iter()
            .map(|endpoint| {
                Arc::new(EndpointSupervisor::new(
                    endpoint,
                    self.queue.clone(),
                    deps.clone(),
                    &self.settings,
                ))
            })
            .collect();
        for sup in &supervisors {
            sup.start();
        }

        info!(
            endpoints = supervisors.len(),
            stores = stores.len(),
            queries = self.catalog.len(),
            workers_per_store = deps.replicas_per_query * self.catalog.len(),
            max_concurrency = self.settings.max_concurrency_per_endpoint,
            driver = self.driver.name(),
            "load started"
        );
        *self.supervisors.write().unwrap_or_else(|e| e.into_inner()) = supervisors;
        self.running.store(true, Ordering::Release);
        Ok(())
    }

    /// Stop every supervisor concurrently. Idempotent.
    pub async fn stop(&self) {
        let _guard = self.lifecycle.lock().await;
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        let supervisors = self.supervisors();
        info!(endpoints = supervisors.len(), "stopping load");
        join_all(supervisors.iter().map(|s| s.stop())).await;

        let snapshot = self.global_snapshot();
        info!(
            executed = snapshot.totals.executed_total,
            errors = snapshot.totals.errors_total,
            "load stopped"
        );
    }

    fn supervisors(&self) -> Vec<Arc<EndpointSupervisor>> {
        self.supervisors.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn endpoints(&self) -> Vec<EndpointKey> {
        self.supervisors().iter().map(|s| s.endpoint().clone()).collect()
    }

    pub fn probe_results(&self) -> Vec<ProbeResult> {
        self.probes.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn global_snapshot(&self) -> GlobalSnapshot {
        let supervisors = self.supervisors();
        if supervisors.is_empty() {
            return GlobalSnapshot::empty(self.settings.max_concurrency_per_endpoint);
        }
        let mut hist = empty_histogram();
        for sup in &supervisors {
            sup.merge_latency(&mut hist);
        }
        GlobalSnapshot::new(
            self.is_running(),
            supervisors.iter().map(|s| s.statistics()).collect(),
            self.settings.max_concurrency_per_endpoint,
            LatencySummary::from_histogram(&hist),
        )
    }

    /// Endpoints ranked busiest first.
    pub fn per_endpoint_summary(&self) -> Vec<EndpointSummary> {
        rank_endpoints(&self.global_snapshot().endpoints)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueryDefinition;
    use crate::driver::mock::MockDriver;
    use std::time::Duration;
    use tokio::time::sleep;

    fn catalog() -> QueryCatalog {
        QueryCatalog::new(vec![
            QueryDefinition::new("sales", "SELECT 1"),
            QueryDefinition::new("stock", "SELECT 2"),
        ])
    }

    fn settings() -> LoadSettings {
        LoadSettings {
            max_concurrency_per_endpoint: 2,
            threads_per_store: 4,
            queue_poll_interval_ms: 200,
            ..LoadSettings::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn starts_one_supervisor_per_endpoint() {
        let driver = MockDriver::new();
        let ctl = LoadController::new(settings(), catalog(), Arc::new(driver.clone()));
        let stores = vec![
            StoreConfig::new("10.0.0.2", 3050, "b1"),
            StoreConfig::new("10.0.0.1", 3050, "a1"),
            StoreConfig::new("10.0.0.1", 3050, "a2"),
            StoreConfig::new("10.0.0.1", 3050, "a3"),
        ];
        ctl.start(&stores).await.unwrap();
        assert!(ctl.is_running());
        let eps: Vec<String> = ctl.endpoints().iter().map(|e| e.to_string()).collect();
        assert_eq!(eps, vec!["10.0.0.2:3050", "10.0.0.1:3050"]);

        sleep(Duration::from_secs(1)).await;
        let snap = ctl.global_snapshot();
        assert!(snap.running);
        assert_eq!(snap.totals.active_stores, 3);
        assert_eq!(snap.totals.queued_stores, 1);
        assert_eq!(snap.totals.total_workers, 12);
        assert!(snap.totals.executed > 0);
        assert!(snap.totals.latency.samples > 0);

        let ranked = ctl.per_endpoint_summary();
        assert_eq!(ranked[0].endpoint.as_str(), "10.0.0.1:3050");
        assert_eq!(ranked[0].active_stores, 2);

        ctl.stop().await;
        assert!(!ctl.is_running());
        let done = ctl.global_snapshot();
        assert_eq!(done.totals.active_stores, 0);
        assert!(done.totals.executed_total >= snap.totals.executed);
        assert_eq!(driver.open_sessions(), 0);
    }

    #[tokio::test]
    async fn rejects_invalid_configuration() {
        let bad = LoadSettings { threads_per_store: 0, ..settings() };
        let ctl = LoadController::new(bad, catalog(), Arc::new(MockDriver::new()));
        let err = ctl.start(&[StoreConfig::new("h", 1, "s")]).await.unwrap_err();
        assert_eq!(err, ControllerError::InvalidConfig(ConfigError::Zero("threads_per_store")));

        let ctl = LoadController::new(settings(), QueryCatalog::default(), Arc::new(MockDriver::new()));
        assert!(ctl.start(&[StoreConfig::new("h", 1, "s")]).await.is_err());
        assert!(!ctl.is_running());
    }

    #[tokio::test]
    async fn empty_store_list_stays_idle() {
        let ctl = LoadController::new(settings(), catalog(), Arc::new(MockDriver::new()));
        ctl.start(&[]).await.unwrap();
        assert!(!ctl.is_running());
        assert!(ctl.endpoints().is_empty());
        let snap = ctl.global_snapshot();
        assert_eq!(snap.totals.endpoints, 0);
        assert!(!snap.running);
        ctl.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn preflight_results_are_kept() {
        let s = LoadSettings { preflight: true, ..settings() };
        let ctl = LoadController::new(s, catalog(), Arc::new(MockDriver::new()));
        ctl.start(&[StoreConfig::new("10.0.0.1", 3050, "a1")]).await.unwrap();
        let probes = ctl.probe_results();
        assert_eq!(probes.len(), 1);
        assert!(probes[0].ok);
        ctl.stop().await;
    }
}
