use crate::config::{LoadSettings, QueryCatalog};
use crate::driver::Driver;
use crate::metrics::snapshot::{StoreStats, WorkerStats};
use crate::metrics::stats::{LatencyRecorder, WorkerState};
use crate::roles::worker::{QueryWorker, WorkerProbe, WorkerSettings};
use crate::store::StoreConfig;
use futures::future::join_all;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::info;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum GroupError {
    #[error("store {0}: query catalog is empty")]
    NoQueries(String),
}

/// Everything a group needs to build its workers.
#[derive(Clone)]
pub struct GroupDeps {
    pub catalog: Arc<QueryCatalog>,
    pub driver: Arc<dyn Driver>,
    pub replicas_per_query: usize,
    pub worker: WorkerSettings,
}

impl GroupDeps {
    pub fn new(settings: &LoadSettings, catalog: Arc<QueryCatalog>, driver: Arc<dyn Driver>) -> Self {
        Self {
            replicas_per_query: settings.replicas_per_query(catalog.len()),
            catalog,
            driver,
            worker: WorkerSettings::from(settings),
        }
    }
}

/// Shareable view of a running group, safe to read from any task.
pub struct StoreMonitor {
    store_name: String,
    running: AtomicBool,
    workers: Vec<WorkerProbe>,
}

impl StoreMonitor {
    pub fn store_name(&self) -> &str {
        &self.store_name
    }

    /// Started, not stopped, and at least one worker still alive.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
            && self.workers.iter().any(|w| w.state() != WorkerState::Stopped)
    }

    pub fn worker_stats(&self) -> Vec<WorkerStats> {
        self.workers.iter().map(WorkerProbe::stats).collect()
    }

    /// Live figures; `None` once stopped or every worker has given up.
    pub fn statistics(&self) -> Option<StoreStats> {
        if !self.is_running() {
            return None;
        }
        Some(StoreStats::from_workers(&self.store_name, &self.worker_stats()))
    }
}

/// The fixed roster of workers loading one store.
pub struct StoreWorkGroup {
    store: StoreConfig,
    deps: GroupDeps,
    latency: Arc<LatencyRecorder>,
    workers: Vec<QueryWorker>,
    monitor: Option<Arc<StoreMonitor>>,
}

impl StoreWorkGroup {
    pub fn new(store: StoreConfig, deps: GroupDeps, latency: Arc<LatencyRecorder>) -> Self {
        Self {
            store,
            deps,
            latency,
            workers: Vec::new(),
            monitor: None,
        }
    }

    pub fn store(&self) -> &StoreConfig {
        &self.store
    }

    /// Launch every worker; all are spawned before this returns.
    pub fn start(&mut self) -> Result<Arc<StoreMonitor>, GroupError> {
        if let Some(monitor) = &self.monitor {
            return Ok(monitor.clone());
        }
        let replicas = self.deps.replicas_per_query;
        if replicas == 0 {
            return Err(GroupError::NoQueries(self.store.store_name.clone()));
        }

        for query in self.deps.catalog.iter() {
            for index in 0..replicas {
                let mut worker = QueryWorker::new(
                    self.store.clone(),
                    query.clone(),
                    index,
                    self.deps.worker,
                    self.deps.driver.clone(),
                    self.latency.clone(),
                );
                worker.start();
                self.workers.push(worker);
            }
        }

        let monitor = Arc::new(StoreMonitor {
            store_name: self.store.store_name.clone(),
            running: AtomicBool::new(true),
            workers: self.workers.iter().map(QueryWorker::probe).collect(),
        });
        self.monitor = Some(monitor.clone());
        info!(
            store = %self.store.store_name,
            workers = self.workers.len(),
            per_query = replicas,
            "store group started"
        );
        Ok(monitor)
    }

    pub fn is_running(&self) -> bool {
        self.monitor.as_ref().is_some_and(|m| m.is_running())
    }

    pub fn statistics(&self) -> Option<StoreStats> {
        self.monitor.as_ref().and_then(|m| m.statistics())
    }

    /// Stop all workers concurrently, each join bounded. Idempotent.
    pub async fn stop(&mut self) {
        let Some(monitor) = &self.monitor else {
            return;
        };
        if !monitor.running.swap(false, Ordering::AcqRel) {
            return;
        }
        join_all(self.workers.iter_mut().map(|w| w.stop())).await;

        let totals = StoreStats::from_workers(&self.store.store_name, &monitor.worker_stats());
        for q in &totals.queries {
            info!(
                store = %self.store.store_name,
                query = %q.query_name,
                executed = q.executed,
                errors = q.errors,
                workers = q.total_workers,
                "query totals"
            );
        }
        info!(
            store = %self.store.store_name,
            executed = totals.executed,
            errors = totals.errors,
            "store group stopped"
        );
        self.workers.clear();
    }
}
