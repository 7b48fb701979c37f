use crate::config::LoadSettings;
use crate::metrics::snapshot::{EndpointLifetime, EndpointStats, StoreStats};
use crate::metrics::stats::LatencyRecorder;
use crate::pacing::sleep_or_stop;
use crate::queue::QueueManager;
use crate::roles::group::{GroupDeps, GroupError, StoreMonitor, StoreWorkGroup};
use crate::roles::panic_message;
use crate::store::{EndpointKey, StoreConfig};
use futures::FutureExt;
use futures::future::join_all;
use hdrhistogram::Histogram;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{Instrument, debug, error, info, info_span, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SupervisorState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl SupervisorState {
    fn as_u8(self) -> u8 {
        match self {
            Self::Stopped => 0,
            Self::Starting => 1,
            Self::Running => 2,
            Self::Stopping => 3,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Starting,
            2 => Self::Running,
            3 => Self::Stopping,
            _ => Self::Stopped,
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum SupervisorError {
    #[error(transparent)]
    Group(#[from] GroupError),
}

#[derive(Clone, Copy, Debug)]
struct Timing {
    poll: Duration,
    fault_delay: Duration,
    join_timeout: Duration,
    max_dwell: Option<Duration>,
}

/// State visible to both the loop task and snapshot readers.
struct Shared {
    state: AtomicU8,
    live: RwLock<BTreeMap<String, Arc<StoreMonitor>>>,
    admissions: AtomicU64,
    reaped: AtomicU64,
    retired_executed: AtomicU64,
    retired_errors: AtomicU64,
}

impl Shared {
    fn state(&self) -> SupervisorState {
        SupervisorState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: SupervisorState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    fn transition(&self, from: SupervisorState, to: SupervisorState) -> bool {
        self.state
            .compare_exchange(from.as_u8(), to.as_u8(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn publish(&self, name: &str, monitor: Arc<StoreMonitor>) {
        self.live
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.to_string(), monitor);
    }

    fn unpublish(&self, name: &str) {
        self.live.write().unwrap_or_else(|e| e.into_inner()).remove(name);
    }

    /// Fold a released group's final counts into the endpoint tallies.
    fn retire(&self, monitor: &StoreMonitor) {
        let stats = StoreStats::from_workers(monitor.store_name(), &monitor.worker_stats());
        self.retired_executed.fetch_add(stats.executed, Ordering::Relaxed);
        self.retired_errors.fetch_add(stats.errors, Ordering::Relaxed);
    }

    fn lifetime(&self) -> EndpointLifetime {
        EndpointLifetime {
            admissions: self.admissions.load(Ordering::Relaxed),
            reaped: self.reaped.load(Ordering::Relaxed),
            retired_executed: self.retired_executed.load(Ordering::Relaxed),
            retired_errors: self.retired_errors.load(Ordering::Relaxed),
        }
    }

    fn drain_live(&self) -> Vec<Arc<StoreMonitor>> {
        let mut live = self.live.write().unwrap_or_else(|e| e.into_inner());
        std::mem::take(&mut *live).into_values().collect()
    }
}

/// Keeps up to `max_concurrency` stores of one endpoint under load,
/// reaping dead groups and admitting replacements each poll.
pub struct EndpointSupervisor {
    endpoint: EndpointKey,
    queue: Arc<QueueManager>,
    deps: GroupDeps,
    timing: Timing,
    latency: Arc<LatencyRecorder>,
    shared: Arc<Shared>,
    stop_tx: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl EndpointSupervisor {
    pub fn new(endpoint: EndpointKey, queue: Arc<QueueManager>, deps: GroupDeps, settings: &LoadSettings) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            endpoint,
            queue,
            deps,
            timing: Timing {
                poll: settings.queue_poll_interval(),
                fault_delay: settings.fault_retry_delay(),
                join_timeout: settings.supervisor_join_timeout(),
                max_dwell: settings.max_dwell(),
            },
            latency: Arc::new(LatencyRecorder::new()),
            shared: Arc::new(Shared {
                state: AtomicU8::new(SupervisorState::Stopped.as_u8()),
                live: RwLock::new(BTreeMap::new()),
                admissions: AtomicU64::new(0),
                reaped: AtomicU64::new(0),
                retired_executed: AtomicU64::new(0),
                retired_errors: AtomicU64::new(0),
            }),
            stop_tx,
            handle: Mutex::new(None),
        }
    }

    pub fn endpoint(&self) -> &EndpointKey {
        &self.endpoint
    }

    pub fn state(&self) -> SupervisorState {
        self.shared.state()
    }

    pub fn is_running(&self) -> bool {
        self.state() == SupervisorState::Running
    }

    /// Spawn the poll loop. Ignored unless currently stopped.
    pub fn start(&self) {
        if !self.shared.transition(SupervisorState::Stopped, SupervisorState::Starting) {
            warn!(endpoint = %self.endpoint, state = ?self.state(), "supervisor already started");
            return;
        }
        self.stop_tx.send_replace(false);
        let run = SupervisorLoop {
            endpoint: self.endpoint.clone(),
            queue: self.queue.clone(),
            deps: self.deps.clone(),
            timing: self.timing,
            latency: self.latency.clone(),
            shared: self.shared.clone(),
            groups: BTreeMap::new(),
            stop: self.stop_tx.subscribe(),
        };
        let span = info_span!("supervisor", endpoint = %self.endpoint);
        let handle = tokio::spawn(run.run().instrument(span));
        *self.handle.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        self.shared.set_state(SupervisorState::Running);
        info!(endpoint = %self.endpoint, max = self.queue.max_concurrency(), "supervisor started");
    }

    /// Stop every live group and release their stores. Idempotent.
    pub async fn stop(&self) {
        if !self.shared.transition(SupervisorState::Running, SupervisorState::Stopping) {
            return;
        }
        self.stop_tx.send_replace(true);
        let handle = self.handle.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(mut handle) = handle {
            match tokio::time::timeout(self.timing.join_timeout, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(endpoint = %self.endpoint, error = %e, "supervisor task failed"),
                Err(_) => {
                    warn!(
                        endpoint = %self.endpoint,
                        timeout_ms = self.timing.join_timeout.as_millis() as u64,
                        "supervisor did not stop in time, aborting"
                    );
                    handle.abort();
                }
            }
        }
        // whatever the loop could not hand back itself
        for monitor in self.shared.drain_live() {
            self.shared.retire(&monitor);
            self.queue.release(&self.endpoint, monitor.store_name());
        }
        self.shared.set_state(SupervisorState::Stopped);
        info!(endpoint = %self.endpoint, "supervisor stopped");
    }

    pub fn statistics(&self) -> EndpointStats {
        let stores = self
            .shared
            .live
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter_map(|m| m.statistics())
            .collect();
        EndpointStats::new(
            self.endpoint.clone(),
            stores,
            self.queue.status_snapshot(&self.endpoint),
            self.shared.lifetime(),
            self.latency.summary(),
        )
    }

    pub fn merge_latency(&self, into: &mut Histogram<u64>) {
        self.latency.merge_into(into);
    }
}

struct LiveGroup {
    group: StoreWorkGroup,
    monitor: Arc<StoreMonitor>,
    admitted_at: Instant,
}

struct SupervisorLoop {
    endpoint: EndpointKey,
    queue: Arc<QueueManager>,
    deps: GroupDeps,
    timing: Timing,
    latency: Arc<LatencyRecorder>,
    shared: Arc<Shared>,
    groups: BTreeMap<String, LiveGroup>,
    stop: watch::Receiver<bool>,
}

impl SupervisorLoop {
    async fn run(mut self) {
        loop {
            if *self.stop.borrow() {
                break;
            }
            let delay = match AssertUnwindSafe(self.poll_once()).catch_unwind().await {
                Ok(Ok(())) => self.timing.poll,
                Ok(Err(e)) => {
                    error!(error = %e, "supervisor iteration failed");
                    self.timing.fault_delay
                }
                Err(panic) => {
                    error!(panic = %panic_message(panic.as_ref()), "supervisor iteration panicked");
                    self.timing.fault_delay
                }
            };
            if !sleep_or_stop(delay, &mut self.stop).await {
                break;
            }
        }
        self.shutdown().await;
    }

    async fn poll_once(&mut self) -> Result<(), SupervisorError> {
        let free = self.queue.max_concurrency().saturating_sub(self.groups.len());
        for _ in 0..free {
            let Some(store) = self.queue.acquire_next(&self.endpoint) else {
                break;
            };
            self.admit(store)?;
        }
        self.reap().await;
        Ok(())
    }

    fn admit(&mut self, store: StoreConfig) -> Result<(), SupervisorError> {
        let mut group = StoreWorkGroup::new(store.clone(), self.deps.clone(), self.latency.clone());
        let monitor = match group.start() {
            Ok(m) => m,
            Err(e) => {
                self.queue.release(&self.endpoint, &store.store_name);
                return Err(e.into());
            }
        };
        self.shared.publish(&store.store_name, monitor.clone());
        self.shared.admissions.fetch_add(1, Ordering::Relaxed);
        info!(store = %store.store_name, live = self.groups.len() + 1, "store admitted");
        self.groups.insert(
            store.store_name,
            LiveGroup {
                group,
                monitor,
                admitted_at: Instant::now(),
            },
        );
        Ok(())
    }

    async fn reap(&mut self) {
        let now = Instant::now();
        let max_dwell = self.timing.max_dwell;
        let due: Vec<(String, &'static str)> = self
            .groups
            .iter()
            .filter_map(|(name, live)| {
                if !live.group.is_running() {
                    Some((name.clone(), "finished"))
                } else if max_dwell.is_some_and(|d| now.duration_since(live.admitted_at) >= d) {
                    Some((name.clone(), "dwell expired"))
                } else {
                    None
                }
            })
            .collect();
        if due.is_empty() {
            return;
        }

        let mut reaped: Vec<(String, &'static str, LiveGroup)> = due
            .into_iter()
            .filter_map(|(name, reason)| self.groups.remove(&name).map(|live| (name, reason, live)))
            .collect();
        join_all(reaped.iter_mut().map(|(_, _, live)| live.group.stop())).await;

        for (name, reason, live) in reaped {
            self.queue.release(&self.endpoint, &name);
            self.shared.unpublish(&name);
            self.shared.retire(&live.monitor);
            self.shared.reaped.fetch_add(1, Ordering::Relaxed);
            info!(store = %name, reason, "store released");
        }
    }

    async fn shutdown(&mut self) {
        let mut groups = std::mem::take(&mut self.groups);
        debug!(live = groups.len(), "stopping live groups");
        join_all(groups.values_mut().map(|live| live.group.stop())).await;
        for (name, live) in &groups {
            self.queue.release(&self.endpoint, name);
            self.shared.unpublish(name);
            self.shared.retire(&live.monitor);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{QueryCatalog, QueryDefinition};
    use crate::driver::mock::{ConnectBehavior, MockDriver};
    use std::any::Any;
    use tokio::time::sleep;

    fn settings(max: usize) -> LoadSettings {
        LoadSettings {
            max_concurrency_per_endpoint: max,
            queue_poll_interval_ms: 500,
            connection_retry_count: 3,
            connection_retry_backoff_ms: 100,
            ..LoadSettings::default()
        }
    }

    fn stores(ip: &str, names: &[&str]) -> Vec<StoreConfig> {
        names.iter().map(|n| StoreConfig::new(ip, 3050, *n)).collect()
    }

    fn supervisor(queue: &Arc<QueueManager>, ip: &str, driver: &MockDriver, settings: &LoadSettings) -> EndpointSupervisor {
        let catalog = QueryCatalog::new(vec![QueryDefinition::new("q", "SELECT 1")]);
        let deps = GroupDeps::new(settings, Arc::new(catalog), Arc::new(driver.clone()));
        EndpointSupervisor::new(EndpointKey::new(ip, 3050), queue.clone(), deps, settings)
    }

    #[tokio::test(start_paused = true)]
    async fn admission_ceiling_holds_across_rotations() {
        let s = LoadSettings {
            queue_poll_interval_ms: 100,
            max_dwell_secs: Some(1),
            ..settings(2)
        };
        let queue = Arc::new(QueueManager::new(2));
        queue.initialize(&stores("10.0.0.1", &["a", "b", "c", "d", "e", "f", "g"]));
        let driver = MockDriver::new();
        let sup = supervisor(&queue, "10.0.0.1", &driver, &s);
        sup.start();

        for _ in 0..300 {
            sleep(Duration::from_millis(50)).await;
            let stats = sup.statistics();
            assert!(stats.queue.active <= 2, "active {}", stats.queue.active);
            assert!(stats.active_stores <= 2);
        }
        let stats = sup.statistics();
        assert!(stats.lifetime.admissions >= 14, "admissions {}", stats.lifetime.admissions);
        assert!(stats.lifetime.reaped >= 12);
        assert!(stats.lifetime.retired_executed > 0);
        assert!(stats.executed_total >= stats.lifetime.retired_executed);
        // every store went through at least two full rotations, three workers each
        for name in ["a", "b", "c", "d", "e", "f", "g"] {
            let attempts = driver.connect_attempts(name);
            assert!(attempts >= 2 * 3, "{name} admitted too rarely ({attempts} connects)");
        }
        sup.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn dead_group_is_reaped_and_store_released() {
        let queue = Arc::new(QueueManager::new(2));
        queue.initialize(&stores("10.0.0.1", &["bad", "good", "other"]));
        let driver = MockDriver::new().with_store_connect("bad", ConnectBehavior::AlwaysFail);
        let sup = supervisor(&queue, "10.0.0.1", &driver, &settings(2));
        sup.start();

        sleep(Duration::from_millis(1_500)).await;
        let stats = sup.statistics();
        let live: Vec<&str> = stats.stores.iter().map(|s| s.store_name.as_str()).collect();
        assert_eq!(live, vec!["good", "other"]);
        // three workers, three attempts each
        assert_eq!(driver.connect_attempts("bad"), 9);
        assert_eq!(stats.lifetime.reaped, 1);
        assert_eq!(stats.lifetime.admissions, 3);
        assert_eq!((stats.queue.active, stats.queue.processed), (2, 1));
        sup.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stopping_one_endpoint_leaves_the_other_alone() {
        let s = settings(2);
        let queue = Arc::new(QueueManager::new(2));
        let mut all = stores("10.0.0.1", &["a1", "a2", "a3"]);
        all.extend(stores("10.0.0.2", &["b1", "b2", "b3"]));
        queue.initialize(&all);
        let driver = MockDriver::new();
        let a = supervisor(&queue, "10.0.0.1", &driver, &s);
        let b = supervisor(&queue, "10.0.0.2", &driver, &s);
        a.start();
        b.start();
        sleep(Duration::from_secs(1)).await;

        let before = queue.status_snapshot(b.endpoint());
        assert_eq!((before.active, before.pending), (2, 1));
        a.stop().await;
        assert_eq!(a.state(), SupervisorState::Stopped);
        assert_eq!(queue.status_snapshot(a.endpoint()).active, 0);
        assert_eq!(queue.status_snapshot(b.endpoint()), before);

        let executed = b.statistics().executed;
        sleep(Duration::from_millis(500)).await;
        assert!(b.statistics().executed > executed);
        assert!(b.is_running());
        b.stop().await;
        assert_eq!(driver.open_sessions(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_store_frees_its_slot() {
        let queue = Arc::new(QueueManager::new(1));
        queue.initialize(&stores("10.0.0.1", &["bad", "next"]));
        let driver = MockDriver::new().with_store_panic("bad");
        let sup = supervisor(&queue, "10.0.0.1", &driver, &settings(1));
        sup.start();

        sleep(Duration::from_millis(1_500)).await;
        let stats = sup.statistics();
        let live: Vec<&str> = stats.stores.iter().map(|s| s.store_name.as_str()).collect();
        assert_eq!(live, vec!["next"]);
        assert_eq!(stats.lifetime.reaped, 1);
        assert!(stats.executed > 0);
        assert_eq!(sup.state(), SupervisorState::Running);
        sup.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stop_is_idempotent_with_nothing_admitted() {
        let queue = Arc::new(QueueManager::new(3));
        queue.initialize(&[]);
        let sup = supervisor(&queue, "10.0.0.9", &MockDriver::new(), &settings(3));
        sup.stop().await;
        assert_eq!(sup.state(), SupervisorState::Stopped);

        sup.start();
        sup.start();
        assert!(sup.is_running());
        sleep(Duration::from_secs(2)).await;
        assert_eq!(sup.statistics().active_stores, 0);
        sup.stop().await;
        sup.stop().await;
        assert_eq!(sup.state(), SupervisorState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_releases_every_admitted_store() {
        let queue = Arc::new(QueueManager::new(2));
        queue.initialize(&stores("10.0.0.1", &["a", "b", "c"]));
        let driver = MockDriver::new();
        let sup = supervisor(&queue, "10.0.0.1", &driver, &settings(2));
        sup.start();
        sleep(Duration::from_secs(1)).await;
        assert_eq!(sup.statistics().active_stores, 2);

        let executed = sup.statistics().executed;
        sup.stop().await;
        let status = queue.status_snapshot(sup.endpoint());
        assert_eq!((status.active, status.pending, status.processed), (0, 1, 2));
        let after = sup.statistics();
        assert!(after.stores.is_empty());
        assert_eq!(after.executed, 0);
        // work from released groups still counts
        assert!(after.executed_total >= executed);
        assert_eq!(driver.open_sessions(), 0);
    }

    #[test]
    fn panic_payloads_are_readable() {
        let p: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(p.as_ref()), "boom");
        let p: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(p.as_ref()), "bang");
        let p: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(p.as_ref()), "unknown panic");
    }
}
