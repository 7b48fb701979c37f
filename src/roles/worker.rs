use crate::config::{LoadSettings, QueryDefinition};
use crate::connection::{Connection, ConnectionError, RetryPolicy};
use crate::driver::Driver;
use crate::metrics::snapshot::WorkerStats;
use crate::metrics::stats::{LatencyRecorder, WorkerCounters, WorkerState};
use crate::pacing::FixedDelay;
use crate::roles::panic_message;
use crate::store::StoreConfig;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{Instrument, debug, error, info, info_span, warn};

/// Per-worker knobs, cut from [`LoadSettings`].
#[derive(Clone, Copy, Debug)]
pub struct WorkerSettings {
    pub interval: Duration,
    pub retry: RetryPolicy,
    pub join_timeout: Duration,
}

impl From<&LoadSettings> for WorkerSettings {
    fn from(s: &LoadSettings) -> Self {
        Self {
            interval: s.execution_interval(),
            retry: RetryPolicy {
                max_attempts: s.connection_retry_count,
                backoff: s.connection_retry_backoff(),
                connect_timeout: s.connect_timeout(),
            },
            join_timeout: s.worker_join_timeout(),
        }
    }
}

/// Read-only handle to a worker's live counters.
#[derive(Clone)]
pub struct WorkerProbe {
    pub query_name: String,
    pub index: usize,
    counters: Arc<WorkerCounters>,
}

impl WorkerProbe {
    pub fn state(&self) -> WorkerState {
        self.counters.state()
    }

    pub fn stats(&self) -> WorkerStats {
        WorkerStats {
            query_name: self.query_name.clone(),
            index: self.index,
            state: self.counters.state(),
            executed: self.counters.executed(),
            errors: self.counters.errors(),
            reconnects: self.counters.reconnects(),
        }
    }
}

/// One task executing one statement against one store, over and over.
pub struct QueryWorker {
    store: StoreConfig,
    query: QueryDefinition,
    index: usize,
    settings: WorkerSettings,
    driver: Arc<dyn Driver>,
    latency: Arc<LatencyRecorder>,
    counters: Arc<WorkerCounters>,
    stop_tx: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
}

impl QueryWorker {
    pub fn new(
        store: StoreConfig,
        query: QueryDefinition,
        index: usize,
        settings: WorkerSettings,
        driver: Arc<dyn Driver>,
        latency: Arc<LatencyRecorder>,
    ) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            store,
            query,
            index,
            settings,
            driver,
            latency,
            counters: Arc::new(WorkerCounters::default()),
            stop_tx,
            handle: None,
        }
    }

    pub fn probe(&self) -> WorkerProbe {
        WorkerProbe {
            query_name: self.query.name.clone(),
            index: self.index,
            counters: self.counters.clone(),
        }
    }

    pub fn state(&self) -> WorkerState {
        self.counters.state()
    }

    pub fn is_finished(&self) -> bool {
        self.counters.state() == WorkerState::Stopped
    }

    /// Spawn the worker loop. Returns immediately; a second call is a no-op.
    pub fn start(&mut self) {
        if self.handle.is_some() || self.state() != WorkerState::Idle {
            return;
        }
        self.counters.set_state(WorkerState::Connecting);
        let span = info_span!(
            "worker",
            store = %self.store.store_name,
            query = %self.query.name,
            index = self.index
        );
        let run = WorkerLoop {
            connection: Connection::new(self.driver.clone(), self.store.clone(), self.settings.retry),
            sql: self.query.sql.clone(),
            pacing: FixedDelay::new(self.settings.interval),
            counters: self.counters.clone(),
            latency: self.latency.clone(),
            stop: self.stop_tx.subscribe(),
        };
        // The worker always ends Stopped, even if the loop panics.
        let counters = self.counters.clone();
        let task = async move {
            if let Err(panic) = AssertUnwindSafe(run.run()).catch_unwind().await {
                error!(panic = %panic_message(panic.as_ref()), "worker panicked");
                counters.set_state(WorkerState::Stopped);
            }
        };
        self.handle = Some(tokio::spawn(task.instrument(span)));
    }

    /// Signal the loop and wait up to the join timeout. Idempotent.
    pub async fn stop(&mut self) {
        self.stop_tx.send_replace(true);
        let Some(handle) = self.handle.take() else {
            if self.state() == WorkerState::Idle {
                self.counters.set_state(WorkerState::Stopped);
            }
            return;
        };
        match tokio::time::timeout(self.settings.join_timeout, handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(store = %self.store.store_name, query = %self.query.name, index = self.index, error = %e, "worker task failed");
                self.counters.set_state(WorkerState::Stopped);
            }
            Err(_) => warn!(
                store = %self.store.store_name,
                query = %self.query.name,
                index = self.index,
                timeout_ms = self.settings.join_timeout.as_millis() as u64,
                "worker did not stop in time, abandoning"
            ),
        }
    }
}

struct WorkerLoop {
    connection: Connection,
    sql: String,
    pacing: FixedDelay,
    counters: Arc<WorkerCounters>,
    latency: Arc<LatencyRecorder>,
    stop: watch::Receiver<bool>,
}

impl WorkerLoop {
    async fn run(mut self) {
        match self.connection.establish(&mut self.stop).await {
            Ok(()) => {}
            Err(ConnectionError::Cancelled) => {
                self.counters.set_state(WorkerState::Stopped);
                return;
            }
            Err(e) => {
                warn!(error = %e, "giving up on connection, worker stopping");
                self.counters.set_state(WorkerState::Stopped);
                return;
            }
        }
        self.counters.set_state(WorkerState::Running);
        debug!("worker running");

        while !*self.stop.borrow() {
            let started = Instant::now();
            match self.connection.execute(&self.sql).await {
                Ok(_) => {
                    self.latency.record(started.elapsed());
                    let n = self.counters.record_executed();
                    if n % 100 == 0 {
                        debug!(executed = n, "progress");
                    }
                }
                Err(e) => {
                    self.counters.record_error();
                    if e.requires_reconnect() {
                        warn!(error = %e, "connection lost, reconnecting");
                        self.counters.set_state(WorkerState::Connecting);
                        match self.connection.reconnect(&mut self.stop).await {
                            Ok(()) => {
                                self.counters.record_reconnect();
                                self.counters.set_state(WorkerState::Running);
                            }
                            Err(ConnectionError::Cancelled) => break,
                            Err(e) => {
                                warn!(error = %e, "reconnect failed, worker stopping");
                                break;
                            }
                        }
                    } else {
                        debug!(error = %e, "statement failed");
                    }
                }
            }
            if !self.pacing.pause(&mut self.stop).await {
                break;
            }
        }

        self.connection.close().await;
        info!(
            executed = self.counters.executed(),
            errors = self.counters.errors(),
            "worker stopped"
        );
        self.counters.set_state(WorkerState::Stopped);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::mock::{ConnectBehavior, MockDriver};
    use tokio::time::sleep;

    fn settings(max_attempts: u32) -> WorkerSettings {
        WorkerSettings {
            interval: Duration::from_millis(20),
            retry: RetryPolicy {
                max_attempts,
                backoff: Duration::from_millis(500),
                connect_timeout: Duration::from_secs(5),
            },
            join_timeout: Duration::from_secs(5),
        }
    }

    fn worker(driver: &MockDriver, max_attempts: u32) -> QueryWorker {
        QueryWorker::new(
            StoreConfig::new("10.0.0.1", 3050, "loja01"),
            QueryDefinition::new("q", "SELECT 1"),
            0,
            settings(max_attempts),
            Arc::new(driver.clone()),
            Arc::new(LatencyRecorder::new()),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn executes_until_stopped() {
        let driver = MockDriver::new().with_execute_latency(Duration::from_millis(5));
        let mut w = worker(&driver, 3);
        assert_eq!(w.state(), WorkerState::Idle);
        w.start();
        sleep(Duration::from_secs(1)).await;
        assert_eq!(w.state(), WorkerState::Running);
        let during = w.probe().stats().executed;
        assert!(during > 10, "executed {during}");

        w.stop().await;
        assert_eq!(w.state(), WorkerState::Stopped);
        assert_eq!(driver.open_sessions(), 0);
        let after = w.probe().stats().executed;
        sleep(Duration::from_secs(1)).await;
        assert_eq!(w.probe().stats().executed, after);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_connect_stops_without_running() {
        let driver = MockDriver::new().with_default_connect(ConnectBehavior::AlwaysFail);
        let mut w = worker(&driver, 3);
        w.start();
        sleep(Duration::from_secs(5)).await;
        assert_eq!(w.state(), WorkerState::Stopped);
        assert_eq!(driver.connect_attempts("loja01"), 3);
        let stats = w.probe().stats();
        assert_eq!((stats.executed, stats.errors), (0, 0));
        w.stop().await;
        w.stop().await;
        assert_eq!(w.state(), WorkerState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn statement_errors_are_counted_without_reconnect() {
        let driver = MockDriver::new().with_error_every(2);
        let mut w = worker(&driver, 1);
        w.start();
        sleep(Duration::from_millis(500)).await;
        let stats = w.probe().stats();
        assert!(stats.errors > 0);
        assert!(stats.executed >= stats.errors - 1);
        assert_eq!(driver.connect_attempts("loja01"), 1);
        assert_eq!(w.state(), WorkerState::Running);
        w.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn lost_connection_reconnects_within_budget() {
        let driver = MockDriver::new().with_disconnect_every(3);
        let mut w = worker(&driver, 2);
        w.start();
        sleep(Duration::from_secs(5)).await;
        // one reconnect allowed, the next disconnect ends the worker
        assert_eq!(w.state(), WorkerState::Stopped);
        assert_eq!(driver.connect_attempts("loja01"), 2);
        let stats = w.probe().stats();
        assert_eq!(stats.reconnects, 1);
        assert_eq!(stats.executed, 4);
        assert_eq!(stats.errors, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_session_leaves_worker_stopped() {
        let driver = MockDriver::new().with_store_panic("loja01");
        let mut w = worker(&driver, 3);
        w.start();
        sleep(Duration::from_millis(100)).await;
        assert_eq!(w.state(), WorkerState::Stopped);
        assert!(w.is_finished());
        assert_eq!(w.probe().stats().executed, 0);
        w.stop().await;
        assert_eq!(w.state(), WorkerState::Stopped);
    }

    #[tokio::test]
    async fn zero_interval_still_yields_to_stop() {
        let driver = MockDriver::new();
        let mut w = worker(&driver, 1);
        w.settings.interval = Duration::ZERO;
        w.start();
        sleep(Duration::from_millis(20)).await;
        assert!(w.probe().stats().executed > 0);
        tokio::time::timeout(Duration::from_secs(5), w.stop())
            .await
            .expect("worker with zero interval did not stop");
        assert_eq!(w.state(), WorkerState::Stopped);
        assert_eq!(driver.open_sessions(), 0);
    }

    #[tokio::test]
    async fn stop_before_start_marks_stopped() {
        let mut w = worker(&MockDriver::new(), 1);
        w.stop().await;
        assert!(w.is_finished());
        w.start();
        assert!(w.is_finished());
    }
}
