//! In-process driver (feature `driver-mock`) with scripted connect and
//! execute outcomes, used by tests and for dry runs of the CLI.
use crate::driver::{ConnectOptions, Driver, DriverError, Session};
use crate::store::StoreConfig;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ConnectBehavior {
    #[default]
    Succeed,
    AlwaysFail,
    /// Fail this many attempts, then succeed.
    FailFirst(u64),
}

#[derive(Clone, Debug, Default)]
struct MockScript {
    default_connect: ConnectBehavior,
    per_store: HashMap<String, ConnectBehavior>,
    execute_latency: Duration,
    error_every: Option<u64>,
    disconnect_every: Option<u64>,
    panic_on_execute: HashSet<String>,
}

#[derive(Default)]
struct MockCounters {
    attempts: Mutex<HashMap<String, u64>>,
    executions: AtomicU64,
    open_sessions: AtomicI64,
}

#[derive(Clone, Default)]
pub struct MockDriver {
    script: MockScript,
    counters: Arc<MockCounters>,
}

impl MockDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds from `key=value` options: `connect_fail=a,b` (stores that never
    /// connect), `latency_ms`, `error_every`, `disconnect_every`.
    pub fn from_options(opts: &ConnectOptions) -> Self {
        let mut script = MockScript {
            execute_latency: Duration::from_millis(
                opts.get("latency_ms").and_then(|s| s.parse().ok()).unwrap_or(0),
            ),
            error_every: opts.get("error_every").and_then(|s| s.parse().ok()),
            disconnect_every: opts.get("disconnect_every").and_then(|s| s.parse().ok()),
            ..MockScript::default()
        };
        if let Some(list) = opts.get("connect_fail") {
            for name in list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
                script.per_store.insert(name.to_string(), ConnectBehavior::AlwaysFail);
            }
        }
        Self {
            script,
            counters: Arc::default(),
        }
    }

    pub fn with_default_connect(mut self, behavior: ConnectBehavior) -> Self {
        self.script.default_connect = behavior;
        self
    }

    pub fn with_store_connect(mut self, store: &str, behavior: ConnectBehavior) -> Self {
        self.script.per_store.insert(store.to_string(), behavior);
        self
    }

    pub fn with_execute_latency(mut self, latency: Duration) -> Self {
        self.script.execute_latency = latency;
        self
    }

    /// Every `n`th execution (per session) fails with an execute error.
    pub fn with_error_every(mut self, n: u64) -> Self {
        self.script.error_every = Some(n.max(1));
        self
    }

    /// Every `n`th execution (per session) reports a lost connection.
    pub fn with_disconnect_every(mut self, n: u64) -> Self {
        self.script.disconnect_every = Some(n.max(1));
        self
    }

    /// Sessions to `store` panic inside `execute`, like a buggy driver would.
    pub fn with_store_panic(mut self, store: &str) -> Self {
        self.script.panic_on_execute.insert(store.to_string());
        self
    }

    pub fn connect_attempts(&self, store: &str) -> u64 {
        self.counters
            .attempts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(store)
            .copied()
            .unwrap_or(0)
    }

    pub fn total_connect_attempts(&self) -> u64 {
        self.counters
            .attempts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .sum()
    }

    pub fn executions(&self) -> u64 {
        self.counters.executions.load(Ordering::Relaxed)
    }

    pub fn open_sessions(&self) -> i64 {
        self.counters.open_sessions.load(Ordering::Relaxed)
    }
}

#[async_trait::async_trait]
impl Driver for MockDriver {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn open(&self, store: &StoreConfig) -> Result<Box<dyn Session>, DriverError> {
        let attempt = {
            let mut attempts = self.counters.attempts.lock().unwrap_or_else(|e| e.into_inner());
            let n = attempts.entry(store.store_name.clone()).or_default();
            *n += 1;
            *n
        };
        let behavior = self
            .script
            .per_store
            .get(&store.store_name)
            .copied()
            .unwrap_or(self.script.default_connect);
        let refused = match behavior {
            ConnectBehavior::Succeed => false,
            ConnectBehavior::AlwaysFail => true,
            ConnectBehavior::FailFirst(n) => attempt <= n,
        };
        if refused {
            return Err(DriverError::Connect(format!(
                "mock refused {} (attempt {})",
                store.connection_string(),
                attempt
            )));
        }
        self.counters.open_sessions.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(MockSession {
            panics: self.script.panic_on_execute.contains(&store.store_name),
            script: self.script.clone(),
            counters: self.counters.clone(),
            executed: 0,
        }))
    }
}

struct MockSession {
    panics: bool,
    script: MockScript,
    counters: Arc<MockCounters>,
    executed: u64,
}

#[async_trait::async_trait]
impl Session for MockSession {
    async fn execute(&mut self, _sql: &str) -> Result<u64, DriverError> {
        if !self.script.execute_latency.is_zero() {
            tokio::time::sleep(self.script.execute_latency).await;
        }
        if self.panics {
            panic!("mock session panicked in execute");
        }
        self.executed += 1;
        self.counters.executions.fetch_add(1, Ordering::Relaxed);
        if let Some(n) = self.script.disconnect_every {
            if self.executed % n == 0 {
                return Err(DriverError::Disconnected);
            }
        }
        if let Some(n) = self.script.error_every {
            if self.executed % n == 0 {
                return Err(DriverError::Execute("mock statement failure".into()));
            }
        }
        Ok(1)
    }

    async fn close(self: Box<Self>) -> Result<(), DriverError> {
        self.counters.open_sessions.fetch_sub(1, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fail_first_then_succeed() {
        let driver = MockDriver::new().with_store_connect("s1", ConnectBehavior::FailFirst(2));
        let store = StoreConfig::new("h", 1, "s1");
        assert!(driver.open(&store).await.is_err());
        assert!(driver.open(&store).await.is_err());
        let session = driver.open(&store).await.expect("third attempt connects");
        assert_eq!(driver.connect_attempts("s1"), 3);
        assert_eq!(driver.open_sessions(), 1);
        session.close().await.unwrap();
        assert_eq!(driver.open_sessions(), 0);
    }

    #[tokio::test]
    async fn scripted_execute_errors() {
        let driver = MockDriver::new().with_error_every(3).with_disconnect_every(5);
        let mut session = driver.open(&StoreConfig::new("h", 1, "s")).await.unwrap();
        let mut outcomes = Vec::new();
        for _ in 0..5 {
            outcomes.push(session.execute("SELECT 1").await);
        }
        assert!(outcomes[0].is_ok());
        assert!(matches!(outcomes[2], Err(DriverError::Execute(_))));
        assert!(matches!(outcomes[4], Err(DriverError::Disconnected)));
        assert_eq!(driver.executions(), 5);
    }

    #[test]
    fn options_mark_failing_stores() {
        let mut opts = ConnectOptions::default();
        opts.params.insert("connect_fail".into(), "a, b".into());
        opts.params.insert("latency_ms".into(), "7".into());
        let driver = MockDriver::from_options(&opts);
        assert_eq!(driver.script.per_store.get("b"), Some(&ConnectBehavior::AlwaysFail));
        assert_eq!(driver.script.execute_latency, Duration::from_millis(7));
    }
}
