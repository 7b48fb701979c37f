//! One store connection with a lifetime-bounded reconnect budget.

use crate::driver::{Driver, DriverError, Session};
use crate::pacing::sleep_or_stop;
use crate::store::StoreConfig;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};

#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    /// Connect attempts allowed over the connection's whole life.
    pub max_attempts: u32,
    pub backoff: Duration,
    pub connect_timeout: Duration,
}

#[derive(thiserror::Error, Debug)]
pub enum ConnectionError {
    #[error("connect failed: {0}")]
    Connect(DriverError),
    #[error("execute failed: {0}")]
    Execute(DriverError),
    #[error("not connected")]
    NotConnected,
    #[error("connect retries exhausted after {attempts} attempts")]
    RetryExhausted { attempts: u32 },
    #[error("cancelled")]
    Cancelled,
}

impl ConnectionError {
    /// Whether the caller should drop the session and reconnect.
    pub fn requires_reconnect(&self) -> bool {
        match self {
            Self::NotConnected => true,
            Self::Execute(e) | Self::Connect(e) => e.requires_reconnect(),
            Self::RetryExhausted { .. } | Self::Cancelled => false,
        }
    }
}

pub struct Connection {
    driver: Arc<dyn Driver>,
    store: StoreConfig,
    policy: RetryPolicy,
    attempts: u32,
    session: Option<Box<dyn Session>>,
}

impl Connection {
    pub fn new(driver: Arc<dyn Driver>, store: StoreConfig, policy: RetryPolicy) -> Self {
        Self {
            driver,
            store,
            policy,
            attempts: 0,
            session: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// No connect attempts left; the connection is permanently dead.
    pub fn is_exhausted(&self) -> bool {
        self.attempts >= self.policy.max_attempts
    }

    /// Single connect attempt, charged against the lifetime budget.
    pub async fn connect(&mut self) -> Result<(), ConnectionError> {
        if self.session.is_some() {
            return Ok(());
        }
        if self.is_exhausted() {
            return Err(ConnectionError::RetryExhausted {
                attempts: self.attempts,
            });
        }
        self.attempts += 1;
        let opened = tokio::time::timeout(self.policy.connect_timeout, self.driver.open(&self.store)).await;
        match opened {
            Ok(Ok(session)) => {
                debug!(store = %self.store.connection_string(), attempt = self.attempts, "connected");
                self.session = Some(session);
                Ok(())
            }
            Ok(Err(e)) => Err(ConnectionError::Connect(e)),
            Err(_) => Err(ConnectionError::Connect(DriverError::Timeout)),
        }
    }

    pub async fn execute(&mut self, sql: &str) -> Result<u64, ConnectionError> {
        let session = self.session.as_mut().ok_or(ConnectionError::NotConnected)?;
        session.execute(sql).await.map_err(ConnectionError::Execute)
    }

    pub async fn close(&mut self) {
        if let Some(session) = self.session.take() {
            if let Err(e) = session.close().await {
                debug!(store = %self.store.connection_string(), error = %e, "close failed");
            }
        }
    }

    /// Drop any session and retry with backoff until connected, the budget
    /// runs out, or `stop` fires.
    pub async fn reconnect(&mut self, stop: &mut watch::Receiver<bool>) -> Result<(), ConnectionError> {
        self.close().await;
        loop {
            if self.is_exhausted() {
                return Err(ConnectionError::RetryExhausted {
                    attempts: self.attempts,
                });
            }
            if !sleep_or_stop(self.policy.backoff, stop).await {
                return Err(ConnectionError::Cancelled);
            }
            match self.connect().await {
                Ok(()) => return Ok(()),
                Err(e) => warn!(
                    store = %self.store.connection_string(),
                    attempt = self.attempts,
                    max = self.policy.max_attempts,
                    error = %e,
                    "reconnect attempt failed"
                ),
            }
        }
    }

    /// Initial connect, falling back to `reconnect` on failure.
    pub async fn establish(&mut self, stop: &mut watch::Receiver<bool>) -> Result<(), ConnectionError> {
        match self.connect().await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(
                    store = %self.store.connection_string(),
                    attempt = self.attempts,
                    max = self.policy.max_attempts,
                    error = %e,
                    "connect attempt failed"
                );
                self.reconnect(stop).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::mock::{ConnectBehavior, MockDriver};
    use tokio::time::Instant;

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            backoff: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(30),
        }
    }

    fn store() -> StoreConfig {
        StoreConfig::new("10.0.0.1", 3050, "loja01")
    }

    #[tokio::test(start_paused = true)]
    async fn budget_counts_every_attempt_including_the_first() {
        let driver = MockDriver::new().with_default_connect(ConnectBehavior::AlwaysFail);
        let mut conn = Connection::new(Arc::new(driver.clone()), store(), policy(3));
        let (_tx, mut rx) = watch::channel(false);

        let t0 = Instant::now();
        let err = conn.establish(&mut rx).await.unwrap_err();
        assert!(matches!(err, ConnectionError::RetryExhausted { attempts: 3 }));
        assert_eq!(driver.connect_attempts("loja01"), 3);
        // two backoffs between three attempts
        assert!(t0.elapsed() >= Duration::from_secs(10));

        // exhausted for good: no further attempts reach the driver
        assert!(conn.reconnect(&mut rx).await.is_err());
        assert!(conn.connect().await.is_err());
        assert_eq!(driver.connect_attempts("loja01"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn budget_is_shared_across_reconnects() {
        let driver = MockDriver::new().with_default_connect(ConnectBehavior::FailFirst(1));
        let mut conn = Connection::new(Arc::new(driver.clone()), store(), policy(3));
        let (_tx, mut rx) = watch::channel(false);

        conn.establish(&mut rx).await.unwrap();
        assert_eq!(conn.attempts(), 2);
        conn.reconnect(&mut rx).await.unwrap();
        assert_eq!(conn.attempts(), 3);
        assert!(conn.is_exhausted());
        assert!(matches!(
            conn.reconnect(&mut rx).await,
            Err(ConnectionError::RetryExhausted { attempts: 3 })
        ));
        assert!(!conn.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_cancels_backoff() {
        let driver = MockDriver::new().with_default_connect(ConnectBehavior::AlwaysFail);
        let mut conn = Connection::new(Arc::new(driver.clone()), store(), policy(10));
        let (tx, mut rx) = watch::channel(false);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            tx.send_replace(true);
        });
        assert!(matches!(conn.establish(&mut rx).await, Err(ConnectionError::Cancelled)));
        assert_eq!(driver.connect_attempts("loja01"), 1);
    }

    #[tokio::test]
    async fn execute_without_session_asks_for_reconnect() {
        let mut conn = Connection::new(Arc::new(MockDriver::new()), store(), policy(1));
        let err = conn.execute("SELECT 1").await.unwrap_err();
        assert!(err.requires_reconnect());
        conn.connect().await.unwrap();
        assert_eq!(conn.execute("SELECT 1").await.unwrap(), 1);
        conn.close().await;
        assert!(!conn.is_connected());
    }
}
