//! Database driver abstraction: trait, error type, and builder factory.

pub mod config;
#[cfg(any(test, feature = "driver-mock"))]
pub mod mock;
#[cfg(feature = "driver-postgres")]
pub mod postgres;

use crate::store::StoreConfig;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DriverKind {
    Postgres,
    #[cfg(any(test, feature = "driver-mock"))]
    Mock,
}

#[derive(Clone, Debug, Default)]
pub struct ConnectOptions {
    pub params: BTreeMap<String, String>,
}

impl ConnectOptions {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }
}

#[derive(thiserror::Error, Debug, Clone)]
pub enum DriverError {
    #[error("connect: {0}")]
    Connect(String),
    #[error("execute: {0}")]
    Execute(String),
    #[error("timeout")]
    Timeout,
    #[error("disconnected")]
    Disconnected,
    #[error("other: {0}")]
    Other(String),
}

impl DriverError {
    /// Whether the session is unusable after this error.
    pub fn requires_reconnect(&self) -> bool {
        matches!(self, Self::Timeout | Self::Disconnected)
    }
}

/// Opens sessions against individual stores.
#[async_trait::async_trait]
pub trait Driver: Send + Sync {
    fn name(&self) -> &'static str;
    async fn open(&self, store: &StoreConfig) -> Result<Box<dyn Session>, DriverError>;
    /// Cheap statement used by the preflight probe.
    fn probe_sql(&self) -> &str {
        "SELECT 1"
    }
}

/// One live connection to one store.
#[async_trait::async_trait]
pub trait Session: Send {
    /// Run `sql` and drain its result set; returns the row count.
    async fn execute(&mut self, sql: &str) -> Result<u64, DriverError>;
    async fn close(self: Box<Self>) -> Result<(), DriverError>;
}

pub struct DriverBuilder;

impl DriverBuilder {
    pub fn build(kind: DriverKind, opts: ConnectOptions) -> Result<Arc<dyn Driver>, DriverError> {
        match kind {
            DriverKind::Postgres => {
                #[cfg(feature = "driver-postgres")]
                {
                    Ok(Arc::new(crate::driver::postgres::PostgresDriver::new(opts)))
                }
                #[cfg(not(feature = "driver-postgres"))]
                {
                    let _ = opts;
                    Err(DriverError::Connect("postgres feature disabled".into()))
                }
            }
            #[cfg(any(test, feature = "driver-mock"))]
            DriverKind::Mock => Ok(Arc::new(crate::driver::mock::MockDriver::from_options(&opts))),
        }
    }
}
