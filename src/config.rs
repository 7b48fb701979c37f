//! Runtime settings, load profiles, and the query catalog.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Load profile presets.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoadProfile {
    Normal,
    HighLoad,
}

/// Tunables for admission, pacing, and retry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoadSettings {
    /// Ceiling on concurrently admitted stores per endpoint
    pub max_concurrency_per_endpoint: usize,
    /// Workers per store, divided across the distinct queries
    pub threads_per_store: usize,
    /// Fixed pause after each execution (ms)
    pub execution_interval_ms: u64,
    /// Supervisor poll interval (ms)
    pub queue_poll_interval_ms: u64,
    /// Connect attempts per connection lifetime, initial attempt included
    pub connection_retry_count: u32,
    /// Pause before each reconnect attempt (ms)
    pub connection_retry_backoff_ms: u64,
    /// Per-attempt connect timeout (ms)
    pub connect_timeout_ms: u64,
    pub worker_join_timeout_ms: u64,
    pub supervisor_join_timeout_ms: u64,
    /// Pause after a failed supervisor iteration (ms)
    pub fault_retry_delay_ms: u64,
    /// Force rotation of a store after this many seconds admitted
    pub max_dwell_secs: Option<u64>,
    /// Probe one store per endpoint before starting
    pub preflight: bool,
    pub preflight_max_endpoints: usize,
}

impl Default for LoadSettings {
    fn default() -> Self {
        Self {
            max_concurrency_per_endpoint: 3,
            threads_per_store: 3,
            execution_interval_ms: 20,
            queue_poll_interval_ms: 2_000,
            connection_retry_count: 3,
            connection_retry_backoff_ms: 5_000,
            connect_timeout_ms: 30_000,
            worker_join_timeout_ms: 5_000,
            supervisor_join_timeout_ms: 10_000,
            fault_retry_delay_ms: 1_000,
            max_dwell_secs: None,
            preflight: false,
            preflight_max_endpoints: 10,
        }
    }
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be at least 1")]
    Zero(&'static str),
    #[error("query catalog is empty")]
    NoQueries,
    #[error("duplicate query name {0:?}")]
    DuplicateQuery(String),
    #[error("query {0:?} has empty SQL")]
    EmptySql(String),
}

impl LoadSettings {
    pub fn for_profile(profile: LoadProfile) -> Self {
        match profile {
            LoadProfile::Normal => Self::default(),
            LoadProfile::HighLoad => Self {
                threads_per_store: 5,
                ..Self::default()
            },
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrency_per_endpoint == 0 {
            return Err(ConfigError::Zero("max_concurrency_per_endpoint"));
        }
        if self.threads_per_store == 0 {
            return Err(ConfigError::Zero("threads_per_store"));
        }
        if self.connection_retry_count == 0 {
            return Err(ConfigError::Zero("connection_retry_count"));
        }
        if self.queue_poll_interval_ms == 0 {
            return Err(ConfigError::Zero("queue_poll_interval_ms"));
        }
        if self.max_dwell_secs == Some(0) {
            return Err(ConfigError::Zero("max_dwell_secs"));
        }
        Ok(())
    }

    pub fn execution_interval(&self) -> Duration {
        Duration::from_millis(self.execution_interval_ms)
    }

    pub fn queue_poll_interval(&self) -> Duration {
        Duration::from_millis(self.queue_poll_interval_ms)
    }

    pub fn connection_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.connection_retry_backoff_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn worker_join_timeout(&self) -> Duration {
        Duration::from_millis(self.worker_join_timeout_ms)
    }

    pub fn supervisor_join_timeout(&self) -> Duration {
        Duration::from_millis(self.supervisor_join_timeout_ms)
    }

    pub fn fault_retry_delay(&self) -> Duration {
        Duration::from_millis(self.fault_retry_delay_ms)
    }

    pub fn max_dwell(&self) -> Option<Duration> {
        self.max_dwell_secs.map(Duration::from_secs)
    }

    /// Workers spawned per query: the per-store budget split evenly, at least one.
    pub fn replicas_per_query(&self, query_count: usize) -> usize {
        if query_count == 0 {
            return 0;
        }
        (self.threads_per_store / query_count).max(1)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryDefinition {
    pub name: String,
    pub sql: String,
}

impl QueryDefinition {
    pub fn new(name: impl Into<String>, sql: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sql: sql.into(),
        }
    }
}

/// Named statements every store is loaded with.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryCatalog {
    queries: Vec<QueryDefinition>,
}

impl QueryCatalog {
    pub fn new(queries: Vec<QueryDefinition>) -> Self {
        Self { queries }
    }

    /// Parse `name=SQL` pairs as given on the command line.
    pub fn from_pairs(pairs: &[String]) -> Result<Self> {
        let mut queries = Vec::with_capacity(pairs.len());
        for p in pairs {
            let (name, sql) = p
                .split_once('=')
                .with_context(|| format!("query {:?} is not name=SQL", p))?;
            queries.push(QueryDefinition::new(name.trim(), sql.trim()));
        }
        Ok(Self { queries })
    }

    pub fn extend(&mut self, other: QueryCatalog) {
        self.queries.extend(other.queries);
    }

    pub fn len(&self) -> usize {
        self.queries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &QueryDefinition> {
        self.queries.iter()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queries.is_empty() {
            return Err(ConfigError::NoQueries);
        }
        for (i, q) in self.queries.iter().enumerate() {
            if q.sql.trim().is_empty() {
                return Err(ConfigError::EmptySql(q.name.clone()));
            }
            if self.queries[..i].iter().any(|p| p.name == q.name) {
                return Err(ConfigError::DuplicateQuery(q.name.clone()));
            }
        }
        Ok(())
    }
}

/// Contents of a YAML run file.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunFile {
    pub settings: LoadSettings,
    pub queries: QueryCatalog,
}

impl RunFile {
    pub fn from_yaml(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("invalid run file")
    }

    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading run file {}", path.display()))?;
        Self::from_yaml(&text).with_context(|| format!("parsing {}", path.display()))
    }
}
