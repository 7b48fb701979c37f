//! Preflight connectivity check, one store per endpoint.

use crate::driver::Driver;
use crate::store::{EndpointKey, StoreConfig, partition_by_endpoint};
use futures::future::join_all;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, timeout};
use tracing::{info, warn};

#[derive(Clone, Debug, Serialize)]
pub struct ProbeResult {
    pub endpoint: EndpointKey,
    pub store: String,
    pub ok: bool,
    pub message: String,
    pub elapsed_ms: u64,
}

/// Open a session to the first store of each endpoint (at most
/// `max_endpoints`), run the driver's probe statement, close. Never fails;
/// problems come back as `ok == false`.
pub async fn probe_endpoints(
    driver: Arc<dyn Driver>,
    stores: &[StoreConfig],
    max_endpoints: usize,
    limit: Duration,
) -> Vec<ProbeResult> {
    let targets: Vec<(EndpointKey, StoreConfig)> = partition_by_endpoint(stores)
        .into_iter()
        .take(max_endpoints)
        .filter_map(|(key, list)| list.into_iter().next().map(|s| (key, s)))
        .collect();
    info!(endpoints = targets.len(), driver = driver.name(), "probing endpoints");

    let results = join_all(targets.into_iter().map(|(endpoint, store)| {
        let driver = driver.clone();
        async move {
            let started = Instant::now();
            let outcome = timeout(limit, probe_one(driver.as_ref(), &store)).await;
            let (ok, message) = match outcome {
                Ok(Ok(rows)) => (true, format!("{rows} row(s)")),
                Ok(Err(e)) => (false, e),
                Err(_) => (false, format!("timed out after {}ms", limit.as_millis())),
            };
            let result = ProbeResult {
                endpoint,
                store: store.store_name.clone(),
                ok,
                message,
                elapsed_ms: started.elapsed().as_millis() as u64,
            };
            if result.ok {
                info!(endpoint = %result.endpoint, store = %result.store, elapsed_ms = result.elapsed_ms, "endpoint reachable");
            } else {
                warn!(endpoint = %result.endpoint, store = %result.store, message = %result.message, "endpoint probe failed");
            }
            result
        }
    }))
    .await;

    let reachable = results.iter().filter(|r| r.ok).count();
    info!(reachable, probed = results.len(), "probe finished");
    results
}

async fn probe_one(driver: &dyn Driver, store: &StoreConfig) -> Result<u64, String> {
    let mut session = driver.open(store).await.map_err(|e| e.to_string())?;
    let rows = session.execute(driver.probe_sql()).await.map_err(|e| e.to_string());
    session.close().await.ok();
    rows
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::mock::{ConnectBehavior, MockDriver};

    #[tokio::test(start_paused = true)]
    async fn one_store_per_endpoint_and_failures_reported() {
        let driver = MockDriver::new().with_store_connect("b1", ConnectBehavior::AlwaysFail);
        let stores = vec![
            StoreConfig::new("10.0.0.1", 3050, "a1"),
            StoreConfig::new("10.0.0.1", 3050, "a2"),
            StoreConfig::new("10.0.0.2", 3050, "b1"),
            StoreConfig::new("10.0.0.3", 3050, "c1"),
        ];
        let results = probe_endpoints(Arc::new(driver.clone()), &stores, 10, Duration::from_secs(5)).await;

        let seen: Vec<(&str, bool)> = results.iter().map(|r| (r.store.as_str(), r.ok)).collect();
        assert_eq!(seen, vec![("a1", true), ("b1", false), ("c1", true)]);
        assert_eq!(driver.connect_attempts("a2"), 0);
        assert_eq!(driver.open_sessions(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn respects_endpoint_cap_and_timeout() {
        let driver = MockDriver::new().with_execute_latency(Duration::from_secs(60));
        let stores: Vec<StoreConfig> = (1..=5)
            .map(|i| StoreConfig::new(format!("10.0.0.{i}"), 3050, format!("s{i}")))
            .collect();
        let results = probe_endpoints(Arc::new(driver), &stores, 2, Duration::from_secs(1)).await;
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| !r.ok && r.message.starts_with("timed out")));
    }
}
