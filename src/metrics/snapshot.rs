//! Fixed statistics records, one per level, composed by summation.

use crate::metrics::stats::{LatencySummary, WorkerState};
use crate::queue::QueueStatus;
use crate::store::EndpointKey;
use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Clone, Debug, Serialize)]
pub struct WorkerStats {
    pub query_name: String,
    pub index: usize,
    pub state: WorkerState,
    pub executed: u64,
    pub errors: u64,
    pub reconnects: u64,
}

impl WorkerStats {
    pub fn is_active(&self) -> bool {
        self.state != WorkerState::Stopped
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct QueryStats {
    pub query_name: String,
    pub executed: u64,
    pub errors: u64,
    pub active_workers: usize,
    pub total_workers: usize,
}

impl QueryStats {
    fn add(&mut self, w: &WorkerStats) {
        self.executed += w.executed;
        self.errors += w.errors;
        self.total_workers += 1;
        if w.is_active() {
            self.active_workers += 1;
        }
    }
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct StoreStats {
    pub store_name: String,
    pub queries: Vec<QueryStats>,
    pub executed: u64,
    pub errors: u64,
    pub active_workers: usize,
    pub total_workers: usize,
    /// Workers holding a live connection.
    pub connected_workers: usize,
}

impl StoreStats {
    /// Sum worker figures per query (first-seen query order) and in total.
    pub fn from_workers(store_name: &str, workers: &[WorkerStats]) -> Self {
        let mut stats = StoreStats {
            store_name: store_name.to_string(),
            ..StoreStats::default()
        };
        for w in workers {
            let idx = match stats.queries.iter().position(|q| q.query_name == w.query_name) {
                Some(i) => i,
                None => {
                    stats.queries.push(QueryStats {
                        query_name: w.query_name.clone(),
                        ..QueryStats::default()
                    });
                    stats.queries.len() - 1
                }
            };
            stats.queries[idx].add(w);
            stats.executed += w.executed;
            stats.errors += w.errors;
            stats.total_workers += 1;
            if w.is_active() {
                stats.active_workers += 1;
            }
            if w.state == WorkerState::Running {
                stats.connected_workers += 1;
            }
        }
        stats
    }
}

/// Running tallies a supervisor keeps across admissions.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct EndpointLifetime {
    pub admissions: u64,
    pub reaped: u64,
    /// Work done by groups that have since been released.
    pub retired_executed: u64,
    pub retired_errors: u64,
}

#[derive(Clone, Debug, Serialize)]
pub struct EndpointStats {
    pub endpoint: EndpointKey,
    pub stores: Vec<StoreStats>,
    /// Live groups only.
    pub executed: u64,
    pub errors: u64,
    /// Live plus retired groups.
    pub executed_total: u64,
    pub errors_total: u64,
    pub active_workers: usize,
    pub total_workers: usize,
    pub connected_workers: usize,
    pub active_stores: usize,
    pub queue: QueueStatus,
    pub lifetime: EndpointLifetime,
    pub latency: LatencySummary,
}

impl EndpointStats {
    pub fn new(
        endpoint: EndpointKey,
        stores: Vec<StoreStats>,
        queue: QueueStatus,
        lifetime: EndpointLifetime,
        latency: LatencySummary,
    ) -> Self {
        let mut out = Self {
            endpoint,
            executed: 0,
            errors: 0,
            executed_total: lifetime.retired_executed,
            errors_total: lifetime.retired_errors,
            active_workers: 0,
            total_workers: 0,
            connected_workers: 0,
            active_stores: stores.len(),
            queue,
            lifetime,
            latency,
            stores: Vec::new(),
        };
        for s in &stores {
            out.executed += s.executed;
            out.errors += s.errors;
            out.executed_total += s.executed;
            out.errors_total += s.errors;
            out.active_workers += s.active_workers;
            out.total_workers += s.total_workers;
            out.connected_workers += s.connected_workers;
        }
        out.stores = stores;
        out
    }

    pub fn utilization_pct(&self) -> f64 {
        if self.queue.max_concurrency == 0 {
            0.0
        } else {
            self.active_stores as f64 / self.queue.max_concurrency as f64 * 100.0
        }
    }
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct GlobalTotals {
    pub executed: u64,
    pub errors: u64,
    pub executed_total: u64,
    pub errors_total: u64,
    pub active_workers: usize,
    pub total_workers: usize,
    pub connected_workers: usize,
    pub endpoints: usize,
    /// Endpoints with at least one admitted store.
    pub active_endpoints: usize,
    pub active_stores: usize,
    pub queued_stores: usize,
    pub max_concurrency_per_endpoint: usize,
    pub latency: LatencySummary,
}

#[derive(Clone, Debug, Serialize)]
pub struct GlobalSnapshot {
    pub taken_at: DateTime<Utc>,
    pub running: bool,
    pub endpoints: Vec<EndpointStats>,
    pub totals: GlobalTotals,
}

impl GlobalSnapshot {
    pub fn new(
        running: bool,
        endpoints: Vec<EndpointStats>,
        max_concurrency_per_endpoint: usize,
        latency: LatencySummary,
    ) -> Self {
        let mut totals = GlobalTotals {
            endpoints: endpoints.len(),
            max_concurrency_per_endpoint,
            latency,
            ..GlobalTotals::default()
        };
        for ep in &endpoints {
            totals.executed += ep.executed;
            totals.errors += ep.errors;
            totals.executed_total += ep.executed_total;
            totals.errors_total += ep.errors_total;
            totals.active_workers += ep.active_workers;
            totals.total_workers += ep.total_workers;
            totals.connected_workers += ep.connected_workers;
            totals.active_stores += ep.active_stores;
            totals.queued_stores += ep.queue.pending;
            if ep.active_stores > 0 {
                totals.active_endpoints += 1;
            }
        }
        Self {
            taken_at: Utc::now(),
            running,
            endpoints,
            totals,
        }
    }

    pub fn empty(max_concurrency_per_endpoint: usize) -> Self {
        Self::new(false, Vec::new(), max_concurrency_per_endpoint, LatencySummary::default())
    }
}

/// One row of the endpoint ranking.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct EndpointSummary {
    pub endpoint: EndpointKey,
    pub active_stores: usize,
    pub queued_stores: usize,
    pub executed_total: u64,
    pub errors_total: u64,
    pub active_workers: usize,
    pub connected_workers: usize,
    pub max_concurrency: usize,
    pub utilization_pct: f64,
}

impl From<&EndpointStats> for EndpointSummary {
    fn from(ep: &EndpointStats) -> Self {
        Self {
            endpoint: ep.endpoint.clone(),
            active_stores: ep.active_stores,
            queued_stores: ep.queue.pending,
            executed_total: ep.executed_total,
            errors_total: ep.errors_total,
            active_workers: ep.active_workers,
            connected_workers: ep.connected_workers,
            max_concurrency: ep.queue.max_concurrency,
            utilization_pct: ep.utilization_pct(),
        }
    }
}

/// Rank endpoints by lifetime executed count, busiest first; ties by endpoint key.
pub fn rank_endpoints(endpoints: &[EndpointStats]) -> Vec<EndpointSummary> {
    let mut rows: Vec<EndpointSummary> = endpoints.iter().map(EndpointSummary::from).collect();
    rows.sort_by(|a, b| {
        b.executed_total
            .cmp(&a.executed_total)
            .then_with(|| a.endpoint.cmp(&b.endpoint))
    });
    rows
}
