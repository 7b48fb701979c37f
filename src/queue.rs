//! Per-endpoint admission control with rotation.
//!
//! Every endpoint keeps three disjoint collections of stores: a `pending`
//! FIFO, an `active` set capped at `max_concurrency`, and a `processed` set.
//! When a release leaves both `pending` and `active` empty, `processed` is
//! moved back into `pending`; that refill is what keeps every store cycling.

use crate::store::{EndpointKey, StoreConfig, partition_by_endpoint};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use tracing::{debug, info};

/// Point-in-time view of one endpoint queue.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct QueueStatus {
    pub pending: usize,
    pub active: usize,
    pub processed: usize,
    pub max_concurrency: usize,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<StoreConfig>,
    active: HashMap<String, StoreConfig>,
    processed: HashMap<String, StoreConfig>,
}

/// Count mirrors so status reads never take the queue lock.
#[derive(Default)]
struct QueueCounts {
    pending: AtomicUsize,
    active: AtomicUsize,
    processed: AtomicUsize,
}

struct EndpointQueue {
    state: Mutex<QueueState>,
    counts: QueueCounts,
}

impl EndpointQueue {
    fn new(stores: Vec<StoreConfig>) -> Self {
        let queue = Self {
            state: Mutex::new(QueueState {
                pending: stores.into(),
                ..QueueState::default()
            }),
            counts: QueueCounts::default(),
        };
        queue.publish(&queue.lock());
        queue
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        // A panic while holding the lock cannot leave a store in two
        // collections (every mutation is a single move), so keep going.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn publish(&self, state: &QueueState) {
        self.counts.pending.store(state.pending.len(), Ordering::Relaxed);
        self.counts.active.store(state.active.len(), Ordering::Relaxed);
        self.counts.processed.store(state.processed.len(), Ordering::Relaxed);
    }
}

pub struct QueueManager {
    max_concurrency: usize,
    queues: RwLock<HashMap<EndpointKey, Arc<EndpointQueue>>>,
    order: RwLock<Vec<EndpointKey>>,
}

impl QueueManager {
    pub fn new(max_concurrency: usize) -> Self {
        Self {
            max_concurrency,
            queues: RwLock::new(HashMap::new()),
            order: RwLock::new(Vec::new()),
        }
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    /// Replace all queues with a fresh partition of `stores`.
    ///
    /// Callers must stop every supervisor first; in-flight releases against
    /// the old partition are simply dropped.
    pub fn initialize(&self, stores: &[StoreConfig]) {
        let mut seen: HashSet<(EndpointKey, &str)> = HashSet::new();
        let unique: Vec<StoreConfig> = stores
            .iter()
            .filter(|&store| {
                let fresh = seen.insert((store.endpoint(), store.store_name.as_str()));
                if !fresh {
                    debug!(store = %store, "duplicate store entry ignored");
                }
                fresh
            })
            .cloned()
            .collect();
        let partition = partition_by_endpoint(&unique);

        let mut queues = HashMap::with_capacity(partition.len());
        let mut order = Vec::with_capacity(partition.len());
        for (key, list) in partition {
            info!(endpoint = %key, stores = list.len(), "endpoint queue initialized");
            order.push(key.clone());
            queues.insert(key, Arc::new(EndpointQueue::new(list)));
        }
        info!(
            endpoints = order.len(),
            max_concurrency = self.max_concurrency,
            "admission queues ready"
        );

        *self.queues.write().unwrap_or_else(|e| e.into_inner()) = queues;
        *self.order.write().unwrap_or_else(|e| e.into_inner()) = order;
    }

    /// Endpoints in the order they first appeared in the store list.
    pub fn endpoints(&self) -> Vec<EndpointKey> {
        self.order.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn queue(&self, endpoint: &EndpointKey) -> Option<Arc<EndpointQueue>> {
        self.queues
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(endpoint)
            .cloned()
    }

    /// Admit the next pending store, unless the endpoint is at its ceiling.
    pub fn acquire_next(&self, endpoint: &EndpointKey) -> Option<StoreConfig> {
        let queue = self.queue(endpoint)?;
        let mut state = queue.lock();
        if state.active.len() >= self.max_concurrency {
            return None;
        }
        let store = state.pending.pop_front()?;
        state.active.insert(store.store_name.clone(), store.clone());
        debug!(
            endpoint = %endpoint,
            store = %store.store_name,
            active = state.active.len(),
            max = self.max_concurrency,
            "store admitted"
        );
        queue.publish(&state);
        Some(store)
    }

    /// Move an active store to `processed`, refilling `pending` when the
    /// endpoint has drained. Unknown or inactive stores are ignored.
    pub fn release(&self, endpoint: &EndpointKey, store_name: &str) {
        let Some(queue) = self.queue(endpoint) else {
            return;
        };
        let mut state = queue.lock();
        let Some(store) = state.active.remove(store_name) else {
            return;
        };
        state.processed.insert(store.store_name.clone(), store);
        debug!(endpoint = %endpoint, store = %store_name, "store released");

        if state.pending.is_empty() && state.active.is_empty() {
            let mut refill: Vec<StoreConfig> = state.processed.drain().map(|(_, s)| s).collect();
            refill.sort_by(|a, b| a.store_name.cmp(&b.store_name));
            info!(endpoint = %endpoint, stores = refill.len(), "queue rotated");
            state.pending.extend(refill);
        }
        queue.publish(&state);
    }

    pub fn status_snapshot(&self, endpoint: &EndpointKey) -> QueueStatus {
        let Some(queue) = self.queue(endpoint) else {
            return QueueStatus {
                max_concurrency: self.max_concurrency,
                ..QueueStatus::default()
            };
        };
        QueueStatus {
            pending: queue.counts.pending.load(Ordering::Relaxed),
            active: queue.counts.active.load(Ordering::Relaxed),
            processed: queue.counts.processed.load(Ordering::Relaxed),
            max_concurrency: self.max_concurrency,
        }
    }

    pub fn status_all(&self) -> BTreeMap<EndpointKey, QueueStatus> {
        self.endpoints()
            .into_iter()
            .map(|key| {
                let status = self.status_snapshot(&key);
                (key, status)
            })
            .collect()
    }

    #[cfg(test)]
    fn names(&self, endpoint: &EndpointKey) -> (Vec<String>, Vec<String>, Vec<String>) {
        let queue = self.queue(endpoint).unwrap();
        let state = queue.lock();
        let pending = state.pending.iter().map(|s| s.store_name.clone()).collect();
        let mut active: Vec<String> = state.active.keys().cloned().collect();
        let mut processed: Vec<String> = state.processed.keys().cloned().collect();
        active.sort();
        processed.sort();
        (pending, active, processed)
    }
}
