use hdrhistogram::Histogram;
use serde::Serialize;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::time::Duration;

/// Lifecycle of a query worker.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Idle,
    Connecting,
    Running,
    Stopped,
}

impl WorkerState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Idle,
            1 => Self::Connecting,
            2 => Self::Running,
            _ => Self::Stopped,
        }
    }
}

/// Counters owned by one worker task and read by snapshot walkers.
///
/// Only the worker writes; readers get relaxed, approximate values.
#[derive(Debug)]
pub struct WorkerCounters {
    executed: AtomicU64,
    errors: AtomicU64,
    reconnects: AtomicU64,
    state: AtomicU8,
}

impl Default for WorkerCounters {
    fn default() -> Self {
        Self {
            executed: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            state: AtomicU8::new(WorkerState::Idle as u8),
        }
    }
}

impl WorkerCounters {
    pub fn record_executed(&self) -> u64 {
        self.executed.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_state(&self, state: WorkerState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn executed(&self) -> u64 {
        self.executed.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    pub fn reconnects(&self) -> u64 {
        self.reconnects.load(Ordering::Relaxed)
    }
}

/// Execution latency histogram shared by every worker of one endpoint.
pub struct LatencyRecorder {
    // 1µs to 10min, 3 significant digits
    hist: Mutex<Histogram<u64>>,
}

impl Default for LatencyRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl LatencyRecorder {
    const MAX_MICROS: u64 = 600_000_000;

    pub fn new() -> Self {
        Self {
            hist: Mutex::new(empty_histogram()),
        }
    }

    /// Record one execution. The recorder is shared by every worker on an
    /// endpoint, so the sample is dropped silently whenever the lock is held,
    /// by a snapshot reader or by another worker recording at the same moment.
    /// Latency figures are a sample; execution counts live in `WorkerCounters`.
    pub fn record(&self, elapsed: Duration) {
        let micros = (elapsed.as_micros() as u64).clamp(1, Self::MAX_MICROS);
        if let Ok(mut hist) = self.hist.try_lock() {
            let _ = hist.record(micros);
        }
    }

    pub fn summary(&self) -> LatencySummary {
        let hist = self.hist.lock().unwrap_or_else(|e| e.into_inner());
        LatencySummary::from_histogram(&hist)
    }

    /// Fold this recorder's samples into `into`.
    pub fn merge_into(&self, into: &mut Histogram<u64>) {
        let hist = self.hist.lock().unwrap_or_else(|e| e.into_inner());
        let _ = into.add(&*hist);
    }
}

/// Latency percentiles in microseconds.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct LatencySummary {
    pub samples: u64,
    pub p50_us: u64,
    pub p95_us: u64,
    pub p99_us: u64,
    pub max_us: u64,
    pub mean_us: f64,
}

impl LatencySummary {
    pub fn from_histogram(hist: &Histogram<u64>) -> Self {
        if hist.is_empty() {
            return Self::default();
        }
        Self {
            samples: hist.len(),
            p50_us: hist.value_at_quantile(0.5),
            p95_us: hist.value_at_quantile(0.95),
            p99_us: hist.value_at_quantile(0.99),
            max_us: hist.max(),
            mean_us: hist.mean(),
        }
    }
}

/// Empty histogram with the same bounds as [`LatencyRecorder`].
pub fn empty_histogram() -> Histogram<u64> {
    Histogram::new_with_bounds(1, LatencyRecorder::MAX_MICROS, 3).expect("static histogram bounds")
}
