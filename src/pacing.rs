use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;

/// Sleep for `dur` unless `stop` flips first. Returns `false` when stopped.
pub async fn sleep_or_stop(dur: Duration, stop: &mut watch::Receiver<bool>) -> bool {
    if *stop.borrow() {
        return false;
    }
    if dur.is_zero() {
        // Still a scheduling point, or a driver that never awaits starves the runtime.
        tokio::task::yield_now().await;
        return !*stop.borrow();
    }
    let stopped = tokio::select! {
        _ = sleep(dur) => false,
        // A dropped sender also ends the wait.
        _ = stop.wait_for(|s| *s) => true,
    };
    !stopped && !*stop.borrow()
}

/// Fixed delay between executions (closed loop, not a token bucket):
/// per-worker throughput is about 1 / (execution time + interval).
#[derive(Clone, Copy, Debug)]
pub struct FixedDelay {
    interval: Duration,
}

impl FixedDelay {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    /// Wait out the interval; `false` means stop was requested.
    pub async fn pause(&self, stop: &mut watch::Receiver<bool>) -> bool {
        sleep_or_stop(self.interval, stop).await
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}
