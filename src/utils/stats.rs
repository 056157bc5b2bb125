use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Request counters shared across handlers and task units.
///
/// Thread-safe and cheap to clone; every task completion records its elapsed
/// time and outcome here.
#[derive(Clone)]
pub struct ServerStats {
    inner: Arc<StatsInner>,
}

struct StatsInner {
    total_requests: AtomicI64,
    successful_requests: AtomicI64,
    failed_requests: AtomicI64,
    // Running mean of processing time, in nanoseconds. Updated with a CAS
    // loop so concurrent completions never lose an update.
    avg_processing_nanos: AtomicU64,
}

impl ServerStats {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(StatsInner {
                total_requests: AtomicI64::new(0),
                successful_requests: AtomicI64::new(0),
                failed_requests: AtomicI64::new(0),
                avg_processing_nanos: AtomicU64::new(0),
            }),
        }
    }

    /// Record one completed task: bumps the counters and folds the elapsed
    /// time into the running mean.
    pub fn record(&self, elapsed: Duration, success: bool) {
        let total = self.inner.total_requests.fetch_add(1, Ordering::SeqCst) + 1;
        if success {
            self.inner.successful_requests.fetch_add(1, Ordering::SeqCst);
        } else {
            self.inner.failed_requests.fetch_add(1, Ordering::SeqCst);
        }

        let sample = elapsed.as_nanos().min(u128::from(u64::MAX)) as i128;
        let _ = self.inner.avg_processing_nanos.fetch_update(
            Ordering::SeqCst,
            Ordering::SeqCst,
            |old| {
                let old = i128::from(old);
                let next = old + (sample - old) / i128::from(total);
                Some(next.clamp(0, i128::from(u64::MAX)) as u64)
            },
        );
    }

    pub fn total_requests(&self) -> i64 {
        self.inner.total_requests.load(Ordering::SeqCst)
    }

    pub fn successful_requests(&self) -> i64 {
        self.inner.successful_requests.load(Ordering::SeqCst)
    }

    pub fn failed_requests(&self) -> i64 {
        self.inner.failed_requests.load(Ordering::SeqCst)
    }

    pub fn average_processing_time(&self) -> Duration {
        Duration::from_nanos(self.inner.avg_processing_nanos.load(Ordering::SeqCst))
    }

    /// Failed share of all completed requests, as a percentage.
    pub fn error_rate(&self) -> f64 {
        let total = self.total_requests();
        if total == 0 {
            return 0.0;
        }
        self.failed_requests() as f64 / total as f64 * 100.0
    }
}

impl Default for ServerStats {
    fn default() -> Self {
        Self::new()
    }
}
