// Periodic pool maintenance
//
// One ticker drives the three sweeps sequentially, in a fixed order, so pool
// mutations from different sweeps never interleave: scale-down first, then
// prewarm, then health check.

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::orchestration::pool::WorkerPool;

pub const MONITOR_INTERVAL: Duration = Duration::from_secs(30);

/// Runs the maintenance loop until cancellation.
pub async fn run_monitor(pool: Arc<WorkerPool>, cancel: CancellationToken) {
    run_monitor_with_interval(pool, cancel, MONITOR_INTERVAL).await
}

async fn run_monitor_with_interval(
    pool: Arc<WorkerPool>,
    cancel: CancellationToken,
    interval: Duration,
) {
    info!("processor monitor started");
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick fires immediately; the pool was just initialized, so
    // skip it.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                debug!("running periodic processor check");
                pool.scale_down().await;
                pool.prewarm().await;
                pool.health_check().await;
            }
            _ = cancel.cancelled() => {
                info!("processor monitor shutting down");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::Config;
    use crate::services::engine::testing::MockFactory;
    use std::sync::atomic::Ordering;

    #[tokio::test]
    async fn test_monitor_runs_sweeps_and_stops_on_cancel() {
        let mut config = Config::default();
        config.pool.min_processors = 1;
        config.pool.max_processors = 4;
        config.pool.warm_up_count = 2;
        let config = Arc::new(config);

        let factory = MockFactory::new();
        let counters = factory.counters.clone();
        let pool = Arc::new(WorkerPool::new(config, Arc::new(factory)));
        pool.initialize().await.unwrap();

        let cancel = CancellationToken::new();
        let monitor = tokio::spawn(run_monitor_with_interval(
            pool.clone(),
            cancel.clone(),
            Duration::from_millis(20),
        ));

        // Give the loop time for at least one full sweep; the health check
        // probes every worker.
        tokio::time::sleep(Duration::from_millis(60)).await;
        cancel.cancel();
        monitor.await.unwrap();

        assert!(counters.recognitions.load(Ordering::SeqCst) >= 3);
        let gauges = pool.gauges();
        assert_eq!(gauges.idle_processors, 2);
    }
}
