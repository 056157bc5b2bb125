// Worker pool: two-list bookkeeping with LIFO reuse and on-demand creation
//
// Workers live in exactly one of two lists. `active` holds acquisition
// candidates (busy or not); `idle` holds the warm reserve awaiting reuse or
// retirement. List mutations happen under one mutex; waiting acquirers park
// on a Notify and re-check after every wakeup.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex as AsyncMutex, MutexGuard, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::config::Config;
use crate::core::errors::EngineResult;
use crate::services::engine::{self, Engine, EngineFactory, HEALTH_PROBE};

/// Bookkeeping record for one engine.
///
/// The engine slot is interior-mutable: repair swaps the subprocess handle in
/// place while every outstanding reference to the worker stays valid. The
/// engine lock serializes recognitions against the subprocess, which is not
/// reentrant.
pub struct Worker {
    engine: AsyncMutex<Box<dyn Engine>>,
    usage_count: AtomicI64,
    last_used: Mutex<Instant>,
    in_use: AtomicBool,
}

impl Worker {
    fn new(engine: Box<dyn Engine>) -> Arc<Self> {
        Arc::new(Self {
            engine: AsyncMutex::new(engine),
            usage_count: AtomicI64::new(0),
            last_used: Mutex::new(Instant::now()),
            in_use: AtomicBool::new(false),
        })
    }

    pub async fn lock_engine(&self) -> MutexGuard<'_, Box<dyn Engine>> {
        self.engine.lock().await
    }

    pub fn usage_count(&self) -> i64 {
        self.usage_count.load(Ordering::SeqCst)
    }

    pub fn in_use(&self) -> bool {
        self.in_use.load(Ordering::SeqCst)
    }

    /// Marks the start of one recognition attempt. Balanced by
    /// [`Worker::end_attempt`].
    pub fn begin_attempt(&self) {
        self.usage_count.fetch_add(1, Ordering::SeqCst);
    }

    pub fn end_attempt(&self) {
        self.usage_count.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn touch(&self) {
        *self.last_used.lock() = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_used.lock().elapsed()
    }
}

#[derive(Default)]
struct PoolInner {
    active: Vec<Arc<Worker>>,
    idle: Vec<Arc<Worker>>,
    /// On-demand creations in flight; counted against the processor cap so
    /// concurrent acquirers cannot overshoot it while the spawn runs
    /// off-lock.
    spawning: usize,
}

/// Point-in-time pool introspection for the stats endpoint.
#[derive(Debug, Clone, Copy)]
pub struct PoolGauges {
    pub active_processors: usize,
    pub in_use_processors: usize,
    pub idle_processors: usize,
    pub total_usage: i64,
}

/// Pool of OCR workers with on-demand growth up to the configured cap.
pub struct WorkerPool {
    inner: Mutex<PoolInner>,
    available: Notify,
    factory: Arc<dyn EngineFactory>,
    config: Arc<Config>,
}

impl WorkerPool {
    pub fn new(config: Arc<Config>, factory: Arc<dyn EngineFactory>) -> Self {
        Self {
            inner: Mutex::new(PoolInner::default()),
            available: Notify::new(),
            factory,
            config,
        }
    }

    pub fn factory(&self) -> &dyn EngineFactory {
        self.factory.as_ref()
    }

    /// Startup population: `min_processors` workers go straight into the
    /// active list and any failure there is fatal; the warm-up reserve is
    /// best-effort.
    pub async fn initialize(&self) -> EngineResult<()> {
        info!("initializing OCR processors...");

        for i in 0..self.config.min_processors() {
            let engine = self.factory.spawn().await?;
            self.inner.lock().active.push(Worker::new(engine));
            info!("processor {} initialized", i);
        }

        info!("prewarming standby processors...");
        for i in 0..self.config.warm_up_count() {
            match self.factory.spawn().await {
                Ok(engine) => {
                    self.inner.lock().idle.push(Worker::new(engine));
                    info!("standby processor {} ready", i);
                }
                Err(e) => {
                    warn!("unable to prewarm processor {}: {}", i, e);
                }
            }
        }

        let inner = self.inner.lock();
        info!(
            "{} active OCR processors initialized, {} standby processors ready",
            inner.active.len(),
            inner.idle.len()
        );
        Ok(())
    }

    /// Obtains a worker, preferring the warmest idle one (LIFO), creating a
    /// new one when below the cap, and otherwise waiting for a release.
    ///
    /// Returns `None` once `cancel` trips. Waiters are woken one at a time
    /// and compete; fairness is not promised.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Option<Arc<Worker>> {
        loop {
            // Register interest before re-checking state so a release
            // between the check and the await is never lost.
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let mut should_spawn = false;
            {
                let mut inner = self.inner.lock();
                if cancel.is_cancelled() {
                    return None;
                }
                if let Some(worker) = inner.idle.pop() {
                    worker.in_use.store(true, Ordering::SeqCst);
                    inner.active.push(worker.clone());
                    return Some(worker);
                }
                if inner.active.len() + inner.spawning < self.config.max_processors() {
                    inner.spawning += 1;
                    should_spawn = true;
                }
            }

            if should_spawn {
                match self.factory.spawn().await {
                    Ok(engine) => {
                        let worker = Worker::new(engine);
                        worker.in_use.store(true, Ordering::SeqCst);
                        let mut inner = self.inner.lock();
                        inner.spawning -= 1;
                        inner.active.push(worker.clone());
                        return Some(worker);
                    }
                    Err(e) => {
                        warn!("on-demand processor creation failed: {}", e);
                        self.inner.lock().spawning -= 1;
                        // fall through and wait for a release
                    }
                }
            }

            tokio::select! {
                _ = notified.as_mut() => {}
                _ = cancel.cancelled() => return None,
            }
        }
    }

    /// Returns a worker to the pool. Capacity above the configured floor
    /// drains eagerly to the idle list so the autoscaler can retire it.
    pub fn release(&self, worker: &Arc<Worker>) {
        {
            let mut inner = self.inner.lock();
            worker.in_use.store(false, Ordering::SeqCst);
            worker.touch();

            if inner.active.len() > self.config.min_processors() {
                if let Some(pos) = inner
                    .active
                    .iter()
                    .position(|candidate| Arc::ptr_eq(candidate, worker))
                {
                    let demoted = inner.active.remove(pos);
                    inner.idle.push(demoted);
                }
            }
        }
        self.available.notify_one();
    }

    /// Periodic scale-down: demote quiescent workers above the floor, then
    /// trim the idle list so total live workers stay within the cap.
    pub async fn scale_down(&self) {
        debug!("checking whether processors should be scaled down");

        let evicted = {
            let mut inner = self.inner.lock();

            let mut i = inner.active.len();
            while i > self.config.min_processors() {
                i -= 1;
                let worker = &inner.active[i];
                if worker.usage_count() <= self.config.degrade_threshold()
                    && worker.idle_for() > self.config.idle_timeout()
                {
                    let demoted = inner.active.remove(i);
                    inner.idle.push(demoted);
                    info!(
                        "processor moved to idle pool; active: {}, idle: {}",
                        inner.active.len(),
                        inner.idle.len()
                    );
                }
            }

            let max_idle = self
                .config
                .max_processors()
                .saturating_sub(inner.active.len());
            let mut evicted = Vec::new();
            while inner.idle.len() > max_idle {
                if let Some(worker) = inner.idle.pop() {
                    evicted.push(worker);
                }
            }
            evicted
        };

        for worker in evicted {
            worker.lock_engine().await.close().await;
            info!("closed surplus idle processor");
        }
    }

    /// Periodic prewarm: best-effort top-up of the idle reserve.
    pub async fn prewarm(&self) {
        let deficit = {
            let inner = self.inner.lock();
            self.config.warm_up_count().saturating_sub(inner.idle.len())
        };

        for _ in 0..deficit {
            match self.factory.spawn().await {
                Ok(engine) => {
                    let mut inner = self.inner.lock();
                    inner.idle.push(Worker::new(engine));
                    info!("prewarmed processor; total idle: {}", inner.idle.len());
                }
                Err(e) => {
                    warn!("unable to prewarm processor: {}", e);
                }
            }
        }
    }

    /// Periodic probe of every worker with a fixed payload; a transport
    /// failure repairs the engine in place.
    ///
    /// The lists are snapshotted so acquisitions are not stalled for the
    /// duration of the sweep; each probe still serializes on its worker's own
    /// engine lock.
    pub async fn health_check(&self) {
        debug!("starting health check of all processors");

        let snapshot: Vec<Arc<Worker>> = {
            let inner = self.inner.lock();
            inner
                .active
                .iter()
                .chain(inner.idle.iter())
                .cloned()
                .collect()
        };

        for (i, worker) in snapshot.iter().enumerate() {
            let mut engine = worker.lock_engine().await;
            match engine.recognize(HEALTH_PROBE).await {
                Ok(_) => debug!("processor {} passed health check", i),
                Err(e) => {
                    warn!("processor {} failed health check: {}", i, e);
                    match engine::repair(&mut engine, self.factory.as_ref()).await {
                        Ok(()) => info!("processor {} reinitialized", i),
                        Err(respawn) => {
                            warn!("unable to reinitialize processor {}: {}", i, respawn)
                        }
                    }
                }
            }
        }

        let inner = self.inner.lock();
        debug!(
            "health check finished; active: {}, idle: {}",
            inner.active.len(),
            inner.idle.len()
        );
    }

    pub fn gauges(&self) -> PoolGauges {
        let inner = self.inner.lock();
        PoolGauges {
            active_processors: inner.active.len(),
            in_use_processors: inner.active.iter().filter(|w| w.in_use()).count(),
            idle_processors: inner.idle.len(),
            total_usage: inner.active.iter().map(|w| w.usage_count()).sum(),
        }
    }

    /// Final cleanup: closes every engine in the active list, then the idle
    /// list, and clears both. A subprocess that fails to close cleanly is
    /// logged and skipped.
    pub async fn shutdown(&self) {
        info!("cleaning up processors...");

        let (active, idle) = {
            let mut inner = self.inner.lock();
            (
                std::mem::take(&mut inner.active),
                std::mem::take(&mut inner.idle),
            )
        };

        for (i, worker) in active.iter().enumerate() {
            info!("closing active processor {}", i);
            worker.lock_engine().await.close().await;
        }
        for (i, worker) in idle.iter().enumerate() {
            info!("closing idle processor {}", i);
            worker.lock_engine().await.close().await;
        }

        info!("all processors cleaned up");
    }
}

#[cfg(test)]
impl WorkerPool {
    /// Startup population without the warm-up phase, for tests that need to
    /// control the idle list independently.
    async fn initialize_floor(&self) -> EngineResult<()> {
        for _ in 0..self.config.min_processors() {
            let engine = self.factory.spawn().await?;
            self.inner.lock().active.push(Worker::new(engine));
        }
        Ok(())
    }

    fn last_idle(&self) -> Option<Arc<Worker>> {
        self.inner.lock().idle.last().cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::engine::testing::{MockCounters, MockFactory};
    use std::sync::atomic::Ordering as AtomicOrdering;

    fn test_config(min: usize, max: usize, warm_up: usize) -> Arc<Config> {
        let mut config = Config::default();
        config.pool.min_processors = min;
        config.pool.max_processors = max;
        config.pool.warm_up_count = warm_up;
        config.pool.degrade_threshold = 0;
        config.pool.idle_timeout = Duration::from_millis(10);
        Arc::new(config)
    }

    fn pool_with(
        config: Arc<Config>,
        factory: MockFactory,
    ) -> (Arc<WorkerPool>, Arc<MockCounters>) {
        let counters = factory.counters.clone();
        (
            Arc::new(WorkerPool::new(config, Arc::new(factory))),
            counters,
        )
    }

    #[tokio::test]
    async fn test_initialize_populates_both_lists() {
        let (pool, counters) = pool_with(test_config(2, 4, 1), MockFactory::new());
        pool.initialize().await.unwrap();

        let gauges = pool.gauges();
        assert_eq!(gauges.active_processors, 2);
        assert_eq!(gauges.idle_processors, 1);
        assert_eq!(gauges.in_use_processors, 0);
        assert_eq!(counters.spawned.load(AtomicOrdering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_initialize_fails_when_floor_worker_cannot_spawn() {
        let factory = MockFactory::new().with_spawn_failures(1);
        let (pool, _) = pool_with(test_config(2, 4, 0), factory);
        assert!(pool.initialize().await.is_err());
    }

    #[tokio::test]
    async fn test_warmup_failures_are_not_fatal() {
        let factory = MockFactory::new();
        let fail_spawns = factory.fail_spawns.clone();
        let (pool, counters) = pool_with(test_config(1, 6, 2), factory);

        pool.initialize_floor().await.unwrap();
        fail_spawns.store(1, AtomicOrdering::SeqCst);
        pool.prewarm().await;

        // One of the two warm-up spawns failed, the other succeeded.
        let gauges = pool.gauges();
        assert_eq!(gauges.active_processors, 1);
        assert_eq!(gauges.idle_processors, 1);
        assert_eq!(counters.spawned.load(AtomicOrdering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_acquire_prefers_idle_lifo() {
        let (pool, _) = pool_with(test_config(1, 4, 2), MockFactory::new());
        pool.initialize().await.unwrap();
        let last_idle = pool.last_idle().unwrap();

        let cancel = CancellationToken::new();
        let worker = pool.acquire(&cancel).await.unwrap();
        assert!(Arc::ptr_eq(&worker, &last_idle));
        assert!(worker.in_use());

        let gauges = pool.gauges();
        assert_eq!(gauges.active_processors, 2);
        assert_eq!(gauges.idle_processors, 1);
        assert_eq!(gauges.in_use_processors, 1);
    }

    #[tokio::test]
    async fn test_acquire_creates_on_demand_up_to_cap() {
        let (pool, counters) = pool_with(test_config(1, 3, 0), MockFactory::new());
        pool.initialize().await.unwrap();

        let cancel = CancellationToken::new();
        let w1 = pool.acquire(&cancel).await.unwrap();
        let w2 = pool.acquire(&cancel).await.unwrap();
        assert!(!Arc::ptr_eq(&w1, &w2));

        let gauges = pool.gauges();
        assert_eq!(gauges.active_processors, 3);
        assert_eq!(counters.spawned.load(AtomicOrdering::SeqCst), 3);

        // Cap reached: the next acquire must block until a release.
        let blocked =
            tokio::time::timeout(Duration::from_millis(50), pool.acquire(&cancel)).await;
        assert!(blocked.is_err());
    }

    #[tokio::test]
    async fn test_release_wakes_waiter_with_same_slot() {
        let (pool, _) = pool_with(test_config(1, 2, 1), MockFactory::new());
        pool.initialize().await.unwrap();

        let cancel = CancellationToken::new();
        let worker = pool.acquire(&cancel).await.unwrap();

        let waiter = {
            let pool = pool.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { pool.acquire(&cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        pool.release(&worker);
        let reacquired = waiter.await.unwrap().unwrap();
        // LIFO reuse hands the freshly released slot to the waiter.
        assert!(Arc::ptr_eq(&reacquired, &worker));
    }

    #[tokio::test]
    async fn test_release_demotes_above_floor_only() {
        let (pool, _) = pool_with(test_config(1, 3, 1), MockFactory::new());
        pool.initialize().await.unwrap();

        let cancel = CancellationToken::new();
        let worker = pool.acquire(&cancel).await.unwrap();
        assert_eq!(pool.gauges().active_processors, 2);

        pool.release(&worker);
        let gauges = pool.gauges();
        assert_eq!(gauges.active_processors, 1);
        assert_eq!(gauges.idle_processors, 1);
        assert!(!worker.in_use());
    }

    #[tokio::test]
    async fn test_acquire_observes_cancellation() {
        let (pool, _) = pool_with(test_config(1, 1, 0), MockFactory::new());
        pool.initialize().await.unwrap();

        let cancel = CancellationToken::new();
        let waiter = {
            let pool = pool.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { pool.acquire(&cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        assert!(waiter.await.unwrap().is_none());

        // An already-tripped token returns immediately.
        assert!(pool.acquire(&cancel).await.is_none());
    }

    #[tokio::test]
    async fn test_scale_down_demotes_quiescent_workers() {
        let (pool, counters) = pool_with(test_config(2, 5, 0), MockFactory::new());
        pool.initialize().await.unwrap();

        // Drive the active list to the cap, then let everything go quiet.
        let cancel = CancellationToken::new();
        let mut held = Vec::new();
        for _ in 0..3 {
            held.push(pool.acquire(&cancel).await.unwrap());
        }
        assert_eq!(pool.gauges().active_processors, 5);
        for worker in &held {
            pool.release(worker);
        }

        tokio::time::sleep(Duration::from_millis(20)).await;
        pool.scale_down().await;

        let gauges = pool.gauges();
        assert_eq!(gauges.active_processors, 2);
        assert!(gauges.active_processors + gauges.idle_processors <= 5);
        assert_eq!(counters.closed.load(AtomicOrdering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_scale_down_trims_idle_above_cap() {
        // Prewarm can push the idle reserve past the cap's headroom; the
        // trim phase brings total live workers back under it.
        let (pool, counters) = pool_with(test_config(1, 3, 3), MockFactory::new());
        pool.initialize_floor().await.unwrap();
        pool.prewarm().await;
        assert_eq!(pool.gauges().idle_processors, 3);

        pool.scale_down().await;

        let gauges = pool.gauges();
        assert_eq!(gauges.active_processors, 1);
        assert_eq!(gauges.idle_processors, 2);
        assert_eq!(counters.closed.load(AtomicOrdering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_monitor_sweeps_are_noops_when_min_equals_max() {
        let (pool, counters) = pool_with(test_config(2, 2, 0), MockFactory::new());
        pool.initialize().await.unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        pool.scale_down().await;
        pool.prewarm().await;

        let gauges = pool.gauges();
        assert_eq!(gauges.active_processors, 2);
        assert_eq!(gauges.idle_processors, 0);
        assert_eq!(counters.closed.load(AtomicOrdering::SeqCst), 0);
        assert_eq!(counters.spawned.load(AtomicOrdering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_prewarm_tops_up_idle() {
        let (pool, _) = pool_with(test_config(1, 6, 3), MockFactory::new());
        pool.initialize_floor().await.unwrap();
        assert_eq!(pool.gauges().idle_processors, 0);

        pool.prewarm().await;
        assert_eq!(pool.gauges().idle_processors, 3);

        // Already at target: another sweep adds nothing.
        pool.prewarm().await;
        assert_eq!(pool.gauges().idle_processors, 3);
    }

    #[tokio::test]
    async fn test_health_check_repairs_broken_engine() {
        let factory = MockFactory::new();
        let counters = factory.counters.clone();
        let recognize_failures = factory.recognize_failures.clone();
        let pool = Arc::new(WorkerPool::new(test_config(1, 2, 1), Arc::new(factory)));
        pool.initialize().await.unwrap();

        recognize_failures.store(1, AtomicOrdering::SeqCst);
        pool.health_check().await;

        // One probe failed, its engine was closed and respawned in place.
        assert_eq!(counters.closed.load(AtomicOrdering::SeqCst), 1);
        assert_eq!(counters.spawned.load(AtomicOrdering::SeqCst), 3);

        // Worker count is unchanged: repair swaps the engine, not the slot.
        let gauges = pool.gauges();
        assert_eq!(gauges.active_processors + gauges.idle_processors, 2);
    }

    #[tokio::test]
    async fn test_repair_preserves_slot_identity() {
        let (pool, counters) = pool_with(test_config(1, 2, 1), MockFactory::new());
        pool.initialize().await.unwrap();

        let cancel = CancellationToken::new();
        let worker = pool.acquire(&cancel).await.unwrap();
        let before = Arc::as_ptr(&worker);

        {
            let mut engine = worker.lock_engine().await;
            engine::repair(&mut engine, pool.factory()).await.unwrap();
            // The replacement engine works on the same slot.
            assert!(engine.recognize(b"probe").await.unwrap().is_success());
        }

        assert_eq!(Arc::as_ptr(&worker), before);
        assert_eq!(counters.closed.load(AtomicOrdering::SeqCst), 1);
        pool.release(&worker);
    }

    #[tokio::test]
    async fn test_shutdown_closes_every_engine_once() {
        let (pool, counters) = pool_with(test_config(2, 4, 2), MockFactory::new());
        pool.initialize().await.unwrap();

        pool.shutdown().await;

        assert_eq!(counters.closed.load(AtomicOrdering::SeqCst), 4);
        let gauges = pool.gauges();
        assert_eq!(gauges.active_processors, 0);
        assert_eq!(gauges.idle_processors, 0);
    }
}
