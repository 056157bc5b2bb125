// Task intake and per-task execution
//
// One scheduler loop drains the admission queue and spawns an independent
// unit per task; concurrency is bounded by the pool, not the loop. Each unit
// acquires a worker, runs recognition under retry with in-place engine
// repair, replies exactly once, and releases the worker.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::core::config::Config;
use crate::core::errors::{DispatchError, DispatchResult};
use crate::core::types::{EngineOutput, OcrResponse, OcrTask};
use crate::orchestration::pool::{Worker, WorkerPool};
use crate::services::engine;
use crate::services::preprocess;
use crate::utils::ServerStats;

const BACKOFF_INITIAL_INTERVAL: Duration = Duration::from_millis(500);
const BACKOFF_MULTIPLIER: f64 = 1.5;
const BACKOFF_MAX_INTERVAL: Duration = Duration::from_secs(60);
/// Total elapsed budget for one task's retries.
const BACKOFF_MAX_ELAPSED: Duration = Duration::from_secs(120);

/// Exponential backoff with a total elapsed budget.
struct Backoff {
    next_interval: Duration,
    started: Instant,
}

impl Backoff {
    fn new() -> Self {
        Self {
            next_interval: BACKOFF_INITIAL_INTERVAL,
            started: Instant::now(),
        }
    }

    /// Returns the next delay, or `None` once the elapsed budget is spent.
    fn next_delay(&mut self) -> Option<Duration> {
        if self.started.elapsed() >= BACKOFF_MAX_ELAPSED {
            return None;
        }
        let delay = self.next_interval;
        self.next_interval = self
            .next_interval
            .mul_f64(BACKOFF_MULTIPLIER)
            .min(BACKOFF_MAX_INTERVAL);
        Some(delay)
    }
}

/// Executes admitted tasks against the worker pool.
pub struct Dispatcher {
    pool: Arc<WorkerPool>,
    config: Arc<Config>,
    stats: ServerStats,
    /// Admitted-but-undequeued tasks, for the stats endpoint.
    queue_depth: Arc<AtomicI64>,
}

impl Dispatcher {
    pub fn new(pool: Arc<WorkerPool>, config: Arc<Config>, stats: ServerStats) -> Self {
        Self {
            pool,
            config,
            stats,
            queue_depth: Arc::new(AtomicI64::new(0)),
        }
    }

    pub fn queue_depth(&self) -> Arc<AtomicI64> {
        self.queue_depth.clone()
    }

    /// One complete task unit: acquire, recognize with retry, reply, release.
    async fn process_task(&self, task: OcrTask, cancel: CancellationToken) {
        let OcrTask {
            image_path,
            image_data,
            reply,
        } = task;
        let started = Instant::now();

        let Some(worker) = self.pool.acquire(&cancel).await else {
            warn!("no processor available, server is shutting down");
            let _ = reply.send(OcrResponse::err("server is shutting down"));
            self.stats.record(started.elapsed(), false);
            return;
        };

        debug!("processing task on acquired worker");
        let outcome = self
            .perform_recognition(&cancel, &worker, image_path.as_deref(), image_data)
            .await;

        let (response, success) = match outcome {
            Ok(output) if output.is_success() => (OcrResponse::ok(output.data), true),
            Ok(output) => (OcrResponse::err(format!("OCR failed: {}", output.msg)), false),
            Err(e) => (
                OcrResponse::err(format!("failed to perform OCR: {}", e)),
                false,
            ),
        };

        if success {
            debug!("OCR task completed in {:?}", started.elapsed());
        } else {
            warn!("OCR task failed: {:?}", response.error);
        }

        let _ = reply.send(response);
        self.stats.record(started.elapsed(), success);
        self.pool.release(&worker);
    }

    /// Runs attempts under exponential backoff until success, budget
    /// exhaustion, or cancellation. Engine failures repair the worker's
    /// engine in place before the next attempt.
    async fn perform_recognition(
        &self,
        cancel: &CancellationToken,
        worker: &Worker,
        image_path: Option<&str>,
        mut image_data: Vec<u8>,
    ) -> DispatchResult<EngineOutput> {
        let mut backoff = Backoff::new();
        loop {
            if cancel.is_cancelled() {
                return Err(DispatchError::Cancelled);
            }
            match self.attempt(worker, image_path, &mut image_data).await {
                Ok(output) => return Ok(output),
                Err(e) => {
                    let Some(delay) = backoff.next_delay() else {
                        return Err(e);
                    };
                    debug!("recognition attempt failed ({}), retrying in {:?}", e, delay);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => return Err(DispatchError::Cancelled),
                    }
                }
            }
        }
    }

    async fn attempt(
        &self,
        worker: &Worker,
        image_path: Option<&str>,
        image_data: &mut Vec<u8>,
    ) -> DispatchResult<EngineOutput> {
        worker.begin_attempt();
        let result = self.attempt_locked(worker, image_path, image_data).await;
        worker.end_attempt();
        result
    }

    /// One attempt under the worker's engine lock: load bytes, preprocess,
    /// recognize, and repair the engine on failure.
    async fn attempt_locked(
        &self,
        worker: &Worker,
        image_path: Option<&str>,
        image_data: &mut Vec<u8>,
    ) -> DispatchResult<EngineOutput> {
        let mut engine = worker.lock_engine().await;

        let mut buff = match image_path {
            Some(path) => {
                tokio::fs::read(path)
                    .await
                    .map_err(|source| DispatchError::ReadImage {
                        path: path.to_string(),
                        source,
                    })?
            }
            None => std::mem::take(image_data),
        };

        match preprocess::prepare_for_recognition(
            &buff,
            self.config.threshold_value(),
            self.config.threshold_mode(),
        ) {
            Ok(png) => buff = png,
            Err(e) => warn!("image preprocessing failed, passing original bytes: {}", e),
        }
        // Later attempts on inline images reuse the preprocessed bytes.
        *image_data = buff;

        let result = engine.recognize(image_data).await;
        worker.touch();

        match result {
            Ok(output) => Ok(output),
            Err(e) => {
                warn!("OCR processor failed: {}, attempting reinitialization", e);
                match engine::repair(&mut engine, self.pool.factory()).await {
                    Ok(()) => info!("OCR processor reinitialized"),
                    Err(respawn) => warn!("failed to reinitialize OCR processor: {}", respawn),
                }
                Err(DispatchError::Engine(e))
            }
        }
    }
}

/// Scheduler loop: drains the admission queue until cancellation, spawning an
/// independent unit per task, then waits for in-flight units bounded by the
/// shutdown deadline.
pub async fn run_queue(
    dispatcher: Arc<Dispatcher>,
    mut queue: mpsc::Receiver<OcrTask>,
    cancel: CancellationToken,
) {
    info!("task queue processor started");
    let mut units = JoinSet::new();

    loop {
        tokio::select! {
            maybe_task = queue.recv() => {
                let Some(task) = maybe_task else { break };
                dispatcher.queue_depth.fetch_sub(1, Ordering::SeqCst);
                let dispatcher = dispatcher.clone();
                let cancel = cancel.clone();
                units.spawn(async move { dispatcher.process_task(task, cancel).await });
                // Reap whatever already finished so the set stays small.
                while let Some(result) = units.try_join_next() {
                    if let Err(e) = result {
                        error!("task unit panicked: {}", e);
                    }
                }
            }
            _ = cancel.cancelled() => {
                info!("task queue processor shutting down");
                break;
            }
        }
    }

    let drain = async {
        while let Some(result) = units.join_next().await {
            if let Err(e) = result {
                error!("task unit panicked: {}", e);
            }
        }
    };
    if tokio::time::timeout(dispatcher.config.shutdown_timeout(), drain)
        .await
        .is_err()
    {
        warn!(
            "timed out waiting for {} in-flight tasks, abandoning them",
            units.len()
        );
    }
}
