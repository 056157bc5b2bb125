// Main entry point for the OCR dispatch server

use ocr_dispatch::{
    core::Config,
    orchestration::{run_monitor, run_queue, Dispatcher, WorkerPool},
    server::{self, AppState},
    services::engine::PaddleOcrFactory,
    utils::ServerStats,
};

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "ocr-dispatch", version)]
#[command(about = "HTTP dispatch service in front of a pool of PaddleOCR-json workers")]
struct Cli {
    /// Path to the YAML configuration file (optional)
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config =
        Arc::new(Config::load(cli.config.as_deref()).context("failed to load configuration")?);

    // Initialize logging
    use tracing_subscriber::EnvFilter;

    let level_str = match config.log_level() {
        tracing::Level::TRACE => "trace",
        tracing::Level::DEBUG => "debug",
        tracing::Level::INFO => "info",
        tracing::Level::WARN => "warn",
        tracing::Level::ERROR => "error",
    };

    // Set global default to configured level, then override noisy dependencies
    let filter = EnvFilter::new(format!(
        "{},h2=warn,tower_http=warn,hyper=warn,tokio=info",
        level_str
    ));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .init();

    // Log escaped panics before the default handler takes over.
    let default_panic = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        error!("fatal error: {}", panic_info);
        default_panic(panic_info);
    }));

    info!(
        "starting OCR dispatch server (version {})",
        env!("CARGO_PKG_VERSION")
    );
    info!(
        "config: engine={} min={} max={} queue={} scale_threshold={} degrade_threshold={} \
         idle_timeout={:?} warm_up={} shutdown_timeout={:?}",
        config.ocr_exe_path(),
        config.min_processors(),
        config.max_processors(),
        config.queue_size(),
        config.scale_threshold(),
        config.degrade_threshold(),
        config.idle_timeout(),
        config.warm_up_count(),
        config.shutdown_timeout(),
    );

    // Build the pool and spawn the initial processors; a failure here is
    // fatal before the listener ever opens.
    let factory = Arc::new(PaddleOcrFactory::new(config.ocr_exe_path()));
    let pool = Arc::new(WorkerPool::new(config.clone(), factory));
    pool.initialize()
        .await
        .context("failed to initialize OCR processors")?;

    let stats = ServerStats::new();
    let cancel = CancellationToken::new();
    let (task_tx, task_rx) = mpsc::channel(config.queue_size());

    let dispatcher = Arc::new(Dispatcher::new(pool.clone(), config.clone(), stats.clone()));
    let scheduler = tokio::spawn(run_queue(dispatcher.clone(), task_rx, cancel.clone()));
    let monitor = tokio::spawn(run_monitor(pool.clone(), cancel.clone()));

    let state = AppState {
        queue: task_tx,
        pool: pool.clone(),
        stats,
        queue_depth: dispatcher.queue_depth(),
    };
    let app = server::router(state);

    let addr = format!("{}:{}", config.addr(), config.port());
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!("HTTP server listening on http://{}", addr);
    info!("endpoints: POST / (OCR submission), GET /stats (statistics)");

    let serve_cancel = cancel.clone();
    let server_task = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { serve_cancel.cancelled().await })
            .await
    });

    shutdown_signal().await;
    info!("received shutdown signal, starting graceful shutdown...");

    // Every acquire waiter, the scheduler, and the monitor observe this.
    cancel.cancel();

    match tokio::time::timeout(config.shutdown_timeout(), server_task).await {
        Ok(Ok(Ok(()))) => info!("HTTP server stopped"),
        Ok(Ok(Err(e))) => error!("HTTP server error: {}", e),
        Ok(Err(e)) => error!("HTTP server task failed: {}", e),
        Err(_) => warn!("timed out waiting for HTTP connections to drain"),
    }

    match tokio::time::timeout(config.shutdown_timeout(), scheduler).await {
        Ok(_) => info!("all task units exited"),
        Err(_) => warn!("timed out waiting for task units to exit, forcing shutdown"),
    }
    let _ = monitor.await;

    pool.shutdown().await;
    info!("server stopped");
    Ok(())
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut terminate =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = terminate.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
