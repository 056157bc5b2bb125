// Library exports for the OCR dispatch service
//
// The interesting part is not OCR itself (an external subprocess does that)
// but the orchestration around a pool of long-lived, failure-prone engine
// processes: admission, bounded queueing, dynamic sizing, health probing,
// crash repair, and graceful shutdown.

// Core modules
pub mod core;
pub mod orchestration;
pub mod server;
pub mod services;
pub mod utils;

// Re-export commonly used types and functions
pub use crate::core::{
    config::Config,
    errors::{ConfigError, DispatchError, EngineError, PreprocessError},
    types::{EngineOutput, OcrRequest, OcrResponse, OcrTask, CODE_SUCCESS},
};

pub use orchestration::{run_monitor, run_queue, Dispatcher, PoolGauges, Worker, WorkerPool};

pub use server::{router, AppState};

pub use services::{
    engine::{Engine, EngineFactory, PaddleOcrEngine, PaddleOcrFactory},
    preprocess::ThresholdMode,
};

pub use utils::ServerStats;
