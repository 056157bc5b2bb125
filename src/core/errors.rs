// Custom error types for the dispatch pipeline
//
// Using thiserror for ergonomic error definitions with:
// - Context preservation
// - Type-safe error matching
// - Source error chaining

use thiserror::Error;

/// Errors raised by the OCR engine subprocess adapter
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to launch OCR engine {path}: {source}")]
    SpawnFailed {
        path: String,
        source: std::io::Error,
    },

    #[error("OCR engine exited before signalling readiness")]
    StartupEof,

    #[error("OCR engine stdio pipe is unavailable")]
    PipeUnavailable,

    #[error("OCR engine closed its output pipe")]
    Disconnected,

    #[error("OCR engine I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("OCR engine returned an unparsable response: {0}")]
    Protocol(#[from] serde_json::Error),
}

/// Failures of a single dispatched task, reported back on its reply channel
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("server is shutting down")]
    Cancelled,

    #[error("failed to read image file {path}: {source}")]
    ReadImage {
        path: String,
        source: std::io::Error,
    },

    #[error("OCR engine failed: {0}")]
    Engine(#[from] EngineError),
}

/// Image preprocessing errors
#[derive(Debug, Error)]
pub enum PreprocessError {
    #[error("image decode failed: {0}")]
    Decode(#[source] image::ImageError),

    #[error("PNG encode failed: {0}")]
    Encode(#[source] image::ImageError),
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    ReadFailed {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    ParseFailed {
        path: String,
        source: serde_yaml::Error,
    },

    #[error("min_processors must be >= 1, got {0}")]
    InvalidMinProcessors(usize),

    #[error("max_processors ({max}) must be >= min_processors ({min})")]
    ProcessorBoundsInverted { min: usize, max: usize },

    #[error("queue_size must be > 0, got {0}")]
    InvalidQueueSize(usize),

    #[error("unknown log level: {0}")]
    InvalidLogLevel(String),
}

// Convenience type aliases for Results
pub type EngineResult<T> = Result<T, EngineError>;
pub type DispatchResult<T> = Result<T, DispatchError>;
pub type ConfigResult<T> = Result<T, ConfigError>;
