pub mod config;
pub mod errors;
pub mod types;

// Re-export commonly used items for convenience
pub use config::Config;
pub use errors::{ConfigError, DispatchError, EngineError, PreprocessError};
pub use types::{EngineOutput, OcrRequest, OcrResponse, OcrTask, CODE_SUCCESS};
