pub mod engine;
pub mod preprocess;

// Re-export commonly used services
pub use engine::{Engine, EngineFactory, PaddleOcrEngine, PaddleOcrFactory};
pub use preprocess::ThresholdMode;
