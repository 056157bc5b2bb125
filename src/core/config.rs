use crate::core::errors::ConfigError;
use crate::services::preprocess::ThresholdMode;
use serde::Deserialize;
use std::env;
use std::path::Path;
use std::time::Duration;
use tracing::Level;

/// HTTP listener configuration
#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub addr: String,
    pub port: u16,
    pub log_level: Level,
}

/// OCR subprocess configuration
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub ocr_exe_path: String,
}

/// Worker pool sizing and lifecycle configuration
#[derive(Debug, Clone)]
pub struct PoolSettings {
    /// Floor for the active list; preserved across scale-down.
    pub min_processors: usize,
    /// Hard cap for active and total live workers.
    pub max_processors: usize,
    /// Admission channel capacity.
    pub queue_size: usize,
    /// Declared for config compatibility; scale-up is purely acquire-driven.
    pub scale_threshold: i64,
    /// Usage-count ceiling below which a worker is eligible for demotion.
    pub degrade_threshold: i64,
    /// Minimum quiescence before an active worker is demoted.
    pub idle_timeout: Duration,
    /// Target size of the idle reserve.
    pub warm_up_count: usize,
    /// Hard deadline for graceful drain.
    pub shutdown_timeout: Duration,
}

/// Preprocessor configuration
#[derive(Debug, Clone)]
pub struct PreprocessSettings {
    pub threshold_mode: ThresholdMode,
    pub threshold_value: u8,
}

/// Main application configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerSettings,
    pub engine: EngineSettings,
    pub pool: PoolSettings,
    pub preprocess: PreprocessSettings,
}

/// Optional overrides read from the YAML config file; keys are flat snake_case.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    addr: Option<String>,
    port: Option<u16>,
    ocr_exe_path: Option<String>,
    min_processors: Option<usize>,
    max_processors: Option<usize>,
    queue_size: Option<usize>,
    scale_threshold: Option<i64>,
    degrade_threshold: Option<i64>,
    idle_timeout_secs: Option<u64>,
    warm_up_count: Option<usize>,
    shutdown_timeout_secs: Option<u64>,
    threshold_mode: Option<ThresholdMode>,
    threshold_value: Option<u8>,
    log_level: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        let min_processors = 4;
        Self {
            server: ServerSettings {
                addr: "localhost".to_string(),
                port: 1111,
                log_level: Level::INFO,
            },
            engine: EngineSettings {
                ocr_exe_path: "PaddleOCR-json".to_string(),
            },
            pool: PoolSettings {
                min_processors,
                max_processors: num_cpus::get().max(min_processors),
                queue_size: 100,
                scale_threshold: 75,
                degrade_threshold: 25,
                idle_timeout: Duration::from_secs(300),
                warm_up_count: 2,
                shutdown_timeout: Duration::from_secs(30),
            },
            preprocess: PreprocessSettings {
                threshold_mode: ThresholdMode::Binary,
                threshold_value: 128,
            },
        }
    }
}

impl Config {
    /// Load configuration: defaults, then the YAML file (if given), then
    /// environment variable overrides, then validation.
    pub fn load(config_file: Option<&Path>) -> Result<Self, ConfigError> {
        // Load .env file if it exists
        let _ = dotenvy::dotenv();

        let mut config = Config::default();
        if let Some(path) = config_file {
            config.apply_file(Self::read_file(path)?);
        }
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    fn read_file(path: &Path) -> Result<FileConfig, ConfigError> {
        let data = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFailed {
            path: path.display().to_string(),
            source,
        })?;
        serde_yaml::from_str(&data).map_err(|source| ConfigError::ParseFailed {
            path: path.display().to_string(),
            source,
        })
    }

    fn apply_file(&mut self, file: FileConfig) {
        if let Some(addr) = file.addr {
            self.server.addr = addr;
        }
        if let Some(port) = file.port {
            self.server.port = port;
        }
        if let Some(path) = file.ocr_exe_path {
            self.engine.ocr_exe_path = path;
        }
        if let Some(min) = file.min_processors {
            self.pool.min_processors = min;
        }
        if let Some(max) = file.max_processors {
            self.pool.max_processors = max;
        }
        if let Some(size) = file.queue_size {
            self.pool.queue_size = size;
        }
        if let Some(threshold) = file.scale_threshold {
            self.pool.scale_threshold = threshold;
        }
        if let Some(threshold) = file.degrade_threshold {
            self.pool.degrade_threshold = threshold;
        }
        if let Some(secs) = file.idle_timeout_secs {
            self.pool.idle_timeout = Duration::from_secs(secs);
        }
        if let Some(count) = file.warm_up_count {
            self.pool.warm_up_count = count;
        }
        if let Some(secs) = file.shutdown_timeout_secs {
            self.pool.shutdown_timeout = Duration::from_secs(secs);
        }
        if let Some(mode) = file.threshold_mode {
            self.preprocess.threshold_mode = mode;
        }
        if let Some(value) = file.threshold_value {
            self.preprocess.threshold_value = value;
        }
        if let Some(level) = file.log_level {
            if let Some(parsed) = parse_log_level(&level) {
                self.server.log_level = parsed;
            }
        }
    }

    fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(addr) = env::var("OCR_ADDR") {
            self.server.addr = addr;
        }
        if let Some(port) = env_parse("OCR_PORT") {
            self.server.port = port;
        }
        if let Ok(path) = env::var("OCR_EXE_PATH") {
            self.engine.ocr_exe_path = path;
        }
        if let Some(min) = env_parse("OCR_MIN_PROCESSORS") {
            self.pool.min_processors = min;
        }
        if let Some(max) = env_parse("OCR_MAX_PROCESSORS") {
            self.pool.max_processors = max;
        }
        if let Some(size) = env_parse("OCR_QUEUE_SIZE") {
            self.pool.queue_size = size;
        }
        if let Some(threshold) = env_parse("OCR_SCALE_THRESHOLD") {
            self.pool.scale_threshold = threshold;
        }
        if let Some(threshold) = env_parse("OCR_DEGRADE_THRESHOLD") {
            self.pool.degrade_threshold = threshold;
        }
        if let Some(secs) = env_parse::<u64>("OCR_IDLE_TIMEOUT_SECS") {
            self.pool.idle_timeout = Duration::from_secs(secs);
        }
        if let Some(count) = env_parse("OCR_WARM_UP_COUNT") {
            self.pool.warm_up_count = count;
        }
        if let Some(secs) = env_parse::<u64>("OCR_SHUTDOWN_TIMEOUT_SECS") {
            self.pool.shutdown_timeout = Duration::from_secs(secs);
        }
        if let Ok(mode) = env::var("OCR_THRESHOLD_MODE") {
            match mode.to_lowercase().as_str() {
                "binary" => self.preprocess.threshold_mode = ThresholdMode::Binary,
                "otsu" => self.preprocess.threshold_mode = ThresholdMode::Otsu,
                _ => {}
            }
        }
        if let Some(value) = env_parse("OCR_THRESHOLD_VALUE") {
            self.preprocess.threshold_value = value;
        }
        if let Ok(level) = env::var("LOG_LEVEL") {
            self.server.log_level =
                parse_log_level(&level).ok_or(ConfigError::InvalidLogLevel(level))?;
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.pool.min_processors == 0 {
            return Err(ConfigError::InvalidMinProcessors(self.pool.min_processors));
        }
        if self.pool.max_processors < self.pool.min_processors {
            return Err(ConfigError::ProcessorBoundsInverted {
                min: self.pool.min_processors,
                max: self.pool.max_processors,
            });
        }
        if self.pool.queue_size == 0 {
            return Err(ConfigError::InvalidQueueSize(self.pool.queue_size));
        }
        Ok(())
    }

    pub fn addr(&self) -> &str {
        &self.server.addr
    }

    pub fn port(&self) -> u16 {
        self.server.port
    }

    pub fn log_level(&self) -> Level {
        self.server.log_level
    }

    pub fn ocr_exe_path(&self) -> &str {
        &self.engine.ocr_exe_path
    }

    pub fn min_processors(&self) -> usize {
        self.pool.min_processors
    }

    pub fn max_processors(&self) -> usize {
        self.pool.max_processors
    }

    pub fn queue_size(&self) -> usize {
        self.pool.queue_size
    }

    pub fn scale_threshold(&self) -> i64 {
        self.pool.scale_threshold
    }

    pub fn degrade_threshold(&self) -> i64 {
        self.pool.degrade_threshold
    }

    pub fn idle_timeout(&self) -> Duration {
        self.pool.idle_timeout
    }

    pub fn warm_up_count(&self) -> usize {
        self.pool.warm_up_count
    }

    pub fn shutdown_timeout(&self) -> Duration {
        self.pool.shutdown_timeout
    }

    pub fn threshold_mode(&self) -> ThresholdMode {
        self.preprocess.threshold_mode
    }

    pub fn threshold_value(&self) -> u8 {
        self.preprocess.threshold_value
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|s| s.parse().ok())
}

fn parse_log_level(level: &str) -> Option<Level> {
    match level.to_lowercase().as_str() {
        "trace" => Some(Level::TRACE),
        "debug" => Some(Level::DEBUG),
        "info" => Some(Level::INFO),
        "warn" | "warning" => Some(Level::WARN),
        "error" => Some(Level::ERROR),
        _ => None,
    }
}
