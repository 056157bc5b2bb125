// OCR engine adapter
//
// Wraps one PaddleOCR-json subprocess behind its JSON-per-line protocol:
// one request line on stdin, one response line on stdout. The subprocess
// prints an init banner once its models are loaded; until then it must not
// receive work.

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use serde_json::Value;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, info, warn};

use crate::core::errors::{EngineError, EngineResult};
use crate::core::types::EngineOutput;

/// Banner printed by PaddleOCR-json once it is ready for requests.
const INIT_BANNER: &str = "OCR init completed";

/// Fixed input used by the periodic health probe. The engine accepts any
/// payload and answers with a code; only a transport failure marks a
/// processor as broken.
pub const HEALTH_PROBE: &[u8] = b"Hello World";

/// Capability handle for one running OCR subprocess.
#[async_trait]
pub trait Engine: Send {
    async fn recognize(&mut self, image: &[u8]) -> EngineResult<EngineOutput>;
    async fn close(&mut self);
}

/// Creates engines; the pool owns one factory and uses it for startup,
/// scale-up, prewarming, and repair.
#[async_trait]
pub trait EngineFactory: Send + Sync {
    async fn spawn(&self) -> EngineResult<Box<dyn Engine>>;
}

/// Closes a crashed engine and installs a freshly spawned one in its slot.
///
/// The caller keeps holding the worker's engine lock, so the swap is
/// invisible to everyone else; the worker identity survives.
pub async fn repair(
    slot: &mut Box<dyn Engine>,
    factory: &dyn EngineFactory,
) -> EngineResult<()> {
    slot.close().await;
    *slot = factory.spawn().await?;
    Ok(())
}

/// Production engine speaking the PaddleOCR-json line protocol.
pub struct PaddleOcrEngine {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: BufReader<ChildStdout>,
}

impl PaddleOcrEngine {
    /// Launches the executable and waits for its init banner.
    pub async fn launch(exe_path: &str) -> EngineResult<Self> {
        let started = Instant::now();

        let mut child = Command::new(exe_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| EngineError::SpawnFailed {
                path: exe_path.to_string(),
                source,
            })?;

        let stdin = child.stdin.take().ok_or(EngineError::PipeUnavailable)?;
        let stdout = child.stdout.take().ok_or(EngineError::PipeUnavailable)?;
        let mut stdout = BufReader::new(stdout);

        // The engine logs model loading before the banner; skip those lines.
        let mut line = String::new();
        loop {
            line.clear();
            let n = stdout.read_line(&mut line).await?;
            if n == 0 {
                return Err(EngineError::StartupEof);
            }
            if line.contains(INIT_BANNER) {
                break;
            }
            debug!("engine startup: {}", line.trim_end());
        }

        info!("OCR engine ready in {:?}", started.elapsed());
        Ok(Self {
            child,
            stdin: Some(stdin),
            stdout,
        })
    }
}

#[async_trait]
impl Engine for PaddleOcrEngine {
    async fn recognize(&mut self, image: &[u8]) -> EngineResult<EngineOutput> {
        let stdin = self.stdin.as_mut().ok_or(EngineError::PipeUnavailable)?;

        let request = serde_json::json!({
            "image_base64": general_purpose::STANDARD.encode(image),
        });
        let mut line = serde_json::to_string(&request)?;
        line.push('\n');
        stdin.write_all(line.as_bytes()).await?;
        stdin.flush().await?;

        let mut response = String::new();
        let n = self.stdout.read_line(&mut response).await?;
        if n == 0 {
            return Err(EngineError::Disconnected);
        }

        parse_response(&response)
    }

    async fn close(&mut self) {
        // Dropping stdin lets the subprocess exit on its own; fall back to
        // kill if it lingers.
        drop(self.stdin.take());
        match tokio::time::timeout(Duration::from_secs(2), self.child.wait()).await {
            Ok(Ok(status)) => debug!("OCR engine exited: {}", status),
            Ok(Err(e)) => warn!("failed to reap OCR engine: {}", e),
            Err(_) => {
                warn!("OCR engine did not exit, killing it");
                let _ = self.child.kill().await;
            }
        }
    }
}

/// Parses one response line. On errors the engine reports its message in the
/// `data` field as a string, so that shape maps onto `msg`.
fn parse_response(line: &str) -> EngineResult<EngineOutput> {
    let raw: Value = serde_json::from_str(line.trim())?;
    let code = raw.get("code").and_then(Value::as_i64).unwrap_or(-1);
    let (msg, data) = match raw.get("data") {
        Some(Value::String(message)) => (message.clone(), Value::Null),
        Some(value) => (String::new(), value.clone()),
        None => (String::new(), Value::Null),
    };
    Ok(EngineOutput { code, msg, data })
}

/// Factory for production engines.
pub struct PaddleOcrFactory {
    exe_path: String,
}

impl PaddleOcrFactory {
    pub fn new(exe_path: impl Into<String>) -> Self {
        Self {
            exe_path: exe_path.into(),
        }
    }
}

#[async_trait]
impl EngineFactory for PaddleOcrFactory {
    async fn spawn(&self) -> EngineResult<Box<dyn Engine>> {
        let engine = PaddleOcrEngine::launch(&self.exe_path).await?;
        Ok(Box::new(engine))
    }
}
