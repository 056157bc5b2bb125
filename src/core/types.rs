// Shared types flowing between the HTTP surface, the scheduler, and the pool

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;

/// Success sentinel in the PaddleOCR-json line protocol.
pub const CODE_SUCCESS: i64 = 100;

/// One parsed response line from the OCR subprocess.
#[derive(Debug, Clone)]
pub struct EngineOutput {
    pub code: i64,
    pub msg: String,
    pub data: Value,
}

impl EngineOutput {
    pub fn is_success(&self) -> bool {
        self.code == CODE_SUCCESS
    }
}

/// Request body accepted on the OCR endpoint.
///
/// At least one of the two fields must be present; `image_base64` wins when
/// both are set.
#[derive(Debug, Default, Deserialize)]
pub struct OcrRequest {
    #[serde(default)]
    pub image_path: Option<String>,
    #[serde(default)]
    pub image_base64: Option<String>,
}

/// Reply sent back to the client. Exactly one field is populated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcrResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl OcrResponse {
    pub fn ok(data: Value) -> Self {
        Self {
            data: Some(data),
            error: None,
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            data: None,
            error: Some(message.into()),
        }
    }
}

/// A unit of admitted work.
///
/// The reply channel is single-shot; the executor writes exactly once and
/// never blocks on a receiver that has gone away.
#[derive(Debug)]
pub struct OcrTask {
    pub image_path: Option<String>,
    pub image_data: Vec<u8>,
    pub reply: oneshot::Sender<OcrResponse>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_serializes_exactly_one_field() {
        let ok = serde_json::to_string(&OcrResponse::ok(serde_json::json!([1, 2]))).unwrap();
        assert!(ok.contains("data"));
        assert!(!ok.contains("error"));

        let err = serde_json::to_string(&OcrResponse::err("boom")).unwrap();
        assert!(err.contains("error"));
        assert!(!err.contains("data"));
    }

    #[test]
    fn test_request_accepts_either_field() {
        let req: OcrRequest = serde_json::from_str(r#"{"image_path":"/tmp/a.png"}"#).unwrap();
        assert_eq!(req.image_path.as_deref(), Some("/tmp/a.png"));
        assert!(req.image_base64.is_none());

        let req: OcrRequest = serde_json::from_str(r#"{"image_base64":"aGk="}"#).unwrap();
        assert!(req.image_path.is_none());
        assert_eq!(req.image_base64.as_deref(), Some("aGk="));
    }
}
