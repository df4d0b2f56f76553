//! Typed `msg_data` payloads for each message type in the wire contract
//! (§6.2). The discriminator is the envelope's own `header.msg_type` string,
//! not a serde-internal tag, so each payload is encoded/decoded on its own
//! via `serde_json::Value` conversion rather than as a variant of one enum.

use serde::{Deserialize, Serialize};

/// Inbound `ping_request` payload.
#[derive(Debug, Clone, Deserialize)]
pub struct PingRequest {
    pub reverse_path: String,
}

/// Inbound `code_execution` payload.
#[derive(Debug, Clone, Deserialize)]
pub struct CodeExecution {
    pub reverse_path: String,
    pub code: String,
}

/// Inbound `input_response` payload.
#[derive(Debug, Clone, Deserialize)]
pub struct InputResponse {
    pub content: String,
}

/// Outbound `ping_response` payload.
#[derive(Debug, Clone, Serialize)]
pub struct PingResponse {
    pub in_response_to: String,
}

/// Outbound `stdout`/`stderr` payload.
#[derive(Debug, Clone, Serialize)]
pub struct OutputChunk {
    pub in_response_to: String,
    pub content: String,
}

/// Outbound `matplotlib_drawing` payload. `content` is base64-encoded, per
/// the literal-key wire format this spec adopts (see Open Questions).
#[derive(Debug, Clone, Serialize)]
pub struct MatplotlibDrawing {
    pub in_response_to: String,
    pub mimetype: String,
    pub content: String,
}

impl MatplotlibDrawing {
    /// Builds a payload from raw figure bytes, base64-encoding `content`.
    pub fn from_bytes(in_response_to: impl Into<String>, mimetype: impl Into<String>, content: &[u8]) -> Self {
        use base64::Engine;
        Self {
            in_response_to: in_response_to.into(),
            mimetype: mimetype.into(),
            content: base64::engine::general_purpose::STANDARD.encode(content),
        }
    }
}

/// Outbound `input_request` payload.
#[derive(Debug, Clone, Serialize)]
pub struct InputRequestPrompt {
    pub in_response_to: String,
    pub prompt: String,
}

/// Outbound `code_execution_complete` payload.
#[derive(Debug, Clone, Serialize)]
pub struct CodeExecutionComplete {
    pub in_response_to: String,
    pub stdout: String,
    pub stderr: String,
}

/// Extracts a typed payload `T` from an envelope's `msg_data`. Returns
/// `None` if `msg_data` is absent or does not match `T`'s shape — the
/// caller's uniform response to both cases is "log and drop" (§7).
pub fn extract<T: for<'de> Deserialize<'de>>(msg_data: &Option<serde_json::Value>) -> Option<T> {
    let value = msg_data.as_ref()?;
    serde_json::from_value(value.clone()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_code_execution_requires_both_fields() {
        let data = Some(serde_json::json!({"reverse_path": "r"}));
        assert!(extract::<CodeExecution>(&data).is_none());

        let data = Some(serde_json::json!({"reverse_path": "r", "code": "x = 1"}));
        let exec = extract::<CodeExecution>(&data).expect("valid payload");
        assert_eq!(exec.reverse_path, "r");
        assert_eq!(exec.code, "x = 1");
    }

    #[test]
    fn matplotlib_drawing_base64_encodes_content() {
        let payload = MatplotlibDrawing::from_bytes("m1", "image/png", b"\x89PNG");
        assert_eq!(payload.content, base64::Engine::encode(&base64::engine::general_purpose::STANDARD, b"\x89PNG"));
    }
}
