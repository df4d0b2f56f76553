//! Wire contract for the remote code-execution kernel.
//!
//! An [`Envelope`] is the one JSON shape that crosses the broker in either
//! direction: a required [`Header`] plus a type-specific `msg_data` payload
//! (absent only for `shutdown`). This crate owns `encode`/`decode` and the
//! typed payload structs for every message type in the wire contract; it
//! has no opinion about transport (see `kernel-broker`) or dispatch (see
//! `kernel`).

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod payload;

pub use payload::*;

/// The envelope header. All four fields are required on every inbound
/// message; their absence makes the envelope invalid (§4.4.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Header {
    pub kernel_id: String,
    pub msg_id: String,
    pub msg_type: String,
    pub timestamp: String,
}

/// The full wire envelope. `msg_data` is `None` only for `shutdown`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub header: Header,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg_data: Option<serde_json::Value>,
}

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("envelope is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("envelope missing required header field(s)")]
    MissingHeader,
}

impl Envelope {
    /// Builds a new outbound envelope with a fresh `msg_id` and the current
    /// UTC timestamp.
    pub fn new(kernel_id: &str, msg_type: &str, msg_data: Option<serde_json::Value>) -> Self {
        Self {
            header: Header {
                kernel_id: kernel_id.to_string(),
                msg_id: new_msg_id(),
                msg_type: msg_type.to_string(),
                timestamp: now_iso8601(),
            },
            msg_data,
        }
    }
}

/// Generates a fresh UUIDv4 message id.
pub fn new_msg_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Current UTC time formatted as ISO-8601 with no timezone suffix, per §6.1.
pub fn now_iso8601() -> String {
    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.6f").to_string()
}

/// Decode a wire payload into an [`Envelope`] and check it is valid per
/// §4.4.1: `header` must be present with all of `kernel_id`, `msg_id`,
/// `msg_type`, `timestamp`.
///
/// `serde`'s `Header` struct already makes these fields required at the
/// type level, so any JSON missing one simply fails to parse as an
/// `Envelope` — surfaced here as [`ProtoError::MissingHeader`] rather than
/// the raw serde message, since the caller (the control loop) only needs to
/// know "log and drop", not the specific field.
pub fn decode(raw: &str) -> Result<Envelope, ProtoError> {
    serde_json::from_str::<Envelope>(raw).map_err(|_| ProtoError::MissingHeader)
}

/// Encode an [`Envelope`] to its wire JSON form.
pub fn encode(envelope: &Envelope) -> Result<String, ProtoError> {
    Ok(serde_json::to_string(envelope)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_rejects_missing_header() {
        let raw = r#"{"msg_data": {}}"#;
        assert!(matches!(decode(raw), Err(ProtoError::MissingHeader)));
    }

    #[test]
    fn decode_rejects_header_missing_field() {
        let raw = r#"{"header": {"kernel_id": "k", "msg_id": "1", "msg_type": "ping_request"}}"#;
        assert!(matches!(decode(raw), Err(ProtoError::MissingHeader)));
    }

    #[test]
    fn decode_accepts_shutdown_without_msg_data() {
        let raw = r#"{"header": {"kernel_id": "k", "msg_id": "1", "msg_type": "shutdown", "timestamp": "2024-01-01T00:00:00"}}"#;
        let env = decode(raw).expect("valid envelope");
        assert_eq!(env.header.msg_type, "shutdown");
        assert!(env.msg_data.is_none());
    }

    #[test]
    fn round_trip_encode_decode() {
        let env = Envelope::new(
            "k1",
            "ping_request",
            Some(serde_json::json!({"reverse_path": "r1"})),
        );
        let wire = encode(&env).expect("encode");
        let back = decode(&wire).expect("decode");
        assert_eq!(back.header.kernel_id, "k1");
        assert_eq!(back.header.msg_type, "ping_request");
        assert_eq!(
            back.msg_data.unwrap()["reverse_path"],
            serde_json::json!("r1")
        );
    }

    #[test]
    fn timestamp_has_no_timezone_suffix() {
        let ts = now_iso8601();
        assert!(!ts.ends_with('Z'));
        assert!(!ts.contains('+'));
    }
}
