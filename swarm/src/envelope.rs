//! The data-channel message envelope: protocol-versioned JSON with a hard
//! payload cap. Version mismatches and oversized payloads are dropped at the
//! boundary, never dispatched.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::SwarmError;

pub const PROTOCOL_VERSION: u32 = 1;
/// Maximum serialized payload size in bytes.
pub const MAX_PAYLOAD: usize = 64 * 1024;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Envelope {
    pub protocol_version: u32,
    pub msg_type: String,
    pub peer_id: String,
    /// Milliseconds since the epoch at send time.
    pub timestamp: u64,
    pub payload: Value,
    pub payload_size: usize,
}

impl Envelope {
    pub fn new(msg_type: &str, peer_id: &str, payload: Value) -> Result<Self, SwarmError> {
        let payload_size = payload.to_string().len();
        if payload_size > MAX_PAYLOAD {
            return Err(SwarmError::PayloadTooLarge(payload_size));
        }
        Ok(Self {
            protocol_version: PROTOCOL_VERSION,
            msg_type: msg_type.to_string(),
            peer_id: peer_id.to_string(),
            timestamp: now_millis(),
            payload,
            payload_size,
        })
    }

    pub fn encode(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Decodes and gates: wrong version or oversized payload is an error the
    /// receiver treats as a drop.
    pub fn decode(text: &str) -> Result<Self, SwarmError> {
        let envelope: Envelope =
            serde_json::from_str(text).map_err(|e| SwarmError::Malformed(e.to_string()))?;
        if envelope.protocol_version != PROTOCOL_VERSION {
            return Err(SwarmError::VersionMismatch(envelope.protocol_version));
        }
        if envelope.payload_size > MAX_PAYLOAD {
            return Err(SwarmError::PayloadTooLarge(envelope.payload_size));
        }
        Ok(envelope)
    }
}

pub(crate) fn now_millis() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn encode_decode_round_trip() {
        let envelope = Envelope::new("ping", "peer-a", json!({ "n": 1 })).unwrap();
        let decoded = Envelope::decode(&envelope.encode()).unwrap();
        assert_eq!(decoded.msg_type, "ping");
        assert_eq!(decoded.peer_id, "peer-a");
        assert_eq!(decoded.payload["n"], 1);
    }

    #[test]
    fn version_mismatch_is_rejected() {
        let mut envelope = Envelope::new("ping", "p", json!({})).unwrap();
        envelope.protocol_version = 99;
        assert!(matches!(
            Envelope::decode(&envelope.encode()),
            Err(SwarmError::VersionMismatch(99))
        ));
    }

    #[test]
    fn oversized_payload_is_rejected_at_build() {
        let big = "x".repeat(MAX_PAYLOAD + 1);
        assert!(matches!(
            Envelope::new("blob", "p", json!(big)),
            Err(SwarmError::PayloadTooLarge(_))
        ));
    }
}
