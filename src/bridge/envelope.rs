//! Rebroadcast message envelope.

use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::telemetry::{ALERT_SUBTOPIC, PREVIEW_SUBTOPIC, STATUS_SUBTOPIC};

/// Message delivered to live subscribers: a discriminator plus the original
/// payload, so subscribers demultiplex without knowing broker topics.
///
/// Serializes as `{"type": "frame", "data": "<base64>"}` or
/// `{"type": "alert", "data": {..}}`, one JSON object per line.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum Envelope {
    /// Preview payload, base64-encoded.
    Frame(String),
    /// Alert document, passed through as parsed JSON.
    Alert(Value),
}

impl Envelope {
    pub fn frame(payload: &[u8]) -> Self {
        Envelope::Frame(BASE64.encode(payload))
    }

    /// Classify a broker message by its subtopic under `prefix`.
    ///
    /// Returns `Ok(None)` for subtopics that are not part of the subscriber
    /// contract (availability, unknown extensions); those are skipped.
    pub fn from_broker(topic: &str, prefix: &str, payload: &[u8]) -> Result<Option<Self>> {
        let subtopic = topic
            .strip_prefix(prefix)
            .and_then(|rest| rest.strip_prefix('/'))
            .ok_or_else(|| anyhow!("topic '{}' outside prefix '{}'", topic, prefix))?;
        match subtopic {
            PREVIEW_SUBTOPIC => Ok(Some(Envelope::frame(payload))),
            ALERT_SUBTOPIC => {
                let value: Value =
                    serde_json::from_slice(payload).context("alert payload is not JSON")?;
                Ok(Some(Envelope::Alert(value)))
            }
            STATUS_SUBTOPIC => Ok(None),
            other => {
                log::debug!("ignoring unrecognized telemetry subtopic '{}'", other);
                Ok(None)
            }
        }
    }

    /// Encode as one newline-terminated JSON line.
    pub fn to_line(&self) -> Result<Vec<u8>> {
        let mut line = serde_json::to_vec(self).context("failed to encode envelope")?;
        line.push(b'\n');
        Ok(line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_envelope_encodes_base64_payload() {
        let envelope = Envelope::from_broker("telemetry/preview", "telemetry", b"\x01\x02\x03")
            .expect("classify")
            .expect("envelope");
        let line = envelope.to_line().expect("line");
        let value: Value = serde_json::from_slice(&line).expect("json");
        assert_eq!(value["type"], "frame");
        let decoded = BASE64
            .decode(value["data"].as_str().expect("data"))
            .expect("base64");
        assert_eq!(decoded, b"\x01\x02\x03");
        assert_eq!(*line.last().expect("newline"), b'\n');
    }

    #[test]
    fn alert_envelope_passes_document_through() {
        let payload = br#"{"sequence_id": 7, "anomalies": []}"#;
        let envelope = Envelope::from_broker("telemetry/alert", "telemetry", payload)
            .expect("classify")
            .expect("envelope");
        let line = envelope.to_line().expect("line");
        let value: Value = serde_json::from_slice(&line).expect("json");
        assert_eq!(value["type"], "alert");
        assert_eq!(value["data"]["sequence_id"], 7);
    }

    #[test]
    fn status_and_unknown_subtopics_are_skipped() {
        assert_eq!(
            Envelope::from_broker("telemetry/status", "telemetry", b"online").expect("status"),
            None
        );
        assert_eq!(
            Envelope::from_broker("telemetry/debug/stats", "telemetry", b"{}").expect("unknown"),
            None
        );
    }

    #[test]
    fn foreign_topic_is_an_error() {
        assert!(Envelope::from_broker("other/preview", "telemetry", b"x").is_err());
    }

    #[test]
    fn malformed_alert_payload_is_an_error() {
        assert!(Envelope::from_broker("telemetry/alert", "telemetry", b"not json").is_err());
    }
}
