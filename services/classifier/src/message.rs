//! Wire format of image messages and the per-message classification result.

use crate::features::FeatureVector;
use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// JSON payload published on the `images` exchange
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Unique message ID (UUID v4 from the generator)
    pub id: String,
    /// Routing key the message was published with (`face` or `team`)
    #[serde(rename = "type")]
    pub message_type: String,
    /// RFC 3339 publish timestamp
    pub timestamp: String,
    /// Base64-encoded PNG/JPEG bytes
    pub image: String,
}

impl InboundMessage {
    /// Wrap encoded image bytes in a fresh message stamped with the current time.
    pub fn new(routing_key: impl Into<String>, image_bytes: &[u8]) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            message_type: routing_key.into(),
            timestamp: Utc::now().to_rfc3339(),
            image: STANDARD.encode(image_bytes),
        }
    }

    pub fn from_json(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }

    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Decode the base64 image field
    pub fn image_bytes(&self) -> Result<Vec<u8>, base64::DecodeError> {
        STANDARD.decode(self.image.as_bytes())
    }
}

/// Outcome of classifying one message. Logged, never stored.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassificationResult {
    pub message_id: String,
    pub label: usize,
    pub label_name: &'static str,
    /// Present only when verbose diagnostics are enabled
    pub features: Option<FeatureVector>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_wire_message() {
        let json = r#"{
            "id": "6f1c2a7e-0000-4000-8000-000000000001",
            "type": "face",
            "timestamp": "2024-05-01T12:00:00Z",
            "image": "SGVsbG8="
        }"#;

        let message = InboundMessage::from_json(json.as_bytes()).unwrap();
        assert_eq!(message.message_type, "face");
        assert_eq!(message.image_bytes().unwrap(), b"Hello");
    }

    #[test]
    fn test_new_message_serializes_type_field() {
        let message = InboundMessage::new("team", &[1, 2, 3]);
        let value: serde_json::Value = serde_json::from_slice(&message.to_json().unwrap()).unwrap();

        assert_eq!(value["type"], "team");
        assert_eq!(value["image"], "AQID");
        assert!(Uuid::parse_str(&message.id).is_ok());
        assert!(chrono::DateTime::parse_from_rfc3339(&message.timestamp).is_ok());
    }

    #[test]
    fn test_invalid_base64_is_an_error() {
        let message = InboundMessage {
            id: "x".to_string(),
            message_type: "face".to_string(),
            timestamp: "2024-05-01T12:00:00Z".to_string(),
            image: "***not base64***".to_string(),
        };
        assert!(message.image_bytes().is_err());
    }
}
