// Inbound domain-event envelope consumed from the event stream.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Raw domain event as published by the producing services.
///
/// The `type` field is left as a string here — unknown kinds must survive
/// deserialization so the ingestor can log-and-skip them without stalling
/// the stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DomainEvent {
    #[serde(rename = "type")]
    pub kind: String,
    /// Recipient of the resulting notification.
    pub user_id: Uuid,
    /// Event-specific fields, carried through to the notification payload.
    #[serde(flatten)]
    pub data: Map<String, Value>,
}

impl DomainEvent {
    /// A named string field from the event body, if present.
    pub fn field_str(&self, name: &str) -> Option<&str> {
        self.data.get(name).and_then(Value::as_str)
    }
}

/// Why an inbound stream entry could not be turned into a notification.
///
/// Malformed events are logged and skipped — they never stall ingestion of
/// subsequent entries.
#[derive(Debug, thiserror::Error)]
pub enum MalformedEvent {
    #[error("event body is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("unknown event type `{0}`")]
    UnknownKind(String),
}

#[cfg(test)]
mod tests {
    use super::DomainEvent;
    use uuid::Uuid;

    #[test]
    fn deserializes_envelope_with_extra_fields() {
        let user_id = Uuid::new_v4();
        let raw = serde_json::json!({
            "type": "event_created",
            "user_id": user_id,
            "event_id": 1,
            "event_title": "Rust meetup",
        });

        let event: DomainEvent =
            serde_json::from_value(raw).expect("envelope should deserialize");
        assert_eq!(event.kind, "event_created");
        assert_eq!(event.user_id, user_id);
        assert_eq!(event.field_str("event_title"), Some("Rust meetup"));
        assert_eq!(event.data.get("event_id"), Some(&serde_json::json!(1)));
    }

    #[test]
    fn unknown_kind_still_deserializes() {
        let raw = serde_json::json!({
            "type": "event_archived",
            "user_id": Uuid::new_v4(),
        });

        let event: DomainEvent =
            serde_json::from_value(raw).expect("unknown kinds must not fail envelope parsing");
        assert_eq!(event.kind, "event_archived");
    }

    #[test]
    fn missing_recipient_is_an_error() {
        let raw = serde_json::json!({ "type": "event_created" });
        assert!(serde_json::from_value::<DomainEvent>(raw).is_err());
    }
}
