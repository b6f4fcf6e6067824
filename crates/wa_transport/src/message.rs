use std::collections::HashMap;
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageDirection {
    #[default]
    Incoming,
    Outgoing,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
pub struct Participant {
    pub id: String,                     // WhatsApp contact id, e.g. 5511999999999@c.us
    pub display_name: Option<String>,   // push name, when the client knows it
}

impl Participant {
    pub fn new(id: impl Into<String>, display_name: Option<String>) -> Self {
        Self { id: id.into(), display_name }
    }
}

/// A message received by an instance, already associated with a conversation.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct InboundMessage {
    pub id: String,
    pub instance_id: String,
    pub conversation_id: String,
    pub from: Participant,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
}

impl InboundMessage {
    pub fn new(
        instance_id: impl Into<String>,
        conversation_id: impl Into<String>,
        from: Participant,
        text: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            instance_id: instance_id.into(),
            conversation_id: conversation_id.into(),
            from,
            text: text.into(),
            timestamp: Utc::now(),
            metadata: HashMap::new(),
        }
    }

    /// Text as the trigger matcher consumes it: trimmed and lowercased.
    pub fn normalized_text(&self) -> String {
        self.text.trim().to_lowercase()
    }
}

/// A text message handed to the transport for delivery.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OutboundMessage {
    pub id: String,
    pub instance_id: String,
    pub contact_id: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl OutboundMessage {
    pub fn text(instance_id: &str, contact_id: &str, text: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            instance_id: instance_id.to_string(),
            contact_id: contact_id.to_string(),
            text: text.to_string(),
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalized_text_trims_and_lowercases() {
        let msg = InboundMessage::new(
            "inst",
            "conv",
            Participant::new("5511@c.us", None),
            "  Quero um ORÇAMENTO \n",
        );
        assert_eq!(msg.normalized_text(), "quero um orçamento");
    }

    #[test]
    fn inbound_message_uses_camel_case_on_the_wire() {
        let msg = InboundMessage::new("inst", "conv", Participant::new("c1", None), "hi");
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(v["instanceId"], "inst");
        assert_eq!(v["conversationId"], "conv");
        assert!(v.get("metadata").is_none());
    }
}
