use std::fmt;
use std::str::FromStr;
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use wa_transport::MessageDirection;

/// CRM inbox column a conversation sits in.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    #[default]
    Inbox,
    Pending,
    Closed,
}

impl fmt::Display for ConversationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConversationStatus::Inbox => "inbox",
            ConversationStatus::Pending => "pending",
            ConversationStatus::Closed => "closed",
        };
        f.write_str(s)
    }
}

impl FromStr for ConversationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "inbox" => Ok(ConversationStatus::Inbox),
            "pending" => Ok(ConversationStatus::Pending),
            "closed" => Ok(ConversationStatus::Closed),
            other => Err(format!("unknown conversation status `{}`", other)),
        }
    }
}

/// A chat between one instance and one contact. Owned by the CRM side;
/// the engine reads it and mutates `status` / `assigned_to_id`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    pub instance_id: String,
    pub contact_id: String,
    #[serde(default)]
    pub status: ConversationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_to_id: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub fn new(id: impl Into<String>, instance_id: impl Into<String>, contact_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            instance_id: instance_id.into(),
            contact_id: contact_id.into(),
            status: ConversationStatus::Inbox,
            assigned_to_id: None,
            updated_at: Utc::now(),
        }
    }
}

/// Stored chat message. The engine only counts these.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    pub conversation_id: String,
    pub direction: MessageDirection,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

impl MessageRecord {
    pub fn new(conversation_id: &str, direction: MessageDirection, body: &str) -> Self {
        Self {
            conversation_id: conversation_id.to_string(),
            direction,
            body: body.to_string(),
            created_at: Utc::now(),
        }
    }
}
