use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

use crate::message::OutboundMessage;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("instance `{0}` is not connected")]
    Disconnected(String),

    #[error("delivery to `{contact_id}` failed: {reason}")]
    Delivery { contact_id: String, reason: String },
}

/// Outbound half of the messaging transport.
#[async_trait]
pub trait MessageSender: Send + Sync {
    async fn send_message(
        &self,
        instance_id: &str,
        contact_id: &str,
        text: &str,
    ) -> Result<OutboundMessage, TransportError>;

    fn name(&self) -> &'static str;
}

impl std::fmt::Debug for dyn MessageSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageSender")
            .field("impl", &self.name())
            .finish()
    }
}

/// Keeps every message it is asked to send. Can be switched offline to
/// exercise delivery failures.
#[derive(Debug, Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<OutboundMessage>>,
    offline: AtomicBool,
}

impl RecordingTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub async fn sent(&self) -> Vec<OutboundMessage> {
        self.sent.lock().await.clone()
    }

    pub async fn texts(&self) -> Vec<String> {
        self.sent.lock().await.iter().map(|m| m.text.clone()).collect()
    }

    pub async fn clear(&self) {
        self.sent.lock().await.clear();
    }
}

#[async_trait]
impl MessageSender for RecordingTransport {
    async fn send_message(
        &self,
        instance_id: &str,
        contact_id: &str,
        text: &str,
    ) -> Result<OutboundMessage, TransportError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(TransportError::Disconnected(instance_id.to_string()));
        }
        let msg = OutboundMessage::text(instance_id, contact_id, text);
        debug!(instance_id, contact_id, "recorded outbound message");
        self.sent.lock().await.push(msg.clone());
        Ok(msg)
    }

    fn name(&self) -> &'static str {
        "RecordingTransport"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_messages_in_order() {
        let transport = RecordingTransport::new();
        transport.send_message("i1", "c1", "first").await.unwrap();
        transport.send_message("i1", "c1", "second").await.unwrap();

        assert_eq!(transport.texts().await, vec!["first", "second"]);
        let sent = transport.sent().await;
        assert_eq!(sent[0].contact_id, "c1");
        assert_eq!(sent[0].instance_id, "i1");
    }

    #[tokio::test]
    async fn offline_transport_rejects_sends() {
        let transport = RecordingTransport::new();
        transport.set_offline(true);
        let err = transport.send_message("i1", "c1", "hello").await.unwrap_err();
        assert_eq!(err, TransportError::Disconnected("i1".into()));
        assert!(transport.sent().await.is_empty());

        transport.set_offline(false);
        assert!(transport.send_message("i1", "c1", "hello").await.is_ok());
    }

    #[tokio::test]
    async fn trait_object_debug_shows_impl_name() {
        let transport: Arc<dyn MessageSender> = RecordingTransport::new();
        assert!(format!("{:?}", transport).contains("RecordingTransport"));
    }
}
