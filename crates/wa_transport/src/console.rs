use async_trait::async_trait;
use tokio::io::{AsyncWriteExt, Stdout};
use tokio::sync::Mutex;

use crate::message::OutboundMessage;
use crate::sender::{MessageSender, TransportError};

/// Prints outbound messages on stdout. Used by `waflow flow simulate`.
pub struct ConsoleTransport {
    out: Mutex<Stdout>,
    prefix: String,
}

impl ConsoleTransport {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self { out: Mutex::new(tokio::io::stdout()), prefix: prefix.into() }
    }
}

#[async_trait]
impl MessageSender for ConsoleTransport {
    async fn send_message(
        &self,
        instance_id: &str,
        contact_id: &str,
        text: &str,
    ) -> Result<OutboundMessage, TransportError> {
        let line = format!("{} {}\n", self.prefix, text);
        let mut out = self.out.lock().await;
        out.write_all(line.as_bytes())
            .await
            .map_err(|e| TransportError::Delivery { contact_id: contact_id.to_string(), reason: e.to_string() })?;
        out.flush()
            .await
            .map_err(|e| TransportError::Delivery { contact_id: contact_id.to_string(), reason: e.to_string() })?;
        Ok(OutboundMessage::text(instance_id, contact_id, text))
    }

    fn name(&self) -> &'static str {
        "ConsoleTransport"
    }
}
