//! Contract between the waflow engine and whatever WhatsApp client wrapper
//! delivers messages. The engine only ever *sends* through [`MessageSender`];
//! inbound traffic reaches the engine as [`message::InboundMessage`] values.

pub mod console;
pub mod message;
pub mod sender;

pub use console::ConsoleTransport;
pub use message::{InboundMessage, MessageDirection, OutboundMessage, Participant};
pub use sender::{MessageSender, RecordingTransport, TransportError};
