//! Inbound event from the messaging gateway: the canonical shape every webhook payload is reduced to.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Modality of an inbound fragment. Also recorded as the kind of history entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    #[default]
    Text,
    Audio,
    Image,
    Document,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::Audio => "audio",
            MessageKind::Image => "image",
            MessageKind::Document => "document",
        }
    }

    /// Map a gateway message type (e.g. `audioMessage`, `ptt`, `conversation`). Returns None for
    /// types with no dedicated handler.
    pub fn from_gateway_type(message_type: &str) -> Option<Self> {
        match message_type.trim().to_ascii_lowercase().as_str() {
            "conversation" | "extendedtextmessage" | "text" => Some(MessageKind::Text),
            "audiomessage" | "audio" | "ptt" => Some(MessageKind::Audio),
            "imagemessage" | "image" => Some(MessageKind::Image),
            "documentmessage" | "document" => Some(MessageKind::Document),
            _ => None,
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A chat event from the gateway after normalization. Immutable once parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundEvent {
    /// Numeric identity stripped from the direct-chat address. Empty only for echo events whose
    /// address could not be resolved (those are never processed).
    pub sender_id: String,
    pub sender_display_name: Option<String>,
    pub kind: MessageKind,
    /// Gateway message type as received (used to name unsupported types).
    pub raw_type: String,
    /// Text content, caption or button/list reply id; empty for media without caption.
    pub raw_content: String,
    pub external_message_id: Option<String>,
    /// Sent by this account (fromMe / wasSentByApi). Callers must short-circuit.
    pub is_echo: bool,
}

/// Why a payload could not become an InboundEvent.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum NormalizeError {
    #[error("unrecognized payload shape")]
    Parse,
    #[error("invalid chat address: {0}")]
    Identity(String),
}
