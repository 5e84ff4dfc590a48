//! Messaging channel: inbound payload normalization and the outbound gateway client.
//!
//! Webhook payloads are reduced to an `InboundEvent` by `normalize`; replies and media downloads
//! go through a `MessagingGateway` (the uazapi HTTP client in production).

mod gateway;
mod inbound;
mod normalize;
mod retry;
mod uazapi;

pub use gateway::{GatewayError, MessagingGateway};
pub use inbound::{InboundEvent, MessageKind, NormalizeError};
pub use normalize::{normalize, sender_id_from_address};
pub use retry::RetryPolicy;
pub use uazapi::{chat_address, join_url, UazapiClient, UazapiSettings};
