//! Messaging gateway seam: what the orchestrator and ingestion need from the chat provider.

use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;

/// Failure talking to the messaging gateway.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Every candidate route was tried; carries the last attempted route's response.
    #[error("gateway {operation} failed on {route}: {status} {body}")]
    Status {
        operation: &'static str,
        route: String,
        status: u16,
        body: String,
    },
    #[error("gateway {operation} request to {route} failed: {source}")]
    Transport {
        operation: &'static str,
        route: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("gateway {0}: no candidate routes configured")]
    NoRoutes(&'static str),
    #[error("gateway media link missing in download descriptor")]
    MissingMediaLink,
    #[error("gateway response could not be decoded: {0}")]
    Decode(String),
}

/// Outbound and media operations on the messaging gateway.
#[async_trait]
pub trait MessagingGateway: Send + Sync {
    /// Send a text message to a chat address or bare number.
    async fn send_text(&self, to: &str, text: &str) -> Result<(), GatewayError>;

    /// Send media (`kind` as the gateway names it, e.g. "audio") from raw bytes.
    async fn send_media(&self, to: &str, kind: &str, data: &[u8]) -> Result<(), GatewayError>;

    /// Resolve a short-lived direct link for an inbound message's media and fetch it.
    /// Returns the bytes and the link they were fetched from.
    async fn resolve_and_fetch_media(
        &self,
        external_message_id: &str,
    ) -> Result<(Bytes, String), GatewayError>;

    /// Best-effort "typing…" indicator for roughly `duration`. Never fails; errors are discarded.
    async fn indicate_typing(&self, to: &str, duration: Duration);

    /// Send text after showing a typing indicator for `delay`; zero sends immediately.
    async fn send_text_with_delay(
        &self,
        to: &str,
        text: &str,
        delay: Duration,
    ) -> Result<(), GatewayError> {
        if !delay.is_zero() {
            self.indicate_typing(to, delay).await;
        }
        self.send_text(to, text).await
    }

    /// Media counterpart of `send_text_with_delay`.
    async fn send_media_with_delay(
        &self,
        to: &str,
        kind: &str,
        data: &[u8],
        delay: Duration,
    ) -> Result<(), GatewayError> {
        if !delay.is_zero() {
            self.indicate_typing(to, delay).await;
        }
        self.send_media(to, kind, data).await
    }
}
