//! Turns a normalized inbound event into the text fragment that gets buffered.
//!
//! Non-text modalities call out to the gateway (media download) and the engine (transcription,
//! vision, summarization). A failure here rejects the single fragment at ingestion time.

use crate::channels::{GatewayError, InboundEvent, MessageKind, MessagingGateway};
use crate::llm::{ConversationEngine, EngineError};
use std::path::PathBuf;
use std::sync::Arc;

pub const IMAGE_PREFIX: &str = "Image description: ";
pub const DOCUMENT_PREFIX: &str = "Document summary: ";
pub const EMPTY_MESSAGE: &str = "(empty message)";
pub const EXTRACTION_FAILED: &str = "(could not extract text from document)";
/// Characters of extracted text kept when the summary call fails.
pub const SUMMARY_FALLBACK_LIMIT: usize = 4000;

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("{0} message has no id to fetch media with")]
    MissingMessageId(MessageKind),
    #[error("media fetch failed: {0}")]
    Media(#[from] GatewayError),
    #[error("engine call failed: {0}")]
    Engine(#[from] EngineError),
}

#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("temp file: {0}")]
    Io(#[from] std::io::Error),
    #[error("{binary} exited with {status}: {stderr}")]
    Failed {
        binary: String,
        status: std::process::ExitStatus,
        stderr: String,
    },
}

/// A fragment ready for the buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub text: String,
    pub kind: MessageKind,
}

/// Strip the engine's citation brackets and surrounding whitespace.
pub fn sanitize_text(text: &str) -> String {
    text.replace(['【', '】'], "").trim().to_string()
}

/// Text content for a text-kind event, with the placeholder for unknown or empty messages.
fn text_content(event: &InboundEvent) -> String {
    let content = event.raw_content.trim();
    if !content.is_empty() {
        return content.to_string();
    }
    if MessageKind::from_gateway_type(&event.raw_type).is_none() && !event.raw_type.is_empty() {
        format!("(unsupported message: {})", event.raw_type)
    } else {
        EMPTY_MESSAGE.to_string()
    }
}

/// Runs `pdftotext <file> -` on a temp copy of the document. No shell is involved.
#[derive(Debug, Clone)]
pub struct PdfTextExtractor {
    binary: String,
    scratch_dir: PathBuf,
}

impl Default for PdfTextExtractor {
    fn default() -> Self {
        Self {
            binary: "pdftotext".to_string(),
            scratch_dir: std::env::temp_dir(),
        }
    }
}

impl PdfTextExtractor {
    pub fn new(binary: impl Into<String>, scratch_dir: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            scratch_dir: scratch_dir.into(),
        }
    }

    pub async fn extract(&self, document: &[u8]) -> Result<String, ExtractError> {
        let path = self
            .scratch_dir
            .join(format!("cadence-{}.pdf", uuid::Uuid::new_v4()));
        tokio::fs::write(&path, document).await?;
        let output = tokio::process::Command::new(&self.binary)
            .arg(&path)
            .arg("-")
            .output()
            .await;
        if let Err(e) = tokio::fs::remove_file(&path).await {
            log::debug!("ingest: could not remove {}: {}", path.display(), e);
        }
        let output = output?;
        if !output.status.success() {
            return Err(ExtractError::Failed {
                binary: self.binary.clone(),
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Modality handlers run by the webhook before buffering.
pub struct Ingestor {
    gateway: Arc<dyn MessagingGateway>,
    engine: Arc<dyn ConversationEngine>,
    extractor: PdfTextExtractor,
}

impl Ingestor {
    pub fn new(gateway: Arc<dyn MessagingGateway>, engine: Arc<dyn ConversationEngine>) -> Self {
        Self {
            gateway,
            engine,
            extractor: PdfTextExtractor::default(),
        }
    }

    pub fn with_extractor(mut self, extractor: PdfTextExtractor) -> Self {
        self.extractor = extractor;
        self
    }

    pub async fn fragment(&self, event: &InboundEvent) -> Result<Fragment, IngestError> {
        let text = match event.kind {
            MessageKind::Text => text_content(event),
            MessageKind::Audio => {
                let (audio, _) = self.fetch(event).await?;
                self.engine.transcribe(&audio).await?
            }
            MessageKind::Image => {
                let (_, url) = self.fetch(event).await?;
                let description = self.engine.describe_image(&url).await?;
                format!("{}{}", IMAGE_PREFIX, description)
            }
            MessageKind::Document => {
                let (document, _) = self.fetch(event).await?;
                self.document_text(&document).await
            }
        };
        Ok(Fragment {
            text: sanitize_text(&text),
            kind: event.kind,
        })
    }

    async fn fetch(&self, event: &InboundEvent) -> Result<(bytes::Bytes, String), IngestError> {
        let id = event
            .external_message_id
            .as_deref()
            .filter(|id| !id.trim().is_empty())
            .ok_or(IngestError::MissingMessageId(event.kind))?;
        Ok(self.gateway.resolve_and_fetch_media(id).await?)
    }

    async fn document_text(&self, document: &[u8]) -> String {
        let extracted = match self.extractor.extract(document).await {
            Ok(text) => text,
            Err(e) => {
                log::warn!("ingest: document text extraction failed: {}", e);
                EXTRACTION_FAILED.to_string()
            }
        };
        match self.engine.summarize(&extracted).await {
            Ok(summary) => format!("{}{}", DOCUMENT_PREFIX, summary),
            Err(e) => {
                log::warn!("ingest: document summary failed, using extracted text: {}", e);
                extracted.chars().take(SUMMARY_FALLBACK_LIMIT).collect()
            }
        }
    }
}
