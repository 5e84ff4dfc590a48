//! Conversational engine abstraction and the OpenAI Assistants-style client.
//!
//! The engine owns conversation state (threads), runs the assistant on them, and provides the
//! auxiliary speech, transcription, vision and summarization calls used around a turn.

mod openai;

pub use openai::{EngineSettings, OpenAiEngine};

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Status of an assistant run. Anything the engine reports that is not terminal counts as pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Completed,
    Failed,
    Expired,
}

impl RunStatus {
    pub fn from_engine(status: &str) -> Self {
        match status {
            "completed" => RunStatus::Completed,
            "failed" | "cancelled" => RunStatus::Failed,
            "expired" => RunStatus::Expired,
            _ => RunStatus::Pending,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("engine request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("engine api error: {0}")]
    Api(String),
    #[error("engine returned no {0}")]
    Empty(&'static str),
}

/// Operations the orchestrator and ingestion need from the conversational engine.
#[async_trait]
pub trait ConversationEngine: Send + Sync {
    async fn create_conversation(&self) -> Result<String, EngineError>;
    async fn append_message(&self, handle: &str, text: &str) -> Result<(), EngineError>;
    async fn start_run(&self, handle: &str) -> Result<String, EngineError>;
    async fn get_run_status(&self, handle: &str, run_id: &str) -> Result<RunStatus, EngineError>;
    async fn get_latest_reply(&self, handle: &str) -> Result<String, EngineError>;
    async fn synthesize_speech(&self, text: &str) -> Result<Bytes, EngineError>;
    async fn transcribe(&self, audio: &[u8]) -> Result<String, EngineError>;
    async fn describe_image(&self, url: &str) -> Result<String, EngineError>;
    async fn summarize(&self, text: &str) -> Result<String, EngineError>;
}
