//! In-memory collaborators shared by ingestion, orchestrator and router tests.

use crate::channels::{GatewayError, MessagingGateway};
use crate::llm::{ConversationEngine, EngineError, RunStatus};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sent {
    Text { to: String, text: String },
    Media { to: String, kind: String, len: usize },
    Typing { to: String },
}

#[derive(Default)]
pub struct FakeGateway {
    pub sent: Mutex<Vec<Sent>>,
    pub media: Mutex<Option<(Bytes, String)>>,
    pub fail_sends: bool,
}

impl FakeGateway {
    pub fn with_media(data: &[u8], url: &str) -> Self {
        Self {
            media: Mutex::new(Some((Bytes::copy_from_slice(data), url.to_string()))),
            ..Default::default()
        }
    }

    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().unwrap().clone()
    }

    fn failure(operation: &'static str) -> GatewayError {
        GatewayError::Status {
            operation,
            route: "/send/text".into(),
            status: 500,
            body: "down".into(),
        }
    }
}

#[async_trait]
impl MessagingGateway for FakeGateway {
    async fn send_text(&self, to: &str, text: &str) -> Result<(), GatewayError> {
        if self.fail_sends {
            return Err(Self::failure("send text"));
        }
        self.sent.lock().unwrap().push(Sent::Text {
            to: to.into(),
            text: text.into(),
        });
        Ok(())
    }

    async fn send_media(&self, to: &str, kind: &str, data: &[u8]) -> Result<(), GatewayError> {
        if self.fail_sends {
            return Err(Self::failure("send media"));
        }
        self.sent.lock().unwrap().push(Sent::Media {
            to: to.into(),
            kind: kind.into(),
            len: data.len(),
        });
        Ok(())
    }

    async fn resolve_and_fetch_media(&self, _id: &str) -> Result<(Bytes, String), GatewayError> {
        self.media
            .lock()
            .unwrap()
            .clone()
            .ok_or(GatewayError::MissingMediaLink)
    }

    async fn indicate_typing(&self, to: &str, _duration: Duration) {
        self.sent.lock().unwrap().push(Sent::Typing { to: to.into() });
    }
}

/// Scripted engine. `statuses` is consumed per poll; once empty, `Pending` is reported.
pub struct FakeEngine {
    pub statuses: Mutex<VecDeque<RunStatus>>,
    pub reply: String,
    pub appended: Mutex<Vec<(String, String)>>,
    pub created: Mutex<u32>,
    pub polls: Mutex<u32>,
    pub fail_aux: bool,
}

impl Default for FakeEngine {
    fn default() -> Self {
        Self {
            statuses: Mutex::new(VecDeque::from([RunStatus::Completed])),
            reply: "We open at 9.".into(),
            appended: Mutex::new(Vec::new()),
            created: Mutex::new(0),
            polls: Mutex::new(0),
            fail_aux: false,
        }
    }
}

impl FakeEngine {
    pub fn with_statuses(statuses: Vec<RunStatus>) -> Self {
        Self {
            statuses: Mutex::new(statuses.into()),
            ..Default::default()
        }
    }

    fn aux<T>(&self, value: T) -> Result<T, EngineError> {
        if self.fail_aux {
            Err(EngineError::Api("503 Service Unavailable".into()))
        } else {
            Ok(value)
        }
    }
}

#[async_trait]
impl ConversationEngine for FakeEngine {
    async fn create_conversation(&self) -> Result<String, EngineError> {
        let mut created = self.created.lock().unwrap();
        *created += 1;
        Ok(format!("thread_{}", created))
    }

    async fn append_message(&self, handle: &str, text: &str) -> Result<(), EngineError> {
        self.appended
            .lock()
            .unwrap()
            .push((handle.to_string(), text.to_string()));
        Ok(())
    }

    async fn start_run(&self, _handle: &str) -> Result<String, EngineError> {
        Ok("run_1".into())
    }

    async fn get_run_status(&self, _handle: &str, _run: &str) -> Result<RunStatus, EngineError> {
        *self.polls.lock().unwrap() += 1;
        Ok(self
            .statuses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(RunStatus::Pending))
    }

    async fn get_latest_reply(&self, _handle: &str) -> Result<String, EngineError> {
        Ok(self.reply.clone())
    }

    async fn synthesize_speech(&self, text: &str) -> Result<Bytes, EngineError> {
        self.aux(Bytes::from(format!("mp3:{}", text)))
    }

    async fn transcribe(&self, audio: &[u8]) -> Result<String, EngineError> {
        self.aux(format!("transcript of {} bytes", audio.len()))
    }

    async fn describe_image(&self, url: &str) -> Result<String, EngineError> {
        self.aux(format!("a photo at {}", url))
    }

    async fn summarize(&self, text: &str) -> Result<String, EngineError> {
        self.aux(format!("summary of {} chars", text.chars().count()))
    }
}
