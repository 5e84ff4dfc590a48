//! Turn orchestration: drives one flushed Turn through the engine and dispatches the reply.
//!
//! Runs on the detached task spawned by the buffer. Failures end the turn; they are logged and,
//! when a failure notice is configured, the sender is told once.

use crate::buffer::{Turn, TurnHandler};
use crate::channels::{MessageKind, MessagingGateway};
use crate::ingest::sanitize_text;
use crate::llm::{ConversationEngine, RunStatus};
use crate::store::{ConversationStore, HandleAssignment, HistoryRecord, Role};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_HEADER: &str = "Recent messages from the user:";

#[derive(Debug, Clone)]
pub struct TurnSettings {
    pub poll_interval: Duration,
    pub poll_attempts: u32,
    /// Line placed above the fragment list sent to the engine.
    pub header: String,
    /// Sent to the sender when a turn aborts. None keeps failures silent.
    pub failure_notice: Option<String>,
    /// Typing time shown before the reply is delivered; zero sends at once.
    pub typing_delay: Duration,
}

impl Default for TurnSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            poll_attempts: 10,
            header: DEFAULT_HEADER.to_string(),
            failure_notice: None,
            typing_delay: Duration::ZERO,
        }
    }
}

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum TurnError {
    /// A store, engine or gateway call failed.
    #[error("{step} failed: {source}")]
    Dependency {
        step: &'static str,
        #[source]
        source: BoxError,
    },
    #[error("run ended with status {0:?}")]
    RunNotCompleted(RunStatus),
    #[error("run still pending after {0} polls")]
    PollBudgetExhausted(u32),
}

/// Tags a collaborator failure with the turn step it happened in.
trait TurnStep<T> {
    fn step(self, step: &'static str) -> Result<T, TurnError>;
}

impl<T, E: Into<BoxError>> TurnStep<T> for Result<T, E> {
    fn step(self, step: &'static str) -> Result<T, TurnError> {
        self.map_err(|e| TurnError::Dependency {
            step,
            source: e.into(),
        })
    }
}

/// What a successful turn dispatched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub conversation_handle: String,
    pub text: String,
    pub kind: MessageKind,
}

pub struct TurnOrchestrator {
    store: Arc<dyn ConversationStore>,
    engine: Arc<dyn ConversationEngine>,
    gateway: Arc<dyn MessagingGateway>,
    settings: TurnSettings,
}

impl TurnOrchestrator {
    pub fn new(
        store: Arc<dyn ConversationStore>,
        engine: Arc<dyn ConversationEngine>,
        gateway: Arc<dyn MessagingGateway>,
        settings: TurnSettings,
    ) -> Self {
        Self {
            store,
            engine,
            gateway,
            settings,
        }
    }

    pub async fn process_turn(&self, turn: &Turn) -> Result<Reply, TurnError> {
        let sender = &turn.sender_id;
        let handle = self.conversation_handle(sender).await?;

        let prompt = turn.as_list(&self.settings.header);
        self.engine
            .append_message(&handle, &prompt)
            .await
            .step("append message")?;
        self.record(HistoryRecord::new(sender, Role::User, turn.last_kind, prompt))
            .await;

        let run_id = self
            .engine
            .start_run(&handle)
            .await
            .step("start run")?;
        self.await_run(&handle, &run_id).await?;

        let reply = self
            .engine
            .get_latest_reply(&handle)
            .await
            .step("fetch reply")?;
        let reply = sanitize_text(&reply);

        let delay = self.settings.typing_delay;
        let kind = if turn.last_kind == MessageKind::Audio {
            let speech = self
                .engine
                .synthesize_speech(&reply)
                .await
                .step("synthesize speech")?;
            self.gateway
                .send_media_with_delay(sender, "audio", &speech, delay)
                .await
                .step("send audio reply")?;
            MessageKind::Audio
        } else {
            self.gateway
                .send_text_with_delay(sender, &reply, delay)
                .await
                .step("send text reply")?;
            MessageKind::Text
        };
        self.record(HistoryRecord::new(sender, Role::Assistant, kind, reply.clone()))
            .await;

        log::info!("turn: replied to {} ({})", sender, kind);
        Ok(Reply {
            conversation_handle: handle,
            text: reply,
            kind,
        })
    }

    /// Existing handle, or a freshly created one bound with a set-once write. If another task
    /// bound a handle first, that one is adopted and ours is dropped.
    async fn conversation_handle(&self, sender: &str) -> Result<String, TurnError> {
        let record = self
            .store
            .get_or_create_sender(sender, None)
            .await
            .step("load sender")?;
        if let Some(handle) = record.conversation_handle {
            return Ok(handle);
        }
        let minted = self
            .engine
            .create_conversation()
            .await
            .step("create conversation")?;
        match self
            .store
            .set_conversation_handle(sender, &minted)
            .await
            .step("persist conversation handle")?
        {
            HandleAssignment::Assigned => {
                log::info!("turn: new conversation {} for {}", minted, sender);
                Ok(minted)
            }
            HandleAssignment::AlreadySet(existing) => {
                log::info!(
                    "turn: {} already bound to {}, discarding {}",
                    sender,
                    existing,
                    minted
                );
                Ok(existing)
            }
        }
    }

    async fn await_run(&self, handle: &str, run_id: &str) -> Result<(), TurnError> {
        for attempt in 1..=self.settings.poll_attempts {
            tokio::time::sleep(self.settings.poll_interval).await;
            let status = self
                .engine
                .get_run_status(handle, run_id)
                .await
                .step("poll run")?;
            log::debug!("turn: run {} poll {} -> {:?}", run_id, attempt, status);
            match status {
                RunStatus::Completed => return Ok(()),
                RunStatus::Pending => continue,
                terminal => return Err(TurnError::RunNotCompleted(terminal)),
            }
        }
        Err(TurnError::PollBudgetExhausted(self.settings.poll_attempts))
    }

    async fn record(&self, record: HistoryRecord) {
        let sender = record.sender_id.clone();
        if let Err(e) = self.store.append_history(record).await {
            log::warn!("turn: history write for {} failed: {}", sender, e);
        }
    }
}

#[async_trait]
impl TurnHandler for TurnOrchestrator {
    async fn handle_turn(&self, turn: Turn) {
        let Err(e) = self.process_turn(&turn).await else {
            return;
        };
        log::warn!("turn: aborted for {}: {}", turn.sender_id, e);
        if let Some(notice) = &self.settings.failure_notice {
            if let Err(e) = self.gateway.send_text(&turn.sender_id, notice).await {
                log::warn!("turn: failure notice to {} not sent: {}", turn.sender_id, e);
            }
        }
    }
}
