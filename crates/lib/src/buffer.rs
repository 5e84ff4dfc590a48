//! Per-sender debounce buffer: bursts of fragments from one sender become one Turn.
//!
//! Every accepted fragment bumps the sender's generation and arms a fresh single-shot timer that
//! remembers that generation. When a timer fires it flushes only if the generation is still the
//! one it was armed with; anything else means a newer fragment arrived and the timer is stale.
//! Aborting the previous timer on re-arm is only an optimisation; correctness rests on the
//! generation check. The flush removes the sender's entry before the handler runs, on its own
//! task, so the handler may append for the same sender again.

use crate::channels::MessageKind;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

pub const DEFAULT_WINDOW: Duration = Duration::from_secs(15);

/// A sender's merged burst, consumed once by the turn handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Turn {
    pub sender_id: String,
    /// Arrival order, consecutive duplicates collapsed.
    pub fragments: Vec<String>,
    /// Kind of the last fragment in the burst.
    pub last_kind: MessageKind,
}

impl Turn {
    /// Fragments joined with newlines.
    pub fn merged_text(&self) -> String {
        self.fragments.join("\n")
    }

    /// Fragments as `- ` list items under `header` (header omitted when blank).
    pub fn as_list(&self, header: &str) -> String {
        let items = self
            .fragments
            .iter()
            .map(|f| format!("- {}", f))
            .collect::<Vec<_>>()
            .join("\n");
        let header = header.trim();
        if header.is_empty() {
            items
        } else {
            format!("{}\n{}", header, items)
        }
    }
}

/// Receives flushed turns. Runs on a detached task per flush.
#[async_trait]
pub trait TurnHandler: Send + Sync {
    async fn handle_turn(&self, turn: Turn);
}

#[derive(Default)]
struct SenderBufferState {
    fragments: Vec<String>,
    last_kind: MessageKind,
    generation: u64,
    timer: Option<JoinHandle<()>>,
}

struct Inner {
    window: Duration,
    states: Mutex<HashMap<String, SenderBufferState>>,
    /// Source of generations; shared so a recreated state never reuses a value.
    generations: AtomicU64,
    handler: Arc<dyn TurnHandler>,
}

/// Debounce aggregator keyed by sender id. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ConversationBuffer {
    inner: Arc<Inner>,
}

impl ConversationBuffer {
    pub fn new(window: Duration, handler: Arc<dyn TurnHandler>) -> Self {
        Self {
            inner: Arc::new(Inner {
                window,
                states: Mutex::new(HashMap::new()),
                generations: AtomicU64::new(0),
                handler,
            }),
        }
    }

    pub fn window(&self) -> Duration {
        self.inner.window
    }

    /// Add a fragment for `sender_id` and (re)arm its flush timer. Returns false when the fragment
    /// was dropped: blank after trimming, or identical to the previous fragment.
    /// Must be called from within a tokio runtime.
    pub async fn append(&self, sender_id: &str, text: &str, kind: MessageKind) -> bool {
        let text = text.trim();
        if text.is_empty() {
            return false;
        }
        let mut states = self.inner.states.lock().await;
        if states
            .get(sender_id)
            .and_then(|s| s.fragments.last())
            .is_some_and(|last| last == text)
        {
            log::debug!("buffer: dropping duplicate fragment from {}", sender_id);
            return false;
        }
        let state = states.entry(sender_id.to_string()).or_default();
        state.fragments.push(text.to_string());
        state.last_kind = kind;
        state.generation = self.inner.generations.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(previous) = state.timer.take() {
            previous.abort();
        }
        state.timer = Some(self.arm(sender_id.to_string(), state.generation));
        log::debug!(
            "buffer: {} has {} fragment(s), generation {}",
            sender_id,
            state.fragments.len(),
            state.generation
        );
        true
    }

    fn arm(&self, sender_id: String, generation: u64) -> JoinHandle<()> {
        let buffer = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(buffer.inner.window).await;
            buffer.flush_if_current(&sender_id, generation).await;
        })
    }

    /// Flush `sender_id` if its live generation equals `observed_generation`. A mismatch (or a
    /// missing entry) means the caller is a stale timer and nothing happens. Returns whether a
    /// turn was handed to the handler.
    pub async fn flush_if_current(&self, sender_id: &str, observed_generation: u64) -> bool {
        let turn = {
            let mut states = self.inner.states.lock().await;
            match states.get(sender_id) {
                Some(s) if s.generation == observed_generation => {}
                _ => {
                    log::debug!(
                        "buffer: stale timer for {} (generation {}), ignoring",
                        sender_id,
                        observed_generation
                    );
                    return false;
                }
            }
            let Some(state) = states.remove(sender_id) else {
                return false;
            };
            // `state.timer` is the task running this flush (or gone); dropping the handle detaches it.
            Turn {
                sender_id: sender_id.to_string(),
                fragments: state.fragments,
                last_kind: state.last_kind,
            }
        };
        if turn.fragments.is_empty() {
            return false;
        }
        log::info!(
            "buffer: flushing {} fragment(s) for {}",
            turn.fragments.len(),
            turn.sender_id
        );
        let handler = self.inner.handler.clone();
        tokio::spawn(async move {
            handler.handle_turn(turn).await;
        });
        true
    }

    /// Live generation for a sender with buffered fragments.
    pub async fn generation(&self, sender_id: &str) -> Option<u64> {
        self.inner
            .states
            .lock()
            .await
            .get(sender_id)
            .map(|s| s.generation)
    }

    /// Number of senders with an armed buffer.
    pub async fn pending_senders(&self) -> usize {
        self.inner.states.lock().await.len()
    }
}
