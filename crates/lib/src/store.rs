//! Sender and history persistence.
//!
//! Senders are keyed by their stable identity and hold an optional display name and an optional
//! conversation handle (set once). History is append-only. The local store keeps senders and the
//! most recent history of each sender in memory and, when given a directory, mirrors senders to
//! `senders.json` and appends every history record to `history.jsonl`.

use crate::channels::MessageKind;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};

const SENDERS_FILE: &str = "senders.json";
const HISTORY_FILE: &str = "history.jsonl";
/// Records kept in memory per sender; older ones remain only in the log file.
pub const DEFAULT_HISTORY_LIMIT: usize = 200;

/// A chat participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SenderRecord {
    pub identity: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub conversation_handle: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// One audit entry: an inbound fragment, a merged turn, or a reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryRecord {
    pub sender_id: String,
    pub role: Role,
    pub kind: MessageKind,
    pub content: String,
    #[serde(default)]
    pub external_message_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl HistoryRecord {
    pub fn new(
        sender_id: impl Into<String>,
        role: Role,
        kind: MessageKind,
        content: impl Into<String>,
    ) -> Self {
        Self {
            sender_id: sender_id.into(),
            role,
            kind,
            content: content.into(),
            external_message_id: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_external_id(mut self, id: Option<String>) -> Self {
        self.external_message_id = id;
        self
    }
}

/// Outcome of a set-once handle write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandleAssignment {
    Assigned,
    /// Another writer got there first; carries the handle that is bound.
    AlreadySet(String),
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sender not found: {0}")]
    SenderNotFound(String),
    #[error("store io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store encoding error: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Persistence consumed by the webhook entrypoint and the orchestrator.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Atomic upsert by identity. An existing display name is kept; a missing one is filled in.
    async fn get_or_create_sender(
        &self,
        identity: &str,
        display_name: Option<&str>,
    ) -> Result<SenderRecord, StoreError>;

    /// Bind a conversation handle to a sender once. The first successful writer wins.
    async fn set_conversation_handle(
        &self,
        identity: &str,
        handle: &str,
    ) -> Result<HandleAssignment, StoreError>;

    async fn append_history(&self, record: HistoryRecord) -> Result<(), StoreError>;

    /// Most recent history for a sender, newest first.
    async fn history(
        &self,
        identity: &str,
        limit: usize,
    ) -> Result<Vec<HistoryRecord>, StoreError>;
}

/// In-memory store with optional file mirroring.
pub struct LocalStore {
    dir: Option<PathBuf>,
    senders: RwLock<HashMap<String, SenderRecord>>,
    /// Newest records per sender, oldest first, at most `history_limit` each.
    history: RwLock<HashMap<String, VecDeque<HistoryRecord>>>,
    history_limit: usize,
    /// Serializes history appends to the log file.
    history_log: Mutex<()>,
}

impl Default for LocalStore {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl LocalStore {
    pub fn in_memory() -> Self {
        Self {
            dir: None,
            senders: RwLock::new(HashMap::new()),
            history: RwLock::new(HashMap::new()),
            history_limit: DEFAULT_HISTORY_LIMIT,
            history_log: Mutex::new(()),
        }
    }

    /// Cap the in-memory history kept per sender (minimum 1). Records already loaded beyond the
    /// new cap are dropped from memory.
    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit.max(1);
        for records in self.history.get_mut().values_mut() {
            trim_front(records, self.history_limit);
        }
        self
    }

    /// Open (or create) a store under `dir`. Unreadable or malformed files start empty; malformed
    /// history lines are skipped.
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;

        let senders: Vec<SenderRecord> =
            match tokio::fs::read_to_string(dir.join(SENDERS_FILE)).await {
                Ok(s) => serde_json::from_str(&s).unwrap_or_else(|e| {
                    log::warn!("store: ignoring unreadable {}: {}", SENDERS_FILE, e);
                    Vec::new()
                }),
                Err(_) => Vec::new(),
            };
        let mut history: HashMap<String, VecDeque<HistoryRecord>> = HashMap::new();
        let mut loaded = 0usize;
        if let Ok(s) = tokio::fs::read_to_string(dir.join(HISTORY_FILE)).await {
            let records = s
                .lines()
                .filter(|l| !l.trim().is_empty())
                .filter_map(|l| serde_json::from_str::<HistoryRecord>(l).ok());
            for record in records {
                loaded += 1;
                let per_sender = history.entry(record.sender_id.clone()).or_default();
                per_sender.push_back(record);
                trim_front(per_sender, DEFAULT_HISTORY_LIMIT);
            }
        }
        log::info!(
            "store: loaded {} sender(s) and {} history record(s) from {}",
            senders.len(),
            loaded,
            dir.display()
        );
        Ok(Self {
            dir: Some(dir),
            senders: RwLock::new(
                senders.into_iter().map(|s| (s.identity.clone(), s)).collect(),
            ),
            history: RwLock::new(history),
            history_limit: DEFAULT_HISTORY_LIMIT,
            history_log: Mutex::new(()),
        })
    }

    /// Write the sender snapshot. Called with the write lock held so snapshots never interleave.
    async fn save_senders(
        &self,
        senders: &HashMap<String, SenderRecord>,
    ) -> Result<(), StoreError> {
        let Some(dir) = &self.dir else {
            return Ok(());
        };
        let mut list: Vec<&SenderRecord> = senders.values().collect();
        list.sort_by(|a, b| a.identity.cmp(&b.identity));
        let json = serde_json::to_string_pretty(&list)?;
        let tmp = dir.join(format!("{}.tmp", SENDERS_FILE));
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, dir.join(SENDERS_FILE)).await?;
        Ok(())
    }

    async fn log_history(&self, record: &HistoryRecord) -> Result<(), StoreError> {
        let Some(dir) = &self.dir else {
            return Ok(());
        };
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        let _guard = self.history_log.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(HISTORY_FILE))
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl ConversationStore for LocalStore {
    async fn get_or_create_sender(
        &self,
        identity: &str,
        display_name: Option<&str>,
    ) -> Result<SenderRecord, StoreError> {
        let display_name = display_name
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(str::to_string);
        let mut senders = self.senders.write().await;
        let mut changed = false;
        let record = senders.entry(identity.to_string()).or_insert_with(|| {
            changed = true;
            SenderRecord {
                identity: identity.to_string(),
                display_name: None,
                conversation_handle: None,
                created_at: Utc::now(),
            }
        });
        if record.display_name.is_none() && display_name.is_some() {
            record.display_name = display_name;
            changed = true;
        }
        let record = record.clone();
        if changed {
            self.save_senders(&senders).await?;
        }
        Ok(record)
    }

    async fn set_conversation_handle(
        &self,
        identity: &str,
        handle: &str,
    ) -> Result<HandleAssignment, StoreError> {
        let mut senders = self.senders.write().await;
        let record = senders
            .get_mut(identity)
            .ok_or_else(|| StoreError::SenderNotFound(identity.to_string()))?;
        if let Some(existing) = &record.conversation_handle {
            return Ok(HandleAssignment::AlreadySet(existing.clone()));
        }
        record.conversation_handle = Some(handle.to_string());
        if let Err(e) = self.save_senders(&senders).await {
            // A failed write leaves the handle unset.
            if let Some(r) = senders.get_mut(identity) {
                r.conversation_handle = None;
            }
            return Err(e);
        }
        Ok(HandleAssignment::Assigned)
    }

    async fn append_history(&self, record: HistoryRecord) -> Result<(), StoreError> {
        self.log_history(&record).await?;
        let mut history = self.history.write().await;
        let per_sender = history.entry(record.sender_id.clone()).or_default();
        per_sender.push_back(record);
        trim_front(per_sender, self.history_limit);
        Ok(())
    }

    async fn history(
        &self,
        identity: &str,
        limit: usize,
    ) -> Result<Vec<HistoryRecord>, StoreError> {
        let history = self.history.read().await;
        Ok(history
            .get(identity)
            .map(|records| records.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default())
    }
}

fn trim_front(records: &mut VecDeque<HistoryRecord>, limit: usize) {
    while records.len() > limit {
        records.pop_front();
    }
}
