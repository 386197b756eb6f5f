//! Durable, bounded store of messages whose send failed.
//!
//! All records live under one key as a JSON array, newest first. Every
//! mutation is a read-all/modify/write-all cycle, so the cycles are
//! serialized through a single async mutex; concurrent saves from
//! different conversations cannot drop each other's records.
//!
//! Nothing here returns an error. Unreadable or corrupt storage reads as
//! empty, and failed writes are logged and forgotten.

use tokio::sync::Mutex;

use chatsync_proto::message::{ConversationId, Message, MessageId};
use chatsync_proto::record::FailedMessageRecord;

use crate::storage::KeyValueStore;

/// Default storage key.
pub const DEFAULT_STORAGE_KEY: &str = "failed_messages";

/// Default maximum number of retained records.
pub const DEFAULT_MAX_RECORDS: usize = 50;

/// Settings for [`FailedSendStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedStoreConfig {
    /// Key under which the record array is persisted.
    pub storage_key: String,
    /// Number of records kept; the oldest are evicted first.
    pub max_records: usize,
}

impl Default for FailedStoreConfig {
    fn default() -> Self {
        Self {
            storage_key: DEFAULT_STORAGE_KEY.to_string(),
            max_records: DEFAULT_MAX_RECORDS,
        }
    }
}

/// Persistent record of failed sends, shared by all conversations.
pub struct FailedSendStore<K> {
    kv: K,
    config: FailedStoreConfig,
    writer: Mutex<()>,
}

impl<K: KeyValueStore> FailedSendStore<K> {
    /// Create a store with default settings.
    pub fn new(kv: K) -> Self {
        Self::with_config(kv, FailedStoreConfig::default())
    }

    /// Create a store with explicit settings.
    ///
    /// A cap below one is raised to one, so a save always keeps the record
    /// it just wrote.
    pub fn with_config(kv: K, mut config: FailedStoreConfig) -> Self {
        config.max_records = config.max_records.max(1);
        Self {
            kv,
            config,
            writer: Mutex::new(()),
        }
    }

    /// The active settings.
    pub const fn config(&self) -> &FailedStoreConfig {
        &self.config
    }

    /// The underlying key-value store.
    pub const fn backing(&self) -> &K {
        &self.kv
    }

    /// Record a failed send.
    ///
    /// The new record goes to the front. Any older record for the same
    /// message id is replaced, then the list is truncated to `max_records`.
    pub async fn save(&self, message: Message, conversation_id: ConversationId) {
        let _guard = self.writer.lock().await;
        let mut records = self.read_records().await;
        records.retain(|r| r.message.id != message.id);
        let message_id = message.id.clone();
        records.insert(0, FailedMessageRecord::new(message, conversation_id));
        if records.len() > self.config.max_records {
            let evicted = records.len() - self.config.max_records;
            records.truncate(self.config.max_records);
            tracing::debug!(evicted, "failed-send store over capacity, oldest evicted");
        }
        if self.write_records(&records).await {
            tracing::info!(message_id = %message_id, total = records.len(), "failed send recorded");
        }
    }

    /// Drop the record for `message_id`. Unknown ids are a no-op.
    pub async fn remove(&self, message_id: &MessageId) {
        let _guard = self.writer.lock().await;
        let mut records = self.read_records().await;
        let before = records.len();
        records.retain(|r| r.message.id != *message_id);
        if records.len() == before {
            return;
        }
        self.write_records(&records).await;
    }

    /// Every record, newest first.
    pub async fn list_all(&self) -> Vec<FailedMessageRecord> {
        let _guard = self.writer.lock().await;
        self.read_records().await
    }

    /// Records belonging to one conversation, newest first.
    pub async fn list_for_conversation(&self, conversation_id: &ConversationId) -> Vec<FailedMessageRecord> {
        self.list_all()
            .await
            .into_iter()
            .filter(|r| r.conversation_id == *conversation_id)
            .collect()
    }

    /// The record for `message_id`, if any.
    pub async fn find(&self, message_id: &MessageId) -> Option<FailedMessageRecord> {
        self.list_all()
            .await
            .into_iter()
            .find(|r| r.message.id == *message_id)
    }

    /// Whether a record exists for `message_id`.
    pub async fn contains(&self, message_id: &MessageId) -> bool {
        self.find(message_id).await.is_some()
    }

    /// Wipe every record (logout / reset).
    pub async fn clear_all(&self) {
        let _guard = self.writer.lock().await;
        if let Err(err) = self.kv.remove(&self.config.storage_key).await {
            tracing::warn!(error = %err, "failed to clear failed-send store");
        }
    }

    async fn read_records(&self) -> Vec<FailedMessageRecord> {
        let raw = match self.kv.get(&self.config.storage_key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return Vec::new(),
            Err(err) => {
                tracing::warn!(error = %err, "failed-send store unreadable, treating as empty");
                return Vec::new();
            }
        };
        match serde_json::from_str(&raw) {
            Ok(records) => records,
            Err(err) => {
                tracing::warn!(error = %err, "failed-send store corrupt, treating as empty");
                Vec::new()
            }
        }
    }

    async fn write_records(&self, records: &[FailedMessageRecord]) -> bool {
        let encoded = match serde_json::to_string(records) {
            Ok(encoded) => encoded,
            Err(err) => {
                tracing::warn!(error = %err, "failed to encode failed-send records");
                return false;
            }
        };
        match self.kv.set(&self.config.storage_key, encoded).await {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(error = %err, "failed to persist failed-send records");
                false
            }
        }
    }
}
