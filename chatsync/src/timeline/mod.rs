//! The canonical per-conversation message timeline (merge engine).
//!
//! [`Timeline`] is the single writer of the message array shown for an open
//! conversation. Batches from the live subscription, batches from
//! pagination, and locally authored provisional messages all go through it.
//!
//! # Invariants
//!
//! After every mutation the array is
//! 1. sorted descending by effective time (provisional entries first), and
//! 2. free of duplicate ids.
//!
//! Deduplication is a single pass over the merged array with a hash set of
//! seen ids, keeping the first occurrence. Order is restored with a stable
//! sort only when a merge actually produced an out-of-order pair, so ties
//! keep the order they had in their source batch.

mod shared;

pub use shared::{Epoch, SharedTimeline};

use std::collections::{HashMap, HashSet};

use chatsync_proto::message::{
    ConversationId, Message, MessageId, MessageStatus, RawMessage, Timestamp,
};

/// Counts describing what one merge did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeReport {
    /// Records that survived decoding and were merged.
    pub applied: usize,
    /// Records dropped because they could not be decoded.
    pub dropped_malformed: usize,
    /// Provisional entries replaced by their persisted copy.
    pub reconciled: usize,
}

/// Ordered, deduplicated message list for one conversation.
#[derive(Debug, Clone)]
pub struct Timeline {
    conversation: ConversationId,
    messages: Vec<Message>,
    /// Assigned id -> provisional id, for confirmed sends whose persisted
    /// copy has not arrived yet.
    aliases: HashMap<MessageId, MessageId>,
}

impl Timeline {
    /// Creates an empty timeline.
    #[must_use]
    pub fn new(conversation: ConversationId) -> Self {
        Self {
            conversation,
            messages: Vec::new(),
            aliases: HashMap::new(),
        }
    }

    /// The conversation this timeline belongs to.
    #[must_use]
    pub const fn conversation(&self) -> &ConversationId {
        &self.conversation
    }

    /// Merges a batch from the live subscription.
    ///
    /// The batch is prepended, then duplicates are removed keeping the
    /// first occurrence, so the freshly delivered copy of a message wins.
    /// Re-delivering the same batch leaves the timeline unchanged.
    pub fn apply_realtime_batch(&mut self, batch: Vec<RawMessage>) -> MergeReport {
        let (decoded, dropped_malformed) = self.decode_batch(batch);
        let applied = decoded.len();
        let reconciled = self.reconcile_confirmed(&decoded);

        let mut merged = decoded;
        merged.append(&mut self.messages);
        self.messages = dedup_by_id(merged);
        self.restore_order();

        tracing::debug!(
            conversation = %self.conversation,
            applied,
            dropped_malformed,
            reconciled,
            len = self.messages.len(),
            "applied realtime batch"
        );
        MergeReport {
            applied,
            dropped_malformed,
            reconciled,
        }
    }

    /// Merges a batch of older history from pagination.
    ///
    /// The batch is appended, then duplicates are removed across the whole
    /// timeline (the live stream may have delivered an overlapping message
    /// while the page was in flight). An empty batch changes nothing.
    pub fn apply_older_batch(&mut self, batch: Vec<RawMessage>) -> MergeReport {
        if batch.is_empty() {
            return MergeReport::default();
        }
        let (mut decoded, dropped_malformed) = self.decode_batch(batch);
        let applied = decoded.len();
        let reconciled = self.reconcile_confirmed(&decoded);

        self.messages.append(&mut decoded);
        self.messages = dedup_by_id(std::mem::take(&mut self.messages));
        self.restore_order();

        tracing::debug!(
            conversation = %self.conversation,
            applied,
            dropped_malformed,
            len = self.messages.len(),
            "applied older batch"
        );
        MergeReport {
            applied,
            dropped_malformed,
            reconciled,
        }
    }

    /// Inserts a locally authored message at the front.
    ///
    /// A stale entry with the same id is replaced. No content-based
    /// matching against persisted messages happens here; see
    /// [`confirm_provisional`](Self::confirm_provisional).
    pub fn insert_provisional(&mut self, message: Message) {
        let mut merged = Vec::with_capacity(self.messages.len() + 1);
        merged.push(message);
        merged.append(&mut self.messages);
        self.messages = dedup_by_id(merged);
        self.restore_order();
    }

    /// Sets the status of one entry in place without reordering.
    ///
    /// Returns `false` if no entry has this id.
    pub fn update_status(&mut self, id: &MessageId, status: MessageStatus) -> bool {
        match self.messages.iter_mut().find(|m| m.id == *id) {
            Some(message) => {
                message.status = status;
                true
            }
            None => false,
        }
    }

    /// Links a provisional entry to the id the write path assigned it.
    ///
    /// If the persisted copy is already in the timeline the provisional
    /// entry is dropped right away. Otherwise it is kept until the next
    /// realtime batch carrying `assigned` arrives.
    ///
    /// Returns `true` if the provisional entry was removed immediately.
    pub fn confirm_provisional(&mut self, provisional: &MessageId, assigned: MessageId) -> bool {
        if self.contains(&assigned) {
            self.aliases.remove(&assigned);
            return self.remove(provisional).is_some();
        }
        if self.contains(provisional) {
            self.aliases.insert(assigned, provisional.clone());
        }
        false
    }

    /// Removes an entry, returning it.
    pub fn remove(&mut self, id: &MessageId) -> Option<Message> {
        let index = self.messages.iter().position(|m| m.id == *id)?;
        self.aliases.retain(|_, provisional| provisional != id);
        Some(self.messages.remove(index))
    }

    /// Returns a copy of the ordered messages, newest first.
    ///
    /// The copy is detached from the timeline; mutating it cannot affect
    /// the sort invariant.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Message> {
        self.messages.clone()
    }

    /// Borrows the ordered messages, newest first.
    #[must_use]
    pub fn as_slice(&self) -> &[Message] {
        &self.messages
    }

    /// Looks up an entry by id.
    #[must_use]
    pub fn get(&self, id: &MessageId) -> Option<&Message> {
        self.messages.iter().find(|m| m.id == *id)
    }

    /// Whether an entry with this id exists.
    #[must_use]
    pub fn contains(&self, id: &MessageId) -> bool {
        self.messages.iter().any(|m| m.id == *id)
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Whether the timeline is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Server time of the oldest persisted entry: the pagination cursor.
    #[must_use]
    pub fn oldest_cursor(&self) -> Option<Timestamp> {
        self.messages
            .iter()
            .rev()
            .find_map(|m| m.effective_time().server_time())
    }

    fn decode_batch(&self, batch: Vec<RawMessage>) -> (Vec<Message>, usize) {
        let mut dropped = 0;
        let decoded = batch
            .into_iter()
            .filter_map(|raw| match Message::try_from(raw) {
                Ok(message) => Some(message),
                Err(err) => {
                    dropped += 1;
                    tracing::warn!(
                        conversation = %self.conversation,
                        error = %err,
                        "dropping malformed record"
                    );
                    None
                }
            })
            .collect();
        (decoded, dropped)
    }

    /// Drops provisional entries whose persisted copy is in `incoming`.
    fn reconcile_confirmed(&mut self, incoming: &[Message]) -> usize {
        if self.aliases.is_empty() {
            return 0;
        }
        let confirmed: Vec<MessageId> = incoming
            .iter()
            .filter_map(|m| self.aliases.remove(&m.id))
            .collect();
        if confirmed.is_empty() {
            return 0;
        }
        let confirmed: HashSet<MessageId> = confirmed.into_iter().collect();
        let before = self.messages.len();
        self.messages.retain(|m| !confirmed.contains(&m.id));
        before - self.messages.len()
    }

    fn restore_order(&mut self) {
        if !is_sorted_desc(&self.messages) {
            // Stable: equal times keep their post-dedup order.
            self.messages
                .sort_by(|a, b| b.effective_time().cmp(&a.effective_time()));
        }
    }
}

/// Removes duplicate ids, keeping the first occurrence. O(n).
#[must_use]
pub fn dedup_by_id(messages: Vec<Message>) -> Vec<Message> {
    let mut seen: HashSet<MessageId> = HashSet::with_capacity(messages.len());
    messages
        .into_iter()
        .filter(|m| seen.insert(m.id.clone()))
        .collect()
}

/// Whether `messages` is sorted descending by effective time (ties allowed).
#[must_use]
pub fn is_sorted_desc(messages: &[Message]) -> bool {
    messages
        .windows(2)
        .all(|pair| pair[0].effective_time() >= pair[1].effective_time())
}

/// Whether no two entries share an id.
#[must_use]
pub fn has_unique_ids(messages: &[Message]) -> bool {
    let mut seen = HashSet::with_capacity(messages.len());
    messages.iter().all(|m| seen.insert(&m.id))
}
