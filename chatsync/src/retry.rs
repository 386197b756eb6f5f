//! Optimistic sends, failure recording, retry and discard.
//!
//! [`RetryCoordinator`] is the only writer of a provisional entry's status.
//! A send inserts the entry as `sending`, then awaits the write path:
//!
//! - success: the entry becomes `sent` (or `queued`) and is linked to the
//!   assigned id, so the persisted copy replaces it when it arrives;
//! - failure: the entry becomes `failed` and a durable record is saved.
//!
//! Timeline updates after the write are epoch-guarded like every other
//! asynchronous result. The durable record is written even if the view
//! was closed meanwhile, so the failure is listed on the next open.

use std::sync::Arc;

use chatsync_proto::message::{
    ConversationId, Message, MessageId, MessageStatus, UserId, ValidationError,
};

use crate::failed::FailedSendStore;
use crate::source::{WriteAck, WriteError, WritePath};
use crate::storage::KeyValueStore;
use crate::timeline::{Epoch, SharedTimeline};

/// A message the local user wants to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Draft {
    /// Message body.
    pub text: String,
    /// Author id.
    pub sender_id: UserId,
    /// Author display name.
    pub sender_name: String,
    /// Conversation members at send time.
    pub participants: Vec<UserId>,
}

impl Draft {
    fn into_message(self) -> Message {
        Message::provisional(self.text, self.sender_id, self.sender_name, self.participants)
    }
}

/// Result of a send or retry attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// The server persisted the message.
    Delivered {
        /// Local id of the provisional entry.
        provisional_id: MessageId,
        /// Id assigned by the write path.
        assigned_id: MessageId,
    },
    /// The write path accepted the message for deferred delivery.
    Queued {
        /// Local id of the provisional entry.
        provisional_id: MessageId,
        /// Id assigned by the write path.
        assigned_id: MessageId,
    },
    /// The write failed; the entry is marked failed and recorded.
    Failed {
        /// Local id of the failed entry.
        provisional_id: MessageId,
        /// Why the write failed.
        reason: WriteError,
    },
    /// The draft was invalid and never reached the timeline.
    Rejected(ValidationError),
    /// The view was closed before the send started.
    Closed,
}

/// Bridges optimistic sends, the write path and the failed-send store.
pub struct RetryCoordinator<W, K> {
    writer: Arc<W>,
    store: Arc<FailedSendStore<K>>,
}

impl<W, K> Clone for RetryCoordinator<W, K> {
    fn clone(&self) -> Self {
        Self {
            writer: Arc::clone(&self.writer),
            store: Arc::clone(&self.store),
        }
    }
}

impl<W: WritePath, K: KeyValueStore> RetryCoordinator<W, K> {
    /// Create a coordinator.
    pub const fn new(writer: Arc<W>, store: Arc<FailedSendStore<K>>) -> Self {
        Self { writer, store }
    }

    /// The shared failed-send store.
    pub const fn store(&self) -> &Arc<FailedSendStore<K>> {
        &self.store
    }

    /// Validate, insert provisionally, and write a new message.
    pub async fn send(&self, timeline: &SharedTimeline, epoch: Epoch, draft: Draft) -> SendOutcome {
        let message = draft.into_message();
        if let Err(err) = message.validate() {
            tracing::debug!(error = %err, "draft rejected");
            return SendOutcome::Rejected(err);
        }
        let pending = message.clone();
        let Some(conversation) = timeline.apply_if_current(epoch, move |t| {
            t.insert_provisional(pending);
            t.conversation().clone()
        }) else {
            return SendOutcome::Closed;
        };
        self.deliver(timeline, epoch, &conversation, message, false).await
    }

    /// Re-attempt a recorded failed send.
    ///
    /// Returns `None` when no failed record exists for `message_id` in the
    /// timeline's conversation. A record from another conversation is left
    /// untouched and nothing is written.
    pub async fn retry(
        &self,
        timeline: &SharedTimeline,
        epoch: Epoch,
        message_id: &MessageId,
    ) -> Option<SendOutcome> {
        let record = self.store.find(message_id).await?;
        let conversation = timeline.read(|t| t.conversation().clone());
        if record.conversation_id != conversation {
            tracing::warn!(
                message_id = %message_id,
                recorded = %record.conversation_id,
                requested = %conversation,
                "retry for a failed send of another conversation ignored"
            );
            return None;
        }
        let mut message = record.message;
        message.status = MessageStatus::Sending;

        let pending = message.clone();
        timeline.apply_if_current(epoch, move |t| {
            if !t.update_status(&pending.id, MessageStatus::Sending) {
                t.insert_provisional(pending);
            }
        });
        tracing::info!(message_id = %message.id, conversation = %record.conversation_id, "retrying failed send");
        Some(
            self.deliver(timeline, epoch, &record.conversation_id, message, true)
                .await,
        )
    }

    /// Drop a failed send: forget its record and remove the entry.
    ///
    /// Returns `true` if a timeline entry was removed.
    pub async fn discard(&self, timeline: &SharedTimeline, epoch: Epoch, message_id: &MessageId) -> bool {
        self.store.remove(message_id).await;
        timeline
            .apply_if_current(epoch, |t| t.remove(message_id).is_some())
            .unwrap_or(false)
    }

    /// Re-insert every recorded failure of the timeline's conversation.
    ///
    /// Returns the number of entries inserted.
    pub async fn restore(&self, timeline: &SharedTimeline, epoch: Epoch) -> usize {
        let conversation = timeline.read(|t| t.conversation().clone());
        let records = self.store.list_for_conversation(&conversation).await;
        if records.is_empty() {
            return 0;
        }
        timeline
            .apply_if_current(epoch, |t| {
                let mut inserted = 0;
                // Oldest first so the newest failure ends up in front.
                for record in records.into_iter().rev() {
                    if t.contains(&record.message.id) {
                        continue;
                    }
                    let mut message = record.message;
                    message.status = MessageStatus::Failed;
                    t.insert_provisional(message);
                    inserted += 1;
                }
                inserted
            })
            .unwrap_or(0)
    }

    async fn deliver(
        &self,
        timeline: &SharedTimeline,
        epoch: Epoch,
        conversation: &ConversationId,
        message: Message,
        recorded: bool,
    ) -> SendOutcome {
        let provisional_id = message.id.clone();
        match self.writer.append_message(conversation, &message).await {
            Ok(ack) => {
                let status = match ack {
                    WriteAck::Persisted(_) => MessageStatus::Sent,
                    WriteAck::Queued(_) => MessageStatus::Queued,
                };
                let assigned_id = ack.id().clone();
                timeline.apply_if_current(epoch, |t| {
                    t.update_status(&provisional_id, status);
                    t.confirm_provisional(&provisional_id, assigned_id.clone());
                });
                if recorded {
                    self.store.remove(&provisional_id).await;
                }
                tracing::debug!(
                    conversation = %conversation,
                    provisional = %provisional_id,
                    assigned = %assigned_id,
                    queued = matches!(ack, WriteAck::Queued(_)),
                    "send confirmed"
                );
                match ack {
                    WriteAck::Persisted(_) => SendOutcome::Delivered {
                        provisional_id,
                        assigned_id,
                    },
                    WriteAck::Queued(_) => SendOutcome::Queued {
                        provisional_id,
                        assigned_id,
                    },
                }
            }
            Err(reason) => {
                tracing::warn!(
                    conversation = %conversation,
                    message_id = %provisional_id,
                    error = %reason,
                    "send failed"
                );
                timeline.apply_if_current(epoch, |t| t.update_status(&provisional_id, MessageStatus::Failed));
                let mut failed = message;
                failed.status = MessageStatus::Failed;
                self.store.save(failed, conversation.clone()).await;
                SendOutcome::Failed {
                    provisional_id,
                    reason,
                }
            }
        }
    }
}
