//! Per-conversation context objects owned by one signed-in session.
//!
//! [`ChatSession`] keeps one [`ConversationView`] per open conversation.
//! A view bundles the epoch-tagged timeline with its live subscription and
//! history cursor. Opening a conversation that is already open replaces
//! the old view: its subscription is cancelled and its timeline closed, so
//! anything still in flight for it is discarded on arrival.
//!
//! UI-facing changes are reported on a bounded [`SessionEvent`] channel.
//! Delivery is best effort; a full channel drops the event.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::mpsc;

use chatsync_proto::message::{ConversationId, Message, MessageId, RawMessage, UserId};

use crate::config::SyncConfig;
use crate::failed::FailedSendStore;
use crate::pagination::{LoadOutcome, PaginationController};
use crate::retry::{Draft, RetryCoordinator, SendOutcome};
use crate::source::{HistorySource, LiveSource, SourceError, SubscriptionQuery, WriteError, WritePath};
use crate::storage::KeyValueStore;
use crate::subscription::{BatchCallback, ErrorCallback, LiveSubscriptionManager, SubscriptionState};
use crate::timeline::{Epoch, SharedTimeline, Timeline};

/// The signed-in user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalUser {
    /// User id.
    pub id: UserId,
    /// Display name.
    pub name: String,
}

impl LocalUser {
    /// Create a user.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: UserId::new(id),
            name: name.into(),
        }
    }
}

/// Events emitted by the session for the UI layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The conversation's timeline changed.
    TimelineUpdated {
        /// Conversation whose timeline changed.
        conversation: ConversationId,
        /// Number of entries after the change.
        len: usize,
    },
    /// The live subscription reported an error.
    SubscriptionFailed {
        /// Affected conversation.
        conversation: ConversationId,
        /// The error.
        error: SourceError,
    },
    /// A send or retry failed and was recorded.
    SendFailed {
        /// Affected conversation.
        conversation: ConversationId,
        /// Id of the failed entry.
        message_id: MessageId,
        /// Why the write failed.
        reason: WriteError,
    },
}

/// Everything bound to one open conversation.
pub struct ConversationView<B> {
    conversation: ConversationId,
    epoch: Epoch,
    participants: Vec<UserId>,
    timeline: SharedTimeline,
    subscription: LiveSubscriptionManager<B>,
    pagination: PaginationController<B>,
}

impl<B> ConversationView<B> {
    /// The conversation id.
    pub const fn conversation(&self) -> &ConversationId {
        &self.conversation
    }

    /// The epoch this view was opened under.
    pub const fn epoch(&self) -> Epoch {
        self.epoch
    }

    /// The view's timeline.
    pub const fn timeline(&self) -> &SharedTimeline {
        &self.timeline
    }
}

impl<B: LiveSource> ConversationView<B> {
    fn shutdown(&self) {
        self.timeline.close();
        self.subscription.close();
    }
}

/// Owns the open conversation views of one signed-in user.
pub struct ChatSession<B, K> {
    backend: Arc<B>,
    user: Mutex<LocalUser>,
    config: SyncConfig,
    coordinator: RetryCoordinator<B, K>,
    views: Mutex<HashMap<ConversationId, Arc<ConversationView<B>>>>,
    last_epoch: AtomicU64,
    event_tx: mpsc::Sender<SessionEvent>,
}

impl<B, K> ChatSession<B, K>
where
    B: LiveSource + HistorySource + WritePath,
    K: KeyValueStore,
{
    /// Create a session and the receiver for its events.
    pub fn new(
        backend: Arc<B>,
        store: Arc<FailedSendStore<K>>,
        user: LocalUser,
        config: SyncConfig,
    ) -> (Self, mpsc::Receiver<SessionEvent>) {
        let (event_tx, event_rx) = mpsc::channel(config.event_buffer.max(1));
        let session = Self {
            coordinator: RetryCoordinator::new(Arc::clone(&backend), store),
            backend,
            user: Mutex::new(user),
            config,
            views: Mutex::new(HashMap::new()),
            last_epoch: AtomicU64::new(0),
            event_tx,
        };
        (session, event_rx)
    }

    /// The signed-in user.
    pub fn user(&self) -> LocalUser {
        self.user.lock().clone()
    }

    /// The shared failed-send store.
    pub const fn failed_store(&self) -> &Arc<FailedSendStore<K>> {
        self.coordinator.store()
    }

    /// Open (or re-open) a conversation.
    ///
    /// `participants` are the conversation members; the current user is
    /// added if missing. Recorded failures are restored into the fresh
    /// timeline before the live subscription starts. Must be called from
    /// within a Tokio runtime.
    pub async fn open(&self, conversation: ConversationId, participants: Vec<UserId>) -> Arc<ConversationView<B>> {
        let user = self.user();
        let mut participants = participants;
        if !participants.contains(&user.id) {
            participants.insert(0, user.id.clone());
        }

        let epoch = Epoch::new(self.last_epoch.fetch_add(1, Ordering::SeqCst) + 1);
        let timeline = SharedTimeline::new(conversation.clone(), epoch);
        let view = Arc::new(ConversationView {
            conversation: conversation.clone(),
            epoch,
            participants,
            timeline: timeline.clone(),
            subscription: LiveSubscriptionManager::new(
                Arc::clone(&self.backend),
                SubscriptionQuery {
                    participant: user.id,
                    limit: self.config.subscription_limit,
                },
            ),
            pagination: PaginationController::new(Arc::clone(&self.backend), self.config.page_size),
        });

        let previous = self.views.lock().insert(conversation.clone(), Arc::clone(&view));
        if let Some(previous) = previous {
            previous.shutdown();
            tracing::debug!(conversation = %conversation, old = %previous.epoch, new = %epoch, "view replaced");
        }

        let restored = self.coordinator.restore(&timeline, epoch).await;
        if restored > 0 {
            self.emit_updated(&timeline);
        }
        if !timeline.is_current(epoch) {
            return view;
        }

        let batch_timeline = timeline.clone();
        let batch_tx = self.event_tx.clone();
        let on_batch: BatchCallback = Arc::new(move |batch: Vec<RawMessage>| {
            let applied = batch_timeline.apply_if_current(epoch, |t: &mut Timeline| {
                t.apply_realtime_batch(batch);
                t.len()
            });
            if let Some(len) = applied {
                try_emit(
                    &batch_tx,
                    SessionEvent::TimelineUpdated {
                        conversation: batch_timeline.read(|t| t.conversation().clone()),
                        len,
                    },
                );
            }
        });
        let error_tx = self.event_tx.clone();
        let error_conversation = conversation.clone();
        let on_error: ErrorCallback = Arc::new(move |err: &SourceError| {
            try_emit(
                &error_tx,
                SessionEvent::SubscriptionFailed {
                    conversation: error_conversation.clone(),
                    error: err.clone(),
                },
            );
        });
        view.subscription.open(conversation.clone(), on_batch, on_error);
        // Closed while the subscription was being set up.
        if !timeline.is_current(epoch) {
            view.subscription.close();
            return view;
        }
        tracing::info!(conversation = %conversation, epoch = %epoch, restored, "conversation opened");
        view
    }

    /// Close a conversation. Returns `false` if it was not open.
    pub fn close(&self, conversation: &ConversationId) -> bool {
        let Some(view) = self.views.lock().remove(conversation) else {
            return false;
        };
        view.shutdown();
        tracing::info!(conversation = %conversation, "conversation closed");
        true
    }

    /// Close every open conversation.
    pub fn close_all(&self) {
        let views: Vec<_> = self.views.lock().drain().map(|(_, view)| view).collect();
        for view in &views {
            view.shutdown();
        }
        if !views.is_empty() {
            tracing::info!(closed = views.len(), "all conversations closed");
        }
    }

    /// Sign in as another user: close everything and wipe failed records.
    pub async fn switch_user(&self, user: LocalUser) {
        self.close_all();
        self.coordinator.store().clear_all().await;
        tracing::info!(user = %user.id, "switched user");
        *self.user.lock() = user;
    }

    /// Fetch the next older page. `None` if the conversation is not open.
    pub async fn load_older(&self, conversation: &ConversationId) -> Option<LoadOutcome> {
        let view = self.view(conversation)?;
        let outcome = view.pagination.load_older(&view.timeline, view.epoch).await;
        if matches!(outcome, LoadOutcome::Loaded { .. }) {
            self.emit_updated(&view.timeline);
        }
        Some(outcome)
    }

    /// Whether older history may still exist. `None` if not open.
    pub fn has_more_history(&self, conversation: &ConversationId) -> Option<bool> {
        self.view(conversation).map(|view| view.pagination.has_more())
    }

    /// Send a message as the current user. `None` if the conversation is not open.
    pub async fn send(&self, conversation: &ConversationId, text: impl Into<String>) -> Option<SendOutcome> {
        let view = self.view(conversation)?;
        let user = self.user();
        let draft = Draft {
            text: text.into(),
            sender_id: user.id,
            sender_name: user.name,
            participants: view.participants.clone(),
        };
        let outcome = self.coordinator.send(&view.timeline, view.epoch, draft).await;
        self.after_send(&view, &outcome);
        Some(outcome)
    }

    /// Retry a failed send. `None` if not open or no such failed record
    /// belongs to this conversation.
    pub async fn retry(&self, conversation: &ConversationId, message_id: &MessageId) -> Option<SendOutcome> {
        let view = self.view(conversation)?;
        let outcome = self
            .coordinator
            .retry(&view.timeline, view.epoch, message_id)
            .await?;
        self.after_send(&view, &outcome);
        Some(outcome)
    }

    /// Discard a failed send. Returns `true` if an entry was removed.
    pub async fn discard(&self, conversation: &ConversationId, message_id: &MessageId) -> bool {
        let Some(view) = self.view(conversation) else {
            self.coordinator.store().remove(message_id).await;
            return false;
        };
        let removed = self
            .coordinator
            .discard(&view.timeline, view.epoch, message_id)
            .await;
        if removed {
            self.emit_updated(&view.timeline);
        }
        removed
    }

    /// Ordered copy of the conversation's timeline. `None` if not open.
    pub fn snapshot(&self, conversation: &ConversationId) -> Option<Vec<Message>> {
        self.view(conversation).map(|view| view.timeline.snapshot())
    }

    /// State of the conversation's live subscription. `None` if not open.
    pub fn subscription_state(&self, conversation: &ConversationId) -> Option<SubscriptionState> {
        self.view(conversation).map(|view| view.subscription.state())
    }

    /// Re-open a failed live subscription. Returns `true` if a retry started.
    pub fn retry_subscription(&self, conversation: &ConversationId) -> bool {
        self.view(conversation)
            .and_then(|view| view.subscription.retry())
            .is_some()
    }

    /// Whether the conversation is open.
    pub fn is_open(&self, conversation: &ConversationId) -> bool {
        self.views.lock().contains_key(conversation)
    }

    /// Ids of all open conversations.
    pub fn open_conversations(&self) -> Vec<ConversationId> {
        self.views.lock().keys().cloned().collect()
    }

    fn view(&self, conversation: &ConversationId) -> Option<Arc<ConversationView<B>>> {
        self.views.lock().get(conversation).cloned()
    }

    fn after_send(&self, view: &ConversationView<B>, outcome: &SendOutcome) {
        match outcome {
            SendOutcome::Rejected(_) | SendOutcome::Closed => {}
            SendOutcome::Failed {
                provisional_id,
                reason,
            } => {
                try_emit(
                    &self.event_tx,
                    SessionEvent::SendFailed {
                        conversation: view.conversation.clone(),
                        message_id: provisional_id.clone(),
                        reason: reason.clone(),
                    },
                );
                self.emit_updated(&view.timeline);
            }
            SendOutcome::Delivered { .. } | SendOutcome::Queued { .. } => {
                self.emit_updated(&view.timeline);
            }
        }
    }

    fn emit_updated(&self, timeline: &SharedTimeline) {
        if !timeline.is_open() {
            return;
        }
        let (conversation, len) = timeline.read(|t| (t.conversation().clone(), t.len()));
        try_emit(&self.event_tx, SessionEvent::TimelineUpdated { conversation, len });
    }
}

impl<B, K> Drop for ChatSession<B, K> {
    fn drop(&mut self) {
        for (_, view) in self.views.get_mut().drain() {
            view.timeline.close();
        }
    }
}

fn try_emit(tx: &mpsc::Sender<SessionEvent>, event: SessionEvent) {
    if tx.try_send(event).is_err() {
        tracing::debug!("session event channel full or closed, event dropped");
    }
}
