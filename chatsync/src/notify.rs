//! Local notifications for new incoming messages.
//!
//! [`NotificationDiffer`] compares each conversation summary against the
//! previous cycle's preview text. A notification fires only when all hold:
//!
//! 1. the conversation has a last message now,
//! 2. the conversation was observed in an earlier cycle,
//! 3. the normalized preview text changed,
//! 4. the sender is not the current user.
//!
//! The stored preview is updated after every evaluation, fired or not.

use std::collections::HashMap;

use chatsync_proto::conversation::ConversationSummary;
use chatsync_proto::message::{ConversationId, UserId};

/// Placeholder title when the sender has no display name.
pub const DEFAULT_FALLBACK_NAME: &str = "Someone";

/// A local notification to surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// Sender display name.
    pub title: String,
    /// Preview text.
    pub body: String,
    /// Conversation to open when tapped.
    pub conversation_id: ConversationId,
}

/// Receiver of local notifications.
pub trait NotificationSink: Send + Sync {
    /// Surface one notification.
    fn notify(&self, notification: &Notification);
}

/// Sink that writes notifications to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl NotificationSink for TracingSink {
    fn notify(&self, notification: &Notification) {
        tracing::info!(
            conversation = %notification.conversation_id,
            title = %notification.title,
            body = %notification.body,
            "notification"
        );
    }
}

/// Decides, once per summary update, which conversations deserve a notification.
pub struct NotificationDiffer<N> {
    current_user: UserId,
    fallback_name: String,
    /// Presence of a key is the "seen" marker; the value is the last preview.
    previous: HashMap<ConversationId, Option<String>>,
    sink: N,
}

impl<N: NotificationSink> NotificationDiffer<N> {
    /// Create a differ for `current_user` with the default placeholder name.
    pub fn new(current_user: UserId, sink: N) -> Self {
        Self::with_fallback_name(current_user, DEFAULT_FALLBACK_NAME, sink)
    }

    /// Create a differ with a custom placeholder name.
    pub fn with_fallback_name(current_user: UserId, fallback_name: impl Into<String>, sink: N) -> Self {
        Self {
            current_user,
            fallback_name: fallback_name.into(),
            previous: HashMap::new(),
            sink,
        }
    }

    /// Evaluate one update cycle, notify the sink, and return what fired.
    pub fn observe(&mut self, summaries: &[ConversationSummary]) -> Vec<Notification> {
        let mut fired = Vec::new();
        for summary in summaries {
            let current = summary.last_text().map(str::to_owned);
            let previous = self.previous.insert(summary.id.clone(), current.clone());

            let Some(text) = current else {
                continue;
            };
            let Some(previous) = previous else {
                tracing::debug!(conversation = %summary.id, "first observation, not notifying");
                continue;
            };
            if previous.as_deref() == Some(text.as_str()) {
                continue;
            }
            if summary.last_sender_id().as_ref() == Some(&self.current_user) {
                continue;
            }

            let title = summary
                .last_sender_name()
                .unwrap_or(self.fallback_name.as_str())
                .to_string();
            let notification = Notification {
                title,
                body: text,
                conversation_id: summary.id.clone(),
            };
            self.sink.notify(&notification);
            fired.push(notification);
        }
        fired
    }

    /// Forget one conversation; its next observation counts as the first.
    pub fn forget(&mut self, conversation: &ConversationId) {
        self.previous.remove(conversation);
    }

    /// Forget everything (logout).
    pub fn reset(&mut self) {
        self.previous.clear();
    }

    /// Switch to another user and forget everything.
    pub fn set_current_user(&mut self, user: UserId) {
        self.current_user = user;
        self.reset();
    }

    /// Whether the conversation has been observed.
    #[must_use]
    pub fn has_seen(&self, conversation: &ConversationId) -> bool {
        self.previous.contains_key(conversation)
    }
}
