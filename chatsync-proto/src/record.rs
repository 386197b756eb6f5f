//! Durable record of a send that failed.

use serde::{Deserialize, Serialize};

use crate::message::{ConversationId, Message};

/// A message whose send definitively failed, awaiting retry or discard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedMessageRecord {
    /// The message payload as it was when the send failed.
    pub message: Message,
    /// Conversation the message belongs to.
    pub conversation_id: ConversationId,
    /// When the failure was recorded (RFC 3339).
    pub failed_at: String,
}

impl FailedMessageRecord {
    /// Creates a record stamped with the current time.
    #[must_use]
    pub fn new(message: Message, conversation_id: ConversationId) -> Self {
        Self {
            message,
            conversation_id,
            failed_at: chrono::Utc::now().to_rfc3339(),
        }
    }
}
