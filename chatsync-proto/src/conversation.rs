//! Conversation-level summaries read by the notification differ.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::message::{ConversationId, RawTimestamp, UserId};

/// Preview of the most recent message in a conversation.
///
/// Older clients wrote the preview as a bare string, newer ones as an
/// object carrying the text alongside other fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LastMessage {
    /// Bare preview text.
    Text(String),
    /// Structured preview.
    Object(LastMessageObject),
}

/// Structured form of [`LastMessage`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LastMessageObject {
    /// Preview text.
    pub text: Option<String>,
    /// Sender of the previewed message.
    pub sender_id: Option<String>,
}

impl LastMessage {
    /// Returns the preview text regardless of representation.
    ///
    /// Empty text counts as no message.
    #[must_use]
    pub fn normalized_text(&self) -> Option<&str> {
        let text = match self {
            Self::Text(text) => Some(text.as_str()),
            Self::Object(obj) => obj.text.as_deref(),
        };
        text.filter(|t| !t.is_empty())
    }
}

/// Display details for one participant.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ParticipantDetail {
    /// Display name.
    pub name: Option<String>,
    /// Avatar URL.
    pub avatar_url: Option<String>,
}

/// The subset of a conversation record relevant to notifications.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    /// Conversation id.
    pub id: ConversationId,
    /// Preview of the latest message.
    #[serde(default)]
    pub last_message: Option<LastMessage>,
    /// Time of the latest message.
    #[serde(default)]
    pub last_message_at: Option<RawTimestamp>,
    /// Sender of the latest message.
    #[serde(default)]
    pub last_message_sender_id: Option<UserId>,
    /// Participant display details keyed by user id.
    #[serde(default)]
    pub participant_details: HashMap<UserId, ParticipantDetail>,
}

impl ConversationSummary {
    /// Creates a summary with no last message.
    #[must_use]
    pub fn new(id: ConversationId) -> Self {
        Self {
            id,
            last_message: None,
            last_message_at: None,
            last_message_sender_id: None,
            participant_details: HashMap::new(),
        }
    }

    /// Normalized text of the latest message, if any.
    #[must_use]
    pub fn last_text(&self) -> Option<&str> {
        self.last_message.as_ref().and_then(LastMessage::normalized_text)
    }

    /// Sender of the latest message.
    ///
    /// Prefers the top-level field, then the structured preview's sender.
    #[must_use]
    pub fn last_sender_id(&self) -> Option<UserId> {
        if let Some(sender) = &self.last_message_sender_id {
            return Some(sender.clone());
        }
        match &self.last_message {
            Some(LastMessage::Object(obj)) => obj
                .sender_id
                .as_deref()
                .filter(|id| !id.is_empty())
                .map(UserId::new),
            _ => None,
        }
    }

    /// Display name of the sender of the latest message, if known.
    #[must_use]
    pub fn last_sender_name(&self) -> Option<&str> {
        let sender = self.last_sender_id()?;
        self.participant_details
            .get(&sender)?
            .name
            .as_deref()
            .filter(|name| !name.trim().is_empty())
    }
}
