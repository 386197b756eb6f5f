//! Message types shared by every component of the sync engine.
//!
//! Two shapes exist for a message. [`RawMessage`] mirrors the loosely-typed
//! document delivered by the hosted database (every field optional, the
//! creation time in whichever representation the writer used). [`Message`]
//! is the validated form the timeline works with; converting between them is
//! the only place where timestamps are sniffed.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Maximum message length in characters.
pub const MAX_TEXT_CHARS: usize = 10_000;

/// Prefix carried by locally generated (provisional) message ids.
const PROVISIONAL_PREFIX: &str = "local-";

/// Identifier of a message within a conversation.
///
/// Persisted messages carry the id assigned by the write path. Provisional
/// messages carry a locally generated `local-<uuid>` id until the backing
/// write is confirmed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    /// Wraps an id assigned by the transport.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a fresh provisional id (UUID v7, so ids sort by creation).
    #[must_use]
    pub fn provisional() -> Self {
        Self(format!("{PROVISIONAL_PREFIX}{}", Uuid::now_v7()))
    }

    /// Returns the string form of this id.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this id was generated locally rather than by the transport.
    #[must_use]
    pub fn is_provisional(&self) -> bool {
        self.0.starts_with(PROVISIONAL_PREFIX)
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of a conversation (direct thread or group).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(String);

impl ConversationId {
    /// Wraps a conversation id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the string form of this id.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ConversationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of a user (sender or participant).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    /// Wraps a user id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the string form of this id.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Millisecond-precision UTC timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Creates a timestamp for the current instant.
    #[must_use]
    pub fn now() -> Self {
        let millis = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        Self(u64::try_from(millis).unwrap_or(u64::MAX))
    }

    /// Creates a timestamp from milliseconds since the UNIX epoch.
    #[must_use]
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    /// Returns the timestamp as milliseconds since the UNIX epoch.
    #[must_use]
    pub const fn as_millis(&self) -> u64 {
        self.0
    }

    /// Converts a `{seconds, nanoseconds}` server timestamp.
    ///
    /// Returns `None` for times before the epoch or out of range.
    #[must_use]
    pub fn from_server(seconds: i64, nanoseconds: u32) -> Option<Self> {
        let seconds = u64::try_from(seconds).ok()?;
        let millis = seconds
            .checked_mul(1000)?
            .checked_add(u64::from(nanoseconds / 1_000_000))?;
        Some(Self(millis))
    }

    /// Parses an RFC 3339 string (e.g. `2024-05-01T12:00:00.250Z`).
    #[must_use]
    pub fn parse_rfc3339(text: &str) -> Option<Self> {
        let parsed = chrono::DateTime::parse_from_rfc3339(text).ok()?;
        u64::try_from(parsed.timestamp_millis()).ok().map(Self)
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

/// The time a message sorts by.
///
/// Persisted messages sort by their server timestamp. Provisional messages
/// have no server time yet and sort as "now", ahead of every persisted
/// message. This is the only ordering used anywhere in the timeline.
///
/// Serialized as an optional timestamp: `null` is provisional.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "Option<Timestamp>", into = "Option<Timestamp>")]
pub enum EffectiveTime {
    /// Not yet confirmed by the server.
    #[default]
    Provisional,
    /// Server-assigned creation time.
    Server(Timestamp),
}

impl EffectiveTime {
    /// Returns the server timestamp, if one was assigned.
    #[must_use]
    pub const fn server_time(&self) -> Option<Timestamp> {
        match self {
            Self::Provisional => None,
            Self::Server(ts) => Some(*ts),
        }
    }

    /// Whether this time is still provisional.
    #[must_use]
    pub const fn is_provisional(&self) -> bool {
        matches!(self, Self::Provisional)
    }
}

impl Ord for EffectiveTime {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Provisional, Self::Provisional) => Ordering::Equal,
            (Self::Provisional, Self::Server(_)) => Ordering::Greater,
            (Self::Server(_), Self::Provisional) => Ordering::Less,
            (Self::Server(a), Self::Server(b)) => a.cmp(b),
        }
    }
}

impl PartialOrd for EffectiveTime {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl From<Option<Timestamp>> for EffectiveTime {
    fn from(value: Option<Timestamp>) -> Self {
        value.map_or(Self::Provisional, Self::Server)
    }
}

impl From<EffectiveTime> for Option<Timestamp> {
    fn from(value: EffectiveTime) -> Self {
        value.server_time()
    }
}

/// Delivery status of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    /// Written locally, the backing write has not completed.
    Sending,
    /// Persisted by the server.
    Sent,
    /// The backing write definitively failed.
    Failed,
    /// Accepted by the write path for deferred delivery.
    Queued,
}

/// A validated chat message.
///
/// Immutable once sent; only `status` changes, and only while provisional.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Unique id within the conversation.
    pub id: MessageId,
    /// Message body.
    pub text: String,
    /// Sender identity at time of send.
    pub sender_id: UserId,
    /// Sender display name at time of send.
    pub sender_name: String,
    /// Server creation time, or provisional.
    #[serde(default)]
    pub created_at: EffectiveTime,
    /// Delivery status.
    pub status: MessageStatus,
    /// Conversation members at send time (opaque to the engine).
    #[serde(default)]
    pub participants: Vec<UserId>,
}

impl Message {
    /// Builds a provisional message authored locally.
    ///
    /// The message gets a fresh `local-` id, a provisional time and the
    /// `Sending` status.
    pub fn provisional(
        text: impl Into<String>,
        sender_id: UserId,
        sender_name: impl Into<String>,
        participants: Vec<UserId>,
    ) -> Self {
        Self {
            id: MessageId::provisional(),
            text: text.into(),
            sender_id,
            sender_name: sender_name.into(),
            created_at: EffectiveTime::Provisional,
            status: MessageStatus::Sending,
            participants,
        }
    }

    /// Returns the time this message sorts by.
    #[must_use]
    pub const fn effective_time(&self) -> EffectiveTime {
        self.created_at
    }

    /// Validates the message text before a send.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::Empty`] for blank text and
    /// [`ValidationError::TooLong`] above [`MAX_TEXT_CHARS`] characters.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.text.trim().is_empty() {
            return Err(ValidationError::Empty);
        }
        let chars = self.text.chars().count();
        if chars > MAX_TEXT_CHARS {
            return Err(ValidationError::TooLong {
                chars,
                max: MAX_TEXT_CHARS,
            });
        }
        Ok(())
    }
}

/// Error returned when a draft fails validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// Message text is empty or whitespace.
    #[error("message text is empty")]
    Empty,
    /// Message text exceeds the character limit.
    #[error("message too long ({chars} characters, max {max})")]
    TooLong {
        /// Actual length in characters.
        chars: usize,
        /// Maximum allowed length.
        max: usize,
    },
}

/// Error returned when a transport record cannot become a [`Message`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RecordError {
    /// The record has no id (or a blank one).
    #[error("record has no id")]
    MissingId,
    /// The record carries a creation time that cannot be interpreted.
    #[error("record {id} has an unreadable createdAt")]
    InvalidTimestamp {
        /// Id of the offending record.
        id: String,
    },
}

/// Creation time as written by the various clients of the database.
///
/// Server timestamps arrive as `{seconds, nanoseconds}` objects (or the
/// underscore-prefixed admin form), older writers stored epoch milliseconds,
/// and bulk test-data writers stored RFC 3339 strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawTimestamp {
    /// `{seconds, nanoseconds}` server timestamp.
    Server {
        /// Whole seconds since the epoch.
        #[serde(alias = "_seconds")]
        seconds: i64,
        /// Sub-second nanoseconds.
        #[serde(alias = "_nanoseconds", default)]
        nanoseconds: u32,
    },
    /// Milliseconds since the epoch.
    Millis(u64),
    /// RFC 3339 string.
    Iso(String),
}

impl RawTimestamp {
    /// Normalizes to a [`Timestamp`], or `None` when unreadable.
    #[must_use]
    pub fn to_timestamp(&self) -> Option<Timestamp> {
        match self {
            Self::Server {
                seconds,
                nanoseconds,
            } => Timestamp::from_server(*seconds, *nanoseconds),
            Self::Millis(millis) => Some(Timestamp::from_millis(*millis)),
            Self::Iso(text) => Timestamp::parse_rfc3339(text),
        }
    }
}

impl From<Timestamp> for RawTimestamp {
    fn from(value: Timestamp) -> Self {
        Self::Millis(value.as_millis())
    }
}

/// A message document exactly as the transport delivers it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RawMessage {
    /// Document id.
    pub id: Option<String>,
    /// Message body.
    pub text: Option<String>,
    /// Sender id.
    pub sender_id: Option<String>,
    /// Sender display name.
    pub sender_name: Option<String>,
    /// Creation time; absent while the server write is pending.
    pub created_at: Option<RawTimestamp>,
    /// Delivery status; absent means `sent` for persisted documents.
    pub status: Option<MessageStatus>,
    /// Conversation members at send time.
    pub participants: Vec<String>,
}

impl From<&Message> for RawMessage {
    fn from(message: &Message) -> Self {
        Self {
            id: Some(message.id.as_str().to_string()),
            text: Some(message.text.clone()),
            sender_id: Some(message.sender_id.as_str().to_string()),
            sender_name: Some(message.sender_name.clone()),
            created_at: message.created_at.server_time().map(RawTimestamp::from),
            status: Some(message.status),
            participants: message
                .participants
                .iter()
                .map(|p| p.as_str().to_string())
                .collect(),
        }
    }
}

impl TryFrom<RawMessage> for Message {
    type Error = RecordError;

    fn try_from(raw: RawMessage) -> Result<Self, Self::Error> {
        let id = match raw.id {
            Some(id) if !id.trim().is_empty() => id,
            _ => return Err(RecordError::MissingId),
        };

        let created_at = match raw.created_at {
            None => EffectiveTime::Provisional,
            Some(ts) => match ts.to_timestamp() {
                Some(ts) => EffectiveTime::Server(ts),
                None => return Err(RecordError::InvalidTimestamp { id }),
            },
        };

        let status = raw.status.unwrap_or(if created_at.is_provisional() {
            MessageStatus::Sending
        } else {
            MessageStatus::Sent
        });

        Ok(Self {
            id: MessageId::new(id),
            text: raw.text.unwrap_or_default(),
            sender_id: UserId::new(raw.sender_id.unwrap_or_default()),
            sender_name: raw.sender_name.unwrap_or_default(),
            created_at,
            status,
            participants: raw.participants.into_iter().map(UserId::new).collect(),
        })
    }
}
