//! Boundary contracts for the hosted message store.
//!
//! The engine never talks to a network directly. It consumes three
//! capabilities of an ordered, queryable event source:
//! - [`LiveSource`]: a live subscription delivering ordered change batches
//! - [`HistorySource`]: a cursor-based "fetch older than X" query
//! - [`WritePath`]: appending a message and learning its assigned id
//!
//! [`memory::MemoryBackend`] implements all three in-process for tests and
//! the demo binary.

pub mod memory;

use std::fmt;
use std::pin::Pin;

use futures_util::Stream;

use chatsync_proto::message::{ConversationId, Message, MessageId, RawMessage, Timestamp, UserId};

/// Errors reported by the live subscription or the history query.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SourceError {
    /// The backend cannot be reached.
    #[error("source unavailable: {0}")]
    Unavailable(String),

    /// The query needs a server-side index that does not exist.
    #[error("missing server-side index: {0}")]
    MissingIndex(String),

    /// The current user may not read this conversation.
    #[error("permission denied")]
    PermissionDenied,

    /// The live stream ended without being cancelled.
    #[error("stream closed by source")]
    StreamClosed,

    /// The operation did not complete in time.
    #[error("source operation timed out")]
    Timeout,
}

/// Errors reported by the write path.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WriteError {
    /// The backend rejected or could not complete the write.
    #[error("write rejected: {0}")]
    Rejected(String),

    /// The write did not complete in time.
    #[error("write timed out")]
    Timeout,

    /// The current user may not write to this conversation.
    #[error("permission denied")]
    PermissionDenied,
}

/// Result of a successful append.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteAck {
    /// The server persisted the message under this id.
    Persisted(MessageId),
    /// The write was accepted for deferred delivery under this id.
    Queued(MessageId),
}

impl WriteAck {
    /// Returns the id assigned by the write path.
    #[must_use]
    pub const fn id(&self) -> &MessageId {
        match self {
            Self::Persisted(id) | Self::Queued(id) => id,
        }
    }
}

/// Filter and order applied to a live subscription.
///
/// Encodes "participants contains me, order by createdAt desc, limit N".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionQuery {
    /// Only messages listing this user as participant are delivered.
    pub participant: UserId,
    /// Size of the newest window delivered with each batch.
    pub limit: usize,
}

impl fmt::Display for SubscriptionQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "participants contains {} order by createdAt desc limit {}",
            self.participant, self.limit
        )
    }
}

/// Ordered batches delivered by a live subscription.
///
/// Each item is one change batch, newest first. Dropping the stream
/// unsubscribes.
pub type BatchStream = Pin<Box<dyn Stream<Item = Result<Vec<RawMessage>, SourceError>> + Send>>;

/// Live subscription capability.
pub trait LiveSource: Send + Sync + 'static {
    /// Open a live subscription for one conversation.
    fn subscribe(
        &self,
        conversation: &ConversationId,
        query: &SubscriptionQuery,
    ) -> impl std::future::Future<Output = Result<BatchStream, SourceError>> + Send;
}

/// Paginated history capability.
pub trait HistorySource: Send + Sync + 'static {
    /// Fetch up to `limit` messages strictly older than `cursor`, newest first.
    ///
    /// A `None` cursor fetches the newest page.
    fn query_older_than(
        &self,
        conversation: &ConversationId,
        cursor: Option<Timestamp>,
        limit: usize,
    ) -> impl std::future::Future<Output = Result<Vec<RawMessage>, SourceError>> + Send;
}

/// Write capability.
///
/// Network timeouts are the implementation's concern; the engine only sees
/// the final outcome.
pub trait WritePath: Send + Sync + 'static {
    /// Append a message to a conversation.
    fn append_message(
        &self,
        conversation: &ConversationId,
        message: &Message,
    ) -> impl std::future::Future<Output = Result<WriteAck, WriteError>> + Send;
}
