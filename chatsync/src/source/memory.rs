//! In-process message backend for tests and the demo binary.
//!
//! [`MemoryBackend`] implements [`LiveSource`], [`HistorySource`] and
//! [`WritePath`] over a per-conversation message list. It behaves like a
//! hosted document store with snapshot listeners: after every write, each
//! subscriber of the conversation receives the newest `limit` messages
//! (newest first) as one batch. Ids and timestamps are assigned by the
//! backend from a deterministic logical clock.
//!
//! Failure switches make every boundary error reproducible.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use chatsync_proto::message::{
    ConversationId, EffectiveTime, Message, MessageId, MessageStatus, RawMessage, Timestamp,
    UserId,
};

use super::{
    BatchStream, HistorySource, LiveSource, SourceError, SubscriptionQuery, WriteAck, WriteError,
    WritePath,
};

/// Capacity of each subscriber's batch channel.
const SUBSCRIBER_BUFFER: usize = 64;

/// Default start of the logical clock (2024-01-01T00:00:00Z).
const DEFAULT_CLOCK_START_MS: u64 = 1_704_067_200_000;

/// Milliseconds the logical clock advances per write.
const CLOCK_STEP_MS: u64 = 1_000;

type BatchSender = mpsc::Sender<Result<Vec<RawMessage>, SourceError>>;

struct Subscriber {
    query: SubscriptionQuery,
    tx: BatchSender,
}

#[derive(Default)]
struct Failures {
    write: Option<WriteError>,
    query: Option<SourceError>,
    subscribe: Option<SourceError>,
    write_delay: Option<Duration>,
    query_delay: Option<Duration>,
    queue_writes: bool,
}

struct BackendState {
    /// Messages per conversation, oldest first.
    messages: HashMap<ConversationId, Vec<Message>>,
    /// Writes accepted for deferred delivery, in acceptance order.
    queued: Vec<(ConversationId, Message)>,
    subscribers: HashMap<ConversationId, Vec<Subscriber>>,
    clock_ms: u64,
    next_id: u64,
}

impl BackendState {
    fn next_id(&mut self) -> MessageId {
        self.next_id += 1;
        MessageId::new(format!("m{:06}", self.next_id))
    }

    fn tick(&mut self) -> Timestamp {
        self.clock_ms += CLOCK_STEP_MS;
        Timestamp::from_millis(self.clock_ms)
    }

    fn persist(&mut self, conversation: &ConversationId, mut message: Message) {
        message.created_at = EffectiveTime::Server(self.tick());
        message.status = MessageStatus::Sent;
        self.messages
            .entry(conversation.clone())
            .or_default()
            .push(message);
    }

    fn window(&self, conversation: &ConversationId, query: &SubscriptionQuery) -> Vec<RawMessage> {
        self.messages
            .get(conversation)
            .map(|list| {
                list.iter()
                    .rev()
                    .filter(|m| m.participants.contains(&query.participant))
                    .take(query.limit)
                    .map(RawMessage::from)
                    .collect()
            })
            .unwrap_or_default()
    }

    fn broadcast(&mut self, conversation: &ConversationId) {
        if let Some(subscribers) = self.subscribers.get_mut(conversation) {
            subscribers.retain(|s| !s.tx.is_closed());
        }
        let Some(subscribers) = self.subscribers.get(conversation) else {
            return;
        };
        for subscriber in subscribers {
            let batch = self.window(conversation, &subscriber.query);
            if subscriber.tx.try_send(Ok(batch)).is_err() {
                tracing::debug!(conversation = %conversation, "subscriber lagging, batch skipped");
            }
        }
    }
}

/// In-memory message backend with snapshot-style live subscriptions.
pub struct MemoryBackend {
    state: Mutex<BackendState>,
    failures: Mutex<Failures>,
    query_count: AtomicUsize,
    write_count: AtomicUsize,
}

impl MemoryBackend {
    /// Creates an empty backend with the default clock start.
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock_start(Timestamp::from_millis(DEFAULT_CLOCK_START_MS))
    }

    /// Creates an empty backend whose first write is stamped one step after `start`.
    #[must_use]
    pub fn with_clock_start(start: Timestamp) -> Self {
        Self {
            state: Mutex::new(BackendState {
                messages: HashMap::new(),
                queued: Vec::new(),
                subscribers: HashMap::new(),
                clock_ms: start.as_millis(),
                next_id: 0,
            }),
            failures: Mutex::new(Failures::default()),
            query_count: AtomicUsize::new(0),
            write_count: AtomicUsize::new(0),
        }
    }

    /// Writes `count` messages from `sender` as server-side history.
    ///
    /// Returns the assigned ids, oldest first.
    pub fn seed_history(
        &self,
        conversation: &ConversationId,
        sender: &UserId,
        participants: &[UserId],
        count: usize,
    ) -> Vec<MessageId> {
        let mut state = self.state.lock();
        let mut ids = Vec::with_capacity(count);
        for i in 0..count {
            let id = state.next_id();
            let message = Message {
                id: id.clone(),
                text: format!("history {i}"),
                sender_id: sender.clone(),
                sender_name: sender.as_str().to_string(),
                created_at: EffectiveTime::Provisional,
                status: MessageStatus::Sent,
                participants: participants.to_vec(),
            };
            state.persist(conversation, message);
            ids.push(id);
        }
        state.broadcast(conversation);
        ids
    }

    /// Writes one message on behalf of another user and notifies subscribers.
    pub fn push_incoming(
        &self,
        conversation: &ConversationId,
        sender: &UserId,
        text: &str,
        participants: &[UserId],
    ) -> MessageId {
        let mut state = self.state.lock();
        let id = state.next_id();
        let message = Message {
            id: id.clone(),
            text: text.to_string(),
            sender_id: sender.clone(),
            sender_name: sender.as_str().to_string(),
            created_at: EffectiveTime::Provisional,
            status: MessageStatus::Sent,
            participants: participants.to_vec(),
        };
        state.persist(conversation, message);
        state.broadcast(conversation);
        id
    }

    /// Delivers an arbitrary batch to every subscriber of a conversation.
    ///
    /// Bypasses storage; used to inject malformed or replayed batches.
    pub fn emit_raw(&self, conversation: &ConversationId, batch: &[RawMessage]) {
        let state = self.state.lock();
        if let Some(subscribers) = state.subscribers.get(conversation) {
            for subscriber in subscribers {
                let _ = subscriber.tx.try_send(Ok(batch.to_vec()));
            }
        }
    }

    /// Sends an error to every subscriber of a conversation.
    pub fn break_streams(&self, conversation: &ConversationId, error: &SourceError) {
        let state = self.state.lock();
        if let Some(subscribers) = state.subscribers.get(conversation) {
            for subscriber in subscribers {
                let _ = subscriber.tx.try_send(Err(error.clone()));
            }
        }
    }

    /// Ends every live stream of a conversation without an error.
    pub fn drop_streams(&self, conversation: &ConversationId) {
        self.state.lock().subscribers.remove(conversation);
    }

    /// Persists every queued write and notifies subscribers.
    ///
    /// Returns the number of writes delivered.
    pub fn flush_queued(&self) -> usize {
        let mut state = self.state.lock();
        let queued = std::mem::take(&mut state.queued);
        let count = queued.len();
        let mut touched = Vec::new();
        for (conversation, message) in queued {
            state.persist(&conversation, message);
            if !touched.contains(&conversation) {
                touched.push(conversation);
            }
        }
        for conversation in &touched {
            state.broadcast(conversation);
        }
        count
    }

    /// Makes every subsequent write fail with `error` (or succeed with `None`).
    pub fn set_write_failure(&self, error: Option<WriteError>) {
        self.failures.lock().write = error;
    }

    /// Makes every subsequent history query fail with `error`.
    pub fn set_query_failure(&self, error: Option<SourceError>) {
        self.failures.lock().query = error;
    }

    /// Makes every subsequent subscribe call fail with `error`.
    pub fn set_subscribe_failure(&self, error: Option<SourceError>) {
        self.failures.lock().subscribe = error;
    }

    /// Delays every write by `delay` before it is applied.
    pub fn set_write_delay(&self, delay: Option<Duration>) {
        self.failures.lock().write_delay = delay;
    }

    /// Delays every history query by `delay` before it is answered.
    pub fn set_query_delay(&self, delay: Option<Duration>) {
        self.failures.lock().query_delay = delay;
    }

    /// Accepts writes for deferred delivery instead of persisting them.
    pub fn set_queue_writes(&self, queue: bool) {
        self.failures.lock().queue_writes = queue;
    }

    /// Number of history queries answered (or failed) so far.
    pub fn query_count(&self) -> usize {
        self.query_count.load(Ordering::SeqCst)
    }

    /// Number of write attempts so far.
    pub fn write_count(&self) -> usize {
        self.write_count.load(Ordering::SeqCst)
    }

    /// Number of live subscribers of a conversation whose stream is still open.
    pub fn subscriber_count(&self, conversation: &ConversationId) -> usize {
        self.state
            .lock()
            .subscribers
            .get(conversation)
            .map_or(0, |subs| subs.iter().filter(|s| !s.tx.is_closed()).count())
    }

    /// Number of persisted messages in a conversation.
    pub fn message_count(&self, conversation: &ConversationId) -> usize {
        self.state
            .lock()
            .messages
            .get(conversation)
            .map_or(0, Vec::len)
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl LiveSource for MemoryBackend {
    async fn subscribe(
        &self,
        conversation: &ConversationId,
        query: &SubscriptionQuery,
    ) -> Result<BatchStream, SourceError> {
        if let Some(err) = self.failures.lock().subscribe.clone() {
            return Err(err);
        }

        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        {
            let mut state = self.state.lock();
            let initial = state.window(conversation, query);
            let _ = tx.try_send(Ok(initial));
            state
                .subscribers
                .entry(conversation.clone())
                .or_default()
                .push(Subscriber {
                    query: query.clone(),
                    tx,
                });
        }

        let stream = futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        Ok(Box::pin(stream))
    }
}

impl HistorySource for MemoryBackend {
    async fn query_older_than(
        &self,
        conversation: &ConversationId,
        cursor: Option<Timestamp>,
        limit: usize,
    ) -> Result<Vec<RawMessage>, SourceError> {
        self.query_count.fetch_add(1, Ordering::SeqCst);
        let (delay, failure) = {
            let failures = self.failures.lock();
            (failures.query_delay, failures.query.clone())
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = failure {
            return Err(err);
        }

        let state = self.state.lock();
        let page = state
            .messages
            .get(conversation)
            .map(|list| {
                list.iter()
                    .rev()
                    .filter(|m| match (cursor, m.created_at.server_time()) {
                        (None, _) => true,
                        (Some(cursor), Some(ts)) => ts < cursor,
                        (Some(_), None) => false,
                    })
                    .take(limit)
                    .map(RawMessage::from)
                    .collect()
            })
            .unwrap_or_default();
        Ok(page)
    }
}

impl WritePath for MemoryBackend {
    async fn append_message(
        &self,
        conversation: &ConversationId,
        message: &Message,
    ) -> Result<WriteAck, WriteError> {
        self.write_count.fetch_add(1, Ordering::SeqCst);
        let delay = self.failures.lock().write_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let (failure, queue) = {
            let failures = self.failures.lock();
            (failures.write.clone(), failures.queue_writes)
        };
        if let Some(err) = failure {
            return Err(err);
        }

        let mut state = self.state.lock();
        let id = state.next_id();
        let mut stored = message.clone();
        stored.id = id.clone();
        if queue {
            state.queued.push((conversation.clone(), stored));
            return Ok(WriteAck::Queued(id));
        }
        state.persist(conversation, stored);
        state.broadcast(conversation);
        Ok(WriteAck::Persisted(id))
    }
}
