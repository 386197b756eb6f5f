//! Lifecycle of the live subscription for one conversation view.
//!
//! [`LiveSubscriptionManager`] owns at most one active subscription. Each
//! `open` spawns a forwarding task that pulls batches from the source
//! stream and hands them to the `on_batch` callback. Cancelling is
//! idempotent and aborts the task; a cancelled task never invokes a
//! callback again and never overwrites the published state.
//!
//! State machine: `Closed -> Opening -> Open -> (Error | Closed)`, with
//! `Error -> Opening` through [`LiveSubscriptionManager::retry`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use chatsync_proto::message::{ConversationId, RawMessage};

use crate::source::{LiveSource, SourceError, SubscriptionQuery};

/// Callback receiving every batch delivered by the live stream.
pub type BatchCallback = Arc<dyn Fn(Vec<RawMessage>) + Send + Sync>;

/// Callback receiving transport-level subscription errors.
pub type ErrorCallback = Arc<dyn Fn(&SourceError) + Send + Sync>;

/// Published state of a [`LiveSubscriptionManager`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SubscriptionState {
    /// No subscription.
    #[default]
    Closed,
    /// `subscribe` has been issued, no stream yet.
    Opening,
    /// The stream is delivering batches.
    Open,
    /// The subscription failed; already-loaded history stays visible.
    Error(SourceError),
}

#[derive(Debug, Default)]
struct CancelToken {
    cancelled: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl CancelToken {
    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Returns `true` only for the call that actually cancelled.
    fn cancel(&self) -> bool {
        let first = !self.cancelled.swap(true, Ordering::SeqCst);
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        first
    }
}

/// Cancellation handle returned by [`LiveSubscriptionManager::open`].
///
/// Calling [`cancel`](Self::cancel) any number of times is safe. Dropping
/// the handle does not cancel; the manager still owns the subscription.
#[derive(Debug)]
pub struct SubscriptionHandle {
    token: Arc<CancelToken>,
    state: Arc<watch::Sender<SubscriptionState>>,
}

impl SubscriptionHandle {
    /// Stop the subscription. Subsequent calls do nothing.
    pub fn cancel(&self) {
        if self.token.cancel() {
            self.state.send_replace(SubscriptionState::Closed);
        }
    }

    /// Whether this subscription has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

struct Active {
    conversation: ConversationId,
    on_batch: BatchCallback,
    on_error: ErrorCallback,
    token: Arc<CancelToken>,
}

/// Owns the live subscription of one conversation view.
pub struct LiveSubscriptionManager<L> {
    source: Arc<L>,
    query: SubscriptionQuery,
    state: Arc<watch::Sender<SubscriptionState>>,
    active: Mutex<Option<Active>>,
}

impl<L: LiveSource> LiveSubscriptionManager<L> {
    /// Create a closed manager subscribing with `query`.
    pub fn new(source: Arc<L>, query: SubscriptionQuery) -> Self {
        let (state, _) = watch::channel(SubscriptionState::Closed);
        Self {
            source,
            query,
            state: Arc::new(state),
            active: Mutex::new(None),
        }
    }

    /// Open the live subscription for `conversation`.
    ///
    /// Any previous subscription held by this manager is cancelled first.
    /// Must be called from within a Tokio runtime.
    pub fn open(
        &self,
        conversation: ConversationId,
        on_batch: BatchCallback,
        on_error: ErrorCallback,
    ) -> SubscriptionHandle {
        let token = Arc::new(CancelToken::default());
        let previous = self.active.lock().replace(Active {
            conversation: conversation.clone(),
            on_batch: Arc::clone(&on_batch),
            on_error: Arc::clone(&on_error),
            token: Arc::clone(&token),
        });
        if let Some(previous) = previous {
            previous.token.cancel();
            tracing::debug!(conversation = %previous.conversation, "previous subscription cancelled");
        }

        self.state.send_replace(SubscriptionState::Opening);
        tracing::info!(conversation = %conversation, query = %self.query, "opening live subscription");

        let task = tokio::spawn(forward(
            Arc::clone(&self.source),
            conversation,
            self.query.clone(),
            on_batch,
            on_error,
            Arc::clone(&token),
            Arc::clone(&self.state),
        ));
        *token.task.lock() = Some(task);
        // The task may have finished, or been cancelled, before it was stored.
        if token.is_cancelled() {
            token.cancel();
        }

        SubscriptionHandle {
            token,
            state: Arc::clone(&self.state),
        }
    }

    /// Re-open the last conversation after an error.
    ///
    /// Returns `None` (and does nothing) unless the state is `Error`.
    pub fn retry(&self) -> Option<SubscriptionHandle> {
        if !matches!(*self.state.borrow(), SubscriptionState::Error(_)) {
            return None;
        }
        let (conversation, on_batch, on_error) = {
            let active = self.active.lock();
            let active = active.as_ref()?;
            (
                active.conversation.clone(),
                Arc::clone(&active.on_batch),
                Arc::clone(&active.on_error),
            )
        };
        tracing::info!(conversation = %conversation, "retrying live subscription");
        Some(self.open(conversation, on_batch, on_error))
    }

    /// Cancel the current subscription and move to `Closed`.
    pub fn close(&self) {
        if let Some(active) = self.active.lock().take() {
            active.token.cancel();
            tracing::info!(conversation = %active.conversation, "live subscription closed");
        }
        self.state.send_replace(SubscriptionState::Closed);
    }

    /// Current state.
    pub fn state(&self) -> SubscriptionState {
        self.state.borrow().clone()
    }

    /// Receiver observing every state change.
    pub fn watch_state(&self) -> watch::Receiver<SubscriptionState> {
        self.state.subscribe()
    }

    /// Conversation of the current (or last failed) subscription.
    pub fn conversation(&self) -> Option<ConversationId> {
        self.active.lock().as_ref().map(|a| a.conversation.clone())
    }
}

impl<L> Drop for LiveSubscriptionManager<L> {
    fn drop(&mut self) {
        if let Some(active) = self.active.get_mut().take() {
            active.token.cancel();
        }
    }
}

/// Publishes `next` unless the owning subscription was cancelled.
///
/// The check runs under the channel's write lock, so it cannot race with
/// `cancel` publishing `Closed`.
fn publish(state: &watch::Sender<SubscriptionState>, token: &CancelToken, next: SubscriptionState) {
    state.send_if_modified(|current| {
        if token.is_cancelled() {
            return false;
        }
        *current = next;
        true
    });
}

async fn forward<L: LiveSource>(
    source: Arc<L>,
    conversation: ConversationId,
    query: SubscriptionQuery,
    on_batch: BatchCallback,
    on_error: ErrorCallback,
    token: Arc<CancelToken>,
    state: Arc<watch::Sender<SubscriptionState>>,
) {
    let mut stream = match source.subscribe(&conversation, &query).await {
        Ok(stream) => stream,
        Err(err) => {
            fail(&conversation, &on_error, &token, &state, &err);
            return;
        }
    };
    publish(&state, &token, SubscriptionState::Open);

    loop {
        let item = stream.next().await;
        if token.is_cancelled() {
            return;
        }
        match item {
            Some(Ok(batch)) => {
                tracing::debug!(conversation = %conversation, records = batch.len(), "live batch received");
                on_batch(batch);
            }
            Some(Err(err)) => {
                fail(&conversation, &on_error, &token, &state, &err);
                return;
            }
            None => {
                fail(&conversation, &on_error, &token, &state, &SourceError::StreamClosed);
                return;
            }
        }
    }
}

fn fail(
    conversation: &ConversationId,
    on_error: &ErrorCallback,
    token: &CancelToken,
    state: &watch::Sender<SubscriptionState>,
    err: &SourceError,
) {
    if token.is_cancelled() {
        return;
    }
    tracing::warn!(conversation = %conversation, error = %err, "live subscription failed");
    publish(state, token, SubscriptionState::Error(err.clone()));
    on_error(err);
}
