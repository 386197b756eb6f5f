//! Epoch-guarded handle to an open conversation's timeline.
//!
//! Every asynchronous producer (live subscription task, pagination fetch,
//! in-flight send) captures the [`Epoch`] of the view it started under and
//! applies its result through [`SharedTimeline::apply_if_current`]. Once the
//! view is closed, or replaced by a newer one, late results are discarded
//! under the same lock that guards the merge, so a closed timeline is never
//! mutated.

use std::sync::Arc;

use parking_lot::Mutex;

use chatsync_proto::message::{ConversationId, Message};

use super::Timeline;

/// Generation counter identifying one open/close cycle of a conversation view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Epoch(u64);

impl Epoch {
    /// Wraps a raw generation value.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw generation value.
    #[must_use]
    pub const fn value(&self) -> u64 {
        self.0
    }

    /// Returns the following generation.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }
}

impl std::fmt::Display for Epoch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug)]
struct Slot {
    epoch: Epoch,
    open: bool,
    timeline: Timeline,
}

/// Cloneable, mutex-protected timeline tagged with its epoch.
///
/// Merge operations run synchronously under the lock and never yield.
#[derive(Debug, Clone)]
pub struct SharedTimeline {
    inner: Arc<Mutex<Slot>>,
}

impl SharedTimeline {
    /// Creates an open, empty timeline for `conversation` at `epoch`.
    #[must_use]
    pub fn new(conversation: ConversationId, epoch: Epoch) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Slot {
                epoch,
                open: true,
                timeline: Timeline::new(conversation),
            })),
        }
    }

    /// The epoch this timeline was opened under.
    #[must_use]
    pub fn epoch(&self) -> Epoch {
        self.inner.lock().epoch
    }

    /// Whether the view is still open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.inner.lock().open
    }

    /// Whether results captured under `epoch` may still be applied.
    #[must_use]
    pub fn is_current(&self, epoch: Epoch) -> bool {
        let slot = self.inner.lock();
        slot.open && slot.epoch == epoch
    }

    /// Runs `f` on the timeline if `epoch` is still current.
    ///
    /// Returns `None` (and leaves the timeline untouched) for stale results.
    pub fn apply_if_current<R>(&self, epoch: Epoch, f: impl FnOnce(&mut Timeline) -> R) -> Option<R> {
        let mut slot = self.inner.lock();
        if !slot.open || slot.epoch != epoch {
            tracing::debug!(
                conversation = %slot.timeline.conversation(),
                stale = %epoch,
                current = %slot.epoch,
                "discarding result for closed or replaced view"
            );
            return None;
        }
        Some(f(&mut slot.timeline))
    }

    /// Runs `f` with read access to the timeline.
    pub fn read<R>(&self, f: impl FnOnce(&Timeline) -> R) -> R {
        f(&self.inner.lock().timeline)
    }

    /// Returns a detached copy of the ordered messages.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Message> {
        self.inner.lock().timeline.snapshot()
    }

    /// Marks the view closed; every later apply is discarded.
    pub fn close(&self) {
        self.inner.lock().open = false;
    }
}
