//! Backward pagination through conversation history.
//!
//! [`PaginationController::load_older`] fetches one page strictly older
//! than the oldest loaded message and appends it to the timeline. At most
//! one fetch runs at a time: the in-flight flag is taken with a
//! compare-and-swap before the query starts and released by a drop guard,
//! so every exit path (success, error, stale result, cancellation of the
//! future) clears it.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::source::{HistorySource, SourceError};
use crate::timeline::{Epoch, SharedTimeline, Timeline};

/// Default number of records requested per page.
pub const DEFAULT_PAGE_SIZE: usize = 50;

/// Result of one [`PaginationController::load_older`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadOutcome {
    /// A page was fetched and merged.
    Loaded {
        /// Records returned by the source (before decoding).
        received: usize,
        /// Whether more history is expected.
        has_more: bool,
    },
    /// Another fetch is already running; nothing was done.
    InFlight,
    /// A previous fetch reported the end of history; nothing was done.
    Exhausted,
    /// The view was closed or replaced; the result was discarded.
    Stale,
    /// The query failed. `has_more` is unchanged and a retry is allowed.
    Failed(SourceError),
}

/// Clears the in-flight flag when dropped.
struct InFlightGuard<'a>(&'a AtomicBool);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Fetches older pages on demand, one at a time.
pub struct PaginationController<H> {
    source: Arc<H>,
    page_size: usize,
    in_flight: AtomicBool,
    has_more: AtomicBool,
}

impl<H: HistorySource> PaginationController<H> {
    /// Create a controller requesting `page_size` records per fetch.
    pub fn new(source: Arc<H>, page_size: usize) -> Self {
        Self {
            source,
            page_size: page_size.max(1),
            in_flight: AtomicBool::new(false),
            has_more: AtomicBool::new(true),
        }
    }

    /// Records requested per page.
    pub const fn page_size(&self) -> usize {
        self.page_size
    }

    /// Whether older history may still exist.
    pub fn has_more(&self) -> bool {
        self.has_more.load(Ordering::SeqCst)
    }

    /// Whether a fetch is running.
    pub fn is_loading(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Re-arm after the conversation is re-opened.
    pub fn reset(&self) {
        self.has_more.store(true, Ordering::SeqCst);
    }

    /// Fetch and merge the next older page.
    ///
    /// The result is applied only if `epoch` is still current for
    /// `timeline` when the query completes.
    pub async fn load_older(&self, timeline: &SharedTimeline, epoch: Epoch) -> LoadOutcome {
        if !self.has_more() {
            tracing::debug!("history exhausted, load skipped");
            return LoadOutcome::Exhausted;
        }
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::debug!("fetch already in flight, load skipped");
            return LoadOutcome::InFlight;
        }
        let _guard = InFlightGuard(&self.in_flight);

        if !timeline.is_current(epoch) {
            return LoadOutcome::Stale;
        }
        let (conversation, cursor) =
            timeline.read(|t| (t.conversation().clone(), Timeline::oldest_cursor(t)));

        let batch = match self
            .source
            .query_older_than(&conversation, cursor, self.page_size)
            .await
        {
            Ok(batch) => batch,
            Err(err) => {
                tracing::warn!(conversation = %conversation, error = %err, "history fetch failed");
                return LoadOutcome::Failed(err);
            }
        };

        let received = batch.len();
        let has_more = received >= self.page_size;
        let Some(report) = timeline.apply_if_current(epoch, |t| t.apply_older_batch(batch)) else {
            return LoadOutcome::Stale;
        };
        self.has_more.store(has_more, Ordering::SeqCst);
        tracing::debug!(
            conversation = %conversation,
            received,
            applied = report.applied,
            has_more,
            "older page merged"
        );
        LoadOutcome::Loaded { received, has_more }
    }
}
