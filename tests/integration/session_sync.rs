//! Integration tests for timeline synchronization through a full session.
//!
//! Drives `ChatSession` against the in-memory backend and checks the
//! timeline invariants end to end:
//!
//! 1. Pagination accumulates pages below the live window.
//! 2. Re-delivered and overlapping batches never duplicate entries.
//! 3. Malformed records are dropped without disturbing the rest.
//! 4. Late results for a closed view are discarded.
//! 5. Confirmed sends are replaced by their persisted copy.

use std::sync::Arc;
use std::time::Duration;

use chatsync::config::SyncConfig;
use chatsync::failed::FailedSendStore;
use chatsync::pagination::LoadOutcome;
use chatsync::retry::SendOutcome;
use chatsync::session::{ChatSession, LocalUser, SessionEvent};
use chatsync::source::memory::MemoryBackend;
use chatsync::storage::MemoryKeyValue;
use chatsync::subscription::SubscriptionState;
use chatsync::timeline::{has_unique_ids, is_sorted_desc};

use chatsync_proto::message::{
    ConversationId, MessageStatus, RawMessage, RawTimestamp, Timestamp, UserId,
};
use tokio::sync::mpsc;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

type Session = ChatSession<MemoryBackend, MemoryKeyValue>;

fn conv() -> ConversationId {
    ConversationId::new("general")
}

fn me() -> UserId {
    UserId::new("me")
}

fn bob() -> UserId {
    UserId::new("bob")
}

fn members() -> Vec<UserId> {
    vec![me(), bob()]
}

fn create_session(backend: &Arc<MemoryBackend>, page: usize) -> (Session, mpsc::Receiver<SessionEvent>) {
    ChatSession::new(
        Arc::clone(backend),
        Arc::new(FailedSendStore::new(MemoryKeyValue::new())),
        LocalUser::new("me", "Me"),
        SyncConfig {
            page_size: page,
            subscription_limit: page,
            event_buffer: 1024,
        },
    )
}

async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..400 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

async fn open_and_settle(session: &Session, expected: usize) {
    session.open(conv(), vec![bob()]).await;
    eventually(|| session.snapshot(&conv()).is_some_and(|s| s.len() == expected)).await;
}

fn assert_invariants(session: &Session) {
    let snapshot = session.snapshot(&conv()).unwrap();
    assert!(is_sorted_desc(&snapshot), "timeline out of order");
    assert!(has_unique_ids(&snapshot), "timeline has duplicate ids");
}

// ---------------------------------------------------------------------------
// Pagination
// ---------------------------------------------------------------------------

#[tokio::test]
async fn three_pages_accumulate_below_live_window() {
    let backend = Arc::new(MemoryBackend::new());
    let ids = backend.seed_history(&conv(), &bob(), &members(), 400);
    let (session, _events) = create_session(&backend, 100);
    open_and_settle(&session, 100).await;

    for _ in 0..3 {
        assert!(matches!(
            session.load_older(&conv()).await,
            Some(LoadOutcome::Loaded { received: 100, .. })
        ));
    }

    let snapshot = session.snapshot(&conv()).unwrap();
    assert_eq!(snapshot.len(), 400);
    assert_eq!(snapshot[0].id, ids[399], "newest message stays at index 0");
    assert_eq!(snapshot[399].id, ids[0], "oldest history lands at the tail");
    assert_invariants(&session);

    // The fourth page is empty and ends history.
    assert_eq!(
        session.load_older(&conv()).await,
        Some(LoadOutcome::Loaded { received: 0, has_more: false })
    );
    assert_eq!(session.load_older(&conv()).await, Some(LoadOutcome::Exhausted));
    assert_eq!(session.has_more_history(&conv()), Some(false));
}

#[tokio::test]
async fn double_load_older_issues_one_fetch() {
    let backend = Arc::new(MemoryBackend::new());
    backend.seed_history(&conv(), &bob(), &members(), 60);
    let (session, _events) = create_session(&backend, 20);
    open_and_settle(&session, 20).await;

    backend.set_query_delay(Some(Duration::from_millis(40)));
    let conversation = conv();
    let (a, b) = tokio::join!(
        session.load_older(&conversation),
        session.load_older(&conversation)
    );
    assert_eq!(backend.query_count(), 1);
    let outcomes = [a.unwrap(), b.unwrap()];
    assert!(outcomes.contains(&LoadOutcome::InFlight));
    assert_eq!(session.snapshot(&conv()).unwrap().len(), 40);
}

#[tokio::test]
async fn live_messages_during_pagination_do_not_duplicate() {
    let backend = Arc::new(MemoryBackend::new());
    backend.seed_history(&conv(), &bob(), &members(), 30);
    let (session, _events) = create_session(&backend, 10);
    open_and_settle(&session, 10).await;

    backend.set_query_delay(Some(Duration::from_millis(30)));
    let pusher = {
        let backend = Arc::clone(&backend);
        async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            backend.push_incoming(&conv(), &bob(), "while paging", &members());
        }
    };
    let conversation = conv();
    let (outcome, ()) = tokio::join!(session.load_older(&conversation), pusher);
    assert!(matches!(outcome, Some(LoadOutcome::Loaded { .. })));

    eventually(|| {
        session
            .snapshot(&conv())
            .is_some_and(|s| s.first().is_some_and(|m| m.text == "while paging"))
    })
    .await;
    assert_eq!(session.snapshot(&conv()).unwrap().len(), 21);
    assert_invariants(&session);
}

// ---------------------------------------------------------------------------
// Live batches
// ---------------------------------------------------------------------------

#[tokio::test]
async fn redelivered_window_is_idempotent() {
    let backend = Arc::new(MemoryBackend::new());
    backend.seed_history(&conv(), &bob(), &members(), 5);
    let (session, _events) = create_session(&backend, 10);
    open_and_settle(&session, 5).await;
    let before = session.snapshot(&conv()).unwrap();

    let replay: Vec<RawMessage> = before.iter().map(RawMessage::from).collect();
    backend.emit_raw(&conv(), &replay);
    backend.emit_raw(&conv(), &replay);
    tokio::time::sleep(Duration::from_millis(30)).await;

    assert_eq!(session.snapshot(&conv()).unwrap(), before);
}

#[tokio::test]
async fn malformed_records_are_dropped() {
    let backend = Arc::new(MemoryBackend::new());
    backend.seed_history(&conv(), &bob(), &members(), 2);
    let (session, _events) = create_session(&backend, 10);
    open_and_settle(&session, 2).await;

    let batch = vec![
        RawMessage {
            id: Some("fresh".into()),
            text: Some("valid".into()),
            sender_id: Some("bob".into()),
            created_at: Some(RawTimestamp::Millis(Timestamp::now().as_millis())),
            ..Default::default()
        },
        RawMessage {
            id: None,
            text: Some("no id".into()),
            ..Default::default()
        },
        RawMessage {
            id: Some("bad-time".into()),
            created_at: Some(RawTimestamp::Iso("yesterday-ish".into())),
            ..Default::default()
        },
    ];
    backend.emit_raw(&conv(), &batch);
    eventually(|| session.snapshot(&conv()).is_some_and(|s| s.len() == 3)).await;

    let snapshot = session.snapshot(&conv()).unwrap();
    assert_eq!(snapshot[0].id.as_str(), "fresh");
    assert_invariants(&session);
}

#[tokio::test]
async fn subscription_error_keeps_loaded_history() {
    let backend = Arc::new(MemoryBackend::new());
    backend.seed_history(&conv(), &bob(), &members(), 4);
    let (session, mut events) = create_session(&backend, 10);
    open_and_settle(&session, 4).await;

    backend.drop_streams(&conv());
    eventually(|| {
        matches!(
            session.subscription_state(&conv()),
            Some(SubscriptionState::Error(_))
        )
    })
    .await;
    assert_eq!(session.snapshot(&conv()).unwrap().len(), 4);

    let mut failures = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, SessionEvent::SubscriptionFailed { .. }) {
            failures += 1;
        }
    }
    assert_eq!(failures, 1);

    assert!(session.retry_subscription(&conv()));
    backend.push_incoming(&conv(), &bob(), "back online", &members());
    eventually(|| session.snapshot(&conv()).is_some_and(|s| s.len() == 5)).await;
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn late_page_for_closed_view_is_discarded() {
    let backend = Arc::new(MemoryBackend::new());
    backend.seed_history(&conv(), &bob(), &members(), 30);
    let (session, _events) = create_session(&backend, 10);
    let view = session.open(conv(), vec![bob()]).await;
    eventually(|| view.timeline().snapshot().len() == 10).await;

    backend.set_query_delay(Some(Duration::from_millis(40)));
    let closer = async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        session.close(&conv());
    };
    let conversation = conv();
    let (outcome, ()) = tokio::join!(session.load_older(&conversation), closer);

    assert_eq!(outcome, Some(LoadOutcome::Stale));
    assert_eq!(view.timeline().snapshot().len(), 10);
    assert!(!session.is_open(&conv()));
}

#[tokio::test]
async fn reopening_discards_batches_for_old_view() {
    let backend = Arc::new(MemoryBackend::new());
    backend.seed_history(&conv(), &bob(), &members(), 3);
    let (session, _events) = create_session(&backend, 10);
    let old = session.open(conv(), vec![bob()]).await;
    eventually(|| old.timeline().snapshot().len() == 3).await;

    let fresh = session.open(conv(), vec![bob()]).await;
    backend.push_incoming(&conv(), &bob(), "after reopen", &members());
    eventually(|| fresh.timeline().snapshot().len() == 4).await;
    assert_eq!(old.timeline().snapshot().len(), 3);
}

// ---------------------------------------------------------------------------
// Sends
// ---------------------------------------------------------------------------

#[tokio::test]
async fn confirmed_send_is_replaced_by_persisted_copy() {
    let backend = Arc::new(MemoryBackend::new());
    backend.seed_history(&conv(), &bob(), &members(), 3);
    let (session, _events) = create_session(&backend, 10);
    open_and_settle(&session, 3).await;

    let outcome = session.send(&conv(), "hello bob").await.unwrap();
    let SendOutcome::Delivered {
        provisional_id,
        assigned_id,
    } = outcome
    else {
        panic!("expected delivery, got {outcome:?}");
    };

    eventually(|| {
        session.snapshot(&conv()).is_some_and(|s| {
            s.iter().any(|m| m.id == assigned_id) && !s.iter().any(|m| m.id == provisional_id)
        })
    })
    .await;
    let snapshot = session.snapshot(&conv()).unwrap();
    assert_eq!(snapshot.len(), 4);
    assert_eq!(snapshot.iter().filter(|m| m.text == "hello bob").count(), 1);
    assert_eq!(snapshot[0].status, MessageStatus::Sent);
    assert_invariants(&session);
}

#[tokio::test]
async fn queued_send_reconciles_after_flush() {
    let backend = Arc::new(MemoryBackend::new());
    let (session, _events) = create_session(&backend, 10);
    session.open(conv(), vec![bob()]).await;
    eventually(|| session.subscription_state(&conv()) == Some(SubscriptionState::Open)).await;

    backend.set_queue_writes(true);
    let outcome = session.send(&conv(), "eventually").await.unwrap();
    let SendOutcome::Queued { provisional_id, .. } = outcome else {
        panic!("expected queued, got {outcome:?}");
    };
    let snapshot = session.snapshot(&conv()).unwrap();
    assert_eq!(snapshot[0].id, provisional_id);
    assert_eq!(snapshot[0].status, MessageStatus::Queued);

    assert_eq!(backend.flush_queued(), 1);
    eventually(|| {
        session
            .snapshot(&conv())
            .is_some_and(|s| s.len() == 1 && s[0].id != provisional_id)
    })
    .await;
    assert_eq!(session.snapshot(&conv()).unwrap()[0].status, MessageStatus::Sent);
}

#[tokio::test]
async fn provisional_entries_stay_in_front_of_history() {
    let backend = Arc::new(MemoryBackend::new());
    backend.seed_history(&conv(), &bob(), &members(), 10);
    let (session, _events) = create_session(&backend, 5);
    open_and_settle(&session, 5).await;

    backend.set_write_delay(Some(Duration::from_millis(30)));
    let conversation = conv();
    let sender = session.send(&conversation, "slow send");
    let pager = async {
        tokio::time::sleep(Duration::from_millis(5)).await;
        let snapshot = session.snapshot(&conv()).unwrap();
        assert_eq!(snapshot[0].text, "slow send");
        assert_eq!(snapshot[0].status, MessageStatus::Sending);
        session.load_older(&conv()).await
    };
    let (sent, paged) = tokio::join!(sender, pager);
    assert!(matches!(sent, Some(SendOutcome::Delivered { .. })));
    assert!(matches!(paged, Some(LoadOutcome::Loaded { .. })));
    assert_invariants(&session);
}
