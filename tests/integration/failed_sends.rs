//! Integration tests for failed sends, retry and discard.
//!
//! Covers the durable side of optimistic sending:
//!
//! 1. A failed send stays listed with `failed` status and a durable record.
//! 2. Records survive a process restart (file-backed store) and are
//!    restored into the re-opened conversation.
//! 3. Retry and discard clear the record.
//! 4. Concurrent failures from different conversations are all kept.
//! 5. The store is capped, evicting the oldest record.

use std::sync::Arc;
use std::time::Duration;

use chatsync::config::SyncConfig;
use chatsync::failed::{DEFAULT_STORAGE_KEY, FailedSendStore};
use chatsync::retry::SendOutcome;
use chatsync::session::{ChatSession, LocalUser, SessionEvent};
use chatsync::source::WriteError;
use chatsync::source::memory::MemoryBackend;
use chatsync::storage::{FileKeyValue, KeyValueStore, MemoryKeyValue};

use chatsync_proto::message::{ConversationId, Message, MessageId, MessageStatus, UserId};
use tokio::sync::mpsc;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn conv(id: &str) -> ConversationId {
    ConversationId::new(id)
}

fn bob() -> UserId {
    UserId::new("bob")
}

fn create_session<K: KeyValueStore>(
    backend: &Arc<MemoryBackend>,
    kv: K,
) -> (ChatSession<MemoryBackend, K>, mpsc::Receiver<SessionEvent>) {
    ChatSession::new(
        Arc::clone(backend),
        Arc::new(FailedSendStore::new(kv)),
        LocalUser::new("me", "Me"),
        SyncConfig {
            page_size: 20,
            subscription_limit: 20,
            event_buffer: 256,
        },
    )
}

async fn fail_send<K: KeyValueStore>(
    session: &ChatSession<MemoryBackend, K>,
    conversation: &ConversationId,
    text: &str,
) -> MessageId {
    match session.send(conversation, text).await {
        Some(SendOutcome::Failed { provisional_id, .. }) => provisional_id,
        other => panic!("expected a failed send, got {other:?}"),
    }
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

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn failed_send_stays_listed_with_failed_status() {
    let backend = Arc::new(MemoryBackend::new());
    let (session, _events) = create_session(&backend, MemoryKeyValue::new());
    session.open(conv("c1"), vec![bob()]).await;

    backend.set_write_failure(Some(WriteError::Rejected("quota".into())));
    let id = fail_send(&session, &conv("c1"), "important").await;

    let snapshot = session.snapshot(&conv("c1")).unwrap();
    let entry = snapshot.iter().find(|m| m.id == id).unwrap();
    assert_eq!(entry.status, MessageStatus::Failed);
    assert_eq!(entry.text, "important");

    let record = session.failed_store().find(&id).await.unwrap();
    assert_eq!(record.conversation_id, conv("c1"));
    assert!(chrono::DateTime::parse_from_rfc3339(&record.failed_at).is_ok());
}

#[tokio::test]
async fn failures_survive_restart_and_retry_clears_them() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(MemoryBackend::new());

    let failed_id = {
        let (session, _events) = create_session(&backend, FileKeyValue::new(dir.path()));
        session.open(conv("c1"), vec![bob()]).await;
        backend.set_write_failure(Some(WriteError::Timeout));
        let id = fail_send(&session, &conv("c1"), "survives restart").await;
        session.close_all();
        id
    };
    backend.set_write_failure(None);

    let (session, _events) = create_session(&backend, FileKeyValue::new(dir.path()));
    session.open(conv("c1"), vec![bob()]).await;
    let restored = session.snapshot(&conv("c1")).unwrap();
    let entry = restored.iter().find(|m| m.id == failed_id).unwrap();
    assert_eq!(entry.status, MessageStatus::Failed);
    assert_eq!(entry.text, "survives restart");

    let outcome = session.retry(&conv("c1"), &failed_id).await.unwrap();
    let SendOutcome::Delivered { assigned_id, .. } = outcome else {
        panic!("expected delivery, got {outcome:?}");
    };
    assert!(session.failed_store().list_all().await.is_empty());

    eventually(|| {
        session.snapshot(&conv("c1")).is_some_and(|s| {
            s.iter().any(|m| m.id == assigned_id) && !s.iter().any(|m| m.id == failed_id)
        })
    })
    .await;
}

#[tokio::test]
async fn failed_retry_keeps_single_record() {
    let backend = Arc::new(MemoryBackend::new());
    let (session, mut events) = create_session(&backend, MemoryKeyValue::new());
    session.open(conv("c1"), vec![bob()]).await;
    backend.set_write_failure(Some(WriteError::Timeout));
    let id = fail_send(&session, &conv("c1"), "stubborn").await;

    let outcome = session.retry(&conv("c1"), &id).await.unwrap();
    assert!(matches!(outcome, SendOutcome::Failed { .. }));
    assert_eq!(session.failed_store().list_all().await.len(), 1);

    let failures = std::iter::from_fn(|| events.try_recv().ok())
        .filter(|e| matches!(e, SessionEvent::SendFailed { .. }))
        .count();
    assert_eq!(failures, 2);

    let entries: Vec<Message> = session
        .snapshot(&conv("c1"))
        .unwrap()
        .into_iter()
        .filter(|m| m.id == id)
        .collect();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].status, MessageStatus::Failed);
}

#[tokio::test]
async fn retry_through_another_conversation_is_refused() {
    let backend = Arc::new(MemoryBackend::new());
    let (session, _events) = create_session(&backend, MemoryKeyValue::new());
    session.open(conv("c1"), vec![bob()]).await;
    backend.set_write_failure(Some(WriteError::Timeout));
    let id = fail_send(&session, &conv("c1"), "for c1 only").await;
    backend.set_write_failure(None);

    session.open(conv("c2"), vec![bob()]).await;
    assert!(session.retry(&conv("c2"), &id).await.is_none());

    assert!(!session.snapshot(&conv("c2")).unwrap().iter().any(|m| m.id == id));
    assert_eq!(backend.message_count(&conv("c1")), 0);
    assert_eq!(backend.message_count(&conv("c2")), 0);
    assert!(session.failed_store().contains(&id).await);

    // The owning conversation can still retry it.
    let outcome = session.retry(&conv("c1"), &id).await.unwrap();
    assert!(matches!(outcome, SendOutcome::Delivered { .. }));
    assert_eq!(backend.message_count(&conv("c1")), 1);
}

#[tokio::test]
async fn discard_removes_entry_and_record() {
    let backend = Arc::new(MemoryBackend::new());
    let (session, _events) = create_session(&backend, MemoryKeyValue::new());
    session.open(conv("c1"), vec![bob()]).await;
    backend.set_write_failure(Some(WriteError::PermissionDenied));
    let id = fail_send(&session, &conv("c1"), "never mind").await;

    assert!(session.discard(&conv("c1"), &id).await);
    assert!(!session.snapshot(&conv("c1")).unwrap().iter().any(|m| m.id == id));
    assert!(session.failed_store().list_all().await.is_empty());
    assert!(session.retry(&conv("c1"), &id).await.is_none());
}

#[tokio::test]
async fn discard_of_closed_conversation_still_forgets_record() {
    let backend = Arc::new(MemoryBackend::new());
    let (session, _events) = create_session(&backend, MemoryKeyValue::new());
    session.open(conv("c1"), vec![bob()]).await;
    backend.set_write_failure(Some(WriteError::Timeout));
    let id = fail_send(&session, &conv("c1"), "gone").await;
    session.close(&conv("c1"));

    assert!(!session.discard(&conv("c1"), &id).await);
    assert!(session.failed_store().list_all().await.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_failures_across_conversations_are_all_recorded() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(MemoryBackend::new());
    let (session, _events) = create_session(&backend, FileKeyValue::new(dir.path()));
    let session = Arc::new(session);
    backend.set_write_failure(Some(WriteError::Timeout));

    for c in ["c1", "c2", "c3"] {
        session.open(conv(c), vec![bob()]).await;
    }

    let mut handles = Vec::new();
    for i in 0..12 {
        let session = Arc::clone(&session);
        handles.push(tokio::spawn(async move {
            let conversation = conv(["c1", "c2", "c3"][i % 3]);
            fail_send(&session, &conversation, &format!("burst {i}")).await
        }));
    }
    let mut ids = Vec::new();
    for handle in handles {
        ids.push(handle.await.unwrap());
    }

    let all = session.failed_store().list_all().await;
    assert_eq!(all.len(), 12);
    for id in &ids {
        assert!(all.iter().any(|r| r.message.id == *id));
    }
    assert_eq!(session.failed_store().list_for_conversation(&conv("c2")).await.len(), 4);
}

#[tokio::test]
async fn store_cap_evicts_oldest_across_restart() {
    let dir = tempfile::tempdir().unwrap();
    let mut ids = Vec::new();
    {
        let store = FailedSendStore::new(FileKeyValue::new(dir.path()));
        for i in 0..51 {
            let message = Message::provisional(format!("m{i}"), UserId::new("me"), "Me", vec![]);
            ids.push(message.id.clone());
            store.save(message, conv("c1")).await;
        }
    }

    let store = FailedSendStore::new(FileKeyValue::new(dir.path()));
    let all = store.list_all().await;
    assert_eq!(all.len(), 50);
    assert_eq!(all[0].message.id, ids[50]);
    assert!(!store.contains(&ids[0]).await);
}

#[tokio::test]
async fn corrupt_file_degrades_to_empty() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join(format!("{DEFAULT_STORAGE_KEY}.json")), "[{\"broken\":").unwrap();

    let backend = Arc::new(MemoryBackend::new());
    let (session, _events) = create_session(&backend, FileKeyValue::new(dir.path()));
    session.open(conv("c1"), vec![bob()]).await;
    assert!(session.failed_store().list_all().await.is_empty());
    assert!(session.snapshot(&conv("c1")).unwrap().is_empty());

    backend.set_write_failure(Some(WriteError::Timeout));
    fail_send(&session, &conv("c1"), "fresh start").await;
    assert_eq!(session.failed_store().list_all().await.len(), 1);
}
