//! Integration tests for the notification differ.
//!
//! Drives the differ with conversation summaries in the wire shape the
//! conversation list listener delivers, over multiple update cycles and
//! multiple conversations.

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::json;

use chatsync::notify::{Notification, NotificationDiffer, NotificationSink};
use chatsync_proto::conversation::ConversationSummary;
use chatsync_proto::message::{ConversationId, UserId};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
struct Recorder(Arc<Mutex<Vec<Notification>>>);

impl Recorder {
    fn take(&self) -> Vec<Notification> {
        std::mem::take(&mut *self.0.lock())
    }
}

impl NotificationSink for Recorder {
    fn notify(&self, notification: &Notification) {
        self.0.lock().push(notification.clone());
    }
}

fn summary(value: serde_json::Value) -> ConversationSummary {
    serde_json::from_value(value).unwrap()
}

fn differ() -> (NotificationDiffer<Recorder>, Recorder) {
    let recorder = Recorder::default();
    (NotificationDiffer::new(UserId::new("me"), recorder.clone()), recorder)
}

fn chat_with_bob(text: &str, sender: &str) -> ConversationSummary {
    summary(json!({
        "id": "c-bob",
        "lastMessage": text,
        "lastMessageSenderId": sender,
        "participantDetails": {
            "me": { "name": "Me" },
            "bob": { "name": "Bob", "avatarUrl": "https://example.invalid/bob.png" }
        }
    }))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[test]
fn listener_lifecycle_fires_only_for_new_incoming_previews() {
    let (mut differ, recorder) = differ();

    // Initial load: nothing fires.
    differ.observe(&[chat_with_bob("hello", "bob")]);
    assert!(recorder.take().is_empty());

    // Same preview re-delivered: nothing fires.
    differ.observe(&[chat_with_bob("hello", "bob")]);
    assert!(recorder.take().is_empty());

    // Bob writes again.
    differ.observe(&[chat_with_bob("are you there?", "bob")]);
    let fired = recorder.take();
    assert_eq!(fired.len(), 1);
    assert_eq!(fired[0].title, "Bob");
    assert_eq!(fired[0].body, "are you there?");
    assert_eq!(fired[0].conversation_id, ConversationId::new("c-bob"));

    // The user replies from another device.
    differ.observe(&[chat_with_bob("yes", "me")]);
    assert!(recorder.take().is_empty());
}

#[test]
fn each_conversation_is_tracked_independently() {
    let (mut differ, recorder) = differ();
    let group = |text: &str, sender: &str| {
        summary(json!({
            "id": "c-group",
            "lastMessage": { "text": text, "senderId": sender },
            "participantDetails": { "carol": { "name": "Carol" } }
        }))
    };

    differ.observe(&[chat_with_bob("hi", "bob")]);
    differ.observe(&[chat_with_bob("hi", "bob"), group("kickoff", "carol")]);
    assert!(recorder.take().is_empty(), "first sighting of c-group is silent");

    let fired = differ.observe(&[chat_with_bob("new from bob", "bob"), group("agenda", "carol")]);
    assert_eq!(fired.len(), 2);
    let titles: Vec<&str> = fired.iter().map(|n| n.title.as_str()).collect();
    assert_eq!(titles, vec!["Bob", "Carol"]);
    assert_eq!(recorder.take(), fired);
}

#[test]
fn unknown_sender_gets_placeholder_title() {
    let (mut differ, _recorder) = differ();
    let stranger = |text: &str| {
        summary(json!({
            "id": "c-x",
            "lastMessage": text,
            "lastMessageSenderId": "stranger",
            "participantDetails": {}
        }))
    };
    differ.observe(&[stranger("one")]);
    let fired = differ.observe(&[stranger("two")]);
    assert_eq!(fired.len(), 1);
    assert_eq!(fired[0].title, "Someone");
}

#[test]
fn cleared_preview_updates_memory_without_firing() {
    let (mut differ, recorder) = differ();
    differ.observe(&[chat_with_bob("first", "bob")]);

    let cleared = summary(json!({ "id": "c-bob", "lastMessage": "" }));
    differ.observe(&[cleared]);
    assert!(recorder.take().is_empty());

    // The next real preview differs from the stored "no message".
    differ.observe(&[chat_with_bob("first", "bob")]);
    assert_eq!(recorder.take().len(), 1);
}

#[test]
fn switching_user_resets_memory() {
    let (mut differ, recorder) = differ();
    differ.observe(&[chat_with_bob("hello", "bob")]);
    differ.set_current_user(UserId::new("bob"));
    assert!(!differ.has_seen(&ConversationId::new("c-bob")));

    differ.observe(&[chat_with_bob("hello", "bob")]);
    differ.observe(&[chat_with_bob("from me", "me")]);
    let fired = recorder.take();
    assert_eq!(fired.len(), 1);
    assert_eq!(fired[0].title, "Me");
}

#[test]
fn summaries_tolerate_missing_fields() {
    let (mut differ, recorder) = differ();
    let bare = summary(json!({ "id": "c-empty" }));
    differ.observe(&[bare.clone()]);
    differ.observe(&[bare]);
    assert!(recorder.take().is_empty());
    assert!(differ.has_seen(&ConversationId::new("c-empty")));
}
