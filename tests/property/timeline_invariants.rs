//! Property-based tests for the timeline merge engine.
//!
//! Uses proptest to verify:
//! 1. After any sequence of realtime, older and provisional merges the
//!    timeline is sorted newest first and has no duplicate ids.
//! 2. Re-applying a realtime batch yields exactly the same array.
//! 3. An empty older batch is a no-op.
//! 4. Records without an id are always dropped, never merged.

use proptest::prelude::*;

use chatsync::timeline::{Timeline, has_unique_ids, is_sorted_desc};
use chatsync_proto::message::{ConversationId, Message, RawMessage, RawTimestamp, UserId};

// --- Strategies ---

/// Ids drawn from a small pool so that batches overlap often.
fn arb_id() -> impl Strategy<Value = String> {
    (0u8..40).prop_map(|n| format!("m{n}"))
}

/// Creation times drawn from a narrow range so that ties happen.
fn arb_created_at() -> impl Strategy<Value = Option<RawTimestamp>> {
    prop_oneof![
        8 => (0u64..30).prop_map(|n| Some(RawTimestamp::Millis(1_000 + n))),
        1 => (0i64..30).prop_map(|n| Some(RawTimestamp::Server { seconds: n, nanoseconds: 0 })),
        1 => Just(None),
    ]
}

/// A well-formed record, possibly still pending a server time.
fn arb_record() -> impl Strategy<Value = RawMessage> {
    (arb_id(), arb_created_at(), "[a-z ]{0,12}").prop_map(|(id, created_at, text)| RawMessage {
        id: Some(id),
        text: Some(text),
        sender_id: Some("bob".into()),
        sender_name: Some("Bob".into()),
        created_at,
        ..Default::default()
    })
}

/// A record that cannot be decoded.
fn arb_malformed() -> impl Strategy<Value = RawMessage> {
    prop_oneof![
        Just(RawMessage::default()),
        Just(RawMessage {
            id: Some("  ".into()),
            ..Default::default()
        }),
        arb_id().prop_map(|id| RawMessage {
            id: Some(id),
            created_at: Some(RawTimestamp::Iso("not a time".into())),
            ..Default::default()
        }),
    ]
}

fn arb_batch() -> impl Strategy<Value = Vec<RawMessage>> {
    prop::collection::vec(
        prop_oneof![9 => arb_record(), 1 => arb_malformed()],
        0..25,
    )
}

#[derive(Debug, Clone)]
enum Op {
    Realtime(Vec<RawMessage>),
    Older(Vec<RawMessage>),
    Provisional(String),
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => arb_batch().prop_map(Op::Realtime),
        4 => arb_batch().prop_map(Op::Older),
        2 => "[a-z]{1,8}".prop_map(Op::Provisional),
    ]
}

fn apply(timeline: &mut Timeline, op: Op) {
    match op {
        Op::Realtime(batch) => {
            timeline.apply_realtime_batch(batch);
        }
        Op::Older(batch) => {
            timeline.apply_older_batch(batch);
        }
        Op::Provisional(text) => {
            timeline.insert_provisional(Message::provisional(text, UserId::new("me"), "Me", vec![]));
        }
    }
}

fn new_timeline() -> Timeline {
    Timeline::new(ConversationId::new("c1"))
}

// --- Properties ---

proptest! {
    #[test]
    fn any_merge_sequence_keeps_order_and_uniqueness(ops in prop::collection::vec(arb_op(), 1..20)) {
        let mut timeline = new_timeline();
        for op in ops {
            apply(&mut timeline, op);
            prop_assert!(is_sorted_desc(timeline.as_slice()));
            prop_assert!(has_unique_ids(timeline.as_slice()));
        }
    }

    #[test]
    fn realtime_redelivery_is_idempotent(
        setup in prop::collection::vec(arb_op(), 0..10),
        batch in arb_batch(),
    ) {
        let mut timeline = new_timeline();
        for op in setup {
            apply(&mut timeline, op);
        }
        timeline.apply_realtime_batch(batch.clone());
        let once = timeline.snapshot();

        timeline.apply_realtime_batch(batch);
        prop_assert_eq!(timeline.snapshot(), once);
    }

    #[test]
    fn empty_older_batch_changes_nothing(setup in prop::collection::vec(arb_op(), 0..10)) {
        let mut timeline = new_timeline();
        for op in setup {
            apply(&mut timeline, op);
        }
        let before = timeline.snapshot();
        let report = timeline.apply_older_batch(Vec::new());
        prop_assert_eq!(report.applied, 0);
        prop_assert_eq!(timeline.snapshot(), before);
    }

    #[test]
    fn malformed_records_never_enter_the_timeline(
        good in prop::collection::vec(arb_record(), 0..10),
        bad in prop::collection::vec(arb_malformed(), 1..5),
    ) {
        let mut timeline = new_timeline();
        let mut batch = bad.clone();
        batch.extend(good);
        let report = timeline.apply_realtime_batch(batch);

        prop_assert_eq!(report.dropped_malformed, bad.len());
        prop_assert!(timeline.as_slice().iter().all(|m| !m.id.as_str().trim().is_empty()));
        prop_assert!(timeline.len() <= report.applied);
    }
}
