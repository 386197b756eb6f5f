//! `chatsync`: scripted demo of the timeline synchronization engine.
//!
//! Runs one session against the in-memory backend: seeds history, opens a
//! conversation, paginates to the start, exchanges messages, fails a send
//! and retries it, then prints the resulting timeline.
//!
//! ```bash
//! cargo run --bin chatsync -- --user-id alice --page-size 25
//!
//! # Keep failed-send records out of the data directory
//! cargo run --bin chatsync -- --ephemeral
//! ```

use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::mpsc;
use tracing_appender::non_blocking::WorkerGuard;

use chatsync::config::{CliArgs, EngineConfig};
use chatsync::failed::FailedSendStore;
use chatsync::notify::{NotificationDiffer, TracingSink};
use chatsync::pagination::LoadOutcome;
use chatsync::retry::SendOutcome;
use chatsync::session::{ChatSession, LocalUser, SessionEvent};
use chatsync::source::WriteError;
use chatsync::source::memory::MemoryBackend;
use chatsync::storage::{FileKeyValue, KeyValueStore, MemoryKeyValue};
use chatsync_proto::conversation::{ConversationSummary, LastMessage, ParticipantDetail};
use chatsync_proto::message::{ConversationId, EffectiveTime, Message, UserId};

/// Messages seeded into the demo conversation before it is opened.
const SEEDED_HISTORY: usize = 120;

#[tokio::main]
async fn main() -> io::Result<()> {
    let cli = CliArgs::parse();

    let config = match EngineConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Warning: failed to load config file: {e}");
            EngineConfig::default()
        }
    };

    let _log_guard = init_logging(&cli.log_level, cli.log_file.as_deref());
    tracing::info!("chatsync starting");

    if cli.ephemeral {
        run(&config, MemoryKeyValue::new()).await;
    } else {
        let root = config
            .data_dir
            .clone()
            .or_else(FileKeyValue::default_root)
            .unwrap_or_else(|| std::env::temp_dir().join("chatsync"));
        println!("failed-send records: {}", root.display());
        run(&config, FileKeyValue::new(root)).await;
    }

    tracing::info!("chatsync exiting");
    Ok(())
}

/// Initialize file-based logging.
///
/// Returns a [`WorkerGuard`] that must be held until shutdown to ensure all
/// buffered log entries are flushed.
fn init_logging(level: &str, file_path: Option<&Path>) -> Option<WorkerGuard> {
    let default_path = std::env::temp_dir().join("chatsync.log");
    let log_path = file_path.unwrap_or(&default_path);

    let log_dir = log_path.parent()?;
    let file_name = log_path.file_name()?.to_str()?;

    let file_appender = tracing_appender::rolling::never(log_dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_env_filter(env_filter)
        .with_ansi(false)
        .init();

    Some(guard)
}

async fn run<K: KeyValueStore>(config: &EngineConfig, kv: K) {
    let me = LocalUser::new(config.user_id.clone(), config.user_name.clone());
    let bob = UserId::new("bob");
    let conversation = ConversationId::new("general");

    let backend = Arc::new(MemoryBackend::new());
    backend.seed_history(&conversation, &bob, &[me.id.clone(), bob.clone()], SEEDED_HISTORY);

    let store = Arc::new(FailedSendStore::with_config(kv, config.failed.clone()));
    let (session, mut events) = ChatSession::new(
        Arc::clone(&backend),
        store,
        me.clone(),
        config.sync.clone(),
    );
    let mut differ = NotificationDiffer::with_fallback_name(
        me.id.clone(),
        config.fallback_sender_name.clone(),
        TracingSink,
    );

    session.open(conversation.clone(), vec![bob.clone()]).await;
    wait_for_update(&mut events).await;
    let restored = session.failed_store().list_for_conversation(&conversation).await.len();
    if restored > 0 {
        println!("restored {restored} failed send(s) from a previous run");
    }

    let mut pages = 0;
    while let Some(LoadOutcome::Loaded { has_more, .. }) = session.load_older(&conversation).await {
        pages += 1;
        if !has_more {
            break;
        }
    }
    println!("loaded {pages} older page(s)");

    differ.observe(&[summarize(&session.snapshot(&conversation).unwrap_or_default(), &conversation)]);

    backend.push_incoming(&conversation, &bob, "hey, are you around?", &[me.id.clone(), bob.clone()]);
    wait_for_update(&mut events).await;
    differ.observe(&[summarize(&session.snapshot(&conversation).unwrap_or_default(), &conversation)]);

    report(session.send(&conversation, "yes, just catching up").await);

    backend.set_write_failure(Some(WriteError::Rejected("offline".into())));
    let failed = session.send(&conversation, "this one will fail first").await;
    report(failed.clone());
    backend.set_write_failure(None);
    if let Some(SendOutcome::Failed { provisional_id, .. }) = failed {
        report(session.retry(&conversation, &provisional_id).await);
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    let snapshot = session.snapshot(&conversation).unwrap_or_default();
    println!("timeline for {conversation} ({} messages, newest first):", snapshot.len());
    for message in snapshot.iter().take(10) {
        println!("  {}", render(message));
    }
    if snapshot.len() > 10 {
        println!("  ... {} older", snapshot.len() - 10);
    }

    session.close_all();
}

async fn wait_for_update(events: &mut mpsc::Receiver<SessionEvent>) {
    let wait = async {
        while let Some(event) = events.recv().await {
            if matches!(event, SessionEvent::TimelineUpdated { .. }) {
                return;
            }
        }
    };
    if tokio::time::timeout(Duration::from_secs(2), wait).await.is_err() {
        tracing::warn!("no timeline update within 2s");
    }
}

fn summarize(snapshot: &[Message], conversation: &ConversationId) -> ConversationSummary {
    let mut summary = ConversationSummary::new(conversation.clone());
    if let Some(latest) = snapshot.first() {
        summary.last_message = Some(LastMessage::Text(latest.text.clone()));
        summary.last_message_sender_id = Some(latest.sender_id.clone());
        summary.participant_details.insert(
            latest.sender_id.clone(),
            ParticipantDetail {
                name: Some(latest.sender_name.clone()),
                avatar_url: None,
            },
        );
    }
    summary
}

fn report(outcome: Option<SendOutcome>) {
    match outcome {
        Some(SendOutcome::Delivered { assigned_id, .. }) => println!("sent as {assigned_id}"),
        Some(SendOutcome::Queued { assigned_id, .. }) => println!("queued as {assigned_id}"),
        Some(SendOutcome::Failed { provisional_id, reason }) => {
            println!("send {provisional_id} failed: {reason}");
        }
        Some(SendOutcome::Rejected(err)) => println!("draft rejected: {err}"),
        Some(SendOutcome::Closed) | None => println!("conversation not open"),
    }
}

fn render(message: &Message) -> String {
    let time = match message.created_at {
        EffectiveTime::Provisional => "--:--:--".to_string(),
        EffectiveTime::Server(ts) => i64::try_from(ts.as_millis())
            .ok()
            .and_then(chrono::DateTime::from_timestamp_millis)
            .map_or_else(|| ts.to_string(), |dt| dt.format("%H:%M:%S").to_string()),
    };
    format!(
        "[{time}] {}: {} ({:?})",
        message.sender_name, message.text, message.status
    )
}
