//! `ChatSync` headless client.
//!
//! Opens one conversation, prints the timeline as it changes, and sends
//! every line read from stdin. Configuration via CLI flags, environment
//! variables, or config file (`~/.config/chatsync/config.toml`).
//!
//! ```bash
//! # Start a relay, then chat as user 1 with user 2
//! cargo run --bin chatsync-relay
//! cargo run --bin chatsync -- --server-url ws://127.0.0.1:9000/ws \
//!     --user-id 1 --peer 2
//!
//! # Or via environment variables
//! CHATSYNC_SERVER_URL=ws://127.0.0.1:9000/ws CHATSYNC_USER_ID=1 cargo run -- --peer 2
//! ```

use std::collections::HashSet;
use std::path::Path;
use std::process::ExitCode;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing_appender::non_blocking::WorkerGuard;

use chatsync::cache::file::FileCache;
use chatsync::chat::outbox::Draft;
use chatsync::chat::store::{EntryKey, TimelineEntry};
use chatsync::chat::{Notice, SyncEngine, SyncEvent};
use chatsync::config::{CliArgs, ClientConfig};
use chatsync::net::SyncHandle;
use chatsync::transport::ConnectionState;
use chatsync::transport::ws::WsConnector;
use chatsync_proto::message::UserId;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = CliArgs::parse();

    // Load and resolve configuration (CLI args > config file > env > defaults).
    let config = match ClientConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Warning: failed to load config file: {e}");
            ClientConfig::default()
        }
    };

    // Logs go to a file so stdout carries only the timeline.
    let _log_guard = init_logging(&cli.log_level, cli.log_file.as_deref());

    let Some(sync_config) = config.to_sync_config() else {
        eprintln!("error: a user id is required (--user-id or CHATSYNC_USER_ID)");
        return ExitCode::FAILURE;
    };
    let Some(server_url) = config.server_url.as_deref() else {
        eprintln!("error: a server URL is required (--server-url or CHATSYNC_SERVER_URL)");
        return ExitCode::FAILURE;
    };
    let Some(peer) = config.peer else {
        eprintln!("error: a peer is required (--peer)");
        return ExitCode::FAILURE;
    };
    let connector = match WsConnector::new(server_url, sync_config.user_id) {
        Ok(c) => c.with_connect_timeout(config.connect_timeout),
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };
    let Some(cache_dir) = config.resolved_cache_dir() else {
        eprintln!("error: no cache directory available (--cache-dir)");
        return ExitCode::FAILURE;
    };

    tracing::info!(user = %sync_config.user_id, %peer, url = server_url, "chatsync starting");

    let (handle, events) = SyncEngine::spawn(&sync_config, connector, FileCache::new(cache_dir));
    if handle.select_peer(peer).await.is_err() {
        eprintln!("error: sync engine failed to start");
        return ExitCode::FAILURE;
    }

    run(&handle, events, peer).await;
    handle.shutdown().await;

    tracing::info!("chatsync exiting");
    ExitCode::SUCCESS
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

/// Print timeline changes and forward stdin lines until EOF.
async fn run(handle: &SyncHandle, mut events: mpsc::Receiver<SyncEvent>, peer: UserId) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut printed: HashSet<EntryKey> = HashSet::new();
    let mut stdin_open = true;

    println!("chatting with user {peer} (Ctrl-D to quit)");
    loop {
        tokio::select! {
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(text)) if text.trim().is_empty() => {}
                Ok(Some(text)) => {
                    if let Err(e) = handle.send(peer, Draft::text(text)).await {
                        println!("[error] {e}");
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "stdin read failed");
                    stdin_open = false;
                }
            },
            event = events.recv() => match event {
                Some(SyncEvent::ScrollToLatest { peer: changed }) if changed == peer => {
                    match handle.timeline(peer).await {
                        Ok(timeline) => print_new_entries(&timeline, &mut printed),
                        Err(_) => break,
                    }
                }
                Some(SyncEvent::ConnectionChanged(state)) => print_connection(state),
                Some(SyncEvent::PresenceChanged { online }) => {
                    let status = if online.contains(&peer) { "online" } else { "offline" };
                    println!("[user {peer} is {status}]");
                }
                Some(SyncEvent::UserJoined(user)) => println!("[{} joined]", user.display_name()),
                Some(SyncEvent::UserLeft(user)) => println!("[{} left]", user.display_name()),
                Some(SyncEvent::Notice(notice)) => print_notice(&notice),
                Some(SyncEvent::ScrollToLatest { .. }) => {}
                None => break,
            },
        }
    }
}

fn print_new_entries(timeline: &[TimelineEntry], printed: &mut HashSet<EntryKey>) {
    for entry in timeline {
        if !printed.insert(entry.key()) {
            continue;
        }
        match entry {
            TimelineEntry::Confirmed(message) if message.is_deleted => {
                println!("#{} <deleted>", message.id);
            }
            TimelineEntry::Confirmed(message) => {
                println!(
                    "#{} {} user {}: {}",
                    message.id,
                    message.created_at.format("%H:%M"),
                    message.sender_id,
                    message.payload
                );
            }
            TimelineEntry::Pending(pending) => {
                println!("… {} (sending)", pending.payload);
            }
        }
    }
}

fn print_connection(state: ConnectionState) {
    match state {
        ConnectionState::Connected => println!("[connected]"),
        ConnectionState::Connecting | ConnectionState::Disconnected => {
            println!("[reconnecting…]");
        }
    }
}

fn print_notice(notice: &Notice) {
    match notice {
        Notice::LoadFailed { peer, reason } => {
            println!("[could not load history with user {peer}: {reason}]");
        }
        Notice::PersistenceFailed { reason } => println!("[cache unavailable: {reason}]"),
        Notice::SendDeferred { temp_id, reason } => {
            println!("[{temp_id} queued: {reason}]");
        }
    }
}
