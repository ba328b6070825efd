//! `ChatSync` relay server binary.
//!
//! ```bash
//! cargo run --bin chatsync-relay -- --bind 127.0.0.1:8080 --history-page-size 100
//! RELAY_MAX_PAYLOAD_LEN=4096 cargo run --bin chatsync-relay
//! ```

use std::process::ExitCode;
use std::sync::Arc;

use chatsync_relay::config::{RelayCliArgs, RelayConfig};
use chatsync_relay::relay;
use clap::Parser;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[tokio::main]
async fn main() -> ExitCode {
    let config = match RelayConfig::load(&RelayCliArgs::parse()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("chatsync-relay: {e}");
            return ExitCode::FAILURE;
        }
    };
    init_logging(&config.log_level);

    match serve(&config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "relay stopped");
            ExitCode::FAILURE
        }
    }
}

/// `RUST_LOG` wins over the configured level.
fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn serve(config: &RelayConfig) -> Result<(), BoxError> {
    let state = Arc::new(config.state());
    let (addr, server) =
        relay::start_server_with_state(&config.bind_addr.to_string(), state).await?;
    tracing::info!(
        %addr,
        max_payload_len = config.max_payload_len,
        history_page_size = config.history_page_size,
        "relay listening"
    );
    server.await?;
    Ok(())
}
