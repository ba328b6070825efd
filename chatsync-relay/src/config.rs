//! Relay server settings.
//!
//! Values are layered CLI (and its `RELAY_*` environment variables) over the
//! `[server]` table of a TOML file over compiled defaults, then validated
//! against what the relay can actually serve. The defaults are the ones the
//! message log and the protocol crate use on their own.
//!
//! ```toml
//! [server]
//! bind_addr = "0.0.0.0:9000"
//! max_payload_len = 65536
//! history_page_size = 50
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use chatsync_proto::message::MAX_PAYLOAD_LEN;

use crate::relay::RelayState;
use crate::store::{DEFAULT_HISTORY_PAGE_SIZE, MessageLog};

const DEFAULT_BIND_ADDR: &str = "0.0.0.0:9000";

/// Errors that can occur when loading relay configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Failed to parse the TOML configuration.
    #[error("failed to parse config file: {0}")]
    ParseToml(#[from] toml::de::Error),

    /// A setting is outside what the relay can serve.
    #[error("invalid {field}: {reason}")]
    Invalid {
        /// Name of the offending setting.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },
}

/// `[server]` table; every key may be omitted.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ServerTable {
    bind_addr: Option<String>,
    max_payload_len: Option<usize>,
    history_page_size: Option<usize>,
}

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct RelayFile {
    server: ServerTable,
}

/// CLI arguments for the relay server.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "ChatSync relay server")]
pub struct RelayCliArgs {
    /// Socket address to listen on, e.g. `127.0.0.1:9000`.
    #[arg(short, long, env = "RELAY_ADDR")]
    pub bind: Option<String>,

    /// Path to config file (default: `~/.config/chatsync-relay/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Largest accepted message payload in bytes.
    #[arg(long, env = "RELAY_MAX_PAYLOAD_LEN")]
    pub max_payload_len: Option<usize>,

    /// Messages returned for a history request without a cursor.
    #[arg(long, env = "RELAY_HISTORY_PAGE_SIZE")]
    pub history_page_size: Option<usize>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "RELAY_LOG")]
    pub log_level: String,
}

/// Validated relay configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    /// Address the server listens on.
    pub bind_addr: SocketAddr,
    /// Largest accepted payload; never above [`MAX_PAYLOAD_LEN`].
    pub max_payload_len: usize,
    /// Messages per unanchored history page; at least 1.
    pub history_page_size: usize,
    /// Log level filter string.
    pub log_level: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 9000)),
            max_payload_len: MAX_PAYLOAD_LEN,
            history_page_size: DEFAULT_HISTORY_PAGE_SIZE,
            log_level: "info".to_string(),
        }
    }
}

impl RelayConfig {
    /// Read the config file named by `--config` (or the default one) and
    /// layer `cli` over it.
    ///
    /// A missing default file counts as empty; a missing explicit file is
    /// an error.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read or parsed, or a
    /// resulting value is invalid.
    pub fn load(cli: &RelayCliArgs) -> Result<Self, ConfigError> {
        let file = match cli.config.as_deref() {
            Some(path) => read_file(path)?,
            None => match default_path() {
                Some(path) if path.exists() => read_file(&path)?,
                _ => RelayFile::default(),
            },
        };
        Self::layer(cli, file.server)
    }

    fn layer(cli: &RelayCliArgs, file: ServerTable) -> Result<Self, ConfigError> {
        let bind = cli
            .bind
            .clone()
            .or(file.bind_addr)
            .unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string());
        let bind_addr = bind.parse::<SocketAddr>().map_err(|e| ConfigError::Invalid {
            field: "bind_addr",
            reason: format!("{bind:?}: {e}"),
        })?;

        let max_payload_len = cli
            .max_payload_len
            .or(file.max_payload_len)
            .unwrap_or(MAX_PAYLOAD_LEN);
        if max_payload_len == 0 || max_payload_len > MAX_PAYLOAD_LEN {
            return Err(ConfigError::Invalid {
                field: "max_payload_len",
                reason: format!("{max_payload_len} is not in 1..={MAX_PAYLOAD_LEN}"),
            });
        }

        let history_page_size = cli
            .history_page_size
            .or(file.history_page_size)
            .unwrap_or(DEFAULT_HISTORY_PAGE_SIZE);
        if history_page_size == 0 {
            return Err(ConfigError::Invalid {
                field: "history_page_size",
                reason: "must be at least 1".to_string(),
            });
        }

        Ok(Self {
            bind_addr,
            max_payload_len,
            history_page_size,
            log_level: cli.log_level.clone(),
        })
    }

    /// Fresh relay state enforcing these limits.
    #[must_use]
    pub fn state(&self) -> RelayState {
        RelayState::with_config(
            self.max_payload_len,
            MessageLog::with_history_page_size(self.history_page_size),
        )
    }
}

fn default_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("chatsync-relay").join("config.toml"))
}

fn read_file(path: &Path) -> Result<RelayFile, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(toml::from_str(&contents)?)
}
