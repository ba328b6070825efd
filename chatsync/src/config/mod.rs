//! Configuration system for the `ChatSync` client.
//!
//! Supports layered configuration with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/chatsync/config.toml`)
//! 4. Compiled defaults
//!
//! Missing config file is not an error (defaults are used). An explicit
//! `--config` path that doesn't exist is an error.

use std::path::PathBuf;
use std::time::Duration;

use rand::Rng;

use chatsync_proto::message::UserId;

use crate::chat::outbox::ReconcileMode;

/// Default namespace of the persisted message cache.
pub const DEFAULT_NAMESPACE: &str = "chatMessages";

/// Errors that can occur when loading configuration.
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
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

/// Top-level TOML config file structure.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ConfigFile {
    network: NetworkFileConfig,
    reconnect: ReconnectFileConfig,
    history: HistoryFileConfig,
    outbox: OutboxFileConfig,
    cache: CacheFileConfig,
}

/// `[network]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct NetworkFileConfig {
    server_url: Option<String>,
    user_id: Option<u64>,
    peer: Option<u64>,
    connect_timeout_secs: Option<u64>,
    channel_capacity: Option<usize>,
}

/// `[reconnect]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ReconnectFileConfig {
    initial_delay_ms: Option<u64>,
    max_delay_secs: Option<u64>,
    multiplier: Option<f64>,
    jitter: Option<f64>,
}

/// `[history]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct HistoryFileConfig {
    fetch_timeout_secs: Option<u64>,
    fetch_retries: Option<u32>,
}

/// `[outbox]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct OutboxFileConfig {
    reconcile: Option<ReconcileMode>,
    match_window_secs: Option<u64>,
    resend_on_reconnect: Option<bool>,
}

/// `[cache]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct CacheFileConfig {
    dir: Option<PathBuf>,
    namespace: Option<String>,
    max_messages_per_peer: Option<usize>,
}

// ---------------------------------------------------------------------------
// Resolved configuration (concrete types, all fields populated)
// ---------------------------------------------------------------------------

/// Exponential backoff with jitter for session reconnects.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound on the un-jittered delay.
    pub max_delay: Duration,
    /// Growth factor per consecutive failed attempt (clamped to at least 1).
    pub multiplier: f64,
    /// Extra random delay as a fraction of the base delay, in `[0, 1]`.
    pub jitter: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.25,
        }
    }
}

impl ReconnectConfig {
    /// Un-jittered delay before retry number `attempt` (0-based).
    #[must_use]
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let multiplier = if self.multiplier.is_finite() {
            self.multiplier.max(1.0)
        } else {
            1.0
        };
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.initial_delay.as_secs_f64() * multiplier.powi(exponent);
        let max = self.max_delay.as_secs_f64();
        if secs.is_finite() {
            Duration::from_secs_f64(secs.min(max))
        } else {
            self.max_delay
        }
    }

    /// Delay before retry number `attempt`, with up to `jitter` added.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        let jitter = if self.jitter.is_finite() {
            self.jitter.clamp(0.0, 1.0)
        } else {
            0.0
        };
        if jitter == 0.0 {
            return base;
        }
        let factor = rand::rng().random_range(0.0..=jitter);
        base + base.mul_f64(factor)
    }
}

/// History paginator settings.
#[derive(Debug, Clone)]
pub struct HistoryConfig {
    /// How long an outstanding fetch may wait for its response.
    pub fetch_timeout: Duration,
    /// Re-requests after a timeout before surfacing a load error.
    pub fetch_retries: u32,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            fetch_timeout: Duration::from_secs(10),
            fetch_retries: 1,
        }
    }
}

/// Pending outbox settings.
#[derive(Debug, Clone)]
pub struct OutboxConfig {
    /// How confirmed messages are matched against pending ones.
    pub reconcile: ReconcileMode,
    /// Maximum clock distance for heuristic matching.
    pub match_window: Duration,
    /// Re-send unacknowledged messages whenever the session reconnects.
    pub resend_on_reconnect: bool,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            reconcile: ReconcileMode::Heuristic,
            match_window: Duration::from_secs(120),
            resend_on_reconnect: true,
        }
    }
}

/// Everything the sync engine needs, independent of how it was loaded.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// The local user.
    pub user_id: UserId,
    /// Cache namespace holding the per-peer message arrays.
    pub namespace: String,
    /// Optional bound on confirmed messages kept per peer.
    pub max_messages_per_peer: Option<usize>,
    /// Session reconnect policy.
    pub reconnect: ReconnectConfig,
    /// Timeout for a single connection attempt.
    pub connect_timeout: Duration,
    /// History paginator settings.
    pub history: HistoryConfig,
    /// Pending outbox settings.
    pub outbox: OutboxConfig,
    /// Capacity of the command and event channels.
    pub channel_capacity: usize,
}

impl SyncConfig {
    /// Default settings for `user_id`.
    #[must_use]
    pub fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            namespace: DEFAULT_NAMESPACE.to_string(),
            max_messages_per_peer: None,
            reconnect: ReconnectConfig::default(),
            connect_timeout: Duration::from_secs(10),
            history: HistoryConfig::default(),
            outbox: OutboxConfig::default(),
            channel_capacity: 256,
        }
    }
}

/// Fully resolved client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    // -- Network --
    /// Server WebSocket URL.
    pub server_url: Option<String>,
    /// Local user id.
    pub user_id: Option<UserId>,
    /// Peer to open on startup.
    pub peer: Option<UserId>,
    /// Timeout for a single connection attempt.
    pub connect_timeout: Duration,
    /// Channel capacity for command/event mpsc channels.
    pub channel_capacity: usize,

    // -- Engine --
    /// Session reconnect policy.
    pub reconnect: ReconnectConfig,
    /// History paginator settings.
    pub history: HistoryConfig,
    /// Pending outbox settings.
    pub outbox: OutboxConfig,

    // -- Cache --
    /// Directory of the file-backed cache (`None` = platform cache dir).
    pub cache_dir: Option<PathBuf>,
    /// Cache namespace.
    pub namespace: String,
    /// Optional bound on confirmed messages kept per peer.
    pub max_messages_per_peer: Option<usize>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: None,
            user_id: None,
            peer: None,
            connect_timeout: Duration::from_secs(10),
            channel_capacity: 256,
            reconnect: ReconnectConfig::default(),
            history: HistoryConfig::default(),
            outbox: OutboxConfig::default(),
            cache_dir: None,
            namespace: DEFAULT_NAMESPACE.to_string(),
            max_messages_per_peer: None,
        }
    }
}

impl ClientConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the explicit config file cannot be read
    /// or parsed, or if the default file exists but is malformed.
    pub fn load(cli: &CliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        Ok(Self::resolve(cli, &file))
    }

    /// Resolve a `ClientConfig` from CLI args and a parsed config file.
    ///
    /// Priority: CLI > file > default.
    #[must_use]
    fn resolve(cli: &CliArgs, file: &ConfigFile) -> Self {
        let defaults = Self::default();
        let reconnect_defaults = defaults.reconnect.clone();

        Self {
            server_url: cli
                .server_url
                .clone()
                .or_else(|| file.network.server_url.clone()),
            user_id: cli.user_id.or(file.network.user_id).map(UserId::new),
            peer: cli.peer.or(file.network.peer).map(UserId::new),
            connect_timeout: file
                .network
                .connect_timeout_secs
                .map_or(defaults.connect_timeout, Duration::from_secs),
            channel_capacity: file
                .network
                .channel_capacity
                .unwrap_or(defaults.channel_capacity),
            reconnect: ReconnectConfig {
                initial_delay: file
                    .reconnect
                    .initial_delay_ms
                    .map_or(reconnect_defaults.initial_delay, Duration::from_millis),
                max_delay: file
                    .reconnect
                    .max_delay_secs
                    .map_or(reconnect_defaults.max_delay, Duration::from_secs),
                multiplier: file
                    .reconnect
                    .multiplier
                    .unwrap_or(reconnect_defaults.multiplier),
                jitter: file.reconnect.jitter.unwrap_or(reconnect_defaults.jitter),
            },
            history: HistoryConfig {
                fetch_timeout: file
                    .history
                    .fetch_timeout_secs
                    .map_or(defaults.history.fetch_timeout, Duration::from_secs),
                fetch_retries: file
                    .history
                    .fetch_retries
                    .unwrap_or(defaults.history.fetch_retries),
            },
            outbox: OutboxConfig {
                reconcile: cli
                    .reconcile
                    .or(file.outbox.reconcile)
                    .unwrap_or(defaults.outbox.reconcile),
                match_window: file
                    .outbox
                    .match_window_secs
                    .map_or(defaults.outbox.match_window, Duration::from_secs),
                resend_on_reconnect: file
                    .outbox
                    .resend_on_reconnect
                    .unwrap_or(defaults.outbox.resend_on_reconnect),
            },
            cache_dir: cli.cache_dir.clone().or_else(|| file.cache.dir.clone()),
            namespace: file
                .cache
                .namespace
                .clone()
                .unwrap_or(defaults.namespace),
            max_messages_per_peer: file.cache.max_messages_per_peer,
        }
    }

    /// Build a [`SyncConfig`] if the local user id is known.
    #[must_use]
    pub fn to_sync_config(&self) -> Option<SyncConfig> {
        let user_id = self.user_id?;
        Some(SyncConfig {
            user_id,
            namespace: self.namespace.clone(),
            max_messages_per_peer: self.max_messages_per_peer,
            reconnect: self.reconnect.clone(),
            connect_timeout: self.connect_timeout,
            history: self.history.clone(),
            outbox: self.outbox.clone(),
            channel_capacity: self.channel_capacity,
        })
    }

    /// Directory of the file-backed cache, falling back to the platform
    /// cache directory.
    #[must_use]
    pub fn resolved_cache_dir(&self) -> Option<PathBuf> {
        self.cache_dir
            .clone()
            .or_else(|| dirs::cache_dir().map(|d| d.join("chatsync")))
    }
}

/// CLI arguments parsed by clap.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Headless ChatSync client")]
pub struct CliArgs {
    /// WebSocket URL of the chat server.
    #[arg(long, env = "CHATSYNC_SERVER_URL")]
    pub server_url: Option<String>,

    /// Your local user id.
    #[arg(long, env = "CHATSYNC_USER_ID")]
    pub user_id: Option<u64>,

    /// Peer to open the conversation with.
    #[arg(long)]
    pub peer: Option<u64>,

    /// Path to config file (default: `~/.config/chatsync/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// How confirmed messages replace optimistic ones.
    #[arg(long, value_enum)]
    pub reconcile: Option<ReconcileMode>,

    /// Directory for the message cache.
    #[arg(long)]
    pub cache_dir: Option<PathBuf>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "CHATSYNC_LOG")]
    pub log_level: String,

    /// Path to log file (default: `$TMPDIR/chatsync.log`).
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

/// Load and parse a TOML config file.
///
/// If `explicit_path` is `Some`, the file must exist (error if not).
/// If `explicit_path` is `None`, the default path is tried and a missing
/// file is treated as empty config.
fn load_config_file(explicit_path: Option<&std::path::Path>) -> Result<ConfigFile, ConfigError> {
    let path = if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    } else {
        let Some(config_dir) = dirs::config_dir() else {
            return Ok(ConfigFile::default());
        };
        config_dir.join("chatsync").join("config.toml")
    };

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
