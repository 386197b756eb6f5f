//! Configuration for the chatsync engine and demo binary.
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

use crate::failed::{DEFAULT_MAX_RECORDS, DEFAULT_STORAGE_KEY, FailedStoreConfig};
use crate::notify::DEFAULT_FALLBACK_NAME;
use crate::pagination::DEFAULT_PAGE_SIZE;

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
    sync: SyncFileConfig,
    failed: FailedFileConfig,
    notify: NotifyFileConfig,
    user: UserFileConfig,
}

/// `[sync]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct SyncFileConfig {
    page_size: Option<usize>,
    subscription_limit: Option<usize>,
    event_buffer: Option<usize>,
}

/// `[failed]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct FailedFileConfig {
    max_records: Option<usize>,
    storage_key: Option<String>,
    data_dir: Option<PathBuf>,
}

/// `[notify]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct NotifyFileConfig {
    fallback_sender_name: Option<String>,
}

/// `[user]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct UserFileConfig {
    id: Option<String>,
    name: Option<String>,
}

// ---------------------------------------------------------------------------
// Resolved configuration (concrete types, all fields populated)
// ---------------------------------------------------------------------------

/// Per-conversation sync settings (used by `ChatSession`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// Records requested per history page.
    pub page_size: usize,
    /// Size of the newest window requested from the live subscription.
    pub subscription_limit: usize,
    /// Buffer size for the session event channel.
    pub event_buffer: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            subscription_limit: DEFAULT_PAGE_SIZE,
            event_buffer: 64,
        }
    }
}

/// Fully resolved engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Sync settings.
    pub sync: SyncConfig,
    /// Failed-send store settings.
    pub failed: FailedStoreConfig,
    /// Directory of the durable key-value store (`None` = platform default).
    pub data_dir: Option<PathBuf>,
    /// Notification title when the sender has no display name.
    pub fallback_sender_name: String,
    /// Local user id.
    pub user_id: String,
    /// Local user display name.
    pub user_name: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sync: SyncConfig::default(),
            failed: FailedStoreConfig::default(),
            data_dir: None,
            fallback_sender_name: DEFAULT_FALLBACK_NAME.to_string(),
            user_id: "me".to_string(),
            user_name: "Me".to_string(),
        }
    }
}

impl EngineConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// If `--config` is given and the file does not exist, returns an
    /// error. Otherwise the default path is tried and silently ignored if
    /// missing.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the config file cannot be read or parsed.
    pub fn load(cli: &CliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        Ok(Self::resolve(cli, &file))
    }

    /// Resolve from CLI args and a parsed config file. Priority: CLI > file > default.
    #[must_use]
    fn resolve(cli: &CliArgs, file: &ConfigFile) -> Self {
        let defaults = Self::default();

        Self {
            sync: SyncConfig {
                page_size: cli
                    .page_size
                    .or(file.sync.page_size)
                    .unwrap_or(defaults.sync.page_size),
                subscription_limit: file
                    .sync
                    .subscription_limit
                    .unwrap_or(defaults.sync.subscription_limit),
                event_buffer: file
                    .sync
                    .event_buffer
                    .unwrap_or(defaults.sync.event_buffer),
            },
            failed: FailedStoreConfig {
                storage_key: file
                    .failed
                    .storage_key
                    .clone()
                    .unwrap_or_else(|| DEFAULT_STORAGE_KEY.to_string()),
                max_records: file
                    .failed
                    .max_records
                    .unwrap_or(DEFAULT_MAX_RECORDS)
                    .max(1),
            },
            data_dir: cli
                .data_dir
                .clone()
                .or_else(|| file.failed.data_dir.clone()),
            fallback_sender_name: file
                .notify
                .fallback_sender_name
                .clone()
                .unwrap_or(defaults.fallback_sender_name),
            user_id: cli
                .user_id
                .clone()
                .or_else(|| file.user.id.clone())
                .unwrap_or(defaults.user_id),
            user_name: cli
                .user_name
                .clone()
                .or_else(|| file.user.name.clone())
                .unwrap_or(defaults.user_name),
        }
    }
}

/// CLI arguments parsed by clap.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Message timeline synchronization demo")]
pub struct CliArgs {
    /// Path to config file (default: `~/.config/chatsync/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Local user id.
    #[arg(long, env = "CHATSYNC_USER_ID")]
    pub user_id: Option<String>,

    /// Local user display name.
    #[arg(long, env = "CHATSYNC_USER_NAME")]
    pub user_name: Option<String>,

    /// Records requested per history page.
    #[arg(long)]
    pub page_size: Option<usize>,

    /// Directory for durable failed-send records.
    #[arg(long, env = "CHATSYNC_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Keep failed-send records in memory only.
    #[arg(long)]
    pub ephemeral: bool,

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
/// If `explicit_path` is `None`, the default path is tried and missing file
/// is treated as empty config.
fn load_config_file(explicit_path: Option<&std::path::Path>) -> Result<ConfigFile, ConfigError> {
    if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    }
    let Some(config_dir) = dirs::config_dir() else {
        return Ok(ConfigFile::default());
    };
    let path = config_dir.join("chatsync").join("config.toml");

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
