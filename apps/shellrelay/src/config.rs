use directories::ProjectDirs;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::session::{DEFAULT_UNREACHABLE_PREFIX, SessionConfig, SessionError};
use crate::telemetry::logging::{LogConfig, LogLevel};
use crate::transfer::PayloadEncoding;
use crate::transfer::controller::TransferConfig;

pub const DEFAULT_SERVER: &str = "http://127.0.0.1:8888/";
pub const DEFAULT_CHUNK_SIZE: u64 = 2 * 1024 * 1024;
pub const DEFAULT_RETRYABLE_STATUS: u16 = 555;
pub const DEFAULT_RETRY_DELAY_MS: u64 = 500;
pub const DEFAULT_UPLOAD_DIR: &str = "/tmp";

pub const UNREACHABLE_PREFIX_ENV: &str = "SHELLRELAY_UNREACHABLE_PREFIX";
pub const UPLOAD_DIR_ENV: &str = "SHELLRELAY_UPLOAD_DIR";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Keys accepted in `config.toml`. Everything is optional.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub server: Option<String>,
    pub chunk_size: Option<u64>,
    pub retry_statuses: Option<Vec<u16>>,
    pub retry_delay_ms: Option<u64>,
    pub max_attempts: Option<u32>,
    pub payload: Option<PayloadEncoding>,
    pub unreachable_prefix: Option<String>,
    pub upload_dir: Option<String>,
    pub log_level: Option<LogLevel>,
    pub log_file: Option<PathBuf>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Loads `config.toml` from the platform config directory, if present.
    pub fn load_default() -> Result<Self, ConfigError> {
        match default_path() {
            Some(path) if path.is_file() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }
}

pub fn default_path() -> Option<PathBuf> {
    ProjectDirs::from("", "", "shellrelay").map(|dirs| dirs.config_dir().join("config.toml"))
}

/// Values that came from the command line (clap already folds the matching
/// `SHELLRELAY_*` environment variables into these).
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub server: Option<String>,
    pub chunk_size: Option<u64>,
    pub retry_statuses: Vec<u16>,
    pub retry_delay_ms: Option<u64>,
    pub max_attempts: Option<u32>,
    pub payload: Option<PayloadEncoding>,
    pub log_level: Option<LogLevel>,
    pub log_file: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub server: String,
    pub chunk_size: u64,
    pub retryable_statuses: BTreeSet<u16>,
    pub retry_delay: Duration,
    pub max_attempts: Option<u32>,
    pub payload: PayloadEncoding,
    pub unreachable_prefix: String,
    pub upload_dir: String,
    pub log: LogConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: DEFAULT_SERVER.to_string(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            retryable_statuses: BTreeSet::from([DEFAULT_RETRYABLE_STATUS]),
            retry_delay: Duration::from_millis(DEFAULT_RETRY_DELAY_MS),
            max_attempts: None,
            payload: PayloadEncoding::default(),
            unreachable_prefix: DEFAULT_UNREACHABLE_PREFIX.to_string(),
            upload_dir: DEFAULT_UPLOAD_DIR.to_string(),
            log: LogConfig::default(),
        }
    }
}

impl Config {
    /// Layers command line (and environment) over the config file over the
    /// built-in defaults.
    pub fn resolve(overrides: ConfigOverrides, file: FileConfig) -> Result<Self, ConfigError> {
        let defaults = Config::default();

        let retryable_statuses = if !overrides.retry_statuses.is_empty() {
            overrides.retry_statuses.into_iter().collect()
        } else if let Some(statuses) = file.retry_statuses {
            statuses.into_iter().collect()
        } else {
            defaults.retryable_statuses
        };
        if let Some(bad) = retryable_statuses
            .iter()
            .find(|status| !(100..=999).contains(*status))
        {
            return Err(ConfigError::Invalid(format!(
                "retryable status {bad} is not an http status code"
            )));
        }

        let chunk_size = overrides
            .chunk_size
            .or(file.chunk_size)
            .unwrap_or(defaults.chunk_size);
        if chunk_size == 0 {
            return Err(ConfigError::Invalid("chunk size must be positive".into()));
        }

        let max_attempts = overrides.max_attempts.or(file.max_attempts);
        if max_attempts == Some(0) {
            return Err(ConfigError::Invalid("max attempts must be positive".into()));
        }

        Ok(Self {
            server: overrides
                .server
                .or(file.server)
                .unwrap_or(defaults.server),
            chunk_size,
            retryable_statuses,
            retry_delay: overrides
                .retry_delay_ms
                .or(file.retry_delay_ms)
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry_delay),
            max_attempts,
            payload: overrides.payload.or(file.payload).unwrap_or(defaults.payload),
            unreachable_prefix: env_string(UNREACHABLE_PREFIX_ENV)
                .or(file.unreachable_prefix)
                .unwrap_or(defaults.unreachable_prefix),
            upload_dir: env_string(UPLOAD_DIR_ENV)
                .or(file.upload_dir)
                .unwrap_or(defaults.upload_dir),
            log: LogConfig {
                level: overrides
                    .log_level
                    .or(file.log_level)
                    .unwrap_or(defaults.log.level),
                file: overrides.log_file.or(file.log_file),
                console: true,
            },
        })
    }

    pub fn session_config(&self) -> Result<SessionConfig, SessionError> {
        Ok(SessionConfig::new(&self.server)?.with_unreachable_prefix(&self.unreachable_prefix))
    }

    pub fn transfer_config(&self) -> TransferConfig {
        TransferConfig {
            chunk_size: self.chunk_size,
            retryable_statuses: self.retryable_statuses.clone(),
            retry_delay: self.retry_delay,
            max_attempts: self.max_attempts,
            payload: self.payload,
        }
    }

    /// Where the relay host keeps an uploaded file.
    pub fn remote_upload_path(&self, file_name: &str) -> String {
        format!("{}/{}", self.upload_dir.trim_end_matches('/'), file_name)
    }
}

fn env_string(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
