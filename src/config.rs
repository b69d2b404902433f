//! Client configuration, read once from environment variables.
//!
//! Usage:
//!   CLI_ID=1 CLI_SERVER_ADDRESS=server:12345 CLI_LOOP_PERIOD=100ms ./bet-uploader

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::frame::{FIELD_SEPARATOR, RECORD_SEPARATOR};

pub const DEFAULT_SERVER_ADDRESS: &str = "server:12345";
pub const DEFAULT_BATCH_MAX_AMOUNT: usize = 120;
pub const DEFAULT_LOOP_PERIOD: Duration = Duration::from_secs(5);
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(1);
pub const DEFAULT_POLL_ATTEMPTS: u32 = 5;
pub const DEFAULT_DATA_DIR: &str = "./.data";
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Immutable settings of one upload run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub id: String,
    pub server_address: String,
    /// Pause before every batch, also the deadline for its acknowledgment.
    pub loop_period: Duration,
    pub batch_max_amount: usize,
    /// Deadline of a single attempt to read the final result.
    pub poll_timeout: Duration,
    pub poll_attempts: u32,
    pub data_dir: PathBuf,
    pub log_level: String,
}

impl ClientConfig {
    pub fn new(id: impl Into<String>, server_address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            server_address: server_address.into(),
            loop_period: DEFAULT_LOOP_PERIOD,
            batch_max_amount: DEFAULT_BATCH_MAX_AMOUNT,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            poll_attempts: DEFAULT_POLL_ATTEMPTS,
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            log_level: DEFAULT_LOG_LEVEL.to_owned(),
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from any key lookup; `from_env` uses the
    /// process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let id = get("CLI_ID").ok_or(ConfigError::Missing("CLI_ID"))?;
        let id = id.trim();
        if id.contains([FIELD_SEPARATOR, RECORD_SEPARATOR, '\n', '\r']) {
            return Err(ConfigError::Invalid {
                var: "CLI_ID",
                value: id.to_owned(),
                reason: "must not contain separators or line breaks".to_owned(),
            });
        }
        let mut config = Self::new(
            id,
            get("CLI_SERVER_ADDRESS").unwrap_or_else(|| DEFAULT_SERVER_ADDRESS.to_owned()),
        );

        if let Some(v) = get("CLI_LOOP_PERIOD") {
            config.loop_period = parse_duration("CLI_LOOP_PERIOD", &v)?;
        }
        if let Some(v) = get("CLI_BATCH_MAX_AMOUNT") {
            config.batch_max_amount = parse_number("CLI_BATCH_MAX_AMOUNT", &v)?;
        }
        if config.batch_max_amount == 0 {
            config.batch_max_amount = DEFAULT_BATCH_MAX_AMOUNT;
        }
        if let Some(v) = get("CLI_POLL_TIMEOUT") {
            config.poll_timeout = parse_duration("CLI_POLL_TIMEOUT", &v)?;
        }
        if let Some(v) = get("CLI_POLL_ATTEMPTS") {
            config.poll_attempts = parse_number("CLI_POLL_ATTEMPTS", &v)?;
        }
        if let Some(v) = get("CLI_DATA_DIR") {
            config.data_dir = PathBuf::from(v);
        }
        if let Some(v) = get("CLI_LOG_LEVEL") {
            config.log_level = v.to_lowercase();
        }
        Ok(config)
    }

    /// `<data_dir>/agency-<id>.csv`
    pub fn bets_path(&self) -> PathBuf {
        self.data_dir.join(format!("agency-{}.csv", self.id))
    }
}

fn parse_duration(var: &'static str, value: &str) -> Result<Duration, ConfigError> {
    humantime::parse_duration(value.trim()).map_err(|e| ConfigError::Invalid {
        var,
        value: value.to_owned(),
        reason: e.to_string(),
    })
}

fn parse_number<T>(var: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
        var,
        value: value.to_owned(),
        reason: e.to_string(),
    })
}
