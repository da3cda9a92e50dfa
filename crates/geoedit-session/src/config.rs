//! Session configuration.
//!
//! Read from environment variables, with defaults for anything unset:
//! - `GEOEDIT_HISTORY_LIMIT`: undo history bound (default: 100)
//! - `GEOEDIT_LOCK_TIMEOUT_MS`: maximum wait for the session lock (default: 5000)
//! - `GEOEDIT_UPLOAD_REMOVAL`: `reject`, `cascade` or `make_incomplete`
//!   for deletions confirmed by an upload (default: `cascade`)

use std::time::Duration;

use serde::{Deserialize, Serialize};

use geoedit_command::CommandHistory;
use geoedit_core::RemovalMode;

use crate::error::SessionError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub history_limit: usize,
    pub lock_timeout_ms: u64,
    pub upload_removal_mode: RemovalMode,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            history_limit: CommandHistory::DEFAULT_LIMIT,
            lock_timeout_ms: 5_000,
            upload_removal_mode: RemovalMode::Cascade,
        }
    }
}

impl SessionConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn from_env() -> Result<Self, SessionError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from any key lookup; `from_env` uses the process
    /// environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, SessionError> {
        let mut config = SessionConfig::default();
        if let Some(raw) = lookup("GEOEDIT_HISTORY_LIMIT") {
            config.history_limit = parse(&raw, "GEOEDIT_HISTORY_LIMIT")?;
        }
        if let Some(raw) = lookup("GEOEDIT_LOCK_TIMEOUT_MS") {
            config.lock_timeout_ms = parse(&raw, "GEOEDIT_LOCK_TIMEOUT_MS")?;
        }
        if let Some(raw) = lookup("GEOEDIT_UPLOAD_REMOVAL") {
            config.upload_removal_mode =
                serde_json::from_value(serde_json::Value::String(raw.trim().to_string())).map_err(
                    |_| SessionError::Config(format!("GEOEDIT_UPLOAD_REMOVAL: unknown mode `{raw}`")),
                )?;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn from_json(json: &str) -> Result<Self, SessionError> {
        let config: SessionConfig =
            serde_json::from_str(json).map_err(|e| SessionError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), SessionError> {
        if self.history_limit == 0 {
            return Err(SessionError::Config("history_limit must be at least 1".to_string()));
        }
        if self.lock_timeout_ms == 0 {
            return Err(SessionError::Config("lock_timeout_ms must be at least 1".to_string()));
        }
        Ok(())
    }
}

fn parse<T: std::str::FromStr>(raw: &str, key: &str) -> Result<T, SessionError> {
    raw.trim()
        .parse()
        .map_err(|_| SessionError::Config(format!("{key}: cannot parse `{raw}`")))
}
