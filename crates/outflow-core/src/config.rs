//! Outflow configuration system.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::Result;

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutflowConfig {
    #[serde(default = "default_database_path")]
    pub database_path: String,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub messaging: MessagingConfig,
    #[serde(default)]
    pub generator: GeneratorConfig,
    #[serde(default)]
    pub email: EmailConfig,
    #[serde(default)]
    pub invites: InviteConfig,
}

fn default_database_path() -> String {
    "~/.outflow/outflow.db".into()
}

impl Default for OutflowConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            scheduler: SchedulerConfig::default(),
            messaging: MessagingConfig::default(),
            generator: GeneratorConfig::default(),
            email: EmailConfig::default(),
            invites: InviteConfig::default(),
        }
    }
}

impl OutflowConfig {
    /// Load config from the default path (~/.outflow/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            crate::error::OutflowError::Config(format!("Failed to read config: {e}"))
        })?;
        let config: Self = toml::from_str(&content).map_err(|e| {
            crate::error::OutflowError::Config(format!("Failed to parse config: {e}"))
        })?;
        Ok(config)
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the Outflow home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".outflow")
    }

    /// Resolve the database path, expanding a leading `~`.
    pub fn resolved_database_path(&self) -> PathBuf {
        if let Some(rest) = self.database_path.strip_prefix("~/") {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(rest)
        } else {
            PathBuf::from(&self.database_path)
        }
    }
}

/// Job scheduler tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Worker tick interval in seconds.
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,
    /// Jobs claimed per tick.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Retry attempts before a job is parked.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Base delay for exponential backoff, in seconds.
    #[serde(default = "default_backoff_secs")]
    pub backoff_base_secs: u64,
}

fn default_tick_secs() -> u64 {
    5
}
fn default_batch_size() -> usize {
    10
}
fn default_max_attempts() -> u32 {
    3
}
fn default_backoff_secs() -> u64 {
    10
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_secs: default_tick_secs(),
            batch_size: default_batch_size(),
            max_attempts: default_max_attempts(),
            backoff_base_secs: default_backoff_secs(),
        }
    }
}

/// Outbound messaging API (connection requests + direct messages).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagingConfig {
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_http_timeout")]
    pub timeout_secs: u64,
}

fn default_http_timeout() -> u64 {
    30
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            api_key: String::new(),
            timeout_secs: default_http_timeout(),
        }
    }
}

/// Text generation service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratorConfig {
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_generate_timeout")]
    pub timeout_secs: u64,
}

fn default_generate_timeout() -> u64 {
    45
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            api_key: String::new(),
            timeout_secs: default_generate_timeout(),
        }
    }
}

/// SMTP settings for queued workflow emails.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailConfig {
    #[serde(default)]
    pub smtp_host: String,
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub from_address: String,
    #[serde(default)]
    pub enabled: bool,
}

fn default_smtp_port() -> u16 {
    587
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            smtp_host: String::new(),
            smtp_port: default_smtp_port(),
            username: String::new(),
            password: String::new(),
            from_address: String::new(),
            enabled: false,
        }
    }
}

/// Invite automation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InviteConfig {
    /// Hour of day (local to the account) from which invites may go out.
    #[serde(default = "default_send_start")]
    pub send_start_hour: u32,
    /// Hour of day before which invites must go out.
    #[serde(default = "default_send_end")]
    pub send_end_hour: u32,
    /// Days a sent invite may stay pending before the sweep picks it up.
    #[serde(default = "default_expiry_days")]
    pub expiry_days: i64,
    /// Withdraw expired invites through the messaging API.
    #[serde(default = "default_true")]
    pub withdraw_expired: bool,
    /// Sweep interval in seconds.
    #[serde(default = "default_sweep_secs")]
    pub sweep_interval_secs: u64,
}

fn default_send_start() -> u32 {
    9
}
fn default_send_end() -> u32 {
    18
}
fn default_expiry_days() -> i64 {
    7
}
fn default_true() -> bool {
    true
}
fn default_sweep_secs() -> u64 {
    3600
}

impl Default for InviteConfig {
    fn default() -> Self {
        Self {
            send_start_hour: default_send_start(),
            send_end_hour: default_send_end(),
            expiry_days: default_expiry_days(),
            withdraw_expired: default_true(),
            sweep_interval_secs: default_sweep_secs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = OutflowConfig::default();
        assert_eq!(cfg.scheduler.max_attempts, 3);
        assert_eq!(cfg.invites.expiry_days, 7);
        assert!(!cfg.email.enabled);
    }

    #[test]
    fn test_partial_toml() {
        let cfg: OutflowConfig = toml::from_str(
            r#"
            database_path = "/tmp/test.db"

            [scheduler]
            tick_secs = 1
            "#,
        )
        .unwrap();
        assert_eq!(cfg.database_path, "/tmp/test.db");
        assert_eq!(cfg.scheduler.tick_secs, 1);
        assert_eq!(cfg.scheduler.max_attempts, 3);
    }
}
