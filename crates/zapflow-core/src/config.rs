//! Zapflow configuration system.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Result, ZapflowError};

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ZapflowConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub uazapi: UazapiConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
}

impl ZapflowConfig {
    /// Load config from `ZAPFLOW_CONFIG` or the default path (~/.zapflow/config.toml).
    pub fn load() -> Result<Self> {
        let path = std::env::var("ZAPFLOW_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| Self::default_path());
        if path.exists() {
            Self::load_from(&path)
        } else {
            tracing::debug!("No config at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ZapflowError::Config(format!("Failed to read config: {e}")))?;
        Self::from_toml(&content)
    }

    /// Parse and validate config from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| ZapflowError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the dispatch loop cannot run with.
    pub fn validate(&self) -> Result<()> {
        let d = &self.dispatch;
        if d.min_delay_secs > d.max_delay_secs {
            return Err(ZapflowError::Config(format!(
                "dispatch.min_delay_secs ({}) exceeds dispatch.max_delay_secs ({})",
                d.min_delay_secs, d.max_delay_secs
            )));
        }
        if d.default_country_code.is_empty()
            || !d.default_country_code.chars().all(|c| c.is_ascii_digit())
        {
            return Err(ZapflowError::Config(
                "dispatch.default_country_code must be a non-empty digit string".into(),
            ));
        }
        d.tz()?;
        if self.uazapi.base_url.is_empty() {
            return Err(ZapflowError::Config("uazapi.base_url is empty".into()));
        }
        Ok(())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the Zapflow home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".zapflow")
    }
}

/// SQLite database location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

fn default_db_path() -> String { "~/.zapflow/zapflow.db".into() }

impl DatabaseConfig {
    /// Database path with `~` expanded.
    pub fn resolved_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.path).to_string())
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { path: default_db_path() }
    }
}

/// Control-surface HTTP server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_host")]
    pub host: String,
}

fn default_port() -> u16 { 3030 }
fn default_host() -> String { "127.0.0.1".into() }

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
        }
    }
}

/// UAZAPI messaging API endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UazapiConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

fn default_base_url() -> String { "https://free.uazapi.com".into() }
fn default_timeout() -> u64 { 30 }

impl Default for UazapiConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            timeout_secs: default_timeout(),
        }
    }
}

/// What to do with jobs found `running` when the process starts.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum StartupPolicy {
    /// Re-spawn a dispatch loop for each of them.
    #[default]
    Resume,
    /// Mark them failed.
    Fail,
}

/// Pacing defaults applied to new jobs, plus loop-wide settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    #[serde(default = "default_min_delay")]
    pub min_delay_secs: u64,
    #[serde(default = "default_max_delay")]
    pub max_delay_secs: u64,
    /// Batch pause after this many successful sends (0 disables).
    #[serde(default = "default_pause_after")]
    pub pause_after: u32,
    #[serde(default = "default_pause_duration")]
    pub pause_duration_secs: u64,
    #[serde(default = "default_country_code")]
    pub default_country_code: String,
    /// IANA timezone used for business hours and the quota day boundary.
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default = "default_recent_log_limit")]
    pub recent_log_limit: usize,
    #[serde(default)]
    pub startup_policy: StartupPolicy,
}

fn default_min_delay() -> u64 { 30 }
fn default_max_delay() -> u64 { 60 }
fn default_pause_after() -> u32 { 20 }
fn default_pause_duration() -> u64 { 300 }
fn default_country_code() -> String { "55".into() }
fn default_timezone() -> String { "America/Sao_Paulo".into() }
fn default_recent_log_limit() -> usize { 50 }

impl DispatchConfig {
    /// Parsed timezone.
    pub fn tz(&self) -> Result<chrono_tz::Tz> {
        self.timezone
            .parse::<chrono_tz::Tz>()
            .map_err(|e| ZapflowError::Config(format!("dispatch.timezone: {e}")))
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            min_delay_secs: default_min_delay(),
            max_delay_secs: default_max_delay(),
            pause_after: default_pause_after(),
            pause_duration_secs: default_pause_duration(),
            default_country_code: default_country_code(),
            timezone: default_timezone(),
            recent_log_limit: default_recent_log_limit(),
            startup_policy: StartupPolicy::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ZapflowConfig::default();
        assert_eq!(config.gateway.port, 3030);
        assert_eq!(config.dispatch.default_country_code, "55");
        assert_eq!(config.dispatch.startup_policy, StartupPolicy::Resume);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            [gateway]
            port = 8080

            [dispatch]
            min_delay_secs = 5
            max_delay_secs = 10
            timezone = "Europe/Lisbon"
            startup_policy = "fail"
        "#;

        let config = ZapflowConfig::from_toml(toml_str).unwrap();
        assert_eq!(config.gateway.port, 8080);
        assert_eq!(config.dispatch.min_delay_secs, 5);
        assert_eq!(config.dispatch.pause_after, 20);
        assert_eq!(config.dispatch.startup_policy, StartupPolicy::Fail);
    }

    #[test]
    fn test_config_missing_fields_use_defaults() {
        let config = ZapflowConfig::from_toml("").unwrap();
        assert_eq!(config.dispatch.max_delay_secs, 60);
        assert_eq!(config.uazapi.timeout_secs, 30);
    }

    #[test]
    fn test_rejects_inverted_delays() {
        let err = ZapflowConfig::from_toml("[dispatch]\nmin_delay_secs = 9\nmax_delay_secs = 3\n")
            .unwrap_err();
        assert!(err.to_string().contains("min_delay_secs"));
    }

    #[test]
    fn test_rejects_unknown_timezone() {
        assert!(ZapflowConfig::from_toml("[dispatch]\ntimezone = \"Mars/Olympus\"\n").is_err());
    }

    #[test]
    fn test_home_dir() {
        let home = ZapflowConfig::home_dir();
        assert!(home.to_string_lossy().contains("zapflow"));
    }
}
