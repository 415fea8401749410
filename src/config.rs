//! Configuration parsing and validation.
//!
//! pipesync is configured via a TOML file (default: `config/pipesync.toml`).
//! Every section except `[db]` is optional and falls back to defaults.
//!
//! # Example Configuration
//!
//! ```toml
//! [db]
//! path = "./data/pipesync.sqlite"
//!
//! [server]
//! bind = "127.0.0.1:7340"
//!
//! [pipedrive]
//! base_url = "https://api.pipedrive.com/v1"
//! max_retries = 3
//! retry_base_delay_ms = 1000
//! rate_limit_handling = true
//! detailed_logging = false
//!
//! [sanitize]
//! name_max = 255
//! note_max = 10000
//!
//! [sync]
//! page_size = 100
//! active_filter_name = "Still Active"
//!
//! [promotion]
//! warm_threshold = 4
//! warm_lead_label = "Warm Lead"
//!
//! [replication]
//! max_attempts = 3
//! ```
//!
//! The API token is read from `pipedrive.api_token`, or from the
//! `PIPEDRIVE_API_TOKEN` environment variable when the file leaves it out.

use anyhow::{Context, Result};
use pipesync_core::sanitize::SanitizeLimits;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::retry::RetryPolicy;

/// Environment variable consulted when no token is configured.
pub const TOKEN_ENV_VAR: &str = "PIPEDRIVE_API_TOKEN";

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub pipedrive: PipedriveConfig,
    #[serde(default)]
    pub sanitize: SanitizeLimits,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub promotion: PromotionConfig,
    #[serde(default)]
    pub replication: ReplicationConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7340".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipedriveConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_token: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_max_retry_delay_ms")]
    pub max_retry_delay_ms: u64,
    #[serde(default = "default_true")]
    pub rate_limit_handling: bool,
    #[serde(default = "default_rate_limit_delay_ms")]
    pub rate_limit_default_delay_ms: u64,
    #[serde(default = "default_rate_limit_max_wait_secs")]
    pub rate_limit_max_wait_secs: u64,
    #[serde(default)]
    pub detailed_logging: bool,
}

impl Default for PipedriveConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_token: None,
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            max_retry_delay_ms: default_max_retry_delay_ms(),
            rate_limit_handling: true,
            rate_limit_default_delay_ms: default_rate_limit_delay_ms(),
            rate_limit_max_wait_secs: default_rate_limit_max_wait_secs(),
            detailed_logging: false,
        }
    }
}

fn default_base_url() -> String {
    "https://api.pipedrive.com/v1".to_string()
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_base_delay_ms() -> u64 {
    1000
}
fn default_max_retry_delay_ms() -> u64 {
    30_000
}
fn default_true() -> bool {
    true
}
fn default_rate_limit_delay_ms() -> u64 {
    2000
}
fn default_rate_limit_max_wait_secs() -> u64 {
    60
}

impl PipedriveConfig {
    /// The configured token, falling back to the environment.
    pub fn resolve_token(&self) -> Option<String> {
        self.api_token
            .clone()
            .filter(|t| !t.trim().is_empty())
            .or_else(|| std::env::var(TOKEN_ENV_VAR).ok())
            .filter(|t| !t.trim().is_empty())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            max_delay: Duration::from_millis(self.max_retry_delay_ms),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SyncConfig {
    #[serde(default = "default_page_size")]
    pub page_size: u64,
    #[serde(default = "default_active_filter_name")]
    pub active_filter_name: String,
    #[serde(default = "default_retain_finished_secs")]
    pub retain_finished_secs: u64,
    #[serde(default = "default_rate_window")]
    pub rate_window: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            active_filter_name: default_active_filter_name(),
            retain_finished_secs: default_retain_finished_secs(),
            rate_window: default_rate_window(),
        }
    }
}

fn default_page_size() -> u64 {
    100
}
fn default_active_filter_name() -> String {
    "Still Active".to_string()
}
fn default_retain_finished_secs() -> u64 {
    300
}
fn default_rate_window() -> usize {
    pipesync_core::progress::DEFAULT_RATE_WINDOW
}

#[derive(Debug, Deserialize, Clone)]
pub struct PromotionConfig {
    #[serde(default = "default_warm_threshold")]
    pub warm_threshold: i64,
    #[serde(default = "default_warm_lead_label")]
    pub warm_lead_label: String,
}

impl Default for PromotionConfig {
    fn default() -> Self {
        Self {
            warm_threshold: default_warm_threshold(),
            warm_lead_label: default_warm_lead_label(),
        }
    }
}

fn default_warm_threshold() -> i64 {
    4
}
fn default_warm_lead_label() -> String {
    "Warm Lead".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReplicationConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub base_delay_ms: u64,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_retry_base_delay_ms(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

impl ReplicationConfig {
    /// Whole-operation retry policy; `max_attempts` counts the first try.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_attempts.saturating_sub(1),
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(default_max_retry_delay_ms()),
        }
    }
}

impl Config {
    /// A config with every default and the given database path.
    pub fn with_db_path(path: impl Into<PathBuf>) -> Self {
        Self {
            db: DbConfig { path: path.into() },
            server: ServerConfig::default(),
            pipedrive: PipedriveConfig::default(),
            sanitize: SanitizeLimits::default(),
            sync: SyncConfig::default(),
            promotion: PromotionConfig::default(),
            replication: ReplicationConfig::default(),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    // Validate pipedrive
    reqwest::Url::parse(&config.pipedrive.base_url).with_context(|| {
        format!(
            "pipedrive.base_url is not a valid URL: '{}'",
            config.pipedrive.base_url
        )
    })?;
    if config.pipedrive.timeout_secs == 0 {
        anyhow::bail!("pipedrive.timeout_secs must be > 0");
    }

    // Validate sanitize
    let limits = &config.sanitize;
    for (name, value) in [
        ("name_max", limits.name_max),
        ("email_max", limits.email_max),
        ("phone_max", limits.phone_max),
        ("organization_max", limits.organization_max),
        ("note_max", limits.note_max),
        ("subject_max", limits.subject_max),
    ] {
        if value == 0 {
            anyhow::bail!("sanitize.{} must be > 0", name);
        }
    }

    // Validate sync
    if !(1..=500).contains(&config.sync.page_size) {
        anyhow::bail!("sync.page_size must be in [1, 500]");
    }
    if config.sync.active_filter_name.trim().is_empty() {
        anyhow::bail!("sync.active_filter_name must not be empty");
    }
    if config.sync.rate_window < 2 {
        anyhow::bail!("sync.rate_window must be >= 2");
    }

    // Validate promotion
    if !(0..=10).contains(&config.promotion.warm_threshold) {
        anyhow::bail!("promotion.warm_threshold must be in [0, 10]");
    }

    // Validate replication
    if config.replication.max_attempts < 1 {
        anyhow::bail!("replication.max_attempts must be >= 1");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml_str: &str) -> Result<Config> {
        let config: Config = toml::from_str(toml_str)?;
        validate(&config)?;
        Ok(config)
    }

    #[test]
    fn test_minimal_config_gets_defaults() {
        let config = parse("[db]\npath = \"./data/test.sqlite\"\n").unwrap();
        assert_eq!(config.server.bind, "127.0.0.1:7340");
        assert_eq!(config.pipedrive.max_retries, 3);
        assert_eq!(config.pipedrive.retry_base_delay_ms, 1000);
        assert!(config.pipedrive.rate_limit_handling);
        assert!(!config.pipedrive.detailed_logging);
        assert_eq!(config.sanitize.phone_max, 50);
        assert_eq!(config.sync.page_size, 100);
        assert_eq!(config.sync.active_filter_name, "Still Active");
        assert_eq!(config.promotion.warm_threshold, 4);
        assert_eq!(config.replication.max_attempts, 3);
    }

    #[test]
    fn test_page_size_out_of_range_rejected() {
        let err = parse("[db]\npath = \"x\"\n[sync]\npage_size = 0\n").unwrap_err();
        assert!(err.to_string().contains("sync.page_size"));
        assert!(parse("[db]\npath = \"x\"\n[sync]\npage_size = 501\n").is_err());
    }

    #[test]
    fn test_zero_sanitize_limit_rejected() {
        let err = parse("[db]\npath = \"x\"\n[sanitize]\nnote_max = 0\n").unwrap_err();
        assert!(err.to_string().contains("sanitize.note_max"));
    }

    #[test]
    fn test_threshold_and_attempts_validated() {
        assert!(parse("[db]\npath = \"x\"\n[promotion]\nwarm_threshold = 11\n").is_err());
        assert!(parse("[db]\npath = \"x\"\n[replication]\nmax_attempts = 0\n").is_err());
    }

    #[test]
    fn test_bad_base_url_rejected() {
        let err = parse("[db]\npath = \"x\"\n[pipedrive]\nbase_url = \"not a url\"\n").unwrap_err();
        assert!(err.to_string().contains("pipedrive.base_url"));
    }

    #[test]
    fn test_replication_policy_counts_first_attempt() {
        let config = parse("[db]\npath = \"x\"\n").unwrap();
        assert_eq!(config.replication.retry_policy().max_retries, 2);
    }

    #[test]
    fn test_example_config_parses() {
        let config = parse(include_str!("../config/pipesync.example.toml")).unwrap();
        assert_eq!(config.sync.rate_window, 20);
        assert!(config.pipedrive.api_token.is_none());
    }
}
