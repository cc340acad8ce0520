//! Leadflow configuration system.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{LeadflowError, Result};
use crate::retry::RetryPolicy;

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LeadflowConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub smtp: SmtpConfig,
    #[serde(default)]
    pub voice: VoiceConfig,
}

impl LeadflowConfig {
    /// Load config from `LEADFLOW_CONFIG` or the default path (~/.leadflow/config.toml).
    pub fn load() -> Result<Self> {
        let path = std::env::var("LEADFLOW_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| Self::default_path());
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default().with_env_overrides())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| LeadflowError::Config(format!("Failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| LeadflowError::Config(format!("Failed to parse config: {e}")))?;
        Ok(config.with_env_overrides())
    }

    /// Secrets from the environment win over the file.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(pw) = std::env::var("LEADFLOW_SMTP_PASSWORD") {
            self.smtp.password = pw;
        }
        if let Ok(key) = std::env::var("LEADFLOW_VOICE_API_KEY") {
            self.voice.api_key = key;
        }
        self
    }

    /// Save config to the default path.
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::default_path())
    }

    /// Save config to a path, creating parent directories.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| LeadflowError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the Leadflow home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".leadflow")
    }
}

/// Durable backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

fn default_db_path() -> String { "~/.leadflow/leadflow.db".into() }

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { path: default_db_path() }
    }
}

/// Gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_host")]
    pub host: String,
    /// Externally reachable base URL. Tracking pixels, click redirects and
    /// provider callbacks are built from it.
    #[serde(default = "default_public_url")]
    pub public_url: String,
}

fn default_port() -> u16 { 3000 }
fn default_host() -> String { "127.0.0.1".into() }
fn default_public_url() -> String { "http://localhost:3000".into() }

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
            public_url: default_public_url(),
        }
    }
}

/// Sequence scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// Decision-path label that ends the campaign regardless of target.
    #[serde(default = "default_terminal_label")]
    pub terminal_path_label: String,
    /// Advance the enrollment when the voice provider was unreachable and
    /// the call was only queued locally.
    #[serde(default = "bool_true")]
    pub advance_on_degraded_call: bool,
}

fn default_interval_secs() -> u64 { 60 }
fn default_terminal_label() -> String { "End Sequence".into() }
fn bool_true() -> bool { true }

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            terminal_path_label: default_terminal_label(),
            advance_on_degraded_call: true,
        }
    }
}

/// Retry configuration for backend I/O and SMTP.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_smtp_base_delay_ms")]
    pub smtp_base_delay_ms: u64,
}

fn default_max_attempts() -> u32 { 3 }
fn default_base_delay_ms() -> u64 { 1000 }
fn default_smtp_base_delay_ms() -> u64 { 250 }

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            smtp_base_delay_ms: default_smtp_base_delay_ms(),
        }
    }
}

impl RetryConfig {
    pub fn backend_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts, Duration::from_millis(self.base_delay_ms))
    }

    pub fn smtp_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts, Duration::from_millis(self.smtp_base_delay_ms))
    }
}

/// Volatile cache limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
}

fn default_ttl_secs() -> u64 { 24 * 3600 }
fn default_max_entries() -> usize { 10_000 }

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_ttl_secs(),
            max_entries: default_max_entries(),
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

/// SMTP relay configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpConfig {
    #[serde(default = "default_smtp_host")]
    pub host: String,
    #[serde(default = "default_smtp_port")]
    pub port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub from_email: String,
    #[serde(default)]
    pub from_name: Option<String>,
    #[serde(default = "bool_true")]
    pub starttls: bool,
}

fn default_smtp_host() -> String { "smtp.gmail.com".into() }
fn default_smtp_port() -> u16 { 587 }

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            host: default_smtp_host(),
            port: default_smtp_port(),
            username: String::new(),
            password: String::new(),
            from_email: String::new(),
            from_name: None,
            starttls: true,
        }
    }
}

/// Voice-call provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceConfig {
    #[serde(default = "default_voice_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub phone_number_id: String,
    #[serde(default = "default_voice_model_provider")]
    pub model_provider: String,
    #[serde(default = "default_voice_model")]
    pub model: String,
    #[serde(default = "default_voice_provider")]
    pub voice_provider: String,
    #[serde(default = "default_voice_id")]
    pub voice_id: String,
    /// Country code prepended to bare domestic numbers.
    #[serde(default = "default_country_code")]
    pub country_code: String,
}

fn default_voice_base_url() -> String { "https://api.vapi.ai".into() }
fn default_voice_model_provider() -> String { "openai".into() }
fn default_voice_model() -> String { "gpt-4o-mini".into() }
fn default_voice_provider() -> String { "playht".into() }
fn default_voice_id() -> String { "jennifer".into() }
fn default_country_code() -> String { "1".into() }

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            base_url: default_voice_base_url(),
            api_key: String::new(),
            phone_number_id: String::new(),
            model_provider: default_voice_model_provider(),
            model: default_voice_model(),
            voice_provider: default_voice_provider(),
            voice_id: default_voice_id(),
            country_code: default_country_code(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = LeadflowConfig::default();
        assert_eq!(config.gateway.port, 3000);
        assert_eq!(config.scheduler.interval_secs, 60);
        assert_eq!(config.scheduler.terminal_path_label, "End Sequence");
        assert!(config.scheduler.advance_on_degraded_call);
        assert_eq!(config.voice.country_code, "1");
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            [gateway]
            port = 8080
            public_url = "https://hooks.example.com"

            [scheduler]
            interval_secs = 15
            advance_on_degraded_call = false

            [retry]
            max_attempts = 5
        "#;

        let config: LeadflowConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.gateway.port, 8080);
        assert_eq!(config.gateway.public_url, "https://hooks.example.com");
        assert_eq!(config.scheduler.interval_secs, 15);
        assert!(!config.scheduler.advance_on_degraded_call);
        assert_eq!(config.retry.backend_policy().max_attempts, 5);
        assert_eq!(config.retry.smtp_policy().base_delay, Duration::from_millis(250));
    }

    #[test]
    fn test_config_missing_fields_use_defaults() {
        let config: LeadflowConfig = toml::from_str("").unwrap();
        assert_eq!(config.smtp.port, 587);
        assert_eq!(config.cache.max_entries, 10_000);
        assert_eq!(config.database.path, "~/.leadflow/leadflow.db");
    }

    #[test]
    fn test_save_and_reload() {
        let dir = std::env::temp_dir().join("leadflow-config-test");
        let path = dir.join("config.toml");
        let mut config = LeadflowConfig::default();
        config.gateway.port = 4100;
        config.save_to(&path).unwrap();

        let loaded = LeadflowConfig::load_from(&path).unwrap();
        assert_eq!(loaded.gateway.port, 4100);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_home_dir() {
        let home = LeadflowConfig::home_dir();
        assert!(home.to_string_lossy().contains("leadflow"));
    }
}
