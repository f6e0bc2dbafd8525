//! Configuration file support

use coach_chat::{CacheConfig, QueueConfig, RetryConfig};
use coach_stream::ConnectionConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration for coach
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Streaming chat endpoint
    pub endpoint: Option<String>,
    /// Models to send to when none are given on the command line
    pub models: Vec<String>,
    /// User id conversations are created for
    pub user_id: Option<String>,
    pub connection: ConnectionSection,
    pub queue: QueueSection,
    pub cache: CacheSection,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSection {
    /// Seconds without data before a stream times out (0 disables)
    pub idle_timeout_secs: Option<u64>,
    /// Extra headers sent with every request
    pub headers: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSection {
    pub max_size: Option<usize>,
    pub max_retries: Option<u32>,
    pub inter_action_delay_ms: Option<u64>,
    pub initial_delay_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
    pub backoff_multiplier: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSection {
    pub max_entries: Option<usize>,
    pub ttl_secs: Option<u64>,
}

impl Config {
    /// Get the config directory
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("coach")
    }

    /// Get the config file path
    pub fn config_path() -> PathBuf {
        if let Ok(path) = std::env::var("COACH_CONFIG_PATH") {
            return PathBuf::from(path);
        }
        Self::config_dir().join("config.toml")
    }

    /// Load config from a file. A missing or invalid file yields defaults.
    pub fn load_from(path: &Path) -> Self {
        if !path.exists() {
            return Self::default();
        }

        match fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => config,
                Err(e) => {
                    tracing::warn!("Failed to parse config file {}: {}", path.display(), e);
                    Self::default()
                }
            },
            Err(e) => {
                tracing::warn!("Failed to read config file {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    pub fn save_to(&self, path: &Path) -> std::io::Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let content = toml::to_string_pretty(self).map_err(std::io::Error::other)?;
        fs::write(path, content)
    }

    /// Create a default config file if it doesn't exist
    pub fn init(path: &Path) -> std::io::Result<()> {
        if path.exists() {
            return Ok(());
        }
        let default_config = Config {
            endpoint: Some("http://localhost:3000/api/chat".to_string()),
            models: vec!["gpt-4o-mini".to_string()],
            user_id: Some("local".to_string()),
            ..Config::default()
        };
        default_config.save_to(path)
    }

    pub fn connection_config(&self) -> ConnectionConfig {
        let defaults = ConnectionConfig::default();
        ConnectionConfig {
            idle_timeout: match self.connection.idle_timeout_secs {
                Some(0) => None,
                Some(secs) => Some(Duration::from_secs(secs)),
                None => defaults.idle_timeout,
            },
            headers: self.connection.headers.clone(),
        }
    }

    pub fn queue_config(&self) -> QueueConfig {
        let defaults = QueueConfig::default();
        let retry = RetryConfig::default();
        let q = &self.queue;
        QueueConfig {
            max_size: q.max_size.unwrap_or(defaults.max_size),
            max_retries: q.max_retries.unwrap_or(defaults.max_retries),
            inter_action_delay: q
                .inter_action_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.inter_action_delay),
            retry: RetryConfig {
                initial_delay: q
                    .initial_delay_ms
                    .map(Duration::from_millis)
                    .unwrap_or(retry.initial_delay),
                max_delay: q
                    .max_delay_ms
                    .map(Duration::from_millis)
                    .unwrap_or(retry.max_delay),
                backoff_multiplier: q.backoff_multiplier.unwrap_or(retry.backoff_multiplier),
            },
            storage_key: defaults.storage_key,
        }
    }

    pub fn cache_config(&self) -> CacheConfig {
        let defaults = CacheConfig::default();
        CacheConfig {
            max_entries: self.cache.max_entries.unwrap_or(defaults.max_entries),
            ttl: self
                .cache
                .ttl_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.ttl),
        }
    }
}

/// Generate example config content
pub fn example_config() -> &'static str {
    r#"# coach configuration file
# Place at ~/.config/coach/config.toml (Linux) or set COACH_CONFIG_PATH

endpoint = "http://localhost:3000/api/chat"
models = ["gpt-4o-mini", "claude-3-5-haiku"]
user_id = "local"

[connection]
# idle_timeout_secs = 60
# [connection.headers]
# authorization = "Bearer ..."

[queue]
# max_size = 100
# max_retries = 3
# inter_action_delay_ms = 100
# initial_delay_ms = 1000
# max_delay_ms = 30000
# backoff_multiplier = 2.0

[cache]
# max_entries = 20
# ttl_secs = 300
"#
}
