//! Configuration management using Figment
//!
//! Configuration is loaded from multiple sources with the following precedence (highest to lowest):
//! 1. Environment variables (prefix: `CHATBOT_STORAGE_`, nested keys separated by `__`)
//! 2. Current working directory: ./config.toml
//! 3. XDG config directory: ~/.config/chatbot-storage/config.toml
//! 4. System directory: /etc/chatbot-storage/config.toml
//! 5. Default values
//!
//! ```toml
//! dialect = "restricted"
//!
//! [health]
//! max_failures = 20
//! interval_secs = 600
//!
//! [audit]
//! secret = "change-me"
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::audit::AuditConfig;
use crate::error::Result;
use crate::provision::Dialect;

const ENV_PREFIX: &str = "CHATBOT_STORAGE_";
const APP_DIR: &str = "chatbot-storage";

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Log level filter used by [`crate::observability::init_tracing`]
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Query dialect of the backing database
    #[serde(default)]
    pub dialect: Dialect,

    /// Prefix prepended to every collection name
    #[serde(default)]
    pub collection_prefix: String,

    /// Network failure tally and termination policy
    #[serde(default)]
    pub health: HealthConfig,

    /// Conversation state storage
    #[serde(default)]
    pub state: StateConfig,

    /// Audit log chain
    #[serde(default)]
    pub audit: AuditConfig,

    /// Notification queue, campaigns and subscriptions
    #[serde(default)]
    pub notifications: NotificationsConfig,

    /// Database connection (optional, used by the SurrealDB engine)
    #[serde(default)]
    pub database: Option<DatabaseConfig>,
}

/// Sliding-window network failure policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Failures tolerated within the window before the threshold action runs.
    /// `None` keeps counting but never triggers the action.
    #[serde(default)]
    pub max_failures: Option<u32>,

    /// Length of the sliding window in seconds
    #[serde(default = "default_health_interval")]
    pub interval_secs: u64,

    /// Delay between crossing the threshold and terminating, to flush logs
    #[serde(default = "default_grace_period")]
    pub grace_period_secs: u64,
}

/// Conversation state storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateConfig {
    /// Collection name (before the global prefix)
    #[serde(default = "default_state_collection")]
    pub collection: String,

    /// Default staleness threshold for locks, in milliseconds
    #[serde(default = "default_lock_timeout")]
    pub lock_timeout_ms: i64,

    /// Log detected uniqueness races at error level instead of warn
    #[serde(default)]
    pub log_collisions_as_errors: bool,

    /// Default page size for state listings
    #[serde(default = "default_state_page_size")]
    pub page_size: usize,
}

/// Notification storage configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotificationsConfig {
    /// Prefix of the tasks, campaigns and subscriptions collections
    #[serde(default)]
    pub collection_prefix: String,
}

/// Database connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Connection URL (`ws://`, `http://` or `mem://`)
    pub url: String,

    /// Namespace
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Database name
    #[serde(default = "default_database")]
    pub database: String,

    /// Root username (optional)
    #[serde(default)]
    pub username: Option<String>,

    /// Root password (optional)
    #[serde(default)]
    pub password: Option<String>,

    /// Maximum connection retries
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base delay between retries in seconds
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_health_interval() -> u64 {
    600
}

fn default_grace_period() -> u64 {
    5
}

fn default_state_collection() -> String {
    "states".to_string()
}

fn default_lock_timeout() -> i64 {
    300
}

fn default_state_page_size() -> usize {
    20
}

fn default_namespace() -> String {
    "chatbot".to_string()
}

fn default_database() -> String {
    "storage".to_string()
}

fn default_max_retries() -> u32 {
    5
}

fn default_retry_delay() -> u64 {
    2
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            max_failures: None,
            interval_secs: default_health_interval(),
            grace_period_secs: default_grace_period(),
        }
    }
}

impl HealthConfig {
    /// Sliding window length
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Grace period before termination
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            collection: default_state_collection(),
            lock_timeout_ms: default_lock_timeout(),
            log_collisions_as_errors: false,
            page_size: default_state_page_size(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            dialect: Dialect::default(),
            collection_prefix: String::new(),
            health: HealthConfig::default(),
            state: StateConfig::default(),
            audit: AuditConfig::default(),
            notifications: NotificationsConfig::default(),
            database: None,
        }
    }
}

impl Config {
    /// Load configuration from all sources
    ///
    /// Searches for config files in this order (first found wins):
    /// 1. Current working directory: ./config.toml
    /// 2. XDG config directory: ~/.config/chatbot-storage/config.toml
    /// 3. System directory: /etc/chatbot-storage/config.toml
    ///
    /// Environment variables (`CHATBOT_STORAGE_` prefix) override all file-based configs.
    pub fn load() -> Result<Self> {
        let config_paths = Self::find_config_paths();

        tracing::debug!("Searching for config files in order:");
        for path in &config_paths {
            tracing::debug!("  - {}", path.display());
        }

        let mut figment = Figment::new().merge(Serialized::defaults(Config::default()));

        // Lowest priority first so that higher priority files override
        for path in config_paths.iter().rev() {
            if path.exists() {
                tracing::info!("Loading configuration from: {}", path.display());
                figment = figment.merge(Toml::file(path));
            }
        }

        let config = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        Ok(config)
    }

    /// Load configuration from a specific file
    ///
    /// Bypasses the XDG and system directories. Environment variables still
    /// take precedence over the file.
    pub fn load_from(path: &str) -> Result<Self> {
        let config = Self::figment_from(path).extract()?;
        Ok(config)
    }

    /// Provider chain used by [`Config::load_from`], exposed for custom extraction
    pub fn figment_from(path: &str) -> Figment {
        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Full collection name with the global prefix applied
    pub fn collection_name(&self, base: &str) -> String {
        format!("{}{}", self.collection_prefix, base)
    }

    /// Prefix for the notification collections, global prefix included
    pub fn notifications_prefix(&self) -> String {
        format!(
            "{}{}",
            self.collection_prefix, self.notifications.collection_prefix
        )
    }

    fn find_config_paths() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from("config.toml")];

        let xdg_dirs = xdg::BaseDirectories::with_prefix(APP_DIR);
        if let Some(path) = xdg_dirs.find_config_file("config.toml") {
            paths.push(path);
        }

        paths.push(PathBuf::from("/etc").join(APP_DIR).join("config.toml"));
        paths
    }
}
