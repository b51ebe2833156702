//! Audit log configuration
//!
//! Loaded from the `[audit]` section of config.toml or `CHATBOT_STORAGE_AUDIT__*`
//! environment variables.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Audit log configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    /// Collection name (before the global prefix)
    #[serde(default = "default_collection")]
    pub collection: String,

    /// Signing secret; entries are stored unsigned when absent
    #[serde(default)]
    pub secret: Option<String>,

    /// Store attempts before giving up on a contended sequence number
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Retry delay grows by this many milliseconds per attempt
    #[serde(default = "default_retry_base_delay")]
    pub retry_base_delay_ms: u64,

    /// Upper bound of the random part of the retry delay, in milliseconds
    #[serde(default = "default_retry_jitter")]
    pub retry_jitter_ms: u64,

    /// Log storage errors and carry on instead of returning them
    ///
    /// Network failures and exhausted retries are always returned.
    #[serde(default = "default_true")]
    pub mute_errors: bool,

    /// Workspace used when none is given
    #[serde(default = "default_workspace")]
    pub default_workspace: String,

    /// Default number of entries per listing
    #[serde(default = "default_page_size")]
    pub page_size: usize,

    /// HS256 secret for verifying the bearer tokens carried by entries
    #[serde(default)]
    pub jwt_secret: Option<String>,
}

impl AuditConfig {
    /// Delay before retry number `attempt` (1-based), without the random part
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms.saturating_mul(u64::from(attempt)))
    }
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            collection: default_collection(),
            secret: None,
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay(),
            retry_jitter_ms: default_retry_jitter(),
            mute_errors: true,
            default_workspace: default_workspace(),
            page_size: default_page_size(),
            jwt_secret: None,
        }
    }
}

fn default_collection() -> String {
    "auditlog".to_string()
}

fn default_max_retries() -> u32 {
    4
}

fn default_retry_base_delay() -> u64 {
    50
}

fn default_retry_jitter() -> u64 {
    100
}

fn default_true() -> bool {
    true
}

fn default_workspace() -> String {
    "0".to_string()
}

fn default_page_size() -> usize {
    40
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AuditConfig::default();
        assert_eq!(config.collection, "auditlog");
        assert_eq!(config.max_retries, 4);
        assert!(config.mute_errors);
        assert_eq!(config.default_workspace, "0");
        assert_eq!(config.retry_delay(3), Duration::from_millis(150));
    }

    #[test]
    fn test_partial_deserialization() {
        let config: AuditConfig =
            serde_json::from_str(r#"{ "secret": "s", "mute_errors": false }"#).unwrap();
        assert_eq!(config.secret.as_deref(), Some("s"));
        assert!(!config.mute_errors);
        assert_eq!(config.page_size, 40);
        assert!(config.jwt_secret.is_none());
    }
}
