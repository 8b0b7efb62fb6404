//! Replication configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Settings for the replication layer of one node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    /// Directory holding the replicated database files.
    pub dir: PathBuf,
    /// Maximum time to wait for a submitted command to commit.
    pub apply_timeout_ms: u64,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("data"),
            apply_timeout_ms: 10_000,
        }
    }
}

impl ReplicationConfig {
    pub fn apply_timeout(&self) -> Duration {
        Duration::from_millis(self.apply_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ReplicationConfig::default();
        assert_eq!(config.apply_timeout(), Duration::from_secs(10));
        assert_eq!(config.dir, PathBuf::from("data"));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: ReplicationConfig =
            serde_json::from_str(r#"{"apply_timeout_ms": 250}"#).unwrap();
        assert_eq!(config.apply_timeout(), Duration::from_millis(250));
        assert_eq!(config.dir, PathBuf::from("data"));
    }
}
