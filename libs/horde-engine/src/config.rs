use std::time::Duration;

use serde::{Deserialize, Serialize};

use horde_api::duration::millis;
use topic_engine::TopicConfig;

use crate::error::EngineError;

/// Root configuration, parsed from TOML.
///
/// ```toml
/// [topic]
/// mode = "broadcast"
/// buffer_size = 1000
///
/// [join]
/// cache_timeout_ms = 60000
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Topics carrying the values of the secondary branches.
    #[serde(default)]
    pub topic: TopicConfig,

    #[serde(default)]
    pub join: JoinConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinConfig {
    /// Lifetime of incomplete correlation entries. Zero disables expiry.
    #[serde(
        rename = "cache_timeout_ms",
        with = "millis",
        default = "default_cache_timeout"
    )]
    pub cache_timeout: Duration,
}

impl Default for JoinConfig {
    fn default() -> Self {
        Self {
            cache_timeout: default_cache_timeout(),
        }
    }
}

fn default_cache_timeout() -> Duration {
    Duration::from_secs(60)
}

impl EngineConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self, EngineError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| EngineError::Config(format!("{path}: {e}")))?;
        Self::parse(&content).map_err(|e| e.with_context(path))
    }

    /// Parse configuration from a TOML string.
    pub fn parse(toml_str: &str) -> Result<Self, EngineError> {
        toml::from_str(toml_str).map_err(|e| EngineError::Config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use topic_engine::TopicMode;

    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config = EngineConfig::parse("").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.join.cache_timeout, Duration::from_secs(60));
        assert_eq!(config.topic.mode, TopicMode::Broadcast);
    }

    #[test]
    fn parses_topic_and_join() {
        let config = EngineConfig::parse(
            r#"
            [topic]
            mode = "unicast"
            buffer_size = 8

            [join]
            cache_timeout_ms = 0
            "#,
        )
        .unwrap();

        assert_eq!(config.topic, TopicConfig::unicast().with_buffer_size(8));
        assert_eq!(config.join.cache_timeout, Duration::ZERO);
    }

    #[test]
    fn rejects_unknown_mode() {
        let err = EngineConfig::parse("[topic]\nmode = \"fanout\"").unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }

    #[test]
    fn missing_file_names_the_path() {
        let err = EngineConfig::load("/nonexistent/horde.toml").unwrap_err();
        assert!(matches!(&err, EngineError::Config(msg) if msg.starts_with("/nonexistent/horde.toml: ")));
    }
}
