//! Application configuration.
//!
//! Aggregates configuration into a single Config struct that can be loaded
//! from YAML files or environment variables.

mod messaging;

pub use messaging::{NsqConfig, TailConfig};

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "NSQ_BROKER_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "NSQ_BROKER";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "NSQ_BROKER_LOG";

use serde::Deserialize;

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load config: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
}

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// NSQ connection configuration.
    pub nsq: NsqConfig,
    /// `nsq-tail` settings.
    pub tail: TailConfig,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `config.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix, `__` separated
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(yaml)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::BROKER_MESSAGES_QUEUE_SIZE;
    use crate::nsq::ConnectStrategy;
    use serial_test::serial;
    use std::io::Write;
    use std::time::Duration;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.nsq.address, "127.0.0.1:4150");
        assert_eq!(config.nsq.connect, ConnectStrategy::Nsqd);
        assert_eq!(config.nsq.queue_size, BROKER_MESSAGES_QUEUE_SIZE);
        assert!(config.tail.subscribe.is_empty());
        assert!(!config.tail.list_topics);
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
nsq:
  address: lookupd:4161
  connect: lookupd
  queue_size: 100
  lookup_timeout_secs: 5

tail:
  list_topics: true
  subscribe:
    - orders#billing
    - inventory
"#;
        let config = Config::from_yaml(yaml).unwrap();
        assert_eq!(config.nsq.address, "lookupd:4161");
        assert_eq!(config.nsq.connect, ConnectStrategy::Lookupd);
        assert_eq!(config.nsq.queue_size, 100);
        assert_eq!(config.nsq.lookup_timeout_secs, Some(5));
        assert!(config.tail.list_topics);
        assert_eq!(config.tail.subscribe, vec!["orders#billing", "inventory"]);
    }

    #[test]
    fn test_parse_yaml_partial_uses_defaults() {
        let config = Config::from_yaml("nsq:\n  connect: lookupd\n").unwrap();
        assert_eq!(config.nsq.address, "127.0.0.1:4150");
        assert_eq!(config.nsq.connect, ConnectStrategy::Lookupd);
    }

    #[test]
    fn test_parse_yaml_unknown_strategy_fails() {
        assert!(Config::from_yaml("nsq:\n  connect: carrier-pigeon\n").is_err());
    }

    #[test]
    fn test_controller_config() {
        let mut nsq = NsqConfig::default();
        nsq.connect = ConnectStrategy::Lookupd;
        nsq.queue_size = 3;
        nsq.lookup_timeout_secs = Some(7);

        let controller = nsq.controller_config();
        assert_eq!(controller.connect, ConnectStrategy::Lookupd);
        assert_eq!(controller.queue_size, 3);
        assert_eq!(controller.lookup_timeout, Some(Duration::from_secs(7)));
        assert!(controller.logger.is_none());
    }

    #[test]
    #[serial]
    fn test_load_from_file_and_env() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "nsq:\n  address: nsqd-file:4150\n  queue_size: 4").unwrap();
        let path = file.path().to_str().unwrap().to_string();

        std::env::set_var("NSQ_BROKER__NSQ__ADDRESS", "nsqd-env:4150");
        let config = Config::load(Some(&path));
        std::env::remove_var("NSQ_BROKER__NSQ__ADDRESS");

        let config = config.unwrap();
        assert_eq!(config.nsq.address, "nsqd-env:4150");
        assert_eq!(config.nsq.queue_size, 4);
    }

    #[test]
    #[serial]
    fn test_load_missing_explicit_file_fails() {
        assert!(Config::load(Some("/nonexistent/nsq-broker.yaml")).is_err());
    }
}
