//! Application configuration.
//!
//! Loaded from YAML files and environment variables into a single `Config`.

mod messaging;

pub use messaging::{
    rpc_queue_for, AmqpConfig, MessagingConfig, ReconnectConfig, ReplyMode, RpcConfig,
    TransportType, DEFAULT_EXCHANGE_NAME, DEFAULT_RPC_TIMEOUT_MS,
};

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "RECIPE_BUS_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "RECIPE_BUS";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "RECIPE_BUS_LOG";

/// Environment variable for this service's identity.
pub const SERVICE_NAME_ENV_VAR: &str = "SERVICE_NAME";
/// Environment variable for this service's RPC inbox.
pub const RPC_QUEUE_ENV_VAR: &str = "RPC_QUEUE";
/// Environment variable for the shared broadcast exchange.
pub const EXCHANGE_NAME_ENV_VAR: &str = "EXCHANGE_NAME";
/// Environment variable for the broker URL.
pub const AMQP_URL_ENV_VAR: &str = "AMQP_URL";

use serde::Deserialize;

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Messaging configuration.
    pub messaging: MessagingConfig,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `config.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix
    /// 5. Plain `SERVICE_NAME`, `RPC_QUEUE`, `EXCHANGE_NAME`, `AMQP_URL`
    pub fn load(path: Option<&str>) -> Result<Self, ::config::ConfigError> {
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
                    .separator("__")
                    .try_parsing(true),
            )
            .set_override_option("messaging.service", std::env::var(SERVICE_NAME_ENV_VAR).ok())?
            .set_override_option("messaging.rpc.queue", std::env::var(RPC_QUEUE_ENV_VAR).ok())?
            .set_override_option("messaging.exchange", std::env::var(EXCHANGE_NAME_ENV_VAR).ok())?
            .set_override_option("messaging.amqp.url", std::env::var(AMQP_URL_ENV_VAR).ok())?
            .build()?;

        config.try_deserialize()
    }

    /// Create config for testing.
    pub fn for_test() -> Self {
        Self {
            messaging: MessagingConfig::memory("test"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    fn clear_env() {
        for var in [
            CONFIG_ENV_VAR,
            SERVICE_NAME_ENV_VAR,
            RPC_QUEUE_ENV_VAR,
            EXCHANGE_NAME_ENV_VAR,
            AMQP_URL_ENV_VAR,
            "RECIPE_BUS__MESSAGING__RPC__TIMEOUT_MS",
        ] {
            std::env::remove_var(var);
        }
    }

    fn write_yaml(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new()
            .suffix(".yaml")
            .tempfile()
            .unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.messaging.transport_type, TransportType::Amqp);
        assert_eq!(config.messaging.rpc_queue(), "service-rpc");
    }

    #[test]
    fn test_config_for_test() {
        let config = Config::for_test();
        assert_eq!(config.messaging.transport_type, TransportType::Memory);
    }

    #[test]
    #[serial]
    fn test_load_from_file() {
        clear_env();
        let file = write_yaml(
            r#"
messaging:
  type: memory
  service: notification
  exchange: food.events
  exchange_kind: direct
  rpc:
    timeout_ms: 500
    reply_mode: shared
"#,
        );

        let config = Config::load(file.path().to_str()).unwrap();
        let messaging = config.messaging;
        assert_eq!(messaging.transport_type, TransportType::Memory);
        assert_eq!(messaging.service, "notification");
        assert_eq!(messaging.exchange, "food.events");
        assert_eq!(messaging.exchange_kind, crate::transport::ExchangeKind::Direct);
        assert_eq!(messaging.rpc.timeout_ms, 500);
        assert_eq!(messaging.rpc.reply_mode, ReplyMode::Shared);
        assert_eq!(messaging.rpc.prefetch, 1);
        assert_eq!(messaging.rpc_queue(), "notification-rpc");
    }

    #[test]
    #[serial]
    fn test_plain_env_vars_override_file() {
        clear_env();
        let file = write_yaml(
            r#"
messaging:
  service: post
"#,
        );

        std::env::set_var(SERVICE_NAME_ENV_VAR, "auth");
        std::env::set_var(RPC_QUEUE_ENV_VAR, "auth-inbox");
        std::env::set_var(AMQP_URL_ENV_VAR, "amqp://rabbit:5672");
        let config = Config::load(file.path().to_str());
        clear_env();

        let messaging = config.unwrap().messaging;
        assert_eq!(messaging.service, "auth");
        assert_eq!(messaging.rpc_queue(), "auth-inbox");
        assert_eq!(messaging.amqp.url, "amqp://rabbit:5672");
        assert_eq!(messaging.exchange, DEFAULT_EXCHANGE_NAME);
    }

    #[test]
    #[serial]
    fn test_prefixed_env_vars() {
        clear_env();
        std::env::set_var("RECIPE_BUS__MESSAGING__RPC__TIMEOUT_MS", "250");
        let config = Config::load(None);
        clear_env();

        assert_eq!(config.unwrap().messaging.rpc.timeout_ms, 250);
    }

    #[test]
    #[serial]
    fn test_missing_explicit_file_is_an_error() {
        clear_env();
        assert!(Config::load(Some("/definitely/not/here.yaml")).is_err());
    }
}
