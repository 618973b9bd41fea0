//! Messaging and broker configuration types.

use std::time::Duration;

use serde::Deserialize;

use crate::transport::ExchangeKind;

/// Exchange shared by every service for broadcast messages.
pub const DEFAULT_EXCHANGE_NAME: &str = "recipe.events";
/// Default wait for an RPC reply.
pub const DEFAULT_RPC_TIMEOUT_MS: u64 = 2000;

/// Transport type discriminator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportType {
    /// AMQP/RabbitMQ broker.
    #[default]
    Amqp,
    /// In-process broker (single process, tests).
    Memory,
}

/// How an RPC caller receives replies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyMode {
    /// A fresh exclusive reply queue on a leased channel for every call.
    #[default]
    PerCall,
    /// One reply queue per caller, replies demultiplexed by correlation ID.
    Shared,
}

/// Messaging configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MessagingConfig {
    /// Transport type discriminator.
    #[serde(rename = "type")]
    pub transport_type: TransportType,
    /// This service's identity: envelope `source` and fan-out routing key.
    pub service: String,
    /// Shared broadcast exchange.
    pub exchange: String,
    /// Routing flavour of the shared exchange.
    pub exchange_kind: ExchangeKind,
    /// RPC settings.
    pub rpc: RpcConfig,
    /// AMQP-specific configuration.
    pub amqp: AmqpConfig,
    /// Reconnect/backoff settings.
    pub reconnect: ReconnectConfig,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            transport_type: TransportType::Amqp,
            service: "service".to_string(),
            exchange: DEFAULT_EXCHANGE_NAME.to_string(),
            exchange_kind: ExchangeKind::Topic,
            rpc: RpcConfig::default(),
            amqp: AmqpConfig::default(),
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl MessagingConfig {
    /// Default config for a named service.
    pub fn for_service(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            ..Default::default()
        }
    }

    /// In-memory config for a named service.
    pub fn memory(service: impl Into<String>) -> Self {
        Self {
            transport_type: TransportType::Memory,
            ..Self::for_service(service)
        }
    }

    /// Name of this service's RPC inbox: configured, else `<service>-rpc`.
    pub fn rpc_queue(&self) -> String {
        self.rpc
            .queue
            .clone()
            .unwrap_or_else(|| rpc_queue_for(&self.service))
    }

    /// Default wait for an RPC reply.
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc.timeout_ms)
    }
}

/// Conventional RPC inbox name for a service.
pub fn rpc_queue_for(service: &str) -> String {
    format!("{}-rpc", service)
}

/// RPC configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    /// Inbox queue name override.
    pub queue: Option<String>,
    /// Declare the inbox durable.
    pub durable: bool,
    /// Unacknowledged requests the responder accepts at once.
    pub prefetch: u16,
    /// Default wait for a reply, in milliseconds.
    pub timeout_ms: u64,
    /// How the caller receives replies.
    pub reply_mode: ReplyMode,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            queue: None,
            durable: false,
            prefetch: 1,
            timeout_ms: DEFAULT_RPC_TIMEOUT_MS,
            reply_mode: ReplyMode::PerCall,
        }
    }
}

/// AMQP-specific configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AmqpConfig {
    /// AMQP connection URL.
    pub url: String,
    /// Connections kept by the pool. One per process unless raised.
    pub pool_size: usize,
}

impl Default for AmqpConfig {
    fn default() -> Self {
        Self {
            url: "amqp://localhost:5672".to_string(),
            pool_size: 1,
        }
    }
}

/// Backoff settings for connecting and for re-establishing consumers.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// First retry delay.
    pub min_delay_ms: u64,
    /// Ceiling for retry delays.
    pub max_delay_ms: u64,
    /// Connection attempts before an operation gives up.
    pub max_attempts: usize,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            min_delay_ms: 100,
            max_delay_ms: 30_000,
            max_attempts: 10,
        }
    }
}

impl ReconnectConfig {
    pub fn min_delay(&self) -> Duration {
        Duration::from_millis(self.min_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}
