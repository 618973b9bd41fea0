//! Broker transport abstraction.
//!
//! This module contains:
//! - `Transport` trait: a connection to the broker that hands out channels
//! - `BrokerChannel` trait: exchange/queue declaration, publish, consume
//! - `ChannelManager`: lazily established shared channel plus leased channels
//! - Implementations: AMQP (RabbitMQ), in-memory broker

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use serde::Deserialize;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info};

use crate::config::{MessagingConfig, TransportType};

#[cfg(feature = "amqp")]
pub mod amqp;
pub mod memory;

#[cfg(feature = "amqp")]
pub use amqp::AmqpTransport;
pub use memory::{MemoryBroker, MemoryTransport};

/// Content type stamped on every message body.
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Name of the broker's default exchange (routes by queue name).
pub const DEFAULT_EXCHANGE: &str = "";

// ============================================================================
// Errors
// ============================================================================

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;

/// Errors raised by the broker transport.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Channel failed: {0}")]
    Channel(String),

    #[error("Declare failed: {0}")]
    Declare(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Consume failed: {0}")]
    Consume(String),

    #[error("Acknowledge failed: {0}")]
    Ack(String),

    #[error("Channel closed")]
    Closed,
}

impl TransportError {
    /// Whether the channel or its connection is gone, so a fresh channel may
    /// succeed where this one failed.
    pub fn is_channel_loss(&self) -> bool {
        matches!(
            self,
            TransportError::Closed | TransportError::Channel(_) | TransportError::Connection(_)
        )
    }
}

// ============================================================================
// Broker vocabulary
// ============================================================================

/// Exchange routing flavour.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    /// Pattern routing on dot-separated words (`*` one word, `#` zero or more).
    #[default]
    Topic,
    /// Exact routing key match.
    Direct,
}

/// Queue declaration flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueOptions {
    /// Survives a broker restart.
    pub durable: bool,
    /// Owned by the declaring connection/channel, deleted when it goes away.
    pub exclusive: bool,
    /// Deleted once its last consumer is cancelled.
    pub auto_delete: bool,
}

impl QueueOptions {
    /// Private queue that disappears with its owner.
    pub fn exclusive() -> Self {
        Self {
            durable: false,
            exclusive: true,
            auto_delete: true,
        }
    }

    /// Named queue that survives broker restarts.
    pub fn durable() -> Self {
        Self {
            durable: true,
            exclusive: false,
            auto_delete: false,
        }
    }

    /// Named, shared, non-durable queue.
    pub fn transient() -> Self {
        Self::default()
    }
}

/// Consumer registration options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumeOptions {
    /// Tag identifying the consumer to the broker.
    pub consumer_tag: String,
    /// Broker considers a message delivered as soon as it is sent.
    pub auto_ack: bool,
}

impl ConsumeOptions {
    pub fn auto_ack(consumer_tag: impl Into<String>) -> Self {
        Self {
            consumer_tag: consumer_tag.into(),
            auto_ack: true,
        }
    }

    pub fn manual_ack(consumer_tag: impl Into<String>) -> Self {
        Self {
            consumer_tag: consumer_tag.into(),
            auto_ack: false,
        }
    }
}

/// Broker-native message metadata. Never part of the JSON body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    pub content_type: Option<String>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
}

impl MessageProperties {
    /// Properties for a JSON body.
    pub fn json() -> Self {
        Self {
            content_type: Some(JSON_CONTENT_TYPE.to_string()),
            ..Default::default()
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }
}

/// Settles a delivery with the broker.
pub trait Acker: Send + Sync {
    fn ack(&self) -> BoxFuture<'_, Result<()>>;
    fn reject(&self, requeue: bool) -> BoxFuture<'_, Result<()>>;
}

/// A message handed to a consumer.
pub struct Delivery {
    pub data: Vec<u8>,
    pub routing_key: String,
    pub properties: MessageProperties,
    /// `None` for auto-ack consumers.
    pub acker: Option<Box<dyn Acker>>,
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("routing_key", &self.routing_key)
            .field("properties", &self.properties)
            .field("bytes", &self.data.len())
            .field("manual_ack", &self.acker.is_some())
            .finish()
    }
}

impl Delivery {
    /// Delivery without an acker, as produced by auto-ack consumers.
    pub fn unacked(data: Vec<u8>, routing_key: impl Into<String>, properties: MessageProperties) -> Self {
        Self {
            data,
            routing_key: routing_key.into(),
            properties,
            acker: None,
        }
    }

    /// Acknowledge the delivery. No-op for auto-ack deliveries.
    pub async fn ack(&self) -> Result<()> {
        match &self.acker {
            Some(acker) => acker.ack().await,
            None => Ok(()),
        }
    }

    /// Reject the delivery, optionally putting it back on the queue.
    pub async fn reject(&self, requeue: bool) -> Result<()> {
        match &self.acker {
            Some(acker) => acker.reject(requeue).await,
            None => Ok(()),
        }
    }
}

/// Stream of deliveries for one consumer. Ends when the channel closes.
pub type DeliveryStream = BoxStream<'static, Result<Delivery>>;

/// Readiness of the broker connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection attempt has completed yet.
    Connecting,
    /// The last connection attempt succeeded.
    Ready,
    /// The last connection attempt failed; retries are in progress.
    Disconnected,
}

// ============================================================================
// Traits
// ============================================================================

/// One logical channel on a broker connection.
///
/// Implementations:
/// - `AmqpChannel`: a lapin channel
/// - `MemoryChannel`: a handle on a `MemoryBroker`
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Assert an exchange exists.
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind, durable: bool) -> Result<()>;

    /// Assert a queue exists. An empty name asks the broker to generate one.
    /// Returns the queue's actual name.
    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<String>;

    /// Bind a queue to an exchange under a routing key.
    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    /// Limit unacknowledged deliveries per consumer on this channel.
    async fn set_prefetch(&self, count: u16) -> Result<()>;

    /// Publish a message. `DEFAULT_EXCHANGE` routes directly to the queue named `routing_key`.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: MessageProperties,
    ) -> Result<()>;

    /// Start consuming a queue.
    async fn consume(&self, queue: &str, options: ConsumeOptions) -> Result<DeliveryStream>;

    /// Close the channel. Exclusive queues it owns and its consumers go with it.
    async fn close(&self) -> Result<()>;
}

/// Shared channel handle.
pub type ChannelPtr = Arc<dyn BrokerChannel>;

/// A broker connection.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a new channel, establishing the connection first if needed.
    async fn open_channel(&self) -> Result<ChannelPtr>;

    /// Readiness signal for the underlying connection.
    fn state(&self) -> watch::Receiver<ConnectionState>;
}

/// Shared transport handle.
pub type TransportPtr = Arc<dyn Transport>;

// ============================================================================
// Channel manager
// ============================================================================

/// Hands out broker channels.
///
/// `get_channel` returns the process-wide publishing channel, opened on first
/// use. `lease` opens a channel that belongs to the caller alone, so closing
/// it cannot disturb anybody else.
#[derive(Clone)]
pub struct ChannelManager {
    transport: TransportPtr,
    shared: Arc<Mutex<Option<ChannelPtr>>>,
}

impl ChannelManager {
    pub fn new(transport: TransportPtr) -> Self {
        Self {
            transport,
            shared: Arc::new(Mutex::new(None)),
        }
    }

    /// Get the shared channel, establishing it if necessary.
    ///
    /// The lock is held across the open so concurrent callers wait for a
    /// single establish instead of racing their own.
    pub async fn get_channel(&self) -> Result<ChannelPtr> {
        let mut slot = self.shared.lock().await;
        if let Some(channel) = slot.as_ref() {
            return Ok(Arc::clone(channel));
        }

        let channel = self.transport.open_channel().await?;
        debug!("Shared channel established");
        *slot = Some(Arc::clone(&channel));
        Ok(channel)
    }

    /// Forget the shared channel after it was seen failing.
    pub async fn invalidate(&self) {
        if self.shared.lock().await.take().is_some() {
            info!("Shared channel invalidated, will re-establish on next use");
        }
    }

    /// Close and forget the shared channel.
    pub async fn close(&self) {
        if let Some(channel) = self.shared.lock().await.take() {
            if let Err(e) = channel.close().await {
                debug!(error = %e, "Failed to close shared channel");
            }
        }
    }

    /// Open a channel owned by the caller.
    pub async fn lease(&self) -> Result<ChannelPtr> {
        self.transport.open_channel().await
    }

    /// Readiness of the underlying connection.
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.transport.state()
    }

    pub fn transport(&self) -> &TransportPtr {
        &self.transport
    }
}

// ============================================================================
// Factory
// ============================================================================

/// Initialize the transport selected by configuration.
///
/// Requires the corresponding feature for broker-backed transports:
/// - AMQP: `--features amqp` (included in default)
pub fn init_transport(config: &MessagingConfig) -> Result<TransportPtr> {
    match config.transport_type {
        TransportType::Amqp => {
            #[cfg(feature = "amqp")]
            {
                let transport = AmqpTransport::new(config.amqp.clone(), config.reconnect.clone())?;
                info!(transport = "amqp", url = %config.amqp.url, "Transport initialized");
                Ok(Arc::new(transport))
            }

            #[cfg(not(feature = "amqp"))]
            {
                Err(TransportError::Connection(
                    "AMQP support requires the 'amqp' feature. Rebuild with --features amqp"
                        .to_string(),
                ))
            }
        }
        TransportType::Memory => {
            info!(transport = "memory", "Transport initialized");
            Ok(Arc::new(MemoryTransport::new(MemoryBroker::new())))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_loss_classification() {
        assert!(TransportError::Closed.is_channel_loss());
        assert!(TransportError::Channel("reset".into()).is_channel_loss());
        assert!(TransportError::Connection("refused".into()).is_channel_loss());
        assert!(!TransportError::Publish("no exchange 'x'".into()).is_channel_loss());
        assert!(!TransportError::Declare("kind mismatch".into()).is_channel_loss());
    }

    #[test]
    fn test_queue_options_presets() {
        let exclusive = QueueOptions::exclusive();
        assert!(exclusive.exclusive && exclusive.auto_delete && !exclusive.durable);

        let durable = QueueOptions::durable();
        assert!(durable.durable && !durable.exclusive);

        assert_eq!(QueueOptions::transient(), QueueOptions::default());
    }

    #[test]
    fn test_message_properties_builder() {
        let props = MessageProperties::json()
            .with_correlation_id("abc")
            .with_reply_to("amq.gen-1");
        assert_eq!(props.content_type.as_deref(), Some(JSON_CONTENT_TYPE));
        assert_eq!(props.correlation_id.as_deref(), Some("abc"));
        assert_eq!(props.reply_to.as_deref(), Some("amq.gen-1"));
    }

    #[tokio::test]
    async fn test_unacked_delivery_settles_without_acker() {
        let delivery = Delivery::unacked(b"{}".to_vec(), "q", MessageProperties::default());
        assert!(delivery.ack().await.is_ok());
        assert!(delivery.reject(true).await.is_ok());
    }

    #[tokio::test]
    async fn test_channel_manager_reuses_shared_channel() {
        let broker = MemoryBroker::new();
        let transport: TransportPtr = Arc::new(MemoryTransport::new(broker.clone()));
        let manager = ChannelManager::new(transport);

        let first = manager.get_channel().await.unwrap();
        let second = manager.get_channel().await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        let leased = manager.lease().await.unwrap();
        assert!(!Arc::ptr_eq(&first, &leased));
        assert_eq!(broker.open_channels(), 2);
    }

    #[tokio::test]
    async fn test_channel_manager_concurrent_get_establishes_once() {
        let broker = MemoryBroker::new();
        let manager = ChannelManager::new(Arc::new(MemoryTransport::new(broker.clone())));

        let (a, b, c) = tokio::join!(
            manager.get_channel(),
            manager.get_channel(),
            manager.get_channel()
        );
        let a = a.unwrap();
        assert!(Arc::ptr_eq(&a, &b.unwrap()));
        assert!(Arc::ptr_eq(&a, &c.unwrap()));
        assert_eq!(broker.open_channels(), 1);
    }

    #[tokio::test]
    async fn test_channel_manager_invalidate_reopens() {
        let broker = MemoryBroker::new();
        let manager = ChannelManager::new(Arc::new(MemoryTransport::new(broker.clone())));

        let first = manager.get_channel().await.unwrap();
        manager.invalidate().await;
        let second = manager.get_channel().await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn test_channel_manager_close_releases_shared_channel() {
        let broker = MemoryBroker::new();
        let manager = ChannelManager::new(Arc::new(MemoryTransport::new(broker.clone())));

        let channel = manager.get_channel().await.unwrap();
        manager.close().await;
        assert_eq!(broker.open_channels(), 0);
        assert!(channel.declare_queue("q", QueueOptions::transient()).await.is_err());
    }

    #[test]
    fn test_init_memory_transport() {
        let config = MessagingConfig {
            transport_type: TransportType::Memory,
            ..Default::default()
        };
        let transport = init_transport(&config).unwrap();
        assert_eq!(*transport.state().borrow(), ConnectionState::Ready);
    }
}
