//! AMQP (RabbitMQ) transport.
//!
//! Connections come from a `deadpool-lapin` pool created lazily on first use.
//! Broken connections are recycled by the pool, so reconnecting is a matter of
//! asking for a channel again.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backon::BackoffBuilder;
use deadpool_lapin::{Manager, Pool, PoolError};
use futures::future::BoxFuture;
use futures::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
        BasicRejectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    types::FieldTable,
    BasicProperties, Channel,
};
use tokio::sync::{watch, OnceCell};
use tracing::{debug, error, info, warn};

use super::{
    Acker, BrokerChannel, ChannelPtr, ConnectionState, ConsumeOptions, Delivery, DeliveryStream,
    ExchangeKind, MessageProperties, QueueOptions, Result, Transport, TransportError,
};
use crate::config::{AmqpConfig, ReconnectConfig};
use crate::utils::retry::connection_backoff;

/// Transport backed by a RabbitMQ connection pool.
pub struct AmqpTransport {
    config: AmqpConfig,
    reconnect: ReconnectConfig,
    pool: OnceCell<Pool>,
    readiness: watch::Sender<ConnectionState>,
}

impl AmqpTransport {
    /// Create the transport. No connection is made until a channel is requested.
    pub fn new(config: AmqpConfig, reconnect: ReconnectConfig) -> Result<Self> {
        if config.pool_size == 0 {
            return Err(TransportError::Connection(
                "amqp.pool_size must be at least 1".to_string(),
            ));
        }
        let (readiness, _) = watch::channel(ConnectionState::Connecting);
        Ok(Self {
            config,
            reconnect,
            pool: OnceCell::new(),
            readiness,
        })
    }

    async fn pool(&self) -> Result<&Pool> {
        self.pool
            .get_or_try_init(|| async {
                let manager = Manager::new(self.config.url.clone(), Default::default());
                Pool::builder(manager)
                    .max_size(self.config.pool_size)
                    .build()
                    .map_err(|e| TransportError::Connection(format!("Failed to create pool: {}", e)))
            })
            .await
    }

    async fn try_open(&self) -> Result<Channel> {
        let conn = self.pool().await?.get().await.map_err(|e: PoolError| {
            TransportError::Connection(format!("Failed to get connection from pool: {}", e))
        })?;

        conn.create_channel()
            .await
            .map_err(|e| TransportError::Channel(format!("Failed to create channel: {}", e)))
    }
}

#[async_trait]
impl Transport for AmqpTransport {
    /// Open a channel, retrying the connection with exponential backoff.
    async fn open_channel(&self) -> Result<ChannelPtr> {
        let backoff = connection_backoff(&self.reconnect).build();
        let mut last_error = None;

        for (attempt, delay) in std::iter::once(Duration::ZERO).chain(backoff).enumerate() {
            if attempt > 0 {
                tokio::time::sleep(delay).await;
            }

            match self.try_open().await {
                Ok(channel) => {
                    let previous = self.readiness.send_replace(ConnectionState::Ready);
                    if previous != ConnectionState::Ready {
                        info!(url = %self.config.url, "Connected to AMQP");
                    }
                    return Ok(Arc::new(AmqpChannel { channel }));
                }
                Err(e) => {
                    self.readiness.send_replace(ConnectionState::Disconnected);
                    warn!(
                        attempt = attempt + 1,
                        max_attempts = self.reconnect.max_attempts + 1,
                        error = %e,
                        "Failed to open AMQP channel, retrying..."
                    );
                    last_error = Some(e);
                }
            }
        }

        let error = last_error
            .unwrap_or_else(|| TransportError::Connection("Max retries exceeded".to_string()));
        error!(url = %self.config.url, error = %error, "Giving up on AMQP connection");
        Err(error)
    }

    fn state(&self) -> watch::Receiver<ConnectionState> {
        self.readiness.subscribe()
    }
}

fn exchange_kind(kind: ExchangeKind) -> lapin::ExchangeKind {
    match kind {
        ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        ExchangeKind::Direct => lapin::ExchangeKind::Direct,
    }
}

fn to_basic_properties(properties: MessageProperties) -> BasicProperties {
    let mut basic = BasicProperties::default();
    if let Some(content_type) = properties.content_type {
        basic = basic.with_content_type(content_type.into());
    }
    if let Some(correlation_id) = properties.correlation_id {
        basic = basic.with_correlation_id(correlation_id.into());
    }
    if let Some(reply_to) = properties.reply_to {
        basic = basic.with_reply_to(reply_to.into());
    }
    basic
}

fn from_basic_properties(basic: &BasicProperties) -> MessageProperties {
    MessageProperties {
        content_type: basic.content_type().as_ref().map(|s| s.as_str().to_string()),
        correlation_id: basic.correlation_id().as_ref().map(|s| s.as_str().to_string()),
        reply_to: basic.reply_to().as_ref().map(|s| s.as_str().to_string()),
    }
}

/// Classify a publish failure. A dead channel or connection is reported as
/// such so callers can retry on a fresh channel.
fn publish_error(context: &str, e: lapin::Error) -> TransportError {
    match e {
        lapin::Error::InvalidChannelState(_) | lapin::Error::InvalidChannel(_) => {
            TransportError::Closed
        }
        lapin::Error::InvalidConnectionState(_)
        | lapin::Error::IOError(_)
        | lapin::Error::MissingHeartbeatError => {
            TransportError::Connection(format!("{}: {}", context, e))
        }
        e => TransportError::Publish(format!("{}: {}", context, e)),
    }
}

/// A lapin channel.
pub struct AmqpChannel {
    channel: Channel,
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind, durable: bool) -> Result<()> {
        self.channel
            .exchange_declare(
                name,
                exchange_kind(kind),
                ExchangeDeclareOptions {
                    durable,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| TransportError::Declare(format!("Failed to declare exchange: {}", e)))
    }

    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<String> {
        let queue = self
            .channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: options.durable,
                    exclusive: options.exclusive,
                    auto_delete: options.auto_delete,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| TransportError::Declare(format!("Failed to declare queue: {}", e)))?;
        Ok(queue.name().as_str().to_string())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| TransportError::Declare(format!("Failed to bind queue: {}", e)))?;

        info!(queue = %queue, exchange = %exchange, routing_key = %routing_key, "Bound queue to exchange");
        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> Result<()> {
        self.channel
            .basic_qos(count, BasicQosOptions::default())
            .await
            .map_err(|e| TransportError::Channel(format!("Failed to set prefetch: {}", e)))
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: MessageProperties,
    ) -> Result<()> {
        let confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                payload,
                to_basic_properties(properties),
            )
            .await
            .map_err(|e| publish_error("Failed to publish", e))?;

        confirm
            .await
            .map_err(|e| publish_error("Publish confirmation failed", e))?;

        debug!(exchange = %exchange, routing_key = %routing_key, "Published message");
        Ok(())
    }

    async fn consume(&self, queue: &str, options: ConsumeOptions) -> Result<DeliveryStream> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                &options.consumer_tag,
                BasicConsumeOptions {
                    no_ack: options.auto_ack,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| TransportError::Consume(format!("Failed to start consumer: {}", e)))?;

        let auto_ack = options.auto_ack;
        let stream = consumer.map(move |delivery| {
            let delivery = delivery
                .map_err(|e| TransportError::Consume(format!("Delivery failed: {}", e)))?;
            let acker: Option<Box<dyn Acker>> = if auto_ack {
                None
            } else {
                Some(Box::new(AmqpAcker(delivery.acker)))
            };
            Ok(Delivery {
                properties: from_basic_properties(&delivery.properties),
                routing_key: delivery.routing_key.as_str().to_string(),
                data: delivery.data,
                acker,
            })
        });

        Ok(stream.boxed())
    }

    async fn close(&self) -> Result<()> {
        if !self.channel.status().connected() {
            return Ok(());
        }
        self.channel
            .close(200, "OK")
            .await
            .map_err(|e| TransportError::Channel(format!("Failed to close channel: {}", e)))
    }
}

struct AmqpAcker(lapin::acker::Acker);

impl Acker for AmqpAcker {
    fn ack(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.0
                .ack(BasicAckOptions::default())
                .await
                .map_err(|e| TransportError::Ack(format!("Failed to ack: {}", e)))
        })
    }

    fn reject(&self, requeue: bool) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.0
                .reject(BasicRejectOptions { requeue })
                .await
                .map_err(|e| TransportError::Ack(format!("Failed to reject: {}", e)))
        })
    }
}
