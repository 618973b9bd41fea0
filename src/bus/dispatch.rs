//! Broadcast fan-out over the shared exchange.
//!
//! Each service owns one exclusive, broker-named queue bound to the shared
//! exchange under its own service name. Deliveries are auto-acked: delivery is
//! at most once and a crashed handler is never retried.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::envelope::{self, BrokerEnvelope};
use super::names::MessageType;
use super::registry::HandlerRegistry;
use super::supervisor::{panic_message, Consumer, Subscription};
use super::Result;
use crate::config::MessagingConfig;
use crate::transport::{
    ChannelManager, ChannelPtr, ConsumeOptions, Delivery, ExchangeKind, MessageProperties,
    QueueOptions,
};

/// What happened to one inbound broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Every handler for the path ran; `failed` of them returned an error or panicked.
    Delivered { handlers: usize, failed: usize },
    /// Known path, but this process has no handler for it.
    NoHandlers,
    /// Path is not a known message type.
    UnknownPath,
    /// Body was not a valid envelope.
    DecodeError,
}

/// Decode an envelope and run every handler registered for its path.
///
/// Handlers run one after another in registration order. A handler that fails
/// or panics is logged and the remaining handlers still run.
pub async fn dispatch_envelope(registry: &HandlerRegistry, payload: &[u8]) -> DispatchOutcome {
    let envelope: BrokerEnvelope = match envelope::decode(payload) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!(error = %e, bytes = payload.len(), "Dropping malformed envelope");
            return DispatchOutcome::DecodeError;
        }
    };

    let path = match envelope.path.parse::<MessageType>() {
        Ok(path) => path,
        Err(_) => {
            debug!(path = %envelope.path, source = %envelope.source, "Unknown message type, dropped");
            return DispatchOutcome::UnknownPath;
        }
    };

    let handlers = registry.message_handlers(path);
    if handlers.is_empty() {
        debug!(path = %path, source = %envelope.source, "No handlers for message type");
        return DispatchOutcome::NoHandlers;
    }

    let envelope = Arc::new(envelope);
    let mut failed = 0;

    for (index, handler) in handlers.iter().enumerate() {
        let call = async { handler.handle(Arc::clone(&envelope)).await };
        match AssertUnwindSafe(call).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                failed += 1;
                error!(
                    path = %path,
                    source = %envelope.source,
                    handler = index,
                    error = %e,
                    "Message handler failed"
                );
            }
            Err(panic) => {
                failed += 1;
                error!(
                    path = %path,
                    source = %envelope.source,
                    handler = index,
                    panic = %panic_message(panic.as_ref()),
                    "Message handler panicked"
                );
            }
        }
    }

    debug!(path = %path, source = %envelope.source, handlers = handlers.len(), failed, "Dispatched envelope");
    DispatchOutcome::Delivered {
        handlers: handlers.len(),
        failed,
    }
}

/// Inbound side of broadcast: this service's queue on the shared exchange.
pub struct FanoutDispatcher {
    channels: ChannelManager,
    registry: Arc<HandlerRegistry>,
    exchange: String,
    exchange_kind: ExchangeKind,
    service: String,
}

impl FanoutDispatcher {
    pub fn new(
        config: &MessagingConfig,
        channels: ChannelManager,
        registry: Arc<HandlerRegistry>,
    ) -> Self {
        Self {
            channels,
            registry,
            exchange: config.exchange.clone(),
            exchange_kind: config.exchange_kind,
            service: config.service.clone(),
        }
    }
}

#[async_trait]
impl Consumer for FanoutDispatcher {
    fn name(&self) -> &str {
        "fanout"
    }

    async fn subscribe(&self) -> Result<Subscription> {
        let channel = self.channels.lease().await?;
        channel
            .declare_exchange(&self.exchange, self.exchange_kind, true)
            .await?;
        let queue = channel.declare_queue("", QueueOptions::exclusive()).await?;
        channel.bind_queue(&queue, &self.exchange, &self.service).await?;
        let deliveries = channel
            .consume(
                &queue,
                ConsumeOptions::auto_ack(format!("{}-fanout", self.service)),
            )
            .await?;

        info!(
            exchange = %self.exchange,
            queue = %queue,
            routing_key = %self.service,
            paths = ?self.registry.subscribed_paths(),
            "Fan-out consumer ready"
        );
        Ok(Subscription {
            channel,
            deliveries,
        })
    }

    async fn handle(&self, _channel: &ChannelPtr, delivery: Delivery) {
        dispatch_envelope(&self.registry, &delivery.data).await;
    }
}

/// Outbound side of broadcast. Publishes on the shared channel.
#[derive(Clone)]
pub struct FanoutPublisher {
    channels: ChannelManager,
    exchange: String,
    source: String,
}

impl FanoutPublisher {
    pub fn new(config: &MessagingConfig, channels: ChannelManager) -> Self {
        Self {
            channels,
            exchange: config.exchange.clone(),
            source: config.service.clone(),
        }
    }

    /// Broadcast `data` to the service listening under `target`.
    ///
    /// Fire-and-forget: `Ok` means the broker took the message, not that
    /// anyone handled it. A broken shared channel is replaced once before
    /// giving up; other failures are returned as they are.
    #[tracing::instrument(name = "bus.publish", skip_all, fields(target = %target, path = %path))]
    pub async fn publish<T: Serialize>(&self, target: &str, path: MessageType, data: &T) -> Result<()> {
        let body = envelope::encode(&BrokerEnvelope::new(
            self.source.as_str(),
            path.as_str(),
            data,
        ))?;

        let mut attempt = 0;
        loop {
            attempt += 1;
            let outcome = match self.channels.get_channel().await {
                Ok(channel) => {
                    channel
                        .publish(&self.exchange, target, &body, MessageProperties::json())
                        .await
                }
                Err(e) => Err(e),
            };

            match outcome {
                Ok(()) => {
                    debug!(exchange = %self.exchange, "Published envelope");
                    return Ok(());
                }
                Err(e) if e.is_channel_loss() && attempt < 2 => {
                    self.channels.invalidate().await;
                    warn!(error = %e, "Publish failed, retrying on a fresh channel");
                }
                Err(e) => {
                    if e.is_channel_loss() {
                        self.channels.invalidate().await;
                    }
                    error!(error = %e, "Publish failed");
                    return Err(e.into());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::registry::HandlerError;
    use crate::bus::BusError;
    use crate::transport::{MemoryBroker, MemoryTransport, TransportError};
    use futures::StreamExt;
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::Duration;

    type Log = Arc<Mutex<Vec<String>>>;

    fn recording(log: &Log, label: &'static str) -> impl Fn(Arc<BrokerEnvelope>) -> futures::future::Ready<std::result::Result<(), HandlerError>> {
        let log = log.clone();
        move |envelope: Arc<BrokerEnvelope>| {
            log.lock().unwrap().push(format!("{}:{}", label, envelope.data["postId"]));
            futures::future::ready(Ok(()))
        }
    }

    fn body(path: &str) -> Vec<u8> {
        envelope::encode(&BrokerEnvelope::new("post", path, json!({"postId": "p1"}))).unwrap()
    }

    #[tokio::test]
    async fn test_dispatch_runs_handlers_in_order() {
        let log: Log = Arc::default();
        let mut registry = HandlerRegistry::new();
        registry.listen_message(MessageType::NotifyFoodLiked, recording(&log, "first"));
        registry.listen_message(MessageType::NotifyFoodLiked, recording(&log, "second"));

        let outcome = dispatch_envelope(&registry, &body("NOTIFY_FOOD_LIKED")).await;

        assert_eq!(outcome, DispatchOutcome::Delivered { handlers: 2, failed: 0 });
        assert_eq!(*log.lock().unwrap(), vec!["first:\"p1\"", "second:\"p1\""]);
    }

    #[tokio::test]
    async fn test_dispatch_isolates_failing_and_panicking_handlers() {
        let log: Log = Arc::default();
        let mut registry = HandlerRegistry::new();
        registry.listen_message(MessageType::NotifyFoodLiked, |_e: Arc<BrokerEnvelope>| async {
            Err::<(), _>(HandlerError::failed("database down"))
        });
        registry.listen_message(MessageType::NotifyFoodLiked, |_e: Arc<BrokerEnvelope>| async {
            if true {
                panic!("handler bug");
            }
            Ok::<(), HandlerError>(())
        });
        registry.listen_message(MessageType::NotifyFoodLiked, recording(&log, "last"));

        let outcome = dispatch_envelope(&registry, &body("NOTIFY_FOOD_LIKED")).await;

        assert_eq!(outcome, DispatchOutcome::Delivered { handlers: 3, failed: 2 });
        assert_eq!(log.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_dispatch_drops_unhandled_and_malformed() {
        let log: Log = Arc::default();
        let mut registry = HandlerRegistry::new();
        registry.listen_message(MessageType::NotifyFoodLiked, recording(&log, "only"));

        assert_eq!(
            dispatch_envelope(&registry, &body("USER_UPDATED")).await,
            DispatchOutcome::NoHandlers
        );
        assert_eq!(
            dispatch_envelope(&registry, &body("SOMETHING_NEW")).await,
            DispatchOutcome::UnknownPath
        );
        assert_eq!(
            dispatch_envelope(&registry, b"not json").await,
            DispatchOutcome::DecodeError
        );
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_subscribe_binds_exclusive_queue_under_service_name() {
        let broker = MemoryBroker::new();
        let channels = ChannelManager::new(Arc::new(MemoryTransport::new(broker.clone())));
        let config = MessagingConfig::memory("notification");
        let dispatcher = FanoutDispatcher::new(&config, channels, Arc::new(HandlerRegistry::new()));

        let subscription = dispatcher.subscribe().await.unwrap();

        let bindings = broker.bindings(&config.exchange);
        assert_eq!(bindings.len(), 1);
        assert!(bindings[0].0.starts_with("amq.gen-"));
        assert_eq!(bindings[0].1, "notification");

        subscription.channel.close().await.unwrap();
        assert!(broker.bindings(&config.exchange).is_empty());
    }

    #[tokio::test]
    async fn test_publisher_wraps_envelope_and_routes_by_target() {
        let broker = MemoryBroker::new();
        let channels = ChannelManager::new(Arc::new(MemoryTransport::new(broker.clone())));
        let notification = MessagingConfig::memory("notification");
        let dispatcher =
            FanoutDispatcher::new(&notification, channels.clone(), Arc::new(HandlerRegistry::new()));
        let mut subscription = dispatcher.subscribe().await.unwrap();

        let publisher = FanoutPublisher::new(&MessagingConfig::memory("post"), channels);
        publisher
            .publish("notification", MessageType::NotifyFoodLiked, &json!({"postId": "p1"}))
            .await
            .unwrap();

        let delivery = tokio::time::timeout(Duration::from_secs(1), subscription.deliveries.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let envelope: BrokerEnvelope = envelope::decode(&delivery.data).unwrap();
        assert_eq!(
            envelope,
            BrokerEnvelope::new("post", "NOTIFY_FOOD_LIKED", json!({"postId": "p1"}))
        );
        assert_eq!(delivery.routing_key, "notification");
    }

    #[tokio::test]
    async fn test_publisher_recovers_from_broken_shared_channel() {
        let broker = MemoryBroker::new();
        let channels = ChannelManager::new(Arc::new(MemoryTransport::new(broker.clone())));
        let config = MessagingConfig::memory("post");
        let setup = channels.lease().await.unwrap();
        setup
            .declare_exchange(&config.exchange, ExchangeKind::Topic, true)
            .await
            .unwrap();

        let publisher = FanoutPublisher::new(&config, channels.clone());
        publisher
            .publish("notification", MessageType::UserUpdated, &json!({}))
            .await
            .unwrap();

        // Outage closes the cached channel; the next publish must reopen.
        broker.set_offline(true);
        assert!(publisher
            .publish("notification", MessageType::UserUpdated, &json!({}))
            .await
            .is_err());
        broker.set_offline(false);
        publisher
            .publish("notification", MessageType::UserUpdated, &json!({}))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_publisher_keeps_channel_on_missing_exchange() {
        let broker = MemoryBroker::new();
        let channels = ChannelManager::new(Arc::new(MemoryTransport::new(broker.clone())));
        let publisher = FanoutPublisher::new(&MessagingConfig::memory("post"), channels.clone());
        let shared = channels.get_channel().await.unwrap();

        let result = publisher
            .publish("notification", MessageType::UserUpdated, &json!({}))
            .await;

        assert!(matches!(
            result,
            Err(BusError::Transport(TransportError::Publish(_)))
        ));
        assert!(Arc::ptr_eq(&shared, &channels.get_channel().await.unwrap()));
        assert_eq!(broker.open_channels(), 1);
    }
}
