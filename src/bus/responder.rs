//! RPC responder: serves this service's RPC inbox.
//!
//! Requests are acked only after their reply has been published. A crash in
//! the middle of a handler therefore leaves the request unacked and the broker
//! redelivers it; a handler error or panic is answered with the generic
//! `unknown` error and never redelivered.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use tracing::{debug, error, info, warn};

use super::envelope::{self, RpcRequest, RpcResponse};
use super::names::ActionName;
use super::registry::HandlerRegistry;
use super::supervisor::{panic_message, Consumer, Subscription};
use super::Result;
use crate::config::MessagingConfig;
use crate::transport::{
    ChannelManager, ChannelPtr, ConsumeOptions, Delivery, MessageProperties, QueueOptions,
    DEFAULT_EXCHANGE,
};

/// Used if a response cannot be serialized.
const UNKNOWN_ERROR_BODY: &[u8] = br#"{"err":{"code":500,"target":"unknown","reason":"unknown"}}"#;

pub struct RpcResponder {
    channels: ChannelManager,
    registry: Arc<HandlerRegistry>,
    queue: String,
    queue_options: QueueOptions,
    prefetch: u16,
    service: String,
}

impl RpcResponder {
    pub fn new(
        config: &MessagingConfig,
        channels: ChannelManager,
        registry: Arc<HandlerRegistry>,
    ) -> Self {
        let queue_options = if config.rpc.durable {
            QueueOptions::durable()
        } else {
            QueueOptions::transient()
        };
        Self {
            channels,
            registry,
            queue: config.rpc_queue(),
            queue_options,
            prefetch: config.rpc.prefetch,
            service: config.service.clone(),
        }
    }

    /// Inbox queue name.
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Produce the response for one request body.
    pub async fn respond(&self, body: &[u8]) -> RpcResponse {
        let request: RpcRequest = match envelope::decode(body) {
            Ok(request) => request,
            Err(e) => {
                warn!(queue = %self.queue, error = %e, "Malformed RPC request");
                return RpcResponse::unknown();
            }
        };

        let handler = request
            .action
            .parse::<ActionName>()
            .ok()
            .and_then(|action| self.registry.rpc_handler(action));
        let Some(handler) = handler else {
            warn!(action = %request.action, source = %request.source, "No RPC handler for action");
            return RpcResponse::not_found();
        };

        let action = request.action.clone();
        let source = request.source.clone();
        let call = async move { handler.handle(request).await };

        match AssertUnwindSafe(call).catch_unwind().await {
            Ok(Ok(data)) => {
                debug!(action = %action, source = %source, "RPC handled");
                RpcResponse::ok(data)
            }
            Ok(Err(e)) => {
                error!(action = %action, source = %source, error = %e, "RPC handler failed");
                RpcResponse::unknown()
            }
            Err(panic) => {
                error!(
                    action = %action,
                    source = %source,
                    panic = %panic_message(panic.as_ref()),
                    "RPC handler panicked"
                );
                RpcResponse::unknown()
            }
        }
    }
}

#[async_trait]
impl Consumer for RpcResponder {
    fn name(&self) -> &str {
        &self.queue
    }

    async fn subscribe(&self) -> Result<Subscription> {
        let channel = self.channels.lease().await?;
        channel.declare_queue(&self.queue, self.queue_options).await?;
        channel.set_prefetch(self.prefetch).await?;
        let deliveries = channel
            .consume(
                &self.queue,
                ConsumeOptions::manual_ack(format!("{}-rpc-responder", self.service)),
            )
            .await?;

        info!(
            queue = %self.queue,
            durable = self.queue_options.durable,
            prefetch = self.prefetch,
            actions = ?self.registry.registered_actions(),
            "RPC responder ready"
        );
        Ok(Subscription {
            channel,
            deliveries,
        })
    }

    async fn handle(&self, channel: &ChannelPtr, delivery: Delivery) {
        let correlation_id = delivery.properties.correlation_id.clone();

        let Some(reply_to) = delivery.properties.reply_to.clone() else {
            warn!(
                queue = %self.queue,
                correlation_id = ?correlation_id,
                "RPC request without reply_to, acking without reply"
            );
            if let Err(e) = delivery.ack().await {
                error!(error = %e, "Failed to ack RPC request");
            }
            return;
        };

        let response = self.respond(&delivery.data).await;
        let body = envelope::encode(&response).unwrap_or_else(|e| {
            error!(error = %e, "Failed to encode RPC response");
            UNKNOWN_ERROR_BODY.to_vec()
        });

        let mut properties = MessageProperties::json();
        properties.correlation_id = correlation_id.clone();

        if let Err(e) = channel
            .publish(DEFAULT_EXCHANGE, &reply_to, &body, properties)
            .await
        {
            error!(
                reply_to = %reply_to,
                correlation_id = ?correlation_id,
                error = %e,
                "Failed to publish RPC reply, requeueing request"
            );
            if let Err(e) = delivery.reject(true).await {
                error!(error = %e, "Failed to requeue RPC request");
            }
            return;
        }

        if let Err(e) = delivery.ack().await {
            error!(error = %e, "Failed to ack RPC request");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::envelope::RpcError;
    use crate::bus::registry::HandlerError;
    use crate::transport::{DeliveryStream, MemoryBroker, MemoryTransport, Transport};
    use futures::StreamExt;
    use serde_json::{json, Value};
    use std::time::Duration;

    fn responder(registry: HandlerRegistry) -> (Arc<MemoryBroker>, RpcResponder) {
        let broker = MemoryBroker::new();
        let channels = ChannelManager::new(Arc::new(MemoryTransport::new(broker.clone())));
        let config = MessagingConfig::memory("auth");
        (broker, RpcResponder::new(&config, channels, Arc::new(registry)))
    }

    fn request(action: &str, payload: Value) -> Vec<u8> {
        envelope::encode(&RpcRequest::new("post", action, payload)).unwrap()
    }

    async fn next(stream: &mut DeliveryStream) -> Delivery {
        tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_respond_success() {
        let mut registry = HandlerRegistry::new();
        registry.listen_rpc(ActionName::GetUserById, |request: RpcRequest| async move {
            Ok::<_, HandlerError>(json!({"_id": request.payload["_id"], "name": "Alice"}))
        });
        let (_broker, responder) = responder(registry);

        let response = responder
            .respond(&request("rpcGetUserById", json!({"_id": "u1"})))
            .await;
        assert_eq!(response, RpcResponse::ok(json!({"_id": "u1", "name": "Alice"})));
    }

    #[tokio::test]
    async fn test_respond_not_found() {
        let mut registry = HandlerRegistry::new();
        registry.listen_rpc(ActionName::GetUserById, |_r: RpcRequest| async {
            Ok::<_, HandlerError>(Value::Null)
        });
        let (_broker, responder) = responder(registry);

        let unknown_name = responder.respond(&request("rpcUnknownAction", json!({}))).await;
        assert_eq!(unknown_name.err, Some(RpcError::not_found()));

        let unregistered = responder.respond(&request("rpcGetPostById", json!({}))).await;
        assert_eq!(unregistered.err, Some(RpcError::not_found()));
    }

    #[tokio::test]
    async fn test_respond_hides_handler_failures() {
        let mut registry = HandlerRegistry::new();
        registry.listen_rpc(ActionName::GetUserById, |_r: RpcRequest| async {
            Err::<Value, _>(HandlerError::failed("connection refused: mongodb://secret"))
        });
        registry.listen_rpc(ActionName::GetPostById, |_r: RpcRequest| async {
            if true {
                panic!("index out of bounds");
            }
            Ok::<_, HandlerError>(Value::Null)
        });
        let (_broker, responder) = responder(registry);

        let failed = responder.respond(&request("rpcGetUserById", json!({}))).await;
        assert_eq!(failed.err, Some(RpcError::unknown()));
        assert!(failed.data.is_none());

        let panicked = responder.respond(&request("rpcGetPostById", json!({}))).await;
        assert_eq!(panicked.err, Some(RpcError::unknown()));
    }

    #[tokio::test]
    async fn test_respond_malformed_request() {
        let (_broker, responder) = responder(HandlerRegistry::new());
        let response = responder.respond(b"{\"action\": 12").await;
        assert_eq!(response.err, Some(RpcError::unknown()));
    }

    #[tokio::test]
    async fn test_subscribe_declares_inbox_with_prefetch() {
        let (broker, responder) = responder(HandlerRegistry::new());
        let subscription = responder.subscribe().await.unwrap();

        assert_eq!(responder.queue(), "auth-rpc");
        assert!(broker.queue_exists("auth-rpc"));
        assert_eq!(broker.prefetch_limits(), vec![1]);

        // Inbox outlives the consumer.
        subscription.channel.close().await.unwrap();
        assert!(broker.queue_exists("auth-rpc"));
    }

    #[tokio::test]
    async fn test_handle_replies_with_correlation_and_acks() {
        let mut registry = HandlerRegistry::new();
        registry.listen_rpc(ActionName::CountUnreadNotifications, |_r: RpcRequest| async {
            Ok::<_, HandlerError>(json!(3))
        });
        let (broker, responder) = responder(registry);
        let mut inbox = responder.subscribe().await.unwrap();

        let client = MemoryTransport::new(broker.clone()).open_channel().await.unwrap();
        let reply_queue = client.declare_queue("", QueueOptions::exclusive()).await.unwrap();
        let mut replies = client
            .consume(&reply_queue, ConsumeOptions::auto_ack("client"))
            .await
            .unwrap();

        client
            .publish(
                DEFAULT_EXCHANGE,
                "auth-rpc",
                &request("rpcCountUnreadNotifications", json!({"userId": "u1"})),
                MessageProperties::json()
                    .with_correlation_id("corr-1")
                    .with_reply_to(&reply_queue),
            )
            .await
            .unwrap();

        let delivery = next(&mut inbox.deliveries).await;
        responder.handle(&inbox.channel, delivery).await;

        let reply = next(&mut replies).await;
        assert_eq!(reply.properties.correlation_id.as_deref(), Some("corr-1"));
        let response: RpcResponse = envelope::decode(&reply.data).unwrap();
        assert_eq!(response.data, Some(json!(3)));
        assert_eq!(broker.queue_depth("auth-rpc"), 0);
        assert_eq!(broker.unacked("auth-rpc"), 0);
    }

    #[tokio::test]
    async fn test_handle_without_reply_to_acks_and_moves_on() {
        let (broker, responder) = responder(HandlerRegistry::new());
        let mut inbox = responder.subscribe().await.unwrap();

        let client = MemoryTransport::new(broker.clone()).open_channel().await.unwrap();
        client
            .publish(
                DEFAULT_EXCHANGE,
                "auth-rpc",
                &request("rpcGetUserById", json!({})),
                MessageProperties::json(),
            )
            .await
            .unwrap();

        let delivery = next(&mut inbox.deliveries).await;
        responder.handle(&inbox.channel, delivery).await;
        assert_eq!(broker.queue_depth("auth-rpc"), 0);
        assert_eq!(broker.unacked("auth-rpc"), 0);
    }

    #[tokio::test]
    async fn test_handle_requeues_when_reply_cannot_be_published() {
        let (broker, responder) = responder(HandlerRegistry::new());
        let mut inbox = responder.subscribe().await.unwrap();

        let client = MemoryTransport::new(broker.clone()).open_channel().await.unwrap();
        client
            .publish(
                DEFAULT_EXCHANGE,
                "auth-rpc",
                &request("rpcGetUserById", json!({})),
                MessageProperties::json().with_reply_to("amq.gen-gone"),
            )
            .await
            .unwrap();

        let delivery = next(&mut inbox.deliveries).await;
        // A closed channel cannot publish the reply.
        let closed = MemoryTransport::new(broker.clone()).open_channel().await.unwrap();
        closed.close().await.unwrap();
        responder.handle(&closed, delivery).await;

        // Requeued onto the inbox, redelivered to the live consumer.
        let redelivered = next(&mut inbox.deliveries).await;
        assert_eq!(redelivered.properties.reply_to.as_deref(), Some("amq.gen-gone"));
    }
}
