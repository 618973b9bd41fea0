//! `ServiceBus`: one service's view of the broker.
//!
//! Handlers are registered on a `ServiceBusBuilder`; `start` freezes the
//! registry, brings up the fan-out consumer and the RPC inbox, and returns
//! once both are consuming.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::caller::{CallOptions, RpcCaller};
use super::dispatch::{FanoutDispatcher, FanoutPublisher};
use super::envelope::{RpcRequest, RpcResponse};
use super::names::{ActionName, MessageType};
use super::registry::{HandlerRegistry, MessageHandler, RpcHandler};
use super::responder::RpcResponder;
use super::supervisor::{spawn_supervised, Consumer};
use super::{BusError, Result};
use crate::config::MessagingConfig;
use crate::transport::{ChannelManager, ConnectionState, TransportPtr};

/// Collects handlers before the bus starts.
pub struct ServiceBusBuilder {
    config: MessagingConfig,
    transport: TransportPtr,
    registry: HandlerRegistry,
}

impl ServiceBusBuilder {
    pub fn new(config: MessagingConfig, transport: TransportPtr) -> Self {
        Self {
            config,
            transport,
            registry: HandlerRegistry::new(),
        }
    }

    /// Add a broadcast handler for `path`.
    pub fn subscribe(mut self, path: MessageType, handler: impl MessageHandler + 'static) -> Self {
        self.registry.listen_message(path, handler);
        self
    }

    /// Set the handler for `action`, replacing any earlier one.
    pub fn register_rpc_handler(
        mut self,
        action: ActionName,
        handler: impl RpcHandler + 'static,
    ) -> Self {
        self.registry.listen_rpc(action, handler);
        self
    }

    /// Connect, declare, and start consuming.
    pub async fn start(self) -> Result<ServiceBus> {
        let channels = ChannelManager::new(self.transport);
        let registry = Arc::new(self.registry);
        let (stop, shutdown) = watch::channel(false);

        let dispatcher = Arc::new(FanoutDispatcher::new(
            &self.config,
            channels.clone(),
            Arc::clone(&registry),
        ));
        let responder = Arc::new(RpcResponder::new(
            &self.config,
            channels.clone(),
            Arc::clone(&registry),
        ));

        let fanout = dispatcher.subscribe().await?;
        let inbox = match responder.subscribe().await {
            Ok(inbox) => inbox,
            Err(e) => {
                let _ = fanout.channel.close().await;
                return Err(e);
            }
        };

        let tasks = vec![
            spawn_supervised(dispatcher, fanout, self.config.reconnect.clone(), shutdown.clone()),
            spawn_supervised(responder, inbox, self.config.reconnect.clone(), shutdown),
        ];

        info!(
            service = %self.config.service,
            exchange = %self.config.exchange,
            rpc_queue = %self.config.rpc_queue(),
            "Service bus started"
        );

        Ok(ServiceBus {
            publisher: FanoutPublisher::new(&self.config, channels.clone()),
            caller: RpcCaller::new(&self.config, channels.clone()),
            channels,
            config: self.config,
            stop,
            tasks: Mutex::new(tasks),
        })
    }
}

/// A running service bus.
pub struct ServiceBus {
    config: MessagingConfig,
    channels: ChannelManager,
    publisher: FanoutPublisher,
    caller: RpcCaller,
    stop: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ServiceBus {
    pub fn builder(config: MessagingConfig, transport: TransportPtr) -> ServiceBusBuilder {
        ServiceBusBuilder::new(config, transport)
    }

    /// This service's identity.
    pub fn service(&self) -> &str {
        &self.config.service
    }

    /// This service's RPC inbox.
    pub fn rpc_queue(&self) -> String {
        self.config.rpc_queue()
    }

    /// Readiness of the broker connection.
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.channels.state()
    }

    pub fn caller(&self) -> &RpcCaller {
        &self.caller
    }

    fn ensure_running(&self) -> Result<()> {
        if *self.stop.borrow() {
            return Err(BusError::Shutdown);
        }
        Ok(())
    }

    /// Broadcast `data` as `path` to the service listening under `target`.
    pub async fn publish<T: Serialize>(&self, target: &str, path: MessageType, data: &T) -> Result<()> {
        self.ensure_running()?;
        self.publisher.publish(target, path, data).await
    }

    /// Call `action` on `target_queue` with the configured timeout.
    pub async fn call_rpc<T: Serialize>(
        &self,
        target_queue: &str,
        action: ActionName,
        payload: &T,
    ) -> Result<RpcResponse> {
        self.call_rpc_with(target_queue, action, payload, CallOptions::default())
            .await
    }

    /// Call `action` on `target_queue` with explicit timeout/cancellation.
    pub async fn call_rpc_with<T: Serialize>(
        &self,
        target_queue: &str,
        action: ActionName,
        payload: &T,
        options: CallOptions,
    ) -> Result<RpcResponse> {
        self.ensure_running()?;
        let request = RpcRequest::new(self.config.service.as_str(), action.as_str(), payload);
        self.caller.call(target_queue, &request, options).await
    }

    /// Stop consuming and release broker resources.
    pub async fn shutdown(&self) {
        if self.stop.send_replace(true) {
            return;
        }

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Consumer task ended abnormally");
            }
        }
        self.caller.close().await;
        self.channels.close().await;
        info!(service = %self.config.service, "Service bus stopped");
    }
}
