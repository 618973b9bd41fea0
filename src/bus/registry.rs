//! Handler traits and the per-process handler registry.
//!
//! Broadcast paths fan out to any number of handlers, run in registration
//! order. RPC actions map to exactly one handler; registering an action twice
//! replaces the earlier handler.

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use super::envelope::{BrokerEnvelope, RpcRequest};
use super::names::{ActionName, MessageType};

/// Errors a handler reports back to the bus.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("Invalid payload: {0}")]
    InvalidPayload(#[source] serde_json::Error),

    #[error("Result not serializable: {0}")]
    Serialization(#[source] serde_json::Error),

    #[error("{0}")]
    Failed(String),
}

impl HandlerError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// Handler for broadcast envelopes.
pub trait MessageHandler: Send + Sync {
    fn handle(&self, envelope: Arc<BrokerEnvelope>) -> BoxFuture<'static, Result<(), HandlerError>>;
}

impl<F, Fut> MessageHandler for F
where
    F: Fn(Arc<BrokerEnvelope>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    fn handle(&self, envelope: Arc<BrokerEnvelope>) -> BoxFuture<'static, Result<(), HandlerError>> {
        Box::pin(self(envelope))
    }
}

/// Handler for one RPC action. The returned value becomes the reply's `data`.
pub trait RpcHandler: Send + Sync {
    fn handle(&self, request: RpcRequest) -> BoxFuture<'static, Result<Value, HandlerError>>;
}

impl<F, Fut> RpcHandler for F
where
    F: Fn(RpcRequest) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
{
    fn handle(&self, request: RpcRequest) -> BoxFuture<'static, Result<Value, HandlerError>> {
        Box::pin(self(request))
    }
}

/// Broadcast handler that receives `data` already decoded.
pub struct TypedMessageHandler<T, F> {
    handler: F,
    _data: PhantomData<fn(T)>,
}

/// Wrap a handler taking `BrokerEnvelope<T>`.
pub fn typed_message<T, F, Fut>(handler: F) -> TypedMessageHandler<T, F>
where
    T: DeserializeOwned + Send + 'static,
    F: Fn(BrokerEnvelope<T>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    TypedMessageHandler {
        handler,
        _data: PhantomData,
    }
}

impl<T, F, Fut> MessageHandler for TypedMessageHandler<T, F>
where
    T: DeserializeOwned + Send + 'static,
    F: Fn(BrokerEnvelope<T>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    fn handle(&self, envelope: Arc<BrokerEnvelope>) -> BoxFuture<'static, Result<(), HandlerError>> {
        match envelope.data_as::<T>() {
            Ok(data) => Box::pin((self.handler)(BrokerEnvelope::new(
                envelope.source.clone(),
                envelope.path.clone(),
                data,
            ))),
            Err(e) => Box::pin(async move { Err(HandlerError::InvalidPayload(e)) }),
        }
    }
}

/// RPC handler with typed request payload and result.
pub struct TypedRpcHandler<Req, Res, F> {
    handler: F,
    _types: PhantomData<fn(Req) -> Res>,
}

/// Wrap a handler taking `RpcRequest<Req>` and returning `Res`.
pub fn typed_rpc<Req, Res, F, Fut>(handler: F) -> TypedRpcHandler<Req, Res, F>
where
    Req: DeserializeOwned + Send + 'static,
    Res: Serialize + Send + 'static,
    F: Fn(RpcRequest<Req>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Res, HandlerError>> + Send + 'static,
{
    TypedRpcHandler {
        handler,
        _types: PhantomData,
    }
}

impl<Req, Res, F, Fut> RpcHandler for TypedRpcHandler<Req, Res, F>
where
    Req: DeserializeOwned + Send + 'static,
    Res: Serialize + Send + 'static,
    F: Fn(RpcRequest<Req>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Res, HandlerError>> + Send + 'static,
{
    fn handle(&self, request: RpcRequest) -> BoxFuture<'static, Result<Value, HandlerError>> {
        let payload = match request.payload_as::<Req>() {
            Ok(payload) => payload,
            Err(e) => return Box::pin(async move { Err(HandlerError::InvalidPayload(e)) }),
        };
        let fut = (self.handler)(RpcRequest::new(request.source, request.action, payload));
        Box::pin(async move {
            let result = fut.await?;
            serde_json::to_value(result).map_err(HandlerError::Serialization)
        })
    }
}

/// Per-process handler tables.
///
/// Built before the bus starts and read-only afterwards.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    messages: HashMap<MessageType, Vec<Arc<dyn MessageHandler>>>,
    actions: HashMap<ActionName, Arc<dyn RpcHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a broadcast handler for `path`, after any already registered.
    pub fn listen_message(&mut self, path: MessageType, handler: impl MessageHandler + 'static) {
        let handlers = self.messages.entry(path).or_default();
        handlers.push(Arc::new(handler));
        info!(path = %path, handler_count = handlers.len(), "Message handler registered");
    }

    /// Set the handler for `action`. Returns `true` if one was replaced.
    pub fn listen_rpc(&mut self, action: ActionName, handler: impl RpcHandler + 'static) -> bool {
        let replaced = self.actions.insert(action, Arc::new(handler)).is_some();
        if replaced {
            warn!(action = %action, "RPC handler replaced by later registration");
        } else {
            info!(action = %action, "RPC handler registered");
        }
        replaced
    }

    /// Handlers for `path`, in registration order.
    pub fn message_handlers(&self, path: MessageType) -> &[Arc<dyn MessageHandler>] {
        self.messages.get(&path).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn rpc_handler(&self, action: ActionName) -> Option<Arc<dyn RpcHandler>> {
        self.actions.get(&action).cloned()
    }

    /// Paths with at least one handler.
    pub fn subscribed_paths(&self) -> Vec<MessageType> {
        let mut paths: Vec<MessageType> = self.messages.keys().copied().collect();
        paths.sort_by_key(|p| p.as_str());
        paths
    }

    /// Actions with a handler.
    pub fn registered_actions(&self) -> Vec<ActionName> {
        let mut actions: Vec<ActionName> = self.actions.keys().copied().collect();
        actions.sort_by_key(|a| a.as_str());
        actions
    }
}
