//! Service bus: broadcast messaging and RPC over a broker transport.
//!
//! This module contains:
//! - Wire contracts (`envelope`) and typed name registries (`names`)
//! - Handler traits and the per-process `HandlerRegistry`
//! - `FanoutDispatcher`: shared-exchange broadcast in and out
//! - `RpcResponder`: serves this service's RPC inbox
//! - `RpcCaller`: issues RPC calls and correlates replies
//! - `ServiceBus`: the facade tying them to one transport

use crate::transport::TransportError;

pub mod caller;
pub mod dispatch;
pub mod envelope;
pub mod names;
pub mod registry;
pub mod responder;
pub mod service;
mod supervisor;

pub use caller::{CallOptions, RpcCaller};
pub use dispatch::{dispatch_envelope, DispatchOutcome, FanoutDispatcher, FanoutPublisher};
pub use envelope::{BrokerEnvelope, RpcError, RpcRequest, RpcResponse};
pub use names::{ActionName, MessageType, UnknownName};
pub use registry::{
    typed_message, typed_rpc, HandlerError, HandlerRegistry, MessageHandler, RpcHandler,
};
pub use responder::RpcResponder;
pub use service::{ServiceBus, ServiceBusBuilder};

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("Failed to decode message: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("Service bus is shut down")]
    Shutdown,
}
