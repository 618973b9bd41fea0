//! recipe-bus - service-to-service messaging over an AMQP broker
//!
//! Fire-and-forget broadcasts on a shared exchange and request/response RPC
//! over per-service inbox queues, with correlation IDs, reply queues,
//! per-call timeouts and cancellation.

pub mod bus;
pub mod config;
pub mod transport;
pub mod utils;
