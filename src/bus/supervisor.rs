//! Supervised consumer loops.
//!
//! A consumer owns a leased channel. When its delivery stream ends or fails,
//! the channel is closed and the subscription is rebuilt with exponential
//! backoff until it succeeds or shutdown is requested.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::Result;
use crate::config::ReconnectConfig;
use crate::transport::{ChannelPtr, Delivery, DeliveryStream};
use crate::utils::retry::ConsumerBackoff;

/// A live consumer: the channel it owns and its deliveries.
pub(crate) struct Subscription {
    pub channel: ChannelPtr,
    pub deliveries: DeliveryStream,
}

/// Something that consumes one queue for the life of the process.
#[async_trait]
pub(crate) trait Consumer: Send + Sync + 'static {
    /// Label for logs.
    fn name(&self) -> &str;

    /// Lease a channel, declare what is needed, start consuming.
    async fn subscribe(&self) -> Result<Subscription>;

    /// Process one delivery. Must settle it when the consumer acks manually.
    async fn handle(&self, channel: &ChannelPtr, delivery: Delivery);
}

/// Run `consumer` in the background, starting from an established subscription.
pub(crate) fn spawn_supervised<C: Consumer>(
    consumer: Arc<C>,
    first: Subscription,
    reconnect: ReconnectConfig,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(supervise(consumer, first, reconnect, shutdown))
}

async fn supervise<C: Consumer>(
    consumer: Arc<C>,
    first: Subscription,
    reconnect: ReconnectConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut backoff = ConsumerBackoff::new(&reconnect);
    let mut next = Some(first);

    loop {
        let subscription = match next.take() {
            Some(subscription) => subscription,
            None => match consumer.subscribe().await {
                Ok(subscription) => {
                    info!(consumer = %consumer.name(), "Consumer re-established");
                    backoff.reset();
                    subscription
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    error!(
                        consumer = %consumer.name(),
                        error = %e,
                        backoff_ms = %delay.as_millis(),
                        "Failed to set up consumer, retrying after backoff"
                    );
                    if sleep_or_shutdown(delay, &mut shutdown).await {
                        break;
                    }
                    continue;
                }
            },
        };

        if run(consumer.as_ref(), subscription, &mut shutdown).await {
            break;
        }

        let delay = backoff.next_delay();
        warn!(
            consumer = %consumer.name(),
            backoff_ms = %delay.as_millis(),
            "Consumer stream ended, reconnecting..."
        );
        if sleep_or_shutdown(delay, &mut shutdown).await {
            break;
        }
    }

    info!(consumer = %consumer.name(), "Consumer stopped");
}

/// Drain one subscription. Returns `true` if shutdown was requested.
async fn run<C: Consumer>(
    consumer: &C,
    subscription: Subscription,
    shutdown: &mut watch::Receiver<bool>,
) -> bool {
    let Subscription {
        channel,
        mut deliveries,
    } = subscription;

    let stopped = loop {
        let next = tokio::select! {
            _ = shutdown_requested(shutdown) => break true,
            next = deliveries.next() => next,
        };

        match next {
            // A handler stuck at shutdown is abandoned. Closing the channel returns its
            // unacked delivery to the queue.
            Some(Ok(delivery)) => tokio::select! {
                _ = shutdown_requested(shutdown) => break true,
                _ = consumer.handle(&channel, delivery) => {}
            },
            Some(Err(e)) => {
                error!(consumer = %consumer.name(), error = %e, "Consumer delivery error, will reconnect");
                break false;
            }
            None => break false,
        }
    };

    drop(deliveries);
    if let Err(e) = channel.close().await {
        debug!(consumer = %consumer.name(), error = %e, "Channel close failed");
    }
    stopped
}

/// Resolves once shutdown is requested or the bus that owns the sender is gone.
pub(crate) async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Returns `true` if shutdown was requested before the delay elapsed.
async fn sleep_or_shutdown(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = shutdown_requested(shutdown) => true,
        _ = tokio::time::sleep(delay) => false,
    }
}

/// Best-effort text of a caught panic.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
