//! RPC caller: publishes requests and correlates replies.
//!
//! Every outcome a remote call can have (reply, timeout, cancellation, lost
//! reply consumer) resolves to an `RpcResponse`. `Err` is reserved for local
//! failures setting the call up.
//!
//! Replies are matched on correlation ID. Anything else arriving on the reply
//! queue is ignored, so a stray reply can never resolve, or fail, the wrong
//! call.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::envelope::{self, RpcError, RpcRequest, RpcResponse};
use super::{BusError, Result};
use crate::config::{MessagingConfig, ReplyMode};
use crate::transport::{
    self, ChannelManager, ChannelPtr, ConsumeOptions, DeliveryStream, MessageProperties,
    QueueOptions, TransportError, DEFAULT_EXCHANGE,
};

/// Per-call knobs.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Overrides the configured reply timeout.
    pub timeout: Option<Duration>,
    /// The call resolves `cancelled` once this reads `true`.
    pub cancel: Option<watch::Receiver<bool>>,
}

impl CallOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cancel(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

/// Body of a matched reply, or `unknown` if it is not a response.
fn parse_reply(data: &[u8]) -> RpcResponse {
    match envelope::decode::<RpcResponse>(data) {
        Ok(response) => response,
        Err(e) => {
            warn!(error = %e, "Malformed RPC response");
            RpcResponse::error(RpcError::unknown().with_msg("malformed response"))
        }
    }
}

/// Wait on a reply stream for the reply carrying `correlation_id`.
///
/// Replies for other correlation IDs are skipped. If the stream ends first
/// the call resolves `disconnected`.
pub(crate) async fn await_reply(replies: &mut DeliveryStream, correlation_id: &str) -> RpcResponse {
    while let Some(delivery) = replies.next().await {
        match delivery {
            Ok(delivery) if delivery.properties.correlation_id.as_deref() == Some(correlation_id) => {
                return parse_reply(&delivery.data);
            }
            Ok(delivery) => {
                debug!(
                    expected = %correlation_id,
                    received = ?delivery.properties.correlation_id,
                    "Ignoring reply for another call"
                );
            }
            Err(e) => {
                warn!(error = %e, "Reply consumer failed");
                break;
            }
        }
    }
    RpcResponse::error(RpcError::disconnected())
}

enum Race<T> {
    Finished(T),
    TimedOut,
    Cancelled,
}

async fn cancelled(cancel: &mut Option<watch::Receiver<bool>>) {
    match cancel {
        Some(cancel) => {
            let sender_gone = cancel.wait_for(|cancelled| *cancelled).await.is_err();
            if sender_gone {
                // Nobody can cancel any more.
                std::future::pending::<()>().await;
            }
        }
        None => std::future::pending::<()>().await,
    }
}

async fn race<T>(
    work: impl Future<Output = T>,
    deadline: Instant,
    cancel: &mut Option<watch::Receiver<bool>>,
) -> Race<T> {
    tokio::select! {
        biased;
        _ = cancelled(cancel) => Race::Cancelled,
        out = work => Race::Finished(out),
        _ = tokio::time::sleep_until(deadline) => Race::TimedOut,
    }
}

fn is_cancelled(cancel: &Option<watch::Receiver<bool>>) -> bool {
    cancel.as_ref().is_some_and(|cancel| *cancel.borrow())
}

fn setup_task_failed(e: JoinError) -> BusError {
    TransportError::Channel(format!("channel setup task failed: {}", e)).into()
}

/// Close a channel whose lease outlived the call that asked for it.
fn close_when_leased(lease: JoinHandle<transport::Result<ChannelPtr>>) {
    tokio::spawn(async move {
        if let Ok(Ok(channel)) = lease.await {
            debug!("Closing channel leased after its call ended");
            if let Err(e) = channel.close().await {
                debug!(error = %e, "Failed to close RPC channel");
            }
        }
    });
}

#[derive(Default)]
struct PendingCalls {
    closed: bool,
    calls: HashMap<String, oneshot::Sender<RpcResponse>>,
}

/// One reply queue shared by every call this caller makes.
struct SharedReplies {
    queue: String,
    channel: ChannelPtr,
    pending: Arc<StdMutex<PendingCalls>>,
}

impl SharedReplies {
    async fn open(channels: &ChannelManager, consumer_tag: String) -> Result<Self> {
        let channel = channels.lease().await?;
        let queue = channel.declare_queue("", QueueOptions::exclusive()).await?;
        let replies = channel
            .consume(&queue, ConsumeOptions::auto_ack(consumer_tag))
            .await?;

        let pending = Arc::new(StdMutex::new(PendingCalls::default()));
        tokio::spawn(route_replies(queue.clone(), replies, Arc::clone(&pending)));

        info!(queue = %queue, "Shared reply queue ready");
        Ok(Self {
            queue,
            channel,
            pending,
        })
    }

    fn is_open(&self) -> bool {
        !lock(&self.pending).closed
    }

    /// Register a call. `None` if the reply consumer has already gone away.
    fn register(&self, correlation_id: &str) -> Option<oneshot::Receiver<RpcResponse>> {
        let mut pending = lock(&self.pending);
        if pending.closed {
            return None;
        }
        let (tx, rx) = oneshot::channel();
        pending.calls.insert(correlation_id.to_string(), tx);
        Some(rx)
    }

    fn forget(&self, correlation_id: &str) {
        lock(&self.pending).calls.remove(correlation_id);
    }
}

fn lock(pending: &StdMutex<PendingCalls>) -> std::sync::MutexGuard<'_, PendingCalls> {
    pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Deliver replies to the calls waiting for them.
async fn route_replies(
    queue: String,
    mut replies: DeliveryStream,
    pending: Arc<StdMutex<PendingCalls>>,
) {
    while let Some(delivery) = replies.next().await {
        let delivery = match delivery {
            Ok(delivery) => delivery,
            Err(e) => {
                warn!(queue = %queue, error = %e, "Shared reply consumer failed");
                break;
            }
        };

        let waiter = delivery
            .properties
            .correlation_id
            .as_deref()
            .and_then(|id| lock(&pending).calls.remove(id));

        match waiter {
            // Receiver may have timed out in the meantime.
            Some(waiter) => {
                let _ = waiter.send(parse_reply(&delivery.data));
            }
            None => debug!(
                queue = %queue,
                received = ?delivery.properties.correlation_id,
                "Ignoring reply with no pending call"
            ),
        }
    }

    let orphaned: Vec<_> = {
        let mut pending = lock(&pending);
        pending.closed = true;
        pending.calls.drain().map(|(_, waiter)| waiter).collect()
    };
    warn!(queue = %queue, pending = orphaned.len(), "Shared reply queue closed");
    for waiter in orphaned {
        let _ = waiter.send(RpcResponse::error(RpcError::disconnected()));
    }
}

/// Removes a call from the pending table however the call ends.
struct PendingGuard<'a> {
    replies: &'a SharedReplies,
    correlation_id: &'a str,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.replies.forget(self.correlation_id);
    }
}

/// Issues RPC calls.
pub struct RpcCaller {
    channels: ChannelManager,
    service: String,
    default_timeout: Duration,
    mode: ReplyMode,
    shared: Arc<Mutex<Option<Arc<SharedReplies>>>>,
}

impl RpcCaller {
    pub fn new(config: &MessagingConfig, channels: ChannelManager) -> Self {
        Self {
            channels,
            service: config.service.clone(),
            default_timeout: config.rpc_timeout(),
            mode: config.rpc.reply_mode,
            shared: Arc::new(Mutex::new(None)),
        }
    }

    pub fn reply_mode(&self) -> ReplyMode {
        self.mode
    }

    /// Send `request` to `target_queue` and wait for the reply.
    #[tracing::instrument(
        name = "bus.rpc",
        skip_all,
        fields(
            target = %target_queue,
            action = %request.action,
            correlation_id = tracing::field::Empty
        )
    )]
    pub async fn call<T: serde::Serialize>(
        &self,
        target_queue: &str,
        request: &RpcRequest<T>,
        options: CallOptions,
    ) -> Result<RpcResponse> {
        let timeout = options.timeout.unwrap_or(self.default_timeout);
        let deadline = Instant::now() + timeout;
        let mut cancel = options.cancel;

        if is_cancelled(&cancel) {
            return Ok(RpcResponse::error(RpcError::cancelled()));
        }

        let body = envelope::encode(request)?;
        let correlation_id = Uuid::new_v4().to_string();
        tracing::Span::current().record("correlation_id", correlation_id.as_str());

        let response = match self.mode {
            ReplyMode::PerCall => {
                self.call_per_call(target_queue, &body, &correlation_id, deadline, &mut cancel)
                    .await?
            }
            ReplyMode::Shared => {
                self.call_shared(target_queue, &body, &correlation_id, deadline, &mut cancel)
                    .await?
            }
        };

        match &response.err {
            Some(err) if err.is_timeout() => {
                warn!(timeout_ms = timeout.as_millis() as u64, "RPC call timed out")
            }
            Some(err) => debug!(code = err.code, reason = %err.reason, "RPC call returned error"),
            None => debug!("RPC call succeeded"),
        }
        Ok(response)
    }

    /// Fresh reply queue on a leased channel; the channel is closed however the call ends.
    async fn call_per_call(
        &self,
        target_queue: &str,
        body: &[u8],
        correlation_id: &str,
        deadline: Instant,
        cancel: &mut Option<watch::Receiver<bool>>,
    ) -> Result<RpcResponse> {
        // Opening runs on its own task so a channel that arrives late can still be closed.
        let mut lease = tokio::spawn({
            let channels = self.channels.clone();
            async move { channels.lease().await }
        });
        let channel = match race(&mut lease, deadline, cancel).await {
            Race::Finished(joined) => joined.map_err(setup_task_failed)??,
            Race::TimedOut => {
                close_when_leased(lease);
                return Ok(RpcResponse::timeout());
            }
            Race::Cancelled => {
                close_when_leased(lease);
                return Ok(RpcResponse::error(RpcError::cancelled()));
            }
        };

        let exchange = self.exchange_on(&channel, target_queue, body, correlation_id);
        let outcome = match race(exchange, deadline, cancel).await {
            Race::Finished(response) => response,
            Race::TimedOut => Ok(RpcResponse::timeout()),
            Race::Cancelled => Ok(RpcResponse::error(RpcError::cancelled())),
        };

        if let Err(e) = channel.close().await {
            debug!(error = %e, "Failed to close RPC channel");
        }
        outcome
    }

    async fn exchange_on(
        &self,
        channel: &ChannelPtr,
        target_queue: &str,
        body: &[u8],
        correlation_id: &str,
    ) -> Result<RpcResponse> {
        let reply_queue = channel.declare_queue("", QueueOptions::exclusive()).await?;
        let mut replies = channel
            .consume(
                &reply_queue,
                ConsumeOptions::auto_ack(format!("{}-rpc-{}", self.service, correlation_id)),
            )
            .await?;

        channel
            .publish(
                DEFAULT_EXCHANGE,
                target_queue,
                body,
                MessageProperties::json()
                    .with_correlation_id(correlation_id)
                    .with_reply_to(reply_queue.as_str()),
            )
            .await?;
        debug!(reply_to = %reply_queue, "RPC request published");

        Ok(await_reply(&mut replies, correlation_id).await)
    }

    async fn call_shared(
        &self,
        target_queue: &str,
        body: &[u8],
        correlation_id: &str,
        deadline: Instant,
        cancel: &mut Option<watch::Receiver<bool>>,
    ) -> Result<RpcResponse> {
        // If the call gives up first, setup carries on and parks the queue for later calls.
        let replies = match race(self.shared_replies(), deadline, cancel).await {
            Race::Finished(joined) => joined.map_err(setup_task_failed)??,
            Race::TimedOut => return Ok(RpcResponse::timeout()),
            Race::Cancelled => return Ok(RpcResponse::error(RpcError::cancelled())),
        };

        let Some(reply) = replies.register(correlation_id) else {
            return Ok(RpcResponse::error(RpcError::disconnected()));
        };
        let _guard = PendingGuard {
            replies: replies.as_ref(),
            correlation_id,
        };

        replies
            .channel
            .publish(
                DEFAULT_EXCHANGE,
                target_queue,
                body,
                MessageProperties::json()
                    .with_correlation_id(correlation_id)
                    .with_reply_to(replies.queue.as_str()),
            )
            .await?;
        debug!(reply_to = %replies.queue, "RPC request published");

        Ok(match race(reply, deadline, cancel).await {
            Race::Finished(Ok(response)) => response,
            Race::Finished(Err(_)) => RpcResponse::error(RpcError::disconnected()),
            Race::TimedOut => RpcResponse::timeout(),
            Race::Cancelled => RpcResponse::error(RpcError::cancelled()),
        })
    }

    /// The shared reply queue, created on first use and after its consumer dies.
    fn shared_replies(&self) -> JoinHandle<Result<Arc<SharedReplies>>> {
        let channels = self.channels.clone();
        let shared = Arc::clone(&self.shared);
        let consumer_tag = format!("{}-rpc-replies", self.service);

        tokio::spawn(async move {
            let mut slot = shared.lock().await;
            if let Some(replies) = slot.as_ref() {
                if replies.is_open() {
                    return Ok(Arc::clone(replies));
                }
                let _ = replies.channel.close().await;
            }
            let replies = Arc::new(SharedReplies::open(&channels, consumer_tag).await?);
            *slot = Some(Arc::clone(&replies));
            Ok(replies)
        })
    }

    /// Name of the shared reply queue, if one is open.
    pub async fn shared_reply_queue(&self) -> Option<String> {
        self.shared
            .lock()
            .await
            .as_ref()
            .filter(|replies| replies.is_open())
            .map(|replies| replies.queue.clone())
    }

    /// Close the shared reply queue. Pending shared calls resolve `disconnected`.
    pub async fn close(&self) {
        if let Some(replies) = self.shared.lock().await.take() {
            if let Err(e) = replies.channel.close().await {
                debug!(error = %e, "Failed to close shared reply channel");
            }
        }
    }
}
