//! In-memory broker for standalone mode and tests.
//!
//! Emulates the subset of AMQP the bus relies on: topic/direct exchanges,
//! bindings, named and broker-named queues, exclusive queues that vanish with
//! their channel, default-exchange routing by queue name, manual ack with
//! requeue. Deliveries a channel never acked return to the head of their
//! queue when it closes. Several `MemoryTransport`s sharing one `MemoryBroker` behave like
//! services connected to the same RabbitMQ.
//!
//! Prefetch limits are recorded but not enforced.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::StreamExt;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use super::{
    Acker, BrokerChannel, ChannelPtr, ConnectionState, ConsumeOptions, Delivery, DeliveryStream,
    ExchangeKind, MessageProperties, QueueOptions, Result, Transport, TransportError,
    DEFAULT_EXCHANGE,
};

/// Check whether a routing key matches a binding pattern.
///
/// Matching rules (AMQP topic semantics):
/// - words are separated by `.`
/// - `*` matches exactly one word
/// - `#` matches zero or more words
fn routing_key_matches(pattern: &str, key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = key.split('.').collect();
    words_match(&pattern, &key)
}

fn words_match(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| words_match(rest, &key[skip..])),
        Some((&word, rest)) => match key.split_first() {
            Some((first, key_rest)) if word == "*" || word == *first => words_match(rest, key_rest),
            _ => false,
        },
    }
}

#[derive(Clone)]
struct QueuedMessage {
    data: Vec<u8>,
    routing_key: String,
    properties: MessageProperties,
}

struct Binding {
    queue: String,
    routing_key: String,
}

struct Exchange {
    kind: ExchangeKind,
    bindings: Vec<Binding>,
}

impl Exchange {
    fn routes_to(&self, routing_key: &str) -> Vec<String> {
        let mut targets: Vec<String> = Vec::new();
        for binding in &self.bindings {
            let matched = match self.kind {
                ExchangeKind::Direct => binding.routing_key == routing_key,
                ExchangeKind::Topic => routing_key_matches(&binding.routing_key, routing_key),
            };
            if matched && !targets.contains(&binding.queue) {
                targets.push(binding.queue.clone());
            }
        }
        targets
    }
}

struct Consumer {
    channel: u64,
    auto_ack: bool,
    sender: mpsc::UnboundedSender<(Option<u64>, QueuedMessage)>,
}

/// A message handed to a manual-ack consumer and not yet settled.
struct Unacked {
    channel: u64,
    queue: String,
    message: QueuedMessage,
}

/// Outstanding deliveries keyed by delivery tag. Tags grow monotonically, so
/// iteration order is delivery order.
#[derive(Default)]
struct UnackedTable {
    entries: BTreeMap<u64, Unacked>,
    next_tag: u64,
}

impl UnackedTable {
    fn track(&mut self, channel: u64, queue: &str, message: QueuedMessage) -> u64 {
        self.next_tag += 1;
        self.entries.insert(
            self.next_tag,
            Unacked {
                channel,
                queue: queue.to_string(),
                message,
            },
        );
        self.next_tag
    }

    fn settle(&mut self, tag: u64) -> Option<Unacked> {
        self.entries.remove(&tag)
    }

    /// Remove and return everything outstanding on `channel`, oldest first.
    fn take_channel(&mut self, channel: u64) -> Vec<Unacked> {
        let tags: Vec<u64> = self
            .entries
            .iter()
            .filter(|(_, u)| u.channel == channel)
            .map(|(tag, _)| *tag)
            .collect();
        tags.into_iter()
            .filter_map(|tag| self.entries.remove(&tag))
            .collect()
    }

    fn count_for(&self, queue: &str) -> usize {
        self.entries.values().filter(|u| u.queue == queue).count()
    }
}

struct Queue {
    options: QueueOptions,
    owner: Option<u64>,
    consumer: Option<Consumer>,
    backlog: VecDeque<QueuedMessage>,
}

impl Queue {
    /// Hand a message to the consumer, or park it until one shows up.
    ///
    /// Messages sent to a manual-ack consumer are tracked from the moment they
    /// enter its buffer, so they survive the consumer going away unread.
    fn push(&mut self, name: &str, message: QueuedMessage, unacked: &mut UnackedTable) {
        if let Some(consumer) = &self.consumer {
            let tag = (!consumer.auto_ack)
                .then(|| unacked.track(consumer.channel, name, message.clone()));
            match consumer.sender.send((tag, message)) {
                Ok(()) => return,
                Err(mpsc::error::SendError((tag, message))) => {
                    // Consumer stream was dropped without closing the channel.
                    if let Some(tag) = tag {
                        unacked.settle(tag);
                    }
                    self.consumer = None;
                    self.backlog.push_back(message);
                    return;
                }
            }
        }
        self.backlog.push_back(message);
    }
}

#[derive(Default)]
struct ChannelState {
    prefetch: Option<u16>,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, Exchange>,
    queues: HashMap<String, Queue>,
    channels: HashMap<u64, ChannelState>,
    unacked: UnackedTable,
    offline: bool,
}

impl BrokerState {
    fn delete_queue(&mut self, name: &str) {
        if self.queues.remove(name).is_some() {
            for exchange in self.exchanges.values_mut() {
                exchange.bindings.retain(|b| b.queue != name);
            }
            debug!(queue = %name, "Deleted queue");
        }
    }

    /// Drop everything a channel owns: consumers, exclusive queues, and
    /// auto-delete queues it was consuming. Deliveries it never settled go
    /// back to the head of their queues.
    fn release_channel(&mut self, channel: u64) {
        if self.channels.remove(&channel).is_none() {
            return;
        }

        let mut doomed = Vec::new();
        for (name, queue) in self.queues.iter_mut() {
            let consumed_here = queue
                .consumer
                .as_ref()
                .is_some_and(|c| c.channel == channel);
            if consumed_here {
                queue.consumer = None;
            }
            if queue.owner == Some(channel) || (consumed_here && queue.options.auto_delete) {
                doomed.push(name.clone());
            }
        }

        let returned = self.unacked.take_channel(channel);
        if !returned.is_empty() {
            debug!(channel, count = returned.len(), "Returning unacked deliveries");
        }
        let mut touched: Vec<String> = Vec::new();
        for unacked in returned.into_iter().rev() {
            if doomed.contains(&unacked.queue) {
                continue;
            }
            if let Some(queue) = self.queues.get_mut(&unacked.queue) {
                queue.backlog.push_front(unacked.message);
                if !touched.contains(&unacked.queue) {
                    touched.push(unacked.queue);
                }
            }
        }

        for name in doomed {
            self.delete_queue(&name);
        }
        for name in touched {
            self.flush(&name);
        }
    }

    /// Move a queue's backlog to its consumer, if it has one.
    fn flush(&mut self, name: &str) {
        let Self { queues, unacked, .. } = self;
        if let Some(queue) = queues.get_mut(name) {
            if queue.consumer.is_none() {
                return;
            }
            for message in std::mem::take(&mut queue.backlog) {
                queue.push(name, message, unacked);
            }
        }
    }

    fn deliver(&mut self, queue: &str, message: QueuedMessage) -> bool {
        let Self { queues, unacked, .. } = self;
        match queues.get_mut(queue) {
            Some(q) => {
                q.push(queue, message, unacked);
                true
            }
            None => false,
        }
    }

    /// Settle a delivery. Returns false if the tag is unknown, which happens
    /// once its channel has closed and the message went back to the queue.
    fn settle(&mut self, tag: u64, requeue: bool) -> bool {
        match self.unacked.settle(tag) {
            Some(unacked) => {
                if requeue && !self.deliver(&unacked.queue, unacked.message) {
                    debug!(queue = %unacked.queue, "Requeue target gone, message dropped");
                }
                true
            }
            None => false,
        }
    }
}

/// Shared in-process broker.
pub struct MemoryBroker {
    state: Mutex<BrokerState>,
    next_channel: AtomicU64,
    readiness: watch::Sender<ConnectionState>,
}

impl MemoryBroker {
    /// Create a new, empty broker.
    pub fn new() -> Arc<Self> {
        let (readiness, _) = watch::channel(ConnectionState::Ready);
        Arc::new(Self {
            state: Mutex::new(BrokerState::default()),
            next_channel: AtomicU64::new(1),
            readiness,
        })
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        // State stays consistent between statements, so a poisoned lock is still usable.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Simulate losing (or regaining) the broker.
    ///
    /// Going offline closes every open channel: consumers end, exclusive
    /// queues disappear, and new channels cannot be opened until the broker
    /// is back.
    pub fn set_offline(&self, offline: bool) {
        let mut state = self.lock();
        state.offline = offline;
        if offline {
            let channels: Vec<u64> = state.channels.keys().copied().collect();
            for channel in channels {
                state.release_channel(channel);
            }
            self.readiness.send_replace(ConnectionState::Disconnected);
            warn!("Memory broker offline");
        } else {
            self.readiness.send_replace(ConnectionState::Ready);
            info!("Memory broker online");
        }
    }

    fn open(&self) -> Result<u64> {
        let mut state = self.lock();
        if state.offline {
            return Err(TransportError::Connection("memory broker offline".to_string()));
        }
        let id = self.next_channel.fetch_add(1, Ordering::SeqCst);
        state.channels.insert(id, ChannelState::default());
        Ok(id)
    }

    fn release(&self, channel: u64) {
        self.lock().release_channel(channel);
    }

    /// Lock state for an operation on behalf of `channel`, failing if the
    /// channel has been closed.
    fn lock_for(&self, channel: u64) -> Result<MutexGuard<'_, BrokerState>> {
        let state = self.lock();
        if state.channels.contains_key(&channel) {
            Ok(state)
        } else {
            Err(TransportError::Closed)
        }
    }

    /// Number of open channels.
    pub fn open_channels(&self) -> usize {
        self.lock().channels.len()
    }

    /// Whether a queue currently exists.
    pub fn queue_exists(&self, name: &str) -> bool {
        self.lock().queues.contains_key(name)
    }

    /// Names of all existing queues.
    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().queues.keys().cloned().collect();
        names.sort();
        names
    }

    /// Messages waiting in a queue for a consumer.
    pub fn queue_depth(&self, name: &str) -> usize {
        self.lock().queues.get(name).map_or(0, |q| q.backlog.len())
    }

    /// Messages from a queue handed to a consumer but not yet acked.
    pub fn unacked(&self, queue: &str) -> usize {
        self.lock().unacked.count_for(queue)
    }

    /// `(queue, routing_key)` pairs bound to an exchange.
    pub fn bindings(&self, exchange: &str) -> Vec<(String, String)> {
        self.lock()
            .exchanges
            .get(exchange)
            .map(|e| {
                e.bindings
                    .iter()
                    .map(|b| (b.queue.clone(), b.routing_key.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Prefetch limits set on currently open channels.
    pub fn prefetch_limits(&self) -> Vec<u16> {
        self.lock()
            .channels
            .values()
            .filter_map(|c| c.prefetch)
            .collect()
    }
}

/// Transport connected to a `MemoryBroker`.
pub struct MemoryTransport {
    broker: Arc<MemoryBroker>,
}

impl MemoryTransport {
    pub fn new(broker: Arc<MemoryBroker>) -> Self {
        Self { broker }
    }

    pub fn broker(&self) -> &Arc<MemoryBroker> {
        &self.broker
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn open_channel(&self) -> Result<ChannelPtr> {
        let id = self.broker.open()?;
        debug!(channel = id, "Opened memory channel");
        Ok(Arc::new(MemoryChannel {
            id,
            broker: Arc::clone(&self.broker),
        }))
    }

    fn state(&self) -> watch::Receiver<ConnectionState> {
        self.broker.readiness.subscribe()
    }
}

/// Channel on a `MemoryBroker`.
pub struct MemoryChannel {
    id: u64,
    broker: Arc<MemoryBroker>,
}

impl Drop for MemoryChannel {
    fn drop(&mut self) {
        self.broker.release(self.id);
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind, _durable: bool) -> Result<()> {
        let mut state = self.broker.lock_for(self.id)?;
        match state.exchanges.get(name) {
            Some(existing) if existing.kind != kind => Err(TransportError::Declare(format!(
                "exchange '{}' already declared as {:?}",
                name, existing.kind
            ))),
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(
                    name.to_string(),
                    Exchange {
                        kind,
                        bindings: Vec::new(),
                    },
                );
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<String> {
        let mut state = self.broker.lock_for(self.id)?;
        let name = if name.is_empty() {
            format!("amq.gen-{}", uuid::Uuid::new_v4().simple())
        } else {
            name.to_string()
        };

        if let Some(existing) = state.queues.get(&name) {
            return match existing.owner {
                Some(owner) if owner != self.id => Err(TransportError::Declare(format!(
                    "queue '{}' is exclusive to another channel",
                    name
                ))),
                _ => Ok(name),
            };
        }

        state.queues.insert(
            name.clone(),
            Queue {
                options,
                owner: options.exclusive.then_some(self.id),
                consumer: None,
                backlog: VecDeque::new(),
            },
        );
        Ok(name)
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        let mut state = self.broker.lock_for(self.id)?;
        if !state.queues.contains_key(queue) {
            return Err(TransportError::Declare(format!("no queue '{}'", queue)));
        }
        let exchange = state
            .exchanges
            .get_mut(exchange)
            .ok_or_else(|| TransportError::Declare(format!("no exchange '{}'", exchange)))?;

        let already_bound = exchange
            .bindings
            .iter()
            .any(|b| b.queue == queue && b.routing_key == routing_key);
        if !already_bound {
            exchange.bindings.push(Binding {
                queue: queue.to_string(),
                routing_key: routing_key.to_string(),
            });
        }
        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> Result<()> {
        let mut state = self.broker.lock_for(self.id)?;
        if let Some(channel) = state.channels.get_mut(&self.id) {
            channel.prefetch = Some(count);
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: MessageProperties,
    ) -> Result<()> {
        let mut state = self.broker.lock_for(self.id)?;
        let message = QueuedMessage {
            data: payload.to_vec(),
            routing_key: routing_key.to_string(),
            properties,
        };

        let targets = if exchange == DEFAULT_EXCHANGE {
            vec![routing_key.to_string()]
        } else {
            state
                .exchanges
                .get(exchange)
                .ok_or_else(|| TransportError::Publish(format!("no exchange '{}'", exchange)))?
                .routes_to(routing_key)
        };

        let mut delivered = 0;
        for queue in targets {
            if state.deliver(&queue, message.clone()) {
                delivered += 1;
            }
        }

        if delivered == 0 {
            debug!(exchange = %exchange, routing_key = %routing_key, "Unroutable message dropped");
        }
        Ok(())
    }

    async fn consume(&self, queue: &str, options: ConsumeOptions) -> Result<DeliveryStream> {
        let mut state = self.broker.lock_for(self.id)?;
        let q = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| TransportError::Consume(format!("no queue '{}'", queue)))?;

        if q.consumer.as_ref().is_some_and(|c| !c.sender.is_closed()) {
            return Err(TransportError::Consume(format!(
                "queue '{}' already has a consumer",
                queue
            )));
        }
        if let (Some(owner), true) = (q.owner, q.options.exclusive) {
            if owner != self.id {
                return Err(TransportError::Consume(format!(
                    "queue '{}' is exclusive to another channel",
                    queue
                )));
            }
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        q.consumer = Some(Consumer {
            channel: self.id,
            auto_ack: options.auto_ack,
            sender,
        });
        state.flush(queue);

        debug!(queue = %queue, consumer_tag = %options.consumer_tag, "Memory consumer started");

        let broker = Arc::downgrade(&self.broker);

        let stream = futures::stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|message| (message, receiver))
        })
        .map(move |(tag, message)| {
            let acker: Option<Box<dyn Acker>> = tag.map(|tag| {
                Box::new(MemoryAcker {
                    broker: broker.clone(),
                    tag,
                }) as Box<dyn Acker>
            });
            Ok(Delivery {
                data: message.data,
                routing_key: message.routing_key,
                properties: message.properties,
                acker,
            })
        });

        Ok(stream.boxed())
    }

    async fn close(&self) -> Result<()> {
        self.broker.release(self.id);
        debug!(channel = self.id, "Closed memory channel");
        Ok(())
    }
}

struct MemoryAcker {
    broker: Weak<MemoryBroker>,
    tag: u64,
}

impl MemoryAcker {
    fn settle(&self, requeue: bool) -> Result<()> {
        let broker = self.broker.upgrade().ok_or(TransportError::Closed)?;
        if broker.lock().settle(self.tag, requeue) {
            Ok(())
        } else {
            Err(TransportError::Ack(format!(
                "unknown delivery tag {}, channel already closed",
                self.tag
            )))
        }
    }
}

impl Acker for MemoryAcker {
    fn ack(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move { self.settle(false) })
    }

    fn reject(&self, requeue: bool) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move { self.settle(requeue) })
    }
}
