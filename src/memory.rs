// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # In-Memory Broker
//!
//! An in-process broker implementing the transport traits with RabbitMQ's
//! observable semantics for the primitives this crate uses:
//!
//! - direct, fanout and topic routing, plus the default exchange
//! - idempotent queue declaration, PRECONDITION_FAILED style conflicts
//! - per-channel prefetch, round-robin dispatch between consumers
//! - ack, nack with requeue (front of the queue, flagged redelivered) and nack
//!   without requeue (routed to the queue's dead-letter exchange)
//! - unacked deliveries requeued when their channel closes, auto-delete and
//!   exclusive queues removed with their consumers and connection
//!
//! Every broker call is recorded as a [`BrokerOperation`] and failures can be
//! injected per operation, so topology and flow-control paths are testable
//! without a running RabbitMQ.

use crate::{
    broker::{
        AmqpChannel, AmqpConnection, Delivery, DeliveryAcker, DeliveryStream, MessageProperties,
        QueueDescriptor,
    },
    errors::AmqpError,
    exchange::{ExchangeDefinition, ExchangeKind},
    queue::{QueueDefinition, QueueOptions, AMQP_HEADERS_DEAD_LETTER_EXCHANGE},
};
use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use std::{
    collections::{BTreeMap, HashMap, HashSet, VecDeque},
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
};
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

/// Header naming the queue a dead-lettered message was rejected from
pub const HEADER_FIRST_DEATH_QUEUE: &str = "x-first-death-queue";
/// Header naming why a message was dead-lettered
pub const HEADER_FIRST_DEATH_REASON: &str = "x-first-death-reason";

/// A broker call, as recorded by [`MemoryBroker::operations`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerOperation {
    OpenChannel,
    ExchangeDeclare { exchange: String },
    QueueDeclare { queue: String },
    QueueBind { queue: String, exchange: String, key: String },
    Qos { prefetch_count: u16, global: bool },
    Publish { exchange: String, routing_key: String },
    Consume { queue: String },
    Ack { delivery_tag: u64 },
    Nack { delivery_tag: u64, requeue: bool },
    CloseChannel,
}

/// Broker calls that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailurePoint {
    OpenChannel,
    QueueDeclare,
    QueueBind,
    Qos,
    Publish,
    Consume,
}

/// A message sitting in a queue or waiting for its resolution.
#[derive(Debug, Clone)]
struct StoredMessage {
    exchange: String,
    routing_key: String,
    properties: MessageProperties,
    payload: Vec<u8>,
    redelivered: bool,
}

#[derive(Debug)]
struct MemoryQueue {
    options: QueueOptions,
    arguments: BTreeMap<String, String>,
    ready: VecDeque<StoredMessage>,
    consumers: Vec<u64>,
    next_consumer: usize,
    had_consumer: bool,
    peak_unacked: usize,
}

impl MemoryQueue {
    fn new(def: &QueueDefinition) -> Self {
        MemoryQueue {
            options: def.options,
            arguments: def.arguments.clone(),
            ready: VecDeque::new(),
            consumers: vec![],
            next_consumer: 0,
            had_consumer: false,
            peak_unacked: 0,
        }
    }
}

struct MemoryConsumer {
    queue: String,
    channel_id: u64,
    outstanding: usize,
    sender: mpsc::UnboundedSender<Result<Delivery, AmqpError>>,
}

struct Unacked {
    queue: String,
    consumer_id: u64,
    message: StoredMessage,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct BindingRecord {
    exchange: String,
    queue: String,
    key: String,
}

#[derive(Default)]
struct ChannelState {
    prefetch: Option<u16>,
    open: bool,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeKind>,
    queues: HashMap<String, MemoryQueue>,
    bindings: Vec<BindingRecord>,
    channels: HashMap<u64, ChannelState>,
    consumers: HashMap<u64, MemoryConsumer>,
    unacked: BTreeMap<u64, Unacked>,
    operations: Vec<BrokerOperation>,
    failures: HashSet<FailurePoint>,
    next_id: u64,
    closed: bool,
}

type SharedState = Arc<Mutex<BrokerState>>;

fn lock(state: &Mutex<BrokerState>) -> MutexGuard<'_, BrokerState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// In-process broker. Cloning shares the same broker state.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: SharedState,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every later call of `point` fail with a `TransportError`.
    pub fn fail(&self, point: FailurePoint) {
        lock(&self.state).failures.insert(point);
    }

    pub fn recover(&self, point: FailurePoint) {
        lock(&self.state).failures.remove(&point);
    }

    /// Every broker call made so far, in order.
    pub fn operations(&self) -> Vec<BrokerOperation> {
        lock(&self.state).operations.clone()
    }

    pub fn clear_operations(&self) {
        lock(&self.state).operations.clear();
    }

    /// Channels opened and not yet closed.
    pub fn open_channels(&self) -> usize {
        lock(&self.state)
            .channels
            .values()
            .filter(|c| c.open)
            .count()
    }

    pub fn queue_exists(&self, queue: &str) -> bool {
        lock(&self.state).queues.contains_key(queue)
    }

    pub fn queue_options(&self, queue: &str) -> Option<QueueOptions> {
        lock(&self.state).queues.get(queue).map(|q| q.options)
    }

    pub fn queue_arguments(&self, queue: &str) -> Option<BTreeMap<String, String>> {
        lock(&self.state)
            .queues
            .get(queue)
            .map(|q| q.arguments.clone())
    }

    /// Messages ready for delivery, excluding the unacknowledged ones.
    pub fn ready_count(&self, queue: &str) -> usize {
        lock(&self.state)
            .queues
            .get(queue)
            .map(|q| q.ready.len())
            .unwrap_or_default()
    }

    /// Deliveries pushed from `queue` and not yet resolved.
    pub fn unacked_count(&self, queue: &str) -> usize {
        lock(&self.state)
            .unacked
            .values()
            .filter(|u| u.queue == queue)
            .count()
    }

    /// The highest number of unresolved deliveries `queue` ever had at once.
    pub fn peak_unacked(&self, queue: &str) -> usize {
        lock(&self.state)
            .queues
            .get(queue)
            .map(|q| q.peak_unacked)
            .unwrap_or_default()
    }

    /// Removes and returns the ready payloads of `queue`, headers included.
    pub fn drain(&self, queue: &str) -> Vec<(MessageProperties, Vec<u8>)> {
        lock(&self.state)
            .queues
            .get_mut(queue)
            .map(|q| {
                q.ready
                    .drain(..)
                    .map(|m| (m.properties, m.payload))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Closes the connection: every channel closes, every delivery stream
    /// ends and exclusive queues are deleted.
    pub fn close(&self) {
        let mut state = lock(&self.state);
        let channels = state.channels.keys().copied().collect::<Vec<_>>();
        for id in channels {
            state.close_channel(id, &self.state);
        }
        state.queues.retain(|_, q| !q.options.exclusive);
        let BrokerState {
            queues, bindings, ..
        } = &mut *state;
        bindings.retain(|b| queues.contains_key(&b.queue));
        state.closed = true;
        debug!("memory broker closed");
    }
}

#[async_trait]
impl AmqpConnection for MemoryBroker {
    async fn create_channel(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        let mut state = lock(&self.state);
        state.operations.push(BrokerOperation::OpenChannel);
        if state.closed || state.failures.contains(&FailurePoint::OpenChannel) {
            return Err(AmqpError::ChannelError);
        }

        let id = state.next_id();
        state.channels.insert(
            id,
            ChannelState {
                prefetch: None,
                open: true,
            },
        );

        Ok(Arc::new(MemoryChannel {
            id,
            state: self.state.clone(),
        }))
    }
}

/// A channel of a [`MemoryBroker`].
pub struct MemoryChannel {
    id: u64,
    state: SharedState,
}

impl MemoryChannel {
    fn begin(
        &self,
        op: BrokerOperation,
        point: Option<FailurePoint>,
    ) -> Result<MutexGuard<'_, BrokerState>, AmqpError> {
        let mut state = lock(&self.state);
        state.operations.push(op);

        let open = state.channels.get(&self.id).is_some_and(|c| c.open);
        if !open {
            return Err(AmqpError::TransportError("channel closed".to_owned()));
        }
        if let Some(point) = point {
            if state.failures.contains(&point) {
                return Err(AmqpError::TransportError(format!(
                    "injected failure on {point:?}"
                )));
            }
        }
        Ok(state)
    }
}

#[async_trait]
impl AmqpChannel for MemoryChannel {
    async fn exchange_declare(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        let mut state = self.begin(
            BrokerOperation::ExchangeDeclare {
                exchange: def.name.clone(),
            },
            None,
        )?;

        match state.exchanges.get(&def.name).copied() {
            Some(kind) if kind != def.kind => Err(AmqpError::TopologyConflict(format!(
                "exchange {} already declared as {:?}",
                def.name, kind
            ))),
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(def.name.clone(), def.kind);
                Ok(())
            }
        }
    }

    async fn queue_declare(&self, def: &QueueDefinition) -> Result<QueueDescriptor, AmqpError> {
        let mut state = self.begin(
            BrokerOperation::QueueDeclare {
                queue: def.name.clone(),
            },
            Some(FailurePoint::QueueDeclare),
        )?;

        let name = if def.name.is_empty() {
            format!("amq.gen-{}", Uuid::new_v4())
        } else {
            def.name.clone()
        };

        let queue = state
            .queues
            .entry(name.clone())
            .or_insert_with(|| MemoryQueue::new(def));

        if queue.options != def.options || queue.arguments != def.arguments {
            return Err(AmqpError::TopologyConflict(format!(
                "queue {name} already declared with other attributes"
            )));
        }

        Ok(QueueDescriptor {
            message_count: queue.ready.len() as u32,
            consumer_count: queue.consumers.len() as u32,
            name,
        })
    }

    async fn queue_bind(&self, queue: &str, exchange: &str, key: &str) -> Result<(), AmqpError> {
        let mut state = self.begin(
            BrokerOperation::QueueBind {
                queue: queue.to_owned(),
                exchange: exchange.to_owned(),
                key: key.to_owned(),
            },
            Some(FailurePoint::QueueBind),
        )?;

        if !state.exchanges.contains_key(exchange) {
            return Err(AmqpError::TransportError(format!(
                "no exchange '{exchange}'"
            )));
        }
        if !state.queues.contains_key(queue) {
            return Err(AmqpError::TransportError(format!("no queue '{queue}'")));
        }

        let record = BindingRecord {
            exchange: exchange.to_owned(),
            queue: queue.to_owned(),
            key: key.to_owned(),
        };
        if !state.bindings.contains(&record) {
            state.bindings.push(record);
        }
        Ok(())
    }

    async fn basic_qos(&self, prefetch_count: u16, global: bool) -> Result<(), AmqpError> {
        let mut state = self.begin(
            BrokerOperation::Qos {
                prefetch_count,
                global,
            },
            Some(FailurePoint::Qos),
        )?;

        if let Some(channel) = state.channels.get_mut(&self.id) {
            channel.prefetch = (prefetch_count > 0).then_some(prefetch_count);
        }
        Ok(())
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: MessageProperties,
    ) -> Result<(), AmqpError> {
        let mut state = self.begin(
            BrokerOperation::Publish {
                exchange: exchange.to_owned(),
                routing_key: routing_key.to_owned(),
            },
            Some(FailurePoint::Publish),
        )?;

        if !exchange.is_empty() && !state.exchanges.contains_key(exchange) {
            return Err(AmqpError::TransportError(format!(
                "no exchange '{exchange}'"
            )));
        }

        let message = StoredMessage {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            properties,
            payload: payload.to_vec(),
            redelivered: false,
        };
        let routed = state.route(exchange, routing_key, message, &self.state);
        if routed == 0 {
            debug!(exchange, routing_key, "unroutable message dropped");
        }
        Ok(())
    }

    async fn basic_consume(&self, queue: &str) -> Result<DeliveryStream, AmqpError> {
        let mut state = self.begin(
            BrokerOperation::Consume {
                queue: queue.to_owned(),
            },
            Some(FailurePoint::Consume),
        )?;

        if !state.queues.contains_key(queue) {
            return Err(AmqpError::TransportError(format!("no queue '{queue}'")));
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        let consumer_id = state.next_id();
        state.consumers.insert(
            consumer_id,
            MemoryConsumer {
                queue: queue.to_owned(),
                channel_id: self.id,
                outstanding: 0,
                sender,
            },
        );
        if let Some(q) = state.queues.get_mut(queue) {
            q.consumers.push(consumer_id);
            q.had_consumer = true;
        }
        state.dispatch(queue, &self.state);

        Ok(stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|delivery| (delivery, receiver))
        })
        .boxed())
    }

    async fn close(&self) -> Result<(), AmqpError> {
        let mut state = lock(&self.state);
        state.operations.push(BrokerOperation::CloseChannel);
        state.close_channel(self.id, &self.state);
        Ok(())
    }
}

/// Resolves deliveries of a [`MemoryBroker`].
struct MemoryAcker {
    state: Weak<Mutex<BrokerState>>,
}

impl MemoryAcker {
    fn shared(&self) -> Result<SharedState, AmqpError> {
        self.state
            .upgrade()
            .ok_or_else(|| AmqpError::TransportError("broker dropped".to_owned()))
    }
}

#[async_trait]
impl DeliveryAcker for MemoryAcker {
    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        let shared = self.shared()?;
        let mut state = lock(&shared);
        state.operations.push(BrokerOperation::Ack { delivery_tag });

        let unacked = state.settle(delivery_tag).ok_or(AmqpError::AckMessageError)?;
        state.dispatch(&unacked.queue, &shared);
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        let shared = self.shared()?;
        let mut state = lock(&shared);
        state.operations.push(BrokerOperation::Nack {
            delivery_tag,
            requeue,
        });

        let Unacked {
            queue, mut message, ..
        } = state.settle(delivery_tag).ok_or(AmqpError::NackMessageError)?;

        if requeue {
            message.redelivered = true;
            if let Some(q) = state.queues.get_mut(&queue) {
                q.ready.push_front(message);
            }
        } else {
            state.dead_letter(&queue, message, &shared);
        }
        state.dispatch(&queue, &shared);
        Ok(())
    }
}

impl BrokerState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    /// Copies `message` to every queue the exchange routes `routing_key` to.
    fn route(
        &mut self,
        exchange: &str,
        routing_key: &str,
        message: StoredMessage,
        shared: &SharedState,
    ) -> usize {
        let targets = if exchange.is_empty() {
            if self.queues.contains_key(routing_key) {
                vec![routing_key.to_owned()]
            } else {
                vec![]
            }
        } else {
            let Some(kind) = self.exchanges.get(exchange).copied() else {
                return 0;
            };
            let mut targets = vec![];
            for binding in self.bindings.iter().filter(|b| b.exchange == exchange) {
                let matched = match kind {
                    ExchangeKind::Direct => binding.key == routing_key,
                    ExchangeKind::Fanout => true,
                    ExchangeKind::Topic => topic_matches(&binding.key, routing_key),
                };
                if matched && !targets.contains(&binding.queue) {
                    targets.push(binding.queue.clone());
                }
            }
            targets
        };

        for queue in &targets {
            if let Some(q) = self.queues.get_mut(queue) {
                q.ready.push_back(message.clone());
            }
            self.dispatch(queue, shared);
        }
        targets.len()
    }

    /// Reroutes a rejected message through the queue's dead-letter exchange.
    /// Without one, or when it does not exist, the message is dropped.
    fn dead_letter(&mut self, queue: &str, mut message: StoredMessage, shared: &SharedState) {
        let Some(dlx) = self
            .queues
            .get(queue)
            .and_then(|q| q.arguments.get(AMQP_HEADERS_DEAD_LETTER_EXCHANGE))
            .cloned()
        else {
            return;
        };

        message.redelivered = false;
        message
            .properties
            .headers
            .entry(HEADER_FIRST_DEATH_QUEUE.to_owned())
            .or_insert_with(|| queue.to_owned());
        message
            .properties
            .headers
            .entry(HEADER_FIRST_DEATH_REASON.to_owned())
            .or_insert_with(|| "rejected".to_owned());

        let routing_key = message.routing_key.clone();
        let routed = self.route(&dlx, &routing_key, message, shared);
        debug!(queue, dlx = %dlx, routed = %routed, "message dead-lettered");
    }

    /// Forgets an unresolved delivery and frees its prefetch slot.
    fn settle(&mut self, delivery_tag: u64) -> Option<Unacked> {
        let unacked = self.unacked.remove(&delivery_tag)?;
        if let Some(consumer) = self.consumers.get_mut(&unacked.consumer_id) {
            consumer.outstanding = consumer.outstanding.saturating_sub(1);
        }
        Some(unacked)
    }

    /// Pushes ready messages to consumers with free prefetch slots, round robin.
    fn dispatch(&mut self, queue: &str, shared: &SharedState) {
        loop {
            let Some(q) = self.queues.get_mut(queue) else {
                return;
            };
            if q.ready.is_empty() || q.consumers.is_empty() {
                return;
            }

            let total = q.consumers.len();
            let mut chosen = None;
            for offset in 0..total {
                let idx = (q.next_consumer + offset) % total;
                let id = q.consumers[idx];
                let Some(consumer) = self.consumers.get(&id) else {
                    continue;
                };
                let limit = self
                    .channels
                    .get(&consumer.channel_id)
                    .and_then(|c| c.prefetch);
                if limit.map_or(true, |limit| consumer.outstanding < limit as usize) {
                    chosen = Some((idx, id));
                    break;
                }
            }
            let Some((idx, consumer_id)) = chosen else {
                return;
            };
            q.next_consumer = (idx + 1) % total;
            let Some(message) = q.ready.pop_front() else {
                return;
            };

            self.next_id += 1;
            let delivery_tag = self.next_id;
            let acker: Arc<dyn DeliveryAcker> = Arc::new(MemoryAcker {
                state: Arc::downgrade(shared),
            });
            let delivery = Delivery::new(delivery_tag, message.payload.clone(), acker)
                .with_route(&message.exchange, &message.routing_key)
                .with_properties(message.properties.clone())
                .redelivered(message.redelivered);

            let Some(consumer) = self.consumers.get_mut(&consumer_id) else {
                return;
            };
            if consumer.sender.send(Ok(delivery)).is_err() {
                // receiving side dropped, treat as a cancelled consumer
                self.consumers.remove(&consumer_id);
                if let Some(q) = self.queues.get_mut(queue) {
                    q.consumers.retain(|id| *id != consumer_id);
                    q.ready.push_front(message);
                }
                continue;
            }
            consumer.outstanding += 1;

            self.unacked.insert(
                delivery_tag,
                Unacked {
                    queue: queue.to_owned(),
                    consumer_id,
                    message,
                },
            );
            let outstanding = self.unacked.values().filter(|u| u.queue == queue).count();
            if let Some(q) = self.queues.get_mut(queue) {
                q.peak_unacked = q.peak_unacked.max(outstanding);
            }
        }
    }

    /// Cancels the channel's consumers, requeues their unresolved deliveries
    /// and removes auto-delete queues left without consumers.
    fn close_channel(&mut self, channel_id: u64, shared: &SharedState) {
        if let Some(channel) = self.channels.get_mut(&channel_id) {
            channel.open = false;
        }

        let cancelled = self
            .consumers
            .iter()
            .filter(|(_, c)| c.channel_id == channel_id)
            .map(|(id, _)| *id)
            .collect::<Vec<_>>();
        if cancelled.is_empty() {
            return;
        }

        let mut touched = vec![];
        for consumer_id in &cancelled {
            if let Some(consumer) = self.consumers.remove(consumer_id) {
                if let Some(q) = self.queues.get_mut(&consumer.queue) {
                    q.consumers.retain(|id| id != consumer_id);
                }
                if !touched.contains(&consumer.queue) {
                    touched.push(consumer.queue);
                }
            }
        }

        let orphaned = self
            .unacked
            .iter()
            .filter(|(_, u)| cancelled.contains(&u.consumer_id))
            .map(|(tag, _)| *tag)
            .collect::<Vec<_>>();
        // requeue newest first so the oldest ends up at the front
        for tag in orphaned.into_iter().rev() {
            if let Some(Unacked {
                queue, mut message, ..
            }) = self.unacked.remove(&tag)
            {
                message.redelivered = true;
                if let Some(q) = self.queues.get_mut(&queue) {
                    q.ready.push_front(message);
                }
            }
        }

        for queue in touched {
            let remove = self
                .queues
                .get(&queue)
                .is_some_and(|q| {
                    q.options.auto_delete && q.had_consumer && q.consumers.is_empty()
                });
            if remove {
                debug!(queue = %queue, "auto-delete queue removed");
                self.queues.remove(&queue);
                self.bindings.retain(|b| b.queue != queue);
            } else {
                self.dispatch(&queue, shared);
            }
        }
    }
}

/// AMQP topic matching: words are dot separated, `*` matches exactly one
/// word and `#` matches zero or more.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    match_words(&words(pattern), &words(routing_key))
}

/// An empty pattern or key has zero words.
fn words(value: &str) -> Vec<&str> {
    if value.is_empty() {
        vec![]
    } else {
        value.split('.').collect()
    }
}

fn match_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| match_words(rest, &key[skip..])),
        Some((&"*", rest)) => !key.is_empty() && match_words(rest, &key[1..]),
        Some((word, rest)) => key.first() == Some(word) && match_words(rest, &key[1..]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::QueueDurability;

    #[test]
    fn topic_wildcards() {
        assert!(topic_matches("army_moves.*", "army_moves.alice"));
        assert!(!topic_matches("army_moves.*", "army_moves"));
        assert!(!topic_matches("army_moves.*", "army_moves.alice.north"));
        assert!(topic_matches("game_logs.#", "game_logs"));
        assert!(topic_matches("game_logs.#", "game_logs.bob.war"));
        assert!(topic_matches("#", "anything.at.all"));
        assert!(topic_matches("#.war", "war"));
        assert!(!topic_matches("pause", "pause.alice"));
    }

    #[test]
    fn empty_binding_key_matches_only_empty_routing_key() {
        assert!(topic_matches("", ""));
        assert!(!topic_matches("", "pause"));
        assert!(!topic_matches("pause", ""));
        assert!(topic_matches("#", ""));
    }

    #[tokio::test]
    async fn empty_routing_key_reaches_empty_topic_binding() {
        let broker = MemoryBroker::new();
        let channel = declared(&broker).await;
        channel
            .queue_declare(&QueueDefinition::new("all_quiet", QueueDurability::Durable))
            .await
            .unwrap();
        channel.queue_bind("all_quiet", "peril_topic", "").await.unwrap();

        channel
            .basic_publish("peril_topic", "", b"x", MessageProperties::default())
            .await
            .unwrap();

        assert_eq!(broker.ready_count("all_quiet"), 1);
        assert_eq!(broker.ready_count("moves"), 0);
    }

    async fn declared(broker: &MemoryBroker) -> Arc<dyn AmqpChannel> {
        let channel = broker.create_channel().await.unwrap();
        channel
            .exchange_declare(&ExchangeDefinition::new("peril_topic").topic())
            .await
            .unwrap();
        channel
            .queue_declare(&QueueDefinition::new("moves", QueueDurability::Durable))
            .await
            .unwrap();
        channel
            .queue_bind("moves", "peril_topic", "army_moves.*")
            .await
            .unwrap();
        channel
    }

    #[tokio::test]
    async fn unroutable_messages_are_dropped() {
        let broker = MemoryBroker::new();
        let channel = declared(&broker).await;

        channel
            .basic_publish("peril_topic", "pause", b"x", MessageProperties::default())
            .await
            .unwrap();

        assert_eq!(broker.ready_count("moves"), 0);
    }

    #[tokio::test]
    async fn default_exchange_routes_by_queue_name() {
        let broker = MemoryBroker::new();
        let channel = declared(&broker).await;

        channel
            .basic_publish("", "moves", b"x", MessageProperties::default())
            .await
            .unwrap();

        assert_eq!(broker.ready_count("moves"), 1);
    }

    #[tokio::test]
    async fn prefetch_bounds_pushed_deliveries() {
        let broker = MemoryBroker::new();
        let channel = declared(&broker).await;
        for _ in 0..5 {
            channel
                .basic_publish("peril_topic", "army_moves.bob", b"x", MessageProperties::default())
                .await
                .unwrap();
        }

        channel.basic_qos(2, true).await.unwrap();
        let mut deliveries = channel.basic_consume("moves").await.unwrap();

        assert_eq!(broker.unacked_count("moves"), 2);
        assert_eq!(broker.ready_count("moves"), 3);

        let first = deliveries.next().await.unwrap().unwrap();
        first.ack().await.unwrap();

        assert_eq!(broker.unacked_count("moves"), 2);
        assert_eq!(broker.ready_count("moves"), 2);
        assert_eq!(broker.peak_unacked("moves"), 2);
    }

    #[tokio::test]
    async fn closing_a_channel_requeues_unresolved_deliveries() {
        let broker = MemoryBroker::new();
        let channel = declared(&broker).await;
        channel
            .basic_publish("peril_topic", "army_moves.bob", b"x", MessageProperties::default())
            .await
            .unwrap();

        let mut deliveries = channel.basic_consume("moves").await.unwrap();
        let delivery = deliveries.next().await.unwrap().unwrap();
        assert!(!delivery.redelivered);
        drop(delivery);

        channel.close().await.unwrap();

        assert!(deliveries.next().await.is_none());
        assert_eq!(broker.unacked_count("moves"), 0);
        assert_eq!(broker.ready_count("moves"), 1);
    }

    #[tokio::test]
    async fn resolving_an_unknown_tag_fails() {
        let broker = MemoryBroker::new();
        let acker = MemoryAcker {
            state: Arc::downgrade(&broker.state),
        };

        assert_eq!(acker.ack(42).await, Err(AmqpError::AckMessageError));
        assert_eq!(acker.nack(42, true).await, Err(AmqpError::NackMessageError));
    }
}
