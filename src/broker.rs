// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Transport Seam
//!
//! The messaging layer never talks to a broker library directly. It goes
//! through the traits in this module, which cover exactly the primitives the
//! layer needs: open a channel, declare, bind, set prefetch, publish, consume,
//! acknowledge and close.
//!
//! Two implementations ship with the crate: [`crate::channel`] wraps `lapin`,
//! and `memory`, behind the `test-util` feature, is an in-process broker
//! used for tests.

use crate::{
    errors::AmqpError,
    exchange::ExchangeDefinition,
    handler::AckDecision,
    queue::QueueDefinition,
};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::{collections::BTreeMap, fmt, sync::Arc};

/// Stream of deliveries pushed by the broker to one consumer.
///
/// The stream ends when the channel or connection it was opened on closes.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, AmqpError>>;

/// A connection to the broker, the root of every channel.
#[async_trait]
pub trait AmqpConnection: Send + Sync {
    /// Opens a new channel. Channels are never shared between bindings.
    async fn create_channel(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError>;
}

/// A channel over a broker connection.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AmqpChannel: Send + Sync {
    async fn exchange_declare(&self, def: &ExchangeDefinition) -> Result<(), AmqpError>;

    /// Declares a queue. Re-declaring with identical flags and arguments is a
    /// no-op; conflicting attributes fail with `TopologyConflict`.
    async fn queue_declare(&self, def: &QueueDefinition) -> Result<QueueDescriptor, AmqpError>;

    async fn queue_bind(&self, queue: &str, exchange: &str, key: &str) -> Result<(), AmqpError>;

    /// Limits the unacknowledged deliveries the broker pushes on this channel.
    async fn basic_qos(&self, prefetch_count: u16, global: bool) -> Result<(), AmqpError>;

    /// Publishes non-mandatory, non-immediate.
    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: MessageProperties,
    ) -> Result<(), AmqpError>;

    /// Starts a manual-ack consumer with a broker-assigned tag.
    async fn basic_consume(&self, queue: &str) -> Result<DeliveryStream, AmqpError>;

    async fn close(&self) -> Result<(), AmqpError>;
}

/// Resolves deliveries against the broker that pushed them.
#[async_trait]
pub trait DeliveryAcker: Send + Sync {
    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError>;

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError>;
}

/// What the broker reports back after a queue declaration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueDescriptor {
    pub name: String,
    pub message_count: u32,
    pub consumer_count: u32,
}

/// Message properties carried next to the payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    pub content_type: Option<String>,
    pub kind: Option<String>,
    pub message_id: Option<String>,
    pub headers: BTreeMap<String, String>,
}

impl MessageProperties {
    pub fn with_content_type(mut self, content_type: &str) -> Self {
        self.content_type = Some(content_type.to_owned());
        self
    }

    pub fn with_kind(mut self, kind: &str) -> Self {
        self.kind = Some(kind.to_owned());
        self
    }

    pub fn with_message_id(mut self, id: String) -> Self {
        self.message_id = Some(id);
        self
    }

    pub fn with_headers(mut self, headers: BTreeMap<String, String>) -> Self {
        self.headers = headers;
        self
    }
}

/// A message pushed by the broker, waiting for exactly one resolution.
///
/// `ack`, `nack` and `resolve` take the delivery by value, so a delivery
/// cannot be resolved twice. Dropping it without resolving leaves it
/// unacknowledged until its channel closes.
pub struct Delivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: MessageProperties,
    pub data: Vec<u8>,
    acker: Arc<dyn DeliveryAcker>,
}

impl Delivery {
    pub fn new(delivery_tag: u64, data: Vec<u8>, acker: Arc<dyn DeliveryAcker>) -> Delivery {
        Delivery {
            delivery_tag,
            exchange: String::new(),
            routing_key: String::new(),
            redelivered: false,
            properties: MessageProperties::default(),
            data,
            acker,
        }
    }

    pub fn with_route(mut self, exchange: &str, routing_key: &str) -> Self {
        self.exchange = exchange.to_owned();
        self.routing_key = routing_key.to_owned();
        self
    }

    pub fn with_properties(mut self, properties: MessageProperties) -> Self {
        self.properties = properties;
        self
    }

    pub fn redelivered(mut self, redelivered: bool) -> Self {
        self.redelivered = redelivered;
        self
    }

    /// Acknowledges this delivery only, never the ones before it.
    pub async fn ack(self) -> Result<(), AmqpError> {
        self.acker.ack(self.delivery_tag).await
    }

    pub async fn nack(self, requeue: bool) -> Result<(), AmqpError> {
        self.acker.nack(self.delivery_tag, requeue).await
    }

    /// Applies a handler's decision.
    pub async fn resolve(self, decision: AckDecision) -> Result<(), AmqpError> {
        match decision {
            AckDecision::Ack => self.ack().await,
            AckDecision::NackRequeue => self.nack(true).await,
            AckDecision::NackDiscard => self.nack(false).await,
        }
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("redelivered", &self.redelivered)
            .field("properties", &self.properties)
            .field("len", &self.data.len())
            .finish()
    }
}
