// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Connection and Channel Management
//!
//! This module connects to RabbitMQ through `lapin` and adapts lapin's
//! connection, channel and delivery types to the transport traits in
//! [`crate::broker`].

use crate::{
    broker::{
        AmqpChannel, AmqpConnection, Delivery, DeliveryAcker, DeliveryStream, MessageProperties,
        QueueDescriptor,
    },
    config::RabbitMQConfigs,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::QueueDefinition,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    protocol::{basic::AMQPProperties, AMQPErrorKind, AMQPSoftError},
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::{collections::BTreeMap, sync::Arc};
use tracing::{debug, error};

/// Reply code sent when closing channels and connections on purpose
const REPLY_SUCCESS: u16 = 200;

/// Connects to RabbitMQ using the given configuration.
///
/// # Example
/// ```no_run
/// # async fn run() -> Result<(), pubsub::errors::AmqpError> {
/// let cfg = pubsub::config::RabbitMQConfigs::from_env()?;
/// let conn = pubsub::channel::new_amqp_connection(&cfg).await?;
/// # Ok(())
/// # }
/// ```
pub async fn new_amqp_connection(
    cfg: &RabbitMQConfigs,
) -> Result<Arc<LapinConnection>, AmqpError> {
    debug!("creating amqp connection...");
    let options = ConnectionProperties::default()
        .with_connection_name(LongString::from(cfg.connection_name.clone()));

    let conn = match Connection::connect(&cfg.uri(), options).await {
        Ok(c) => Ok(c),
        Err(err) => {
            error!(error = err.to_string(), "failure to connect");
            Err(AmqpError::ConnectionError)
        }
    }?;
    debug!("amqp connected");

    Ok(Arc::new(LapinConnection { conn }))
}

/// A lapin connection behind [`AmqpConnection`].
pub struct LapinConnection {
    conn: Connection,
}

impl LapinConnection {
    /// Closes the connection, invalidating every channel derived from it.
    pub async fn close(&self) -> Result<(), AmqpError> {
        self.conn
            .close(REPLY_SUCCESS, "bye")
            .await
            .map_err(|err| AmqpError::TransportError(err.to_string()))
    }
}

#[async_trait]
impl AmqpConnection for LapinConnection {
    async fn create_channel(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        debug!("creating amqp channel...");
        match self.conn.create_channel().await {
            Ok(channel) => {
                debug!("channel created");
                Ok(Arc::new(LapinChannel { channel }))
            }
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(AmqpError::ChannelError)
            }
        }
    }
}

/// A lapin channel behind [`AmqpChannel`].
pub struct LapinChannel {
    channel: Channel,
}

#[async_trait]
impl AmqpChannel for LapinChannel {
    async fn exchange_declare(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        self.channel
            .exchange_declare(
                &def.name,
                def.kind.into(),
                ExchangeDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    auto_delete: def.delete,
                    internal: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| topology_error(&def.name, err))
    }

    async fn queue_declare(&self, def: &QueueDefinition) -> Result<QueueDescriptor, AmqpError> {
        let args = def
            .arguments
            .iter()
            .map(|(key, value)| {
                (
                    ShortString::from(key.clone()),
                    AMQPValue::LongString(LongString::from(value.clone())),
                )
            })
            .collect::<BTreeMap<_, _>>();

        let queue = self
            .channel
            .queue_declare(
                &def.name,
                QueueDeclareOptions {
                    passive: false,
                    durable: def.options.durable,
                    exclusive: def.options.exclusive,
                    auto_delete: def.options.auto_delete,
                    nowait: false,
                },
                FieldTable::from(args),
            )
            .await
            .map_err(|err| topology_error(&def.name, err))?;

        Ok(QueueDescriptor {
            name: queue.name().to_string(),
            message_count: queue.message_count(),
            consumer_count: queue.consumer_count(),
        })
    }

    async fn queue_bind(&self, queue: &str, exchange: &str, key: &str) -> Result<(), AmqpError> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
            .map_err(|err| topology_error(queue, err))
    }

    async fn basic_qos(&self, prefetch_count: u16, global: bool) -> Result<(), AmqpError> {
        self.channel
            .basic_qos(prefetch_count, BasicQosOptions { global })
            .await
            .map_err(|err| AmqpError::TransportError(err.to_string()))
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: MessageProperties,
    ) -> Result<(), AmqpError> {
        self.channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                payload,
                basic_properties(properties),
            )
            .await
            .map(|_| ())
            .map_err(|err| AmqpError::TransportError(err.to_string()))
    }

    async fn basic_consume(&self, queue: &str) -> Result<DeliveryStream, AmqpError> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                "",
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| AmqpError::TransportError(err.to_string()))?;

        let acker: Arc<dyn DeliveryAcker> = Arc::new(LapinAcker {
            channel: self.channel.clone(),
        });

        Ok(consumer
            .map(move |result| match result {
                Ok(delivery) => Ok(Delivery::new(
                    delivery.delivery_tag,
                    delivery.data,
                    acker.clone(),
                )
                .with_route(delivery.exchange.as_str(), delivery.routing_key.as_str())
                .with_properties(message_properties(&delivery.properties))
                .redelivered(delivery.redelivered)),
                Err(err) => Err(AmqpError::TransportError(err.to_string())),
            })
            .boxed())
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.channel
            .close(REPLY_SUCCESS, "bye")
            .await
            .map_err(|err| AmqpError::TransportError(err.to_string()))
    }
}

/// Resolves deliveries on the channel that received them.
struct LapinAcker {
    channel: Channel,
}

#[async_trait]
impl DeliveryAcker for LapinAcker {
    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), delivery_tag, "error to ack msg");
                AmqpError::AckMessageError
            })
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), delivery_tag, "error to nack msg");
                AmqpError::NackMessageError
            })
    }
}

/// PRECONDITION_FAILED on a declaration means the entity already exists with
/// other attributes.
fn topology_error(name: &str, err: lapin::Error) -> AmqpError {
    if let lapin::Error::ProtocolError(amqp_err) = &err {
        if matches!(
            amqp_err.kind(),
            AMQPErrorKind::Soft(AMQPSoftError::PRECONDITIONFAILED)
        ) {
            error!(error = err.to_string(), name, "topology conflict");
            return AmqpError::TopologyConflict(format!("{name}: {err}"));
        }
    }

    error!(error = err.to_string(), name, "failure to declare topology");
    AmqpError::TransportError(err.to_string())
}

fn basic_properties(props: MessageProperties) -> BasicProperties {
    let headers = props
        .headers
        .into_iter()
        .map(|(key, value)| {
            (
                ShortString::from(key),
                AMQPValue::LongString(LongString::from(value)),
            )
        })
        .collect::<BTreeMap<_, _>>();

    let mut basic = BasicProperties::default().with_headers(FieldTable::from(headers));
    if let Some(content_type) = props.content_type {
        basic = basic.with_content_type(ShortString::from(content_type));
    }
    if let Some(kind) = props.kind {
        basic = basic.with_type(ShortString::from(kind));
    }
    if let Some(id) = props.message_id {
        basic = basic.with_message_id(ShortString::from(id));
    }
    basic
}

fn message_properties(props: &AMQPProperties) -> MessageProperties {
    let mut headers = BTreeMap::new();
    if let Some(table) = props.headers() {
        for (key, value) in table.inner() {
            let value = match value {
                AMQPValue::LongString(v) => String::from_utf8_lossy(v.as_bytes()).into_owned(),
                AMQPValue::ShortString(v) => v.to_string(),
                _ => continue,
            };
            headers.insert(key.to_string(), value);
        }
    }

    MessageProperties {
        content_type: props.content_type().as_ref().map(|v| v.to_string()),
        kind: props.kind().as_ref().map(|v| v.to_string()),
        message_id: props.message_id().as_ref().map(|v| v.to_string()),
        headers,
    }
}
