// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Typed Message Publisher
//!
//! This module encodes typed values with a [`Codec`] and publishes them to an
//! exchange. One call is one message: nothing is buffered, batched or retried.
//! The OpenTelemetry context is propagated in the message headers.

use crate::{
    broker::{AmqpChannel, MessageProperties},
    codec::Codec,
    errors::AmqpError,
    otel,
};
use opentelemetry::Context;
use serde::Serialize;
use std::sync::Arc;
use tracing::error;
use uuid::Uuid;

/// Encodes `value` with `codec` and publishes it to `exchange` with
/// `routing_key`, carrying the current trace context.
///
/// An encoding failure returns `EncodingError` before anything is sent.
/// Transport failures return `TransportError`; retrying is up to the caller.
pub async fn publish<T, C>(
    channel: &dyn AmqpChannel,
    exchange: &str,
    routing_key: &str,
    value: &T,
    codec: &C,
) -> Result<(), AmqpError>
where
    T: Serialize + ?Sized,
    C: Codec,
{
    publish_with_context(
        &Context::current(),
        channel,
        exchange,
        routing_key,
        value,
        codec,
    )
    .await
}

/// [`publish`] with an explicit trace context.
pub async fn publish_with_context<T, C>(
    ctx: &Context,
    channel: &dyn AmqpChannel,
    exchange: &str,
    routing_key: &str,
    value: &T,
    codec: &C,
) -> Result<(), AmqpError>
where
    T: Serialize + ?Sized,
    C: Codec,
{
    let payload = match codec.encode(value) {
        Ok(payload) => payload,
        Err(err) => {
            error!(
                error = err.to_string(),
                exchange,
                routing_key,
                "error encoding message"
            );
            return Err(err);
        }
    };

    let properties = MessageProperties::default()
        .with_content_type(codec.content_type())
        .with_message_id(Uuid::new_v4().to_string())
        .with_headers(otel::inject(ctx));

    match channel
        .basic_publish(exchange, routing_key, &payload, properties)
        .await
    {
        Err(err) => {
            error!(error = err.to_string(), "error publishing message");
            Err(match err {
                AmqpError::TransportError(_) => err,
                other => AmqpError::TransportError(other.to_string()),
            })
        }
        _ => Ok(()),
    }
}

/// A channel paired with a codec, for callers publishing the same kind of
/// payload repeatedly, e.g. handlers reacting to one message with another.
#[derive(Clone)]
pub struct Publisher<C> {
    channel: Arc<dyn AmqpChannel>,
    codec: C,
}

impl<C: Codec> Publisher<C> {
    pub fn new(channel: Arc<dyn AmqpChannel>, codec: C) -> Self {
        Publisher { channel, codec }
    }

    pub async fn publish<T>(
        &self,
        exchange: &str,
        routing_key: &str,
        value: &T,
    ) -> Result<(), AmqpError>
    where
        T: Serialize + ?Sized,
    {
        publish(self.channel.as_ref(), exchange, routing_key, value, &self.codec).await
    }
}
