// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Typed Subscriber
//!
//! This module attaches a handler to a queue. Subscribing declares and binds
//! the queue, applies the prefetch limit, opens a manual-ack consumer and
//! spawns one task that processes deliveries sequentially, in broker order,
//! until the delivery stream closes or the subscription is shut down.
//!
//! The prefetch limit is the only backpressure: once that many deliveries are
//! unresolved the broker stops pushing until a decision frees a slot.

use crate::{
    broker::{AmqpChannel, DeliveryStream, QueueDescriptor},
    codec::Codec,
    consumer::consume,
    errors::AmqpError,
    handler::MessageHandler,
    queue::QueueBinding,
    topology::{close_channel, TopologyManager},
};
use futures_util::StreamExt;
use opentelemetry::global;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, error};

/// What happens to a delivery whose payload cannot be decoded.
///
/// The default leaves it unresolved: it is never redelivered within the
/// process lifetime, but it occupies one prefetch slot until its channel
/// closes. Enough of them starve the subscription.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum DecodeFailurePolicy {
    #[default]
    LeaveUnresolved,
    /// Nack without requeue, the broker dead-letters it.
    Discard,
    /// Nack with requeue. An undecodable payload comes straight back.
    Requeue,
}

/// Creates subscriptions over the queues of a [`TopologyManager`].
#[derive(Clone)]
pub struct Subscriber {
    topology: TopologyManager,
    on_decode_failure: DecodeFailurePolicy,
}

impl Subscriber {
    pub fn new(topology: TopologyManager) -> Self {
        Subscriber {
            topology,
            on_decode_failure: DecodeFailurePolicy::default(),
        }
    }

    /// Sets the policy applied to deliveries that fail to decode.
    pub fn on_decode_failure(mut self, policy: DecodeFailurePolicy) -> Self {
        self.on_decode_failure = policy;
        self
    }

    pub fn topology(&self) -> &TopologyManager {
        &self.topology
    }

    /// Subscribes `handler` to the queue described by `binding`.
    ///
    /// The queue is declared and bound first, then the channel's prefetch is
    /// set to `prefetch` (global). A rejected or zero prefetch fails with
    /// `FlowControlError` and no consumption starts.
    ///
    /// # Returns
    /// A handle to the running subscription. Dropping it leaves the loop
    /// running until its delivery stream closes.
    pub async fn subscribe<T, C, H>(
        &self,
        binding: &QueueBinding<'_>,
        prefetch: u16,
        codec: C,
        handler: H,
    ) -> Result<Subscription, AmqpError>
    where
        T: DeserializeOwned + Send + 'static,
        C: Codec,
        H: MessageHandler<T>,
    {
        if prefetch == 0 {
            return Err(AmqpError::FlowControlError(
                "prefetch must be at least 1".to_owned(),
            ));
        }

        let (channel, queue) = self.topology.declare_binding(binding).await?;

        if let Err(err) = channel.basic_qos(prefetch, true).await {
            error!(error = err.to_string(), queue = %queue.name, "failure to configure qos");
            close_channel(channel.as_ref()).await;
            return Err(AmqpError::FlowControlError(err.to_string()));
        }

        let deliveries = match channel.basic_consume(&queue.name).await {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    queue = %queue.name,
                    "error to create the consumer"
                );
                close_channel(channel.as_ref()).await;
                Err(err)
            }
            Ok(c) => Ok(c),
        }?;
        debug!(queue = %queue.name, prefetch, "consumer started");

        let (shutdown, shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(run::<T, C, H>(
            deliveries,
            channel,
            queue.name.clone(),
            codec,
            handler,
            self.on_decode_failure,
            shutdown_rx,
        ));

        Ok(Subscription {
            queue,
            shutdown,
            join,
        })
    }
}

/// Handle to a running subscription.
pub struct Subscription {
    queue: QueueDescriptor,
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl Subscription {
    /// The queue as the broker reported it at declaration.
    pub fn queue(&self) -> &QueueDescriptor {
        &self.queue
    }

    /// Whether the processing loop has ended.
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Stops the loop after the delivery in flight, closes the channel so the
    /// broker requeues whatever is still unresolved, and waits for the loop.
    pub async fn shutdown(self) -> Result<(), AmqpError> {
        let _ = self.shutdown.send(true);
        self.join.await.map_err(|err| {
            error!(error = err.to_string(), "subscription task failed");
            AmqpError::InternalError
        })
    }

    /// Waits for the loop to end on its own, when its delivery stream closes.
    pub async fn closed(self) -> Result<(), AmqpError> {
        self.join.await.map_err(|err| {
            error!(error = err.to_string(), "subscription task failed");
            AmqpError::InternalError
        })
    }
}

async fn run<T, C, H>(
    mut deliveries: DeliveryStream,
    channel: Arc<dyn AmqpChannel>,
    queue: String,
    codec: C,
    handler: H,
    on_decode_failure: DecodeFailurePolicy,
    mut shutdown: watch::Receiver<bool>,
) where
    T: DeserializeOwned + Send + 'static,
    C: Codec,
    H: MessageHandler<T>,
{
    let tracer = global::tracer("amqp subscriber");
    let mut detached = false;

    loop {
        tokio::select! {
            changed = shutdown.changed(), if !detached => {
                if changed.is_err() {
                    // handle dropped, keep consuming until the stream closes
                    detached = true;
                    continue;
                }
                let stop = *shutdown.borrow();
                if stop {
                    debug!(queue = %queue, "subscription shutting down");
                    close_channel(channel.as_ref()).await;
                    break;
                }
            },
            next = deliveries.next() => match next {
                Some(Ok(delivery)) => {
                    if let Err(err) = consume(
                        &tracer,
                        delivery,
                        &queue,
                        &codec,
                        &handler,
                        on_decode_failure,
                    )
                    .await
                    {
                        error!(error = err.to_string(), queue = %queue, "error consume msg");
                    }
                }
                Some(Err(err)) => {
                    error!(error = err.to_string(), queue = %queue, "errors consume msg")
                }
                None => {
                    debug!(queue = %queue, "delivery stream closed");
                    break;
                }
            },
        }
    }
}
