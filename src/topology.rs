// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Topology Management
//!
//! This module declares queues and binds them to exchanges. Each call opens
//! its own channel and re-verifies the topology with the broker; nothing is
//! cached locally.
//!
//! The main components are:
//! - `TopologyManager`: declaration entry point holding the broker connection
//!   and the process-wide dead-letter exchange name
//! - `declare_and_bind`: the idempotent queue declaration and binding

use crate::{
    broker::{AmqpChannel, AmqpConnection, QueueDescriptor},
    config::RabbitMQConfigs,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition, QueueDurability},
};
use std::sync::Arc;
use tracing::{debug, error};

/// Declares exchanges and queues over a broker connection.
///
/// Every queue it declares is attached to the same dead-letter exchange, so
/// rejected messages are rerouted instead of dropped.
#[derive(Clone)]
pub struct TopologyManager {
    connection: Arc<dyn AmqpConnection>,
    dead_letter_exchange: String,
}

impl TopologyManager {
    /// Creates a new topology manager.
    ///
    /// # Parameters
    /// * `connection` - The process-wide broker connection
    /// * `dead_letter_exchange` - Exchange receiving discarded messages of every queue
    pub fn new(connection: Arc<dyn AmqpConnection>, dead_letter_exchange: &str) -> Self {
        TopologyManager {
            connection,
            dead_letter_exchange: dead_letter_exchange.to_owned(),
        }
    }

    /// Creates a topology manager with the configured dead-letter exchange.
    pub fn from_configs(connection: Arc<dyn AmqpConnection>, cfg: &RabbitMQConfigs) -> Self {
        Self::new(connection, &cfg.dead_letter_exchange)
    }

    pub fn dead_letter_exchange(&self) -> &str {
        &self.dead_letter_exchange
    }

    /// Opens a channel owned by the caller, typically for publishing.
    pub async fn open_channel(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        self.connection.create_channel().await
    }

    /// Declares an exchange on a short-lived channel.
    pub async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        debug!("creating exchange: {}", def.name);

        let channel = self.connection.create_channel().await?;
        let declared = channel.exchange_declare(def).await;
        close_channel(channel.as_ref()).await;
        declared?;

        debug!("exchange: {} was created", def.name);
        Ok(())
    }

    /// Ensures `queue` exists with the flags of `policy` and the dead-letter
    /// exchange attached, and binds it to `exchange` with `key`.
    ///
    /// The policy is resolved before anything reaches the broker, so an
    /// invalid one fails with `InvalidPolicy` without opening a channel.
    /// Re-declaring with identical attributes succeeds; conflicting attributes
    /// fail with `TopologyConflict`.
    ///
    /// # Returns
    /// The freshly opened channel, owned by the caller, and the queue as the
    /// broker reported it. On failure the channel is closed before returning.
    pub async fn declare_and_bind<P>(
        &self,
        exchange: &str,
        queue: &str,
        key: &str,
        policy: P,
    ) -> Result<(Arc<dyn AmqpChannel>, QueueDescriptor), AmqpError>
    where
        P: TryInto<QueueDurability>,
        AmqpError: From<P::Error>,
    {
        let durability: QueueDurability = policy.try_into()?;
        let def = QueueDefinition::new(queue, durability)
            .dead_letter_exchange(&self.dead_letter_exchange);

        let channel = self.connection.create_channel().await?;

        debug!("creating {} queue: {}", durability, queue);
        let descriptor = match channel.queue_declare(&def).await {
            Ok(descriptor) => descriptor,
            Err(err) => {
                error!(error = err.to_string(), "error to declare queue");
                close_channel(channel.as_ref()).await;
                return Err(err);
            }
        };
        debug!("queue: {} was created", descriptor.name);

        debug!(
            "binding queue: {} to the exchange: {} with the key: {}",
            descriptor.name, exchange, key
        );
        if let Err(err) = channel.queue_bind(&descriptor.name, exchange, key).await {
            error!(error = err.to_string(), "error to bind queue to exchange");
            close_channel(channel.as_ref()).await;
            return Err(err);
        }

        Ok((channel, descriptor))
    }

    /// [`declare_and_bind`](Self::declare_and_bind) for a prepared binding.
    pub async fn declare_binding(
        &self,
        binding: &QueueBinding<'_>,
    ) -> Result<(Arc<dyn AmqpChannel>, QueueDescriptor), AmqpError> {
        self.declare_and_bind(
            binding.exchange_name,
            binding.queue_name,
            binding.routing_key,
            binding.durability,
        )
        .await
    }
}

/// Closes a channel, logging instead of returning a failure to close.
pub(crate) async fn close_channel(channel: &dyn AmqpChannel) {
    if let Err(err) = channel.close().await {
        error!(error = err.to_string(), "error to close the channel");
    }
}
