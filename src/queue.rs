// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Definitions
//!
//! This module provides the queue durability policy, the declaration flags it
//! resolves to, and the builders used to describe a queue and its binding to an
//! exchange. Every queue declared through this crate carries a dead-letter
//! exchange argument.

use crate::errors::AmqpError;
use std::{collections::BTreeMap, fmt, str::FromStr};

/// Queue argument naming the exchange that receives rejected messages
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";

/// Durability policy of a queue, fixed at declaration time.
///
/// - Durable: survives broker restarts, is never auto-deleted and is shared
/// - Transient: deleted once its last consumer goes away and exclusive to the
///   declaring connection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum QueueDurability {
    #[default]
    Durable,
    Transient,
}

impl QueueDurability {
    /// Resolves the declaration flags for this policy.
    pub fn options(self) -> QueueOptions {
        match self {
            QueueDurability::Durable => QueueOptions {
                durable: true,
                auto_delete: false,
                exclusive: false,
            },
            QueueDurability::Transient => QueueOptions {
                durable: false,
                auto_delete: true,
                exclusive: true,
            },
        }
    }
}

impl fmt::Display for QueueDurability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueDurability::Durable => f.write_str("durable"),
            QueueDurability::Transient => f.write_str("transient"),
        }
    }
}

impl FromStr for QueueDurability {
    type Err = AmqpError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "durable" => Ok(QueueDurability::Durable),
            "transient" => Ok(QueueDurability::Transient),
            _ => Err(AmqpError::InvalidPolicy(value.to_owned())),
        }
    }
}

impl TryFrom<&str> for QueueDurability {
    type Error = AmqpError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl TryFrom<u8> for QueueDurability {
    type Error = AmqpError;

    /// Numeric form used by wire-level configuration: `0` durable, `1` transient.
    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(QueueDurability::Durable),
            1 => Ok(QueueDurability::Transient),
            other => Err(AmqpError::InvalidPolicy(other.to_string())),
        }
    }
}

/// The declaration flags sent with a queue declaration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct QueueOptions {
    pub durable: bool,
    pub auto_delete: bool,
    pub exclusive: bool,
}

/// Definition of a queue with its declaration flags and arguments.
///
/// Built from a durability policy; the dead-letter exchange is attached by the
/// topology manager before the definition ever reaches the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) options: QueueOptions,
    pub(crate) arguments: BTreeMap<String, String>,
}

impl QueueDefinition {
    /// Creates a new queue definition for the given policy.
    ///
    /// # Parameters
    /// * `name` - The name of the queue, empty for a broker-named queue
    /// * `durability` - The durability policy resolving the declaration flags
    pub fn new(name: &str, durability: QueueDurability) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            options: durability.options(),
            arguments: BTreeMap::new(),
        }
    }

    /// Attaches the dead-letter exchange argument.
    pub fn dead_letter_exchange(mut self, exchange: &str) -> Self {
        self.arguments.insert(
            AMQP_HEADERS_DEAD_LETTER_EXCHANGE.to_owned(),
            exchange.to_owned(),
        );
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> QueueOptions {
        self.options
    }

    /// Queue arguments, keyed by their `x-` header name.
    pub fn arguments(&self) -> &BTreeMap<String, String> {
        &self.arguments
    }
}

/// Configuration for binding a queue to an exchange.
///
/// Carries everything the topology manager needs to declare and bind one
/// logical queue: exchange, queue name, binding key and durability policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueBinding<'qeb> {
    pub(crate) queue_name: &'qeb str,
    pub(crate) exchange_name: &'qeb str,
    pub(crate) routing_key: &'qeb str,
    pub(crate) durability: QueueDurability,
}

impl<'qeb> QueueBinding<'qeb> {
    /// Creates a new queue binding for the given queue.
    ///
    /// By default, the exchange name and routing key are empty strings.
    /// These should be set using the `exchange` and `routing_key` methods.
    pub fn new(queue: &'qeb str, durability: QueueDurability) -> QueueBinding<'qeb> {
        QueueBinding {
            queue_name: queue,
            exchange_name: "",
            routing_key: "",
            durability,
        }
    }

    /// Sets the exchange to bind the queue to.
    pub fn exchange(mut self, exchange: &'qeb str) -> Self {
        self.exchange_name = exchange;
        self
    }

    /// Sets the binding key, a topic pattern for topic exchanges.
    pub fn routing_key(mut self, key: &'qeb str) -> Self {
        self.routing_key = key;
        self
    }

    pub fn queue_name(&self) -> &str {
        self.queue_name
    }

    pub fn exchange_name(&self) -> &str {
        self.exchange_name
    }

    pub fn key(&self) -> &str {
        self.routing_key
    }

    pub fn durability(&self) -> QueueDurability {
        self.durability
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durable_policy_survives_restarts_and_is_shared() {
        let opts = QueueDurability::Durable.options();
        assert!(opts.durable);
        assert!(!opts.auto_delete);
        assert!(!opts.exclusive);
    }

    #[test]
    fn transient_policy_is_auto_deleted_and_exclusive() {
        let opts = QueueDurability::Transient.options();
        assert!(!opts.durable);
        assert!(opts.auto_delete);
        assert!(opts.exclusive);
    }

    #[test]
    fn parses_policy_names() {
        assert_eq!(
            "durable".parse::<QueueDurability>(),
            Ok(QueueDurability::Durable)
        );
        assert_eq!(
            QueueDurability::try_from(" Transient "),
            Ok(QueueDurability::Transient)
        );
        assert_eq!(
            QueueDurability::try_from("ephemeral"),
            Err(AmqpError::InvalidPolicy("ephemeral".to_owned()))
        );
    }

    #[test]
    fn numeric_policy_outside_range_is_invalid() {
        assert_eq!(QueueDurability::try_from(0u8), Ok(QueueDurability::Durable));
        assert_eq!(
            QueueDurability::try_from(1u8),
            Ok(QueueDurability::Transient)
        );
        for raw in 2u8..=10 {
            assert_eq!(
                QueueDurability::try_from(raw),
                Err(AmqpError::InvalidPolicy(raw.to_string()))
            );
        }
    }

    #[test]
    fn definition_carries_dead_letter_argument() {
        let def = QueueDefinition::new("game_logs", QueueDurability::Durable)
            .dead_letter_exchange("peril_dlx");

        assert_eq!(def.name(), "game_logs");
        assert_eq!(
            def.arguments().get(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
            Some(&"peril_dlx".to_owned())
        );
    }
}
