// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Typed Pub/Sub Layer
//!
//! This module provides the error type shared by every operation of the crate.
//! The `AmqpError` enum covers policy resolution, topology declaration, payload
//! encoding and decoding, flow control and broker I/O.

use std::convert::Infallible;
use thiserror::Error;

/// Represents errors that can occur while declaring topology, publishing or
/// subscribing.
///
/// Errors are always returned to the immediate caller of the failing
/// operation. The only error that is logged instead of returned is a decode
/// failure inside a running subscription loop.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// A queue durability policy outside of the supported values
    #[error("invalid queue durability policy `{0}`")]
    InvalidPolicy(String),

    /// Invalid or unparsable configuration value
    #[error("invalid configuration `{0}`")]
    ConfigError(String),

    /// Error establishing a connection to the broker
    #[error("failure to connect")]
    ConnectionError,

    /// Error creating a channel from an established connection
    #[error("failure to create a channel")]
    ChannelError,

    /// Declaration or binding disagrees with the topology the broker already holds
    #[error("topology conflict `{0}`")]
    TopologyConflict(String),

    /// Serialization of an outgoing value failed, nothing was sent
    #[error("failure to encode payload `{0}`")]
    EncodingError(String),

    /// Incoming bytes could not be decoded into the expected type
    #[error("failure to decode payload `{0}`")]
    DecodingError(String),

    /// The broker rejected the prefetch configuration
    #[error("failure to configure qos `{0}`")]
    FlowControlError(String),

    /// Any broker I/O failure
    #[error("transport failure `{0}`")]
    TransportError(String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,
}

impl From<Infallible> for AmqpError {
    fn from(err: Infallible) -> Self {
        match err {}
    }
}
