// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Payload Codecs
//!
//! A codec turns a typed value into bytes and back, and names the content type
//! stamped on every message it encodes. The payload type is a static contract
//! between publisher and subscriber: both sides pick the same codec and type.

use crate::errors::AmqpError;
use serde::{de::DeserializeOwned, Serialize};

/// Content type of JSON encoded messages
pub const JSON_CONTENT_TYPE: &str = "application/json";
/// Content type of bincode encoded messages
pub const BINCODE_CONTENT_TYPE: &str = "application/x-bincode";

/// Encode/decode pair for message payloads.
pub trait Codec: Send + Sync + 'static {
    /// The content type tag set on published messages.
    fn content_type(&self) -> &'static str;

    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>, AmqpError>;

    fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T, AmqpError>;
}

/// Human-readable JSON codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn content_type(&self) -> &'static str {
        JSON_CONTENT_TYPE
    }

    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>, AmqpError> {
        serde_json::to_vec(value).map_err(|err| AmqpError::EncodingError(err.to_string()))
    }

    fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T, AmqpError> {
        serde_json::from_slice(data).map_err(|err| AmqpError::DecodingError(err.to_string()))
    }
}

/// Compact binary codec backed by `bincode`.
///
/// The format is not self-describing, so payload types must not rely on
/// `Deserializer::deserialize_any`. Internally tagged (`#[serde(tag = ...)]`)
/// and untagged enums encode fine but never decode, and
/// `skip_serializing_if` shifts every later field. `#[serde(flatten)]` is
/// rejected at encode time. Use [`JsonCodec`] for such types.
#[derive(Debug, Clone, Copy, Default)]
pub struct BincodeCodec;

impl Codec for BincodeCodec {
    fn content_type(&self) -> &'static str {
        BINCODE_CONTENT_TYPE
    }

    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>, AmqpError> {
        bincode::serialize(value).map_err(|err| AmqpError::EncodingError(err.to_string()))
    }

    fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T, AmqpError> {
        bincode::deserialize(data).map_err(|err| AmqpError::DecodingError(err.to_string()))
    }
}
