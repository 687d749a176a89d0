// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod consumer;
mod otel;

pub mod broker;
pub mod channel;
pub mod codec;
pub mod config;
pub mod errors;
pub mod exchange;
pub mod handler;
#[cfg(any(test, feature = "test-util"))]
pub mod memory;
pub mod publisher;
pub mod queue;
pub mod subscriber;
pub mod topology;
