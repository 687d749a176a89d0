// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Handlers
//!
//! Domain logic plugs into a subscription through [`MessageHandler`]: it gets a
//! decoded value and answers with an [`AckDecision`]. Retry versus discard is a
//! value the handler returns, never an error it raises.

use futures_util::future::BoxFuture;
use std::future::{ready, Future};

/// The only three outcomes a handler may produce for one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AckDecision {
    /// Fully processed, remove it from the queue.
    Ack,
    /// Failed for a possibly transient reason, put it back for redelivery.
    NackRequeue,
    /// Unprocessable, remove it and let the broker dead-letter it.
    NackDiscard,
}

/// Handles decoded messages of type `T`.
///
/// Implemented for async closures `Fn(T) -> impl Future<Output = AckDecision>`
/// and, through [`sync_handler`], for plain `Fn(T) -> AckDecision`.
pub trait MessageHandler<T>: Send + Sync + 'static {
    fn handle(&self, msg: T) -> BoxFuture<'_, AckDecision>;
}

impl<T, F, Fut> MessageHandler<T> for F
where
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = AckDecision> + Send + 'static,
{
    fn handle(&self, msg: T) -> BoxFuture<'_, AckDecision> {
        Box::pin((self)(msg))
    }
}

/// Adapter for handlers that never await.
pub struct SyncHandler<F>(F);

/// Wraps a synchronous `Fn(T) -> AckDecision` into a [`MessageHandler`].
pub fn sync_handler<T, F>(f: F) -> SyncHandler<F>
where
    F: Fn(T) -> AckDecision + Send + Sync + 'static,
{
    SyncHandler(f)
}

impl<T, F> MessageHandler<T> for SyncHandler<F>
where
    F: Fn(T) -> AckDecision + Send + Sync + 'static,
{
    fn handle(&self, msg: T) -> BoxFuture<'_, AckDecision> {
        Box::pin(ready((self.0)(msg)))
    }
}
