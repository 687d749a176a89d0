// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Delivery Processing
//!
//! This module processes one delivery of a subscription:
//! 1. Opens a consumer span parented on the publisher's trace context
//! 2. Decodes the payload with the subscription's codec
//! 3. Invokes the handler with the decoded value
//! 4. Resolves the handler's decision against the broker
//!
//! A delivery that fails to decode is handled by the subscription's
//! [`DecodeFailurePolicy`]; by default it is left unresolved.

use crate::{
    broker::Delivery,
    codec::Codec,
    errors::AmqpError,
    handler::{AckDecision, MessageHandler},
    otel,
    subscriber::DecodeFailurePolicy,
};
use opentelemetry::{
    global::BoxedTracer,
    trace::{Span, Status},
};
use serde::de::DeserializeOwned;
use tracing::{debug, error, warn};

/// Processes a single delivery from `queue`.
///
/// # Returns
/// The decision that was applied, or the error that prevented applying one.
/// A `DecodingError` means the handler was never invoked.
pub(crate) async fn consume<T, C, H>(
    tracer: &BoxedTracer,
    delivery: Delivery,
    queue: &str,
    codec: &C,
    handler: &H,
    on_decode_failure: DecodeFailurePolicy,
) -> Result<AckDecision, AmqpError>
where
    T: DeserializeOwned,
    C: Codec,
    H: MessageHandler<T>,
{
    let (_ctx, mut span) = otel::new_span(&delivery.properties, tracer, queue);
    let delivery_tag = delivery.delivery_tag;

    debug!(
        queue,
        delivery_tag,
        redelivered = delivery.redelivered,
        "received: {} - exchange: {}",
        delivery.routing_key,
        delivery.exchange,
    );

    if let Some(content_type) = delivery.properties.content_type.as_deref() {
        if content_type != codec.content_type() {
            warn!(
                queue,
                content_type,
                expected = codec.content_type(),
                "unexpected content type, decoding anyway"
            );
        }
    }

    let msg: T = match codec.decode(&delivery.data) {
        Ok(msg) => msg,
        Err(err) => {
            span.record_error(&err);
            span.set_status(Status::error("failure to decode msg"));
            warn!(error = err.to_string(), queue, delivery_tag, "could not decode message");

            let requeue = match on_decode_failure {
                DecodeFailurePolicy::LeaveUnresolved => {
                    warn!(
                        queue,
                        delivery_tag,
                        "delivery left unresolved until its channel closes"
                    );
                    return Err(err);
                }
                DecodeFailurePolicy::Discard => false,
                DecodeFailurePolicy::Requeue => true,
            };
            if let Err(nack_err) = delivery.nack(requeue).await {
                error!(
                    error = nack_err.to_string(),
                    queue,
                    delivery_tag,
                    requeue,
                    "error to nack undecodable msg"
                );
            }

            return Err(err);
        }
    };

    let decision = handler.handle(msg).await;
    debug!(queue, delivery_tag, decision = ?decision, "message handled");

    match delivery.resolve(decision).await {
        Err(err) => {
            error!(error = err.to_string(), queue, delivery_tag, "error to resolve msg");
            span.record_error(&err);
            span.set_status(Status::error("error to resolve msg"));
            Err(err)
        }
        Ok(()) => {
            span.set_status(match decision {
                AckDecision::Ack => Status::Ok,
                AckDecision::NackRequeue => Status::error("msg requeued"),
                AckDecision::NackDiscard => Status::error("msg discarded"),
            });
            Ok(decision)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        broker::{DeliveryAcker, MessageProperties},
        codec::{BincodeCodec, JsonCodec},
        handler::sync_handler,
    };
    use async_trait::async_trait;
    use opentelemetry::global;
    use std::sync::{Arc, Mutex};

    struct FailingAcker;

    #[async_trait]
    impl DeliveryAcker for FailingAcker {
        async fn ack(&self, _: u64) -> Result<(), AmqpError> {
            Err(AmqpError::AckMessageError)
        }

        async fn nack(&self, _: u64, _: bool) -> Result<(), AmqpError> {
            Err(AmqpError::NackMessageError)
        }
    }

    #[derive(Default)]
    struct RecordingAcker {
        calls: Mutex<Vec<Option<bool>>>,
    }

    #[async_trait]
    impl DeliveryAcker for RecordingAcker {
        async fn ack(&self, _: u64) -> Result<(), AmqpError> {
            self.calls.lock().unwrap().push(None);
            Ok(())
        }

        async fn nack(&self, _: u64, requeue: bool) -> Result<(), AmqpError> {
            self.calls.lock().unwrap().push(Some(requeue));
            Ok(())
        }
    }

    fn delivery(acker: &Arc<RecordingAcker>, data: Vec<u8>) -> Delivery {
        Delivery::new(1, data, acker.clone())
            .with_properties(MessageProperties::default().with_content_type("application/json"))
    }

    #[tokio::test]
    async fn handler_decision_is_applied() {
        let tracer = global::tracer("test");
        let acker = Arc::new(RecordingAcker::default());
        let handler = sync_handler(|units: u32| {
            if units > 0 {
                AckDecision::NackRequeue
            } else {
                AckDecision::Ack
            }
        });

        let decision = consume::<u32, _, _>(
            &tracer,
            delivery(&acker, b"3".to_vec()),
            "moves",
            &JsonCodec,
            &handler,
            DecodeFailurePolicy::default(),
        )
        .await;

        assert_eq!(decision, Ok(AckDecision::NackRequeue));
        assert_eq!(*acker.calls.lock().unwrap(), vec![Some(true)]);
    }

    #[tokio::test]
    async fn undecodable_delivery_is_left_unresolved_by_default() {
        let tracer = global::tracer("test");
        let acker = Arc::new(RecordingAcker::default());
        let handler = sync_handler(|_: u32| panic!("handler must not run"));

        let result = consume::<u32, _, _>(
            &tracer,
            delivery(&acker, b"not json".to_vec()),
            "moves",
            &JsonCodec,
            &handler,
            DecodeFailurePolicy::LeaveUnresolved,
        )
        .await;

        assert!(matches!(result, Err(AmqpError::DecodingError(_))));
        assert!(acker.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn undecodable_delivery_follows_configured_policy() {
        let tracer = global::tracer("test");
        let handler = sync_handler(|_: u32| AckDecision::Ack);

        for (policy, expected) in [
            (DecodeFailurePolicy::Discard, Some(false)),
            (DecodeFailurePolicy::Requeue, Some(true)),
        ] {
            let acker = Arc::new(RecordingAcker::default());
            let result = consume::<u32, _, _>(
                &tracer,
                delivery(&acker, vec![]),
                "logs",
                &BincodeCodec,
                &handler,
                policy,
            )
            .await;

            assert!(matches!(result, Err(AmqpError::DecodingError(_))));
            assert_eq!(*acker.calls.lock().unwrap(), vec![expected]);
        }
    }

    #[tokio::test]
    async fn failed_nack_still_reports_the_decoding_error() {
        let tracer = global::tracer("test");
        let handler = sync_handler(|_: u32| AckDecision::Ack);

        for policy in [DecodeFailurePolicy::Discard, DecodeFailurePolicy::Requeue] {
            let result = consume::<u32, _, _>(
                &tracer,
                Delivery::new(9, b"not json".to_vec(), Arc::new(FailingAcker)),
                "moves",
                &JsonCodec,
                &handler,
                policy,
            )
            .await;

            assert!(matches!(result, Err(AmqpError::DecodingError(_))));
        }
    }
}
