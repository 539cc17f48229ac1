// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Consumer
//!
//! Handler seam and the per-delivery processing shared by every worker: trace
//! context extraction, the consumer span, panic isolation and the
//! acknowledgment decision.
//!
//! Each delivery is settled exactly once, after the handler returned:
//!
//! | handler outcome              | decision                 |
//! |------------------------------|--------------------------|
//! | `Ok(())`                     | ack                      |
//! | `Err(HandlerError::Requeue)` | nack, requeue            |
//! | `Err(HandlerError::Reject)`  | nack, no requeue         |
//! | panic                        | nack, no requeue         |
//!
//! A rejected delivery is dead-lettered when its queue was declared with a DLQ.

use crate::{
    errors::{AmqpError, HandlerError},
    message::{ConsumerMessage, Delivery},
    otel,
};
use async_trait::async_trait;
use futures_util::FutureExt;
use opentelemetry::{
    global::BoxedTracer,
    trace::{SpanKind, Status, TraceContextExt},
    Context, KeyValue,
};
use std::{any::Any, borrow::Cow, future::Future, panic::AssertUnwindSafe, sync::Arc};
use tracing::{debug, error, warn};

/// Processes the messages of one queue.
#[async_trait]
pub trait ConsumerHandler: Send + Sync {
    /// Handles one message. `ctx` carries the consumer span, a child of the
    /// trace context found in the message headers.
    async fn exec(&self, ctx: &Context, msg: &ConsumerMessage) -> Result<(), HandlerError>;
}

struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> ConsumerHandler for FnHandler<F>
where
    F: Fn(Context, ConsumerMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn exec(&self, ctx: &Context, msg: &ConsumerMessage) -> Result<(), HandlerError> {
        (self.f)(ctx.clone(), msg.clone()).await
    }
}

/// Wraps an async closure as a `ConsumerHandler`.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn ConsumerHandler>
where
    F: Fn(Context, ConsumerMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler { f })
}

/// What happens to a delivery once the handler is done with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Decision {
    Ack,
    Requeue,
    Reject,
}

/// Runs `handler` on one delivery and settles it.
///
/// Only acknowledgment failures are returned; handler failures are folded
/// into the decision.
pub(crate) async fn consume(
    tracer: &BoxedTracer,
    delivery: Delivery,
    handler: &dyn ConsumerHandler,
) -> Result<(), AmqpError> {
    let Delivery { message, acker } = delivery;

    let parent = otel::extract_context(&message.headers());
    let span = otel::new_span(
        tracer,
        &parent,
        "amqp.consumer",
        SpanKind::Consumer,
        vec![KeyValue::new("queue", message.queue.clone())],
    );
    let ctx = parent.with_span(span);

    debug!(
        queue = message.queue,
        exchange = message.exchange,
        routing_key = message.routing_key,
        "received"
    );

    let outcome = AssertUnwindSafe(handler.exec(&ctx, &message))
        .catch_unwind()
        .await;

    let span = ctx.span();
    let decision = match outcome {
        Ok(Ok(())) => {
            debug!("message successfully processed");
            span.set_status(Status::Ok);
            Decision::Ack
        }
        Ok(Err(err)) => {
            warn!(queue = message.queue, error = err.to_string(), "handler failed");
            span.record_error(&err);
            span.set_status(Status::Error {
                description: Cow::from(err.to_string()),
            });
            match err {
                HandlerError::Requeue(_) => Decision::Requeue,
                HandlerError::Reject(_) => Decision::Reject,
            }
        }
        Err(panic) => {
            let reason = panic_reason(panic.as_ref());
            error!(queue = message.queue, reason = reason, "handler panicked");
            span.set_status(Status::Error {
                description: Cow::from(format!("handler panicked: {}", reason)),
            });
            Decision::Reject
        }
    };

    let settled = match decision {
        Decision::Ack => acker.ack().await,
        Decision::Requeue => acker.nack(true).await,
        Decision::Reject => acker.nack(false).await,
    };

    if let Err(err) = &settled {
        error!(error = err.to_string(), "error settling message");
        span.record_error(err);
        span.set_status(Status::Error {
            description: Cow::from(err.to_string()),
        });
    }
    span.end();

    settled
}

fn panic_reason(panic: &(dyn Any + Send)) -> String {
    if let Some(reason) = panic.downcast_ref::<&str>() {
        return (*reason).to_owned();
    }
    if let Some(reason) = panic.downcast_ref::<String>() {
        return reason.clone();
    }
    "unknown".to_owned()
}
