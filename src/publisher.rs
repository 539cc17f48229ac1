// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Producer
//!
//! Callers on any task enqueue messages on a bounded queue; a single session
//! loop owns the broker channel and publishes them in FIFO order, reporting
//! each result back through a one-shot completion slot.
//!
//! A full queue blocks the caller until space frees or the caller's token is
//! cancelled. A publish error that means the channel is gone ends the session
//! so the reconnect loop can redial; other publish errors only reach the
//! caller they belong to. Cancelling the producer's lifetime token stops new
//! enqueues and drains what is already buffered before the loop exits.

use crate::{
    channel::Session,
    configs::Options,
    errors::{AmqpError, ErrorObserver},
    message::Message,
    otel::{self, PRODUCER_TRACER},
    runloop::{run_loop, SessionHandler},
    service::{Lifecycle, Service},
    topology::Topology,
};
use async_trait::async_trait;
use lapin::types::ShortString;
use opentelemetry::{
    global,
    trace::{SpanKind, Status, TraceContextExt},
    Context, KeyValue,
};
use std::{borrow::Cow, sync::Arc};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};
use uuid::Uuid;

/// A message waiting in the outbound queue.
struct OutboundMessage {
    exchange: String,
    routing_key: String,
    message: Message,
    cancel: CancellationToken,
    done: oneshot::Sender<Result<(), AmqpError>>,
}

impl OutboundMessage {
    fn complete(self, result: Result<(), AmqpError>) {
        // the caller may have given up already
        let _ = self.done.send(result);
    }
}

/// Publishes messages to RabbitMQ exchanges over a reconnecting session.
pub struct Producer {
    sender: mpsc::Sender<OutboundMessage>,
    options: Options,
    state: Mutex<Lifecycle<mpsc::Receiver<OutboundMessage>>>,
}

impl Producer {
    /// Creates a producer. Messages published before `start` wait in the queue.
    pub fn new(options: Options) -> Self {
        let (sender, receiver) = mpsc::channel(options.queue_capacity.max(1));

        Producer {
            sender,
            options,
            state: Mutex::new(Lifecycle::Idle(receiver)),
        }
    }

    /// Publishes `payload` as a transient message.
    pub async fn publish(
        &self,
        ctx: &Context,
        cancel: &CancellationToken,
        exchange: &str,
        key: &str,
        payload: impl Into<Vec<u8>>,
    ) -> Result<(), AmqpError> {
        self.publish_msg(ctx, cancel, exchange, key, Message::new(payload))
            .await
    }

    /// Publishes `msg` and waits for its outcome.
    ///
    /// The trace context of `ctx` is injected into the message headers. Returns
    /// once the session loop reported a result or `cancel` fired, whichever
    /// comes first.
    pub async fn publish_msg(
        &self,
        ctx: &Context,
        cancel: &CancellationToken,
        exchange: &str,
        key: &str,
        mut msg: Message,
    ) -> Result<(), AmqpError> {
        if cancel.is_cancelled() {
            return Err(AmqpError::Canceled);
        }

        let tracer = global::tracer(PRODUCER_TRACER);
        let span = otel::new_span(
            &tracer,
            ctx,
            "amqp.publish",
            SpanKind::Producer,
            vec![
                KeyValue::new("exchange", exchange.to_owned()),
                KeyValue::new("routingkey", key.to_owned()),
            ],
        );
        let ctx = ctx.with_span(span);

        let mut headers = msg.headers();
        otel::inject_context(&ctx, &mut headers);
        msg.set_headers(headers);

        if msg.properties.message_id().is_none() {
            msg.properties = msg
                .properties
                .with_message_id(ShortString::from(Uuid::new_v4().to_string()));
        }

        let result = self.enqueue(cancel, exchange, key, msg).await;

        let span = ctx.span();
        if let Err(err) = &result {
            span.record_error(err);
            span.set_status(Status::Error {
                description: Cow::from(err.to_string()),
            });
        }
        span.end();

        result
    }

    async fn enqueue(
        &self,
        cancel: &CancellationToken,
        exchange: &str,
        key: &str,
        message: Message,
    ) -> Result<(), AmqpError> {
        let (done, outcome) = oneshot::channel();
        let outbound = OutboundMessage {
            exchange: exchange.to_owned(),
            routing_key: key.to_owned(),
            message,
            cancel: cancel.clone(),
            done,
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(AmqpError::Canceled),
            sent = self.sender.send(outbound) => {
                if sent.is_err() {
                    return Err(AmqpError::ProducerClosed);
                }
            }
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(AmqpError::Canceled),
            result = outcome => result.unwrap_or(Err(AmqpError::ProducerClosed)),
        }
    }
}

#[async_trait]
impl Service for Producer {
    /// Validates the connection settings and launches the session loop.
    async fn start(&self, parent: &CancellationToken) -> Result<(), AmqpError> {
        let connector = self.options.resolve_connector()?;
        let interval = self.options.reconnect_interval;
        let topology = self.options.topology.clone();
        let on_error = self.options.on_error.clone();

        self.state.lock().await.start(parent, move |receiver, cancel| {
            let handler = ProducerLoop {
                receiver,
                topology,
                on_error,
            };
            tokio::spawn(run_loop(connector, interval, cancel, handler))
        })
    }

    /// Stops accepting messages and waits until the buffered ones were handled.
    async fn stop(&self) -> Result<(), AmqpError> {
        self.state.lock().await.stop().await
    }
}

/// Owns the receiving end of the outbound queue across sessions.
struct ProducerLoop {
    receiver: mpsc::Receiver<OutboundMessage>,
    topology: Topology,
    on_error: Arc<dyn ErrorObserver>,
}

impl ProducerLoop {
    /// Publishes one message, bounded by the caller's token.
    ///
    /// Returns false when the session is gone.
    async fn publish_one(&self, session: &dyn Session, outbound: OutboundMessage) -> bool {
        if outbound.cancel.is_cancelled() {
            outbound.complete(Err(AmqpError::Canceled));
            return true;
        }

        let result = tokio::select! {
            biased;
            _ = outbound.cancel.cancelled() => {
                debug!("caller cancelled while publishing");
                Err(AmqpError::Canceled)
            }
            result = session.publish(
                &outbound.exchange,
                &outbound.routing_key,
                &outbound.message.payload,
                outbound.message.properties.clone(),
            ) => result,
        };

        let alive = match &result {
            Err(err) if err.is_channel_closed() => {
                error!(error = err.to_string(), "channel closed while publishing");
                self.on_error.on_error(err);
                false
            }
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                true
            }
            Ok(()) => true,
        };

        outbound.complete(result);
        alive
    }

    async fn drain(&mut self, session: &dyn Session) {
        debug!("draining outbound queue");
        self.receiver.close();

        while let Some(outbound) = self.receiver.recv().await {
            if !self.publish_one(session, outbound).await {
                break;
            }
        }
    }
}

#[async_trait]
impl SessionHandler for ProducerLoop {
    async fn handle(
        &mut self,
        cancel: &CancellationToken,
        session: Result<Arc<dyn Session>, AmqpError>,
    ) -> bool {
        let session = match session {
            Ok(session) => session,
            Err(err) => {
                self.on_error.on_error(&err);
                return true;
            }
        };

        if let Err(err) = self.topology.apply(session.as_ref()).await {
            self.on_error.on_error(&err);
            return true;
        }
        debug!("producer session ready");

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.drain(session.as_ref()).await;
                    return false;
                }
                outbound = self.receiver.recv() => {
                    let Some(outbound) = outbound else {
                        return false;
                    };
                    if !self.publish_one(session.as_ref(), outbound).await {
                        return true;
                    }
                }
            }
        }
    }
}
