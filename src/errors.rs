// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the RabbitMQ Producer/Consumer
//!
//! `AmqpError` covers every failure the session loops, the producer and the
//! consumer can surface. `HandlerError` is what a business handler returns to
//! drive the acknowledgment decision. `ErrorObserver` is the sink for failures
//! that happen inside the reconnect loop and never reach a caller.

use std::sync::Arc;
use thiserror::Error;
use tracing::error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
///
/// Transport variants carry the broker or client message so the error can be
/// cloned onto a publish completion slot and still be meaningful to the caller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error `{0}`")]
    InternalError(String),

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect `{0}`")]
    ConnectionError(String),

    /// Error creating a channel from an established connection
    #[error("failure to create a channel `{0}`")]
    ChannelError(String),

    /// The channel or its connection is gone; the session must be replaced
    #[error("channel closed `{0}`")]
    ChannelClosed(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding a queue to an exchange
    #[error("failure to bind queue `{1}` to exchange `{0}`")]
    BindingExchangeToQueueError(String, String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error publishing a message
    #[error("failure to publish `{0}`")]
    PublishingError(String),

    /// The broker negatively confirmed a published message
    #[error("message was nacked by the broker")]
    PublishNacked,

    /// Error declaring a consumer on the given queue
    #[error("failure to declare consumer `{0}`")]
    ConsumerDeclarationError(String),

    /// Error receiving a delivery
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),

    /// Error acknowledging a message
    #[error("failure to ack message `{0}`")]
    AckMessageError(String),

    /// Error negative-acknowledging a message
    #[error("failure to nack message `{0}`")]
    NackMessageError(String),

    /// The caller's cancellation token fired before a result was available
    #[error("operation canceled")]
    Canceled,

    /// The producer stopped accepting or processing messages
    #[error("producer is closed")]
    ProducerClosed,

    /// No connection string and no custom connector were configured
    #[error("missing connection string")]
    MissingConnectionString,

    /// A consumer was started without any subscription
    #[error("no subscription registered")]
    NoSubscriptions,

    /// A handler is already registered for the queue
    #[error("queue `{0}` already has a subscription")]
    DuplicateSubscription(String),

    /// Invalid option value
    #[error("invalid configuration `{0}`")]
    InvalidConfiguration(String),

    /// The service was already started
    #[error("already started")]
    AlreadyStarted,

    /// The service was stopped and cannot be started again
    #[error("stopped")]
    Stopped,
}

impl AmqpError {
    /// Whether the error means the current session is unusable and the
    /// owning loop must redial.
    pub fn is_channel_closed(&self) -> bool {
        matches!(self, AmqpError::ChannelClosed(_))
    }
}

impl From<lapin::Error> for AmqpError {
    fn from(err: lapin::Error) -> Self {
        match err {
            lapin::Error::InvalidChannelState(_)
            | lapin::Error::InvalidConnectionState(_)
            | lapin::Error::IOError(_) => AmqpError::ChannelClosed(err.to_string()),
            _ => AmqpError::InternalError(err.to_string()),
        }
    }
}

/// Failure returned by a consumer handler.
///
/// The variant decides what happens to the delivery: `Requeue` puts it back
/// on the queue, `Reject` drops it (or dead-letters it when the queue has a DLQ).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// Transient failure, the broker should redeliver the message
    #[error("handler failed, requeue: {0}")]
    Requeue(String),

    /// Permanent failure, the message must not be redelivered
    #[error("handler failed, reject: {0}")]
    Reject(String),
}

/// Sink for connection and channel level failures raised inside a reconnect loop.
///
/// Called synchronously from the loop that owns the session, so implementations
/// must not block.
pub trait ErrorObserver: Send + Sync {
    fn on_error(&self, err: &AmqpError);
}

impl<F> ErrorObserver for F
where
    F: Fn(&AmqpError) + Send + Sync,
{
    fn on_error(&self, err: &AmqpError) {
        self(err)
    }
}

/// Default observer, only logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogErrorObserver;

impl ErrorObserver for LogErrorObserver {
    fn on_error(&self, err: &AmqpError) {
        error!(error = err.to_string(), "amqp session failure");
    }
}

pub(crate) fn default_observer() -> Arc<dyn ErrorObserver> {
    Arc::new(LogErrorObserver)
}
