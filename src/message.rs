// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Types
//!
//! Outbound messages handed to the producer, inbound messages handed to
//! consumer handlers, and the delivery stream a session yields for a queue.

use crate::errors::AmqpError;
use async_trait::async_trait;
use futures_util::{stream::BoxStream, StreamExt};
use lapin::{
    options::{BasicAckOptions, BasicNackOptions},
    types::{AMQPValue, FieldTable, ShortString},
    BasicProperties,
};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// AMQP delivery mode for non-persistent messages
pub const DELIVERY_MODE_TRANSIENT: u8 = 1;
/// AMQP delivery mode for persistent messages
pub const DELIVERY_MODE_PERSISTENT: u8 = 2;

/// A message to publish: an opaque payload plus its AMQP properties.
#[derive(Debug, Clone)]
pub struct Message {
    pub(crate) payload: Vec<u8>,
    pub(crate) properties: BasicProperties,
}

impl Message {
    /// Creates a transient message with priority 0.
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Message {
            payload: payload.into(),
            properties: BasicProperties::default()
                .with_delivery_mode(DELIVERY_MODE_TRANSIENT)
                .with_priority(0),
        }
    }

    /// Serializes `value` as the JSON payload of a new message.
    pub fn json<T: Serialize>(value: &T) -> Result<Self, AmqpError> {
        let payload = serde_json::to_vec(value)
            .map_err(|err| AmqpError::InternalError(err.to_string()))?;

        Ok(Message::new(payload).with_content_type(JSON_CONTENT_TYPE))
    }

    /// Replaces the whole property set.
    pub fn with_properties(mut self, properties: BasicProperties) -> Self {
        self.properties = properties;
        self
    }

    /// Sets the MIME content type, e.g. `application/json`.
    pub fn with_content_type(mut self, content_type: &str) -> Self {
        self.properties = self
            .properties
            .with_content_type(ShortString::from(content_type));
        self
    }

    /// Sets the message id. Messages published without one get a random UUID.
    pub fn with_message_id(mut self, id: &str) -> Self {
        self.properties = self.properties.with_message_id(ShortString::from(id));
        self
    }

    /// Marks the message persistent so durable queues keep it across restarts.
    pub fn persistent(mut self) -> Self {
        self.properties = self.properties.with_delivery_mode(DELIVERY_MODE_PERSISTENT);
        self
    }

    /// Adds a header to the property table, replacing any previous value.
    pub fn with_header(mut self, key: &str, value: AMQPValue) -> Self {
        let mut headers = self.headers();
        headers.insert(ShortString::from(key), value);
        self.properties = self.properties.with_headers(headers);
        self
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn properties(&self) -> &BasicProperties {
        &self.properties
    }

    /// A copy of the header table, empty when none was set.
    pub fn headers(&self) -> FieldTable {
        self.properties.headers().clone().unwrap_or_default()
    }

    pub(crate) fn set_headers(&mut self, headers: FieldTable) {
        self.properties = self.properties.clone().with_headers(headers);
    }
}

/// A message received from a queue, as seen by a consumer handler.
#[derive(Debug, Clone)]
pub struct ConsumerMessage {
    pub queue: String,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub data: Vec<u8>,
    pub properties: BasicProperties,
}

impl ConsumerMessage {
    /// A copy of the header table, empty when none was set.
    pub fn headers(&self) -> FieldTable {
        self.properties.headers().clone().unwrap_or_default()
    }
}

/// Acknowledgment side of a delivery.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<(), AmqpError>;

    async fn nack(&self, requeue: bool) -> Result<(), AmqpError>;
}

#[async_trait]
impl Acknowledger for lapin::acker::Acker {
    async fn ack(&self) -> Result<(), AmqpError> {
        lapin::acker::Acker::ack(self, BasicAckOptions { multiple: false })
            .await
            .map(|_| ())
            .map_err(|err| AmqpError::AckMessageError(err.to_string()))
    }

    async fn nack(&self, requeue: bool) -> Result<(), AmqpError> {
        lapin::acker::Acker::nack(
            self,
            BasicNackOptions {
                multiple: false,
                requeue,
            },
        )
        .await
        .map(|_| ())
        .map_err(|err| AmqpError::NackMessageError(err.to_string()))
    }
}

/// A delivery pulled from a queue: the message and the handle used to settle it.
pub struct Delivery {
    pub message: ConsumerMessage,
    pub acker: Arc<dyn Acknowledger>,
}

impl Delivery {
    pub(crate) fn from_lapin(queue: &str, delivery: lapin::message::Delivery) -> Self {
        Delivery {
            message: ConsumerMessage {
                queue: queue.to_owned(),
                exchange: delivery.exchange.to_string(),
                routing_key: delivery.routing_key.to_string(),
                redelivered: delivery.redelivered,
                data: delivery.data,
                properties: delivery.properties,
            },
            acker: Arc::new(delivery.acker),
        }
    }
}

/// Stream of deliveries for one queue, shared by every worker of that queue.
///
/// Cloning is cheap; each call to `next` hands a delivery to exactly one caller.
#[derive(Clone)]
pub struct DeliveryStream {
    inner: Arc<Mutex<BoxStream<'static, Result<Delivery, AmqpError>>>>,
}

impl DeliveryStream {
    pub fn new(stream: BoxStream<'static, Result<Delivery, AmqpError>>) -> Self {
        DeliveryStream {
            inner: Arc::new(Mutex::new(stream)),
        }
    }

    /// Next delivery, `None` once the broker side closed the stream.
    pub async fn next(&self) -> Option<Result<Delivery, AmqpError>> {
        self.inner.lock().await.next().await
    }
}
