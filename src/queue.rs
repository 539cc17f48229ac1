// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Definitions
//!
//! Types describing RabbitMQ queues and the bindings that connect them to
//! exchanges. A queue may carry a Dead Letter Queue (DLQ), which receives the
//! deliveries a consumer rejects so failed work is never silently discarded.

use lapin::{
    options::QueueDeclareOptions,
    types::{AMQPValue, FieldTable, LongInt, LongString, ShortString},
};
use serde::Deserialize;
use std::collections::BTreeMap;

/// Constant for the argument used to specify a dead letter exchange
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Constant for the argument used to specify a dead letter routing key
pub const AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
/// Constant for the argument used to specify message TTL
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";
/// Constant for the argument used to specify maximum queue length
pub const AMQP_HEADERS_MAX_LENGTH: &str = "x-max-length";
/// Constant for the argument used to specify maximum queue size in bytes
pub const AMQP_HEADERS_MAX_LENGTH_BYTES: &str = "x-max-length-bytes";

/// Definition of a RabbitMQ queue with its configuration parameters.
///
/// Besides the standard flags it supports message TTL, max length, a Dead
/// Letter Queue and any number of exchange bindings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct QueueDefinition {
    pub(crate) name: String,
    #[serde(default)]
    pub(crate) durable: bool,
    #[serde(default, alias = "auto_delete")]
    pub(crate) delete: bool,
    #[serde(default)]
    pub(crate) exclusive: bool,
    #[serde(default)]
    pub(crate) passive: bool,
    #[serde(default)]
    pub(crate) no_wait: bool,
    #[serde(default)]
    pub(crate) ttl: Option<i32>,
    #[serde(default)]
    pub(crate) max_length: Option<i32>,
    #[serde(default)]
    pub(crate) max_length_bytes: Option<i32>,
    #[serde(default)]
    pub(crate) dlq_name: Option<String>,
    #[serde(default)]
    pub(crate) bindings: Vec<QueueBinding>,
}

impl QueueDefinition {
    /// Creates a new queue definition with the given name.
    ///
    /// By default the queue is non-durable, non-exclusive and has no bindings.
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            ..Default::default()
        }
    }

    /// Makes the queue durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Sets the queue to auto-delete when its last consumer goes away.
    pub fn delete(mut self) -> Self {
        self.delete = true;
        self
    }

    /// Makes the queue exclusive to the connection.
    ///
    /// Exclusive queues are deleted when the connection closes.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Makes the declaration passive, checking for existence only.
    pub fn passive(mut self) -> Self {
        self.passive = true;
        self
    }

    /// Sets the message Time-To-Live (TTL) for the queue, in milliseconds.
    pub fn ttl(mut self, ttl: i32) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Sets the maximum number of messages the queue can hold.
    pub fn max_length(mut self, max: i32) -> Self {
        self.max_length = Some(max);
        self
    }

    /// Sets the maximum size in bytes the queue can hold.
    pub fn max_length_bytes(mut self, max_bytes: i32) -> Self {
        self.max_length_bytes = Some(max_bytes);
        self
    }

    /// Adds a Dead Letter Queue (DLQ) to the queue.
    ///
    /// The DLQ receives rejected or expired messages from the main queue.
    /// Its name is the main queue name with a "-dlq" suffix.
    pub fn with_dlq(mut self) -> Self {
        self.dlq_name = Some(format!("{}-dlq", self.name));
        self
    }

    /// Binds the queue to `exchange` with `routing_key`.
    pub fn bind(mut self, exchange: &str, routing_key: &str) -> Self {
        self.bindings
            .push(QueueBinding::new(exchange).routing_key(routing_key));
        self
    }

    /// The queue name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The declared bindings, in declaration order.
    pub fn bindings(&self) -> &[QueueBinding] {
        &self.bindings
    }

    pub(crate) fn options(&self) -> QueueDeclareOptions {
        QueueDeclareOptions {
            passive: self.passive,
            durable: self.durable,
            exclusive: self.exclusive,
            auto_delete: self.delete,
            nowait: self.no_wait,
        }
    }

    /// Queue arguments derived from TTL, length limits and the DLQ.
    pub(crate) fn arguments(&self) -> FieldTable {
        let mut args = BTreeMap::new();

        if let Some(dlq_name) = &self.dlq_name {
            args.insert(
                ShortString::from(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
                AMQPValue::LongString(LongString::from("")),
            );
            args.insert(
                ShortString::from(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
                AMQPValue::LongString(LongString::from(dlq_name.clone())),
            );
        }

        if let Some(ttl) = self.ttl {
            args.insert(
                ShortString::from(AMQP_HEADERS_MESSAGE_TTL),
                AMQPValue::LongInt(LongInt::from(ttl)),
            );
        }

        if let Some(max) = self.max_length {
            args.insert(
                ShortString::from(AMQP_HEADERS_MAX_LENGTH),
                AMQPValue::LongInt(LongInt::from(max)),
            );
        }

        if let Some(max_bytes) = self.max_length_bytes {
            args.insert(
                ShortString::from(AMQP_HEADERS_MAX_LENGTH_BYTES),
                AMQPValue::LongInt(LongInt::from(max_bytes)),
            );
        }

        FieldTable::from(args)
    }

    /// Definition of the DLQ itself; it shares the main queue's flags.
    pub(crate) fn dlq(&self) -> Option<QueueDefinition> {
        self.dlq_name.as_ref().map(|dlq_name| QueueDefinition {
            name: dlq_name.clone(),
            durable: self.durable,
            delete: self.delete,
            exclusive: self.exclusive,
            passive: self.passive,
            no_wait: self.no_wait,
            ..Default::default()
        })
    }
}

/// Binding of a queue to an exchange.
///
/// The owning queue is implied by the `QueueDefinition` holding the binding.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct QueueBinding {
    pub(crate) exchange_name: String,
    #[serde(default)]
    pub(crate) routing_key: String,
}

impl QueueBinding {
    /// Creates a binding to the given exchange with an empty routing key.
    pub fn new(exchange: &str) -> QueueBinding {
        QueueBinding {
            exchange_name: exchange.to_owned(),
            routing_key: String::new(),
        }
    }

    /// Sets the routing key for the binding.
    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = key.to_owned();
        self
    }

    pub fn exchange(&self) -> &str {
        &self.exchange_name
    }

    pub fn key(&self) -> &str {
        &self.routing_key
    }
}
