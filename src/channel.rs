// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Connection and Channel Management
//!
//! A `Session` is one connection plus one channel opened on it. The `Connector`
//! dials a new session; it never retries, retry cadence belongs to the
//! reconnect loop in `runloop`. `AmqpConnector` and `LapinSession` are the
//! lapin backed implementations.

use crate::{
    errors::AmqpError,
    exchange::ExchangeDefinition,
    message::{Delivery, DeliveryStream},
    queue::{QueueBinding, QueueDefinition},
    topology::QosDefinition,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    options::{
        BasicConsumeOptions, BasicPublishOptions, BasicQosOptions, ConfirmSelectOptions,
        QueueBindOptions,
    },
    types::{FieldTable, LongString},
    uri::AMQPUri,
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::{sync::Arc, time::Duration};
use tracing::{debug, error, warn};

/// Default heartbeat negotiated with the broker
pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(10);
/// Default upper bound for dial plus handshake
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Dials a fresh session to the broker.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Connector: Send + Sync {
    /// Opens a connection and a channel on it. A single attempt, no retry.
    async fn connect(&self) -> Result<Arc<dyn Session>, AmqpError>;
}

/// An open channel over an established connection.
///
/// Owned by the loop that created it; every publish and consume goes through it.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Session: Send + Sync {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError>;

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError>;

    async fn bind_queue(&self, queue: &str, binding: &QueueBinding) -> Result<(), AmqpError>;

    async fn qos(&self, qos: &QosDefinition) -> Result<(), AmqpError>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError>;

    /// Starts a manual-ack consumer on `queue`.
    async fn consume(&self, queue: &str, consumer_tag: &str)
        -> Result<DeliveryStream, AmqpError>;

    /// Closes the channel and its connection. Errors are swallowed, the
    /// session is being discarded anyway.
    async fn close(&self);
}

/// lapin backed `Connector`.
#[derive(Debug, Clone)]
pub struct AmqpConnector {
    uri: String,
    connection_name: Option<String>,
    heartbeat: Duration,
    connect_timeout: Duration,
    publisher_confirms: bool,
}

impl AmqpConnector {
    /// Creates a connector for the given connection string.
    pub fn new(uri: &str) -> Self {
        AmqpConnector {
            uri: uri.to_owned(),
            connection_name: None,
            heartbeat: DEFAULT_HEARTBEAT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            publisher_confirms: false,
        }
    }

    /// Name reported to the broker in the client properties.
    pub fn connection_name(mut self, name: &str) -> Self {
        self.connection_name = Some(name.to_owned());
        self
    }

    /// Heartbeat interval negotiated with the broker, sent as the `heartbeat`
    /// query parameter unless the connection string already carries one.
    pub fn heartbeat(mut self, heartbeat: Duration) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    /// Upper bound for a single dial, handshake included.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Puts every channel in confirm mode; publishes then wait for the broker ack.
    pub fn publisher_confirms(mut self) -> Self {
        self.publisher_confirms = true;
        self
    }

    fn amqp_uri(&self) -> Result<AMQPUri, AmqpError> {
        let mut uri: AMQPUri = self
            .uri
            .parse()
            .map_err(AmqpError::InvalidConfiguration)?;

        if uri.query.heartbeat.is_none() {
            uri.query.heartbeat =
                Some(u16::try_from(self.heartbeat.as_secs()).unwrap_or(u16::MAX));
        }

        Ok(uri)
    }

    async fn dial(&self) -> Result<Connection, AmqpError> {
        let mut options = ConnectionProperties::default();
        if let Some(name) = &self.connection_name {
            options = options.with_connection_name(LongString::from(name.clone()));
        }

        let uri = self.amqp_uri()?;

        match tokio::time::timeout(self.connect_timeout, Connection::connect_uri(uri, options))
            .await
        {
            Ok(Ok(conn)) => Ok(conn),
            Ok(Err(err)) => {
                error!(error = err.to_string(), "failure to connect");
                Err(AmqpError::ConnectionError(err.to_string()))
            }
            Err(_) => {
                error!("timeout while connecting");
                Err(AmqpError::ConnectionError("connect timeout".to_owned()))
            }
        }
    }
}

#[async_trait]
impl Connector for AmqpConnector {
    async fn connect(&self) -> Result<Arc<dyn Session>, AmqpError> {
        debug!("creating amqp connection...");
        let conn = self.dial().await?;
        debug!("amqp connected");

        debug!("creating amqp channel...");
        let channel = match conn.create_channel().await {
            Ok(c) => c,
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                if let Err(close_err) = conn.close(0, "channel failure").await {
                    debug!(error = close_err.to_string(), "error closing connection");
                }
                return Err(AmqpError::ChannelError(err.to_string()));
            }
        };

        if self.publisher_confirms {
            if let Err(err) = channel
                .confirm_select(ConfirmSelectOptions { nowait: false })
                .await
            {
                error!(error = err.to_string(), "error enabling publisher confirms");
                if let Err(close_err) = conn.close(0, "channel failure").await {
                    debug!(error = close_err.to_string(), "error closing connection");
                }
                return Err(AmqpError::ChannelError(err.to_string()));
            }
        }
        debug!("channel created");

        Ok(Arc::new(LapinSession {
            connection: conn,
            channel,
            publisher_confirms: self.publisher_confirms,
        }))
    }
}

/// A lapin connection with its single channel.
pub struct LapinSession {
    connection: Connection,
    channel: Channel,
    publisher_confirms: bool,
}

#[async_trait]
impl Session for LapinSession {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        self.channel
            .exchange_declare(
                &def.name,
                lapin::ExchangeKind::from(&def.kind),
                def.options(),
                def.arguments(),
            )
            .await
            .map_err(|err| AmqpError::DeclareExchangeError(format!("{}: {}", def.name, err)))
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        self.channel
            .queue_declare(&def.name, def.options(), def.arguments())
            .await
            .map(|_| ())
            .map_err(|err| AmqpError::DeclareQueueError(format!("{}: {}", def.name, err)))
    }

    async fn bind_queue(&self, queue: &str, binding: &QueueBinding) -> Result<(), AmqpError> {
        self.channel
            .queue_bind(
                queue,
                &binding.exchange_name,
                &binding.routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to bind queue to exchange");
                AmqpError::BindingExchangeToQueueError(
                    binding.exchange_name.clone(),
                    queue.to_owned(),
                )
            })
    }

    async fn qos(&self, qos: &QosDefinition) -> Result<(), AmqpError> {
        if qos.prefetch_size != 0 {
            warn!(
                prefetch_size = qos.prefetch_size,
                "prefetch size is not supported by the broker, ignoring"
            );
        }

        self.channel
            .basic_qos(
                qos.prefetch_count,
                BasicQosOptions {
                    global: qos.global,
                },
            )
            .await
            .map_err(|err| AmqpError::QoSDeclarationError(err.to_string()))
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError> {
        let confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                payload,
                properties,
            )
            .await
            .map_err(publish_error)?;

        if !self.publisher_confirms {
            return Ok(());
        }

        match confirm.await {
            Ok(confirmation) if confirmation.is_nack() => Err(AmqpError::PublishNacked),
            Ok(_) => Ok(()),
            Err(err) => Err(publish_error(err)),
        }
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, AmqpError> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to create the consumer");
                AmqpError::ConsumerDeclarationError(format!("{}: {}", queue, err))
            })?;

        let queue = queue.to_owned();
        let stream = consumer.map(move |result| {
            result
                .map(|delivery| Delivery::from_lapin(&queue, delivery))
                .map_err(|err| AmqpError::ConsumerError(err.to_string()))
        });

        Ok(DeliveryStream::new(stream.boxed()))
    }

    async fn close(&self) {
        if self.channel.status().connected() {
            if let Err(err) = self.channel.close(200, "OK").await {
                debug!(error = err.to_string(), "error closing channel");
            }
        }

        if self.connection.status().connected() {
            if let Err(err) = self.connection.close(200, "OK").await {
                debug!(error = err.to_string(), "error closing connection");
            }
        }
    }
}

/// Splits lapin publish failures into the reconnect-forcing class and the rest.
fn publish_error(err: lapin::Error) -> AmqpError {
    match AmqpError::from(err) {
        AmqpError::ChannelClosed(msg) => AmqpError::ChannelClosed(msg),
        other => AmqpError::PublishingError(other.to_string()),
    }
}
