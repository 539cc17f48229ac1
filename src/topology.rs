// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology Management
//!
//! The topology is the declarative set of exchanges, queues (with their
//! bindings) and the QoS settings that every new session must carry before
//! any publish or consume starts on it.
//!
//! `Topology::apply` performs the declarations in order:
//! 1. exchanges, in configured order
//! 2. queues, each followed by its bindings (a queue's DLQ is declared first)
//! 3. QoS
//!
//! The first failure aborts the remaining declarations. Declarations are
//! idempotent at the broker, so the same topology is re-applied on every
//! reconnect.

use crate::{
    channel::Session,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::QueueDefinition,
};
use serde::Deserialize;
use tracing::{debug, error};

/// Broker-enforced limit on unacknowledged deliveries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct QosDefinition {
    #[serde(default)]
    pub(crate) prefetch_count: u16,
    #[serde(default)]
    pub(crate) prefetch_size: u32,
    #[serde(default)]
    pub(crate) global: bool,
}

impl QosDefinition {
    /// Creates a prefetch setting.
    ///
    /// # Parameters
    /// * `prefetch_count` - Unacknowledged deliveries allowed, 0 for unlimited
    /// * `prefetch_size` - Byte window, logged and ignored when non-zero
    /// * `global` - Whether the limit is shared by the whole channel
    ///
    /// # Returns
    /// A new QoS definition
    pub fn new(prefetch_count: u16, prefetch_size: u32, global: bool) -> Self {
        QosDefinition {
            prefetch_count,
            prefetch_size,
            global,
        }
    }

    pub fn prefetch_count(&self) -> u16 {
        self.prefetch_count
    }
}

/// Exchanges, queues and QoS applied on each fresh session.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Topology {
    #[serde(default)]
    pub(crate) exchanges: Vec<ExchangeDefinition>,
    #[serde(default)]
    pub(crate) queues: Vec<QueueDefinition>,
    #[serde(default)]
    pub(crate) qos: Option<QosDefinition>,
}

impl Topology {
    pub fn new() -> Self {
        Topology::default()
    }

    /// Adds an exchange definition to the topology.
    pub fn exchange(mut self, def: ExchangeDefinition) -> Self {
        self.exchanges.push(def);
        self
    }

    /// Adds a queue definition, bindings included, to the topology.
    pub fn queue(mut self, def: QueueDefinition) -> Self {
        self.queues.push(def);
        self
    }

    /// Sets the QoS applied after all declarations.
    pub fn qos(mut self, qos: QosDefinition) -> Self {
        self.qos = Some(qos);
        self
    }

    pub fn exchanges(&self) -> &[ExchangeDefinition] {
        &self.exchanges
    }

    pub fn queues(&self) -> &[QueueDefinition] {
        &self.queues
    }

    /// Declares the whole topology on `session`.
    pub async fn apply(&self, session: &dyn Session) -> Result<(), AmqpError> {
        self.install_exchange(session).await?;
        self.install_queue(session).await?;
        self.install_qos(session).await
    }

    async fn install_exchange(&self, session: &dyn Session) -> Result<(), AmqpError> {
        for exch in &self.exchanges {
            debug!("creating exchange: {}", exch.name);

            if let Err(err) = session.declare_exchange(exch).await {
                error!(
                    error = err.to_string(),
                    name = exch.name,
                    "error to declare the exchange"
                );
                return Err(err);
            }

            debug!("exchange: {} was created", exch.name);
        }

        Ok(())
    }

    async fn install_queue(&self, session: &dyn Session) -> Result<(), AmqpError> {
        for def in &self.queues {
            if let Some(dlq) = def.dlq() {
                debug!("creating dlq: {}", dlq.name);
                self.declare_queue(session, &dlq).await?;
            }

            debug!("creating queue: {}", def.name);
            self.declare_queue(session, def).await?;
            self.binding_queue(session, def).await?;
        }

        Ok(())
    }

    async fn declare_queue(
        &self,
        session: &dyn Session,
        def: &QueueDefinition,
    ) -> Result<(), AmqpError> {
        match session.declare_queue(def).await {
            Err(err) => {
                error!(error = err.to_string(), name = def.name, "error to declare the queue");
                Err(err)
            }
            _ => {
                debug!("queue: {} was created", def.name);
                Ok(())
            }
        }
    }

    async fn binding_queue(
        &self,
        session: &dyn Session,
        def: &QueueDefinition,
    ) -> Result<(), AmqpError> {
        for binding in &def.bindings {
            debug!(
                "binding queue: {} to the exchange: {} with the key: {}",
                def.name, binding.exchange_name, binding.routing_key
            );

            session.bind_queue(&def.name, binding).await?;
        }

        Ok(())
    }

    async fn install_qos(&self, session: &dyn Session) -> Result<(), AmqpError> {
        let Some(qos) = &self.qos else {
            return Ok(());
        };

        debug!(
            prefetch_count = qos.prefetch_count,
            global = qos.global,
            "applying qos"
        );

        session.qos(qos).await.map_err(|err| {
            error!(error = err.to_string(), "error to apply qos");
            err
        })
    }
}
