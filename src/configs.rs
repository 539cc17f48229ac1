// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Configuration
//!
//! `AmqpConfigs` holds the broker coordinates as they come from a config file.
//! `Options` is what the producer and consumer are built from: the connection,
//! the topology to declare on every session and the loop tuning.

use crate::{
    channel::{AmqpConnector, Connector, DEFAULT_CONNECT_TIMEOUT, DEFAULT_HEARTBEAT},
    errors::{default_observer, AmqpError, ErrorObserver},
    exchange::ExchangeDefinition,
    queue::QueueDefinition,
    runloop::DEFAULT_RECONNECT_INTERVAL,
    topology::{QosDefinition, Topology},
};
use serde::Deserialize;
use std::{sync::Arc, time::Duration};
use uuid::Uuid;

/// Default capacity of the producer's outbound queue
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;
/// Default time in-flight handlers get to finish on shutdown
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(2);
/// Default number of workers per subscribed queue
pub const DEFAULT_WORKERS: usize = 1;

/// Broker coordinates.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AmqpConfigs {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub vhost: String,
    pub connection_name: String,
    pub heartbeat_secs: u64,
    pub connect_timeout_secs: u64,
    pub publisher_confirms: bool,
    pub topology: Topology,
}

impl Default for AmqpConfigs {
    fn default() -> Self {
        AmqpConfigs {
            host: "localhost".to_owned(),
            port: 5672,
            user: "guest".to_owned(),
            password: "guest".to_owned(),
            vhost: "/".to_owned(),
            connection_name: String::new(),
            heartbeat_secs: DEFAULT_HEARTBEAT.as_secs(),
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT.as_secs(),
            publisher_confirms: false,
            topology: Topology::default(),
        }
    }
}

impl AmqpConfigs {
    /// Parses a JSON document; missing fields take their default.
    pub fn from_json(raw: &str) -> Result<Self, AmqpError> {
        serde_json::from_str(raw).map_err(|err| AmqpError::InvalidConfiguration(err.to_string()))
    }

    /// Connection string for these coordinates.
    ///
    /// User, password and vhost are percent-encoded, so the default vhost `/`
    /// is written as `%2F`.
    pub fn uri(&self) -> String {
        format!(
            "amqp://{}:{}@{}:{}/{}",
            urlencoding::encode(&self.user),
            urlencoding::encode(&self.password),
            self.host,
            self.port,
            urlencoding::encode(&self.vhost)
        )
    }
}

/// Settings shared by `Producer` and `Consumer`.
#[derive(Clone)]
pub struct Options {
    pub(crate) uri: String,
    pub(crate) connector: Option<Arc<dyn Connector>>,
    pub(crate) topology: Topology,
    pub(crate) reconnect_interval: Duration,
    pub(crate) shutdown_grace: Duration,
    pub(crate) queue_capacity: usize,
    pub(crate) workers: usize,
    pub(crate) consumer_tag_prefix: String,
    pub(crate) on_error: Arc<dyn ErrorObserver>,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            uri: String::new(),
            connector: None,
            topology: Topology::default(),
            reconnect_interval: DEFAULT_RECONNECT_INTERVAL,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            workers: DEFAULT_WORKERS,
            consumer_tag_prefix: format!("amqp-{}", Uuid::new_v4().simple()),
            on_error: default_observer(),
        }
    }
}

impl Options {
    /// Options connecting to `uri` with the default lapin connector.
    pub fn new(uri: &str) -> Self {
        Options {
            uri: uri.to_owned(),
            ..Default::default()
        }
    }

    /// Options from file configuration, topology included.
    pub fn from_configs(cfg: &AmqpConfigs) -> Self {
        let mut connector = AmqpConnector::new(&cfg.uri())
            .heartbeat(Duration::from_secs(cfg.heartbeat_secs))
            .connect_timeout(Duration::from_secs(cfg.connect_timeout_secs));
        if !cfg.connection_name.is_empty() {
            connector = connector.connection_name(&cfg.connection_name);
        }
        if cfg.publisher_confirms {
            connector = connector.publisher_confirms();
        }

        Options {
            uri: cfg.uri(),
            connector: Some(Arc::new(connector)),
            topology: cfg.topology.clone(),
            ..Default::default()
        }
    }

    /// Uses a custom connector instead of dialing `uri` with lapin.
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Adds an exchange to declare on every session.
    ///
    /// # Parameters
    /// * `def` - Exchange definition, declared before any queue
    ///
    /// # Returns
    /// The updated options
    pub fn exchange(mut self, def: ExchangeDefinition) -> Self {
        self.topology = self.topology.exchange(def);
        self
    }

    /// Adds a queue, with its DLQ and bindings, to declare on every session.
    ///
    /// # Parameters
    /// * `def` - Queue definition
    ///
    /// # Returns
    /// The updated options
    pub fn queue(mut self, def: QueueDefinition) -> Self {
        self.topology = self.topology.queue(def);
        self
    }

    /// Sets the channel prefetch applied after the topology.
    ///
    /// # Parameters
    /// * `prefetch_count` - Unacknowledged deliveries allowed per consumer
    /// * `prefetch_size` - Byte window; lapin cannot send it, non-zero is ignored
    /// * `global` - Applies the limit to the whole channel
    ///
    /// # Returns
    /// The updated options
    pub fn qos(mut self, prefetch_count: u16, prefetch_size: u32, global: bool) -> Self {
        self.topology = self
            .topology
            .qos(QosDefinition::new(prefetch_count, prefetch_size, global));
        self
    }

    /// Replaces the whole topology.
    pub fn topology(mut self, topology: Topology) -> Self {
        self.topology = topology;
        self
    }

    /// Observer for failures inside the reconnect loops.
    pub fn on_error(mut self, observer: Arc<dyn ErrorObserver>) -> Self {
        self.on_error = observer;
        self
    }

    /// Default worker count for subscriptions that do not set one.
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Fixed wait between two dial attempts.
    pub fn reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect_interval = interval;
        self
    }

    /// Time in-flight handlers get to finish once the consumer stops.
    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Capacity of the producer's outbound queue.
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Prefix of the consumer tags, which read `<prefix>-<queue>`.
    pub fn consumer_tag_prefix(mut self, prefix: &str) -> Self {
        self.consumer_tag_prefix = prefix.to_owned();
        self
    }

    /// The connector to dial with; fails when neither a connector nor a
    /// connection string was configured.
    pub(crate) fn resolve_connector(&self) -> Result<Arc<dyn Connector>, AmqpError> {
        if let Some(connector) = &self.connector {
            return Ok(connector.clone());
        }

        if self.uri.is_empty() {
            return Err(AmqpError::MissingConnectionString);
        }

        Ok(Arc::new(AmqpConnector::new(&self.uri)))
    }
}
