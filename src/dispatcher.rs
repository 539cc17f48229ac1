// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Dispatcher
//!
//! `Consumer` keeps the queue subscriptions and runs them over a reconnecting
//! session. On every new session it applies the topology, opens one delivery
//! stream per subscribed queue and starts that queue's worker pool.
//!
//! All pools of a session share a drain token. It fires when any stream ends
//! or fails to open, which tears the other pools down and lets the reconnect
//! loop redial. Cancelling the consumer instead stops the pools from pulling
//! new deliveries and gives in-flight handlers the shutdown grace period.

use crate::{
    channel::Session,
    configs::Options,
    consumer::{consume, ConsumerHandler},
    errors::{AmqpError, ErrorObserver},
    message::DeliveryStream,
    otel::CONSUMER_TRACER,
    runloop::{run_loop, SessionHandler},
    service::{Lifecycle, Service},
    topology::Topology,
};
use async_trait::async_trait;
use opentelemetry::global;
use std::{sync::Arc, time::Duration};
use tokio::{sync::Mutex, task::JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// A handler registered for one queue.
struct Subscription {
    queue: String,
    workers: usize,
    handler: Arc<dyn ConsumerHandler>,
}

/// Consumes registered queues over a reconnecting session.
pub struct Consumer {
    options: Options,
    state: Mutex<Lifecycle<Vec<Subscription>>>,
}

impl Consumer {
    /// Creates a consumer with no subscriptions.
    ///
    /// # Parameters
    /// * `options` - Connection, topology and worker settings
    ///
    /// # Returns
    /// An idle consumer; register handlers before calling `start`
    pub fn new(options: Options) -> Self {
        Consumer {
            options,
            state: Mutex::new(Lifecycle::Idle(Vec::new())),
        }
    }

    /// Registers `handler` for `queue` with the configured default worker count.
    pub fn subscribe(
        &mut self,
        queue: &str,
        handler: Arc<dyn ConsumerHandler>,
    ) -> Result<(), AmqpError> {
        let workers = self.options.workers;
        self.subscribe_with_workers(queue, workers, handler)
    }

    /// Registers `handler` for `queue`, processed by `workers` concurrent tasks.
    ///
    /// A queue can be registered once; later registrations are refused and the
    /// first one stays in place. Registration is only possible before `start`.
    pub fn subscribe_with_workers(
        &mut self,
        queue: &str,
        workers: usize,
        handler: Arc<dyn ConsumerHandler>,
    ) -> Result<(), AmqpError> {
        if workers == 0 {
            return Err(AmqpError::InvalidConfiguration(format!(
                "queue {} needs at least one worker",
                queue
            )));
        }

        let subscriptions = match self.state.get_mut() {
            Lifecycle::Idle(subscriptions) => subscriptions,
            Lifecycle::Running { .. } => return Err(AmqpError::AlreadyStarted),
            Lifecycle::Stopped => return Err(AmqpError::Stopped),
        };

        if subscriptions.iter().any(|sub| sub.queue == queue) {
            warn!(
                queue = queue,
                "handler already registered for queue, keeping the first"
            );
            return Err(AmqpError::DuplicateSubscription(queue.to_owned()));
        }

        subscriptions.push(Subscription {
            queue: queue.to_owned(),
            workers,
            handler,
        });

        Ok(())
    }
}

#[async_trait]
impl Service for Consumer {
    /// Validates the configuration and launches the session loop in the background.
    async fn start(&self, parent: &CancellationToken) -> Result<(), AmqpError> {
        let connector = self.options.resolve_connector()?;

        let mut state = self.state.lock().await;
        if let Some(subscriptions) = state.idle_mut() {
            if subscriptions.is_empty() {
                return Err(AmqpError::NoSubscriptions);
            }
        }

        let interval = self.options.reconnect_interval;
        let handler_options = self.options.clone();

        state.start(parent, move |subscriptions, cancel| {
            let handler = ConsumerLoop {
                subscriptions,
                topology: handler_options.topology,
                tag_prefix: handler_options.consumer_tag_prefix,
                shutdown_grace: handler_options.shutdown_grace,
                on_error: handler_options.on_error,
            };
            tokio::spawn(run_loop(connector, interval, cancel, handler))
        })
    }

    /// Cancels consumption and waits for the session loop to finish,
    /// in-flight handlers included.
    async fn stop(&self) -> Result<(), AmqpError> {
        self.state.lock().await.stop().await
    }
}

struct ConsumerLoop {
    subscriptions: Vec<Subscription>,
    topology: Topology,
    tag_prefix: String,
    shutdown_grace: Duration,
    on_error: Arc<dyn ErrorObserver>,
}

impl ConsumerLoop {
    fn consumer_tag(&self, queue: &str) -> String {
        format!("{}-{}", self.tag_prefix, queue)
    }
}

#[async_trait]
impl SessionHandler for ConsumerLoop {
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

        let drain = CancellationToken::new();
        let mut workers = JoinSet::new();

        for sub in &self.subscriptions {
            let tag = self.consumer_tag(&sub.queue);
            let stream = match session.consume(&sub.queue, &tag).await {
                Ok(stream) => stream,
                Err(err) => {
                    self.on_error.on_error(&err);
                    drain.cancel();
                    workers.shutdown().await;
                    return true;
                }
            };

            debug!(queue = sub.queue, workers = sub.workers, "consuming");
            for _ in 0..sub.workers {
                workers.spawn(worker(stream.clone(), sub.handler.clone(), drain.clone()));
            }
        }

        tokio::select! {
            _ = drain.cancelled() => {
                debug!("delivery stream closed, draining session");
                drain_workers(&mut workers, self.shutdown_grace).await;
                true
            }
            _ = cancel.cancelled() => {
                debug!("consumer cancelled, draining session");
                drain.cancel();
                drain_workers(&mut workers, self.shutdown_grace).await;
                false
            }
        }
    }
}

/// Pulls deliveries until `drain` fires or the stream ends.
async fn worker(
    stream: DeliveryStream,
    handler: Arc<dyn ConsumerHandler>,
    drain: CancellationToken,
) {
    let tracer = global::tracer(CONSUMER_TRACER);

    loop {
        let next = tokio::select! {
            biased;
            _ = drain.cancelled() => return,
            next = stream.next() => next,
        };

        match next {
            Some(Ok(delivery)) => {
                if let Err(err) = consume(&tracer, delivery, handler.as_ref()).await {
                    error!(error = err.to_string(), "error consume msg");
                }
            }
            Some(Err(err)) => error!(error = err.to_string(), "errors consume msg"),
            None => {
                drain.cancel();
                return;
            }
        }
    }
}

/// Waits up to `grace` for the workers, then aborts whatever is left.
async fn drain_workers(workers: &mut JoinSet<()>, grace: Duration) {
    let joined = tokio::time::timeout(grace, async {
        while let Some(res) = workers.join_next().await {
            if let Err(err) = res {
                error!(error = err.to_string(), "worker task failed");
            }
        }
    })
    .await;

    if joined.is_err() {
        warn!(remaining = workers.len(), "grace period elapsed, aborting workers");
        workers.shutdown().await;
    }
}
