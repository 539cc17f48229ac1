// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! In-memory broker and recorders shared by the producer and consumer tests.
//!
//! `MemoryBroker` implements `Connector`; every `connect` opens a new
//! `MemorySession` on the same broker state. Routing follows AMQP semantics
//! for direct, fanout and topic exchanges plus the default exchange. Headers
//! exchanges route like fanout, binding arguments are not modelled.

use crate::{
    channel::{Connector, Session},
    errors::{AmqpError, ErrorObserver},
    exchange::{ExchangeDefinition, ExchangeKind},
    message::{Acknowledger, ConsumerMessage, Delivery, DeliveryStream},
    queue::{QueueBinding, QueueDefinition},
    topology::QosDefinition,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::BasicProperties;
use std::{
    collections::{BTreeSet, HashMap, HashSet, VecDeque},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};
use tokio::sync::{mpsc, watch};

type DeliverySender = mpsc::UnboundedSender<Result<Delivery, AmqpError>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Clone)]
struct Stored {
    exchange: String,
    routing_key: String,
    redelivered: bool,
    payload: Vec<u8>,
    properties: BasicProperties,
}

struct MemoryConsumer {
    session: u64,
    tag: String,
    sender: DeliverySender,
}

#[derive(Default)]
struct MemoryQueue {
    dead_letter: Option<String>,
    ready: VecDeque<Stored>,
    routed: Vec<Stored>,
    consumers: Vec<MemoryConsumer>,
    next_consumer: usize,
    delivered: usize,
    acked: usize,
    requeued: usize,
    rejected: usize,
}

struct MemoryExchange {
    kind: ExchangeKind,
    bindings: BTreeSet<(String, String)>,
}

#[derive(Default)]
struct State {
    exchanges: HashMap<String, MemoryExchange>,
    queues: HashMap<String, MemoryQueue>,
    live: HashSet<u64>,
    sessions_opened: u64,
    refuse: bool,
    nack_next: bool,
}

impl State {
    fn drop_session(&mut self, session: u64) {
        self.live.remove(&session);
        for queue in self.queues.values_mut() {
            queue.consumers.retain(|c| c.session != session);
        }
    }
}

/// Hands `msg` to the next consumer of `queue` or parks it.
fn offer(queue: &mut MemoryQueue, name: &str, msg: Stored, broker: &Arc<Mutex<State>>) {
    while !queue.consumers.is_empty() {
        let idx = queue.next_consumer % queue.consumers.len();
        let consumer = &queue.consumers[idx];

        let delivery = Delivery {
            message: ConsumerMessage {
                queue: name.to_owned(),
                exchange: msg.exchange.clone(),
                routing_key: msg.routing_key.clone(),
                redelivered: msg.redelivered,
                data: msg.payload.clone(),
                properties: msg.properties.clone(),
            },
            acker: Arc::new(MemoryAcker {
                broker: broker.clone(),
                queue: name.to_owned(),
                session: consumer.session,
                stored: msg.clone(),
                settled: AtomicBool::new(false),
            }),
        };

        if consumer.sender.send(Ok(delivery)).is_ok() {
            queue.next_consumer = idx + 1;
            queue.delivered += 1;
            return;
        }
        queue.consumers.remove(idx);
    }

    queue.ready.push_back(msg);
}

fn topic_matches(pattern: &str, key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = key.split('.').collect();
    words_match(&pattern, &key)
}

fn words_match(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| words_match(rest, &key[skip..])),
        Some((&"*", rest)) => !key.is_empty() && words_match(rest, &key[1..]),
        Some((word, rest)) => key.first() == Some(word) && words_match(rest, &key[1..]),
    }
}

/// Broker double with fault injection.
#[derive(Clone)]
pub(crate) struct MemoryBroker {
    state: Arc<Mutex<State>>,
    held: Arc<watch::Sender<bool>>,
}

impl MemoryBroker {
    pub(crate) fn new() -> Self {
        let (held, _) = watch::channel(false);
        MemoryBroker {
            state: Arc::new(Mutex::new(State::default())),
            held: Arc::new(held),
        }
    }

    /// Makes every dial fail until switched off again.
    pub(crate) fn refuse_connections(&self, refuse: bool) {
        lock(&self.state).refuse = refuse;
    }

    /// Parks every publish until switched off again.
    pub(crate) fn hold_publishes(&self, hold: bool) {
        self.held.send_replace(hold);
    }

    /// Makes the next publish come back negatively confirmed.
    pub(crate) fn nack_next_publish(&self) {
        lock(&self.state).nack_next = true;
    }

    /// Drops every open session: streams end, further calls fail as closed.
    pub(crate) fn kill_sessions(&self) {
        let mut state = lock(&self.state);
        let live: Vec<u64> = state.live.iter().copied().collect();
        for session in live {
            state.drop_session(session);
        }
    }

    pub(crate) fn sessions_opened(&self) -> usize {
        lock(&self.state).sessions_opened as usize
    }

    /// Every payload routed to `queue`, in routing order.
    pub(crate) fn queued(&self, queue: &str) -> Vec<Vec<u8>> {
        self.with_queue(queue, |q| q.routed.iter().map(|m| m.payload.clone()).collect())
    }

    pub(crate) fn queued_properties(&self, queue: &str) -> Vec<BasicProperties> {
        self.with_queue(queue, |q| q.routed.iter().map(|m| m.properties.clone()).collect())
    }

    pub(crate) fn acked(&self, queue: &str) -> usize {
        self.with_queue(queue, |q| q.acked)
    }

    pub(crate) fn requeued(&self, queue: &str) -> usize {
        self.with_queue(queue, |q| q.requeued)
    }

    pub(crate) fn rejected(&self, queue: &str) -> usize {
        self.with_queue(queue, |q| q.rejected)
    }

    /// Deliveries handed out and not settled yet.
    pub(crate) fn unacked(&self, queue: &str) -> usize {
        self.with_queue(queue, |q| q.delivered - q.acked - q.requeued - q.rejected)
    }

    pub(crate) fn consumers(&self, queue: &str) -> usize {
        self.with_queue(queue, |q| {
            q.consumers.iter().filter(|c| !c.sender.is_closed()).count()
        })
    }

    pub(crate) fn consumer_tags(&self) -> Vec<String> {
        lock(&self.state)
            .queues
            .values()
            .flat_map(|q| q.consumers.iter())
            .filter(|c| !c.sender.is_closed())
            .map(|c| c.tag.clone())
            .collect()
    }

    pub(crate) fn bindings(&self, exchange: &str) -> usize {
        lock(&self.state)
            .exchanges
            .get(exchange)
            .map(|ex| ex.bindings.len())
            .unwrap_or_default()
    }

    fn with_queue<T: Default>(&self, queue: &str, f: impl FnOnce(&MemoryQueue) -> T) -> T {
        lock(&self.state).queues.get(queue).map(f).unwrap_or_default()
    }
}

#[async_trait]
impl Connector for MemoryBroker {
    async fn connect(&self) -> Result<Arc<dyn Session>, AmqpError> {
        let mut state = lock(&self.state);
        if state.refuse {
            return Err(AmqpError::ConnectionError("connection refused".to_owned()));
        }

        state.sessions_opened += 1;
        let id = state.sessions_opened;
        state.live.insert(id);

        Ok(Arc::new(MemorySession {
            id,
            broker: self.state.clone(),
            held: self.held.clone(),
        }))
    }
}

struct MemorySession {
    id: u64,
    broker: Arc<Mutex<State>>,
    held: Arc<watch::Sender<bool>>,
}

impl MemorySession {
    fn live_state(&self) -> Result<MutexGuard<'_, State>, AmqpError> {
        let state = lock(&self.broker);
        if !state.live.contains(&self.id) {
            return Err(AmqpError::ChannelClosed("channel closed".to_owned()));
        }
        Ok(state)
    }
}

#[async_trait]
impl Session for MemorySession {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        let mut state = self.live_state()?;

        match state.exchanges.get(&def.name) {
            Some(existing) if existing.kind != def.kind => Err(AmqpError::DeclareExchangeError(
                format!("{}: PRECONDITION_FAILED - inequivalent arg 'type'", def.name),
            )),
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(
                    def.name.clone(),
                    MemoryExchange {
                        kind: def.kind.clone(),
                        bindings: BTreeSet::new(),
                    },
                );
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        let mut state = self.live_state()?;

        let queue = state.queues.entry(def.name.clone()).or_default();
        if queue.dead_letter.is_none() {
            queue.dead_letter = def.dlq_name.clone();
        }
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, binding: &QueueBinding) -> Result<(), AmqpError> {
        let mut state = self.live_state()?;

        if !state.queues.contains_key(queue) {
            return Err(AmqpError::BindingExchangeToQueueError(
                binding.exchange_name.clone(),
                queue.to_owned(),
            ));
        }
        let Some(exchange) = state.exchanges.get_mut(&binding.exchange_name) else {
            return Err(AmqpError::BindingExchangeToQueueError(
                binding.exchange_name.clone(),
                queue.to_owned(),
            ));
        };

        exchange
            .bindings
            .insert((queue.to_owned(), binding.routing_key.clone()));
        Ok(())
    }

    async fn qos(&self, _qos: &QosDefinition) -> Result<(), AmqpError> {
        self.live_state().map(|_| ())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError> {
        let mut held = self.held.subscribe();
        let _ = held.wait_for(|held| !*held).await;

        let mut state = self.live_state()?;

        if std::mem::take(&mut state.nack_next) {
            return Err(AmqpError::PublishNacked);
        }

        let targets: BTreeSet<String> = if exchange.is_empty() {
            state
                .queues
                .contains_key(routing_key)
                .then(|| routing_key.to_owned())
                .into_iter()
                .collect()
        } else {
            let Some(ex) = state.exchanges.get(exchange) else {
                // the broker answers with a channel-level 404
                state.drop_session(self.id);
                return Err(AmqpError::ChannelClosed(format!(
                    "NOT_FOUND - no exchange '{}'",
                    exchange
                )));
            };
            ex.bindings
                .iter()
                .filter(|(_, key)| match ex.kind {
                    ExchangeKind::Direct => key == routing_key,
                    ExchangeKind::Topic => topic_matches(key, routing_key),
                    ExchangeKind::Fanout | ExchangeKind::Headers => true,
                })
                .map(|(queue, _)| queue.clone())
                .collect()
        };

        let stored = Stored {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            redelivered: false,
            payload: payload.to_vec(),
            properties,
        };
        for name in targets {
            if let Some(queue) = state.queues.get_mut(&name) {
                queue.routed.push(stored.clone());
                offer(queue, &name, stored.clone(), &self.broker);
            }
        }

        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, AmqpError> {
        let mut state = self.live_state()?;

        let Some(memory_queue) = state.queues.get_mut(queue) else {
            return Err(AmqpError::ConsumerDeclarationError(format!(
                "{}: NOT_FOUND - no queue",
                queue
            )));
        };

        let (sender, receiver) = mpsc::unbounded_channel();
        memory_queue.consumers.push(MemoryConsumer {
            session: self.id,
            tag: consumer_tag.to_owned(),
            sender,
        });

        let parked: Vec<Stored> = memory_queue.ready.drain(..).collect();
        for msg in parked {
            offer(memory_queue, queue, msg, &self.broker);
        }

        let stream = futures_util::stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|delivery| (delivery, receiver))
        });
        Ok(DeliveryStream::new(stream.boxed()))
    }

    async fn close(&self) {
        lock(&self.broker).drop_session(self.id);
    }
}

enum Outcome {
    Ack,
    Requeue,
    Reject,
}

struct MemoryAcker {
    broker: Arc<Mutex<State>>,
    queue: String,
    session: u64,
    stored: Stored,
    settled: AtomicBool,
}

impl MemoryAcker {
    fn settle(&self, outcome: Outcome) -> Result<(), String> {
        let mut state = lock(&self.broker);
        if !state.live.contains(&self.session) {
            return Err("channel closed".to_owned());
        }
        if self.settled.swap(true, Ordering::SeqCst) {
            return Err("delivery already settled".to_owned());
        }

        let Some(queue) = state.queues.get_mut(&self.queue) else {
            return Err("queue deleted".to_owned());
        };

        match outcome {
            Outcome::Ack => queue.acked += 1,
            Outcome::Requeue => {
                queue.requeued += 1;
                let mut msg = self.stored.clone();
                msg.redelivered = true;
                offer(queue, &self.queue, msg, &self.broker);
            }
            Outcome::Reject => {
                queue.rejected += 1;
                let Some(dlq) = queue.dead_letter.clone() else {
                    return Ok(());
                };
                if let Some(dead) = state.queues.get_mut(&dlq) {
                    let mut msg = self.stored.clone();
                    msg.exchange = String::new();
                    msg.routing_key = dlq.clone();
                    dead.routed.push(msg.clone());
                    offer(dead, &dlq, msg, &self.broker);
                }
            }
        }

        Ok(())
    }
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> Result<(), AmqpError> {
        self.settle(Outcome::Ack).map_err(AmqpError::AckMessageError)
    }

    async fn nack(&self, requeue: bool) -> Result<(), AmqpError> {
        let outcome = if requeue {
            Outcome::Requeue
        } else {
            Outcome::Reject
        };
        self.settle(outcome).map_err(AmqpError::NackMessageError)
    }
}

/// Acknowledger that only records the decisions it receives.
#[derive(Clone, Default)]
pub(crate) struct RecordingAcker {
    acks: Arc<Mutex<usize>>,
    nacks: Arc<Mutex<Vec<bool>>>,
    failing: bool,
}

impl RecordingAcker {
    /// An acker whose every call fails.
    pub(crate) fn failing() -> Self {
        RecordingAcker {
            failing: true,
            ..Default::default()
        }
    }

    pub(crate) fn acks(&self) -> usize {
        *lock(&self.acks)
    }

    /// The requeue flag of every nack, in call order.
    pub(crate) fn nacks(&self) -> Vec<bool> {
        lock(&self.nacks).clone()
    }
}

#[async_trait]
impl Acknowledger for RecordingAcker {
    async fn ack(&self) -> Result<(), AmqpError> {
        if self.failing {
            return Err(AmqpError::AckMessageError("channel closed".to_owned()));
        }
        *lock(&self.acks) += 1;
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> Result<(), AmqpError> {
        if self.failing {
            return Err(AmqpError::NackMessageError("channel closed".to_owned()));
        }
        lock(&self.nacks).push(requeue);
        Ok(())
    }
}

/// Collects everything reported to the error observer.
#[derive(Clone, Default)]
pub(crate) struct ObservedErrors {
    seen: Arc<Mutex<Vec<AmqpError>>>,
}

impl ObservedErrors {
    pub(crate) fn observer(&self) -> Arc<dyn ErrorObserver> {
        let seen = self.seen.clone();
        Arc::new(move |err: &AmqpError| lock(&seen).push(err.clone()))
    }

    pub(crate) fn seen(&self) -> Vec<AmqpError> {
        lock(&self.seen).clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_wildcards() {
        assert!(topic_matches("order.created", "order.created"));
        assert!(topic_matches("order.*", "order.created"));
        assert!(!topic_matches("order.*", "order.created.eu"));
        assert!(topic_matches("order.#", "order.created.eu"));
        assert!(topic_matches("order.#", "order"));
        assert!(topic_matches("#", "anything.at.all"));
        assert!(!topic_matches("*.created", "order.deleted"));
    }

    #[tokio::test]
    async fn fanout_copies_to_every_bound_queue() {
        let broker = MemoryBroker::new();
        let session = broker.connect().await.unwrap();
        session
            .declare_exchange(&ExchangeDefinition::new("audit").fanout())
            .await
            .unwrap();
        for name in ["a", "b"] {
            session.declare_queue(&QueueDefinition::new(name)).await.unwrap();
            session
                .bind_queue(name, &QueueBinding::new("audit"))
                .await
                .unwrap();
        }

        session
            .publish("audit", "ignored", b"x", BasicProperties::default())
            .await
            .unwrap();

        assert_eq!(broker.queued("a"), vec![b"x".to_vec()]);
        assert_eq!(broker.queued("b"), vec![b"x".to_vec()]);
    }

    #[tokio::test]
    async fn mismatched_redeclaration_fails() {
        let broker = MemoryBroker::new();
        let session = broker.connect().await.unwrap();
        session
            .declare_exchange(&ExchangeDefinition::new("events").topic())
            .await
            .unwrap();

        let err = session
            .declare_exchange(&ExchangeDefinition::new("events").fanout())
            .await
            .unwrap_err();

        assert!(matches!(err, AmqpError::DeclareExchangeError(_)));
    }
}
