//! In-process queue broker.
//!
//! Implements the subset of AMQP the fabric relies on: topic exchanges with
//! `*` / `#` patterns, the default exchange, exclusive and auto-delete queues,
//! mandatory returns and round-robin delivery between consumers. Connection
//! loss and brokers without QoS support can be simulated.

use super::broker::{Delivery, MessageProperties, PublishOutcome, QueueChannel, QueueConnector, QueueOptions};
use async_trait::async_trait;
use courier_types::error::{CourierError, CourierResult};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::debug;

const CONSUMER_BUFFER: usize = 1024;

/// Whether a routing key matches a topic pattern.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
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

struct Consumer {
    channel_id: u64,
    sender: mpsc::Sender<Delivery>,
}

struct MemoryQueue {
    options: QueueOptions,
    owner: Option<u64>,
    consumers: Vec<Consumer>,
    had_consumer: bool,
    next_consumer: usize,
    backlog: VecDeque<Delivery>,
    /// A drain task is feeding the backlog to the consumers.
    draining: bool,
}

impl MemoryQueue {
    /// Queue a delivery behind any backlog, handing it straight to a
    /// consumer only when nothing is waiting ahead of it.
    fn deliver(&mut self, delivery: Delivery) {
        self.drain_backlog();
        if !self.backlog.is_empty() {
            self.backlog.push_back(delivery);
            return;
        }
        if let Err(undelivered) = self.try_deliver(delivery) {
            self.backlog.push_back(undelivered);
        }
    }

    /// Whether a drain task should be started; marks the queue as draining.
    fn claim_drain(&mut self) -> bool {
        if self.draining || self.backlog.is_empty() || self.consumers.is_empty() {
            return false;
        }
        self.draining = true;
        true
    }

    /// Hand the delivery to the next consumer with room, round-robin.
    fn try_deliver(&mut self, mut delivery: Delivery) -> Result<(), Delivery> {
        self.consumers.retain(|c| !c.sender.is_closed());
        for _ in 0..self.consumers.len() {
            let index = self.next_consumer % self.consumers.len();
            self.next_consumer = index + 1;
            match self.consumers[index].sender.try_send(delivery) {
                Ok(()) => return Ok(()),
                Err(mpsc::error::TrySendError::Full(back)) | Err(mpsc::error::TrySendError::Closed(back)) => {
                    delivery = back;
                }
            }
        }
        Err(delivery)
    }

    fn drain_backlog(&mut self) {
        while let Some(delivery) = self.backlog.pop_front() {
            if let Err(undelivered) = self.try_deliver(delivery) {
                self.backlog.push_front(undelivered);
                break;
            }
        }
    }
}

struct Binding {
    exchange: String,
    queue: String,
    pattern: String,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashSet<String>,
    queues: HashMap<String, MemoryQueue>,
    bindings: Vec<Binding>,
    channels: HashMap<u64, Arc<AtomicBool>>,
    next_channel_id: u64,
    next_queue_id: u64,
    next_delivery_tag: u64,
    qos_unsupported: bool,
    refuse_connections: bool,
    qos_calls: Vec<(u16, bool)>,
    acks: u64,
}

impl BrokerState {
    /// Remove a channel's consumers and the queues that die with it.
    fn detach(&mut self, channel_id: u64) {
        self.channels.remove(&channel_id);
        for queue in self.queues.values_mut() {
            queue.consumers.retain(|c| c.channel_id != channel_id);
        }
        let doomed: Vec<String> = self
            .queues
            .iter()
            .filter(|(_, q)| {
                q.owner == Some(channel_id) || (q.options.auto_delete && q.had_consumer && q.consumers.is_empty())
            })
            .map(|(name, _)| name.clone())
            .collect();
        for name in &doomed {
            self.queues.remove(name);
        }
        self.bindings.retain(|b| !doomed.contains(&b.queue));
    }
}

/// Shared in-memory broker. Clones see the same exchanges and queues.
#[derive(Clone, Default)]
pub struct MemoryQueueBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryQueueBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Move the backlog of `queue` to its consumers as their buffers free
    /// up. Ends once the backlog is empty or the queue has no consumer left.
    async fn drain_when_ready(self, queue: String) {
        loop {
            let sender = {
                let mut state = self.state();
                let Some(target) = state.queues.get_mut(&queue) else {
                    return;
                };
                target.drain_backlog();
                if target.backlog.is_empty() {
                    target.draining = false;
                    return;
                }
                match target.consumers.first() {
                    Some(consumer) => consumer.sender.clone(),
                    None => {
                        target.draining = false;
                        return;
                    }
                }
            };
            // Wait for room without holding the broker lock.
            if let Ok(permit) = sender.reserve().await {
                drop(permit);
            };
        }
    }

    fn spawn_drain(&self, queue: String) {
        debug!(queue = %queue, "Draining memory queue backlog");
        tokio::spawn(self.clone().drain_when_ready(queue));
    }

    /// Make new connections fail until switched back.
    pub fn set_refuse_connections(&self, refuse: bool) {
        self.state().refuse_connections = refuse;
    }

    /// Make every QoS call fail, like a broker without prefetch support.
    pub fn set_qos_unsupported(&self, unsupported: bool) {
        self.state().qos_unsupported = unsupported;
    }

    /// Drop every open channel, as if the broker connection was lost.
    pub fn disconnect_all(&self) {
        let mut state = self.state();
        let ids: Vec<u64> = state.channels.keys().copied().collect();
        for id in ids {
            if let Some(flag) = state.channels.get(&id) {
                flag.store(false, Ordering::SeqCst);
            }
            state.detach(id);
        }
        debug!("Memory queue broker dropped every channel");
    }

    pub fn has_queue(&self, name: &str) -> bool {
        self.state().queues.contains_key(name)
    }

    pub fn queue_options(&self, name: &str) -> Option<QueueOptions> {
        self.state().queues.get(name).map(|q| q.options.clone())
    }

    /// Routing keys `queue` is bound with.
    pub fn bindings_of(&self, queue: &str) -> Vec<String> {
        self.state()
            .bindings
            .iter()
            .filter(|b| b.queue == queue)
            .map(|b| b.pattern.clone())
            .collect()
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.state().queues.get(queue).map(|q| q.consumers.len()).unwrap_or(0)
    }

    pub fn backlog_len(&self, queue: &str) -> usize {
        self.state().queues.get(queue).map(|q| q.backlog.len()).unwrap_or(0)
    }

    /// Every accepted QoS call as `(prefetch_count, global)`.
    pub fn qos_calls(&self) -> Vec<(u16, bool)> {
        self.state().qos_calls.clone()
    }

    pub fn ack_count(&self) -> u64 {
        self.state().acks
    }

    pub fn open_channels(&self) -> usize {
        self.state().channels.len()
    }
}

#[async_trait]
impl QueueConnector for MemoryQueueBroker {
    async fn connect(&self) -> CourierResult<Arc<dyn QueueChannel>> {
        let mut state = self.state();
        if state.refuse_connections {
            return Err(CourierError::Connection("memory broker refused the connection".to_string()));
        }
        state.next_channel_id += 1;
        let id = state.next_channel_id;
        let connected = Arc::new(AtomicBool::new(true));
        state.channels.insert(id, Arc::clone(&connected));
        Ok(Arc::new(MemoryChannel {
            id,
            broker: self.clone(),
            connected,
        }))
    }
}

struct MemoryChannel {
    id: u64,
    broker: MemoryQueueBroker,
    connected: Arc<AtomicBool>,
}

impl MemoryChannel {
    fn open_state(&self) -> CourierResult<MutexGuard<'_, BrokerState>> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(CourierError::Connection("channel is closed".to_string()));
        }
        Ok(self.broker.state())
    }

    fn check_owner(&self, name: &str, queue: &MemoryQueue) -> CourierResult<()> {
        match queue.owner {
            Some(owner) if owner != self.id => Err(CourierError::Transport(format!(
                "RESOURCE_LOCKED - queue '{name}' is exclusive to another connection"
            ))),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl QueueChannel for MemoryChannel {
    async fn declare_exchange(&self, name: &str, _durable: bool) -> CourierResult<()> {
        self.open_state()?.exchanges.insert(name.to_string());
        Ok(())
    }

    async fn declare_queue(&self, name: &str, options: &QueueOptions) -> CourierResult<String> {
        let mut state = self.open_state()?;
        let name = if name.is_empty() {
            state.next_queue_id += 1;
            format!("amq.gen-{}", state.next_queue_id)
        } else {
            name.to_string()
        };
        if let Some(existing) = state.queues.get(&name) {
            self.check_owner(&name, existing)?;
            return Ok(name);
        }
        state.queues.insert(
            name.clone(),
            MemoryQueue {
                options: options.clone(),
                owner: options.exclusive.then_some(self.id),
                consumers: Vec::new(),
                had_consumer: false,
                next_consumer: 0,
                backlog: VecDeque::new(),
                draining: false,
            },
        );
        Ok(name)
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> CourierResult<()> {
        let mut state = self.open_state()?;
        if !state.exchanges.contains(exchange) {
            return Err(CourierError::Transport(format!("NOT_FOUND - no exchange '{exchange}'")));
        }
        if !state.queues.contains_key(queue) {
            return Err(CourierError::Transport(format!("NOT_FOUND - no queue '{queue}'")));
        }
        let exists = state
            .bindings
            .iter()
            .any(|b| b.exchange == exchange && b.queue == queue && b.pattern == routing_key);
        if !exists {
            state.bindings.push(Binding {
                exchange: exchange.to_string(),
                queue: queue.to_string(),
                pattern: routing_key.to_string(),
            });
        }
        Ok(())
    }

    async fn qos(&self, prefetch_count: u16, global: bool) -> CourierResult<()> {
        let mut state = self.open_state()?;
        if state.qos_unsupported {
            return Err(CourierError::Transport("NOT_IMPLEMENTED - basic.qos".to_string()));
        }
        state.qos_calls.push((prefetch_count, global));
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        mandatory: bool,
        properties: MessageProperties,
        body: &[u8],
    ) -> CourierResult<PublishOutcome> {
        let mut state = self.open_state()?;

        let targets: Vec<String> = if exchange.is_empty() {
            state
                .queues
                .contains_key(routing_key)
                .then(|| routing_key.to_string())
                .into_iter()
                .collect()
        } else {
            if !state.exchanges.contains(exchange) {
                return Err(CourierError::Transport(format!("NOT_FOUND - no exchange '{exchange}'")));
            }
            let mut seen = HashSet::new();
            state
                .bindings
                .iter()
                .filter(|b| b.exchange == exchange && topic_matches(&b.pattern, routing_key))
                .filter(|b| seen.insert(b.queue.clone()))
                .map(|b| b.queue.clone())
                .collect()
        };

        if targets.is_empty() {
            return Ok(if mandatory {
                PublishOutcome::Returned {
                    reply_text: "NO_ROUTE".to_string(),
                }
            } else {
                PublishOutcome::Routed
            });
        }

        for queue_name in targets {
            state.next_delivery_tag += 1;
            let delivery = Delivery {
                delivery_tag: state.next_delivery_tag,
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                properties: properties.clone(),
                body: body.to_vec(),
            };
            if let Some(queue) = state.queues.get_mut(&queue_name) {
                queue.deliver(delivery);
                if queue.claim_drain() {
                    self.broker.spawn_drain(queue_name);
                }
            }
        }
        Ok(PublishOutcome::Routed)
    }

    async fn consume(&self, queue: &str, _consumer_tag: &str) -> CourierResult<mpsc::Receiver<Delivery>> {
        let mut state = self.open_state()?;
        let target = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| CourierError::Transport(format!("NOT_FOUND - no queue '{queue}'")))?;
        self.check_owner(queue, target)?;

        let (sender, receiver) = mpsc::channel(CONSUMER_BUFFER);
        target.consumers.push(Consumer {
            channel_id: self.id,
            sender,
        });
        target.had_consumer = true;
        target.drain_backlog();
        if target.claim_drain() {
            self.broker.spawn_drain(queue.to_string());
        }
        Ok(receiver)
    }

    async fn ack(&self, _delivery_tag: u64) -> CourierResult<()> {
        self.open_state()?.acks += 1;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn close(&self) -> CourierResult<()> {
        if self.connected.swap(false, Ordering::SeqCst) {
            self.broker.state().detach(self.id);
        }
        Ok(())
    }
}
