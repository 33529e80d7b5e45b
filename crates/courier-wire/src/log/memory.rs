//! In-process log broker.
//!
//! Records of a topic that has no live member in a group wait in that group's
//! bounded backlog. When the backlog is full the oldest record is dropped.

use super::broker::{LogBroker, LogRecord};
use async_trait::async_trait;
use courier_types::error::{CourierError, CourierResult};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Default number of records a group keeps per topic while nobody consumes it.
pub const DEFAULT_BACKLOG_LIMIT: usize = 10_000;

struct Member {
    id: u64,
    topics: HashSet<String>,
    sender: mpsc::Sender<LogRecord>,
}

#[derive(Default)]
struct Group {
    members: Vec<Member>,
    /// Member currently assigned to each topic.
    owners: HashMap<String, u64>,
    /// Records produced while no member was subscribed.
    backlog: HashMap<String, VecDeque<LogRecord>>,
    /// Topics whose backlog a drain task is feeding to the owner.
    draining: HashSet<String>,
    topics: HashSet<String>,
}

impl Group {
    fn owner_of(&mut self, topic: &str) -> Option<mpsc::Sender<LogRecord>> {
        self.members.retain(|m| !m.sender.is_closed());
        if let Some(id) = self.owners.get(topic) {
            if let Some(member) = self.members.iter().find(|m| m.id == *id) {
                return Some(member.sender.clone());
            }
        }
        let member = self.members.iter().find(|m| m.topics.contains(topic))?;
        self.owners.insert(topic.to_string(), member.id);
        Some(member.sender.clone())
    }

    fn has_backlog(&self, topic: &str) -> bool {
        self.draining.contains(topic) || self.backlog.get(topic).is_some_and(|b| !b.is_empty())
    }

    fn enqueue(&mut self, group: &str, record: LogRecord, limit: usize) {
        let backlog = self.backlog.entry(record.topic.clone()).or_default();
        if backlog.len() >= limit {
            if let Some(dropped) = backlog.pop_front() {
                warn!(group, topic = %dropped.topic, offset = dropped.offset, "Log backlog full; oldest record dropped");
            }
        }
        backlog.push_back(record);
    }

    /// Whether a drain task should be started for `topic`; marks it as draining.
    fn claim_drain(&mut self, topic: &str) -> bool {
        if self.draining.contains(topic) || !self.has_backlog(topic) || self.owner_of(topic).is_none() {
            return false;
        }
        self.draining.insert(topic.to_string());
        true
    }
}

struct LogState {
    /// Next offset per topic.
    topics: HashMap<String, i64>,
    groups: HashMap<String, Group>,
    next_member: u64,
    backlog_limit: usize,
}

impl Default for LogState {
    fn default() -> Self {
        Self {
            topics: HashMap::new(),
            groups: HashMap::new(),
            next_member: 0,
            backlog_limit: DEFAULT_BACKLOG_LIMIT,
        }
    }
}

/// Shared in-memory log broker. Clones see the same topics and groups.
#[derive(Clone, Default)]
pub struct MemoryLogBroker {
    state: Arc<Mutex<LogState>>,
}

impl MemoryLogBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep at most `limit` waiting records per group and topic.
    pub fn with_backlog_limit(self, limit: usize) -> Self {
        self.state().backlog_limit = limit.max(1);
        self
    }

    fn state(&self) -> MutexGuard<'_, LogState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records of `topic` waiting in `group`.
    pub fn backlog_len(&self, group: &str, topic: &str) -> usize {
        self.state()
            .groups
            .get(group)
            .and_then(|g| g.backlog.get(topic))
            .map_or(0, VecDeque::len)
    }

    fn spawn_drain(&self, group: &str, topic: &str) {
        debug!(group, topic, "Draining log backlog");
        tokio::spawn(self.clone().drain(group.to_string(), topic.to_string()));
    }

    /// Hand the backlog of `topic` to the group's owner one record at a time,
    /// waiting for room in its channel. Ends when the backlog is empty or the
    /// topic has no owner left.
    async fn drain(self, group: String, topic: String) {
        loop {
            let (sender, record) = {
                let mut state = self.state();
                let Some(target) = state.groups.get_mut(&group) else {
                    return;
                };
                let next = target.backlog.get_mut(&topic).and_then(VecDeque::pop_front);
                match (next, target.owner_of(&topic)) {
                    (Some(record), Some(sender)) => (sender, record),
                    (next, _) => {
                        if let Some(record) = next {
                            target.backlog.entry(topic.clone()).or_default().push_front(record);
                        }
                        target.draining.remove(&topic);
                        return;
                    }
                }
            };
            if let Err(mpsc::error::SendError(record)) = sender.send(record).await {
                // The owner left; the record goes to whoever owns the topic next.
                if let Some(target) = self.state().groups.get_mut(&group) {
                    target.backlog.entry(topic.clone()).or_default().push_front(record);
                }
            }
        }
    }

    pub fn has_topic(&self, topic: &str) -> bool {
        self.state().topics.contains_key(topic)
    }

    /// Live members of `group`.
    pub fn group_members(&self, group: &str) -> usize {
        self.state()
            .groups
            .get(group)
            .map(|g| g.members.iter().filter(|m| !m.sender.is_closed()).count())
            .unwrap_or(0)
    }

    pub fn groups(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state().groups.keys().cloned().collect();
        names.sort();
        names
    }
}

#[async_trait]
impl LogBroker for MemoryLogBroker {
    async fn create_topic(&self, topic: &str, _partitions: i32, _replication_factor: i32) -> CourierResult<()> {
        self.state().topics.entry(topic.to_string()).or_insert(0);
        Ok(())
    }

    async fn produce(&self, topic: &str, payload: &[u8]) -> CourierResult<()> {
        let (targets, drains) = {
            let mut state = self.state();
            let limit = state.backlog_limit;
            let offset = state.topics.entry(topic.to_string()).or_insert(0);
            let record = LogRecord {
                topic: topic.to_string(),
                payload: payload.to_vec(),
                offset: *offset,
            };
            *offset += 1;

            let mut targets = Vec::new();
            let mut drains = Vec::new();
            for (name, group) in state.groups.iter_mut().filter(|(_, g)| g.topics.contains(topic)) {
                // Records queue behind any backlog so the topic stays in order.
                if group.has_backlog(topic) {
                    group.enqueue(name, record.clone(), limit);
                } else if let Some(sender) = group.owner_of(topic) {
                    targets.push((sender, record.clone()));
                } else {
                    group.enqueue(name, record.clone(), limit);
                }
                if group.claim_drain(topic) {
                    drains.push(name.clone());
                }
            }
            (targets, drains)
        };

        for group in drains {
            self.spawn_drain(&group, topic);
        }
        // Sent outside the lock so a full consumer applies backpressure.
        for (sender, record) in targets {
            if sender.send(record).await.is_err() {
                debug!(topic, "Log consumer left before delivery");
            }
        }
        Ok(())
    }

    async fn subscribe(&self, group: &str, topics: &[String], capacity: usize) -> CourierResult<mpsc::Receiver<LogRecord>> {
        if topics.is_empty() {
            return Err(CourierError::InvalidArgument("subscription without topics".to_string()));
        }
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let drains: Vec<String> = {
            let mut state = self.state();
            state.next_member += 1;
            let id = state.next_member;
            for topic in topics {
                state.topics.entry(topic.clone()).or_insert(0);
            }

            let members = state.groups.entry(group.to_string()).or_default();
            members.topics.extend(topics.iter().cloned());
            members.members.push(Member {
                id,
                topics: topics.iter().cloned().collect(),
                sender,
            });
            topics.iter().filter(|topic| members.claim_drain(topic)).cloned().collect()
        };

        for topic in drains {
            self.spawn_drain(group, &topic);
        }
        Ok(receiver)
    }

    async fn delete_group(&self, group: &str) -> CourierResult<()> {
        if self.state().groups.remove(group).is_some() {
            debug!(group, "Log group deleted");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topics(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[tokio::test]
    async fn test_each_group_gets_a_copy() {
        let broker = MemoryLogBroker::new();
        let mut a = broker.subscribe("a", &topics(&["t"]), 8).await.unwrap();
        let mut b = broker.subscribe("b", &topics(&["t"]), 8).await.unwrap();
        broker.produce("t", b"1").await.unwrap();
        assert_eq!(a.recv().await.unwrap().payload, b"1".to_vec());
        assert_eq!(b.recv().await.unwrap().payload, b"1".to_vec());
    }

    #[tokio::test]
    async fn test_topic_sticks_to_one_member() {
        let broker = MemoryLogBroker::new();
        let mut first = broker.subscribe("g", &topics(&["t"]), 8).await.unwrap();
        let mut second = broker.subscribe("g", &topics(&["t"]), 8).await.unwrap();
        for i in 0..3u8 {
            broker.produce("t", &[i]).await.unwrap();
        }
        for i in 0..3u8 {
            let record = first.recv().await.unwrap();
            assert_eq!(record.payload, vec![i]);
            assert_eq!(record.offset, i as i64);
        }
        assert!(second.try_recv().is_err());

        // The topic moves when its member leaves.
        drop(first);
        broker.produce("t", b"x").await.unwrap();
        assert_eq!(second.recv().await.unwrap().payload, b"x".to_vec());
    }

    #[tokio::test]
    async fn test_backlog_waits_for_a_member() {
        let broker = MemoryLogBroker::new();
        let early = broker.subscribe("g", &topics(&["t"]), 8).await.unwrap();
        drop(early);
        broker.produce("t", b"kept").await.unwrap();
        assert_eq!(broker.group_members("g"), 0);

        let mut late = broker.subscribe("g", &topics(&["t"]), 8).await.unwrap();
        assert_eq!(late.recv().await.unwrap().payload, b"kept".to_vec());
    }

    #[tokio::test]
    async fn test_backlog_larger_than_channel_is_drained_in_order() {
        let broker = MemoryLogBroker::new();
        drop(broker.subscribe("g", &topics(&["t"]), 4).await.unwrap());
        for i in 0..10u8 {
            broker.produce("t", &[i]).await.unwrap();
        }

        let mut late = broker.subscribe("g", &topics(&["t"]), 4).await.unwrap();
        broker.produce("t", &[10]).await.unwrap();
        for i in 0..=10u8 {
            let record = tokio::time::timeout(std::time::Duration::from_secs(2), late.recv())
                .await
                .expect("backlog stalled")
                .unwrap();
            assert_eq!(record.payload, vec![i]);
        }
        assert_eq!(broker.backlog_len("g", "t"), 0);
    }

    #[tokio::test]
    async fn test_abandoned_group_backlog_is_bounded() {
        let broker = MemoryLogBroker::new().with_backlog_limit(100);
        drop(broker.subscribe("gone", &topics(&["t"]), 8).await.unwrap());
        for i in 0..1000u32 {
            broker.produce("t", &i.to_be_bytes()).await.unwrap();
        }
        assert_eq!(broker.backlog_len("gone", "t"), 100);

        // The newest records are the ones kept.
        let mut late = broker.subscribe("gone", &topics(&["t"]), 8).await.unwrap();
        assert_eq!(late.recv().await.unwrap().payload, 900u32.to_be_bytes().to_vec());
    }

    #[tokio::test]
    async fn test_deleted_group_stops_collecting() {
        let broker = MemoryLogBroker::new();
        drop(broker.subscribe("temp", &topics(&["t"]), 8).await.unwrap());
        broker.produce("t", b"1").await.unwrap();
        assert_eq!(broker.backlog_len("temp", "t"), 1);

        broker.delete_group("temp").await.unwrap();
        broker.produce("t", b"2").await.unwrap();
        assert!(!broker.groups().contains(&"temp".to_string()));
        assert_eq!(broker.backlog_len("temp", "t"), 0);
    }
}
