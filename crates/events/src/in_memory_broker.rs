//! In-memory broker for tests/dev.
//!
//! Models just enough of a partitioned log broker to exercise the bus:
//! topics with partitions, per-group committed offsets, per-consumer read
//! positions, and fault injection for readiness, creation, sends and polls.
//!
//! - No IO / no async
//! - Every member of a consumer group reads every partition (no rebalancing)
//! - A new consumer starts from its group's committed offsets, or the
//!   earliest offset when the group has never committed

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use crate::broker::{
    BrokerAdmin, BrokerConsumer, BrokerError, BrokerProducer, ConsumerFactory, CreateTopicOutcome,
    Delivery, DeliveryAck, OutboundRecord, PollOutcome,
};
use crate::topic::TopicDescriptor;

const IDLE_POLL_SLEEP: Duration = Duration::from_millis(5);

#[derive(Debug, Clone)]
struct StoredMessage {
    key: Option<String>,
    payload: Vec<u8>,
}

#[derive(Debug)]
struct TopicLog {
    partitions: Vec<Vec<StoredMessage>>,
    next_partition: usize,
}

impl TopicLog {
    fn new(partitions: u32) -> Self {
        let count = partitions.max(1) as usize;
        Self {
            partitions: vec![Vec::new(); count],
            next_partition: 0,
        }
    }

    fn choose_partition(&mut self, key: Option<&str>) -> usize {
        match key {
            Some(k) => (fnv1a(k.as_bytes()) % self.partitions.len() as u64) as usize,
            None => {
                let p = self.next_partition % self.partitions.len();
                self.next_partition = self.next_partition.wrapping_add(1);
                p
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct GroupPartition {
    group_id: String,
    topic: String,
    partition: i32,
}

#[derive(Debug)]
struct BrokerState {
    topics: BTreeMap<String, TopicLog>,
    committed: HashMap<GroupPartition, i64>,
    available: bool,
    failing_probes: u32,
    probes: u32,
    failing_sends: u32,
    failing_polls: u32,
    message_errors: u32,
    rejected_topics: HashMap<String, String>,
    racing_topics: HashSet<String>,
    create_requests: Vec<String>,
    commits: u64,
}

impl Default for BrokerState {
    fn default() -> Self {
        Self {
            topics: BTreeMap::new(),
            committed: HashMap::new(),
            available: true,
            failing_probes: 0,
            probes: 0,
            failing_sends: 0,
            failing_polls: 0,
            message_errors: 0,
            rejected_topics: HashMap::new(),
            racing_topics: HashSet::new(),
            create_requests: Vec::new(),
            commits: 0,
        }
    }
}

/// Shared in-memory broker. Cloning yields another handle to the same broker.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        // A panic inside a test thread must not wedge every other handle.
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Create a topic directly (bypassing the admin API).
    pub fn with_topic(self, name: &str, partitions: u32) -> Self {
        self.state()
            .topics
            .entry(name.to_string())
            .or_insert_with(|| TopicLog::new(partitions));
        self
    }

    /// Toggle reachability: when unavailable every call fails with
    /// [`BrokerError::Unavailable`].
    pub fn set_available(&self, available: bool) {
        self.state().available = available;
    }

    /// Make the next `n` metadata probes fail.
    pub fn fail_next_probes(&self, n: u32) {
        self.state().failing_probes = n;
    }

    /// Make creation of `topic` fail with `reason` until cleared.
    pub fn reject_topic(&self, topic: &str, reason: &str) {
        self.state()
            .rejected_topics
            .insert(topic.to_string(), reason.to_string());
    }

    pub fn clear_rejections(&self) {
        self.state().rejected_topics.clear();
    }

    /// Simulate another process creating `topic` between our listing and our
    /// create call: the create reports "already exists".
    pub fn race_topic_creation(&self, topic: &str) {
        self.state().racing_topics.insert(topic.to_string());
    }

    /// Make the next `n` sends fail.
    pub fn fail_next_sends(&self, n: u32) {
        self.state().failing_sends = n;
    }

    /// Make the next `n` polls fail with a fatal transport error.
    pub fn fail_next_polls(&self, n: u32) {
        self.state().failing_polls = n;
    }

    /// Make the next `n` polls report a non-fatal per-message error.
    pub fn inject_message_errors(&self, n: u32) {
        self.state().message_errors = n;
    }

    /// Number of metadata probes served (successful or not).
    pub fn probe_count(&self) -> u32 {
        self.state().probes
    }

    /// Topic names passed to `create_topics`, in request order.
    pub fn create_requests(&self) -> Vec<String> {
        self.state().create_requests.clone()
    }

    pub fn topic_names(&self) -> Vec<String> {
        self.state().topics.keys().cloned().collect()
    }

    pub fn partition_count(&self, topic: &str) -> Option<usize> {
        self.state().topics.get(topic).map(|t| t.partitions.len())
    }

    /// Every record on `topic`, partition by partition.
    pub fn records(&self, topic: &str) -> Vec<Delivery> {
        let state = self.state();
        let Some(log) = state.topics.get(topic) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        for (p, messages) in log.partitions.iter().enumerate() {
            for (offset, m) in messages.iter().enumerate() {
                out.push(Delivery {
                    topic: topic.to_string(),
                    partition: p as i32,
                    offset: offset as i64,
                    key: m.key.clone(),
                    payload: m.payload.clone(),
                });
            }
        }
        out
    }

    /// Next offset the group will read on the partition, if it ever committed.
    pub fn committed_offset(&self, group_id: &str, topic: &str, partition: i32) -> Option<i64> {
        self.state()
            .committed
            .get(&GroupPartition {
                group_id: group_id.to_string(),
                topic: topic.to_string(),
                partition,
            })
            .copied()
    }

    pub fn commit_count(&self) -> u64 {
        self.state().commits
    }
}

impl BrokerAdmin for InMemoryBroker {
    fn list_topics(&self, _timeout: Duration) -> Result<Vec<String>, BrokerError> {
        let mut state = self.state();
        state.probes += 1;

        if !state.available {
            return Err(BrokerError::Unavailable("broker is down".to_string()));
        }
        if state.failing_probes > 0 {
            state.failing_probes -= 1;
            return Err(BrokerError::Unavailable("metadata request timed out".to_string()));
        }

        Ok(state.topics.keys().cloned().collect())
    }

    fn create_topics(
        &self,
        topics: &[TopicDescriptor],
        _timeout: Duration,
    ) -> Result<Vec<(String, CreateTopicOutcome)>, BrokerError> {
        let mut state = self.state();
        if !state.available {
            return Err(BrokerError::Unavailable("broker is down".to_string()));
        }

        let mut outcomes = Vec::with_capacity(topics.len());
        for d in topics {
            state.create_requests.push(d.name.clone());

            if let Some(reason) = state.rejected_topics.get(&d.name).cloned() {
                outcomes.push((d.name.clone(), CreateTopicOutcome::Failed(reason)));
                continue;
            }

            let raced = state.racing_topics.remove(&d.name);
            if raced || state.topics.contains_key(&d.name) {
                state
                    .topics
                    .entry(d.name.clone())
                    .or_insert_with(|| TopicLog::new(d.partitions));
                outcomes.push((d.name.clone(), CreateTopicOutcome::AlreadyExists));
                continue;
            }

            state.topics.insert(d.name.clone(), TopicLog::new(d.partitions));
            outcomes.push((d.name.clone(), CreateTopicOutcome::Created));
        }

        Ok(outcomes)
    }
}

impl BrokerProducer for InMemoryBroker {
    fn send(
        &self,
        record: OutboundRecord<'_>,
        _timeout: Duration,
    ) -> Result<DeliveryAck, BrokerError> {
        let mut state = self.state();
        if !state.available {
            return Err(BrokerError::Unavailable("broker is down".to_string()));
        }
        if state.failing_sends > 0 {
            state.failing_sends -= 1;
            return Err(BrokerError::Delivery("injected send failure".to_string()));
        }

        let log = state
            .topics
            .get_mut(record.topic)
            .ok_or_else(|| BrokerError::Delivery(format!("unknown topic `{}`", record.topic)))?;

        let partition = log.choose_partition(record.key);
        let messages = &mut log.partitions[partition];
        messages.push(StoredMessage {
            key: record.key.map(str::to_string),
            payload: record.payload.to_vec(),
        });

        Ok(DeliveryAck {
            partition: partition as i32,
            offset: (messages.len() - 1) as i64,
        })
    }
}

impl ConsumerFactory for InMemoryBroker {
    type Consumer = InMemoryConsumer;

    fn connect(&self, group_id: &str) -> Result<Self::Consumer, BrokerError> {
        if !self.state().available {
            return Err(BrokerError::Unavailable("broker is down".to_string()));
        }
        Ok(InMemoryConsumer {
            broker: self.clone(),
            group_id: group_id.to_string(),
            subscriptions: Vec::new(),
            positions: HashMap::new(),
            cursor: 0,
        })
    }
}

/// A consumer-group member reading from an [`InMemoryBroker`].
#[derive(Debug)]
pub struct InMemoryConsumer {
    broker: InMemoryBroker,
    group_id: String,
    subscriptions: Vec<String>,
    positions: HashMap<(String, i32), i64>,
    cursor: usize,
}

impl InMemoryConsumer {
    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    fn next_delivery(&mut self) -> Option<Delivery> {
        let state = self.broker.state();

        let mut slots: Vec<(String, i32)> = Vec::new();
        for topic in &self.subscriptions {
            if let Some(log) = state.topics.get(topic) {
                for p in 0..log.partitions.len() {
                    slots.push((topic.clone(), p as i32));
                }
            }
        }
        if slots.is_empty() {
            return None;
        }

        for step in 0..slots.len() {
            let idx = (self.cursor + step) % slots.len();
            let (topic, partition) = &slots[idx];
            let key = (topic.clone(), *partition);

            let position = *self.positions.entry(key.clone()).or_insert_with(|| {
                state
                    .committed
                    .get(&GroupPartition {
                        group_id: self.group_id.clone(),
                        topic: topic.clone(),
                        partition: *partition,
                    })
                    .copied()
                    .unwrap_or(0)
            });

            let messages = &state.topics[topic].partitions[*partition as usize];
            if let Some(m) = messages.get(position as usize) {
                self.positions.insert(key, position + 1);
                self.cursor = idx + 1;
                return Some(Delivery {
                    topic: topic.clone(),
                    partition: *partition,
                    offset: position,
                    key: m.key.clone(),
                    payload: m.payload.clone(),
                });
            }
        }

        None
    }
}

impl BrokerConsumer for InMemoryConsumer {
    fn subscribe(&mut self, topics: &[&str]) -> Result<(), BrokerError> {
        for t in topics {
            if !self.subscriptions.iter().any(|s| s == t) {
                self.subscriptions.push(t.to_string());
            }
        }
        Ok(())
    }

    fn poll(&mut self, timeout: Duration) -> Result<PollOutcome, BrokerError> {
        {
            let mut state = self.broker.state();
            if !state.available {
                return Err(BrokerError::Unavailable("broker is down".to_string()));
            }
            if state.failing_polls > 0 {
                state.failing_polls -= 1;
                return Err(BrokerError::Unavailable("connection reset by broker".to_string()));
            }
            if state.message_errors > 0 {
                state.message_errors -= 1;
                return Ok(PollOutcome::MessageError("injected message error".to_string()));
            }
        }

        if let Some(delivery) = self.next_delivery() {
            return Ok(PollOutcome::Message(delivery));
        }

        thread::sleep(timeout.min(IDLE_POLL_SLEEP));
        Ok(PollOutcome::Empty)
    }

    fn commit(&mut self, delivery: &Delivery) -> Result<(), BrokerError> {
        let mut state = self.broker.state();
        if !state.available {
            return Err(BrokerError::Offset("broker is down".to_string()));
        }
        state.committed.insert(
            GroupPartition {
                group_id: self.group_id.clone(),
                topic: delivery.topic.clone(),
                partition: delivery.partition,
            },
            delivery.offset + 1,
        );
        state.commits += 1;
        Ok(())
    }

    fn rewind(&mut self, delivery: &Delivery) -> Result<(), BrokerError> {
        self.positions
            .insert((delivery.topic.clone(), delivery.partition), delivery.offset);
        Ok(())
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in bytes {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    const T: Duration = Duration::from_millis(10);

    fn send(broker: &InMemoryBroker, topic: &str, key: Option<&str>, body: &str) -> DeliveryAck {
        broker
            .send(
                OutboundRecord {
                    topic,
                    key,
                    payload: body.as_bytes(),
                },
                T,
            )
            .unwrap()
    }

    fn next_message(consumer: &mut InMemoryConsumer) -> Option<Delivery> {
        match consumer.poll(T).unwrap() {
            PollOutcome::Message(d) => Some(d),
            _ => None,
        }
    }

    #[test]
    fn keyed_records_stay_on_one_partition() {
        let broker = InMemoryBroker::new().with_topic("t", 3);
        let a = send(&broker, "t", Some("cart-1"), "a");
        let b = send(&broker, "t", Some("cart-1"), "b");
        assert_eq!(a.partition, b.partition);
        assert_eq!(b.offset, a.offset + 1);
    }

    #[test]
    fn groups_track_offsets_independently() {
        let broker = InMemoryBroker::new().with_topic("t", 1);
        send(&broker, "t", None, "m1");

        let mut g1 = broker.connect("g1").unwrap();
        g1.subscribe(&["t"]).unwrap();
        let d = next_message(&mut g1).unwrap();
        g1.commit(&d).unwrap();

        let mut g1_again = broker.connect("g1").unwrap();
        g1_again.subscribe(&["t"]).unwrap();
        assert!(next_message(&mut g1_again).is_none());

        let mut g2 = broker.connect("g2").unwrap();
        g2.subscribe(&["t"]).unwrap();
        assert_eq!(next_message(&mut g2).unwrap().payload, b"m1".to_vec());
        assert_eq!(broker.committed_offset("g1", "t", 0), Some(1));
        assert_eq!(broker.committed_offset("g2", "t", 0), None);
    }

    #[test]
    fn rewind_redelivers_the_same_offset() {
        let broker = InMemoryBroker::new().with_topic("t", 1);
        send(&broker, "t", None, "m1");

        let mut c = broker.connect("g").unwrap();
        c.subscribe(&["t"]).unwrap();
        let first = next_message(&mut c).unwrap();
        c.rewind(&first).unwrap();
        let again = next_message(&mut c).unwrap();
        assert_eq!(first, again);
    }

    #[test]
    fn racing_creation_reports_already_exists() {
        let broker = InMemoryBroker::new();
        broker.race_topic_creation("t");
        let out = broker
            .create_topics(&[TopicDescriptor::new("t", 1, 1)], T)
            .unwrap();
        assert_eq!(out, vec![("t".to_string(), CreateTopicOutcome::AlreadyExists)]);
        assert_eq!(broker.topic_names(), vec!["t".to_string()]);
    }

    #[test]
    fn unavailable_broker_fails_every_call() {
        let broker = InMemoryBroker::new().with_topic("t", 1);
        broker.set_available(false);
        assert!(broker.list_topics(T).is_err());
        assert!(broker.connect("g").is_err());
        let err = broker
            .send(
                OutboundRecord {
                    topic: "t",
                    key: None,
                    payload: b"x",
                },
                T,
            )
            .unwrap_err();
        assert!(matches!(err, BrokerError::Unavailable(_)));
    }
}
