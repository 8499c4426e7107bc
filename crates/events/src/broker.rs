//! Broker client abstraction (mechanics only).
//!
//! The bus talks to the broker through four narrow traits so the same
//! producer/consumer logic runs against Kafka in production and against
//! [`InMemoryBroker`](crate::InMemoryBroker) in tests:
//!
//! ```text
//! BrokerGate ──────────┐
//! TopicProvisioner ────┴─> BrokerAdmin      (metadata, topic creation)
//! EventProducer ─────────> BrokerProducer   (send + wait for ack)
//! EventConsumer ─────────> ConsumerFactory  (one client per consumer group)
//!                              └─> BrokerConsumer (subscribe / poll / commit / rewind)
//! ```
//!
//! All traits are synchronous; implementations own their IO and buffering.
//! Handles are `Send + Sync` so one instance per process can be shared.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::topic::TopicDescriptor;

/// Broker transport failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BrokerError {
    /// The broker could not be reached (connect, metadata, all brokers down).
    #[error("broker unavailable: {0}")]
    Unavailable(String),

    /// No acknowledgement arrived within the send timeout.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The broker refused or failed to deliver a record.
    #[error("delivery failed: {0}")]
    Delivery(String),

    /// Offset commit or seek failed.
    #[error("offset operation failed: {0}")]
    Offset(String),

    /// Client configuration was rejected.
    #[error("client configuration rejected: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

/// Per-topic outcome of a creation request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateTopicOutcome {
    Created,
    AlreadyExists,
    Failed(String),
}

/// Administrative access: metadata and topic creation.
pub trait BrokerAdmin: Send + Sync {
    /// Lightweight metadata query returning every existing topic name.
    fn list_topics(&self, timeout: Duration) -> Result<Vec<String>, BrokerError>;

    /// Request creation of the given topics.
    ///
    /// Returns one outcome per requested descriptor. An `Err` means the
    /// request as a whole could not be issued.
    fn create_topics(
        &self,
        topics: &[TopicDescriptor],
        timeout: Duration,
    ) -> Result<Vec<(String, CreateTopicOutcome)>, BrokerError>;
}

/// A record handed to the producer.
#[derive(Debug, Clone, Copy)]
pub struct OutboundRecord<'a> {
    pub topic: &'a str,
    pub key: Option<&'a str>,
    pub payload: &'a [u8],
}

/// Broker acknowledgement for one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryAck {
    pub partition: i32,
    pub offset: i64,
}

/// Sending side of the broker.
pub trait BrokerProducer: Send + Sync {
    /// Send one record and block until it is acknowledged or `timeout` expires.
    ///
    /// Transport-level retries happen inside the implementation.
    fn send(&self, record: OutboundRecord<'_>, timeout: Duration)
    -> Result<DeliveryAck, BrokerError>;
}

/// A message received by a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
    pub payload: Vec<u8>,
}

/// Result of a single poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    Message(Delivery),
    /// No message arrived within the poll timeout.
    Empty,
    /// Reached the current end of a partition; not an error.
    PartitionEof,
    /// A non-fatal per-message error; the loop keeps polling.
    MessageError(String),
}

/// One consumer-group member subscribed to topics.
///
/// Returned errors from `poll` are fatal to the loop using the consumer.
pub trait BrokerConsumer: Send {
    fn subscribe(&mut self, topics: &[&str]) -> Result<(), BrokerError>;

    fn poll(&mut self, timeout: Duration) -> Result<PollOutcome, BrokerError>;

    /// Mark `delivery` (and everything before it on its partition) as processed
    /// for the group.
    fn commit(&mut self, delivery: &Delivery) -> Result<(), BrokerError>;

    /// Reposition the partition so the next poll returns `delivery` again.
    fn rewind(&mut self, delivery: &Delivery) -> Result<(), BrokerError>;
}

/// Creates consumers bound to a consumer group (auto-commit off,
/// auto-offset-reset earliest).
pub trait ConsumerFactory: Send + Sync {
    type Consumer: BrokerConsumer;

    fn connect(&self, group_id: &str) -> Result<Self::Consumer, BrokerError>;
}

impl<A> BrokerAdmin for Arc<A>
where
    A: BrokerAdmin + ?Sized,
{
    fn list_topics(&self, timeout: Duration) -> Result<Vec<String>, BrokerError> {
        (**self).list_topics(timeout)
    }

    fn create_topics(
        &self,
        topics: &[TopicDescriptor],
        timeout: Duration,
    ) -> Result<Vec<(String, CreateTopicOutcome)>, BrokerError> {
        (**self).create_topics(topics, timeout)
    }
}

impl<P> BrokerProducer for Arc<P>
where
    P: BrokerProducer + ?Sized,
{
    fn send(
        &self,
        record: OutboundRecord<'_>,
        timeout: Duration,
    ) -> Result<DeliveryAck, BrokerError> {
        (**self).send(record, timeout)
    }
}

impl<F> ConsumerFactory for Arc<F>
where
    F: ConsumerFactory + ?Sized,
{
    type Consumer = F::Consumer;

    fn connect(&self, group_id: &str) -> Result<Self::Consumer, BrokerError> {
        (**self).connect(group_id)
    }
}
