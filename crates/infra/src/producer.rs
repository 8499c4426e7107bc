//! Publishing side of the bus.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{Span, debug, error, instrument, warn};

use marketbus_core::{Document, EventId};
use marketbus_events::{
    BrokerError, BrokerProducer, EnvelopeError, EventEnvelope, OutboundRecord, TopicTable,
};

use crate::event_store::{EventStore, EventStoreError};

/// Producer tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProducerSettings {
    /// Bound on waiting for one acknowledgement (`message.timeout.ms`).
    pub send_timeout: Duration,
    /// Transport-level resend attempts inside the client (`retries`).
    pub retries: u32,
}

impl Default for ProducerSettings {
    fn default() -> Self {
        Self {
            send_timeout: Duration::from_millis(5000),
            retries: 5,
        }
    }
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("topic `{0}` is not provisioned")]
    InvalidTopic(String),

    #[error("event source must not be empty")]
    InvalidSource,

    #[error("could not serialize event: {0}")]
    Serialization(#[source] EnvelopeError),

    /// The broker did not acknowledge; the event may or may not be on the topic.
    #[error("event {event_id} was not acknowledged: {source}")]
    Transport {
        event_id: EventId,
        #[source]
        source: BrokerError,
    },

    /// The event is on the broker but the store write failed.
    #[error(
        "event {event_id} delivered to partition {partition} offset {offset} \
         but not mirrored: {source}"
    )]
    Mirror {
        event_id: EventId,
        partition: i32,
        offset: i64,
        #[source]
        source: EventStoreError,
    },
}

/// Object-safe publishing surface handed to handlers and services.
pub trait EventPublisher: Send + Sync {
    fn publish(
        &self,
        topic: &str,
        source: &str,
        payload: Document,
        snapshot: Option<Document>,
    ) -> Result<EventEnvelope, PublishError>;

    /// Like [`publish`](Self::publish), with a partition key so events for
    /// one entity keep their relative order.
    fn publish_keyed(
        &self,
        key: &str,
        topic: &str,
        source: &str,
        payload: Document,
        snapshot: Option<Document>,
    ) -> Result<EventEnvelope, PublishError>;
}

impl<T> EventPublisher for Arc<T>
where
    T: EventPublisher + ?Sized,
{
    fn publish(
        &self,
        topic: &str,
        source: &str,
        payload: Document,
        snapshot: Option<Document>,
    ) -> Result<EventEnvelope, PublishError> {
        (**self).publish(topic, source, payload, snapshot)
    }

    fn publish_keyed(
        &self,
        key: &str,
        topic: &str,
        source: &str,
        payload: Document,
        snapshot: Option<Document>,
    ) -> Result<EventEnvelope, PublishError> {
        (**self).publish_keyed(key, topic, source, payload, snapshot)
    }
}

/// Wraps one broker producer handle plus the event mirror.
///
/// Ordering per call: validate, build envelope, send and wait for the ack,
/// then mirror. The store never sees an event the broker did not accept.
#[derive(Debug)]
pub struct EventProducer<P, S> {
    producer: P,
    store: S,
    topics: TopicTable,
    settings: ProducerSettings,
}

impl<P, S> EventProducer<P, S>
where
    P: BrokerProducer,
    S: EventStore,
{
    pub fn new(producer: P, store: S, topics: TopicTable) -> Self {
        Self {
            producer,
            store,
            topics,
            settings: ProducerSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: ProducerSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn topics(&self) -> &TopicTable {
        &self.topics
    }

    #[instrument(
        name = "publish",
        skip(self, payload, snapshot),
        fields(
            event_id = tracing::field::Empty,
            partition = tracing::field::Empty,
            offset = tracing::field::Empty
        ),
        err
    )]
    fn publish_inner(
        &self,
        key: Option<&str>,
        topic: &str,
        source: &str,
        payload: Document,
        snapshot: Option<Document>,
    ) -> Result<EventEnvelope, PublishError> {
        if !self.topics.contains(topic) {
            return Err(PublishError::InvalidTopic(topic.to_string()));
        }
        if source.trim().is_empty() {
            return Err(PublishError::InvalidSource);
        }

        let envelope = EventEnvelope::issue(topic, source, payload, snapshot).map_err(|e| match e {
            EnvelopeError::EmptySource => PublishError::InvalidSource,
            EnvelopeError::EmptyTopic => PublishError::InvalidTopic(topic.to_string()),
            other => PublishError::Serialization(other),
        })?;
        let event_id = envelope.event_id();
        let span = Span::current();
        span.record("event_id", tracing::field::display(event_id));

        let bytes = envelope.to_bytes().map_err(PublishError::Serialization)?;

        let ack = self
            .producer
            .send(
                OutboundRecord {
                    topic,
                    key,
                    payload: &bytes,
                },
                self.settings.send_timeout,
            )
            .map_err(|source| {
                error!(error = %source, "broker did not acknowledge event");
                PublishError::Transport { event_id, source }
            })?;
        span.record("partition", ack.partition);
        span.record("offset", ack.offset);
        debug!("event acknowledged");

        if let Err(source) = self.store.insert_event(&envelope) {
            warn!(error = %source, "event delivered but not mirrored");
            return Err(PublishError::Mirror {
                event_id,
                partition: ack.partition,
                offset: ack.offset,
                source,
            });
        }

        Ok(envelope)
    }
}

impl<P, S> EventPublisher for EventProducer<P, S>
where
    P: BrokerProducer,
    S: EventStore,
{
    fn publish(
        &self,
        topic: &str,
        source: &str,
        payload: Document,
        snapshot: Option<Document>,
    ) -> Result<EventEnvelope, PublishError> {
        self.publish_inner(None, topic, source, payload, snapshot)
    }

    fn publish_keyed(
        &self,
        key: &str,
        topic: &str,
        source: &str,
        payload: Document,
        snapshot: Option<Document>,
    ) -> Result<EventEnvelope, PublishError> {
        self.publish_inner(Some(key), topic, source, payload, snapshot)
    }
}
