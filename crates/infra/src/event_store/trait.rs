use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use thiserror::Error;

use marketbus_core::{Document, StoredEventId};
use marketbus_events::{EnvelopeError, EventEnvelope, envelope::wire_time};

/// A record in the event mirror: one envelope plus store-side metadata.
///
/// The stored document is the envelope's wire form, followed by
/// `storedAt` and any annotations. Annotations never overwrite envelope
/// fields.
#[derive(Debug, Clone, PartialEq)]
pub struct EventRecord {
    pub id: StoredEventId,
    pub envelope: EventEnvelope,
    pub stored_at: DateTime<Utc>,
    /// Processing metadata, e.g. `processingStartedAt`, `consumedBy`, `status`.
    pub annotations: Document,
}

impl EventRecord {
    pub fn new(envelope: EventEnvelope) -> Self {
        Self {
            id: StoredEventId::new(),
            envelope,
            stored_at: Utc::now(),
            annotations: Document::new(),
        }
    }

    pub fn annotate(mut self, key: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }

    /// Flatten into the persisted document shape.
    pub fn to_document(&self) -> Result<Document, EventStoreError> {
        let mut doc = self.envelope.to_document()?;
        doc.insert(
            "storedAt".to_string(),
            JsonValue::String(wire_time::format(&self.stored_at)),
        );
        for (k, v) in &self.annotations {
            if !doc.contains_key(k) {
                doc.insert(k.clone(), v.clone());
            }
        }
        Ok(doc)
    }
}

#[derive(Debug, Error)]
pub enum EventStoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("document rejected: {0}")]
    Rejected(String),

    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
}

/// Write side of the event mirror.
///
/// Implementations are shared across consumer threads and the producer, so
/// they must tolerate concurrent callers.
pub trait EventStore: Send + Sync {
    /// Persist one record and return its store id.
    fn insert(&self, record: EventRecord) -> Result<StoredEventId, EventStoreError>;

    /// Persist a bare envelope.
    fn insert_event(&self, envelope: &EventEnvelope) -> Result<StoredEventId, EventStoreError> {
        self.insert(EventRecord::new(envelope.clone()))
    }
}

impl<S> EventStore for Arc<S>
where
    S: EventStore + ?Sized,
{
    fn insert(&self, record: EventRecord) -> Result<StoredEventId, EventStoreError> {
        (**self).insert(record)
    }

    fn insert_event(&self, envelope: &EventEnvelope) -> Result<StoredEventId, EventStoreError> {
        (**self).insert_event(envelope)
    }
}
