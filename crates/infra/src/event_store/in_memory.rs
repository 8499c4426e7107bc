use std::sync::RwLock;

use marketbus_core::{Document, EventId, StoredEventId};

use super::r#trait::{EventRecord, EventStore, EventStoreError};

/// In-memory event mirror.
///
/// Intended for tests/dev. Not optimized for performance.
#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    records: RwLock<Vec<EventRecord>>,
    failing: RwLock<u32>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` inserts fail with [`EventStoreError::Unavailable`].
    pub fn fail_next_inserts(&self, n: u32) {
        if let Ok(mut f) = self.failing.write() {
            *f = n;
        }
    }

    pub fn len(&self) -> usize {
        self.records.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every record, in insertion order.
    pub fn records(&self) -> Vec<EventRecord> {
        self.records.read().map(|r| r.clone()).unwrap_or_default()
    }

    /// Records mirroring the given event (one per insert; consumers may
    /// re-record an event on redelivery).
    pub fn find_by_event_id(&self, event_id: EventId) -> Vec<EventRecord> {
        self.records()
            .into_iter()
            .filter(|r| r.envelope.event_id() == event_id)
            .collect()
    }

    pub fn find_by_topic(&self, topic: &str) -> Vec<EventRecord> {
        self.records()
            .into_iter()
            .filter(|r| r.envelope.topic() == topic)
            .collect()
    }

    /// Persisted document shapes, in insertion order.
    pub fn documents(&self) -> Result<Vec<Document>, EventStoreError> {
        self.records().iter().map(EventRecord::to_document).collect()
    }
}

impl EventStore for InMemoryEventStore {
    fn insert(&self, record: EventRecord) -> Result<StoredEventId, EventStoreError> {
        {
            let mut failing = self
                .failing
                .write()
                .map_err(|_| EventStoreError::Unavailable("lock poisoned".to_string()))?;
            if *failing > 0 {
                *failing -= 1;
                return Err(EventStoreError::Unavailable("injected insert failure".to_string()));
            }
        }

        // Reject anything that would not serialize into a stored document.
        record.to_document()?;

        let id = record.id;
        self.records
            .write()
            .map_err(|_| EventStoreError::Unavailable("lock poisoned".to_string()))?
            .push(record);
        Ok(id)
    }
}
