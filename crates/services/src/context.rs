use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;

use marketbus_events::envelope::wire_time;
use marketbus_events::{EventEnvelope, HandlerError};
use marketbus_infra::{EventPublisher, EventRecord, EventStore};

/// Process-wide collaborators handed to every handler.
///
/// One publisher and one store per process, shared by all consume loops.
#[derive(Clone)]
pub struct ServiceContext {
    publisher: Arc<dyn EventPublisher>,
    store: Arc<dyn EventStore>,
}

impl std::fmt::Debug for ServiceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceContext").finish_non_exhaustive()
    }
}

impl ServiceContext {
    pub fn new(publisher: Arc<dyn EventPublisher>, store: Arc<dyn EventStore>) -> Self {
        Self { publisher, store }
    }

    pub fn publisher(&self) -> &Arc<dyn EventPublisher> {
        &self.publisher
    }

    pub fn store(&self) -> &Arc<dyn EventStore> {
        &self.store
    }

    /// Mirror a received envelope, tagged with the consuming group and the
    /// time processing started.
    pub fn record_received(
        &self,
        envelope: &EventEnvelope,
        group_id: &str,
        started_at: DateTime<Utc>,
        extra: impl IntoIterator<Item = (&'static str, Value)>,
    ) -> Result<(), HandlerError> {
        let mut record = EventRecord::new(envelope.clone())
            .annotate("consumedBy", group_id)
            .annotate("processingStartedAt", wire_time::format(&started_at));
        for (k, v) in extra {
            record = record.annotate(k, v);
        }
        self.store
            .insert(record)
            .map(|_| ())
            .map_err(|e| HandlerError::side_effect(format!("event mirror write failed: {e}")))
    }
}
