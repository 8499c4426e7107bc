use chrono::Utc;
use tracing::info;

use marketbus_events::{EventEnvelope, EventHandler, HandlerError};

use crate::context::ServiceContext;

/// Records every received envelope in the event mirror and nothing else.
#[derive(Debug, Clone)]
pub struct MirrorHandler {
    ctx: ServiceContext,
    group_id: &'static str,
}

impl MirrorHandler {
    pub fn new(ctx: ServiceContext, group_id: &'static str) -> Self {
        Self { ctx, group_id }
    }
}

impl EventHandler for MirrorHandler {
    fn handle(&self, envelope: &EventEnvelope) -> Result<(), HandlerError> {
        self.ctx
            .record_received(envelope, self.group_id, Utc::now(), [])?;
        info!(
            topic = envelope.topic(),
            group_id = self.group_id,
            event_id = %envelope.event_id(),
            "event mirrored"
        );
        Ok(())
    }
}
