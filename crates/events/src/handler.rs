use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::EventEnvelope;

/// Failure reported by a consumer handler.
///
/// Handler errors never propagate out of the consume loop: they are logged and
/// the loop's commit policy decides whether the offset advances.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HandlerError {
    /// The event is malformed for this handler (missing fields, bad shape).
    #[error("rejected event: {0}")]
    Rejected(String),

    /// A side effect (store write, downstream publish) failed.
    #[error("side effect failed: {0}")]
    SideEffect(String),

    /// The handler panicked; the loop caught it.
    #[error("handler panicked: {0}")]
    Panicked(String),
}

impl HandlerError {
    pub fn rejected(msg: impl Into<String>) -> Self {
        Self::Rejected(msg.into())
    }

    pub fn side_effect(msg: impl Into<String>) -> Self {
        Self::SideEffect(msg.into())
    }
}

/// Processes one envelope delivered by a consume loop.
///
/// Handlers run synchronously on the loop's thread and must tolerate
/// redelivery (at-least-once).
pub trait EventHandler: Send + Sync {
    fn handle(&self, envelope: &EventEnvelope) -> Result<(), HandlerError>;
}

impl<F> EventHandler for F
where
    F: Fn(&EventEnvelope) -> Result<(), HandlerError> + Send + Sync,
{
    fn handle(&self, envelope: &EventEnvelope) -> Result<(), HandlerError> {
        self(envelope)
    }
}

/// One consume loop to run: `(topic, group, handler)`.
///
/// Bindings live in memory for the process lifetime and are never persisted.
#[derive(Clone)]
pub struct ConsumerBinding {
    topic: String,
    group_id: String,
    handler: Arc<dyn EventHandler>,
}

impl ConsumerBinding {
    pub fn new(
        topic: impl Into<String>,
        group_id: impl Into<String>,
        handler: Arc<dyn EventHandler>,
    ) -> Self {
        Self {
            topic: topic.into(),
            group_id: group_id.into(),
            handler,
        }
    }

    /// Bind a closure or handler value directly.
    pub fn from_fn<H>(topic: impl Into<String>, group_id: impl Into<String>, handler: H) -> Self
    where
        H: EventHandler + 'static,
    {
        Self::new(topic, group_id, Arc::new(handler))
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    pub fn handler(&self) -> &Arc<dyn EventHandler> {
        &self.handler
    }

    /// `topic/group`, used for thread names and status keys.
    pub fn name(&self) -> String {
        format!("{}/{}", self.topic, self.group_id)
    }
}

impl fmt::Debug for ConsumerBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerBinding")
            .field("topic", &self.topic)
            .field("group_id", &self.group_id)
            .finish_non_exhaustive()
    }
}
