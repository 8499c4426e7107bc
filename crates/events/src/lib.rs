//! Event envelope, topic table and broker abstractions.
//!
//! This crate holds the **mechanics** shared by producers and consumers:
//! the wire shape of an event, the fixed topic set, the broker client traits,
//! the handler contract, and an in-memory broker for tests/dev. Concrete
//! broker and store adapters live in `marketbus-infra`.

pub mod broker;
pub mod envelope;
pub mod handler;
pub mod in_memory_broker;
pub mod topic;

pub use broker::{
    BrokerAdmin, BrokerConsumer, BrokerError, BrokerProducer, ConsumerFactory, CreateTopicOutcome,
    Delivery, DeliveryAck, OutboundRecord, PollOutcome,
};
pub use envelope::{EnvelopeError, EventEnvelope};
pub use handler::{ConsumerBinding, EventHandler, HandlerError};
pub use in_memory_broker::{InMemoryBroker, InMemoryConsumer};
pub use topic::{TopicDescriptor, TopicTable};
