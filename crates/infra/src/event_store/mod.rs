//! Durable mirror of published events.
//!
//! The bus writes every acknowledged event here so services can query what
//! flowed through the broker without replaying topics. Consumers also record
//! the envelopes they process, annotated with processing metadata.

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::InMemoryEventStore;
pub use postgres::PostgresEventStore;
pub use r#trait::{EventRecord, EventStore, EventStoreError};
