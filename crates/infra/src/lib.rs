//! Infrastructure layer: broker readiness, topic provisioning, publishing,
//! consume loops and their supervision, the event mirror, configuration.

pub mod config;
pub mod consumer;
pub mod event_store;
pub mod gate;
pub mod producer;
pub mod provisioner;
pub mod retry;
pub mod shutdown;
pub mod supervisor;

/// Kafka adapters for the broker traits.
#[cfg(feature = "kafka")]
pub mod kafka;


pub use config::{BusConfig, ConfigError};
pub use consumer::{
    CommitPolicy, ConsumeError, ConsumeSummary, ConsumerSettings, ConsumerState, EventConsumer,
};
pub use event_store::{
    EventRecord, EventStore, EventStoreError, InMemoryEventStore, PostgresEventStore,
};
pub use gate::{BrokerGate, GateError, ReadyReport, StartupPolicy};
pub use producer::{EventProducer, EventPublisher, ProducerSettings, PublishError};
pub use provisioner::{ProvisionError, ProvisionReport, TopicFailure, TopicProvisioner};
pub use retry::{BackoffStrategy, RetryPolicy};
pub use shutdown::{ShutdownSignal, ShutdownTrigger};
pub use supervisor::{BindingStatus, ConsumerSupervisor, RestartPolicy, SupervisorHandle};
