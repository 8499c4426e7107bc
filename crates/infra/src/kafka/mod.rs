//! Kafka adapters for the broker traits (feature `kafka`, requires librdkafka).
//!
//! One admin client and one producer per process; one consumer client per
//! consume loop.

pub mod admin;
pub mod consumer;
pub mod producer;

pub use admin::KafkaAdmin;
pub use consumer::{KafkaConsumer, KafkaConsumerFactory};
pub use producer::KafkaProducer;

use rdkafka::ClientConfig;
use rdkafka::error::KafkaError;
use rdkafka::types::RDKafkaErrorCode;

use marketbus_events::BrokerError;

fn base_config(bootstrap_servers: &str) -> ClientConfig {
    let mut config = ClientConfig::new();
    config.set("bootstrap.servers", bootstrap_servers);
    config
}

/// Codes after which the client cannot make progress.
fn is_fatal(code: RDKafkaErrorCode) -> bool {
    matches!(
        code,
        RDKafkaErrorCode::AllBrokersDown
            | RDKafkaErrorCode::Fatal
            | RDKafkaErrorCode::Authentication
    )
}

fn map_kafka_error(err: KafkaError) -> BrokerError {
    if let KafkaError::ClientCreation(msg) = &err {
        return BrokerError::Config(msg.clone());
    }
    match err.rdkafka_error_code() {
        Some(code) if is_fatal(code) => BrokerError::Unavailable(err.to_string()),
        Some(RDKafkaErrorCode::BrokerTransportFailure | RDKafkaErrorCode::OperationTimedOut) => {
            BrokerError::Unavailable(err.to_string())
        }
        _ => BrokerError::Other(err.to_string()),
    }
}
