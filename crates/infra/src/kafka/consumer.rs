use std::time::Duration;

use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer};
use rdkafka::error::KafkaError;
use rdkafka::message::Message;
use rdkafka::{Offset, TopicPartitionList};

use marketbus_events::{BrokerConsumer, BrokerError, ConsumerFactory, Delivery, PollOutcome};

use super::{base_config, is_fatal, map_kafka_error};

const SEEK_TIMEOUT: Duration = Duration::from_secs(5);

/// Builds one librdkafka consumer per consume loop.
#[derive(Debug, Clone)]
pub struct KafkaConsumerFactory {
    bootstrap_servers: String,
}

impl KafkaConsumerFactory {
    pub fn new(bootstrap_servers: impl Into<String>) -> Self {
        Self {
            bootstrap_servers: bootstrap_servers.into(),
        }
    }
}

impl ConsumerFactory for KafkaConsumerFactory {
    type Consumer = KafkaConsumer;

    fn connect(&self, group_id: &str) -> Result<Self::Consumer, BrokerError> {
        let inner = base_config(&self.bootstrap_servers)
            .set("group.id", group_id)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .set("enable.partition.eof", "true")
            .create::<BaseConsumer>()
            .map_err(map_kafka_error)?;
        Ok(KafkaConsumer { inner })
    }
}

/// Consumer-group member with manual, synchronous commits.
pub struct KafkaConsumer {
    inner: BaseConsumer,
}

impl std::fmt::Debug for KafkaConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KafkaConsumer").finish_non_exhaustive()
    }
}

impl BrokerConsumer for KafkaConsumer {
    fn subscribe(&mut self, topics: &[&str]) -> Result<(), BrokerError> {
        self.inner.subscribe(topics).map_err(map_kafka_error)
    }

    fn poll(&mut self, timeout: Duration) -> Result<PollOutcome, BrokerError> {
        match self.inner.poll(timeout) {
            None => Ok(PollOutcome::Empty),
            Some(Ok(msg)) => Ok(PollOutcome::Message(Delivery {
                topic: msg.topic().to_string(),
                partition: msg.partition(),
                offset: msg.offset(),
                key: msg.key().map(|k| String::from_utf8_lossy(k).into_owned()),
                payload: msg.payload().map(<[u8]>::to_vec).unwrap_or_default(),
            })),
            Some(Err(KafkaError::PartitionEOF(_))) => Ok(PollOutcome::PartitionEof),
            Some(Err(err)) => match err.rdkafka_error_code() {
                Some(code) if is_fatal(code) => Err(BrokerError::Unavailable(err.to_string())),
                _ => Ok(PollOutcome::MessageError(err.to_string())),
            },
        }
    }

    fn commit(&mut self, delivery: &Delivery) -> Result<(), BrokerError> {
        let mut tpl = TopicPartitionList::new();
        let next = Offset::Offset(delivery.offset + 1);
        tpl.add_partition_offset(&delivery.topic, delivery.partition, next)
            .map_err(|e| BrokerError::Offset(e.to_string()))?;
        self.inner
            .commit(&tpl, CommitMode::Sync)
            .map_err(|e| BrokerError::Offset(e.to_string()))
    }

    fn rewind(&mut self, delivery: &Delivery) -> Result<(), BrokerError> {
        self.inner
            .seek(
                &delivery.topic,
                delivery.partition,
                Offset::Offset(delivery.offset),
                SEEK_TIMEOUT,
            )
            .map_err(|e| BrokerError::Offset(e.to_string()))
    }
}
