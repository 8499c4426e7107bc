use std::time::Duration;

use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::types::RDKafkaErrorCode;
use tokio::runtime::{Builder, Runtime};

use marketbus_events::{BrokerAdmin, BrokerError, CreateTopicOutcome, TopicDescriptor};

use super::{base_config, map_kafka_error};

/// Metadata and topic administration over librdkafka.
///
/// The admin API is future-based; calls are driven to completion on a
/// private current-thread runtime, so callers must not be runtime workers.
pub struct KafkaAdmin {
    client: AdminClient<DefaultClientContext>,
    runtime: Runtime,
}

impl std::fmt::Debug for KafkaAdmin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KafkaAdmin").finish_non_exhaustive()
    }
}

impl KafkaAdmin {
    pub fn connect(bootstrap_servers: &str) -> Result<Self, BrokerError> {
        let client = base_config(bootstrap_servers)
            .create::<AdminClient<DefaultClientContext>>()
            .map_err(map_kafka_error)?;
        let runtime = Builder::new_current_thread()
            .build()
            .map_err(|e| BrokerError::Other(format!("admin runtime: {e}")))?;
        Ok(Self { client, runtime })
    }
}

impl BrokerAdmin for KafkaAdmin {
    fn list_topics(&self, timeout: Duration) -> Result<Vec<String>, BrokerError> {
        let metadata = self
            .client
            .inner()
            .fetch_metadata(None, timeout)
            .map_err(map_kafka_error)?;
        Ok(metadata
            .topics()
            .iter()
            .map(|t| t.name().to_string())
            .collect())
    }

    fn create_topics(
        &self,
        topics: &[TopicDescriptor],
        timeout: Duration,
    ) -> Result<Vec<(String, CreateTopicOutcome)>, BrokerError> {
        let new_topics: Vec<NewTopic<'_>> = topics
            .iter()
            .map(|d| {
                NewTopic::new(
                    &d.name,
                    d.partitions as i32,
                    TopicReplication::Fixed(d.replication_factor as i32),
                )
            })
            .collect();
        let options = AdminOptions::new()
            .operation_timeout(Some(timeout))
            .request_timeout(Some(timeout));

        let results = self
            .runtime
            .block_on(self.client.create_topics(&new_topics, &options))
            .map_err(map_kafka_error)?;

        Ok(results
            .into_iter()
            .map(|r| match r {
                Ok(name) => (name, CreateTopicOutcome::Created),
                Err((name, RDKafkaErrorCode::TopicAlreadyExists)) => {
                    (name, CreateTopicOutcome::AlreadyExists)
                }
                Err((name, code)) => (name, CreateTopicOutcome::Failed(code.to_string())),
            })
            .collect())
    }
}
