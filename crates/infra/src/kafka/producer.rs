use std::sync::mpsc::{self, RecvTimeoutError, SyncSender};
use std::time::Duration;

use rdkafka::ClientContext;
use rdkafka::message::Message;
use rdkafka::producer::{BaseRecord, DeliveryResult, Producer, ProducerContext, ThreadedProducer};
use tracing::warn;

use marketbus_events::{BrokerError, BrokerProducer, DeliveryAck, OutboundRecord};

use super::{base_config, map_kafka_error};
use crate::producer::ProducerSettings;

/// Slack on top of `message.timeout.ms` before giving up on the callback.
const ACK_GRACE: Duration = Duration::from_secs(1);

type AckSender = SyncSender<Result<DeliveryAck, BrokerError>>;

/// Routes each delivery report to the thread waiting on it.
pub struct DeliveryContext;

impl ClientContext for DeliveryContext {}

impl ProducerContext for DeliveryContext {
    type DeliveryOpaque = Box<AckSender>;

    fn delivery(&self, result: &DeliveryResult<'_>, ack: Self::DeliveryOpaque) {
        let outcome = match result {
            Ok(msg) => Ok(DeliveryAck {
                partition: msg.partition(),
                offset: msg.offset(),
            }),
            Err((err, _)) => Err(BrokerError::Delivery(err.to_string())),
        };
        // The waiter may have timed out already.
        let _ = ack.send(outcome);
    }
}

/// Long-lived producer handle shared by every publisher in the process.
///
/// Configured with `acks=all`; transport retries happen inside librdkafka
/// within `message.timeout.ms`.
pub struct KafkaProducer {
    inner: ThreadedProducer<DeliveryContext>,
}

impl std::fmt::Debug for KafkaProducer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KafkaProducer").finish_non_exhaustive()
    }
}

impl KafkaProducer {
    pub fn connect(
        bootstrap_servers: &str,
        settings: &ProducerSettings,
    ) -> Result<Self, BrokerError> {
        let inner = base_config(bootstrap_servers)
            .set("message.timeout.ms", settings.send_timeout.as_millis().to_string())
            .set("retries", settings.retries.to_string())
            .set("acks", "all")
            .create_with_context::<_, ThreadedProducer<DeliveryContext>>(DeliveryContext)
            .map_err(map_kafka_error)?;
        Ok(Self { inner })
    }

    /// Wait for in-flight records before the process exits.
    pub fn flush(&self, timeout: Duration) -> Result<(), BrokerError> {
        self.inner.flush(timeout).map_err(map_kafka_error)
    }
}

impl Drop for KafkaProducer {
    fn drop(&mut self) {
        if let Err(err) = self.inner.flush(Duration::from_secs(5)) {
            warn!(error = %err, "producer flush on shutdown failed");
        }
    }
}

impl BrokerProducer for KafkaProducer {
    fn send(
        &self,
        record: OutboundRecord<'_>,
        timeout: Duration,
    ) -> Result<DeliveryAck, BrokerError> {
        let (tx, rx) = mpsc::sync_channel(1);

        let mut base: BaseRecord<'_, str, [u8], Box<AckSender>> =
            BaseRecord::with_opaque_to(record.topic, Box::new(tx)).payload(record.payload);
        if let Some(key) = record.key {
            base = base.key(key);
        }

        self.inner
            .send(base)
            .map_err(|(err, _)| BrokerError::Delivery(err.to_string()))?;

        match rx.recv_timeout(timeout + ACK_GRACE) {
            Ok(outcome) => outcome,
            Err(RecvTimeoutError::Timeout) => Err(BrokerError::Timeout(timeout)),
            Err(RecvTimeoutError::Disconnected) => Err(BrokerError::Delivery(
                "delivery report dropped".to_string(),
            )),
        }
    }
}
