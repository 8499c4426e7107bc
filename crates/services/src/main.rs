use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info, warn};

use marketbus_events::TopicTable;
use marketbus_infra::kafka::{KafkaAdmin, KafkaConsumerFactory, KafkaProducer};
use marketbus_infra::{
    BrokerGate, BusConfig, ConsumerSupervisor, EventConsumer, EventProducer, EventPublisher,
    EventStore, PostgresEventStore, ProvisionError, StartupPolicy, TopicProvisioner,
};
use marketbus_services::{ServiceContext, ServiceKind, bindings_for};

const STORE_MAX_CONNECTIONS: u32 = 8;

fn main() -> anyhow::Result<()> {
    marketbus_observability::init();

    let config = BusConfig::from_env().context("invalid bus configuration")?;
    let kind: ServiceKind = config.require_service_name()?.parse()?;
    info!(service = %kind, broker = %config.broker, "starting bus node");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("marketbus-rt")
        .build()
        .context("failed to build tokio runtime")?;

    let store = runtime.block_on(async {
        let store = PostgresEventStore::connect(&config.store_uri, STORE_MAX_CONNECTIONS).await?;
        store.ensure_schema().await?;
        Ok::<_, marketbus_infra::EventStoreError>(store)
    })?;
    let store = Arc::new(store);

    let admin = Arc::new(
        KafkaAdmin::connect(&config.broker).context("failed to create kafka admin client")?,
    );

    let ready = config
        .startup_policy
        .apply(BrokerGate::new(admin.clone()).await_ready_with(&config.gate_policy()))?;
    if let Some(report) = ready {
        info!(attempts = report.attempts, topics = report.topics_seen, "broker ready");
    }

    let table = TopicTable::standard(config.partitions, config.replication_factor);
    match TopicProvisioner::new(admin).ensure_topics(table.descriptors()) {
        Ok(report) => info!(
            created = report.created.len(),
            already_present = report.already_present.len(),
            "topics provisioned"
        ),
        Err(err @ ProvisionError::Metadata(_))
            if config.startup_policy == StartupPolicy::Strict =>
        {
            return Err(err).context("topic provisioning failed");
        }
        Err(err) => warn!(error = %err, "topic provisioning incomplete; continuing"),
    }

    let producer = KafkaProducer::connect(&config.broker, &config.producer)
        .context("failed to create kafka producer")?;
    let publisher: Arc<dyn EventPublisher> = Arc::new(
        EventProducer::new(producer, store.clone(), table).with_settings(config.producer),
    );
    let store: Arc<dyn EventStore> = store;
    let ctx = ServiceContext::new(publisher, store);

    let consumer = EventConsumer::new(KafkaConsumerFactory::new(config.broker.clone()))
        .with_settings(config.consumer);
    let supervisor = ConsumerSupervisor::new(consumer).with_restart_policy(config.restart_policy());
    let handle = supervisor.start(bindings_for(kind, &ctx));
    info!(bindings = ?handle.binding_names(), "consume loops running");

    runtime
        .block_on(tokio::signal::ctrl_c())
        .context("failed to listen for ctrl-c")?;
    info!("shutdown requested");

    match serde_json::to_string(&handle.statuses()) {
        Ok(statuses) => info!(%statuses, "binding statuses at shutdown"),
        Err(err) => error!(error = %err, "could not encode binding statuses"),
    }
    handle.shutdown();
    info!("bus node stopped");
    Ok(())
}
