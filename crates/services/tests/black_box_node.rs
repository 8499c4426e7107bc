//! Runs service nodes against the in-memory broker and store, the way the
//! node binary wires them against Kafka and Postgres.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use serde_json::{Value, json};

use marketbus_core::{Document, DocumentExt};
use marketbus_events::topic::{CART_REMOVALS_TOPIC, INVOICE_PROCESSING_TOPIC, WELCOME_TOPIC};
use marketbus_events::{InMemoryBroker, TopicTable};
use marketbus_infra::{
    BindingStatus, CommitPolicy, ConsumerSettings, ConsumerSupervisor, EventConsumer,
    EventProducer, EventPublisher, EventRecord, InMemoryEventStore, RestartPolicy, RetryPolicy,
    SupervisorHandle, TopicProvisioner,
};
use marketbus_services::{ServiceContext, ServiceKind, bindings_for};

struct TestCluster {
    broker: InMemoryBroker,
    store: Arc<InMemoryEventStore>,
    ctx: ServiceContext,
}

impl TestCluster {
    fn start() -> Self {
        let broker = InMemoryBroker::new();
        let table = TopicTable::default();
        TopicProvisioner::new(broker.clone())
            .ensure_topics(table.descriptors())
            .expect("topics provisioned");

        let store = Arc::new(InMemoryEventStore::new());
        let producer = EventProducer::new(broker.clone(), store.clone(), table);
        let ctx = ServiceContext::new(Arc::new(producer), store.clone());
        Self { broker, store, ctx }
    }

    /// One node per service, all sharing the broker and the store.
    fn run(&self, kinds: &[ServiceKind]) -> Vec<SupervisorHandle> {
        kinds
            .iter()
            .map(|kind| {
                let settings = ConsumerSettings {
                    poll_timeout: Duration::from_millis(5),
                    commit_policy: CommitPolicy::OnSuccess,
                    max_delivery_attempts: None,
                    redelivery_backoff: RetryPolicy::fixed(u32::MAX, Duration::from_millis(1)),
                };
                let consumer = EventConsumer::new(self.broker.clone()).with_settings(settings);
                ConsumerSupervisor::new(consumer)
                    .with_restart_policy(RestartPolicy {
                        max_restarts: 3,
                        backoff: RetryPolicy::fixed(3, Duration::from_millis(5)),
                        stable_after: Duration::from_secs(60),
                    })
                    .start(bindings_for(*kind, &self.ctx))
            })
            .collect()
    }

    fn publish(
        &self,
        topic: &str,
        source: &str,
        payload: Value,
        snapshot: Value,
    ) -> marketbus_events::EventEnvelope {
        self.ctx
            .publisher()
            .publish(topic, source, doc(payload), Some(doc(snapshot)))
            .expect("published")
    }

    fn consumed_by(&self, group: &str) -> Vec<EventRecord> {
        self.store
            .records()
            .into_iter()
            .filter(|r| r.annotations.get("consumedBy") == Some(&json!(group)))
            .collect()
    }
}

fn doc(value: Value) -> Document {
    Document::from_value(value).expect("not an object")
}

fn eventually(what: &str, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "{what} did not happen in time");
        thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn cart_removal_flows_into_a_generic_notification() {
    let cluster = TestCluster::start();
    let nodes = cluster.run(&[ServiceKind::Cart, ServiceKind::Notification]);

    let removal = cluster.publish(
        CART_REMOVALS_TOPIC,
        "CartService",
        json!({"productId": "p-9", "userEmail": "ana@example.com"}),
        json!({"cartId": "c-1"}),
    );

    eventually("generic notification", || {
        !cluster.consumed_by("notification-generic-group").is_empty()
    });

    let cart = cluster.consumed_by("cart-service-group");
    assert_eq!(cart.len(), 1);
    assert_eq!(cart[0].envelope.event_id(), removal.event_id());

    let generic = &cluster.consumed_by("notification-generic-group")[0];
    assert_eq!(generic.envelope.source(), "CartService");
    assert_eq!(generic.envelope.payload()["to"], json!("ana@example.com"));
    assert_eq!(generic.envelope.snapshot(), removal.snapshot());
    assert_eq!(generic.annotations["notificationType"], json!("GENERIC"));
    assert_eq!(generic.annotations["status"], json!("SENT"));

    // The raw removal has no message fields, so the cart notification group
    // rejects it and moves past it instead of recording a delivery.
    eventually("cart notification group commit", || {
        (0..3).any(|p| {
            cluster
                .broker
                .committed_offset("notification-cart-group", CART_REMOVALS_TOPIC, p)
                .is_some()
        })
    });
    assert!(cluster.consumed_by("notification-cart-group").is_empty());

    for node in nodes {
        node.shutdown();
    }
}

#[test]
fn welcome_and_order_confirmation_are_recorded_per_group() {
    let cluster = TestCluster::start();
    let nodes = cluster.run(&[ServiceKind::User, ServiceKind::Notification]);

    let message = json!({"to": "ana@example.com", "subject": "Hi", "content": "Welcome"});
    cluster.publish(WELCOME_TOPIC, "UserService", message.clone(), json!({"userId": "u-1"}));
    cluster.publish(INVOICE_PROCESSING_TOPIC, "OrderService", message, json!({"orderId": "o-7"}));

    eventually("welcome and order deliveries", || {
        cluster.consumed_by("welcome-service-group").len() == 1
            && cluster.consumed_by("notification-welcome-group").len() == 1
            && cluster.consumed_by("notification-order-group").len() == 1
    });

    let welcome = &cluster.consumed_by("notification-welcome-group")[0];
    assert_eq!(welcome.annotations["notificationType"], json!("WELCOME"));
    assert_eq!(welcome.annotations["recipient"], json!("ana@example.com"));

    let order = &cluster.consumed_by("notification-order-group")[0];
    assert_eq!(order.annotations["notificationType"], json!("ORDER_CONFIRMATION"));
    assert_eq!(order.envelope.snapshot()["orderId"], json!("o-7"));

    for node in nodes {
        node.shutdown();
    }
}

#[test]
fn node_runs_one_loop_per_binding_until_shutdown() {
    let cluster = TestCluster::start();
    let node = cluster.run(&[ServiceKind::Notification]).remove(0);

    let statuses = node.statuses();
    assert_eq!(
        statuses.keys().map(String::as_str).collect::<Vec<_>>(),
        vec![
            "cart-removals/notification-cart-group",
            "invoice-processing/notification-order-group",
            "notification-topic/notification-generic-group",
            "welcome-flow/notification-welcome-group",
        ]
    );
    assert!(statuses.values().all(|s| *s == BindingStatus::Running));

    node.shutdown();
    assert!(cluster.store.is_empty());
}
