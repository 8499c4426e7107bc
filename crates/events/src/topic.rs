//! Topic descriptors and the deployment's fixed topic table.

use serde::{Deserialize, Serialize};

pub const USER_REGISTRATION_TOPIC: &str = "user-registration";
pub const WELCOME_TOPIC: &str = "welcome-flow";
pub const NOTIFICATION_TOPIC: &str = "notification-topic";
pub const CART_UPDATES_TOPIC: &str = "cart-updates";
pub const CART_REMOVALS_TOPIC: &str = "cart-removals";
pub const ORDER_CREATED_TOPIC: &str = "order-created";
pub const INVOICE_PROCESSING_TOPIC: &str = "invoice-processing";
pub const PRODUCT_EVENTS_TOPIC: &str = "product-events";

/// Every logical event stream, in provisioning order.
pub const ALL_TOPICS: [&str; 8] = [
    USER_REGISTRATION_TOPIC,
    WELCOME_TOPIC,
    NOTIFICATION_TOPIC,
    CART_UPDATES_TOPIC,
    CART_REMOVALS_TOPIC,
    ORDER_CREATED_TOPIC,
    INVOICE_PROCESSING_TOPIC,
    PRODUCT_EVENTS_TOPIC,
];

pub const DEFAULT_PARTITIONS: u32 = 3;
pub const DEFAULT_REPLICATION_FACTOR: u32 = 1;

/// Name, partition count and replication factor of one topic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TopicDescriptor {
    pub name: String,
    pub partitions: u32,
    pub replication_factor: u32,
}

impl TopicDescriptor {
    pub fn new(name: impl Into<String>, partitions: u32, replication_factor: u32) -> Self {
        Self {
            name: name.into(),
            partitions,
            replication_factor,
        }
    }
}

/// The statically enumerated set of topics a deployment provisions.
///
/// Names are deployment constants, never user input. Publishing to a topic
/// outside the table is rejected before anything touches the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicTable {
    descriptors: Vec<TopicDescriptor>,
}

impl TopicTable {
    /// The standard eight streams with the given sizing.
    pub fn standard(partitions: u32, replication_factor: u32) -> Self {
        Self::from_descriptors(
            ALL_TOPICS
                .iter()
                .map(|name| TopicDescriptor::new(*name, partitions, replication_factor)),
        )
    }

    /// A table with custom descriptors (duplicates by name are dropped).
    pub fn from_descriptors(descriptors: impl IntoIterator<Item = TopicDescriptor>) -> Self {
        let mut out: Vec<TopicDescriptor> = Vec::new();
        for d in descriptors {
            if !out.iter().any(|existing| existing.name == d.name) {
                out.push(d);
            }
        }
        Self { descriptors: out }
    }

    pub fn descriptors(&self) -> &[TopicDescriptor] {
        &self.descriptors
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.descriptors.iter().map(|d| d.name.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.descriptors.iter().any(|d| d.name == name)
    }

    pub fn get(&self, name: &str) -> Option<&TopicDescriptor> {
        self.descriptors.iter().find(|d| d.name == name)
    }
}

impl Default for TopicTable {
    fn default() -> Self {
        Self::standard(DEFAULT_PARTITIONS, DEFAULT_REPLICATION_FACTOR)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_table_has_eight_distinct_topics() {
        let table = TopicTable::default();
        assert_eq!(table.descriptors().len(), 8);
        assert!(table.contains(CART_UPDATES_TOPIC));
        assert!(!table.contains("notification-sent"));
        assert!(table.descriptors().iter().all(|d| d.partitions == 3));
    }

    #[test]
    fn duplicate_descriptors_are_collapsed() {
        let table = TopicTable::from_descriptors([
            TopicDescriptor::new("a", 1, 1),
            TopicDescriptor::new("a", 6, 3),
            TopicDescriptor::new("b", 1, 1),
        ]);
        assert_eq!(table.names().collect::<Vec<_>>(), vec!["a", "b"]);
        assert_eq!(table.get("a").unwrap().partitions, 1);
    }
}
