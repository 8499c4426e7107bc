//! Idempotent topic provisioning.

use std::collections::HashSet;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, error, info};

use marketbus_events::{BrokerAdmin, BrokerError, CreateTopicOutcome, TopicDescriptor};

pub const DEFAULT_ADMIN_TIMEOUT: Duration = Duration::from_secs(10);

/// A topic whose creation failed for a reason other than "already exists".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicFailure {
    pub topic: String,
    pub reason: String,
}

/// What one provisioning pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProvisionReport {
    /// Topics this pass created.
    pub created: Vec<String>,
    /// Topics that existed already (listed, or raced with another creator).
    pub already_present: Vec<String>,
    /// Topics that could not be created.
    pub failed: Vec<TopicFailure>,
}

impl ProvisionReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Debug, Error)]
pub enum ProvisionError {
    /// Listing existing topics failed; nothing was attempted.
    #[error("could not list existing topics: {0}")]
    Metadata(#[source] BrokerError),

    /// The create request could not be issued at all.
    #[error("topic creation request failed: {0}")]
    Request(#[source] BrokerError),

    /// Some topics failed; the rest were provisioned. Safe to re-run.
    #[error("{} topic(s) could not be created", .0.failed.len())]
    Incomplete(ProvisionReport),
}

/// Creates the missing members of a fixed topic set.
#[derive(Debug)]
pub struct TopicProvisioner<A> {
    admin: A,
    timeout: Duration,
}

impl<A: BrokerAdmin> TopicProvisioner<A> {
    pub fn new(admin: A) -> Self {
        Self {
            admin,
            timeout: DEFAULT_ADMIN_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Ensure every descriptor exists on the broker.
    ///
    /// Only topics missing from the listing are requested. A concurrent
    /// creator winning the race counts as success. Other per-topic failures
    /// are logged and reported without aborting the remaining topics.
    pub fn ensure_topics(
        &self,
        descriptors: &[TopicDescriptor],
    ) -> Result<ProvisionReport, ProvisionError> {
        let existing: HashSet<String> = self
            .admin
            .list_topics(self.timeout)
            .map_err(ProvisionError::Metadata)?
            .into_iter()
            .collect();

        let mut report = ProvisionReport::default();
        let mut missing: Vec<TopicDescriptor> = Vec::new();

        for d in descriptors {
            if existing.contains(&d.name) {
                report.already_present.push(d.name.clone());
            } else if !missing.iter().any(|m| m.name == d.name) {
                missing.push(d.clone());
            }
        }

        if missing.is_empty() {
            debug!(topics = descriptors.len(), "all topics already exist");
            return Ok(report);
        }

        let outcomes = self
            .admin
            .create_topics(&missing, self.timeout)
            .map_err(ProvisionError::Request)?;

        for (topic, outcome) in outcomes {
            match outcome {
                CreateTopicOutcome::Created => {
                    info!(topic = %topic, "topic created");
                    report.created.push(topic);
                }
                CreateTopicOutcome::AlreadyExists => {
                    info!(topic = %topic, "topic already exists");
                    report.already_present.push(topic);
                }
                CreateTopicOutcome::Failed(reason) => {
                    error!(topic = %topic, reason = %reason, "failed to create topic");
                    report.failed.push(TopicFailure { topic, reason });
                }
            }
        }

        if report.is_complete() {
            Ok(report)
        } else {
            Err(ProvisionError::Incomplete(report))
        }
    }
}
