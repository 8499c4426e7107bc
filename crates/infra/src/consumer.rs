//! Consume loop: poll, decode, dispatch, commit.
//!
//! One loop owns one broker consumer for one `(topic, group)` pair and runs on
//! the calling thread until the shutdown signal fires or the transport fails.
//!
//! Delivery is at-least-once. With [`CommitPolicy::OnSuccess`] a failed
//! handler call rewinds the partition so the same offset is polled again
//! after a backoff, except for [`HandlerError::Rejected`], which is committed
//! and skipped.
//! With [`CommitPolicy::Always`] the offset advances regardless of outcome.

use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use marketbus_events::{
    BrokerConsumer, BrokerError, ConsumerBinding, ConsumerFactory, Delivery, EventEnvelope,
    EventHandler, HandlerError, PollOutcome,
};

use crate::retry::RetryPolicy;
use crate::shutdown::ShutdownSignal;

/// Default wait before a rewound offset is polled again.
pub const DEFAULT_REDELIVERY_DELAY: Duration = Duration::from_millis(100);
/// Ceiling for the redelivery backoff.
pub const MAX_REDELIVERY_DELAY: Duration = Duration::from_secs(5);

/// When a delivered offset is committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommitPolicy {
    /// Commit after every handler call, success or not.
    Always,
    /// Commit only on success; transient failures are redelivered.
    #[default]
    OnSuccess,
}

impl FromStr for CommitPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "always" => Ok(Self::Always),
            "on-success" => Ok(Self::OnSuccess),
            other => Err(format!("expected `always` or `on-success`, got `{other}`")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumerSettings {
    pub poll_timeout: Duration,
    pub commit_policy: CommitPolicy,
    /// Under `OnSuccess`, commit and skip an offset after this many
    /// consecutive failures. `None` retries forever.
    pub max_delivery_attempts: Option<u32>,
    /// Wait before polling a rewound offset again, by consecutive failure
    /// count. Only the delays are used.
    pub redelivery_backoff: RetryPolicy,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_millis(1000),
            commit_policy: CommitPolicy::OnSuccess,
            max_delivery_attempts: None,
            redelivery_backoff: RetryPolicy::exponential(
                u32::MAX,
                DEFAULT_REDELIVERY_DELAY,
                MAX_REDELIVERY_DELAY,
            ),
        }
    }
}

/// Observable loop state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Subscribed,
    Polling,
    Dispatching,
    Stopped,
}

#[derive(Debug, Error)]
pub enum ConsumeError {
    /// The broker connection failed; the loop has terminated.
    #[error("consumer transport failed: {0}")]
    Transport(#[source] BrokerError),
}

/// Counters for one loop run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConsumeSummary {
    pub processed: u64,
    pub failed: u64,
    pub committed: u64,
    pub redelivered: u64,
    pub skipped: u64,
}

type StateObserver = Arc<dyn Fn(ConsumerState) + Send + Sync>;

/// Runs consume loops against one [`ConsumerFactory`].
pub struct EventConsumer<F> {
    factory: F,
    settings: ConsumerSettings,
    observer: Option<StateObserver>,
}

impl<F> fmt::Debug for EventConsumer<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventConsumer")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl<F: ConsumerFactory> EventConsumer<F> {
    pub fn new(factory: F) -> Self {
        Self {
            factory,
            settings: ConsumerSettings::default(),
            observer: None,
        }
    }

    pub fn with_settings(mut self, settings: ConsumerSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Report every state transition to `observer`.
    pub fn observe(mut self, observer: impl Fn(ConsumerState) + Send + Sync + 'static) -> Self {
        self.observer = Some(Arc::new(observer));
        self
    }

    pub fn settings(&self) -> &ConsumerSettings {
        &self.settings
    }

    pub fn run_binding(
        &self,
        binding: &ConsumerBinding,
        shutdown: &ShutdownSignal,
    ) -> Result<ConsumeSummary, ConsumeError> {
        self.run(
            binding.topic(),
            binding.group_id(),
            binding.handler().as_ref(),
            shutdown,
        )
    }

    /// Consume `topic` as a member of `group_id` until shutdown or a fatal
    /// transport error.
    pub fn run(
        &self,
        topic: &str,
        group_id: &str,
        handler: &dyn EventHandler,
        shutdown: &ShutdownSignal,
    ) -> Result<ConsumeSummary, ConsumeError> {
        let mut consumer = self
            .factory
            .connect(group_id)
            .and_then(|mut c| c.subscribe(&[topic]).map(|()| c))
            .map_err(|err| {
                error!(topic, group_id, error = %err, "consumer subscription failed");
                self.transition(ConsumerState::Stopped);
                ConsumeError::Transport(err)
            })?;
        self.transition(ConsumerState::Subscribed);
        info!(topic, group_id, "consumer subscribed");

        let mut summary = ConsumeSummary::default();
        // (partition) -> (offset, consecutive failures)
        let mut failures: HashMap<i32, (i64, u32)> = HashMap::new();

        while !shutdown.is_triggered() {
            self.transition(ConsumerState::Polling);

            let delivery = match consumer.poll(self.settings.poll_timeout) {
                Ok(PollOutcome::Message(d)) => d,
                Ok(PollOutcome::Empty) | Ok(PollOutcome::PartitionEof) => continue,
                Ok(PollOutcome::MessageError(reason)) => {
                    warn!(topic, group_id, reason = %reason, "consumer error on message");
                    continue;
                }
                Err(err) => {
                    error!(topic, group_id, error = %err, "consumer transport failed");
                    self.transition(ConsumerState::Stopped);
                    return Err(ConsumeError::Transport(err));
                }
            };

            self.transition(ConsumerState::Dispatching);

            let envelope = match EventEnvelope::from_slice(&delivery.payload) {
                Ok(e) => e,
                Err(err) => {
                    warn!(
                        topic,
                        group_id,
                        partition = delivery.partition,
                        offset = delivery.offset,
                        error = %err,
                        "skipping undecodable message"
                    );
                    self.commit(&mut consumer, &delivery, &mut summary);
                    summary.skipped += 1;
                    continue;
                }
            };

            match dispatch(handler, &envelope) {
                Ok(()) => {
                    summary.processed += 1;
                    failures.remove(&delivery.partition);
                    debug!(
                        topic,
                        group_id,
                        event_id = %envelope.event_id(),
                        offset = delivery.offset,
                        "event processed"
                    );
                    self.commit(&mut consumer, &delivery, &mut summary);
                }
                Err(err) => {
                    summary.failed += 1;
                    warn!(
                        topic,
                        group_id,
                        event_id = %envelope.event_id(),
                        partition = delivery.partition,
                        offset = delivery.offset,
                        error = %err,
                        "handler failed"
                    );

                    match self.settings.commit_policy {
                        CommitPolicy::Always => {
                            self.commit(&mut consumer, &delivery, &mut summary)
                        }
                        // A rejected event fails the same way on every delivery.
                        CommitPolicy::OnSuccess if matches!(err, HandlerError::Rejected(_)) => {
                            failures.remove(&delivery.partition);
                            self.commit(&mut consumer, &delivery, &mut summary);
                            summary.skipped += 1;
                        }
                        CommitPolicy::OnSuccess => {
                            let entry = failures
                                .entry(delivery.partition)
                                .or_insert((delivery.offset, 0));
                            if entry.0 != delivery.offset {
                                *entry = (delivery.offset, 0);
                            }
                            entry.1 += 1;
                            let attempts = entry.1;

                            if self
                                .settings
                                .max_delivery_attempts
                                .is_some_and(|max| attempts >= max)
                            {
                                warn!(
                                    topic,
                                    group_id,
                                    event_id = %envelope.event_id(),
                                    attempt = attempts,
                                    "delivery attempts exhausted, skipping event"
                                );
                                failures.remove(&delivery.partition);
                                self.commit(&mut consumer, &delivery, &mut summary);
                                summary.skipped += 1;
                            } else {
                                consumer.rewind(&delivery).map_err(|e| {
                                    self.transition(ConsumerState::Stopped);
                                    ConsumeError::Transport(e)
                                })?;
                                summary.redelivered += 1;

                                let delay = self.settings.redelivery_backoff.delay_after(attempts);
                                debug!(
                                    topic,
                                    group_id,
                                    attempt = attempts,
                                    retry_in_ms = delay.as_millis() as u64,
                                    "waiting before redelivery"
                                );
                                if shutdown.wait(delay) {
                                    break;
                                }
                            }
                        }
                    }
                }
            }
        }

        self.transition(ConsumerState::Stopped);
        info!(
            topic,
            group_id,
            processed = summary.processed,
            failed = summary.failed,
            committed = summary.committed,
            "consumer stopped"
        );
        Ok(summary)
    }

    fn commit(
        &self,
        consumer: &mut F::Consumer,
        delivery: &Delivery,
        summary: &mut ConsumeSummary,
    ) {
        match consumer.commit(delivery) {
            Ok(()) => summary.committed += 1,
            // Uncommitted offsets are redelivered after a restart.
            Err(err) => warn!(
                topic = %delivery.topic,
                partition = delivery.partition,
                offset = delivery.offset,
                error = %err,
                "offset commit failed"
            ),
        }
    }

    fn transition(&self, state: ConsumerState) {
        if let Some(observer) = &self.observer {
            observer(state);
        }
    }
}

fn dispatch(handler: &dyn EventHandler, envelope: &EventEnvelope) -> Result<(), HandlerError> {
    panic::catch_unwind(AssertUnwindSafe(|| handler.handle(envelope)))
        .unwrap_or_else(|payload| Err(HandlerError::Panicked(panic_message(payload.as_ref()))))
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
