//! Runs one consume loop per binding on its own OS thread.
//!
//! A loop that terminates on a transport error is restarted after a backoff,
//! up to [`RestartPolicy::max_restarts`] consecutive times; past that the
//! binding is marked [`BindingStatus::Failed`] and its thread exits. A loop
//! that stayed up for [`RestartPolicy::stable_after`] before failing starts
//! a fresh count. Other bindings are unaffected.

use std::collections::BTreeMap;
use std::sync::mpsc;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{error, info, warn};

use marketbus_events::{ConsumerBinding, ConsumerFactory};

use crate::consumer::EventConsumer;
use crate::retry::RetryPolicy;
use crate::shutdown::ShutdownSignal;

/// Restart bound for a failing consume loop.
#[derive(Debug, Clone, PartialEq)]
pub struct RestartPolicy {
    pub max_restarts: u32,
    pub backoff: RetryPolicy,
    /// Uptime after which a failing loop no longer counts as a consecutive
    /// restart.
    pub stable_after: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_restarts: 5,
            backoff: RetryPolicy::exponential(5, Duration::from_secs(1), Duration::from_secs(30)),
            stable_after: Duration::from_secs(60),
        }
    }
}

/// Current state of one binding's loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum BindingStatus {
    Running,
    Restarting { attempt: u32 },
    Stopped,
    Failed { reason: String },
}

type StatusTable = Arc<Mutex<BTreeMap<String, BindingStatus>>>;

fn lock(table: &StatusTable) -> MutexGuard<'_, BTreeMap<String, BindingStatus>> {
    match table.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn set_status(table: &StatusTable, name: &str, status: BindingStatus) {
    lock(table).insert(name.to_string(), status);
}

#[derive(Debug)]
struct Worker {
    name: String,
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
}

/// Handle to the running loops. Dropping it shuts them down.
#[derive(Debug)]
pub struct SupervisorHandle {
    workers: Vec<Worker>,
    statuses: StatusTable,
}

impl SupervisorHandle {
    /// Snapshot of every binding's status keyed by `topic/group`.
    pub fn statuses(&self) -> BTreeMap<String, BindingStatus> {
        lock(&self.statuses).clone()
    }

    pub fn status(&self, binding_name: &str) -> Option<BindingStatus> {
        lock(&self.statuses).get(binding_name).cloned()
    }

    pub fn binding_names(&self) -> Vec<String> {
        self.workers.iter().map(|w| w.name.clone()).collect()
    }

    /// Signal every loop to stop and wait for all of them.
    pub fn shutdown(mut self) {
        self.stop_all();
    }

    fn stop_all(&mut self) {
        for w in &self.workers {
            let _ = w.shutdown.send(());
        }
        for w in &mut self.workers {
            if let Some(j) = w.join.take() {
                if j.join().is_err() {
                    error!(binding = %w.name, "consumer thread panicked");
                }
            }
        }
    }
}

impl Drop for SupervisorHandle {
    fn drop(&mut self) {
        self.stop_all();
    }
}

/// Starts and restarts consume loops.
#[derive(Debug)]
pub struct ConsumerSupervisor<F> {
    consumer: Arc<EventConsumer<F>>,
    restart: RestartPolicy,
}

impl<F> ConsumerSupervisor<F>
where
    F: ConsumerFactory + 'static,
{
    pub fn new(consumer: EventConsumer<F>) -> Self {
        Self {
            consumer: Arc::new(consumer),
            restart: RestartPolicy::default(),
        }
    }

    pub fn with_restart_policy(mut self, restart: RestartPolicy) -> Self {
        self.restart = restart;
        self
    }

    /// Spawn one named thread per binding.
    pub fn start(&self, bindings: Vec<ConsumerBinding>) -> SupervisorHandle {
        let statuses: StatusTable = Arc::new(Mutex::new(BTreeMap::new()));
        let mut workers = Vec::with_capacity(bindings.len());

        for binding in bindings {
            let name = binding.name();
            let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
            set_status(&statuses, &name, BindingStatus::Running);

            let consumer = self.consumer.clone();
            let restart = self.restart.clone();
            let table = statuses.clone();
            let thread_name = format!("consumer-{name}");

            let join = thread::Builder::new()
                .name(thread_name)
                .spawn(move || {
                    let signal = ShutdownSignal::new(shutdown_rx);
                    supervise(&consumer, &binding, &restart, &signal, &table);
                })
                .expect("failed to spawn consumer thread");

            info!(binding = %name, "consumer thread started");
            workers.push(Worker {
                name,
                shutdown: shutdown_tx,
                join: Some(join),
            });
        }

        SupervisorHandle { workers, statuses }
    }
}

fn supervise<F: ConsumerFactory>(
    consumer: &EventConsumer<F>,
    binding: &ConsumerBinding,
    restart: &RestartPolicy,
    signal: &ShutdownSignal,
    table: &StatusTable,
) {
    let name = binding.name();
    let mut restarts = 0u32;

    loop {
        set_status(table, &name, BindingStatus::Running);
        let started = Instant::now();

        match consumer.run_binding(binding, signal) {
            Ok(summary) => {
                info!(binding = %name, processed = summary.processed, "consume loop finished");
                set_status(table, &name, BindingStatus::Stopped);
                return;
            }
            Err(err) => {
                if signal.is_triggered() {
                    set_status(table, &name, BindingStatus::Stopped);
                    return;
                }

                if restarts > 0 && started.elapsed() >= restart.stable_after {
                    info!(
                        binding = %name,
                        restarts,
                        "consume loop was stable; restart count reset"
                    );
                    restarts = 0;
                }
                restarts += 1;
                if restarts > restart.max_restarts {
                    error!(
                        binding = %name,
                        restarts,
                        error = %err,
                        "consume loop failed permanently"
                    );
                    set_status(
                        table,
                        &name,
                        BindingStatus::Failed {
                            reason: err.to_string(),
                        },
                    );
                    return;
                }

                let delay = restart.backoff.delay_after(restarts);
                warn!(
                    binding = %name,
                    attempt = restarts,
                    retry_in_ms = delay.as_millis() as u64,
                    error = %err,
                    "restarting consume loop"
                );
                set_status(table, &name, BindingStatus::Restarting { attempt: restarts });

                if signal.wait(delay) {
                    set_status(table, &name, BindingStatus::Stopped);
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::{CommitPolicy, ConsumerSettings};
    use marketbus_core::Document;
    use marketbus_events::{
        BrokerProducer, EventEnvelope, HandlerError, InMemoryBroker, OutboundRecord,
    };
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Instant;

    fn fast_consumer(broker: &InMemoryBroker) -> EventConsumer<InMemoryBroker> {
        EventConsumer::new(broker.clone()).with_settings(ConsumerSettings {
            poll_timeout: Duration::from_millis(5),
            commit_policy: CommitPolicy::OnSuccess,
            max_delivery_attempts: None,
            redelivery_backoff: RetryPolicy::fixed(u32::MAX, Duration::from_millis(1)),
        })
    }

    fn fast_restarts(max_restarts: u32) -> RestartPolicy {
        RestartPolicy {
            max_restarts,
            backoff: RetryPolicy::fixed(max_restarts, Duration::from_millis(5)),
            stable_after: Duration::from_millis(20),
        }
    }

    fn publish(broker: &InMemoryBroker, topic: &str) {
        let e = EventEnvelope::issue(topic, "TestService", Document::new(), None).unwrap();
        broker
            .send(
                OutboundRecord {
                    topic,
                    key: None,
                    payload: &e.to_bytes().unwrap(),
                },
                Duration::from_millis(10),
            )
            .unwrap();
    }

    fn counting_binding(topic: &str, group: &str, counter: Arc<AtomicU32>) -> ConsumerBinding {
        ConsumerBinding::from_fn(
            topic,
            group,
            move |_: &EventEnvelope| -> Result<(), HandlerError> {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
        )
    }

    fn eventually(cond: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not met in time");
            thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn each_binding_gets_its_own_loop() {
        let broker = InMemoryBroker::new()
            .with_topic("cart-updates", 1)
            .with_topic("cart-removals", 1);
        let updates = Arc::new(AtomicU32::new(0));
        let removals = Arc::new(AtomicU32::new(0));

        let supervisor = ConsumerSupervisor::new(fast_consumer(&broker));
        let handle = supervisor.start(vec![
            counting_binding("cart-updates", "cart-service-group", updates.clone()),
            counting_binding("cart-removals", "cart-service-group", removals.clone()),
        ]);

        publish(&broker, "cart-updates");
        publish(&broker, "cart-removals");
        publish(&broker, "cart-removals");

        eventually(|| updates.load(Ordering::SeqCst) == 1 && removals.load(Ordering::SeqCst) == 2);
        assert_eq!(
            handle.status("cart-updates/cart-service-group"),
            Some(BindingStatus::Running)
        );
        assert_eq!(handle.binding_names().len(), 2);
        handle.shutdown();
    }

    #[test]
    fn transport_failure_restarts_the_loop() {
        let broker = InMemoryBroker::new().with_topic("welcome-flow", 1);
        broker.fail_next_polls(2);
        let seen = Arc::new(AtomicU32::new(0));

        let supervisor =
            ConsumerSupervisor::new(fast_consumer(&broker)).with_restart_policy(fast_restarts(5));
        let handle = supervisor.start(vec![counting_binding(
            "welcome-flow",
            "welcome-service-group",
            seen.clone(),
        )]);

        publish(&broker, "welcome-flow");
        eventually(|| seen.load(Ordering::SeqCst) == 1);
        assert_eq!(
            handle.status("welcome-flow/welcome-service-group"),
            Some(BindingStatus::Running)
        );
        handle.shutdown();
    }

    #[test]
    fn exceeding_max_restarts_marks_binding_failed() {
        let broker = InMemoryBroker::new().with_topic("a", 1).with_topic("b", 1);
        let supervisor =
            ConsumerSupervisor::new(fast_consumer(&broker)).with_restart_policy(fast_restarts(2));

        broker.set_available(false);
        let counter = Arc::new(AtomicU32::new(0));
        let handle = supervisor.start(vec![counting_binding("a", "g", counter)]);

        eventually(|| matches!(handle.status("a/g"), Some(BindingStatus::Failed { .. })));
        handle.shutdown();
    }

    #[test]
    fn isolated_failures_do_not_exhaust_the_restart_budget() {
        let broker = InMemoryBroker::new().with_topic("a", 1);
        let counter = Arc::new(AtomicU32::new(0));
        let supervisor =
            ConsumerSupervisor::new(fast_consumer(&broker)).with_restart_policy(fast_restarts(2));
        let handle = supervisor.start(vec![counting_binding("a", "g", counter.clone())]);

        for round in 1..=3 {
            // Healthy long enough to count as stable, then one failed poll.
            thread::sleep(Duration::from_millis(40));
            broker.fail_next_polls(1);
            publish(&broker, "a");
            eventually(|| counter.load(Ordering::SeqCst) == round);
        }

        assert_eq!(handle.status("a/g"), Some(BindingStatus::Running));
        handle.shutdown();
    }

    #[test]
    fn shutdown_stops_every_loop() {
        let broker = InMemoryBroker::new().with_topic("a", 1).with_topic("b", 1);
        let supervisor = ConsumerSupervisor::new(fast_consumer(&broker));
        let handle = supervisor.start(vec![
            counting_binding("a", "g1", Arc::new(AtomicU32::new(0))),
            counting_binding("b", "g2", Arc::new(AtomicU32::new(0))),
        ]);
        let statuses = handle.statuses.clone();

        handle.shutdown();

        let statuses = lock(&statuses);
        assert_eq!(statuses.len(), 2);
        assert!(statuses.values().all(|s| *s == BindingStatus::Stopped));
    }

    #[test]
    fn dropping_the_handle_shuts_down() {
        let broker = InMemoryBroker::new().with_topic("a", 1);
        let supervisor = ConsumerSupervisor::new(fast_consumer(&broker));
        let counter = Arc::new(AtomicU32::new(0));
        let handle = supervisor.start(vec![counting_binding("a", "g", counter)]);
        let statuses = handle.statuses.clone();

        drop(handle);

        assert_eq!(lock(&statuses).get("a/g"), Some(&BindingStatus::Stopped));
    }
}
