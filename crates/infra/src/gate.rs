//! Broker readiness gate.
//!
//! Services start in any order, so the broker may not be reachable when a
//! process boots. The gate blocks until a lightweight metadata query succeeds,
//! retrying with a bounded number of attempts.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use thiserror::Error;
use tracing::{error, info, warn};

use marketbus_events::{BrokerAdmin, BrokerError};

use crate::retry::RetryPolicy;

/// Default bound on a single metadata probe.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum GateError {
    #[error("broker unreachable after {attempts} attempts: {last_error}")]
    ConnectionExhausted {
        attempts: u32,
        #[source]
        last_error: BrokerError,
    },
}

/// Outcome of a successful readiness check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadyReport {
    /// Attempt on which the broker answered (1-indexed).
    pub attempts: u32,
    /// Number of topics the broker reported.
    pub topics_seen: usize,
}

/// What a process does when the gate gives up.
///
/// This is deployment policy, not a property of the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StartupPolicy {
    /// Exhaustion aborts startup.
    #[default]
    Strict,
    /// Exhaustion is logged and the process continues without a confirmed broker.
    Degraded,
}

impl StartupPolicy {
    /// Apply the policy to a gate result.
    ///
    /// `Ok(None)` means the process continues in degraded mode.
    pub fn apply(
        self,
        result: Result<ReadyReport, GateError>,
    ) -> Result<Option<ReadyReport>, GateError> {
        match (self, result) {
            (_, Ok(report)) => Ok(Some(report)),
            (StartupPolicy::Strict, Err(err)) => Err(err),
            (StartupPolicy::Degraded, Err(err)) => {
                warn!(error = %err, "continuing in degraded mode without a reachable broker");
                Ok(None)
            }
        }
    }
}

impl FromStr for StartupPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "strict" => Ok(Self::Strict),
            "degraded" => Ok(Self::Degraded),
            other => Err(format!("expected `strict` or `degraded`, got `{other}`")),
        }
    }
}

type Sleeper = Arc<dyn Fn(Duration) + Send + Sync>;

/// Blocking readiness check in front of every producer/consumer.
pub struct BrokerGate<A> {
    admin: A,
    probe_timeout: Duration,
    sleeper: Sleeper,
}

impl<A> fmt::Debug for BrokerGate<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerGate")
            .field("probe_timeout", &self.probe_timeout)
            .finish_non_exhaustive()
    }
}

impl<A: BrokerAdmin> BrokerGate<A> {
    pub fn new(admin: A) -> Self {
        Self {
            admin,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            sleeper: Arc::new(thread::sleep),
        }
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    /// Replace how the gate waits between attempts (tests count sleeps here).
    pub fn with_sleeper(mut self, sleeper: impl Fn(Duration) + Send + Sync + 'static) -> Self {
        self.sleeper = Arc::new(sleeper);
        self
    }

    /// Probe up to `max_attempts` times with a fixed `delay` between failures.
    pub fn await_ready(
        &self,
        max_attempts: u32,
        delay: Duration,
    ) -> Result<ReadyReport, GateError> {
        self.await_ready_with(&RetryPolicy::fixed(max_attempts, delay))
    }

    /// Probe according to `policy`.
    ///
    /// A broker that answers on attempt `N + 1` costs exactly `N` sleeps; one
    /// that never answers costs exactly `max_attempts` probes and no sleep
    /// after the last. `max_attempts == 0` is treated as a single attempt.
    pub fn await_ready_with(&self, policy: &RetryPolicy) -> Result<ReadyReport, GateError> {
        let max_attempts = policy.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;

            match self.admin.list_topics(self.probe_timeout) {
                Ok(topics) => {
                    info!(attempt, topics = topics.len(), "broker is ready");
                    return Ok(ReadyReport {
                        attempts: attempt,
                        topics_seen: topics.len(),
                    });
                }
                Err(err) => {
                    if attempt >= max_attempts {
                        error!(attempt, max_attempts, error = %err, "giving up on broker");
                        return Err(GateError::ConnectionExhausted {
                            attempts: attempt,
                            last_error: err,
                        });
                    }

                    let delay = policy.delay_after(attempt);
                    warn!(
                        attempt,
                        max_attempts,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %err,
                        "broker not ready"
                    );
                    (self.sleeper)(delay);
                }
            }
        }
    }
}
