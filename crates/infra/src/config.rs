//! Process configuration read from environment variables.

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::consumer::{CommitPolicy, ConsumerSettings};
use crate::gate::StartupPolicy;
use crate::producer::ProducerSettings;
use crate::retry::RetryPolicy;
use crate::supervisor::RestartPolicy;

pub const DEFAULT_BROKER: &str = "kafka:9092";
pub const DEFAULT_STORE_URI: &str = "postgres://localhost:5432/marketbus";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var} is required")]
    Missing { var: &'static str },

    #[error("{var}=`{value}` is invalid: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Everything a bus node needs to start.
#[derive(Debug, Clone, PartialEq)]
pub struct BusConfig {
    pub broker: String,
    pub store_uri: String,
    pub service_name: Option<String>,
    pub ready_max_attempts: u32,
    pub ready_delay: Duration,
    pub startup_policy: StartupPolicy,
    pub partitions: u32,
    pub replication_factor: u32,
    pub producer: ProducerSettings,
    pub consumer: ConsumerSettings,
    pub max_restarts: u32,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            broker: DEFAULT_BROKER.to_string(),
            store_uri: DEFAULT_STORE_URI.to_string(),
            service_name: None,
            ready_max_attempts: 30,
            ready_delay: Duration::from_secs(5),
            startup_policy: StartupPolicy::Strict,
            partitions: marketbus_events::topic::DEFAULT_PARTITIONS,
            replication_factor: marketbus_events::topic::DEFAULT_REPLICATION_FACTOR,
            producer: ProducerSettings::default(),
            consumer: ConsumerSettings::default(),
            max_restarts: RestartPolicy::default().max_restarts,
        }
    }
}

impl BusConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source; unset or blank variables
    /// keep their defaults.
    pub fn from_lookup<L>(lookup: L) -> Result<Self, ConfigError>
    where
        L: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut cfg = Self::default();

        if let Some(b) = get("KAFKA_BROKER").or_else(|| get("KAFKA_BOOTSTRAP_SERVERS")) {
            cfg.broker = b.trim().to_string();
        }
        if let Some(uri) = get("EVENT_STORE_URI") {
            cfg.store_uri = uri.trim().to_string();
        }
        cfg.service_name = get("SERVICE_NAME").map(|s| s.trim().to_string());

        if let Some(v) = get("BROKER_READY_MAX_ATTEMPTS") {
            cfg.ready_max_attempts = parse_positive("BROKER_READY_MAX_ATTEMPTS", &v)?;
        }
        if let Some(v) = get("BROKER_READY_DELAY_SECS") {
            cfg.ready_delay = Duration::from_secs(parse::<u64>("BROKER_READY_DELAY_SECS", &v)?);
        }
        if let Some(v) = get("BROKER_STARTUP_POLICY") {
            cfg.startup_policy = parse_with("BROKER_STARTUP_POLICY", &v, StartupPolicy::from_str)?;
        }
        if let Some(v) = get("TOPIC_PARTITIONS") {
            cfg.partitions = parse_positive("TOPIC_PARTITIONS", &v)?;
        }
        if let Some(v) = get("TOPIC_REPLICATION_FACTOR") {
            cfg.replication_factor = parse_positive("TOPIC_REPLICATION_FACTOR", &v)?;
        }
        if let Some(v) = get("PRODUCER_SEND_TIMEOUT_MS") {
            cfg.producer.send_timeout =
                Duration::from_millis(parse_positive::<u64>("PRODUCER_SEND_TIMEOUT_MS", &v)?);
        }
        if let Some(v) = get("PRODUCER_RETRIES") {
            cfg.producer.retries = parse("PRODUCER_RETRIES", &v)?;
        }
        if let Some(v) = get("CONSUMER_POLL_TIMEOUT_MS") {
            cfg.consumer.poll_timeout =
                Duration::from_millis(parse_positive::<u64>("CONSUMER_POLL_TIMEOUT_MS", &v)?);
        }
        if let Some(v) = get("CONSUMER_COMMIT_POLICY") {
            cfg.consumer.commit_policy =
                parse_with("CONSUMER_COMMIT_POLICY", &v, CommitPolicy::from_str)?;
        }
        if let Some(v) = get("CONSUMER_MAX_DELIVERY_ATTEMPTS") {
            cfg.consumer.max_delivery_attempts =
                Some(parse_positive("CONSUMER_MAX_DELIVERY_ATTEMPTS", &v)?);
        }
        if let Some(v) = get("CONSUMER_REDELIVERY_DELAY_MS") {
            cfg.consumer.redelivery_backoff.base_delay =
                Duration::from_millis(parse_positive::<u64>("CONSUMER_REDELIVERY_DELAY_MS", &v)?);
        }
        if let Some(v) = get("SUPERVISOR_MAX_RESTARTS") {
            cfg.max_restarts = parse("SUPERVISOR_MAX_RESTARTS", &v)?;
        }

        Ok(cfg)
    }

    /// `SERVICE_NAME`, which a node cannot run without.
    pub fn require_service_name(&self) -> Result<&str, ConfigError> {
        self.service_name
            .as_deref()
            .ok_or(ConfigError::Missing { var: "SERVICE_NAME" })
    }

    pub fn gate_policy(&self) -> RetryPolicy {
        RetryPolicy::fixed(self.ready_max_attempts, self.ready_delay)
    }

    pub fn restart_policy(&self) -> RestartPolicy {
        RestartPolicy {
            max_restarts: self.max_restarts,
            ..RestartPolicy::default()
        }
    }
}

fn parse<T>(var: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    parse_with(var, value, |s| s.parse::<T>())
}

fn parse_positive<T>(var: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr + PartialOrd + Default,
    T::Err: std::fmt::Display,
{
    let parsed: T = parse(var, value)?;
    if parsed <= T::default() {
        return Err(ConfigError::Invalid {
            var,
            value: value.to_string(),
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(parsed)
}

fn parse_with<T, E, F>(var: &'static str, value: &str, f: F) -> Result<T, ConfigError>
where
    F: FnOnce(&str) -> Result<T, E>,
    E: std::fmt::Display,
{
    f(value.trim()).map_err(|e| ConfigError::Invalid {
        var,
        value: value.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from(pairs: &[(&str, &str)]) -> Result<BusConfig, ConfigError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        BusConfig::from_lookup(|k| vars.get(k).cloned())
    }

    #[test]
    fn defaults_match_deployment() {
        let cfg = from(&[]).unwrap();
        assert_eq!(cfg.broker, "kafka:9092");
        assert_eq!(cfg.ready_max_attempts, 30);
        assert_eq!(cfg.ready_delay, Duration::from_secs(5));
        assert_eq!(cfg.partitions, 3);
        assert_eq!(cfg.replication_factor, 1);
        assert_eq!(cfg.producer.send_timeout, Duration::from_millis(5000));
        assert_eq!(cfg.consumer.poll_timeout, Duration::from_secs(1));
        assert_eq!(cfg.consumer.commit_policy, CommitPolicy::OnSuccess);
        assert_eq!(cfg.consumer.max_delivery_attempts, None);
        assert_eq!(
            cfg.consumer.redelivery_backoff.base_delay,
            Duration::from_millis(100)
        );
        assert_eq!(cfg.startup_policy, StartupPolicy::Strict);
    }

    #[test]
    fn broker_alias_is_honoured_and_primary_wins() {
        let cfg = from(&[("KAFKA_BOOTSTRAP_SERVERS", "b1:9092")]).unwrap();
        assert_eq!(cfg.broker, "b1:9092");

        let cfg = from(&[
            ("KAFKA_BOOTSTRAP_SERVERS", "b1:9092"),
            ("KAFKA_BROKER", "b2:9092"),
        ])
        .unwrap();
        assert_eq!(cfg.broker, "b2:9092");
    }

    #[test]
    fn overrides_are_parsed() {
        let cfg = from(&[
            ("SERVICE_NAME", "cart"),
            ("BROKER_STARTUP_POLICY", "degraded"),
            ("CONSUMER_COMMIT_POLICY", "always"),
            ("CONSUMER_MAX_DELIVERY_ATTEMPTS", "4"),
            ("CONSUMER_REDELIVERY_DELAY_MS", "250"),
            ("TOPIC_PARTITIONS", "6"),
        ])
        .unwrap();
        assert_eq!(cfg.require_service_name(), Ok("cart"));
        assert_eq!(cfg.startup_policy, StartupPolicy::Degraded);
        assert_eq!(cfg.consumer.commit_policy, CommitPolicy::Always);
        assert_eq!(cfg.consumer.max_delivery_attempts, Some(4));
        assert_eq!(
            cfg.consumer.redelivery_backoff.base_delay,
            Duration::from_millis(250)
        );
        assert_eq!(cfg.partitions, 6);
    }

    #[test]
    fn invalid_values_name_the_variable() {
        let err = from(&[("TOPIC_PARTITIONS", "zero")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "TOPIC_PARTITIONS", .. }));

        let err = from(&[("BROKER_READY_MAX_ATTEMPTS", "0")]).unwrap_err();
        assert!(err.to_string().contains("BROKER_READY_MAX_ATTEMPTS"));

        assert_eq!(
            from(&[]).unwrap().require_service_name(),
            Err(ConfigError::Missing { var: "SERVICE_NAME" })
        );
    }
}
