//! Service consumers for a bus node.
//!
//! A node runs the bindings of exactly one service, chosen by `SERVICE_NAME`.

pub mod cart;
pub mod context;
pub mod mirror;
pub mod notification;
pub mod product;
pub mod user;

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

use marketbus_events::ConsumerBinding;

pub use context::ServiceContext;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown service `{0}` (expected user, product, cart or notification)")]
pub struct UnknownService(pub String);

/// The services a node can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceKind {
    User,
    Product,
    Cart,
    Notification,
}

impl ServiceKind {
    pub const ALL: [ServiceKind; 4] = [
        ServiceKind::User,
        ServiceKind::Product,
        ServiceKind::Cart,
        ServiceKind::Notification,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ServiceKind::User => "user",
            ServiceKind::Product => "product",
            ServiceKind::Cart => "cart",
            ServiceKind::Notification => "notification",
        }
    }
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServiceKind {
    type Err = UnknownService;

    /// Accepts `cart`, `cart-service`, `cart_service` and `CartService`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .trim()
            .chars()
            .filter(|c| !matches!(c, '-' | '_'))
            .collect::<String>()
            .to_ascii_lowercase();
        let base = normalized.strip_suffix("service").unwrap_or(&normalized);

        ServiceKind::ALL
            .into_iter()
            .find(|k| k.as_str() == base)
            .ok_or_else(|| UnknownService(s.to_string()))
    }
}

/// Consume loops a node running `kind` starts.
pub fn bindings_for(kind: ServiceKind, ctx: &ServiceContext) -> Vec<ConsumerBinding> {
    match kind {
        ServiceKind::User => user::bindings(ctx),
        ServiceKind::Product => product::bindings(ctx),
        ServiceKind::Cart => cart::bindings(ctx),
        ServiceKind::Notification => notification::bindings(ctx),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing::context;
    use std::collections::BTreeSet;

    #[test]
    fn parses_service_names_leniently() {
        for raw in ["cart", "cart-service", "cart_service", "CartService", " CART "] {
            assert_eq!(raw.parse::<ServiceKind>(), Ok(ServiceKind::Cart), "{raw}");
        }
        assert_eq!("notification-service".parse::<ServiceKind>(), Ok(ServiceKind::Notification));
        assert_eq!(
            "billing".parse::<ServiceKind>(),
            Err(UnknownService("billing".to_string()))
        );
        assert!("service".parse::<ServiceKind>().is_err());
    }

    #[test]
    fn display_round_trips_through_parse() {
        for kind in ServiceKind::ALL {
            assert_eq!(kind.to_string().parse::<ServiceKind>(), Ok(kind));
        }
    }

    #[test]
    fn binding_names_are_unique_across_services() {
        let (_broker, _store, ctx) = context();
        let mut seen = BTreeSet::new();
        let mut total = 0;
        for kind in ServiceKind::ALL {
            for b in bindings_for(kind, &ctx) {
                total += 1;
                seen.insert(b.name());
            }
        }
        assert_eq!(total, 9);
        assert_eq!(seen.len(), 9);
    }

    #[test]
    fn every_bound_topic_is_provisioned() {
        let (broker, _store, ctx) = context();
        let provisioned = broker.topic_names();
        for kind in ServiceKind::ALL {
            for b in bindings_for(kind, &ctx) {
                assert!(provisioned.iter().any(|t| t == b.topic()), "{}", b.name());
            }
        }
    }
}
