//! Notification service consumers.
//!
//! Each group validates the event it is bound to, mirrors it, and writes a
//! separate delivery record under [`DELIVERY_TOPIC`]. Nothing is actually
//! sent; the delivery record stands in for the message.

use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tracing::{info, warn};

use marketbus_core::{Document, DocumentExt};
use marketbus_events::topic::{
    CART_REMOVALS_TOPIC, INVOICE_PROCESSING_TOPIC, NOTIFICATION_TOPIC, WELCOME_TOPIC,
};
use marketbus_events::{ConsumerBinding, EventEnvelope, EventHandler, HandlerError};

use crate::context::ServiceContext;

pub const SOURCE: &str = "NotificationService";

/// Store topic of delivery records. Never published to the broker.
pub const DELIVERY_TOPIC: &str = "notification-sent";

pub const WELCOME_GROUP: &str = "notification-welcome-group";
pub const CART_GROUP: &str = "notification-cart-group";
pub const ORDER_GROUP: &str = "notification-order-group";
pub const GENERIC_GROUP: &str = "notification-generic-group";

/// Delivery status written for every accepted notification.
pub const STATUS_SENT: &str = "SENT";

const MESSAGE_FIELDS: [&str; 3] = ["to", "subject", "content"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationType {
    Welcome,
    CartRemoval,
    OrderConfirmation,
    Generic,
}

impl NotificationType {
    pub fn as_str(self) -> &'static str {
        match self {
            NotificationType::Welcome => "WELCOME",
            NotificationType::CartRemoval => "CART_REMOVAL",
            NotificationType::OrderConfirmation => "ORDER_CONFIRMATION",
            NotificationType::Generic => "GENERIC",
        }
    }

    pub fn group_id(self) -> &'static str {
        match self {
            NotificationType::Welcome => WELCOME_GROUP,
            NotificationType::CartRemoval => CART_GROUP,
            NotificationType::OrderConfirmation => ORDER_GROUP,
            NotificationType::Generic => GENERIC_GROUP,
        }
    }

    pub fn topic(self) -> &'static str {
        match self {
            NotificationType::Welcome => WELCOME_TOPIC,
            NotificationType::CartRemoval => CART_REMOVALS_TOPIC,
            NotificationType::OrderConfirmation => INVOICE_PROCESSING_TOPIC,
            NotificationType::Generic => NOTIFICATION_TOPIC,
        }
    }

    /// Generic notifications are recorded as-is; the others must carry a
    /// complete message.
    fn requires_message(self) -> bool {
        !matches!(self, NotificationType::Generic)
    }
}

impl fmt::Display for NotificationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn bindings(ctx: &ServiceContext) -> Vec<ConsumerBinding> {
    [
        NotificationType::Welcome,
        NotificationType::CartRemoval,
        NotificationType::OrderConfirmation,
        NotificationType::Generic,
    ]
    .into_iter()
    .map(|kind| {
        ConsumerBinding::new(
            kind.topic(),
            kind.group_id(),
            Arc::new(NotificationHandler::new(ctx.clone(), kind)),
        )
    })
    .collect()
}

#[derive(Debug, Clone)]
pub struct NotificationHandler {
    ctx: ServiceContext,
    kind: NotificationType,
}

impl NotificationHandler {
    pub fn new(ctx: ServiceContext, kind: NotificationType) -> Self {
        Self { ctx, kind }
    }

    fn validate(&self, envelope: &EventEnvelope) -> Result<(), HandlerError> {
        if self.kind == NotificationType::OrderConfirmation
            && !envelope.snapshot().contains_key("orderId")
        {
            return Err(HandlerError::rejected("order confirmation without snapshot.orderId"));
        }
        if self.kind.requires_message() {
            let missing: Vec<&str> = MESSAGE_FIELDS
                .iter()
                .copied()
                .filter(|f| !envelope.payload().has_text(f))
                .collect();
            if !missing.is_empty() {
                return Err(HandlerError::rejected(format!(
                    "{} notification missing {}",
                    self.kind,
                    missing.join(", ")
                )));
            }
        }
        Ok(())
    }

    /// Delivery record: the message as payload, the outcome as snapshot.
    fn delivery(
        &self,
        envelope: &EventEnvelope,
        recipient: Value,
    ) -> Result<EventEnvelope, HandlerError> {
        let mut outcome = Document::new();
        outcome.insert("status".into(), STATUS_SENT.into());
        outcome.insert("recipient".into(), recipient);
        outcome.insert("notificationType".into(), self.kind.as_str().into());

        EventEnvelope::issue(DELIVERY_TOPIC, SOURCE, envelope.payload().clone(), Some(outcome))
            .map_err(|e| HandlerError::side_effect(format!("delivery record invalid: {e}")))
    }
}

impl EventHandler for NotificationHandler {
    fn handle(&self, envelope: &EventEnvelope) -> Result<(), HandlerError> {
        let started_at = Utc::now();
        if let Err(err) = self.validate(envelope) {
            warn!(
                event_id = %envelope.event_id(),
                notification_type = %self.kind,
                error = %err,
                "notification rejected"
            );
            return Err(err);
        }

        let recipient = envelope
            .payload()
            .get("to")
            .cloned()
            .unwrap_or(Value::Null);
        self.ctx.record_received(
            envelope,
            self.kind.group_id(),
            started_at,
            [
                ("status", Value::from(STATUS_SENT)),
                ("recipient", recipient.clone()),
                ("notificationType", Value::from(self.kind.as_str())),
            ],
        )?;

        let delivery = self.delivery(envelope, recipient)?;
        self.ctx
            .store()
            .insert_event(&delivery)
            .map_err(|e| HandlerError::side_effect(format!("delivery record write failed: {e}")))?;

        info!(
            event_id = %envelope.event_id(),
            delivery_id = %delivery.event_id(),
            notification_type = %self.kind,
            recipient = envelope.payload().str_field("to").unwrap_or_default(),
            "notification recorded"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing::{context, doc};
    use serde_json::json;

    fn message() -> Value {
        json!({"to": "ana@example.com", "subject": "Hello", "content": "Welcome aboard"})
    }

    fn envelope(kind: NotificationType, payload: Value, snapshot: Value) -> EventEnvelope {
        EventEnvelope::issue(kind.topic(), "UserService", doc(payload), Some(doc(snapshot)))
            .unwrap()
    }

    #[test]
    fn welcome_is_recorded_as_sent() {
        let (_broker, store, ctx) = context();
        let event = envelope(NotificationType::Welcome, message(), json!({}));

        NotificationHandler::new(ctx, NotificationType::Welcome)
            .handle(&event)
            .unwrap();

        assert_eq!(store.len(), 2);

        let received = store.find_by_event_id(event.event_id());
        assert_eq!(received.len(), 1);
        let a = &received[0].annotations;
        assert_eq!(a["status"], json!("SENT"));
        assert_eq!(a["recipient"], json!("ana@example.com"));
        assert_eq!(a["notificationType"], json!("WELCOME"));
        assert_eq!(a["consumedBy"], json!("notification-welcome-group"));

        let sent = store.find_by_topic(DELIVERY_TOPIC);
        assert_eq!(sent.len(), 1);
        let delivery = &sent[0].envelope;
        assert_ne!(delivery.event_id(), event.event_id());
        assert_eq!(delivery.source(), "NotificationService");
        assert_eq!(delivery.topic(), "notification-sent");
        assert_eq!(delivery.payload(), event.payload());
        assert_eq!(delivery.snapshot()["status"], json!("SENT"));
        assert_eq!(delivery.snapshot()["recipient"], json!("ana@example.com"));
        assert_eq!(delivery.snapshot()["notificationType"], json!("WELCOME"));
        assert!(sent[0].annotations.get("consumedBy").is_none());
    }

    #[test]
    fn store_failure_is_a_side_effect() {
        let (_broker, store, ctx) = context();
        let event = envelope(NotificationType::Welcome, message(), json!({}));
        store.fail_next_inserts(1);

        let err = NotificationHandler::new(ctx, NotificationType::Welcome)
            .handle(&event)
            .unwrap_err();

        assert!(matches!(err, HandlerError::SideEffect(_)));
        assert!(store.is_empty());
    }

    #[test]
    fn incomplete_message_is_rejected_and_not_recorded() {
        let (_broker, store, ctx) = context();
        let event = envelope(
            NotificationType::CartRemoval,
            json!({"to": "ana@example.com", "subject": ""}),
            json!({}),
        );

        let err = NotificationHandler::new(ctx, NotificationType::CartRemoval)
            .handle(&event)
            .unwrap_err();

        assert_eq!(
            err,
            HandlerError::rejected("CART_REMOVAL notification missing subject, content")
        );
        assert!(store.is_empty());
    }

    #[test]
    fn order_confirmation_needs_an_order_id() {
        let (_broker, store, ctx) = context();
        let handler = NotificationHandler::new(ctx, NotificationType::OrderConfirmation);

        let without = envelope(
            NotificationType::OrderConfirmation,
            message(),
            json!({"total": 12}),
        );
        assert!(matches!(handler.handle(&without), Err(HandlerError::Rejected(_))));

        let with = envelope(
            NotificationType::OrderConfirmation,
            message(),
            json!({"orderId": "o-1"}),
        );
        handler.handle(&with).unwrap();

        assert_eq!(store.len(), 2);
        let received = store.find_by_event_id(with.event_id());
        assert_eq!(
            received[0].annotations["notificationType"],
            json!("ORDER_CONFIRMATION")
        );
        let sent = store.find_by_topic(DELIVERY_TOPIC);
        assert_eq!(
            sent[0].envelope.snapshot()["notificationType"],
            json!("ORDER_CONFIRMATION")
        );
    }

    #[test]
    fn generic_accepts_any_payload() {
        let (_broker, store, ctx) = context();
        let event = envelope(NotificationType::Generic, json!({"note": "free-form"}), json!({}));

        NotificationHandler::new(ctx, NotificationType::Generic)
            .handle(&event)
            .unwrap();

        let received = store.find_by_event_id(event.event_id());
        let a = &received[0].annotations;
        assert_eq!(a["notificationType"], json!("GENERIC"));
        assert_eq!(a["recipient"], Value::Null);
        let sent = store.find_by_topic(DELIVERY_TOPIC);
        assert_eq!(sent[0].envelope.snapshot()["recipient"], Value::Null);
    }

    #[test]
    fn one_group_per_notification_type() {
        let (_broker, _store, ctx) = context();
        let names: Vec<String> = bindings(&ctx).iter().map(ConsumerBinding::name).collect();
        assert_eq!(
            names,
            vec![
                "welcome-flow/notification-welcome-group",
                "cart-removals/notification-cart-group",
                "invoice-processing/notification-order-group",
                "notification-topic/notification-generic-group",
            ]
        );
    }
}
