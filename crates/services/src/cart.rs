//! Cart service consumers.
//!
//! Cart updates are mirrored. A removed cart item is mirrored and, when the
//! removal names a product, turned into a notification for the cart owner.

use std::sync::Arc;

use chrono::Utc;
use tracing::info;

use marketbus_core::{Document, DocumentExt};
use marketbus_events::topic::{CART_REMOVALS_TOPIC, CART_UPDATES_TOPIC, NOTIFICATION_TOPIC};
use marketbus_events::{ConsumerBinding, EventEnvelope, EventHandler, HandlerError};

use crate::context::ServiceContext;
use crate::mirror::MirrorHandler;

pub const SOURCE: &str = "CartService";
pub const GROUP: &str = "cart-service-group";

/// Recipient used when neither the payload nor the snapshot names one.
pub const FALLBACK_RECIPIENT: &str = "user@example.com";

pub fn bindings(ctx: &ServiceContext) -> Vec<ConsumerBinding> {
    vec![
        ConsumerBinding::new(
            CART_UPDATES_TOPIC,
            GROUP,
            Arc::new(MirrorHandler::new(ctx.clone(), GROUP)),
        ),
        ConsumerBinding::new(
            CART_REMOVALS_TOPIC,
            GROUP,
            Arc::new(CartRemovalHandler::new(ctx.clone())),
        ),
    ]
}

#[derive(Debug, Clone)]
pub struct CartRemovalHandler {
    ctx: ServiceContext,
}

impl CartRemovalHandler {
    pub fn new(ctx: ServiceContext) -> Self {
        Self { ctx }
    }
}

fn recipient(envelope: &EventEnvelope) -> String {
    ["userEmail", "email"]
        .iter()
        .find_map(|k| {
            envelope
                .payload()
                .str_field(k)
                .or_else(|| envelope.snapshot().str_field(k))
        })
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(FALLBACK_RECIPIENT)
        .to_string()
}

/// Notification payload for a removed product: `{to, subject, content}`.
pub fn removal_notice(envelope: &EventEnvelope, product_id: &str) -> Document {
    let mut notice = Document::new();
    notice.insert("to".into(), recipient(envelope).into());
    notice.insert("subject".into(), "Item removed from cart".into());
    notice.insert(
        "content".into(),
        format!("Item {product_id} was removed from your cart").into(),
    );
    notice
}

impl EventHandler for CartRemovalHandler {
    fn handle(&self, envelope: &EventEnvelope) -> Result<(), HandlerError> {
        self.ctx.record_received(envelope, GROUP, Utc::now(), [])?;

        let Some(product_id) = envelope.payload().str_field("productId") else {
            return Ok(());
        };

        let notice = removal_notice(envelope, product_id);
        let sent = self
            .ctx
            .publisher()
            .publish(
                NOTIFICATION_TOPIC,
                SOURCE,
                notice,
                Some(envelope.snapshot().clone()),
            )
            .map_err(|e| {
                HandlerError::side_effect(format!("notification publish failed: {e}"))
            })?;

        info!(
            event_id = %envelope.event_id(),
            notification_id = %sent.event_id(),
            product_id,
            "cart removal notification published"
        );
        Ok(())
    }
}
