//! Product service consumer: catalogue changes.

use std::sync::Arc;

use marketbus_events::ConsumerBinding;
use marketbus_events::topic::PRODUCT_EVENTS_TOPIC;

use crate::context::ServiceContext;
use crate::mirror::MirrorHandler;

pub const GROUP: &str = "product-service-group";

pub fn bindings(ctx: &ServiceContext) -> Vec<ConsumerBinding> {
    vec![ConsumerBinding::new(
        PRODUCT_EVENTS_TOPIC,
        GROUP,
        Arc::new(MirrorHandler::new(ctx.clone(), GROUP)),
    )]
}
