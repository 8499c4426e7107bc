//! User service consumers: registrations and the welcome flow.

use std::sync::Arc;

use marketbus_events::ConsumerBinding;
use marketbus_events::topic::{USER_REGISTRATION_TOPIC, WELCOME_TOPIC};

use crate::context::ServiceContext;
use crate::mirror::MirrorHandler;

pub const REGISTRATION_GROUP: &str = "user-service-group";
pub const WELCOME_GROUP: &str = "welcome-service-group";

pub fn bindings(ctx: &ServiceContext) -> Vec<ConsumerBinding> {
    vec![
        ConsumerBinding::new(
            USER_REGISTRATION_TOPIC,
            REGISTRATION_GROUP,
            Arc::new(MirrorHandler::new(ctx.clone(), REGISTRATION_GROUP)),
        ),
        ConsumerBinding::new(
            WELCOME_TOPIC,
            WELCOME_GROUP,
            Arc::new(MirrorHandler::new(ctx.clone(), WELCOME_GROUP)),
        ),
    ]
}
