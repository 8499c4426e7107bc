//! `marketbus-core`: shared building blocks for the event bus.
//!
//! This crate contains **pure** primitives (no broker, no storage).

pub mod document;
pub mod error;
pub mod id;

pub use document::{Document, DocumentExt};
pub use error::{CoreError, CoreResult};
pub use id::{EventId, StoredEventId};
