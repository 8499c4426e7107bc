//! Open, schema-less documents.
//!
//! Payloads and snapshots vary per topic and are not statically known to the
//! bus, so they travel as an ordered string → JSON value map.

use serde_json::{Map, Value};

use crate::error::{CoreError, CoreResult};

/// A JSON object: `null`, bools, numbers, strings, arrays and nested documents.
pub type Document = Map<String, Value>;

/// Convenience accessors used by handlers that inspect payloads.
pub trait DocumentExt {
    /// Convert an arbitrary JSON value into a document.
    ///
    /// Only objects are accepted; anything else is a [`CoreError::NotADocument`].
    fn from_value(value: Value) -> CoreResult<Document>;

    /// Borrow a string field, if present and a string.
    fn str_field(&self, key: &str) -> Option<&str>;

    /// `true` when the field is present and is a non-empty string.
    fn has_text(&self, key: &str) -> bool {
        self.str_field(key).is_some_and(|s| !s.trim().is_empty())
    }
}

impl DocumentExt for Document {
    fn from_value(value: Value) -> CoreResult<Document> {
        match value {
            Value::Object(map) => Ok(map),
            other => Err(CoreError::NotADocument(kind_of(&other).to_string())),
        }
    }

    fn str_field(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
