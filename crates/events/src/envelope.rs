use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use marketbus_core::{Document, EventId};

/// Envelope for a business event: the unit exchanged on the broker and
/// mirrored into the event store.
///
/// Notes:
/// - `event_id` and `timestamp` are assigned at publish time, never reused.
/// - `source` names the publishing service and is never empty.
/// - `payload` and `snapshot` are opaque documents; this layer enforces no schema.
/// - Envelopes are immutable once issued.
///
/// Wire form (JSON, camelCase):
///
/// ```text
/// { "eventId": "<uuid>", "timestamp": "<RFC 3339>", "source": "...",
///   "topic": "...", "payload": { ... }, "snapshot": { ... } }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    event_id: EventId,

    #[serde(with = "wire_time")]
    timestamp: DateTime<Utc>,

    source: String,
    topic: String,

    payload: Document,

    /// Denormalized state at publish time.
    #[serde(default)]
    snapshot: Document,
}

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("envelope source must not be empty")]
    EmptySource,

    #[error("envelope topic must not be empty")]
    EmptyTopic,

    #[error("envelope encoding failed: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("envelope decoding failed: {0}")]
    Decode(#[source] serde_json::Error),
}

impl EventEnvelope {
    /// Issue a fresh envelope: new `event_id`, `timestamp = now` truncated to
    /// the microsecond precision of the wire format.
    ///
    /// A missing snapshot becomes an empty document.
    pub fn issue(
        topic: impl Into<String>,
        source: impl Into<String>,
        payload: Document,
        snapshot: Option<Document>,
    ) -> Result<Self, EnvelopeError> {
        Self::new(
            EventId::new(),
            Utc::now().trunc_subsecs(6),
            topic,
            source,
            payload,
            snapshot.unwrap_or_default(),
        )
    }

    /// Build an envelope from explicit parts (tests, replays).
    pub fn new(
        event_id: EventId,
        timestamp: DateTime<Utc>,
        topic: impl Into<String>,
        source: impl Into<String>,
        payload: Document,
        snapshot: Document,
    ) -> Result<Self, EnvelopeError> {
        let source = source.into();
        let topic = topic.into();

        if source.trim().is_empty() {
            return Err(EnvelopeError::EmptySource);
        }
        if topic.trim().is_empty() {
            return Err(EnvelopeError::EmptyTopic);
        }

        Ok(Self {
            event_id,
            timestamp,
            source,
            topic,
            payload,
            snapshot,
        })
    }

    pub fn event_id(&self) -> EventId {
        self.event_id
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn payload(&self) -> &Document {
        &self.payload
    }

    pub fn snapshot(&self) -> &Document {
        &self.snapshot
    }

    /// Serialize to the JSON wire format.
    pub fn to_bytes(&self) -> Result<Vec<u8>, EnvelopeError> {
        serde_json::to_vec(self).map_err(EnvelopeError::Encode)
    }

    /// Parse the JSON wire format.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        let envelope: Self = serde_json::from_slice(bytes).map_err(EnvelopeError::Decode)?;
        if envelope.source.trim().is_empty() {
            return Err(EnvelopeError::EmptySource);
        }
        Ok(envelope)
    }

    /// The envelope as a JSON document (what the store persists).
    pub fn to_document(&self) -> Result<Document, EnvelopeError> {
        match serde_json::to_value(self).map_err(EnvelopeError::Encode)? {
            serde_json::Value::Object(map) => Ok(map),
            // Derived Serialize on a struct always yields an object.
            _ => Ok(Document::new()),
        }
    }
}

/// Timestamp codec: emits RFC 3339 with microseconds, accepts RFC 3339 or the naive
/// `YYYY-MM-DD HH:MM:SS[.ffffff]` form (read as UTC).
pub mod wire_time {
    use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    const NAIVE_FORMATS: [&str; 2] = ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"];

    pub fn serialize<S>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format(ts))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).map_err(serde::de::Error::custom)
    }

    pub fn format(ts: &DateTime<Utc>) -> String {
        ts.to_rfc3339_opts(SecondsFormat::Micros, true)
    }

    pub fn parse(raw: &str) -> Result<DateTime<Utc>, String> {
        if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
            return Ok(ts.with_timezone(&Utc));
        }
        for fmt in NAIVE_FORMATS {
            if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
                return Ok(naive.and_utc());
            }
        }
        Err(format!("unrecognised timestamp `{raw}`"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use marketbus_core::DocumentExt;
    use proptest::prelude::*;
    use serde_json::{Value, json};

    fn doc(value: Value) -> Document {
        Document::from_value(value).expect("expected object")
    }

    #[test]
    fn wire_field_names_are_camel_case() {
        let env = EventEnvelope::issue(
            "cart-updates",
            "CartService",
            doc(json!({"productId": "p1", "quantity": 2})),
            None,
        )
        .unwrap();

        let value: Value = serde_json::from_slice(&env.to_bytes().unwrap()).unwrap();
        let obj = value.as_object().unwrap();
        let mut keys: Vec<&str> = obj.keys().map(String::as_str).collect();
        keys.sort_unstable();
        assert_eq!(
            keys,
            vec!["eventId", "payload", "snapshot", "source", "timestamp", "topic"]
        );
        assert_eq!(obj["snapshot"], json!({}));
        assert_eq!(obj["eventId"], json!(env.event_id().to_string()));
    }

    #[test]
    fn empty_source_is_rejected() {
        let err = EventEnvelope::issue("cart-updates", "  ", Document::new(), None).unwrap_err();
        assert!(matches!(err, EnvelopeError::EmptySource));
    }

    #[test]
    fn missing_snapshot_decodes_as_empty() {
        let raw = br#"{
            "eventId": "0190a5a4-7f6e-7cc0-8000-000000000001",
            "timestamp": "2024-05-01T10:00:00Z",
            "source": "UserService",
            "topic": "user-registration",
            "payload": {"email": "a@b.c"}
        }"#;
        let env = EventEnvelope::from_slice(raw).unwrap();
        assert!(env.snapshot().is_empty());
        assert_eq!(env.payload().get("email"), Some(&json!("a@b.c")));
    }

    #[test]
    fn naive_timestamps_are_read_as_utc() {
        let parsed = wire_time::parse("2024-05-01 10:00:00.250000").unwrap();
        let expected = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap()
            + chrono::Duration::milliseconds(250);
        assert_eq!(parsed, expected);

        let whole = wire_time::parse("2024-05-01 10:00:00").unwrap();
        assert_eq!(whole, Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap());

        assert!(wire_time::parse("yesterday").is_err());
    }

    #[test]
    fn timestamps_are_written_with_microseconds() {
        let ts = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap()
            + chrono::Duration::nanoseconds(250_123_999);
        assert_eq!(wire_time::format(&ts), "2024-05-01T10:00:00.250123Z");

        let whole = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
        assert_eq!(wire_time::format(&whole), "2024-05-01T10:00:00.000000Z");
    }

    #[test]
    fn issued_envelope_round_trips_exactly() {
        let env =
            EventEnvelope::issue("cart-updates", "CartService", Document::new(), None).unwrap();
        assert_eq!(env.timestamp().timestamp_subsec_nanos() % 1_000, 0);

        let decoded = EventEnvelope::from_slice(&env.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, env);
    }

    #[test]
    fn undecodable_bytes_are_decode_errors() {
        let err = EventEnvelope::from_slice(b"{not json").unwrap_err();
        assert!(matches!(err, EnvelopeError::Decode(_)));
    }

    fn json_leaf() -> impl Strategy<Value = Value> {
        prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(|n| json!(n)),
            "[a-zA-Z0-9 ]{0,16}".prop_map(Value::String),
        ]
    }

    fn json_document() -> impl Strategy<Value = Document> {
        let value = json_leaf().prop_recursive(3, 24, 4, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
                prop::collection::btree_map("[a-z]{1,8}", inner, 0..4)
                    .prop_map(|m| Value::Object(m.into_iter().collect())),
            ]
        });
        prop::collection::btree_map("[a-zA-Z]{1,10}", value, 0..6)
            .prop_map(|m| m.into_iter().collect())
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 128,
            ..ProptestConfig::default()
        })]

        /// Property: serialize → deserialize yields an equal envelope.
        #[test]
        fn wire_round_trip_preserves_every_field(
            payload in json_document(),
            snapshot in json_document(),
            source in "[A-Za-z]{1,20}",
            millis in 0i64..4_102_444_800_000i64,
        ) {
            let timestamp = Utc.timestamp_millis_opt(millis).unwrap();
            let env = EventEnvelope::new(
                EventId::new(),
                timestamp,
                "product-events",
                source,
                payload,
                snapshot,
            ).unwrap();

            let decoded = EventEnvelope::from_slice(&env.to_bytes().unwrap()).unwrap();
            prop_assert_eq!(decoded, env);
        }
    }
}
