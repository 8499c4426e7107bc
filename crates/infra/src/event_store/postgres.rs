//! Postgres-backed event mirror.
//!
//! Each record is one row in `event_mirror`: indexed scalar columns for the
//! envelope identity plus the full stored document as JSONB.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | EventStoreError |
//! |------------|----------------------|-----------------|
//! | Database (unique violation) | `23505` | `Rejected` (duplicate store id) |
//! | Database (check / not-null) | `23514`, `23502` | `Rejected` |
//! | Database (other) | Any other | `Unavailable` |
//! | PoolClosed, Io, PoolTimedOut, other | N/A | `Unavailable` |
//!
//! ## Thread Safety
//!
//! `PostgresEventStore` is `Send + Sync`. The sync [`EventStore`] impl drives
//! the async queries on the runtime handle captured at construction, so it can
//! be called from plain consumer threads.

use std::sync::Arc;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tokio::runtime::Handle;
use tracing::{debug, instrument};

use marketbus_core::StoredEventId;

use super::r#trait::{EventRecord, EventStore, EventStoreError};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS event_mirror (
        id UUID PRIMARY KEY,
        event_id UUID NOT NULL,
        topic TEXT NOT NULL,
        source TEXT NOT NULL,
        event_timestamp TIMESTAMPTZ NOT NULL,
        stored_at TIMESTAMPTZ NOT NULL,
        document JSONB NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS event_mirror_event_id_idx ON event_mirror (event_id)",
    "CREATE INDEX IF NOT EXISTS event_mirror_topic_idx ON event_mirror (topic, event_timestamp)",
];

/// Postgres-backed event mirror.
#[derive(Debug, Clone)]
pub struct PostgresEventStore {
    pool: Arc<PgPool>,
    runtime: Handle,
}

impl PostgresEventStore {
    /// Wrap an existing pool; `runtime` executes queries for sync callers.
    pub fn new(pool: PgPool, runtime: Handle) -> Self {
        Self {
            pool: Arc::new(pool),
            runtime,
        }
    }

    /// Connect to `uri` and capture the current runtime handle.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn connect(uri: &str, max_connections: u32) -> Result<Self, EventStoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(uri)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool, Handle::current()))
    }

    /// Create the mirror table and indexes if they do not exist.
    pub async fn ensure_schema(&self) -> Result<(), EventStoreError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        }
        debug!("event_mirror schema ready");
        Ok(())
    }

    #[instrument(
        skip(self, record),
        fields(
            event_id = %record.envelope.event_id(),
            topic = %record.envelope.topic()
        ),
        err
    )]
    pub async fn insert_record(
        &self,
        record: &EventRecord,
    ) -> Result<StoredEventId, EventStoreError> {
        let document = serde_json::Value::Object(record.to_document()?);

        sqlx::query(
            r#"
            INSERT INTO event_mirror
                (id, event_id, topic, source, event_timestamp, stored_at, document)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(record.id.as_uuid())
        .bind(record.envelope.event_id().as_uuid())
        .bind(record.envelope.topic())
        .bind(record.envelope.source())
        .bind(record.envelope.timestamp())
        .bind(record.stored_at)
        .bind(document)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert", e))?;

        Ok(record.id)
    }

    /// Number of mirrored records for an event id.
    pub async fn count_for_event(
        &self,
        event_id: marketbus_core::EventId,
    ) -> Result<i64, EventStoreError> {
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM event_mirror WHERE event_id = $1")
            .bind(event_id.as_uuid())
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("count_for_event", e))?;
        Ok(count.0)
    }
}

impl EventStore for PostgresEventStore {
    fn insert(&self, record: EventRecord) -> Result<StoredEventId, EventStoreError> {
        // Callers are plain threads (consumer loops, handlers), never runtime workers.
        self.runtime.block_on(self.insert_record(&record))
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> EventStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") | Some("23514") | Some("23502") => EventStoreError::Rejected(msg),
                _ => EventStoreError::Unavailable(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            EventStoreError::Unavailable(format!("connection pool closed in {}", operation))
        }
        _ => EventStoreError::Unavailable(format!("sqlx error in {}: {}", operation, err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_errors_map_to_unavailable() {
        let err = map_sqlx_error("insert", sqlx::Error::PoolClosed);
        assert!(matches!(err, EventStoreError::Unavailable(m) if m.contains("insert")));

        let err = map_sqlx_error("insert", sqlx::Error::PoolTimedOut);
        assert!(matches!(err, EventStoreError::Unavailable(_)));
    }

    #[test]
    fn schema_is_idempotent_ddl() {
        assert!(SCHEMA.iter().all(|s| s.contains("IF NOT EXISTS")));
    }
}
