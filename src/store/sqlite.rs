//! SQLite-backed durable store.
//!
//! Each bucket transition runs in one `IMMEDIATE` transaction, so the
//! read-modify-write is serialized against every other writer of the same
//! database file, including other processes. Blocking work runs on the
//! blocking pool; a caller that stops waiting does not abort a transaction
//! that has already started.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, TransactionBehavior};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::{AbuseMetricsStore, BucketStore};
use crate::abuse::{AbuseMetricEvent, EventMetadata, MetricQuery};
use crate::error::StoreError;
use crate::ratelimit::{apply_request, BucketKey, BucketTransition, RateLimitBucket, RateLimitPolicy};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS rate_limit_buckets (
    identifier      TEXT    NOT NULL,
    operation       TEXT    NOT NULL,
    tokens          REAL    NOT NULL,
    last_refill_at  INTEGER NOT NULL,
    request_count   INTEGER NOT NULL,
    last_request_at INTEGER NOT NULL,
    PRIMARY KEY (identifier, operation)
);
CREATE INDEX IF NOT EXISTS idx_buckets_last_request
    ON rate_limit_buckets (last_request_at);

CREATE TABLE IF NOT EXISTS abuse_metrics (
    id          TEXT    PRIMARY KEY,
    metric_type TEXT    NOT NULL,
    identifier  TEXT    NOT NULL,
    operation   TEXT    NOT NULL,
    metadata    TEXT    NOT NULL,
    created_at  INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_metrics_type_created
    ON abuse_metrics (metric_type, created_at);
CREATE INDEX IF NOT EXISTS idx_metrics_identifier_created
    ON abuse_metrics (identifier, created_at);
"#;

/// Raw bucket columns as read from SQLite (timestamps in epoch millis).
type BucketRow = (f64, i64, i64, i64);

/// Durable bucket and metrics store on a single SQLite database.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    location: String,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore")
            .field("location", &self.location)
            .finish()
    }
}

impl SqliteStore {
    /// Open (or create) a database file and apply the schema.
    pub fn open<P: AsRef<Path>>(path: P, busy_timeout: Duration) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let conn = Connection::open(path).map_err(unavailable)?;
        conn.busy_timeout(busy_timeout).map_err(unavailable)?;
        let mode: String = conn
            .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))
            .map_err(unavailable)?;

        info!(path = %path.display(), journal_mode = %mode, "Opened SQLite store");
        Self::init(conn, path.display().to_string())
    }

    /// Open a private in-memory database.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(unavailable)?;
        Self::init(conn, ":memory:".to_string())
    }

    fn init(conn: Connection, location: String) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA).map_err(unavailable)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            location,
        })
    }

    /// Run a closure against the connection on the blocking pool.
    async fn run<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock();
            f(&mut guard)
        })
        .await
        .map_err(|e| StoreError::Unavailable(format!("blocking task failed: {}", e)))?
    }
}

#[async_trait]
impl BucketStore for SqliteStore {
    async fn refill_and_consume(
        &self,
        key: &BucketKey,
        policy: &RateLimitPolicy,
        now: DateTime<Utc>,
    ) -> Result<BucketTransition, StoreError> {
        let key = key.clone();
        let policy = policy.clone();

        self.run(move |conn| {
            let conflict = |e: rusqlite::Error| classify(e, &key);

            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(conflict)?;

            let row: Option<BucketRow> = tx
                .query_row(
                    "SELECT tokens, last_refill_at, request_count, last_request_at
                     FROM rate_limit_buckets WHERE identifier = ?1 AND operation = ?2",
                    params![key.identifier, key.operation],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
                )
                .optional()
                .map_err(conflict)?;

            let existing = row.map(|row| decode_bucket(&key, row)).transpose()?;
            let (bucket, transition) = apply_request(existing, &key, &policy, now);

            match transition {
                BucketTransition::Created { .. } => {
                    tx.execute(
                        "INSERT INTO rate_limit_buckets
                         (identifier, operation, tokens, last_refill_at, request_count, last_request_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                        params![
                            bucket.identifier,
                            bucket.operation,
                            bucket.tokens,
                            bucket.last_refill_at.timestamp_millis(),
                            bucket.request_count as i64,
                            bucket.last_request_at.timestamp_millis(),
                        ],
                    )
                    .map_err(conflict)?;
                }
                BucketTransition::Consumed { .. } | BucketTransition::Denied { .. } => {
                    tx.execute(
                        "UPDATE rate_limit_buckets
                         SET tokens = ?3, last_refill_at = ?4, request_count = ?5, last_request_at = ?6
                         WHERE identifier = ?1 AND operation = ?2",
                        params![
                            bucket.identifier,
                            bucket.operation,
                            bucket.tokens,
                            bucket.last_refill_at.timestamp_millis(),
                            bucket.request_count as i64,
                            bucket.last_request_at.timestamp_millis(),
                        ],
                    )
                    .map_err(conflict)?;
                }
            }

            tx.commit().map_err(conflict)?;
            Ok(transition)
        })
        .await
    }

    async fn get(&self, key: &BucketKey) -> Result<Option<RateLimitBucket>, StoreError> {
        let key = key.clone();
        self.run(move |conn| {
            let row: Option<BucketRow> = conn
                .query_row(
                    "SELECT tokens, last_refill_at, request_count, last_request_at
                     FROM rate_limit_buckets WHERE identifier = ?1 AND operation = ?2",
                    params![key.identifier, key.operation],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
                )
                .optional()
                .map_err(unavailable)?;
            row.map(|row| decode_bucket(&key, row)).transpose()
        })
        .await
    }

    async fn delete_idle_since(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        self.run(move |conn| {
            let removed = conn
                .execute(
                    "DELETE FROM rate_limit_buckets WHERE last_request_at < ?1",
                    params![cutoff.timestamp_millis()],
                )
                .map_err(unavailable)?;
            debug!(removed = removed, "Deleted idle buckets");
            Ok(removed as u64)
        })
        .await
    }

    async fn bucket_count(&self) -> Result<u64, StoreError> {
        self.run(|conn| {
            let count: i64 = conn
                .query_row("SELECT COUNT(*) FROM rate_limit_buckets", [], |row| row.get(0))
                .map_err(unavailable)?;
            Ok(count as u64)
        })
        .await
    }
}

#[async_trait]
impl AbuseMetricsStore for SqliteStore {
    async fn append(&self, event: &AbuseMetricEvent) -> Result<(), StoreError> {
        let event = event.clone();
        self.run(move |conn| {
            let metadata = serde_json::to_string(&event.metadata)
                .map_err(|e| StoreError::Corrupt(format!("metadata encode: {}", e)))?;
            conn.execute(
                "INSERT INTO abuse_metrics (id, metric_type, identifier, operation, metadata, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    event.id.to_string(),
                    event.metric_type.as_str(),
                    event.identifier,
                    event.operation,
                    metadata,
                    event.created_at.timestamp_millis(),
                ],
            )
            .map_err(unavailable)?;
            Ok(())
        })
        .await
    }

    async fn count(&self, query: &MetricQuery) -> Result<u64, StoreError> {
        let query = query.clone();
        self.run(move |conn| {
            let count: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM abuse_metrics
                     WHERE metric_type = ?1 AND created_at >= ?2
                       AND (?3 IS NULL OR identifier = ?3)",
                    params![
                        query.metric_type.as_str(),
                        query.since.timestamp_millis(),
                        query.identifier,
                    ],
                    |row| row.get(0),
                )
                .map_err(unavailable)?;
            Ok(count as u64)
        })
        .await
    }
}

impl SqliteStore {
    /// Load the events recorded for one identifier, oldest first.
    pub async fn events_for(&self, identifier: &str) -> Result<Vec<AbuseMetricEvent>, StoreError> {
        let identifier = identifier.to_string();
        self.run(move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, metric_type, identifier, operation, metadata, created_at
                     FROM abuse_metrics WHERE identifier = ?1 ORDER BY created_at, rowid",
                )
                .map_err(unavailable)?;
            let rows = stmt
                .query_map(params![identifier], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, i64>(5)?,
                    ))
                })
                .map_err(unavailable)?;

            let mut events = Vec::new();
            for row in rows {
                let (id, metric_type, identifier, operation, metadata, created_at) =
                    row.map_err(unavailable)?;
                let metadata: EventMetadata = serde_json::from_str(&metadata)
                    .map_err(|e| StoreError::Corrupt(format!("metadata decode: {}", e)))?;
                events.push(AbuseMetricEvent {
                    id: id
                        .parse()
                        .map_err(|e| StoreError::Corrupt(format!("event id: {}", e)))?,
                    metric_type: metric_type.parse().map_err(StoreError::Corrupt)?,
                    identifier,
                    operation,
                    metadata,
                    created_at: from_millis(created_at)?,
                });
            }
            Ok(events)
        })
        .await
    }
}

fn decode_bucket(key: &BucketKey, row: BucketRow) -> Result<RateLimitBucket, StoreError> {
    let (tokens, last_refill_at, request_count, last_request_at) = row;
    Ok(RateLimitBucket {
        identifier: key.identifier.clone(),
        operation: key.operation.clone(),
        tokens,
        last_refill_at: from_millis(last_refill_at)?,
        request_count: u64::try_from(request_count)
            .map_err(|_| StoreError::Corrupt(format!("{}: negative request_count", key)))?,
        last_request_at: from_millis(last_request_at)?,
    })
}

fn from_millis(millis: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| StoreError::Corrupt(format!("timestamp out of range: {}", millis)))
}

fn unavailable(err: rusqlite::Error) -> StoreError {
    StoreError::Unavailable(err.to_string())
}

/// Busy and locked errors mean another writer held the database past the
/// busy timeout; everything else is treated as the store being unusable.
fn classify(err: rusqlite::Error, key: &BucketKey) -> StoreError {
    match err {
        rusqlite::Error::SqliteFailure(ref failure, _)
            if matches!(
                failure.code,
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
            ) =>
        {
            StoreError::Conflict(key.to_string())
        }
        other => unavailable(other),
    }
}
