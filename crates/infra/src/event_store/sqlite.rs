//! SQLite-backed event store.
//!
//! The log, outbox, inbox, snapshots and sync cursors live in one database
//! file. `append` writes the event row and its outbox row in a single
//! transaction.
//!
//! Events are stored as their JSON body plus the columns needed for
//! filtering and ordering. The delivery bookkeeping (`sync_status`,
//! `sync_attempts`, `sync_error`) changes after append, so it is kept in its
//! own columns and overlaid on the body when reading.
//!
//! ## Error Mapping
//!
//! | SQLx error | EventStoreError |
//! |------------|-----------------|
//! | Database (unique violation) | `DuplicateEvent` is checked first; otherwise `Storage` |
//! | PoolClosed | `Storage` |
//! | ColumnDecode / Decode | `Serialization` |
//! | Other | `Storage` |

use std::str::FromStr;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use tracing::instrument;

use opsync_core::{DeviceId, EventId, OperationId, Timestamp};
use opsync_events::{DeliveryStatus, Event, EventType};

use super::outbox::{InboxItem, OutboxItem, OutboxStatus, OutboxUpdate, RetryPolicy, Snapshot};
use super::r#trait::{EventStore, EventStoreError, StoreStats, StoredEvent};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS events (
        position      INTEGER PRIMARY KEY AUTOINCREMENT,
        event_id      TEXT NOT NULL UNIQUE,
        event_type    TEXT NOT NULL,
        device_id     TEXT NOT NULL,
        operation_id  TEXT NULL,
        timestamp     INTEGER NOT NULL,
        sequence      INTEGER NOT NULL,
        local         INTEGER NOT NULL,
        hash          TEXT NULL,
        sync_status   TEXT NOT NULL,
        sync_attempts INTEGER NOT NULL,
        sync_error    TEXT NULL,
        body          TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS events_by_operation ON events (operation_id, timestamp, sequence, event_id)",
    "CREATE INDEX IF NOT EXISTS events_by_type ON events (event_type)",
    "CREATE INDEX IF NOT EXISTS events_by_device ON events (device_id, local, position)",
    r#"
    CREATE TABLE IF NOT EXISTS outbox (
        event_id      TEXT PRIMARY KEY,
        status        TEXT NOT NULL,
        retry_count   INTEGER NOT NULL,
        max_retries   INTEGER NOT NULL,
        next_retry_at INTEGER NOT NULL,
        last_error    TEXT NULL,
        created_at    INTEGER NOT NULL,
        sent_at       INTEGER NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS outbox_due ON outbox (status, next_retry_at)",
    r#"
    CREATE TABLE IF NOT EXISTS inbox (
        event_id     TEXT PRIMARY KEY,
        timestamp    INTEGER NOT NULL,
        sequence     INTEGER NOT NULL,
        body         TEXT NOT NULL,
        received_at  INTEGER NOT NULL,
        processed    INTEGER NOT NULL,
        processed_at INTEGER NULL,
        error        TEXT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS snapshots (
        projection    TEXT NOT NULL,
        operation_key TEXT NOT NULL,
        position      INTEGER NOT NULL,
        taken_at      INTEGER NOT NULL,
        state         TEXT NOT NULL,
        digest        TEXT NOT NULL,
        PRIMARY KEY (projection, operation_key)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS sync_cursors (
        operation_key TEXT PRIMARY KEY,
        cursor        INTEGER NOT NULL
    )
    "#,
];

const EVENT_COLUMNS: &str = "position, local, body, sync_status, sync_attempts, sync_error";

const OUTBOX_COLUMNS: &str = "o.status, o.retry_count, o.max_retries, o.next_retry_at, o.last_error, \
     o.created_at, o.sent_at, e.body";

/// SQLite-backed store.
///
/// Cheap to clone; clones share the pool.
#[derive(Debug, Clone)]
pub struct SqliteEventStore {
    pool: SqlitePool,
    retry: RetryPolicy,
}

impl SqliteEventStore {
    /// Open (creating if needed) the database at `url` and apply the schema.
    ///
    /// `url` is a sqlx SQLite URL, e.g. `sqlite://data/opsync.db` or `sqlite::memory:`.
    pub async fn connect(url: &str, retry: RetryPolicy) -> Result<Self, EventStoreError> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| map_sqlx_error("connect", e))?
            .create_if_missing(true);
        // A single connection serializes writers and keeps `:memory:` databases alive.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        let store = Self { pool, retry };
        store.migrate().await?;
        let requeued = store.requeue_sending().await?;
        if requeued > 0 {
            tracing::warn!(requeued, "outbox items left in sending were requeued");
        }
        Ok(store)
    }

    pub async fn in_memory() -> Result<Self, EventStoreError> {
        Self::connect("sqlite::memory:", RetryPolicy::default()).await
    }

    async fn migrate(&self) -> Result<(), EventStoreError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("migrate", e))?;
        }
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn insert_event(
        tx: &mut Transaction<'_, Sqlite>,
        event: &Event,
        local: bool,
    ) -> Result<u64, EventStoreError> {
        let body = serde_json::to_string(event)?;
        let result = sqlx::query(
            r#"
            INSERT INTO events (
                event_id, event_type, device_id, operation_id, timestamp, sequence,
                local, hash, sync_status, sync_attempts, sync_error, body
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
        )
        .bind(event.id.to_string())
        .bind(event.event_type.as_str())
        .bind(event.device_id.to_string())
        .bind(event.operation_id.map(|op| op.to_string()))
        .bind(millis(event.timestamp))
        .bind(i64::from(event.sequence.unwrap_or(0)))
        .bind(local)
        .bind(event.hash.as_deref())
        .bind(event.sync_status.as_str())
        .bind(i64::from(event.sync_attempts))
        .bind(event.sync_error.as_deref())
        .bind(body)
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("insert_event", e))?;
        Ok(result.last_insert_rowid().max(0) as u64)
    }

    async fn exists(tx: &mut Transaction<'_, Sqlite>, event_id: EventId) -> Result<bool, EventStoreError> {
        let row = sqlx::query("SELECT 1 FROM events WHERE event_id = ?1")
            .bind(event_id.to_string())
            .fetch_optional(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("exists", e))?;
        Ok(row.is_some())
    }

    async fn load_outbox_item(
        tx: &mut Transaction<'_, Sqlite>,
        event_id: EventId,
    ) -> Result<OutboxItem, EventStoreError> {
        let sql = format!(
            "SELECT {OUTBOX_COLUMNS} FROM outbox o JOIN events e ON e.event_id = o.event_id WHERE o.event_id = ?1"
        );
        let row = sqlx::query(&sql)
            .bind(event_id.to_string())
            .fetch_optional(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("load_outbox_item", e))?
            .ok_or_else(|| EventStoreError::NotFound(format!("outbox item {event_id}")))?;
        decode_outbox(&row)
    }

    async fn store_outbox_item(tx: &mut Transaction<'_, Sqlite>, item: &OutboxItem) -> Result<(), EventStoreError> {
        sqlx::query(
            r#"
            UPDATE outbox
            SET status = ?2, retry_count = ?3, next_retry_at = ?4, last_error = ?5, sent_at = ?6
            WHERE event_id = ?1
            "#,
        )
        .bind(item.event.id.to_string())
        .bind(item.status.as_str())
        .bind(i64::from(item.retry_count))
        .bind(millis(item.next_retry_at))
        .bind(item.last_error.as_deref())
        .bind(item.sent_at.map(millis))
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("store_outbox_item", e))?;

        sqlx::query("UPDATE events SET sync_status = ?2, sync_attempts = ?3, sync_error = ?4 WHERE event_id = ?1")
            .bind(item.event.id.to_string())
            .bind(item.event.sync_status.as_str())
            .bind(i64::from(item.event.sync_attempts))
            .bind(item.event.sync_error.as_deref())
            .execute(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("store_outbox_item", e))?;
        Ok(())
    }

    async fn begin(&self) -> Result<Transaction<'static, Sqlite>, EventStoreError> {
        self.pool.begin().await.map_err(|e| map_sqlx_error("begin_transaction", e))
    }
}

fn millis(ts: Timestamp) -> i64 {
    i64::try_from(ts.as_millis()).unwrap_or(i64::MAX)
}

fn timestamp(value: i64) -> Timestamp {
    Timestamp::from_millis(value.max(0) as u64)
}

fn count(value: i64) -> u32 {
    u32::try_from(value.max(0)).unwrap_or(u32::MAX)
}

fn operation_key(operation: Option<OperationId>) -> String {
    operation.map(|op| op.to_string()).unwrap_or_default()
}

fn get<'r, T>(row: &'r SqliteRow, column: &str) -> Result<T, EventStoreError>
where
    T: sqlx::Decode<'r, Sqlite> + sqlx::Type<Sqlite>,
{
    row.try_get(column).map_err(|e| map_sqlx_error("decode", e))
}

fn decode_stored(row: &SqliteRow) -> Result<StoredEvent, EventStoreError> {
    let body: String = get(row, "body")?;
    let mut event: Event = serde_json::from_str(&body)?;
    let status: String = get(row, "sync_status")?;
    event.sync_status = DeliveryStatus::parse(&status)
        .ok_or_else(|| EventStoreError::Serialization(format!("invalid sync_status '{status}'")))?;
    event.sync_attempts = count(get(row, "sync_attempts")?);
    event.sync_error = get(row, "sync_error")?;
    Ok(StoredEvent {
        position: get::<i64>(row, "position")?.max(0) as u64,
        local: get(row, "local")?,
        event,
    })
}

fn decode_outbox(row: &SqliteRow) -> Result<OutboxItem, EventStoreError> {
    let body: String = get(row, "body")?;
    let status: String = get(row, "status")?;
    let mut item = OutboxItem {
        event: serde_json::from_str(&body)?,
        status: OutboxStatus::parse(&status)
            .ok_or_else(|| EventStoreError::Serialization(format!("invalid outbox status '{status}'")))?,
        retry_count: count(get(row, "retry_count")?),
        max_retries: count(get(row, "max_retries")?),
        next_retry_at: timestamp(get(row, "next_retry_at")?),
        last_error: get(row, "last_error")?,
        created_at: timestamp(get(row, "created_at")?),
        sent_at: get::<Option<i64>>(row, "sent_at")?.map(timestamp),
    };
    item.sync_bookkeeping();
    Ok(item)
}

fn decode_inbox(row: &SqliteRow) -> Result<InboxItem, EventStoreError> {
    let body: String = get(row, "body")?;
    Ok(InboxItem {
        event: serde_json::from_str(&body)?,
        received_at: timestamp(get(row, "received_at")?),
        processed: get(row, "processed")?,
        processed_at: get::<Option<i64>>(row, "processed_at")?.map(timestamp),
        error: get(row, "error")?,
    })
}

#[async_trait]
impl EventStore for SqliteEventStore {
    #[instrument(skip(self, event), fields(event_id = %event.id, event_type = %event.event_type), err)]
    async fn append(&self, event: Event) -> Result<StoredEvent, EventStoreError> {
        event.validate()?;
        let now = Timestamp::now();
        let item = OutboxItem::new(event, self.retry.max_retries, now);

        let mut tx = self.begin().await?;
        if Self::exists(&mut tx, item.event.id).await? {
            tx.rollback().await.map_err(|e| map_sqlx_error("rollback", e))?;
            return Err(EventStoreError::DuplicateEvent(item.event.id));
        }
        let position = Self::insert_event(&mut tx, &item.event, true).await?;
        sqlx::query(
            r#"
            INSERT INTO outbox (event_id, status, retry_count, max_retries, next_retry_at, last_error, created_at, sent_at)
            VALUES (?1, ?2, ?3, ?4, ?5, NULL, ?6, NULL)
            "#,
        )
        .bind(item.event.id.to_string())
        .bind(item.status.as_str())
        .bind(i64::from(item.retry_count))
        .bind(i64::from(item.max_retries))
        .bind(millis(item.next_retry_at))
        .bind(millis(item.created_at))
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("insert_outbox", e))?;
        tx.commit().await.map_err(|e| map_sqlx_error("commit", e))?;

        Ok(StoredEvent {
            position,
            local: true,
            event: item.event,
        })
    }

    async fn record_remote(&self, mut event: Event) -> Result<Option<StoredEvent>, EventStoreError> {
        event.validate()?;
        event.sync_status = DeliveryStatus::Synced;
        let mut tx = self.begin().await?;
        if Self::exists(&mut tx, event.id).await? {
            tx.rollback().await.map_err(|e| map_sqlx_error("rollback", e))?;
            return Ok(None);
        }
        let position = Self::insert_event(&mut tx, &event, false).await?;
        tx.commit().await.map_err(|e| map_sqlx_error("commit", e))?;
        Ok(Some(StoredEvent {
            position,
            local: false,
            event,
        }))
    }

    async fn get(&self, event_id: EventId) -> Result<Option<StoredEvent>, EventStoreError> {
        let sql = format!("SELECT {EVENT_COLUMNS} FROM events WHERE event_id = ?1");
        let row = sqlx::query(&sql)
            .bind(event_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;
        row.as_ref().map(decode_stored).transpose()
    }

    async fn query(
        &self,
        operation: Option<OperationId>,
        since: Option<Timestamp>,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM events \
             WHERE (?1 IS NULL OR operation_id = ?1) AND (?2 IS NULL OR timestamp > ?2) \
             ORDER BY timestamp, sequence, event_id"
        );
        let rows = sqlx::query(&sql)
            .bind(operation.map(|op| op.to_string()))
            .bind(since.map(millis))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("query", e))?;
        rows.iter().map(decode_stored).collect()
    }

    async fn after_position(
        &self,
        operation: Option<OperationId>,
        position: u64,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM events \
             WHERE (?1 IS NULL OR operation_id = ?1) AND position > ?2 \
             ORDER BY timestamp, sequence, event_id"
        );
        let rows = sqlx::query(&sql)
            .bind(operation.map(|op| op.to_string()))
            .bind(i64::try_from(position).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("after_position", e))?;
        rows.iter().map(decode_stored).collect()
    }

    async fn by_type(&self, event_type: EventType, limit: usize) -> Result<Vec<StoredEvent>, EventStoreError> {
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM events WHERE event_type = ?1 \
             ORDER BY timestamp, sequence, event_id LIMIT ?2"
        );
        let rows = sqlx::query(&sql)
            .bind(event_type.as_str())
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("by_type", e))?;
        rows.iter().map(decode_stored).collect()
    }

    async fn head_position(&self) -> Result<u64, EventStoreError> {
        let row = sqlx::query("SELECT COALESCE(MAX(position), 0) AS head FROM events")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("head_position", e))?;
        Ok(get::<i64>(&row, "head")?.max(0) as u64)
    }

    async fn chain_head(&self, device: DeviceId) -> Result<Option<String>, EventStoreError> {
        let row = sqlx::query(
            "SELECT hash FROM events WHERE device_id = ?1 AND local = 1 ORDER BY position DESC LIMIT 1",
        )
        .bind(device.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("chain_head", e))?;
        match row {
            Some(row) => get(&row, "hash"),
            None => Ok(None),
        }
    }

    async fn pending_outbox(&self, now: Timestamp, limit: usize) -> Result<Vec<OutboxItem>, EventStoreError> {
        let sql = format!(
            "SELECT {OUTBOX_COLUMNS} FROM outbox o JOIN events e ON e.event_id = o.event_id \
             WHERE o.status = 'pending' AND o.next_retry_at <= ?1 \
             ORDER BY e.timestamp, e.sequence, e.event_id LIMIT ?2"
        );
        let rows = sqlx::query(&sql)
            .bind(millis(now))
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("pending_outbox", e))?;
        rows.iter().map(decode_outbox).collect()
    }

    async fn outbox_item(&self, event_id: EventId) -> Result<Option<OutboxItem>, EventStoreError> {
        let mut tx = self.begin().await?;
        let item = match Self::load_outbox_item(&mut tx, event_id).await {
            Ok(item) => Some(item),
            Err(EventStoreError::NotFound(_)) => None,
            Err(e) => return Err(e),
        };
        tx.commit().await.map_err(|e| map_sqlx_error("commit", e))?;
        Ok(item)
    }

    #[instrument(skip(self, update), fields(event_id = %event_id, to = ?update.target()), err)]
    async fn update_outbox_status(
        &self,
        event_id: EventId,
        update: OutboxUpdate,
        now: Timestamp,
    ) -> Result<OutboxItem, EventStoreError> {
        let mut tx = self.begin().await?;
        let mut item = Self::load_outbox_item(&mut tx, event_id).await?;
        item.transition(&update, now, &self.retry)?;
        Self::store_outbox_item(&mut tx, &item).await?;
        tx.commit().await.map_err(|e| map_sqlx_error("commit", e))?;
        Ok(item)
    }

    async fn failed_outbox(&self) -> Result<Vec<OutboxItem>, EventStoreError> {
        let sql = format!(
            "SELECT {OUTBOX_COLUMNS} FROM outbox o JOIN events e ON e.event_id = o.event_id \
             WHERE o.status = 'failed' ORDER BY e.timestamp, e.sequence, e.event_id"
        );
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("failed_outbox", e))?;
        rows.iter().map(decode_outbox).collect()
    }

    async fn retry_outbox(&self, event_id: EventId, now: Timestamp) -> Result<OutboxItem, EventStoreError> {
        let mut tx = self.begin().await?;
        let mut item = Self::load_outbox_item(&mut tx, event_id).await?;
        if item.status != OutboxStatus::Failed {
            return Err(EventStoreError::InvalidTransition {
                event_id,
                from: item.status,
                to: OutboxStatus::Pending,
            });
        }
        item.reset(now);
        Self::store_outbox_item(&mut tx, &item).await?;
        tx.commit().await.map_err(|e| map_sqlx_error("commit", e))?;
        Ok(item)
    }

    async fn prune_outbox(&self, sent_before: Timestamp) -> Result<usize, EventStoreError> {
        let result = sqlx::query("DELETE FROM outbox WHERE status = 'sent' AND sent_at < ?1")
            .bind(millis(sent_before))
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("prune_outbox", e))?;
        Ok(result.rows_affected() as usize)
    }

    async fn requeue_sending(&self) -> Result<usize, EventStoreError> {
        let result = sqlx::query("UPDATE outbox SET status = 'pending' WHERE status = 'sending'")
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("requeue_sending", e))?;
        Ok(result.rows_affected() as usize)
    }

    async fn add_to_inbox(&self, event: Event, now: Timestamp) -> Result<bool, EventStoreError> {
        let mut tx = self.begin().await?;
        if Self::exists(&mut tx, event.id).await? {
            tx.rollback().await.map_err(|e| map_sqlx_error("rollback", e))?;
            return Ok(false);
        }
        let body = serde_json::to_string(&event)?;
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO inbox (event_id, timestamp, sequence, body, received_at, processed, processed_at, error)
            VALUES (?1, ?2, ?3, ?4, ?5, 0, NULL, NULL)
            "#,
        )
        .bind(event.id.to_string())
        .bind(millis(event.timestamp))
        .bind(i64::from(event.sequence.unwrap_or(0)))
        .bind(body)
        .bind(millis(now))
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("add_to_inbox", e))?;
        tx.commit().await.map_err(|e| map_sqlx_error("commit", e))?;
        Ok(result.rows_affected() == 1)
    }

    async fn unprocessed_inbox(&self) -> Result<Vec<InboxItem>, EventStoreError> {
        let rows = sqlx::query(
            "SELECT body, received_at, processed, processed_at, error FROM inbox \
             WHERE processed = 0 ORDER BY timestamp, sequence, event_id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("unprocessed_inbox", e))?;
        rows.iter().map(decode_inbox).collect()
    }

    async fn mark_inbox_item(
        &self,
        event_id: EventId,
        outcome: Result<(), String>,
        now: Timestamp,
    ) -> Result<(), EventStoreError> {
        let result = match outcome {
            Ok(()) => sqlx::query("UPDATE inbox SET processed = 1, processed_at = ?2, error = NULL WHERE event_id = ?1")
                .bind(event_id.to_string())
                .bind(millis(now))
                .execute(&self.pool)
                .await,
            Err(error) => sqlx::query("UPDATE inbox SET error = ?2 WHERE event_id = ?1")
                .bind(event_id.to_string())
                .bind(error)
                .execute(&self.pool)
                .await,
        }
        .map_err(|e| map_sqlx_error("mark_inbox_item", e))?;
        if result.rows_affected() == 0 {
            return Err(EventStoreError::NotFound(format!("inbox item {event_id}")));
        }
        Ok(())
    }

    async fn prune_inbox(&self, processed_before: Timestamp) -> Result<usize, EventStoreError> {
        let result = sqlx::query("DELETE FROM inbox WHERE processed = 1 AND processed_at < ?1")
            .bind(millis(processed_before))
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("prune_inbox", e))?;
        Ok(result.rows_affected() as usize)
    }

    async fn save_snapshot(&self, snapshot: Snapshot) -> Result<(), EventStoreError> {
        sqlx::query(
            r#"
            INSERT INTO snapshots (projection, operation_key, position, taken_at, state, digest)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT (projection, operation_key) DO UPDATE SET
                position = excluded.position,
                taken_at = excluded.taken_at,
                state = excluded.state,
                digest = excluded.digest
            "#,
        )
        .bind(&snapshot.projection)
        .bind(operation_key(snapshot.operation_id))
        .bind(i64::try_from(snapshot.position).unwrap_or(i64::MAX))
        .bind(millis(snapshot.taken_at))
        .bind(serde_json::to_string(&snapshot.state)?)
        .bind(&snapshot.digest)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("save_snapshot", e))?;
        Ok(())
    }

    async fn latest_snapshot(
        &self,
        projection: &str,
        operation: Option<OperationId>,
    ) -> Result<Option<Snapshot>, EventStoreError> {
        let row = sqlx::query(
            "SELECT position, taken_at, state, digest FROM snapshots WHERE projection = ?1 AND operation_key = ?2",
        )
        .bind(projection)
        .bind(operation_key(operation))
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("latest_snapshot", e))?;
        let Some(row) = row else {
            return Ok(None);
        };
        let state: String = get(&row, "state")?;
        Ok(Some(Snapshot {
            projection: projection.to_string(),
            operation_id: operation,
            position: get::<i64>(&row, "position")?.max(0) as u64,
            taken_at: timestamp(get(&row, "taken_at")?),
            state: serde_json::from_str(&state)?,
            digest: get(&row, "digest")?,
        }))
    }

    async fn sync_cursor(&self, operation: Option<OperationId>) -> Result<Option<Timestamp>, EventStoreError> {
        let row = sqlx::query("SELECT cursor FROM sync_cursors WHERE operation_key = ?1")
            .bind(operation_key(operation))
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("sync_cursor", e))?;
        row.map(|r| get::<i64>(&r, "cursor").map(timestamp)).transpose()
    }

    async fn set_sync_cursor(&self, operation: Option<OperationId>, cursor: Timestamp) -> Result<(), EventStoreError> {
        sqlx::query(
            "INSERT INTO sync_cursors (operation_key, cursor) VALUES (?1, ?2) \
             ON CONFLICT (operation_key) DO UPDATE SET cursor = excluded.cursor",
        )
        .bind(operation_key(operation))
        .bind(millis(cursor))
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("set_sync_cursor", e))?;
        Ok(())
    }

    async fn stats(&self) -> Result<StoreStats, EventStoreError> {
        let row = sqlx::query(
            r#"
            SELECT
                (SELECT COUNT(*) FROM events) AS events,
                (SELECT COUNT(*) FROM events WHERE local = 1) AS local_events,
                (SELECT COUNT(*) FROM outbox WHERE status = 'pending') AS outbox_pending,
                (SELECT COUNT(*) FROM outbox WHERE status = 'sending') AS outbox_sending,
                (SELECT COUNT(*) FROM outbox WHERE status = 'sent') AS outbox_sent,
                (SELECT COUNT(*) FROM outbox WHERE status = 'failed') AS outbox_failed,
                (SELECT COUNT(*) FROM inbox WHERE processed = 0) AS inbox_unprocessed,
                (SELECT COUNT(*) FROM inbox WHERE processed = 0 AND error IS NOT NULL) AS inbox_failed,
                (SELECT COUNT(*) FROM snapshots) AS snapshots
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("stats", e))?;
        let n = |column: &str| -> Result<usize, EventStoreError> { Ok(get::<i64>(&row, column)?.max(0) as usize) };
        Ok(StoreStats {
            events: n("events")?,
            local_events: n("local_events")?,
            outbox_pending: n("outbox_pending")?,
            outbox_sending: n("outbox_sending")?,
            outbox_sent: n("outbox_sent")?,
            outbox_failed: n("outbox_failed")?,
            inbox_unprocessed: n("inbox_unprocessed")?,
            inbox_failed: n("inbox_failed")?,
            snapshots: n("snapshots")?,
        })
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> EventStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            EventStoreError::Storage(format!("database error in {operation}: {}", db_err.message()))
        }
        sqlx::Error::PoolClosed => EventStoreError::Storage(format!("connection pool closed in {operation}")),
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            EventStoreError::Serialization(format!("decode error in {operation}: {err}"))
        }
        _ => EventStoreError::Storage(format!("sqlx error in {operation}: {err}")),
    }
}
