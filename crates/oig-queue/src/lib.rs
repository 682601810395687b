//! Persistent queue (C3): a size-bounded FIFO backed by a single SQLite
//! file, used both for outbound bus publications (when the bus is
//! disconnected) and deferred control-pipeline attempts.
//!
//! Uses `sqlx`'s runtime-checked queries rather than the compile-time
//! `query!` macros, so this crate builds without a live database at compile
//! time. The backing table follows an "outbox" shape: a durable, claim-and-
//! drain queue oldest-first.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;

/// One durable queue row.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueEntry {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub table_name: String,
    pub device_id: String,
    pub payload: Vec<u8>,
    pub deferred_until: DateTime<Utc>,
}

/// Metadata accompanying an enqueued payload.
#[derive(Debug, Clone)]
pub struct QueueMeta {
    pub table_name: String,
    pub device_id: String,
}

/// A size-bounded, disk-backed FIFO. Safe for concurrent use from multiple
/// tasks; every mutation commits before the call returns.
#[derive(Clone)]
pub struct PersistentQueue {
    pool: SqlitePool,
    max_size: i64,
}

impl PersistentQueue {
    /// Opens (creating if absent) the SQLite file at `db_path` and ensures
    /// the schema exists.
    pub async fn open(db_path: &str, max_size: i64) -> Result<Self> {
        if let Some(parent) = std::path::Path::new(db_path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).context("creating queue db directory")?;
            }
        }
        let opts = SqliteConnectOptions::from_str(&format!("sqlite://{db_path}"))
            .context("parsing queue db path")?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(opts)
            .await
            .context("opening queue db")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS queue (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                created_at TEXT NOT NULL,
                table_name TEXT NOT NULL,
                device_id TEXT NOT NULL,
                payload BLOB NOT NULL,
                deferred_until TEXT NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await
        .context("creating queue table")?;

        Ok(Self { pool, max_size: max_size.max(1) })
    }

    /// In-memory-backed pool for tests (`:memory:`).
    pub async fn open_in_memory(max_size: i64) -> Result<Self> {
        Self::open(":memory:", max_size).await
    }

    /// Appends a new entry; if the queue's size exceeds `max_size`
    /// afterward, evicts the single oldest entry (by `id`).
    pub async fn enqueue(&self, payload: &[u8], meta: QueueMeta) -> Result<i64> {
        let now = Utc::now();
        let id = sqlx::query(
            r#"
            INSERT INTO queue (created_at, table_name, device_id, payload, deferred_until)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(now.to_rfc3339())
        .bind(&meta.table_name)
        .bind(&meta.device_id)
        .bind(payload)
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await
        .context("enqueue insert")?
        .last_insert_rowid();

        self.evict_over_bound().await?;
        Ok(id)
    }

    async fn evict_over_bound(&self) -> Result<()> {
        let size = self.size().await?;
        if size > self.max_size {
            let row = sqlx::query("SELECT id FROM queue ORDER BY id ASC LIMIT 1")
                .fetch_optional(&self.pool)
                .await
                .context("finding oldest entry")?;
            if let Some(row) = row {
                let id: i64 = row.try_get("id")?;
                self.remove(id).await?;
                tracing::warn!(evicted_id = id, "queue over bound, evicted oldest entry");
            }
        }
        Ok(())
    }

    /// Returns the lowest-id entry whose `deferred_until` has passed, or
    /// `None` if the queue is empty or every entry is still deferred.
    pub async fn peek_next_ready(&self) -> Result<Option<QueueEntry>> {
        let now = Utc::now().to_rfc3339();
        let row = sqlx::query(
            r#"
            SELECT id, created_at, table_name, device_id, payload, deferred_until
            FROM queue
            WHERE deferred_until <= ?
            ORDER BY id ASC
            LIMIT 1
            "#,
        )
        .bind(&now)
        .fetch_optional(&self.pool)
        .await
        .context("peek_next_ready query")?;

        row.map(row_to_entry).transpose()
    }

    /// Moves `id`'s ready time `seconds` forward from now.
    pub async fn defer(&self, id: i64, seconds: i64) -> Result<()> {
        let new_ready = (Utc::now() + chrono::Duration::seconds(seconds)).to_rfc3339();
        sqlx::query("UPDATE queue SET deferred_until = ? WHERE id = ?")
            .bind(new_ready)
            .bind(id)
            .execute(&self.pool)
            .await
            .context("defer update")?;
        Ok(())
    }

    /// Deletes an entry.
    pub async fn remove(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM queue WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("remove delete")?;
        Ok(())
    }

    /// Current row count.
    pub async fn size(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM queue")
            .fetch_one(&self.pool)
            .await
            .context("size query")?;
        Ok(row.try_get::<i64, _>("n")?)
    }

    /// Age of the oldest entry, if any.
    pub async fn oldest_age(&self) -> Result<Option<chrono::Duration>> {
        let row = sqlx::query("SELECT created_at FROM queue ORDER BY id ASC LIMIT 1")
            .fetch_optional(&self.pool)
            .await
            .context("oldest_age query")?;
        match row {
            None => Ok(None),
            Some(row) => {
                let created_at: String = row.try_get("created_at")?;
                let created_at = DateTime::parse_from_rfc3339(&created_at)?.with_timezone(&Utc);
                Ok(Some(Utc::now() - created_at))
            }
        }
    }

    /// Seconds until the next entry becomes ready, `0` if one already is,
    /// `None` if the queue is empty.
    pub async fn next_ready_in_seconds(&self) -> Result<Option<i64>> {
        let row = sqlx::query("SELECT deferred_until FROM queue ORDER BY deferred_until ASC, id ASC LIMIT 1")
            .fetch_optional(&self.pool)
            .await
            .context("next_ready_in_seconds query")?;
        match row {
            None => Ok(None),
            Some(row) => {
                let deferred_until: String = row.try_get("deferred_until")?;
                let deferred_until = DateTime::parse_from_rfc3339(&deferred_until)?.with_timezone(&Utc);
                let delta = (deferred_until - Utc::now()).num_seconds();
                Ok(Some(delta.max(0)))
            }
        }
    }
}

fn row_to_entry(row: sqlx::sqlite::SqliteRow) -> Result<QueueEntry> {
    let created_at: String = row.try_get("created_at")?;
    let deferred_until: String = row.try_get("deferred_until")?;
    Ok(QueueEntry {
        id: row.try_get("id")?,
        created_at: DateTime::parse_from_rfc3339(&created_at)?.with_timezone(&Utc),
        table_name: row.try_get("table_name")?,
        device_id: row.try_get("device_id")?,
        payload: row.try_get("payload")?,
        deferred_until: DateTime::parse_from_rfc3339(&deferred_until)?.with_timezone(&Utc),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta() -> QueueMeta {
        QueueMeta { table_name: "tbl_actual".into(), device_id: "123".into() }
    }

    #[tokio::test]
    async fn enqueue_and_peek_round_trips_payload() {
        let q = PersistentQueue::open_in_memory(10).await.unwrap();
        let id = q.enqueue(b"hello", meta()).await.unwrap();
        let entry = q.peek_next_ready().await.unwrap().unwrap();
        assert_eq!(entry.id, id);
        assert_eq!(entry.payload, b"hello");
        assert_eq!(entry.table_name, "tbl_actual");
    }

    #[tokio::test]
    async fn size_never_exceeds_bound_after_insert() {
        let q = PersistentQueue::open_in_memory(3).await.unwrap();
        for i in 0..10 {
            q.enqueue(format!("msg{i}").as_bytes(), meta()).await.unwrap();
            assert!(q.size().await.unwrap() <= 3);
        }
    }

    #[tokio::test]
    async fn eviction_drops_oldest_first() {
        let q = PersistentQueue::open_in_memory(2).await.unwrap();
        let first = q.enqueue(b"a", meta()).await.unwrap();
        q.enqueue(b"b", meta()).await.unwrap();
        q.enqueue(b"c", meta()).await.unwrap();
        let remaining = q.peek_next_ready().await.unwrap().unwrap();
        assert_ne!(remaining.id, first);
        assert_eq!(q.size().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn defer_moves_entry_out_of_ready_window() {
        let q = PersistentQueue::open_in_memory(10).await.unwrap();
        let id = q.enqueue(b"x", meta()).await.unwrap();
        q.defer(id, 3600).await.unwrap();
        assert!(q.peek_next_ready().await.unwrap().is_none());
        let next_ready = q.next_ready_in_seconds().await.unwrap().unwrap();
        assert!(next_ready > 0);
    }

    #[tokio::test]
    async fn remove_deletes_entry() {
        let q = PersistentQueue::open_in_memory(10).await.unwrap();
        let id = q.enqueue(b"x", meta()).await.unwrap();
        q.remove(id).await.unwrap();
        assert_eq!(q.size().await.unwrap(), 0);
        assert!(q.peek_next_ready().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn fifo_ordering_is_preserved() {
        let q = PersistentQueue::open_in_memory(10).await.unwrap();
        let a = q.enqueue(b"a", meta()).await.unwrap();
        let b = q.enqueue(b"b", meta()).await.unwrap();
        let first = q.peek_next_ready().await.unwrap().unwrap();
        assert_eq!(first.id, a);
        q.remove(a).await.unwrap();
        let second = q.peek_next_ready().await.unwrap().unwrap();
        assert_eq!(second.id, b);
    }
}
