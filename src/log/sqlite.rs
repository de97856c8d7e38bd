// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Durable shared log backed by SQLite.
//!
//! Every commit is one SQLite transaction covering the entry row, its stream
//! index rows, the metadata versions it writes and the tail marker. A crash
//! therefore leaves either the whole commit or none of it, which is what the
//! destination writers rely on for crash consistency.
//!
//! # Schema
//!
//! ```text
//! log_entries(address PK, kind, as_of, updates JSON)
//! stream_index(stream_id, address)          # which entries touch a stream
//! metadata_versions(table_name, meta_key, address, value, updated_at)
//! log_markers(name PK, value)               # "tail", "trim_mark"
//! ```
//!
//! # SQLite Busy Handling
//!
//! SQLITE_BUSY/SQLITE_LOCKED are retried with exponential backoff (5
//! attempts, 10ms doubling to 500ms). Each retry bumps
//! `replication_storage_retries_total`.

use super::{BoxFuture, EntryKind, LogAddress, LogEntry, SharedLog, StreamId, Transaction, NON_ADDRESS};
use crate::error::{ReplicationError, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Sqlite, Transaction as SqlTransaction};
use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

const SQLITE_RETRY_MAX_ATTEMPTS: u32 = 5;
const SQLITE_RETRY_BASE_DELAY_MS: u64 = 10;
const SQLITE_RETRY_MAX_DELAY_MS: u64 = 500;

const TAIL_MARKER: &str = "tail";
const TRIM_MARKER: &str = "trim_mark";

/// Check if an error is a retryable SQLite busy/locked error
fn is_sqlite_busy_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db_err) => {
            // SQLITE_BUSY = 5, SQLITE_LOCKED = 6
            if let Some(code) = db_err.code() {
                return code == "5" || code == "6";
            }
            let msg = db_err.message().to_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
        _ => false,
    }
}

/// Run a database operation, retrying on SQLITE_BUSY/SQLITE_LOCKED.
async fn execute_with_retry<F, Fut, T>(operation_name: &str, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut attempts = 0;
    let mut delay_ms = SQLITE_RETRY_BASE_DELAY_MS;

    loop {
        attempts += 1;
        match f().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(operation = operation_name, attempts, "SQLite operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(ReplicationError::Storage(e)) if is_sqlite_busy_error(&e) && attempts < SQLITE_RETRY_MAX_ATTEMPTS => {
                warn!(
                    operation = operation_name,
                    attempts,
                    max_attempts = SQLITE_RETRY_MAX_ATTEMPTS,
                    delay_ms,
                    "SQLite busy, retrying"
                );
                crate::metrics::storage_retries_total(operation_name);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = (delay_ms * 2).min(SQLITE_RETRY_MAX_DELAY_MS);
            }
            Err(e) => return Err(e),
        }
    }
}

type EntryRow = (i64, String, Option<i64>, String);

fn decode_entry((address, kind, as_of, updates): EntryRow) -> Result<LogEntry> {
    let updates: BTreeMap<StreamId, Vec<super::StreamUpdate>> = serde_json::from_str(&updates)?;
    Ok(LogEntry {
        address,
        kind: EntryKind::from_parts(&kind, as_of)?,
        updates,
    })
}

async fn marker(tx: &mut SqlTransaction<'_, Sqlite>, name: &str, default: i64) -> Result<i64> {
    let value: Option<i64> = sqlx::query_scalar("SELECT value FROM log_markers WHERE name = ?")
        .bind(name)
        .fetch_optional(&mut **tx)
        .await?;
    Ok(value.unwrap_or(default))
}

async fn set_marker(tx: &mut SqlTransaction<'_, Sqlite>, name: &str, value: i64) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO log_markers (name, value) VALUES (?, ?)
        ON CONFLICT(name) DO UPDATE SET value = excluded.value
        "#,
    )
    .bind(name)
    .bind(value)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Shared log persisted in a SQLite database file.
pub struct SqliteLog {
    pool: SqlitePool,
    path: String,
}

impl SqliteLog {
    /// Open (or create) the log at `path`.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with(path, true).await
    }

    /// Open with an explicit journal mode choice.
    pub async fn open_with(path: impl AsRef<Path>, wal_mode: bool) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        info!(path = %path_str, "Opening SQLite shared log");

        let journal = if wal_mode {
            SqliteJournalMode::Wal
        } else {
            SqliteJournalMode::Delete
        };
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", path_str))
            .map_err(|e| ReplicationError::Config(format!("Invalid SQLite path: {}", e)))?
            .journal_mode(journal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5))
            .create_if_missing(true);

        // One writer connection keeps commits serialized in address order.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        for ddl in [
            r#"CREATE TABLE IF NOT EXISTS log_entries (
                address INTEGER PRIMARY KEY,
                kind TEXT NOT NULL,
                as_of INTEGER,
                updates TEXT NOT NULL
            )"#,
            r#"CREATE TABLE IF NOT EXISTS stream_index (
                stream_id TEXT NOT NULL,
                address INTEGER NOT NULL,
                PRIMARY KEY (stream_id, address)
            )"#,
            r#"CREATE TABLE IF NOT EXISTS metadata_versions (
                table_name TEXT NOT NULL,
                meta_key TEXT NOT NULL,
                address INTEGER NOT NULL,
                value INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (table_name, meta_key, address)
            )"#,
            r#"CREATE TABLE IF NOT EXISTS log_markers (
                name TEXT PRIMARY KEY,
                value INTEGER NOT NULL
            )"#,
        ] {
            sqlx::query(ddl).execute(&pool).await?;
        }

        let tail: Option<i64> = sqlx::query_scalar("SELECT value FROM log_markers WHERE name = ?")
            .bind(TAIL_MARKER)
            .fetch_optional(&pool)
            .await?;
        if let Some(tail) = tail {
            info!(tail, "Restored shared log from previous run");
        }

        Ok(Self { pool, path: path_str })
    }

    /// Database path (for diagnostics).
    pub fn path(&self) -> &str {
        &self.path
    }

    async fn commit_once(&self, tx: &Transaction, read_timestamp: Option<LogAddress>) -> Result<LogAddress> {
        let mut sql = self.pool.begin().await?;

        if let Some(read_ts) = read_timestamp {
            for write in &tx.metadata {
                let latest: Option<i64> = sqlx::query_scalar(
                    "SELECT MAX(address) FROM metadata_versions WHERE table_name = ?",
                )
                .bind(&write.table)
                .fetch_one(&mut *sql)
                .await?;
                if let Some(version) = latest.filter(|v| *v > read_ts) {
                    return Err(ReplicationError::TransactionAborted {
                        table: write.table.clone(),
                        read_timestamp: read_ts,
                        conflict_address: version,
                    });
                }
            }
        }

        let address = marker(&mut sql, TAIL_MARKER, NON_ADDRESS).await? + 1;
        let updates = serde_json::to_string(&tx.updates)?;
        sqlx::query("INSERT INTO log_entries (address, kind, as_of, updates) VALUES (?, ?, ?, ?)")
            .bind(address)
            .bind(tx.kind.as_str())
            .bind(tx.kind.as_of())
            .bind(updates)
            .execute(&mut *sql)
            .await?;
        for stream in tx.updates.keys() {
            sqlx::query("INSERT INTO stream_index (stream_id, address) VALUES (?, ?)")
                .bind(stream.to_string())
                .bind(address)
                .execute(&mut *sql)
                .await?;
        }
        let now = chrono::Utc::now().timestamp_millis();
        for write in &tx.metadata {
            sqlx::query(
                r#"
                INSERT INTO metadata_versions (table_name, meta_key, address, value, updated_at)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(&write.table)
            .bind(&write.key)
            .bind(address)
            .bind(write.value)
            .bind(now)
            .execute(&mut *sql)
            .await?;
        }
        set_marker(&mut sql, TAIL_MARKER, address).await?;
        sql.commit().await?;
        Ok(address)
    }

    async fn check_trim(&self, from: LogAddress) -> Result<LogAddress> {
        let trim_mark = self.current_trim_mark().await?;
        if from.max(0) < trim_mark {
            return Err(ReplicationError::TrimmedLog {
                requested: from.max(0),
                trim_mark,
            });
        }
        Ok(from.max(0))
    }

    async fn current_trim_mark(&self) -> Result<LogAddress> {
        let value: Option<i64> = sqlx::query_scalar("SELECT value FROM log_markers WHERE name = ?")
            .bind(TRIM_MARKER)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value.unwrap_or(0))
    }

    /// Force flush WAL to main database (for clean shutdown).
    pub async fn checkpoint_wal(&self) -> Result<()> {
        let pool = &self.pool;
        execute_with_retry("log_wal_checkpoint", || async {
            sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
                .execute(pool)
                .await?;
            Ok(())
        })
        .await?;
        debug!("WAL checkpoint complete");
        Ok(())
    }

    /// Close the connection pool gracefully.
    pub async fn close(&self) {
        if let Err(e) = self.checkpoint_wal().await {
            warn!(error = %e, "Failed to checkpoint WAL on close");
        }
        self.pool.close().await;
        info!(path = %self.path, "SQLite shared log closed");
    }
}

impl SharedLog for SqliteLog {
    fn commit(&self, tx: Transaction, read_timestamp: Option<LogAddress>) -> BoxFuture<'_, LogAddress> {
        Box::pin(async move {
            let tx = &tx;
            execute_with_retry("log_commit", || self.commit_once(tx, read_timestamp)).await
        })
    }

    fn read_range(&self, from: LogAddress, to: LogAddress) -> BoxFuture<'_, Vec<LogEntry>> {
        Box::pin(async move {
            let from = self.check_trim(from).await?;
            let rows: Vec<EntryRow> = sqlx::query_as(
                "SELECT address, kind, as_of, updates FROM log_entries WHERE address >= ? AND address <= ? ORDER BY address",
            )
            .bind(from)
            .bind(to)
            .fetch_all(&self.pool)
            .await?;
            rows.into_iter().map(decode_entry).collect()
        })
    }

    fn read_stream(&self, stream: StreamId, from: LogAddress, to: LogAddress) -> BoxFuture<'_, Vec<LogEntry>> {
        Box::pin(async move {
            let from = self.check_trim(from).await?;
            let rows: Vec<EntryRow> = sqlx::query_as(
                r#"
                SELECT e.address, e.kind, e.as_of, e.updates
                FROM stream_index s JOIN log_entries e ON e.address = s.address
                WHERE s.stream_id = ? AND s.address >= ? AND s.address <= ?
                ORDER BY e.address
                "#,
            )
            .bind(stream.to_string())
            .bind(from)
            .bind(to)
            .fetch_all(&self.pool)
            .await?;
            rows.into_iter().map(decode_entry).collect()
        })
    }

    fn log_tail(&self) -> BoxFuture<'_, LogAddress> {
        Box::pin(async move {
            let value: Option<i64> = sqlx::query_scalar("SELECT value FROM log_markers WHERE name = ?")
                .bind(TAIL_MARKER)
                .fetch_optional(&self.pool)
                .await?;
            Ok(value.unwrap_or(NON_ADDRESS))
        })
    }

    fn trim_mark(&self) -> BoxFuture<'_, LogAddress> {
        Box::pin(async move { self.current_trim_mark().await })
    }

    fn prefix_trim(&self, address: LogAddress) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let mut sql = self.pool.begin().await?;
            let tail = marker(&mut sql, TAIL_MARKER, NON_ADDRESS).await?;
            let current = marker(&mut sql, TRIM_MARKER, 0).await?;
            let address = address.min(tail + 1);
            if address <= current {
                return Ok(());
            }
            sqlx::query("DELETE FROM log_entries WHERE address < ?")
                .bind(address)
                .execute(&mut *sql)
                .await?;
            sqlx::query("DELETE FROM stream_index WHERE address < ?")
                .bind(address)
                .execute(&mut *sql)
                .await?;
            set_marker(&mut sql, TRIM_MARKER, address).await?;
            sql.commit().await?;
            info!(trim_mark = address, "Prefix-trimmed shared log");
            Ok(())
        })
    }

    fn metadata_get(&self, table: &str, key: &str, at: LogAddress) -> BoxFuture<'_, Option<i64>> {
        let table = table.to_string();
        let key = key.to_string();
        Box::pin(async move {
            let value: Option<i64> = sqlx::query_scalar(
                r#"
                SELECT value FROM metadata_versions
                WHERE table_name = ? AND meta_key = ? AND address <= ?
                ORDER BY address DESC LIMIT 1
                "#,
            )
            .bind(&table)
            .bind(&key)
            .bind(at)
            .fetch_optional(&self.pool)
            .await?;
            Ok(value)
        })
    }
}
