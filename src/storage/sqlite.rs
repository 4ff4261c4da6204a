// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQLite-backed storage instance.
//!
//! Durable storage for forks and, more importantly, for meta instances: a
//! replication whose meta lives here resumes from its stored checkpoints
//! and assumed master states after a process restart.
//!
//! ## Layout
//!
//! One table per database file:
//!
//! ```text
//! documents(id TEXT PRIMARY KEY, deleted INTEGER, rev TEXT, lwt REAL, data TEXT)
//!           index on (lwt, id) for change scans
//! ```
//!
//! `data` is the JSON payload without system fields.
//!
//! ## Write Ordering
//!
//! Bulk writes are serialized by an async mutex and run in one transaction
//! each. The change batch is published after commit while the mutex is
//! still held, so subscribers see batches in commit order.
//!
//! ## SQLite Busy Handling
//!
//! SQLite can return SQLITE_BUSY/SQLITE_LOCKED when the database file is
//! shared with another process. Every statement group is retried with
//! exponential backoff (default 5 attempts).

use super::{
    BoxFuture, BulkWriteError, BulkWriteResponse, BulkWriteRow, ChangeEvent, ChangeEventBulk,
    ChangedDocuments, LwtCheckpoint, Query, StorageError, StorageInstance, StorageResult,
    CHANGE_STREAM_CAPACITY,
};
use crate::checkpoint::Checkpoint;
use crate::document::{DocumentMeta, StoredDocument};
use serde_json::{Map, Value};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

/// Configuration for SQLite busy retry behavior
const SQLITE_RETRY_MAX_ATTEMPTS: u32 = 5;
const SQLITE_RETRY_BASE_DELAY_MS: u64 = 10;
const SQLITE_RETRY_MAX_DELAY_MS: u64 = 500;

const SELECT_COLUMNS: &str = "SELECT id, deleted, rev, lwt, data FROM documents";

/// Check if an error is a retryable SQLite busy/locked error
fn is_sqlite_busy_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db_err) => {
            // SQLite error codes: SQLITE_BUSY = 5, SQLITE_LOCKED = 6
            if let Some(code) = db_err.code() {
                return code == "5" || code == "6";
            }
            let msg = db_err.message().to_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
        _ => false,
    }
}

/// Execute a database operation with retry on SQLITE_BUSY/SQLITE_LOCKED
async fn execute_with_retry<F, Fut, T>(operation_name: &str, mut f: F) -> std::result::Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
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
            Err(e) if is_sqlite_busy_error(&e) && attempts < SQLITE_RETRY_MAX_ATTEMPTS => {
                warn!(
                    operation = operation_name,
                    attempts,
                    max_attempts = SQLITE_RETRY_MAX_ATTEMPTS,
                    delay_ms,
                    "SQLite busy, retrying"
                );
                crate::metrics::sqlite_retries_total(operation_name);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = (delay_ms * 2).min(SQLITE_RETRY_MAX_DELAY_MS);
            }
            Err(e) => {
                if is_sqlite_busy_error(&e) {
                    warn!(operation = operation_name, attempts, "SQLite busy, max retries exceeded");
                }
                return Err(e);
            }
        }
    }
}

type DocumentRow = (String, bool, String, f64, String);

fn decode_row(row: DocumentRow) -> std::result::Result<StoredDocument, sqlx::Error> {
    let (id, deleted, rev, lwt, data) = row;
    let rev = rev.parse::<crate::revision::Revision>().map_err(|e| sqlx::Error::Decode(Box::new(e)))?;
    let data: Map<String, Value> =
        serde_json::from_str(&data).map_err(|e| sqlx::Error::Decode(Box::new(e)))?;
    Ok(StoredDocument {
        id,
        deleted,
        rev,
        meta: DocumentMeta { lwt },
        data,
    })
}

/// Rows of one bulk write with their payloads already encoded.
struct EncodedRow {
    row: BulkWriteRow,
    data: String,
}

/// Committed outcome of one bulk write transaction.
struct WriteOutcome {
    response: BulkWriteResponse,
    events: Vec<ChangeEvent>,
}

async fn write_transaction(
    pool: &SqlitePool,
    rows: &[EncodedRow],
) -> std::result::Result<WriteOutcome, sqlx::Error> {
    let mut tx = pool.begin().await?;
    let mut outcome = WriteOutcome {
        response: BulkWriteResponse::default(),
        events: Vec::new(),
    };

    for encoded in rows {
        let row = &encoded.row;
        let current: Option<DocumentRow> = sqlx::query_as::<_, DocumentRow>(&format!("{} WHERE id = ?", SELECT_COLUMNS))
            .bind(&row.document.id)
            .fetch_optional(&mut *tx)
            .await?;
        let current = current.map(decode_row).transpose()?;

        if current.as_ref().map(|c| &c.rev) != row.previous.as_ref().map(|p| &p.rev) {
            outcome
                .response
                .error
                .push(BulkWriteError::conflict(row.clone(), current));
            continue;
        }

        let doc = &row.document;
        sqlx::query(
            r#"
            INSERT INTO documents (id, deleted, rev, lwt, data)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                deleted = excluded.deleted,
                rev = excluded.rev,
                lwt = excluded.lwt,
                data = excluded.data
            "#,
        )
        .bind(&doc.id)
        .bind(doc.deleted)
        .bind(doc.rev.to_string())
        .bind(doc.meta.lwt)
        .bind(&encoded.data)
        .execute(&mut *tx)
        .await?;

        outcome.events.push(ChangeEvent::new(doc.clone(), current));
        outcome.response.success.push(doc.clone());
    }

    tx.commit().await?;
    Ok(outcome)
}

/// Storage instance persisted in a SQLite database file.
pub struct SqliteStorage {
    name: String,
    pool: SqlitePool,
    path: PathBuf,
    /// Serializes bulk writes and their change events
    write_lock: Mutex<()>,
    changes: broadcast::Sender<Arc<ChangeEventBulk>>,
    closed: AtomicBool,
}

impl SqliteStorage {
    /// Open (or create) the database at `path`.
    pub async fn open(name: impl Into<String>, path: impl AsRef<Path>) -> StorageResult<Self> {
        let name = name.into();
        let path = path.as_ref().to_path_buf();
        info!(storage = %name, path = %path.display(), "Opening SQLite storage");

        let options = SqliteConnectOptions::new()
            .filename(&path)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5))
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS documents (
                id TEXT PRIMARY KEY,
                deleted INTEGER NOT NULL,
                rev TEXT NOT NULL,
                lwt REAL NOT NULL,
                data TEXT NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS documents_lwt_id ON documents (lwt, id)")
            .execute(&pool)
            .await?;

        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM documents")
            .fetch_one(&pool)
            .await?;
        if count > 0 {
            info!(storage = %name, documents = count, "Restored documents from previous run");
        }

        let (changes, _) = broadcast::channel(CHANGE_STREAM_CAPACITY);
        Ok(Self {
            name,
            pool,
            path,
            write_lock: Mutex::new(()),
            changes,
            closed: AtomicBool::new(false),
        })
    }

    /// Get database path (for diagnostics).
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn check_open(&self) -> StorageResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StorageError::Closed);
        }
        Ok(())
    }

    async fn write_rows(&self, rows: Vec<BulkWriteRow>, context: &str) -> StorageResult<BulkWriteResponse> {
        self.check_open()?;
        let encoded = rows
            .into_iter()
            .map(|row| {
                let data = serde_json::to_string(&row.document.data)?;
                Ok(EncodedRow { row, data })
            })
            .collect::<StorageResult<Vec<_>>>()?;

        let mut encoded = encoded;
        let _guard = self.write_lock.lock().await;
        // Stamped under the write lock so `(lwt, id)` scans follow commit order
        for row in &mut encoded {
            row.row.document.meta = DocumentMeta::now();
        }
        let pool = &self.pool;
        let rows = &encoded;
        let outcome = execute_with_retry("bulk_write", || write_transaction(pool, rows)).await?;

        if let Some(last) = outcome.events.last() {
            let checkpoint = LwtCheckpoint::of(&last.document).into_checkpoint();
            let _ = self.changes.send(Arc::new(ChangeEventBulk {
                events: outcome.events,
                checkpoint,
                context: context.to_string(),
            }));
        }

        debug!(
            storage = %self.name,
            context,
            written = outcome.response.success.len(),
            conflicts = outcome.response.error.len(),
            "Bulk write"
        );
        Ok(outcome.response)
    }

    async fn find_by_id(&self, ids: Vec<String>, include_deleted: bool) -> StorageResult<HashMap<String, StoredDocument>> {
        self.check_open()?;
        let pool = &self.pool;
        let sql = format!("{} WHERE id = ?", SELECT_COLUMNS);
        let mut out = HashMap::with_capacity(ids.len());

        for id in &ids {
            let row: Option<DocumentRow> = execute_with_retry("find_by_id", || async {
                sqlx::query_as::<_, DocumentRow>(&sql).bind(id).fetch_optional(pool).await
            })
            .await?;
            if let Some(doc) = row.map(decode_row).transpose()? {
                if include_deleted || !doc.deleted {
                    out.insert(doc.id.clone(), doc);
                }
            }
        }
        Ok(out)
    }

    async fn load_all(&self, include_deleted: bool) -> StorageResult<Vec<StoredDocument>> {
        self.check_open()?;
        let pool = &self.pool;
        let sql = if include_deleted {
            SELECT_COLUMNS.to_string()
        } else {
            format!("{} WHERE deleted = 0", SELECT_COLUMNS)
        };
        let rows: Vec<DocumentRow> = execute_with_retry("query", || async {
            sqlx::query_as::<_, DocumentRow>(&sql).fetch_all(pool).await
        })
        .await?;
        Ok(rows.into_iter().map(decode_row).collect::<std::result::Result<_, _>>()?)
    }

    async fn changed_since(&self, limit: usize, checkpoint: Option<Checkpoint>) -> StorageResult<ChangedDocuments> {
        self.check_open()?;
        let position = checkpoint.as_ref().map(LwtCheckpoint::parse).transpose()?;
        let pool = &self.pool;
        let limit_i64 = i64::try_from(limit).unwrap_or(i64::MAX);

        let rows: Vec<DocumentRow> = match position.as_ref() {
            Some(p) => {
                let sql = format!(
                    "{} WHERE lwt > ?1 OR (lwt = ?1 AND id > ?2) ORDER BY lwt, id LIMIT ?3",
                    SELECT_COLUMNS
                );
                execute_with_retry("changed_since", || async {
                    sqlx::query_as::<_, DocumentRow>(&sql)
                        .bind(p.lwt)
                        .bind(&p.id)
                        .bind(limit_i64)
                        .fetch_all(pool)
                        .await
                })
                .await?
            }
            None => {
                let sql = format!("{} ORDER BY lwt, id LIMIT ?1", SELECT_COLUMNS);
                execute_with_retry("changed_since", || async {
                    sqlx::query_as::<_, DocumentRow>(&sql).bind(limit_i64).fetch_all(pool).await
                })
                .await?
            }
        };

        let documents: Vec<StoredDocument> = rows
            .into_iter()
            .map(decode_row)
            .collect::<std::result::Result<_, _>>()?;
        let checkpoint = match documents.last() {
            Some(last) => Some(LwtCheckpoint::of(last).into_checkpoint()),
            None => checkpoint,
        };
        Ok(ChangedDocuments { documents, checkpoint })
    }

    async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let pool = &self.pool;
        if let Err(e) = execute_with_retry("wal_checkpoint", || async {
            sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)").execute(pool).await
        })
        .await
        {
            warn!(storage = %self.name, error = %e, "Failed to checkpoint WAL on close");
        }
        self.pool.close().await;
        info!(storage = %self.name, "SQLite storage closed");
    }
}

impl std::fmt::Debug for SqliteStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStorage")
            .field("name", &self.name)
            .field("path", &self.path)
            .finish()
    }
}

impl StorageInstance for SqliteStorage {
    fn name(&self) -> &str {
        &self.name
    }

    fn bulk_write(&self, rows: Vec<BulkWriteRow>, context: &str) -> BoxFuture<'_, BulkWriteResponse> {
        let context = context.to_string();
        Box::pin(async move { self.write_rows(rows, &context).await })
    }

    fn find_documents_by_id(
        &self,
        ids: &[String],
        include_deleted: bool,
    ) -> BoxFuture<'_, HashMap<String, StoredDocument>> {
        let ids = ids.to_vec();
        Box::pin(async move { self.find_by_id(ids, include_deleted).await })
    }

    fn query(&self, query: &Query) -> BoxFuture<'_, Vec<StoredDocument>> {
        let query = query.clone();
        Box::pin(async move {
            let docs = self.load_all(query.include_deleted).await?;
            Ok(query.apply(docs))
        })
    }

    fn count(&self, query: &Query) -> BoxFuture<'_, usize> {
        let query = query.clone();
        Box::pin(async move {
            let docs = self.load_all(query.include_deleted).await?;
            Ok(docs.iter().filter(|d| query.matches(d)).count())
        })
    }

    fn compare_checkpoints(&self, a: &Checkpoint, b: &Checkpoint) -> Option<std::cmp::Ordering> {
        LwtCheckpoint::compare(a, b)
    }

    fn get_changed_documents_since(
        &self,
        limit: usize,
        checkpoint: Option<&Checkpoint>,
    ) -> BoxFuture<'_, ChangedDocuments> {
        let checkpoint = checkpoint.cloned();
        Box::pin(async move { self.changed_since(limit, checkpoint).await })
    }

    fn change_stream(&self) -> broadcast::Receiver<Arc<ChangeEventBulk>> {
        self.changes.subscribe()
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.shutdown().await;
            Ok(())
        })
    }

    fn remove(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if !self.closed.load(Ordering::SeqCst) {
                let _guard = self.write_lock.lock().await;
                let pool = &self.pool;
                execute_with_retry("remove", || async {
                    sqlx::query("DELETE FROM documents").execute(pool).await
                })
                .await?;
            }
            self.shutdown().await;

            for suffix in ["", "-wal", "-shm"] {
                let mut file = self.path.clone().into_os_string();
                file.push(suffix);
                match std::fs::remove_file(&file) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(StorageError::Backend(format!("remove {:?}: {}", file, e))),
                }
            }
            info!(storage = %self.name, "SQLite storage removed");
            Ok(())
        })
    }
}
