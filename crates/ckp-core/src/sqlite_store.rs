//! SQLite-backed document and queue storage.
//!
//! Documents live in one table keyed by id with a revision column; the
//! compare-and-swap write runs inside a transaction. Queued calls are rows
//! in an autoincrement table so sequence numbers survive restarts and are
//! never reused.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::queue::QueueItem;
use crate::store::{Document, DocumentBackend, QueueStore, Revision, Seq, StoreError};

// ============================================================================
// Schema Version
// ============================================================================

/// Current schema version for migrations.
/// Increment this when adding new migrations.
const SCHEMA_VERSION: i32 = 1;

fn op_err(context: &str, e: rusqlite::Error) -> StoreError {
    StoreError::OperationFailed(format!("{}: {}", context, e))
}

// ============================================================================
// SQLite Store Implementation
// ============================================================================

/// SQLite-based persistent store implementation.
///
/// Provides durable storage for pool documents and queued calls with:
/// - Revision-checked writes inside transactions
/// - Schema migrations for version upgrades
/// - Thread-safe access via Mutex
#[derive(Clone)]
pub struct SqliteStore {
    /// SQLite connection wrapped in a mutex for thread-safe access
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) a store at `path` and run migrations.
    ///
    /// # Arguments
    /// * `path` - Path to the SQLite database file
    ///
    /// # Returns
    /// * `Ok(SqliteStore)` on success
    /// * `Err(StoreError)` if database creation or migration fails
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path).map_err(|e| op_err("failed to open database", e))?;

        // Enable WAL mode for better concurrent access
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(|e| op_err("failed to set pragmas", e))?;

        Self::run_migrations(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create a new in-memory SQLite store for testing.
    pub fn new_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| op_err("failed to open in-memory database", e))?;

        Self::run_migrations(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run database migrations to ensure schema is up to date.
    fn run_migrations(conn: &Connection) -> Result<(), StoreError> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY
            )",
            [],
        )
        .map_err(|e| op_err("failed to create schema_version", e))?;

        let current_version: i32 = conn
            .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_version", [], |row| {
                row.get(0)
            })
            .map_err(|e| op_err("failed to read schema version", e))?;

        if current_version < 1 {
            Self::migrate_v1(conn)?;
        }
        debug_assert!(current_version <= SCHEMA_VERSION);

        Ok(())
    }

    /// Migration to schema version 1 - initial schema.
    fn migrate_v1(conn: &Connection) -> Result<(), StoreError> {
        conn.execute_batch(
            r#"
            -- Pool and ledger documents
            CREATE TABLE IF NOT EXISTS documents (
                id TEXT PRIMARY KEY,
                revision INTEGER NOT NULL,
                body TEXT NOT NULL
            );

            -- Offline call queue
            CREATE TABLE IF NOT EXISTS queue_items (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                item TEXT NOT NULL
            );

            INSERT INTO schema_version (version) VALUES (1);
            "#,
        )
        .map_err(|e| op_err("migration v1 failed", e))
    }

    /// Get the current schema version.
    pub async fn schema_version(&self) -> Result<i32, StoreError> {
        let conn = self.conn.lock().await;
        conn.query_row("SELECT COALESCE(MAX(version), 0) FROM schema_version", [], |row| {
            row.get(0)
        })
        .map_err(|e| op_err("failed to read schema version", e))
    }
}

#[async_trait]
impl DocumentBackend for SqliteStore {
    async fn load(&self, id: &str) -> Result<Option<Document>, StoreError> {
        let conn = self.conn.lock().await;
        let row: Option<(i64, String)> = conn
            .query_row(
                "SELECT revision, body FROM documents WHERE id = ?1",
                params![id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(|e| op_err("failed to load document", e))?;

        match row {
            Some((revision, body)) => Ok(Some(Document {
                id: id.to_string(),
                revision: revision as Revision,
                body: serde_json::from_str(&body)?,
            })),
            None => Ok(None),
        }
    }

    async fn write(
        &self,
        id: &str,
        body: Value,
        expected: Option<Revision>,
    ) -> Result<Revision, StoreError> {
        let body = serde_json::to_string(&body)?;
        let mut conn = self.conn.lock().await;
        let tx = conn
            .transaction()
            .map_err(|e| op_err("failed to begin transaction", e))?;

        let found: Option<Revision> = tx
            .query_row(
                "SELECT revision FROM documents WHERE id = ?1",
                params![id],
                |row| row.get::<_, i64>(0),
            )
            .optional()
            .map_err(|e| op_err("failed to read revision", e))?
            .map(|r| r as Revision);

        if let Some(expected) = expected {
            if found != Some(expected) {
                return Err(StoreError::Conflict {
                    id: id.to_string(),
                    expected,
                    found,
                });
            }
        }

        let revision = found.map_or(1, |r| r + 1);
        tx.execute(
            "INSERT INTO documents (id, revision, body) VALUES (?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET revision = excluded.revision, body = excluded.body",
            params![id, revision as i64, body],
        )
        .map_err(|e| op_err("failed to write document", e))?;
        tx.commit().map_err(|e| op_err("failed to commit", e))?;

        Ok(revision)
    }

    async fn remove(&self, id: &str) -> Result<bool, StoreError> {
        let conn = self.conn.lock().await;
        let removed = conn
            .execute("DELETE FROM documents WHERE id = ?1", params![id])
            .map_err(|e| op_err("failed to delete document", e))?;
        Ok(removed > 0)
    }
}

#[async_trait]
impl QueueStore for SqliteStore {
    async fn append(&self, item: QueueItem) -> Result<Seq, StoreError> {
        let item = serde_json::to_string(&item)?;
        let conn = self.conn.lock().await;
        conn.execute("INSERT INTO queue_items (item) VALUES (?1)", params![item])
            .map_err(|e| op_err("failed to append queue item", e))?;
        Ok(conn.last_insert_rowid() as Seq)
    }

    async fn pending(&self) -> Result<Vec<(Seq, QueueItem)>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare("SELECT seq, item FROM queue_items ORDER BY seq ASC")
            .map_err(|e| op_err("failed to prepare queue query", e))?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)))
            .map_err(|e| op_err("failed to query queue", e))?;

        let mut items = Vec::new();
        for row in rows {
            let (seq, item) = row.map_err(|e| op_err("failed to read queue row", e))?;
            items.push((seq as Seq, serde_json::from_str(&item)?));
        }
        Ok(items)
    }

    async fn remove(&self, seq: Seq) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute("DELETE FROM queue_items WHERE seq = ?1", params![seq as i64])
            .map_err(|e| op_err("failed to remove queue item", e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::QueuedCall;
    use crate::store::{DocumentStore, SaveOptions};
    use serde_json::json;

    fn fetch(peer: &str) -> QueueItem {
        QueueItem::new(
            QueuedCall::FetchIdentityRecords {
                peer_id: peer.to_string(),
            },
            true,
        )
    }

    #[tokio::test]
    async fn test_schema_version() {
        let store = SqliteStore::new_in_memory().unwrap();
        assert_eq!(store.schema_version().await.unwrap(), SCHEMA_VERSION);
    }

    #[tokio::test]
    async fn test_document_cas() {
        let store = SqliteStore::new_in_memory().unwrap();
        assert_eq!(store.write("doc", json!({"a": 1}), None).await.unwrap(), 1);
        assert_eq!(store.write("doc", json!({"a": 2}), Some(1)).await.unwrap(), 2);

        let err = store.write("doc", json!({"a": 3}), Some(1)).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict { found: Some(2), .. }));

        let doc = store.load("doc").await.unwrap().unwrap();
        assert_eq!(doc.revision, 2);
        assert_eq!(doc.body, json!({"a": 2}));
    }

    #[tokio::test]
    async fn test_cas_on_missing_document_conflicts() {
        let store = SqliteStore::new_in_memory().unwrap();
        let err = store.write("doc", json!(1), Some(3)).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict { found: None, .. }));
    }

    #[tokio::test]
    async fn test_document_store_over_sqlite() {
        let store = DocumentStore::new(Arc::new(SqliteStore::new_in_memory().unwrap()));
        store.save("doc", json!({"a": 1}), SaveOptions::default()).await.unwrap();
        store.save("doc", json!({"b": 2}), SaveOptions::default()).await.unwrap();
        assert_eq!(store.get("doc").await.unwrap().body, json!({"a": 1, "b": 2}));
        assert!(store.delete("doc").await.unwrap());
    }

    #[tokio::test]
    async fn test_queue_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ckp.db");

        {
            let store = SqliteStore::new(&path).unwrap();
            store.append(fetch("a")).await.unwrap();
            let b = store.append(fetch("b")).await.unwrap();
            store.append(fetch("c")).await.unwrap();
            QueueStore::remove(&store, b).await.unwrap();
        }

        let store = SqliteStore::new(&path).unwrap();
        let peers: Vec<String> = store
            .pending()
            .await
            .unwrap()
            .into_iter()
            .map(|(_, item)| item.call.peer_id().to_string())
            .collect();
        assert_eq!(peers, vec!["a", "c"]);

        // Autoincrement never hands out a removed sequence again.
        assert_eq!(store.append(fetch("d")).await.unwrap(), 4);
    }
}
