//! SQLite-backed document store.
//!
//! Each collection is a table `(id TEXT PRIMARY KEY, body TEXT NOT NULL)`
//! where `body` holds the JSON document. Filters are evaluated in process
//! so that all backends share one matching implementation.

use super::{apply_patch, Document, Filter, Patch, RecordStore, UpdateResult};
use crate::error::{RelayError, Result};
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

/// Record store persisted in a SQLite database file.
pub struct SqliteRecordStore {
    db_path: PathBuf,
    conn: Arc<Mutex<Connection>>,
}

impl SqliteRecordStore {
    /// Create or open a store at the given path.
    pub fn open(db_path: impl Into<PathBuf>) -> Result<Self> {
        let db_path = db_path.into();

        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| RelayError::io_with_path(e, parent))?;
            }
        }

        let conn = Connection::open(&db_path)?;
        Self::configure_connection(&conn)?;
        info!("Opened record store at {}", db_path.display());

        Ok(Self {
            db_path,
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open a private in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            db_path: PathBuf::from(":memory:"),
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn configure_connection(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "
            PRAGMA journal_mode=WAL;
            PRAGMA busy_timeout=30000;
            PRAGMA synchronous=NORMAL;
            ",
        )?;
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| RelayError::Database {
            message: "Failed to acquire connection lock".to_string(),
        })
    }

    /// Create the table backing a collection if needed.
    pub fn create_collection(&self, collection: &str) -> Result<()> {
        let table = quote_table(collection)?;
        let conn = self.lock()?;
        conn.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS {} (id TEXT PRIMARY KEY, body TEXT NOT NULL)",
                table
            ),
            [],
        )?;
        Ok(())
    }

    /// Insert or replace a document.
    pub fn insert(&self, collection: &str, id: &str, body: &Value) -> Result<()> {
        self.create_collection(collection)?;
        let table = quote_table(collection)?;
        let conn = self.lock()?;
        conn.execute(
            &format!(
                "INSERT INTO {} (id, body) VALUES (?1, ?2)
                 ON CONFLICT(id) DO UPDATE SET body = excluded.body",
                table
            ),
            params![id, serde_json::to_string(body)?],
        )?;
        Ok(())
    }

    fn table_exists(conn: &Connection, collection: &str) -> Result<bool> {
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
            [collection],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    fn load_documents(&self, collection: &str) -> Result<Vec<Document>> {
        let table = quote_table(collection)?;
        let conn = self.lock()?;
        if !Self::table_exists(&conn, collection)? {
            return Ok(Vec::new());
        }

        let mut stmt = conn.prepare(&format!("SELECT id, body FROM {} ORDER BY rowid", table))?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut docs = Vec::new();
        for row in rows {
            let (id, body) = row?;
            docs.push(Document::new(id, serde_json::from_str(&body)?));
        }
        Ok(docs)
    }
}

/// Quote a collection name as a table identifier.
///
/// Only names made of ASCII alphanumerics, `_`, `-` and `.` are accepted.
fn quote_table(collection: &str) -> Result<String> {
    let valid = !collection.is_empty()
        && collection
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if !valid || collection.starts_with("sqlite_") {
        return Err(RelayError::UnknownCollection(collection.to_string()));
    }
    Ok(format!("\"{}\"", collection))
}

#[async_trait]
impl RecordStore for SqliteRecordStore {
    async fn find_by_filter(&self, collection: &str, filter: &Filter) -> Result<Vec<Document>> {
        let docs = self.load_documents(collection)?;
        Ok(docs.into_iter().filter(|d| filter.matches(&d.body)).collect())
    }

    async fn find_by_id(&self, collection: &str, id: &str) -> Result<Option<Document>> {
        let table = quote_table(collection)?;
        let conn = self.lock()?;
        if !Self::table_exists(&conn, collection)? {
            return Ok(None);
        }

        let body: Option<String> = conn
            .query_row(
                &format!("SELECT body FROM {} WHERE id = ?1", table),
                [id],
                |row| row.get(0),
            )
            .optional()?;

        match body {
            Some(b) => Ok(Some(Document::new(id, serde_json::from_str(&b)?))),
            None => Ok(None),
        }
    }

    async fn update_by_id(
        &self,
        collection: &str,
        id: &str,
        patch: &Patch,
    ) -> Result<UpdateResult> {
        let Some(mut doc) = self.find_by_id(collection, id).await? else {
            return Ok(UpdateResult::default());
        };

        if !apply_patch(&mut doc.body, patch) {
            return Ok(UpdateResult {
                matched_count: 1,
                modified_count: 0,
            });
        }

        let table = quote_table(collection)?;
        let conn = self.lock()?;
        let changed = conn.execute(
            &format!("UPDATE {} SET body = ?1 WHERE id = ?2", table),
            params![serde_json::to_string(&doc.body)?, id],
        )?;
        debug!("Updated {}/{} ({} row)", collection, id, changed);

        Ok(UpdateResult {
            matched_count: 1,
            modified_count: changed as u64,
        })
    }

    async fn list_collections(&self) -> Result<Vec<String>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT name FROM sqlite_master
             WHERE type='table' AND name NOT LIKE 'sqlite_%'
             ORDER BY name",
        )?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(names)
    }

    async fn scan(&self, collection: &str) -> Result<Vec<Document>> {
        self.load_documents(collection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_insert_find_update() {
        let tmp = TempDir::new().unwrap();
        let store = SqliteRecordStore::open(tmp.path().join("records.db")).unwrap();
        store
            .insert("news", "n1", &json!({"image": "https://old/a.jpg"}))
            .unwrap();
        store.insert("posts", "p1", &json!({"photo": "x"})).unwrap();

        let found = store
            .find_by_filter("news", &Filter::contains("image", "a.jpg"))
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "n1");

        let mut patch = Patch::new();
        patch.insert("image".into(), json!("https://new/a.jpg"));
        let res = store.update_by_id("news", "n1", &patch).await.unwrap();
        assert_eq!(res.modified_count, 1);

        let res = store.update_by_id("news", "n1", &patch).await.unwrap();
        assert_eq!(res, UpdateResult { matched_count: 1, modified_count: 0 });

        let doc = store.find_by_id("news", "n1").await.unwrap().unwrap();
        assert_eq!(doc.body["image"], "https://new/a.jpg");

        assert_eq!(
            store.list_collections().await.unwrap(),
            vec!["news".to_string(), "posts".to_string()]
        );
    }

    #[tokio::test]
    async fn test_missing_collection_is_empty() {
        let store = SqliteRecordStore::open_in_memory().unwrap();
        assert!(store.scan("nothing").await.unwrap().is_empty());
        assert!(store.find_by_id("nothing", "x").await.unwrap().is_none());
        let res = store.update_by_id("nothing", "x", &Patch::new()).await.unwrap();
        assert_eq!(res.matched_count, 0);
    }

    #[test]
    fn test_rejects_unsafe_collection_names() {
        assert!(quote_table("news").is_ok());
        assert!(quote_table("news\"; DROP TABLE x; --").is_err());
        assert!(quote_table("sqlite_master").is_err());
        assert!(quote_table("").is_err());
    }
}
