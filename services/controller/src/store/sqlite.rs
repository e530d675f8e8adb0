//! SQLite-backed record store.
//!
//! Each record kind has its own table holding the JSON-encoded record plus
//! its parent and root keys, so children and whole template subtrees can be
//! listed without decoding unrelated rows.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use thiserror::Error;
use tracing::debug;

use super::records::Record;

/// Errors from store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("record encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("store lock poisoned")]
    Poisoned,
}

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS templates (
        key TEXT PRIMARY KEY,
        parent TEXT,
        root TEXT,
        record TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS revisions (
        key TEXT PRIMARY KEY,
        parent TEXT,
        root TEXT,
        record TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_revisions_parent ON revisions(parent);

    CREATE TABLE IF NOT EXISTS managers (
        key TEXT PRIMARY KEY,
        parent TEXT,
        root TEXT,
        record TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_managers_parent ON managers(parent);
    CREATE INDEX IF NOT EXISTS idx_managers_root ON managers(root);

    CREATE TABLE IF NOT EXISTS instances (
        key TEXT PRIMARY KEY,
        parent TEXT,
        root TEXT,
        record TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_instances_parent ON instances(parent);
"#;

/// Durable store for hierarchy records.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open or create a store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;

        // Enable WAL mode for better concurrency
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Open an in-memory store (for testing and one-shot runs).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let store = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        self.lock()?.execute_batch(SCHEMA)?;
        debug!("Record store schema initialized");
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    /// Run `f` inside an immediate transaction.
    ///
    /// The transaction commits if `f` returns `Ok` and rolls back otherwise,
    /// so a failed operation never leaves a partial update behind.
    pub fn transaction<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&Tx<'_>) -> Result<T, E>,
        E: From<StoreError>,
    {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(StoreError::from)?;
        let handle = Tx { tx };

        let value = f(&handle)?;
        handle.tx.commit().map_err(StoreError::from)?;
        Ok(value)
    }

    /// Read a single record outside of a transaction.
    pub fn get<R: Record>(&self, key: &R::Key) -> Result<Option<R>, StoreError> {
        let conn = self.lock()?;
        get_record(&conn, key)
    }

    /// List every record of a kind, ordered by key.
    pub fn list<R: Record>(&self) -> Result<Vec<R>, StoreError> {
        let conn = self.lock()?;
        query_records(
            &conn,
            &format!("SELECT record FROM {} ORDER BY key", R::TABLE),
            None,
        )
    }

    /// List the records that belong to the template subtree rooted at `root`.
    pub fn list_under<R: Record>(
        &self,
        root: &impl std::fmt::Display,
    ) -> Result<Vec<R>, StoreError> {
        let conn = self.lock()?;
        query_records(
            &conn,
            &format!(
                "SELECT record FROM {} WHERE root = ?1 ORDER BY key",
                R::TABLE
            ),
            Some(&root.to_string()),
        )
    }
}

/// A transaction handle passed to [`Store::transaction`] closures.
pub struct Tx<'a> {
    tx: rusqlite::Transaction<'a>,
}

impl Tx<'_> {
    /// Read a record.
    pub fn get<R: Record>(&self, key: &R::Key) -> Result<Option<R>, StoreError> {
        get_record(&self.tx, key)
    }

    /// Insert or replace a record.
    pub fn put<R: Record>(&self, record: &R) -> Result<(), StoreError> {
        let encoded = serde_json::to_string(record)?;
        self.tx.execute(
            &format!(
                r#"
                INSERT INTO {} (key, parent, root, record)
                VALUES (?1, ?2, ?3, ?4)
                ON CONFLICT(key) DO UPDATE SET
                    parent = excluded.parent,
                    root = excluded.root,
                    record = excluded.record
                "#,
                R::TABLE
            ),
            params![
                record.key().to_string(),
                record.parent(),
                record.root(),
                encoded
            ],
        )?;
        Ok(())
    }

    /// Delete a record. Returns true if it existed.
    pub fn delete<R: Record>(&self, key: &R::Key) -> Result<bool, StoreError> {
        let rows = self.tx.execute(
            &format!("DELETE FROM {} WHERE key = ?1", R::TABLE),
            params![key.to_string()],
        )?;
        Ok(rows > 0)
    }
}

fn get_record<R: Record>(conn: &Connection, key: &R::Key) -> Result<Option<R>, StoreError> {
    let encoded: Option<String> = conn
        .query_row(
            &format!("SELECT record FROM {} WHERE key = ?1", R::TABLE),
            params![key.to_string()],
            |row| row.get(0),
        )
        .optional()?;

    match encoded {
        Some(encoded) => Ok(Some(serde_json::from_str(&encoded)?)),
        None => Ok(None),
    }
}

fn query_records<R: Record>(
    conn: &Connection,
    sql: &str,
    param: Option<&str>,
) -> Result<Vec<R>, StoreError> {
    let mut stmt = conn.prepare(sql)?;
    let rows = match param {
        Some(param) => stmt
            .query_map(params![param], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?,
        None => stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?,
    };

    rows.iter()
        .map(|encoded| serde_json::from_str(encoded).map_err(StoreError::from))
        .collect()
}
