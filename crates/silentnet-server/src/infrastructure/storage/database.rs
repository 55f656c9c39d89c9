//! The single SQLite connection shared by every session thread.
//!
//! All access goes through one [`parking_lot::ReentrantMutex`]: an operation
//! may call other storage operations while holding the lock (the erase-all
//! and delete-client flows do), and the nested calls join the outer
//! transaction instead of deadlocking or starting a second one.

use std::path::Path;

use parking_lot::{ReentrantMutex, ReentrantMutexGuard};
use rusqlite::Connection;
use thiserror::Error;
use tracing::{debug, error};

/// Errors raised by the storage layer.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to open database at {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: rusqlite::Error,
    },

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS uid (
    id                INTEGER PRIMARY KEY AUTOINCREMENT,
    mac               TEXT    NOT NULL UNIQUE,
    hostname          TEXT    NOT NULL UNIQUE,
    original_hostname TEXT    NOT NULL
);
CREATE TABLE IF NOT EXISTS logs (
    id    INTEGER NOT NULL REFERENCES uid(id),
    type  TEXT    NOT NULL,
    data  BLOB    NOT NULL,
    count INTEGER NOT NULL DEFAULT 1
);
CREATE INDEX IF NOT EXISTS logs_id_type ON logs (id, type);
CREATE UNIQUE INDEX IF NOT EXISTS logs_id_type_data ON logs (id, type, data);
";

/// Owner of the SQLite connection.
pub struct Database {
    conn: ReentrantMutex<Connection>,
}

impl Database {
    /// Opens (or creates) the database file at `path` and ensures the schema.
    ///
    /// The special path `":memory:"` opens a private in-memory database.
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        let conn = if path.as_os_str() == ":memory:" {
            Connection::open_in_memory()
        } else {
            Connection::open(path)
        }
        .map_err(|source| StorageError::Open {
            path: path.display().to_string(),
            source,
        })?;
        Self::with_connection(conn)
    }

    pub fn in_memory() -> Result<Self, StorageError> {
        Self::open(Path::new(":memory:"))
    }

    fn with_connection(conn: Connection) -> Result<Self, StorageError> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: ReentrantMutex::new(conn),
        })
    }

    /// Holds the connection lock for the lifetime of the guard so that a
    /// sequence of operations runs without interleaving with other threads.
    pub fn hold(&self) -> ReentrantMutexGuard<'_, Connection> {
        self.conn.lock()
    }

    /// Runs `op` inside a transaction, committing on success and rolling back
    /// on error.  When called while an outer transaction is open on this
    /// thread, `op` simply joins it.
    pub fn transaction<T, F>(&self, label: &str, op: F) -> Result<T, StorageError>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T>,
    {
        let conn = self.conn.lock();
        let result = in_transaction(&conn, op);
        if let Err(e) = &result {
            error!(operation = label, error = %e, "storage operation failed; rolled back");
        }
        result.map_err(StorageError::from)
    }

    /// Like [`transaction`](Self::transaction) but swallows the error
    /// (already logged) and returns `T::default()`.
    pub fn run<T, F>(&self, label: &str, op: F) -> T
    where
        T: Default,
        F: FnOnce(&Connection) -> rusqlite::Result<T>,
    {
        self.transaction(label, op).unwrap_or_default()
    }

    /// Reclaims space after bulk deletes.  Skipped while a transaction is
    /// open, since SQLite refuses to vacuum inside one.
    pub fn vacuum(&self) {
        let conn = self.conn.lock();
        if !conn.is_autocommit() {
            debug!("vacuum deferred: transaction in progress");
            return;
        }
        if let Err(e) = conn.execute_batch("VACUUM") {
            error!(error = %e, "vacuum failed");
        }
    }
}

fn in_transaction<T, F>(conn: &Connection, op: F) -> rusqlite::Result<T>
where
    F: FnOnce(&Connection) -> rusqlite::Result<T>,
{
    if !conn.is_autocommit() {
        return op(conn);
    }
    let tx = conn.unchecked_transaction()?;
    // Dropping `tx` on the error path rolls back.
    let value = op(&tx)?;
    tx.commit()?;
    Ok(value)
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").finish_non_exhaustive()
    }
}
