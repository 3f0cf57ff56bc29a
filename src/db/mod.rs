mod schema;
pub mod clusters;
pub mod corrections;
pub mod faces;
pub mod locks;
pub mod photos;
pub mod runs;

use rusqlite::{Connection, OptionalExtension, Transaction, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::Result;

pub use schema::SCHEMA;
pub use clusters::{ClusterDetail, ClusterSummary};
pub use corrections::{Correction, CorrectionKind};
pub use faces::{BoundingBox, Face, FaceWithPhoto};
pub use locks::RunLock;
pub use photos::{Photo, PhotoIdentity, Registration, Stats};
pub use runs::ClusteringRun;

/// Writers wait at most this long for each other before failing with SQLITE_BUSY.
const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

const EMBEDDING_DIM_KEY: &str = "embedding_dim";

const MAX_NAME_LEN: usize = 100;

/// A connection to the face library database.
///
/// `Database` is not `Sync`; every thread that needs the store opens its own
/// connection with [`Database::open`]. Concurrency between connections is
/// handled by SQLite in WAL mode.
pub struct Database {
    conn: Connection,
    path: Option<PathBuf>,
}

impl Database {
    /// Open (or create) the database file at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        if !mode.eq_ignore_ascii_case("wal") {
            tracing::warn!(mode = %mode, "WAL journal mode unavailable");
        }
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Ok(Self {
            conn,
            path: Some(path.to_path_buf()),
        })
    }

    /// Open a private in-memory database (tests and dry runs).
    ///
    /// An in-memory database cannot be shared with ingestion workers.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(Self { conn, path: None })
    }

    pub fn initialize(&self) -> Result<()> {
        self.conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    /// Path of the database file, `None` for in-memory databases.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Begin a deferred transaction. Used for consistent multi-statement reads.
    pub(crate) fn read_transaction(&self) -> Result<Transaction<'_>> {
        Ok(Transaction::new_unchecked(&self.conn, TransactionBehavior::Deferred)?)
    }

    /// Begin a write transaction that takes the database write lock up front.
    pub(crate) fn write_transaction(&self) -> Result<Transaction<'_>> {
        Ok(Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)?)
    }

    // ========================================================================
    // Settings
    // ========================================================================

    /// The embedding dimension fixed for this dataset, once any face exists.
    pub fn embedding_dim(&self) -> Result<Option<usize>> {
        embedding_dim(&self.conn)
    }

    /// Delete every row in every table. The schema is kept.
    pub fn reset(&self) -> Result<()> {
        let tx = self.write_transaction()?;
        for table in schema::RESET_TABLES {
            tx.execute(&format!("DELETE FROM {}", table), [])?;
        }
        tx.commit()?;
        tracing::warn!("Face library reset");
        Ok(())
    }
}

pub(crate) fn embedding_dim(conn: &Connection) -> Result<Option<usize>> {
    let value: Option<String> = conn
        .query_row(
            "SELECT value FROM settings WHERE key = ?",
            [EMBEDDING_DIM_KEY],
            |row| row.get(0),
        )
        .optional()?;

    match value {
        Some(v) => v.parse::<usize>().map(Some).map_err(|_| {
            crate::Error::Corruption(format!("stored embedding dimension {:?} is not a number", v))
        }),
        None => Ok(None),
    }
}

/// Trim a person or cluster name and check it is 1 to 100 characters.
pub(crate) fn validate_name(name: &str) -> Result<String> {
    let name = name.trim();
    let len = name.chars().count();
    if len == 0 || len > MAX_NAME_LEN {
        return Err(crate::Error::Validation(format!(
            "name must be 1 to {} characters, got {}",
            MAX_NAME_LEN, len
        )));
    }
    Ok(name.to_string())
}

pub(crate) fn set_embedding_dim(conn: &Connection, dim: usize) -> Result<()> {
    conn.execute(
        "INSERT INTO settings (key, value) VALUES (?, ?)",
        rusqlite::params![EMBEDDING_DIM_KEY, dim.to_string()],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_open_creates_parent_and_schema() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("faces.db");
        let db = Database::open(&path).unwrap();
        db.initialize().unwrap();
        // Idempotent
        db.initialize().unwrap();

        assert!(path.exists());
        assert_eq!(db.path(), Some(path.as_path()));
        assert_eq!(db.embedding_dim().unwrap(), None);
    }

    #[test]
    fn test_embedding_dim_roundtrip_and_corruption() {
        let db = Database::open_in_memory().unwrap();
        db.initialize().unwrap();

        set_embedding_dim(db.conn(), 128).unwrap();
        assert_eq!(db.embedding_dim().unwrap(), Some(128));

        db.conn()
            .execute("UPDATE settings SET value = 'abc' WHERE key = 'embedding_dim'", [])
            .unwrap();
        assert!(matches!(db.embedding_dim(), Err(crate::Error::Corruption(_))));
    }

    #[test]
    fn test_validate_name() {
        assert_eq!(validate_name("  Alice ").unwrap(), "Alice");
        assert!(validate_name("   ").is_err());
        assert!(validate_name(&"x".repeat(100)).is_ok());
        assert!(matches!(
            validate_name(&"x".repeat(101)),
            Err(crate::Error::Validation(_))
        ));
    }
}
