//! Persistent storage substrate.
//!
//! One SQLite database under the user's application-data directory holds
//! both the fingerprint cache and all session state. The database runs in
//! WAL mode with `synchronous=NORMAL`: readers never block on writers,
//! and a crash may lose the last batch of writes but never corrupts the
//! store.
//!
//! Every worker thread gets its own [`StoreHandle`]; the owning [`Store`]
//! tracks handles weakly so a single [`Store::close_all`] at shutdown
//! deterministically releases every connection.

pub mod fingerprint;
pub mod session;

use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Weak};
use thiserror::Error;

pub use fingerprint::{Fingerprint, FingerprintRow, FingerprintStore};
pub use session::{
    HashKind, ScanStage, SessionHashRow, SessionId, SessionRecord, SessionStatus, SessionStore,
};

/// Current schema version recorded in the `meta` table.
pub const SCHEMA_VERSION: u32 = 2;

/// Errors raised by the storage layer.
#[derive(Debug, Error)]
pub enum StoreError {
    /// SQLite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Filesystem error while locating or creating the database.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The handle was closed by `close_all`.
    #[error("Store handle already closed")]
    HandleClosed,

    /// The on-disk schema is newer than this build understands.
    #[error("Unsupported schema version {found} (supported up to {supported})")]
    UnsupportedSchema {
        /// Version recorded in the store
        found: u32,
        /// Highest version this build can load
        supported: u32,
    },

    /// The platform application-data directory could not be determined.
    #[error("Could not determine application data directory")]
    NoDataDir,
}

/// Result type for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Shared database: path plus the registry of live handles.
#[derive(Debug)]
pub struct Store {
    path: PathBuf,
    handles: Mutex<Vec<Weak<StoreHandle>>>,
}

impl Store {
    /// Open (or create) the store at the given path and initialize the
    /// schema.
    ///
    /// # Errors
    ///
    /// Fails when the database cannot be created, or when the recorded
    /// schema version is newer than this build supports.
    pub fn open(path: &Path) -> StoreResult<Arc<Self>> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        configure_connection(&conn)?;
        init_schema(&conn)?;
        check_schema_version(&conn)?;
        drop(conn);

        Ok(Arc::new(Self {
            path: path.to_path_buf(),
            handles: Mutex::new(Vec::new()),
        }))
    }

    /// Open the store at the platform default location.
    ///
    /// # Errors
    ///
    /// See [`Store::open`]; additionally fails when the application-data
    /// directory cannot be determined.
    pub fn open_default() -> StoreResult<Arc<Self>> {
        Self::open(&Self::default_path()?)
    }

    /// Platform default database path under the application-data
    /// directory.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NoDataDir`] when the platform directory
    /// cannot be resolved.
    pub fn default_path() -> StoreResult<PathBuf> {
        let dirs = directories::ProjectDirs::from("io", "dupescan", "dupescan")
            .ok_or(StoreError::NoDataDir)?;
        Ok(dirs.data_local_dir().join("scan_cache.db"))
    }

    /// Filesystem location of the database.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Open a new connection handle for a worker thread.
    ///
    /// # Errors
    ///
    /// Fails when the connection cannot be opened or configured.
    pub fn handle(self: &Arc<Self>) -> StoreResult<Arc<StoreHandle>> {
        let conn = Connection::open(&self.path)?;
        configure_connection(&conn)?;

        let handle = Arc::new(StoreHandle {
            conn: Mutex::new(Some(conn)),
        });

        let mut handles = self.handles.lock().unwrap();
        handles.retain(|weak| weak.strong_count() > 0);
        handles.push(Arc::downgrade(&handle));

        Ok(handle)
    }

    /// Close every live handle. Subsequent operations on them return
    /// [`StoreError::HandleClosed`].
    pub fn close_all(&self) {
        let mut handles = self.handles.lock().unwrap();
        for weak in handles.drain(..) {
            if let Some(handle) = weak.upgrade() {
                handle.close();
            }
        }
    }

    /// Number of currently live handles (for tests and diagnostics).
    #[must_use]
    pub fn live_handles(&self) -> usize {
        self.handles
            .lock()
            .unwrap()
            .iter()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }
}

/// A per-worker connection slot.
pub struct StoreHandle {
    conn: Mutex<Option<Connection>>,
}

impl StoreHandle {
    /// Run a closure against the connection.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::HandleClosed`] after `close_all`, otherwise
    /// forwards the closure's database error.
    pub fn with<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> rusqlite::Result<T>,
    ) -> StoreResult<T> {
        let mut guard = self.conn.lock().unwrap();
        let conn = guard.as_mut().ok_or(StoreError::HandleClosed)?;
        Ok(f(conn)?)
    }

    /// Close this handle's connection.
    pub fn close(&self) {
        if let Some(conn) = self.conn.lock().unwrap().take() {
            if let Err((_conn, e)) = conn.close() {
                log::warn!("Failed to close store connection cleanly: {e}");
            }
        }
    }
}

fn configure_connection(conn: &Connection) -> rusqlite::Result<()> {
    // journal_mode returns a result row, so this goes through
    // execute_batch rather than pragma_update.
    conn.execute_batch(
        "PRAGMA journal_mode=WAL;
         PRAGMA synchronous=NORMAL;
         PRAGMA cache_size=-64000;",
    )?;
    conn.busy_timeout(std::time::Duration::from_secs(10))?;
    Ok(())
}

fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS meta (
            key TEXT PRIMARY KEY,
            value TEXT
        );

        CREATE TABLE IF NOT EXISTS file_hashes (
            path TEXT PRIMARY KEY,
            size INTEGER NOT NULL,
            mtime INTEGER NOT NULL,
            hash_partial TEXT,
            hash_full TEXT,
            last_seen INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_file_hashes_last_seen
            ON file_hashes(last_seen);

        CREATE TABLE IF NOT EXISTS sessions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            status TEXT NOT NULL,
            stage TEXT NOT NULL,
            config_json TEXT NOT NULL,
            config_hash TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            progress INTEGER NOT NULL DEFAULT 0,
            progress_message TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_sessions_status ON sessions(status);
        CREATE INDEX IF NOT EXISTS idx_sessions_config ON sessions(config_hash);

        CREATE TABLE IF NOT EXISTS session_files (
            session_id INTEGER NOT NULL,
            path TEXT NOT NULL,
            size INTEGER NOT NULL,
            mtime INTEGER NOT NULL,
            dev INTEGER NOT NULL DEFAULT 0,
            ino INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (session_id, path)
        );
        CREATE INDEX IF NOT EXISTS idx_session_files_session
            ON session_files(session_id);

        CREATE TABLE IF NOT EXISTS session_hashes (
            session_id INTEGER NOT NULL,
            path TEXT NOT NULL,
            size INTEGER NOT NULL,
            mtime INTEGER NOT NULL,
            hash_type TEXT NOT NULL,
            hash_value TEXT NOT NULL,
            PRIMARY KEY (session_id, path, hash_type)
        );
        CREATE INDEX IF NOT EXISTS idx_session_hashes_session_type
            ON session_hashes(session_id, hash_type);

        CREATE TABLE IF NOT EXISTS session_results (
            session_id INTEGER NOT NULL,
            group_key TEXT NOT NULL,
            path TEXT NOT NULL,
            PRIMARY KEY (session_id, group_key, path)
        );
        CREATE INDEX IF NOT EXISTS idx_session_results_session
            ON session_results(session_id);

        CREATE TABLE IF NOT EXISTS session_selected (
            session_id INTEGER NOT NULL,
            path TEXT NOT NULL,
            selected INTEGER NOT NULL DEFAULT 1,
            PRIMARY KEY (session_id, path)
        );

        CREATE TABLE IF NOT EXISTS scheduled_jobs (
            name TEXT PRIMARY KEY,
            enabled INTEGER NOT NULL DEFAULT 0,
            schedule TEXT NOT NULL DEFAULT 'daily',
            time_hhmm TEXT NOT NULL DEFAULT '03:00',
            config_json TEXT NOT NULL DEFAULT '{}',
            last_run_at INTEGER,
            next_run_at INTEGER,
            last_status TEXT,
            updated_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS scheduled_runs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            job_name TEXT NOT NULL,
            started_at INTEGER NOT NULL,
            finished_at INTEGER,
            status TEXT NOT NULL,
            message TEXT,
            session_id INTEGER
        );
        CREATE INDEX IF NOT EXISTS idx_scheduled_runs_job
            ON scheduled_runs(job_name, started_at DESC);
        ",
    )?;

    conn.execute(
        "INSERT OR IGNORE INTO meta (key, value) VALUES ('schema_version', ?1)",
        [SCHEMA_VERSION.to_string()],
    )?;
    Ok(())
}

fn check_schema_version(conn: &Connection) -> StoreResult<()> {
    let found: u32 = conn
        .query_row(
            "SELECT value FROM meta WHERE key = 'schema_version'",
            [],
            |row| row.get::<_, String>(0),
        )
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);

    if found > SCHEMA_VERSION {
        return Err(StoreError::UnsupportedSchema {
            found,
            supported: SCHEMA_VERSION,
        });
    }
    if found < SCHEMA_VERSION {
        conn.execute(
            "INSERT OR REPLACE INTO meta (key, value) VALUES ('schema_version', ?1)",
            [SCHEMA_VERSION.to_string()],
        )?;
    }
    Ok(())
}

/// Current time as whole epoch seconds.
pub(crate) fn now_epoch() -> i64 {
    chrono::Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_store(dir: &TempDir) -> Arc<Store> {
        Store::open(&dir.path().join("scan_cache.db")).unwrap()
    }

    #[test]
    fn test_open_creates_schema() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let handle = store.handle().unwrap();

        let count: i64 = handle
            .with(|conn| {
                conn.query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name IN
                     ('file_hashes','sessions','session_files','session_hashes',
                      'session_results','session_selected','scheduled_jobs','scheduled_runs')",
                    [],
                    |row| row.get(0),
                )
            })
            .unwrap();
        assert_eq!(count, 8);
    }

    #[test]
    fn test_reopen_preserves_schema_version() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("scan_cache.db");
        drop(Store::open(&path).unwrap());
        let store = Store::open(&path).unwrap();
        let handle = store.handle().unwrap();

        let version: String = handle
            .with(|conn| {
                conn.query_row(
                    "SELECT value FROM meta WHERE key='schema_version'",
                    [],
                    |row| row.get(0),
                )
            })
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION.to_string());
    }

    #[test]
    fn test_refuses_newer_schema() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("scan_cache.db");
        drop(Store::open(&path).unwrap());

        let conn = Connection::open(&path).unwrap();
        conn.execute(
            "UPDATE meta SET value=?1 WHERE key='schema_version'",
            [(SCHEMA_VERSION + 1).to_string()],
        )
        .unwrap();
        drop(conn);

        match Store::open(&path) {
            Err(StoreError::UnsupportedSchema { found, supported }) => {
                assert_eq!(found, SCHEMA_VERSION + 1);
                assert_eq!(supported, SCHEMA_VERSION);
            }
            other => panic!("expected UnsupportedSchema, got {other:?}"),
        }
    }

    #[test]
    fn test_close_all_releases_handles() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        let h1 = store.handle().unwrap();
        let h2 = store.handle().unwrap();
        assert_eq!(store.live_handles(), 2);

        store.close_all();

        assert!(matches!(
            h1.with(|conn| conn.query_row("SELECT 1", [], |r| r.get::<_, i64>(0))),
            Err(StoreError::HandleClosed)
        ));
        assert!(matches!(
            h2.with(|conn| conn.query_row("SELECT 1", [], |r| r.get::<_, i64>(0))),
            Err(StoreError::HandleClosed)
        ));
    }

    #[test]
    fn test_handles_usable_across_threads() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        let mut threads = Vec::new();
        for i in 0..4 {
            let handle = store.handle().unwrap();
            threads.push(std::thread::spawn(move || {
                handle
                    .with(|conn| {
                        conn.execute(
                            "INSERT OR REPLACE INTO meta (key, value) VALUES (?1, ?2)",
                            rusqlite::params![format!("probe_{i}"), i.to_string()],
                        )
                    })
                    .unwrap();
            }));
        }
        for t in threads {
            t.join().unwrap();
        }

        let handle = store.handle().unwrap();
        let count: i64 = handle
            .with(|conn| {
                conn.query_row(
                    "SELECT COUNT(*) FROM meta WHERE key LIKE 'probe_%'",
                    [],
                    |row| row.get(0),
                )
            })
            .unwrap();
        assert_eq!(count, 4);
    }
}
