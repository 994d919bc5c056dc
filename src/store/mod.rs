//! SQLite store: connection handle, schema, and the SQL-backed sources and committer.

pub mod cursor;
pub mod paging;
pub mod query;
pub mod writer;

pub use cursor::CursorSource;
pub use paging::PagingSource;
pub use query::{QuerySpec, RowMapper};
pub use writer::{ChunkWriter, SqlCommitter};

use anyhow::{Context, Result};
use log::debug;
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::utils::config::STORE;

/// Domain schema (idempotent).
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    user_id TEXT PRIMARY KEY,
    user_name TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'ACTIVE',
    phone TEXT,
    uuid TEXT,
    created_at TEXT,
    modified_at TEXT
);
CREATE TABLE IF NOT EXISTS user_group_mapping (
    user_group_id TEXT NOT NULL,
    user_id TEXT NOT NULL,
    user_group_name TEXT,
    description TEXT,
    PRIMARY KEY (user_group_id, user_id)
);
CREATE TABLE IF NOT EXISTS package (
    package_seq INTEGER PRIMARY KEY AUTOINCREMENT,
    package_name TEXT NOT NULL,
    count INTEGER,
    period INTEGER
);
CREATE TABLE IF NOT EXISTS bulk_pass (
    bulk_pass_seq INTEGER PRIMARY KEY AUTOINCREMENT,
    package_seq INTEGER NOT NULL,
    user_group_id TEXT NOT NULL,
    status TEXT NOT NULL,
    count INTEGER,
    started_at TEXT NOT NULL,
    ended_at TEXT
);
CREATE TABLE IF NOT EXISTS pass (
    pass_seq INTEGER PRIMARY KEY AUTOINCREMENT,
    package_seq INTEGER NOT NULL,
    user_id TEXT NOT NULL,
    status TEXT NOT NULL,
    remaining_count INTEGER CHECK (remaining_count IS NULL OR remaining_count >= 0),
    started_at TEXT NOT NULL,
    ended_at TEXT,
    expired_at TEXT
);
CREATE TABLE IF NOT EXISTS booking (
    booking_seq INTEGER PRIMARY KEY AUTOINCREMENT,
    pass_seq INTEGER NOT NULL,
    user_id TEXT NOT NULL,
    status TEXT NOT NULL,
    used_pass INTEGER NOT NULL DEFAULT 0,
    attended INTEGER NOT NULL DEFAULT 0,
    started_at TEXT NOT NULL,
    ended_at TEXT NOT NULL,
    cancelled_at TEXT
);
CREATE TABLE IF NOT EXISTS notification (
    notification_seq INTEGER PRIMARY KEY AUTOINCREMENT,
    uuid TEXT NOT NULL,
    event TEXT NOT NULL,
    text TEXT NOT NULL,
    sent INTEGER NOT NULL DEFAULT 0,
    sent_at TEXT,
    created_at TEXT
);
CREATE TABLE IF NOT EXISTS statistics (
    statistics_seq INTEGER PRIMARY KEY AUTOINCREMENT,
    statistics_at TEXT NOT NULL,
    all_count INTEGER NOT NULL,
    attended_count INTEGER NOT NULL,
    cancelled_count INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_pass_status ON pass(status, ended_at);
CREATE INDEX IF NOT EXISTS idx_booking_status ON booking(status, ended_at);
CREATE INDEX IF NOT EXISTS idx_notification_unsent ON notification(event, sent);
CREATE INDEX IF NOT EXISTS idx_statistics_at ON statistics(statistics_at);
"#;

/// Pragmas for every connection: concurrent readers alongside one writer at a time.
const CONNECTION_PRAGMAS: &str = r#"
PRAGMA synchronous = NORMAL;
PRAGMA foreign_keys = ON;
PRAGMA temp_store = MEMORY;
"#;

/// Cheap, cloneable handle to the database file. Sources and committers each acquire their own
/// [`Connection`] through it when they open and drop it when they close.
#[derive(Clone, Debug)]
pub struct Database {
    path: PathBuf,
}

impl Database {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Open a fresh connection in WAL mode with a busy timeout.
    pub fn connect(&self) -> Result<Connection> {
        let conn = Connection::open(&self.path)
            .with_context(|| format!("open database {}", self.path.display()))?;
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))
            .context("enable WAL")?;
        conn.busy_timeout(Duration::from_millis(STORE.busy_timeout_ms))
            .context("set busy timeout")?;
        conn.execute_batch(CONNECTION_PRAGMAS)
            .context("set connection pragmas")?;
        Ok(conn)
    }

    /// Create every table and index that does not exist yet.
    pub fn init_schema(&self) -> Result<()> {
        let conn = self.connect()?;
        conn.execute_batch(SCHEMA).context("create schema")?;
        debug!("Schema ready at {}", self.path.display());
        Ok(())
    }
}
