//! Shared fixtures: a schema-initialized SQLite file in a temp dir, removed on drop.
#![allow(dead_code)]

use chrono::NaiveDateTime;
use passbatch::store::Database;
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

static NEXT_ID: AtomicUsize = AtomicUsize::new(0);

pub struct TempDb {
    pub db: Database,
    dir: PathBuf,
}

impl TempDb {
    pub fn new(tag: &str) -> Self {
        let id = NEXT_ID.fetch_add(1, Ordering::SeqCst);
        let dir = std::env::temp_dir().join(format!(
            "passbatch-test-{}-{}-{}",
            tag,
            std::process::id(),
            id
        ));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        let db = Database::new(dir.join("test.db"));
        db.init_schema().unwrap();
        Self { db, dir }
    }

    pub fn conn(&self) -> Connection {
        self.db.connect().unwrap()
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn count(&self, sql: &str) -> i64 {
        self.conn().query_row(sql, [], |row| row.get(0)).unwrap()
    }
}

impl Drop for TempDb {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.dir);
    }
}

/// `2024-03-01 10:00` → NaiveDateTime.
pub fn dt(s: &str) -> NaiveDateTime {
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M").unwrap()
}
