//! SQL committer: one IMMEDIATE transaction per chunk.

use anyhow::{Context, Result, anyhow};
use log::debug;
use rusqlite::{Connection, Transaction, TransactionBehavior};
use std::sync::Arc;

use super::Database;
use crate::engine::Committer;

/// Writes one chunk inside the given transaction; returns rows durably changed.
pub type ChunkWriter<T> = Arc<dyn Fn(&Transaction<'_>, Vec<T>) -> Result<usize> + Send + Sync>;

/// Commits each chunk in its own transaction: either every statement of the chunk lands or the
/// transaction is rolled back and none do. Cloning yields an unopened committer sharing the same
/// writer, which is how multi-threaded steps give each worker its own connection.
pub struct SqlCommitter<T> {
    name: String,
    db: Database,
    write: ChunkWriter<T>,
    conn: Option<Connection>,
}

impl<T> SqlCommitter<T> {
    pub fn new<F>(name: &str, db: Database, write: F) -> Self
    where
        F: Fn(&Transaction<'_>, Vec<T>) -> Result<usize> + Send + Sync + 'static,
    {
        Self {
            name: name.to_string(),
            db,
            write: Arc::new(write),
            conn: None,
        }
    }
}

impl<T> Clone for SqlCommitter<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            db: self.db.clone(),
            write: Arc::clone(&self.write),
            conn: None,
        }
    }
}

impl<T: Send> Committer<T> for SqlCommitter<T> {
    fn open(&mut self) -> Result<()> {
        self.conn = Some(self.db.connect()?);
        Ok(())
    }

    fn commit(&mut self, chunk: Vec<T>) -> Result<usize> {
        let conn = self
            .conn
            .as_mut()
            .ok_or_else(|| anyhow!("{}: commit before open", self.name))?;
        let size = chunk.len();
        // Write lock taken up front; other workers wait on busy_timeout.
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("begin transaction")?;
        let changed = (self.write)(&tx, chunk)?;
        tx.commit().context("commit transaction")?;
        debug!("[{}] {} records, {} rows changed", self.name, size, changed);
        Ok(changed)
    }

    fn close(&mut self) {
        self.conn = None;
    }
}
