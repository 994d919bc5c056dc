//! Cursor source: one streaming query over a stable snapshot, run on a dedicated reader thread.
//!
//! The reader holds its own connection and a read transaction for the whole stream, so writes
//! committed by the step while it reads (including updates to the rows being selected) do not
//! shift or repeat rows. Rows reach the step through a bounded channel.

use anyhow::{Context, Result, anyhow};
use crossbeam_channel::{Receiver, Sender, bounded};
use log::{debug, warn};
use rusqlite::TransactionBehavior;
use std::thread::{self, JoinHandle};

use super::Database;
use super::query::{QuerySpec, RowMapper};
use crate::engine::ItemSource;
use crate::engine::error::panic_message;
use crate::utils::config::STORE;

/// Not safe for concurrent callers (`read` takes `&mut self`). Share it among workers through
/// [`SynchronizedSource`](crate::engine::SynchronizedSource).
pub struct CursorSource<T> {
    name: String,
    db: Database,
    query: QuerySpec,
    mapper: RowMapper<T>,
    fetch_size: usize,
    rows: Option<Receiver<Result<T>>>,
    reader: Option<JoinHandle<()>>,
    exhausted: bool,
}

impl<T: Send + 'static> CursorSource<T> {
    pub fn new(name: &str, db: Database, query: QuerySpec, mapper: RowMapper<T>) -> Result<Self> {
        query
            .check_binds()
            .with_context(|| format!("{name}: invalid query"))?;
        Ok(Self {
            name: name.to_string(),
            db,
            query,
            mapper,
            fetch_size: STORE.cursor_fetch_size,
            rows: None,
            reader: None,
            exhausted: false,
        })
    }

    /// Rows the reader may buffer ahead of the step.
    pub fn with_fetch_size(mut self, fetch_size: usize) -> Self {
        self.fetch_size = fetch_size.max(1);
        self
    }

    /// Join the reader thread. A panic there is reported as an error so the stream never looks
    /// like a clean end.
    fn join_reader(&mut self) -> Result<()> {
        match self.reader.take() {
            Some(handle) => handle.join().map_err(|payload| {
                anyhow!(
                    "{} cursor reader panicked: {}",
                    self.name,
                    panic_message(payload.as_ref())
                )
            }),
            None => Ok(()),
        }
    }
}

/// Body of the reader thread. Stops early when the step drops its receiver.
fn stream_rows<T>(
    db: &Database,
    query: &QuerySpec,
    mapper: RowMapper<T>,
    tx: &Sender<Result<T>>,
) -> Result<usize> {
    let mut conn = db.connect()?;
    let txn = conn
        .transaction_with_behavior(TransactionBehavior::Deferred)
        .context("begin read transaction")?;
    let params = query.params(&[]);
    let mut stmt = txn.prepare(query.sql()).context("prepare cursor query")?;
    let mut rows = stmt.query(params.as_slice()).context("open cursor")?;
    let mut sent = 0;
    while let Some(row) = rows.next().context("fetch row")? {
        let item = mapper(row).context("map row")?;
        if tx.send(Ok(item)).is_err() {
            break;
        }
        sent += 1;
    }
    Ok(sent)
}

impl<T: Send + 'static> ItemSource for CursorSource<T> {
    type Item = T;

    fn open(&mut self) -> Result<()> {
        self.close();
        {
            let conn = self.db.connect()?;
            let stmt = conn
                .prepare(self.query.sql())
                .with_context(|| format!("{}: prepare cursor query", self.name))?;
            self.query
                .validate(&stmt, &[])
                .with_context(|| format!("{}: invalid query", self.name))?;
        }
        let (tx, rx) = bounded(self.fetch_size);
        let db = self.db.clone();
        let query = self.query.clone();
        let mapper = self.mapper;
        let name = self.name.clone();
        let handle = thread::Builder::new()
            .name(format!("{}-cursor", self.name))
            .spawn(move || match stream_rows(&db, &query, mapper, &tx) {
                Ok(sent) => debug!("[{}] cursor drained {} rows", name, sent),
                Err(e) => {
                    let _ = tx.send(Err(e));
                }
            })
            .context("spawn cursor reader")?;
        self.rows = Some(rx);
        self.reader = Some(handle);
        self.exhausted = false;
        Ok(())
    }

    fn read(&mut self) -> Result<Option<T>> {
        if self.exhausted {
            return Ok(None);
        }
        let rows = self
            .rows
            .as_ref()
            .ok_or_else(|| anyhow!("{}: read before open", self.name))?;
        match rows.recv() {
            Ok(Ok(item)) => Ok(Some(item)),
            Ok(Err(e)) => {
                self.exhausted = true;
                Err(e.context(format!("{}: cursor failed", self.name)))
            }
            // Sender gone: the reader finished (or died).
            Err(_) => {
                self.exhausted = true;
                self.join_reader()?;
                Ok(None)
            }
        }
    }

    fn close(&mut self) {
        // Dropping the receiver unblocks a reader waiting on a full channel.
        self.rows = None;
        if let Err(e) = self.join_reader() {
            warn!("{:#}", e);
        }
    }
}

impl<T> Drop for CursorSource<T> {
    fn drop(&mut self) {
        self.rows = None;
        if let Some(handle) = self.reader.take() {
            let _ = handle.join();
        }
    }
}
