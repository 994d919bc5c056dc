//! Paging source: fixed-size keyset pages, each fetched with its own short query.

use anyhow::{Context, Result, anyhow};
use log::debug;
use rusqlite::Connection;
use rusqlite::types::Value;
use std::collections::VecDeque;

use super::Database;
use super::query::{QuerySpec, RowMapper};
use crate::engine::ItemSource;

const AFTER: &str = ":__after";
const PAGE_SIZE: &str = ":__page_size";

/// Reads `page_size` rows at a time, ordered by a monotonic integer key. The query must select
/// the key column, filter with `<key> > :__after`, order by the key and end with
/// `LIMIT :__page_size`; the source binds both.
///
/// Pages never overlap or skip rows when unrelated rows are inserted or deleted between pages,
/// because the next page starts after the last key seen instead of at an offset. No state is
/// held on the database between pages, so independent instances may read concurrently.
pub struct PagingSource<T> {
    name: String,
    db: Database,
    query: QuerySpec,
    key_column: String,
    page_size: usize,
    mapper: RowMapper<T>,
    conn: Option<Connection>,
    buffer: VecDeque<T>,
    last_key: Option<i64>,
    page: usize,
    exhausted: bool,
}

impl<T> PagingSource<T> {
    /// Checks binds and page size up front. The SQL itself is checked against the binds when the
    /// step opens the source, before any row is read.
    pub fn new(
        name: &str,
        db: Database,
        query: QuerySpec,
        key_column: &str,
        page_size: usize,
        mapper: RowMapper<T>,
    ) -> Result<Self> {
        if page_size == 0 {
            return Err(anyhow!("{name}: page size must be > 0"));
        }
        query
            .check_binds()
            .with_context(|| format!("{name}: invalid query"))?;
        Ok(Self {
            name: name.to_string(),
            db,
            query,
            key_column: key_column.to_string(),
            page_size,
            mapper,
            conn: None,
            buffer: VecDeque::with_capacity(page_size),
            last_key: None,
            page: 0,
            exhausted: false,
        })
    }

    /// Pages fetched so far.
    pub fn pages(&self) -> usize {
        self.page
    }

    fn fetch_page(&mut self) -> Result<()> {
        let conn = self
            .conn
            .as_ref()
            .ok_or_else(|| anyhow!("{}: read before open", self.name))?;
        let extra = [
            (AFTER, Value::Integer(self.last_key.unwrap_or(i64::MIN))),
            (PAGE_SIZE, Value::Integer(self.page_size as i64)),
        ];
        let params = self.query.params(&extra);
        let mut stmt = conn
            .prepare_cached(self.query.sql())
            .with_context(|| format!("{}: prepare page query", self.name))?;
        let mut rows = stmt
            .query(params.as_slice())
            .with_context(|| format!("{}: query page {}", self.name, self.page + 1))?;
        let mut fetched = 0;
        while let Some(row) = rows.next().context("fetch row")? {
            let key: i64 = row
                .get(self.key_column.as_str())
                .with_context(|| format!("{}: read key column '{}'", self.name, self.key_column))?;
            let item = (self.mapper)(row).context("map row")?;
            self.buffer.push_back(item);
            self.last_key = Some(key);
            fetched += 1;
        }
        self.page += 1;
        debug!(
            "[{}] page {} fetched {} rows (after key {:?})",
            self.name, self.page, fetched, self.last_key
        );
        if fetched < self.page_size {
            self.exhausted = true;
        }
        Ok(())
    }
}

impl<T: Send + 'static> ItemSource for PagingSource<T> {
    type Item = T;

    fn open(&mut self) -> Result<()> {
        let conn = self.db.connect()?;
        {
            let stmt = conn
                .prepare_cached(self.query.sql())
                .with_context(|| format!("{}: prepare page query", self.name))?;
            self.query
                .validate(&stmt, &[AFTER, PAGE_SIZE])
                .with_context(|| format!("{}: invalid query", self.name))?;
        }
        self.conn = Some(conn);
        self.buffer.clear();
        self.last_key = None;
        self.page = 0;
        self.exhausted = false;
        Ok(())
    }

    fn read(&mut self) -> Result<Option<T>> {
        if self.buffer.is_empty() && !self.exhausted {
            self.fetch_page()?;
        }
        Ok(self.buffer.pop_front())
    }

    fn close(&mut self) {
        self.conn = None;
        self.buffer.clear();
    }
}
