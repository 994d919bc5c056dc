//! Parameterized queries with validated named binds.

use anyhow::{Result, anyhow, bail};
use rusqlite::types::{ToSqlOutput, Value};
use rusqlite::{Row, Statement, ToSql};
use std::collections::BTreeSet;

/// Maps one result row to a record.
pub type RowMapper<T> = fn(&Row<'_>) -> rusqlite::Result<T>;

/// Prefix of placeholder names the sources bind themselves (`:__after`, `:__page_size`).
const RESERVED_PREFIX: &str = "__";

/// SQL text plus named bind values. Values are converted to owned SQLite values on bind, so a
/// query can be cloned into reader threads.
#[derive(Clone, Debug)]
pub struct QuerySpec {
    sql: String,
    binds: Vec<(String, Value)>,
    invalid: Vec<String>,
}

impl QuerySpec {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            binds: Vec::new(),
            invalid: Vec::new(),
        }
    }

    /// Bind `:name`. Accepts the name with or without the leading colon. Problems (reserved or
    /// duplicate name, unconvertible value) surface from [`Self::check_binds`].
    pub fn bind(mut self, name: &str, value: impl ToSql) -> Self {
        let name = format!(":{}", name.trim_start_matches(':'));
        if name[1..].starts_with(RESERVED_PREFIX) {
            self.invalid.push(format!("'{name}' is reserved"));
            return self;
        }
        if self.binds.iter().any(|(n, _)| *n == name) {
            self.invalid.push(format!("'{name}' bound twice"));
            return self;
        }
        match owned_value(&value) {
            Ok(v) => self.binds.push((name, v)),
            Err(e) => self.invalid.push(format!("'{name}': {e}")),
        }
        self
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Bind problems recorded by [`Self::bind`]. Needs no connection, so sources run it at
    /// construction.
    pub fn check_binds(&self) -> Result<()> {
        match self.invalid.first() {
            Some(first) => bail!("invalid bind {first}"),
            None => Ok(()),
        }
    }

    /// Check the binds against the placeholders SQLite parsed out of `stmt` (this query,
    /// prepared). Every placeholder must be bound and every bind used. `provided` names (colon
    /// included) are bound by the caller at execution time and must also appear in the SQL.
    pub fn validate(&self, stmt: &Statement<'_>, provided: &[&str]) -> Result<()> {
        self.check_binds()?;
        let used = placeholders(stmt)?;
        let mut problems = Vec::new();
        for name in &used {
            let bound =
                self.binds.iter().any(|(n, _)| n == name) || provided.contains(&name.as_str());
            if !bound {
                problems.push(format!("'{name}' has no bound value"));
            }
        }
        for (name, _) in &self.binds {
            if !used.contains(name) {
                problems.push(format!("'{name}' is bound but not used"));
            }
        }
        for name in provided {
            if !used.contains(*name) {
                problems.push(format!("query must use '{name}'"));
            }
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(anyhow!("{}", problems.join("; ")))
        }
    }

    /// Bind list in the shape `Statement::query` takes, with `extra` appended. `extra` names
    /// carry their leading colon.
    pub(crate) fn params<'a>(
        &'a self,
        extra: &'a [(&'a str, Value)],
    ) -> Vec<(&'a str, &'a dyn ToSql)> {
        self.binds
            .iter()
            .map(|(n, v)| (n.as_str(), v as &dyn ToSql))
            .chain(extra.iter().map(|(n, v)| (*n, v as &dyn ToSql)))
            .collect()
    }
}

fn owned_value(value: &dyn ToSql) -> Result<Value> {
    match value.to_sql()? {
        ToSqlOutput::Borrowed(v) => Ok(v.into()),
        ToSqlOutput::Owned(v) => Ok(v),
        _ => Err(anyhow!("unsupported bind value")),
    }
}

/// Named placeholders of a prepared statement, colon included. Only `:name` binds are
/// supported.
fn placeholders(stmt: &Statement<'_>) -> Result<BTreeSet<String>> {
    (1..=stmt.parameter_count())
        .map(|i| match stmt.parameter_name(i) {
            Some(name) if name.starts_with(':') => Ok(name.to_string()),
            Some(name) => Err(anyhow!("placeholder '{name}' must use ':name' form")),
            None => Err(anyhow!("positional placeholder ?{i} is not supported")),
        })
        .collect()
}
