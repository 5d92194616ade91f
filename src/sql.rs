//! Small SQL fragment builder
//!
//! Fragments carry their SQL text with `?` placeholders together with the
//! ordered parameter values, so user-influenced values (term ids, counts,
//! taxonomy names) are never spliced into the query text.

use rusqlite::types::{ToSql, ToSqlOutput, ValueRef};
use std::fmt;

/// A bound parameter value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqlValue {
    Integer(i64),
    Text(String),
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        Self::Integer(v)
    }
}

impl From<usize> for SqlValue {
    fn from(v: usize) -> Self {
        Self::Integer(v as i64)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl ToSql for SqlValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Self::Integer(i) => ToSqlOutput::Borrowed(ValueRef::Integer(*i)),
            Self::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
        })
    }
}

impl fmt::Display for SqlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Integer(i) => write!(f, "{}", i),
            Self::Text(s) => write!(f, "'{}'", s.replace('\'', "''")),
        }
    }
}

/// SQL text plus the parameters for its placeholders, in order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SqlFragment {
    sql: String,
    params: Vec<SqlValue>,
}

impl SqlFragment {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn params(&self) -> &[SqlValue] {
        &self.params
    }

    pub fn is_empty(&self) -> bool {
        self.sql.trim().is_empty()
    }

    pub fn push_sql(&mut self, sql: &str) -> &mut Self {
        self.sql.push_str(sql);
        self
    }

    /// Append a single `?` placeholder bound to `value`
    pub fn push_param(&mut self, value: impl Into<SqlValue>) -> &mut Self {
        self.sql.push('?');
        self.params.push(value.into());
        self
    }

    /// Append `(?, ?, ...)` bound to `ids`. An empty list renders `(NULL)`,
    /// which matches nothing.
    pub fn push_id_list(&mut self, ids: &[i64]) -> &mut Self {
        if ids.is_empty() {
            self.sql.push_str("(NULL)");
            return self;
        }
        self.sql.push('(');
        for (i, id) in ids.iter().enumerate() {
            if i > 0 {
                self.sql.push_str(", ");
            }
            self.push_param(*id);
        }
        self.sql.push(')');
        self
    }

    pub fn append(&mut self, other: SqlFragment) -> &mut Self {
        self.sql.push_str(&other.sql);
        self.params.extend(other.params);
        self
    }

    /// Join fragments with a separator, keeping parameter order
    pub fn join(fragments: impl IntoIterator<Item = SqlFragment>, separator: &str) -> Self {
        let mut out = SqlFragment::default();
        for (i, fragment) in fragments.into_iter().enumerate() {
            if i > 0 {
                out.sql.push_str(separator);
            }
            out.append(fragment);
        }
        out
    }

    /// Render with parameters inlined. Used for cache keys and logs only,
    /// never for execution.
    pub fn render(&self) -> String {
        let mut out = String::with_capacity(self.sql.len() + self.params.len() * 4);
        let mut params = self.params.iter();
        let mut in_string = false;
        for ch in self.sql.chars() {
            match ch {
                '\'' => {
                    in_string = !in_string;
                    out.push(ch);
                }
                '?' if !in_string => match params.next() {
                    Some(value) => out.push_str(&value.to_string()),
                    None => out.push(ch),
                },
                _ => out.push(ch),
            }
        }
        out
    }
}

impl fmt::Display for SqlFragment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}
