//! PostgreSQL-flavored SQL generation.
//!
//! A small generator producing `?`-placeholder SQL plus an ordered bind
//! list; the session numbers the placeholders (`$N`) before handing the
//! statement to the driver. On top of the generic INSERT/UPDATE/DELETE/
//! SELECT forms it knows the PostgreSQL clauses: `ON CONFLICT`,
//! `RETURNING`, join lists, `GROUP BY`, `ORDER BY`, `LIMIT`/`OFFSET`
//! (bound, not inlined) and `FOR UPDATE`.

use crate::error::PgMiddlewareError;
use crate::types::PgValue;

mod dml;
mod select;

pub use dml::{DeleteOptions, InsertOptions, OnConflict, Returning, UpdateOptions};
pub use select::{GroupBy, JoinKind, Lock, OrderBy, SelectOptions, Source};

/// A generated statement and its parameters, bundled as one unit.
#[derive(Debug, Clone)]
pub struct Query {
    /// The SQL text, with `?` placeholders
    pub sql: String,
    /// The parameters to be bound to the statement
    pub params: Vec<PgValue>,
}

impl Query {
    pub fn new(sql: impl Into<String>, params: Vec<PgValue>) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }
}

/// Statement generator with a keyword-case setting and an optional
/// identifier quote character.
///
/// The default emits unquoted identifiers and uppercase keywords:
/// ```rust
/// use pg_middleware::sqlgen::{InsertOptions, OnConflict, SqlGenerator};
/// use pg_middleware::PgValue;
///
/// let generator = SqlGenerator::new();
/// let q = generator
///     .insert(
///         "t",
///         &[("a", PgValue::from("b"))],
///         &InsertOptions {
///             on_conflict: Some(OnConflict::DoNothing),
///             ..InsertOptions::default()
///         },
///     )
///     .unwrap();
/// assert_eq!(q.sql, "INSERT INTO t (a) VALUES (?) ON CONFLICT DO NOTHING");
/// ```
#[derive(Debug, Clone, Default)]
pub struct SqlGenerator {
    quote: Option<char>,
    lowercase: bool,
}

impl SqlGenerator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Quote identifiers with the given character (doubled when it appears
    /// inside a name). Off by default.
    #[must_use]
    pub fn quote_char(mut self, quote: char) -> Self {
        self.quote = Some(quote);
        self
    }

    /// Emit lowercase keywords instead of the default uppercase.
    #[must_use]
    pub fn lowercase(mut self) -> Self {
        self.lowercase = true;
        self
    }

    /// Apply the case setting to a keyword.
    pub(crate) fn kw(&self, keyword: &str) -> String {
        if self.lowercase {
            keyword.to_lowercase()
        } else {
            keyword.to_string()
        }
    }

    /// Render an identifier, quoting each dot-separated part when a quote
    /// character is configured.
    pub(crate) fn name(&self, ident: &str) -> String {
        match self.quote {
            None => ident.to_string(),
            Some(q) => ident
                .split('.')
                .map(|part| {
                    let mut quoted = String::with_capacity(part.len() + 2);
                    quoted.push(q);
                    for ch in part.chars() {
                        quoted.push(ch);
                        if ch == q {
                            quoted.push(q);
                        }
                    }
                    quoted.push(q);
                    quoted
                })
                .collect::<Vec<_>>()
                .join("."),
        }
    }

    /// Append `a = ?, b = ?` for an UPDATE-style assignment list.
    pub(crate) fn set_clause(
        &self,
        assignments: &[(&str, PgValue)],
        sql: &mut String,
        params: &mut Vec<PgValue>,
    ) -> Result<(), PgMiddlewareError> {
        if assignments.is_empty() {
            return Err(PgMiddlewareError::Builder(
                "empty assignment list".to_string(),
            ));
        }
        for (i, (column, value)) in assignments.iter().enumerate() {
            if i > 0 {
                sql.push_str(", ");
            }
            sql.push_str(&self.name(column));
            sql.push_str(" = ?");
            params.push(value.clone());
        }
        Ok(())
    }

    /// Append ` WHERE ...` for an AND-joined column filter. `Null` values
    /// become `IS NULL`. A missing filter appends nothing.
    pub(crate) fn where_clause(
        &self,
        filter: &[(&str, PgValue)],
        sql: &mut String,
        params: &mut Vec<PgValue>,
    ) {
        for (i, (column, value)) in filter.iter().enumerate() {
            let sep = if i == 0 { self.kw("WHERE") } else { self.kw("AND") };
            sql.push(' ');
            sql.push_str(&sep);
            sql.push(' ');
            sql.push_str(&self.name(column));
            if value.is_null() {
                sql.push(' ');
                sql.push_str(&self.kw("IS NULL"));
            } else {
                sql.push_str(" = ?");
                params.push(value.clone());
            }
        }
    }
}

/// Double-quote an identifier for direct interpolation (LISTEN/NOTIFY
/// channels, savepoints, search_path elements).
#[must_use]
pub fn quote_ident(ident: &str) -> String {
    let mut out = String::with_capacity(ident.len() + 2);
    out.push('"');
    for ch in ident.chars() {
        out.push(ch);
        if ch == '"' {
            out.push('"');
        }
    }
    out.push('"');
    out
}

/// Single-quote a literal string for direct interpolation (NOTIFY
/// payloads).
#[must_use]
pub fn quote_literal(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 2);
    out.push('\'');
    for ch in text.chars() {
        out.push(ch);
        if ch == '\'' {
            out.push('\'');
        }
    }
    out.push('\'');
    out
}
