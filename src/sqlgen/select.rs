use crate::error::PgMiddlewareError;
use crate::types::PgValue;

use super::{Query, SqlGenerator};

/// One entry in a `SELECT` source list: a plain table, or a join tuple
/// producing ` [KIND] JOIN table ON (table.fk = first_table.pk)`.
#[derive(Debug, Clone)]
pub enum Source {
    Table(String),
    Join {
        table: String,
        fk: String,
        pk: String,
        kind: Option<JoinKind>,
    },
}

impl From<&str> for Source {
    fn from(table: &str) -> Self {
        Source::Table(table.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    Left,
    Right,
    Inner,
    Full,
}

impl JoinKind {
    fn as_sql(self) -> &'static str {
        match self {
            JoinKind::Left => "LEFT",
            JoinKind::Right => "RIGHT",
            JoinKind::Inner => "INNER",
            JoinKind::Full => "FULL",
        }
    }
}

#[derive(Debug, Clone)]
pub enum GroupBy {
    Columns(Vec<String>),
    Literal(String),
}

#[derive(Debug, Clone)]
pub enum OrderBy {
    Asc(String),
    Desc(String),
    Literal(String),
}

/// Row-locking tail: `FOR UPDATE`, or literal SQL after `FOR`.
#[derive(Debug, Clone)]
pub enum Lock {
    Update,
    Literal(String),
}

#[derive(Debug, Clone, Default)]
pub struct SelectOptions {
    pub group_by: Option<GroupBy>,
    pub order_by: Vec<OrderBy>,
    /// Bound as a parameter, never inlined
    pub limit: Option<i64>,
    /// Bound as a parameter, never inlined
    pub offset: Option<i64>,
    pub lock: Option<Lock>,
}

impl SqlGenerator {
    /// Generate a `SELECT` statement.
    ///
    /// # Errors
    /// Returns `PgMiddlewareError::Builder` when the source list is empty or
    /// starts with a join tuple (joins need a preceding table to anchor the
    /// `ON` condition).
    pub fn select(
        &self,
        from: &[Source],
        columns: &[&str],
        filter: &[(&str, PgValue)],
        opts: &SelectOptions,
    ) -> Result<Query, PgMiddlewareError> {
        let first_table = match from.first() {
            Some(Source::Table(name)) => name.clone(),
            Some(Source::Join { .. }) => {
                return Err(PgMiddlewareError::Builder(
                    "select source list must start with a table".to_string(),
                ));
            }
            None => {
                return Err(PgMiddlewareError::Builder(
                    "select requires a source".to_string(),
                ));
            }
        };

        let column_list = if columns.is_empty() {
            "*".to_string()
        } else {
            columns
                .iter()
                .map(|c| self.name(c))
                .collect::<Vec<_>>()
                .join(", ")
        };

        let mut tables = Vec::new();
        let mut joins = String::new();
        for source in from {
            match source {
                Source::Table(name) => tables.push(self.name(name)),
                Source::Join {
                    table,
                    fk,
                    pk,
                    kind,
                } => {
                    joins.push(' ');
                    if let Some(kind) = kind {
                        joins.push_str(&self.kw(kind.as_sql()));
                        joins.push(' ');
                    }
                    joins.push_str(&format!(
                        "{} {} {} ({}.{} = {}.{})",
                        self.kw("JOIN"),
                        self.name(table),
                        self.kw("ON"),
                        self.name(table),
                        self.name(fk),
                        self.name(&first_table),
                        self.name(pk),
                    ));
                }
            }
        }

        let mut sql = format!(
            "{} {} {} {}{}",
            self.kw("SELECT"),
            column_list,
            self.kw("FROM"),
            tables.join(", "),
            joins,
        );
        let mut params = Vec::with_capacity(filter.len() + 2);
        self.where_clause(filter, &mut sql, &mut params);
        self.tail_clauses(opts, &mut sql, &mut params);

        Ok(Query { sql, params })
    }

    fn tail_clauses(&self, opts: &SelectOptions, sql: &mut String, params: &mut Vec<PgValue>) {
        match &opts.group_by {
            None => {}
            Some(GroupBy::Columns(columns)) => {
                let names: Vec<String> = columns.iter().map(|c| self.name(c)).collect();
                sql.push(' ');
                sql.push_str(&self.kw("GROUP BY"));
                sql.push(' ');
                sql.push_str(&names.join(", "));
            }
            Some(GroupBy::Literal(literal)) => {
                sql.push(' ');
                sql.push_str(&self.kw("GROUP BY"));
                sql.push(' ');
                sql.push_str(literal);
            }
        }

        for (i, order) in opts.order_by.iter().enumerate() {
            if i == 0 {
                sql.push(' ');
                sql.push_str(&self.kw("ORDER BY"));
                sql.push(' ');
            } else {
                sql.push_str(", ");
            }
            match order {
                OrderBy::Asc(column) => sql.push_str(&self.name(column)),
                OrderBy::Desc(column) => {
                    sql.push_str(&self.name(column));
                    sql.push(' ');
                    sql.push_str(&self.kw("DESC"));
                }
                OrderBy::Literal(literal) => sql.push_str(literal),
            }
        }

        if let Some(limit) = opts.limit {
            sql.push(' ');
            sql.push_str(&self.kw("LIMIT"));
            sql.push_str(" ?");
            params.push(PgValue::Int(limit));
        }
        if let Some(offset) = opts.offset {
            sql.push(' ');
            sql.push_str(&self.kw("OFFSET"));
            sql.push_str(" ?");
            params.push(PgValue::Int(offset));
        }

        match &opts.lock {
            None => {}
            Some(Lock::Update) => {
                sql.push(' ');
                sql.push_str(&self.kw("FOR UPDATE"));
            }
            Some(Lock::Literal(literal)) => {
                sql.push(' ');
                sql.push_str(&self.kw("FOR"));
                sql.push(' ');
                sql.push_str(literal);
            }
        }
    }
}
