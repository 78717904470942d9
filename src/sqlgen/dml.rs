use crate::error::PgMiddlewareError;
use crate::types::PgValue;

use super::{Query, SqlGenerator};

/// Conflict handling for `INSERT` statements.
///
/// The shapes map to the `ON CONFLICT` grammar: bare `DO NOTHING`, a
/// targeted `DO UPDATE` reusing the UPDATE assignment logic, or literal SQL
/// inlined verbatim (optionally carrying its own binds).
#[derive(Debug, Clone)]
pub enum OnConflict {
    DoNothing,
    DoUpdate {
        target: Vec<String>,
        set: Vec<(String, PgValue)>,
    },
    Literal(String),
    LiteralWithBinds(String, Vec<PgValue>),
}

/// `RETURNING` clause for DML statements.
#[derive(Debug, Clone)]
pub enum Returning {
    Columns(Vec<String>),
    Star,
}

#[derive(Debug, Clone, Default)]
pub struct InsertOptions {
    pub on_conflict: Option<OnConflict>,
    pub returning: Option<Returning>,
}

#[derive(Debug, Clone, Default)]
pub struct UpdateOptions {
    pub returning: Option<Returning>,
}

#[derive(Debug, Clone, Default)]
pub struct DeleteOptions {
    pub returning: Option<Returning>,
}

impl SqlGenerator {
    /// Generate an `INSERT` statement.
    ///
    /// # Errors
    /// Returns `PgMiddlewareError::Builder` when `values` is empty.
    pub fn insert(
        &self,
        table: &str,
        values: &[(&str, PgValue)],
        opts: &InsertOptions,
    ) -> Result<Query, PgMiddlewareError> {
        if values.is_empty() {
            return Err(PgMiddlewareError::Builder(
                "insert requires at least one column".to_string(),
            ));
        }

        let mut params = Vec::with_capacity(values.len());
        let columns: Vec<String> = values.iter().map(|(c, _)| self.name(c)).collect();
        let placeholders: Vec<&str> = values
            .iter()
            .map(|(_, v)| {
                params.push(v.clone());
                "?"
            })
            .collect();

        let mut sql = format!(
            "{} {} ({}) {} ({})",
            self.kw("INSERT INTO"),
            self.name(table),
            columns.join(", "),
            self.kw("VALUES"),
            placeholders.join(", "),
        );

        if let Some(conflict) = &opts.on_conflict {
            self.on_conflict_clause(conflict, &mut sql, &mut params)?;
        }
        self.returning_clause(opts.returning.as_ref(), &mut sql);

        Ok(Query { sql, params })
    }

    /// Generate an `UPDATE` statement.
    ///
    /// # Errors
    /// Returns `PgMiddlewareError::Builder` when `set` is empty.
    pub fn update(
        &self,
        table: &str,
        set: &[(&str, PgValue)],
        filter: &[(&str, PgValue)],
        opts: &UpdateOptions,
    ) -> Result<Query, PgMiddlewareError> {
        let mut sql = format!("{} {} {} ", self.kw("UPDATE"), self.name(table), self.kw("SET"));
        let mut params = Vec::with_capacity(set.len() + filter.len());
        self.set_clause(set, &mut sql, &mut params)?;
        self.where_clause(filter, &mut sql, &mut params);
        self.returning_clause(opts.returning.as_ref(), &mut sql);
        Ok(Query { sql, params })
    }

    /// Generate a `DELETE` statement.
    pub fn delete(
        &self,
        table: &str,
        filter: &[(&str, PgValue)],
        opts: &DeleteOptions,
    ) -> Result<Query, PgMiddlewareError> {
        let mut sql = format!("{} {}", self.kw("DELETE FROM"), self.name(table));
        let mut params = Vec::with_capacity(filter.len());
        self.where_clause(filter, &mut sql, &mut params);
        self.returning_clause(opts.returning.as_ref(), &mut sql);
        Ok(Query { sql, params })
    }

    fn on_conflict_clause(
        &self,
        conflict: &OnConflict,
        sql: &mut String,
        params: &mut Vec<PgValue>,
    ) -> Result<(), PgMiddlewareError> {
        sql.push(' ');
        sql.push_str(&self.kw("ON CONFLICT"));
        match conflict {
            OnConflict::DoNothing => {
                sql.push(' ');
                sql.push_str(&self.kw("DO NOTHING"));
            }
            OnConflict::DoUpdate { target, set } => {
                if target.is_empty() || set.is_empty() {
                    return Err(PgMiddlewareError::Builder(
                        "on conflict do update requires target columns and assignments"
                            .to_string(),
                    ));
                }
                let targets: Vec<String> = target.iter().map(|c| self.name(c)).collect();
                sql.push_str(&format!(
                    " ({}) {} ",
                    targets.join(", "),
                    self.kw("DO UPDATE SET"),
                ));
                let assignments: Vec<(&str, PgValue)> =
                    set.iter().map(|(c, v)| (c.as_str(), v.clone())).collect();
                self.set_clause(&assignments, sql, params)?;
            }
            OnConflict::Literal(literal) => {
                sql.push(' ');
                sql.push_str(literal);
            }
            OnConflict::LiteralWithBinds(literal, binds) => {
                sql.push(' ');
                sql.push_str(literal);
                params.extend(binds.iter().cloned());
            }
        }
        Ok(())
    }

    fn returning_clause(&self, returning: Option<&Returning>, sql: &mut String) {
        match returning {
            None => {}
            Some(Returning::Star) => {
                sql.push(' ');
                sql.push_str(&self.kw("RETURNING"));
                sql.push_str(" *");
            }
            Some(Returning::Columns(columns)) => {
                let names: Vec<String> = columns.iter().map(|c| self.name(c)).collect();
                sql.push(' ');
                sql.push_str(&self.kw("RETURNING"));
                sql.push(' ');
                sql.push_str(&names.join(", "));
            }
        }
    }
}
