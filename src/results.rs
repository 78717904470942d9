use std::collections::{HashMap, VecDeque};
use std::error::Error;
use std::sync::Arc;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::Value as JsonValue;
use tokio_postgres::Row;
use tokio_postgres::types::{FromSql, Type};

use crate::backend::StatementHandle;
use crate::error::PgMiddlewareError;
use crate::types::PgValue;

/// The outcome of one executed statement, with cursor-style row views.
///
/// A `Results` keeps its producing statement handle alive until it is
/// dropped; `sth()` exposes the handle for identity assertions. Row views
/// consume: `array`/`hash` step one row, `arrays`/`hashes`/`text`
/// materialize the remainder, and an exhausted view yields `None` or an
/// empty collection.
#[derive(Debug)]
pub struct Results {
    sth: Arc<StatementHandle>,
    rows: VecDeque<Row>,
    affected: u64,
    expand_json: bool,
    error: Option<String>,
}

impl Results {
    pub(crate) fn new(sth: Arc<StatementHandle>, rows: Vec<Row>, affected: u64) -> Self {
        Self {
            sth,
            rows: rows.into(),
            affected,
            expand_json: false,
            error: None,
        }
    }

    /// A result for an execution that failed server-side: no rows, but the
    /// statement handle and the error text remain inspectable.
    pub(crate) fn failed(sth: Arc<StatementHandle>, message: String) -> Self {
        Self {
            sth,
            rows: VecDeque::new(),
            affected: 0,
            expand_json: false,
            error: Some(message),
        }
    }

    /// Ordered column names of the producing statement. Idempotent.
    #[must_use]
    pub fn columns(&self) -> Vec<String> {
        self.sth.columns()
    }

    /// Rows affected (INSERT/UPDATE/DELETE) or the row count (SELECT).
    /// Idempotent; unaffected by row consumption.
    #[must_use]
    pub fn rows(&self) -> u64 {
        self.affected
    }

    /// Next row as an ordered value sequence, or `None` when exhausted.
    ///
    /// # Errors
    /// Returns an error when a column value cannot be decoded.
    pub fn array(&mut self) -> Result<Option<Vec<PgValue>>, PgMiddlewareError> {
        let Some(row) = self.rows.pop_front() else {
            return Ok(None);
        };
        let mut values = Vec::with_capacity(row.len());
        for idx in 0..row.len() {
            values.push(extract_value(&row, idx, self.expand_json)?);
        }
        Ok(Some(values))
    }

    /// Next row as a column-to-value mapping, or `None` when exhausted.
    ///
    /// # Errors
    /// Returns an error when a column value cannot be decoded.
    pub fn hash(&mut self) -> Result<Option<HashMap<String, PgValue>>, PgMiddlewareError> {
        let Some(row) = self.rows.pop_front() else {
            return Ok(None);
        };
        let mut map = HashMap::with_capacity(row.len());
        for (idx, column) in row.columns().iter().enumerate() {
            map.insert(
                column.name().to_string(),
                extract_value(&row, idx, self.expand_json)?,
            );
        }
        Ok(Some(map))
    }

    /// All remaining rows as arrays.
    ///
    /// # Errors
    /// Returns an error when a column value cannot be decoded.
    pub fn arrays(&mut self) -> Result<Vec<Vec<PgValue>>, PgMiddlewareError> {
        let mut out = Vec::with_capacity(self.rows.len());
        while let Some(values) = self.array()? {
            out.push(values);
        }
        Ok(out)
    }

    /// All remaining rows as column-to-value mappings.
    ///
    /// # Errors
    /// Returns an error when a column value cannot be decoded.
    pub fn hashes(&mut self) -> Result<Vec<HashMap<String, PgValue>>, PgMiddlewareError> {
        let mut out = Vec::with_capacity(self.rows.len());
        while let Some(map) = self.hash()? {
            out.push(map);
        }
        Ok(out)
    }

    /// Remaining rows as a tabular string: two-space column separation, one
    /// line per row.
    ///
    /// # Errors
    /// Returns an error when a column value cannot be decoded.
    pub fn text(&mut self) -> Result<String, PgMiddlewareError> {
        let mut out = String::new();
        while let Some(values) = self.array()? {
            let rendered: Vec<String> = values.iter().map(ToString::to_string).collect();
            out.push_str(&rendered.join("  "));
            out.push('\n');
        }
        Ok(out)
    }

    /// Enable JSON expansion: subsequent row reads decode `json`/`jsonb`
    /// columns into values instead of raw text. Applied per row read, so
    /// rows already consumed stay as they were.
    #[must_use]
    pub fn expand(mut self) -> Self {
        self.expand_json = true;
        self
    }

    /// The underlying statement handle.
    #[must_use]
    pub fn sth(&self) -> &Arc<StatementHandle> {
        &self.sth
    }

    /// Server error text when the producing execution failed (non-blocking
    /// queries deliver such a `Results` alongside the error).
    #[must_use]
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }
}

/// Raw text of a `json`/`jsonb` column, bypassing value decoding.
struct RawJson(String);

impl<'a> FromSql<'a> for RawJson {
    fn from_sql(ty: &Type, raw: &'a [u8]) -> Result<Self, Box<dyn Error + Sync + Send>> {
        let bytes = if *ty == Type::JSONB {
            // jsonb wire format: one version byte, then the JSON text
            if raw.first() == Some(&1) {
                &raw[1..]
            } else {
                return Err("unsupported jsonb encoding version".into());
            }
        } else {
            raw
        };
        Ok(RawJson(std::str::from_utf8(bytes)?.to_string()))
    }

    fn accepts(ty: &Type) -> bool {
        matches!(*ty, Type::JSON | Type::JSONB)
    }
}

/// Decode one column of a driver row into a `PgValue`.
fn extract_value(row: &Row, idx: usize, expand_json: bool) -> Result<PgValue, PgMiddlewareError> {
    let type_name = row.columns()[idx].type_().name();

    if type_name == "int2" {
        let val: Option<i16> = row.try_get(idx)?;
        Ok(val.map_or(PgValue::Null, |v| PgValue::Int(i64::from(v))))
    } else if type_name == "int4" {
        let val: Option<i32> = row.try_get(idx)?;
        Ok(val.map_or(PgValue::Null, |v| PgValue::Int(i64::from(v))))
    } else if type_name == "int8" {
        let val: Option<i64> = row.try_get(idx)?;
        Ok(val.map_or(PgValue::Null, PgValue::Int))
    } else if type_name == "float4" {
        let val: Option<f32> = row.try_get(idx)?;
        Ok(val.map_or(PgValue::Null, |v| PgValue::Float(f64::from(v))))
    } else if type_name == "float8" {
        let val: Option<f64> = row.try_get(idx)?;
        Ok(val.map_or(PgValue::Null, PgValue::Float))
    } else if type_name == "bool" {
        let val: Option<bool> = row.try_get(idx)?;
        Ok(val.map_or(PgValue::Null, PgValue::Bool))
    } else if type_name == "timestamp" {
        let val: Option<NaiveDateTime> = row.try_get(idx)?;
        Ok(val.map_or(PgValue::Null, PgValue::Timestamp))
    } else if type_name == "timestamptz" {
        let val: Option<DateTime<Utc>> = row.try_get(idx)?;
        Ok(val.map_or(PgValue::Null, |v| PgValue::Timestamp(v.naive_utc())))
    } else if type_name == "json" || type_name == "jsonb" {
        if expand_json {
            let val: Option<JsonValue> = row.try_get(idx)?;
            Ok(val.map_or(PgValue::Null, PgValue::Json))
        } else {
            let val: Option<RawJson> = row.try_get(idx)?;
            Ok(val.map_or(PgValue::Null, |v| PgValue::Text(v.0)))
        }
    } else if type_name == "bytea" {
        let val: Option<Vec<u8>> = row.try_get(idx)?;
        Ok(val.map_or(PgValue::Null, PgValue::Blob))
    } else {
        // text, varchar, name and anything else with a textual reading
        let val: Option<String> = row.try_get(idx)?;
        Ok(val.map_or(PgValue::Null, PgValue::Text))
    }
}
