use std::error::Error;
use std::fmt;

use chrono::NaiveDateTime;
use serde_json::Value as JsonValue;
use tokio_postgres::types::{IsNull, ToSql, Type, to_sql_checked};
use tokio_util::bytes;

/// Values bound as query parameters and read back from result rows.
///
/// One enum covers both directions so helper code never has to branch on
/// driver types:
/// ```rust
/// use pg_middleware::PgValue;
///
/// let params = vec![
///     PgValue::Int(1),
///     PgValue::Text("alice".into()),
///     PgValue::Bool(true),
/// ];
/// # let _ = params;
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum PgValue {
    /// Integer value (64-bit)
    Int(i64),
    /// Floating point value (64-bit)
    Float(f64),
    /// Text/string value
    Text(String),
    /// Boolean value
    Bool(bool),
    /// Timestamp value
    Timestamp(NaiveDateTime),
    /// NULL value
    Null,
    /// JSON-tagged value: bound natively for `json`/`jsonb` columns, as its
    /// JSON text rendering everywhere else
    Json(JsonValue),
    /// Binary data
    Blob(Vec<u8>),
    /// Typed bind: the statement is prepared with the given driver type and
    /// the inner value encoded for it
    Typed(Type, Box<PgValue>),
}

impl PgValue {
    /// Check if this value is NULL
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        if let PgValue::Int(value) = self {
            Some(*value)
        } else {
            None
        }
    }

    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        if let PgValue::Text(value) = self {
            Some(value)
        } else {
            None
        }
    }

    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PgValue::Bool(value) => Some(*value),
            PgValue::Int(1) => Some(true),
            PgValue::Int(0) => Some(false),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_float(&self) -> Option<f64> {
        if let PgValue::Float(value) = self {
            Some(*value)
        } else {
            None
        }
    }

    #[must_use]
    pub fn as_timestamp(&self) -> Option<NaiveDateTime> {
        match self {
            PgValue::Timestamp(value) => Some(*value),
            PgValue::Text(s) => NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
                .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f"))
                .ok(),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_json(&self) -> Option<&JsonValue> {
        if let PgValue::Json(value) = self {
            Some(value)
        } else {
            None
        }
    }

    #[must_use]
    pub fn as_blob(&self) -> Option<&[u8]> {
        if let PgValue::Blob(bytes) = self {
            Some(bytes)
        } else {
            None
        }
    }
}

impl fmt::Display for PgValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PgValue::Int(i) => write!(f, "{i}"),
            PgValue::Float(v) => write!(f, "{v}"),
            PgValue::Text(s) => f.write_str(s),
            PgValue::Bool(b) => write!(f, "{b}"),
            PgValue::Timestamp(ts) => write!(f, "{}", ts.format("%Y-%m-%d %H:%M:%S")),
            PgValue::Null => Ok(()),
            PgValue::Json(v) => write!(f, "{v}"),
            PgValue::Blob(bytes) => {
                f.write_str("\\x")?;
                for b in bytes {
                    write!(f, "{b:02x}")?;
                }
                Ok(())
            }
            PgValue::Typed(_, inner) => inner.fmt(f),
        }
    }
}

impl From<i64> for PgValue {
    fn from(v: i64) -> Self {
        PgValue::Int(v)
    }
}

impl From<&str> for PgValue {
    fn from(v: &str) -> Self {
        PgValue::Text(v.to_string())
    }
}

impl From<String> for PgValue {
    fn from(v: String) -> Self {
        PgValue::Text(v)
    }
}

impl From<bool> for PgValue {
    fn from(v: bool) -> Self {
        PgValue::Bool(v)
    }
}

impl From<f64> for PgValue {
    fn from(v: f64) -> Self {
        PgValue::Float(v)
    }
}

impl From<JsonValue> for PgValue {
    fn from(v: JsonValue) -> Self {
        PgValue::Json(v)
    }
}

impl ToSql for PgValue {
    fn to_sql(
        &self,
        ty: &Type,
        out: &mut bytes::BytesMut,
    ) -> Result<IsNull, Box<dyn Error + Sync + Send>> {
        match self {
            PgValue::Int(i) => match *ty {
                Type::INT2 => i16::try_from(*i)?.to_sql(ty, out),
                Type::INT4 => i32::try_from(*i)?.to_sql(ty, out),
                _ => (*i).to_sql(ty, out),
            },
            PgValue::Float(v) => (*v).to_sql(ty, out),
            PgValue::Text(s) => s.to_sql(ty, out),
            PgValue::Bool(b) => (*b).to_sql(ty, out),
            PgValue::Timestamp(ts) => ts.to_sql(ty, out),
            PgValue::Null => Ok(IsNull::Yes),
            PgValue::Json(v) => match *ty {
                Type::JSON | Type::JSONB => v.to_sql(ty, out),
                _ => v.to_string().to_sql(ty, out),
            },
            PgValue::Blob(bytes) => bytes.to_sql(ty, out),
            PgValue::Typed(_, inner) => inner.to_sql(ty, out),
        }
    }

    fn accepts(_ty: &Type) -> bool {
        // The statement dictates the target type; encoding adapts per value.
        true
    }

    to_sql_checked!();
}

/// Transaction isolation levels accepted by `Session::begin`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    #[must_use]
    pub fn as_sql(self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => "READ UNCOMMITTED",
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }
}
