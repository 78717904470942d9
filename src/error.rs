use thiserror::Error;

/// Errors surfaced by the middleware layer.
///
/// Driver errors pass through unchanged; everything else is classified by
/// the contract the caller violated or the resource that went away. The
/// `Busy`, `PrematureClose` and `NoPlaceholders` variants render the exact
/// strings callers are expected to match on.
#[derive(Debug, Error)]
pub enum PgMiddlewareError {
    #[error(transparent)]
    Postgres(#[from] tokio_postgres::Error),

    /// A second non-blocking query was submitted while one was in flight.
    #[error("Non-blocking query already in progress")]
    Busy,

    /// The session went away while a non-blocking query was in flight.
    #[error("Premature connection close")]
    PrematureClose,

    /// Parameters were supplied for a statement that has none, e.g. a
    /// dollar-only statement whose `?` is a literal operator.
    #[error("Statement has no placeholders to bind")]
    NoPlaceholders,

    #[error("Usage error: {0}")]
    Usage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("SQL builder error: {0}")]
    Builder(String),
}

impl PgMiddlewareError {
    /// Whether this error indicates the backend connection itself is gone
    /// (as opposed to a server-side statement failure).
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        match self {
            PgMiddlewareError::PrematureClose | PgMiddlewareError::Connection(_) => true,
            PgMiddlewareError::Postgres(e) => e.is_closed(),
            _ => false,
        }
    }
}
