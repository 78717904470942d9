use std::sync::Weak;

use tokio_postgres::Client;
use tracing::debug;

use crate::error::PgMiddlewareError;
use crate::sqlgen::quote_ident;

/// Lifecycle state of a [`Transaction`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    Open,
    Committed,
    RolledBack,
}

/// Scoped transaction guard returned by [`Session::begin`](crate::Session::begin).
///
/// Holds a weak reference to the session's client: dropping the guard while
/// still open schedules a `ROLLBACK` if the session is still alive, so any
/// path out of the enclosing scope that does not `commit` rolls back.
/// Queries are not serialized through the guard; they keep flowing through
/// the session, which owns the single backend connection.
#[must_use = "dropping an open transaction rolls it back"]
pub struct Transaction {
    client: Weak<Client>,
    state: TxState,
}

impl Transaction {
    pub(crate) fn new(client: Weak<Client>) -> Self {
        Self {
            client,
            state: TxState::Open,
        }
    }

    #[must_use]
    pub fn state(&self) -> TxState {
        self.state
    }

    /// Commit the transaction.
    ///
    /// # Errors
    /// Returns an error if the session is gone or the `COMMIT` fails; a
    /// failed commit still rolls back on drop.
    pub async fn commit(mut self) -> Result<(), PgMiddlewareError> {
        self.exec("COMMIT").await?;
        self.state = TxState::Committed;
        Ok(())
    }

    /// Roll the transaction back explicitly.
    ///
    /// # Errors
    /// Returns an error if the session is gone or the `ROLLBACK` fails.
    pub async fn rollback(mut self) -> Result<(), PgMiddlewareError> {
        self.exec("ROLLBACK").await?;
        self.state = TxState::RolledBack;
        Ok(())
    }

    /// Create a savepoint.
    ///
    /// # Errors
    /// Returns an error if the session is gone or the statement fails.
    pub async fn savepoint(&mut self, name: &str) -> Result<(), PgMiddlewareError> {
        self.exec(&format!("SAVEPOINT {}", quote_ident(name))).await
    }

    /// Release a savepoint.
    ///
    /// # Errors
    /// Returns an error if the session is gone or the statement fails.
    pub async fn release(&mut self, name: &str) -> Result<(), PgMiddlewareError> {
        self.exec(&format!("RELEASE SAVEPOINT {}", quote_ident(name)))
            .await
    }

    /// Roll back to a savepoint, keeping the transaction open.
    ///
    /// # Errors
    /// Returns an error if the session is gone or the statement fails.
    pub async fn rollback_to(&mut self, name: &str) -> Result<(), PgMiddlewareError> {
        self.exec(&format!("ROLLBACK TO SAVEPOINT {}", quote_ident(name)))
            .await
    }

    async fn exec(&self, sql: &str) -> Result<(), PgMiddlewareError> {
        let Some(client) = self.client.upgrade() else {
            return Err(PgMiddlewareError::Connection(
                "session for this transaction is gone".to_string(),
            ));
        };
        client.batch_execute(sql).await?;
        Ok(())
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.state != TxState::Open {
            return;
        }
        let Some(client) = self.client.upgrade() else {
            return;
        };
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            debug!("rolling back open transaction on drop");
            handle.spawn(async move {
                let _ = client.batch_execute("ROLLBACK").await;
            });
        }
    }
}
