//! Non-blocking query submission and the reactor-side dispatch loop.

use std::future::{Future, poll_fn};
use std::pin::Pin;
use std::sync::Arc;
use std::task::Poll;

use futures_util::TryStreamExt;
use tokio_postgres::types::ToSql;
use tokio_postgres::{Client, Row};

use crate::backend::{BackendEvent, StatementHandle};
use crate::error::PgMiddlewareError;
use crate::results::Results;
use crate::types::PgValue;

use super::Session;

/// Continuation invoked when a non-blocking query completes. On success the
/// error is `None`; on a server error the `Results` still carries the
/// statement handle and error text; on premature close the results are
/// `None`.
pub type Continuation = Box<dyn FnOnce(Option<PgMiddlewareError>, Option<Results>) + Send>;

type QueryFuture =
    Pin<Box<dyn Future<Output = Result<(Vec<Row>, u64), tokio_postgres::Error>> + Send>>;

/// The waiting slot: one submitted query, its statement handle and the
/// continuation to hand the outcome to.
pub(crate) struct PendingQuery {
    future: QueryFuture,
    sth: Arc<StatementHandle>,
    continuation: Continuation,
}

impl PendingQuery {
    pub(crate) fn complete(self, error: Option<PgMiddlewareError>, results: Option<Results>) {
        (self.continuation)(error, results);
    }
}

/// Run a prepared statement to completion, returning the rows and the
/// affected-row count.
pub(crate) async fn execute(
    client: &Client,
    sth: &StatementHandle,
    params: Vec<PgValue>,
) -> Result<(Vec<Row>, u64), tokio_postgres::Error> {
    let stream = client
        .query_raw(
            sth.statement(),
            params.iter().map(|p| p as &(dyn ToSql + Sync)),
        )
        .await?;
    futures_util::pin_mut!(stream);
    let mut rows = Vec::new();
    while let Some(row) = stream.try_next().await? {
        rows.push(row);
    }
    let affected = stream.rows_affected().unwrap_or(rows.len() as u64);
    Ok((rows, affected))
}

enum Wake {
    Event(Option<BackendEvent>),
    Complete(Result<(Vec<Row>, u64), tokio_postgres::Error>),
}

impl Session {
    /// Submit a query without waiting for it; the continuation fires from
    /// [`drive`](Session::drive)/[`step`](Session::step) once the driver
    /// reports completion. At most one non-blocking query may be in flight
    /// per session.
    ///
    /// # Errors
    /// `Busy` while another non-blocking query is in flight, otherwise as
    /// [`query`](Session::query). Submission errors are returned here;
    /// execution errors go to the continuation.
    pub async fn query_async<F>(
        &mut self,
        sql: &str,
        params: &[PgValue],
        continuation: F,
    ) -> Result<(), PgMiddlewareError>
    where
        F: FnOnce(Option<PgMiddlewareError>, Option<Results>) + Send + 'static,
    {
        let sth = self.prepare(sql, params).await?;
        let client = Arc::clone(self.backend_ref()?.client());
        let stmt = Arc::clone(&sth);
        let owned = params.to_vec();
        let future: QueryFuture =
            Box::pin(async move { execute(&client, &stmt, owned).await });
        self.set_pending(PendingQuery {
            future,
            sth,
            continuation: Box::new(continuation),
        });
        Ok(())
    }

    /// Process wake-ups until the session is no longer watched, i.e. until
    /// no non-blocking query is in flight and the listen set is empty.
    ///
    /// # Errors
    /// Returns a connection error when called on a disconnected session;
    /// server errors never propagate out of the loop.
    pub async fn drive(&mut self) -> Result<(), PgMiddlewareError> {
        while self.is_watched() {
            self.step().await?;
        }
        Ok(())
    }

    /// Wait for one wake-up and dispatch it: notifications are drained and
    /// emitted first, then a completed non-blocking query is delivered to
    /// its continuation.
    ///
    /// # Errors
    /// Returns a connection error when called on a disconnected session.
    pub async fn step(&mut self) -> Result<(), PgMiddlewareError> {
        let wake = {
            let Session {
                backend, pending, ..
            } = self;
            let backend = backend.as_mut().ok_or_else(|| {
                PgMiddlewareError::Connection("session has been disconnected".to_string())
            })?;
            poll_fn(|cx| {
                // inbox first, so notifications always precede a completion
                // delivered on the same wake-up
                if let Poll::Ready(event) = backend.events_mut().poll_recv(cx) {
                    return Poll::Ready(Wake::Event(event));
                }
                if let Some(pending) = pending.as_mut() {
                    if let Poll::Ready(outcome) = pending.future.as_mut().poll(cx) {
                        return Poll::Ready(Wake::Complete(outcome));
                    }
                }
                Poll::Pending
            })
            .await
        };

        match wake {
            Wake::Event(Some(BackendEvent::Notification(notification))) => {
                self.emit_notification(&notification);
                self.drain_inbox();
            }
            Wake::Event(Some(BackendEvent::Closed(error))) => self.handle_close(error),
            Wake::Event(None) => self.handle_close(None),
            Wake::Complete(outcome) => self.complete_pending(outcome),
        }
        self.refresh_watched();
        Ok(())
    }

    fn complete_pending(&mut self, outcome: Result<(Vec<Row>, u64), tokio_postgres::Error>) {
        let Some(pending) = self.pending_mut().take() else {
            return;
        };
        let PendingQuery {
            sth, continuation, ..
        } = pending;
        match outcome {
            Ok((rows, affected)) => {
                continuation(None, Some(Results::new(sth, rows, affected)));
            }
            Err(error) => {
                let results = Results::failed(Arc::clone(&sth), error.to_string());
                continuation(Some(PgMiddlewareError::Postgres(error)), Some(results));
            }
        }
    }
}
