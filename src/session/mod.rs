//! One session per backend connection.
//!
//! A [`Session`] exclusively owns a [`Backend`](crate::backend::Backend)
//! for its lifetime and runs every kind of traffic over it: blocking
//! queries, non-blocking queries with continuations, LISTEN/NOTIFY
//! subscriptions and the transaction guard. Dropping the session offers
//! the backend to the manager's idle cache.

mod dispatch;

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::mpsc::error::TryRecvError;
use tokio_postgres::Notification;
use tokio_postgres::types::{Kind, Type};
use tracing::debug;

use crate::backend::{Backend, BackendEvent, StatementHandle};
use crate::error::PgMiddlewareError;
use crate::manager::ManagerShared;
use crate::results::Results;
use crate::sqlgen::{
    self, DeleteOptions, InsertOptions, SelectOptions, SqlGenerator, Source, UpdateOptions,
};
use crate::transaction::Transaction;
use crate::translation::number_placeholders;
use crate::types::{IsolationLevel, PgValue};

use dispatch::PendingQuery;

/// Handler invoked for every notification delivered to this session.
pub type NotificationHook = Box<dyn FnMut(&Notification) + Send>;
/// Handler invoked when the backend disappears while subscribed.
pub type CloseHook = Box<dyn FnMut() + Send>;

/// A database session: the exclusive owner of one backend connection.
///
/// Sessions are single-owner values; every operation takes `&mut self` and
/// runs strictly sequentially. The socket is attended to (via
/// [`drive`](Session::drive)/[`step`](Session::step)) exactly while a
/// non-blocking query is in flight or the listen set is non-empty.
pub struct Session {
    manager: Option<Arc<ManagerShared>>,
    backend: Option<Backend>,
    listens: HashSet<String>,
    pending: Option<PendingQuery>,
    dollar_only: bool,
    watched: bool,
    generator: SqlGenerator,
    notification_hooks: Vec<NotificationHook>,
    close_hooks: Vec<CloseHook>,
}

impl Session {
    pub(crate) fn new(manager: Arc<ManagerShared>, backend: Backend) -> Self {
        Self {
            manager: Some(manager),
            backend: Some(backend),
            listens: HashSet::new(),
            pending: None,
            dollar_only: false,
            watched: false,
            generator: SqlGenerator::new(),
            notification_hooks: Vec::new(),
            close_hooks: Vec::new(),
        }
    }

    /// Run a query and wait for its results.
    ///
    /// `?` placeholders are numbered into `$N` form unless the one-shot
    /// [`dollar_only`](Session::dollar_only) flag is set. Any pending
    /// notifications are drained and emitted before this returns.
    ///
    /// # Errors
    /// `Busy` while a non-blocking query is in flight; `NoPlaceholders`
    /// when parameters are supplied for a statement without any; driver
    /// errors pass through.
    pub async fn query(
        &mut self,
        sql: &str,
        params: &[PgValue],
    ) -> Result<Results, PgMiddlewareError> {
        let sth = self.prepare(sql, params).await?;
        let client = Arc::clone(self.backend_ref()?.client());
        let outcome = dispatch::execute(&client, &sth, params.to_vec()).await;
        self.drain_inbox();
        let (rows, affected) = outcome?;
        Ok(Results::new(sth, rows, affected))
    }

    /// Generate and run an `INSERT`.
    ///
    /// # Errors
    /// Builder errors for bad option shapes, otherwise as [`query`](Session::query).
    pub async fn insert(
        &mut self,
        table: &str,
        values: &[(&str, PgValue)],
        opts: &InsertOptions,
    ) -> Result<Results, PgMiddlewareError> {
        let q = self.generator.insert(table, values, opts)?;
        self.query(&q.sql, &q.params).await
    }

    /// Generate and run an `UPDATE`.
    ///
    /// # Errors
    /// Builder errors for bad option shapes, otherwise as [`query`](Session::query).
    pub async fn update(
        &mut self,
        table: &str,
        set: &[(&str, PgValue)],
        filter: &[(&str, PgValue)],
        opts: &UpdateOptions,
    ) -> Result<Results, PgMiddlewareError> {
        let q = self.generator.update(table, set, filter, opts)?;
        self.query(&q.sql, &q.params).await
    }

    /// Generate and run a `DELETE`.
    ///
    /// # Errors
    /// Builder errors for bad option shapes, otherwise as [`query`](Session::query).
    pub async fn delete(
        &mut self,
        table: &str,
        filter: &[(&str, PgValue)],
        opts: &DeleteOptions,
    ) -> Result<Results, PgMiddlewareError> {
        let q = self.generator.delete(table, filter, opts)?;
        self.query(&q.sql, &q.params).await
    }

    /// Generate and run a `SELECT`.
    ///
    /// # Errors
    /// Builder errors for bad option shapes, otherwise as [`query`](Session::query).
    pub async fn select(
        &mut self,
        from: &[Source],
        columns: &[&str],
        filter: &[(&str, PgValue)],
        opts: &SelectOptions,
    ) -> Result<Results, PgMiddlewareError> {
        let q = self.generator.select(from, columns, filter, opts)?;
        self.query(&q.sql, &q.params).await
    }

    /// Begin a transaction, optionally at a given isolation level, and
    /// return the scoped guard.
    ///
    /// # Errors
    /// As [`query`](Session::query).
    pub async fn begin(
        &mut self,
        isolation: Option<IsolationLevel>,
    ) -> Result<Transaction, PgMiddlewareError> {
        let sql = match isolation {
            Some(level) => format!("BEGIN ISOLATION LEVEL {}", level.as_sql()),
            None => "BEGIN".to_string(),
        };
        self.query(&sql, &[]).await?;
        Ok(Transaction::new(Arc::downgrade(
            self.backend_ref()?.client(),
        )))
    }

    /// Subscribe to a notification channel. Idempotent per channel; the
    /// socket is attended to from here on.
    ///
    /// # Errors
    /// Driver errors pass through.
    pub async fn listen(&mut self, channel: &str) -> Result<(), PgMiddlewareError> {
        let sql = format!("LISTEN {}", sqlgen::quote_ident(channel));
        self.backend_ref()?.client().batch_execute(&sql).await?;
        self.listens.insert(channel.to_string());
        self.watched = true;
        Ok(())
    }

    /// Unsubscribe from a channel, or from every channel with `"*"`.
    ///
    /// # Errors
    /// Driver errors pass through.
    pub async fn unlisten(&mut self, channel: &str) -> Result<(), PgMiddlewareError> {
        let sql = if channel == "*" {
            "UNLISTEN *".to_string()
        } else {
            format!("UNLISTEN {}", sqlgen::quote_ident(channel))
        };
        self.backend_ref()?.client().batch_execute(&sql).await?;
        if channel == "*" {
            self.listens.clear();
        } else {
            self.listens.remove(channel);
        }
        if self.listens.is_empty() && self.pending.is_none() {
            self.watched = false;
        }
        Ok(())
    }

    /// Whether this session is subscribed to `channel`.
    #[must_use]
    pub fn is_listening(&self, channel: &str) -> bool {
        self.listens.contains(channel)
    }

    /// Send a notification, with an optional payload quoted literally.
    /// Because this session may be subscribed to the same channel, its own
    /// inbox is drained before returning.
    ///
    /// # Errors
    /// Driver errors pass through.
    pub async fn notify(
        &mut self,
        channel: &str,
        payload: Option<&str>,
    ) -> Result<(), PgMiddlewareError> {
        let mut sql = format!("NOTIFY {}", sqlgen::quote_ident(channel));
        if let Some(payload) = payload {
            sql.push_str(", ");
            sql.push_str(&sqlgen::quote_literal(payload));
        }
        self.backend_ref()?.client().batch_execute(&sql).await?;
        self.drain_inbox();
        Ok(())
    }

    /// Server-side backend process id of this session's connection.
    ///
    /// # Errors
    /// Returns a connection error after `disconnect`.
    pub fn pid(&self) -> Result<i32, PgMiddlewareError> {
        Ok(self.backend_ref()?.pid())
    }

    /// Liveness check.
    pub async fn ping(&self) -> bool {
        match &self.backend {
            Some(backend) => backend.ping().await,
            None => false,
        }
    }

    /// Close the connection. An in-flight non-blocking query receives
    /// `Premature connection close`; the backend is not returned to the
    /// cache.
    pub fn disconnect(&mut self) {
        self.watched = false;
        if let Some(pending) = self.pending.take() {
            pending.complete(Some(PgMiddlewareError::PrematureClose), None);
        }
        self.listens.clear();
        self.backend = None;
    }

    /// Restrict placeholder parsing to `$N` for the next statement only, so
    /// `?` stays a literal operator (JSON containment queries).
    pub fn dollar_only(&mut self) -> &mut Self {
        self.dollar_only = true;
        self
    }

    /// Whether the socket is currently being attended to (non-blocking
    /// query in flight, or listen set non-empty).
    #[must_use]
    pub fn is_watched(&self) -> bool {
        self.watched
    }

    /// Names of user-visible tables and views, excluding the `pg_catalog`
    /// and `information_schema` schemas.
    ///
    /// # Errors
    /// As [`query`](Session::query).
    pub async fn tables(&mut self) -> Result<Vec<String>, PgMiddlewareError> {
        let mut results = self
            .query(
                "SELECT table_name::text FROM information_schema.tables \
                 WHERE table_schema NOT IN ('pg_catalog', 'information_schema') \
                 ORDER BY table_name",
                &[],
            )
            .await?;
        let mut names = Vec::new();
        while let Some(row) = results.array()? {
            if let Some(PgValue::Text(name)) = row.into_iter().next() {
                names.push(name);
            }
        }
        Ok(names)
    }

    /// Register a handler for notifications delivered to this session.
    pub fn on_notification<F>(&mut self, hook: F)
    where
        F: FnMut(&Notification) + Send + 'static,
    {
        self.notification_hooks.push(Box::new(hook));
    }

    /// Register a handler for the backend disappearing while subscribed.
    pub fn on_close<F>(&mut self, hook: F)
    where
        F: FnMut() + Send + 'static,
    {
        self.close_hooks.push(Box::new(hook));
    }

    /// Prepare a statement for execution: busy check, placeholder
    /// numbering, statement cache, placeholder/parameter sanity.
    pub(crate) async fn prepare(
        &mut self,
        sql: &str,
        params: &[PgValue],
    ) -> Result<Arc<StatementHandle>, PgMiddlewareError> {
        if self.pending.is_some() {
            return Err(PgMiddlewareError::Busy);
        }
        let translate = !std::mem::take(&mut self.dollar_only);
        let sql = number_placeholders(sql, translate);

        let has_typed = params.iter().any(|p| matches!(p, PgValue::Typed(..)));
        let sth = if has_typed {
            let types: Vec<Type> = params
                .iter()
                .map(|p| match p {
                    PgValue::Typed(ty, _) => ty.clone(),
                    _ => unspecified_type(),
                })
                .collect();
            self.backend_ref()?.prepare_typed(sql.as_ref(), &types).await?
        } else {
            self.backend_mut()?.prepare_cached(sql.as_ref()).await?
        };

        if !params.is_empty() && sth.param_count() == 0 {
            return Err(PgMiddlewareError::NoPlaceholders);
        }
        Ok(sth)
    }

    /// Pull everything currently sitting in the notification inbox and
    /// emit it. A close marker in the inbox triggers close handling and
    /// stops the drain.
    pub(crate) fn drain_inbox(&mut self) {
        loop {
            let event = match self.backend.as_mut() {
                Some(backend) => backend.events_mut().try_recv(),
                None => return,
            };
            match event {
                Ok(BackendEvent::Notification(notification)) => {
                    self.emit_notification(&notification);
                }
                Ok(BackendEvent::Closed(error)) => {
                    self.handle_close(error);
                    return;
                }
                Err(TryRecvError::Empty) => return,
                Err(TryRecvError::Disconnected) => {
                    self.handle_close(None);
                    return;
                }
            }
        }
    }

    pub(crate) fn emit_notification(&mut self, notification: &Notification) {
        for i in 0..self.notification_hooks.len() {
            (self.notification_hooks[i])(notification);
        }
    }

    /// The backend went away: stop attending the socket, poison the
    /// connection, abort the in-flight continuation and, if subscribed,
    /// emit `close` exactly once.
    pub(crate) fn handle_close(&mut self, error: Option<String>) {
        self.watched = false;
        if let Some(backend) = self.backend.as_mut() {
            backend.poison();
        }
        if let Some(pending) = self.pending.take() {
            pending.complete(Some(PgMiddlewareError::PrematureClose), None);
        }
        if !self.listens.is_empty() {
            self.listens.clear();
            debug!(error = error.as_deref(), "backend closed while subscribed");
            for i in 0..self.close_hooks.len() {
                (self.close_hooks[i])();
            }
        }
    }

    pub(crate) fn backend_ref(&self) -> Result<&Backend, PgMiddlewareError> {
        self.backend.as_ref().ok_or_else(disconnected)
    }

    pub(crate) fn backend_mut(&mut self) -> Result<&mut Backend, PgMiddlewareError> {
        self.backend.as_mut().ok_or_else(disconnected)
    }

    pub(crate) fn set_pending(&mut self, pending: PendingQuery) {
        self.pending = Some(pending);
        self.watched = true;
    }

    pub(crate) fn pending_mut(&mut self) -> &mut Option<PendingQuery> {
        &mut self.pending
    }

    pub(crate) fn refresh_watched(&mut self) {
        if self.pending.is_none() && self.listens.is_empty() {
            self.watched = false;
        }
    }
}

fn disconnected() -> PgMiddlewareError {
    PgMiddlewareError::Connection("session has been disconnected".to_string())
}

/// Placeholder type for parameters whose type the server should infer
/// (wire-level oid 0).
fn unspecified_type() -> Type {
    Type::new("unspecified".to_string(), 0, Kind::Simple, String::new())
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(pending) = self.pending.take() {
            pending.complete(Some(PgMiddlewareError::PrematureClose), None);
            // the abandoned query is still running server-side
            if let Some(backend) = self.backend.as_mut() {
                backend.poison();
            }
        }
        let Some(backend) = self.backend.take() else {
            return;
        };
        if backend.poisoned() || !self.listens.is_empty() {
            return;
        }
        if let Some(manager) = self.manager.take() {
            manager.enqueue(backend);
        }
    }
}
