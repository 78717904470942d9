use std::collections::VecDeque;
use std::fmt;
use std::future::poll_fn;
use std::sync::Arc;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_postgres::tls::NoTlsStream;
use tokio_postgres::types::Type;
use tokio_postgres::{AsyncMessage, Client, Connection, NoTls, Socket, Statement};
use tracing::debug;

use crate::config::PgSettings;
use crate::error::PgMiddlewareError;

/// Out-of-band traffic forwarded from the connection driver task:
/// notifications in arrival order, then a final close marker when the
/// backend goes away.
pub(crate) enum BackendEvent {
    Notification(tokio_postgres::Notification),
    Closed(Option<String>),
}

/// A prepared statement together with the SQL text it was prepared from.
///
/// Handles are shared (`Arc`) between the per-connection statement cache
/// and the [`Results`](crate::Results) values produced from them, so a
/// handle stays valid for as long as anything still reads from it.
pub struct StatementHandle {
    sql: String,
    stmt: Statement,
}

impl StatementHandle {
    #[must_use]
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Names of the columns this statement produces.
    #[must_use]
    pub fn columns(&self) -> Vec<String> {
        self.stmt
            .columns()
            .iter()
            .map(|c| c.name().to_string())
            .collect()
    }

    pub(crate) fn statement(&self) -> &Statement {
        &self.stmt
    }

    pub(crate) fn param_count(&self) -> usize {
        self.stmt.params().len()
    }
}

impl fmt::Debug for StatementHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatementHandle")
            .field("sql", &self.sql)
            .finish_non_exhaustive()
    }
}

/// Bounded per-connection cache of prepared statements, keyed by SQL text.
///
/// At most one ACTIVE statement is served per text: a cached handle that is
/// still referenced elsewhere (a live `Results`, an in-flight query) is
/// passed over and a fresh handle takes its slot. The least-recently-used
/// entry is evicted past capacity; anything still referenced survives
/// through its `Arc`.
struct StatementCache {
    capacity: usize,
    entries: VecDeque<Arc<StatementHandle>>,
}

impl StatementCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: VecDeque::new(),
        }
    }

    fn get(&mut self, sql: &str) -> Option<Arc<StatementHandle>> {
        let pos = self.entries.iter().position(|h| h.sql == sql)?;
        if Arc::strong_count(&self.entries[pos]) > 1 {
            return None;
        }
        let handle = self.entries.remove(pos)?;
        self.entries.push_back(Arc::clone(&handle));
        Some(handle)
    }

    fn insert(&mut self, handle: Arc<StatementHandle>) {
        self.entries.retain(|h| h.sql != handle.sql);
        self.entries.push_back(handle);
        while self.entries.len() > self.capacity {
            self.entries.pop_front();
        }
    }
}

/// One backend connection: the driver client, the spawned task that keeps
/// its socket polled and forwards notifications, the server-side backend
/// pid, and the statement cache.
pub struct Backend {
    client: Arc<Client>,
    events: UnboundedReceiver<BackendEvent>,
    pid: i32,
    no_reuse: bool,
    statements: StatementCache,
}

impl fmt::Debug for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backend")
            .field("pid", &self.pid)
            .field("no_reuse", &self.no_reuse)
            .finish_non_exhaustive()
    }
}

impl Backend {
    /// Open a new backend connection and spawn its driver task.
    pub(crate) async fn connect(settings: &PgSettings) -> Result<Self, PgMiddlewareError> {
        let (client, connection) = settings.config().connect(NoTls).await?;
        let (events_tx, events) = mpsc::unbounded_channel();
        tokio::spawn(forward_messages(connection, events_tx));

        let client = Arc::new(client);
        let row = client.query_one("SELECT pg_backend_pid()", &[]).await?;
        let pid: i32 = row.get(0);
        debug!(pid, "backend connected");

        Ok(Self {
            client,
            events,
            pid,
            no_reuse: false,
            statements: StatementCache::new(settings.statement_cache_value()),
        })
    }

    /// Server-side backend process id.
    #[must_use]
    pub fn pid(&self) -> i32 {
        self.pid
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.client.is_closed()
    }

    pub(crate) fn client(&self) -> &Arc<Client> {
        &self.client
    }

    pub(crate) fn events_mut(&mut self) -> &mut UnboundedReceiver<BackendEvent> {
        &mut self.events
    }

    pub(crate) fn poison(&mut self) {
        self.no_reuse = true;
    }

    pub(crate) fn poisoned(&self) -> bool {
        self.no_reuse
    }

    /// Liveness check over the simple-query protocol.
    pub(crate) async fn ping(&self) -> bool {
        !self.client.is_closed() && self.client.simple_query("SELECT 1").await.is_ok()
    }

    /// Prepare `sql` through the statement cache. Identical text yields the
    /// same handle as long as no other live `Results` holds it.
    pub(crate) async fn prepare_cached(
        &mut self,
        sql: &str,
    ) -> Result<Arc<StatementHandle>, PgMiddlewareError> {
        if let Some(handle) = self.statements.get(sql) {
            return Ok(handle);
        }
        let stmt = self.client.prepare(sql).await?;
        let handle = Arc::new(StatementHandle {
            sql: sql.to_string(),
            stmt,
        });
        self.statements.insert(Arc::clone(&handle));
        Ok(handle)
    }

    /// Prepare with explicit parameter types. Typed statements bypass the
    /// cache, which is keyed by text alone.
    pub(crate) async fn prepare_typed(
        &self,
        sql: &str,
        types: &[Type],
    ) -> Result<Arc<StatementHandle>, PgMiddlewareError> {
        let stmt = self.client.prepare_typed(sql, types).await?;
        Ok(Arc::new(StatementHandle {
            sql: sql.to_string(),
            stmt,
        }))
    }
}

/// Drives the connection until it ends, forwarding notifications. The task
/// exits when the socket closes or every receiver is gone; dropping the
/// `Backend` (and its client) lets the driver flush its goodbye and wind
/// down on its own.
async fn forward_messages(
    mut connection: Connection<Socket, NoTlsStream>,
    events: UnboundedSender<BackendEvent>,
) {
    loop {
        match poll_fn(|cx| connection.poll_message(cx)).await {
            Some(Ok(AsyncMessage::Notification(notification))) => {
                if events
                    .send(BackendEvent::Notification(notification))
                    .is_err()
                {
                    break;
                }
            }
            Some(Ok(_)) => {
                // notices are dropped
            }
            Some(Err(e)) => {
                debug!(error = %e, "backend connection errored");
                let _ = events.send(BackendEvent::Closed(Some(e.to_string())));
                break;
            }
            None => {
                let _ = events.send(BackendEvent::Closed(None));
                break;
            }
        }
    }
}
