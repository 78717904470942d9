use std::collections::VecDeque;
use std::process;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::debug;

use crate::backend::Backend;
use crate::config::PgSettings;
use crate::error::PgMiddlewareError;
use crate::session::Session;

type ConnectionHook = Box<dyn Fn(&Backend) + Send>;

/// Bounded idle queue: LIFO for reuse, FIFO for eviction.
pub(crate) struct IdleQueue<T> {
    capacity: usize,
    entries: VecDeque<T>,
}

impl<T> IdleQueue<T> {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: VecDeque::new(),
        }
    }

    /// Admit an entry, returning the oldest entries evicted to stay within
    /// capacity.
    fn push(&mut self, entry: T) -> Vec<T> {
        self.entries.push_back(entry);
        let mut evicted = Vec::new();
        while self.entries.len() > self.capacity {
            if let Some(oldest) = self.entries.pop_front() {
                evicted.push(oldest);
            }
        }
        evicted
    }

    /// The most recently admitted entry.
    fn pop_latest(&mut self) -> Option<T> {
        self.entries.pop_back()
    }

    fn set_capacity(&mut self, capacity: usize) -> Vec<T> {
        self.capacity = capacity;
        let mut evicted = Vec::new();
        while self.entries.len() > self.capacity {
            if let Some(oldest) = self.entries.pop_front() {
                evicted.push(oldest);
            }
        }
        evicted
    }

    fn drain_all(&mut self) -> Vec<T> {
        self.entries.drain(..).collect()
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// State shared between the manager and the sessions it hands out, so a
/// dropping session can offer its backend back to the cache.
pub(crate) struct ManagerShared {
    settings: PgSettings,
    owner_pid: AtomicU32,
    cache: Mutex<IdleQueue<Backend>>,
    hooks: Mutex<Vec<ConnectionHook>>,
}

impl ManagerShared {
    /// Offer a backend back to the idle cache. Admission preconditions
    /// (not poisoned, no async in flight, no listens) are checked by the
    /// dropping session; overflow evicts the oldest idle entries.
    pub(crate) fn enqueue(&self, backend: Backend) {
        let evicted = lock(&self.cache).push(backend);
        for backend in evicted {
            debug!(pid = backend.pid(), "evicting idle backend");
        }
    }

    fn emit_connection(&self, backend: &Backend) {
        for hook in lock(&self.hooks).iter() {
            hook(backend);
        }
    }

    /// Fork guard: when the current process is not the recorded owner, the
    /// idle cache belongs to the parent. Its entries are dropped without a
    /// protocol-level goodbye (the parent's driver tasks do not run here,
    /// so nothing is written to the shared sockets) and ownership moves to
    /// the current process.
    fn check_fork(&self) {
        let current = process::id();
        if self.owner_pid.swap(current, Ordering::SeqCst) != current {
            let orphaned = lock(&self.cache).drain_all();
            if !orphaned.is_empty() {
                debug!(
                    count = orphaned.len(),
                    "discarding idle cache after process change"
                );
            }
        }
    }
}

/// Hands out [`Session`]s, caching idle backend connections in between.
///
/// The cache reuses the most recently returned backend first (LIFO) and
/// evicts the oldest when over capacity (FIFO). The owning process id is
/// recorded at construction; a session request from a different process
/// discards the inherited cache and starts fresh, so forked children never
/// share backends with their parent.
///
/// ```rust,no_run
/// use pg_middleware::{PgMiddlewareError, SessionManager};
///
/// # async fn demo() -> Result<(), PgMiddlewareError> {
/// let manager = SessionManager::from_url("postgresql://app@localhost/orders")?;
/// let mut db = manager.session().await?;
/// let row = db.query("SELECT 1 AS one", &[]).await?.hash()?;
/// # let _ = row;
/// # Ok(()) }
/// ```
pub struct SessionManager {
    shared: Arc<ManagerShared>,
}

impl SessionManager {
    #[must_use]
    pub fn new(settings: PgSettings) -> Self {
        let capacity = settings.max_idle_value();
        Self {
            shared: Arc::new(ManagerShared {
                settings,
                owner_pid: AtomicU32::new(process::id()),
                cache: Mutex::new(IdleQueue::new(capacity)),
                hooks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Build a manager straight from a connection URL.
    ///
    /// # Errors
    /// Returns `PgMiddlewareError::Config` when the URL does not parse.
    pub fn from_url(url: &str) -> Result<Self, PgMiddlewareError> {
        Ok(Self::new(PgSettings::from_url(url)?))
    }

    /// Produce a session bound to a backend connection: the most recently
    /// cached backend that still pings, or a freshly opened one with the
    /// configured initializers applied and the `connection` hooks fired.
    ///
    /// # Errors
    /// Connection and driver errors from opening or initializing a new
    /// backend.
    pub async fn session(&self) -> Result<Session, PgMiddlewareError> {
        self.shared.check_fork();

        loop {
            let candidate = lock(&self.shared.cache).pop_latest();
            let Some(backend) = candidate else { break };
            if backend.ping().await {
                debug!(pid = backend.pid(), "reusing cached backend");
                return Ok(Session::new(Arc::clone(&self.shared), backend));
            }
            debug!(pid = backend.pid(), "dropping dead cached backend");
        }

        let backend = Backend::connect(&self.shared.settings).await?;
        if let Some(sql) = self.shared.settings.search_path_sql() {
            backend.client().batch_execute(&sql).await?;
        }
        for sql in self.shared.settings.on_connect_statements() {
            backend.client().batch_execute(sql).await?;
        }
        self.shared.emit_connection(&backend);
        Ok(Session::new(Arc::clone(&self.shared), backend))
    }

    /// Resize the idle cache; excess idle backends are dropped immediately.
    pub fn max_connections(&self, capacity: usize) {
        let evicted = lock(&self.shared.cache).set_capacity(capacity);
        for backend in evicted {
            debug!(pid = backend.pid(), "evicting idle backend on resize");
        }
    }

    /// Number of backends currently sitting idle in the cache.
    #[must_use]
    pub fn idle_count(&self) -> usize {
        lock(&self.shared.cache).len()
    }

    /// Register a hook fired with each newly opened backend, exactly once
    /// per backend.
    pub fn on_connection<F>(&self, hook: F)
    where
        F: Fn(&Backend) + Send + 'static,
    {
        lock(&self.shared.hooks).push(Box::new(hook));
    }

    /// Overwrite the recorded owning process id. Test hook for exercising
    /// the fork guard without forking.
    #[doc(hidden)]
    pub fn reset_owner_pid(&self, pid: u32) {
        self.shared.owner_pid.store(pid, Ordering::SeqCst);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_queue_reuses_lifo() {
        let mut queue = IdleQueue::new(3);
        assert!(queue.push(1).is_empty());
        assert!(queue.push(2).is_empty());
        assert!(queue.push(3).is_empty());
        assert_eq!(queue.pop_latest(), Some(3));
        assert_eq!(queue.pop_latest(), Some(2));
        assert_eq!(queue.pop_latest(), Some(1));
        assert_eq!(queue.pop_latest(), None);
    }

    #[test]
    fn idle_queue_evicts_fifo_on_overflow() {
        let mut queue = IdleQueue::new(2);
        assert!(queue.push(1).is_empty());
        assert!(queue.push(2).is_empty());
        assert_eq!(queue.push(3), vec![1]);
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pop_latest(), Some(3));
    }

    #[test]
    fn idle_queue_resize_evicts_oldest() {
        let mut queue = IdleQueue::new(4);
        for n in 1..=4 {
            queue.push(n);
        }
        assert_eq!(queue.set_capacity(2), vec![1, 2]);
        assert_eq!(queue.pop_latest(), Some(4));
        assert_eq!(queue.pop_latest(), Some(3));
    }

    #[test]
    fn idle_queue_drains_everything() {
        let mut queue = IdleQueue::new(3);
        queue.push("a");
        queue.push("b");
        assert_eq!(queue.drain_all(), vec!["a", "b"]);
        assert_eq!(queue.len(), 0);
    }
}
