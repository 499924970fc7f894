//! The per-database session pool.

mod manager;
mod session;
mod session_requester;
mod status;
#[cfg(test)]
pub(crate) mod test;
mod worker;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

pub use self::session::{PooledSession, SessionKind};
use self::{
    manager::PoolManager,
    session_requester::SessionRequester,
    status::{PoolStatus, StatusSubscriber},
    worker::SessionPoolWorker,
};
use crate::{
    error::{Error, Result},
    options::SessionPoolOptions,
    service::SessionService,
};

/// A pool of sessions for one database.
///
/// Cloning is cheap and clones share the same underlying pool. The pool's
/// bookkeeping lives in a background worker task; when every clone has been
/// dropped, the worker deletes its idle sessions and exits.
///
/// ```rust,no_run
/// # use std::sync::Arc;
/// # use sessionpool::{Result, SessionKind, SessionPool, SessionPoolOptions, SessionService};
/// # async fn example(service: Arc<dyn SessionService>) -> Result<()> {
/// let pool = SessionPool::new(
///     "projects/p/instances/i/databases/d",
///     service,
///     SessionPoolOptions::default(),
/// )?;
/// let session = pool.acquire(SessionKind::ReadOnly).await?;
/// println!("using session {}", session.name());
/// drop(session); // returns it to the pool
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct SessionPool {
    database: String,
    options: SessionPoolOptions,
    requester: SessionRequester,
    manager: PoolManager,
    status: StatusSubscriber,
}

impl SessionPool {
    /// Create a pool for `database`, spawning its worker task. Fails if
    /// `options` are inconsistent. Must be called from within a tokio
    /// runtime.
    pub fn new(
        database: impl Into<String>,
        service: Arc<dyn SessionService>,
        options: SessionPoolOptions,
    ) -> Result<Self> {
        options.validate()?;
        Ok(Self::with_validated_options(
            database.into(),
            service,
            options,
        ))
    }

    pub(crate) fn with_validated_options(
        database: String,
        service: Arc<dyn SessionService>,
        options: SessionPoolOptions,
    ) -> Self {
        let (manager, requester, status) =
            SessionPoolWorker::start(database.clone(), service, options.clone());
        Self {
            database,
            options,
            requester,
            manager,
            status,
        }
    }

    /// The database this pool serves.
    pub fn database(&self) -> &str {
        &self.database
    }

    /// Check a session out of the pool, waiting up to the configured
    /// `acquire_timeout` for one to become available.
    ///
    /// A `ReadOnly` acquisition may be handed a `ReadWrite` session; a
    /// `ReadWrite` acquisition always gets one with a pre-begun transaction.
    pub async fn acquire(&self, kind: SessionKind) -> Result<PooledSession> {
        let receiver = self.requester.request(kind);
        match tokio::time::timeout(self.options.acquire_timeout, receiver).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::internal("session pool worker exited")),
            Err(_) => Err(Error::resource_exhausted(format!(
                "timed out after {:?} waiting for a session to {}",
                self.options.acquire_timeout, self.database
            ))),
        }
    }

    /// Like [`acquire`](SessionPool::acquire), but also gives up with
    /// `Canceled` when `cancel` fires. Cancelling one acquisition never
    /// affects another, and a session on its way to a canceled acquirer is
    /// re-routed to the next waiter.
    pub async fn acquire_with(
        &self,
        kind: SessionKind,
        cancel: &CancellationToken,
    ) -> Result<PooledSession> {
        let receiver = self.requester.request(kind);
        let wait = async {
            tokio::select! {
                result = receiver => match result {
                    Ok(result) => result,
                    Err(_) => Err(Error::internal("session pool worker exited")),
                },
                _ = cancel.cancelled() => {
                    Err(Error::canceled("session acquisition was canceled"))
                },
            }
        };
        match tokio::time::timeout(self.options.acquire_timeout, wait).await {
            Ok(result) => result,
            Err(_) => Err(Error::resource_exhausted(format!(
                "timed out after {:?} waiting for a session to {}",
                self.options.acquire_timeout, self.database
            ))),
        }
    }

    /// Wait until the pool's warm floor is met: at least `min_sessions` idle
    /// sessions, of which at least the configured write fraction are
    /// read/write.
    ///
    /// Fails immediately with the recorded error if the pool is unhealthy,
    /// letting callers fail fast on a bad backend; fails with `Canceled` on
    /// shutdown.
    pub async fn wait_until_ready(&self) -> Result<()> {
        let mut status = self.status.clone();
        status
            .wait_until_ready(
                self.options.min_sessions,
                self.options.write_session_target(),
            )
            .await
    }

    /// Like [`wait_until_ready`](SessionPool::wait_until_ready), but also
    /// gives up with `Canceled` when `cancel` fires.
    pub async fn wait_until_ready_with(&self, cancel: &CancellationToken) -> Result<()> {
        tokio::select! {
            result = self.wait_until_ready() => result,
            _ = cancel.cancelled() => Err(Error::canceled("wait for session pool was canceled")),
        }
    }

    /// Run one maintenance tick: evict aged-out idle sessions, probe stale
    /// ones, and fill the warm floor. A [`PoolRegistry`](crate::PoolRegistry)
    /// calls this on a timer; tests drive it directly.
    pub async fn maintain(&self) {
        if let Some(done) = self.manager.maintain() {
            done.wait().await;
        }
    }

    /// Shut the pool down. Idle sessions are deleted immediately, waiting
    /// acquirers fail with `Canceled`, and subsequent
    /// [`acquire`](SessionPool::acquire) calls fail with `InvalidState`.
    ///
    /// Resolves once every checked-out session has been returned and every
    /// in-flight creation has settled. Dropping the future does not stop the
    /// shutdown, only the wait for it.
    pub async fn shutdown(&self) {
        if let Some(done) = self.manager.shutdown() {
            done.wait().await;
        }
    }

    /// A point-in-time snapshot of the pool's counters. Lock-free; reads the
    /// worker's latest published state.
    pub fn statistics(&self) -> PoolStatistics {
        self.status.latest().into()
    }
}

/// A snapshot of a pool's counters, as returned by
/// [`SessionPool::statistics`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[non_exhaustive]
pub struct PoolStatistics {
    /// Sessions currently checked out.
    pub active_sessions: u32,

    /// Creation RPCs currently in flight.
    pub in_flight_creates: u32,

    /// Idle read-only sessions.
    pub read_pool: u32,

    /// Idle read/write sessions.
    pub read_write_pool: u32,

    /// Whether the pool has been shut down.
    pub shutdown: bool,
}

impl From<PoolStatus> for PoolStatistics {
    fn from(status: PoolStatus) -> Self {
        Self {
            active_sessions: status.active,
            in_flight_creates: status.in_flight_creates,
            read_pool: status.read_idle,
            read_write_pool: status.write_idle,
            shutdown: status.shutdown,
        }
    }
}
