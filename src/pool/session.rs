use tokio::time::Instant;

use super::manager::{CheckedInSession, PoolManager};
use crate::service::TransactionId;

/// The flavor of a pooled session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionKind {
    /// A plain session with no transaction attached.
    ReadOnly,

    /// A session carrying a pre-begun read/write transaction.
    ReadWrite,
}

/// Bookkeeping for one server-side session.
#[derive(Clone, Debug)]
pub(crate) struct SessionRecord {
    pub(super) name: String,
    pub(super) kind: SessionKind,
    pub(super) transaction_id: Option<TransactionId>,

    /// When this session must next be exercised to reset the server-side
    /// idle timer.
    pub(super) refresh_at: Instant,

    /// When this session will be discarded locally.
    pub(super) evict_at: Instant,
}

impl SessionRecord {
    pub(super) fn needs_refresh(&self, now: Instant) -> bool {
        now >= self.refresh_at
    }

    pub(super) fn expired(&self, now: Instant) -> bool {
        now >= self.evict_at
    }
}

/// A session checked out of a [`SessionPool`](crate::SessionPool).
///
/// Dropping the handle returns the session to the pool, where it is
/// re-queued, refreshed, or deleted depending on its age. Use
/// [`discard`](PooledSession::discard) to force deletion instead, and
/// [`mark_used`](PooledSession::mark_used) after running your own request on
/// the session so the pool can skip the next keepalive probe.
#[derive(Debug)]
pub struct PooledSession {
    record: Option<SessionRecord>,
    manager: PoolManager,
    last_activity: Option<Instant>,
}

impl PooledSession {
    pub(super) fn new(record: SessionRecord, manager: PoolManager) -> Self {
        Self {
            record: Some(record),
            manager,
            last_activity: None,
        }
    }

    fn record(&self) -> &SessionRecord {
        self.record.as_ref().expect("session already released")
    }

    /// The opaque server-side name of this session.
    pub fn name(&self) -> &str {
        &self.record().name
    }

    /// Whether this session carries a pre-begun transaction.
    pub fn kind(&self) -> SessionKind {
        self.record().kind
    }

    /// The cached transaction id, present on read/write sessions.
    pub fn transaction_id(&self) -> Option<&TransactionId> {
        self.record().transaction_id.as_ref()
    }

    /// Record that the caller just exercised this session with its own RPC.
    ///
    /// On release the pool resets the session's refresh deadline from this
    /// timestamp instead of issuing a keepalive probe of its own.
    pub fn mark_used(&mut self) {
        self.last_activity = Some(Instant::now());
    }

    /// Return the session to the pool for deletion rather than reuse, e.g.
    /// after an error that leaves its server-side state suspect.
    pub fn discard(mut self) {
        if let Some(record) = self.record.take() {
            let name = record.name.clone();
            if self
                .manager
                .check_in(CheckedInSession {
                    record,
                    last_activity: None,
                    discard: true,
                })
                .is_err()
            {
                tracing::debug!("pool closed before session {} was discarded", name);
            }
        }
    }

    /// Reclaim the record without checking in, leaving `Drop` a no-op. Used
    /// when a delivery raced with the acquirer giving up.
    pub(super) fn into_record(mut self) -> SessionRecord {
        self.record.take().expect("session already released")
    }
}

impl Drop for PooledSession {
    fn drop(&mut self) {
        if let Some(record) = self.record.take() {
            let name = record.name.clone();
            if self
                .manager
                .check_in(CheckedInSession {
                    record,
                    last_activity: self.last_activity.take(),
                    discard: false,
                })
                .is_err()
            {
                // The worker is gone; the server-side session will age out on
                // its own.
                tracing::debug!("pool closed before session {} was checked in", name);
            }
        }
    }
}
