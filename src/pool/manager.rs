use tokio::{
    sync::{mpsc, oneshot},
    time::Instant,
};

use super::session::{SessionKind, SessionRecord};
use crate::{error::Error, service::TransactionId};

/// A session being returned to the pool, along with everything the worker
/// needs to triage it.
#[derive(Debug)]
pub(crate) struct CheckedInSession {
    pub(super) record: SessionRecord,

    /// When the caller last exercised the session itself, if it said so via
    /// `mark_used`.
    pub(super) last_activity: Option<Instant>,

    /// Delete rather than reuse.
    pub(super) discard: bool,
}

/// Completion signal for a `Maintain` or `Shutdown` request. The worker
/// resolves it once the request has taken effect; a shutdown completion is
/// held back until every session has been returned and every in-flight RPC
/// has settled.
#[derive(Debug)]
pub(super) struct Completion {
    notifier: oneshot::Sender<()>,
}

impl Completion {
    fn channel() -> (Completion, CompletionReceiver) {
        let (notifier, receiver) = oneshot::channel();
        (Completion { notifier }, CompletionReceiver { receiver })
    }

    /// Mark the request as done.
    pub(super) fn resolve(self) {
        // returns an error when the caller stopped waiting, which is fine;
        // the work happened regardless.
        let _: std::result::Result<_, _> = self.notifier.send(());
    }
}

/// Waits for the worker to resolve a `Maintain` or `Shutdown` request.
/// Returns quietly if the worker exits without resolving it.
#[derive(Debug)]
pub(super) struct CompletionReceiver {
    receiver: oneshot::Receiver<()>,
}

impl CompletionReceiver {
    pub(super) async fn wait(self) {
        let _: std::result::Result<_, _> = self.receiver.await;
    }
}

#[derive(Debug)]
pub(super) enum PoolManagementRequest {
    /// Check a session back into the pool.
    CheckIn(Box<CheckedInSession>),

    /// A spawned creation task produced a session.
    CreationSucceeded {
        kind: SessionKind,
        name: String,
        transaction_id: Option<TransactionId>,
    },

    /// A spawned creation task gave up.
    CreationFailed { kind: SessionKind, error: Error },

    /// A keepalive probe completed for an idle session.
    RefreshSucceeded(Box<SessionRecord>),

    /// A keepalive probe failed; the session is no longer trusted.
    RefreshFailed {
        record: Box<SessionRecord>,
        error: Error,
    },

    /// Run one maintenance tick (fill, refresh, evict).
    Maintain(Completion),

    /// Begin shutdown; resolved once the pool is quiescent.
    Shutdown(Completion),
}

/// Handle for making management requests to the pool worker. Unlike a
/// `SessionRequester`, cloning this does not keep the worker alive, which
/// lets checked-out sessions hold one without pinning the pool.
#[derive(Clone, Debug)]
pub(crate) struct PoolManager {
    sender: mpsc::UnboundedSender<PoolManagementRequest>,
}

impl PoolManager {
    pub(super) fn channel() -> (PoolManager, ManagementRequestReceiver) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, ManagementRequestReceiver { receiver })
    }

    /// Check a session back in, handing it back on failure so the caller can
    /// log that the pool is gone.
    pub(crate) fn check_in(
        &self,
        session: CheckedInSession,
    ) -> std::result::Result<(), CheckedInSession> {
        self.sender
            .send(PoolManagementRequest::CheckIn(Box::new(session)))
            .map_err(|request| match request.0 {
                PoolManagementRequest::CheckIn(session) => *session,
                _ => unreachable!(),
            })
    }

    pub(super) fn creation_succeeded(
        &self,
        kind: SessionKind,
        name: String,
        transaction_id: Option<TransactionId>,
    ) {
        let _ = self.sender.send(PoolManagementRequest::CreationSucceeded {
            kind,
            name,
            transaction_id,
        });
    }

    pub(super) fn creation_failed(&self, kind: SessionKind, error: Error) {
        let _ = self
            .sender
            .send(PoolManagementRequest::CreationFailed { kind, error });
    }

    pub(super) fn refresh_succeeded(&self, record: SessionRecord) {
        let _ = self
            .sender
            .send(PoolManagementRequest::RefreshSucceeded(Box::new(record)));
    }

    pub(super) fn refresh_failed(&self, record: SessionRecord, error: Error) {
        let _ = self.sender.send(PoolManagementRequest::RefreshFailed {
            record: Box::new(record),
            error,
        });
    }

    /// Ask the worker to run one maintenance tick. Returns `None` if the
    /// worker has already exited.
    pub(super) fn maintain(&self) -> Option<CompletionReceiver> {
        let (completion, receiver) = Completion::channel();
        self.sender
            .send(PoolManagementRequest::Maintain(completion))
            .ok()
            .map(|()| receiver)
    }

    /// Ask the worker to shut the pool down. Returns `None` if the worker
    /// has already exited.
    pub(super) fn shutdown(&self) -> Option<CompletionReceiver> {
        let (completion, receiver) = Completion::channel();
        self.sender
            .send(PoolManagementRequest::Shutdown(completion))
            .ok()
            .map(|()| receiver)
    }
}

/// Receiving end of a `PoolManager`.
#[derive(Debug)]
pub(super) struct ManagementRequestReceiver {
    receiver: mpsc::UnboundedReceiver<PoolManagementRequest>,
}

impl ManagementRequestReceiver {
    pub(super) async fn recv(&mut self) -> Option<PoolManagementRequest> {
        self.receiver.recv().await
    }
}
