use tokio::sync::{mpsc, oneshot};

use super::session::{PooledSession, SessionKind};
use crate::error::Result;

/// Returns a new requester/receiver pair.
pub(super) fn channel() -> (SessionRequester, SessionRequestReceiver) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (
        SessionRequester { sender },
        SessionRequestReceiver { receiver },
    )
}

/// Handle for requesting sessions from the pool worker.
///
/// Requesters are the only holders of the checkout channel's send side, so
/// this channel closing is how the worker learns that every pool handle is
/// gone and it should delete its idle sessions and exit. Management handles
/// held by checked-out sessions and spawned RPC tasks deliberately do not
/// keep the pool alive.
#[derive(Clone, Debug)]
pub(super) struct SessionRequester {
    sender: mpsc::UnboundedSender<RequestMessage>,
}

impl SessionRequester {
    /// Ask the worker for a session of the given kind. The returned slot
    /// resolves once the worker delivers a session or an error; dropping it
    /// withdraws the request, and the worker re-routes any session that was
    /// on its way here.
    pub(super) fn request(&self, kind: SessionKind) -> oneshot::Receiver<Result<PooledSession>> {
        let (sender, receiver) = oneshot::channel();

        // this only errors if the worker has exited, which cannot happen
        // while a requester is still alive to make the call.
        let _: std::result::Result<_, _> = self.sender.send(RequestMessage { kind, sender });

        receiver
    }
}

struct RequestMessage {
    kind: SessionKind,
    sender: oneshot::Sender<Result<PooledSession>>,
}

impl std::fmt::Debug for RequestMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestMessage")
            .field("kind", &self.kind)
            .finish()
    }
}

/// Receiving end of a given `SessionRequester`. Yields `None` once every
/// requester has been dropped.
#[derive(Debug)]
pub(super) struct SessionRequestReceiver {
    receiver: mpsc::UnboundedReceiver<RequestMessage>,
}

impl SessionRequestReceiver {
    pub(super) async fn recv(&mut self) -> Option<SessionRequest> {
        self.receiver.recv().await.map(|message| SessionRequest {
            kind: message.kind,
            sender: message.sender,
        })
    }
}

/// One waiter's delivery slot. Fulfilling the slot and waking the waiter are
/// a single atomic step, so a delivered session can never be observed in an
/// idle queue as well.
#[derive(Debug)]
pub(super) struct SessionRequest {
    kind: SessionKind,
    sender: oneshot::Sender<Result<PooledSession>>,
}

impl SessionRequest {
    pub(super) fn kind(&self) -> SessionKind {
        self.kind
    }

    /// Whether the waiter has stopped listening (canceled or timed out).
    pub(super) fn is_abandoned(&self) -> bool {
        self.sender.is_closed()
    }

    /// Respond to the request. On failure the waiter hung up concurrently and
    /// the payload is handed back for re-routing.
    pub(super) fn fulfill(
        self,
        result: Result<PooledSession>,
    ) -> std::result::Result<(), Result<PooledSession>> {
        self.sender.send(result)
    }
}
