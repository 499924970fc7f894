use tokio::sync::watch;

use crate::error::{Error, Result};

/// A snapshot of the worker's bookkeeping, published on every state change.
/// Backs both `statistics()` (lock-free copy) and `wait_until_ready`.
#[derive(Clone, Debug, Default)]
pub(crate) struct PoolStatus {
    pub(crate) active: u32,
    pub(crate) in_flight_creates: u32,
    pub(crate) read_idle: u32,
    pub(crate) write_idle: u32,

    /// The most recent creation error. `Some` while the pool is unhealthy;
    /// cleared by the next successful creation.
    pub(crate) last_error: Option<Error>,

    pub(crate) shutdown: bool,
}

/// Create a channel for publishing and observing the pool's status.
pub(super) fn channel() -> (StatusPublisher, StatusSubscriber) {
    let (sender, receiver) = watch::channel(PoolStatus::default());
    (
        StatusPublisher { sender },
        StatusSubscriber { receiver },
    )
}

/// The worker's end of the status channel.
#[derive(Debug)]
pub(super) struct StatusPublisher {
    sender: watch::Sender<PoolStatus>,
}

impl StatusPublisher {
    pub(super) fn publish(&self, status: PoolStatus) {
        // if nobody is listening, this returns an error, which we don't mind.
        let _: std::result::Result<_, _> = self.sender.send(status);
    }
}

/// Observer used to read the latest pool status.
#[derive(Clone, Debug)]
pub(crate) struct StatusSubscriber {
    receiver: watch::Receiver<PoolStatus>,
}

impl StatusSubscriber {
    /// Get a copy of the latest status.
    pub(crate) fn latest(&self) -> PoolStatus {
        self.receiver.borrow().clone()
    }

    /// Suspend until the warm floor is met, failing fast on an unhealthy or
    /// shut-down pool.
    pub(crate) async fn wait_until_ready(
        &mut self,
        min_sessions: u32,
        write_target: u32,
    ) -> Result<()> {
        loop {
            {
                let status = self.receiver.borrow_and_update();
                if status.shutdown {
                    return Err(Error::canceled("session pool was shut down"));
                }
                if let Some(error) = &status.last_error {
                    return Err(error.clone());
                }
                if status.read_idle + status.write_idle >= min_sessions
                    && status.write_idle >= write_target
                {
                    return Ok(());
                }
            }
            if self.receiver.changed().await.is_err() {
                return Err(Error::canceled("session pool worker exited"));
            }
        }
    }
}
