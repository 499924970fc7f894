mod join_handle;

use std::future::Future;

pub(crate) use self::join_handle::AsyncJoinHandle;

/// Spawn a task in the background to run a future.
///
/// This must be called from an async block or function running on a runtime.
#[track_caller]
pub(crate) fn spawn<F, O>(fut: F) -> AsyncJoinHandle<O>
where
    F: Future<Output = O> + Send + 'static,
    O: Send + 'static,
{
    AsyncJoinHandle::spawn(fut)
}
