use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

/// A handle to a task spawned on the runtime. Unlike the underlying tokio
/// handle, awaiting this resolves directly to the task's output.
#[derive(Debug)]
pub(crate) struct AsyncJoinHandle<T>(tokio::task::JoinHandle<T>);

impl<T> AsyncJoinHandle<T> {
    #[track_caller]
    pub(crate) fn spawn<F>(fut: F) -> Self
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        AsyncJoinHandle(tokio::task::spawn(fut))
    }

    /// Abort the task. Awaiting an aborted handle panics, so this is only
    /// used for tasks whose handles are subsequently dropped.
    pub(crate) fn abort(&self) {
        self.0.abort();
    }

    #[cfg(test)]
    pub(crate) fn is_finished(&self) -> bool {
        self.0.is_finished()
    }
}

impl<T> Future for AsyncJoinHandle<T> {
    type Output = T;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // A task can only fail to join if it panicked or was aborted, so
        // propagating the panic here preserves the failure.
        Pin::new(&mut self.0)
            .poll(cx)
            .map(|result| result.expect("spawned task panicked or was aborted"))
    }
}
