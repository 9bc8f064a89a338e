//! Task ownership helpers

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::task::{JoinError, JoinHandle};

/// A join handle that owns the task it is running, and aborts it when dropped.
///
/// Every long-lived task in the crate (actors, connection readers/writers,
/// connect attempts) is held through one of these, so dropping the owner
/// tears the task down.
#[derive(Debug)]
pub struct AbortingJoinHandle<T>(JoinHandle<T>);

impl<T> AbortingJoinHandle<T> {
    pub fn abort(&self) {
        self.0.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.0.is_finished()
    }
}

impl<T> From<JoinHandle<T>> for AbortingJoinHandle<T> {
    fn from(handle: JoinHandle<T>) -> Self {
        Self(handle)
    }
}

impl<T> Future for AbortingJoinHandle<T> {
    type Output = Result<T, JoinError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.0).poll(cx)
    }
}

impl<T> Drop for AbortingJoinHandle<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Spawn `fut` and return an owning handle.
pub fn spawn_owned<F>(fut: F) -> AbortingJoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    tokio::spawn(fut).into()
}
