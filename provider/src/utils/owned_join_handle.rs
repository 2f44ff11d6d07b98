use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use tokio::task::{JoinError, JoinHandle};

/// Join handle wrapper which aborts the underlying task when dropped, so that
/// spawned helpers cannot outlive the object owning them.
#[derive(Debug)]
pub struct OwnedJoinHandle<T> {
    inner: JoinHandle<T>,
}

impl<T> OwnedJoinHandle<T> {
    pub fn new(inner: JoinHandle<T>) -> Self {
        Self { inner }
    }

    pub fn abort(&self) {
        self.inner.abort()
    }

    pub fn is_finished(&self) -> bool {
        self.inner.is_finished()
    }
}

impl<T> From<JoinHandle<T>> for OwnedJoinHandle<T> {
    fn from(inner: JoinHandle<T>) -> Self {
        Self::new(inner)
    }
}

impl<T> Drop for OwnedJoinHandle<T> {
    fn drop(&mut self) {
        self.inner.abort();
    }
}

impl<T> Future for OwnedJoinHandle<T> {
    type Output = Result<T, JoinError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.inner).poll(cx)
    }
}
