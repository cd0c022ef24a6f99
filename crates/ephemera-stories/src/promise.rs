//! Single-shot deferred results
//!
//! Every command returns a [`Deferred`] whose [`Promise`] half is kept by the
//! engine and resolved exactly once. Dropping the promise unresolved (for
//! example on teardown) resolves the deferred with [`StoryError::Canceled`].

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use crate::error::{StoryError, StoryResult};

/// Producer half; consuming methods enforce single resolution
#[derive(Debug)]
pub struct Promise<T> {
    tx: oneshot::Sender<StoryResult<T>>,
}

/// Consumer half, awaitable or pollable without a runtime
#[derive(Debug)]
pub struct Deferred<T> {
    rx: oneshot::Receiver<StoryResult<T>>,
}

/// Create a connected promise/deferred pair
pub fn pair<T>() -> (Promise<T>, Deferred<T>) {
    let (tx, rx) = oneshot::channel();
    (Promise { tx }, Deferred { rx })
}

impl<T> Promise<T> {
    pub fn set_result(self, result: StoryResult<T>) {
        // Caller may have stopped waiting
        let _ = self.tx.send(result);
    }

    pub fn set_value(self, value: T) {
        self.set_result(Ok(value));
    }

    pub fn set_error(self, error: StoryError) {
        self.set_result(Err(error));
    }

    /// Whether the deferred half was dropped
    pub fn is_abandoned(&self) -> bool {
        self.tx.is_closed()
    }
}

impl<T> Deferred<T> {
    /// A deferred that is already resolved
    pub fn ready(result: StoryResult<T>) -> Self {
        let (promise, deferred) = pair();
        promise.set_result(result);
        deferred
    }

    pub fn failed(error: StoryError) -> Self {
        Self::ready(Err(error))
    }

    /// Take the result if it is available
    pub fn try_take(&mut self) -> Option<StoryResult<T>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(StoryError::Canceled)),
        }
    }
}

impl<T> Future for Deferred<T> {
    type Output = StoryResult<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(StoryError::Canceled)))
    }
}

/// Resolve every coalesced waiter with the same outcome
pub fn resolve_all<T: Clone>(promises: Vec<Promise<T>>, result: StoryResult<T>) {
    for promise in promises {
        promise.set_result(result.clone());
    }
}
