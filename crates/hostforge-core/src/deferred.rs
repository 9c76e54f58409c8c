//! Values that resolve later
//!
//! A `Deferred<T>` is a cloneable handle on a value that may not exist yet,
//! such as a generated password or the address of a freshly created host.
//! Every clone observes the same result.

use std::fmt;
use std::future::Future;

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use thiserror::Error;
use tokio::sync::oneshot;

/// Why a deferred value is unavailable
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeferredError {
    /// The producer went away without resolving
    #[error("value was dropped before it resolved")]
    Dropped,

    /// The producer reported a failure
    #[error("{0}")]
    Failed(String),
}

/// Cloneable handle on a value resolved asynchronously
#[derive(Clone)]
pub struct Deferred<T: Clone> {
    inner: Shared<BoxFuture<'static, Result<T, DeferredError>>>,
}

impl<T> Deferred<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// A value that is already known
    pub fn ready(value: T) -> Self {
        Self::from_future(async move { Ok(value) })
    }

    /// A value produced by `future`
    pub fn from_future<F>(future: F) -> Self
    where
        F: Future<Output = Result<T, DeferredError>> + Send + 'static,
    {
        Self {
            inner: future.boxed().shared(),
        }
    }

    /// A value resolved through the returned `Resolver`
    #[must_use]
    pub fn pair() -> (Resolver<T>, Self) {
        let (tx, rx) = oneshot::channel();
        let deferred = Self::from_future(async move {
            match rx.await {
                Ok(result) => result,
                Err(_) => Err(DeferredError::Dropped),
            }
        });
        (Resolver { tx }, deferred)
    }

    /// Wait for the value
    ///
    /// # Errors
    /// Returns the producer's failure, or `DeferredError::Dropped` if the
    /// resolver was dropped
    pub async fn get(&self) -> Result<T, DeferredError> {
        self.inner.clone().await
    }

    /// The value if it has already resolved
    #[must_use]
    pub fn peek(&self) -> Option<&Result<T, DeferredError>> {
        self.inner.peek()
    }
}

impl<T: Clone> fmt::Debug for Deferred<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Values are often secrets; only show whether it resolved
        let state = if self.inner.peek().is_some() {
            "resolved"
        } else {
            "pending"
        };
        f.debug_tuple("Deferred").field(&state).finish()
    }
}

/// Producer side of `Deferred::pair`
#[derive(Debug)]
pub struct Resolver<T> {
    tx: oneshot::Sender<Result<T, DeferredError>>,
}

impl<T> Resolver<T> {
    /// Resolve with a value
    pub fn resolve(self, value: T) {
        // A closed channel means nobody holds the deferred any more
        let _ = self.tx.send(Ok(value));
    }

    /// Resolve with a failure
    pub fn fail(self, reason: impl Into<String>) {
        let _ = self.tx.send(Err(DeferredError::Failed(reason.into())));
    }
}
