//! Cancellable handles for long-running DHT operations.
//!
//! Lookups, stores and bootstraps are spawned as tasks and handed back as a
//! [`DhtFuture`]. Awaiting the handle yields the operation's single result.
//! Cancelling it stops the task at its next suspension point: no new queries
//! are scheduled, requests already on the wire resolve into nothing, and the
//! handle resolves to [`DhtError::Cancelled`].

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::error::DhtError;

pub struct DhtFuture<T> {
    cancel: CancellationToken,
    done: Arc<AtomicBool>,
    rx: oneshot::Receiver<Result<T, DhtError>>,
}

impl<T: Send + 'static> DhtFuture<T> {
    /// Spawn `op` as a cancellable task.
    ///
    /// `op` receives the task's token so it can stop scheduling work early.
    /// A `parent` token cancels this task together with its parent.
    pub fn spawn<F, Fut>(parent: Option<&CancellationToken>, op: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, DhtError>> + Send + 'static,
    {
        let cancel = parent.map_or_else(CancellationToken::new, CancellationToken::child_token);
        let done = Arc::new(AtomicBool::new(false));
        let (tx, rx) = oneshot::channel();

        let fut = op(cancel.clone());
        let token = cancel.clone();
        let finished = done.clone();
        tokio::spawn(async move {
            let result = tokio::select! {
                biased;
                _ = token.cancelled() => Err(DhtError::Cancelled),
                result = fut => result,
            };
            finished.store(true, Ordering::SeqCst);
            let _ = tx.send(result);
        });

        Self { cancel, done, rx }
    }

    /// A handle that is already resolved.
    pub fn ready(result: Result<T, DhtError>) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(result);
        Self {
            cancel: CancellationToken::new(),
            done: Arc::new(AtomicBool::new(true)),
            rx,
        }
    }
}

impl<T> DhtFuture<T> {
    /// Cancel the operation. Calling this more than once has no further effect.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// The operation produced its result (or observed cancellation).
    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }

    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

impl<T> Future for DhtFuture<T> {
    type Output = Result<T, DhtError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(DhtError::Closed)),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<T> std::fmt::Debug for DhtFuture<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DhtFuture")
            .field("cancelled", &self.is_cancelled())
            .field("done", &self.is_done())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::time::{Duration, sleep};

    #[tokio::test]
    async fn resolves_with_the_operation_result() {
        let future = DhtFuture::spawn(None, |_| async { Ok::<_, DhtError>(7) });
        assert_eq!(future.await, Ok(7));
    }

    #[tokio::test]
    async fn cancel_is_idempotent_and_discards_late_work() {
        let side_effects = Arc::new(AtomicUsize::new(0));
        let effects = side_effects.clone();
        let future = DhtFuture::spawn(None, move |_| async move {
            sleep(Duration::from_millis(200)).await;
            effects.fetch_add(1, Ordering::SeqCst);
            Ok::<_, DhtError>(())
        });

        future.cancel();
        future.cancel();
        assert!(future.is_cancelled());
        assert_eq!(future.await, Err(DhtError::Cancelled));

        sleep(Duration::from_millis(300)).await;
        assert_eq!(side_effects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn parent_cancellation_reaches_children() {
        let parent = CancellationToken::new();
        let future = DhtFuture::spawn(Some(&parent), |token| async move {
            token.cancelled().await;
            Ok::<_, DhtError>(())
        });
        parent.cancel();
        assert_eq!(future.await, Err(DhtError::Cancelled));
    }

    #[tokio::test]
    async fn ready_future_is_done() {
        let future = DhtFuture::ready(Err::<(), _>(DhtError::NoSuchValue { key: crate::identity::Key::from_bytes([1; 20]) }));
        assert!(future.is_done());
        assert!(matches!(future.await, Err(DhtError::NoSuchValue { .. })));
    }
}
