use core::future::Future;
use core::pin::Pin;
use core::task::{Context, Poll};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use pin_project_lite::pin_project;
use tokio::sync::oneshot;

use crate::bail;
use crate::error::{ErrorKind, ThlResult};

pin_project! {
    /// Resolves with the position that satisfied a watch.
    ///
    /// Resolves with [`ErrorKind::WatchCancelled`] when the watch is cancelled, either through
    /// [`WatchFuture::cancel`] or because the owning registry was cancelled on shutdown.
    #[must_use = "futures do nothing unless polled"]
    #[derive(Debug)]
    pub struct WatchFuture<H> {
        #[pin]
        rx: oneshot::Receiver<H>,
        cancelled: Arc<AtomicBool>,
        done: bool,
    }
}

impl<H> WatchFuture<H> {
    pub(crate) fn new(rx: oneshot::Receiver<H>, cancelled: Arc<AtomicBool>) -> Self {
        Self {
            rx,
            cancelled,
            done: false,
        }
    }

    /// Cancels the watch; the registry drops it the next time it is offered a position.
    pub fn cancel(&mut self) {
        self.cancelled.store(true, Ordering::Release);
        self.rx.close();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Whether the watch resolved or was cancelled.
    pub fn is_done(&self) -> bool {
        self.done || self.is_cancelled()
    }

    /// Waits up to `timeout` for the watch to resolve.
    ///
    /// On timeout the watch stays registered; call [`WatchFuture::cancel`] when giving up on it.
    pub async fn get_timeout(&mut self, timeout: Duration) -> ThlResult<H> {
        match tokio::time::timeout(timeout, self).await {
            Ok(result) => result,
            Err(_) => bail!(
                ErrorKind::WatchTimeout,
                "Watch did not resolve in time",
                format!("waited {timeout:?}")
            ),
        }
    }
}

impl<H> Future for WatchFuture<H> {
    type Output = ThlResult<H>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        if *this.done {
            return Poll::Ready(Err(crate::thl_error!(
                ErrorKind::InvalidState,
                "Watch future polled after it resolved"
            )));
        }

        let result = match this.rx.poll(cx) {
            Poll::Ready(Ok(header)) => Ok(header),
            Poll::Ready(Err(_)) => Err(crate::thl_error!(
                ErrorKind::WatchCancelled,
                "Watch was cancelled before it resolved"
            )),
            Poll::Pending => return Poll::Pending,
        };

        *this.done = true;

        Poll::Ready(result)
    }
}
