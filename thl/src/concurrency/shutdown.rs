use tokio::sync::watch;

/// Receiver side of a shutdown signal.
pub type ShutdownRx = watch::Receiver<()>;

/// Sender side of a shutdown signal, shared by the pipeline and its stages.
#[derive(Debug, Clone)]
pub struct ShutdownTx(watch::Sender<()>);

impl ShutdownTx {
    /// Notifies every subscribed receiver.
    ///
    /// Fails only when no receiver is alive, which means nobody is left to shut down.
    pub fn shutdown(&self) -> Result<(), watch::error::SendError<()>> {
        self.0.send(())
    }

    /// Subscribes a new receiver that only observes signals sent from now on.
    pub fn subscribe(&self) -> ShutdownRx {
        self.0.subscribe()
    }
}

/// Result of an operation that may be interrupted by a shutdown signal.
#[derive(Debug, PartialEq, Eq)]
pub enum ShutdownResult<T, I> {
    Ok(T),
    Shutdown(I),
}

impl<T, I> ShutdownResult<T, I> {
    pub fn should_shutdown(&self) -> bool {
        matches!(self, ShutdownResult::Shutdown(_))
    }
}

pub fn create_shutdown_channel() -> (ShutdownTx, ShutdownRx) {
    let (tx, rx) = watch::channel(());
    (ShutdownTx(tx), rx)
}

/// Waits until `rx` observes a signal, treating a dropped sender as one as well.
pub async fn shutdown_signalled(rx: &mut ShutdownRx) {
    // `changed` only fails once the sender is gone, which is as final as a signal.
    let _ = rx.changed().await;
}
