use tokio::sync::watch;

/// Transmitter side of the shutdown channel.
///
/// Cloning is cheap; every clone signals the same receivers.
#[derive(Debug, Clone)]
pub struct ShutdownTx(watch::Sender<bool>);

impl ShutdownTx {
    pub fn new(tx: watch::Sender<bool>) -> Self {
        Self(tx)
    }

    /// Asks every worker to stop, including workers that subscribe afterwards.
    pub fn shutdown(&self) {
        self.0.send_replace(true);
    }

    pub fn subscribe(&self) -> ShutdownRx {
        ShutdownRx(self.0.subscribe())
    }

    /// Returns `true` once [`ShutdownTx::shutdown`] was called.
    pub fn is_shutdown(&self) -> bool {
        *self.0.borrow()
    }
}

/// Receiver side of the shutdown channel.
#[derive(Debug, Clone)]
pub struct ShutdownRx(watch::Receiver<bool>);

impl ShutdownRx {
    pub fn is_shutdown(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once shutdown was requested, immediately if it already was.
    ///
    /// Also resolves when every transmitter was dropped, since no shutdown could be requested anymore
    /// and the owner of the workers is gone.
    pub async fn wait_for_shutdown(&mut self) {
        let _ = self.0.wait_for(|shutdown| *shutdown).await;
    }
}

/// Creates a new shutdown channel in the running state.
pub fn create_shutdown_channel() -> (ShutdownTx, ShutdownRx) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTx::new(tx), ShutdownRx(rx))
}
