// SPDX-License-Identifier: MIT OR Apache-2.0

//! Cooperative shutdown token shared by every suspension point.

use tokio::sync::watch;

/// Create a linked shutdown handle/token pair.
#[must_use]
pub fn shutdown_pair() -> (ShutdownHandle, Shutdown) {
    let (tx, rx) = watch::channel(false);
    (ShutdownHandle { tx }, Shutdown { rx })
}

/// The signalling side; owned by the process entry point.
#[derive(Debug)]
pub struct ShutdownHandle {
    tx: watch::Sender<bool>,
}

impl ShutdownHandle {
    /// Signal every token clone to wind down.
    pub fn shutdown(&self) {
        let _ = self.tx.send(true);
    }
}

/// The observing side; cheap to clone into every task.
#[derive(Debug, Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    /// Returns `true` once shutdown has been signalled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Wait until shutdown is signalled.
    pub async fn cancelled(&mut self) {
        while !*self.rx.borrow_and_update() {
            if self.rx.changed().await.is_err() {
                // Sender dropped without signalling; treat as shutdown.
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn token_observes_signal() {
        let (handle, shutdown) = shutdown_pair();
        assert!(!shutdown.is_cancelled());

        let mut waiter = shutdown.clone();
        let task = tokio::spawn(async move {
            waiter.cancelled().await;
            true
        });
        handle.shutdown();
        assert!(task.await.unwrap());
        assert!(shutdown.is_cancelled());
    }

    #[tokio::test]
    async fn dropped_handle_counts_as_shutdown() {
        let (handle, shutdown) = shutdown_pair();
        drop(handle);
        let mut waiter = shutdown;
        // Must resolve rather than hang.
        waiter.cancelled().await;
    }
}
