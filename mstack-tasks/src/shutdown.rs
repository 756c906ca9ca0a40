//! Shutdown signal shared by the driver and in-flight readiness waits.

use tokio::sync::watch;

/// Receiving half of the process shutdown channel.
///
/// Cloned into every task so a blocked readiness wait can be cut short.
#[derive(Debug, Clone)]
pub struct Shutdown {
    rx: Option<watch::Receiver<bool>>,
}

impl Shutdown {
    pub fn new(rx: watch::Receiver<bool>) -> Self {
        Self { rx: Some(rx) }
    }

    /// A signal that never fires.
    pub fn never() -> Self {
        Self { rx: None }
    }

    pub fn is_triggered(&self) -> bool {
        self.rx.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Resolves once shutdown has been requested. Pends forever if the sender
    /// is gone without having signalled.
    pub async fn triggered(&mut self) {
        let Some(rx) = self.rx.as_mut() else {
            return std::future::pending().await;
        };
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                return std::future::pending().await;
            }
        }
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::never()
    }
}
