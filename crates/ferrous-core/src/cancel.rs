//! Cooperative cancellation delivered over a watch channel.

use crate::run::CancelReason;
use std::sync::Arc;
use tokio::sync::watch;

/// Owning side of a cancellation channel. Held by the coordinator.
#[derive(Debug, Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<Option<CancelReason>>>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Signal cancellation. Returns `false` if the token was already cancelled;
    /// the first reason wins.
    pub fn cancel(&self, reason: CancelReason) -> bool {
        self.tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason);
            true
        })
    }

    pub fn is_cancelled(&self) -> bool {
        self.tx.borrow().is_some()
    }

    pub fn signal(&self) -> CancelSignal {
        CancelSignal {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Observing side of a cancellation channel. Handed to the build backend.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<Option<CancelReason>>,
}

impl CancelSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(None);
        Self { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        self.rx.borrow().is_some()
    }

    pub fn reason(&self) -> Option<CancelReason> {
        self.rx.borrow().clone()
    }

    /// Resolve once cancellation is requested. Pends forever if the token is
    /// dropped without cancelling.
    pub async fn cancelled(&mut self) -> CancelReason {
        loop {
            if let Some(reason) = self.rx.borrow_and_update().clone() {
                return reason;
            }
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::CancelReasonType;
    use std::time::Duration;

    #[tokio::test]
    async fn test_signal_observes_cancel() {
        let token = CancelToken::new();
        let mut signal = token.signal();
        assert!(!signal.is_cancelled());

        let waiter = tokio::spawn(async move { signal.cancelled().await });
        assert!(token.cancel(CancelReason::shutdown()));

        let reason = waiter.await.unwrap();
        assert_eq!(reason.reason, CancelReasonType::Shutdown);
    }

    #[tokio::test]
    async fn test_first_reason_wins() {
        let token = CancelToken::new();
        assert!(token.cancel(CancelReason::user_requested(None)));
        assert!(!token.cancel(CancelReason::shutdown()));

        let signal = token.signal();
        assert_eq!(
            signal.reason().map(|r| r.reason),
            Some(CancelReasonType::UserRequested)
        );
    }

    #[tokio::test]
    async fn test_never_signal_pends() {
        let mut signal = CancelSignal::never();
        let result = tokio::time::timeout(Duration::from_millis(20), signal.cancelled()).await;
        assert!(result.is_err());
    }
}
