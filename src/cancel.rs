//! Hierarchical cancellation, the way the rest of the system expects it:
//! a root token held by the serve orchestrator, with child tokens handed
//! to each SSH session's forwarder. Cancelling a parent cancels every
//! descendant; cancelling a child has no effect on its parent.
//!
//! tokio 0.2's own `CancellationToken` sits behind the `unstable` cfg
//! flag, so this is a small watch-channel-backed equivalent.

use std::sync::Arc;

use tokio::sync::watch;

#[derive(Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        CancelToken { tx: Arc::new(tx), rx }
    }

    pub fn child_token(&self) -> CancelToken {
        // A child only observes cancellation; it never reports upward,
        // so it gets its own independent sender paired to a receiver
        // that a background task forwards this token's signal into.
        let (child_tx, child_rx) = watch::channel(false);
        let child_tx = Arc::new(child_tx);
        let mut parent_rx = self.rx.clone();
        let already_cancelled = *parent_rx.borrow();
        if already_cancelled {
            let _ = child_tx.broadcast(true);
        } else {
            let child_tx = child_tx.clone();
            tokio::spawn(async move {
                while let Some(cancelled) = parent_rx.recv().await {
                    if cancelled {
                        let _ = child_tx.broadcast(true);
                        break;
                    }
                }
            });
        }
        CancelToken {
            tx: child_tx,
            rx: child_rx,
        }
    }

    pub fn cancel(&self) {
        let _ = self.tx.broadcast(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once this token (or an ancestor) is cancelled.
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        let mut rx = self.rx.clone();
        while let Some(cancelled) = rx.recv().await {
            if cancelled {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn cancel_propagates_to_child() {
        let root = CancelToken::new();
        let child = root.child_token();
        assert!(!child.is_cancelled());
        root.cancel();
        tokio::time::timeout(Duration::from_secs(1), child.cancelled())
            .await
            .expect("child should observe parent cancellation");
        assert!(child.is_cancelled());
    }

    #[tokio::test]
    async fn child_cancel_does_not_affect_parent() {
        let root = CancelToken::new();
        let child = root.child_token();
        child.cancel();
        assert!(child.is_cancelled());
        assert!(!root.is_cancelled());
    }
}
