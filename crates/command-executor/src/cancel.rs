//! Cooperative cancellation

use std::sync::Arc;

/// A clonable cancellation handle
///
/// All clones observe the same cancellation: triggering any clone wakes every
/// task awaiting [`CancelToken::cancelled`]. The orchestrator creates one
/// token per run and hands clones to supervisors, probes and the dashboard.
#[derive(Debug, Clone)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    // Nothing is ever sent; closing the channel is the cancellation signal,
    // which wakes every pending recv at once.
    tx: async_channel::Sender<()>,
    rx: async_channel::Receiver<()>,
}

impl CancelToken {
    /// Create a new, untriggered token
    pub fn new() -> Self {
        let (tx, rx) = async_channel::bounded(1);
        Self {
            inner: Arc::new(Inner { tx, rx }),
        }
    }

    /// Trigger cancellation
    pub fn cancel(&self) {
        self.inner.tx.close();
    }

    /// Whether cancellation has been triggered
    pub fn is_cancelled(&self) -> bool {
        self.inner.tx.is_closed()
    }

    /// Resolve once cancellation is triggered
    pub async fn cancelled(&self) {
        let _ = self.inner.rx.recv().await;
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_untriggered() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
    }

    #[test]
    fn test_cancel_is_shared_across_clones() {
        let token = CancelToken::new();
        let clone = token.clone();
        clone.cancel();
        assert!(token.is_cancelled());
    }

    #[smol_potat::test]
    async fn test_cancelled_wakes_waiters() {
        let token = CancelToken::new();
        let waiter = token.clone();
        let task = smol::spawn(async move {
            waiter.cancelled().await;
            true
        });
        token.cancel();
        assert!(task.await);
    }
}
