use tokio::sync::watch;

/// Cooperative cancellation signal checked at every suspension point.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    pub fn new(rx: watch::Receiver<bool>) -> Self {
        Self { rx }
    }

    /// A sender/signal pair, initially not requested.
    pub fn channel() -> (watch::Sender<bool>, Self) {
        let (tx, rx) = watch::channel(false);
        (tx, Self::new(rx))
    }

    pub fn is_requested(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once shutdown has been requested.
    ///
    /// Never resolves if every sender is dropped without requesting it.
    pub async fn requested(&mut self) {
        if self.rx.wait_for(|requested| *requested).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_requested_resolves_after_send() {
        let (tx, mut signal) = ShutdownSignal::channel();
        assert!(!signal.is_requested());

        tx.send_replace(true);
        signal.requested().await;
        assert!(signal.is_requested());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_sender_never_resolves() {
        let (tx, mut signal) = ShutdownSignal::channel();
        drop(tx);

        let result = tokio::time::timeout(Duration::from_secs(60), signal.requested()).await;
        assert!(result.is_err());
    }

    #[test]
    fn test_requested_wakes_waiter() {
        let (tx, mut signal) = ShutdownSignal::channel();
        let mut requested = tokio_test::task::spawn(signal.requested());

        tokio_test::assert_pending!(requested.poll());
        tx.send_replace(true);
        assert!(requested.is_woken());
        tokio_test::assert_ready!(requested.poll());
    }
}
