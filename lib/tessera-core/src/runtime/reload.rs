use tokio::sync::mpsc::{self, error::TrySendError};

/// Creates a single-slot reload queue.
///
/// At most one notification is ever pending. Notifying while one is already pending coalesces into it, and notifying
/// never blocks, even when nothing is consuming the queue.
pub fn reload_queue() -> (ReloadSender, ReloadReceiver) {
    let (tx, rx) = mpsc::channel(1);
    (ReloadSender { tx }, ReloadReceiver { rx })
}

/// Producer half of a [`reload_queue`].
#[derive(Clone, Debug)]
pub struct ReloadSender {
    tx: mpsc::Sender<()>,
}

impl ReloadSender {
    /// Queues a reload notification without waiting.
    ///
    /// Returns `true` if a new notification was queued, or `false` if one was already pending or the receiver is gone.
    pub fn notify(&self) -> bool {
        match self.tx.try_send(()) {
            Ok(()) => true,
            Err(TrySendError::Full(())) | Err(TrySendError::Closed(())) => false,
        }
    }
}

/// Consumer half of a [`reload_queue`].
#[derive(Debug)]
pub struct ReloadReceiver {
    rx: mpsc::Receiver<()>,
}

impl ReloadReceiver {
    /// Waits for the next reload notification.
    ///
    /// Returns `false` once every sender is gone and no notification is pending. Cancel safe.
    pub async fn recv(&mut self) -> bool {
        self.rx.recv().await.is_some()
    }

    /// Takes the pending reload notification, if any, without waiting.
    pub fn try_recv(&mut self) -> bool {
        self.rx.try_recv().is_ok()
    }
}
