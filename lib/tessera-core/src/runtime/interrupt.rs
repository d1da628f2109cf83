use tokio::sync::oneshot;

/// An interrupt signal for an actor.
///
/// The execute future of an actor waits on this to learn that it has been asked to stop.
pub struct InterruptSignal {
    rx: Option<oneshot::Receiver<()>>,
    received: bool,
}

/// A handle to trigger an actor's [`InterruptSignal`].
pub struct InterruptHandle {
    tx: oneshot::Sender<()>,
}

impl InterruptSignal {
    /// Creates a new `InterruptSignal` and `InterruptHandle` pair.
    ///
    /// `InterruptSignal` resolves when `InterruptHandle` is triggered or dropped.
    pub fn paired() -> (Self, InterruptHandle) {
        let (tx, rx) = oneshot::channel();
        let signal = Self {
            rx: Some(rx),
            received: false,
        };

        (signal, InterruptHandle { tx })
    }

    /// Creates a new `InterruptSignal` that never resolves.
    pub fn never() -> Self {
        Self {
            rx: None,
            received: false,
        }
    }

    /// Waits for the interrupt.
    ///
    /// Once the interrupt has been received, every later call returns immediately. This future is cancel safe, so it
    /// can be awaited repeatedly inside `select!`.
    pub async fn wait(&mut self) {
        if self.received {
            return;
        }

        match self.rx.as_mut() {
            Some(rx) => {
                let _ = rx.await;
                self.received = true;
            }
            None => std::future::pending().await,
        }
    }

    /// Returns `true` if the interrupt has been received, without waiting.
    pub fn is_interrupted(&mut self) -> bool {
        if !self.received {
            if let Some(rx) = self.rx.as_mut() {
                self.received = !matches!(rx.try_recv(), Err(oneshot::error::TryRecvError::Empty));
            }
        }
        self.received
    }
}

impl InterruptHandle {
    /// Triggers the interrupt.
    pub fn trigger(self) {
        let _ = self.tx.send(());
    }
}
