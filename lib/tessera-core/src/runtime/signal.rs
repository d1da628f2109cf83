use std::fmt;

use async_trait::async_trait;
use tokio::sync::mpsc;

/// A process signal of interest to the runtime.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Signal {
    /// Interactive interrupt (`SIGINT`).
    Interrupt,

    /// Termination request (`SIGTERM`).
    Terminate,

    /// Configuration reload request (`SIGHUP`).
    Hangup,
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Interrupt => "SIGINT",
            Self::Terminate => "SIGTERM",
            Self::Hangup => "SIGHUP",
        };
        f.write_str(name)
    }
}

/// A source of process signals.
#[async_trait]
pub trait SignalSource: Send {
    /// Waits for the next signal.
    ///
    /// Returns `None` once the source can no longer produce signals. Implementations must be cancel safe.
    async fn next_signal(&mut self) -> Option<Signal>;
}

#[async_trait]
impl SignalSource for mpsc::Receiver<Signal> {
    async fn next_signal(&mut self) -> Option<Signal> {
        self.recv().await
    }
}

#[async_trait]
impl SignalSource for mpsc::UnboundedReceiver<Signal> {
    async fn next_signal(&mut self) -> Option<Signal> {
        self.recv().await
    }
}

#[cfg(unix)]
mod os {
    use std::io;

    use async_trait::async_trait;
    use futures::future::select_all;
    use tokio::signal::unix::{signal, SignalKind};

    use super::{Signal, SignalSource};

    /// Operating system signals delivered to this process.
    pub struct OsSignals {
        streams: Vec<(Signal, tokio::signal::unix::Signal)>,
    }

    impl OsSignals {
        /// Listens for termination signals: `SIGINT` and `SIGTERM`.
        ///
        /// # Errors
        ///
        /// If the signal handlers cannot be installed, an error is returned.
        pub fn termination() -> io::Result<Self> {
            Self::listen(&[(Signal::Interrupt, SignalKind::interrupt()), (Signal::Terminate, SignalKind::terminate())])
        }

        /// Listens for reload signals: `SIGHUP`.
        ///
        /// # Errors
        ///
        /// If the signal handler cannot be installed, an error is returned.
        pub fn reload() -> io::Result<Self> {
            Self::listen(&[(Signal::Hangup, SignalKind::hangup())])
        }

        fn listen(kinds: &[(Signal, SignalKind)]) -> io::Result<Self> {
            let streams = kinds
                .iter()
                .map(|&(sig, kind)| signal(kind).map(|stream| (sig, stream)))
                .collect::<io::Result<Vec<_>>>()?;
            Ok(Self { streams })
        }
    }

    #[async_trait]
    impl SignalSource for OsSignals {
        async fn next_signal(&mut self) -> Option<Signal> {
            if self.streams.is_empty() {
                return None;
            }

            let waits = self
                .streams
                .iter_mut()
                .map(|(sig, stream)| Box::pin(async move { stream.recv().await.map(|()| *sig) }));
            let (received, _, _) = select_all(waits).await;
            received
        }
    }
}

#[cfg(unix)]
pub use self::os::OsSignals;
