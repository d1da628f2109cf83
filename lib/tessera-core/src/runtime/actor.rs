use std::{fmt, future::Future};

use futures::future::BoxFuture;
use snafu::Snafu;
use tessera_error::GenericError;

use super::interrupt::InterruptSignal;

/// A `Future` that represents the execution of an actor.
pub type ActorFuture = BoxFuture<'static, Result<(), ActorError>>;

type InterruptFn = Box<dyn FnOnce() + Send>;

/// Actor errors.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum ActorError {
    /// The actor stopped because it was interrupted.
    ///
    /// This distinguishes an actor that was shut down from one that caused the shutdown.
    #[snafu(display("Actor was interrupted."))]
    Canceled,

    /// The actor failed.
    #[snafu(display("{}", source))]
    Failed {
        /// The error that caused the failure.
        source: GenericError,
    },

    /// The actor panicked.
    #[snafu(display("Actor panicked: {}", message))]
    Panicked {
        /// The panic payload, if it was a string.
        message: String,
    },
}

impl ActorError {
    /// Returns `true` if the actor stopped because it was interrupted.
    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled)
    }
}

impl From<GenericError> for ActorError {
    fn from(source: GenericError) -> Self {
        Self::Failed { source }
    }
}

/// A unit of concurrent work run as part of an [`ActorGroup`][super::ActorGroup].
pub struct Actor {
    name: String,
    execute: ActorFuture,
    interrupt: InterruptFn,
}

impl Actor {
    /// Creates a new `Actor` from an execute future and an interrupt function.
    ///
    /// `interrupt` must cause `execute` to return promptly, and must not block. It is called at most once, and may be
    /// called after `execute` has already returned.
    pub fn new<N, F, I>(name: N, execute: F, interrupt: I) -> Self
    where
        N: Into<String>,
        F: Future<Output = Result<(), ActorError>> + Send + 'static,
        I: FnOnce() + Send + 'static,
    {
        Self {
            name: name.into(),
            execute: Box::pin(execute),
            interrupt: Box::new(interrupt),
        }
    }

    /// Creates a new `Actor` whose execute future is built around an [`InterruptSignal`].
    ///
    /// Interrupting the actor triggers the signal handed to `build`.
    pub fn with_interrupt<N, B, F>(name: N, build: B) -> Self
    where
        N: Into<String>,
        B: FnOnce(InterruptSignal) -> F,
        F: Future<Output = Result<(), ActorError>> + Send + 'static,
    {
        let (signal, handle) = InterruptSignal::paired();
        Self::new(name, build(signal), move || handle.trigger())
    }

    /// Returns the name of the actor.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn into_parts(self) -> (String, ActorFuture, InterruptFn) {
        (self.name, self.execute, self.interrupt)
    }
}

impl fmt::Debug for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Actor").field("name", &self.name).finish_non_exhaustive()
    }
}
