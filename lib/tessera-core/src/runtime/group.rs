use std::{any::Any, future::Future};

use indexmap::IndexMap;
use snafu::{ResultExt as _, Snafu};
use tokio::task::{Id, JoinError, JoinSet};
use tracing::{debug, debug_span, error, info, Instrument as _};

use super::{
    actor::{Actor, ActorError},
    interrupt::InterruptSignal,
};

/// Actor group errors.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum GroupError {
    /// The first actor to return did so with an error.
    #[snafu(display("Actor '{}' terminated the group: {}", actor, source))]
    ActorFailed {
        /// Name of the actor that returned first.
        actor: String,

        /// The error it returned.
        source: ActorError,
    },
}

impl GroupError {
    /// Returns the name of the actor whose outcome ended the group.
    pub fn actor(&self) -> &str {
        match self {
            Self::ActorFailed { actor, .. } => actor,
        }
    }

    /// Returns the error the actor returned.
    pub fn actor_error(&self) -> &ActorError {
        match self {
            Self::ActorFailed { source, .. } => source,
        }
    }
}

/// A set of actors that share one fate.
///
/// When run, every actor is spawned concurrently. The first actor to return, whether cleanly or with an error, decides
/// the result of the group: every other actor is interrupted, and once all of them have returned, the first actor's
/// outcome is returned. There is no restart and no priority between actors.
#[derive(Debug, Default)]
pub struct ActorGroup {
    actors: Vec<Actor>,
}

struct RunningActor {
    name: String,
    interrupt: Option<Box<dyn FnOnce() + Send>>,
}

impl ActorGroup {
    /// Creates an empty `ActorGroup`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an actor to the group.
    pub fn add(&mut self, actor: Actor) {
        debug!(actor = actor.name(), "Adding actor #{} to group.", self.actors.len());
        self.actors.push(actor);
    }

    /// Adds an actor to the group from an execute future and an interrupt function.
    ///
    /// See [`Actor::new`].
    pub fn add_actor<N, F, I>(&mut self, name: N, execute: F, interrupt: I)
    where
        N: Into<String>,
        F: Future<Output = Result<(), ActorError>> + Send + 'static,
        I: FnOnce() + Send + 'static,
    {
        self.add(Actor::new(name, execute, interrupt));
    }

    /// Adds an actor to the group whose execute future is built around an [`InterruptSignal`].
    ///
    /// See [`Actor::with_interrupt`].
    pub fn add_with_interrupt<N, B, F>(&mut self, name: N, build: B)
    where
        N: Into<String>,
        B: FnOnce(InterruptSignal) -> F,
        F: Future<Output = Result<(), ActorError>> + Send + 'static,
    {
        self.add(Actor::with_interrupt(name, build));
    }

    /// Returns the number of actors in the group.
    pub fn len(&self) -> usize {
        self.actors.len()
    }

    /// Returns `true` if the group has no actors.
    pub fn is_empty(&self) -> bool {
        self.actors.is_empty()
    }

    /// Runs every actor until the first one returns, then interrupts the rest and waits for them.
    ///
    /// An empty group returns `Ok(())` immediately.
    ///
    /// # Errors
    ///
    /// If the first actor to return did so with an error, that error is returned. Errors from actors that return after
    /// being interrupted are logged and otherwise ignored.
    pub async fn run(self) -> Result<(), GroupError> {
        if self.actors.is_empty() {
            debug!("Actor group is empty, nothing to run.");
            return Ok(());
        }

        let mut tasks = JoinSet::new();
        let mut running = IndexMap::with_capacity(self.actors.len());

        for actor in self.actors {
            let (name, execute, interrupt) = actor.into_parts();
            let span = debug_span!("actor", actor = %name);
            let abort_handle = tasks.spawn(execute.instrument(span));
            running.insert(
                abort_handle.id(),
                RunningActor {
                    name,
                    interrupt: Some(interrupt),
                },
            );
        }

        debug!(actors = running.len(), "Actor group running.");

        let Some(joined) = tasks.join_next_with_id().await else {
            return Ok(());
        };
        let (first_id, first_result) = flatten_join_result(joined);
        let first_name = running
            .shift_remove(&first_id)
            .map(|actor| actor.name)
            .unwrap_or_default();

        match &first_result {
            Ok(()) => info!(actor = %first_name, "Actor exited, stopping actor group."),
            Err(e) => error!(actor = %first_name, error = %e, "Actor failed, stopping actor group."),
        }

        for (_, actor) in running.iter_mut() {
            if let Some(interrupt) = actor.interrupt.take() {
                debug!(actor = %actor.name, "Interrupting actor.");
                interrupt();
            }
        }

        while let Some(joined) = tasks.join_next_with_id().await {
            let (id, result) = flatten_join_result(joined);
            if let Some(actor) = running.swap_remove(&id) {
                match result {
                    Ok(()) | Err(ActorError::Canceled) => debug!(actor = %actor.name, "Actor stopped."),
                    Err(e) => debug!(actor = %actor.name, error = %e, "Actor stopped with error."),
                }
            }
        }

        debug!("All actors stopped.");

        first_result.context(ActorFailed { actor: first_name })
    }
}

fn flatten_join_result(joined: Result<(Id, Result<(), ActorError>), JoinError>) -> (Id, Result<(), ActorError>) {
    match joined {
        Ok((id, result)) => (id, result),
        Err(e) => {
            let id = e.id();
            if e.is_panic() {
                let message = panic_message(e.into_panic());
                (id, Err(ActorError::Panicked { message }))
            } else {
                (id, Err(ActorError::Canceled))
            }
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    match payload.downcast::<String>() {
        Ok(message) => *message,
        Err(payload) => match payload.downcast::<&'static str>() {
            Ok(message) => (*message).to_string(),
            Err(_) => "unknown panic payload".to_string(),
        },
    }
}
