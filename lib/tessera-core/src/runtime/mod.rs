//! Runtime system.
//!
//! A process is run as an [`ActorGroup`]: a fixed set of [`Actor`]s that share one fate. Every actor is spawned
//! concurrently, and the first one to return, whether it succeeded or failed, decides the outcome of the whole group.
//! Every other actor is then interrupted and the group waits for all of them to return before reporting that outcome.
//!
//! # Actors
//!
//! An actor is a pair of an _execute_ future and an _interrupt_ function. The execute future runs until it completes,
//! fails, or is told to stop. The interrupt function tells it to stop: it must not block, and it is called at most
//! once. Most actors never write their own interrupt function, and instead use [`Actor::with_interrupt`], which hands
//! the execute future an [`InterruptSignal`] to wait on.
//!
//! # Built-in actors
//!
//! The [`actors`] module provides the actors every process runs alongside its own:
//!
//! - [`termination_actor`][actors::termination_actor] ends the group when a termination signal arrives
//! - [`reload_actor`][actors::reload_actor] turns reload signals into notifications on a [`reload_queue`]
//! - [`tracer_actor`][actors::tracer_actor] releases the tracer's resources once the group stops

mod actor;
pub use self::actor::{Actor, ActorError, ActorFuture};

pub mod actors;

mod group;
pub use self::group::{ActorGroup, GroupError};

mod interrupt;
pub use self::interrupt::{InterruptHandle, InterruptSignal};

mod reload;
pub use self::reload::{reload_queue, ReloadReceiver, ReloadSender};

mod signal;
#[cfg(unix)]
pub use self::signal::OsSignals;
pub use self::signal::{Signal, SignalSource};

mod tracer;
pub use self::tracer::{Tracer, TracerCloser, TRACE_TARGET};
