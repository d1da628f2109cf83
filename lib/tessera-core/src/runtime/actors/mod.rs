//! Built-in actors.

use std::future::pending;

use tracing::{debug, info};

use super::{Actor, ActorError, InterruptSignal, ReloadSender, Signal, SignalSource, TracerCloser};

/// Creates an actor that ends the group when a termination signal arrives.
///
/// On a signal the actor returns `Ok(())`, which stops every other actor. When interrupted, it returns
/// [`ActorError::Canceled`]. If `source` runs out of signals, the actor keeps waiting for its interrupt.
pub fn termination_actor<S>(source: S) -> Actor
where
    S: SignalSource + 'static,
{
    Actor::with_interrupt("signal-handler", move |interrupt| run_termination(source, interrupt))
}

/// Creates an actor that forwards reload signals into a reload queue.
///
/// Signals are handled one at a time. Each one queues a notification on `reload_tx` without waiting; a signal that
/// arrives while a notification is still pending is coalesced into it. When interrupted, the actor returns
/// [`ActorError::Canceled`].
pub fn reload_actor<S>(source: S, reload_tx: ReloadSender) -> Actor
where
    S: SignalSource + 'static,
{
    Actor::with_interrupt("reload-handler", move |interrupt| run_reload(source, reload_tx, interrupt))
}

/// Creates an actor that holds the tracer's resources for the lifetime of the group.
///
/// The actor waits until interrupted and then returns [`ActorError::Canceled`]. `closer` is released exactly once
/// however the actor ends, including when its future is dropped without ever completing.
pub fn tracer_actor(closer: TracerCloser) -> Actor {
    Actor::with_interrupt("tracer", move |interrupt| run_tracer(closer, interrupt))
}

async fn next_or_pending<S: SignalSource>(source: &mut S) -> Signal {
    match source.next_signal().await {
        Some(signal) => signal,
        None => {
            debug!("Signal source exhausted.");
            pending().await
        }
    }
}

async fn run_termination<S: SignalSource>(mut source: S, mut interrupt: InterruptSignal) -> Result<(), ActorError> {
    tokio::select! {
        signal = next_or_pending(&mut source) => {
            info!(%signal, "Caught signal. Exiting.");
            Ok(())
        }
        _ = interrupt.wait() => Err(ActorError::Canceled),
    }
}

async fn run_reload<S: SignalSource>(
    mut source: S, reload_tx: ReloadSender, mut interrupt: InterruptSignal,
) -> Result<(), ActorError> {
    loop {
        tokio::select! {
            signal = next_or_pending(&mut source) => {
                if reload_tx.notify() {
                    info!(%signal, "Caught signal. Reload requested.");
                } else {
                    debug!(%signal, "Caught signal. Reload already pending.");
                }
            }
            _ = interrupt.wait() => return Err(ActorError::Canceled),
        }
    }
}

async fn run_tracer(closer: TracerCloser, mut interrupt: InterruptSignal) -> Result<(), ActorError> {
    let _closer = closer;
    interrupt.wait().await;
    debug!("Releasing tracer.");
    Err(ActorError::Canceled)
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering::SeqCst},
            Arc,
        },
        time::Duration,
    };

    use tokio::{
        sync::mpsc,
        time::{sleep, timeout},
    };

    use super::*;
    use crate::runtime::{reload_queue, ActorGroup};

    async fn wait_interrupted(mut interrupt: InterruptSignal) -> Result<(), ActorError> {
        interrupt.wait().await;
        Err(ActorError::Canceled)
    }

    async fn send_burst_then_exit(tx: mpsc::Sender<Signal>, count: usize) -> Result<(), ActorError> {
        for _ in 0..count {
            let _ = tx.send(Signal::Hangup).await;
        }
        sleep(Duration::from_millis(100)).await;
        Ok(())
    }

    async fn exit_after(delay: Duration) -> Result<(), ActorError> {
        sleep(delay).await;
        Ok(())
    }

    fn counting_closer() -> (TracerCloser, Arc<AtomicUsize>) {
        let closes = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&closes);
        let closer = TracerCloser::new(move || {
            counter.fetch_add(1, SeqCst);
        });
        (closer, closes)
    }

    #[tokio::test(start_paused = true)]
    async fn termination_signal_ends_group_cleanly() {
        let (tx, rx) = mpsc::channel(1);
        let mut group = ActorGroup::new();
        group.add(termination_actor(rx));
        group.add_with_interrupt("server", wait_interrupted);
        tx.send(Signal::Terminate).await.unwrap();

        timeout(Duration::from_secs(5), group.run()).await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn termination_actor_returns_canceled_when_interrupted() {
        let (_tx, rx) = mpsc::channel::<Signal>(1);
        let (name, execute, interrupt) = termination_actor(rx).into_parts();
        assert_eq!(name, "signal-handler");

        interrupt();
        let result = timeout(Duration::from_secs(5), execute).await.unwrap();
        assert!(matches!(result, Err(ActorError::Canceled)));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_signal_source_waits_for_interrupt() {
        let (tx, rx) = mpsc::channel::<Signal>(1);
        drop(tx);
        let (_, execute, interrupt) = termination_actor(rx).into_parts();
        let mut execute = tokio_test::task::spawn(execute);

        sleep(Duration::from_secs(1)).await;
        tokio_test::assert_pending!(execute.poll());

        interrupt();
        let result = tokio_test::assert_ready!(execute.poll());
        assert!(matches!(result, Err(ActorError::Canceled)));
    }

    #[tokio::test(start_paused = true)]
    async fn reload_signals_coalesce_into_one_notification() {
        let (signal_tx, signal_rx) = mpsc::channel(16);
        let (reload_tx, mut reload_rx) = reload_queue();

        let mut group = ActorGroup::new();
        group.add(reload_actor(signal_rx, reload_tx));
        group.add_actor("burst", send_burst_then_exit(signal_tx, 10), || {});

        timeout(Duration::from_secs(5), group.run()).await.unwrap().unwrap();
        assert!(reload_rx.try_recv());
        assert!(!reload_rx.try_recv());
    }

    #[tokio::test(start_paused = true)]
    async fn tracer_released_once_when_interrupted() {
        let (closer, closes) = counting_closer();
        let mut group = ActorGroup::new();
        group.add(tracer_actor(closer));
        group.add_actor("one-shot", exit_after(Duration::from_millis(10)), || {});

        timeout(Duration::from_secs(5), group.run()).await.unwrap().unwrap();
        assert_eq!(closes.load(SeqCst), 1);
    }

    #[tokio::test]
    async fn tracer_released_when_actor_is_never_run() {
        let (closer, closes) = counting_closer();
        let actor = tracer_actor(closer);
        assert_eq!(closes.load(SeqCst), 0);

        drop(actor);
        assert_eq!(closes.load(SeqCst), 1);
    }
}
