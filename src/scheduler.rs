use crate::actor::ActorClient;
use tokio::time::Duration;

/// The four timers driving a RaftPeer. Timers never call into the peer
/// directly; they enqueue an event on its mailbox.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TimerKind {
    /// Follower idle timeout; firing starts a candidacy.
    Tick,
    /// Election did not conclude; firing steps back to follower.
    Elect,
    /// Leader heartbeat period (repeating).
    Heartbeat,
    /// Compaction check period (repeating).
    Snapshot,
}

/// Injected time source so tests can drive timers by hand.
pub trait Scheduler {
    fn schedule(&self, delay: Duration, kind: TimerKind) -> TimerHandle;
    fn schedule_repeating(&self, period: Duration, kind: TimerKind) -> TimerHandle;
}

/// Cancels its timer when dropped or on explicit `cancel()`. Canceling a
/// timer that already fired or was never armed is a safe no-op.
pub struct TimerHandle {
    stopper: Option<stop_signal::Stopper>,
}

impl TimerHandle {
    fn new(stopper: stop_signal::Stopper) -> TimerHandle {
        TimerHandle {
            stopper: Some(stopper),
        }
    }

    /// A handle with nothing behind it, for schedulers that track firings
    /// externally (tests).
    pub(crate) fn inert() -> TimerHandle {
        TimerHandle { stopper: None }
    }

    pub fn cancel(&mut self) {
        if let Some(stopper) = self.stopper.take() {
            stopper.stop();
        }
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Production scheduler: each armed timer is a spawned tokio task that
/// sleeps and then enqueues its event unless stopped first.
pub struct TokioScheduler {
    client: ActorClient,
}

impl TokioScheduler {
    pub fn new(client: ActorClient) -> TokioScheduler {
        TokioScheduler { client }
    }
}

impl Scheduler for TokioScheduler {
    fn schedule(&self, delay: Duration, kind: TimerKind) -> TimerHandle {
        let (stopper, stop_check) = stop_signal::new();
        let client = self.client.clone();
        tokio::task::spawn(async move {
            tokio::time::sleep(delay).await;
            if !stop_check.is_stopped() {
                client.timer(kind).await;
            }
        });
        TimerHandle::new(stopper)
    }

    fn schedule_repeating(&self, period: Duration, kind: TimerKind) -> TimerHandle {
        let (stopper, stop_check) = stop_signal::new();
        let client = self.client.clone();
        tokio::task::spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut interval = tokio::time::interval_at(start, period);
            loop {
                interval.tick().await;
                if stop_check.is_stopped() || !client.timer(kind).await {
                    return;
                }
            }
        });
        TimerHandle::new(stopper)
    }
}

mod stop_signal {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    pub(super) fn new() -> (Stopper, StopCheck) {
        let signal = Arc::new(AtomicBool::new(false));
        (Stopper(signal.clone()), StopCheck(signal))
    }

    pub(super) struct Stopper(Arc<AtomicBool>);

    impl Stopper {
        pub(super) fn stop(self) {
            self.0.store(true, Ordering::Release);
        }
    }

    pub(super) struct StopCheck(Arc<AtomicBool>);

    impl StopCheck {
        pub(super) fn is_stopped(&self) -> bool {
            self.0.load(Ordering::Acquire)
        }
    }
}
