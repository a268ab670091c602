//! Per-flow timers driving the reporting-state lifecycle.
//!
//! Every conntrack entry owns exactly one [`FlowTimer`]. The data path
//! re-arms it with a single atomic store plus a waiter notification; the
//! actual waiting happens in a detached task that holds only the conntrack
//! key and reopens the entry through the engine on every wake-up, never a
//! borrowed pointer across a sleep.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;

/// Monotonic nanosecond clock shared by the engine and its timer tasks.
///
/// Backed by `tokio::time::Instant` so paused-time tests drive the whole
/// lifecycle deterministically.
#[derive(Debug, Clone)]
pub struct Clock {
    base: tokio::time::Instant,
}

impl Clock {
    pub fn new() -> Self {
        Self { base: tokio::time::Instant::now() }
    }

    /// Nanoseconds since the engine started.
    pub fn now_ns(&self) -> u64 {
        self.base.elapsed().as_nanos() as u64
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

/// One-shot re-armable deadline owned by a conntrack entry.
#[derive(Debug)]
pub(crate) struct FlowTimer {
    deadline_ns: AtomicU64,
    rearm: Notify,
}

impl FlowTimer {
    /// Creates the timer already armed `after` from now.
    pub(crate) fn armed(clock: &Clock, after: Duration) -> Self {
        Self {
            deadline_ns: AtomicU64::new(clock.now_ns() + after.as_nanos() as u64),
            rearm: Notify::new(),
        }
    }

    /// Moves the deadline to `now + after` and wakes the waiting task.
    pub(crate) fn arm(&self, clock: &Clock, after: Duration) {
        self.deadline_ns
            .store(clock.now_ns() + after.as_nanos() as u64, Ordering::Release);
        self.rearm.notify_waiters();
    }

    pub(crate) fn deadline_ns(&self) -> u64 {
        self.deadline_ns.load(Ordering::Acquire)
    }

    /// Resolves when the timer is re-armed by a data packet or tick.
    pub(crate) async fn rearmed(&self) {
        self.rearm.notified().await;
    }
}

/// Cooperative stop signal shared with every timer task.
pub(crate) struct ShutdownSignal {
    triggered: AtomicBool,
    notify: Notify,
}

impl ShutdownSignal {
    pub(crate) fn new() -> Self {
        Self { triggered: AtomicBool::new(false), notify: Notify::new() }
    }

    pub(crate) fn trigger(&self) {
        self.triggered.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    pub(crate) fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::Acquire)
    }

    /// Resolves once [`Self::trigger`] has been called.
    pub(crate) async fn wait(&self) {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_triggered() {
            return;
        }
        notified.await;
    }
}

/// Entry types owning a [`FlowTimer`].
pub(crate) trait TimerOwner {
    fn flow_timer(&self) -> &FlowTimer;
}

/// Result of one timer tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TickOutcome {
    /// The tick re-armed the timer; keep waiting.
    Rearmed,
    /// The entry is gone; the task terminates.
    Released,
}

/// Waits on an entry's timer and invokes `tick` on every expiry until the
/// entry disappears or shutdown is signalled.
///
/// `lookup` reopens the entry on every pass so the task never caches a
/// reference across a sleep; a `None` means the entry was removed behind
/// our back and the task simply exits.
pub(crate) async fn drive_flow_timer<E, L, T>(
    clock: Clock,
    shutdown: Arc<ShutdownSignal>,
    lookup: L,
    tick: T,
) where
    E: TimerOwner + Send + Sync + 'static,
    L: Fn() -> Option<Arc<E>> + Send + 'static,
    T: Fn() -> TickOutcome + Send + 'static,
{
    loop {
        if shutdown.is_triggered() {
            break;
        }
        let Some(entry) = lookup() else { break };
        let deadline = entry.flow_timer().deadline_ns();
        let now = clock.now_ns();
        if now < deadline {
            let wait = Duration::from_nanos(deadline - now);
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = entry.flow_timer().rearmed() => {}
                _ = shutdown.wait() => {}
            }
            continue;
        }
        drop(entry);
        if tick() == TickOutcome::Released {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    struct Entry {
        timer: FlowTimer,
    }

    impl TimerOwner for Entry {
        fn flow_timer(&self) -> &FlowTimer {
            &self.timer
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_fires_after_deadline() {
        let clock = Clock::new();
        let entry = Arc::new(Entry { timer: FlowTimer::armed(&clock, Duration::from_secs(5)) });
        let ticks = Arc::new(AtomicU32::new(0));
        let shutdown = Arc::new(ShutdownSignal::new());

        let lookup_entry = Arc::clone(&entry);
        let tick_counter = Arc::clone(&ticks);
        let handle = tokio::spawn(drive_flow_timer(
            clock,
            Arc::clone(&shutdown),
            move || Some(Arc::clone(&lookup_entry)),
            move || {
                tick_counter.fetch_add(1, Ordering::SeqCst);
                TickOutcome::Released
            },
        ));

        tokio::time::sleep(Duration::from_secs(6)).await;
        handle.await.unwrap();
        assert_eq!(ticks.load(Ordering::SeqCst), 1, "exactly one tick then release");
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_postpones_tick() {
        let clock = Clock::new();
        let entry = Arc::new(Entry { timer: FlowTimer::armed(&clock, Duration::from_secs(5)) });
        let ticks = Arc::new(AtomicU32::new(0));
        let shutdown = Arc::new(ShutdownSignal::new());

        let lookup_entry = Arc::clone(&entry);
        let tick_counter = Arc::clone(&ticks);
        tokio::spawn(drive_flow_timer(
            clock.clone(),
            Arc::clone(&shutdown),
            move || Some(Arc::clone(&lookup_entry)),
            move || {
                tick_counter.fetch_add(1, Ordering::SeqCst);
                TickOutcome::Released
            },
        ));

        // Push the deadline out before it fires.
        tokio::time::sleep(Duration::from_secs(3)).await;
        entry.timer.arm(&clock, Duration::from_secs(10));
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 0, "re-armed timer must not fire early");

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lookup_none_terminates_task() {
        let clock = Clock::new();
        let shutdown = Arc::new(ShutdownSignal::new());
        let handle = tokio::spawn(drive_flow_timer::<Entry, _, _>(
            clock,
            shutdown,
            || None,
            || TickOutcome::Rearmed,
        ));
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_wakes_sleeping_task() {
        let clock = Clock::new();
        let entry = Arc::new(Entry { timer: FlowTimer::armed(&clock, Duration::from_secs(3600)) });
        let shutdown = Arc::new(ShutdownSignal::new());

        let lookup_entry = Arc::clone(&entry);
        let handle = tokio::spawn(drive_flow_timer(
            clock,
            Arc::clone(&shutdown),
            move || Some(Arc::clone(&lookup_entry)),
            || TickOutcome::Rearmed,
        ));

        tokio::time::sleep(Duration::from_secs(1)).await;
        shutdown.trigger();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_wait_is_level_triggered() {
        let shutdown = ShutdownSignal::new();
        shutdown.trigger();
        // Must resolve even though trigger() happened before wait().
        shutdown.wait().await;
        assert!(shutdown.is_triggered());
    }
}
