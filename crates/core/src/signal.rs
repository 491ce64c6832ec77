//! Scheduling-change signals: the wake-up channel between everything that
//! mutates the schedule and the dispatcher loop.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio::sync::Notify;

#[derive(Debug, Default)]
struct SignalState {
    paused: bool,
    halted: bool,
    signaled: bool,
    /// Earliest candidate fire time carried by pending signals; 0 means
    /// "unknown, assume earlier than anything acquired".
    signaled_next_fire_ms: u64,
}

/// Cheap-clone handle to the dispatcher's signal state. All reads and writes
/// go through one lock; the lock is never held across an await.
///
/// Signals are level-triggered: [`clear_signaled`](Self::clear_signaled)
/// forgets prior signals, and multiple signals between clears collapse to
/// the earliest candidate fire time seen (with 0 dominating).
#[derive(Debug, Clone)]
pub struct Signaler {
    inner: Arc<SignalShared>,
}

#[derive(Debug)]
struct SignalShared {
    state: Mutex<SignalState>,
    notify: Notify,
}

impl Default for Signaler {
    fn default() -> Self {
        Self::new()
    }
}

impl Signaler {
    /// A new signaler; the dispatcher starts paused.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SignalShared {
                state: Mutex::new(SignalState {
                    paused: true,
                    ..SignalState::default()
                }),
                notify: Notify::new(),
            }),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, SignalState> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Tell the loop the schedule changed. `candidate_fire_ms` is the
    /// earliest fire time of whatever changed, or 0 when unknown.
    pub fn signal_scheduling_change(&self, candidate_fire_ms: u64) {
        {
            let mut state = self.state();
            state.signaled_next_fire_ms = if !state.signaled {
                candidate_fire_ms
            } else if state.signaled_next_fire_ms == 0 || candidate_fire_ms == 0 {
                0
            } else {
                state.signaled_next_fire_ms.min(candidate_fire_ms)
            };
            state.signaled = true;
        }
        self.inner.notify.notify_one();
    }

    pub fn clear_signaled(&self) {
        let mut state = self.state();
        state.signaled = false;
        state.signaled_next_fire_ms = 0;
    }

    #[must_use]
    pub fn is_signaled(&self) -> bool {
        self.state().signaled
    }

    #[must_use]
    pub fn signaled_next_fire_ms(&self) -> u64 {
        self.state().signaled_next_fire_ms
    }

    pub fn set_paused(&self, paused: bool) {
        self.state().paused = paused;
        self.inner.notify.notify_one();
    }

    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.state().paused
    }

    /// Ask the loop to exit at its next suspension point.
    pub fn halt(&self) {
        self.state().halted = true;
        self.inner.notify.notify_one();
    }

    #[must_use]
    pub fn is_halted(&self) -> bool {
        self.state().halted
    }

    /// Atomically read the pending signal's candidate fire time, optionally
    /// consuming it. `None` when no signal is pending.
    #[must_use]
    pub fn signal_snapshot(&self, clear: bool) -> Option<u64> {
        let mut state = self.state();
        if !state.signaled {
            return None;
        }
        let candidate = state.signaled_next_fire_ms;
        if clear {
            state.signaled = false;
            state.signaled_next_fire_ms = 0;
        }
        Some(candidate)
    }

    /// Sleep until woken by a signal or until the timeout elapses. A wake
    /// that raced this call is not lost (one permit is buffered).
    pub async fn wait_signaled(&self, timeout: Duration) {
        let notified = self.inner.notify.notified();
        tokio::select! {
            () = tokio::time::sleep(timeout) => {},
            () = notified => {},
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_paused_not_halted() {
        let s = Signaler::new();
        assert!(s.is_paused());
        assert!(!s.is_halted());
        assert!(!s.is_signaled());
    }

    #[test]
    fn test_signals_collapse_to_earliest() {
        let s = Signaler::new();
        s.signal_scheduling_change(5_000);
        s.signal_scheduling_change(3_000);
        s.signal_scheduling_change(9_000);
        assert!(s.is_signaled());
        assert_eq!(s.signaled_next_fire_ms(), 3_000);
    }

    #[test]
    fn test_zero_candidate_dominates() {
        let s = Signaler::new();
        s.signal_scheduling_change(5_000);
        s.signal_scheduling_change(0);
        assert_eq!(s.signaled_next_fire_ms(), 0);
        // And stays dominant over later hints.
        s.signal_scheduling_change(7_000);
        assert_eq!(s.signaled_next_fire_ms(), 0);
    }

    #[test]
    fn test_clear_forgets_prior_signals() {
        let s = Signaler::new();
        s.signal_scheduling_change(5_000);
        s.clear_signaled();
        assert!(!s.is_signaled());
        assert_eq!(s.signaled_next_fire_ms(), 0);
        s.signal_scheduling_change(8_000);
        assert_eq!(s.signaled_next_fire_ms(), 8_000);
    }

    #[tokio::test]
    async fn test_wait_wakes_on_signal() {
        let s = Signaler::new();
        let waiter = s.clone();
        let handle = tokio::spawn(async move {
            waiter.wait_signaled(Duration::from_secs(30)).await;
        });
        s.signal_scheduling_change(0);
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("waiter should wake promptly")
            .unwrap();
    }

    #[tokio::test]
    async fn test_wait_times_out() {
        let s = Signaler::new();
        tokio::time::timeout(Duration::from_millis(500), s.wait_signaled(Duration::from_millis(10)))
            .await
            .expect("timeout should elapse");
    }
}
