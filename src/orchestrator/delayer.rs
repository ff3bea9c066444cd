//! Rate limiting of process starts.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Decides whether a new subprocess may start now.
///
/// A leaky bucket of one: after a permitted start, the next one is allowed
/// only once the interval has passed. An interval of zero never limits.
///
/// Clones share state, so every lane (and every inner lane of an adaptive
/// batch) draws from the same budget.
///
/// Each call to [`allows_start`](Delayer::allows_start) that returns `true`
/// consumes the slot; callers must start a process whenever they get `true`.
#[derive(Debug, Clone)]
pub struct Delayer {
    state: Arc<Mutex<DelayerState>>,
}

#[derive(Debug)]
struct DelayerState {
    interval: Duration,
    next_allowed: Option<Instant>,
}

impl Delayer {
    pub fn new(interval: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(DelayerState {
                interval,
                next_allowed: None,
            })),
        }
    }

    /// A delayer that always allows starts.
    pub fn unlimited() -> Self {
        Self::new(Duration::ZERO)
    }

    pub fn interval(&self) -> Duration {
        self.lock().interval
    }

    /// Changes the interval; the already scheduled slot is kept.
    pub fn set_interval(&self, interval: Duration) {
        self.lock().interval = interval;
    }

    pub fn allows_start(&self) -> bool {
        self.allows_start_at(Instant::now())
    }

    fn allows_start_at(&self, now: Instant) -> bool {
        let mut state = self.lock();
        if state.interval.is_zero() {
            return true;
        }

        let next_allowed = *state.next_allowed.get_or_insert(now);
        if now < next_allowed {
            return false;
        }

        state.next_allowed = Some(now + state.interval);
        true
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, DelayerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_interval_always_allows() {
        let delayer = Delayer::unlimited();
        assert!((0..100).all(|_| delayer.allows_start()));
    }

    #[test]
    fn test_first_call_allows_then_waits_for_interval() {
        let delayer = Delayer::new(Duration::from_millis(250));
        let t0 = Instant::now();

        assert!(delayer.allows_start_at(t0));
        assert!(!delayer.allows_start_at(t0));
        assert!(!delayer.allows_start_at(t0 + Duration::from_millis(249)));
        assert!(delayer.allows_start_at(t0 + Duration::from_millis(250)));
        assert!(!delayer.allows_start_at(t0 + Duration::from_millis(400)));
        assert!(delayer.allows_start_at(t0 + Duration::from_millis(500)));
    }

    #[test]
    fn test_tight_loop_allows_one_start_per_window() {
        let delayer = Delayer::new(Duration::from_millis(250));
        let started = Instant::now();
        let mut allowed = 0;

        while started.elapsed() < Duration::from_millis(600) {
            if delayer.allows_start() {
                allowed += 1;
            }
        }

        // starts at ~0ms, ~250ms and ~500ms
        assert!(allowed <= 3, "allowed {allowed} starts");
        assert!(allowed >= 2, "allowed {allowed} starts");
    }

    #[test]
    fn test_clones_share_budget() {
        let delayer = Delayer::new(Duration::from_secs(60));
        let lane = delayer.clone();

        assert!(delayer.allows_start());
        assert!(!lane.allows_start());

        lane.set_interval(Duration::ZERO);
        assert!(delayer.allows_start());
        assert_eq!(delayer.interval(), Duration::ZERO);
    }
}
