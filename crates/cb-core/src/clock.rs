//! Injectable monotonic clock.
//!
//! Every polling loop, settle delay, and wall-clock deadline in the engine goes
//! through a [`Clock`] rather than touching `Instant`/`thread::sleep` directly.
//! Production code uses [`SystemClock`]; tests use [`TestClock`], whose `sleep`
//! advances virtual time, so dwell/timeout/debounce logic runs deterministically
//! and instantly under test.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::cancel::CancelToken;

/// Monotonic time source with a cooperative sleep.
pub trait Clock: Send + Sync {
    /// Seconds since an arbitrary fixed epoch. Monotonic, never decreasing.
    fn now_s(&self) -> f64;

    /// Block the calling thread for `duration_s` seconds (no-op if <= 0).
    fn sleep_s(&self, duration_s: f64);
}

/// Real wall clock backed by `Instant`.
#[derive(Debug)]
pub struct SystemClock {
    epoch: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_s(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64()
    }

    fn sleep_s(&self, duration_s: f64) {
        if duration_s > 0.0 {
            std::thread::sleep(Duration::from_secs_f64(duration_s));
        }
    }
}

/// Virtual clock for deterministic tests: `sleep_s` advances time instead of
/// blocking.
#[derive(Debug, Default)]
pub struct TestClock {
    now_s: Mutex<f64>,
}

impl TestClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance virtual time without going through a sleep.
    pub fn advance(&self, dt_s: f64) {
        let mut now = self.now_s.lock().expect("test clock poisoned");
        *now += dt_s.max(0.0);
    }
}

impl Clock for TestClock {
    fn now_s(&self) -> f64 {
        *self.now_s.lock().expect("test clock poisoned")
    }

    fn sleep_s(&self, duration_s: f64) {
        self.advance(duration_s);
    }
}

/// Sleep up to `duration_s`, waking at `tick_s` granularity to observe the
/// cancellation token. Returns `false` if cancellation cut the sleep short.
pub fn sleep_cancellable(
    clock: &dyn Clock,
    cancel: &CancelToken,
    duration_s: f64,
    tick_s: f64,
) -> bool {
    let deadline = clock.now_s() + duration_s.max(0.0);
    let tick = tick_s.max(1e-3);
    loop {
        if cancel.is_cancelled() {
            return false;
        }
        let remaining = deadline - clock.now_s();
        if remaining <= 0.0 {
            return true;
        }
        clock.sleep_s(remaining.min(tick));
    }
}
