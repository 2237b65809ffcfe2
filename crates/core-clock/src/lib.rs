//! Injectable monotonic time source.
//!
//! Every timeout in the runtime — idle polling, the recoat handshake,
//! back-pressure waits, shutdown ceilings — reads time exclusively through
//! [`Clock`]. Production uses the OS monotonic clock; tests inject
//! [`FakeClock`], whose `sleep` advances virtual time instead of parking the
//! thread, making the timeout scenarios deterministic and instant.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Monotonic time source. `sleep` must advance `now` by at least the
/// requested duration (exactly, for fake clocks).
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;

    fn sleep(&self, duration: Duration);

    fn sleep_until(&self, deadline: Instant) {
        let now = self.now();
        if deadline > now {
            self.sleep(deadline - now);
        }
    }
}

/// OS monotonic clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct MonotonicClock;

impl Clock for MonotonicClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Controllable clock for tests.
///
/// Time starts at an arbitrary base instant and only moves when a thread
/// sleeps (auto-advance) or a test calls [`FakeClock::advance`]. With every
/// suspension point in the runtime polling through the clock, sleeping
/// threads always make progress and scripted fixtures keyed on virtual
/// instants fire at predictable offsets.
#[derive(Debug, Clone)]
pub struct FakeClock {
    inner: Arc<Mutex<FakeState>>,
}

#[derive(Debug)]
struct FakeState {
    base: Instant,
    offset: Duration,
}

impl Default for FakeClock {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeClock {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(FakeState {
                base: Instant::now(),
                offset: Duration::ZERO,
            })),
        }
    }

    /// Move virtual time forward without a sleeping thread.
    pub fn advance(&self, by: Duration) {
        let mut state = self.inner.lock().expect("fake clock poisoned");
        state.offset += by;
    }

    /// Virtual time elapsed since the clock was created.
    pub fn elapsed(&self) -> Duration {
        self.inner.lock().expect("fake clock poisoned").offset
    }
}

impl Clock for FakeClock {
    fn now(&self) -> Instant {
        let state = self.inner.lock().expect("fake clock poisoned");
        state.base + state.offset
    }

    fn sleep(&self, duration: Duration) {
        self.advance(duration);
        // Yield so other workers sharing the clock interleave rather than one
        // thread racing virtual time ahead unboundedly.
        std::thread::yield_now();
    }
}
