//! A time source for the placement cache that tests can replace.

use parking_lot::Mutex;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

//------------ Clock ---------------------------------------------------------

/// A source of instants that know how much time has elapsed since them.
pub trait Clock: Clone + Send + Sync + 'static {
    /// The instant type produced by the clock.
    type Instant: Clone + Debug + Elapsed + Send + Sync;

    /// Creates a new instance of the clock.
    fn new() -> Self;

    /// Records the current time.
    fn now(&self) -> Self::Instant;
}

//------------ Elapsed -------------------------------------------------------

/// Reports the time elapsed since an instant was taken.
pub trait Elapsed {
    /// Returns the elapsed time.
    fn elapsed(&self) -> Duration;
}

//------------ SystemClock ---------------------------------------------------

/// The clock of the Tokio runtime.
///
/// Using Tokio's instant rather than the one from `std` means that a
/// runtime with paused time also pauses cache expiry.
#[derive(Clone, Debug, Default)]
pub struct SystemClock {}

impl Clock for SystemClock {
    type Instant = tokio::time::Instant;

    fn new() -> Self {
        Self {}
    }

    fn now(&self) -> Self::Instant {
        tokio::time::Instant::now()
    }
}

impl Elapsed for tokio::time::Instant {
    fn elapsed(&self) -> Duration {
        tokio::time::Instant::elapsed(self)
    }
}

//------------ FakeClock -----------------------------------------------------

/// A clock that only moves when told to.
#[derive(Clone, Debug)]
pub struct FakeClock {
    now: Arc<Mutex<Duration>>,
}

impl FakeClock {
    /// Moves the clock forward by `adjust`.
    pub fn adjust_time(&self, adjust: Duration) {
        let mut now = self.now.lock();
        *now = now.saturating_add(adjust);
    }

    fn curr_time(&self) -> Duration {
        *self.now.lock()
    }
}

impl Clock for FakeClock {
    type Instant = FakeInstant;

    fn new() -> Self {
        Self {
            now: Arc::new(Mutex::new(Duration::ZERO)),
        }
    }

    fn now(&self) -> Self::Instant {
        FakeInstant {
            start: self.curr_time(),
            clock: self.clone(),
        }
    }
}

//------------ FakeInstant ---------------------------------------------------

/// An instant of a [`FakeClock`].
#[derive(Clone, Debug)]
pub struct FakeInstant {
    start: Duration,
    clock: FakeClock,
}

impl Elapsed for FakeInstant {
    fn elapsed(&self) -> Duration {
        self.clock.curr_time().saturating_sub(self.start)
    }
}
