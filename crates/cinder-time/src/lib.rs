//! Host time sources for the emulator core.
//!
//! The cycle limiter and the event scheduler never read `Instant::now()`
//! directly; they go through [`HostClock`] so tests can substitute a
//! [`FakeHostClock`] and drive time deterministically.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const NANOS_PER_MILLI: u64 = 1_000_000;

/// A monotonic host clock plus the primitives the graduated waiter needs.
///
/// The waiting hooks exist so a fake clock can make waiting *advance* time
/// instead of blocking the test thread.
pub trait HostClock: Send + Sync {
    /// Monotonic time in nanoseconds since an arbitrary epoch.
    fn now_ns(&self) -> u64;

    /// Coarse wait: give up the CPU for up to `timeout`.
    fn park(&self, timeout: Duration);

    /// Medium wait: cooperative yield to other threads.
    fn yield_now(&self);

    /// Fine wait: a single pause-instruction style hint.
    fn spin(&self);
}

/// Production clock backed by `std::time::Instant`.
///
/// `park` uses `thread::park_timeout`, never an OS sleep whose resolution is
/// tied to the system timer granularity.
pub struct StdHostClock {
    epoch: Instant,
}

impl StdHostClock {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }
}

impl Default for StdHostClock {
    fn default() -> Self {
        Self::new()
    }
}

impl HostClock for StdHostClock {
    fn now_ns(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }

    fn park(&self, timeout: Duration) {
        std::thread::park_timeout(timeout);
    }

    fn yield_now(&self) {
        std::thread::yield_now();
    }

    fn spin(&self) {
        std::hint::spin_loop();
    }
}

/// Deterministic clock for tests. Waiting advances the clock instead of
/// blocking, so throttling code can be exercised without real sleeps.
pub struct FakeHostClock {
    now_ns: AtomicU64,
}

impl FakeHostClock {
    pub fn new(start_ns: u64) -> Self {
        Self {
            now_ns: AtomicU64::new(start_ns),
        }
    }

    pub fn set_ns(&self, ns: u64) {
        self.now_ns.store(ns, Ordering::SeqCst);
    }

    pub fn advance_ns(&self, delta: u64) {
        self.now_ns.fetch_add(delta, Ordering::SeqCst);
    }
}

impl HostClock for FakeHostClock {
    fn now_ns(&self) -> u64 {
        self.now_ns.load(Ordering::SeqCst)
    }

    fn park(&self, timeout: Duration) {
        self.advance_ns(timeout.as_nanos() as u64);
    }

    fn yield_now(&self) {
        // A cooperative yield costs on the order of tens of microseconds.
        self.advance_ns(50_000);
    }

    fn spin(&self) {
        self.advance_ns(1_000);
    }
}

/// Monotonic emulated-time coordinate `tick_count + fraction_of_current_tick`
/// published by the cycle limiter and read from other threads (UI, audio).
///
/// The value is an `f64` stored as its bit pattern; the writer uses a
/// release store and readers an acquire load, which is the entire
/// cross-thread contract of the limiter.
pub struct AtomicFullIndex {
    bits: AtomicU64,
}

impl AtomicFullIndex {
    pub fn new() -> Self {
        Self {
            bits: AtomicU64::new(0f64.to_bits()),
        }
    }

    pub fn store(&self, value: f64) {
        self.bits.store(value.to_bits(), Ordering::Release);
    }

    pub fn load(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Acquire))
    }
}

impl Default for AtomicFullIndex {
    fn default() -> Self {
        Self::new()
    }
}

/// Below this remainder the waiter stops yielding and pure-spins.
const SPIN_THRESHOLD_NS: u64 = 50_000;

/// Graduated waiter: park with a short timeout while ≥ 1 ms remains, then
/// cooperative yields, then a pure spin for the final stretch. Polls a stop
/// flag so an external shutdown request is honored mid-wait.
pub fn wait_until(clock: &dyn HostClock, target_ns: u64, stop: &AtomicBool) {
    loop {
        if stop.load(Ordering::Relaxed) {
            return;
        }
        let now = clock.now_ns();
        if now >= target_ns {
            return;
        }
        let remaining = target_ns - now;
        if remaining >= NANOS_PER_MILLI {
            clock.park(Duration::from_millis(1));
        } else if remaining >= SPIN_THRESHOLD_NS {
            clock.yield_now();
        } else {
            clock.spin();
        }
    }
}

/// Shared handle alias used across the core; devices and the limiter hold
/// the clock behind an `Arc` the way `aero-time` shares its host clock.
pub type SharedClock = Arc<dyn HostClock>;
