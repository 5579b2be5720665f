//! Budgeted execution throttle.
//!
//! The executor calls [`CycleLimiter::regulate`] after every instruction.
//! The fast path is a single integer compare; once a tick's cycle budget is
//! consumed the limiter waits the wall clock out to the 1 ms boundary and
//! publishes the monotonic full index for cross-thread readers.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use cinder_time::{wait_until, AtomicFullIndex, HostClock, NANOS_PER_MILLI};

pub const MIN_CYCLES_PER_MS: u32 = 100;
pub const MAX_CYCLES_PER_MS: u32 = 60_000;
pub const DEFAULT_CYCLES_PER_MS: u32 = 3_000;

/// When the emulation thread stalls (debugger, host hiccup) we allow at most
/// this many milliseconds of catch-up before resynchronising, so the CPU does
/// not burst unthrottled afterwards.
pub const MAX_CATCH_UP_TICKS: u64 = 20;

const CYCLES_STEP: u32 = 1_000;

pub struct CycleLimiter {
    clock: Arc<dyn HostClock>,
    stop: Arc<AtomicBool>,
    full_index: Arc<AtomicFullIndex>,

    target_cycles_per_ms: u32,
    /// Snapshot of the target taken at the start of the current tick; a
    /// mid-tick target change only applies from the next boundary.
    tick_cycle_max: u32,
    next_tick_boundary_cycles: u64,
    tick_count: u64,
    last_wall_ns: u64,
    io_delay_removed: u64,
    paused: bool,
}

impl CycleLimiter {
    pub fn new(clock: Arc<dyn HostClock>, target_cycles_per_ms: u32, stop: Arc<AtomicBool>) -> Self {
        let target = if target_cycles_per_ms == 0 {
            DEFAULT_CYCLES_PER_MS
        } else {
            target_cycles_per_ms.clamp(MIN_CYCLES_PER_MS, MAX_CYCLES_PER_MS)
        };
        let now = clock.now_ns();
        Self {
            clock,
            stop,
            full_index: Arc::new(AtomicFullIndex::new()),
            target_cycles_per_ms: target,
            tick_cycle_max: target,
            next_tick_boundary_cycles: target as u64,
            tick_count: 0,
            last_wall_ns: now,
            io_delay_removed: 0,
            paused: false,
        }
    }

    /// Shared handle for readers on other threads (UI, audio pacing).
    pub fn full_index_handle(&self) -> Arc<AtomicFullIndex> {
        self.full_index.clone()
    }

    pub fn tick_count(&self) -> u64 {
        self.tick_count
    }

    pub fn target_cycles_per_ms(&self) -> u32 {
        self.target_cycles_per_ms
    }

    pub fn io_delay_removed(&self) -> u64 {
        self.io_delay_removed
    }

    /// Hot path: called with the CPU's monotonically increasing cycle count
    /// after every retired instruction.
    pub fn regulate(&mut self, cycles: u64) {
        if cycles < self.next_tick_boundary_cycles {
            return;
        }

        // A full tick of cycles has been consumed.
        self.tick_count += 1;
        self.io_delay_removed = 0;
        self.tick_cycle_max = self.target_cycles_per_ms;
        self.next_tick_boundary_cycles = cycles + self.tick_cycle_max as u64;

        if !self.paused {
            // Track where we *should* be, not where we are: assigning the
            // target instead of `now` keeps overshoot from drifting.
            let target_ns = self.last_wall_ns + NANOS_PER_MILLI;
            if self.clock.now_ns() < target_ns {
                wait_until(self.clock.as_ref(), target_ns, &self.stop);
            }
            self.last_wall_ns = target_ns;

            let now = self.clock.now_ns();
            let max_behind = MAX_CATCH_UP_TICKS * NANOS_PER_MILLI;
            if now.saturating_sub(self.last_wall_ns) > max_behind {
                self.last_wall_ns = now - max_behind;
            }
        }

        self.publish_full_index(cycles);
    }

    /// Recompute and publish `tick_count + fraction_of_current_tick`.
    ///
    /// The fraction is clamped below at zero (an I/O charge can move the
    /// boundary past the current cycle count) but deliberately not above
    /// one: a long instruction may overshoot the boundary, and flattening
    /// that into a plateau perturbs readers that pace audio off this value.
    pub fn publish_full_index(&self, cycles: u64) -> f64 {
        let tick_start = self.next_tick_boundary_cycles - self.tick_cycle_max as u64;
        let cycles_in_tick = cycles.saturating_sub(tick_start);
        let fraction = cycles_in_tick as f64 / self.tick_cycle_max as f64;
        let index = self.tick_count as f64 + fraction.max(0.0);
        self.full_index.store(index);
        index
    }

    /// Charge the current tick for emulated I/O latency: the boundary moves
    /// forward by `n`, capped at the cycles remaining in the tick.
    pub fn consume_io_cycles(&mut self, n: u64, cycles: u64) {
        let remaining = self.next_tick_boundary_cycles.saturating_sub(cycles);
        let charged = n.min(remaining);
        self.next_tick_boundary_cycles += charged;
        self.io_delay_removed += charged;
    }

    pub fn increase_cycles(&mut self) {
        self.target_cycles_per_ms =
            (self.target_cycles_per_ms + CYCLES_STEP).clamp(MIN_CYCLES_PER_MS, MAX_CYCLES_PER_MS);
    }

    pub fn decrease_cycles(&mut self) {
        self.target_cycles_per_ms = self
            .target_cycles_per_ms
            .saturating_sub(CYCLES_STEP)
            .clamp(MIN_CYCLES_PER_MS, MAX_CYCLES_PER_MS);
    }

    pub fn on_pause(&mut self) {
        self.paused = true;
    }

    /// Resuming resets the wall-clock origin to "now" so the time missed
    /// while paused is not replayed as a catch-up burst.
    pub fn on_resume(&mut self) {
        self.paused = false;
        self.last_wall_ns = self.clock.now_ns();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cinder_time::FakeHostClock;
    use std::sync::atomic::Ordering;

    fn limiter_with_fake(target: u32) -> (CycleLimiter, Arc<FakeHostClock>, Arc<AtomicBool>) {
        let clock = Arc::new(FakeHostClock::new(0));
        let stop = Arc::new(AtomicBool::new(false));
        let limiter = CycleLimiter::new(clock.clone(), target, stop.clone());
        (limiter, clock, stop)
    }

    #[test]
    fn zero_target_selects_default() {
        let (limiter, _, _) = limiter_with_fake(0);
        assert_eq!(limiter.target_cycles_per_ms(), DEFAULT_CYCLES_PER_MS);
    }

    #[test]
    fn fast_path_does_not_tick() {
        let (mut limiter, clock, _) = limiter_with_fake(1_000);
        limiter.regulate(999);
        assert_eq!(limiter.tick_count(), 0);
        assert_eq!(clock.now_ns(), 0);
    }

    #[test]
    fn tick_boundary_waits_out_the_millisecond() {
        let (mut limiter, clock, _) = limiter_with_fake(1_000);
        limiter.regulate(1_000);
        assert_eq!(limiter.tick_count(), 1);
        assert!(clock.now_ns() >= NANOS_PER_MILLI);
    }

    #[test]
    fn ten_thousand_cycles_make_ten_ticks() {
        let (mut limiter, clock, _) = limiter_with_fake(1_000);
        for cycles in 1..=10_000u64 {
            limiter.regulate(cycles);
        }
        assert_eq!(limiter.tick_count(), 10);
        let elapsed = clock.now_ns();
        assert!((9 * NANOS_PER_MILLI..=12 * NANOS_PER_MILLI).contains(&elapsed));
    }

    #[test]
    fn full_index_is_monotonic_and_fractional() {
        let (mut limiter, _, _) = limiter_with_fake(1_000);
        let index = limiter.full_index_handle();

        let mut last = index.load();
        for cycles in 1..=5_000u64 {
            limiter.regulate(cycles);
            let seen = limiter.publish_full_index(cycles);
            assert!(seen >= last);
            last = seen;
        }
        assert!(last >= 5.0);
    }

    #[test]
    fn overshoot_fraction_is_not_clamped() {
        let (limiter, _, _) = limiter_with_fake(1_000);
        // A single long instruction pushes past the tick boundary before
        // regulate sees it; the published fraction exceeds 1.0.
        let index = limiter.publish_full_index(1_500);
        assert!(index > 1.0);
    }

    #[test]
    fn io_charge_is_capped_at_the_tick_remainder() {
        let (mut limiter, _, _) = limiter_with_fake(1_000);
        limiter.consume_io_cycles(400, 700); // 300 cycles remain in the tick
        assert_eq!(limiter.io_delay_removed(), 300);
        // The boundary moved, so the tick now ends at 1300.
        limiter.regulate(1_299);
        assert_eq!(limiter.tick_count(), 0);
        limiter.regulate(1_300);
        assert_eq!(limiter.tick_count(), 1);
    }

    #[test]
    fn speed_adjustments_clamp() {
        let (mut limiter, _, _) = limiter_with_fake(59_500);
        limiter.increase_cycles();
        assert_eq!(limiter.target_cycles_per_ms(), MAX_CYCLES_PER_MS);
        for _ in 0..100 {
            limiter.decrease_cycles();
        }
        assert_eq!(limiter.target_cycles_per_ms(), MIN_CYCLES_PER_MS);
    }

    #[test]
    fn resume_does_not_replay_paused_time() {
        let (mut limiter, clock, _) = limiter_with_fake(1_000);
        limiter.regulate(1_000);
        limiter.on_pause();
        clock.advance_ns(500 * NANOS_PER_MILLI);
        limiter.on_resume();

        let before = clock.now_ns();
        limiter.regulate(2_000);
        // One tick should cost about one millisecond, not the 500 ms that
        // passed while paused.
        assert!(clock.now_ns() - before <= 2 * NANOS_PER_MILLI);
    }

    #[test]
    fn stop_flag_aborts_the_wait() {
        let (mut limiter, clock, stop) = limiter_with_fake(1_000);
        stop.store(true, Ordering::Relaxed);
        limiter.regulate(1_000);
        // No waiting happened.
        assert_eq!(clock.now_ns(), 0);
    }
}
