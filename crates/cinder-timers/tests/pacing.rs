//! Limiter and scheduler working together: the limiter publishes the
//! full index, the scheduler drains against it, exactly as the machine's
//! run loop wires them.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use cinder_time::{FakeHostClock, HostClock, NANOS_PER_MILLI};
use cinder_timers::{CycleLimiter, EventScheduler};

struct Harness {
    limiter: CycleLimiter,
    scheduler: Rc<EventScheduler>,
    clock: Arc<FakeHostClock>,
}

fn harness(target_cycles_per_ms: u32) -> Harness {
    let clock = Arc::new(FakeHostClock::new(0));
    let stop = Arc::new(AtomicBool::new(false));
    let limiter = CycleLimiter::new(clock.clone(), target_cycles_per_ms, stop);
    let scheduler = Rc::new(EventScheduler::new(limiter.full_index_handle()));
    Harness {
        limiter,
        scheduler,
        clock,
    }
}

impl Harness {
    /// One emulated instruction: a cycle consumed, pacing, event drain.
    fn tick(&mut self, cycles: u64) {
        self.limiter.regulate(cycles);
        self.limiter.publish_full_index(cycles);
        self.scheduler.process_events();
    }
}

#[test]
fn events_fire_when_emulated_time_reaches_them() {
    let mut harness = harness(1_000);
    let fired_at_cycle = Rc::new(RefCell::new(Vec::new()));

    {
        let fired = fired_at_cycle.clone();
        let current = Rc::new(RefCell::new(0u64));
        let current_for_loop = current.clone();
        harness.scheduler.add_event(
            Rc::new(move |_| fired.borrow_mut().push(*current.borrow())),
            3.0,
            0,
        );

        for cycles in 1..=5_000u64 {
            *current_for_loop.borrow_mut() = cycles;
            harness.tick(cycles);
        }
    }

    // Due at 3.0 ms of emulated time = 3000 cycles at 1000 cycles/ms.
    assert_eq!(&*fired_at_cycle.borrow(), &[3_000]);
}

#[test]
fn io_charge_postpones_the_wall_clock_wait_but_not_event_order() {
    let mut harness = harness(1_000);
    let fired = Rc::new(RefCell::new(Vec::new()));

    for (delay, tag) in [(1.0, 1u32), (2.0, 2)] {
        let fired = fired.clone();
        harness
            .scheduler
            .add_event(Rc::new(move |value| fired.borrow_mut().push(value)), delay, tag);
    }

    // Charge half a tick of I/O latency up front: the first tick boundary
    // moves out, so fewer wall-clock waits happen for the same cycles.
    harness.limiter.consume_io_cycles(500, 0);
    for cycles in 1..=2_600u64 {
        harness.tick(cycles);
    }

    assert_eq!(&*fired.borrow(), &[1, 2]);
    assert_eq!(harness.limiter.tick_count(), 2);
    assert!(harness.clock.now_ns() <= 3 * NANOS_PER_MILLI);
}

#[test]
fn tick_handlers_follow_the_limiter_tick_rate() {
    let mut harness = harness(100);
    let ticks = Rc::new(RefCell::new(0u32));
    {
        let ticks = ticks.clone();
        harness
            .scheduler
            .register_tick_handler(Rc::new(move || *ticks.borrow_mut() += 1));
    }

    for cycles in 1..=1_000u64 {
        harness.tick(cycles);
    }
    // 1000 cycles at 100 cycles/ms = 10 emulated milliseconds.
    assert_eq!(harness.limiter.tick_count(), 10);
    assert_eq!(*ticks.borrow(), 10);
}

#[test]
fn speed_change_applies_from_the_next_tick() {
    let mut harness = harness(1_000);

    // Finish one tick at the original speed.
    for cycles in 1..=1_000u64 {
        harness.tick(cycles);
    }
    assert_eq!(harness.limiter.tick_count(), 1);

    // Raise the target: the running tick keeps its old budget, the next
    // boundary uses the new one.
    harness.limiter.increase_cycles();
    assert_eq!(harness.limiter.target_cycles_per_ms(), 2_000);

    for cycles in 1_001..=2_000u64 {
        harness.tick(cycles);
    }
    assert_eq!(harness.limiter.tick_count(), 2);

    for cycles in 2_001..=4_000u64 {
        harness.tick(cycles);
    }
    assert_eq!(harness.limiter.tick_count(), 3);
}
