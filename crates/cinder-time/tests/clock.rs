use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use cinder_time::{wait_until, AtomicFullIndex, FakeHostClock, HostClock, NANOS_PER_MILLI};

#[test]
fn fake_clock_advances_and_sets() {
    let host = Arc::new(FakeHostClock::new(0));
    assert_eq!(host.now_ns(), 0);
    host.advance_ns(100);
    assert_eq!(host.now_ns(), 100);
    host.set_ns(5_000);
    assert_eq!(host.now_ns(), 5_000);
}

#[test]
fn wait_until_reaches_target_on_fake_clock() {
    let host = FakeHostClock::new(0);
    let stop = AtomicBool::new(false);

    wait_until(&host, 3 * NANOS_PER_MILLI, &stop);
    assert!(host.now_ns() >= 3 * NANOS_PER_MILLI);
    // The graduated ladder should not overshoot by a full park interval once
    // it is inside the final millisecond.
    assert!(host.now_ns() < 4 * NANOS_PER_MILLI);
}

#[test]
fn wait_until_honors_stop_flag() {
    let host = FakeHostClock::new(0);
    let stop = AtomicBool::new(true);

    wait_until(&host, u64::MAX, &stop);
    assert_eq!(host.now_ns(), 0);
}

#[test]
fn full_index_roundtrips_across_threads() {
    let index = Arc::new(AtomicFullIndex::new());
    assert_eq!(index.load(), 0.0);

    let writer = {
        let index = index.clone();
        std::thread::spawn(move || {
            for tick in 0..1_000u32 {
                index.store(f64::from(tick) + 0.5);
            }
        })
    };

    let mut last = 0.0;
    while !writer.is_finished() {
        let seen = index.load();
        assert!(seen >= last, "full index went backwards: {seen} < {last}");
        last = seen;
    }
    writer.join().unwrap();
    assert_eq!(index.load(), 999.5);
}
