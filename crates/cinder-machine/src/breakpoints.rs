//! Memory watchpoints, wired into the memory bus through the
//! [`MemoryMonitor`] contract.
//!
//! A hit invokes its callback and, when the breakpoint was armed with
//! `pause`, requests an emulation stop by flipping the shared stop flag.
//! That is the same flag the limiter's waiter polls, so the pause takes
//! effect without the UI thread touching CPU state.

use std::collections::HashMap;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use cinder_cpu::mem::MemoryMonitor;

pub type WatchCallback = Rc<dyn Fn(u32)>;

struct Watchpoint {
    callback: WatchCallback,
    pause: bool,
}

#[derive(Default)]
pub struct MemoryBreakpoints {
    read: HashMap<u32, Vec<Watchpoint>>,
    write: HashMap<u32, Vec<Watchpoint>>,
    enabled: Arc<AtomicBool>,
    stop: Option<Arc<AtomicBool>>,
}

impl MemoryBreakpoints {
    pub fn new(stop: Arc<AtomicBool>) -> Self {
        Self {
            read: HashMap::new(),
            write: HashMap::new(),
            enabled: Arc::new(AtomicBool::new(true)),
            stop: Some(stop),
        }
    }

    /// Shared toggle for UI threads; observed on the next access.
    pub fn enabled_flag(&self) -> Arc<AtomicBool> {
        self.enabled.clone()
    }

    pub fn watch_read(&mut self, address: u32, callback: WatchCallback, pause: bool) {
        self.read
            .entry(address)
            .or_default()
            .push(Watchpoint { callback, pause });
    }

    pub fn watch_write(&mut self, address: u32, callback: WatchCallback, pause: bool) {
        self.write
            .entry(address)
            .or_default()
            .push(Watchpoint { callback, pause });
    }

    pub fn clear(&mut self, address: u32) {
        self.read.remove(&address);
        self.write.remove(&address);
    }

    fn fire(&self, map: &HashMap<u32, Vec<Watchpoint>>, address: u32) {
        if !self.enabled.load(Ordering::Relaxed) {
            return;
        }
        if let Some(watchpoints) = map.get(&address) {
            for watchpoint in watchpoints {
                (watchpoint.callback)(address);
                if watchpoint.pause {
                    if let Some(stop) = &self.stop {
                        stop.store(true, Ordering::Relaxed);
                    }
                }
            }
        }
    }
}

impl MemoryMonitor for MemoryBreakpoints {
    fn monitor_read_access(&mut self, address: u32) {
        self.fire(&self.read, address);
    }

    fn monitor_write_access(&mut self, address: u32) {
        self.fire(&self.write, address);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn write_watch_fires_and_can_pause() {
        let stop = Arc::new(AtomicBool::new(false));
        let mut breakpoints = MemoryBreakpoints::new(stop.clone());
        let hits = Rc::new(Cell::new(0u32));
        {
            let hits = hits.clone();
            breakpoints.watch_write(0x1234, Rc::new(move |_| hits.set(hits.get() + 1)), true);
        }

        breakpoints.monitor_write_access(0x1233);
        assert_eq!(hits.get(), 0);

        breakpoints.monitor_write_access(0x1234);
        assert_eq!(hits.get(), 1);
        assert!(stop.load(Ordering::Relaxed));
    }

    #[test]
    fn disabled_set_is_silent() {
        let stop = Arc::new(AtomicBool::new(false));
        let mut breakpoints = MemoryBreakpoints::new(stop);
        let hits = Rc::new(Cell::new(0u32));
        {
            let hits = hits.clone();
            breakpoints.watch_read(0x10, Rc::new(move |_| hits.set(hits.get() + 1)), false);
        }

        breakpoints.enabled_flag().store(false, Ordering::Relaxed);
        breakpoints.monitor_read_access(0x10);
        assert_eq!(hits.get(), 0);
    }
}
