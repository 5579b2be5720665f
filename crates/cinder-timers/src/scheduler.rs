//! Deterministic in-emulation event scheduler.
//!
//! A min-priority queue of `(due_time, handler, value)` entries in full-index
//! units (milliseconds of emulated time), plus a list of handlers fired once
//! per integer-millisecond boundary. Single-threaded cooperative: handlers
//! run on the emulation thread and may re-arm or cancel through a shared
//! `Rc` handle, so every public method takes `&self`.

use std::cell::{Cell, RefCell};
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::rc::Rc;
use std::sync::Arc;

use cinder_time::AtomicFullIndex;

/// Timed-event callback; receives the value it was scheduled with.
pub type EventHandler = Rc<dyn Fn(u32)>;
/// Per-millisecond callback.
pub type TickHandler = Rc<dyn Fn()>;

pub const SCHEDULER_CAPACITY: usize = 8192;

struct EventEntry {
    due: f64,
    seq: u64,
    handler: EventHandler,
    value: u32,
}

impl PartialEq for EventEntry {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for EventEntry {}

impl PartialOrd for EventEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for EventEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Reversed: BinaryHeap is a max-heap and we want the earliest entry
        // on top. The sequence number keeps equal due times FIFO.
        other
            .due
            .total_cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

fn handler_key(handler: &EventHandler) -> *const () {
    Rc::as_ptr(handler) as *const ()
}

pub struct EventScheduler {
    time: Arc<AtomicFullIndex>,
    queue: RefCell<BinaryHeap<EventEntry>>,
    /// Sequence numbers cancelled via `remove_events`; popped entries that
    /// appear here are discarded instead of fired.
    cancelled: RefCell<HashSet<u64>>,
    by_handler: RefCell<HashMap<*const (), Vec<u64>>>,
    tick_handlers: RefCell<Vec<TickHandler>>,
    last_tick_time_ms: Cell<f64>,
    /// Due time of the handler currently being invoked; re-arming from
    /// inside a handler bases the new delay here so jitter never
    /// accumulates.
    active_event_scheduled_time: Cell<Option<f64>>,
    next_seq: Cell<u64>,
    overflow_logged: Cell<bool>,
}

impl EventScheduler {
    pub fn new(time: Arc<AtomicFullIndex>) -> Self {
        Self {
            time,
            queue: RefCell::new(BinaryHeap::new()),
            cancelled: RefCell::new(HashSet::new()),
            by_handler: RefCell::new(HashMap::new()),
            tick_handlers: RefCell::new(Vec::new()),
            last_tick_time_ms: Cell::new(0.0),
            active_event_scheduled_time: Cell::new(None),
            next_seq: Cell::new(0),
            overflow_logged: Cell::new(false),
        }
    }

    fn live_len(&self) -> usize {
        self.queue.borrow().len() - self.cancelled.borrow().len()
    }

    /// Schedule `handler(value)` to fire `delay_ms` from now. When called
    /// from inside a firing handler the base is that handler's own due
    /// time, which makes self-re-arming handlers drift-free.
    pub fn add_event(&self, handler: EventHandler, delay_ms: f64, value: u32) {
        if self.live_len() >= SCHEDULER_CAPACITY {
            if !self.overflow_logged.replace(true) {
                tracing::error!(
                    "event scheduler is full ({SCHEDULER_CAPACITY} entries), dropping event"
                );
            }
            return;
        }
        let base = self
            .active_event_scheduled_time
            .get()
            .unwrap_or_else(|| self.time.load());
        let seq = self.next_seq.get();
        self.next_seq.set(seq + 1);

        self.by_handler
            .borrow_mut()
            .entry(handler_key(&handler))
            .or_default()
            .push(seq);
        self.queue.borrow_mut().push(EventEntry {
            due: base + delay_ms,
            seq,
            handler,
            value,
        });
    }

    /// Cancel every pending event scheduled with `handler` (identity of the
    /// `Rc`, not closure equality).
    pub fn remove_events(&self, handler: &EventHandler) {
        if let Some(seqs) = self.by_handler.borrow_mut().remove(&handler_key(handler)) {
            let mut cancelled = self.cancelled.borrow_mut();
            cancelled.extend(seqs);
        }
    }

    /// Register a handler fired once per integer-millisecond boundary.
    /// Handlers fire most-recently-registered first.
    pub fn register_tick_handler(&self, handler: TickHandler) {
        self.tick_handlers.borrow_mut().push(handler);
    }

    pub fn pending_events(&self) -> usize {
        self.live_len()
    }

    /// Drain everything due at the current emulated time.
    pub fn process_events(&self) {
        let elapsed_ms = self.time.load();
        while self.last_tick_time_ms.get() + 1.0 <= elapsed_ms {
            self.last_tick_time_ms
                .set(self.last_tick_time_ms.get() + 1.0);
            let handlers: Vec<TickHandler> = self.tick_handlers.borrow().clone();
            for handler in handlers.iter().rev() {
                handler();
            }
        }

        if self.queue.borrow().is_empty() {
            return;
        }

        let now = self.time.load();
        loop {
            let head_due = self.queue.borrow().peek().map(|head| head.due);
            if !head_due.is_some_and(|due| due <= now) {
                break;
            }
            let Some(entry) = self.queue.borrow_mut().pop() else {
                break;
            };

            if self.cancelled.borrow_mut().remove(&entry.seq) {
                continue;
            }
            if let Some(seqs) = self.by_handler.borrow_mut().get_mut(&handler_key(&entry.handler)) {
                seqs.retain(|&seq| seq != entry.seq);
            }

            self.active_event_scheduled_time.set(Some(entry.due));
            (entry.handler)(entry.value);
            self.active_event_scheduled_time.set(None);
        }
    }
}
