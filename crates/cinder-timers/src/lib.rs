//! Emulated-time pacing: the budgeted cycle limiter and the deterministic
//! in-emulation event scheduler it drives.

mod limiter;
mod scheduler;

pub use limiter::{
    CycleLimiter, DEFAULT_CYCLES_PER_MS, MAX_CATCH_UP_TICKS, MAX_CYCLES_PER_MS, MIN_CYCLES_PER_MS,
};
pub use scheduler::{EventHandler, EventScheduler, TickHandler, SCHEDULER_CAPACITY};
