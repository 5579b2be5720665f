//! Thin configuration surface for the core. Parsing and persistence live
//! outside; this is the record the embedder fills in and passes down.

use cinder_timers::DEFAULT_CYCLES_PER_MS;

#[derive(Debug, Clone)]
pub struct MachineConfig {
    /// When set, I/O to a port with no registered handler is an error
    /// instead of open-bus behavior.
    pub fail_on_unhandled_port: bool,
    /// Emulated cycles per millisecond; `0` selects the default.
    pub target_cycles_per_ms: i32,
    /// Alternative speed setting; converted to cycles/ms by rounding and
    /// taking precedence over `target_cycles_per_ms` when present.
    pub instructions_per_second: Option<u64>,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            fail_on_unhandled_port: false,
            target_cycles_per_ms: 0,
            instructions_per_second: None,
        }
    }
}

impl MachineConfig {
    pub fn effective_cycles_per_ms(&self) -> u32 {
        if let Some(ips) = self.instructions_per_second {
            return (ips as f64 / 1000.0).round() as u32;
        }
        if self.target_cycles_per_ms <= 0 {
            DEFAULT_CYCLES_PER_MS
        } else {
            self.target_cycles_per_ms as u32
        }
    }
}
