//! Machine wiring for the real-mode emulator core: configuration, the
//! CFG run loop, callback and interrupt installation, and breakpoints.

pub mod asm;
pub mod breakpoints;
pub mod config;
pub mod machine;

pub use asm::{InterruptHandler, MemoryAsmWriter};
pub use breakpoints::MemoryBreakpoints;
pub use config::MachineConfig;
pub use machine::{CallbackFn, Machine, MachineError, StepOutcome};
