//! Real-mode x86 CPU core: state, memory bus, ALU, typed instruction
//! model with byte provenance, decoder, CFG executor, and interrupt
//! plumbing.
//!
//! The crate is deliberately free of device knowledge: port I/O and host
//! callbacks are traits the machine layer implements.

pub mod alu;
pub mod decode;
pub mod error;
pub mod exec;
pub mod field;
pub mod graph;
pub mod inst;
pub mod interrupts;
pub mod mem;
pub mod modrm;
pub mod stack;
pub mod state;

pub use alu::{Alu, AluOp, ShiftOp, Width};
pub use decode::decode_at;
pub use error::{DecodeError, Exception};
pub use exec::{
    execute, CallbackHandler, ExecutionHelper, NullCallbacks, NullPortIo, PortIo, IO_DELAY_CYCLES,
};
pub use field::{FieldSlot, FieldValue, InstructionField};
pub use graph::{CfgNode, ControlFlowGraph, DiscriminatedNode, NodeId};
pub use inst::{
    Condition, Discriminator, Group3Op, Imm, Instruction, LoopKind, Operation, Prefixes,
    RepPrefix, StringOp,
};
pub use mem::{MemoryBus, MemoryMonitor, MEMORY_SIZE};
pub use modrm::{AddressSize, Displacement, MemoryOperand, ModRmContext, RmTarget};
pub use state::{reg, seg, CpuState, Flags, SegmentedAddress};
