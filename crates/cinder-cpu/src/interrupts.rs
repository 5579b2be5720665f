//! Real-mode interrupt entry and return.
//!
//! Vector `n` lives at physical `n*4` as `(ip, cs)` little-endian. Entry
//! pushes FLAGS, CS, IP and clears IF and TF; IRET mirrors it.

use crate::mem::MemoryBus;
use crate::stack;
use crate::state::{seg, CpuState, Flags, SegmentedAddress};

pub fn vector_target(bus: &MemoryBus, vector: u8) -> SegmentedAddress {
    bus.read_segmented(vector as u32 * 4)
}

pub fn install_vector(bus: &mut MemoryBus, vector: u8, entry: SegmentedAddress) {
    bus.write_segmented(vector as u32 * 4, entry);
}

/// Transfer to the handler of `vector`. The caller decides what IP is
/// current: the next instruction for `INT n`, the faulting instruction for
/// CPU exceptions.
pub fn interrupt_entry(state: &mut CpuState, bus: &mut MemoryBus, vector: u8) {
    let flags = state.flags.value16();
    stack::push16(state, bus, flags);
    state.flags.remove(Flags::INTERRUPT | Flags::TRAP);
    stack::push16(state, bus, state.segment(seg::CS));
    stack::push16(state, bus, state.ip);

    let target = vector_target(bus, vector);
    state.set_segment(seg::CS, target.segment);
    state.ip = target.offset;
}

/// Return from an interrupt: pop IP, CS, then the flag image (32-bit when
/// the operand-size prefix was present on the IRET).
pub fn iret(state: &mut CpuState, bus: &mut MemoryBus, wide: bool) {
    state.ip = stack::pop16(state, bus);
    let cs = stack::pop16(state, bus);
    state.set_segment(seg::CS, cs);
    if wide {
        let flags = stack::pop32(state, bus);
        state.flags.set_value32(flags);
    } else {
        let flags = stack::pop16(state, bus);
        state.flags.set_value16(flags);
    }
}
