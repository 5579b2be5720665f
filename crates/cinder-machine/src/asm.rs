//! Writing small machine-code stubs into emulated memory.
//!
//! The core reserves callback trampolines and interrupt-handler entry
//! stubs at startup; everything after that is ordinary emulated
//! execution.

use cinder_cpu::mem::MemoryBus;
use cinder_cpu::state::SegmentedAddress;

/// ModR/M byte selecting the reserved `/7` encoding the callback opcode
/// uses (`FE /7 ib`).
pub const CALLBACK_MODRM: u8 = 0x38;

/// Sequential writer of instruction bytes at a segmented cursor.
pub struct MemoryAsmWriter<'a> {
    bus: &'a mut MemoryBus,
    current: SegmentedAddress,
}

impl<'a> MemoryAsmWriter<'a> {
    pub fn new(bus: &'a mut MemoryBus, start: SegmentedAddress) -> Self {
        Self {
            bus,
            current: start,
        }
    }

    pub fn get_current_address_copy(&self) -> SegmentedAddress {
        self.current
    }

    fn emit(&mut self, byte: u8) {
        self.bus.write_u8(self.current.physical(), byte);
        self.current.offset = self.current.offset.wrapping_add(1);
    }

    fn emit_u16(&mut self, value: u16) {
        let [lo, hi] = value.to_le_bytes();
        self.emit(lo);
        self.emit(hi);
    }

    pub fn write_far_ret(&mut self) {
        self.emit(0xCB);
    }

    pub fn write_iret(&mut self) {
        self.emit(0xCF);
    }

    pub fn write_far_jump(&mut self, target: SegmentedAddress) {
        self.emit(0xEA);
        self.emit_u16(target.offset);
        self.emit_u16(target.segment);
    }

    pub fn write_far_call(&mut self, target: SegmentedAddress) {
        self.emit(0x9A);
        self.emit_u16(target.offset);
        self.emit_u16(target.segment);
    }

    /// The 3-byte callback trampoline: `FE /7 ib`.
    pub fn write_callback(&mut self, number: u8) {
        self.emit(0xFE);
        self.emit(CALLBACK_MODRM);
        self.emit(number);
    }
}

/// An interrupt service the host installs into the vector table. The
/// handler writes its entry stub into emulated RAM and the machine wires
/// the vector to it.
pub trait InterruptHandler {
    fn vector_number(&self) -> u8;
    fn write_assembly_in_ram(&mut self, writer: &mut MemoryAsmWriter) -> SegmentedAddress;
}
