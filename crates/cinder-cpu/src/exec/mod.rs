//! Instruction execution.
//!
//! The executor is the replacement for a per-variant visitor: one `match`
//! over [`Operation`] driven by an [`ExecutionHelper`] that bundles
//! non-owning references to the CPU state, the memory bus, the port I/O
//! fabric, and the host callback table. `execute` returns the CFG
//! successor for the post-execution `(cs, ip)`, or `None` when the graph
//! does not know it yet.

mod flow;
mod string;

use crate::alu::{Alu, Width};
use crate::error::Exception;
use crate::graph::NodeId;
use crate::inst::{Group3Op, Instruction, Operation};
use crate::interrupts;
use crate::mem::MemoryBus;
use crate::modrm::RmTarget;
use crate::stack;
use crate::state::{reg, seg, CpuState, Flags};

/// Emulated bus cycles billed to the limiter for one port access.
pub const IO_DELAY_CYCLES: u64 = 12;

/// Port I/O as seen from the executor. The machine implements this over
/// its dispatch fabric; tests plug in stubs.
pub trait PortIo {
    fn read8(&mut self, port: u16) -> Result<u8, Exception>;
    fn read16(&mut self, port: u16) -> Result<u16, Exception>;
    fn read32(&mut self, port: u16) -> Result<u32, Exception>;
    fn write8(&mut self, port: u16, value: u8) -> Result<(), Exception>;
    fn write16(&mut self, port: u16, value: u16) -> Result<(), Exception>;
    fn write32(&mut self, port: u16, value: u32) -> Result<(), Exception>;
}

/// Host services reachable through the callback opcode.
pub trait CallbackHandler {
    fn run_callback(
        &mut self,
        number: u8,
        state: &mut CpuState,
        bus: &mut MemoryBus,
    ) -> Result<(), Exception>;
}

/// Port space with nothing attached: open-bus reads, ignored writes.
pub struct NullPortIo;

impl PortIo for NullPortIo {
    fn read8(&mut self, _port: u16) -> Result<u8, Exception> {
        Ok(0xFF)
    }
    fn read16(&mut self, _port: u16) -> Result<u16, Exception> {
        Ok(0xFFFF)
    }
    fn read32(&mut self, _port: u16) -> Result<u32, Exception> {
        Ok(0xFFFF_FFFF)
    }
    fn write8(&mut self, _port: u16, _value: u8) -> Result<(), Exception> {
        Ok(())
    }
    fn write16(&mut self, _port: u16, _value: u16) -> Result<(), Exception> {
        Ok(())
    }
    fn write32(&mut self, _port: u16, _value: u32) -> Result<(), Exception> {
        Ok(())
    }
}

pub struct NullCallbacks;

impl CallbackHandler for NullCallbacks {
    fn run_callback(
        &mut self,
        _number: u8,
        _state: &mut CpuState,
        _bus: &mut MemoryBus,
    ) -> Result<(), Exception> {
        Ok(())
    }
}

/// Non-owning bundle the executor works through; rebuilt cheaply around
/// every step so no component needs a back-reference to another.
pub struct ExecutionHelper<'a> {
    pub state: &'a mut CpuState,
    pub bus: &'a mut MemoryBus,
    pub io: &'a mut dyn PortIo,
    pub callbacks: &'a mut dyn CallbackHandler,
    /// Emulated I/O latency accumulated this step; the run loop charges it
    /// to the cycle limiter.
    pub io_delay_cycles: u64,
}

/// The r/m operand resolved against live state, computed once per
/// execution.
#[derive(Debug, Clone, Copy)]
enum ResolvedRm {
    Register(u8),
    Memory { physical: u32, offset: u32 },
}

fn resolve_rm(helper: &ExecutionHelper, inst: &Instruction) -> Result<ResolvedRm, Exception> {
    let ctx = inst
        .modrm
        .as_ref()
        .expect("operation requires a ModR/M context");
    match &ctx.target {
        RmTarget::Register(index) => Ok(ResolvedRm::Register(*index)),
        RmTarget::Memory(_) => {
            let offset = ctx
                .effective_offset(helper.state, helper.bus)?
                .expect("memory target has an offset");
            let segment = helper.state.segment(ctx.segment());
            Ok(ResolvedRm::Memory {
                physical: ((segment as u32) << 4) + offset,
                offset,
            })
        }
    }
}

fn rm_read(helper: &ExecutionHelper, rm: ResolvedRm, width: Width) -> u32 {
    match rm {
        ResolvedRm::Register(index) => reg_read(helper, index, width),
        ResolvedRm::Memory { physical, .. } => match width {
            Width::Byte => helper.bus.read_u8(physical) as u32,
            Width::Word => helper.bus.read_u16(physical) as u32,
            Width::Dword => helper.bus.read_u32(physical),
        },
    }
}

fn rm_write(helper: &mut ExecutionHelper, rm: ResolvedRm, width: Width, value: u32) {
    match rm {
        ResolvedRm::Register(index) => reg_write(helper, index, width, value),
        ResolvedRm::Memory { physical, .. } => match width {
            Width::Byte => helper.bus.write_u8(physical, value as u8),
            Width::Word => helper.bus.write_u16(physical, value as u16),
            Width::Dword => helper.bus.write_u32(physical, value),
        },
    }
}

fn reg_read(helper: &ExecutionHelper, index: u8, width: Width) -> u32 {
    match width {
        Width::Byte => helper.state.reg8(index) as u32,
        Width::Word => helper.state.reg16(index) as u32,
        Width::Dword => helper.state.reg32(index),
    }
}

fn reg_write(helper: &mut ExecutionHelper, index: u8, width: Width, value: u32) {
    match width {
        Width::Byte => helper.state.set_reg8(index, value as u8),
        Width::Word => helper.state.set_reg16(index, value as u16),
        Width::Dword => helper.state.set_reg32(index, value),
    }
}

fn modrm_reg(inst: &Instruction) -> u8 {
    inst.modrm.as_ref().expect("ModR/M context").reg
}

fn push_value(helper: &mut ExecutionHelper, width: Width, value: u32) {
    match width {
        Width::Dword => stack::push32(helper.state, helper.bus, value),
        _ => stack::push16(helper.state, helper.bus, value as u16),
    }
}

fn pop_value(helper: &mut ExecutionHelper, width: Width) -> u32 {
    match width {
        Width::Dword => stack::pop32(helper.state, helper.bus),
        _ => stack::pop16(helper.state, helper.bus) as u32,
    }
}

/// Stack width of operations whose encoding has no width of its own
/// (PUSH reg, PUSHA, ...): the operand-size prefix selects 32-bit.
fn stack_width(inst: &Instruction) -> Width {
    if inst.prefixes.operand_size_override {
        Width::Dword
    } else {
        Width::Word
    }
}

/// Advance IP past the instruction and look up the CFG successor.
fn finish(helper: &mut ExecutionHelper, inst: &Instruction) -> Option<NodeId> {
    helper.state.ip = inst.next_in_memory_address().offset;
    lookup(helper, inst)
}

/// The single successor-map probe that makes CFG execution cheap.
fn lookup(helper: &ExecutionHelper, inst: &Instruction) -> Option<NodeId> {
    inst.successors_per_address
        .get(&helper.state.cs_ip())
        .copied()
}

/// Execute one instruction. A trap with an interrupt vector is converted
/// into an emulated INT before IP advances; vectorless faults propagate
/// and stop the run loop.
pub fn execute(
    helper: &mut ExecutionHelper,
    inst: &Instruction,
) -> Result<Option<NodeId>, Exception> {
    helper.state.cycles += 1;
    match execute_operation(helper, inst) {
        Ok(next) => Ok(next),
        Err(fault) => match fault.vector() {
            Some(vector) => {
                interrupts::interrupt_entry(helper.state, helper.bus, vector);
                Ok(None)
            }
            None => Err(fault),
        },
    }
}

fn execute_operation(
    helper: &mut ExecutionHelper,
    inst: &Instruction,
) -> Result<Option<NodeId>, Exception> {
    use Operation::*;

    match &inst.operation {
        AluRmReg { op, width } => {
            let rm = resolve_rm(helper, inst)?;
            let a = rm_read(helper, rm, *width);
            let b = reg_read(helper, modrm_reg(inst), *width);
            let result = Alu::new(&mut helper.state.flags).op(*op, *width, a, b);
            if op.stores_result() {
                rm_write(helper, rm, *width, result);
            }
            Ok(finish(helper, inst))
        }
        AluRegRm { op, width } => {
            let rm = resolve_rm(helper, inst)?;
            let a = reg_read(helper, modrm_reg(inst), *width);
            let b = rm_read(helper, rm, *width);
            let result = Alu::new(&mut helper.state.flags).op(*op, *width, a, b);
            if op.stores_result() {
                reg_write(helper, modrm_reg(inst), *width, result);
            }
            Ok(finish(helper, inst))
        }
        AluAccImm { op, width, imm } => {
            let a = reg_read(helper, reg::AX, *width);
            let b = imm.value(helper.bus, *width);
            let result = Alu::new(&mut helper.state.flags).op(*op, *width, a, b);
            if op.stores_result() {
                reg_write(helper, reg::AX, *width, result);
            }
            Ok(finish(helper, inst))
        }
        AluRmImm { op, width, imm } => {
            let rm = resolve_rm(helper, inst)?;
            let a = rm_read(helper, rm, *width);
            let b = imm.value(helper.bus, *width);
            let result = Alu::new(&mut helper.state.flags).op(*op, *width, a, b);
            if op.stores_result() {
                rm_write(helper, rm, *width, result);
            }
            Ok(finish(helper, inst))
        }
        TestRmReg { width } => {
            let rm = resolve_rm(helper, inst)?;
            let a = rm_read(helper, rm, *width);
            let b = reg_read(helper, modrm_reg(inst), *width);
            Alu::new(&mut helper.state.flags).and(*width, a, b);
            Ok(finish(helper, inst))
        }
        TestAccImm { width, imm } => {
            let a = reg_read(helper, reg::AX, *width);
            let b = imm.value(helper.bus, *width);
            Alu::new(&mut helper.state.flags).and(*width, a, b);
            Ok(finish(helper, inst))
        }
        XchgRmReg { width } => {
            let rm = resolve_rm(helper, inst)?;
            let a = rm_read(helper, rm, *width);
            let b = reg_read(helper, modrm_reg(inst), *width);
            rm_write(helper, rm, *width, b);
            reg_write(helper, modrm_reg(inst), *width, a);
            Ok(finish(helper, inst))
        }
        XchgAccReg { reg: other, width } => {
            let a = reg_read(helper, reg::AX, *width);
            let b = reg_read(helper, *other, *width);
            reg_write(helper, reg::AX, *width, b);
            reg_write(helper, *other, *width, a);
            Ok(finish(helper, inst))
        }
        MovRmReg { width } => {
            let rm = resolve_rm(helper, inst)?;
            let value = reg_read(helper, modrm_reg(inst), *width);
            rm_write(helper, rm, *width, value);
            Ok(finish(helper, inst))
        }
        MovRegRm { width } => {
            let rm = resolve_rm(helper, inst)?;
            let value = rm_read(helper, rm, *width);
            reg_write(helper, modrm_reg(inst), *width, value);
            Ok(finish(helper, inst))
        }
        MovRmImm { width, imm } => {
            let rm = resolve_rm(helper, inst)?;
            let value = imm.value(helper.bus, *width);
            rm_write(helper, rm, *width, value);
            Ok(finish(helper, inst))
        }
        MovRegImm { reg, width, imm } => {
            let value = imm.value(helper.bus, *width);
            reg_write(helper, *reg, *width, value);
            Ok(finish(helper, inst))
        }
        MovAccMoffs {
            width,
            offset,
            to_accumulator,
        } => {
            let offset = offset.value(helper.bus, Width::Dword);
            if offset > 0xFFFF {
                return Err(Exception::GeneralProtectionFault);
            }
            let segment = inst.prefixes.segment.unwrap_or(seg::DS);
            let physical = ((helper.state.segment(segment) as u32) << 4) + offset;
            if *to_accumulator {
                let value = match width {
                    Width::Byte => helper.bus.read_u8(physical) as u32,
                    Width::Word => helper.bus.read_u16(physical) as u32,
                    Width::Dword => helper.bus.read_u32(physical),
                };
                reg_write(helper, reg::AX, *width, value);
            } else {
                let value = reg_read(helper, reg::AX, *width);
                match width {
                    Width::Byte => helper.bus.write_u8(physical, value as u8),
                    Width::Word => helper.bus.write_u16(physical, value as u16),
                    Width::Dword => helper.bus.write_u32(physical, value),
                }
            }
            Ok(finish(helper, inst))
        }
        MovRmSeg => {
            let rm = resolve_rm(helper, inst)?;
            let value = helper.state.segment(modrm_reg(inst)) as u32;
            rm_write(helper, rm, Width::Word, value);
            Ok(finish(helper, inst))
        }
        MovSegRm => {
            let rm = resolve_rm(helper, inst)?;
            let value = rm_read(helper, rm, Width::Word) as u16;
            helper.state.set_segment(modrm_reg(inst), value);
            Ok(finish(helper, inst))
        }
        MovzxRegRm { width, src } => {
            let rm = resolve_rm(helper, inst)?;
            let value = rm_read(helper, rm, *src);
            reg_write(helper, modrm_reg(inst), *width, value);
            Ok(finish(helper, inst))
        }
        MovsxRegRm { width, src } => {
            let rm = resolve_rm(helper, inst)?;
            let value = src.sign_extend(rm_read(helper, rm, *src)) & width.mask();
            reg_write(helper, modrm_reg(inst), *width, value);
            Ok(finish(helper, inst))
        }
        Lea { width } => {
            let rm = resolve_rm(helper, inst)?;
            let ResolvedRm::Memory { offset, .. } = rm else {
                unreachable!("decoder rejects register-form LEA");
            };
            reg_write(helper, modrm_reg(inst), *width, offset & width.mask());
            Ok(finish(helper, inst))
        }
        LoadFarPointer { segment } => {
            let rm = resolve_rm(helper, inst)?;
            let ResolvedRm::Memory { physical, .. } = rm else {
                unreachable!("decoder rejects register-form LES/LDS");
            };
            let offset = helper.bus.read_u16(physical);
            let selector = helper.bus.read_u16(physical + 2);
            helper.state.set_reg16(modrm_reg(inst), offset);
            helper.state.set_segment(*segment, selector);
            Ok(finish(helper, inst))
        }
        IncReg { reg, width } => {
            let value = reg_read(helper, *reg, *width);
            let result = Alu::new(&mut helper.state.flags).inc(*width, value);
            reg_write(helper, *reg, *width, result);
            Ok(finish(helper, inst))
        }
        DecReg { reg, width } => {
            let value = reg_read(helper, *reg, *width);
            let result = Alu::new(&mut helper.state.flags).dec(*width, value);
            reg_write(helper, *reg, *width, result);
            Ok(finish(helper, inst))
        }
        IncRm { width } => {
            let rm = resolve_rm(helper, inst)?;
            let value = rm_read(helper, rm, *width);
            let result = Alu::new(&mut helper.state.flags).inc(*width, value);
            rm_write(helper, rm, *width, result);
            Ok(finish(helper, inst))
        }
        DecRm { width } => {
            let rm = resolve_rm(helper, inst)?;
            let value = rm_read(helper, rm, *width);
            let result = Alu::new(&mut helper.state.flags).dec(*width, value);
            rm_write(helper, rm, *width, result);
            Ok(finish(helper, inst))
        }
        PushReg { reg } => {
            let width = stack_width(inst);
            let value = reg_read(helper, *reg, width);
            push_value(helper, width, value);
            Ok(finish(helper, inst))
        }
        PopReg { reg } => {
            let width = stack_width(inst);
            let value = pop_value(helper, width);
            reg_write(helper, *reg, width, value);
            Ok(finish(helper, inst))
        }
        PushSeg { segment } => {
            let value = helper.state.segment(*segment);
            stack::push16(helper.state, helper.bus, value);
            Ok(finish(helper, inst))
        }
        PopSeg { segment } => {
            let value = stack::pop16(helper.state, helper.bus);
            helper.state.set_segment(*segment, value);
            Ok(finish(helper, inst))
        }
        PushImm { width, imm } => {
            let value = imm.value(helper.bus, *width);
            push_value(helper, *width, value);
            Ok(finish(helper, inst))
        }
        PushRm { width } => {
            let rm = resolve_rm(helper, inst)?;
            let value = rm_read(helper, rm, *width);
            push_value(helper, *width, value);
            Ok(finish(helper, inst))
        }
        PopRm { width } => {
            let value = pop_value(helper, *width);
            let rm = resolve_rm(helper, inst)?;
            rm_write(helper, rm, *width, value);
            Ok(finish(helper, inst))
        }
        PushAll => {
            let width = stack_width(inst);
            let original_sp = helper.state.reg16(reg::SP) as u32;
            for index in [reg::AX, reg::CX, reg::DX, reg::BX] {
                let value = reg_read(helper, index, width);
                push_value(helper, width, value);
            }
            push_value(helper, width, original_sp);
            for index in [reg::BP, reg::SI, reg::DI] {
                let value = reg_read(helper, index, width);
                push_value(helper, width, value);
            }
            Ok(finish(helper, inst))
        }
        PopAll => {
            let width = stack_width(inst);
            for index in [reg::DI, reg::SI, reg::BP] {
                let value = pop_value(helper, width);
                reg_write(helper, index, width, value);
            }
            let _discarded_sp = pop_value(helper, width);
            for index in [reg::BX, reg::DX, reg::CX, reg::AX] {
                let value = pop_value(helper, width);
                reg_write(helper, index, width, value);
            }
            Ok(finish(helper, inst))
        }
        PushFlags { width } => {
            match width {
                Width::Dword => {
                    let value = helper.state.flags.value32();
                    stack::push32(helper.state, helper.bus, value);
                }
                _ => {
                    let value = helper.state.flags.value16();
                    stack::push16(helper.state, helper.bus, value);
                }
            }
            Ok(finish(helper, inst))
        }
        PopFlags { width } => {
            match width {
                Width::Dword => {
                    let value = stack::pop32(helper.state, helper.bus);
                    helper.state.flags.set_value32(value);
                }
                _ => {
                    let value = stack::pop16(helper.state, helper.bus);
                    helper.state.flags.set_value16(value);
                }
            }
            Ok(finish(helper, inst))
        }
        Lahf => {
            let image = helper.state.flags.value16() as u8;
            helper.state.set_reg8(reg::AX + 4, image);
            Ok(finish(helper, inst))
        }
        Sahf => {
            let ah = helper.state.reg8(reg::AX + 4) as u16;
            let value = (helper.state.flags.value16() & 0xFF00) | ah;
            helper.state.flags.set_value16(value);
            Ok(finish(helper, inst))
        }
        SignExtendAcc { width } => {
            match width {
                Width::Dword => {
                    let value = Width::Word.sign_extend(helper.state.reg16(reg::AX) as u32);
                    helper.state.set_reg32(reg::AX, value);
                }
                _ => {
                    let value = Width::Byte.sign_extend(helper.state.reg8(reg::AX) as u32);
                    helper.state.set_reg16(reg::AX, value as u16);
                }
            }
            Ok(finish(helper, inst))
        }
        SignExtendDxAx { width } => {
            match width {
                Width::Dword => {
                    let negative = helper.state.reg32(reg::AX) & 0x8000_0000 != 0;
                    helper
                        .state
                        .set_reg32(reg::DX, if negative { 0xFFFF_FFFF } else { 0 });
                }
                _ => {
                    let negative = helper.state.reg16(reg::AX) & 0x8000 != 0;
                    helper
                        .state
                        .set_reg16(reg::DX, if negative { 0xFFFF } else { 0 });
                }
            }
            Ok(finish(helper, inst))
        }
        ShiftRmImm { op, width, count } => {
            let rm = resolve_rm(helper, inst)?;
            let value = rm_read(helper, rm, *width);
            let count = count.current(helper.bus) as u32;
            let result = Alu::new(&mut helper.state.flags).shift(*op, *width, value, count);
            rm_write(helper, rm, *width, result);
            Ok(finish(helper, inst))
        }
        ShiftRmOne { op, width } => {
            let rm = resolve_rm(helper, inst)?;
            let value = rm_read(helper, rm, *width);
            let result = Alu::new(&mut helper.state.flags).shift(*op, *width, value, 1);
            rm_write(helper, rm, *width, result);
            Ok(finish(helper, inst))
        }
        ShiftRmCl { op, width } => {
            let rm = resolve_rm(helper, inst)?;
            let value = rm_read(helper, rm, *width);
            let count = helper.state.reg8(reg::CX) as u32;
            let result = Alu::new(&mut helper.state.flags).shift(*op, *width, value, count);
            rm_write(helper, rm, *width, result);
            Ok(finish(helper, inst))
        }
        ShiftDouble {
            right,
            width,
            count,
        } => {
            let rm = resolve_rm(helper, inst)?;
            let a = rm_read(helper, rm, *width);
            let b = reg_read(helper, modrm_reg(inst), *width);
            let count = match count {
                Some(field) => field.current(helper.bus) as u32,
                None => helper.state.reg8(reg::CX) as u32,
            };
            let mut alu = Alu::new(&mut helper.state.flags);
            let result = if *right {
                alu.shrd(*width, a, b, count)
            } else {
                alu.shld(*width, a, b, count)
            };
            rm_write(helper, rm, *width, result);
            Ok(finish(helper, inst))
        }
        Group3 { op, width } => {
            execute_group3(helper, inst, op, *width)?;
            Ok(finish(helper, inst))
        }
        ImulRegRm { width } => {
            let rm = resolve_rm(helper, inst)?;
            let a = reg_read(helper, modrm_reg(inst), *width);
            let b = rm_read(helper, rm, *width);
            let (low, _) = Alu::new(&mut helper.state.flags).imul(*width, a, b);
            reg_write(helper, modrm_reg(inst), *width, low);
            Ok(finish(helper, inst))
        }
        ImulRegRmImm { width, imm } => {
            let rm = resolve_rm(helper, inst)?;
            let a = rm_read(helper, rm, *width);
            let b = imm.value(helper.bus, *width);
            let (low, _) = Alu::new(&mut helper.state.flags).imul(*width, a, b);
            reg_write(helper, modrm_reg(inst), *width, low);
            Ok(finish(helper, inst))
        }
        Xlat => {
            let segment = inst.prefixes.segment.unwrap_or(seg::DS);
            let offset = helper
                .state
                .reg16(reg::BX)
                .wrapping_add(helper.state.reg8(reg::AX) as u16);
            let physical = ((helper.state.segment(segment) as u32) << 4) + offset as u32;
            let value = helper.bus.read_u8(physical);
            helper.state.set_reg8(reg::AX, value);
            Ok(finish(helper, inst))
        }
        SetFlag { flag, value } => {
            helper.state.flags.set(*flag, *value);
            Ok(finish(helper, inst))
        }
        ComplementCarry => {
            helper.state.flags.toggle(Flags::CARRY);
            Ok(finish(helper, inst))
        }
        Setcc { condition } => {
            let rm = resolve_rm(helper, inst)?;
            let value = condition.eval(helper.state.flags) as u32;
            rm_write(helper, rm, Width::Byte, value);
            Ok(finish(helper, inst))
        }
        Nop => Ok(finish(helper, inst)),
        Leave => {
            let width = stack_width(inst);
            let bp = helper.state.reg16(reg::BP);
            helper.state.set_reg16(reg::SP, bp);
            let value = pop_value(helper, width);
            reg_write(helper, reg::BP, width, value);
            Ok(finish(helper, inst))
        }
        Hlt => {
            helper.state.is_running = false;
            helper.state.ip = inst.next_in_memory_address().offset;
            Ok(None)
        }
        InImm { width, port } => {
            let port = port.current(helper.bus) as u16;
            execute_in(helper, *width, port)?;
            Ok(finish(helper, inst))
        }
        InDx { width } => {
            let port = helper.state.reg16(reg::DX);
            execute_in(helper, *width, port)?;
            Ok(finish(helper, inst))
        }
        OutImm { width, port } => {
            let port = port.current(helper.bus) as u16;
            execute_out(helper, *width, port)?;
            Ok(finish(helper, inst))
        }
        OutDx { width } => {
            let port = helper.state.reg16(reg::DX);
            execute_out(helper, *width, port)?;
            Ok(finish(helper, inst))
        }
        Callback { number } => {
            let number = number.current(helper.bus);
            helper
                .callbacks
                .run_callback(number, helper.state, helper.bus)?;
            Ok(finish(helper, inst))
        }
        StringRun { op, width } => string::execute_string(helper, inst, *op, *width),
        JmpShort { .. } | JmpNear { .. } | JmpFar { .. } | JmpRmNear | JmpRmFar
        | CallNear { .. } | CallFar { .. } | CallRmNear | CallRmFar | RetNear { .. }
        | RetFar { .. } | Iret | Jcc { .. } | JccNear { .. } | Jcxz { .. } | Loop { .. }
        | Int { .. } | Int3 | Into => flow::execute_transfer(helper, inst),
    }
}

fn execute_group3(
    helper: &mut ExecutionHelper,
    inst: &Instruction,
    op: &Group3Op,
    width: Width,
) -> Result<(), Exception> {
    let rm = resolve_rm(helper, inst)?;
    let value = rm_read(helper, rm, width);
    match op {
        Group3Op::Test(imm) => {
            let b = imm.value(helper.bus, width);
            Alu::new(&mut helper.state.flags).and(width, value, b);
        }
        Group3Op::Not => {
            let result = Alu::new(&mut helper.state.flags).not(width, value);
            rm_write(helper, rm, width, result);
        }
        Group3Op::Neg => {
            let result = Alu::new(&mut helper.state.flags).neg(width, value);
            rm_write(helper, rm, width, result);
        }
        Group3Op::Mul | Group3Op::Imul => {
            let a = reg_read(helper, reg::AX, width);
            let mut alu = Alu::new(&mut helper.state.flags);
            let (low, high) = if matches!(op, Group3Op::Mul) {
                alu.mul(width, a, value)
            } else {
                alu.imul(width, a, value)
            };
            store_wide_result(helper, width, low, high);
        }
        Group3Op::Div | Group3Op::Idiv => {
            let (low, high) = load_wide_dividend(helper, width);
            let mut alu = Alu::new(&mut helper.state.flags);
            let (quotient, remainder) = if matches!(op, Group3Op::Div) {
                alu.div(width, low, high, value)?
            } else {
                alu.idiv(width, low, high, value)?
            };
            store_quotient_remainder(helper, width, quotient, remainder);
        }
    }
    Ok(())
}

/// MUL/IMUL destination: AX for byte ops, DX:AX / EDX:EAX otherwise.
fn store_wide_result(helper: &mut ExecutionHelper, width: Width, low: u32, high: u32) {
    match width {
        Width::Byte => {
            let value = (high << 8) | (low & 0xFF);
            helper.state.set_reg16(reg::AX, value as u16);
        }
        Width::Word => {
            helper.state.set_reg16(reg::AX, low as u16);
            helper.state.set_reg16(reg::DX, high as u16);
        }
        Width::Dword => {
            helper.state.set_reg32(reg::AX, low);
            helper.state.set_reg32(reg::DX, high);
        }
    }
}

fn load_wide_dividend(helper: &ExecutionHelper, width: Width) -> (u32, u32) {
    match width {
        Width::Byte => {
            let ax = helper.state.reg16(reg::AX);
            ((ax & 0xFF) as u32, (ax >> 8) as u32)
        }
        Width::Word => (
            helper.state.reg16(reg::AX) as u32,
            helper.state.reg16(reg::DX) as u32,
        ),
        Width::Dword => (
            helper.state.reg32(reg::AX),
            helper.state.reg32(reg::DX),
        ),
    }
}

fn store_quotient_remainder(
    helper: &mut ExecutionHelper,
    width: Width,
    quotient: u32,
    remainder: u32,
) {
    match width {
        Width::Byte => {
            let value = (remainder << 8) | (quotient & 0xFF);
            helper.state.set_reg16(reg::AX, value as u16);
        }
        Width::Word => {
            helper.state.set_reg16(reg::AX, quotient as u16);
            helper.state.set_reg16(reg::DX, remainder as u16);
        }
        Width::Dword => {
            helper.state.set_reg32(reg::AX, quotient);
            helper.state.set_reg32(reg::DX, remainder);
        }
    }
}

fn execute_in(helper: &mut ExecutionHelper, width: Width, port: u16) -> Result<(), Exception> {
    helper.io_delay_cycles += IO_DELAY_CYCLES;
    let value = match width {
        Width::Byte => helper.io.read8(port)? as u32,
        Width::Word => helper.io.read16(port)? as u32,
        Width::Dword => helper.io.read32(port)?,
    };
    reg_write(helper, reg::AX, width, value);
    Ok(())
}

fn execute_out(helper: &mut ExecutionHelper, width: Width, port: u16) -> Result<(), Exception> {
    helper.io_delay_cycles += IO_DELAY_CYCLES;
    let value = reg_read(helper, reg::AX, width);
    match width {
        Width::Byte => helper.io.write8(port, value as u8),
        Width::Word => helper.io.write16(port, value as u16),
        Width::Dword => helper.io.write32(port, value),
    }
}

