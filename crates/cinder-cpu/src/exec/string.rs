//! String operations (MOVS/CMPS/SCAS/LODS/STOS/INS/OUTS) and their
//! REP/REPE/REPNE iteration.
//!
//! The single-step form advances SI and/or DI by the direction-and-width
//! step; the REP wrapper repeats while the count register is non-zero,
//! with the comparing variants additionally gated on ZF.

use super::{finish, reg_read, reg_write, ExecutionHelper, IO_DELAY_CYCLES};
use crate::alu::{Alu, Width};
use crate::error::Exception;
use crate::graph::NodeId;
use crate::inst::{Instruction, StringOp};
use crate::state::{reg, seg, Flags};

fn index_value(helper: &ExecutionHelper, index: u8, addr32: bool) -> Result<u32, Exception> {
    let value = if addr32 {
        helper.state.reg32(index)
    } else {
        helper.state.reg16(index) as u32
    };
    if value > 0xFFFF {
        return Err(Exception::GeneralProtectionFault);
    }
    Ok(value)
}

fn advance_index(helper: &mut ExecutionHelper, index: u8, addr32: bool, delta: i32) {
    if addr32 {
        let value = helper.state.reg32(index).wrapping_add(delta as u32);
        helper.state.set_reg32(index, value);
    } else {
        let value = helper.state.reg16(index).wrapping_add(delta as u16);
        helper.state.set_reg16(index, value);
    }
}

fn count(helper: &ExecutionHelper, addr32: bool) -> u32 {
    if addr32 {
        helper.state.reg32(reg::CX)
    } else {
        helper.state.reg16(reg::CX) as u32
    }
}

fn set_count(helper: &mut ExecutionHelper, addr32: bool, value: u32) {
    if addr32 {
        helper.state.set_reg32(reg::CX, value);
    } else {
        helper.state.set_reg16(reg::CX, value as u16);
    }
}

fn read_mem(helper: &ExecutionHelper, physical: u32, width: Width) -> u32 {
    match width {
        Width::Byte => helper.bus.read_u8(physical) as u32,
        Width::Word => helper.bus.read_u16(physical) as u32,
        Width::Dword => helper.bus.read_u32(physical),
    }
}

fn write_mem(helper: &mut ExecutionHelper, physical: u32, width: Width, value: u32) {
    match width {
        Width::Byte => helper.bus.write_u8(physical, value as u8),
        Width::Word => helper.bus.write_u16(physical, value as u16),
        Width::Dword => helper.bus.write_u32(physical, value),
    }
}

fn source_physical(
    helper: &ExecutionHelper,
    inst: &Instruction,
    addr32: bool,
) -> Result<u32, Exception> {
    let segment = inst.prefixes.segment.unwrap_or(seg::DS);
    let si = index_value(helper, reg::SI, addr32)?;
    Ok(((helper.state.segment(segment) as u32) << 4) + si)
}

fn destination_physical(helper: &ExecutionHelper, addr32: bool) -> Result<u32, Exception> {
    let di = index_value(helper, reg::DI, addr32)?;
    Ok(((helper.state.segment(seg::ES) as u32) << 4) + di)
}

/// One iteration. The source side honors a segment override; the
/// destination is always ES:DI.
fn string_step(
    helper: &mut ExecutionHelper,
    inst: &Instruction,
    op: StringOp,
    width: Width,
) -> Result<(), Exception> {
    let addr32 = inst.prefixes.address_size_override;
    let delta = helper.state.direction(width.bytes());

    match op {
        StringOp::Movs => {
            let src = source_physical(helper, inst, addr32)?;
            let dst = destination_physical(helper, addr32)?;
            let value = read_mem(helper, src, width);
            write_mem(helper, dst, width, value);
            advance_index(helper, reg::SI, addr32, delta);
            advance_index(helper, reg::DI, addr32, delta);
        }
        StringOp::Cmps => {
            let src = source_physical(helper, inst, addr32)?;
            let dst = destination_physical(helper, addr32)?;
            let a = read_mem(helper, src, width);
            let b = read_mem(helper, dst, width);
            Alu::new(&mut helper.state.flags).sub(width, a, b);
            advance_index(helper, reg::SI, addr32, delta);
            advance_index(helper, reg::DI, addr32, delta);
        }
        StringOp::Stos => {
            let dst = destination_physical(helper, addr32)?;
            let value = reg_read(helper, reg::AX, width);
            write_mem(helper, dst, width, value);
            advance_index(helper, reg::DI, addr32, delta);
        }
        StringOp::Lods => {
            let src = source_physical(helper, inst, addr32)?;
            let value = read_mem(helper, src, width);
            reg_write(helper, reg::AX, width, value);
            advance_index(helper, reg::SI, addr32, delta);
        }
        StringOp::Scas => {
            let dst = destination_physical(helper, addr32)?;
            let a = reg_read(helper, reg::AX, width);
            let b = read_mem(helper, dst, width);
            Alu::new(&mut helper.state.flags).sub(width, a, b);
            advance_index(helper, reg::DI, addr32, delta);
        }
        StringOp::Ins => {
            helper.io_delay_cycles += IO_DELAY_CYCLES;
            let port = helper.state.reg16(reg::DX);
            let value = match width {
                Width::Byte => helper.io.read8(port)? as u32,
                Width::Word => helper.io.read16(port)? as u32,
                Width::Dword => helper.io.read32(port)?,
            };
            let dst = destination_physical(helper, addr32)?;
            write_mem(helper, dst, width, value);
            advance_index(helper, reg::DI, addr32, delta);
        }
        StringOp::Outs => {
            helper.io_delay_cycles += IO_DELAY_CYCLES;
            let port = helper.state.reg16(reg::DX);
            let src = source_physical(helper, inst, addr32)?;
            let value = read_mem(helper, src, width);
            match width {
                Width::Byte => helper.io.write8(port, value as u8)?,
                Width::Word => helper.io.write16(port, value as u16)?,
                Width::Dword => helper.io.write32(port, value)?,
            }
            advance_index(helper, reg::SI, addr32, delta);
        }
    }
    Ok(())
}

pub(super) fn execute_string(
    helper: &mut ExecutionHelper,
    inst: &Instruction,
    op: StringOp,
    width: Width,
) -> Result<Option<NodeId>, Exception> {
    let addr32 = inst.prefixes.address_size_override;

    match inst.prefixes.rep {
        None => string_step(helper, inst, op, width)?,
        Some(rep) => {
            while count(helper, addr32) != 0 {
                string_step(helper, inst, op, width)?;
                let remaining = count(helper, addr32).wrapping_sub(1);
                set_count(helper, addr32, remaining);
                if op.compares()
                    && helper.state.flags.contains(Flags::ZERO) != rep.continue_on_zf
                {
                    break;
                }
            }
        }
    }
    Ok(finish(helper, inst))
}
