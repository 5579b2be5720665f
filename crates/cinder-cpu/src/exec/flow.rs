//! Control-flow transfer semantics: jumps, calls, returns, software
//! interrupts, and the loop family.

use super::{lookup, resolve_rm, rm_read, ExecutionHelper, ResolvedRm};
use crate::alu::Width;
use crate::error::Exception;
use crate::graph::NodeId;
use crate::inst::{Instruction, LoopKind, Operation};
use crate::interrupts;
use crate::stack;
use crate::state::{reg, seg, Flags};

/// Near jump by a signed offset relative to the end of the instruction.
fn jump_relative(
    helper: &mut ExecutionHelper,
    inst: &Instruction,
    delta: i32,
) -> Option<NodeId> {
    let base = inst.next_in_memory_address().offset;
    helper.state.ip = (base as i32).wrapping_add(delta) as u16;
    lookup(helper, inst)
}

fn jump_far(
    helper: &mut ExecutionHelper,
    inst: &Instruction,
    segment: u16,
    offset: u16,
) -> Option<NodeId> {
    helper.state.set_segment(seg::CS, segment);
    helper.state.ip = offset;
    lookup(helper, inst)
}

fn call_near(helper: &mut ExecutionHelper, inst: &Instruction, target: u16) -> Option<NodeId> {
    let return_ip = inst.next_in_memory_address().offset;
    stack::push16(helper.state, helper.bus, return_ip);
    helper.state.ip = target;
    lookup(helper, inst)
}

fn call_far(
    helper: &mut ExecutionHelper,
    inst: &Instruction,
    segment: u16,
    offset: u16,
) -> Option<NodeId> {
    let return_ip = inst.next_in_memory_address().offset;
    let return_cs = helper.state.segment(seg::CS);
    stack::push16(helper.state, helper.bus, return_cs);
    stack::push16(helper.state, helper.bus, return_ip);
    jump_far(helper, inst, segment, offset)
}

/// LOOP-family counter: CX, or ECX under the address-size prefix.
fn loop_counter(helper: &ExecutionHelper, inst: &Instruction) -> u32 {
    if inst.prefixes.address_size_override {
        helper.state.reg32(reg::CX)
    } else {
        helper.state.reg16(reg::CX) as u32
    }
}

fn set_loop_counter(helper: &mut ExecutionHelper, inst: &Instruction, value: u32) {
    if inst.prefixes.address_size_override {
        helper.state.set_reg32(reg::CX, value);
    } else {
        helper.state.set_reg16(reg::CX, value as u16);
    }
}

pub(super) fn execute_transfer(
    helper: &mut ExecutionHelper,
    inst: &Instruction,
) -> Result<Option<NodeId>, Exception> {
    use Operation::*;

    match &inst.operation {
        JmpShort { offset } => {
            let delta = offset.current(helper.bus) as i32;
            Ok(jump_relative(helper, inst, delta))
        }
        JmpNear { offset } => {
            let delta = offset.current(helper.bus) as i32;
            Ok(jump_relative(helper, inst, delta))
        }
        JmpFar {
            target_offset,
            target_segment,
        } => {
            let offset = target_offset.current(helper.bus);
            let segment = target_segment.current(helper.bus);
            Ok(jump_far(helper, inst, segment, offset))
        }
        JmpRmNear => {
            let rm = resolve_rm(helper, inst)?;
            let target = rm_read(helper, rm, Width::Word) as u16;
            helper.state.ip = target;
            Ok(lookup(helper, inst))
        }
        JmpRmFar => {
            let rm = resolve_rm(helper, inst)?;
            let ResolvedRm::Memory { physical, .. } = rm else {
                unreachable!("decoder rejects register-form far jumps");
            };
            let offset = helper.bus.read_u16(physical);
            let segment = helper.bus.read_u16(physical + 2);
            Ok(jump_far(helper, inst, segment, offset))
        }
        CallNear { offset } => {
            let delta = offset.current(helper.bus) as i32;
            let base = inst.next_in_memory_address().offset;
            let target = (base as i32).wrapping_add(delta) as u16;
            Ok(call_near(helper, inst, target))
        }
        CallFar {
            target_offset,
            target_segment,
        } => {
            let offset = target_offset.current(helper.bus);
            let segment = target_segment.current(helper.bus);
            Ok(call_far(helper, inst, segment, offset))
        }
        CallRmNear => {
            let rm = resolve_rm(helper, inst)?;
            let target = rm_read(helper, rm, Width::Word) as u16;
            Ok(call_near(helper, inst, target))
        }
        CallRmFar => {
            let rm = resolve_rm(helper, inst)?;
            let ResolvedRm::Memory { physical, .. } = rm else {
                unreachable!("decoder rejects register-form far calls");
            };
            let offset = helper.bus.read_u16(physical);
            let segment = helper.bus.read_u16(physical + 2);
            Ok(call_far(helper, inst, segment, offset))
        }
        RetNear { pop } => {
            helper.state.ip = stack::pop16(helper.state, helper.bus);
            if let Some(pop) = pop {
                let bytes = pop.current(helper.bus);
                let sp = helper.state.reg16(reg::SP).wrapping_add(bytes);
                helper.state.set_reg16(reg::SP, sp);
            }
            Ok(lookup(helper, inst))
        }
        RetFar { pop } => {
            helper.state.ip = stack::pop16(helper.state, helper.bus);
            let cs = stack::pop16(helper.state, helper.bus);
            helper.state.set_segment(seg::CS, cs);
            if let Some(pop) = pop {
                let bytes = pop.current(helper.bus);
                let sp = helper.state.reg16(reg::SP).wrapping_add(bytes);
                helper.state.set_reg16(reg::SP, sp);
            }
            Ok(lookup(helper, inst))
        }
        Iret => {
            interrupts::iret(
                helper.state,
                helper.bus,
                inst.prefixes.operand_size_override,
            );
            Ok(lookup(helper, inst))
        }
        Jcc { condition, offset } => {
            if condition.eval(helper.state.flags) {
                let delta = offset.current(helper.bus) as i32;
                Ok(jump_relative(helper, inst, delta))
            } else {
                Ok(super::finish(helper, inst))
            }
        }
        JccNear { condition, offset } => {
            if condition.eval(helper.state.flags) {
                let delta = offset.current(helper.bus) as i32;
                Ok(jump_relative(helper, inst, delta))
            } else {
                Ok(super::finish(helper, inst))
            }
        }
        Jcxz { offset } => {
            if loop_counter(helper, inst) == 0 {
                let delta = offset.current(helper.bus) as i32;
                Ok(jump_relative(helper, inst, delta))
            } else {
                Ok(super::finish(helper, inst))
            }
        }
        Loop { kind, offset } => {
            let count = loop_counter(helper, inst).wrapping_sub(1);
            set_loop_counter(helper, inst, count);
            let zf = helper.state.flags.contains(Flags::ZERO);
            let proceed = count != 0
                && match kind {
                    LoopKind::Plain => true,
                    LoopKind::WhileZero => zf,
                    LoopKind::WhileNotZero => !zf,
                };
            if proceed {
                let delta = offset.current(helper.bus) as i32;
                Ok(jump_relative(helper, inst, delta))
            } else {
                Ok(super::finish(helper, inst))
            }
        }
        Int { vector } => {
            let vector = vector.current(helper.bus);
            helper.state.ip = inst.next_in_memory_address().offset;
            interrupts::interrupt_entry(helper.state, helper.bus, vector);
            Ok(lookup(helper, inst))
        }
        Int3 => {
            helper.state.ip = inst.next_in_memory_address().offset;
            interrupts::interrupt_entry(helper.state, helper.bus, 3);
            Ok(lookup(helper, inst))
        }
        Into => {
            if helper.state.flags.contains(Flags::OVERFLOW) {
                helper.state.ip = inst.next_in_memory_address().offset;
                interrupts::interrupt_entry(helper.state, helper.bus, 4);
                Ok(lookup(helper, inst))
            } else {
                Ok(super::finish(helper, inst))
            }
        }
        other => unreachable!("not a control-flow operation: {other:?}"),
    }
}
