//! Stateless builder helpers that assemble lifted nodes from decoded
//! instruction parts.
//!
//! These replace a web of builder classes with plain functions; they also
//! enforce the structural invariants of the tree (constant conversion
//! computes values, null addition operands are absorbed, degraded operand
//! fields become absolute pointers back into memory).

use cinder_cpu::field::{FieldValue, InstructionField};
use cinder_cpu::inst::{Instruction, RepPrefix, StringOp};
use cinder_cpu::modrm::{AddressSize, Displacement, ModRmContext, RmTarget};

use crate::node::{AstNode, DataType, FlagBit, Operator, RepKind};

pub fn constant(ty: DataType, value: u64) -> AstNode {
    AstNode::Constant {
        ty,
        value: value & ty.mask(),
    }
}

/// Signed values are stored as the two's-complement bit pattern of the
/// constant's own width.
pub fn signed_constant(ty: DataType, value: i64) -> AstNode {
    constant(ty.signed(), value as u64)
}

pub fn register(ty: DataType, index: u8) -> AstNode {
    AstNode::Register { ty, index }
}

pub fn segment_register(index: u8) -> AstNode {
    AstNode::SegmentRegister { index }
}

pub fn flag(flag: FlagBit) -> AstNode {
    AstNode::CpuFlag { flag }
}

pub fn absolute_pointer(ty: DataType, address: u32) -> AstNode {
    AstNode::AbsolutePointer {
        ty,
        address: Box::new(constant(DataType::U32, address as u64)),
    }
}

pub fn segmented_pointer(
    ty: DataType,
    segment: AstNode,
    default_segment: Option<u8>,
    offset: AstNode,
) -> AstNode {
    AstNode::SegmentedPointer {
        ty,
        segment: Box::new(segment),
        default_segment,
        offset: Box::new(offset),
    }
}

pub fn binary(ty: DataType, lhs: AstNode, op: Operator, rhs: AstNode) -> AstNode {
    AstNode::Binary {
        ty,
        lhs: Box::new(lhs),
        op,
        rhs: Box::new(rhs),
    }
}

pub fn unary(ty: DataType, op: Operator, operand: AstNode) -> AstNode {
    AstNode::Unary {
        ty,
        op,
        operand: Box::new(operand),
    }
}

pub fn assign(lhs: AstNode, rhs: AstNode) -> AstNode {
    let ty = lhs.data_type().unwrap_or(DataType::U32);
    binary(ty, lhs, Operator::Assign, rhs)
}

/// Convert a node to another type. Conversions between same-width
/// signed/unsigned are value-preserving retags; constant conversions are
/// computed directly instead of wrapping a conversion node.
pub fn convert(node: AstNode, to: DataType) -> AstNode {
    if let AstNode::Constant { ty, value } = &node {
        let value = if to.bits >= ty.bits && ty.signed {
            // Sign-extend the stored pattern into the wider type.
            let shift = 64 - ty.bits as u32;
            (((*value << shift) as i64 >> shift) as u64) & to.mask()
        } else {
            *value & to.mask()
        };
        return AstNode::Constant { ty: to, value };
    }
    if node.data_type() == Some(to) {
        return node;
    }
    AstNode::TypeConversion {
        ty: to,
        value: Box::new(node),
    }
}

/// Add two optional expressions, absorbing absent sides. Both absent
/// yields `None`; the caller decides what a vanished sum means.
pub fn add_reduce(lhs: Option<AstNode>, rhs: Option<AstNode>) -> Option<AstNode> {
    match (lhs, rhs) {
        (None, None) => None,
        (Some(node), None) | (None, Some(node)) => Some(node),
        (Some(lhs), Some(rhs)) => {
            let ty = lhs.data_type().unwrap_or(DataType::U32);
            Some(binary(ty, lhs, Operator::Plus, rhs))
        }
    }
}

/// Lift an operand field: a constant while the decode-time bytes are
/// authoritative, otherwise an absolute pointer back to the operand's
/// location. The pointer form is how the tree expresses "this operand
/// lives in memory and may be self-modified". With `null_if_zero`, a zero
/// constant collapses to `None` so surrounding additions absorb it.
pub fn field_to_node<T: FieldValue>(
    field: &InstructionField<T>,
    ty: DataType,
    null_if_zero: bool,
) -> Option<AstNode> {
    if field.use_value {
        let pattern = field.value.bit_pattern();
        if null_if_zero && pattern & ty.mask() == 0 {
            return None;
        }
        Some(constant(ty, pattern))
    } else {
        Some(absolute_pointer(ty, field.physical_address))
    }
}

fn displacement_to_node(displacement: &Displacement) -> Option<AstNode> {
    match displacement {
        Displacement::None => None,
        Displacement::Byte(f) => field_to_node(f, DataType::I8, true),
        Displacement::Word(f) => field_to_node(f, DataType::I16, true),
        Displacement::Dword(f) => field_to_node(f, DataType::I32, true),
        Displacement::Off16(f) => field_to_node(f, DataType::U16, true),
        Displacement::Off32(f) => field_to_node(f, DataType::U32, true),
    }
}

/// Lift an r/m operand: a register node for register forms, otherwise a
/// segmented pointer whose offset is the reduced addition tree over
/// base, scaled index, and displacement.
pub fn rm_to_node(ty: DataType, ctx: &ModRmContext) -> AstNode {
    match &ctx.target {
        RmTarget::Register(index) => register(ty, *index),
        RmTarget::Memory(mem) => {
            let addr_ty = match ctx.address_size {
                AddressSize::Bits16 => DataType::U16,
                AddressSize::Bits32 => DataType::U32,
            };
            let base = mem.base.map(|index| register(addr_ty, index));
            let index = mem.index.map(|index| {
                let node = register(addr_ty, index);
                if mem.scale > 1 {
                    binary(
                        addr_ty,
                        node,
                        Operator::Multiply,
                        constant(addr_ty, mem.scale as u64),
                    )
                } else {
                    node
                }
            });
            let displacement = displacement_to_node(&mem.displacement);

            let offset = add_reduce(add_reduce(base, index), displacement)
                .unwrap_or_else(|| constant(addr_ty, 0));
            segmented_pointer(
                ty,
                segment_register(ctx.segment()),
                Some(mem.default_segment),
                offset,
            )
        }
    }
}

pub fn rep_kind(op: StringOp, rep: &RepPrefix) -> RepKind {
    if !op.compares() {
        RepKind::Always
    } else if rep.continue_on_zf {
        RepKind::WhileZero
    } else {
        RepKind::WhileNotZero
    }
}

pub fn instruction_node(
    mnemonic: impl Into<String>,
    operands: Vec<AstNode>,
    rep: Option<RepKind>,
) -> AstNode {
    AstNode::Instruction {
        mnemonic: mnemonic.into(),
        operands,
        rep,
    }
}

/// Wrap an instruction's statements with the IP move to its fall-through
/// address, the uniform tail every lifted instruction ends on.
pub fn with_ip_advancement(instruction: &Instruction, statements: Vec<AstNode>) -> AstNode {
    let next = instruction.next_in_memory_address();
    let mut all = statements;
    all.push(AstNode::MoveIpNext {
        offset: Box::new(constant(DataType::U16, next.offset as u64)),
    });
    AstNode::Block { statements: all }
}
