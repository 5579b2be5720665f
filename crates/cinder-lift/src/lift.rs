//! Lift a decoded instruction into its IR block.
//!
//! Every instruction becomes `Block { Instruction(mnemonic, operands,
//! rep?), MoveIpNext }`; operand expressions come from the shared builder
//! helpers so register/pointer/constant structure (and degraded-field
//! pointers) is uniform across the tree.

use cinder_cpu::alu::Width;
use cinder_cpu::inst::{Group3Op, Imm, Instruction, LoopKind, Operation, StringOp};
use cinder_cpu::state::Flags;

use crate::build;
use crate::node::{AstNode, DataType};

fn width_type(width: Width) -> DataType {
    match width {
        Width::Byte => DataType::U8,
        Width::Word => DataType::U16,
        Width::Dword => DataType::U32,
    }
}

fn imm_node(imm: &Imm, ty: DataType) -> AstNode {
    let node = match imm {
        Imm::U8(f) => build::field_to_node(f, DataType::U8, false),
        Imm::U16(f) => build::field_to_node(f, DataType::U16, false),
        Imm::U32(f) => build::field_to_node(f, DataType::U32, false),
        Imm::I8(f) => build::field_to_node(f, DataType::I8, false),
    }
    .expect("immediate lifts to a node when null_if_zero is off");
    build::convert(node, ty)
}

fn rm(instruction: &Instruction, ty: DataType) -> AstNode {
    let ctx = instruction
        .modrm
        .as_ref()
        .expect("operation requires a ModR/M context");
    build::rm_to_node(ty, ctx)
}

fn reg_of_modrm(instruction: &Instruction, ty: DataType) -> AstNode {
    let ctx = instruction
        .modrm
        .as_ref()
        .expect("operation requires a ModR/M context");
    build::register(ty, ctx.reg)
}

fn accumulator(ty: DataType) -> AstNode {
    build::register(ty, cinder_cpu::reg::AX)
}

fn width_suffix(width: Width) -> &'static str {
    match width {
        Width::Byte => "b",
        Width::Word => "w",
        Width::Dword => "d",
    }
}

fn string_mnemonic(op: StringOp, width: Width) -> String {
    format!("{}{}", op.mnemonic(), width_suffix(width))
}

/// Build the lifted form of one instruction.
pub fn lift(instruction: &Instruction) -> AstNode {
    let node = lift_operation(instruction);
    build::with_ip_advancement(instruction, vec![node])
}

fn lift_operation(instruction: &Instruction) -> AstNode {
    use Operation::*;

    let ins = |mnemonic: &str, operands: Vec<AstNode>| {
        build::instruction_node(mnemonic, operands, None)
    };

    match &instruction.operation {
        AluRmReg { op, width } => {
            let ty = width_type(*width);
            ins(
                op.mnemonic(),
                vec![rm(instruction, ty), reg_of_modrm(instruction, ty)],
            )
        }
        AluRegRm { op, width } => {
            let ty = width_type(*width);
            ins(
                op.mnemonic(),
                vec![reg_of_modrm(instruction, ty), rm(instruction, ty)],
            )
        }
        AluAccImm { op, width, imm } => {
            let ty = width_type(*width);
            ins(op.mnemonic(), vec![accumulator(ty), imm_node(imm, ty)])
        }
        AluRmImm { op, width, imm } => {
            let ty = width_type(*width);
            ins(op.mnemonic(), vec![rm(instruction, ty), imm_node(imm, ty)])
        }
        TestRmReg { width } => {
            let ty = width_type(*width);
            ins(
                "test",
                vec![rm(instruction, ty), reg_of_modrm(instruction, ty)],
            )
        }
        TestAccImm { width, imm } => {
            let ty = width_type(*width);
            ins("test", vec![accumulator(ty), imm_node(imm, ty)])
        }
        XchgRmReg { width } => {
            let ty = width_type(*width);
            ins(
                "xchg",
                vec![rm(instruction, ty), reg_of_modrm(instruction, ty)],
            )
        }
        XchgAccReg { reg, width } => {
            let ty = width_type(*width);
            ins("xchg", vec![accumulator(ty), build::register(ty, *reg)])
        }
        MovRmReg { width } => {
            let ty = width_type(*width);
            ins(
                "mov",
                vec![rm(instruction, ty), reg_of_modrm(instruction, ty)],
            )
        }
        MovRegRm { width } => {
            let ty = width_type(*width);
            ins(
                "mov",
                vec![reg_of_modrm(instruction, ty), rm(instruction, ty)],
            )
        }
        MovRmImm { width, imm } => {
            let ty = width_type(*width);
            ins("mov", vec![rm(instruction, ty), imm_node(imm, ty)])
        }
        MovRegImm { reg, width, imm } => {
            let ty = width_type(*width);
            ins("mov", vec![build::register(ty, *reg), imm_node(imm, ty)])
        }
        MovAccMoffs {
            width,
            offset,
            to_accumulator,
        } => {
            let ty = width_type(*width);
            let segment = instruction
                .prefixes
                .segment
                .unwrap_or(cinder_cpu::seg::DS);
            let pointer = build::segmented_pointer(
                ty,
                build::segment_register(segment),
                Some(cinder_cpu::seg::DS),
                imm_node(offset, DataType::U16),
            );
            if *to_accumulator {
                ins("mov", vec![accumulator(ty), pointer])
            } else {
                ins("mov", vec![pointer, accumulator(ty)])
            }
        }
        MovRmSeg => {
            let ctx = instruction.modrm.as_ref().expect("ModR/M");
            ins(
                "mov",
                vec![
                    rm(instruction, DataType::U16),
                    build::segment_register(ctx.reg),
                ],
            )
        }
        MovSegRm => {
            let ctx = instruction.modrm.as_ref().expect("ModR/M");
            ins(
                "mov",
                vec![
                    build::segment_register(ctx.reg),
                    rm(instruction, DataType::U16),
                ],
            )
        }
        MovzxRegRm { width, src } => ins(
            "movzx",
            vec![
                reg_of_modrm(instruction, width_type(*width)),
                rm(instruction, width_type(*src)),
            ],
        ),
        MovsxRegRm { width, src } => ins(
            "movsx",
            vec![
                reg_of_modrm(instruction, width_type(*width)),
                rm(instruction, width_type(*src).signed()),
            ],
        ),
        Lea { width } => {
            let ty = width_type(*width);
            ins(
                "lea",
                vec![reg_of_modrm(instruction, ty), rm(instruction, ty)],
            )
        }
        LoadFarPointer { segment } => {
            let mnemonic = if *segment == cinder_cpu::seg::ES {
                "les"
            } else {
                "lds"
            };
            ins(
                mnemonic,
                vec![
                    reg_of_modrm(instruction, DataType::U16),
                    rm(instruction, DataType::U32),
                ],
            )
        }
        IncReg { reg, width } => ins("inc", vec![build::register(width_type(*width), *reg)]),
        DecReg { reg, width } => ins("dec", vec![build::register(width_type(*width), *reg)]),
        IncRm { width } => ins("inc", vec![rm(instruction, width_type(*width))]),
        DecRm { width } => ins("dec", vec![rm(instruction, width_type(*width))]),
        PushReg { reg } => ins("push", vec![build::register(DataType::U16, *reg)]),
        PopReg { reg } => ins("pop", vec![build::register(DataType::U16, *reg)]),
        PushSeg { segment } => ins("push", vec![build::segment_register(*segment)]),
        PopSeg { segment } => ins("pop", vec![build::segment_register(*segment)]),
        PushImm { width, imm } => {
            let ty = width_type(*width);
            ins("push", vec![imm_node(imm, ty)])
        }
        PushRm { width } => ins("push", vec![rm(instruction, width_type(*width))]),
        PopRm { width } => ins("pop", vec![rm(instruction, width_type(*width))]),
        PushAll => ins("pusha", vec![]),
        PopAll => ins("popa", vec![]),
        PushFlags { .. } => ins("pushf", vec![]),
        PopFlags { .. } => ins("popf", vec![]),
        Lahf => ins("lahf", vec![]),
        Sahf => ins("sahf", vec![]),
        SignExtendAcc { width } => ins(
            if *width == Width::Dword { "cwde" } else { "cbw" },
            vec![],
        ),
        SignExtendDxAx { width } => {
            ins(if *width == Width::Dword { "cdq" } else { "cwd" }, vec![])
        }
        JmpShort { offset } => ins(
            "jmp",
            vec![jump_target(instruction, offset.value as i32)],
        ),
        JmpNear { offset } => ins(
            "jmp",
            vec![jump_target(instruction, offset.value as i32)],
        ),
        JmpFar {
            target_offset,
            target_segment,
        } => ins(
            "jmp",
            vec![AstNode::SegmentedAddressConstant {
                segment: target_segment.value,
                offset: target_offset.value,
            }],
        ),
        JmpRmNear => ins("jmp", vec![rm(instruction, DataType::U16)]),
        JmpRmFar => ins("jmp", vec![rm(instruction, DataType::U32)]),
        CallNear { offset } => ins(
            "call",
            vec![jump_target(instruction, offset.value as i32)],
        ),
        CallFar {
            target_offset,
            target_segment,
        } => ins(
            "call",
            vec![AstNode::SegmentedAddressConstant {
                segment: target_segment.value,
                offset: target_offset.value,
            }],
        ),
        CallRmNear => ins("call", vec![rm(instruction, DataType::U16)]),
        CallRmFar => ins("call", vec![rm(instruction, DataType::U32)]),
        RetNear { pop } => match pop {
            Some(pop) => ins(
                "ret",
                vec![build::constant(DataType::U16, pop.value as u64)],
            ),
            None => ins("ret", vec![]),
        },
        RetFar { pop } => match pop {
            Some(pop) => ins(
                "retf",
                vec![build::constant(DataType::U16, pop.value as u64)],
            ),
            None => ins("retf", vec![]),
        },
        Iret => ins("iret", vec![]),
        Jcc { condition, offset } => ins(
            &format!("j{}", condition.suffix()),
            vec![jump_target(instruction, offset.value as i32)],
        ),
        JccNear { condition, offset } => ins(
            &format!("j{}", condition.suffix()),
            vec![jump_target(instruction, offset.value as i32)],
        ),
        Jcxz { offset } => ins(
            "jcxz",
            vec![jump_target(instruction, offset.value as i32)],
        ),
        Loop { kind, offset } => {
            let mnemonic = match kind {
                LoopKind::Plain => "loop",
                LoopKind::WhileZero => "loope",
                LoopKind::WhileNotZero => "loopne",
            };
            ins(mnemonic, vec![jump_target(instruction, offset.value as i32)])
        }
        Setcc { condition } => ins(
            &format!("set{}", condition.suffix()),
            vec![rm(instruction, DataType::U8)],
        ),
        Int { vector } => ins(
            "int",
            vec![build::constant(DataType::U8, vector.value as u64)],
        ),
        Int3 => ins("int3", vec![]),
        Into => ins("into", vec![]),
        StringRun { op, width } => {
            let rep = instruction
                .prefixes
                .rep
                .as_ref()
                .map(|rep| build::rep_kind(*op, rep));
            build::instruction_node(string_mnemonic(*op, *width), vec![], rep)
        }
        Hlt => ins("hlt", vec![]),
        Nop => ins("nop", vec![]),
        Leave => ins("leave", vec![]),
        InImm { width, port } => {
            let ty = width_type(*width);
            ins(
                "in",
                vec![
                    accumulator(ty),
                    build::constant(DataType::U8, port.value as u64),
                ],
            )
        }
        InDx { width } => ins(
            "in",
            vec![
                accumulator(width_type(*width)),
                build::register(DataType::U16, cinder_cpu::reg::DX),
            ],
        ),
        OutImm { width, port } => {
            let ty = width_type(*width);
            ins(
                "out",
                vec![
                    build::constant(DataType::U8, port.value as u64),
                    accumulator(ty),
                ],
            )
        }
        OutDx { width } => ins(
            "out",
            vec![
                build::register(DataType::U16, cinder_cpu::reg::DX),
                accumulator(width_type(*width)),
            ],
        ),
        ShiftRmImm { op, width, count } => {
            let ty = width_type(*width);
            ins(
                op.mnemonic(),
                vec![
                    rm(instruction, ty),
                    build::constant(DataType::U5, count.value as u64),
                ],
            )
        }
        ShiftRmOne { op, width } => ins(
            op.mnemonic(),
            vec![
                rm(instruction, width_type(*width)),
                build::constant(DataType::U5, 1),
            ],
        ),
        ShiftRmCl { op, width } => ins(
            op.mnemonic(),
            vec![
                rm(instruction, width_type(*width)),
                build::register(DataType::U8, cinder_cpu::reg::CX),
            ],
        ),
        ShiftDouble {
            right,
            width,
            count,
        } => {
            let ty = width_type(*width);
            let count_node = match count {
                Some(count) => build::constant(DataType::U5, count.value as u64),
                None => build::register(DataType::U8, cinder_cpu::reg::CX),
            };
            ins(
                if *right { "shrd" } else { "shld" },
                vec![rm(instruction, ty), reg_of_modrm(instruction, ty), count_node],
            )
        }
        Group3 { op, width } => {
            let ty = width_type(*width);
            match op {
                Group3Op::Test(imm) => {
                    ins("test", vec![rm(instruction, ty), imm_node(imm, ty)])
                }
                Group3Op::Not => ins("not", vec![rm(instruction, ty)]),
                Group3Op::Neg => ins("neg", vec![rm(instruction, ty)]),
                Group3Op::Mul => ins("mul", vec![rm(instruction, ty)]),
                Group3Op::Imul => ins("imul", vec![rm(instruction, ty)]),
                Group3Op::Div => ins("div", vec![rm(instruction, ty)]),
                Group3Op::Idiv => ins("idiv", vec![rm(instruction, ty)]),
            }
        }
        ImulRegRm { width } => {
            let ty = width_type(*width);
            ins(
                "imul",
                vec![reg_of_modrm(instruction, ty), rm(instruction, ty)],
            )
        }
        ImulRegRmImm { width, imm } => {
            let ty = width_type(*width);
            ins(
                "imul",
                vec![
                    reg_of_modrm(instruction, ty),
                    rm(instruction, ty),
                    imm_node(imm, ty),
                ],
            )
        }
        Xlat => ins("xlat", vec![]),
        SetFlag { flag, value } => {
            let mnemonic = if *flag == Flags::CARRY {
                if *value {
                    "stc"
                } else {
                    "clc"
                }
            } else if *flag == Flags::INTERRUPT {
                if *value {
                    "sti"
                } else {
                    "cli"
                }
            } else if *value {
                "std"
            } else {
                "cld"
            };
            ins(mnemonic, vec![])
        }
        ComplementCarry => ins("cmc", vec![]),
        Callback { number } => ins(
            "callback",
            vec![build::constant(DataType::U8, number.value as u64)],
        ),
    }
}

/// Near branch targets are shown as the resolved absolute offset.
fn jump_target(instruction: &Instruction, delta: i32) -> AstNode {
    let base = instruction.next_in_memory_address().offset as i32;
    build::constant(DataType::U16, base.wrapping_add(delta) as u16 as u64)
}
