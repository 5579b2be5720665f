//! Table-style decoder: bytes at `cs:ip` → [`Instruction`].
//!
//! Decoding walks the prefix stack, the opcode (one byte or the `0F`
//! escape), ModR/M + SIB with either address size, then immediates, in
//! that byte order, so every operand field records the exact location it
//! came from.

use std::collections::HashMap;

use crate::alu::{AluOp, ShiftOp, Width};
use crate::error::DecodeError;
use crate::field::{FieldValue, InstructionField};
use crate::inst::{
    Condition, Group3Op, Imm, Instruction, LoopKind, Operation, Prefixes, RepPrefix, StringOp,
};
use crate::mem::MemoryBus;
use crate::modrm::{
    table16, AddressSize, Displacement, MemoryOperand, ModRmContext, RmTarget,
};
use crate::state::{seg, Flags, SegmentedAddress};

/// Decode the instruction at `address` against the current memory image.
pub fn decode_at(bus: &MemoryBus, address: SegmentedAddress) -> Result<Instruction, DecodeError> {
    Decoder {
        bus,
        start: address,
        offset: address.offset,
        image: Vec::new(),
    }
    .decode()
}

struct Decoder<'a> {
    bus: &'a MemoryBus,
    start: SegmentedAddress,
    offset: u16,
    image: Vec<u8>,
}

impl<'a> Decoder<'a> {
    fn physical(&self) -> u32 {
        SegmentedAddress::new(self.start.segment, self.offset).physical()
    }

    fn peek_u8(&self) -> u8 {
        self.bus.read_u8(self.physical())
    }

    fn next_u8(&mut self) -> u8 {
        let byte = self.bus.read_u8(self.physical());
        self.image.push(byte);
        self.offset = self.offset.wrapping_add(1);
        byte
    }

    fn field<T: FieldValue>(&mut self) -> InstructionField<T> {
        let address = self.physical();
        let mut bytes = Vec::with_capacity(T::SIZE);
        for _ in 0..T::SIZE {
            bytes.push(self.next_u8());
        }
        InstructionField::new(T::from_le(&bytes), address, bytes)
    }

    fn imm_for(&mut self, width: Width) -> Imm {
        match width {
            Width::Byte => Imm::U8(self.field()),
            Width::Word => Imm::U16(self.field()),
            Width::Dword => Imm::U32(self.field()),
        }
    }

    fn unsupported(&self, opcode: u16) -> DecodeError {
        DecodeError::UnsupportedOpcode {
            opcode,
            address: self.start,
        }
    }

    fn invalid_group(&self, opcode: u16, reg: u8) -> DecodeError {
        DecodeError::InvalidGroupEncoding {
            opcode,
            reg,
            address: self.start,
        }
    }

    fn parse_modrm(&mut self, prefixes: &Prefixes) -> ModRmContext {
        let byte = self.next_u8();
        self.modrm_body(byte, prefixes)
    }

    fn modrm_body(&mut self, byte: u8, prefixes: &Prefixes) -> ModRmContext {
        let mode = byte >> 6;
        let reg = (byte >> 3) & 7;
        let rm = byte & 7;
        let address_size = if prefixes.address_size_override {
            AddressSize::Bits32
        } else {
            AddressSize::Bits16
        };

        let target = if mode == 3 {
            RmTarget::Register(rm)
        } else {
            RmTarget::Memory(match address_size {
                AddressSize::Bits16 => self.memory_operand_16(mode, rm),
                AddressSize::Bits32 => self.memory_operand_32(mode, rm),
            })
        };

        ModRmContext {
            mode,
            reg,
            rm,
            address_size,
            segment_override: prefixes.segment,
            target,
        }
    }

    fn memory_operand_16(&mut self, mode: u8, rm: u8) -> MemoryOperand {
        if mode == 0 && rm == 6 {
            return MemoryOperand {
                base: None,
                index: None,
                scale: 1,
                displacement: Displacement::Off16(self.field()),
                default_segment: seg::DS,
            };
        }
        let (base, index, default_segment) = table16(rm);
        let displacement = match mode {
            0 => Displacement::None,
            1 => Displacement::Byte(self.field()),
            _ => Displacement::Word(self.field()),
        };
        MemoryOperand {
            base,
            index,
            scale: 1,
            displacement,
            default_segment,
        }
    }

    fn memory_operand_32(&mut self, mode: u8, rm: u8) -> MemoryOperand {
        let mut base = None;
        let mut index = None;
        let mut scale = 1u8;
        let mut displacement = Displacement::None;

        if rm == 4 {
            let sib = self.next_u8();
            scale = 1 << (sib >> 6);
            let sib_index = (sib >> 3) & 7;
            let sib_base = sib & 7;
            if sib_index != 4 {
                index = Some(sib_index);
            }
            if sib_base == 5 && mode == 0 {
                displacement = Displacement::Off32(self.field());
            } else {
                base = Some(sib_base);
            }
        } else if rm == 5 && mode == 0 {
            displacement = Displacement::Off32(self.field());
        } else {
            base = Some(rm);
        }

        if displacement.is_none() {
            displacement = match mode {
                0 => Displacement::None,
                1 => Displacement::Byte(self.field()),
                2 => Displacement::Dword(self.field()),
                _ => Displacement::None,
            };
        }

        // ESP- and EBP-based forms address the stack segment by default.
        let default_segment = match base {
            Some(4) | Some(5) => seg::SS,
            _ => seg::DS,
        };
        MemoryOperand {
            base,
            index,
            scale,
            displacement,
            default_segment,
        }
    }

    fn decode(mut self) -> Result<Instruction, DecodeError> {
        let mut prefixes = Prefixes::default();
        loop {
            match self.peek_u8() {
                0x26 => prefixes.segment = Some(seg::ES),
                0x2E => prefixes.segment = Some(seg::CS),
                0x36 => prefixes.segment = Some(seg::SS),
                0x3E => prefixes.segment = Some(seg::DS),
                0x64 => prefixes.segment = Some(seg::FS),
                0x65 => prefixes.segment = Some(seg::GS),
                0x66 => prefixes.operand_size_override = true,
                0x67 => prefixes.address_size_override = true,
                0xF0 => prefixes.lock = true,
                0xF2 => {
                    prefixes.rep = Some(RepPrefix {
                        continue_on_zf: false,
                    })
                }
                0xF3 => {
                    prefixes.rep = Some(RepPrefix {
                        continue_on_zf: true,
                    })
                }
                _ => break,
            }
            self.next_u8();
        }

        let first = self.next_u8();
        let opcode: u16 = if first == 0x0F {
            0x0F00 | self.next_u8() as u16
        } else {
            first as u16
        };

        // Operand-size-sensitive width ("v" in the opcode maps).
        let vw = if prefixes.operand_size_override {
            Width::Dword
        } else {
            Width::Word
        };

        let mut modrm: Option<ModRmContext> = None;

        let operation = match opcode {
            // The 00..=3D ALU block: eight operations × six forms. Forms 6
            // and 7 of each row are the segment push/pops and BCD opcodes,
            // which fall through to their own arms below.
            0x00..=0x3D if opcode & 7 <= 5 => {
                let op = AluOp::from_index((opcode >> 3) as u8);
                match opcode & 7 {
                    0 => {
                        modrm = Some(self.parse_modrm(&prefixes));
                        Operation::AluRmReg {
                            op,
                            width: Width::Byte,
                        }
                    }
                    1 => {
                        modrm = Some(self.parse_modrm(&prefixes));
                        Operation::AluRmReg { op, width: vw }
                    }
                    2 => {
                        modrm = Some(self.parse_modrm(&prefixes));
                        Operation::AluRegRm {
                            op,
                            width: Width::Byte,
                        }
                    }
                    3 => {
                        modrm = Some(self.parse_modrm(&prefixes));
                        Operation::AluRegRm { op, width: vw }
                    }
                    4 => Operation::AluAccImm {
                        op,
                        width: Width::Byte,
                        imm: Imm::U8(self.field()),
                    },
                    _ => Operation::AluAccImm {
                        op,
                        width: vw,
                        imm: self.imm_for(vw),
                    },
                }
            }
            0x06 => Operation::PushSeg { segment: seg::ES },
            0x07 => Operation::PopSeg { segment: seg::ES },
            0x0E => Operation::PushSeg { segment: seg::CS },
            0x16 => Operation::PushSeg { segment: seg::SS },
            0x17 => Operation::PopSeg { segment: seg::SS },
            0x1E => Operation::PushSeg { segment: seg::DS },
            0x1F => Operation::PopSeg { segment: seg::DS },

            0x40..=0x47 => Operation::IncReg {
                reg: (opcode & 7) as u8,
                width: vw,
            },
            0x48..=0x4F => Operation::DecReg {
                reg: (opcode & 7) as u8,
                width: vw,
            },
            0x50..=0x57 => Operation::PushReg {
                reg: (opcode & 7) as u8,
            },
            0x58..=0x5F => Operation::PopReg {
                reg: (opcode & 7) as u8,
            },
            0x60 => Operation::PushAll,
            0x61 => Operation::PopAll,
            0x68 => Operation::PushImm {
                width: vw,
                imm: self.imm_for(vw),
            },
            0x69 => {
                modrm = Some(self.parse_modrm(&prefixes));
                Operation::ImulRegRmImm {
                    width: vw,
                    imm: self.imm_for(vw),
                }
            }
            0x6A => Operation::PushImm {
                width: vw,
                imm: Imm::I8(self.field()),
            },
            0x6B => {
                modrm = Some(self.parse_modrm(&prefixes));
                Operation::ImulRegRmImm {
                    width: vw,
                    imm: Imm::I8(self.field()),
                }
            }
            0x6C => Operation::StringRun {
                op: StringOp::Ins,
                width: Width::Byte,
            },
            0x6D => Operation::StringRun {
                op: StringOp::Ins,
                width: vw,
            },
            0x6E => Operation::StringRun {
                op: StringOp::Outs,
                width: Width::Byte,
            },
            0x6F => Operation::StringRun {
                op: StringOp::Outs,
                width: vw,
            },

            0x70..=0x7F => Operation::Jcc {
                condition: Condition::from_index(opcode as u8),
                offset: self.field(),
            },

            0x80 | 0x82 => {
                let ctx = self.parse_modrm(&prefixes);
                let op = AluOp::from_index(ctx.reg);
                modrm = Some(ctx);
                Operation::AluRmImm {
                    op,
                    width: Width::Byte,
                    imm: Imm::U8(self.field()),
                }
            }
            0x81 => {
                let ctx = self.parse_modrm(&prefixes);
                let op = AluOp::from_index(ctx.reg);
                modrm = Some(ctx);
                Operation::AluRmImm {
                    op,
                    width: vw,
                    imm: self.imm_for(vw),
                }
            }
            0x83 => {
                let ctx = self.parse_modrm(&prefixes);
                let op = AluOp::from_index(ctx.reg);
                modrm = Some(ctx);
                Operation::AluRmImm {
                    op,
                    width: vw,
                    imm: Imm::I8(self.field()),
                }
            }

            0x84 => {
                modrm = Some(self.parse_modrm(&prefixes));
                Operation::TestRmReg { width: Width::Byte }
            }
            0x85 => {
                modrm = Some(self.parse_modrm(&prefixes));
                Operation::TestRmReg { width: vw }
            }
            0x86 => {
                modrm = Some(self.parse_modrm(&prefixes));
                Operation::XchgRmReg { width: Width::Byte }
            }
            0x87 => {
                modrm = Some(self.parse_modrm(&prefixes));
                Operation::XchgRmReg { width: vw }
            }
            0x88 => {
                modrm = Some(self.parse_modrm(&prefixes));
                Operation::MovRmReg { width: Width::Byte }
            }
            0x89 => {
                modrm = Some(self.parse_modrm(&prefixes));
                Operation::MovRmReg { width: vw }
            }
            0x8A => {
                modrm = Some(self.parse_modrm(&prefixes));
                Operation::MovRegRm { width: Width::Byte }
            }
            0x8B => {
                modrm = Some(self.parse_modrm(&prefixes));
                Operation::MovRegRm { width: vw }
            }
            0x8C => {
                let ctx = self.parse_modrm(&prefixes);
                if ctx.reg >= 6 {
                    return Err(self.invalid_group(opcode, ctx.reg));
                }
                modrm = Some(ctx);
                Operation::MovRmSeg
            }
            0x8D => {
                let ctx = self.parse_modrm(&prefixes);
                if !ctx.is_memory() {
                    return Err(self.invalid_group(opcode, ctx.reg));
                }
                modrm = Some(ctx);
                Operation::Lea { width: vw }
            }
            0x8E => {
                let ctx = self.parse_modrm(&prefixes);
                if ctx.reg >= 6 {
                    return Err(self.invalid_group(opcode, ctx.reg));
                }
                modrm = Some(ctx);
                Operation::MovSegRm
            }
            0x8F => {
                let ctx = self.parse_modrm(&prefixes);
                if ctx.reg != 0 {
                    return Err(self.invalid_group(opcode, ctx.reg));
                }
                modrm = Some(ctx);
                Operation::PopRm { width: vw }
            }

            0x90 => Operation::Nop,
            0x91..=0x97 => Operation::XchgAccReg {
                reg: (opcode & 7) as u8,
                width: vw,
            },
            0x98 => Operation::SignExtendAcc { width: vw },
            0x99 => Operation::SignExtendDxAx { width: vw },
            0x9A => {
                let target_offset = self.field();
                let target_segment = self.field();
                Operation::CallFar {
                    target_offset,
                    target_segment,
                }
            }
            // WAIT: no FPU, treated as a no-op like the rest of the x87 set
            // would be on a machine without one.
            0x9B => Operation::Nop,
            0x9C => Operation::PushFlags { width: vw },
            0x9D => Operation::PopFlags { width: vw },
            0x9E => Operation::Sahf,
            0x9F => Operation::Lahf,

            0xA0 => Operation::MovAccMoffs {
                width: Width::Byte,
                offset: self.moffs(&prefixes),
                to_accumulator: true,
            },
            0xA1 => Operation::MovAccMoffs {
                width: vw,
                offset: self.moffs(&prefixes),
                to_accumulator: true,
            },
            0xA2 => Operation::MovAccMoffs {
                width: Width::Byte,
                offset: self.moffs(&prefixes),
                to_accumulator: false,
            },
            0xA3 => Operation::MovAccMoffs {
                width: vw,
                offset: self.moffs(&prefixes),
                to_accumulator: false,
            },
            0xA4 => Operation::StringRun {
                op: StringOp::Movs,
                width: Width::Byte,
            },
            0xA5 => Operation::StringRun {
                op: StringOp::Movs,
                width: vw,
            },
            0xA6 => Operation::StringRun {
                op: StringOp::Cmps,
                width: Width::Byte,
            },
            0xA7 => Operation::StringRun {
                op: StringOp::Cmps,
                width: vw,
            },
            0xA8 => Operation::TestAccImm {
                width: Width::Byte,
                imm: Imm::U8(self.field()),
            },
            0xA9 => Operation::TestAccImm {
                width: vw,
                imm: self.imm_for(vw),
            },
            0xAA => Operation::StringRun {
                op: StringOp::Stos,
                width: Width::Byte,
            },
            0xAB => Operation::StringRun {
                op: StringOp::Stos,
                width: vw,
            },
            0xAC => Operation::StringRun {
                op: StringOp::Lods,
                width: Width::Byte,
            },
            0xAD => Operation::StringRun {
                op: StringOp::Lods,
                width: vw,
            },
            0xAE => Operation::StringRun {
                op: StringOp::Scas,
                width: Width::Byte,
            },
            0xAF => Operation::StringRun {
                op: StringOp::Scas,
                width: vw,
            },

            0xB0..=0xB7 => Operation::MovRegImm {
                reg: (opcode & 7) as u8,
                width: Width::Byte,
                imm: Imm::U8(self.field()),
            },
            0xB8..=0xBF => Operation::MovRegImm {
                reg: (opcode & 7) as u8,
                width: vw,
                imm: self.imm_for(vw),
            },

            0xC0 => {
                let ctx = self.parse_modrm(&prefixes);
                let op = ShiftOp::from_index(ctx.reg);
                modrm = Some(ctx);
                Operation::ShiftRmImm {
                    op,
                    width: Width::Byte,
                    count: self.field(),
                }
            }
            0xC1 => {
                let ctx = self.parse_modrm(&prefixes);
                let op = ShiftOp::from_index(ctx.reg);
                modrm = Some(ctx);
                Operation::ShiftRmImm {
                    op,
                    width: vw,
                    count: self.field(),
                }
            }
            0xC2 => Operation::RetNear {
                pop: Some(self.field()),
            },
            0xC3 => Operation::RetNear { pop: None },
            0xC4 => {
                let ctx = self.parse_modrm(&prefixes);
                if !ctx.is_memory() {
                    return Err(self.invalid_group(opcode, ctx.reg));
                }
                modrm = Some(ctx);
                Operation::LoadFarPointer { segment: seg::ES }
            }
            0xC5 => {
                let ctx = self.parse_modrm(&prefixes);
                if !ctx.is_memory() {
                    return Err(self.invalid_group(opcode, ctx.reg));
                }
                modrm = Some(ctx);
                Operation::LoadFarPointer { segment: seg::DS }
            }
            0xC6 => {
                let ctx = self.parse_modrm(&prefixes);
                if ctx.reg != 0 {
                    return Err(self.invalid_group(opcode, ctx.reg));
                }
                modrm = Some(ctx);
                Operation::MovRmImm {
                    width: Width::Byte,
                    imm: Imm::U8(self.field()),
                }
            }
            0xC7 => {
                let ctx = self.parse_modrm(&prefixes);
                if ctx.reg != 0 {
                    return Err(self.invalid_group(opcode, ctx.reg));
                }
                modrm = Some(ctx);
                Operation::MovRmImm {
                    width: vw,
                    imm: self.imm_for(vw),
                }
            }
            0xC9 => Operation::Leave,
            0xCA => Operation::RetFar {
                pop: Some(self.field()),
            },
            0xCB => Operation::RetFar { pop: None },
            0xCC => Operation::Int3,
            0xCD => Operation::Int {
                vector: self.field(),
            },
            0xCE => Operation::Into,
            0xCF => Operation::Iret,

            0xD0 => {
                let ctx = self.parse_modrm(&prefixes);
                let op = ShiftOp::from_index(ctx.reg);
                modrm = Some(ctx);
                Operation::ShiftRmOne {
                    op,
                    width: Width::Byte,
                }
            }
            0xD1 => {
                let ctx = self.parse_modrm(&prefixes);
                let op = ShiftOp::from_index(ctx.reg);
                modrm = Some(ctx);
                Operation::ShiftRmOne { op, width: vw }
            }
            0xD2 => {
                let ctx = self.parse_modrm(&prefixes);
                let op = ShiftOp::from_index(ctx.reg);
                modrm = Some(ctx);
                Operation::ShiftRmCl {
                    op,
                    width: Width::Byte,
                }
            }
            0xD3 => {
                let ctx = self.parse_modrm(&prefixes);
                let op = ShiftOp::from_index(ctx.reg);
                modrm = Some(ctx);
                Operation::ShiftRmCl { op, width: vw }
            }
            0xD7 => Operation::Xlat,

            0xE0 => Operation::Loop {
                kind: LoopKind::WhileNotZero,
                offset: self.field(),
            },
            0xE1 => Operation::Loop {
                kind: LoopKind::WhileZero,
                offset: self.field(),
            },
            0xE2 => Operation::Loop {
                kind: LoopKind::Plain,
                offset: self.field(),
            },
            0xE3 => Operation::Jcxz {
                offset: self.field(),
            },
            0xE4 => Operation::InImm {
                width: Width::Byte,
                port: self.field(),
            },
            0xE5 => Operation::InImm {
                width: vw,
                port: self.field(),
            },
            0xE6 => Operation::OutImm {
                width: Width::Byte,
                port: self.field(),
            },
            0xE7 => Operation::OutImm {
                width: vw,
                port: self.field(),
            },
            0xE8 => Operation::CallNear {
                offset: self.field(),
            },
            0xE9 => Operation::JmpNear {
                offset: self.field(),
            },
            0xEA => {
                let target_offset = self.field();
                let target_segment = self.field();
                Operation::JmpFar {
                    target_offset,
                    target_segment,
                }
            }
            0xEB => Operation::JmpShort {
                offset: self.field(),
            },
            0xEC => Operation::InDx { width: Width::Byte },
            0xED => Operation::InDx { width: vw },
            0xEE => Operation::OutDx { width: Width::Byte },
            0xEF => Operation::OutDx { width: vw },

            0xF4 => Operation::Hlt,
            0xF5 => Operation::ComplementCarry,
            0xF6 | 0xF7 => {
                let width = if opcode == 0xF6 { Width::Byte } else { vw };
                let ctx = self.parse_modrm(&prefixes);
                let reg = ctx.reg;
                modrm = Some(ctx);
                let op = match reg {
                    0 | 1 => Group3Op::Test(if width == Width::Byte {
                        Imm::U8(self.field())
                    } else {
                        self.imm_for(width)
                    }),
                    2 => Group3Op::Not,
                    3 => Group3Op::Neg,
                    4 => Group3Op::Mul,
                    5 => Group3Op::Imul,
                    6 => Group3Op::Div,
                    _ => Group3Op::Idiv,
                };
                Operation::Group3 { op, width }
            }
            0xF8 => Operation::SetFlag {
                flag: Flags::CARRY,
                value: false,
            },
            0xF9 => Operation::SetFlag {
                flag: Flags::CARRY,
                value: true,
            },
            0xFA => Operation::SetFlag {
                flag: Flags::INTERRUPT,
                value: false,
            },
            0xFB => Operation::SetFlag {
                flag: Flags::INTERRUPT,
                value: true,
            },
            0xFC => Operation::SetFlag {
                flag: Flags::DIRECTION,
                value: false,
            },
            0xFD => Operation::SetFlag {
                flag: Flags::DIRECTION,
                value: true,
            },
            0xFE => {
                let byte = self.next_u8();
                let reg = (byte >> 3) & 7;
                match reg {
                    0 => {
                        modrm = Some(self.modrm_body(byte, &prefixes));
                        Operation::IncRm { width: Width::Byte }
                    }
                    1 => {
                        modrm = Some(self.modrm_body(byte, &prefixes));
                        Operation::DecRm { width: Width::Byte }
                    }
                    // Reserved encoding claimed for the host-callback
                    // extension: FE /7 ib.
                    7 => Operation::Callback {
                        number: self.field(),
                    },
                    _ => return Err(self.invalid_group(opcode, reg)),
                }
            }
            0xFF => {
                let ctx = self.parse_modrm(&prefixes);
                let reg = ctx.reg;
                let is_memory = ctx.is_memory();
                modrm = Some(ctx);
                match reg {
                    0 => Operation::IncRm { width: vw },
                    1 => Operation::DecRm { width: vw },
                    2 => Operation::CallRmNear,
                    3 if is_memory => Operation::CallRmFar,
                    4 => Operation::JmpRmNear,
                    5 if is_memory => Operation::JmpRmFar,
                    6 => Operation::PushRm { width: vw },
                    _ => return Err(self.invalid_group(opcode, reg)),
                }
            }

            // Two-byte opcodes.
            0x0F80..=0x0F8F => Operation::JccNear {
                condition: Condition::from_index(opcode as u8),
                offset: self.field(),
            },
            0x0F90..=0x0F9F => {
                modrm = Some(self.parse_modrm(&prefixes));
                Operation::Setcc {
                    condition: Condition::from_index(opcode as u8),
                }
            }
            0x0FA0 => Operation::PushSeg { segment: seg::FS },
            0x0FA1 => Operation::PopSeg { segment: seg::FS },
            0x0FA8 => Operation::PushSeg { segment: seg::GS },
            0x0FA9 => Operation::PopSeg { segment: seg::GS },
            0x0FA4 => {
                modrm = Some(self.parse_modrm(&prefixes));
                Operation::ShiftDouble {
                    right: false,
                    width: vw,
                    count: Some(self.field()),
                }
            }
            0x0FA5 => {
                modrm = Some(self.parse_modrm(&prefixes));
                Operation::ShiftDouble {
                    right: false,
                    width: vw,
                    count: None,
                }
            }
            0x0FAC => {
                modrm = Some(self.parse_modrm(&prefixes));
                Operation::ShiftDouble {
                    right: true,
                    width: vw,
                    count: Some(self.field()),
                }
            }
            0x0FAD => {
                modrm = Some(self.parse_modrm(&prefixes));
                Operation::ShiftDouble {
                    right: true,
                    width: vw,
                    count: None,
                }
            }
            0x0FAF => {
                modrm = Some(self.parse_modrm(&prefixes));
                Operation::ImulRegRm { width: vw }
            }
            0x0FB6 => {
                modrm = Some(self.parse_modrm(&prefixes));
                Operation::MovzxRegRm {
                    width: vw,
                    src: Width::Byte,
                }
            }
            0x0FB7 => {
                modrm = Some(self.parse_modrm(&prefixes));
                Operation::MovzxRegRm {
                    width: vw,
                    src: Width::Word,
                }
            }
            0x0FBE => {
                modrm = Some(self.parse_modrm(&prefixes));
                Operation::MovsxRegRm {
                    width: vw,
                    src: Width::Byte,
                }
            }
            0x0FBF => {
                modrm = Some(self.parse_modrm(&prefixes));
                Operation::MovsxRegRm {
                    width: vw,
                    src: Width::Word,
                }
            }

            _ => return Err(self.unsupported(opcode)),
        };

        let length = self.offset.wrapping_sub(self.start.offset) as u8;
        Ok(Instruction {
            address: self.start,
            opcode,
            prefixes,
            operation,
            modrm,
            length,
            image: self.image,
            successors_per_address: HashMap::new(),
        })
    }

    /// Direct-offset operand of the `A0..=A3` forms; its width follows the
    /// address size.
    fn moffs(&mut self, prefixes: &Prefixes) -> Imm {
        if prefixes.address_size_override {
            Imm::U32(self.field())
        } else {
            Imm::U16(self.field())
        }
    }
}
