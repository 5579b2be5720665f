//! The typed instruction representation.
//!
//! Instructions are a tagged union of operation payloads plus shared
//! context (prefixes, ModR/M, byte image, CFG successor links). Operand
//! immediates are [`InstructionField`]s so their byte provenance survives
//! into execution and lifting.

use std::collections::HashMap;

use crate::alu::{AluOp, ShiftOp, Width};
use crate::field::{FieldSlot, InstructionField};
use crate::graph::NodeId;
use crate::mem::MemoryBus;
use crate::modrm::{Displacement, ModRmContext, RmTarget};
use crate::state::{Flags, SegmentedAddress};

/// Decoded prefix set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Prefixes {
    /// Segment-override prefix, as a segment register index.
    pub segment: Option<u8>,
    pub operand_size_override: bool,
    pub address_size_override: bool,
    pub rep: Option<RepPrefix>,
    pub lock: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RepPrefix {
    /// REPE continues while ZF is set, REPNE while it is clear. Ignored by
    /// non-comparing string operations.
    pub continue_on_zf: bool,
}

/// Immediate operand of any supported width. `I8` marks the sign-extended
/// byte immediates of the `83`/`6A`/`6B` encodings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Imm {
    U8(InstructionField<u8>),
    U16(InstructionField<u16>),
    U32(InstructionField<u32>),
    I8(InstructionField<i8>),
}

impl Imm {
    /// The operand value for this execution, extended to `width`.
    pub fn value(&self, bus: &MemoryBus, width: Width) -> u32 {
        match self {
            Imm::U8(f) => f.current(bus) as u32,
            Imm::U16(f) => f.current(bus) as u32,
            Imm::U32(f) => f.current(bus),
            Imm::I8(f) => (f.current(bus) as i32 as u32) & width.mask(),
        }
    }

    fn slot(&self) -> &dyn FieldSlot {
        match self {
            Imm::U8(f) => f,
            Imm::U16(f) => f,
            Imm::U32(f) => f,
            Imm::I8(f) => f,
        }
    }

    fn slot_mut(&mut self) -> &mut dyn FieldSlot {
        match self {
            Imm::U8(f) => f,
            Imm::U16(f) => f,
            Imm::U32(f) => f,
            Imm::I8(f) => f,
        }
    }
}

/// Condition codes in encoding order (`70..=7F`, `0F 80..`, `0F 90..`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Condition {
    Overflow,
    NotOverflow,
    Below,
    AboveOrEqual,
    Equal,
    NotEqual,
    BelowOrEqual,
    Above,
    Sign,
    NotSign,
    ParityEven,
    ParityOdd,
    Less,
    GreaterOrEqual,
    LessOrEqual,
    Greater,
}

impl Condition {
    pub fn from_index(index: u8) -> Self {
        use Condition::*;
        match index & 0xF {
            0x0 => Overflow,
            0x1 => NotOverflow,
            0x2 => Below,
            0x3 => AboveOrEqual,
            0x4 => Equal,
            0x5 => NotEqual,
            0x6 => BelowOrEqual,
            0x7 => Above,
            0x8 => Sign,
            0x9 => NotSign,
            0xA => ParityEven,
            0xB => ParityOdd,
            0xC => Less,
            0xD => GreaterOrEqual,
            0xE => LessOrEqual,
            _ => Greater,
        }
    }

    pub fn eval(self, flags: Flags) -> bool {
        use Condition::*;
        let cf = flags.contains(Flags::CARRY);
        let zf = flags.contains(Flags::ZERO);
        let sf = flags.contains(Flags::SIGN);
        let of = flags.contains(Flags::OVERFLOW);
        let pf = flags.contains(Flags::PARITY);
        match self {
            Overflow => of,
            NotOverflow => !of,
            Below => cf,
            AboveOrEqual => !cf,
            Equal => zf,
            NotEqual => !zf,
            BelowOrEqual => cf || zf,
            Above => !cf && !zf,
            Sign => sf,
            NotSign => !sf,
            ParityEven => pf,
            ParityOdd => !pf,
            Less => sf != of,
            GreaterOrEqual => sf == of,
            LessOrEqual => zf || sf != of,
            Greater => !zf && sf == of,
        }
    }

    pub fn suffix(self) -> &'static str {
        use Condition::*;
        match self {
            Overflow => "o",
            NotOverflow => "no",
            Below => "b",
            AboveOrEqual => "ae",
            Equal => "e",
            NotEqual => "ne",
            BelowOrEqual => "be",
            Above => "a",
            Sign => "s",
            NotSign => "ns",
            ParityEven => "p",
            ParityOdd => "np",
            Less => "l",
            GreaterOrEqual => "ge",
            LessOrEqual => "le",
            Greater => "g",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopKind {
    Plain,
    WhileZero,
    WhileNotZero,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StringOp {
    Movs,
    Cmps,
    Stos,
    Lods,
    Scas,
    Ins,
    Outs,
}

impl StringOp {
    pub fn compares(self) -> bool {
        matches!(self, StringOp::Cmps | StringOp::Scas)
    }

    pub fn mnemonic(self) -> &'static str {
        match self {
            StringOp::Movs => "movs",
            StringOp::Cmps => "cmps",
            StringOp::Stos => "stos",
            StringOp::Lods => "lods",
            StringOp::Scas => "scas",
            StringOp::Ins => "ins",
            StringOp::Outs => "outs",
        }
    }
}

/// `F6`/`F7` group operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Group3Op {
    Test(Imm),
    Not,
    Neg,
    Mul,
    Imul,
    Div,
    Idiv,
}

/// The operation payload of a decoded instruction. ALU and shift families
/// are collapsed into data-carrying variants instead of one variant per
/// opcode; the executor dispatches on this with a single `match`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    AluRmReg { op: AluOp, width: Width },
    AluRegRm { op: AluOp, width: Width },
    AluAccImm { op: AluOp, width: Width, imm: Imm },
    AluRmImm { op: AluOp, width: Width, imm: Imm },
    TestRmReg { width: Width },
    TestAccImm { width: Width, imm: Imm },
    XchgRmReg { width: Width },
    XchgAccReg { reg: u8, width: Width },
    MovRmReg { width: Width },
    MovRegRm { width: Width },
    MovRmImm { width: Width, imm: Imm },
    MovRegImm { reg: u8, width: Width, imm: Imm },
    MovAccMoffs { width: Width, offset: Imm, to_accumulator: bool },
    MovRmSeg,
    MovSegRm,
    MovzxRegRm { width: Width, src: Width },
    MovsxRegRm { width: Width, src: Width },
    Lea { width: Width },
    LoadFarPointer { segment: u8 },
    IncReg { reg: u8, width: Width },
    DecReg { reg: u8, width: Width },
    IncRm { width: Width },
    DecRm { width: Width },
    PushReg { reg: u8 },
    PopReg { reg: u8 },
    PushSeg { segment: u8 },
    PopSeg { segment: u8 },
    PushImm { width: Width, imm: Imm },
    PushRm { width: Width },
    PopRm { width: Width },
    PushAll,
    PopAll,
    PushFlags { width: Width },
    PopFlags { width: Width },
    Lahf,
    Sahf,
    /// CBW / CWDE.
    SignExtendAcc { width: Width },
    /// CWD / CDQ.
    SignExtendDxAx { width: Width },
    JmpShort { offset: InstructionField<i8> },
    JmpNear { offset: InstructionField<i16> },
    JmpFar {
        target_offset: InstructionField<u16>,
        target_segment: InstructionField<u16>,
    },
    JmpRmNear,
    JmpRmFar,
    CallNear { offset: InstructionField<i16> },
    CallFar {
        target_offset: InstructionField<u16>,
        target_segment: InstructionField<u16>,
    },
    CallRmNear,
    CallRmFar,
    RetNear { pop: Option<InstructionField<u16>> },
    RetFar { pop: Option<InstructionField<u16>> },
    Iret,
    Jcc { condition: Condition, offset: InstructionField<i8> },
    JccNear { condition: Condition, offset: InstructionField<i16> },
    Jcxz { offset: InstructionField<i8> },
    Loop { kind: LoopKind, offset: InstructionField<i8> },
    Setcc { condition: Condition },
    Int { vector: InstructionField<u8> },
    Int3,
    Into,
    StringRun { op: StringOp, width: Width },
    Hlt,
    Nop,
    Leave,
    InImm { width: Width, port: InstructionField<u8> },
    InDx { width: Width },
    OutImm { width: Width, port: InstructionField<u8> },
    OutDx { width: Width },
    ShiftRmImm { op: ShiftOp, width: Width, count: InstructionField<u8> },
    ShiftRmOne { op: ShiftOp, width: Width },
    ShiftRmCl { op: ShiftOp, width: Width },
    /// SHLD / SHRD; `count` is `None` for the CL-counted forms.
    ShiftDouble {
        right: bool,
        width: Width,
        count: Option<InstructionField<u8>>,
    },
    Group3 { op: Group3Op, width: Width },
    ImulRegRm { width: Width },
    ImulRegRmImm { width: Width, imm: Imm },
    Xlat,
    SetFlag { flag: Flags, value: bool },
    ComplementCarry,
    /// Emulator-private `FE /7 ib` extension: transfer to a host callback.
    Callback { number: InstructionField<u8> },
}

impl Operation {
    fn collect_fields<'a>(&'a self, out: &mut Vec<&'a dyn FieldSlot>) {
        use Operation::*;
        match self {
            AluAccImm { imm, .. }
            | AluRmImm { imm, .. }
            | TestAccImm { imm, .. }
            | MovRmImm { imm, .. }
            | MovRegImm { imm, .. }
            | PushImm { imm, .. }
            | ImulRegRmImm { imm, .. } => out.push(imm.slot()),
            MovAccMoffs { offset, .. } => out.push(offset.slot()),
            JmpShort { offset } | Jcxz { offset } | Loop { offset, .. } | Jcc { offset, .. } => {
                out.push(offset)
            }
            JmpNear { offset } | CallNear { offset } | JccNear { offset, .. } => out.push(offset),
            JmpFar {
                target_offset,
                target_segment,
            }
            | CallFar {
                target_offset,
                target_segment,
            } => {
                out.push(target_offset);
                out.push(target_segment);
            }
            RetNear { pop: Some(pop) } | RetFar { pop: Some(pop) } => out.push(pop),
            Int { vector } => out.push(vector),
            InImm { port, .. } | OutImm { port, .. } => out.push(port),
            ShiftRmImm { count, .. } => out.push(count),
            ShiftDouble {
                count: Some(count), ..
            } => out.push(count),
            Group3 {
                op: Group3Op::Test(imm),
                ..
            } => out.push(imm.slot()),
            Callback { number } => out.push(number),
            _ => {}
        }
    }

    fn collect_fields_mut<'a>(&'a mut self, out: &mut Vec<&'a mut dyn FieldSlot>) {
        use Operation::*;
        match self {
            AluAccImm { imm, .. }
            | AluRmImm { imm, .. }
            | TestAccImm { imm, .. }
            | MovRmImm { imm, .. }
            | MovRegImm { imm, .. }
            | PushImm { imm, .. }
            | ImulRegRmImm { imm, .. } => out.push(imm.slot_mut()),
            MovAccMoffs { offset, .. } => out.push(offset.slot_mut()),
            JmpShort { offset } | Jcxz { offset } | Loop { offset, .. } | Jcc { offset, .. } => {
                out.push(offset)
            }
            JmpNear { offset } | CallNear { offset } | JccNear { offset, .. } => out.push(offset),
            JmpFar {
                target_offset,
                target_segment,
            }
            | CallFar {
                target_offset,
                target_segment,
            } => {
                out.push(target_offset);
                out.push(target_segment);
            }
            RetNear { pop: Some(pop) } | RetFar { pop: Some(pop) } => out.push(pop),
            Int { vector } => out.push(vector),
            InImm { port, .. } | OutImm { port, .. } => out.push(port),
            ShiftRmImm { count, .. } => out.push(count),
            ShiftDouble {
                count: Some(count), ..
            } => out.push(count),
            Group3 {
                op: Group3Op::Test(imm),
                ..
            } => out.push(imm.slot_mut()),
            Callback { number } => out.push(number),
            _ => {}
        }
    }
}

fn displacement_slot(displacement: &Displacement) -> Option<&dyn FieldSlot> {
    match displacement {
        Displacement::None => None,
        Displacement::Byte(f) => Some(f),
        Displacement::Word(f) => Some(f),
        Displacement::Dword(f) => Some(f),
        Displacement::Off16(f) => Some(f),
        Displacement::Off32(f) => Some(f),
    }
}

fn displacement_slot_mut(displacement: &mut Displacement) -> Option<&mut dyn FieldSlot> {
    match displacement {
        Displacement::None => None,
        Displacement::Byte(f) => Some(f),
        Displacement::Word(f) => Some(f),
        Displacement::Dword(f) => Some(f),
        Displacement::Off16(f) => Some(f),
        Displacement::Off32(f) => Some(f),
    }
}

/// A byte pattern guarding a CFG edge; `None` entries are wildcards
/// standing for operand bytes known to self-modify.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Discriminator {
    pub bytes: Vec<Option<u8>>,
}

impl Discriminator {
    pub fn matches(&self, bus: &MemoryBus, physical: u32) -> bool {
        let live = bus.span(physical, self.bytes.len());
        self.bytes
            .iter()
            .zip(live)
            .all(|(expected, live)| expected.map_or(true, |byte| byte == *live))
    }
}

/// One decoded instruction, owned by the control-flow graph.
#[derive(Debug, Clone)]
pub struct Instruction {
    pub address: SegmentedAddress,
    /// One-byte opcodes as `0x00XX`, two-byte (`0F`) opcodes as `0x0FXX`.
    pub opcode: u16,
    pub prefixes: Prefixes,
    pub operation: Operation,
    pub modrm: Option<ModRmContext>,
    pub length: u8,
    /// The full byte image as decoded, opcode and operands included.
    pub image: Vec<u8>,
    /// CFG successor links, keyed by the post-execution `(cs, ip)`.
    pub successors_per_address: HashMap<SegmentedAddress, NodeId>,
}

impl Instruction {
    /// Address of the byte after this instruction, wrapping within the
    /// segment.
    pub fn next_in_memory_address(&self) -> SegmentedAddress {
        SegmentedAddress::new(
            self.address.segment,
            self.address.offset.wrapping_add(self.length as u16),
        )
    }

    pub fn has_rep_prefix(&self) -> bool {
        self.prefixes.rep.is_some()
    }

    pub fn is_string_op(&self) -> bool {
        matches!(self.operation, Operation::StringRun { .. })
    }

    pub fn has_modrm(&self) -> bool {
        self.modrm.is_some()
    }

    fn fields(&self) -> Vec<&dyn FieldSlot> {
        let mut out: Vec<&dyn FieldSlot> = Vec::new();
        self.operation.collect_fields(&mut out);
        if let Some(modrm) = &self.modrm {
            if let RmTarget::Memory(mem) = &modrm.target {
                if let Some(slot) = displacement_slot(&mem.displacement) {
                    out.push(slot);
                }
            }
        }
        out
    }

    fn fields_mut(&mut self) -> Vec<&mut dyn FieldSlot> {
        let mut out: Vec<&mut dyn FieldSlot> = Vec::new();
        self.operation.collect_fields_mut(&mut out);
        if let Some(modrm) = &mut self.modrm {
            if let RmTarget::Memory(mem) = &mut modrm.target {
                if let Some(slot) = displacement_slot_mut(&mut mem.displacement) {
                    out.push(slot);
                }
            }
        }
        out
    }

    /// Byte offsets (within the image) currently treated as wildcards
    /// because their fields re-read memory each execution.
    fn wildcard_ranges(&self) -> Vec<(usize, usize)> {
        let start = self.address.physical();
        self.fields()
            .iter()
            .filter(|field| !field.use_value())
            .filter_map(|field| {
                let rel = field.physical_address().wrapping_sub(start) as usize;
                // Operands of an instruction wrapping the segment end do
                // not map back into the image; leave those bytes fixed.
                (rel < self.image.len()).then_some((rel, rel + field.byte_len()))
            })
            .collect()
    }

    /// Do the bytes in memory still correspond to this instruction?
    /// Degraded operand bytes are ignored; everything else must match the
    /// decode-time image.
    pub fn matches_memory(&self, bus: &MemoryBus) -> bool {
        let wildcards = self.wildcard_ranges();
        let live = bus.span(self.address.physical(), self.image.len());
        self.image.iter().enumerate().all(|(i, expected)| {
            wildcards.iter().any(|&(lo, hi)| i >= lo && i < hi) || live[i] == *expected
        })
    }

    /// React to self-modified bytes: any operand field whose bytes changed
    /// is degraded to live re-reads. Returns `true` when that rescues the
    /// instruction (only operand bytes had changed); `false` means fixed
    /// bytes changed and the CFG must fork through a discriminator.
    pub fn degrade_changed_operands(&mut self, bus: &MemoryBus) -> bool {
        for field in self.fields_mut() {
            if field.use_value() && !field.matches(bus) {
                field.set_use_value(false);
                tracing::debug!(
                    "self-modified operand at {:#07x}; field degraded to live reads",
                    field.physical_address()
                );
            }
        }
        self.matches_memory(bus)
    }

    /// Byte pattern identifying this instruction in memory, with degraded
    /// operand bytes as wildcards.
    pub fn discriminator(&self) -> Discriminator {
        let wildcards = self.wildcard_ranges();
        let bytes = self
            .image
            .iter()
            .enumerate()
            .map(|(i, byte)| {
                if wildcards.iter().any(|&(lo, hi)| i >= lo && i < hi) {
                    None
                } else {
                    Some(*byte)
                }
            })
            .collect();
        Discriminator { bytes }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn imm_instruction(bus: &mut MemoryBus) -> Instruction {
        // B8 34 12: MOV AX, 0x1234 at 0000:0100.
        bus.load(0x100, &[0xB8, 0x34, 0x12]);
        Instruction {
            address: SegmentedAddress::new(0, 0x100),
            opcode: 0xB8,
            prefixes: Prefixes::default(),
            operation: Operation::MovRegImm {
                reg: 0,
                width: Width::Word,
                imm: Imm::U16(InstructionField::new(0x1234, 0x101, vec![0x34, 0x12])),
            },
            modrm: None,
            length: 3,
            image: vec![0xB8, 0x34, 0x12],
            successors_per_address: HashMap::new(),
        }
    }

    #[test]
    fn pristine_instruction_matches_memory() {
        let mut bus = MemoryBus::new();
        let instruction = imm_instruction(&mut bus);
        assert!(instruction.matches_memory(&bus));
        assert_eq!(
            instruction.next_in_memory_address(),
            SegmentedAddress::new(0, 0x103)
        );
    }

    #[test]
    fn operand_change_degrades_and_rescues() {
        let mut bus = MemoryBus::new();
        let mut instruction = imm_instruction(&mut bus);

        bus.write_u16(0x101, 0xBEEF);
        assert!(!instruction.matches_memory(&bus));
        assert!(instruction.degrade_changed_operands(&bus));
        assert!(instruction.matches_memory(&bus));

        // The discriminator now wildcards the immediate bytes.
        let discriminator = instruction.discriminator();
        assert_eq!(discriminator.bytes, vec![Some(0xB8), None, None]);
        assert!(discriminator.matches(&bus, 0x100));

        // The live value is what executes.
        match &instruction.operation {
            Operation::MovRegImm { imm, .. } => assert_eq!(imm.value(&bus, Width::Word), 0xBEEF),
            _ => unreachable!(),
        }
    }

    #[test]
    fn opcode_change_is_not_rescued() {
        let mut bus = MemoryBus::new();
        let mut instruction = imm_instruction(&mut bus);
        bus.write_u8(0x100, 0xB9); // now MOV CX, imm16
        assert!(!instruction.degrade_changed_operands(&bus));
    }

    #[test]
    fn conditions_follow_flag_algebra() {
        let mut flags = Flags::empty();
        flags.insert(Flags::ZERO);
        assert!(Condition::Equal.eval(flags));
        assert!(Condition::BelowOrEqual.eval(flags));
        assert!(!Condition::Above.eval(flags));

        let mut flags = Flags::empty();
        flags.insert(Flags::SIGN);
        assert!(Condition::Less.eval(flags)); // SF != OF
        flags.insert(Flags::OVERFLOW);
        assert!(Condition::GreaterOrEqual.eval(flags));
    }
}
