//! ModR/M and SIB operand resolution.
//!
//! The decoder turns the addressing bytes into a [`ModRmContext`]; the
//! executor resolves that context against live register and memory state
//! once per execution.

use crate::error::Exception;
use crate::field::InstructionField;
use crate::mem::MemoryBus;
use crate::state::{reg, seg, CpuState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressSize {
    Bits16,
    Bits32,
}

/// Displacement (or direct offset) attached to a memory operand. Each
/// variant is a provenance-carrying field so self-modified displacements
/// keep working.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Displacement {
    None,
    Byte(InstructionField<i8>),
    Word(InstructionField<i16>),
    Dword(InstructionField<i32>),
    /// Direct 16-bit offset (`mod=00 r/m=110`).
    Off16(InstructionField<u16>),
    /// Direct 32-bit offset (`mod=00 r/m=101`, or a SIB with no base).
    Off32(InstructionField<u32>),
}

impl Displacement {
    pub fn value(&self, bus: &MemoryBus) -> i64 {
        match self {
            Displacement::None => 0,
            Displacement::Byte(f) => f.current(bus) as i64,
            Displacement::Word(f) => f.current(bus) as i64,
            Displacement::Dword(f) => f.current(bus) as i64,
            Displacement::Off16(f) => f.current(bus) as i64,
            Displacement::Off32(f) => f.current(bus) as i64,
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Displacement::None)
    }
}

/// A memory-form r/m operand, normalised across 16-bit pairs and SIB:
/// `base + index * scale + displacement`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryOperand {
    pub base: Option<u8>,
    pub index: Option<u8>,
    pub scale: u8,
    pub displacement: Displacement,
    /// Segment used when no override prefix is present (SS for BP/ESP
    /// based forms, DS otherwise).
    pub default_segment: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RmTarget {
    Register(u8),
    Memory(MemoryOperand),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModRmContext {
    pub mode: u8,
    pub reg: u8,
    pub rm: u8,
    pub address_size: AddressSize,
    pub segment_override: Option<u8>,
    pub target: RmTarget,
}

impl ModRmContext {
    pub fn is_memory(&self) -> bool {
        matches!(self.target, RmTarget::Memory(_))
    }

    /// Segment register index this operand is addressed through.
    pub fn segment(&self) -> u8 {
        match (&self.target, self.segment_override) {
            (_, Some(segment)) => segment,
            (RmTarget::Memory(mem), None) => mem.default_segment,
            (RmTarget::Register(_), None) => seg::DS,
        }
    }

    /// Effective offset within the segment, or `None` for register
    /// operands. A 32-bit address-size form that resolves outside the
    /// 16-bit offset space faults.
    pub fn effective_offset(
        &self,
        state: &CpuState,
        bus: &MemoryBus,
    ) -> Result<Option<u32>, Exception> {
        let RmTarget::Memory(mem) = &self.target else {
            return Ok(None);
        };
        Ok(Some(mem.effective_offset(state, bus, self.address_size)?))
    }
}

impl MemoryOperand {
    pub fn effective_offset(
        &self,
        state: &CpuState,
        bus: &MemoryBus,
        address_size: AddressSize,
    ) -> Result<u32, Exception> {
        let read_base = |index: u8| -> u32 {
            match address_size {
                AddressSize::Bits16 => state.reg16(index) as u32,
                AddressSize::Bits32 => state.reg32(index),
            }
        };

        let mut offset = 0i64;
        if let Some(base) = self.base {
            offset += read_base(base) as i64;
        }
        if let Some(index) = self.index {
            offset += read_base(index) as i64 * self.scale as i64;
        }
        offset += self.displacement.value(bus);

        match address_size {
            AddressSize::Bits16 => Ok((offset as u32) & 0xFFFF),
            AddressSize::Bits32 => {
                let offset = offset as u32;
                // Real-mode segments are 64 KiB; a 32-bit form escaping
                // that window is a protection violation, not a wrap.
                if offset > 0xFFFF {
                    return Err(Exception::GeneralProtectionFault);
                }
                Ok(offset)
            }
        }
    }
}

/// 16-bit addressing table: `r/m` → (base, index, default segment).
pub fn table16(rm: u8) -> (Option<u8>, Option<u8>, u8) {
    match rm & 7 {
        0 => (Some(reg::BX), Some(reg::SI), seg::DS),
        1 => (Some(reg::BX), Some(reg::DI), seg::DS),
        2 => (Some(reg::BP), Some(reg::SI), seg::SS),
        3 => (Some(reg::BP), Some(reg::DI), seg::SS),
        4 => (None, Some(reg::SI), seg::DS),
        5 => (None, Some(reg::DI), seg::DS),
        6 => (Some(reg::BP), None, seg::SS),
        _ => (Some(reg::BX), None, seg::DS),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::InstructionField;

    fn ctx16(base: Option<u8>, index: Option<u8>, displacement: Displacement) -> ModRmContext {
        ModRmContext {
            mode: 0,
            reg: 0,
            rm: 0,
            address_size: AddressSize::Bits16,
            segment_override: None,
            target: RmTarget::Memory(MemoryOperand {
                base,
                index,
                scale: 1,
                displacement,
                default_segment: seg::DS,
            }),
        }
    }

    #[test]
    fn bx_si_with_displacement() {
        let mut state = CpuState::new();
        state.set_reg16(reg::BX, 0x1000);
        state.set_reg16(reg::SI, 0x0200);
        let bus = MemoryBus::new();

        let ctx = ctx16(
            Some(reg::BX),
            Some(reg::SI),
            Displacement::Byte(InstructionField::new(-0x10i8, 0, vec![0xF0])),
        );
        assert_eq!(
            ctx.effective_offset(&state, &bus).unwrap(),
            Some(0x11F0)
        );
    }

    #[test]
    fn sixteen_bit_offsets_wrap() {
        let mut state = CpuState::new();
        state.set_reg16(reg::BX, 0xFFF0);
        state.set_reg16(reg::SI, 0x0020);
        let bus = MemoryBus::new();

        let ctx = ctx16(Some(reg::BX), Some(reg::SI), Displacement::None);
        assert_eq!(ctx.effective_offset(&state, &bus).unwrap(), Some(0x0010));
    }

    #[test]
    fn thirty_two_bit_escape_faults() {
        let mut state = CpuState::new();
        state.set_reg32(reg::AX, 0x0001_0000);
        let bus = MemoryBus::new();

        let ctx = ModRmContext {
            mode: 0,
            reg: 0,
            rm: 0,
            address_size: AddressSize::Bits32,
            segment_override: None,
            target: RmTarget::Memory(MemoryOperand {
                base: Some(reg::AX),
                index: None,
                scale: 1,
                displacement: Displacement::None,
                default_segment: seg::DS,
            }),
        };
        assert_eq!(
            ctx.effective_offset(&state, &bus),
            Err(Exception::GeneralProtectionFault)
        );
    }

    #[test]
    fn scaled_index_contributes() {
        let mut state = CpuState::new();
        state.set_reg32(reg::BX, 0x100);
        state.set_reg32(reg::CX, 0x20);
        let bus = MemoryBus::new();

        let ctx = ModRmContext {
            mode: 0,
            reg: 0,
            rm: 4,
            address_size: AddressSize::Bits32,
            segment_override: None,
            target: RmTarget::Memory(MemoryOperand {
                base: Some(reg::BX),
                index: Some(reg::CX),
                scale: 4,
                displacement: Displacement::None,
                default_segment: seg::DS,
            }),
        };
        assert_eq!(ctx.effective_offset(&state, &bus).unwrap(), Some(0x180));
    }

    #[test]
    fn bp_defaults_to_stack_segment() {
        let (_, _, segment) = table16(6);
        assert_eq!(segment, seg::SS);
        let (_, _, segment) = table16(0);
        assert_eq!(segment, seg::DS);
    }
}
