//! Property tests over the ALU's algebra, one strategy per operand width.

use cinder_cpu::{Alu, Flags, Width};
use proptest::prelude::*;

fn add_matches_wrapping(w: Width, a: u32, b: u32) {
    let mut flags = Flags::empty();
    let result = Alu::new(&mut flags).add(w, a, b);
    let expected = (a as u64 + b as u64) & w.mask() as u64;
    assert_eq!(result as u64, expected);
    assert_eq!(
        flags.contains(Flags::CARRY),
        a as u64 + b as u64 > w.mask() as u64
    );
    assert_eq!(flags.contains(Flags::ZERO), result == 0);
}

fn sub_roundtrips_through_add(w: Width, a: u32, b: u32) {
    let mut flags = Flags::empty();
    let mut alu = Alu::new(&mut flags);
    let sum = alu.add(w, a, b);
    assert_eq!(alu.sub(w, sum, a), b & w.mask());
}

fn logic_never_sets_cf_of_af(w: Width, a: u32, b: u32) {
    for op in [cinder_cpu::AluOp::And, cinder_cpu::AluOp::Or, cinder_cpu::AluOp::Xor] {
        let mut flags = Flags::CARRY | Flags::OVERFLOW | Flags::AUXILIARY;
        Alu::new(&mut flags).op(op, w, a, b);
        assert!(!flags.contains(Flags::CARRY));
        assert!(!flags.contains(Flags::OVERFLOW));
        assert!(!flags.contains(Flags::AUXILIARY));
    }
}

fn inc_dec_preserve_cf(w: Width, a: u32, carry: bool) {
    let mut flags = Flags::empty();
    flags.set(Flags::CARRY, carry);
    let mut alu = Alu::new(&mut flags);
    let incremented = alu.inc(w, a);
    assert_eq!(alu.flags.contains(Flags::CARRY), carry);
    let back = alu.dec(w, incremented);
    assert_eq!(alu.flags.contains(Flags::CARRY), carry);
    assert_eq!(back, a & w.mask());
}

// Divisor strategies exclude zero, so `div` must reconstruct the first
// factor exactly.
fn div_reverses_mul(w: Width, a: u32, b: u32) {
    let mut flags = Flags::empty();
    let mut alu = Alu::new(&mut flags);
    let (low, high) = alu.mul(w, a, b);
    let (quotient, remainder) = alu.div(w, low, high, b).expect("divisor is non-zero");
    assert_eq!(quotient, a & w.mask());
    assert_eq!(remainder, 0);
}

proptest! {
    #[test]
    fn add8_props(a in 0u32..=0xFF, b in 0u32..=0xFF) {
        add_matches_wrapping(Width::Byte, a, b);
        sub_roundtrips_through_add(Width::Byte, a, b);
        logic_never_sets_cf_of_af(Width::Byte, a, b);
    }

    #[test]
    fn add16_props(a in 0u32..=0xFFFF, b in 0u32..=0xFFFF) {
        add_matches_wrapping(Width::Word, a, b);
        sub_roundtrips_through_add(Width::Word, a, b);
        logic_never_sets_cf_of_af(Width::Word, a, b);
    }

    #[test]
    fn add32_props(a in any::<u32>(), b in any::<u32>()) {
        add_matches_wrapping(Width::Dword, a, b);
        sub_roundtrips_through_add(Width::Dword, a, b);
        logic_never_sets_cf_of_af(Width::Dword, a, b);
    }

    #[test]
    fn inc_dec_props(a in any::<u32>(), carry in any::<bool>()) {
        inc_dec_preserve_cf(Width::Byte, a & 0xFF, carry);
        inc_dec_preserve_cf(Width::Word, a & 0xFFFF, carry);
        inc_dec_preserve_cf(Width::Dword, a, carry);
    }

    #[test]
    fn mul_div_props(a in any::<u32>(), b in 1u32..=0xFF) {
        div_reverses_mul(Width::Byte, a & 0xFF, b);
        div_reverses_mul(Width::Word, a & 0xFFFF, b);
        div_reverses_mul(Width::Dword, a, b);
    }

    #[test]
    fn shifts_by_zero_change_nothing(a in any::<u32>(), carry in any::<bool>()) {
        for op in [
            cinder_cpu::ShiftOp::Shl,
            cinder_cpu::ShiftOp::Shr,
            cinder_cpu::ShiftOp::Sar,
            cinder_cpu::ShiftOp::Rol,
            cinder_cpu::ShiftOp::Ror,
            cinder_cpu::ShiftOp::Rcl,
            cinder_cpu::ShiftOp::Rcr,
        ] {
            let mut flags = Flags::empty();
            flags.set(Flags::CARRY, carry);
            let before = flags;
            let result = Alu::new(&mut flags).shift(op, Width::Word, a & 0xFFFF, 0);
            prop_assert_eq!(result, a & 0xFFFF);
            prop_assert_eq!(flags, before);
        }
    }
}

#[test]
fn sixteen_bit_effective_addresses_stay_in_range() {
    use cinder_cpu::state::reg;
    use cinder_cpu::{CpuState, MemoryBus};

    // Exhaustive-ish sweep over the wrap-heavy corner of the 16-bit EA
    // space: every base/index form with extreme register values.
    let bus = MemoryBus::new();
    for rm in 0..8u8 {
        for (base_value, index_value, disp) in [
            (0xFFFFu16, 0xFFFFu16, 0x7Fi8),
            (0x8000, 0xFFFF, -0x80),
            (0xFFFF, 0x0001, 0),
        ] {
            let mut state = CpuState::new();
            for index in [reg::BX, reg::BP] {
                state.set_reg16(index, base_value);
            }
            for index in [reg::SI, reg::DI] {
                state.set_reg16(index, index_value);
            }
            let (base, index, default_segment) = cinder_cpu::modrm::table16(rm);
            let operand = cinder_cpu::MemoryOperand {
                base,
                index,
                scale: 1,
                displacement: cinder_cpu::Displacement::Byte(
                    cinder_cpu::InstructionField::new(disp, 0, vec![disp as u8]),
                ),
                default_segment,
            };
            let offset = operand
                .effective_offset(&state, &bus, cinder_cpu::AddressSize::Bits16)
                .expect("16-bit EA never faults");
            assert!(offset <= 0xFFFF);
        }
    }
}
