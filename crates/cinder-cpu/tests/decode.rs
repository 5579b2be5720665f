use cinder_cpu::{
    decode_at, AddressSize, DecodeError, Displacement, Imm, MemoryBus, ModRmContext, Operation,
    RmTarget, SegmentedAddress, Width,
};
use cinder_cpu::state::seg;

fn decode(bytes: &[u8]) -> cinder_cpu::Instruction {
    let mut bus = MemoryBus::new();
    let address = SegmentedAddress::new(0x1000, 0x0200);
    bus.load(address.physical(), bytes);
    decode_at(&bus, address).expect("decode")
}

fn decode_err(bytes: &[u8]) -> DecodeError {
    let mut bus = MemoryBus::new();
    let address = SegmentedAddress::new(0x1000, 0x0200);
    bus.load(address.physical(), bytes);
    decode_at(&bus, address).expect_err("must not decode")
}

fn memory_target(modrm: &ModRmContext) -> &cinder_cpu::MemoryOperand {
    match &modrm.target {
        RmTarget::Memory(mem) => mem,
        RmTarget::Register(_) => panic!("expected a memory operand"),
    }
}

#[test]
fn register_form_alu_is_two_bytes() {
    // 01 D8: add ax, bx
    let ins = decode(&[0x01, 0xD8]);
    assert_eq!(ins.length, 2);
    assert!(matches!(
        ins.operation,
        Operation::AluRmReg {
            width: Width::Word,
            ..
        }
    ));
    let modrm = ins.modrm.as_ref().unwrap();
    assert_eq!(modrm.mode, 3);
    assert_eq!(modrm.reg, 3); // bx
    assert!(matches!(modrm.target, RmTarget::Register(0))); // ax
}

#[test]
fn prefixes_are_all_recorded() {
    // 26 66 67 F3 A5: es rep movsd with both size overrides
    let ins = decode(&[0x26, 0x66, 0x67, 0xF3, 0xA5]);
    assert_eq!(ins.prefixes.segment, Some(seg::ES));
    assert!(ins.prefixes.operand_size_override);
    assert!(ins.prefixes.address_size_override);
    assert!(ins.prefixes.rep.unwrap().continue_on_zf);
    assert_eq!(ins.length, 5);
    assert!(matches!(
        ins.operation,
        Operation::StringRun {
            width: Width::Dword,
            ..
        }
    ));
}

#[test]
fn displacement_bytes_keep_their_provenance() {
    // 8B 44 F0: mov ax, [si-0x10]
    let ins = decode(&[0x8B, 0x44, 0xF0]);
    let mem = memory_target(ins.modrm.as_ref().unwrap());
    let Displacement::Byte(disp) = &mem.displacement else {
        panic!("expected a disp8");
    };
    assert_eq!(disp.value, -0x10);
    // The displacement byte sits two bytes into the instruction.
    assert_eq!(disp.physical_address, ins.address.physical() + 2);
    assert_eq!(disp.expected_bytes, vec![0xF0]);
}

#[test]
fn direct_offset_form_has_no_base() {
    // 8B 1E 34 12: mov bx, [0x1234]
    let ins = decode(&[0x8B, 0x1E, 0x34, 0x12]);
    let mem = memory_target(ins.modrm.as_ref().unwrap());
    assert_eq!(mem.base, None);
    assert_eq!(mem.index, None);
    assert!(matches!(&mem.displacement, Displacement::Off16(f) if f.value == 0x1234));
    assert_eq!(ins.length, 4);
}

#[test]
fn bp_based_forms_default_to_ss() {
    // 8B 46 08: mov ax, [bp+8]
    let ins = decode(&[0x8B, 0x46, 0x08]);
    let mem = memory_target(ins.modrm.as_ref().unwrap());
    assert_eq!(mem.default_segment, seg::SS);

    // 8B 04: mov ax, [si]
    let ins = decode(&[0x8B, 0x04]);
    let mem = memory_target(ins.modrm.as_ref().unwrap());
    assert_eq!(mem.default_segment, seg::DS);
}

#[test]
fn sib_encodes_scaled_index() {
    // 67 8B 04 9F: mov ax, [edi + ebx*4] (32-bit address size)
    let ins = decode(&[0x67, 0x8B, 0x04, 0x9F]);
    let modrm = ins.modrm.as_ref().unwrap();
    assert_eq!(modrm.address_size, AddressSize::Bits32);
    let mem = memory_target(modrm);
    assert_eq!(mem.base, Some(7)); // edi
    assert_eq!(mem.index, Some(3)); // ebx
    assert_eq!(mem.scale, 4);
    assert_eq!(ins.length, 4);
}

#[test]
fn sib_with_no_base_takes_disp32() {
    // 67 8B 04 8D 78 56 00 00: mov ax, [ecx*4 + 0x5678]
    let ins = decode(&[0x67, 0x8B, 0x04, 0x8D, 0x78, 0x56, 0x00, 0x00]);
    let mem = memory_target(ins.modrm.as_ref().unwrap());
    assert_eq!(mem.base, None);
    assert_eq!(mem.index, Some(1)); // ecx
    assert_eq!(mem.scale, 4);
    assert!(matches!(&mem.displacement, Displacement::Off32(f) if f.value == 0x5678));
}

#[test]
fn esp_and_ebp_bases_default_to_ss() {
    // 67 8B 44 24 04: mov ax, [esp+4]
    let ins = decode(&[0x67, 0x8B, 0x44, 0x24, 0x04]);
    let mem = memory_target(ins.modrm.as_ref().unwrap());
    assert_eq!(mem.base, Some(4));
    assert_eq!(mem.default_segment, seg::SS);

    // 67 8B 45 04: mov ax, [ebp+4]
    let ins = decode(&[0x67, 0x8B, 0x45, 0x04]);
    let mem = memory_target(ins.modrm.as_ref().unwrap());
    assert_eq!(mem.base, Some(5));
    assert_eq!(mem.default_segment, seg::SS);
}

#[test]
fn group_opcode_selects_operation_by_reg() {
    // F7 F3: div bx
    let ins = decode(&[0xF7, 0xF3]);
    assert!(matches!(
        ins.operation,
        Operation::Group3 {
            op: cinder_cpu::Group3Op::Div,
            width: Width::Word,
        }
    ));

    // 83 C3 05: add bx, 5 (sign-extended imm8)
    let ins = decode(&[0x83, 0xC3, 0x05]);
    let Operation::AluRmImm {
        imm: Imm::I8(imm), ..
    } = &ins.operation
    else {
        panic!("expected the sign-extended immediate form");
    };
    assert_eq!(imm.value, 5);
}

#[test]
fn callback_extension_decodes_with_number() {
    // FE 38 42: host callback 0x42
    let ins = decode(&[0xFE, 0x38, 0x42]);
    assert_eq!(ins.length, 3);
    let Operation::Callback { number } = &ins.operation else {
        panic!("expected the callback extension");
    };
    assert_eq!(number.value, 0x42);
    // Real group-4 members still decode.
    let ins = decode(&[0xFE, 0xC0]); // inc al
    assert!(matches!(ins.operation, Operation::IncRm { width: Width::Byte }));
}

#[test]
fn invalid_and_unsupported_encodings_error() {
    assert!(matches!(
        decode_err(&[0xFF, 0xF8]), // FF /7 is reserved
        DecodeError::InvalidGroupEncoding { reg: 7, .. }
    ));
    assert!(matches!(
        decode_err(&[0xD8, 0xC0]), // x87 escape
        DecodeError::UnsupportedOpcode { opcode: 0xD8, .. }
    ));
    assert!(matches!(
        decode_err(&[0xFF, 0xEB]), // FF /5 with a register operand
        DecodeError::InvalidGroupEncoding { reg: 5, .. }
    ));
}

#[test]
fn two_byte_opcodes_carry_the_escape() {
    // 0F B6 C3: movzx ax, bl
    let ins = decode(&[0x0F, 0xB6, 0xC3]);
    assert_eq!(ins.opcode, 0x0FB6);
    assert!(matches!(
        ins.operation,
        Operation::MovzxRegRm {
            width: Width::Word,
            src: Width::Byte,
        }
    ));

    // 0F 84 10 00: je near +0x10
    let ins = decode(&[0x0F, 0x84, 0x10, 0x00]);
    assert_eq!(ins.length, 4);
    assert!(matches!(ins.operation, Operation::JccNear { .. }));
}

#[test]
fn far_immediates_split_offset_and_segment() {
    // 9A 10 00 00 20: call 2000:0010
    let ins = decode(&[0x9A, 0x10, 0x00, 0x00, 0x20]);
    let Operation::CallFar {
        target_offset,
        target_segment,
    } = &ins.operation
    else {
        panic!("expected a far call");
    };
    assert_eq!(target_offset.value, 0x0010);
    assert_eq!(target_segment.value, 0x2000);
    assert_eq!(ins.length, 5);
    assert_eq!(
        ins.next_in_memory_address(),
        SegmentedAddress::new(0x1000, 0x0205)
    );
}

#[test]
fn image_records_every_decoded_byte() {
    let bytes = [0x66, 0x81, 0xC0, 0x78, 0x56, 0x34, 0x12]; // add eax, 0x12345678
    let ins = decode(&bytes);
    assert_eq!(ins.image, bytes);
    assert_eq!(ins.length as usize, bytes.len());
    let Operation::AluRmImm {
        imm: Imm::U32(imm),
        width: Width::Dword,
        ..
    } = &ins.operation
    else {
        panic!("expected a dword immediate");
    };
    assert_eq!(imm.value, 0x1234_5678);
}
