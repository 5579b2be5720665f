//! Decode real byte sequences and check their lifted, printed form.

use cinder_cpu::{decode_at, MemoryBus, SegmentedAddress};
use cinder_lift::{lift, AstNode, AstPrinter};

fn lift_bytes(bytes: &[u8]) -> AstNode {
    let mut bus = MemoryBus::new();
    let address = SegmentedAddress::new(0x1000, 0x0100);
    bus.load(address.physical(), bytes);
    let instruction = decode_at(&bus, address).expect("decode");
    lift(&instruction)
}

fn print_bytes(bytes: &[u8]) -> String {
    AstPrinter.print(&lift_bytes(bytes))
}

#[test]
fn every_lifted_block_ends_with_the_ip_move() {
    let block = lift_bytes(&[0x01, 0xD8]); // add ax, bx
    let AstNode::Block { statements } = &block else {
        panic!("lift must produce a block");
    };
    assert_eq!(statements.len(), 2);
    assert!(matches!(statements[1], AstNode::MoveIpNext { .. }));
    // add ax, bx is 2 bytes from 0x0100.
    assert_eq!(
        AstPrinter.print(&statements[1]),
        "ip = 0x102"
    );
}

#[test]
fn alu_and_mov_forms_render_as_assembly() {
    assert_eq!(print_bytes(&[0x01, 0xD8]), "add ax, bx; ip = 0x102");
    assert_eq!(
        print_bytes(&[0xB8, 0x34, 0x12]),
        "mov ax, 0x1234; ip = 0x103"
    );
    assert_eq!(
        print_bytes(&[0x83, 0xC3, 0x05]),
        "add bx, 0x5; ip = 0x103"
    );
    assert_eq!(print_bytes(&[0xF7, 0xF3]), "div bx; ip = 0x102");
}

#[test]
fn memory_operands_show_segment_rules() {
    // Default segment: omitted.
    assert_eq!(
        print_bytes(&[0x8B, 0x00]), // mov ax, [bx+si]
        "mov ax, [(bx + si)]; ip = 0x102"
    );
    // BP-based forms default to SS, still the implied segment.
    assert_eq!(
        print_bytes(&[0x8B, 0x46, 0x08]), // mov ax, [bp+8]
        "mov ax, [(bp + 0x8)]; ip = 0x103"
    );
    // An override prefix shows up.
    assert_eq!(
        print_bytes(&[0x26, 0x8B, 0x07]), // mov ax, es:[bx]
        "mov ax, es:[bx]; ip = 0x103"
    );
}

#[test]
fn negative_displacements_print_signed() {
    assert_eq!(
        print_bytes(&[0x8B, 0x44, 0xF0]), // mov ax, [si-0x10]
        "mov ax, [(si + -0x10)]; ip = 0x103"
    );
}

#[test]
fn branches_render_resolved_targets() {
    // jmp short +0x10 from 0x0100, 2 bytes long.
    assert_eq!(print_bytes(&[0xEB, 0x10]), "jmp 0x112; ip = 0x102");
    // je -2 (tight loop on itself).
    assert_eq!(print_bytes(&[0x74, 0xFE]), "je 0x100; ip = 0x102");
    // call 2000:0010.
    assert_eq!(
        print_bytes(&[0x9A, 0x10, 0x00, 0x00, 0x20]),
        "call 2000:0010; ip = 0x105"
    );
}

#[test]
fn string_ops_carry_their_rep_kind() {
    assert_eq!(print_bytes(&[0xF3, 0xA4]), "rep movsb; ip = 0x102");
    assert_eq!(print_bytes(&[0xF3, 0xA6]), "repe cmpsb; ip = 0x102");
    assert_eq!(print_bytes(&[0xF2, 0xAE]), "repne scasb; ip = 0x102");
    assert_eq!(print_bytes(&[0xAB]), "stosw; ip = 0x101");
}

#[test]
fn degraded_operand_lifts_to_an_absolute_pointer() {
    let mut bus = MemoryBus::new();
    let address = SegmentedAddress::new(0x1000, 0x0100);
    bus.load(address.physical(), &[0xB8, 0x34, 0x12]); // mov ax, 0x1234
    let mut instruction = decode_at(&bus, address).expect("decode");

    // Simulate the executor detecting a self-modified immediate.
    bus.write_u16(address.physical() + 1, 0xBEEF);
    assert!(instruction.degrade_changed_operands(&bus));

    let printed = AstPrinter.print(&lift(&instruction));
    assert_eq!(printed, "mov ax, mem16[0x10101]; ip = 0x103");
}

#[test]
fn callback_extension_lifts_by_number() {
    assert_eq!(print_bytes(&[0xFE, 0x38, 0x42]), "callback 0x42; ip = 0x103");
}
