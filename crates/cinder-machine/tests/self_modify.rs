//! Self-modifying code through the CFG: operand rewrites degrade fields
//! in place, opcode rewrites fork the graph behind a discriminated node.

use std::sync::Arc;

use cinder_cpu::state::{reg, SegmentedAddress};
use cinder_cpu::CfgNode;
use cinder_machine::{Machine, MachineConfig, StepOutcome};
use cinder_time::FakeHostClock;

fn machine() -> Machine {
    let clock = Arc::new(FakeHostClock::new(0));
    let mut machine = Machine::new(&MachineConfig::default(), clock);
    machine.set_entry(0x0000, 0x0100);
    machine.set_stack(0x8000, 0xFFFE);
    machine
}

#[test]
fn rewritten_immediate_degrades_the_field_and_reuses_the_node() {
    let mut machine = machine();
    machine.bus.load(
        0x100,
        &[
            0xB8, 0x11, 0x11, // 0100: mov ax, 0x1111
            0xC6, 0x06, 0x01, 0x01, 0x22, // 0103: mov byte [0x0101], 0x22
            0xEB, 0xF6, // 0108: jmp 0x0100
        ],
    );

    // mov, store, jmp: back at 0100 with the immediate's low byte changed.
    for _ in 0..3 {
        assert_eq!(machine.step().expect("step"), StepOutcome::Continue);
    }
    assert_eq!(machine.state.reg16(reg::AX), 0x1111);
    assert_eq!(machine.state.cs_ip(), SegmentedAddress::new(0, 0x100));

    machine.step().expect("step");
    assert_eq!(machine.state.reg16(reg::AX), 0x1122);

    // Same node, degraded operand: the entry is still an instruction, not
    // a discriminated fork.
    let node = machine.graph.entry_at(SegmentedAddress::new(0, 0x100)).unwrap();
    let CfgNode::Instruction(instruction) = machine.graph.node(node) else {
        panic!("operand rewrite must not fork the graph");
    };
    assert!(instruction.matches_memory(&machine.bus));
    assert_eq!(
        instruction.discriminator().bytes,
        vec![Some(0xB8), None, None]
    );
}

#[test]
fn rewritten_opcode_forks_into_a_discriminated_node() {
    let mut machine = machine();
    machine.bus.load(0x100, &[0xB8, 0x34, 0x12, 0xF4]); // mov ax, 0x1234 ; hlt

    machine.step().expect("step");
    assert_eq!(machine.state.reg16(reg::AX), 0x1234);

    // Rewrite the opcode itself: 40 = inc ax. The old node cannot absorb
    // this, so the next visit forks.
    machine.bus.write_u8(0x100, 0x40);
    machine.set_entry(0x0000, 0x0100);
    machine.state.set_reg16(reg::AX, 0);

    machine.step().expect("step");
    assert_eq!(machine.state.reg16(reg::AX), 1);
    assert_eq!(machine.state.ip, 0x101);

    let entry = machine.graph.entry_at(SegmentedAddress::new(0, 0x100)).unwrap();
    let CfgNode::Discriminated(fork) = machine.graph.node(entry) else {
        panic!("opcode rewrite must fork through a discriminated node");
    };
    assert_eq!(fork.successors_per_discriminator.len(), 2);

    // Restoring the original bytes routes back to the original decoding.
    machine.bus.write_u8(0x100, 0xB8);
    machine.set_entry(0x0000, 0x0100);
    machine.step().expect("step");
    assert_eq!(machine.state.reg16(reg::AX), 0x1234);
    assert_eq!(machine.state.ip, 0x103);
}

#[test]
fn discriminated_node_with_no_match_redecodes_live_bytes() {
    let mut machine = machine();
    machine.bus.load(0x100, &[0xB8, 0x34, 0x12, 0xF4]);

    machine.step().expect("step");
    machine.bus.write_u8(0x100, 0x40); // inc ax
    machine.set_entry(0x0000, 0x0100);
    machine.step().expect("step");

    // A third byte pattern at the same address: neither registered
    // discriminator matches, so the machine decodes the live bytes and
    // extends the fork.
    machine.bus.write_u8(0x100, 0x48); // dec ax
    machine.set_entry(0x0000, 0x0100);
    machine.state.set_reg16(reg::AX, 7);
    machine.step().expect("step");
    assert_eq!(machine.state.reg16(reg::AX), 6);

    let entry = machine.graph.entry_at(SegmentedAddress::new(0, 0x100)).unwrap();
    let CfgNode::Discriminated(fork) = machine.graph.node(entry) else {
        panic!("expected the discriminated fork to persist");
    };
    assert_eq!(fork.successors_per_discriminator.len(), 3);
}

#[test]
fn successors_are_linked_once_and_reused() {
    let mut machine = machine();
    machine.bus.load(
        0x100,
        &[
            0x40, // inc ax
            0x40, // inc ax
            0xEB, 0xFC, // jmp 0x0100
        ],
    );

    for _ in 0..9 {
        machine.step().expect("step");
    }
    // Three instructions looped three times: the graph holds exactly
    // three nodes, everything else was successor-map hits.
    assert_eq!(machine.graph.len(), 3);
    assert_eq!(machine.state.reg16(reg::AX), 6);
}
