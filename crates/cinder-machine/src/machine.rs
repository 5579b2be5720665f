//! The wired machine: CPU core, memory, port fabric, pacing, scheduling,
//! and the CFG run loop.
//!
//! One emulation thread runs `step → regulate → process_events` until HLT,
//! a stop request, or an unrecoverable fault. The CFG grows as execution
//! discovers targets; discriminated nodes and operand-field degradation
//! absorb self-modifying code.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;

use cinder_cpu::decode::decode_at;
use cinder_cpu::error::{DecodeError, Exception};
use cinder_cpu::exec::{execute, CallbackHandler, ExecutionHelper, PortIo};
use cinder_cpu::graph::{CfgNode, ControlFlowGraph, NodeId};
use cinder_cpu::interrupts;
use cinder_cpu::mem::MemoryBus;
use cinder_cpu::state::{CpuState, SegmentedAddress};
use cinder_io::{IoError, IoPortBus};
use cinder_time::HostClock;
use cinder_timers::{CycleLimiter, EventScheduler};

use crate::asm::{InterruptHandler, MemoryAsmWriter};
use crate::breakpoints::MemoryBreakpoints;
use crate::config::MachineConfig;

/// Host service invoked by the callback opcode. Runs as if it were the
/// body of the interrupt service the trampoline stands in for.
pub type CallbackFn = Rc<dyn Fn(&mut CpuState, &mut MemoryBus)>;

#[derive(Debug, Error)]
pub enum MachineError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Fault(#[from] Exception),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Continue,
    Halted,
}

/// Adapts the port fabric to the executor's I/O trait, translating the
/// unhandled-port error into the CPU-visible exception.
struct IoAdapter<'a> {
    bus: &'a mut IoPortBus,
}

fn io_fault(error: IoError) -> Exception {
    match error {
        IoError::UnhandledPort { port } => Exception::UnhandledIoPort { port },
    }
}

impl PortIo for IoAdapter<'_> {
    fn read8(&mut self, port: u16) -> Result<u8, Exception> {
        self.bus.read8(port).map_err(io_fault)
    }
    fn read16(&mut self, port: u16) -> Result<u16, Exception> {
        self.bus.read16(port).map_err(io_fault)
    }
    fn read32(&mut self, port: u16) -> Result<u32, Exception> {
        self.bus.read32(port).map_err(io_fault)
    }
    fn write8(&mut self, port: u16, value: u8) -> Result<(), Exception> {
        self.bus.write8(port, value).map_err(io_fault)
    }
    fn write16(&mut self, port: u16, value: u16) -> Result<(), Exception> {
        self.bus.write16(port, value).map_err(io_fault)
    }
    fn write32(&mut self, port: u16, value: u32) -> Result<(), Exception> {
        self.bus.write32(port, value).map_err(io_fault)
    }
}

struct CallbackRegistry<'a> {
    table: &'a HashMap<u8, CallbackFn>,
}

impl CallbackHandler for CallbackRegistry<'_> {
    fn run_callback(
        &mut self,
        number: u8,
        state: &mut CpuState,
        bus: &mut MemoryBus,
    ) -> Result<(), Exception> {
        match self.table.get(&number) {
            Some(callback) => {
                callback(state, bus);
                Ok(())
            }
            None => {
                tracing::warn!("callback {number:#04x} executed with no host handler");
                Ok(())
            }
        }
    }
}

pub struct Machine {
    pub state: CpuState,
    pub bus: MemoryBus,
    pub io: IoPortBus,
    pub limiter: CycleLimiter,
    pub scheduler: Rc<EventScheduler>,
    pub graph: ControlFlowGraph,
    current: Option<NodeId>,
    callbacks: HashMap<u8, CallbackFn>,
    callback_addresses: HashMap<u8, SegmentedAddress>,
    asm_cursor: SegmentedAddress,
    stop: Arc<AtomicBool>,
    eoi_handler: Option<Box<dyn FnMut(u8)>>,
}

impl Machine {
    pub fn new(config: &MachineConfig, clock: Arc<dyn HostClock>) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let limiter = CycleLimiter::new(clock, config.effective_cycles_per_ms(), stop.clone());
        let scheduler = Rc::new(EventScheduler::new(limiter.full_index_handle()));
        Self {
            state: CpuState::new(),
            bus: MemoryBus::new(),
            io: IoPortBus::new(config.fail_on_unhandled_port),
            limiter,
            scheduler,
            graph: ControlFlowGraph::new(),
            current: None,
            callbacks: HashMap::new(),
            callback_addresses: HashMap::new(),
            // Trampolines live in the BIOS segment by convention.
            asm_cursor: SegmentedAddress::new(0xF000, 0),
            stop,
            eoi_handler: None,
        }
    }

    /// Flag other threads flip to request a stop; the limiter's waiter
    /// polls it, so a wait in progress ends early.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    pub fn set_entry(&mut self, cs: u16, ip: u16) {
        self.state.set_segment(cinder_cpu::seg::CS, cs);
        self.state.ip = ip;
        self.current = None;
    }

    pub fn set_stack(&mut self, ss: u16, sp: u16) {
        self.state.set_segment(cinder_cpu::seg::SS, ss);
        self.state.set_reg16(cinder_cpu::reg::SP, sp);
    }

    pub fn install_memory_breakpoints(&mut self, breakpoints: Rc<RefCell<MemoryBreakpoints>>) {
        self.bus.install_monitor(breakpoints);
    }

    /// Reserve a callback trampoline (`FE /7 ib` + IRET) in emulated
    /// memory and register its host handler. Returns the entry address so
    /// callers can hang it off an interrupt vector.
    pub fn install_callback(&mut self, number: u8, callback: CallbackFn) -> SegmentedAddress {
        let mut writer = MemoryAsmWriter::new(&mut self.bus, self.asm_cursor);
        let entry = writer.get_current_address_copy();
        writer.write_callback(number);
        writer.write_iret();
        self.asm_cursor = writer.get_current_address_copy();
        self.callbacks.insert(number, callback);
        self.callback_addresses.insert(number, entry);
        entry
    }

    /// Install a callback and point interrupt `vector` at its trampoline.
    pub fn install_callback_vector(
        &mut self,
        vector: u8,
        number: u8,
        callback: CallbackFn,
    ) -> SegmentedAddress {
        let entry = self.install_callback(number, callback);
        interrupts::install_vector(&mut self.bus, vector, entry);
        entry
    }

    /// The installed callback sites, for hosts that enumerate them.
    pub fn callback_addresses(&self) -> &HashMap<u8, SegmentedAddress> {
        &self.callback_addresses
    }

    /// Let an interrupt service write its entry stub into RAM and wire the
    /// vector table to it.
    pub fn install_interrupt_handler(&mut self, handler: &mut dyn InterruptHandler) {
        let mut writer = MemoryAsmWriter::new(&mut self.bus, self.asm_cursor);
        let entry = handler.write_assembly_in_ram(&mut writer);
        self.asm_cursor = writer.get_current_address_copy();
        interrupts::install_vector(&mut self.bus, handler.vector_number(), entry);
    }

    /// Post-interrupt hook: hardware-interrupt services call this to
    /// acknowledge the interrupt controller (PIC EOI).
    pub fn set_eoi_handler(&mut self, handler: Box<dyn FnMut(u8)>) {
        self.eoi_handler = Some(handler);
    }

    pub fn end_of_interrupt(&mut self, irq: u8) {
        if let Some(handler) = &mut self.eoi_handler {
            handler(irq);
        }
    }

    pub fn pause(&mut self) {
        self.limiter.on_pause();
    }

    pub fn resume(&mut self) {
        self.limiter.on_resume();
    }

    /// Decode and lift the instruction at `address`, rendered as text.
    pub fn disassemble(&self, address: SegmentedAddress) -> Result<String, DecodeError> {
        let instruction = decode_at(&self.bus, address)?;
        let lifted = cinder_lift::lift(&instruction);
        Ok(cinder_lift::AstPrinter.print(&lifted))
    }

    fn ensure_node(&mut self, address: SegmentedAddress) -> Result<NodeId, MachineError> {
        if let Some(id) = self.graph.entry_at(address) {
            return Ok(id);
        }
        let instruction = decode_at(&self.bus, address)?;
        Ok(self.graph.add_instruction(instruction))
    }

    /// Resolve the node to execute for the current `(cs, ip)`: walk
    /// discriminated choosers against live memory, re-decoding when the
    /// graph turns out to be stale, then absorb self-modified operands.
    fn resolve_instruction(&mut self, address: SegmentedAddress) -> Result<NodeId, MachineError> {
        let mut node_id = match self.current {
            Some(id) => id,
            None => self.ensure_node(address)?,
        };

        loop {
            let selected = match self.graph.node(node_id) {
                CfgNode::Discriminated(node) => node.select(&self.bus),
                CfgNode::Instruction(_) => break,
            };
            match selected {
                Some(next) => node_id = next,
                None => {
                    // The graph does not know what the bytes mean now.
                    let instruction = decode_at(&self.bus, address)?;
                    let discriminator = instruction.discriminator();
                    let new_id = self.graph.add_instruction_detached(instruction);
                    if let CfgNode::Discriminated(node) = self.graph.node_mut(node_id) {
                        node.add(discriminator, new_id);
                    }
                    node_id = new_id;
                }
            }
        }

        let matches = self
            .graph
            .instruction(node_id)
            .map(|instruction| instruction.matches_memory(&self.bus))
            .unwrap_or(true);
        if !matches {
            let rescued = self
                .graph
                .instruction_mut(node_id)
                .map(|instruction| instruction.degrade_changed_operands(&self.bus))
                .unwrap_or(true);
            if !rescued {
                // Fixed bytes changed: fork through a discriminated node
                // keeping the old decoding reachable, and decode the new
                // bytes beside it.
                let fork = self.graph.fork_at(address);
                let instruction = decode_at(&self.bus, address)?;
                let discriminator = instruction.discriminator();
                let new_id = self.graph.add_instruction_detached(instruction);
                if let CfgNode::Discriminated(node) = self.graph.node_mut(fork) {
                    node.add(discriminator, new_id);
                }
                node_id = new_id;
            }
        }
        Ok(node_id)
    }

    /// Execute one instruction, growing the CFG as needed.
    pub fn step(&mut self) -> Result<StepOutcome, MachineError> {
        if self.stop.load(Ordering::Relaxed) {
            self.state.is_running = false;
            return Ok(StepOutcome::Halted);
        }

        let address = self.state.cs_ip();
        let node_id = self.resolve_instruction(address)?;

        let (exec_result, io_delay) = {
            let instruction = self
                .graph
                .instruction(node_id)
                .expect("resolved node is an instruction");
            let mut io = IoAdapter { bus: &mut self.io };
            let mut callbacks = CallbackRegistry {
                table: &self.callbacks,
            };
            let mut helper = ExecutionHelper {
                state: &mut self.state,
                bus: &mut self.bus,
                io: &mut io,
                callbacks: &mut callbacks,
                io_delay_cycles: 0,
            };
            let result = execute(&mut helper, instruction);
            let io_delay = helper.io_delay_cycles;
            (result, io_delay)
        };

        if io_delay > 0 {
            self.limiter.consume_io_cycles(io_delay, self.state.cycles);
        }

        match exec_result {
            Err(fault) => {
                self.state.is_running = false;
                Err(MachineError::Fault(fault))
            }
            Ok(Some(next)) => {
                self.current = Some(next);
                Ok(StepOutcome::Continue)
            }
            Ok(None) => {
                if !self.state.is_running {
                    self.current = None;
                    return Ok(StepOutcome::Halted);
                }
                // The graph does not know the successor: find or decode
                // it, then link it so the next visit is a map lookup.
                let next_address = self.state.cs_ip();
                let next_id = self.ensure_node(next_address)?;
                self.graph.link(node_id, next_address, next_id);
                self.current = Some(next_id);
                Ok(StepOutcome::Continue)
            }
        }
    }

    /// The emulation loop: execute, pace, fire due events. Ends on HLT,
    /// an external stop, or an unrecoverable error.
    pub fn run(&mut self) -> Result<(), MachineError> {
        while self.state.is_running {
            let outcome = match self.step() {
                Ok(outcome) => outcome,
                Err(error) => {
                    self.state.is_running = false;
                    tracing::error!(
                        "unrecoverable at {}: {error}; {}",
                        self.state.cs_ip(),
                        self.state
                    );
                    return Err(error);
                }
            };

            self.limiter.regulate(self.state.cycles);
            self.limiter.publish_full_index(self.state.cycles);
            self.scheduler.process_events();

            if outcome == StepOutcome::Halted {
                break;
            }
        }
        Ok(())
    }
}
