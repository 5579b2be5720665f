//! The control-flow graph the executor traverses.
//!
//! Nodes are decoded instructions or discriminated branch points; the
//! graph owns them, the executor only borrows while visiting. New nodes
//! are linked in as targets are discovered at run time.

use std::collections::HashMap;

use crate::inst::{Discriminator, Instruction};
use crate::mem::MemoryBus;
use crate::state::SegmentedAddress;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub u32);

/// A successor chooser: byte patterns tried in registration order against
/// the live memory at this address; the first match wins. No match means
/// the graph is stale and the caller must re-decode.
#[derive(Debug, Clone)]
pub struct DiscriminatedNode {
    pub address: SegmentedAddress,
    pub successors_per_discriminator: Vec<(Discriminator, NodeId)>,
}

impl DiscriminatedNode {
    pub fn new(address: SegmentedAddress) -> Self {
        Self {
            address,
            successors_per_discriminator: Vec::new(),
        }
    }

    pub fn add(&mut self, discriminator: Discriminator, node: NodeId) {
        self.successors_per_discriminator.push((discriminator, node));
    }

    pub fn select(&self, bus: &MemoryBus) -> Option<NodeId> {
        let physical = self.address.physical();
        self.successors_per_discriminator
            .iter()
            .find(|(discriminator, _)| discriminator.matches(bus, physical))
            .map(|&(_, node)| node)
    }
}

#[derive(Debug, Clone)]
pub enum CfgNode {
    Instruction(Instruction),
    Discriminated(DiscriminatedNode),
}

#[derive(Debug, Default)]
pub struct ControlFlowGraph {
    nodes: Vec<CfgNode>,
    entry_points: HashMap<SegmentedAddress, NodeId>,
}

impl ControlFlowGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn add_instruction(&mut self, instruction: Instruction) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.entry_points.insert(instruction.address, id);
        self.nodes.push(CfgNode::Instruction(instruction));
        id
    }

    /// Add an instruction without registering it as the entry for its
    /// address, for when the address is already fronted by a
    /// discriminated chooser.
    pub fn add_instruction_detached(&mut self, instruction: Instruction) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(CfgNode::Instruction(instruction));
        id
    }

    pub fn add_discriminated(&mut self, node: DiscriminatedNode) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.entry_points.insert(node.address, id);
        self.nodes.push(CfgNode::Discriminated(node));
        id
    }

    pub fn node(&self, id: NodeId) -> &CfgNode {
        &self.nodes[id.0 as usize]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut CfgNode {
        &mut self.nodes[id.0 as usize]
    }

    pub fn instruction(&self, id: NodeId) -> Option<&Instruction> {
        match self.node(id) {
            CfgNode::Instruction(instruction) => Some(instruction),
            CfgNode::Discriminated(_) => None,
        }
    }

    pub fn instruction_mut(&mut self, id: NodeId) -> Option<&mut Instruction> {
        match self.node_mut(id) {
            CfgNode::Instruction(instruction) => Some(instruction),
            CfgNode::Discriminated(_) => None,
        }
    }

    /// Node registered for `address`, if any.
    pub fn entry_at(&self, address: SegmentedAddress) -> Option<NodeId> {
        self.entry_points.get(&address).copied()
    }

    /// Record that executing `from` with a post-execution address of `at`
    /// continues at `to`.
    pub fn link(&mut self, from: NodeId, at: SegmentedAddress, to: NodeId) {
        if let Some(instruction) = self.instruction_mut(from) {
            instruction.successors_per_address.insert(at, to);
        }
    }

    /// Replace the node registered at `address` with a discriminated
    /// chooser, keeping the old node reachable behind its discriminator.
    pub fn fork_at(&mut self, address: SegmentedAddress) -> NodeId {
        let old = self.entry_at(address);
        let mut node = DiscriminatedNode::new(address);
        if let Some(old_id) = old {
            if let Some(instruction) = self.instruction(old_id) {
                node.add(instruction.discriminator(), old_id);
            }
        }
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(CfgNode::Discriminated(node));
        self.entry_points.insert(address, id);
        id
    }
}
