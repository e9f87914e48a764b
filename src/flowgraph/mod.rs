//======---------------------------------------------------------------======//
//                                                                           //
// Copyright 2022 Evan Cox <evanacox00@gmail.com>. All rights reserved.      //
//                                                                           //
// Use of this source code is governed by a BSD-style license that can be    //
// found in the LICENSE.txt file at the root of this project, or at the      //
// following link: https://opensource.org/licenses/BSD-3-Clause              //
//                                                                           //
//======---------------------------------------------------------------======//

//! The control-flow graph of a kernel.
//!
//! A [`FlowGraph`] owns every basic block of a kernel, the per-subroutine
//! call-graph nodes ([`FuncInfo`]), and the structural information that
//! the allocator needs: dominators, natural loops, loop depth and the set
//! of declares that are referenced across block boundaries.
//!
//! Subroutines are part of the same graph. A block ending in `call` has an
//! edge to the callee's INIT block, and the callee's EXIT block has an edge
//! to every block that a call to it returns to. Dominators and loops are
//! computed per function on the *local* view of the graph, where a call
//! block flows straight into its return block.

mod construct;
mod dominators;
mod globals;
mod loops;

pub use loops::NaturalLoop;

use crate::arena::{ArenaKey, ArenaMap, SecondaryMap, SecondarySet};
use crate::dense_arena_key;
use crate::ir::{Declare, Inst, Label};
use crate::utility::{PackedOption, SaHashSet};
use bitflags::bitflags;
use log::debug;
use smallvec::SmallVec;

#[cfg(feature = "enable-serde")]
use serde::{Deserialize, Serialize};

dense_arena_key! {
    /// A reference to a basic block in a [`FlowGraph`].
    pub struct Block;

    /// A reference to a function (the kernel itself or a subroutine).
    pub struct FuncId;
}

bitflags! {
    /// The call-graph role flags of a block.
    #[derive(Default)]
    #[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
    pub struct BlockKind: u8 {
        /// The block ends in a `call`.
        const CALL = 1;
        /// The block is where a `call` returns to.
        const RETURN = 2;
        /// The block is the first block of a function.
        const INIT = 4;
        /// The block is the last block of a function.
        const EXIT = 8;
    }
}

/// What function a block is associated with, based on its [`BlockKind`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub enum BlockRole {
    /// An ordinary block.
    None,
    /// A CALL block, holding the function being called.
    Callee(FuncId),
    /// An INIT/EXIT block, holding the function it belongs to.
    Owner(FuncId),
}

/// A basic block.
#[derive(Clone, Debug)]
pub struct BasicBlockData {
    /// Instructions in execution order.
    pub insts: Vec<Inst>,
    /// Predecessors.
    pub preds: SmallVec<[Block; 4]>,
    /// Successors. The fall-through successor, if there is one, is first.
    pub succs: SmallVec<[Block; 2]>,
    /// Dense id in layout order.
    pub id: u32,
    /// Preorder number, `u32::MAX` if unreachable.
    pub pre_id: u32,
    /// Reverse-postorder number, `u32::MAX` if unreachable.
    pub rpost_id: u32,
    /// Call-graph flags.
    pub kind: BlockKind,
    /// Function association, see [`BlockRole`].
    pub role: BlockRole,
    /// The block before this one in the final layout.
    pub phys_pred: PackedOption<Block>,
    /// The block after this one in the final layout.
    pub phys_succ: PackedOption<Block>,
    /// Whether the block runs under divergent SIMD control flow.
    pub in_simd_flow: bool,
    /// Whether the block contains a send.
    pub has_send: bool,
    /// The label that starts this block, if any.
    pub label: Option<Label>,
}

impl BasicBlockData {
    fn new() -> Self {
        Self {
            insts: Vec::new(),
            preds: SmallVec::new(),
            succs: SmallVec::new(),
            id: u32::MAX,
            pre_id: u32::MAX,
            rpost_id: u32::MAX,
            kind: BlockKind::empty(),
            role: BlockRole::None,
            phys_pred: PackedOption::none(),
            phys_succ: PackedOption::none(),
            in_simd_flow: false,
            has_send: false,
            label: None,
        }
    }

    /// The number of instructions in the block.
    pub fn len(&self) -> usize {
        self.insts.len()
    }

    /// Whether the block has no instructions.
    pub fn is_empty(&self) -> bool {
        self.insts.is_empty()
    }

    /// The last instruction.
    #[inline]
    pub fn last(&self) -> Option<Inst> {
        self.insts.last().copied()
    }

    /// Whether the block has the CALL flag.
    #[inline]
    pub fn is_call(&self) -> bool {
        self.kind.contains(BlockKind::CALL)
    }

    /// Whether the block has the RETURN flag.
    #[inline]
    pub fn is_return(&self) -> bool {
        self.kind.contains(BlockKind::RETURN)
    }
}

/// A node in the call graph.
#[derive(Clone, Debug)]
pub struct FuncInfo {
    /// First block of the function.
    pub init: Block,
    /// Last block of the function (the one ending in `ret` or EOT).
    pub exit: Block,
    /// Number of call sites.
    pub call_count: u32,
    /// Every function called from this one, without duplicates.
    pub callees: SmallVec<[FuncId; 4]>,
    /// DFS preorder number in the call graph.
    pub pre_id: u32,
    /// DFS postorder number in the call graph.
    pub post_id: u32,
    /// Every block of the function, in layout order.
    pub blocks: Vec<Block>,
    /// The label that the function starts at, `None` for the kernel.
    pub label: Option<Label>,
}

/// Owns the basic blocks of a kernel and everything derived from their
/// structure.
#[derive(Clone, Debug, Default)]
pub struct FlowGraph {
    /// Every block ever created.
    pub blocks: ArenaMap<Block, BasicBlockData>,
    /// The blocks that are part of the kernel, in layout order.
    pub order: Vec<Block>,
    /// Every function, the kernel is the first one.
    pub funcs: ArenaMap<FuncId, FuncInfo>,
    /// Functions in call-graph postorder (callees before callers).
    pub sorted_funcs: Vec<FuncId>,
    entry: Option<Block>,
    idoms: SecondaryMap<Block, Block>,
    back_edges: Vec<(Block, Block)>,
    loops: Vec<NaturalLoop>,
    loop_depth: SecondaryMap<Block, u32>,
    global_opnds: SaHashSet<Declare>,
}

impl FlowGraph {
    /// Creates an empty flow graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// The entry block of the kernel. Panics if the graph is empty.
    pub fn entry(&self) -> Block {
        match self.entry {
            Some(b) => b,
            None => panic!("flow graph has not been constructed"),
        }
    }

    /// The kernel's own [`FuncId`].
    pub fn kernel_func(&self) -> FuncId {
        FuncId::new(0)
    }

    /// Number of blocks in the layout.
    #[inline]
    pub fn num_blocks(&self) -> usize {
        self.order.len()
    }

    /// Successors of a block.
    #[inline]
    pub fn succs(&self, block: Block) -> &[Block] {
        &self.blocks[block].succs
    }

    /// Predecessors of a block.
    #[inline]
    pub fn preds(&self, block: Block) -> &[Block] {
        &self.blocks[block].preds
    }

    /// The function a CALL block calls.
    pub fn callee_of(&self, block: Block) -> Option<FuncId> {
        match self.blocks[block].role {
            BlockRole::Callee(f) => Some(f),
            _ => None,
        }
    }

    /// The RETURN block that a CALL block returns to.
    pub fn return_block_of(&self, call: Block) -> Block {
        assert!(self.blocks[call].is_call(), "{call:?} is not a call block");

        match self.blocks[call].phys_succ.expand() {
            Some(ret) if self.blocks[ret].is_return() => ret,
            _ => panic!("call block {call:?} has no return block"),
        }
    }

    /// The CALL block that a RETURN block is returned to from.
    pub fn call_block_of(&self, ret: Block) -> Block {
        assert!(self.blocks[ret].is_return(), "{ret:?} is not a return block");

        match self.blocks[ret].phys_pred.expand() {
            Some(call) if self.blocks[call].is_call() => call,
            _ => panic!("return block {ret:?} has no call block"),
        }
    }

    /// Creates a new, empty block that is not yet part of the layout.
    pub fn create_new_bb(&mut self) -> Block {
        self.blocks.insert(BasicBlockData::new())
    }

    /// Places `block` in the layout right after `after`.
    pub fn insert_after(&mut self, after: Block, block: Block) {
        let pos = self.layout_pos(after);

        self.order.insert(pos + 1, block);
        self.relink_layout();
    }

    /// Adds the edge `pred -> succ` to both lists.
    pub fn add_pred_succ_edges(&mut self, pred: Block, succ: Block) {
        debug_assert!(
            !self.blocks[pred].succs.contains(&succ),
            "duplicate edge {pred:?} -> {succ:?}"
        );

        self.blocks[pred].succs.push(succ);
        self.blocks[succ].preds.push(pred);
    }

    /// Adds the edge `pred -> succ` unless it already exists. Returns
    /// whether the edge was added.
    pub fn add_unique_pred_succ_edges(&mut self, pred: Block, succ: Block) -> bool {
        if self.blocks[pred].succs.contains(&succ) {
            return false;
        }

        self.add_pred_succ_edges(pred, succ);
        true
    }

    /// Removes the edge `pred -> succ` from both lists. Returns whether
    /// the edge existed.
    pub fn remove_pred_succ_edges(&mut self, pred: Block, succ: Block) -> bool {
        let succs = &mut self.blocks[pred].succs;
        let Some(i) = succs.iter().position(|b| *b == succ) else {
            return false;
        };

        succs.remove(i);

        let preds = &mut self.blocks[succ].preds;

        match preds.iter().position(|b| *b == pred) {
            Some(j) => {
                preds.remove(j);
            }
            None => panic!("edge {pred:?} -> {succ:?} is not symmetric"),
        }

        true
    }

    /// Reassigns `id` densely in layout order, and recomputes preorder and
    /// reverse-postorder numbers.
    pub fn reassign_block_ids(&mut self) {
        for (i, &block) in self.order.iter().enumerate() {
            self.blocks[block].id = i as u32;
        }

        self.compute_traversal_ids();
    }

    /// Every block reachable from the entry, following all edges.
    pub fn reachable(&self) -> SecondarySet<Block> {
        let mut seen = SecondarySet::with_primary(&self.blocks);
        let mut stack = vec![self.entry()];

        while let Some(block) = stack.pop() {
            if seen.insert(block) {
                continue;
            }

            stack.extend(self.succs(block).iter().copied());
        }

        seen
    }

    /// Drops every block that cannot be reached from the entry. Returns
    /// the number of blocks removed.
    pub fn remove_unreachable_blocks(&mut self) -> usize {
        let reachable = self.reachable();
        let dead: Vec<Block> = self
            .order
            .iter()
            .copied()
            .filter(|b| !reachable.contains(*b))
            .collect();

        for &block in dead.iter() {
            self.unlink_block(block);
        }

        if !dead.is_empty() {
            debug!("removed {} unreachable blocks", dead.len());
            self.after_layout_change();
        }

        dead.len()
    }

    /// Removes blocks with no instructions that only fall through, wiring
    /// their predecessors to their successor. Blocks with a call-graph role
    /// and the entry are kept. Returns the number of blocks removed.
    pub fn remove_empty_blocks(&mut self) -> usize {
        let candidates: Vec<Block> = self
            .order
            .iter()
            .copied()
            .filter(|&b| {
                let data = &self.blocks[b];

                data.insts.is_empty()
                    && data.kind.is_empty()
                    && data.succs.len() == 1
                    && data.succs[0] != b
                    && Some(b) != self.entry
            })
            .collect();

        for &block in candidates.iter() {
            let succ = self.blocks[block].succs[0];
            let preds = self.blocks[block].preds.clone();

            for pred in preds {
                // keep the position so that fall-through stays first
                let pos = self.blocks[pred]
                    .succs
                    .iter()
                    .position(|s| *s == block)
                    .unwrap_or_else(|| panic!("edge {pred:?} -> {block:?} is not symmetric"));

                if self.blocks[pred].succs.contains(&succ) {
                    self.blocks[pred].succs.remove(pos);
                } else {
                    self.blocks[pred].succs[pos] = succ;
                    self.blocks[succ].preds.push(pred);
                }
            }

            self.blocks[block].preds.clear();
            self.unlink_block(block);
        }

        if !candidates.is_empty() {
            debug!("removed {} empty blocks", candidates.len());
            self.after_layout_change();
        }

        candidates.len()
    }

    /// Natural loops, one per back edge.
    pub fn loops(&self) -> &[NaturalLoop] {
        &self.loops
    }

    /// Back edges `(tail, head)`.
    pub fn back_edges(&self) -> &[(Block, Block)] {
        &self.back_edges
    }

    /// Whether `decl` is referenced by more than one block, or read in a
    /// block before that block fully defines it.
    #[inline]
    pub fn is_global_operand(&self, decl: Declare) -> bool {
        self.global_opnds.contains(&decl)
    }

    fn layout_pos(&self, block: Block) -> usize {
        match self.order.iter().position(|b| *b == block) {
            Some(pos) => pos,
            None => panic!("{block:?} is not in the layout"),
        }
    }

    fn unlink_block(&mut self, block: Block) {
        let succs = self.blocks[block].succs.clone();

        for succ in succs {
            self.remove_pred_succ_edges(block, succ);
        }

        let preds = self.blocks[block].preds.clone();

        for pred in preds {
            self.remove_pred_succ_edges(pred, block);
        }

        self.order.retain(|b| *b != block);

        for func in self.funcs.values_mut() {
            func.blocks.retain(|b| *b != block);
        }
    }

    fn relink_layout(&mut self) {
        let mut prev: Option<Block> = None;

        for &block in self.order.iter() {
            self.blocks[block].phys_pred = prev.into();

            if let Some(p) = prev {
                self.blocks[p].phys_succ = PackedOption::some(block);
            }

            prev = Some(block);
        }

        if let Some(last) = prev {
            self.blocks[last].phys_succ = PackedOption::none();
        }
    }

    fn after_layout_change(&mut self) {
        self.relink_layout();
        self.reassign_block_ids();
        self.compute_dominators();
        self.find_natural_loops();
    }

    // preorder and reverse postorder over every edge, starting at the entry
    fn compute_traversal_ids(&mut self) {
        for &block in self.order.iter() {
            self.blocks[block].pre_id = u32::MAX;
            self.blocks[block].rpost_id = u32::MAX;
        }

        let Some(entry) = self.entry else {
            return;
        };

        let mut seen = SecondarySet::with_primary(&self.blocks);
        let mut postorder = Vec::with_capacity(self.order.len());
        let mut pre = 0;
        let mut stack = vec![(entry, 0usize)];

        seen.insert(entry);
        self.blocks[entry].pre_id = pre;
        pre += 1;

        while let Some((block, next)) = stack.last_mut() {
            let block = *block;

            if let Some(&succ) = self.blocks[block].succs.get(*next) {
                *next += 1;

                if !seen.insert(succ) {
                    self.blocks[succ].pre_id = pre;
                    pre += 1;
                    stack.push((succ, 0));
                }
            } else {
                postorder.push(block);
                stack.pop();
            }
        }

        for (i, block) in postorder.into_iter().rev().enumerate() {
            self.blocks[block].rpost_id = i as u32;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::*;
    use crate::testing::*;

    #[test]
    fn edges_are_symmetric() {
        let mut fg = FlowGraph::new();
        let a = fg.create_new_bb();
        let b = fg.create_new_bb();

        fg.add_pred_succ_edges(a, b);
        assert!(!fg.add_unique_pred_succ_edges(a, b));
        assert_eq!(fg.preds(b), &[a]);

        assert!(fg.remove_pred_succ_edges(a, b));
        assert!(!fg.remove_pred_succ_edges(a, b));
        assert!(fg.succs(a).is_empty());
        assert!(fg.preds(b).is_empty());
    }

    #[test]
    fn unreachable_blocks_are_removed() {
        let mut k = kernel();
        let v1 = k.create_decl(DeclareData::grf("V1", ElemType::D, 8));
        let end = k.create_label("end", false);
        let mut b = Builder::new(&mut k);

        b.jmpi(end, None);
        b.mov(8, v1, Operand::imm(1, ElemType::D));
        b.label(end);
        b.eot();

        k.build_flowgraph();

        assert_eq!(k.fg.num_blocks(), 3);
        assert_eq!(k.fg.remove_unreachable_blocks(), 1);
        assert_eq!(k.fg.num_blocks(), 2);

        let entry = k.fg.entry();
        let last = k.fg.order[1];

        assert_eq!(k.fg.succs(entry), &[last]);
        assert_eq!(k.fg.blocks[last].id, 1);
        assert_eq!(k.fg.blocks[entry].phys_succ.expand(), Some(last));
    }

    #[test]
    fn empty_blocks_are_bypassed() {
        let mut k = kernel();
        let v1 = k.create_decl(DeclareData::grf("V1", ElemType::D, 8));
        let next = k.create_label("next", false);
        let mut b = Builder::new(&mut k);

        b.mov(8, v1, Operand::imm(1, ElemType::D));
        b.label(next);
        b.mov(8, v1, Operand::imm(2, ElemType::D));
        b.eot();

        k.build_flowgraph();

        let [first, second] = k.fg.order[..] else {
            panic!("expected two blocks");
        };

        // route first -> second through a new empty block
        let empty = k.fg.create_new_bb();

        k.fg.insert_after(first, empty);
        k.fg.remove_pred_succ_edges(first, second);
        k.fg.add_pred_succ_edges(first, empty);
        k.fg.add_pred_succ_edges(empty, second);

        assert_eq!(k.fg.num_blocks(), 3);
        assert_eq!(k.fg.remove_empty_blocks(), 1);
        assert_eq!(k.fg.num_blocks(), 2);
        assert_eq!(k.fg.succs(first), &[second]);
        assert_eq!(k.fg.preds(second), &[first]);
        assert_eq!(k.fg.blocks[first].phys_succ.expand(), Some(second));
    }

    #[test]
    fn traversal_ids() {
        let (k, [b0, b1, b2, b3]) = diamond();

        assert_eq!(k.fg.blocks[b0].pre_id, 0);
        assert_eq!(k.fg.blocks[b0].rpost_id, 0);
        assert_eq!(k.fg.blocks[b3].rpost_id, 3);
        assert!(k.fg.blocks[b1].pre_id < k.fg.blocks[b2].pre_id);
    }
}
