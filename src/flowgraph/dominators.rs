//======---------------------------------------------------------------======//
//                                                                           //
// Copyright 2022-2023 Evan Cox <evanacox00@gmail.com>. All rights reserved. //
//                                                                           //
// Use of this source code is governed by a BSD-style license that can be    //
// found in the LICENSE.txt file at the root of this project, or at the      //
// following link: https://opensource.org/licenses/BSD-3-Clause              //
//                                                                           //
//======---------------------------------------------------------------======//

use crate::arena::{SecondaryMap, SecondarySet};
use crate::flowgraph::{Block, BlockKind, BlockRole, FlowGraph};
use log::trace;
use smallvec::{smallvec, SmallVec};

impl FlowGraph {
    /// Whether `block` is the EXIT block of a subroutine (as opposed to the
    /// kernel's own exit).
    pub(crate) fn is_subroutine_exit(&self, block: Block) -> bool {
        let data = &self.blocks[block];

        data.kind.contains(BlockKind::EXIT)
            && matches!(data.role, BlockRole::Owner(f) if f != self.kernel_func())
    }

    /// Successors within the same function. A CALL block flows into its
    /// return block, and a subroutine's EXIT has none.
    pub fn local_succs(&self, block: Block) -> SmallVec<[Block; 2]> {
        if self.blocks[block].is_call() {
            smallvec![self.return_block_of(block)]
        } else if self.is_subroutine_exit(block) {
            SmallVec::new()
        } else {
            self.blocks[block].succs.clone()
        }
    }

    /// Predecessors within the same function, the mirror of
    /// [`Self::local_succs`].
    pub fn local_preds(&self, block: Block) -> SmallVec<[Block; 4]> {
        let mut preds: SmallVec<[Block; 4]> = self
            .preds(block)
            .iter()
            .copied()
            .filter(|&p| !self.blocks[p].is_call() && !self.is_subroutine_exit(p))
            .collect();

        if self.blocks[block].is_return() {
            preds.push(self.call_block_of(block));
        }

        preds
    }

    /// Computes the immediate dominator of every block, separately for each
    /// function.
    ///
    /// The algorithm used is described in "A Simple, Fast Dominance Algorithm"
    /// by Cooper et. al.
    pub fn compute_dominators(&mut self) {
        let mut idoms = SecondaryMap::with_primary(&self.blocks);

        for f in self.funcs.keys() {
            let po = self.local_postorder(self.funcs[f].init);

            compute_idoms(self, &po, &mut idoms);
        }

        trace!("computed dominators for {} blocks", idoms.len());

        self.idoms = idoms;
    }

    /// Gets the immediate dominator of `block`, if one exists. The INIT
    /// block of every function and unreachable blocks have none.
    pub fn idom(&self, block: Block) -> Option<Block> {
        self.idoms.get(block).copied()
    }

    /// Checks if `possible_dominator` dominates `block`. This returns true
    /// if both are the same block.
    pub fn dominates(&self, block: Block, possible_dominator: Block) -> bool {
        if block == possible_dominator {
            return true;
        }

        let mut curr = block;

        while let Some(idom) = self.idom(curr) {
            if idom == possible_dominator {
                return true;
            }

            curr = idom;
        }

        false
    }

    /// A postorder of the blocks reachable from `init` over local edges.
    pub(crate) fn local_postorder(&self, init: Block) -> Vec<Block> {
        let mut po = Vec::new();
        let mut seen = SecondarySet::with_primary(&self.blocks);
        let mut stack: Vec<(Block, SmallVec<[Block; 2]>, usize)> =
            vec![(init, self.local_succs(init), 0)];

        seen.insert(init);

        while let Some((block, succs, next)) = stack.last_mut() {
            if let Some(&succ) = succs.get(*next) {
                *next += 1;

                // we need to mark it as seen **before** going to any targets, just in case
                // there's any recursive blocks or recursive chains of blocks
                if !seen.insert(succ) {
                    let succs = self.local_succs(succ);

                    stack.push((succ, succs, 0));
                }
            } else {
                po.push(*block);
                stack.pop();
            }
        }

        po
    }
}

fn intersect(
    po_numbers: &SecondaryMap<Block, usize>,
    idoms: &SecondaryMap<Block, Block>,
    bb1: Block,
    bb2: Block,
) -> Block {
    let mut f1 = bb1;
    let mut f2 = bb2;

    while f1 != f2 {
        let f2v = po_numbers[f2];

        while po_numbers[f1] < f2v {
            f1 = idoms[f1];
        }

        let f1v = po_numbers[f1];

        while po_numbers[f2] < f1v {
            f2 = idoms[f2];
        }
    }

    f1
}

fn compute_idoms(fg: &FlowGraph, po: &[Block], out: &mut SecondaryMap<Block, Block>) {
    let Some(&root) = po.last() else {
        return;
    };

    let po_numbers = {
        let mut map = SecondaryMap::default();

        for (i, bb) in po.iter().copied().enumerate() {
            map.insert(bb, i);
        }

        map
    };

    let mut idoms = SecondaryMap::default();
    let mut changed = true;

    // for the purposes of the algorithm, the entry node is its own idom
    idoms.insert(root, root);

    while changed {
        changed = false;

        for block in po.iter().rev().copied().skip(1) {
            // every processed predecessor, there is always at least one in
            // reverse postorder
            let preds: SmallVec<[Block; 8]> = fg
                .local_preds(block)
                .into_iter()
                .filter(|p| idoms.contains(*p))
                .collect();

            let mut iter = preds.into_iter();
            let mut idom = match iter.next() {
                Some(p) => p,
                None => panic!("{block:?} has no processed predecessor in reverse postorder"),
            };

            for pred in iter {
                idom = intersect(&po_numbers, &idoms, pred, idom);
            }

            changed |= idoms.insert(block, idom) != Some(idom);
        }
    }

    idoms.remove(root);

    for (block, idom) in idoms.iter() {
        out.insert(block, *idom);
    }
}
