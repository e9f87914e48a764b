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
use crate::flowgraph::{Block, FlowGraph};
use log::debug;
use smallvec::SmallVec;

/// A natural loop, identified by its back edge.
#[derive(Clone, Debug)]
pub struct NaturalLoop {
    /// `(tail, head)`, the head dominates the tail.
    pub back_edge: (Block, Block),
    /// Every block in the loop, including the head.
    pub body: SecondarySet<Block>,
}

impl NaturalLoop {
    /// The loop header.
    #[inline]
    pub fn header(&self) -> Block {
        self.back_edge.1
    }

    /// Whether `block` is part of the loop.
    #[inline]
    pub fn contains(&self, block: Block) -> bool {
        self.body.contains(block)
    }

    /// Number of blocks in the loop.
    #[inline]
    pub fn size(&self) -> usize {
        self.body.cardinality()
    }
}

impl FlowGraph {
    /// Finds every edge `tail -> head` that is retreating in a DFS of its
    /// function and where `head` dominates `tail`. Retreating edges that
    /// are not dominated (irreducible flow) are ignored.
    pub fn find_back_edges(&mut self) {
        let mut edges = Vec::new();

        for f in self.funcs.keys() {
            let init = self.funcs[f].init;
            let mut on_stack = SecondarySet::with_primary(&self.blocks);
            let mut seen = SecondarySet::with_primary(&self.blocks);
            let mut stack: Vec<(Block, SmallVec<[Block; 2]>, usize)> =
                vec![(init, self.local_succs(init), 0)];

            seen.insert(init);
            on_stack.insert(init);

            while let Some((block, succs, next)) = stack.last_mut() {
                let block = *block;

                if let Some(&succ) = succs.get(*next) {
                    *next += 1;

                    if on_stack.contains(succ) {
                        if self.dominates(block, succ) {
                            edges.push((block, succ));
                        }
                    } else if !seen.insert(succ) {
                        on_stack.insert(succ);
                        stack.push((succ, self.local_succs(succ), 0));
                    }
                } else {
                    on_stack.remove(block);
                    stack.pop();
                }
            }
        }

        self.back_edges = edges;
    }

    /// Finds back edges and builds the natural loop of each of them, then
    /// recomputes loop depths.
    pub fn find_natural_loops(&mut self) {
        self.find_back_edges();

        let mut loops = Vec::with_capacity(self.back_edges.len());

        for &(tail, head) in self.back_edges.iter() {
            let mut body = SecondarySet::with_primary(&self.blocks);
            let mut work = vec![tail];

            body.insert(head);

            while let Some(b) = work.pop() {
                if body.insert(b) {
                    continue;
                }

                work.extend(self.local_preds(b));
            }

            loops.push(NaturalLoop {
                back_edge: (tail, head),
                body,
            });
        }

        let mut depth = SecondaryMap::fill(self.blocks.len(), 0);

        for &block in self.order.iter() {
            let mut headers: SmallVec<[Block; 4]> = SmallVec::new();

            for l in loops.iter().filter(|l| l.contains(block)) {
                if !headers.contains(&l.header()) {
                    headers.push(l.header());
                }
            }

            depth[block] = headers.len() as u32;
        }

        if !loops.is_empty() {
            debug!("found {} natural loops", loops.len());
        }

        self.loops = loops;
        self.loop_depth = depth;
    }

    /// The number of distinct loops `block` is nested in.
    pub fn loop_depth(&self, block: Block) -> u32 {
        self.loop_depth.get(block).copied().unwrap_or(0)
    }

    /// The smallest loop containing `block`.
    pub fn innermost_loop(&self, block: Block) -> Option<&NaturalLoop> {
        self.loops
            .iter()
            .filter(|l| l.contains(block))
            .min_by_key(|l| l.size())
    }
}

#[cfg(test)]
mod tests {
    use crate::ir::*;
    use crate::testing::*;

    #[test]
    fn nested_loops() {
        let mut k = kernel();
        let v1 = k.create_decl(DeclareData::grf("V1", ElemType::D, 8));
        let f0 = k.create_decl(DeclareData::new("F0", RegFile::Flag, ElemType::UW, 1));
        let outer = k.create_label("outer", false);
        let inner = k.create_label("inner", false);
        let p = Predicate {
            flag: f0,
            inverse: false,
        };
        let mut b = Builder::new(&mut k);

        b.mov(8, v1, Operand::imm(0, ElemType::D));
        b.label(outer);
        b.mov(8, v1, Operand::imm(1, ElemType::D));
        b.label(inner);
        b.mov(8, v1, Operand::imm(2, ElemType::D));
        b.jmpi(inner, Some(p));
        b.jmpi(outer, Some(p));
        b.eot();

        k.build_flowgraph();

        let fg = &k.fg;
        let [entry, outer_bb, inner_bb, latch, exit] = fg.order[..] else {
            panic!("expected five blocks, got {}", fg.num_blocks());
        };

        assert_eq!(fg.back_edges().len(), 2);
        assert!(fg.back_edges().contains(&(inner_bb, inner_bb)));
        assert!(fg.back_edges().contains(&(latch, outer_bb)));
        assert_eq!(fg.loop_depth(entry), 0);
        assert_eq!(fg.loop_depth(outer_bb), 1);
        assert_eq!(fg.loop_depth(inner_bb), 2);
        assert_eq!(fg.loop_depth(latch), 1);
        assert_eq!(fg.loop_depth(exit), 0);
        assert_eq!(fg.innermost_loop(inner_bb).map(|l| l.header()), Some(inner_bb));
        assert_eq!(fg.innermost_loop(latch).map(|l| l.header()), Some(outer_bb));
        assert!(fg.innermost_loop(exit).is_none());
    }
}
