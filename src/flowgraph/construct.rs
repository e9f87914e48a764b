//======---------------------------------------------------------------======//
//                                                                           //
// Copyright 2022 Evan Cox <evanacox00@gmail.com>. All rights reserved.      //
//                                                                           //
// Use of this source code is governed by a BSD-style license that can be    //
// found in the LICENSE.txt file at the root of this project, or at the      //
// following link: https://opensource.org/licenses/BSD-3-Clause              //
//                                                                           //
//======---------------------------------------------------------------======//

use crate::arena::{ArenaMap, SecondaryMap, SecondarySet};
use crate::flowgraph::{Block, BlockKind, BlockRole, FlowGraph, FuncId, FuncInfo};
use crate::ir::{Inst, InstData, Label, LabelData, Opcode};
use log::{debug, trace};
use smallvec::SmallVec;

impl FlowGraph {
    /// Splits a flat instruction stream into basic blocks and links them.
    ///
    /// Blocks start at a label and end after any instruction that transfers
    /// control (see [`InstData::ends_block`]). Afterwards the call graph is
    /// discovered, functions are sorted, and dominators and loops are
    /// computed. Global operands need the declare table and are computed
    /// separately with [`Self::compute_global_operands`].
    ///
    /// Malformed streams (unknown labels, calls to non-subroutines, blocks
    /// falling off the end of the kernel, subroutines without a `ret`,
    /// recursion) are fatal.
    pub fn construct(
        stream: Vec<Inst>,
        insts: &ArenaMap<Inst, InstData>,
        labels: &ArenaMap<Label, LabelData>,
    ) -> Self {
        let mut fg = Self::new();

        if stream.is_empty() {
            return fg;
        }

        let label_blocks = fg.split_blocks(stream, insts);

        fg.link_blocks(insts, labels, &label_blocks);
        fg.entry = Some(fg.order[0]);
        fg.relink_layout();
        fg.discover_functions(insts, labels);
        fg.reassign_block_ids();
        fg.mark_simd_flow(insts, &label_blocks);
        fg.sort_funcs();
        fg.compute_dominators();
        fg.find_natural_loops();

        fg
    }

    fn split_blocks(
        &mut self,
        stream: Vec<Inst>,
        insts: &ArenaMap<Inst, InstData>,
    ) -> SecondaryMap<Label, Block> {
        let mut label_blocks = SecondaryMap::new();
        let mut current: Option<Block> = None;

        for inst in stream {
            let data = &insts[inst];

            // a label always starts a block, unless the block is still empty
            if data.op == Opcode::Label {
                if let Some(b) = current {
                    if !self.blocks[b].insts.is_empty() {
                        current = None;
                    }
                }
            }

            let block = match current {
                Some(b) => b,
                None => {
                    let b = self.create_new_bb();

                    self.order.push(b);
                    current = Some(b);
                    b
                }
            };

            if data.op == Opcode::Label {
                let label = match data.target {
                    Some(l) => l,
                    None => panic!("label instruction without a label"),
                };

                if label_blocks.insert(label, block).is_some() {
                    panic!("label {label:?} is placed twice");
                }

                if self.blocks[block].label.is_none() {
                    self.blocks[block].label = Some(label);
                }
            }

            let bb = &mut self.blocks[block];

            bb.insts.push(inst);
            bb.has_send |= data.is_send();

            if data.ends_block() {
                current = None;
            }
        }

        label_blocks
    }

    fn link_blocks(
        &mut self,
        insts: &ArenaMap<Inst, InstData>,
        labels: &ArenaMap<Label, LabelData>,
        label_blocks: &SecondaryMap<Label, Block>,
    ) {
        let target_of = |data: &InstData| -> Block {
            let label = match data.target {
                Some(l) => l,
                None => panic!("'{}' has no target label", data.op.mnemonic()),
            };

            match label_blocks.get(label) {
                Some(b) => *b,
                None => panic!("reference to unknown label '{}'", labels[label].name),
            }
        };

        for i in 0..self.order.len() {
            let block = self.order[i];
            let next = self.order.get(i + 1).copied();
            let fallthrough = || match next {
                Some(n) => n,
                None => panic!("block {block:?} falls off the end of the kernel"),
            };

            let Some(last) = self.blocks[block].last() else {
                continue;
            };

            let data = &insts[last];

            match data.op {
                Opcode::Jmpi => {
                    let target = target_of(data);

                    if data.pred.is_some() {
                        self.add_pred_succ_edges(block, fallthrough());
                    }

                    self.add_unique_pred_succ_edges(block, target);
                }
                Opcode::Goto | Opcode::Join => {
                    let target = target_of(data);

                    self.add_pred_succ_edges(block, fallthrough());
                    self.add_unique_pred_succ_edges(block, target);
                }
                Opcode::Call => {
                    let target = data.target.map(|l| (l, labels[l].subroutine));

                    match target {
                        Some((_, true)) => {}
                        Some((l, false)) => {
                            panic!("call to '{}', which is not a subroutine", labels[l].name)
                        }
                        None => panic!("call without a target label"),
                    }

                    let ret = match next {
                        Some(n) => n,
                        None => panic!("call in block {block:?} has no return block"),
                    };

                    self.blocks[block].kind |= BlockKind::CALL;
                    self.blocks[ret].kind |= BlockKind::RETURN;
                }
                // edges out of a `ret` go to every return site of the function
                Opcode::Ret => {}
                _ if data.is_eot() => {}
                _ => self.add_pred_succ_edges(block, fallthrough()),
            }
        }
    }

    fn discover_functions(
        &mut self,
        insts: &ArenaMap<Inst, InstData>,
        labels: &ArenaMap<Label, LabelData>,
    ) {
        let entry = self.entry();
        let mut by_label = SecondaryMap::<Label, FuncId>::new();

        self.funcs.insert(FuncInfo::new(entry, None));

        // every subroutine label that is placed in the stream is a function
        for &block in self.order.iter() {
            if let Some(label) = self.blocks[block].label {
                if labels[label].subroutine && block != entry {
                    let f = self.funcs.insert(FuncInfo::new(block, Some(label)));

                    by_label.insert(label, f);
                }
            }
        }

        let funcs: Vec<FuncId> = self.funcs.keys().collect();

        for f in funcs {
            let init = self.funcs[f].init;
            let members = self.walk_function(init);
            let mut exit: Option<Block> = None;

            for &b in members.iter() {
                let Some(last) = self.blocks[b].last() else {
                    continue;
                };
                let data = &insts[last];
                let is_exit = if f == self.kernel_func() {
                    data.is_eot()
                } else {
                    data.op == Opcode::Ret
                };

                if is_exit {
                    if f != self.kernel_func() && exit.is_some() {
                        panic!("subroutine at {init:?} has more than one ret");
                    }

                    // multiple EOTs: the last one in layout is the exit
                    exit = Some(b);
                }

                if data.op == Opcode::Call {
                    let label = data.target.unwrap_or_else(|| panic!("call without a target label"));
                    let callee = match by_label.get(label) {
                        Some(c) => *c,
                        None => panic!("call to unplaced subroutine '{}'", labels[label].name),
                    };

                    self.blocks[b].role = BlockRole::Callee(callee);
                    self.funcs[callee].call_count += 1;

                    if !self.funcs[f].callees.contains(&callee) {
                        self.funcs[f].callees.push(callee);
                    }
                }
            }

            let exit = match exit {
                Some(e) => e,
                None if f == self.kernel_func() => *members.last().unwrap_or(&init),
                None => panic!("subroutine at {init:?} has no ret"),
            };

            self.blocks[init].kind |= BlockKind::INIT;
            self.blocks[exit].kind |= BlockKind::EXIT;

            for b in [init, exit] {
                if self.blocks[b].role == BlockRole::None {
                    self.blocks[b].role = BlockRole::Owner(f);
                }
            }

            let info = &mut self.funcs[f];

            info.exit = exit;
            info.blocks = members;
        }

        // call -> callee INIT, callee EXIT -> return block
        let calls: SmallVec<[(Block, FuncId); 8]> = self
            .order
            .iter()
            .filter_map(|&b| self.callee_of(b).map(|f| (b, f)))
            .collect();

        for (call, callee) in calls {
            let ret = self.return_block_of(call);
            let (init, exit) = (self.funcs[callee].init, self.funcs[callee].exit);

            self.add_unique_pred_succ_edges(call, init);
            self.add_unique_pred_succ_edges(exit, ret);
        }

        debug!("found {} functions", self.funcs.len());
    }

    // every block of the function starting at `init`, following local edges
    fn walk_function(&self, init: Block) -> Vec<Block> {
        let mut seen = SecondarySet::with_primary(&self.blocks);
        let mut stack = vec![init];

        while let Some(b) = stack.pop() {
            if seen.insert(b) {
                continue;
            }

            if self.blocks[b].is_call() {
                stack.push(self.return_block_of(b));
            } else {
                stack.extend(self.blocks[b].succs.iter().copied());
            }
        }

        // layout order
        self.order
            .iter()
            .copied()
            .filter(|b| seen.contains(*b))
            .collect()
    }

    /// Orders the call graph so that every callee comes before its callers,
    /// and assigns each function its DFS pre/post ids. Recursion is fatal.
    pub fn sort_funcs(&mut self) {
        #[derive(Copy, Clone, PartialEq)]
        enum State {
            Unvisited,
            OnStack,
            Done,
        }

        let mut state = SecondaryMap::fill(self.funcs.len(), State::Unvisited);
        let mut sorted = Vec::with_capacity(self.funcs.len());
        let (mut pre, mut post) = (0, 0);
        let roots: Vec<FuncId> = self.funcs.keys().collect();

        for root in roots {
            if state[root] != State::Unvisited {
                continue;
            }

            let mut stack = vec![(root, 0usize)];

            state[root] = State::OnStack;
            self.funcs[root].pre_id = pre;
            pre += 1;

            while let Some((f, next)) = stack.last_mut() {
                let f = *f;

                if let Some(&callee) = self.funcs[f].callees.get(*next) {
                    *next += 1;

                    match state[callee] {
                        State::Unvisited => {
                            state[callee] = State::OnStack;
                            self.funcs[callee].pre_id = pre;
                            pre += 1;
                            stack.push((callee, 0));
                        }
                        State::OnStack => panic!("recursive call into function {callee:?}"),
                        State::Done => {}
                    }
                } else {
                    state[f] = State::Done;
                    self.funcs[f].post_id = post;
                    post += 1;
                    sorted.push(f);
                    stack.pop();
                }
            }
        }

        trace!("sorted functions: {sorted:?}");

        self.sorted_funcs = sorted;
    }

    // a goto makes every block up to its join point run with some channels
    // disabled
    fn mark_simd_flow(
        &mut self,
        insts: &ArenaMap<Inst, InstData>,
        label_blocks: &SecondaryMap<Label, Block>,
    ) {
        let mut ranges: SmallVec<[(usize, usize); 4]> = SmallVec::new();

        for (i, &block) in self.order.iter().enumerate() {
            let Some(last) = self.blocks[block].last() else {
                continue;
            };
            let data = &insts[last];

            if data.op != Opcode::Goto {
                continue;
            }

            let Some(target) = data.target.and_then(|l| label_blocks.get(l)) else {
                continue;
            };
            let t = self.blocks[*target].id as usize;

            if t > i {
                ranges.push((i + 1, t));
            } else {
                ranges.push((t, i + 1));
            }
        }

        for (start, end) in ranges {
            for &block in self.order[start..end].iter() {
                self.blocks[block].in_simd_flow = true;
            }
        }
    }
}

impl FuncInfo {
    fn new(init: Block, label: Option<Label>) -> Self {
        Self {
            init,
            exit: init,
            call_count: 0,
            callees: SmallVec::new(),
            pre_id: u32::MAX,
            post_id: u32::MAX,
            blocks: Vec::new(),
            label,
        }
    }
}
