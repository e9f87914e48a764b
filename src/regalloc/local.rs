//======---------------------------------------------------------------======//
//                                                                           //
// Copyright 2022-2023 Evan Cox <evanacox00@gmail.com>. All rights reserved. //
//                                                                           //
// Use of this source code is governed by a BSD-style license that can be    //
// found in the LICENSE.txt file at the root of this project, or at the      //
// following link: https://opensource.org/licenses/BSD-3-Clause              //
//                                                                           //
//======---------------------------------------------------------------======//

use crate::flowgraph::Block;
use crate::ir::{Declare, Kernel, PhysReg, RegFile};
use crate::regalloc::{PhyRegUsage, RegRequest};
use crate::utility::{SaHashMap, SaHashSet};
use log::{debug, trace};
use smallvec::SmallVec;

/// The lexical range a block-local variable is live in, as positions
/// inside of its block.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
struct LocalInterval {
    var: Declare,
    start: u32,
    end: u32,
}

/// Per-block linear scan allocation of variables that never leave their
/// block.
///
/// This runs before graph coloring. Everything it places is precolored
/// for the global allocator afterwards, which keeps the interference
/// graph small. A block where some variable does not fit gets none of
/// its variables placed, they are left to the global allocator.
pub struct LocalRA<'k> {
    kernel: &'k mut Kernel,
    base: PhyRegUsage,
    active: Vec<LocalInterval>,
}

impl<'k> LocalRA<'k> {
    /// Prepares to allocate locals in `kernel`.
    pub fn new(kernel: &'k mut Kernel) -> Self {
        let mut base = PhyRegUsage::new(kernel);

        // fixed payloads are never available
        for (_, data) in kernel.decls.iter() {
            if let (RegFile::Grf, Some(loc)) = (data.file, data.location()) {
                if data.alias.is_none() {
                    base.mark_busy(loc, &RegRequest::for_declare(data));
                }
            }
        }

        Self {
            kernel,
            base,
            active: Vec::new(),
        }
    }

    /// Allocates every block. Returns how many variables were placed.
    pub fn run(&mut self) -> usize {
        let candidates = self.candidates();
        let order = self.kernel.fg.order.clone();
        let mut placed = 0;
        let mut failed = 0;

        for block in order {
            let intervals = self.intervals_of(block, &candidates);

            if intervals.is_empty() {
                continue;
            }

            match self.allocate_block(&intervals) {
                Some(assignment) => {
                    placed += assignment.len();

                    for (var, loc) in assignment {
                        self.kernel.decls[var].phys = Some(loc);
                    }
                }
                None => {
                    trace!("local allocation of {block:?} failed, leaving it to coloring");
                    failed += 1;
                }
            }
        }

        debug!("local allocation placed {placed} variables, {failed} blocks rolled back");

        placed
    }

    // GRF roots that are only ever touched in a single block
    fn candidates(&self) -> SaHashSet<Declare> {
        self.kernel
            .decls
            .roots_in(RegFile::Grf)
            .filter(|&d| {
                let data = &self.kernel.decls[d];

                data.location().is_none()
                    && !data.is_input
                    && !data.addr_taken
                    && !data.callee_save
                    && !self.kernel.fg.is_global_operand(d)
            })
            .collect()
    }

    fn intervals_of(&self, block: Block, candidates: &SaHashSet<Declare>) -> Vec<LocalInterval> {
        let mut ranges: SaHashMap<Declare, (u32, u32)> = SaHashMap::default();
        let mut order: Vec<Declare> = Vec::new();

        for (pos, &inst) in self.kernel.fg.blocks[block].insts.iter().enumerate() {
            let data = &self.kernel.insts[inst];
            let refs: SmallVec<[Declare; 6]> = data
                .use_declares()
                .into_iter()
                .chain(data.def_declares())
                .map(|d| self.kernel.decls.root(d))
                .collect();

            for var in refs {
                if !candidates.contains(&var) {
                    continue;
                }

                let pos = pos as u32;

                ranges
                    .entry(var)
                    .and_modify(|r| r.1 = pos)
                    .or_insert_with(|| {
                        order.push(var);
                        (pos, pos)
                    });
            }
        }

        // `order` is already sorted by start point
        order
            .into_iter()
            .map(|var| {
                let (start, end) = ranges[&var];

                LocalInterval { var, start, end }
            })
            .collect()
    }

    fn allocate_block(&mut self, intervals: &[LocalInterval]) -> Option<Vec<(Declare, PhysReg)>> {
        let mut usage = self.base.clone();
        let mut mapping: Vec<(Declare, PhysReg)> = Vec::with_capacity(intervals.len());

        self.active.clear();

        for &interval in intervals.iter() {
            self.expire_old_intervals(interval, &mut usage, &mapping);

            let req = RegRequest::for_declare(&self.kernel.decls[interval.var]);
            let loc = usage.assign_regs(&req)?;

            mapping.push((interval.var, loc));
            self.active.push(interval);

            // sorted by increasing end point, needed for expiring
            self.active.sort_unstable_by_key(|i| i.end);
        }

        Some(mapping)
    }

    // an interval that ends at the position another starts at is still
    // busy there, so sources and destinations of one instruction never
    // share storage
    fn expire_old_intervals(
        &mut self,
        interval: LocalInterval,
        usage: &mut PhyRegUsage,
        mapping: &[(Declare, PhysReg)],
    ) {
        let expired = self
            .active
            .iter()
            .take_while(|old| old.end < interval.start)
            .count();

        for old in self.active.drain(..expired) {
            let loc = mapping
                .iter()
                .find(|(var, _)| *var == old.var)
                .map(|(_, loc)| *loc);

            if let Some(loc) = loc {
                usage.free_regs(loc, &RegRequest::for_declare(&self.kernel.decls[old.var]));
            }
        }
    }
}
