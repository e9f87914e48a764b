//======---------------------------------------------------------------======//
//                                                                           //
// Copyright 2022-2023 Evan Cox <evanacox00@gmail.com>. All rights reserved. //
//                                                                           //
// Use of this source code is governed by a BSD-style license that can be    //
// found in the LICENSE.txt file at the root of this project, or at the      //
// following link: https://opensource.org/licenses/BSD-3-Clause              //
//                                                                           //
//======---------------------------------------------------------------======//

use crate::arena::SecondaryMap;
use crate::flowgraph::Block;
use crate::ir::{Declare, InstData, Kernel, Opcode, Operand, RegBase, RegFile};
use crate::utility::SaHashMap;
use log::{debug, trace, warn};
use smallvec::SmallVec;

/// A flow-insensitive, conservative points-to analysis for address
/// declares.
///
/// Every address declare maps to the set of declares it may point into.
/// Addresses that are copied or offset from each other share one set:
/// merging two addresses redirects both of them to the same slot of
/// `sets`, so anything added later through either one is seen by both.
#[derive(Clone, Debug, Default)]
pub struct PointsToAnalysis {
    // addr root -> index into `sets`
    addr_points_to_set_index: SaHashMap<Declare, usize>,
    sets: Vec<SmallVec<[Declare; 4]>>,
    address_taken: Vec<Declare>,
    indirect_uses: SecondaryMap<Block, Vec<Declare>>,
}

impl PointsToAnalysis {
    /// Creates an empty analysis.
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs the analysis over every block of `kernel`. Marks the
    /// `addr_taken` flag of every declare that has its address taken.
    pub fn compute(kernel: &mut Kernel) -> Self {
        let mut pta = Self::new();

        pta.do_points_to_analysis(kernel);
        pta
    }

    /// Runs the analysis, see [`Self::compute`].
    pub fn do_points_to_analysis(&mut self, kernel: &mut Kernel) {
        let insts: Vec<_> = kernel
            .fg
            .order
            .iter()
            .flat_map(|&b| kernel.fg.blocks[b].insts.iter().copied())
            .collect();

        // 1. address-taken variables
        for &inst in insts.iter() {
            for src in kernel.insts[inst].srcs.iter() {
                if let Operand::AddrOf { var, .. } = *src {
                    let root = kernel.decls.root(var);

                    if !self.address_taken.contains(&root) {
                        self.address_taken.push(root);
                    }
                }
            }
        }

        for &var in self.address_taken.iter() {
            kernel.decls[var].addr_taken = true;
        }

        // 2. every definition of an address variable
        for &inst in insts.iter() {
            let data = &kernel.insts[inst];
            let Some(dst) = data.dst_declare() else {
                continue;
            };
            let addr = kernel.decls.root(dst);

            if kernel.decls[addr].file != RegFile::Address {
                continue;
            }

            self.handle_address_def(kernel, addr, data);
        }

        // 3. what each block may touch through an indirect operand
        for &block in kernel.fg.order.iter() {
            let mut uses: Vec<Declare> = Vec::new();

            for &inst in kernel.fg.blocks[block].insts.iter() {
                let data = &kernel.insts[inst];
                let dst = std::iter::once(&data.dst);
                let srcs = data.srcs.iter().filter_map(Operand::as_reg);

                for op in dst.chain(srcs) {
                    if let RegBase::Indirect { addr, .. } = op.base {
                        for &var in self.points_to(kernel.decls.root(addr)) {
                            if !uses.contains(&var) {
                                uses.push(var);
                            }
                        }
                    }
                }
            }

            if !uses.is_empty() {
                uses.sort();
                self.indirect_uses.insert(block, uses);
            }
        }

        debug!(
            "points-to: {} address-taken variables, {} address variables",
            self.address_taken.len(),
            self.addr_points_to_set_index.len()
        );
    }

    fn handle_address_def(&mut self, kernel: &Kernel, addr: Declare, data: &InstData) {
        let address_src = |op: &Operand| -> Option<Declare> {
            let root = kernel.decls.root(op.declare()?);

            (kernel.decls[root].file == RegFile::Address).then_some(root)
        };

        match data.op {
            Opcode::Mov => match data.srcs.first() {
                Some(Operand::AddrOf { var, .. }) => {
                    self.add_to_points_to_set(addr, kernel.decls.root(*var));
                    return;
                }
                Some(src) => {
                    if let Some(other) = address_src(src) {
                        self.merge_points_to_set(addr, other);
                        return;
                    }
                }
                None => {}
            },
            Opcode::Add | Opcode::Mul => {
                let mut handled = false;

                for src in data.srcs.iter() {
                    if let Operand::AddrOf { var, .. } = src {
                        self.add_to_points_to_set(addr, kernel.decls.root(*var));
                        handled = true;
                    } else if let Some(other) = address_src(src) {
                        self.merge_points_to_set(addr, other);
                        handled = true;
                    }
                }

                if handled {
                    return;
                }
            }
            _ => {}
        }

        warn!(
            "unknown definition of address '{}', assuming it may point to every address-taken variable",
            kernel.decls[addr].name
        );

        for var in self.address_taken.clone() {
            self.add_to_points_to_set(addr, var);
        }
    }

    fn index_of(&mut self, addr: Declare) -> usize {
        if let Some(&i) = self.addr_points_to_set_index.get(&addr) {
            return i;
        }

        let i = self.sets.len();

        self.sets.push(SmallVec::new());
        self.addr_points_to_set_index.insert(addr, i);
        i
    }

    /// Records that `addr` may point into `var`.
    pub fn add_to_points_to_set(&mut self, addr: Declare, var: Declare) {
        let i = self.index_of(addr);

        if !self.sets[i].contains(&var) {
            trace!("points-to: {addr:?} -> {var:?}");
            self.sets[i].push(var);
        }
    }

    /// Makes `a` and `b` share one set containing the union of both.
    /// Merging addresses that already share a set does nothing.
    pub fn merge_points_to_set(&mut self, a: Declare, b: Declare) {
        let (ia, ib) = (self.index_of(a), self.index_of(b));

        if ia == ib {
            return;
        }

        let moved = std::mem::take(&mut self.sets[ib]);

        for var in moved {
            if !self.sets[ia].contains(&var) {
                self.sets[ia].push(var);
            }
        }

        for index in self.addr_points_to_set_index.values_mut() {
            if *index == ib {
                *index = ia;
            }
        }
    }

    /// Every declare that `addr` may point into. Aliases of an address
    /// resolve to their root by the caller.
    pub fn points_to(&self, addr: Declare) -> &[Declare] {
        match self.addr_points_to_set_index.get(&addr) {
            Some(&i) => &self.sets[i],
            None => &[],
        }
    }

    /// Whether `var` is in the points-to set of `addr`.
    pub fn is_present_in_points_to(&self, addr: Declare, var: Declare) -> bool {
        self.points_to(addr).contains(&var)
    }

    /// Every declare that some indirect operand in `block` may access,
    /// sorted.
    pub fn indirect_uses(&self, block: Block) -> &[Declare] {
        self.indirect_uses.get(block).map_or(&[], Vec::as_slice)
    }

    /// Every declare whose address is taken.
    pub fn address_taken(&self) -> &[Declare] {
        &self.address_taken
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::ArenaKey;
    use crate::ir::*;
    use crate::testing::*;

    fn addr(k: &mut Kernel, name: &str) -> Declare {
        k.create_decl(DeclareData::new(name, RegFile::Address, ElemType::UW, 1))
    }

    #[test]
    fn copies_and_offsets_share_sets() {
        let mut k = kernel();
        let v1 = k.create_decl(DeclareData::grf("V1", ElemType::F, 16));
        let v2 = k.create_decl(DeclareData::grf("V2", ElemType::F, 16));
        let out = k.create_decl(DeclareData::grf("OUT", ElemType::F, 8));
        let a0 = addr(&mut k, "A0");
        let a1 = addr(&mut k, "A1");
        let a2 = addr(&mut k, "A2");
        let a1_src = k.scalar(a1);
        let indirect = RegOperand {
            base: RegBase::Indirect { addr: a2, imm: 0 },
            ..RegOperand::src(v1, ElemType::F, Region::contiguous(8))
        };
        let mut b = Builder::new(&mut k);

        b.mov(1, a0, Operand::AddrOf { var: v1, offset: 0 });
        b.mov(1, a1, Operand::AddrOf { var: v2, offset: 0 });
        b.binary(Opcode::Add, 1, a2, a1_src, Operand::imm(32, ElemType::UW));
        b.mov(8, out, indirect.into());
        b.eot();

        k.build_flowgraph();

        let pta = PointsToAnalysis::compute(&mut k);

        assert_eq!(pta.points_to(a0), &[v1]);
        assert!(pta.is_present_in_points_to(a2, v2));
        assert!(!pta.is_present_in_points_to(a2, v1));
        assert_eq!(pta.address_taken(), &[v1, v2]);
        assert!(k.decls[v1].addr_taken);
        assert_eq!(pta.indirect_uses(k.fg.entry()), &[v2]);
    }

    #[test]
    fn unknown_definition_is_conservative() {
        let mut k = kernel();
        let v1 = k.create_decl(DeclareData::grf("V1", ElemType::F, 16));
        let v2 = k.create_decl(DeclareData::grf("V2", ElemType::F, 16));
        let a0 = addr(&mut k, "A0");
        let a1 = addr(&mut k, "A1");
        let mut b = Builder::new(&mut k);

        b.mov(1, a0, Operand::AddrOf { var: v1, offset: 0 });
        b.mov(1, a0, Operand::AddrOf { var: v2, offset: 0 });
        b.mov(1, a1, Operand::imm(64, ElemType::UW));
        b.eot();

        k.build_flowgraph();

        let pta = PointsToAnalysis::compute(&mut k);

        assert!(pta.is_present_in_points_to(a1, v1));
        assert!(pta.is_present_in_points_to(a1, v2));
    }

    #[test]
    fn merge_is_monotone_and_idempotent() {
        let (a, b, x, y) = (
            Declare::new(0),
            Declare::new(1),
            Declare::new(2),
            Declare::new(3),
        );
        let mut pta = PointsToAnalysis::new();

        pta.add_to_points_to_set(a, x);
        pta.add_to_points_to_set(b, y);
        pta.merge_points_to_set(a, b);

        let after_first: Vec<_> = pta.points_to(a).to_vec();

        pta.merge_points_to_set(a, b);
        pta.merge_points_to_set(b, a);

        assert_eq!(pta.points_to(a), after_first.as_slice());
        assert_eq!(pta.points_to(a), pta.points_to(b));
        assert!(pta.is_present_in_points_to(b, x));

        // adding through one is seen by the other
        pta.add_to_points_to_set(b, Declare::new(4));
        assert!(pta.is_present_in_points_to(a, Declare::new(4)));
        assert!(after_first.iter().all(|v| pta.is_present_in_points_to(a, *v)));
    }
}
