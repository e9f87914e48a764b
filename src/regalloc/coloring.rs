//======---------------------------------------------------------------======//
//                                                                           //
// Copyright 2022-2023 Evan Cox <evanacox00@gmail.com>. All rights reserved. //
//                                                                           //
// Use of this source code is governed by a BSD-style license that can be    //
// found in the LICENSE.txt file at the root of this project, or at the      //
// following link: https://opensource.org/licenses/BSD-3-Clause              //
//                                                                           //
//======---------------------------------------------------------------======//

use crate::ir::{Declare, Kernel, Operand, PhysReg, RegFile};
use crate::regalloc::{BankClass, InterferenceGraph, PhyRegUsage, RegRequest};
use crate::utility::{SaHashMap, SaHashSet};
use log::{debug, trace};

/// What a coloring attempt produced.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ColorOutcome {
    /// Every node got a location.
    Colored(Vec<(Declare, PhysReg)>),
    /// These nodes could not be colored and have to be spilled or
    /// rematerialized. The locations that were found are not applied.
    Spill(Vec<Declare>),
}

/// Optimistic Chaitin-Briggs coloring over an [`InterferenceGraph`].
///
/// Nodes that already have a location (fixed payloads, or variables
/// placed by local allocation) are precolored and only constrain their
/// neighbors.
pub struct GraphColor<'a> {
    kernel: &'a Kernel,
    graph: &'a InterferenceGraph,
    base: PhyRegUsage,
    unspillable: SaHashSet<Declare>,
    banks: SaHashMap<Declare, BankClass>,
}

impl<'a> GraphColor<'a> {
    /// Prepares to color `graph`.
    pub fn new(kernel: &'a Kernel, graph: &'a InterferenceGraph) -> Self {
        let mut color = Self {
            kernel,
            graph,
            base: PhyRegUsage::new(kernel),
            unspillable: SaHashSet::default(),
            banks: SaHashMap::default(),
        };

        if kernel.options.bank_conflict_reduction && graph.file() == RegFile::Grf {
            color.assign_bank_classes();
        }

        color
    }

    /// Marks variables that must never be chosen as spill candidates, such
    /// as temporaries created by spill code.
    pub fn with_unspillable(mut self, decls: impl IntoIterator<Item = Declare>) -> Self {
        self.unspillable.extend(decls);
        self
    }

    /// The bank class picked for `decl`.
    pub fn bank_of(&self, decl: Declare) -> BankClass {
        self.banks.get(&decl).copied().unwrap_or(BankClass::None)
    }

    fn needs_color(&self, decl: Declare) -> bool {
        self.graph.is_referenced(decl) && self.kernel.decls[decl].location().is_none()
    }

    fn size_of(&self, decl: Declare) -> u32 {
        let data = &self.kernel.decls[decl];

        match data.file {
            RegFile::Grf => data.num_rows(),
            RegFile::Address | RegFile::Flag => data.num_words(),
        }
    }

    fn capacity(&self) -> u32 {
        match self.graph.file() {
            RegFile::Grf => self.base.top(),
            RegFile::Address => self.kernel.target.addr_sub_regs(),
            RegFile::Flag => self.kernel.target.flag_regs() * 2,
        }
    }

    // operands read together should come from different banks
    fn assign_bank_classes(&mut self) {
        let kernel = self.kernel;

        for &block in kernel.fg.order.iter() {
            for &inst in kernel.fg.blocks[block].insts.iter() {
                let data = &kernel.insts[inst];
                let pair = match data.srcs.len() {
                    3 => (&data.srcs[1], &data.srcs[2]),
                    2 => (&data.srcs[0], &data.srcs[1]),
                    _ => continue,
                };

                let root = |op: &Operand| -> Option<Declare> {
                    let d = kernel.decls.root(op.declare()?);

                    self.needs_color(d).then_some(d)
                };

                let (Some(a), Some(b)) = (root(pair.0), root(pair.1)) else {
                    continue;
                };

                if a == b {
                    continue;
                }

                match (self.banks.get(&a).copied(), self.banks.get(&b).copied()) {
                    (None, None) => {
                        self.banks.insert(a, BankClass::FirstEven);
                        self.banks.insert(b, BankClass::SecondOdd);
                    }
                    (Some(x), None) => {
                        self.banks.insert(b, x.opposite());
                    }
                    (None, Some(y)) => {
                        self.banks.insert(a, y.opposite());
                    }
                    _ => {}
                }
            }
        }
    }

    /// Spill cost of every node, weighted by loop depth. Variables that
    /// can't live in memory get an infinite cost.
    pub fn spill_costs(&self) -> SaHashMap<Declare, f32> {
        let kernel = self.kernel;
        let mut costs: SaHashMap<Declare, f32> = SaHashMap::default();

        for &block in kernel.fg.order.iter() {
            let weight = 8f32.powi(kernel.fg.loop_depth(block).min(4) as i32);

            for &inst in kernel.fg.blocks[block].insts.iter() {
                let data = &kernel.insts[inst];
                let refs = data
                    .use_declares()
                    .into_iter()
                    .chain(data.def_declares())
                    .map(|d| kernel.decls.root(d));

                for d in refs {
                    if self.graph.contains(d) {
                        *costs.entry(d).or_insert(0.0) += weight;
                    }
                }
            }
        }

        for (d, cost) in costs.iter_mut() {
            let data = &kernel.decls[*d];
            let pinned = data.file != RegFile::Grf
                || data.eot
                || data.is_input
                || data.addr_taken
                || self.unspillable.contains(d);

            if pinned {
                *cost = f32::INFINITY;
            }
        }

        costs
    }

    /// Runs simplify and select.
    pub fn color(&self) -> ColorOutcome {
        let costs = self.spill_costs();
        let capacity = self.capacity();
        let mut remaining: Vec<Declare> = self
            .graph
            .nodes()
            .iter()
            .copied()
            .filter(|&d| self.needs_color(d))
            .collect();
        let mut stack: Vec<Declare> = Vec::with_capacity(remaining.len());

        // weighted degree: the storage of the neighbors still in the graph,
        // precolored neighbors always count
        let degree = |d: Declare, remaining: &[Declare]| -> u32 {
            self.graph
                .neighbors(d)
                .filter(|n| remaining.contains(n) || self.kernel.decls[*n].location().is_some())
                .map(|n| self.size_of(n))
                .sum()
        };

        while !remaining.is_empty() {
            let trivial = remaining
                .iter()
                .position(|&d| degree(d, &remaining) + self.size_of(d) <= capacity);

            let i = match trivial {
                Some(i) => i,
                None => {
                    // optimistic: the cheapest node might still get a color
                    let priority = |d: Declare| {
                        let cost = costs.get(&d).copied().unwrap_or(0.0);

                        cost / (degree(d, &remaining) as f32 + 1.0)
                    };

                    let mut best = 0;

                    for j in 1..remaining.len() {
                        if priority(remaining[j]) < priority(remaining[best]) {
                            best = j;
                        }
                    }

                    trace!("optimistically pushing '{}'", self.kernel.decls[remaining[best]].name);

                    best
                }
            };

            stack.push(remaining.swap_remove(i));
        }

        let mut assigned: SaHashMap<Declare, PhysReg> = SaHashMap::default();
        let mut spills = Vec::new();

        while let Some(d) = stack.pop() {
            let mut usage = self.base.clone();

            for n in self.graph.neighbors(d) {
                let loc = self.kernel.decls[n]
                    .location()
                    .or_else(|| assigned.get(&n).copied());

                if let Some(loc) = loc {
                    usage.mark_busy(loc, &RegRequest::for_declare(&self.kernel.decls[n]));
                }
            }

            let req = RegRequest::for_declare(&self.kernel.decls[d]).with_bank(self.bank_of(d));

            match usage.assign_regs(&req) {
                Some(loc) => {
                    assigned.insert(d, loc);
                }
                None => spills.push(d),
            }
        }

        if spills.is_empty() {
            let mut colored: Vec<_> = assigned.into_iter().collect();

            colored.sort();
            debug!("colored {} {:?} variables", colored.len(), self.graph.file());

            ColorOutcome::Colored(colored)
        } else {
            spills.sort();
            debug!("{} {:?} variables failed to color", spills.len(), self.graph.file());

            ColorOutcome::Spill(spills)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::{LiveFiles, LivenessAnalysis, PointsToAnalysis};
    use crate::ir::*;
    use crate::options::CodegenOptions;
    use crate::target::Platform;
    use crate::testing::*;

    fn color(k: &mut Kernel) -> (InterferenceGraph, ColorOutcome) {
        let pta = PointsToAnalysis::compute(k);
        let live = LivenessAnalysis::compute(k, &pta, LiveFiles::GRF);
        let graph = InterferenceGraph::build(k, &pta, &live, RegFile::Grf);
        let outcome = GraphColor::new(k, &graph).color();

        (graph, outcome)
    }

    // n variables of `rows` rows each, all live at once
    fn pressure_kernel(options: CodegenOptions, n: usize, rows: u32) -> (Kernel, Vec<Declare>) {
        let mut k = kernel_for(Platform::Gen12Lp, options);
        let vars: Vec<_> = (0..n)
            .map(|i| k.create_decl(DeclareData::grf(format!("V{i}"), ElemType::F, 8 * rows)))
            .collect();
        let acc = k.create_decl(DeclareData::grf("ACC", ElemType::F, 8));
        let srcs: Vec<_> = vars.iter().map(|&v| k.src(v, 8)).collect();
        let acc_src = k.src(acc, 8);
        let mut b = Builder::new(&mut k);

        for &v in vars.iter() {
            b.mov(8, v, Operand::imm_f32(1.0));
        }

        b.mov(8, acc, Operand::imm_f32(0.0));

        for src in srcs {
            b.binary(Opcode::Add, 8, acc, acc_src, src);
        }

        b.eot();
        k.build_flowgraph();

        (k, vars)
    }

    #[test]
    fn interfering_nodes_get_disjoint_rows() {
        let (mut k, vars) = pressure_kernel(CodegenOptions::default(), 6, 2);
        let (graph, outcome) = color(&mut k);

        let ColorOutcome::Colored(colors) = outcome else {
            panic!("six two-row variables should fit");
        };

        let colors: SaHashMap<_, _> = colors.into_iter().collect();

        for &a in vars.iter() {
            for &b in vars.iter() {
                if a != b {
                    assert!(graph.interferes(a, b));

                    let (ra, rb) = (colors[&a].reg, colors[&b].reg);

                    assert!(ra + 2 <= rb || rb + 2 <= ra, "{ra} and {rb} overlap");
                }
            }
        }
    }

    #[test]
    fn too_much_pressure_spills() {
        let options = CodegenOptions::default().with_total_grf(8);
        let (mut k, _) = pressure_kernel(options, 5, 2);
        let (_, outcome) = color(&mut k);

        let ColorOutcome::Spill(spills) = outcome else {
            panic!("ten rows can't fit in eight");
        };

        assert!(!spills.is_empty());
        assert!(spills.iter().all(|d| !k.decls[*d].eot));
    }

    #[test]
    fn precolored_neighbors_are_avoided() {
        let (mut k, vars) = pressure_kernel(CodegenOptions::default(), 2, 1);

        k.decls[vars[0]].fixed = Some(PhysReg::new(0, 0));

        let (_, outcome) = color(&mut k);
        let ColorOutcome::Colored(colors) = outcome else {
            panic!("two rows should fit");
        };

        let colors: SaHashMap<_, _> = colors.into_iter().collect();

        assert!(!colors.contains_key(&vars[0]));
        assert_ne!(colors[&vars[1]].reg, 0);
    }

    #[test]
    fn operands_read_together_get_opposite_banks() {
        let mut k = kernel_for(
            Platform::Gen12Lp,
            CodegenOptions::default().with_bank_conflict_reduction(true),
        );
        let a = k.create_decl(DeclareData::grf("A", ElemType::F, 16));
        let b_ = k.create_decl(DeclareData::grf("B", ElemType::F, 16));
        let c = k.create_decl(DeclareData::grf("C", ElemType::F, 16));
        let mut b = Builder::new(&mut k);

        b.mov(16, a, Operand::imm_f32(1.0));
        b.mov(16, b_, Operand::imm_f32(2.0));
        b.add(16, c, a, b_);
        b.eot();
        k.build_flowgraph();

        let pta = PointsToAnalysis::compute(&mut k);
        let live = LivenessAnalysis::compute(&k, &pta, LiveFiles::GRF);
        let graph = InterferenceGraph::build(&k, &pta, &live, RegFile::Grf);
        let gc = GraphColor::new(&k, &graph);

        assert_eq!(gc.bank_of(a), BankClass::FirstEven);
        assert_eq!(gc.bank_of(b_), BankClass::SecondOdd);
        assert_eq!(gc.bank_of(c), BankClass::None);

        let ColorOutcome::Colored(colors) = gc.color() else {
            panic!("three variables should fit");
        };
        let colors: SaHashMap<_, _> = colors.into_iter().collect();

        assert_eq!(colors[&a].reg % 2, 0);
        assert_eq!(colors[&b_].reg % 2, 1);
        assert!(colors[&b_].reg > colors[&a].reg);
    }
}
