//======---------------------------------------------------------------======//
//                                                                           //
// Copyright 2022-2023 Evan Cox <evanacox00@gmail.com>. All rights reserved. //
//                                                                           //
// Use of this source code is governed by a BSD-style license that can be    //
// found in the LICENSE.txt file at the root of this project, or at the      //
// following link: https://opensource.org/licenses/BSD-3-Clause              //
//                                                                           //
//======---------------------------------------------------------------======//

use crate::analysis::{insert_pseudo_kills, LiveFiles, LivenessAnalysis, PointsToAnalysis};
use crate::ir::{Declare, Kernel, RegFile};
use crate::regalloc::{
    verify_allocation, ColorOutcome, GraphColor, InterferenceGraph, LocalRA, Rematerialization,
    SpillManager,
};
use log::{debug, warn};

/// What a successful allocation did to get there.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AllocStats {
    /// How many rounds of coloring were needed.
    pub rounds: u32,
    /// Pseudo kills inserted, including those for spill code.
    pub pseudo_kills: usize,
    /// Variables placed by local allocation in the first round.
    pub local: usize,
    /// Uses that were rematerialized instead of spilled.
    pub rematerialized: usize,
    /// Every variable that was given spill code.
    pub spilled: Vec<Declare>,
    /// Rows of scratch space the spilled variables take up.
    pub scratch_rows: u32,
}

/// Gives every variable in a kernel a physical location.
///
/// Each round recomputes the analyses, colors the address and flag files,
/// then the GRF. When the GRF does not color, the failed variables are
/// first rematerialized where that is possible and spilled to scratch
/// otherwise, and the next round starts over on the rewritten kernel.
pub struct RegisterAllocator<'k> {
    kernel: &'k mut Kernel,
    spills: SpillManager,
}

impl<'k> RegisterAllocator<'k> {
    /// Prepares to allocate `kernel`, which must already have its flowgraph.
    pub fn new(kernel: &'k mut Kernel) -> Self {
        Self {
            kernel,
            spills: SpillManager::new(),
        }
    }

    /// Runs allocation until every variable has a location. Returns `None`
    /// when the round limit is hit first, in which case the kernel keeps
    /// any spill code that was inserted but has no usable assignment.
    pub fn run(&mut self) -> Option<AllocStats> {
        let mut stats = AllocStats {
            pseudo_kills: insert_pseudo_kills(self.kernel),
            ..AllocStats::default()
        };

        for round in 0..self.kernel.options.max_ra_iterations {
            stats.rounds = round + 1;

            self.clear_assignments();

            // spill and fill payloads from the last round are written piecewise
            if round > 0 {
                stats.pseudo_kills += insert_pseudo_kills(self.kernel);
            }

            let pta = PointsToAnalysis::compute(self.kernel);

            self.color_small_file(&pta, RegFile::Address);
            self.color_small_file(&pta, RegFile::Flag);

            let live = LivenessAnalysis::compute(self.kernel, &pta, LiveFiles::GRF);

            // local results would only constrain the spill code later on
            if round == 0 {
                stats.local = LocalRA::new(self.kernel).run();
            }

            let graph = InterferenceGraph::build(self.kernel, &pta, &live, RegFile::Grf);
            let outcome = GraphColor::new(self.kernel, &graph)
                .with_unspillable(self.spills.temps().iter().copied())
                .color();

            let failed = match outcome {
                ColorOutcome::Colored(colors) => {
                    for (var, loc) in colors {
                        self.kernel.decls[var].phys = Some(loc);
                    }

                    let violations = verify_allocation(self.kernel, &graph);

                    assert!(
                        violations.is_empty(),
                        "register allocation is unsound: {}",
                        violations[0]
                    );

                    stats.scratch_rows = self.spills.scratch_rows();
                    debug!(
                        "allocation finished after {} rounds, {} spilled",
                        stats.rounds,
                        stats.spilled.len()
                    );

                    return Some(stats);
                }
                ColorOutcome::Spill(failed) => failed,
            };

            if self.kernel.options.rematerialization {
                let count = Rematerialization::new(self.kernel, &pta, &live, &failed).run();

                if count > 0 {
                    debug!("round {}: rematerialized {count} uses", stats.rounds);
                    stats.rematerialized += count;

                    continue;
                }
            }

            let spillable: Vec<Declare> = failed
                .into_iter()
                .filter(|&d| self.is_spillable(d))
                .collect();

            if spillable.is_empty() {
                warn!("nothing left to spill after {} rounds", stats.rounds);

                return None;
            }

            debug!("round {}: spilling {} variables", stats.rounds, spillable.len());

            self.spills.insert_spill_code(self.kernel, &spillable);
            stats.spilled.extend(spillable);
        }

        warn!(
            "register allocation gave up after {} rounds",
            self.kernel.options.max_ra_iterations
        );

        None
    }

    fn is_spillable(&self, decl: Declare) -> bool {
        let data = &self.kernel.decls[decl];

        data.file == RegFile::Grf
            && !data.eot
            && !data.is_input
            && !data.addr_taken
            && !data.spilled
            && !self.spills.temps().contains(&decl)
    }

    // every round starts from only the fixed locations
    fn clear_assignments(&mut self) {
        for d in self.kernel.decls.keys().collect::<Vec<_>>() {
            self.kernel.decls[d].phys = None;
        }
    }

    // these files cannot spill, running out of them is an internal error
    fn color_small_file(&mut self, pta: &PointsToAnalysis, file: RegFile) {
        let files = match file {
            RegFile::Address => LiveFiles::ADDRESS,
            RegFile::Flag => LiveFiles::FLAG,
            RegFile::Grf => unreachable!("the GRF is colored with spilling"),
        };

        if self.kernel.decls.roots_in(file).next().is_none() {
            return;
        }

        let live = LivenessAnalysis::compute(self.kernel, pta, files);
        let graph = InterferenceGraph::build(self.kernel, pta, &live, file);

        match GraphColor::new(self.kernel, &graph).color() {
            ColorOutcome::Colored(colors) => {
                for (var, loc) in colors {
                    self.kernel.decls[var].phys = Some(loc);
                }
            }
            ColorOutcome::Spill(failed) => {
                let names: Vec<&str> = failed
                    .iter()
                    .map(|&d| self.kernel.decls[d].name.as_str())
                    .collect();

                panic!("ran out of {file:?} registers for {names:?}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::*;
    use crate::options::CodegenOptions;
    use crate::target::Platform;
    use crate::testing::*;

    // `n` values of `rows` rows each, all live at once before being summed
    fn pressure(options: CodegenOptions, n: usize, op: Option<MathFn>) -> (Kernel, Vec<Declare>) {
        let mut k = kernel_for(Platform::Gen12Lp, options);
        let vars: Vec<_> = (0..n)
            .map(|i| k.create_decl(DeclareData::grf(format!("V{i}"), ElemType::F, 16)))
            .collect();
        let sum = k.create_decl(DeclareData::grf("SUM", ElemType::F, 8));
        let srcs: Vec<_> = vars.iter().map(|&v| k.src(v, 8)).collect();
        let sum_src = k.src(sum, 8);
        let mut b = Builder::new(&mut k);

        for (i, &v) in vars.iter().enumerate() {
            let value = Operand::imm_f32(i as f32 + 2.0);

            match op {
                Some(f) => b.push(
                    InstData::new(Opcode::Math(f), 16)
                        .with_dst(RegOperand::dst(v, ElemType::F))
                        .with_src(value),
                ),
                None => b.mov(16, v, value),
            };
        }

        b.mov(8, sum, Operand::imm_f32(0.0));

        for src in srcs {
            b.binary(Opcode::Add, 8, sum, sum_src, src);
        }

        b.eot();
        k.build_flowgraph();

        (k, vars)
    }

    #[test]
    fn easy_kernel_colors_in_one_round() {
        init_logging();

        let (mut k, vars) = pressure(CodegenOptions::default(), 3, None);
        let stats = RegisterAllocator::new(&mut k).run().unwrap();

        assert_eq!(stats.rounds, 1);
        assert!(stats.spilled.is_empty());
        assert!(vars.iter().all(|&v| k.decls[v].location().is_some()));
    }

    #[test]
    fn constants_are_rematerialized_before_spilling() {
        let options = CodegenOptions::default().with_total_grf(8);
        let (mut k, vars) = pressure(options, 6, None);
        let stats = RegisterAllocator::new(&mut k).run().unwrap();

        assert!(stats.rematerialized > 0);
        assert!(stats.spilled.is_empty());
        assert!(vars.iter().all(|&v| !k.decls[v].spilled));
    }

    #[test]
    fn math_results_are_spilled() {
        let options = CodegenOptions::default().with_total_grf(8);
        let (mut k, _) = pressure(options, 6, Some(MathFn::Sqrt));
        let stats = RegisterAllocator::new(&mut k).run().unwrap();

        assert!(stats.rounds > 1);
        assert!(!stats.spilled.is_empty());
        assert!(stats.scratch_rows >= 2);
        assert!(stats.spilled.iter().all(|&v| k.decls[v].spilled));
        assert!(opcodes(&k).contains(&Opcode::Send));
    }

    #[test]
    fn spilling_without_remat() {
        let options = CodegenOptions::default()
            .with_total_grf(8)
            .with_rematerialization(false);
        let (mut k, _) = pressure(options, 6, None);
        let stats = RegisterAllocator::new(&mut k).run().unwrap();

        assert_eq!(stats.rematerialized, 0);
        assert!(!stats.spilled.is_empty());

        // the only piecewise writes are to the spill payloads
        assert!(stats.pseudo_kills > 0);
    }

    #[test]
    fn round_limit_gives_up() {
        let mut options = CodegenOptions::default().with_total_grf(8);

        options.max_ra_iterations = 1;

        let (mut k, _) = pressure(options, 6, Some(MathFn::Sqrt));

        assert_eq!(RegisterAllocator::new(&mut k).run(), None);
    }

    #[test]
    fn flags_are_colored() {
        let mut k = kernel();
        let pred = flag_pred(&mut k);
        let x = k.create_decl(DeclareData::grf("X", ElemType::F, 8));
        let mut b = Builder::new(&mut k);

        b.push(
            InstData::new(Opcode::Mov, 8)
                .with_dst(RegOperand::dst(x, ElemType::F))
                .with_src(Operand::imm_f32(1.0))
                .with_pred(pred),
        );
        b.eot();
        k.build_flowgraph();

        assert!(RegisterAllocator::new(&mut k).run().is_some());
        assert!(k.decls[pred.flag].location().is_some());
    }
}
