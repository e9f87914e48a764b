//======---------------------------------------------------------------======//
//                                                                           //
// Copyright 2022-2023 Evan Cox <evanacox00@gmail.com>. All rights reserved. //
//                                                                           //
// Use of this source code is governed by a BSD-style license that can be    //
// found in the LICENSE.txt file at the root of this project, or at the      //
// following link: https://opensource.org/licenses/BSD-3-Clause              //
//                                                                           //
//======---------------------------------------------------------------======//

use crate::conformity::is_alu;
use crate::conformity::split::touches_acc;
use crate::flowgraph::Block;
use crate::ir::{Declare, Inst, InstData, Kernel, Operand, RegBase, RegFile, RegOperand, Region};
use crate::target::Feature;
use crate::utility::{SaHashMap, SaHashSet};
use log::{debug, trace};
use smallvec::SmallVec;

// a block-local value that could live in an accumulator, positions are
// indices into the block
#[derive(Debug)]
struct AccInterval {
    var: Declare,
    def: usize,
    uses: SmallVec<[usize; 4]>,
    exec_size: u8,
    mask_offset: u8,
    no_mask: bool,
}

impl AccInterval {
    fn end(&self) -> usize {
        self.uses.last().copied().unwrap_or(self.def)
    }

    // more uses and a shorter life make a value a better candidate
    fn cost(&self) -> f64 {
        let uses = self.uses.len() as f64;
        let distance = (self.end() - self.def).max(1) as f64;

        uses * uses * uses / distance
    }
}

fn is_plain_alu(data: &InstData) -> bool {
    is_alu(data) && !data.op.is_math() && !data.op.is_ternary() && !touches_acc(data)
}

// whether `data` defines `var` in a way that can be moved into an accumulator
fn is_candidate_def(kernel: &Kernel, data: &InstData, var: Declare) -> bool {
    let decl = &kernel.decls[var];
    let ty = data.dst.ty;

    let whole = data.dst.declare() == Some(var) && data.full_def(&kernel.decls) == Some(var);
    let storage_ok = decl.file == RegFile::Grf
        && decl.alias.is_none()
        && !decl.is_input
        && !decl.addr_taken
        && !decl.eot
        && !decl.callee_save
        && decl.fixed.is_none()
        && !kernel.fg.is_global_operand(var);
    let type_ok = ty == decl.ty
        && !ty.is_byte()
        && ty.size() != 8
        && (ty.is_float() || kernel.target.supports(Feature::IntAccSubstitution));

    is_plain_alu(data)
        && data.pred.is_none()
        && whole
        && storage_ok
        && type_ok
        && decl.byte_size() <= kernel.target.acc_bytes()
}

// whether `data` reads `interval`'s value in a way an accumulator can replace
fn is_candidate_use(kernel: &Kernel, data: &InstData, interval: &AccInterval) -> bool {
    let reads = data
        .use_declares()
        .into_iter()
        .filter(|&d| kernel.decls.root(d) == interval.var)
        .count();

    let src0_ok = match data.srcs.first() {
        Some(Operand::Reg(r)) => {
            r.base == RegBase::Var(interval.var)
                && r.row == 0
                && r.sub_reg == 0
                && r.ty == kernel.decls[interval.var].ty
                && (data.exec_size == 1 || r.region.flat_stride(data.exec_size) == Some(1))
        }
        _ => false,
    };

    reads == 1
        && src0_ok
        && is_plain_alu(data)
        && data.exec_size == interval.exec_size
        && data.mask_offset == interval.mask_offset
        && data.no_mask == interval.no_mask
}

fn collect_intervals(kernel: &Kernel, block: Block) -> Vec<AccInterval> {
    let insts = &kernel.fg.blocks[block].insts;
    let mut open: SaHashMap<Declare, AccInterval> = SaHashMap::default();
    let mut rejected: SaHashSet<Declare> = SaHashSet::default();

    for (pos, &inst) in insts.iter().enumerate() {
        let data = &kernel.insts[inst];

        let mut read: SmallVec<[Declare; 4]> = SmallVec::new();

        for d in data.use_declares() {
            let root = kernel.decls.root(d);

            if !read.contains(&root) {
                read.push(root);
            }
        }

        for var in read {
            if rejected.contains(&var) {
                continue;
            }

            let qualifies = open
                .get(&var)
                .map_or(false, |interval| is_candidate_use(kernel, data, interval));

            if !qualifies {
                // read before its definition, or in a way the accumulator
                // cannot express
                open.remove(&var);
                rejected.insert(var);
            } else if let Some(interval) = open.get_mut(&var) {
                interval.uses.push(pos);
            }
        }

        for var in data.def_declares() {
            let var = kernel.decls.root(var);

            if rejected.contains(&var) {
                continue;
            }

            if open.remove(&var).is_some() || !is_candidate_def(kernel, data, var) {
                rejected.insert(var);
                continue;
            }

            open.insert(
                var,
                AccInterval {
                    var,
                    def: pos,
                    uses: SmallVec::new(),
                    exec_size: data.exec_size,
                    mask_offset: data.mask_offset,
                    no_mask: data.no_mask,
                },
            );
        }
    }

    let mut intervals: Vec<AccInterval> = open
        .into_values()
        .filter(|interval| !interval.uses.is_empty())
        .filter(|interval| {
            // anything else using an accumulator while the value is live
            // would clobber it
            (interval.def + 1..=interval.end())
                .filter(|pos| !interval.uses.contains(pos))
                .all(|pos| !touches_acc(&kernel.insts[insts[pos]]))
        })
        .collect();

    intervals.sort_by_key(|interval| interval.def);
    intervals
}

// linear scan over `num_acc` accumulators, returns the chosen intervals
// with their accumulator
fn assign(intervals: Vec<AccInterval>, num_acc: usize) -> Vec<(AccInterval, u8)> {
    let mut active: Vec<(AccInterval, u8)> = Vec::new();
    let mut done = Vec::new();
    let mut free: Vec<u8> = (0..num_acc as u8).rev().collect();

    for interval in intervals {
        let mut i = 0;

        while i < active.len() {
            if active[i].0.end() < interval.def {
                let (expired, acc) = active.swap_remove(i);

                free.push(acc);
                done.push((expired, acc));
            } else {
                i += 1;
            }
        }

        if let Some(acc) = free.pop() {
            active.push((interval, acc));
            continue;
        }

        let cheapest = active
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| a.0.cost().total_cmp(&b.0.cost()))
            .map(|(i, _)| i);

        match cheapest {
            Some(i) if interval.cost() > active[i].0.cost() => {
                let (evicted, acc) = active.swap_remove(i);

                trace!("{:?} takes acc{acc} from {:?}", interval.var, evicted.var);
                active.push((interval, acc));
            }
            _ => trace!("no accumulator left for {:?}", interval.var),
        }
    }

    done.extend(active);
    done
}

fn rewrite(kernel: &mut Kernel, block: Block, interval: &AccInterval, acc: u8) {
    let insts = &kernel.fg.blocks[block].insts;
    let def = insts[interval.def];
    let uses: SmallVec<[Inst; 4]> = interval.uses.iter().map(|&pos| insts[pos]).collect();
    let ty = kernel.decls[interval.var].ty;

    kernel.insts[def].dst = RegOperand::acc(acc, ty, Region::dst(1));

    for inst in uses {
        if let Some(r) = kernel.insts[inst].srcs[0].as_reg_mut() {
            r.base = RegBase::Acc(acc);
        }
    }
}

/// Replaces short-lived block-local values with accumulators.
///
/// A value qualifies when it is fully defined by one plain ALU instruction
/// and only read as `src0` of plain ALU instructions of the same shape in
/// the same block, with nothing else touching an accumulator in between.
/// When there are more candidates than accumulators, the ones with the
/// most uses over the shortest distance win.
///
/// Returns how many values were substituted.
pub fn substitute_accumulators(kernel: &mut Kernel) -> usize {
    let num_acc = kernel.target.num_acc() as usize;
    let mut count = 0;

    for block in kernel.fg.order.clone() {
        let intervals = collect_intervals(kernel, block);

        if intervals.is_empty() {
            continue;
        }

        for (interval, acc) in assign(intervals, num_acc) {
            trace!("{} lives in acc{acc}", kernel.decls[interval.var].name);

            rewrite(kernel, block, &interval, acc);
            count += 1;
        }
    }

    debug!("substituted {count} values with accumulators");

    count
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::*;
    use crate::options::CodegenOptions;
    use crate::target::Platform;
    use crate::testing::*;

    fn acc_kernel(platform: Platform) -> Kernel {
        kernel_for(platform, CodegenOptions::default())
    }

    fn grf(k: &mut Kernel, name: &str, ty: ElemType, elems: u32) -> Declare {
        k.create_decl(DeclareData::grf(name, ty, elems))
    }

    // where `var` still appears after substitution
    fn mentions(k: &Kernel, var: Declare) -> usize {
        all_insts(k)
            .into_iter()
            .filter(|&i| {
                let data = &k.insts[i];

                data.dst.declare() == Some(var) || data.use_declares().contains(&var)
            })
            .count()
    }

    #[test]
    fn chained_value_moves_into_the_accumulator() {
        let mut k = acc_kernel(Platform::Gen12Lp);
        let x = grf(&mut k, "X", ElemType::F, 16);
        let t = grf(&mut k, "T", ElemType::F, 16);
        let y = grf(&mut k, "Y", ElemType::F, 16);
        let (xs, ts) = (k.src(x, 16), k.src(t, 16));
        let mut b = Builder::new(&mut k);

        b.mov(16, x, Operand::imm_f32(1.0));
        b.binary(Opcode::Mul, 16, t, xs, xs);
        b.binary(Opcode::Add, 16, y, ts, xs);
        b.eot();
        k.build_flowgraph();

        assert_eq!(substitute_accumulators(&mut k), 1);
        assert_eq!(mentions(&k, t), 0);

        let insts = all_insts(&k);

        assert_eq!(k.insts[insts[1]].dst.base, RegBase::Acc(0));
        assert_eq!(k.insts[insts[2]].srcs[0].as_reg().unwrap().base, RegBase::Acc(0));
    }

    #[test]
    fn conformity_runs_substitution_when_enabled() {
        let build = |options: CodegenOptions| {
            let mut k = kernel_for(Platform::Gen12Lp, options);
            let x = grf(&mut k, "X", ElemType::F, 8);
            let t = grf(&mut k, "T", ElemType::F, 8);
            let xs = k.src(x, 8);
            let ts = k.src(t, 8);
            let mut b = Builder::new(&mut k);

            b.mov(8, x, Operand::imm_f32(1.0));
            b.binary(Opcode::Add, 8, t, xs, xs);
            b.binary(Opcode::Add, 8, x, ts, xs);
            b.eot();
            k.build_flowgraph();

            crate::conformity::HwConformity::new(&mut k).run().acc_substituted
        };

        assert_eq!(build(CodegenOptions::default().with_acc_substitution(true)), 1);
        assert_eq!(build(CodegenOptions::default().with_acc_substitution(false)), 0);
    }

    // `script` is a list of (temp, is_def), a def is `mov t, x` and a use
    // is `add y, t, x`
    fn three_temps(platform: Platform, ty: ElemType, script: &[(usize, bool)]) -> (Kernel, [Declare; 3]) {
        let mut k = acc_kernel(platform);
        let x = grf(&mut k, "X", ty, 8);
        let y = grf(&mut k, "Y", ty, 8);
        let temps = [
            grf(&mut k, "T0", ty, 8),
            grf(&mut k, "T1", ty, 8),
            grf(&mut k, "T2", ty, 8),
        ];
        let xs = k.src(x, 8);
        let srcs: Vec<Operand> = temps.iter().map(|&t| k.src(t, 8)).collect();
        let mut b = Builder::new(&mut k);

        b.mov(8, x, Operand::imm(1, ElemType::D));

        for &(temp, is_def) in script {
            if is_def {
                b.mov(8, temps[temp], xs);
            } else {
                b.binary(Opcode::Add, 8, y, srcs[temp], xs);
            }
        }

        b.eot();
        k.build_flowgraph();

        (k, temps)
    }

    const DEF: bool = true;
    const USE: bool = false;

    #[test]
    fn cheap_values_lose_their_accumulator() {
        // T0 is used three times, T1 once over a shorter range, T2 once
        // over a longer one while both accumulators are busy
        let (mut k, [t0, t1, t2]) = three_temps(
            Platform::Gen9,
            ElemType::F,
            &[
                (0, DEF),
                (1, DEF),
                (0, USE),
                (2, DEF),
                (1, USE),
                (0, USE),
                (0, USE),
                (2, USE),
            ],
        );

        assert_eq!(substitute_accumulators(&mut k), 2);
        assert_eq!(mentions(&k, t0), 0);
        assert_eq!(mentions(&k, t1), 0);
        assert_eq!(mentions(&k, t2), 2);
    }

    #[test]
    fn valuable_values_evict() {
        let (mut k, [t0, t1, t2]) = three_temps(
            Platform::Gen9,
            ElemType::F,
            &[
                (0, DEF),
                (1, DEF),
                (2, DEF),
                (2, USE),
                (2, USE),
                (1, USE),
                (0, USE),
            ],
        );

        assert_eq!(substitute_accumulators(&mut k), 2);
        assert_eq!(mentions(&k, t0), 2);
        assert_eq!(mentions(&k, t1), 0);
        assert_eq!(mentions(&k, t2), 0);
    }

    #[test]
    fn integers_need_hardware_support() {
        let script = [(0, DEF), (0, USE)];
        let (mut k, _) = three_temps(Platform::Gen9, ElemType::D, &script);

        assert_eq!(substitute_accumulators(&mut k), 0);

        let (mut k, _) = three_temps(Platform::Gen12Lp, ElemType::D, &script);

        assert_eq!(substitute_accumulators(&mut k), 1);
    }

    #[test]
    fn accumulator_users_in_between_block_substitution() {
        let mut k = acc_kernel(Platform::Gen12Lp);
        let x = grf(&mut k, "X", ElemType::F, 8);
        let t = grf(&mut k, "T", ElemType::F, 8);
        let y = grf(&mut k, "Y", ElemType::F, 8);
        let (xs, ts) = (k.src(x, 8), k.src(t, 8));
        let mut b = Builder::new(&mut k);

        b.mov(8, x, Operand::imm_f32(1.0));
        b.mov(8, t, xs);
        b.push(
            InstData::new(Opcode::Mov, 8)
                .with_dst(RegOperand::acc(0, ElemType::F, Region::dst(1)))
                .with_src(xs),
        );
        b.binary(Opcode::Add, 8, y, ts, xs);
        b.eot();
        k.build_flowgraph();

        assert_eq!(substitute_accumulators(&mut k), 0);
    }

    #[test]
    fn only_src0_reads_qualify() {
        let mut k = acc_kernel(Platform::Gen12Lp);
        let x = grf(&mut k, "X", ElemType::F, 8);
        let t = grf(&mut k, "T", ElemType::F, 8);
        let y = grf(&mut k, "Y", ElemType::F, 8);
        let (xs, ts) = (k.src(x, 8), k.src(t, 8));
        let mut b = Builder::new(&mut k);

        b.mov(8, x, Operand::imm_f32(1.0));
        b.mov(8, t, xs);
        b.binary(Opcode::Add, 8, y, xs, ts);
        b.eot();
        k.build_flowgraph();
        substitute_accumulators(&mut k);

        // T is only ever read as src1
        assert_eq!(mentions(&k, t), 2);

        let add = all_insts(&k)
            .into_iter()
            .find(|&i| k.insts[i].op == Opcode::Add)
            .unwrap();

        assert_eq!(k.insts[add].srcs[1].as_reg().unwrap().base, RegBase::Var(t));
    }
}
