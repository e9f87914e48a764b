//======---------------------------------------------------------------======//
//                                                                           //
// Copyright 2022-2023 Evan Cox <evanacox00@gmail.com>. All rights reserved. //
//                                                                           //
// Use of this source code is governed by a BSD-style license that can be    //
// found in the LICENSE.txt file at the root of this project, or at the      //
// following link: https://opensource.org/licenses/BSD-3-Clause              //
//                                                                           //
//======---------------------------------------------------------------======//

use crate::analysis::{LivenessAnalysis, PointsToAnalysis};
use crate::flowgraph::Block;
use crate::ir::{Declare, Inst, InstData, Kernel, Opcode, Operand, RegBase, RegFile, Sfid};
use crate::utility::{SaHashMap, SaHashSet};
use log::{debug, trace};
use smallvec::SmallVec;

#[derive(Clone, Debug, Default)]
struct References {
    defs: SmallVec<[(Block, Inst); 2]>,
    uses: u32,
    last_use: u32,
}

// a clone of a definition placed in `block`, right before lexical id `at`
#[derive(Copy, Clone, Debug)]
struct RematClone {
    block: Block,
    temp: Declare,
    at: u32,
}

/// Recomputes cheap values right before their uses instead of keeping
/// them in a register across a high-pressure region.
///
/// A use is only rewritten when every one of these holds:
///
/// 1. its value has exactly one definition, covering the whole variable
/// 2. that definition has no predicate and no condition modifier
/// 3. the definition is not a send (sampler sends excepted, their payload
///    is recomputed too) and not a math instruction
/// 4. definition and use sit in the same innermost loop, or the
///    definition is outside of every loop
/// 5. the block of the use is under high pressure, or the variable was
///    picked for spilling
/// 6. the variable has no more than a handful of uses
/// 7. every source of the definition still holds the same value at the
///    use, and none of them is indirect or pre-assigned
///
/// Anything else is declined.
pub struct Rematerialization<'k> {
    kernel: &'k mut Kernel,
    refs: SaHashMap<Declare, References>,
    hot: SaHashSet<Block>,
    spilled: SaHashSet<Declare>,
    cache: SaHashMap<Inst, RematClone>,
    removed: SaHashSet<Inst>,
}

impl<'k> Rematerialization<'k> {
    /// Prepares to rematerialize in `kernel`. `live` must be GRF liveness
    /// of the current kernel.
    pub fn new(
        kernel: &'k mut Kernel,
        pta: &PointsToAnalysis,
        live: &LivenessAnalysis,
        spilled: &[Declare],
    ) -> Self {
        let threshold = kernel.options.remat.reg_pressure;
        let hot = {
            let k: &Kernel = kernel;

            k.fg.order
                .iter()
                .copied()
                .filter(|&b| live.max_register_pressure(k, pta, b) >= threshold)
                .collect()
        };

        let mut remat = Self {
            kernel,
            refs: SaHashMap::default(),
            hot,
            spilled: spilled.iter().copied().collect(),
            cache: SaHashMap::default(),
            removed: SaHashSet::default(),
        };

        remat.populate_refs();
        remat
    }

    fn populate_refs(&mut self) {
        let kernel = &*self.kernel;

        for &block in kernel.fg.order.iter() {
            for &inst in kernel.fg.blocks[block].insts.iter() {
                let data = &kernel.insts[inst];

                for d in data.use_declares() {
                    let r = self.refs.entry(kernel.decls.root(d)).or_default();

                    r.uses += 1;
                    r.last_use = r.last_use.max(data.lexical_id);
                }

                for d in data.def_declares() {
                    let r = self.refs.entry(kernel.decls.root(d)).or_default();

                    r.defs.push((block, inst));
                }
            }
        }
    }

    /// Rewrites every eligible use. Returns how many uses were rewritten.
    pub fn run(&mut self) -> usize {
        let order = self.kernel.fg.order.clone();
        let mut count = 0;

        for block in order {
            let mut i = 0;

            while i < self.kernel.fg.blocks[block].insts.len() {
                let inst = self.kernel.fg.blocks[block].insts[i];

                for s in 0..self.kernel.insts[inst].srcs.len() {
                    let Some(var) = self.kernel.insts[inst].srcs[s].declare() else {
                        continue;
                    };

                    if !self.hot.contains(&block) && !self.spilled.contains(&var) {
                        continue;
                    }

                    let Some(def) = self.can_rematerialize(var, block, inst) else {
                        continue;
                    };

                    i += self.rematerialize(var, def, block, i, s);
                    count += 1;
                }

                i += 1;
            }
        }

        for &inst in self.removed.iter() {
            for b in self.kernel.fg.order.iter() {
                self.kernel.fg.blocks[*b].insts.retain(|i| i != &inst);
            }
        }

        if count > 0 {
            self.kernel.renumber();
            debug!(
                "rematerialized {count} uses, {} definitions became dead",
                self.removed.len()
            );
        }

        count
    }

    /// Returns the definition to clone for the use of `var` in `use_inst`,
    /// or `None` if it can't be done safely.
    fn can_rematerialize(&self, var: Declare, use_block: Block, use_inst: Inst) -> Option<Inst> {
        let kernel = &*self.kernel;
        let data = &kernel.decls[var];

        // only direct uses of unconstrained GRF roots
        if data.file != RegFile::Grf
            || data.alias.is_some()
            || data.fixed.is_some()
            || data.is_input
            || data.addr_taken
            || data.eot
        {
            return None;
        }

        let info = self.refs.get(&var)?;

        if info.uses > kernel.options.remat.max_uses {
            return None;
        }

        let [(def_block, def_inst)] = info.defs[..] else {
            return None;
        };

        if self.removed.contains(&def_inst) {
            return None;
        }

        let def = &kernel.insts[def_inst];
        let use_lex = kernel.insts[use_inst].lexical_id;

        if def.dst.base != RegBase::Var(var)
            || def.full_def(&kernel.decls) != Some(var)
            || def.lexical_id >= use_lex
            || def.pred.is_some()
            || def.cond_mod.is_some()
            || def.implicit_acc_src.is_some()
            || def.implicit_acc_dst.is_some()
            || def.op.is_math()
            || def.op.is_control_flow()
            || def.op.is_pseudo()
        {
            return None;
        }

        let header = match def.send {
            None => None,
            Some(desc) if desc.sfid == Sfid::Sampler && !desc.eot => {
                let payload = kernel.decls.root(def.srcs.first()?.declare()?);

                if self.holds_at(payload, use_lex) {
                    None
                } else {
                    Some(self.clonable_header(payload, use_lex)?)
                }
            }
            Some(_) => return None,
        };

        let loop_of = |b: Block| kernel.fg.innermost_loop(b).map(|l| l.header());
        let def_loop = loop_of(def_block);

        if def_loop.is_some() && def_loop != loop_of(use_block) {
            return None;
        }

        let srcs = if header.is_some() {
            &def.srcs[1..]
        } else {
            &def.srcs[..]
        };

        srcs.iter()
            .all(|src| self.src_available(src, use_lex))
            .then_some(def_inst)
    }

    // whether `var` (a root) holds the value from its only definition at `at`
    fn holds_at(&self, var: Declare, at: u32) -> bool {
        let kernel = &*self.kernel;
        let data = &kernel.decls[var];

        if data.fixed.is_some() || data.alias.is_some() || data.addr_taken {
            return false;
        }

        let Some(info) = self.refs.get(&var) else {
            return false;
        };

        let defined = match info.defs.len() {
            0 => data.is_input,
            1 => !self.removed.contains(&info.defs[0].1),
            _ => false,
        };

        defined && info.last_use >= at
    }

    fn src_available(&self, src: &Operand, at: u32) -> bool {
        match src {
            Operand::Imm { .. } => true,
            Operand::AddrOf { .. } => false,
            Operand::Reg(r) => match r.base {
                RegBase::Var(d) => {
                    let root = self.kernel.decls.root(d);

                    self.holds_at(root, at)
                }
                _ => false,
            },
        }
    }

    // a sampler payload that is dead at the use can be rebuilt if it is a
    // single mov of available values
    fn clonable_header(&self, payload: Declare, at: u32) -> Option<Inst> {
        let kernel = &*self.kernel;
        let info = self.refs.get(&payload)?;
        let [(_, def_inst)] = info.defs[..] else {
            return None;
        };
        let def = &kernel.insts[def_inst];

        let ok = def.op == Opcode::Mov
            && def.dst.base == RegBase::Var(payload)
            && def.full_def(&kernel.decls) == Some(payload)
            && def.pred.is_none()
            && def.cond_mod.is_none()
            && kernel.decls[payload].fixed.is_none()
            && def.srcs.iter().all(|s| self.src_available(s, at));

        ok.then_some(def_inst)
    }

    fn fresh_like(&mut self, var: Declare) -> Declare {
        let (ty, elems, grf_align, sub_align) = {
            let d = &self.kernel.decls[var];

            (d.ty, d.num_elems, d.grf_align, d.sub_align)
        };
        let temp = self.kernel.create_temp(ty, elems);

        self.kernel.decls[temp].grf_align = grf_align;
        self.kernel.decls[temp].sub_align = sub_align;
        temp
    }

    fn count_uses(&mut self, data: &InstData, at: u32, delta: i32) {
        for d in data.use_declares() {
            let root = self.kernel.decls.root(d);
            let r = self.refs.entry(root).or_default();

            r.uses = r.uses.saturating_add_signed(delta);

            if delta > 0 {
                r.last_use = r.last_use.max(at);
            }
        }
    }

    // rewrites source `s` of the instruction at `pos` in `block`, returns
    // how many instructions were inserted in front of it
    fn rematerialize(&mut self, var: Declare, def: Inst, block: Block, pos: usize, s: usize) -> usize {
        let use_inst = self.kernel.fg.blocks[block].insts[pos];
        let use_lex = self.kernel.insts[use_inst].lexical_id;
        let reuse_distance = self.kernel.options.remat.max_local_reuse_distance;
        let mut inserted = 0;

        let cached = self
            .cache
            .get(&def)
            .filter(|c| c.block == block && use_lex.saturating_sub(c.at) <= reuse_distance)
            .map(|c| c.temp);

        let temp = match cached {
            Some(temp) => {
                let r = self.refs.entry(temp).or_default();

                r.uses += 1;
                r.last_use = r.last_use.max(use_lex);
                temp
            }
            None => {
                let temp = self.fresh_like(var);
                let mut clone = self.kernel.insts[def].clone();
                let mut code: SmallVec<[InstData; 2]> = SmallVec::new();

                clone.dst.base = RegBase::Var(temp);
                clone.lexical_id = use_lex;

                if let Some(payload) = clone.srcs.first().and_then(Operand::declare) {
                    let payload = self.kernel.decls.root(payload);
                    let is_sampler = clone.send.map_or(false, |d| d.sfid == Sfid::Sampler);

                    if is_sampler && !self.holds_at(payload, use_lex) {
                        let header_def = self
                            .refs
                            .get(&payload)
                            .and_then(|r| r.defs.first())
                            .map(|&(_, i)| i);

                        if let Some(header_def) = header_def {
                            let header = self.fresh_like(payload);
                            let mut header_clone = self.kernel.insts[header_def].clone();

                            header_clone.dst.base = RegBase::Var(header);
                            header_clone.lexical_id = use_lex;

                            if let Some(r) = clone.srcs[0].as_reg_mut() {
                                r.base = RegBase::Var(header);
                            }

                            self.count_uses(&header_clone, use_lex, 1);
                            self.refs.entry(header).or_default().uses += 1;
                            code.push(header_clone);
                        }
                    }
                }

                self.count_uses(&clone, use_lex, 1);
                code.push(clone);

                let r = self.refs.entry(temp).or_default();

                r.uses = 1;
                r.last_use = use_lex;

                inserted = code.len();

                let insts: Vec<Inst> = code.into_iter().map(|d| self.kernel.create_inst(d)).collect();

                self.kernel.fg.blocks[block].insts.splice(pos..pos, insts);
                self.cache.insert(def, RematClone { block, temp, at: use_lex });
                temp
            }
        };

        if let Some(r) = self.kernel.insts[use_inst].srcs[s].as_reg_mut() {
            r.base = RegBase::Var(temp);
        }

        trace!(
            "rematerialized '{}' for '{}'",
            self.kernel.decls[var].name,
            self.kernel.display_inst(use_inst)
        );

        let info = self.refs.entry(var).or_default();

        info.uses = info.uses.saturating_sub(1);

        if info.uses == 0 {
            self.remove_dead(def);
        }

        inserted
    }

    fn remove_dead(&mut self, def: Inst) {
        let data = self.kernel.insts[def].clone();

        self.removed.insert(def);
        self.count_uses(&data, 0, -1);

        // a payload that only fed the removed definition dies with it
        for d in data.src_declares() {
            let root = self.kernel.decls.root(d);
            let decl = &self.kernel.decls[root];

            if decl.eot || decl.fixed.is_some() || decl.is_input {
                continue;
            }

            let dead = match self.refs.get(&root) {
                Some(r) if r.uses == 0 => match r.defs[..] {
                    [(_, only)] => {
                        let only_data = &self.kernel.insts[only];

                        (!only_data.is_send() && !self.removed.contains(&only)).then_some(only)
                    }
                    _ => None,
                },
                _ => None,
            };

            if let Some(only) = dead {
                self.remove_dead(only);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::LiveFiles;
    use crate::ir::*;
    use crate::testing::*;

    fn remat(k: &mut Kernel, spilled: &[Declare]) -> usize {
        let pta = PointsToAnalysis::compute(k);
        let live = LivenessAnalysis::compute(k, &pta, LiveFiles::GRF);

        Rematerialization::new(k, &pta, &live, spilled).run()
    }

    fn reads(k: &Kernel, var: Declare) -> usize {
        all_insts(k)
            .into_iter()
            .filter(|&i| k.insts[i].src_declares().any(|d| d == var))
            .count()
    }

    #[test]
    fn spilled_constant_is_recomputed_at_its_use() {
        let mut k = kernel();
        let c = k.create_decl(DeclareData::grf("C", ElemType::F, 8));
        let x = k.create_decl(DeclareData::grf("X", ElemType::F, 8));
        let out = k.create_decl(DeclareData::grf("OUT", ElemType::F, 8));
        let (c_src, x_src) = (k.src(c, 8), k.src(x, 8));
        let mut b = Builder::new(&mut k);

        b.mov(8, c, Operand::imm_f32(2.0));
        b.mov(8, x, Operand::imm_f32(1.0));
        b.binary(Opcode::Mul, 8, out, x_src, c_src);
        b.eot();
        k.build_flowgraph();

        assert_eq!(remat(&mut k, &[c]), 1);
        assert_eq!(reads(&k, c), 0);

        // the clone sits right in front of the mul, the original is gone
        assert_eq!(
            opcodes(&k),
            vec![Opcode::Mov, Opcode::Mov, Opcode::Mul, Opcode::Send]
        );

        let insts = all_insts(&k);
        let clone = &k.insts[insts[1]];
        let mul = &k.insts[insts[2]];

        assert_eq!(clone.srcs[0], Operand::imm_f32(2.0));
        assert_eq!(mul.srcs[1].declare(), clone.dst_declare());
    }

    #[test]
    fn nothing_happens_without_pressure() {
        let mut k = kernel();
        let c = k.create_decl(DeclareData::grf("C", ElemType::F, 8));
        let out = k.create_decl(DeclareData::grf("OUT", ElemType::F, 8));
        let c_src = k.src(c, 8);
        let mut b = Builder::new(&mut k);

        b.mov(8, c, Operand::imm_f32(2.0));
        b.mov(8, out, c_src);
        b.eot();
        k.build_flowgraph();

        assert_eq!(remat(&mut k, &[]), 0);
        assert_eq!(reads(&k, c), 1);
    }

    #[test]
    fn unsafe_definitions_are_declined() {
        let mut k = kernel();
        let pred = flag_pred(&mut k);
        let predicated = k.create_decl(DeclareData::grf("P", ElemType::F, 8));
        let math = k.create_decl(DeclareData::grf("M", ElemType::F, 8));
        let twice = k.create_decl(DeclareData::grf("T", ElemType::F, 8));
        let src = k.create_decl(DeclareData::grf("S", ElemType::F, 8));
        let dead_src = k.create_decl(DeclareData::grf("D", ElemType::F, 8));
        let out = k.create_decl(DeclareData::grf("OUT", ElemType::F, 8));
        let reads: Vec<_> = [predicated, math, twice, dead_src]
            .iter()
            .map(|&d| k.src(d, 8))
            .collect();
        let (src_src, out_src) = (k.src(src, 8), k.src(out, 8));
        let mut b = Builder::new(&mut k);

        b.push(
            InstData::new(Opcode::Mov, 8)
                .with_dst(RegOperand::dst(predicated, ElemType::F))
                .with_src(Operand::imm_f32(1.0))
                .with_pred(pred),
        );
        b.push(
            InstData::new(Opcode::Math(MathFn::Sqrt), 8)
                .with_dst(RegOperand::dst(math, ElemType::F))
                .with_src(Operand::imm_f32(4.0)),
        );
        b.mov(8, twice, Operand::imm_f32(1.0));
        b.mov(8, twice, Operand::imm_f32(2.0));
        b.mov(8, src, Operand::imm_f32(3.0));
        b.mov(8, dead_src, src_src);
        // `src` is dead after its only read, so `dead_src` can't be
        // recomputed below
        b.mov(8, out, Operand::imm_f32(0.0));

        for r in reads {
            b.binary(Opcode::Add, 8, out, out_src, r);
        }

        b.eot();
        k.build_flowgraph();

        let spilled = [predicated, math, twice, dead_src];

        assert_eq!(remat(&mut k, &spilled), 0);
    }

    #[test]
    fn loop_invariant_is_not_pulled_into_a_loop_from_another() {
        let mut k = kernel();
        let f0 = k.create_decl(DeclareData::new("F0", RegFile::Flag, ElemType::UW, 1));
        let p = Predicate {
            flag: f0,
            inverse: false,
        };
        let c = k.create_decl(DeclareData::grf("C", ElemType::F, 8));
        let acc = k.create_decl(DeclareData::grf("ACC", ElemType::F, 8));
        let (c_src, acc_src) = (k.src(c, 8), k.src(acc, 8));
        let first = k.create_label("first", false);
        let second = k.create_label("second", false);
        let mut b = Builder::new(&mut k);

        b.mov(8, acc, Operand::imm_f32(0.0));
        b.label(first);
        b.mov(8, c, Operand::imm_f32(2.0));
        b.jmpi(first, Some(p));
        b.label(second);
        b.binary(Opcode::Add, 8, acc, acc_src, c_src);
        b.jmpi(second, Some(p));
        b.eot();
        k.build_flowgraph();

        assert_eq!(remat(&mut k, &[c]), 0);
    }

    #[test]
    fn nearby_uses_share_one_clone() {
        let mut k = kernel();
        let c = k.create_decl(DeclareData::grf("C", ElemType::F, 8));
        let x = k.create_decl(DeclareData::grf("X", ElemType::F, 8));
        let (c_src, x_src) = (k.src(c, 8), k.src(x, 8));
        let mut b = Builder::new(&mut k);

        b.mov(8, c, Operand::imm_f32(2.0));
        b.mov(8, x, Operand::imm_f32(1.0));
        b.binary(Opcode::Mul, 8, x, x_src, c_src);
        b.binary(Opcode::Mul, 8, x, x_src, c_src);

        // far enough away to need its own clone
        for _ in 0..45 {
            b.binary(Opcode::Add, 8, x, x_src, x_src);
        }

        b.binary(Opcode::Mul, 8, x, x_src, c_src);
        b.eot();
        k.build_flowgraph();

        assert_eq!(remat(&mut k, &[c]), 3);
        assert_eq!(reads(&k, c), 0);

        let clones = all_insts(&k)
            .into_iter()
            .filter(|&i| k.insts[i].op == Opcode::Mov && k.insts[i].srcs[0] == Operand::imm_f32(2.0))
            .count();

        assert_eq!(clones, 2);
    }

    #[test]
    fn sampler_payload_is_cloned_with_the_send() {
        let mut k = kernel();
        let header = k.create_decl(DeclareData::grf("H", ElemType::UD, 8));
        let texel = k.create_decl(DeclareData::grf("TEX", ElemType::F, 8));
        let out = k.create_decl(DeclareData::grf("OUT", ElemType::F, 8));
        let texel_src = k.src(texel, 8);
        let mut b = Builder::new(&mut k);

        b.mov(8, header, Operand::imm(7, ElemType::UD));
        b.send(
            8,
            Some(texel),
            header,
            SendDesc {
                sfid: Sfid::Sampler,
                msg_len: 1,
                resp_len: 1,
                desc: 0,
                eot: false,
                header: true,
            },
        );
        b.mov(8, out, Operand::imm_f32(0.0));
        b.mov(8, out, texel_src);
        b.eot();
        k.build_flowgraph();

        assert_eq!(remat(&mut k, &[texel]), 1);

        let ops = opcodes(&k);

        // header mov and sampler send recomputed right before the read
        assert_eq!(&ops[ops.len() - 4..], &[Opcode::Mov, Opcode::Send, Opcode::Mov, Opcode::Send]);
        assert_eq!(reads(&k, texel), 0);
        assert_eq!(reads(&k, header), 0);
    }
}
