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
use crate::ir::{
    Declare, ElemType, Inst, InstData, Kernel, Opcode, Operand, RegBase, RegOperand, SendDesc,
    Sfid,
};
use crate::target::{GRF_BYTES, GRF_WORDS};
use crate::utility::SaHashMap;
use log::{debug, trace};

/// Set in the descriptor of a scratch write.
pub const SCRATCH_WRITE: u32 = 1 << 17;

/// Moves spilled variables into scratch memory.
///
/// Every read of a spilled variable gets a fill into a fresh temporary
/// right before it, every write goes to a fresh payload that is written
/// back right after. Writes that do not cover the whole variable fill the
/// payload first. Slots are handed out a row at a time and stay taken for
/// the whole compilation, so one manager is kept across allocation
/// rounds.
#[derive(Clone, Debug, Default)]
pub struct SpillManager {
    slots: SaHashMap<Declare, u32>,
    next_row: u32,
    temps: Vec<Declare>,
}

impl SpillManager {
    /// Creates a manager with an empty scratch area.
    pub fn new() -> Self {
        Self::default()
    }

    /// The scratch size needed so far, in rows.
    pub fn scratch_rows(&self) -> u32 {
        self.next_row
    }

    /// The scratch row offset of a spilled variable.
    pub fn slot_of(&self, decl: Declare) -> Option<u32> {
        self.slots.get(&decl).copied()
    }

    /// Every temporary created by spill code. These must never be spilled
    /// themselves.
    pub fn temps(&self) -> &[Declare] {
        &self.temps
    }

    fn slot(&mut self, kernel: &Kernel, decl: Declare) -> u32 {
        if let Some(&row) = self.slots.get(&decl) {
            return row;
        }

        let row = self.next_row;

        self.next_row += kernel.decls[decl].num_rows();
        self.slots.insert(decl, row);
        row
    }

    /// Rewrites every reference to `spilled` (roots) through scratch.
    /// Returns how many instructions were inserted.
    pub fn insert_spill_code(&mut self, kernel: &mut Kernel, spilled: &[Declare]) -> usize {
        let mut inserted = 0;

        for &var in spilled {
            debug_assert!(!kernel.decls.is_alias(var), "only roots are spilled");

            self.slot(kernel, var);
            kernel.decls[var].spilled = true;
        }

        let order = kernel.fg.order.clone();

        for block in order {
            let mut i = 0;

            while i < kernel.fg.blocks[block].insts.len() {
                let inst = kernel.fg.blocks[block].insts[i];
                let (before, after) = self.rewrite(kernel, inst, spilled);
                let (n_before, n_after) = (before.len(), after.len());

                insert_at(kernel, block, i, before);
                insert_at(kernel, block, i + n_before + 1, after);

                inserted += n_before + n_after;
                i += n_before + 1 + n_after;
            }
        }

        kernel.renumber();

        debug!(
            "spilled {} variables, {} instructions inserted, {} scratch rows",
            spilled.len(),
            inserted,
            self.next_row
        );

        inserted
    }

    // returns the code to place before and after `inst`
    fn rewrite(
        &mut self,
        kernel: &mut Kernel,
        inst: Inst,
        spilled: &[Declare],
    ) -> (Vec<InstData>, Vec<InstData>) {
        let mut before = Vec::new();
        let mut after = Vec::new();
        let mut fills: SaHashMap<Declare, Declare> = SaHashMap::default();

        for s in 0..kernel.insts[inst].srcs.len() {
            let Some(x) = kernel.insts[inst].srcs[s].declare() else {
                continue;
            };
            let (root, offset) = kernel.decls.root_offset(x);

            if !spilled.contains(&root) {
                continue;
            }

            let temp = match fills.get(&root) {
                Some(&temp) => temp,
                None => {
                    let temp = self.temp_like(kernel, root);

                    before.extend(self.fill(kernel, root, temp));
                    fills.insert(root, temp);
                    temp
                }
            };

            let view = self.view_of(kernel, x, temp, offset);

            if let Operand::Reg(r) = &mut kernel.insts[inst].srcs[s] {
                r.base = RegBase::Var(view);
            }
        }

        if let Some(x) = kernel.insts[inst].dst_declare() {
            let (root, offset) = kernel.decls.root_offset(x);

            if spilled.contains(&root) {
                let (rows, ty, elems) = {
                    let d = &kernel.decls[root];

                    (d.num_rows(), d.ty, d.num_elems)
                };
                let name = format!("{}_SPILL", kernel.decls[root].name);
                let payload = kernel.create_temp(ElemType::UD, GRF_WORDS / 2 * (rows + 1));
                let data = kernel.decls.create_alias(name, payload, GRF_BYTES, ty, elems);

                self.temps.extend([payload, data]);

                // a partial write has to keep the rest of the old value
                if kernel.insts[inst].full_def(&kernel.decls) != Some(root) {
                    before.extend(self.fill(kernel, root, data));
                }

                let view = self.view_of(kernel, x, data, offset);

                kernel.insts[inst].dst.base = RegBase::Var(view);
                after.extend(self.spill(kernel, root, payload, rows));
            }
        }

        if !before.is_empty() || !after.is_empty() {
            trace!("spill code around '{}'", kernel.display_inst(inst));
        }

        (before, after)
    }

    fn temp_like(&mut self, kernel: &mut Kernel, root: Declare) -> Declare {
        let (ty, elems) = (kernel.decls[root].ty, kernel.decls[root].num_elems);
        let temp = kernel.create_temp(ty, elems);

        self.temps.push(temp);
        temp
    }

    // `x` was a view of a spilled root at `offset`, returns the same view
    // of `storage`
    fn view_of(&mut self, kernel: &mut Kernel, x: Declare, storage: Declare, offset: u32) -> Declare {
        if !kernel.decls.is_alias(x) {
            return storage;
        }

        let (ty, elems) = (kernel.decls[x].ty, kernel.decls[x].num_elems);
        let name = format!("{}_VIEW", kernel.decls[x].name);
        let view = kernel.decls.create_alias(name, storage, offset, ty, elems);

        self.temps.push(view);
        view
    }

    fn header(&mut self, kernel: &mut Kernel) -> (Declare, InstData) {
        let header = kernel.create_temp(ElemType::UD, GRF_WORDS / 2);
        let init = InstData::new(Opcode::Mov, 8)
            .with_dst(kernel.dst(header))
            .with_src(Operand::imm(0, ElemType::UD))
            .with_no_mask();

        self.temps.push(header);
        (header, init)
    }

    fn fill(&mut self, kernel: &mut Kernel, root: Declare, into: Declare) -> [InstData; 2] {
        let (header, init) = self.header(kernel);
        let rows = kernel.decls[root].num_rows();
        let mut send = InstData::new(Opcode::Send, 8)
            .with_dst(RegOperand::dst(into, kernel.decls[into].ty))
            .with_src(kernel.src(header, 8))
            .with_no_mask();

        send.send = Some(SendDesc {
            sfid: Sfid::Scratch,
            msg_len: 1,
            resp_len: rows as u8,
            desc: self.slot(kernel, root),
            eot: false,
            header: true,
        });

        [init, send]
    }

    fn spill(&mut self, kernel: &mut Kernel, root: Declare, payload: Declare, rows: u32) -> [InstData; 2] {
        let init = InstData::new(Opcode::Mov, 8)
            .with_dst(kernel.dst(payload))
            .with_src(Operand::imm(0, ElemType::UD))
            .with_no_mask();
        let mut send = InstData::new(Opcode::Send, 8)
            .with_dst(RegOperand::null(ElemType::UD))
            .with_src(kernel.src(payload, 8))
            .with_no_mask();

        send.send = Some(SendDesc {
            sfid: Sfid::Scratch,
            msg_len: (rows + 1) as u8,
            resp_len: 0,
            desc: self.slot(kernel, root) | SCRATCH_WRITE,
            eot: false,
            header: true,
        });

        [init, send]
    }
}

fn insert_at(kernel: &mut Kernel, block: Block, at: usize, code: Vec<InstData>) {
    let insts: Vec<Inst> = code.into_iter().map(|d| kernel.create_inst(d)).collect();

    kernel.fg.blocks[block].insts.splice(at..at, insts);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::*;
    use crate::testing::*;

    fn scratch_sends(k: &Kernel) -> Vec<SendDesc> {
        all_insts(k)
            .into_iter()
            .filter_map(|i| k.insts[i].send)
            .filter(|s| s.sfid == Sfid::Scratch)
            .collect()
    }

    #[test]
    fn fills_and_spills_surround_references() {
        let mut k = kernel();
        let v = k.create_decl(DeclareData::grf("V", ElemType::F, 16));
        let out = k.create_decl(DeclareData::grf("OUT", ElemType::F, 16));
        let v_src = k.src(v, 16);
        let mut b = Builder::new(&mut k);

        b.mov(16, v, Operand::imm_f32(1.0));
        b.binary(Opcode::Add, 16, out, v_src, v_src);
        b.eot();
        k.build_flowgraph();

        let mut spills = SpillManager::new();
        let inserted = spills.insert_spill_code(&mut k, &[v]);

        assert_eq!(inserted, 4);
        assert!(k.decls[v].spilled);
        assert_eq!(spills.slot_of(v), Some(0));
        assert_eq!(spills.scratch_rows(), 2);

        assert_eq!(
            opcodes(&k),
            vec![
                Opcode::Mov,
                Opcode::Mov,
                Opcode::Send,
                Opcode::Mov,
                Opcode::Send,
                Opcode::Add,
                Opcode::Send,
            ]
        );

        let sends = scratch_sends(&k);

        assert_eq!(sends[0].desc, SCRATCH_WRITE);
        assert_eq!(sends[0].msg_len, 3);
        assert_eq!(sends[1].desc, 0);
        assert_eq!(sends[1].resp_len, 2);

        // nothing refers to the spilled variable anymore
        for inst in all_insts(&k) {
            let data = &k.insts[inst];

            assert!(data
                .use_declares()
                .into_iter()
                .chain(data.def_declares())
                .all(|d| k.decls.root(d) != v));
        }

        // both reads share one fill
        let add = all_insts(&k)
            .into_iter()
            .find(|&i| k.insts[i].op == Opcode::Add)
            .unwrap();

        assert_eq!(k.insts[add].srcs[0], k.insts[add].srcs[1]);
        assert!(spills.temps().len() >= 4);
    }

    #[test]
    fn partial_write_fills_first() {
        let mut k = kernel();
        let v = k.create_decl(DeclareData::grf("V", ElemType::F, 16));
        let lo = k.decls.create_alias("V_LO", v, 0, ElemType::F, 8);
        let mut b = Builder::new(&mut k);

        b.mov(16, v, Operand::imm_f32(1.0));
        b.mov(8, lo, Operand::imm_f32(2.0));
        b.eot();
        k.build_flowgraph();

        let mut spills = SpillManager::new();

        spills.insert_spill_code(&mut k, &[v]);

        // full write: spill, partial write: fill + write + spill
        let sends = scratch_sends(&k);

        assert_eq!(sends.len(), 3);
        assert_eq!(sends[0].desc & SCRATCH_WRITE, SCRATCH_WRITE);
        assert_eq!(sends[1].desc & SCRATCH_WRITE, 0);
        assert_eq!(sends[2].desc & SCRATCH_WRITE, SCRATCH_WRITE);

        // the partial write goes through a view at the same offset
        let partial = all_insts(&k)
            .into_iter()
            .filter(|&i| k.insts[i].op == Opcode::Mov && k.insts[i].exec_size == 8)
            .find(|&i| k.insts[i].srcs[0] == Operand::imm_f32(2.0))
            .unwrap();
        let dst = k.insts[partial].dst_declare().unwrap();

        assert!(k.decls.is_alias(dst));
        assert_eq!(k.decls[dst].ty, ElemType::F);
        assert_ne!(k.decls.root(dst), v);
    }

    #[test]
    fn slots_do_not_overlap() {
        let mut k = kernel();
        let a = k.create_decl(DeclareData::grf("A", ElemType::F, 24));
        let b_ = k.create_decl(DeclareData::grf("B", ElemType::F, 8));
        let mut b = Builder::new(&mut k);

        b.mov(16, a, Operand::imm_f32(1.0));
        b.mov(8, b_, Operand::imm_f32(1.0));
        b.eot();
        k.build_flowgraph();

        let mut spills = SpillManager::new();

        spills.insert_spill_code(&mut k, &[a, b_]);

        assert_eq!(spills.slot_of(a), Some(0));
        assert_eq!(spills.slot_of(b_), Some(3));
        assert_eq!(spills.scratch_rows(), 4);
    }
}
