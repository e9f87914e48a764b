//======---------------------------------------------------------------======//
//                                                                           //
// Copyright 2022-2023 Evan Cox <evanacox00@gmail.com>. All rights reserved. //
//                                                                           //
// Use of this source code is governed by a BSD-style license that can be    //
// found in the LICENSE.txt file at the root of this project, or at the      //
// following link: https://opensource.org/licenses/BSD-3-Clause              //
//                                                                           //
//======---------------------------------------------------------------======//

use crate::arena::ArenaMap;
use crate::flowgraph::{Block, FlowGraph};
use crate::ir::{Declare, DeclareTable, Inst, InstData};
use crate::utility::{SaHashMap, SaHashSet};
use log::debug;

impl FlowGraph {
    /// Finds every root declare that is not local to a single block.
    ///
    /// A declare is global if it is referenced from more than one block,
    /// or if a block reads it before fully defining it (the value must come
    /// from somewhere else). Input declares are always global.
    pub fn compute_global_operands(
        &mut self,
        insts: &ArenaMap<Inst, InstData>,
        decls: &DeclareTable,
    ) {
        let mut home: SaHashMap<Declare, Block> = SaHashMap::default();
        let mut globals = SaHashSet::default();

        for &block in self.order.iter() {
            let mut defined = SaHashSet::default();

            for &inst in self.blocks[block].insts.iter() {
                let data = &insts[inst];

                for d in data.use_declares() {
                    let root = decls.root(d);

                    if !defined.contains(&root) {
                        globals.insert(root);
                    }

                    if *home.entry(root).or_insert(block) != block {
                        globals.insert(root);
                    }
                }

                for d in data.def_declares() {
                    let root = decls.root(d);

                    if *home.entry(root).or_insert(block) != block {
                        globals.insert(root);
                    }
                }

                if let Some(root) = data.full_def(decls) {
                    defined.insert(root);
                }

                // flags written by a condition modifier are whole
                if let Some(cm) = data.cond_mod {
                    if data.pred.is_none() {
                        defined.insert(decls.root(cm.flag));
                    }
                }
            }
        }

        for (d, data) in decls.iter() {
            if data.is_input && data.alias.is_none() {
                globals.insert(d);
            }
        }

        debug!("{} global operands", globals.len());

        self.global_opnds = globals;
    }
}

#[cfg(test)]
mod tests {
    use crate::ir::*;
    use crate::testing::*;

    #[test]
    fn local_and_global_operands() {
        let mut k = kernel();
        let local = k.create_decl(DeclareData::grf("LOCAL", ElemType::D, 8));
        let cross = k.create_decl(DeclareData::grf("CROSS", ElemType::D, 8));
        let partial = k.create_decl(DeclareData::grf("PARTIAL", ElemType::D, 16));
        let next = k.create_label("next", false);
        let (partial_src, cross_src) = (k.src(partial, 8), k.src(cross, 8));
        let mut b = Builder::new(&mut k);

        b.mov(8, local, Operand::imm(1, ElemType::D));
        b.mov(8, cross, Operand::imm(2, ElemType::D));
        // writes only half of PARTIAL, then reads it
        b.mov(8, partial, Operand::imm(3, ElemType::D));
        b.mov(8, local, partial_src);
        b.label(next);
        b.mov(8, local, cross_src);
        b.eot();

        k.build_flowgraph();

        assert!(k.fg.is_global_operand(cross));
        assert!(k.fg.is_global_operand(partial));
        assert!(k.fg.is_global_operand(local));
        assert_eq!(k.fg.num_blocks(), 2);
    }

    #[test]
    fn block_local_temp_is_not_global() {
        let mut k = kernel();
        let t = k.create_decl(DeclareData::grf("T", ElemType::F, 8));
        let out = k.create_decl(DeclareData::grf("OUT", ElemType::F, 8));
        let t_src = k.src(t, 8);
        let mut b = Builder::new(&mut k);

        b.mov(8, t, Operand::imm_f32(1.0));
        b.mov(8, out, t_src);
        b.eot();

        k.build_flowgraph();

        assert!(!k.fg.is_global_operand(t));
        assert!(!k.fg.is_global_operand(out));
    }
}
