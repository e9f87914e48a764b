//======---------------------------------------------------------------======//
//                                                                           //
// Copyright 2022-2023 Evan Cox <evanacox00@gmail.com>. All rights reserved. //
//                                                                           //
// Use of this source code is governed by a BSD-style license that can be    //
// found in the LICENSE.txt file at the root of this project, or at the      //
// following link: https://opensource.org/licenses/BSD-3-Clause              //
//                                                                           //
//======---------------------------------------------------------------======//

use crate::analysis::{LivenessAnalysis, PointsToAnalysis, VariableId};
use crate::ir::{Declare, Kernel, RegFile};
use crate::utility::{BitSet, SaHashMap};
use log::debug;
use smallvec::SmallVec;

/// The interference graph of the variables in one register file.
///
/// Two variables interfere if one is written while the other is live.
/// On top of that a send's destination interferes with its payload, and
/// a destination spanning several rows interferes with its sources, since
/// the hardware does not allow those to partially overlap.
#[derive(Clone, Debug)]
pub struct InterferenceGraph {
    file: RegFile,
    vars: Vec<Declare>,
    index: SaHashMap<Declare, usize>,
    adj: Vec<BitSet>,
    referenced: BitSet,
}

impl InterferenceGraph {
    /// Builds the graph for `file` out of `live`, which must track `file`.
    pub fn build(
        kernel: &Kernel,
        pta: &PointsToAnalysis,
        live: &LivenessAnalysis,
        file: RegFile,
    ) -> Self {
        assert!(live.files().tracks(file), "liveness does not track {file:?}");

        let vars: Vec<Declare> = live
            .vars()
            .iter()
            .copied()
            .filter(|&d| kernel.decls[d].file == file)
            .collect();
        let index = vars.iter().enumerate().map(|(i, &d)| (d, i)).collect();
        let n = vars.len();
        let mut graph = Self {
            file,
            vars,
            index,
            adj: vec![BitSet::new(n); n],
            referenced: BitSet::new(n),
        };

        // liveness id -> node, for ids in other files
        let node_of: Vec<Option<usize>> = live
            .vars()
            .iter()
            .map(|d| graph.index.get(d).copied())
            .collect();
        let node = |id: VariableId| node_of[id.index()];

        for &block in kernel.fg.order.iter() {
            let sets = live.sets(block);
            let mut live_now: SmallVec<[usize; 32]> = SmallVec::new();

            // a read of something never written on the way here holds no value
            let has_def = |id: VariableId| {
                sets.def_in.get(id.index()) || sets.def_gen.get(id.index())
            };

            live_now.extend(live.live_out(block).iter().filter_map(|i| node_of[i]));

            for &inst in kernel.fg.blocks[block].insts.iter().rev() {
                let data = &kernel.insts[inst];
                let mut defs: SmallVec<[(usize, bool); 4]> = SmallVec::new();
                let mut uses: SmallVec<[usize; 8]> = SmallVec::new();

                for d in data.use_declares() {
                    if let Some(&n) = graph.index.get(&kernel.decls.root(d)) {
                        graph.referenced.set(n);
                    }
                }

                live.visit(
                    kernel,
                    pta,
                    block,
                    data,
                    |id, kill| defs.extend(node(id).map(|n| (n, kill))),
                    |id| {
                        if has_def(id) {
                            uses.extend(node(id));
                        }
                    },
                );

                for &(d, _) in defs.iter() {
                    graph.referenced.set(d);

                    for &l in live_now.iter() {
                        graph.add_edge(d, l);
                    }

                    for &(other, _) in defs.iter() {
                        graph.add_edge(d, other);
                    }
                }

                let overlap_sensitive = data.is_send()
                    || data.dst.rows_spanned(data.exec_size, true) > 1;

                if overlap_sensitive {
                    for &(d, _) in defs.iter() {
                        for &u in uses.iter() {
                            graph.add_edge(d, u);
                        }
                    }
                }

                for &(d, kill) in defs.iter() {
                    if kill {
                        live_now.retain(|l| *l != d);
                    }
                }

                for &u in uses.iter() {
                    if !live_now.contains(&u) {
                        live_now.push(u);
                    }
                }
            }
        }

        // inputs are all written at once before the first instruction
        if kernel.fg.num_blocks() > 0 {
            let at_entry: SmallVec<[usize; 32]> = live
                .live_in(kernel.fg.entry())
                .iter()
                .filter_map(|i| node_of[i])
                .collect();

            for &a in at_entry.iter() {
                for &b in at_entry.iter() {
                    graph.add_edge(a, b);
                }
            }
        }

        debug!(
            "interference for {file:?}: {} nodes, {} edges",
            graph.num_nodes(),
            graph.num_edges()
        );

        graph
    }

    /// The register file of the graph.
    pub fn file(&self) -> RegFile {
        self.file
    }

    /// The number of nodes.
    pub fn num_nodes(&self) -> usize {
        self.vars.len()
    }

    /// The number of undirected edges.
    pub fn num_edges(&self) -> usize {
        self.adj.iter().map(BitSet::count).sum::<usize>() / 2
    }

    /// Every node.
    pub fn nodes(&self) -> &[Declare] {
        &self.vars
    }

    /// Whether `decl` is a node of this graph.
    pub fn contains(&self, decl: Declare) -> bool {
        self.index.contains_key(&decl)
    }

    /// Whether `decl` is read or written anywhere. Variables that are not
    /// never need a register.
    pub fn is_referenced(&self, decl: Declare) -> bool {
        self.index
            .get(&decl)
            .map_or(false, |&i| self.referenced.get(i))
    }

    fn add_edge(&mut self, a: usize, b: usize) {
        if a != b {
            self.adj[a].set(b);
            self.adj[b].set(a);
        }
    }

    /// Forces `a` and `b` to interfere.
    pub fn add_interference(&mut self, a: Declare, b: Declare) {
        if let (Some(&a), Some(&b)) = (self.index.get(&a), self.index.get(&b)) {
            self.add_edge(a, b);
        }
    }

    /// Whether `a` and `b` may not share storage.
    pub fn interferes(&self, a: Declare, b: Declare) -> bool {
        match (self.index.get(&a), self.index.get(&b)) {
            (Some(&a), Some(&b)) => self.adj[a].get(b),
            _ => false,
        }
    }

    /// Every variable that interferes with `decl`.
    pub fn neighbors(&self, decl: Declare) -> impl Iterator<Item = Declare> + '_ {
        self.index
            .get(&decl)
            .into_iter()
            .flat_map(move |&i| self.adj[i].iter().map(move |j| self.vars[j]))
    }

    /// The number of neighbors of `decl`.
    pub fn degree(&self, decl: Declare) -> usize {
        self.index.get(&decl).map_or(0, |&i| self.adj[i].count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::LiveFiles;
    use crate::ir::*;
    use crate::testing::*;

    fn graph(k: &mut Kernel) -> InterferenceGraph {
        let pta = PointsToAnalysis::compute(k);
        let live = LivenessAnalysis::compute(k, &pta, LiveFiles::GRF);

        InterferenceGraph::build(k, &pta, &live, RegFile::Grf)
    }

    #[test]
    fn overlapping_lifetimes_interfere() {
        let mut k = kernel();
        let a = k.create_decl(DeclareData::grf("A", ElemType::F, 8));
        let b_ = k.create_decl(DeclareData::grf("B", ElemType::F, 8));
        let c = k.create_decl(DeclareData::grf("C", ElemType::F, 8));
        let d = k.create_decl(DeclareData::grf("D", ElemType::F, 8));
        let mut b = Builder::new(&mut k);

        b.mov(8, a, Operand::imm_f32(1.0));
        b.mov(8, b_, Operand::imm_f32(2.0));
        b.add(8, c, a, b_);
        b.add(8, d, c, c);
        b.mov(8, a, Operand::imm_f32(3.0));
        b.add(8, d, d, a);
        b.eot();

        k.build_flowgraph();

        let g = graph(&mut k);

        assert!(g.interferes(a, b_));
        assert!(g.interferes(b_, a));
        // c is written when a and b die
        assert!(!g.interferes(c, a));
        assert!(!g.interferes(c, b_));
        // d is live across the second definition of a
        assert!(g.interferes(d, a));
        assert!(!g.interferes(c, d));
        assert_eq!(g.degree(b_), 1);
        assert!(g.neighbors(a).any(|n| n == d));
    }

    #[test]
    fn send_destination_interferes_with_payload() {
        let mut k = kernel();
        let payload = k.create_decl(DeclareData::grf("P", ElemType::UD, 8));
        let result = k.create_decl(DeclareData::grf("R", ElemType::UD, 8));
        let out = k.create_decl(DeclareData::grf("O", ElemType::UD, 8));
        let result_src = k.src(result, 8);
        let mut b = Builder::new(&mut k);

        b.mov(8, payload, Operand::imm(0, ElemType::UD));
        b.send(
            8,
            Some(result),
            payload,
            SendDesc {
                sfid: Sfid::DataPort,
                msg_len: 1,
                resp_len: 1,
                desc: 0,
                eot: false,
                header: false,
            },
        );
        b.mov(8, out, result_src);
        b.eot();

        k.build_flowgraph();

        let g = graph(&mut k);

        assert!(g.interferes(result, payload));
        assert!(!g.interferes(out, result));
    }

    #[test]
    fn inputs_interfere_with_each_other() {
        let mut k = kernel();
        let mut in0 = DeclareData::grf("IN0", ElemType::F, 8);
        let mut in1 = DeclareData::grf("IN1", ElemType::F, 8);

        in0.is_input = true;
        in1.is_input = true;

        let in0 = k.create_decl(in0);
        let in1 = k.create_decl(in1);
        let unused = k.create_decl(DeclareData::grf("UNUSED", ElemType::F, 8));
        let out = k.create_decl(DeclareData::grf("OUT", ElemType::F, 8));
        let mut b = Builder::new(&mut k);

        b.add(8, out, in0, in1);
        b.eot();

        k.build_flowgraph();

        let g = graph(&mut k);

        assert!(g.interferes(in0, in1));
        assert!(g.is_referenced(out));
        assert!(!g.is_referenced(unused));
        assert_eq!(g.degree(unused), 0);
    }
}
