//======---------------------------------------------------------------======//
//                                                                           //
// Copyright 2022-2023 Evan Cox <evanacox00@gmail.com>. All rights reserved. //
//                                                                           //
// Use of this source code is governed by a BSD-style license that can be    //
// found in the LICENSE.txt file at the root of this project, or at the      //
// following link: https://opensource.org/licenses/BSD-3-Clause              //
//                                                                           //
//======---------------------------------------------------------------======//

use crate::analysis::PointsToAnalysis;
use crate::arena::SecondaryMap;
use crate::flowgraph::{Block, FlowGraph, FuncId};
use crate::ir::{
    Declare, InstData, Kernel, Opcode, Operand, RegBase, RegFile, RegOperand,
};
use crate::options::LivenessMode;
use crate::target::GRF_BYTES;
use crate::utility::{BitSet, SaHashMap};
use bitflags::bitflags;
use log::{debug, trace};
use smallvec::SmallVec;

#[cfg(feature = "enable-serde")]
use serde::{Deserialize, Serialize};

bitflags! {
    /// The register files a [`LivenessAnalysis`] tracks.
    #[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
    pub struct LiveFiles: u8 {
        /// General registers.
        const GRF = 1;
        /// Address registers.
        const ADDRESS = 2;
        /// Flag registers.
        const FLAG = 4;
    }
}

impl LiveFiles {
    /// Whether `file` is one of the tracked files.
    pub fn tracks(self, file: RegFile) -> bool {
        match file {
            RegFile::Grf => self.contains(LiveFiles::GRF),
            RegFile::Address => self.contains(LiveFiles::ADDRESS),
            RegFile::Flag => self.contains(LiveFiles::FLAG),
        }
    }
}

/// The dense id of a variable taking part in liveness. Every bitset of a
/// [`LivenessAnalysis`] is indexed by these.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct VariableId(u32);

impl VariableId {
    /// The bit index of this variable.
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// The dataflow vectors of one block.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LivenessSets {
    /// Variables read in the block before being killed.
    pub use_gen: BitSet,
    /// Variables completely overwritten in the block.
    pub use_kill: BitSet,
    /// Variables that may be read at or after the block's entry.
    pub use_in: BitSet,
    /// Variables that may be read after the block's exit.
    pub use_out: BitSet,
    /// Variables that may have been written on some path to the entry.
    pub def_in: BitSet,
    /// Variables that may have been written on some path to the exit.
    pub def_out: BitSet,
    /// Variables written (even partially) in the block.
    pub def_gen: BitSet,
}

impl LivenessSets {
    fn new(n: usize) -> Self {
        Self {
            use_gen: BitSet::new(n),
            use_kill: BitSet::new(n),
            use_in: BitSet::new(n),
            use_out: BitSet::new(n),
            def_in: BitSet::new(n),
            def_out: BitSet::new(n),
            def_gen: BitSet::new(n),
        }
    }
}

/// What a subroutine does to the variables of its callers.
#[derive(Clone, Debug)]
struct FuncSummary {
    // transparent through the function (not killed on some path)
    bypass: BitSet,
    // live at the function's entry
    mayuse: BitSet,
    // written somewhere in the function or its callees
    maydef: BitSet,
}

/// Block-level liveness of the root declares in a set of register files.
///
/// A variable is live at a point if it may be read later (`use`) **and**
/// may have been written earlier (`def`). The second half keeps variables
/// that are only read on some paths from being live all the way up to the
/// kernel entry.
#[derive(Clone, Debug)]
pub struct LivenessAnalysis {
    files: LiveFiles,
    mode: LivenessMode,
    simd_flow_unmasked: bool,
    ids: SaHashMap<Declare, VariableId>,
    vars: Vec<Declare>,
    sets: SecondaryMap<Block, LivenessSets>,
    summaries: SecondaryMap<FuncId, FuncSummary>,
}

impl LivenessAnalysis {
    /// Computes liveness for every root declare in `files`, with the mode
    /// selected in the kernel's options.
    pub fn compute(kernel: &Kernel, pta: &PointsToAnalysis, files: LiveFiles) -> Self {
        Self::compute_with_mode(kernel, pta, files, kernel.options.liveness_mode)
    }

    /// Computes liveness with an explicit [`LivenessMode`].
    pub fn compute_with_mode(
        kernel: &Kernel,
        pta: &PointsToAnalysis,
        files: LiveFiles,
        mode: LivenessMode,
    ) -> Self {
        let mut ids = SaHashMap::default();
        let mut vars = Vec::new();

        for d in kernel.decls.keys() {
            let data = &kernel.decls[d];

            if data.alias.is_none() && files.tracks(data.file) {
                ids.insert(d, VariableId(vars.len() as u32));
                vars.push(d);
            }
        }

        let mut live = Self {
            files,
            mode,
            simd_flow_unmasked: kernel.options.simd_flow_unmasked,
            ids,
            vars,
            sets: SecondaryMap::new(),
            summaries: SecondaryMap::new(),
        };

        if kernel.fg.num_blocks() == 0 {
            return live;
        }

        for &block in kernel.fg.order.iter() {
            let sets = live.local_sets(kernel, pta, block);

            live.sets.insert(block, sets);
        }

        let entry = kernel.fg.entry();

        for (d, data) in kernel.decls.iter() {
            if data.is_input {
                if let Some(id) = live.var_id(d) {
                    live.sets[entry].def_in.set(id.index());
                }
            }
        }

        match mode {
            LivenessMode::ContextFree => {
                live.solve_use_context_free(&kernel.fg);
                live.solve_def(&kernel.fg);
            }
            LivenessMode::ContextSensitive => {
                live.summarize_functions(&kernel.fg);
                live.solve_use_context_sensitive(&kernel.fg);
                live.solve_def(&kernel.fg);
            }
        }

        debug!(
            "liveness for '{}' ({:?}, {:?}): {} variables, {} blocks",
            kernel.name,
            files,
            mode,
            live.num_var_id(),
            kernel.fg.num_blocks()
        );

        live
    }

    /// The number of variables, fixed once construction completes.
    #[inline]
    pub fn num_var_id(&self) -> usize {
        self.vars.len()
    }

    /// The register files being tracked.
    pub fn files(&self) -> LiveFiles {
        self.files
    }

    /// The mode this analysis was computed with.
    pub fn mode(&self) -> LivenessMode {
        self.mode
    }

    /// The id of `decl`'s root, if its file is tracked.
    #[inline]
    pub fn var_id(&self, decl: Declare) -> Option<VariableId> {
        self.ids.get(&decl).copied()
    }

    /// The declare behind an id.
    #[inline]
    pub fn declare_of(&self, id: VariableId) -> Declare {
        self.vars[id.index()]
    }

    /// Every tracked declare, in id order.
    pub fn vars(&self) -> &[Declare] {
        &self.vars
    }

    /// The dataflow vectors of `block`.
    pub fn sets(&self, block: Block) -> &LivenessSets {
        &self.sets[block]
    }

    /// Whether `decl` (a root) is live on entry to `block`.
    pub fn is_live_at_entry(&self, block: Block, decl: Declare) -> bool {
        self.var_id(decl).map_or(false, |id| {
            let s = &self.sets[block];

            s.use_in.get(id.index()) && s.def_in.get(id.index())
        })
    }

    /// Whether `decl` (a root) is live on exit from `block`.
    pub fn is_live_at_exit(&self, block: Block, decl: Declare) -> bool {
        self.var_id(decl).map_or(false, |id| {
            let s = &self.sets[block];

            s.use_out.get(id.index()) && s.def_out.get(id.index())
        })
    }

    /// The live-out vector of `block` (`use_out ∧ def_out`).
    pub fn live_out(&self, block: Block) -> BitSet {
        let s = &self.sets[block];
        let mut out = s.use_out.clone();

        out.intersect_with(&s.def_out);
        out
    }

    /// The live-in vector of `block` (`use_in ∧ def_in`).
    pub fn live_in(&self, block: Block) -> BitSet {
        let s = &self.sets[block];
        let mut live = s.use_in.clone();

        live.intersect_with(&s.def_in);
        live
    }

    /// Every declare live on exit from `block`.
    pub fn live_vars_at_exit(&self, block: Block) -> impl Iterator<Item = Declare> + '_ {
        let live = self.live_out(block);

        live.iter()
            .map(|i| self.vars[i])
            .collect::<SmallVec<[Declare; 16]>>()
            .into_iter()
    }

    /// Whether writing `root` through `data` kills its previous value.
    pub fn is_kill(&self, kernel: &Kernel, block: Block, data: &InstData, root: Declare) -> bool {
        if data.op == Opcode::PseudoKill {
            return true;
        }

        let masked_ok =
            !kernel.fg.blocks[block].in_simd_flow || data.no_mask || self.simd_flow_unmasked;

        masked_ok && data.full_def(&kernel.decls) == Some(root)
    }

    /// Walks `data`'s reads and writes of tracked variables. `def` receives
    /// `(id, is_kill)`, `use_` receives ids. Writes are reported before
    /// reads, as a backward walk needs them.
    pub(crate) fn visit(
        &self,
        kernel: &Kernel,
        pta: &PointsToAnalysis,
        block: Block,
        data: &InstData,
        mut def: impl FnMut(VariableId, bool),
        mut use_: impl FnMut(VariableId),
    ) {
        let decls = &kernel.decls;
        let root_id = |d: Declare| self.var_id(decls.root(d));

        // writes
        match data.dst.base {
            RegBase::Var(d) => {
                let root = decls.root(d);

                if let Some(id) = self.var_id(root) {
                    def(id, self.is_kill(kernel, block, data, root));
                }
            }
            RegBase::Indirect { addr, .. } => {
                for &var in pta.points_to(decls.root(addr)) {
                    if let Some(id) = self.var_id(var) {
                        def(id, false);
                    }
                }
            }
            _ => {}
        }

        if let Some(cm) = data.cond_mod {
            if decls.is_alias(cm.flag) {
                panic!("alias '{}' used as a condition modifier flag", decls[cm.flag].name);
            }

            if let Some(id) = self.var_id(cm.flag) {
                let masked_ok = !kernel.fg.blocks[block].in_simd_flow
                    || data.no_mask
                    || self.simd_flow_unmasked;

                def(id, data.pred.is_none() && masked_ok);
            }
        }

        // reads
        if let RegBase::Indirect { addr, .. } = data.dst.base {
            if let Some(id) = root_id(addr) {
                use_(id);
            }
        }

        let mut read_reg = |op: &RegOperand| match op.base {
            RegBase::Var(d) => {
                if let Some(id) = root_id(d) {
                    use_(id);
                }
            }
            RegBase::Indirect { addr, .. } => {
                if let Some(id) = root_id(addr) {
                    use_(id);
                }

                for &var in pta.points_to(decls.root(addr)) {
                    if let Some(id) = self.var_id(var) {
                        use_(id);
                    }
                }
            }
            _ => {}
        };

        for src in data.srcs.iter() {
            if let Operand::Reg(r) = src {
                read_reg(r);
            }
        }

        if let Some(pred) = data.pred {
            if decls.is_alias(pred.flag) {
                panic!("alias '{}' used as a predicate", decls[pred.flag].name);
            }

            if let Some(id) = self.var_id(pred.flag) {
                use_(id);
            }
        }
    }

    fn local_sets(&self, kernel: &Kernel, pta: &PointsToAnalysis, block: Block) -> LivenessSets {
        let n = self.num_var_id();
        let mut sets = LivenessSets::new(n);

        for &inst in kernel.fg.blocks[block].insts.iter().rev() {
            let data = &kernel.insts[inst];
            let mut uses: SmallVec<[VariableId; 8]> = SmallVec::new();
            let mut defs: SmallVec<[(VariableId, bool); 4]> = SmallVec::new();

            self.visit(kernel, pta, block, data, |id, kill| defs.push((id, kill)), |id| {
                uses.push(id)
            });

            for (id, kill) in defs {
                sets.def_gen.set(id.index());

                if kill {
                    sets.use_kill.set(id.index());
                    sets.use_gen.reset(id.index());
                }
            }

            for id in uses {
                sets.use_gen.set(id.index());
            }
        }

        sets
    }

    fn transfer_use(&mut self, block: Block, out: BitSet) -> bool {
        let s = &mut self.sets[block];
        let mut live_in = out.clone();

        live_in.subtract(&s.use_kill);
        live_in.union_with(&s.use_gen);

        let mut changed = s.use_out.assign(&out);

        changed |= s.use_in.assign(&live_in);
        changed
    }

    fn solve_use_context_free(&mut self, fg: &FlowGraph) {
        let n = self.num_var_id();
        let mut iterations = 0;
        let mut changed = true;

        while changed {
            changed = false;
            iterations += 1;

            for &block in fg.order.iter().rev() {
                let mut out = BitSet::new(n);

                for &succ in fg.succs(block) {
                    out.union_with(&self.sets[succ].use_in);
                }

                changed |= self.transfer_use(block, out);
            }
        }

        trace!("context-free use analysis converged after {iterations} iterations");
    }

    fn solve_def(&mut self, fg: &FlowGraph) {
        let n = self.num_var_id();
        let entry = fg.entry();
        let mut changed = true;

        while changed {
            changed = false;

            for &block in fg.order.iter() {
                let mut def_in = BitSet::new(n);

                if block == entry {
                    def_in.assign(&self.sets[block].def_in);
                }

                if self.mode == LivenessMode::ContextSensitive && fg.blocks[block].is_return() {
                    let call = fg.call_block_of(block);

                    def_in.union_with(&self.sets[call].def_out);

                    if let Some(f) = fg.callee_of(call) {
                        def_in.union_with(&self.summaries[f].maydef);
                    }
                } else {
                    for &pred in fg.preds(block) {
                        def_in.union_with(&self.sets[pred].def_out);
                    }
                }

                let s = &mut self.sets[block];
                let mut def_out = def_in.clone();

                def_out.union_with(&s.def_gen);
                changed |= s.def_in.assign(&def_in);
                changed |= s.def_out.assign(&def_out);
            }
        }
    }

    fn check_call_structure(fg: &FlowGraph, block: Block) {
        let data = &fg.blocks[block];

        if data.is_call() && data.succs.len() != 1 {
            panic!(
                "call block {block:?} has {} successors, expected exactly one",
                data.succs.len()
            );
        }

        if data.is_return() && data.preds.len() != 1 {
            panic!(
                "return block {block:?} has {} predecessors, expected exactly one",
                data.preds.len()
            );
        }
    }

    // bypass, mayuse and maydef for every function, callees first
    fn summarize_functions(&mut self, fg: &FlowGraph) {
        let n = self.num_var_id();

        for &block in fg.order.iter() {
            Self::check_call_structure(fg, block);
        }

        for &f in fg.sorted_funcs.iter() {
            let info = &fg.funcs[f];

            // maydef: every write in the function and its callees
            let mut maydef = BitSet::new(n);

            for &b in info.blocks.iter() {
                maydef.union_with(&self.sets[b].def_gen);
            }

            for &callee in info.callees.iter() {
                maydef.union_with(&self.summaries[callee].maydef);
            }

            // mayuse: backward within the function, nothing is live after its exit
            let mut uin: SecondaryMap<Block, BitSet> = SecondaryMap::new();

            for &b in info.blocks.iter() {
                uin.insert(b, BitSet::new(n));
            }

            let mut changed = true;

            while changed {
                changed = false;

                for &b in info.blocks.iter().rev() {
                    let out = self.local_out(fg, f, b, &uin, |_| BitSet::new(n));
                    let s = &self.sets[b];
                    let mut live_in = out;

                    live_in.subtract(&s.use_kill);
                    live_in.union_with(&s.use_gen);
                    changed |= uin[b].assign(&live_in);
                }
            }

            let mayuse = uin[info.init].clone();

            // bypass: everything reaching the exit unkilled is transparent
            let mut bin: SecondaryMap<Block, BitSet> = SecondaryMap::new();

            for &b in info.blocks.iter() {
                bin.insert(b, BitSet::new(n));
            }

            changed = true;

            while changed {
                changed = false;

                for &b in info.blocks.iter().rev() {
                    let mut through = if b == info.exit {
                        BitSet::full(n)
                    } else {
                        self.local_out(fg, f, b, &bin, |_| BitSet::new(n))
                    };

                    through.subtract(&self.sets[b].use_kill);
                    changed |= bin[b].assign(&through);
                }
            }

            let bypass = bin[info.init].clone();

            trace!(
                "summary of {f:?}: mayuse={}, maydef={}, bypass={}",
                mayuse.count(),
                maydef.count(),
                bypass.count()
            );

            self.summaries.insert(
                f,
                FuncSummary {
                    bypass,
                    mayuse,
                    maydef,
                },
            );
        }
    }

    // the out-set of `b` inside function `f`, reading successor in-sets from `ins`
    fn local_out(
        &self,
        fg: &FlowGraph,
        f: FuncId,
        b: Block,
        ins: &SecondaryMap<Block, BitSet>,
        empty: impl Fn(usize) -> BitSet,
    ) -> BitSet {
        let n = self.num_var_id();

        if let Some(callee) = fg.callee_of(b) {
            let ret = fg.return_block_of(b);
            let summary = &self.summaries[callee];
            let mut out = ins.get(ret).cloned().unwrap_or_else(|| empty(n));

            out.intersect_with(&summary.bypass);
            out.union_with(&summary.mayuse);

            return out;
        }

        let mut out = empty(n);

        if fg.is_subroutine_exit(b) && fg.funcs[f].exit == b {
            return out;
        }

        for succ in fg.local_succs(b) {
            if let Some(s) = ins.get(succ) {
                out.union_with(s);
            }
        }

        out
    }

    fn solve_use_context_sensitive(&mut self, fg: &FlowGraph) {
        let n = self.num_var_id();
        let mut iterations = 0;
        let mut changed = true;

        while changed {
            changed = false;
            iterations += 1;

            for &block in fg.order.iter().rev() {
                let mut out = BitSet::new(n);

                if let Some(callee) = fg.callee_of(block) {
                    let summary = &self.summaries[callee];
                    let ret = fg.return_block_of(block);

                    out.assign(&self.sets[ret].use_in);
                    out.intersect_with(&summary.bypass);
                    out.union_with(&summary.mayuse);
                } else {
                    // a subroutine EXIT sees every return site, so values
                    // live after any call stay live through the body
                    for &succ in fg.succs(block) {
                        out.union_with(&self.sets[succ].use_in);
                    }
                }

                changed |= self.transfer_use(block, out);
            }
        }

        trace!("context-sensitive use analysis converged after {iterations} iterations");
    }

    /// The peak number of GRF rows live at any point inside of `block`.
    pub fn max_register_pressure(&self, kernel: &Kernel, pta: &PointsToAnalysis, block: Block) -> u32 {
        let rows = |id: usize| -> u32 {
            let d = &kernel.decls[self.vars[id]];

            if d.file == RegFile::Grf {
                d.num_rows()
            } else {
                0
            }
        };

        let mut live = self.live_out(block);
        let mut pressure: u32 = live.iter().map(|i| rows(i)).sum();
        let mut max = pressure;

        for &inst in kernel.fg.blocks[block].insts.iter().rev() {
            let data = &kernel.insts[inst];
            let mut defs: SmallVec<[(VariableId, bool); 4]> = SmallVec::new();
            let mut uses: SmallVec<[VariableId; 8]> = SmallVec::new();

            self.visit(kernel, pta, block, data, |id, kill| defs.push((id, kill)), |id| {
                uses.push(id)
            });

            // a definition occupies its register even if the value is never read
            for &(id, _) in defs.iter() {
                if !live.get(id.index()) {
                    live.set(id.index());
                    pressure += rows(id.index());
                }
            }

            max = max.max(pressure);

            for (id, kill) in defs {
                if kill && live.get(id.index()) {
                    live.reset(id.index());
                    pressure -= rows(id.index());
                }
            }

            for id in uses {
                if !live.get(id.index()) {
                    live.set(id.index());
                    pressure += rows(id.index());
                }
            }

            max = max.max(pressure);
        }

        max
    }
}

/// Inserts a `pseudo_kill` before the first of a run of partial writes
/// that together cover a whole GRF declare before it is read. This lets
/// liveness see the run as a kill. Blocks in divergent SIMD flow are
/// skipped unless the options say SIMD flow is unmasked. Returns how many
/// were inserted.
pub fn insert_pseudo_kills(kernel: &mut Kernel) -> usize {
    let mut inserted = 0;
    let order = kernel.fg.order.clone();

    for block in order {
        if kernel.fg.blocks[block].in_simd_flow && !kernel.options.simd_flow_unmasked {
            continue;
        }

        let mut footprints: SaHashMap<Declare, BitSet> = SaHashMap::default();
        let mut i = kernel.fg.blocks[block].insts.len();

        while i > 0 {
            i -= 1;

            let inst = kernel.fg.blocks[block].insts[i];
            let data = &kernel.insts[inst];
            let mut kill_at: Option<Declare> = None;
            let reads: SmallVec<[Declare; 4]> = data
                .use_declares()
                .into_iter()
                .map(|d| kernel.decls.root(d))
                .collect();
            let reads_indirect = data
                .srcs
                .iter()
                .any(|s| s.as_reg().map_or(false, RegOperand::is_indirect));

            if let RegBase::Var(d) = data.dst.base {
                let (root, offset) = kernel.decls.root_offset(d);
                let decl = &kernel.decls[root];

                if decl.file == RegFile::Grf && !decl.is_input {
                    if data.op == Opcode::PseudoKill || data.full_def(&kernel.decls).is_some() {
                        footprints.remove(&root);
                    } else if data.pred.is_none() {
                        let size = decl.byte_size() as usize;
                        let fp = footprints
                            .entry(root)
                            .or_insert_with(|| BitSet::new(size));
                        let base = offset as usize;

                        if let Some(send) = data.send {
                            let start = base + data.dst.byte_offset() as usize;
                            let end = start + usize::from(send.resp_len) * GRF_BYTES as usize;

                            fp.set_range(start.min(size), end.min(size));
                        } else {
                            let elem = data.dst.ty.size() as usize;

                            for ch in 0..u32::from(data.exec_size) {
                                let start = base + data.dst.channel_byte(ch, true) as usize;

                                fp.set_range(start.min(size), (start + elem).min(size));
                            }
                        }

                        // a write that also reads the declare cannot be preceded by a kill
                        let read_here = reads.contains(&root) || (reads_indirect && decl.addr_taken);

                        if fp.all_in_range(0, size) && !read_here {
                            kill_at = Some(root);
                            footprints.remove(&root);
                        }
                    }
                }
            }

            // reads end the run, indirect reads may touch anything address-taken
            for root in reads.iter() {
                footprints.remove(root);
            }

            if reads_indirect {
                footprints.retain(|d, _| !kernel.decls[*d].addr_taken);
            }

            // an earlier round may have placed the kill already
            let killed = i > 0 && {
                let prev = &kernel.insts[kernel.fg.blocks[block].insts[i - 1]];

                prev.op == Opcode::PseudoKill && kill_at.map_or(false, |r| prev.dst.declare() == Some(r))
            };

            if let Some(root) = kill_at.filter(|_| !killed) {
                let ty = kernel.decls[root].ty;
                let kill = InstData::new(Opcode::PseudoKill, 1)
                    .with_dst(RegOperand::dst(root, ty))
                    .with_no_mask();
                let kill = kernel.create_inst(kill);

                trace!("pseudo_kill for '{}' in {block:?}", kernel.decls[root].name);

                kernel.fg.blocks[block].insts.insert(i, kill);
                inserted += 1;
            }
        }
    }

    if inserted > 0 {
        kernel.renumber();
        debug!("inserted {inserted} pseudo kills");
    }

    inserted
}
