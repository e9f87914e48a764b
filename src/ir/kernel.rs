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
use crate::flowgraph::FlowGraph;
use crate::ir::{
    Declare, DeclareData, DeclareTable, ElemType, Inst, InstData, InstDisplay, Label, LabelData,
    Operand, Region, RegOperand,
};
use crate::options::CodegenOptions;
use crate::target::Target;
use log::debug;
use std::fmt::Write;
use std::mem;

/// The single owner of everything created while compiling one kernel.
///
/// Declares, instructions and labels are allocated in the arenas here and
/// referred to by key everywhere else. Before [`Self::build_flowgraph`]
/// the instructions live in a flat [`Self::stream`], afterwards they are
/// owned by the blocks of [`Self::fg`] and the stream is empty.
#[derive(Debug)]
pub struct Kernel {
    /// Name of the kernel.
    pub name: String,
    /// The hardware being compiled for.
    pub target: Target,
    /// Codegen options.
    pub options: CodegenOptions,
    /// Every variable.
    pub decls: DeclareTable,
    /// Every instruction ever created, including ones no longer in a block.
    pub insts: ArenaMap<Inst, InstData>,
    /// Every label.
    pub labels: ArenaMap<Label, LabelData>,
    /// The flat instruction stream, before the flow graph is built.
    pub stream: Vec<Inst>,
    /// The control-flow graph.
    pub fg: FlowGraph,
    next_temp: u32,
}

impl Kernel {
    /// Creates an empty kernel.
    pub fn new(name: impl Into<String>, target: Target, options: CodegenOptions) -> Self {
        Self {
            name: name.into(),
            target,
            options,
            decls: DeclareTable::new(),
            insts: ArenaMap::new(),
            labels: ArenaMap::new(),
            stream: Vec::new(),
            fg: FlowGraph::new(),
            next_temp: 0,
        }
    }

    /// Number of GRF rows the allocator may use.
    pub fn total_grf(&self) -> u32 {
        self.options
            .total_grf
            .unwrap_or_else(|| self.target.grf_count())
            .min(self.target.grf_count())
    }

    /// Creates a label.
    pub fn create_label(&mut self, name: impl Into<String>, subroutine: bool) -> Label {
        self.labels.insert(LabelData {
            name: name.into(),
            subroutine,
        })
    }

    /// Adds an instruction to the arena without placing it anywhere.
    pub fn create_inst(&mut self, data: InstData) -> Inst {
        self.insts.insert(data)
    }

    /// Adds a declare.
    pub fn create_decl(&mut self, data: DeclareData) -> Declare {
        self.decls.create(data)
    }

    /// Creates a fresh GRF temporary.
    pub fn create_temp(&mut self, ty: ElemType, num_elems: u32) -> Declare {
        let name = format!("TMP{}", self.next_temp);

        self.next_temp += 1;
        self.decls.create(DeclareData::grf(name, ty, num_elems))
    }

    /// A source reading `decl` contiguously for `exec_size` channels.
    pub fn src(&self, decl: Declare, exec_size: u8) -> Operand {
        let ty = self.decls[decl].ty;

        RegOperand::src(decl, ty, Region::contiguous(exec_size)).into()
    }

    /// A source reading element 0 of `decl` in every channel.
    pub fn scalar(&self, decl: Declare) -> Operand {
        let ty = self.decls[decl].ty;

        RegOperand::src(decl, ty, Region::scalar()).into()
    }

    /// A destination writing `decl` contiguously.
    pub fn dst(&self, decl: Declare) -> RegOperand {
        RegOperand::dst(decl, self.decls[decl].ty)
    }

    /// Moves the flat stream into a freshly built flow graph.
    pub fn build_flowgraph(&mut self) {
        let stream = mem::take(&mut self.stream);

        self.fg = FlowGraph::construct(stream, &self.insts, &self.labels);
        self.fg.compute_global_operands(&self.insts, &self.decls);
        self.renumber();

        debug!(
            "built flow graph for '{}': {} blocks, {} functions",
            self.name,
            self.fg.num_blocks(),
            self.fg.funcs.len()
        );
    }

    /// Assigns lexical ids to every instruction in layout order.
    pub fn renumber(&mut self) {
        let mut id = 0;

        for &block in self.fg.order.iter() {
            for &inst in self.fg.blocks[block].insts.iter() {
                self.insts[inst].lexical_id = id;
                id += 1;
            }
        }
    }

    /// Pretty-prints an instruction.
    pub fn display_inst(&self, inst: Inst) -> InstDisplay<'_> {
        InstDisplay::new(&self.insts[inst], &self.decls, &self.labels)
    }

    /// Every instruction in layout order, as text. Used for debug logs
    /// and tests.
    pub fn dump(&self) -> String {
        let mut out = String::new();

        for &block in self.fg.order.iter() {
            let _ = writeln!(out, "{:?}:", block);

            for &inst in self.fg.blocks[block].insts.iter() {
                let _ = writeln!(out, "    {}", self.display_inst(inst));
            }
        }

        out
    }
}
