//======---------------------------------------------------------------======//
//                                                                           //
// Copyright 2022-2023 Evan Cox <evanacox00@gmail.com>. All rights reserved. //
//                                                                           //
// Use of this source code is governed by a BSD-style license that can be    //
// found in the LICENSE.txt file at the root of this project, or at the      //
// following link: https://opensource.org/licenses/BSD-3-Clause              //
//                                                                           //
//======---------------------------------------------------------------======//

//! Kernel-building helpers shared by the unit tests.

use crate::flowgraph::Block;
use crate::ir::*;
use crate::options::CodegenOptions;
use crate::target::{Platform, Target};

/// Initializes `env_logger` once, so `RUST_LOG=trace cargo test` shows
/// what the passes are doing.
pub(crate) fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// An empty Gen12LP kernel with default options.
pub(crate) fn kernel() -> Kernel {
    kernel_for(Platform::Gen12Lp, CodegenOptions::default())
}

/// An empty kernel for a specific platform.
pub(crate) fn kernel_for(platform: Platform, options: CodegenOptions) -> Kernel {
    init_logging();

    Kernel::new("test", Target::new(platform), options)
}

/// A predicate on a fresh flag declare.
pub(crate) fn flag_pred(k: &mut Kernel) -> Predicate {
    let flag = k.create_decl(DeclareData::new("F", RegFile::Flag, ElemType::UW, 1));

    Predicate {
        flag,
        inverse: false,
    }
}

/// ```text
///      b0
///     /  \
///    b1  b2
///     \  /
///      b3
/// ```
pub(crate) fn diamond() -> (Kernel, [Block; 4]) {
    let mut k = kernel();
    let v1 = k.create_decl(DeclareData::grf("V1", ElemType::D, 8));
    let else_ = k.create_label("else", false);
    let end = k.create_label("end", false);
    let pred = flag_pred(&mut k);
    let mut b = Builder::new(&mut k);

    b.jmpi(else_, Some(pred));
    b.mov(8, v1, Operand::imm(1, ElemType::D));
    b.jmpi(end, None);
    b.label(else_);
    b.mov(8, v1, Operand::imm(2, ElemType::D));
    b.label(end);
    b.eot();

    k.build_flowgraph();

    let blocks = match k.fg.order[..] {
        [b0, b1, b2, b3] => [b0, b1, b2, b3],
        _ => panic!("diamond should have four blocks"),
    };

    (k, blocks)
}

/// A kernel that calls one subroutine. Returns the call block and the
/// subroutine's INIT block.
pub(crate) fn with_subroutine() -> (Kernel, Block, Block) {
    let mut k = kernel();
    let v1 = k.create_decl(DeclareData::grf("V1", ElemType::D, 8));
    let sub = k.create_label("sub", true);
    let mut b = Builder::new(&mut k);

    b.mov(8, v1, Operand::imm(1, ElemType::D));
    b.call(sub);
    b.mov(8, v1, Operand::imm(2, ElemType::D));
    b.eot();
    b.label(sub);
    b.mov(8, v1, Operand::imm(3, ElemType::D));
    b.ret();

    k.build_flowgraph();

    let (call, init) = (k.fg.order[0], k.fg.order[2]);

    (k, call, init)
}

/// All instructions of the kernel in layout order.
pub(crate) fn all_insts(k: &Kernel) -> Vec<Inst> {
    k.fg
        .order
        .iter()
        .flat_map(|&b| k.fg.blocks[b].insts.iter().copied())
        .collect()
}

/// The opcodes of every instruction in layout order, labels excluded.
pub(crate) fn opcodes(k: &Kernel) -> Vec<Opcode> {
    all_insts(k)
        .into_iter()
        .map(|i| k.insts[i].op)
        .filter(|op| *op != Opcode::Label)
        .collect()
}
