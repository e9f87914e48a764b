//======---------------------------------------------------------------======//
//                                                                           //
// Copyright 2022-2023 Evan Cox <evanacox00@gmail.com>. All rights reserved. //
//                                                                           //
// Use of this source code is governed by a BSD-style license that can be    //
// found in the LICENSE.txt file at the root of this project, or at the      //
// following link: https://opensource.org/licenses/BSD-3-Clause              //
//                                                                           //
//======---------------------------------------------------------------======//

use crate::ir::*;

/// Appends instructions to the flat stream of a [`Kernel`].
///
/// This is what front-ends (and tests) use to produce a kernel before the
/// flow graph is built. Every method returns the new instruction.
///
/// ```
/// # use opal::ir::*;
/// # use opal::options::CodegenOptions;
/// # use opal::target::{Platform, Target};
/// let mut kernel = Kernel::new("k", Target::new(Platform::Gen12Lp), CodegenOptions::default());
/// let v1 = kernel.create_decl(DeclareData::grf("V1", ElemType::F, 8));
/// let mut b = Builder::new(&mut kernel);
///
/// b.mov(8, v1, Operand::imm_f32(1.0));
/// b.eot();
///
/// kernel.build_flowgraph();
/// assert_eq!(kernel.fg.num_blocks(), 1);
/// ```
pub struct Builder<'k> {
    kernel: &'k mut Kernel,
}

impl<'k> Builder<'k> {
    /// Creates a builder that appends to `kernel`'s stream.
    pub fn new(kernel: &'k mut Kernel) -> Self {
        Self { kernel }
    }

    /// Gets the kernel being built.
    pub fn kernel(&mut self) -> &mut Kernel {
        self.kernel
    }

    /// Appends an arbitrary instruction.
    pub fn push(&mut self, data: InstData) -> Inst {
        let inst = self.kernel.create_inst(data);

        self.kernel.stream.push(inst);
        inst
    }

    /// Places a label.
    pub fn label(&mut self, label: Label) -> Inst {
        self.push(InstData::new(Opcode::Label, 1).with_target(label))
    }

    /// `mov (exec) dst src`
    pub fn mov(&mut self, exec_size: u8, dst: Declare, src: Operand) -> Inst {
        let dst = self.kernel.dst(dst);

        self.push(InstData::new(Opcode::Mov, exec_size).with_dst(dst).with_src(src))
    }

    /// A two-source instruction writing all of `dst`.
    pub fn binary(&mut self, op: Opcode, exec_size: u8, dst: Declare, a: Operand, b: Operand) -> Inst {
        let dst = self.kernel.dst(dst);

        self.push(
            InstData::new(op, exec_size)
                .with_dst(dst)
                .with_src(a)
                .with_src(b),
        )
    }

    /// `add (exec) dst a b`, every operand read contiguously.
    pub fn add(&mut self, exec_size: u8, dst: Declare, a: Declare, b: Declare) -> Inst {
        let (a, b) = (self.kernel.src(a, exec_size), self.kernel.src(b, exec_size));

        self.binary(Opcode::Add, exec_size, dst, a, b)
    }

    /// `mul (exec) dst a b`, every operand read contiguously.
    pub fn mul(&mut self, exec_size: u8, dst: Declare, a: Declare, b: Declare) -> Inst {
        let (a, b) = (self.kernel.src(a, exec_size), self.kernel.src(b, exec_size));

        self.binary(Opcode::Mul, exec_size, dst, a, b)
    }

    /// A three-source instruction (`mad` or the `fma` pseudo op).
    pub fn ternary(
        &mut self,
        op: Opcode,
        exec_size: u8,
        dst: Declare,
        srcs: [Operand; 3],
    ) -> Inst {
        assert!(op.is_ternary(), "{} is not a three-source opcode", op.mnemonic());

        let dst = self.kernel.dst(dst);
        let mut data = InstData::new(op, exec_size).with_dst(dst);

        data.srcs.extend(srcs);
        self.push(data)
    }

    /// `cmp.kind.flag (exec) null a b`
    pub fn cmp(&mut self, exec_size: u8, kind: CondKind, flag: Declare, a: Operand, b: Operand) -> Inst {
        let ty = a.ty();

        self.push(
            InstData::new(Opcode::Cmp, exec_size)
                .with_dst(RegOperand::null(ty))
                .with_src(a)
                .with_src(b)
                .with_cond_mod(CondMod { kind, flag }),
        )
    }

    /// A send. `dst` receives `resp_len` rows, `payload` provides `msg_len` rows.
    pub fn send(&mut self, exec_size: u8, dst: Option<Declare>, payload: Declare, desc: SendDesc) -> Inst {
        let dst = match dst {
            Some(d) => self.kernel.dst(d),
            None => RegOperand::null(ElemType::UD),
        };
        let payload = self.kernel.src(payload, exec_size);
        let mut data = InstData::new(Opcode::Send, exec_size).with_dst(dst).with_src(payload);

        data.send = Some(desc);
        self.push(data)
    }

    /// The end-of-thread send, with a one-row dummy payload.
    pub fn eot(&mut self) -> Inst {
        let payload = self.kernel.create_temp(ElemType::UD, 8);
        self.kernel.decls[payload].eot = true;

        self.send(
            8,
            None,
            payload,
            SendDesc {
                sfid: Sfid::Gateway,
                msg_len: 1,
                resp_len: 0,
                desc: 0,
                eot: true,
                header: false,
            },
        )
    }

    /// `jmpi label`, optionally predicated.
    pub fn jmpi(&mut self, label: Label, pred: Option<Predicate>) -> Inst {
        let mut data = InstData::new(Opcode::Jmpi, 1).with_target(label);

        data.pred = pred;
        self.push(data)
    }

    /// `goto label`, a divergent SIMD branch.
    pub fn goto(&mut self, exec_size: u8, label: Label, pred: Predicate) -> Inst {
        self.push(
            InstData::new(Opcode::Goto, exec_size)
                .with_target(label)
                .with_pred(pred),
        )
    }

    /// `join label`, reconverges channels that took a `goto`.
    pub fn join(&mut self, exec_size: u8, label: Label) -> Inst {
        self.push(InstData::new(Opcode::Join, exec_size).with_target(label))
    }

    /// `call label`
    pub fn call(&mut self, label: Label) -> Inst {
        assert!(
            self.kernel.labels[label].subroutine,
            "call to non-subroutine label '{}'",
            self.kernel.labels[label].name
        );

        self.push(InstData::new(Opcode::Call, 1).with_target(label))
    }

    /// `ret`
    pub fn ret(&mut self) -> Inst {
        self.push(InstData::new(Opcode::Ret, 1))
    }

    /// A stage-specific intrinsic.
    pub fn intrinsic(
        &mut self,
        op: IntrinsicOp,
        exec_size: u8,
        dst: Option<Declare>,
        srcs: &[Operand],
    ) -> Inst {
        let dst = match dst {
            Some(d) => self.kernel.dst(d),
            None => RegOperand::null(ElemType::UD),
        };
        let mut data = InstData::new(Opcode::Intrinsic(op), exec_size).with_dst(dst);

        data.srcs.extend(srcs.iter().copied());
        self.push(data)
    }
}
