//======---------------------------------------------------------------======//
//                                                                           //
// Copyright 2022-2023 Evan Cox <evanacox00@gmail.com>. All rights reserved. //
//                                                                           //
// Use of this source code is governed by a BSD-style license that can be    //
// found in the LICENSE.txt file at the root of this project, or at the      //
// following link: https://opensource.org/licenses/BSD-3-Clause              //
//                                                                           //
//======---------------------------------------------------------------======//

use crate::dense_arena_key;
use crate::ir::{
    CondMod, Declare, DeclareTable, ElemType, Operand, Predicate, RegBase, RegOperand,
};
use crate::target::GRF_BYTES;
use smallvec::{smallvec, SmallVec};

#[cfg(feature = "enable-serde")]
use serde::{Deserialize, Serialize};

dense_arena_key! {
    /// A reference to an instruction in a kernel.
    pub struct Inst;

    /// A reference to a label in a kernel.
    pub struct Label;
}

/// Extended math functions.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub enum MathFn {
    /// `1 / x`
    Inv,
    /// `log2(x)`
    Log,
    /// `exp2(x)`
    Exp,
    /// `sqrt(x)`
    Sqrt,
    /// `1 / sqrt(x)`
    Rsq,
    /// `sin(x)`
    Sin,
    /// `cos(x)`
    Cos,
    /// `pow(x, y)`
    Pow,
    /// Integer quotient.
    IntDiv,
    /// Integer remainder.
    IntRem,
}

/// The shared function unit a send is directed to.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub enum Sfid {
    /// Texture sampler.
    Sampler,
    /// Data port (memory reads/writes).
    DataPort,
    /// Unified return buffer.
    Urb,
    /// Scratch space, used for spill/fill.
    Scratch,
    /// Message gateway.
    Gateway,
}

/// The message descriptor of a send.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct SendDesc {
    /// The function unit.
    pub sfid: Sfid,
    /// Payload length in rows.
    pub msg_len: u8,
    /// Response length in rows.
    pub resp_len: u8,
    /// Function-specific descriptor bits.
    pub desc: u32,
    /// Whether this send ends the thread.
    pub eot: bool,
    /// Whether the first payload row is a message header.
    pub header: bool,
}

/// Stage-specific operations that are lowered before allocation.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub enum IntrinsicOp {
    /// `dst = input[src0].attr[src1]`, reads a hull-shader input control point.
    HsInputRead,
    /// `output[src0].attr[src1] = src2`, writes a hull-shader output control point.
    HsOutputWrite,
}

/// Instruction opcodes.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub enum Opcode {
    /// `mov`
    Mov,
    /// `sel`
    Sel,
    /// `not`
    Not,
    /// `and`
    And,
    /// `or`
    Or,
    /// `xor`
    Xor,
    /// `shl`
    Shl,
    /// `shr`
    Shr,
    /// `asr`
    Asr,
    /// `add`
    Add,
    /// `addc`, also writes the carry into the accumulator.
    Addc,
    /// `subb`, also writes the borrow into the accumulator.
    Subb,
    /// `avg`
    Avg,
    /// `mul`
    Mul,
    /// High half of a 32x32 multiply. Not a hardware instruction.
    Mulh,
    /// `mach`, reads the accumulator written by a `mul`.
    Mach,
    /// `mac`, `dst = acc + src0 * src1`.
    Mac,
    /// `mad`, `dst = src0 + src1 * src2`.
    Mad,
    /// Fused multiply-add with `dst = src0 * src1 + src2`. Not a hardware
    /// instruction, conformity lowers it.
    Fma,
    /// Extended math.
    Math(MathFn),
    /// `cmp`
    Cmp,
    /// `lzd`
    Lzd,
    /// `frc`
    Frc,
    /// `rndd`
    Rndd,
    /// `send`
    Send,
    /// A label marker, starts a block.
    Label,
    /// Uniform jump.
    Jmpi,
    /// Divergent SIMD branch.
    Goto,
    /// SIMD reconvergence point.
    Join,
    /// Subroutine call.
    Call,
    /// Subroutine return.
    Ret,
    /// Marks the start of a live range, inserted by liveness.
    PseudoKill,
    /// `nop`
    Nop,
    /// A stage-specific operation.
    Intrinsic(IntrinsicOp),
}

impl Opcode {
    /// The number of explicit sources.
    pub fn num_srcs(self) -> usize {
        match self {
            Opcode::Mov | Opcode::Not | Opcode::Lzd | Opcode::Frc | Opcode::Rndd => 1,
            Opcode::Math(MathFn::Pow | MathFn::IntDiv | MathFn::IntRem) => 2,
            Opcode::Math(_) => 1,
            Opcode::Mad | Opcode::Fma => 3,
            Opcode::Send => 1,
            Opcode::Label
            | Opcode::Jmpi
            | Opcode::Goto
            | Opcode::Join
            | Opcode::Call
            | Opcode::Ret
            | Opcode::PseudoKill
            | Opcode::Nop => 0,
            Opcode::Intrinsic(IntrinsicOp::HsInputRead) => 2,
            Opcode::Intrinsic(IntrinsicOp::HsOutputWrite) => 3,
            _ => 2,
        }
    }

    /// Whether this is a three-source instruction.
    #[inline]
    pub fn is_ternary(self) -> bool {
        matches!(self, Opcode::Mad | Opcode::Fma)
    }

    /// Whether the instruction transfers control and ends its block.
    #[inline]
    pub fn is_control_flow(self) -> bool {
        matches!(
            self,
            Opcode::Jmpi | Opcode::Goto | Opcode::Join | Opcode::Call | Opcode::Ret
        )
    }

    /// Whether this opcode is an extended math function.
    #[inline]
    pub fn is_math(self) -> bool {
        matches!(self, Opcode::Math(_))
    }

    /// Whether the instruction writes the accumulator as a side effect.
    #[inline]
    pub fn writes_acc_implicitly(self) -> bool {
        matches!(self, Opcode::Addc | Opcode::Subb | Opcode::Mach | Opcode::Mac)
    }

    /// Whether the instruction reads the accumulator as a side effect.
    #[inline]
    pub fn reads_acc_implicitly(self) -> bool {
        matches!(self, Opcode::Mach | Opcode::Mac)
    }

    /// Whether `a op b == b op a`.
    #[inline]
    pub fn is_commutative(self) -> bool {
        matches!(
            self,
            Opcode::Add | Opcode::Mul | Opcode::And | Opcode::Or | Opcode::Xor | Opcode::Avg
        )
    }

    /// Whether the instruction exists only before conformity/allocation.
    #[inline]
    pub fn is_pseudo(self) -> bool {
        matches!(
            self,
            Opcode::Mulh | Opcode::Fma | Opcode::PseudoKill | Opcode::Intrinsic(_)
        )
    }

    /// The assembly mnemonic.
    pub fn mnemonic(self) -> &'static str {
        match self {
            Opcode::Mov => "mov",
            Opcode::Sel => "sel",
            Opcode::Not => "not",
            Opcode::And => "and",
            Opcode::Or => "or",
            Opcode::Xor => "xor",
            Opcode::Shl => "shl",
            Opcode::Shr => "shr",
            Opcode::Asr => "asr",
            Opcode::Add => "add",
            Opcode::Addc => "addc",
            Opcode::Subb => "subb",
            Opcode::Avg => "avg",
            Opcode::Mul => "mul",
            Opcode::Mulh => "mulh",
            Opcode::Mach => "mach",
            Opcode::Mac => "mac",
            Opcode::Mad => "mad",
            Opcode::Fma => "fma",
            Opcode::Math(MathFn::Inv) => "math.inv",
            Opcode::Math(MathFn::Log) => "math.log",
            Opcode::Math(MathFn::Exp) => "math.exp",
            Opcode::Math(MathFn::Sqrt) => "math.sqrt",
            Opcode::Math(MathFn::Rsq) => "math.rsq",
            Opcode::Math(MathFn::Sin) => "math.sin",
            Opcode::Math(MathFn::Cos) => "math.cos",
            Opcode::Math(MathFn::Pow) => "math.pow",
            Opcode::Math(MathFn::IntDiv) => "math.idiv",
            Opcode::Math(MathFn::IntRem) => "math.irem",
            Opcode::Cmp => "cmp",
            Opcode::Lzd => "lzd",
            Opcode::Frc => "frc",
            Opcode::Rndd => "rndd",
            Opcode::Send => "send",
            Opcode::Label => "label",
            Opcode::Jmpi => "jmpi",
            Opcode::Goto => "goto",
            Opcode::Join => "join",
            Opcode::Call => "call",
            Opcode::Ret => "ret",
            Opcode::PseudoKill => "pseudo_kill",
            Opcode::Nop => "nop",
            Opcode::Intrinsic(IntrinsicOp::HsInputRead) => "hs_input_read",
            Opcode::Intrinsic(IntrinsicOp::HsOutputWrite) => "hs_output_write",
        }
    }
}

/// A label in a kernel.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct LabelData {
    /// Name of the label.
    pub name: String,
    /// Whether the label starts a subroutine.
    pub subroutine: bool,
}

/// A single instruction.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct InstData {
    /// What the instruction does.
    pub op: Opcode,
    /// Number of SIMD channels.
    pub exec_size: u8,
    /// First channel of the execution mask that this instruction uses.
    pub mask_offset: u8,
    /// Whether the instruction ignores the execution mask.
    pub no_mask: bool,
    /// Whether the result is saturated.
    pub sat: bool,
    /// Optional predicate.
    pub pred: Option<Predicate>,
    /// Optional condition modifier.
    pub cond_mod: Option<CondMod>,
    /// The destination, [`RegOperand::null`] if there is none.
    pub dst: RegOperand,
    /// Explicit sources.
    pub srcs: SmallVec<[Operand; 3]>,
    /// The accumulator read implicitly (by `mach`/`mac`), if any.
    pub implicit_acc_src: Option<u8>,
    /// The accumulator written implicitly (by `mul` feeding `mach`,
    /// `addc`/`subb`), if any.
    pub implicit_acc_dst: Option<u8>,
    /// Message descriptor for sends.
    pub send: Option<SendDesc>,
    /// Target of labels, branches and calls.
    pub target: Option<Label>,
    /// Position in the kernel, assigned by [`crate::ir::Kernel::renumber`].
    pub lexical_id: u32,
}

impl InstData {
    /// Creates an instruction with no operands.
    pub fn new(op: Opcode, exec_size: u8) -> Self {
        assert!(
            exec_size.is_power_of_two() && exec_size <= 32,
            "invalid execution size {exec_size}"
        );

        Self {
            op,
            exec_size,
            mask_offset: 0,
            no_mask: false,
            sat: false,
            pred: None,
            cond_mod: None,
            dst: RegOperand::null(ElemType::UD),
            srcs: smallvec![],
            implicit_acc_src: None,
            implicit_acc_dst: None,
            send: None,
            target: None,
            lexical_id: 0,
        }
    }

    /// Sets the destination.
    pub fn with_dst(mut self, dst: RegOperand) -> Self {
        self.dst = dst;
        self
    }

    /// Appends a source.
    pub fn with_src(mut self, src: impl Into<Operand>) -> Self {
        self.srcs.push(src.into());
        self
    }

    /// Sets the predicate.
    pub fn with_pred(mut self, pred: Predicate) -> Self {
        self.pred = Some(pred);
        self
    }

    /// Sets the condition modifier.
    pub fn with_cond_mod(mut self, cond_mod: CondMod) -> Self {
        self.cond_mod = Some(cond_mod);
        self
    }

    /// Marks the instruction as `NoMask`.
    pub fn with_no_mask(mut self) -> Self {
        self.no_mask = true;
        self
    }

    /// Sets the branch/call target.
    pub fn with_target(mut self, label: Label) -> Self {
        self.target = Some(label);
        self
    }

    /// The declare directly written by the destination.
    #[inline]
    pub fn dst_declare(&self) -> Option<Declare> {
        self.dst.declare()
    }

    /// Every declare read directly by a source.
    pub fn src_declares(&self) -> impl Iterator<Item = Declare> + '_ {
        self.srcs.iter().filter_map(Operand::declare)
    }

    /// Every declare the instruction reads: direct sources, the address
    /// declares of indirect operands (including an indirect destination),
    /// the predicate flag and the variable of an `&var` source.
    pub fn use_declares(&self) -> SmallVec<[Declare; 4]> {
        let mut out = SmallVec::new();

        if let RegBase::Indirect { addr, .. } = self.dst.base {
            out.push(addr);
        }

        for src in self.srcs.iter() {
            match src {
                Operand::Reg(r) => match r.base {
                    RegBase::Var(d) => out.push(d),
                    RegBase::Indirect { addr, .. } => out.push(addr),
                    _ => {}
                },
                Operand::AddrOf { var, .. } => out.push(*var),
                Operand::Imm { .. } => {}
            }
        }

        if let Some(pred) = self.pred {
            out.push(pred.flag);
        }

        out
    }

    /// Every declare the instruction writes directly: the destination and
    /// the condition-modifier flag.
    pub fn def_declares(&self) -> SmallVec<[Declare; 2]> {
        let mut out = SmallVec::new();

        out.extend(self.dst.declare());

        if let Some(cm) = self.cond_mod {
            out.push(cm.flag);
        }

        out
    }

    /// Whether this is a send.
    #[inline]
    pub fn is_send(&self) -> bool {
        self.op == Opcode::Send
    }

    /// Whether this is an end-of-thread send.
    #[inline]
    pub fn is_eot(&self) -> bool {
        self.send.map_or(false, |s| s.eot)
    }

    /// Whether the instruction ends its block.
    #[inline]
    pub fn ends_block(&self) -> bool {
        self.op.is_control_flow() || self.is_eot()
    }

    /// Number of rows a send source reads, or `None` if `idx` is not a
    /// send payload.
    pub fn send_src_rows(&self, idx: usize) -> Option<u32> {
        match (self.send, idx) {
            (Some(desc), 0) => Some(u32::from(desc.msg_len)),
            _ => None,
        }
    }

    /// The execution type, the widest type among the sources.
    pub fn exec_type(&self) -> ElemType {
        self.srcs
            .iter()
            .map(Operand::ty)
            .reduce(ElemType::wider_exec)
            .unwrap_or_else(|| self.dst.ty.exec_type())
    }

    /// If the destination writes every byte of its root declare without a
    /// predicate, returns that root. Execution masking is not considered.
    pub fn full_def(&self, decls: &DeclareTable) -> Option<Declare> {
        if self.pred.is_some() {
            return None;
        }

        let (root, offset) = decls.root_offset(self.dst.declare()?);
        let size = decls[root].byte_size();

        if offset + self.dst.byte_offset() != 0 {
            return None;
        }

        if let Some(send) = self.send {
            return (u32::from(send.resp_len) * GRF_BYTES >= size).then_some(root);
        }

        let stride_ok = self.exec_size == 1 || self.dst.region.hstride == 1;
        let bytes = u32::from(self.exec_size) * self.dst.ty.size();

        (stride_ok && bytes == size).then_some(root)
    }

    /// Whether any operand is indirect.
    pub fn has_indirect(&self) -> bool {
        self.dst.is_indirect()
            || self
                .srcs
                .iter()
                .any(|s| s.as_reg().map_or(false, RegOperand::is_indirect))
    }
}
