//======---------------------------------------------------------------======//
//                                                                           //
// Copyright 2022-2023 Evan Cox <evanacox00@gmail.com>. All rights reserved. //
//                                                                           //
// Use of this source code is governed by a BSD-style license that can be    //
// found in the LICENSE.txt file at the root of this project, or at the      //
// following link: https://opensource.org/licenses/BSD-3-Clause              //
//                                                                           //
//======---------------------------------------------------------------======//

//! Instruction legalization.
//!
//! [`HwConformity`] walks every block once, front to back, and runs the
//! fix-up rules of [`conform_inst`] on each instruction in a fixed order.
//! A rule that finds its instruction already legal changes nothing, so
//! running the pass over its own output is a no-op.
//!
//! Rules rewrite the instruction in place and may insert new instructions
//! before or after it. Instructions inserted after the current one are
//! assumed to be legal and are skipped by the scan, which is why the order
//! of the rules matters: a later rule must never undo what an earlier one
//! fixed.

mod acc_sub;
mod multiply;
mod operands;
mod split;

pub use acc_sub::substitute_accumulators;

use crate::flowgraph::Block;
use crate::ir::{
    Declare, ElemType, Inst, InstData, Kernel, Opcode, Operand, RegOperand, Region, SubRegAlign,
};
use crate::target::Target;
use log::{debug, trace};

/// What a run of [`HwConformity`] did.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ConformityStats {
    /// Instructions that at least one rule changed.
    pub rewritten: usize,
    /// Instructions inserted by rules.
    pub inserted: usize,
    /// Instructions removed by fusing them into a neighbor.
    pub removed: usize,
    /// Variables replaced by an accumulator.
    pub acc_substituted: usize,
}

/// The legalization pass over a whole kernel.
pub struct HwConformity<'k> {
    kernel: &'k mut Kernel,
}

impl<'k> HwConformity<'k> {
    /// Prepares to legalize `kernel`, which must already have its flowgraph.
    pub fn new(kernel: &'k mut Kernel) -> Self {
        Self { kernel }
    }

    /// Legalizes every instruction, then substitutes accumulators if the
    /// options ask for it.
    pub fn run(&mut self) -> ConformityStats {
        let mut stats = ConformityStats::default();
        let order = self.kernel.fg.order.clone();

        for block in order {
            let mut i = 0;

            while i < self.kernel.fg.blocks[block].insts.len() {
                let mut ctx = FixupCtx::new(self.kernel, block, i);

                conform_inst(&mut ctx);

                stats.rewritten += usize::from(ctx.changed);
                stats.inserted += ctx.inserted;
                stats.removed += ctx.removed;
                i = ctx.next();
            }
        }

        if self.kernel.options.acc_substitution {
            stats.acc_substituted = substitute_accumulators(self.kernel);
        }

        self.kernel.renumber();

        debug!(
            "conformity on '{}': {} rewritten, {} inserted, {} removed, {} in accumulators",
            self.kernel.name, stats.rewritten, stats.inserted, stats.removed, stats.acc_substituted
        );

        stats
    }
}

/// The state a fix-up rule works with: the kernel, and where in it the
/// instruction being legalized is.
pub struct FixupCtx<'k> {
    kernel: &'k mut Kernel,
    block: Block,
    pos: usize,
    after: usize,
    inserted: usize,
    removed: usize,
    changed: bool,
}

impl<'k> FixupCtx<'k> {
    /// Points at instruction `pos` of `block`.
    pub fn new(kernel: &'k mut Kernel, block: Block, pos: usize) -> Self {
        Self {
            kernel,
            block,
            pos,
            after: 0,
            inserted: 0,
            removed: 0,
            changed: false,
        }
    }

    /// The kernel being legalized.
    pub fn kernel(&self) -> &Kernel {
        self.kernel
    }

    /// The target being legalized for.
    pub fn target(&self) -> &Target {
        &self.kernel.target
    }

    /// The current instruction.
    pub fn inst(&self) -> Inst {
        self.kernel.fg.blocks[self.block].insts[self.pos]
    }

    /// The current instruction's data.
    pub fn data(&self) -> &InstData {
        &self.kernel.insts[self.inst()]
    }

    /// The current instruction's data, marking it as changed.
    pub fn data_mut(&mut self) -> &mut InstData {
        let inst = self.inst();

        self.changed = true;

        &mut self.kernel.insts[inst]
    }

    /// Replaces the current instruction with `data`.
    pub fn replace(&mut self, data: InstData) {
        *self.data_mut() = data;
    }

    /// Whether any rule has changed the current instruction so far.
    pub fn changed(&self) -> bool {
        self.changed
    }

    /// A fresh temporary.
    pub fn temp(&mut self, ty: ElemType, num_elems: u32) -> Declare {
        self.kernel.create_temp(ty, num_elems)
    }

    /// A fresh temporary that starts at the beginning of a row.
    pub fn row_temp(&mut self, ty: ElemType, num_elems: u32) -> Declare {
        let temp = self.kernel.create_temp(ty, num_elems);

        self.kernel.decls[temp].sub_align = SubRegAlign::Grf;

        temp
    }

    /// Inserts `data` right before the current instruction.
    pub fn insert_before(&mut self, data: InstData) -> Inst {
        let inst = self.kernel.create_inst(data);

        self.kernel.fg.blocks[self.block].insts.insert(self.pos, inst);
        self.pos += 1;
        self.inserted += 1;
        self.changed = true;

        inst
    }

    /// Inserts `data` after the current instruction and everything that
    /// was already inserted after it.
    pub fn insert_after(&mut self, data: InstData) -> Inst {
        let inst = self.kernel.create_inst(data);
        let at = self.pos + 1 + self.after;

        self.kernel.fg.blocks[self.block].insts.insert(at, inst);
        self.after += 1;
        self.inserted += 1;
        self.changed = true;

        inst
    }

    /// Inserts a sequence directly after the current instruction, before
    /// anything that was already inserted after it.
    pub fn insert_right_after(&mut self, seq: impl IntoIterator<Item = InstData>) {
        let at = self.pos + 1;
        let insts: Vec<Inst> = seq
            .into_iter()
            .map(|data| self.kernel.create_inst(data))
            .collect();
        let n = insts.len();

        self.kernel.fg.blocks[self.block].insts.splice(at..at, insts);
        self.after += n;
        self.inserted += n;
        self.changed |= n > 0;
    }

    /// The instruction after the current one, if nothing has been inserted
    /// after the current one yet.
    pub fn following(&self) -> Option<&InstData> {
        if self.after != 0 {
            return None;
        }

        self.kernel.fg.blocks[self.block]
            .insts
            .get(self.pos + 1)
            .map(|&inst| &self.kernel.insts[inst])
    }

    /// Removes the instruction returned by [`Self::following`].
    pub fn remove_following(&mut self) {
        assert_eq!(self.after, 0, "cannot remove past inserted instructions");

        self.kernel.fg.blocks[self.block].insts.remove(self.pos + 1);
        self.removed += 1;
        self.changed = true;
    }

    /// Index of the first instruction the scan has not looked at yet.
    pub fn next(&self) -> usize {
        self.pos + 1 + self.after
    }
}

type Rule = fn(&mut FixupCtx<'_>) -> bool;

// the order here is load-bearing, see the module docs
const RULES: &[(&str, Rule)] = &[
    ("pseudo_fma", multiply::lower_pseudo_fma),
    ("mulh", multiply::expand_mulh),
    ("mul_macro", multiply::expand_mul_macro),
    ("operand_types", operands::fix_operand_types),
    ("immediates", operands::place_immediates),
    ("ternary", operands::legalize_ternary),
    ("indirect", operands::detour_indirect),
    ("src_regions", operands::legalize_src_regions),
    ("dst_region", operands::fix_dst_region),
    ("packed_byte", operands::fix_packed_byte_dst),
    ("acc_operands", operands::fix_acc_operands),
    ("mixed_precision", operands::fix_mixed_precision),
    ("addc_subb", split::pair_carry),
    ("simd_width", split::split_simd),
];

/// Runs every fix-up rule on the instruction `ctx` points at.
pub fn conform_inst(ctx: &mut FixupCtx<'_>) {
    if !needs_fixup(ctx.data()) {
        return;
    }

    for &(name, rule) in RULES.iter() {
        if rule(ctx) {
            trace!("{name}: {}", ctx.kernel.display_inst(ctx.inst()));
        }
    }
}

// labels, branches and markers have nothing to legalize
fn needs_fixup(data: &InstData) -> bool {
    !matches!(
        data.op,
        Opcode::Label
            | Opcode::Jmpi
            | Opcode::Goto
            | Opcode::Join
            | Opcode::Call
            | Opcode::Ret
            | Opcode::PseudoKill
            | Opcode::Nop
            | Opcode::Intrinsic(_)
    )
}

/// Whether `data` is an ALU instruction, i.e. subject to fix-ups and not a send.
pub(crate) fn is_alu(data: &InstData) -> bool {
    needs_fixup(data) && !data.is_send()
}

// a `mov` that copies `src` into the `idx`-th element layout of a fresh
// temporary of `ty`, which then replaces the source
pub(crate) fn copy_src_to_temp(ctx: &mut FixupCtx<'_>, idx: usize, ty: ElemType, row_aligned: bool) {
    let data = ctx.data().clone();
    let src = data.srcs[idx];
    let scalar = match src {
        Operand::Reg(r) => r.region.is_scalar(),
        Operand::Imm { ty, .. } => !ty.is_vector_imm(),
        Operand::AddrOf { .. } => true,
    };
    let exec = if scalar { 1 } else { data.exec_size };
    let temp = if row_aligned {
        ctx.row_temp(ty, u32::from(exec))
    } else {
        ctx.temp(ty, u32::from(exec))
    };

    let mut mov = InstData::new(Opcode::Mov, exec)
        .with_dst(RegOperand::dst(temp, ty))
        .with_src(src);

    mov.no_mask = data.no_mask || scalar;
    mov.mask_offset = if scalar { 0 } else { data.mask_offset };

    ctx.insert_before(mov);

    let region = if scalar {
        Region::scalar()
    } else {
        Region::contiguous(data.exec_size)
    };

    ctx.data_mut().srcs[idx] = Operand::Reg(RegOperand::src(temp, ty, region));
}

// the instruction writes a temporary of `ty` with `stride` instead, and a
// `mov` afterwards copies it to the real destination
pub(crate) fn redirect_dst_to_temp(ctx: &mut FixupCtx<'_>, ty: ElemType, stride: u16, row_aligned: bool) {
    let data = ctx.data().clone();
    let elems = u32::from(data.exec_size) * u32::from(stride);
    let temp = if row_aligned {
        ctx.row_temp(ty, elems)
    } else {
        ctx.temp(ty, elems)
    };

    let mut mov = InstData::new(Opcode::Mov, data.exec_size)
        .with_dst(data.dst)
        .with_src(RegOperand::src(temp, ty, Region::strided(stride, data.exec_size)));

    mov.pred = data.pred;
    mov.no_mask = data.no_mask;
    mov.mask_offset = data.mask_offset;

    ctx.data_mut().dst = RegOperand::dst(temp, ty).with_region(Region::dst(stride));
    ctx.insert_after(mov);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::*;
    use crate::options::CodegenOptions;
    use crate::target::Platform;
    use crate::testing::*;

    fn grf(k: &mut Kernel, name: &str, ty: ElemType, elems: u32) -> Declare {
        k.create_decl(DeclareData::grf(name, ty, elems))
    }

    fn no_acc() -> CodegenOptions {
        CodegenOptions::default().with_acc_substitution(false)
    }

    fn conform(k: &mut Kernel) -> ConformityStats {
        HwConformity::new(k).run()
    }

    #[test]
    fn markers_need_no_fixups() {
        assert!(!needs_fixup(&InstData::new(Opcode::Nop, 1)));
        assert!(!needs_fixup(&InstData::new(Opcode::PseudoKill, 1)));
        assert!(!needs_fixup(&InstData::new(Opcode::Intrinsic(IntrinsicOp::HsInputRead), 8)));
        assert!(needs_fixup(&InstData::new(Opcode::Add, 8)));
        assert!(is_alu(&InstData::new(Opcode::Mov, 8)));
    }

    #[test]
    fn dword_multiply_becomes_mul_mach_mov() {
        let mut k = kernel_for(Platform::Gen12Lp, no_acc());
        let a = grf(&mut k, "A", ElemType::D, 16);
        let b = grf(&mut k, "B", ElemType::D, 16);
        let d = grf(&mut k, "D", ElemType::D, 16);
        let mut builder = Builder::new(&mut k);

        builder.mul(16, d, a, b);
        builder.eot();
        k.build_flowgraph();
        conform(&mut k);

        assert_eq!(
            opcodes(&k),
            vec![Opcode::Mul, Opcode::Mach, Opcode::Mov, Opcode::Send]
        );

        let insts = all_insts(&k);
        let (mul, mach, mov) = (&k.insts[insts[0]], &k.insts[insts[1]], &k.insts[insts[2]]);

        assert_eq!(mul.dst.base, RegBase::Acc(0));
        assert_eq!(mul.srcs[0].declare(), Some(a));
        assert_eq!(mul.srcs[1].ty(), ElemType::UW);
        assert_eq!(mach.implicit_acc_src, Some(0));
        assert_eq!(mach.srcs[1].ty(), ElemType::D);
        assert_eq!(mov.dst.declare(), Some(d));

        let acc_src = mov.srcs[0].as_reg().unwrap();

        assert_eq!(acc_src.base, mul.dst.base);
        assert_eq!(acc_src.ty, mul.dst.ty);
        assert_eq!(acc_src.byte_offset(), mul.dst.byte_offset());
    }

    #[test]
    fn packed_byte_send_is_never_split() {
        let mut k = kernel_for(Platform::Gen12Lp, no_acc());
        let payload = grf(&mut k, "P", ElemType::UD, 8);
        let resp = grf(&mut k, "R", ElemType::UB, 32);
        let mut b = Builder::new(&mut k);

        b.send(
            16,
            Some(resp),
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
        b.eot();
        k.build_flowgraph();
        conform(&mut k);

        assert_eq!(opcodes(&k), vec![Opcode::Send, Opcode::Mov, Opcode::Send]);

        let insts = all_insts(&k);
        let (send, mov) = (&k.insts[insts[0]], &k.insts[insts[1]]);

        assert_eq!(send.exec_size, 16);
        assert_ne!(send.dst.declare(), Some(resp));
        assert_eq!(mov.exec_size, 16);
        assert_eq!(mov.dst.declare(), Some(resp));
        assert_eq!(mov.srcs[0].declare(), send.dst.declare());
    }

    fn legal_kernel(options: CodegenOptions) -> Kernel {
        let mut k = kernel_for(Platform::Gen12Lp, options);
        let x = grf(&mut k, "X", ElemType::F, 16);
        let y = grf(&mut k, "Y", ElemType::F, 16);
        let z = grf(&mut k, "Z", ElemType::F, 16);
        let f = k.create_decl(DeclareData::new("F0", RegFile::Flag, ElemType::UW, 1));
        let (xs, ys) = (k.src(x, 16), k.src(y, 16));
        let mut b = Builder::new(&mut k);

        b.mov(16, x, Operand::imm_f32(1.0));
        b.binary(Opcode::Add, 16, y, xs, Operand::imm_f32(2.0));
        b.ternary(Opcode::Mad, 16, z, [xs, ys, ys]);
        b.cmp(16, CondKind::Lt, f, xs, ys);
        b.eot();
        k.build_flowgraph();
        k
    }

    #[test]
    fn legal_code_is_left_alone() {
        let mut k = legal_kernel(no_acc());
        let before = k.dump();
        let stats = conform(&mut k);

        assert_eq!(stats, ConformityStats::default());
        assert_eq!(k.dump(), before);
    }

    #[test]
    fn second_run_is_a_fixed_point() {
        for platform in [Platform::Gen9, Platform::Gen11, Platform::Gen12Lp, Platform::XeHp] {
            let mut k = kernel_for(platform, no_acc());
            let a = grf(&mut k, "A", ElemType::D, 16);
            let b = grf(&mut k, "B", ElemType::D, 16);
            let d = grf(&mut k, "D", ElemType::D, 16);
            let h = grf(&mut k, "H", ElemType::HF, 16);
            let f = grf(&mut k, "F", ElemType::F, 16);
            let bytes = grf(&mut k, "BY", ElemType::UB, 16);
            let (hs, fs) = (k.src(h, 16), k.src(f, 16));
            let (bs, ds) = (k.src(bytes, 16), k.src(d, 16));
            let mut builder = Builder::new(&mut k);

            builder.mul(16, d, a, b);
            builder.binary(Opcode::Add, 16, f, hs, fs);
            builder.binary(Opcode::Add, 16, bytes, bs, Operand::imm(1, ElemType::UW));
            builder.ternary(Opcode::Fma, 16, f, [fs, fs, Operand::imm_f32(1.0)]);
            builder.binary(Opcode::Add, 16, d, Operand::imm(3, ElemType::D), ds);
            builder.eot();
            k.build_flowgraph();

            assert!(conform(&mut k).rewritten > 0);

            let once = k.dump();
            let stats = conform(&mut k);

            assert_eq!(stats.rewritten, 0, "{platform}:\n{once}");
            assert_eq!(k.dump(), once);
        }
    }

    #[test]
    fn inserted_instructions_are_skipped() {
        let mut k = kernel_for(Platform::Gen12Lp, no_acc());
        let d = grf(&mut k, "D", ElemType::F, 8);
        let mut b = Builder::new(&mut k);

        b.binary(Opcode::Add, 8, d, Operand::imm_f32(1.0), Operand::imm_f32(2.0));
        b.eot();
        k.build_flowgraph();

        let block = k.fg.entry();
        let mut ctx = FixupCtx::new(&mut k, block, 0);

        conform_inst(&mut ctx);

        // one `mov` for the first immediate, then the add itself
        assert_eq!(ctx.next(), 2);
        assert!(ctx.changed());
    }
}
