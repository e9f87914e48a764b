//======---------------------------------------------------------------======//
//                                                                           //
// Copyright 2022-2023 Evan Cox <evanacox00@gmail.com>. All rights reserved. //
//                                                                           //
// Use of this source code is governed by a BSD-style license that can be    //
// found in the LICENSE.txt file at the root of this project, or at the      //
// following link: https://opensource.org/licenses/BSD-3-Clause              //
//                                                                           //
//======---------------------------------------------------------------======//

use crate::conformity::{copy_src_to_temp, is_alu, redirect_dst_to_temp, FixupCtx};
use crate::ir::{
    CondKind, ElemType, InstData, Kernel, Opcode, Operand, RegBase, RegOperand, Region, SubRegAlign,
};
use crate::target::Feature;

/// Whether `data` mixes half and single precision floats. Plain moves
/// convert freely and never count.
pub(crate) fn is_mixed_hf(data: &InstData) -> bool {
    if data.op == Opcode::Mov {
        return false;
    }

    let types = std::iter::once(data.dst.ty)
        .filter(|_| !data.dst.is_null())
        .chain(data.srcs.iter().map(Operand::ty));
    let (mut hf, mut f) = (false, false);

    for ty in types {
        hf |= ty == ElemType::HF;
        f |= ty == ElemType::F;
    }

    hf && f
}

// the type sources are converted to when some are floats and some are not
fn common_type(data: &InstData) -> ElemType {
    let exec = data.exec_type();

    if exec.is_float() {
        return exec;
    }

    data.srcs
        .iter()
        .map(|s| s.ty().exec_type())
        .filter(|ty| ty.is_float())
        .max_by_key(|ty| ty.size())
        .unwrap_or(exec)
}

fn is_writable(dst: &RegOperand) -> bool {
    matches!(dst.base, RegBase::Var(_) | RegBase::Indirect { .. })
}

/// Fixes source and destination types the hardware cannot mix:
///
/// - integer and float operands in one instruction (moves aside)
/// - byte-typed `src1` of a multiply on hardware that forbids it
pub(super) fn fix_operand_types(ctx: &mut FixupCtx<'_>) -> bool {
    let data = ctx.data().clone();

    if !is_alu(&data) || data.op == Opcode::Mov {
        return false;
    }

    let mut changed = false;

    if ctx.target().supports(Feature::Src1ByteForbidden)
        && matches!(data.op, Opcode::Mul | Opcode::Mach | Opcode::Mac | Opcode::Mad)
        && data.srcs[1].ty().is_byte()
    {
        // `mad` computes src0 + src1 * src2, so its product is the pair to swap
        let other = if data.op == Opcode::Mad { 2 } else { 0 };
        let swappable = matches!(data.op, Opcode::Mul | Opcode::Mad)
            && !data.srcs[other].ty().is_byte()
            && !data.srcs[other].is_imm();

        if swappable {
            ctx.data_mut().srcs.swap(1, other);
        } else {
            let ty = if data.srcs[1].ty().is_signed_int() {
                ElemType::W
            } else {
                ElemType::UW
            };

            copy_src_to_temp(ctx, 1, ty, false);
        }

        changed = true;
    }

    let data = ctx.data().clone();

    if is_mixed_hf(&data) {
        return changed;
    }

    let common = common_type(&data);

    for (i, src) in data.srcs.iter().enumerate() {
        if matches!(src, Operand::AddrOf { .. }) {
            continue;
        }

        if src.ty().is_float() != common.is_float() {
            copy_src_to_temp(ctx, i, common, false);
            changed = true;
        }
    }

    if is_writable(&data.dst) && data.dst.ty.is_float() != common.is_float() {
        redirect_dst_to_temp(ctx, common, 1, false);
        changed = true;
    }

    changed
}

fn mirrored(kind: CondKind) -> CondKind {
    match kind {
        CondKind::Gt => CondKind::Lt,
        CondKind::Lt => CondKind::Gt,
        CondKind::Ge => CondKind::Le,
        CondKind::Le => CondKind::Ge,
        other => other,
    }
}

/// Immediates may only be the last source of a two-source instruction,
/// and 64-bit immediates only appear on moves.
pub(super) fn place_immediates(ctx: &mut FixupCtx<'_>) -> bool {
    let data = ctx.data().clone();

    if !is_alu(&data) || data.op.is_ternary() || data.srcs.len() < 2 {
        return false;
    }

    let mut changed = false;

    for (i, src) in data.srcs.iter().enumerate() {
        if src.is_imm() && src.ty().size() == 8 {
            copy_src_to_temp(ctx, i, src.ty(), false);
            changed = true;
        }
    }

    let data = ctx.data().clone();

    if !data.srcs[0].is_imm() {
        return changed;
    }

    let src1_imm = data.srcs[1].is_imm();

    if data.op.is_commutative() && !src1_imm {
        ctx.data_mut().srcs.swap(0, 1);
    } else if data.op == Opcode::Cmp && !src1_imm {
        let cmp = ctx.data_mut();

        cmp.srcs.swap(0, 1);

        if let Some(cond) = &mut cmp.cond_mod {
            cond.kind = mirrored(cond.kind);
        }
    } else {
        copy_src_to_temp(ctx, 0, data.srcs[0].ty().exec_type(), false);
    }

    true
}

// align16 operands are addressed in 16-byte units
fn is_oword_aligned(kernel: &Kernel, r: &RegOperand) -> bool {
    let decl = match r.declare() {
        Some(d) => d,
        None => return false,
    };

    let (root, offset) = kernel.decls.root_offset(decl);
    let data = &kernel.decls[root];
    let base_ok = match data.location() {
        Some(loc) => loc.byte_addr() % 16 == 0,
        None => !data.is_sub_row() || data.sub_align >= SubRegAlign::HalfGrf,
    };

    base_ok && (offset + r.byte_offset()) % 16 == 0
}

/// Makes `mad` encodable. Align1 hardware only needs `src1` to be a
/// register; align16 hardware needs direct float registers that are
/// either scalars or contiguous and 16-byte aligned.
pub(super) fn legalize_ternary(ctx: &mut FixupCtx<'_>) -> bool {
    let data = ctx.data().clone();

    if data.op != Opcode::Mad {
        return false;
    }

    if ctx.target().supports(Feature::Align1Ternary) {
        if !data.srcs[1].is_imm() {
            return false;
        }

        if data.srcs[2].is_imm() {
            copy_src_to_temp(ctx, 1, data.srcs[1].ty().exec_type(), false);
        } else {
            ctx.data_mut().srcs.swap(1, 2);
        }

        return true;
    }

    assert!(
        data.dst.ty.is_float() && data.srcs.iter().all(|s| s.ty().is_float()),
        "integer mad on hardware without align1 ternary instructions"
    );

    let mut changed = false;

    for (i, src) in data.srcs.iter().enumerate() {
        let legal = match src {
            Operand::Reg(r) => {
                matches!(r.base, RegBase::Var(_))
                    && (r.region.is_scalar()
                        || (r.region.flat_stride(data.exec_size) == Some(1)
                            && is_oword_aligned(ctx.kernel(), r)))
            }
            _ => false,
        };

        if !legal {
            copy_src_to_temp(ctx, i, src.ty().exec_type(), true);
            changed = true;
        }
    }

    let dst = data.dst;

    if !matches!(dst.base, RegBase::Var(_))
        || dst.region.hstride != 1
        || !is_oword_aligned(ctx.kernel(), &dst)
    {
        redirect_dst_to_temp(ctx, dst.ty, 1, true);
        changed = true;
    }

    changed
}

/// Indirect sources are only encodable as `src0` of simple instructions.
pub(super) fn detour_indirect(ctx: &mut FixupCtx<'_>) -> bool {
    let data = ctx.data().clone();

    if data.is_send() {
        assert!(
            !data.srcs.iter().filter_map(Operand::as_reg).any(RegOperand::is_indirect),
            "send payloads cannot be indirect"
        );

        return false;
    }

    if !is_alu(&data) {
        return false;
    }

    let anywhere = data.op.is_ternary() || data.op.is_math();
    let mut changed = false;

    for (i, src) in data.srcs.iter().enumerate() {
        let indirect = src.as_reg().map_or(false, RegOperand::is_indirect);

        if indirect && (i > 0 || anywhere) {
            copy_src_to_temp(ctx, i, src.ty(), false);
            changed = true;
        }
    }

    changed
}

fn is_legal_region(region: Region, exec_size: u8) -> bool {
    if region.is_scalar() {
        return true;
    }

    region.width.is_power_of_two()
        && region.width <= u16::from(exec_size).min(16)
        && matches!(region.hstride, 0 | 1 | 2 | 4)
        && (region.vstride == 0 || (region.vstride.is_power_of_two() && region.vstride <= 32))
        && !(region.width == 1 && region.hstride != 0)
}

// the encodable region that reads the same elements
fn canonical_region(region: Region, exec_size: u8) -> Region {
    match region.flat_stride(exec_size) {
        Some(stride) if matches!(stride, 0 | 1 | 2 | 4) => Region::strided(stride, exec_size),
        Some(stride) if stride.is_power_of_two() && stride <= 32 => Region::new(stride, 1, 0),
        _ => panic!("source region {region} has no encoding for {exec_size} channels"),
    }
}

/// Rewrites source regions into an encodable form.
pub(super) fn legalize_src_regions(ctx: &mut FixupCtx<'_>) -> bool {
    let data = ctx.data();

    if !is_alu(data) {
        return false;
    }

    let exec_size = data.exec_size;
    let illegal: Vec<usize> = data
        .srcs
        .iter()
        .enumerate()
        .filter(|(_, src)| src.as_reg().map_or(false, |r| !is_legal_region(r.region, exec_size)))
        .map(|(i, _)| i)
        .collect();

    for &i in &illegal {
        if let Some(r) = ctx.data_mut().srcs[i].as_reg_mut() {
            r.region = canonical_region(r.region, exec_size);
        }
    }

    !illegal.is_empty()
}

/// Destination strides must be encodable, and a destination narrower
/// than the execution type has to be spaced out to its width.
pub(super) fn fix_dst_region(ctx: &mut FixupCtx<'_>) -> bool {
    let data = ctx.data().clone();

    if !is_alu(&data) || !is_writable(&data.dst) {
        return false;
    }

    let mut changed = false;
    let mut hstride = data.dst.region.hstride;

    if hstride == 0 {
        assert_eq!(
            data.exec_size, 1,
            "destination stride 0 with {} channels",
            data.exec_size
        );

        ctx.data_mut().dst.region = Region::dst(1);
        hstride = 1;
        changed = true;
    }

    assert!(
        matches!(hstride, 1 | 2 | 4),
        "destination stride {hstride} cannot be encoded"
    );

    // bytes are handled by `fix_packed_byte_dst`, mixed floats by
    // `fix_mixed_precision`
    if data.op == Opcode::Mov
        || data.dst.ty.is_byte()
        || data.exec_size == 1
        || is_mixed_hf(&data)
    {
        return changed;
    }

    let exec = data.exec_type().size();
    let size = data.dst.ty.size();

    if exec > size && u32::from(hstride) * size < exec {
        redirect_dst_to_temp(ctx, data.dst.ty, (exec / size) as u16, false);
        changed = true;
    }

    changed
}

/// Packed byte destinations are only written by byte moves. Everything
/// else writes a strided temporary that a move then packs, and sends
/// receive into a whole-row temporary.
pub(super) fn fix_packed_byte_dst(ctx: &mut FixupCtx<'_>) -> bool {
    let data = ctx.data().clone();
    let dst = data.dst;

    if !dst.ty.is_byte() || data.exec_size == 1 || !matches!(dst.base, RegBase::Var(_)) {
        return false;
    }

    if let Some(send) = data.send {
        if dst.region.hstride != 1 {
            return false;
        }

        let rows = u32::from(send.resp_len).max(1);
        let temp = ctx.row_temp(ElemType::UD, rows * crate::target::GRF_BYTES / 4);
        let mut mov = InstData::new(Opcode::Mov, data.exec_size)
            .with_dst(dst)
            .with_src(RegOperand::src(temp, dst.ty, Region::contiguous(data.exec_size)));

        mov.pred = data.pred;
        mov.no_mask = data.no_mask;
        mov.mask_offset = data.mask_offset;

        ctx.data_mut().dst = RegOperand::dst(temp, ElemType::UD);
        ctx.insert_after(mov);

        return true;
    }

    let byte_copy =
        matches!(data.op, Opcode::Mov | Opcode::Sel) && data.srcs.iter().all(|s| s.ty().is_byte());

    if byte_copy {
        return false;
    }

    let needed = data.exec_type().size().clamp(2, 4) as u16;

    if dst.region.hstride >= needed {
        return false;
    }

    redirect_dst_to_temp(ctx, dst.ty, needed, false);

    true
}

/// Accumulators can only be read as `src0` of instructions that do not
/// use the accumulator themselves, and math cannot touch them at all.
pub(super) fn fix_acc_operands(ctx: &mut FixupCtx<'_>) -> bool {
    let data = ctx.data().clone();

    if !is_alu(&data) {
        return false;
    }

    let ternary_ok = ctx.target().supports(Feature::Align1Ternary);
    let mut changed = false;

    for (i, src) in data.srcs.iter().enumerate() {
        if let Some(r) = src.as_reg().filter(|r| r.is_acc()) {
            if i != 0
                || data.op.is_math()
                || (data.op.is_ternary() && !ternary_ok)
                || data.op.reads_acc_implicitly()
            {
                copy_src_to_temp(ctx, i, r.ty, false);
                changed = true;
            }
        }
    }

    if data.dst.is_acc() {
        assert!(
            !data.dst.ty.is_byte(),
            "bytes cannot be written to an accumulator"
        );

        if data.op.is_math() {
            redirect_dst_to_temp(ctx, data.dst.ty, 1, false);
            changed = true;
        }
    }

    changed
}

/// Mixed `hf`/`f` arithmetic. Hardware without it computes in `f`;
/// hardware with it may still need half-float results spaced out.
pub(super) fn fix_mixed_precision(ctx: &mut FixupCtx<'_>) -> bool {
    let data = ctx.data().clone();

    if !is_alu(&data) || !is_mixed_hf(&data) {
        return false;
    }

    if !ctx.target().supports(Feature::MixedModeHf) {
        for (i, src) in data.srcs.iter().enumerate() {
            if src.ty() == ElemType::HF {
                copy_src_to_temp(ctx, i, ElemType::F, false);
            }
        }

        if data.dst.ty == ElemType::HF && is_writable(&data.dst) {
            redirect_dst_to_temp(ctx, ElemType::F, 1, false);
        }

        return true;
    }

    let packed_hf = data.dst.ty == ElemType::HF
        && data.dst.region.hstride == 1
        && data.exec_size > 1
        && is_writable(&data.dst);

    if packed_hf && !ctx.target().supports(Feature::MixedModePackedHfDst) {
        redirect_dst_to_temp(ctx, ElemType::HF, 2, false);

        return true;
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::ArenaKey;
    use crate::conformity::HwConformity;
    use crate::ir::*;
    use crate::options::CodegenOptions;
    use crate::target::Platform;
    use crate::testing::*;

    // builds with `build`, appends an EOT and legalizes
    fn conformed(platform: Platform, build: impl FnOnce(&mut Kernel)) -> Kernel {
        let mut k = kernel_for(platform, CodegenOptions::default().with_acc_substitution(false));

        build(&mut k);
        Builder::new(&mut k).eot();
        k.build_flowgraph();
        HwConformity::new(&mut k).run();
        k
    }

    fn grf(k: &mut Kernel, name: &str, ty: ElemType, elems: u32) -> Declare {
        k.create_decl(DeclareData::grf(name, ty, elems))
    }

    fn nth(k: &Kernel, n: usize) -> &InstData {
        &k.insts[all_insts(k)[n]]
    }

    fn reg(k: &Kernel, n: usize, src: usize) -> RegOperand {
        *nth(k, n).srcs[src].as_reg().unwrap()
    }

    #[test]
    fn mixed_hf_needs_both_precisions() {
        let h = Declare::new(0);
        let f = Declare::new(1);
        let mov = InstData::new(Opcode::Mov, 8)
            .with_dst(RegOperand::dst(h, ElemType::HF))
            .with_src(RegOperand::src(f, ElemType::F, Region::contiguous(8)));
        let mut add = mov.clone();

        add.op = Opcode::Add;
        add.srcs.push(Operand::imm_f32(1.0));

        assert!(!is_mixed_hf(&mov));
        assert!(is_mixed_hf(&add));
    }

    fn byte_multiply(platform: Platform, both_bytes: bool) -> Kernel {
        conformed(platform, |k| {
            let w = grf(k, "W", ElemType::W, 8);
            let by = grf(k, "BY", ElemType::UB, 8);
            let other = if both_bytes { k.src(by, 8) } else { k.src(w, 8) };
            let bys = k.src(by, 8);

            Builder::new(k).binary(Opcode::Mul, 8, w, other, bys);
        })
    }

    #[test]
    fn byte_src1_is_moved_out_of_the_way() {
        let k = byte_multiply(Platform::Gen12Lp, false);

        assert_eq!(opcodes(&k), vec![Opcode::Mul, Opcode::Send]);
        assert_eq!(nth(&k, 0).srcs[0].ty(), ElemType::UB);
        assert_eq!(nth(&k, 0).srcs[1].ty(), ElemType::W);

        let k = byte_multiply(Platform::Gen12Lp, true);

        assert_eq!(opcodes(&k), vec![Opcode::Mov, Opcode::Mul, Opcode::Send]);
        assert_eq!(nth(&k, 1).srcs[1].ty(), ElemType::UW);

        let k = byte_multiply(Platform::Gen9, true);

        assert_eq!(opcodes(&k), vec![Opcode::Mul, Opcode::Send]);
    }

    #[test]
    fn integer_and_float_operands_agree() {
        let k = conformed(Platform::Gen12Lp, |k| {
            let f = grf(k, "F", ElemType::F, 8);
            let d = grf(k, "D", ElemType::D, 8);
            let (fs, ds) = (k.src(f, 8), k.src(d, 8));

            Builder::new(k).binary(Opcode::Add, 8, f, ds, fs);
        });

        assert_eq!(opcodes(&k), vec![Opcode::Mov, Opcode::Add, Opcode::Send]);
        assert_eq!(nth(&k, 0).dst.ty, ElemType::F);
        assert_eq!(nth(&k, 1).srcs[0].declare(), nth(&k, 0).dst.declare());

        let k = conformed(Platform::Gen12Lp, |k| {
            let f = grf(k, "F", ElemType::F, 8);
            let d = grf(k, "D", ElemType::D, 8);
            let fs = k.src(f, 8);

            Builder::new(k).binary(Opcode::Add, 8, d, fs, fs);
        });

        assert_eq!(opcodes(&k), vec![Opcode::Add, Opcode::Mov, Opcode::Send]);
        assert_eq!(nth(&k, 0).dst.ty, ElemType::F);
        assert_eq!(nth(&k, 1).dst.ty, ElemType::D);
    }

    #[test]
    fn immediates_end_up_last() {
        let k = conformed(Platform::Gen12Lp, |k| {
            let d = grf(k, "D", ElemType::D, 8);
            let ds = k.src(d, 8);

            Builder::new(k).binary(Opcode::Add, 8, d, Operand::imm(1, ElemType::D), ds);
        });

        assert_eq!(opcodes(&k), vec![Opcode::Add, Opcode::Send]);
        assert!(nth(&k, 0).srcs[1].is_imm());

        let k = conformed(Platform::Gen12Lp, |k| {
            let f = grf(k, "F", ElemType::F, 8);
            let fs = k.src(f, 8);
            let pred = flag_pred(k);

            Builder::new(k).cmp(8, CondKind::Lt, pred.flag, Operand::imm_f32(1.0), fs);
        });

        assert_eq!(opcodes(&k), vec![Opcode::Cmp, Opcode::Send]);
        assert!(nth(&k, 0).srcs[1].is_imm());
        assert_eq!(nth(&k, 0).cond_mod.unwrap().kind, CondKind::Gt);

        let k = conformed(Platform::Gen12Lp, |k| {
            let d = grf(k, "D", ElemType::D, 8);
            let ds = k.src(d, 8);

            Builder::new(k).binary(Opcode::Shl, 8, d, Operand::imm(1, ElemType::D), ds);
        });

        assert_eq!(opcodes(&k), vec![Opcode::Mov, Opcode::Shl, Opcode::Send]);
        assert_eq!(nth(&k, 0).exec_size, 1);
        assert!(nth(&k, 0).no_mask);
        assert!(reg(&k, 1, 0).region.is_scalar());
    }

    #[test]
    fn wide_immediates_are_moved() {
        let k = conformed(Platform::Gen12Lp, |k| {
            let q = grf(k, "Q", ElemType::Q, 8);
            let qs = k.src(q, 8);

            Builder::new(k).binary(Opcode::Add, 8, q, qs, Operand::imm(5, ElemType::Q));
        });

        assert_eq!(opcodes(&k), vec![Opcode::Mov, Opcode::Add, Opcode::Send]);
        assert!(nth(&k, 0).srcs[0].is_imm());
        assert!(!nth(&k, 1).srcs[1].is_imm());
    }

    #[test]
    fn align16_mad_operands() {
        let k = conformed(Platform::Gen9, |k| {
            let x = grf(k, "X", ElemType::F, 16);
            let d = grf(k, "D", ElemType::F, 8);
            let xs = k.src(x, 8);
            let unaligned = RegOperand::src(x, ElemType::F, Region::contiguous(8)).at(0, 2);

            Builder::new(k).ternary(
                Opcode::Mad,
                8,
                d,
                [Operand::imm_f32(1.0), unaligned.into(), xs],
            );
        });

        assert_eq!(opcodes(&k), vec![Opcode::Mov, Opcode::Mov, Opcode::Mad, Opcode::Send]);
        assert!(reg(&k, 2, 0).region.is_scalar());

        let moved = reg(&k, 2, 1);

        assert_eq!(moved.byte_offset(), 0);
        assert_eq!(k.decls[moved.declare().unwrap()].sub_align, SubRegAlign::Grf);
    }

    #[test]
    fn align1_mad_keeps_src1_a_register() {
        let k = conformed(Platform::Gen12Lp, |k| {
            let x = grf(k, "X", ElemType::F, 8);
            let xs = k.src(x, 8);

            Builder::new(k).ternary(Opcode::Mad, 8, x, [xs, Operand::imm_f32(2.0), xs]);
        });

        assert_eq!(opcodes(&k), vec![Opcode::Mad, Opcode::Send]);
        assert!(!nth(&k, 0).srcs[1].is_imm());
        assert!(nth(&k, 0).srcs[2].is_imm());
    }

    #[test]
    fn indirect_sources_take_a_detour() {
        let k = conformed(Platform::Gen12Lp, |k| {
            let f = grf(k, "F", ElemType::F, 8);
            let addr = k.create_decl(DeclareData::new("A0", RegFile::Address, ElemType::UW, 1));
            let fs = k.src(f, 8);
            let indirect = RegOperand {
                base: RegBase::Indirect { addr, imm: 0 },
                row: 0,
                sub_reg: 0,
                region: Region::contiguous(8),
                ty: ElemType::F,
                modifier: SrcModifier::None,
            };

            Builder::new(k).binary(Opcode::Add, 8, f, fs, indirect.into());
        });

        assert_eq!(opcodes(&k), vec![Opcode::Mov, Opcode::Add, Opcode::Send]);
        assert!(reg(&k, 0, 0).is_indirect());
        assert!(!reg(&k, 1, 1).is_indirect());
    }

    #[test]
    fn regions_are_made_encodable() {
        let k = conformed(Platform::Gen12Lp, |k| {
            let x = grf(k, "X", ElemType::F, 16);
            let f = grf(k, "F", ElemType::F, 8);
            let odd = RegOperand::src(x, ElemType::F, Region::new(2, 1, 1));
            let wide = RegOperand::src(x, ElemType::F, Region::contiguous(16));

            Builder::new(k).binary(Opcode::Add, 8, f, odd.into(), wide.into());
        });

        assert_eq!(reg(&k, 0, 0).region, Region::new(16, 8, 2));
        assert_eq!(reg(&k, 0, 1).region, Region::new(8, 8, 1));

        let k = conformed(Platform::Gen12Lp, |k| {
            let x = grf(k, "X", ElemType::F, 8);
            let f = grf(k, "F", ElemType::F, 4);
            let wide = RegOperand::src(x, ElemType::F, Region::contiguous(8));

            Builder::new(k).binary(Opcode::Add, 4, f, wide.into(), wide.into());
        });

        assert_eq!(reg(&k, 0, 0).region, Region::new(4, 4, 1));
    }

    #[test]
    #[should_panic]
    fn unencodable_region_is_fatal() {
        conformed(Platform::Gen12Lp, |k| {
            let x = grf(k, "X", ElemType::F, 32);
            let f = grf(k, "F", ElemType::F, 8);
            let thirds = RegOperand::src(x, ElemType::F, Region::new(3, 1, 0));

            Builder::new(k).binary(Opcode::Add, 8, f, thirds.into(), thirds.into());
        });
    }

    #[test]
    fn narrow_destinations_are_spaced_out() {
        let k = conformed(Platform::Gen12Lp, |k| {
            let w = grf(k, "W", ElemType::W, 8);
            let d = grf(k, "D", ElemType::D, 8);
            let ds = k.src(d, 8);

            Builder::new(k).binary(Opcode::Add, 8, w, ds, ds);
        });

        assert_eq!(opcodes(&k), vec![Opcode::Add, Opcode::Mov, Opcode::Send]);
        assert_eq!(nth(&k, 0).dst.region.hstride, 2);
        assert_eq!(reg(&k, 1, 0).region, Region::new(16, 8, 2));
    }

    #[test]
    fn scalar_destination_stride() {
        let k = conformed(Platform::Gen12Lp, |k| {
            let d = grf(k, "D", ElemType::D, 1);
            let ds = k.scalar(d);
            let dst = RegOperand::dst(d, ElemType::D).with_region(Region::dst(0));

            Builder::new(k).push(
                InstData::new(Opcode::Add, 1)
                    .with_dst(dst)
                    .with_src(ds)
                    .with_src(ds),
            );
        });

        assert_eq!(nth(&k, 0).dst.region.hstride, 1);
    }

    #[test]
    fn packed_bytes_come_from_byte_moves() {
        let k = conformed(Platform::Gen12Lp, |k| {
            let by = grf(k, "BY", ElemType::UB, 16);
            let bys = k.src(by, 16);

            let mut b = Builder::new(k);

            b.binary(Opcode::Add, 16, by, bys, Operand::imm(1, ElemType::UW));
            b.mov(16, by, bys);
        });

        assert_eq!(opcodes(&k), vec![Opcode::Add, Opcode::Mov, Opcode::Mov, Opcode::Send]);
        assert_eq!(nth(&k, 0).dst.region.hstride, 2);
        assert_eq!(nth(&k, 1).dst.region.hstride, 1);
        assert_eq!(nth(&k, 2).dst.region.hstride, 1);
        assert_eq!(reg(&k, 2, 0).region, Region::contiguous(16));
    }

    #[test]
    fn accumulator_operand_restrictions() {
        let acc = RegOperand::acc(0, ElemType::F, Region::contiguous(8));

        let k = conformed(Platform::Gen9, |k| {
            let f = grf(k, "F", ElemType::F, 8);
            let fs = k.src(f, 8);

            let mut b = Builder::new(k);

            b.push(
                InstData::new(Opcode::Math(MathFn::Inv), 8)
                    .with_dst(RegOperand::dst(f, ElemType::F))
                    .with_src(acc),
            );
            b.binary(Opcode::Add, 8, f, fs, acc.into());
            b.push(
                InstData::new(Opcode::Math(MathFn::Inv), 8)
                    .with_dst(RegOperand::acc(0, ElemType::F, Region::dst(1)))
                    .with_src(fs),
            );
        });

        assert_eq!(
            opcodes(&k),
            vec![
                Opcode::Mov,
                Opcode::Math(MathFn::Inv),
                Opcode::Mov,
                Opcode::Add,
                Opcode::Math(MathFn::Inv),
                Opcode::Mov,
                Opcode::Send
            ]
        );
        assert!(reg(&k, 0, 0).is_acc());
        assert!(!reg(&k, 1, 0).is_acc());
        assert!(!reg(&k, 3, 1).is_acc());
        assert!(!nth(&k, 4).dst.is_acc());
        assert!(nth(&k, 5).dst.is_acc());
    }

    fn mixed_add(platform: Platform) -> Kernel {
        conformed(platform, |k| {
            let h = grf(k, "H", ElemType::HF, 8);
            let f = grf(k, "F", ElemType::F, 8);
            let (hs, fs) = (k.src(h, 8), k.src(f, 8));

            Builder::new(k).binary(Opcode::Add, 8, h, hs, fs);
        })
    }

    #[test]
    fn mixed_precision_by_platform() {
        let k = mixed_add(Platform::Gen9);

        assert_eq!(opcodes(&k), vec![Opcode::Add, Opcode::Mov, Opcode::Send]);
        assert_eq!(nth(&k, 0).dst.region.hstride, 2);

        let k = mixed_add(Platform::Gen12Lp);

        assert_eq!(opcodes(&k), vec![Opcode::Add, Opcode::Send]);

        let k = mixed_add(Platform::XeHp);

        assert_eq!(opcodes(&k), vec![Opcode::Mov, Opcode::Add, Opcode::Mov, Opcode::Send]);
        assert!(!is_mixed_hf(nth(&k, 1)));
        assert_eq!(nth(&k, 1).dst.ty, ElemType::F);
        assert_eq!(nth(&k, 2).dst.ty, ElemType::HF);
    }
}
