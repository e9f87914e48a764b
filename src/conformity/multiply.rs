//======---------------------------------------------------------------======//
//                                                                           //
// Copyright 2022-2023 Evan Cox <evanacox00@gmail.com>. All rights reserved. //
//                                                                           //
// Use of this source code is governed by a BSD-style license that can be    //
// found in the LICENSE.txt file at the root of this project, or at the      //
// following link: https://opensource.org/licenses/BSD-3-Clause              //
//                                                                           //
//======---------------------------------------------------------------======//

use crate::conformity::split::chunk;
use crate::conformity::FixupCtx;
use crate::ir::{DeclareTable, ElemType, InstData, Opcode, Operand, RegBase, RegOperand, Region};
use crate::target::Feature;
use smallvec::smallvec;

/// `fma d, a, b, c` (`d = a * b + c`) becomes a hardware `mad` when the
/// hardware can do it in one instruction, `mov acc, c` + `mac` when the
/// product fits into the accumulator, and `mul` + `add` otherwise. An
/// integer `mad` on hardware that only has the float form is lowered the
/// same way.
pub(super) fn lower_pseudo_fma(ctx: &mut FixupCtx<'_>) -> bool {
    let data = ctx.data().clone();
    let (a, b, c) = match data.op {
        Opcode::Fma => (data.srcs[0], data.srcs[1], data.srcs[2]),
        Opcode::Mad => (data.srcs[1], data.srcs[2], data.srcs[0]),
        _ => return false,
    };

    let float = data.dst.ty.is_float() && data.srcs.iter().all(|s| s.ty().is_float());
    let has_mad = float || ctx.target().supports(Feature::Align1Ternary);

    if data.op == Opcode::Mad && has_mad {
        return false;
    }

    if has_mad {
        let mut mad = data;

        mad.op = Opcode::Mad;
        mad.srcs = smallvec![c, a, b];
        ctx.replace(mad);

        return true;
    }

    let ty = data.dst.ty;
    let acc_fits = u32::from(data.exec_size) * 4 <= ctx.target().acc_bytes();

    if acc_fits && !ty.is_byte() && !c.as_reg().map_or(false, RegOperand::is_acc) {
        let mut mov = InstData::new(Opcode::Mov, data.exec_size)
            .with_dst(RegOperand::acc(0, ty, Region::dst(1)))
            .with_src(c);

        mov.no_mask = data.no_mask;
        mov.mask_offset = data.mask_offset;
        ctx.insert_before(mov);

        let mut mac = data;

        mac.op = Opcode::Mac;
        mac.srcs = smallvec![a, b];
        mac.implicit_acc_src = Some(0);
        ctx.replace(mac);
    } else {
        // the product stays the current instruction so the multiply rules
        // still see it
        let temp = ctx.temp(ty, u32::from(data.exec_size));
        let mut mul = InstData::new(Opcode::Mul, data.exec_size)
            .with_dst(RegOperand::dst(temp, ty))
            .with_src(a)
            .with_src(b);

        mul.no_mask = data.no_mask;
        mul.mask_offset = data.mask_offset;

        let mut add = data;

        add.op = Opcode::Add;
        add.srcs = smallvec![RegOperand::src(temp, ty, Region::contiguous(add.exec_size)).into(), c];
        ctx.replace(mul);
        ctx.insert_after(add);
    }

    true
}

fn is_dword(op: &Operand) -> bool {
    op.ty().is_dword_int()
}

// whether writing `dst` can change what `src` reads
fn clobbers(decls: &DeclareTable, dst: &RegOperand, exec_size: u8, src: &Operand) -> bool {
    let Operand::Reg(src) = src else {
        return false;
    };

    match (dst.base, src.base) {
        (RegBase::Var(d), RegBase::Var(s)) => {
            let (d_root, d_off) = decls.root_offset(d);
            let (s_root, s_off) = decls.root_offset(s);

            if d_root != s_root {
                return false;
            }

            let (dst_lo, dst_hi) = dst.footprint(exec_size, true);
            let (src_lo, src_hi) = src.footprint(exec_size, false);

            d_off + dst_lo < s_off + src_hi && s_off + src_lo < d_off + dst_hi
        }
        (RegBase::Acc(a), RegBase::Acc(b)) => a == b,
        (RegBase::Indirect { .. }, RegBase::Var(_) | RegBase::Indirect { .. })
        | (RegBase::Var(_), RegBase::Indirect { .. }) => true,
        _ => false,
    }
}

// whether `a` and `b` compute the same product on the same channels, with
// `b` still seeing the sources `a` read
fn same_product(decls: &DeclareTable, a: &InstData, b: &InstData) -> bool {
    a.exec_size == b.exec_size
        && a.mask_offset == b.mask_offset
        && a.no_mask == b.no_mask
        && a.pred == b.pred
        && a.srcs == b.srcs
        && !a.sat
        && !b.sat
        && a.cond_mod.is_none()
        && b.cond_mod.is_none()
        && !b.srcs.iter().any(|src| clobbers(decls, &a.dst, a.exec_size, src))
}

/// `mulh` has no hardware encoding, it becomes `mul acc` + `mach`. A
/// `mul` right next to a `mulh` of the same sources shares the sequence:
/// the low half is left in the accumulator by the `mach`.
pub(super) fn expand_mulh(ctx: &mut FixupCtx<'_>) -> bool {
    let data = ctx.data().clone();
    let pair = |op: Opcode| matches!(op, Opcode::Mul | Opcode::Mulh) && op != data.op;

    if !matches!(data.op, Opcode::Mul | Opcode::Mulh) {
        return false;
    }

    if !data.srcs.iter().all(is_dword) {
        assert_ne!(data.op, Opcode::Mulh, "mulh needs 32-bit integer sources");

        return false;
    }

    let decls = &ctx.kernel().decls;
    let partner = ctx
        .following()
        .filter(|next| pair(next.op) && same_product(decls, &data, next))
        .map(|next| next.dst);

    let (hi, lo) = match (data.op, partner) {
        (Opcode::Mulh, partner) => (Some(data.dst), partner),
        (Opcode::Mul, Some(hi)) => (Some(hi), Some(data.dst)),
        _ => return false,
    };

    if partner.is_some() {
        ctx.remove_following();
    }

    emit_mul_macro(ctx, &data, hi, lo);

    true
}

/// A 32x32 multiply without native support becomes
/// `mul acc, a, b:uw` + `mach _, a, b` + `mov d, acc`, once per
/// accumulator-sized chunk of channels.
pub(super) fn expand_mul_macro(ctx: &mut FixupCtx<'_>) -> bool {
    let data = ctx.data();

    if data.op != Opcode::Mul
        || ctx.target().supports(Feature::NativeMulDword)
        || !data.dst.ty.is_dword_int()
        || !data.srcs.iter().all(is_dword)
        || data.dst.is_acc()
    {
        return false;
    }

    let data = data.clone();

    // the high half goes to the real destination, the `mov` overwrites it
    let scratch = if !data.sat && matches!(data.dst.base, RegBase::Var(_)) {
        data.dst
    } else {
        let temp = ctx.temp(data.dst.ty, u32::from(data.exec_size));

        RegOperand::dst(temp, data.dst.ty)
    };

    emit_mul_macro(ctx, &data, Some(scratch), Some(data.dst));

    true
}

// `b` reinterpreted as its low 16 bits
fn low_words(op: Operand) -> Operand {
    match op {
        Operand::Reg(r) => {
            let mut low = r.retyped(ElemType::UW);

            low.region = Region::new(r.region.vstride * 2, r.region.width, r.region.hstride * 2);

            Operand::Reg(low)
        }
        Operand::Imm { bits, .. } => Operand::Imm {
            bits: bits & 0xffff,
            ty: ElemType::UW,
        },
        other => other,
    }
}

fn emit_mul_macro(
    ctx: &mut FixupCtx<'_>,
    data: &InstData,
    hi: Option<RegOperand>,
    lo: Option<RegOperand>,
) {
    let acc_channels = (ctx.target().acc_bytes() / 4) as u8;
    let width = data.exec_size.min(acc_channels);
    let ty = data.dst.ty;
    let mut seq = Vec::new();

    for first in (0..data.exec_size).step_by(usize::from(width)) {
        let part = chunk(data, first, width);
        let (a, b) = (part.srcs[0], part.srcs[1]);
        let acc = RegOperand::acc(0, ty, Region::dst(1));

        let mut mul = part.clone().with_dst(acc);

        mul.op = Opcode::Mul;
        mul.srcs = smallvec![a, low_words(b)];
        mul.cond_mod = None;
        mul.sat = false;
        seq.push(mul);

        let mut mach = part.clone();

        mach.op = Opcode::Mach;
        mach.dst = match hi {
            Some(hi) => chunk_dst(data, hi, first, width),
            None => RegOperand::null(ty),
        };
        mach.implicit_acc_src = Some(0);
        mach.implicit_acc_dst = Some(0);
        mach.cond_mod = if lo.is_none() { data.cond_mod } else { None };
        mach.sat = lo.is_none() && data.sat;
        seq.push(mach);

        if let Some(lo) = lo {
            let mut mov = part.clone();

            mov.op = Opcode::Mov;
            mov.dst = chunk_dst(data, lo, first, width);
            mov.srcs = smallvec![RegOperand::acc(0, ty, Region::contiguous(width)).into()];
            seq.push(mov);
        }
    }

    let mut seq = seq.into_iter();

    if let Some(head) = seq.next() {
        ctx.replace(head);
    }

    ctx.insert_right_after(seq);
}

fn chunk_dst(data: &InstData, dst: RegOperand, first: u8, width: u8) -> RegOperand {
    let probe = data.clone().with_dst(dst);

    chunk(&probe, first, width).dst
}
