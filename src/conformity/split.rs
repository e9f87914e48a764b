//======---------------------------------------------------------------======//
//                                                                           //
// Copyright 2022-2023 Evan Cox <evanacox00@gmail.com>. All rights reserved. //
//                                                                           //
// Use of this source code is governed by a BSD-style license that can be    //
// found in the LICENSE.txt file at the root of this project, or at the      //
// following link: https://opensource.org/licenses/BSD-3-Clause              //
//                                                                           //
//======---------------------------------------------------------------======//

use crate::conformity::operands::is_mixed_hf;
use crate::conformity::{is_alu, FixupCtx};
use crate::ir::{ElemType, InstData, Opcode, Operand, RegBase, RegOperand, Region};
use crate::target::{Feature, Target, GRF_BYTES};

fn chunk_reg(r: RegOperand, first: u8, width: u8, is_dst: bool) -> RegOperand {
    // every piece of a split sequence reads the accumulator from its start
    if r.is_acc() || r.is_null() {
        return r;
    }

    let mut out = r;
    let byte = r.channel_byte(u32::from(first), is_dst);

    match &mut out.base {
        RegBase::Indirect { imm, .. } => {
            *imm += (byte - r.byte_offset()) as i16;
        }
        _ => {
            out.row = (byte / GRF_BYTES) as u16;
            out.sub_reg = ((byte % GRF_BYTES) / r.ty.size()) as u16;
        }
    }

    // a narrower piece stays inside one row of the region
    if !is_dst && u16::from(width) < r.region.width && !r.region.is_scalar() {
        assert_eq!(
            r.region.width % u16::from(width),
            0,
            "region {} does not split into {width} channels",
            r.region
        );

        out.region = Region::strided(r.region.hstride, width);
    }

    out
}

/// Channels `[first, first + width)` of `data`, as an instruction of their
/// own.
pub(super) fn chunk(data: &InstData, first: u8, width: u8) -> InstData {
    let mut part = data.clone();

    part.exec_size = width;
    part.mask_offset = data.mask_offset + first;
    part.dst = chunk_reg(data.dst, first, width, true);

    for src in part.srcs.iter_mut() {
        if let Operand::Reg(r) = src {
            *r = chunk_reg(*r, first, width, false);
        }
    }

    part
}

fn split_into(data: &InstData, width: u8) -> Vec<InstData> {
    (0..data.exec_size)
        .step_by(usize::from(width))
        .map(|first| chunk(data, first, width))
        .collect()
}

fn reads_acc(data: &InstData, index: u8) -> bool {
    data.implicit_acc_src == Some(index)
        || data
            .srcs
            .iter()
            .filter_map(Operand::as_reg)
            .any(|r| r.base == RegBase::Acc(index))
}

/// Whether `data` reads or writes any accumulator, explicitly or not.
pub(super) fn touches_acc(data: &InstData) -> bool {
    data.op.writes_acc_implicitly()
        || data.implicit_acc_src.is_some()
        || data.implicit_acc_dst.is_some()
        || data.dst.is_acc()
        || data.srcs.iter().filter_map(Operand::as_reg).any(RegOperand::is_acc)
}

/// `addc`/`subb` write their carry into the accumulator, which limits how
/// many channels they can run. When they have to be split, the
/// instruction reading the carry right after them is split with them so
/// every piece reads the carry of its own channels.
pub(super) fn pair_carry(ctx: &mut FixupCtx<'_>) -> bool {
    if !matches!(ctx.data().op, Opcode::Addc | Opcode::Subb) {
        return false;
    }

    let mut changed = false;

    if ctx.data().implicit_acc_dst.is_none() {
        ctx.data_mut().implicit_acc_dst = Some(0);
        changed = true;
    }

    let data = ctx.data().clone();
    let width = (ctx.target().acc_bytes() / data.dst.ty.size()).min(u32::from(data.exec_size)) as u8;

    if width >= data.exec_size {
        return changed;
    }

    let reader = ctx.following().filter(|next| reads_acc(next, 0)).cloned();

    if let Some(reader) = &reader {
        assert_eq!(
            reader.exec_size, data.exec_size,
            "carry is read with a different execution size"
        );

        ctx.remove_following();
    }

    let mut seq = Vec::new();

    for first in (0..data.exec_size).step_by(usize::from(width)) {
        seq.push(chunk(&data, first, width));
        seq.extend(reader.as_ref().map(|r| chunk(r, first, width)));
    }

    let mut seq = seq.into_iter();

    if let Some(head) = seq.next() {
        ctx.replace(head);
    }

    ctx.insert_right_after(seq);

    true
}

// every operand of every piece fits into two rows, and a destination that
// crosses a row starts at one
fn fits(data: &InstData, width: u8) -> bool {
    split_into(data, width).iter().all(|part| {
        let dst_ok = part.dst.is_null() || part.dst.is_indirect() || {
            let rows = part.dst.rows_spanned(width, true);

            rows == 1 || (rows == 2 && part.dst.byte_offset() % GRF_BYTES == 0)
        };

        dst_ok
            && part
                .srcs
                .iter()
                .filter_map(Operand::as_reg)
                .filter(|r| !r.is_indirect())
                .all(|r| r.rows_spanned(width, false) <= 2)
    })
}

/// The widest execution size `data` can be encoded with.
pub(crate) fn max_width(target: &Target, data: &InstData) -> u8 {
    let types: Vec<ElemType> = std::iter::once(data.dst.ty)
        .filter(|_| !data.dst.is_null())
        .chain(data.srcs.iter().map(Operand::ty))
        .collect();
    let mut width = data.exec_size.min(16);

    if data.op.is_math() && types.contains(&ElemType::HF) && !target.supports(Feature::MathHfSimd16) {
        width = width.min(8);
    }

    if types.contains(&ElemType::DF) && target.supports(Feature::DfSimd4) {
        width = width.min(4);
    }

    if is_mixed_hf(data) && target.supports(Feature::MixedModeHf) {
        width = width.min(8);
    }

    while width > 1 && !fits(data, width) {
        width /= 2;
    }

    width
}

/// Splits instructions wider than the hardware allows into pieces of the
/// widest legal size. Instructions involving the accumulator are sized by
/// the rules that created them and are never split here.
pub(super) fn split_simd(ctx: &mut FixupCtx<'_>) -> bool {
    let data = ctx.data();

    if !is_alu(data) || touches_acc(data) {
        return false;
    }

    let width = max_width(ctx.target(), data);

    if width >= data.exec_size {
        return false;
    }

    let mut seq = split_into(&data.clone(), width).into_iter();

    if let Some(head) = seq.next() {
        ctx.replace(head);
    }

    ctx.insert_right_after(seq);

    true
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

    fn options() -> CodegenOptions {
        CodegenOptions::default().with_acc_substitution(false)
    }

    #[test]
    fn chunks_advance_every_operand() {
        let d = Declare::new(0);
        let s = Declare::new(1);
        let data = InstData::new(Opcode::Add, 16)
            .with_dst(RegOperand::dst(d, ElemType::F))
            .with_src(RegOperand::src(s, ElemType::F, Region::contiguous(16)))
            .with_src(RegOperand::src(s, ElemType::F, Region::scalar()));
        let part = chunk(&data, 8, 8);

        assert_eq!(part.exec_size, 8);
        assert_eq!(part.mask_offset, 8);
        assert_eq!((part.dst.row, part.dst.sub_reg), (1, 0));
        assert_eq!(part.srcs[0].as_reg().unwrap().row, 1);
        assert_eq!(part.srcs[1].as_reg().unwrap().row, 0);

        let narrow = chunk(&data, 4, 4);

        assert_eq!(narrow.srcs[0].as_reg().unwrap().region, Region::new(4, 4, 1));
        assert_eq!(narrow.srcs[0].as_reg().unwrap().sub_reg, 4);
    }

    fn df_adds(platform: Platform) -> Vec<(u8, u8)> {
        let mut k = kernel_for(platform, options());
        let x = k.create_decl(DeclareData::grf("X", ElemType::DF, 16));
        let y = k.create_decl(DeclareData::grf("Y", ElemType::DF, 16));
        let xs = k.src(x, 16);
        let mut b = Builder::new(&mut k);

        b.binary(Opcode::Add, 16, y, xs, xs);
        b.eot();
        k.build_flowgraph();
        HwConformity::new(&mut k).run();

        all_insts(&k)
            .into_iter()
            .map(|i| &k.insts[i])
            .filter(|data| data.op == Opcode::Add)
            .map(|data| (data.exec_size, data.mask_offset))
            .collect()
    }

    #[test]
    fn wide_operands_are_split() {
        // 16 doubles are 4 rows, two rows at a time
        assert_eq!(df_adds(Platform::Gen12Lp), vec![(8, 0), (8, 8)]);
        assert_eq!(df_adds(Platform::XeHp), vec![(4, 0), (4, 4), (4, 8), (4, 12)]);
    }

    #[test]
    fn pieces_of_a_region_row_are_strided() {
        let mut k = kernel_for(Platform::XeHp, options());
        let x = k.create_decl(DeclareData::grf("X", ElemType::DF, 32));
        let y = k.create_decl(DeclareData::grf("Y", ElemType::DF, 16));
        let xs = RegOperand::src(x, ElemType::DF, Region::new(16, 8, 1));
        let mut b = Builder::new(&mut k);

        b.binary(Opcode::Add, 16, y, xs.into(), xs.into());
        b.eot();
        k.build_flowgraph();
        HwConformity::new(&mut k).run();

        let adds: Vec<&InstData> = all_insts(&k)
            .into_iter()
            .map(|i| &k.insts[i])
            .filter(|data| data.op == Opcode::Add)
            .collect();
        let rows: Vec<u16> = adds
            .iter()
            .map(|data| data.srcs[0].as_reg().unwrap().row)
            .collect();

        assert_eq!(adds.len(), 4);
        assert_eq!(rows, vec![0, 1, 4, 5]);
        assert!(adds
            .iter()
            .all(|data| data.srcs[0].as_reg().unwrap().region == Region::new(4, 4, 1)));
    }

    #[test]
    fn hf_math_width_depends_on_the_platform() {
        let width = |platform| {
            let mut k = kernel_for(platform, options());
            let h = k.create_decl(DeclareData::grf("H", ElemType::HF, 16));
            let hs = k.src(h, 16);
            let mut b = Builder::new(&mut k);

            b.push(
                InstData::new(Opcode::Math(MathFn::Sqrt), 16)
                    .with_dst(RegOperand::dst(h, ElemType::HF))
                    .with_src(hs),
            );
            b.eot();
            k.build_flowgraph();

            max_width(&k.target, &k.insts[all_insts(&k)[0]])
        };

        assert_eq!(width(Platform::Gen9), 8);
        assert_eq!(width(Platform::Gen12Lp), 16);
    }

    #[test]
    fn carry_reader_splits_in_lock_step() {
        let mut k = kernel_for(Platform::Gen9, options());
        let a = k.create_decl(DeclareData::grf("A", ElemType::UD, 16));
        let lo = k.create_decl(DeclareData::grf("LO", ElemType::UD, 16));
        let carry = k.create_decl(DeclareData::grf("C", ElemType::UD, 16));
        let xs = k.src(a, 16);
        let mut b = Builder::new(&mut k);

        b.binary(Opcode::Addc, 16, lo, xs, xs);
        b.push(
            InstData::new(Opcode::Mov, 16)
                .with_dst(RegOperand::dst(carry, ElemType::UD))
                .with_src(RegOperand::acc(0, ElemType::UD, Region::contiguous(16))),
        );
        b.eot();
        k.build_flowgraph();
        HwConformity::new(&mut k).run();

        assert_eq!(
            opcodes(&k),
            vec![Opcode::Addc, Opcode::Mov, Opcode::Addc, Opcode::Mov, Opcode::Send]
        );

        let insts = all_insts(&k);

        assert_eq!(k.insts[insts[0]].implicit_acc_dst, Some(0));
        assert_eq!(k.insts[insts[3]].mask_offset, 8);
        assert_eq!(k.insts[insts[3]].dst.row, 1);
    }
}
