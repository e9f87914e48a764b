//======---------------------------------------------------------------======//
//                                                                           //
// Copyright 2022-2023 Evan Cox <evanacox00@gmail.com>. All rights reserved. //
//                                                                           //
// Use of this source code is governed by a BSD-style license that can be    //
// found in the LICENSE.txt file at the root of this project, or at the      //
// following link: https://opensource.org/licenses/BSD-3-Clause              //
//                                                                           //
//======---------------------------------------------------------------======//

use crate::ir::{Declare, ElemType};
use crate::target::GRF_BYTES;
use std::fmt;

#[cfg(feature = "enable-serde")]
use serde::{Deserialize, Serialize};

/// A `<vstride; width, hstride>` source region, all counted in elements.
///
/// Element `i` of the operand is read from
/// `(i / width) * vstride + (i % width) * hstride`. Destinations only use
/// `hstride`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct Region {
    /// Distance between the starts of two rows.
    pub vstride: u16,
    /// Number of elements per row.
    pub width: u16,
    /// Distance between two elements of a row.
    pub hstride: u16,
}

impl Region {
    /// Creates a region from its three parts.
    #[inline]
    pub const fn new(vstride: u16, width: u16, hstride: u16) -> Self {
        Self {
            vstride,
            width,
            hstride,
        }
    }

    /// `<0;1,0>`, every channel reads the same element.
    #[inline]
    pub const fn scalar() -> Self {
        Self::new(0, 1, 0)
    }

    /// The region a destination with horizontal stride `hstride` uses.
    #[inline]
    pub const fn dst(hstride: u16) -> Self {
        Self::new(0, 1, hstride)
    }

    /// A region that reads every `stride`-th element, sized for `exec_size`
    /// channels. A stride of 0 is [`Self::scalar`].
    pub fn strided(stride: u16, exec_size: u8) -> Self {
        if stride == 0 || exec_size == 1 {
            return Self::scalar();
        }

        let width = u16::from(exec_size).min(8);

        Self::new(width * stride, width, stride)
    }

    /// Shorthand for `Region::strided(1, exec_size)`.
    #[inline]
    pub fn contiguous(exec_size: u8) -> Self {
        Self::strided(1, exec_size)
    }

    /// Whether every channel reads the same element.
    #[inline]
    pub fn is_scalar(&self) -> bool {
        self.vstride == 0 && (self.width == 1 || self.hstride == 0)
    }

    /// Offset of channel `i`, in elements.
    #[inline]
    pub fn elem_offset(&self, i: u32) -> u32 {
        let width = u32::from(self.width.max(1));

        (i / width) * u32::from(self.vstride) + (i % width) * u32::from(self.hstride)
    }

    /// The single distance between consecutive channels, if the region
    /// has one when executed with `exec_size` channels.
    pub fn flat_stride(&self, exec_size: u8) -> Option<u16> {
        if exec_size == 1 || self.is_scalar() {
            Some(0)
        } else if self.width >= u16::from(exec_size) {
            Some(self.hstride)
        } else if self.width == 1 {
            Some(self.vstride)
        } else if self.vstride == self.width * self.hstride {
            Some(self.hstride)
        } else {
            None
        }
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{};{},{}>", self.vstride, self.width, self.hstride)
    }
}

/// A source modifier.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub enum SrcModifier {
    /// No modifier.
    None,
    /// `-src`.
    Neg,
    /// `(abs)src`.
    Abs,
    /// `-(abs)src`.
    NegAbs,
    /// `~src` for logic instructions.
    Not,
}

/// What a register operand refers to.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub enum RegBase {
    /// A declare (possibly an alias).
    Var(Declare),
    /// `r[addr, imm]`, the register is computed from an address declare.
    Indirect {
        /// The address declare holding the byte address.
        addr: Declare,
        /// Immediate byte offset added to the address.
        imm: i16,
    },
    /// An accumulator register.
    Acc(u8),
    /// The null register.
    Null,
}

/// A register operand, usable both as a source and as a destination.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct RegOperand {
    /// The storage being accessed.
    pub base: RegBase,
    /// Row offset inside of the base.
    pub row: u16,
    /// Element offset inside of the row, in units of `ty`.
    pub sub_reg: u16,
    /// Access pattern.
    pub region: Region,
    /// Type the storage is interpreted as.
    pub ty: ElemType,
    /// Source modifier, always `None` on destinations.
    pub modifier: SrcModifier,
}

impl RegOperand {
    /// A source reading `decl` from its start with `region`.
    pub fn src(decl: Declare, ty: ElemType, region: Region) -> Self {
        Self {
            base: RegBase::Var(decl),
            row: 0,
            sub_reg: 0,
            region,
            ty,
            modifier: SrcModifier::None,
        }
    }

    /// A destination writing `decl` from its start with stride 1.
    pub fn dst(decl: Declare, ty: ElemType) -> Self {
        Self {
            base: RegBase::Var(decl),
            row: 0,
            sub_reg: 0,
            region: Region::dst(1),
            ty,
            modifier: SrcModifier::None,
        }
    }

    /// The null destination.
    pub fn null(ty: ElemType) -> Self {
        Self {
            base: RegBase::Null,
            row: 0,
            sub_reg: 0,
            region: Region::dst(1),
            ty,
            modifier: SrcModifier::None,
        }
    }

    /// An accumulator operand.
    pub fn acc(index: u8, ty: ElemType, region: Region) -> Self {
        Self {
            base: RegBase::Acc(index),
            row: 0,
            sub_reg: 0,
            region,
            ty,
            modifier: SrcModifier::None,
        }
    }

    /// Returns a copy with a different element offset.
    pub fn at(mut self, row: u16, sub_reg: u16) -> Self {
        self.row = row;
        self.sub_reg = sub_reg;
        self
    }

    /// Returns a copy with a different region.
    pub fn with_region(mut self, region: Region) -> Self {
        self.region = region;
        self
    }

    /// Returns a copy reinterpreted as another type at the same byte offset.
    pub fn retyped(mut self, ty: ElemType) -> Self {
        let byte = self.byte_offset();

        self.ty = ty;
        self.row = (byte / GRF_BYTES) as u16;
        self.sub_reg = ((byte % GRF_BYTES) / ty.size()) as u16;
        self
    }

    /// Returns a copy with a source modifier.
    pub fn with_modifier(mut self, modifier: SrcModifier) -> Self {
        self.modifier = modifier;
        self
    }

    /// The directly accessed declare, if there is one.
    #[inline]
    pub fn declare(&self) -> Option<Declare> {
        match self.base {
            RegBase::Var(d) => Some(d),
            _ => None,
        }
    }

    /// Whether the operand is `r[a0.N]`.
    #[inline]
    pub fn is_indirect(&self) -> bool {
        matches!(self.base, RegBase::Indirect { .. })
    }

    /// Whether the operand is an accumulator.
    #[inline]
    pub fn is_acc(&self) -> bool {
        matches!(self.base, RegBase::Acc(_))
    }

    /// Whether the operand is the null register.
    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self.base, RegBase::Null)
    }

    /// Byte offset of the first element inside of the base.
    #[inline]
    pub fn byte_offset(&self) -> u32 {
        u32::from(self.row) * GRF_BYTES + u32::from(self.sub_reg) * self.ty.size()
    }

    /// Byte offset of channel `i` inside of the base.
    pub fn channel_byte(&self, i: u32, is_dst: bool) -> u32 {
        let elem = if is_dst {
            i * u32::from(self.region.hstride)
        } else {
            self.region.elem_offset(i)
        };

        self.byte_offset() + elem * self.ty.size()
    }

    /// The `[lo, hi)` byte range touched when executed with `exec_size`
    /// channels.
    pub fn footprint(&self, exec_size: u8, is_dst: bool) -> (u32, u32) {
        let mut lo = u32::MAX;
        let mut hi = 0;

        for i in 0..u32::from(exec_size) {
            let b = self.channel_byte(i, is_dst);

            lo = lo.min(b);
            hi = hi.max(b + self.ty.size());
        }

        (lo, hi)
    }

    /// Number of GRF rows spanned when executed with `exec_size` channels.
    pub fn rows_spanned(&self, exec_size: u8, is_dst: bool) -> u32 {
        let (lo, hi) = self.footprint(exec_size, is_dst);

        (hi - 1) / GRF_BYTES - lo / GRF_BYTES + 1
    }
}

/// One source of an instruction.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub enum Operand {
    /// A register.
    Reg(RegOperand),
    /// An immediate, stored zero-extended.
    Imm {
        /// The raw bits.
        bits: u64,
        /// The immediate's type.
        ty: ElemType,
    },
    /// `&var + offset`, only valid as a `mov`/`add` source writing an
    /// address declare.
    AddrOf {
        /// The variable whose address is taken.
        var: Declare,
        /// Byte offset inside of the variable.
        offset: u32,
    },
}

impl Operand {
    /// Shorthand for an integer immediate.
    pub fn imm(value: i64, ty: ElemType) -> Self {
        let bits = match ty.size() {
            8 => value as u64,
            size => (value as u64) & ((1u64 << (size * 8)) - 1),
        };

        Operand::Imm { bits, ty }
    }

    /// Shorthand for a float immediate.
    pub fn imm_f32(value: f32) -> Self {
        Operand::Imm {
            bits: u64::from(value.to_bits()),
            ty: ElemType::F,
        }
    }

    /// The element type of the operand.
    pub fn ty(&self) -> ElemType {
        match self {
            Operand::Reg(r) => r.ty,
            Operand::Imm { ty, .. } => *ty,
            Operand::AddrOf { .. } => ElemType::UW,
        }
    }

    /// Gets the register operand, if this is one.
    #[inline]
    pub fn as_reg(&self) -> Option<&RegOperand> {
        match self {
            Operand::Reg(r) => Some(r),
            _ => None,
        }
    }

    /// Gets the register operand mutably, if this is one.
    #[inline]
    pub fn as_reg_mut(&mut self) -> Option<&mut RegOperand> {
        match self {
            Operand::Reg(r) => Some(r),
            _ => None,
        }
    }

    /// Whether this is an immediate.
    #[inline]
    pub fn is_imm(&self) -> bool {
        matches!(self, Operand::Imm { .. })
    }

    /// The directly accessed declare, if there is one.
    #[inline]
    pub fn declare(&self) -> Option<Declare> {
        self.as_reg().and_then(RegOperand::declare)
    }
}

impl From<RegOperand> for Operand {
    fn from(r: RegOperand) -> Self {
        Operand::Reg(r)
    }
}

/// `(f0.0)` or `(-f0.0)` on an instruction.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct Predicate {
    /// The flag declare being read.
    pub flag: Declare,
    /// Whether the predicate is inverted.
    pub inverse: bool,
}

/// The comparison performed by a condition modifier.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub enum CondKind {
    /// `.z` / `.e`
    Eq,
    /// `.nz` / `.ne`
    Ne,
    /// `.g`
    Gt,
    /// `.ge`
    Ge,
    /// `.l`
    Lt,
    /// `.le`
    Le,
    /// `.o`, overflow.
    Ov,
}

/// A condition modifier, writing a flag.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct CondMod {
    /// The comparison.
    pub kind: CondKind,
    /// The flag declare being written.
    pub flag: Declare,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::ArenaKey;

    #[test]
    fn region_offsets() {
        let r = Region::new(16, 8, 2);

        assert_eq!(r.elem_offset(0), 0);
        assert_eq!(r.elem_offset(7), 14);
        assert_eq!(r.elem_offset(8), 16);
        assert_eq!(r.flat_stride(16), Some(2));
        assert_eq!(Region::new(4, 2, 1).flat_stride(8), None);
        assert_eq!(Region::scalar().flat_stride(16), Some(0));
    }

    #[test]
    fn footprints() {
        let d = Declare::new(0);
        let src = RegOperand::src(d, ElemType::D, Region::contiguous(16)).at(1, 2);
        let dst = RegOperand::dst(d, ElemType::UB).with_region(Region::dst(2));

        assert_eq!(src.byte_offset(), 40);
        assert_eq!(src.footprint(16, false), (40, 104));
        assert_eq!(src.rows_spanned(16, false), 3);
        assert_eq!(dst.footprint(16, true), (0, 31));
    }

    #[test]
    fn retype_keeps_byte_offset() {
        let d = Declare::new(0);
        let op = RegOperand::dst(d, ElemType::D).at(0, 3).retyped(ElemType::UW);

        assert_eq!(op.sub_reg, 6);
        assert_eq!(op.ty, ElemType::UW);
    }

    #[test]
    fn immediates_are_truncated() {
        assert_eq!(
            Operand::imm(-1, ElemType::W),
            Operand::Imm {
                bits: 0xffff,
                ty: ElemType::W
            }
        );
    }
}
