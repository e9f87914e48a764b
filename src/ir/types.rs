//======---------------------------------------------------------------======//
//                                                                           //
// Copyright 2022 Evan Cox <evanacox00@gmail.com>. All rights reserved.      //
//                                                                           //
// Use of this source code is governed by a BSD-style license that can be    //
// found in the LICENSE.txt file at the root of this project, or at the      //
// following link: https://opensource.org/licenses/BSD-3-Clause              //
//                                                                           //
//======---------------------------------------------------------------======//

use static_assertions::assert_eq_size;
use std::fmt;
use std::str::FromStr;

#[cfg(feature = "enable-serde")]
use serde::{Deserialize, Serialize};

/// The element type of an operand or a declare.
///
/// These are the hardware register types. `UV`, `V` and `VF` only
/// ever appear on immediates, they pack 8 (or 4 for `VF`) small values
/// into a single 32-bit immediate.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Ord, PartialOrd, Hash)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub enum ElemType {
    /// Unsigned byte.
    UB,
    /// Signed byte.
    B,
    /// Unsigned word.
    UW,
    /// Signed word.
    W,
    /// Unsigned dword.
    UD,
    /// Signed dword.
    D,
    /// Unsigned qword.
    UQ,
    /// Signed qword.
    Q,
    /// Half float.
    HF,
    /// Float.
    F,
    /// Double float.
    DF,
    /// Packed unsigned half-byte vector immediate.
    UV,
    /// Packed signed half-byte vector immediate.
    V,
    /// Packed restricted float vector immediate.
    VF,
}

assert_eq_size!(ElemType, u8);

impl ElemType {
    /// Size of one element in bytes.
    #[inline]
    pub fn size(self) -> u32 {
        match self {
            ElemType::UB | ElemType::B => 1,
            ElemType::UW | ElemType::W | ElemType::HF => 2,
            ElemType::UD | ElemType::D | ElemType::F => 4,
            ElemType::UV | ElemType::V | ElemType::VF => 4,
            ElemType::UQ | ElemType::Q | ElemType::DF => 8,
        }
    }

    /// Whether this is an integer type. Packed integer vectors count.
    #[inline]
    pub fn is_int(self) -> bool {
        !self.is_float()
    }

    /// Whether this is a floating-point type. `VF` counts.
    #[inline]
    pub fn is_float(self) -> bool {
        matches!(
            self,
            ElemType::HF | ElemType::F | ElemType::DF | ElemType::VF
        )
    }

    /// Whether this is a signed integer type.
    #[inline]
    pub fn is_signed_int(self) -> bool {
        matches!(
            self,
            ElemType::B | ElemType::W | ElemType::D | ElemType::Q | ElemType::V
        )
    }

    /// Whether this is one of the two byte types.
    #[inline]
    pub fn is_byte(self) -> bool {
        matches!(self, ElemType::UB | ElemType::B)
    }

    /// Whether this is a packed vector immediate type.
    #[inline]
    pub fn is_vector_imm(self) -> bool {
        matches!(self, ElemType::UV | ElemType::V | ElemType::VF)
    }

    /// Whether the type is a 32-bit integer.
    #[inline]
    pub fn is_dword_int(self) -> bool {
        matches!(self, ElemType::UD | ElemType::D)
    }

    /// The type an operand of this type is promoted to during execution.
    ///
    /// Bytes execute as words, packed vectors as the element they unpack to.
    pub fn exec_type(self) -> ElemType {
        match self {
            ElemType::UB | ElemType::UV => ElemType::UW,
            ElemType::B | ElemType::V => ElemType::W,
            ElemType::VF => ElemType::F,
            other => other,
        }
    }

    /// The unsigned integer type with the same size.
    pub fn to_unsigned(self) -> ElemType {
        match self {
            ElemType::B | ElemType::UB => ElemType::UB,
            ElemType::W | ElemType::UW | ElemType::HF => ElemType::UW,
            ElemType::D | ElemType::UD | ElemType::F => ElemType::UD,
            ElemType::Q | ElemType::UQ | ElemType::DF => ElemType::UQ,
            ElemType::V | ElemType::UV | ElemType::VF => ElemType::UD,
        }
    }

    /// The integer type of a given size in bytes and signedness.
    pub fn int_of_size(size: u32, signed: bool) -> ElemType {
        match (size, signed) {
            (1, false) => ElemType::UB,
            (1, true) => ElemType::B,
            (2, false) => ElemType::UW,
            (2, true) => ElemType::W,
            (4, false) => ElemType::UD,
            (4, true) => ElemType::D,
            (8, false) => ElemType::UQ,
            (8, true) => ElemType::Q,
            _ => panic!("no integer type is {size} bytes"),
        }
    }

    /// The wider of two execution types, preferring floats on ties.
    pub fn wider_exec(a: ElemType, b: ElemType) -> ElemType {
        let (a, b) = (a.exec_type(), b.exec_type());

        match a.size().cmp(&b.size()) {
            std::cmp::Ordering::Greater => a,
            std::cmp::Ordering::Less => b,
            std::cmp::Ordering::Equal if b.is_float() => b,
            std::cmp::Ordering::Equal => a,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            ElemType::UB => "ub",
            ElemType::B => "b",
            ElemType::UW => "uw",
            ElemType::W => "w",
            ElemType::UD => "ud",
            ElemType::D => "d",
            ElemType::UQ => "uq",
            ElemType::Q => "q",
            ElemType::HF => "hf",
            ElemType::F => "f",
            ElemType::DF => "df",
            ElemType::UV => "uv",
            ElemType::V => "v",
            ElemType::VF => "vf",
        }
    }
}

impl fmt::Display for ElemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ElemType {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ub" => Ok(ElemType::UB),
            "b" => Ok(ElemType::B),
            "uw" => Ok(ElemType::UW),
            "w" => Ok(ElemType::W),
            "ud" => Ok(ElemType::UD),
            "d" => Ok(ElemType::D),
            "uq" => Ok(ElemType::UQ),
            "q" => Ok(ElemType::Q),
            "hf" => Ok(ElemType::HF),
            "f" => Ok(ElemType::F),
            "df" => Ok(ElemType::DF),
            "uv" => Ok(ElemType::UV),
            "v" => Ok(ElemType::V),
            "vf" => Ok(ElemType::VF),
            _ => Err("unknown element type, expected one of `ub`, `b`, `uw`, `w`, `ud`, `d`, `uq`, `q`, `hf`, `f`, `df`, `uv`, `v`, `vf`"),
        }
    }
}
