//======---------------------------------------------------------------======//
//                                                                           //
// Copyright 2022-2023 Evan Cox <evanacox00@gmail.com>. All rights reserved. //
//                                                                           //
// Use of this source code is governed by a BSD-style license that can be    //
// found in the LICENSE.txt file at the root of this project, or at the      //
// following link: https://opensource.org/licenses/BSD-3-Clause              //
//                                                                           //
//======---------------------------------------------------------------======//

//! Describes the hardware that kernels are being compiled for.
//!
//! Every platform difference that the allocator or the conformity pass
//! cares about is either a number on [`Target`] (register counts,
//! accumulator width) or a [`Feature`] bit queried through
//! [`Target::supports`]. Passes never match on [`Platform`] directly.

use paste::paste;
use static_assertions::const_assert;
use std::fmt;
use std::str::FromStr;

#[cfg(feature = "enable-serde")]
use serde::{Deserialize, Serialize};

/// The size of one GRF row in bytes.
pub const GRF_BYTES: u32 = 32;

/// The size of one GRF row in 16-bit words.
pub const GRF_WORDS: u32 = GRF_BYTES / 2;

const_assert!(GRF_WORDS <= 16);

/// The GPU generations that code can be generated for.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Ord, PartialOrd, Hash)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub enum Platform {
    /// Gen9 class hardware.
    Gen9,
    /// Gen11 class hardware.
    Gen11,
    /// Gen12 low-power class hardware.
    Gen12Lp,
    /// Xe high-performance class hardware.
    XeHp,
}

impl FromStr for Platform {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "gen9" => Ok(Platform::Gen9),
            "gen11" => Ok(Platform::Gen11),
            "gen12lp" => Ok(Platform::Gen12Lp),
            "xehp" => Ok(Platform::XeHp),
            _ => Err("the available platforms are `gen9`, `gen11`, `gen12lp`, `xehp`"),
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Platform::Gen9 => write!(f, "gen9"),
            Platform::Gen11 => write!(f, "gen11"),
            Platform::Gen12Lp => write!(f, "gen12lp"),
            Platform::XeHp => write!(f, "xehp"),
        }
    }
}

macro_rules! feature_table {
    ( $( $(#[$outer:meta])* $name:ident => [$gen9:literal, $gen11:literal, $gen12lp:literal, $xehp:literal]; )* ) => {
        /// A single hardware capability or restriction.
        ///
        /// The default value of every feature for every [`Platform`] lives in
        /// one table, individual bits can be overridden on a [`Target`] with
        /// [`Target::with_feature`].
        #[repr(u8)]
        #[derive(Copy, Clone, Debug, PartialEq, Eq, Ord, PartialOrd, Hash)]
        #[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
        pub enum Feature {
            $( $(#[$outer])* $name, )*
        }

        impl Feature {
            /// Every feature, in declaration order.
            pub const ALL: &'static [Feature] = &[ $( Feature::$name, )* ];

            /// The name of the feature, in `snake_case`.
            pub fn name(self) -> &'static str {
                match self {
                    $( Feature::$name => paste! { stringify!([<$name:snake>]) }, )*
                }
            }

            fn default_for(self, platform: Platform) -> bool {
                match self {
                    $(
                        Feature::$name => match platform {
                            Platform::Gen9 => $gen9,
                            Platform::Gen11 => $gen11,
                            Platform::Gen12Lp => $gen12lp,
                            Platform::XeHp => $xehp,
                        },
                    )*
                }
            }
        }

        impl Target {
            paste! {
                $(
                    #[doc = concat!("Shorthand for `self.supports(Feature::", stringify!($name), ")`.")]
                    #[inline]
                    pub fn [< has_ $name:snake >](&self) -> bool {
                        self.supports(Feature::$name)
                    }
                )*
            }
        }
    };
}

//                          gen9   gen11  gen12lp xehp
feature_table! {
    /// `mul` with two 32-bit integer sources produces a full 32-bit result
    /// natively. Without it, the `mul`/`mach`/`mov` macro is required.
    NativeMulDword => [true, false, false, false];
    /// Three-source instructions are encoded in align1 mode (immediates
    /// allowed in src0/src2, integer types allowed) instead of align16.
    Align1Ternary => [false, false, true, true];
    /// Half-float and float operands may be mixed in one instruction.
    MixedModeHf => [true, true, true, false];
    /// A mixed-mode instruction may write a packed (`hstride == 1`)
    /// half-float destination.
    MixedModePackedHfDst => [false, true, true, true];
    /// Byte-typed operands are forbidden in src1 of multiply-class
    /// instructions.
    Src1ByteForbidden => [false, false, true, true];
    /// Half-float extended math runs at SIMD16. Without it, HF math is
    /// limited to SIMD8.
    MathHfSimd16 => [false, false, true, true];
    /// Double-float instructions are limited to SIMD4 per GRF pair.
    DfSimd4 => [false, false, false, true];
    /// Integer values may be kept in the accumulator by the accumulator
    /// substitution pass. Without it, only float values are substituted.
    IntAccSubstitution => [false, true, true, true];
}

const_assert!((Feature::IntAccSubstitution as u8) < 64);

/// A full description of the hardware being targeted.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct Target {
    platform: Platform,
    grf_count: u32,
    acc_bytes: u32,
    num_acc: u32,
    addr_sub_regs: u32,
    flag_regs: u32,
    features: u64,
}

impl Target {
    /// Creates the default description of a platform.
    pub fn new(platform: Platform) -> Self {
        let features = Feature::ALL
            .iter()
            .filter(|f| f.default_for(platform))
            .fold(0u64, |acc, f| acc | (1 << (*f as u8)));

        let (acc_bytes, num_acc) = match platform {
            Platform::Gen9 | Platform::Gen11 => (32, 2),
            Platform::Gen12Lp => (64, 4),
            Platform::XeHp => (64, 8),
        };

        Self {
            platform,
            grf_count: 128,
            acc_bytes,
            num_acc,
            addr_sub_regs: 16,
            flag_regs: 2,
            features,
        }
    }

    /// Overrides a single feature bit.
    pub fn with_feature(mut self, feature: Feature, enabled: bool) -> Self {
        let bit = 1u64 << (feature as u8);

        if enabled {
            self.features |= bit;
        } else {
            self.features &= !bit;
        }

        self
    }

    /// Overrides the number of physical GRF rows.
    pub fn with_grf_count(mut self, count: u32) -> Self {
        self.grf_count = count;
        self
    }

    /// Checks whether the hardware has a given feature.
    #[inline]
    pub fn supports(&self, feature: Feature) -> bool {
        self.features & (1 << (feature as u8)) != 0
    }

    /// The platform being targeted.
    pub fn platform(&self) -> Platform {
        self.platform
    }

    /// Number of physical GRF rows.
    pub fn grf_count(&self) -> u32 {
        self.grf_count
    }

    /// Size of one accumulator register in bytes.
    pub fn acc_bytes(&self) -> u32 {
        self.acc_bytes
    }

    /// Number of accumulator registers that can hold values.
    pub fn num_acc(&self) -> u32 {
        self.num_acc
    }

    /// Number of 16-bit address sub-registers.
    pub fn addr_sub_regs(&self) -> u32 {
        self.addr_sub_regs
    }

    /// Number of 32-bit flag registers (each is two 16-bit sub-registers).
    pub fn flag_regs(&self) -> u32 {
        self.flag_regs
    }
}
