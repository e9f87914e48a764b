//======---------------------------------------------------------------======//
//                                                                           //
// Copyright 2022-2023 Evan Cox <evanacox00@gmail.com>. All rights reserved. //
//                                                                           //
// Use of this source code is governed by a BSD-style license that can be    //
// found in the LICENSE.txt file at the root of this project, or at the      //
// following link: https://opensource.org/licenses/BSD-3-Clause              //
//                                                                           //
//======---------------------------------------------------------------======//

//! Knobs for the allocator and the conformity pass.

use std::str::FromStr;

#[cfg(feature = "enable-serde")]
use serde::{Deserialize, Serialize};

/// How liveness flows across subroutine calls.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub enum LivenessMode {
    /// Call and return edges are treated like any other CFG edge.
    ContextFree,
    /// Each subroutine is summarized once (bypass, may-use, may-def) and
    /// call sites use the summaries.
    ContextSensitive,
}

impl FromStr for LivenessMode {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "context-free" => Ok(LivenessMode::ContextFree),
            "context-sensitive" => Ok(LivenessMode::ContextSensitive),
            _ => Err("the available liveness modes are `context-free`, `context-sensitive`"),
        }
    }
}

/// Profitability thresholds for rematerialization.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct RematLimits {
    /// Rematerialization is only attempted in blocks whose peak GRF
    /// pressure (in rows) is at least this, or for spilled operands.
    pub reg_pressure: u32,
    /// Declares with more uses than this are never rematerialized.
    pub max_uses: u32,
    /// A cloned definition can be reused by later uses in the same block
    /// that are at most this many lexical ids away.
    pub max_local_reuse_distance: u32,
}

impl RematLimits {
    /// Default value of [`Self::reg_pressure`].
    pub const REMAT_REG_PRESSURE: u32 = 120;

    /// Default value of [`Self::max_uses`].
    pub const MAX_USES_REMAT: u32 = 6;

    /// Default value of [`Self::max_local_reuse_distance`].
    pub const MAX_LOCAL_REMAT_REUSE_DISTANCE: u32 = 40;
}

impl Default for RematLimits {
    fn default() -> Self {
        Self {
            reg_pressure: Self::REMAT_REG_PRESSURE,
            max_uses: Self::MAX_USES_REMAT,
            max_local_reuse_distance: Self::MAX_LOCAL_REMAT_REUSE_DISTANCE,
        }
    }
}

/// Registers that are taken away from the allocator.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct Reservations {
    /// Rows at the top of the file reserved for the stack-call ABI
    /// (frame and return address).
    pub stack_call: u32,
    /// Rows at the top of the file reserved for mid-thread preemption.
    pub preemption: u32,
    /// Rows below the other reservations kept free for spill/fill payloads.
    pub spill_scratch: u32,
    /// Whether EOT send payloads must be bound to the last rows of the file.
    pub eot_binding: bool,
}

impl Reservations {
    /// The total number of rows reserved at the top of the file.
    pub fn total(&self) -> u32 {
        self.stack_call + self.preemption + self.spill_scratch
    }
}

/// A set of detailed codegen configuration options that are provided
/// to the allocator and the conformity pass.
///
/// This effectively models the `-fthing` argument pattern in GCC-like
/// compilers.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct CodegenOptions {
    /// Number of GRF rows the allocator may use. `None` means every row the
    /// target has.
    pub total_grf: Option<u32>,
    /// Start every search after the last allocated register instead of at 0.
    pub round_robin: bool,
    /// Steer operands of the same instruction into different banks.
    pub bank_conflict_reduction: bool,
    /// Rows that the allocator may not touch.
    pub reservations: Reservations,
    /// Replace short-lived GRF temporaries with accumulators.
    pub acc_substitution: bool,
    /// Try rematerialization before inserting spill code.
    pub rematerialization: bool,
    /// Thresholds for rematerialization.
    pub remat: RematLimits,
    /// How liveness crosses calls.
    pub liveness_mode: LivenessMode,
    /// Writes inside divergent SIMD control flow may fully kill a variable
    /// without `no_mask`.
    pub simd_flow_unmasked: bool,
    /// Upper bound on allocate/spill rounds before giving up.
    pub max_ra_iterations: u32,
}

impl CodegenOptions {
    /// Sets [`Self::round_robin`].
    pub fn with_round_robin(mut self, on: bool) -> Self {
        self.round_robin = on;
        self
    }

    /// Sets [`Self::bank_conflict_reduction`].
    pub fn with_bank_conflict_reduction(mut self, on: bool) -> Self {
        self.bank_conflict_reduction = on;
        self
    }

    /// Sets [`Self::total_grf`].
    pub fn with_total_grf(mut self, rows: u32) -> Self {
        self.total_grf = Some(rows);
        self
    }

    /// Sets [`Self::liveness_mode`].
    pub fn with_liveness_mode(mut self, mode: LivenessMode) -> Self {
        self.liveness_mode = mode;
        self
    }

    /// Sets [`Self::rematerialization`].
    pub fn with_rematerialization(mut self, on: bool) -> Self {
        self.rematerialization = on;
        self
    }

    /// Sets [`Self::acc_substitution`].
    pub fn with_acc_substitution(mut self, on: bool) -> Self {
        self.acc_substitution = on;
        self
    }

    /// Sets [`Self::reservations`].
    pub fn with_reservations(mut self, reservations: Reservations) -> Self {
        self.reservations = reservations;
        self
    }
}

impl Default for CodegenOptions {
    fn default() -> Self {
        Self {
            total_grf: None,
            round_robin: true,
            bank_conflict_reduction: true,
            reservations: Reservations::default(),
            acc_substitution: true,
            rematerialization: true,
            remat: RematLimits::default(),
            liveness_mode: LivenessMode::ContextSensitive,
            simd_flow_unmasked: false,
            max_ra_iterations: 10,
        }
    }
}
