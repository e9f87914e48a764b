//======---------------------------------------------------------------======//
//                                                                           //
// Copyright 2022-2023 Evan Cox <evanacox00@gmail.com>. All rights reserved. //
//                                                                           //
// Use of this source code is governed by a BSD-style license that can be    //
// found in the LICENSE.txt file at the root of this project, or at the      //
// following link: https://opensource.org/licenses/BSD-3-Clause              //
//                                                                           //
//======---------------------------------------------------------------======//

use crate::ir::{Declare, Kernel, RegFile};
use crate::regalloc::InterferenceGraph;
use crate::target::GRF_BYTES;
use std::fmt;

/// Something wrong with a finished allocation.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AllocViolation {
    /// A referenced variable has no location.
    Unassigned(Declare),
    /// A variable was placed outside of the usable part of its file.
    OutOfRange(Declare),
    /// Two interfering variables share storage.
    Overlap(Declare, Declare),
}

impl fmt::Display for AllocViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocViolation::Unassigned(d) => write!(f, "{d:?} has no location"),
            AllocViolation::OutOfRange(d) => write!(f, "{d:?} is outside of the usable file"),
            AllocViolation::Overlap(a, b) => write!(f, "{a:?} and {b:?} interfere but overlap"),
        }
    }
}

// [lo, hi) of the storage of `decl`, in bytes for the GRF and in words
// for the other files
fn storage(kernel: &Kernel, decl: Declare) -> Option<(u32, u32)> {
    let data = &kernel.decls[decl];
    let loc = data.location()?;

    let lo = match data.file {
        RegFile::Grf => loc.byte_addr(),
        RegFile::Address => loc.sub_word,
        RegFile::Flag => loc.reg * 2 + loc.sub_word,
    };
    let size = match data.file {
        RegFile::Grf => data.byte_size(),
        RegFile::Address | RegFile::Flag => data.num_words(),
    };

    Some((lo, lo + size))
}

fn limit(kernel: &Kernel, file: RegFile) -> u32 {
    match file {
        RegFile::Grf => {
            (kernel.total_grf() - kernel.options.reservations.total()) * GRF_BYTES
        }
        RegFile::Address => kernel.target.addr_sub_regs(),
        RegFile::Flag => kernel.target.flag_regs() * 2,
    }
}

/// Checks the allocation of every node of `graph`: referenced variables
/// have a location, allocated ones sit inside of the usable file, and no
/// two interfering variables overlap. An empty result means the
/// allocation is sound.
pub fn verify_allocation(kernel: &Kernel, graph: &InterferenceGraph) -> Vec<AllocViolation> {
    let mut violations = Vec::new();
    let limit = limit(kernel, graph.file());

    for &d in graph.nodes() {
        let data = &kernel.decls[d];

        match storage(kernel, d) {
            None if graph.is_referenced(d) => violations.push(AllocViolation::Unassigned(d)),
            Some((_, hi)) if data.fixed.is_none() && hi > limit => {
                violations.push(AllocViolation::OutOfRange(d))
            }
            _ => {}
        }
    }

    for (i, &a) in graph.nodes().iter().enumerate() {
        let Some((a_lo, a_hi)) = storage(kernel, a) else {
            continue;
        };

        for &b in graph.nodes()[i + 1..].iter() {
            if !graph.interferes(a, b) {
                continue;
            }

            if let Some((b_lo, b_hi)) = storage(kernel, b) {
                if a_lo < b_hi && b_lo < a_hi {
                    violations.push(AllocViolation::Overlap(a, b));
                }
            }
        }
    }

    violations
}
