//======---------------------------------------------------------------======//
//                                                                           //
// Copyright 2022-2023 Evan Cox <evanacox00@gmail.com>. All rights reserved. //
//                                                                           //
// Use of this source code is governed by a BSD-style license that can be    //
// found in the LICENSE.txt file at the root of this project, or at the      //
// following link: https://opensource.org/licenses/BSD-3-Clause              //
//                                                                           //
//======---------------------------------------------------------------======//

#![deny(
    missing_abi,
    rust_2018_idioms,
    rustdoc::broken_intra_doc_links,
    rustdoc::private_intra_doc_links
)]
#![warn(unreachable_pub, missing_docs)]

//! # Opal
//!
//! The register allocation and hardware-conformity core of a GPU shader
//! compiler backend.
//!
//! A [`ir::Kernel`] is built through [`ir::Builder`], split into a
//! [`flowgraph::FlowGraph`], has its stage intrinsics expanded by
//! [`lowering::HullShaderLowering`], is legalized by [`conformity::HwConformity`] and
//! then given physical registers by [`regalloc::RegisterAllocator`]. The
//! analyses those passes rely on ([`analysis::LivenessAnalysis`],
//! [`analysis::PointsToAnalysis`]) are usable on their own.

pub mod analysis;
pub mod arena;
pub mod conformity;
pub mod flowgraph;
pub mod ir;
pub mod lowering;
pub mod options;
pub mod regalloc;
pub mod target;
pub mod utility;

#[cfg(test)]
pub(crate) mod testing;
