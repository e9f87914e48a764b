//======---------------------------------------------------------------======//
//                                                                           //
// Copyright 2022-2023 Evan Cox <evanacox00@gmail.com>. All rights reserved. //
//                                                                           //
// Use of this source code is governed by a BSD-style license that can be    //
// found in the LICENSE.txt file at the root of this project, or at the      //
// following link: https://opensource.org/licenses/BSD-3-Clause              //
//                                                                           //
//======---------------------------------------------------------------======//

//! Physical register allocation.
//!
//! [`RegisterAllocator`] drives everything else in here. The pieces are
//! usable on their own:
//!
//! - [`PhyRegUsage`] tracks which rows, words, address sub-registers and
//!   flags are busy, and finds free storage that satisfies a [`RegRequest`].
//! - [`LocalRA`] linear-scans the variables that never leave their block.
//! - [`InterferenceGraph`] and [`GraphColor`] allocate the rest.
//! - [`Rematerialization`] and [`SpillManager`] rewrite the kernel when
//!   coloring fails.
//! - [`verify_allocation`] checks that the result is sound.

mod coloring;
mod driver;
mod interference;
mod local;
mod phy_reg_usage;
mod remat;
mod spill;
mod verify;

pub use coloring::*;
pub use driver::*;
pub use interference::*;
pub use local::*;
pub use phy_reg_usage::*;
pub use remat::*;
pub use spill::*;
pub use verify::*;
