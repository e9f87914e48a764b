//======---------------------------------------------------------------======//
//                                                                           //
// Copyright 2022-2023 Evan Cox <evanacox00@gmail.com>. All rights reserved. //
//                                                                           //
// Use of this source code is governed by a BSD-style license that can be    //
// found in the LICENSE.txt file at the root of this project, or at the      //
// following link: https://opensource.org/licenses/BSD-3-Clause              //
//                                                                           //
//======---------------------------------------------------------------======//

//! Provides the types that make up a kernel: element types, declares,
//! operands and instructions, plus the [`Kernel`] that owns all of them.
//!
//! This only contains the code for representing the IR itself, the
//! analyses and rewrites that operate on it live in other modules.

mod builder;
mod declare;
mod display;
mod instruction;
mod kernel;
mod operand;
mod types;

pub use builder::*;
pub use declare::*;
pub use display::*;
pub use instruction::*;
pub use kernel::*;
pub use operand::*;
pub use types::*;
