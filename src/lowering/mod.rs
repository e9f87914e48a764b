//======---------------------------------------------------------------======//
//                                                                           //
// Copyright 2022-2023 Evan Cox <evanacox00@gmail.com>. All rights reserved. //
//                                                                           //
// Use of this source code is governed by a BSD-style license that can be    //
// found in the LICENSE.txt file at the root of this project, or at the      //
// following link: https://opensource.org/licenses/BSD-3-Clause              //
//                                                                           //
//======---------------------------------------------------------------======//

//! Shader-stage lowering.
//!
//! Front-ends express stage-specific inputs and outputs as intrinsics. The
//! passes in here turn them into plain moves, address arithmetic and sends
//! before conformity and allocation see the kernel.

mod hull;

pub use hull::*;
