//======---------------------------------------------------------------======//
//                                                                           //
// Copyright 2022 Evan Cox <evanacox00@gmail.com>. All rights reserved.      //
//                                                                           //
// Use of this source code is governed by a BSD-style license that can be    //
// found in the LICENSE.txt file at the root of this project, or at the      //
// following link: https://opensource.org/licenses/BSD-3-Clause              //
//                                                                           //
//======---------------------------------------------------------------======//

//! Contains the dataflow analyses that the register allocator relies on.
//!
//! [`PointsToAnalysis`] must run first, as liveness needs to know what
//! indirect operands may touch.

mod liveness;
mod points_to;

pub use liveness::*;
pub use points_to::*;
