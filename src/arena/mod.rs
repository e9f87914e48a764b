//======---------------------------------------------------------------======//
//                                                                           //
// Copyright 2022-2023 Evan Cox <evanacox00@gmail.com>. All rights reserved. //
//                                                                           //
// Use of this source code is governed by a BSD-style license that can be    //
// found in the LICENSE.txt file at the root of this project, or at the      //
// following link: https://opensource.org/licenses/BSD-3-Clause              //
//                                                                           //
//======---------------------------------------------------------------======//

//! A simple typed arena module.
//!
//! Everything that is created while compiling a kernel (basic blocks,
//! instructions, declares, labels, call-graph nodes) lives inside of one of
//! these arenas, and is referred to through a small typed key. Arenas do not
//! allow deletion, so keys stay valid for the entire lifetime of the owning
//! [`Kernel`](crate::ir::Kernel) and are all freed in bulk at the end.
//!
//! ```
//! # use opal::arena_key;
//! # use opal::arena::*;
//! arena_key! {
//!     pub struct Node;
//! }
//!
//! enum Expr {
//!     Reg(u16),
//!     Add(Node, Node),
//! }
//!
//! let mut arena = ArenaMap::new();
//! let r1: Node = arena.insert(Expr::Reg(1));
//! let r2 = arena.insert(Expr::Reg(2));
//! let _sum = arena.insert(Expr::Add(r1, r2));
//! ```

mod iter;
mod key;
mod map;
mod secondary;
mod secondary_set;

pub use iter::Keys;
pub use key::ArenaKey;
pub use map::ArenaMap;
pub use secondary::SecondaryMap;
pub use secondary_set::SecondarySet;

use std::fmt;
use std::fmt::{Debug, Formatter};

pub(in crate::arena) fn debug_write_map<'a, K, V>(
    f: &mut Formatter<'_>,
    name: &'static str,
    it: impl Iterator<Item = (K, &'a V)>,
) -> fmt::Result
where
    K: ArenaKey,
    V: Debug + 'a,
{
    write!(f, "{name} ")?;

    f.debug_map().entries(it).finish()
}
