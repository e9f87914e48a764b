//======---------------------------------------------------------------======//
//                                                                           //
// Copyright 2022-2023 Evan Cox <evanacox00@gmail.com>. All rights reserved. //
//                                                                           //
// Use of this source code is governed by a BSD-style license that can be    //
// found in the LICENSE.txt file at the root of this project, or at the      //
// following link: https://opensource.org/licenses/BSD-3-Clause              //
//                                                                           //
//======---------------------------------------------------------------======//

use std::fmt::Debug;

/// Models a type that can act as a key for the arena map types.
///
/// Keys are dense indices: the n-th object inserted into an arena is
/// identified by the key with index `n`. Blocks, instructions, declares and
/// every other kernel-owned object are referred to through keys like these
/// instead of through pointers.
///
/// In most cases this trait should not be implemented directly, prefer the
/// [`arena_key`](crate::arena_key) or [`dense_arena_key`](crate::dense_arena_key)
/// macros that provide the implementation for you.
pub trait ArenaKey: Copy + Eq + Debug {
    /// The underlying data type of the key.
    type Item;

    /// Creates a new key from a given arena index. Panics if the index does not
    /// fit into the key's storage type.
    fn new(index: usize) -> Self;

    /// Converts the internal storage type back into a `usize` index.
    fn index(self) -> usize;
}

/// Creates a type-safe key for an [`ArenaMap`](crate::arena::ArenaMap) and
/// the associated secondary structures.
///
/// ```
/// # use opal::arena_key;
/// # use opal::arena::ArenaMap;
/// arena_key! {
///     /// Uses the default (`usize`) storage.
///     pub struct Slot;
///
///     // a tiny key, at most 256 entries
///     struct Lane(u8);
/// }
///
/// let mut slots = ArenaMap::new();
/// let s: Slot = slots.insert("r12");
/// assert_eq!(slots[s], "r12");
/// ```
#[macro_export(local_inner_macros)]
macro_rules! arena_key {
    ( $(#[$outer:meta])* $vis:vis struct $name:ident($ty:ty); $($rest:tt)* ) => {
        $(#[$outer])*
        #[repr(transparent)]
        #[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
        #[cfg_attr(feature = "enable-serde", derive(serde::Serialize, serde::Deserialize))]
        $vis struct $name($ty);

        impl $crate::arena::ArenaKey for $name {
            type Item = $ty;

            #[inline]
            fn new(index: usize) -> Self {
                use std::convert::TryInto;

                Self(index.try_into().expect("index is not representable with key type"))
            }

            #[inline]
            fn index(self) -> usize {
                self.0 as usize
            }
        }

        impl ::std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
                std::write!(f, "{}({})", std::stringify!($name), self.0)
            }
        }

        arena_key!($($rest)*);
    };

    ( $(#[$outer:meta])* $vis:vis struct $name:ident; $($rest:tt)* ) => {
        arena_key! { $(#[$outer])* $vis struct $name(usize); $($rest)* }
    };

    () => {}
}

/// Creates a type-safe key with [`u32`] storage. Acts just like [`arena_key`]
/// but also implements [`Packable`](crate::utility::Packable), reserving
/// `u32::MAX` as the "none" value so the key can live in a
/// [`PackedOption`](crate::utility::PackedOption).
///
/// ```
/// # use opal::dense_arena_key;
/// # use opal::arena::ArenaMap;
/// dense_arena_key! {
///     pub struct Row;
/// }
///
/// let mut rows = ArenaMap::<Row, u16>::new();
/// let r = rows.insert(4);
/// assert_eq!(rows[r], 4);
/// ```
#[macro_export(local_inner_macros)]
macro_rules! dense_arena_key {
    ( $(#[$outer:meta])* $vis:vis struct $name:ident; $($rest:tt)* ) => {
        arena_key! { $(#[$outer])* $vis struct $name(u32); }

        impl $crate::utility::Packable for $name {
            #[inline]
            fn reserved() -> Self {
                Self(u32::MAX)
            }

            #[inline]
            fn is_reserved(&self) -> bool {
                self.0 == u32::MAX
            }
        }

        dense_arena_key!($($rest)*);
    };

    () => {}
}

#[cfg(test)]
mod tests {
    use crate::arena::*;
    use crate::utility::Packable;
    use crate::{arena_key, dense_arena_key};
    use static_assertions::assert_eq_size;

    #[test]
    fn reserved_key_is_distinct() {
        dense_arena_key! { struct K; }

        let mut map = ArenaMap::<K, i32>::default();

        let k1 = map.insert(15);
        let k2 = K::reserved();

        assert!(k2.is_reserved());
        assert!(!k1.is_reserved());
    }

    #[test]
    fn key_sizes() {
        arena_key! { struct Wide; }
        arena_key! { struct Narrow(u16); }
        dense_arena_key! { struct Dense; }

        assert_eq_size!(Wide, usize);
        assert_eq_size!(Narrow, u16);
        assert_eq_size!(Dense, u32);
    }

    #[test]
    fn keys_index_in_insertion_order() {
        arena_key! { struct Key(u16); }

        let mut map = ArenaMap::new();
        let k1: Key = map.insert('a');
        let k2: Key = map.insert('b');

        assert_eq!(k1.index(), 0);
        assert_eq!(k2.index(), 1);
        assert_eq!(map[k2], 'b');
    }

    #[test]
    #[should_panic]
    fn overflowing_key_panics() {
        arena_key! { struct Tiny(u8); }

        let _ = Tiny::new(300);
    }
}
