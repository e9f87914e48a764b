//======---------------------------------------------------------------======//
//                                                                           //
// Copyright 2022-2023 Evan Cox <evanacox00@gmail.com>. All rights reserved. //
//                                                                           //
// Use of this source code is governed by a BSD-style license that can be    //
// found in the LICENSE.txt file at the root of this project, or at the      //
// following link: https://opensource.org/licenses/BSD-3-Clause              //
//                                                                           //
//======---------------------------------------------------------------======//

use crate::arena::{ArenaKey, Keys};
use std::fmt::{Debug, Formatter};
use std::marker::PhantomData;
use std::ops::{Index, IndexMut};
use std::{fmt, slice};

#[cfg(feature = "enable-serde")]
use serde::{Deserialize, Serialize};

/// A primary, append-only mapping of `K -> V`.
///
/// This is the "memory manager" of a kernel: blocks, instructions and
/// declares are all created inside of one of these and live until the
/// owning [`Kernel`](crate::ir::Kernel) is dropped. Objects are never
/// removed, a pass that deletes an instruction just unlinks it from its
/// block. This keeps every key that was ever handed out valid, which is
/// what lets analyses hold keys across mutations.
///
/// ```
/// # use opal::arena_key;
/// # use opal::arena::ArenaMap;
/// arena_key! { struct Name; }
///
/// let mut names = ArenaMap::new();
/// let n: Name = names.insert("V12");
///
/// assert_eq!(names[n], "V12");
/// ```
#[derive(Clone)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct ArenaMap<K: ArenaKey, V> {
    slots: Vec<V>,
    _unused: PhantomData<fn() -> K>,
}

impl<K: ArenaKey, V> ArenaMap<K, V> {
    /// Creates a new, empty arena.
    #[inline]
    pub fn new() -> Self {
        Self {
            slots: Vec::default(),
            _unused: PhantomData,
        }
    }

    /// Creates an empty arena with an initial capacity.
    #[inline]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            _unused: PhantomData,
        }
    }

    /// Checks if the arena contains a given key.
    #[inline]
    pub fn contains(&self, key: K) -> bool {
        key.index() < self.slots.len()
    }

    /// Gets the value associated with `key`, if it exists.
    #[inline]
    pub fn get(&self, key: K) -> Option<&V> {
        self.slots.get(key.index())
    }

    /// Gets the value associated with `key` mutably, if it exists.
    #[inline]
    pub fn get_mut(&mut self, key: K) -> Option<&mut V> {
        self.slots.get_mut(key.index())
    }

    /// Adds an item into the arena, and returns the key for it.
    #[inline]
    pub fn insert(&mut self, value: V) -> K {
        self.slots.push(value);

        K::new(self.slots.len() - 1)
    }

    /// Gets the key that *will be* returned by the next [`Self::insert`].
    #[inline]
    pub fn next_key(&self) -> K {
        K::new(self.slots.len())
    }

    /// Gets the number of elements that have been pushed into the arena.
    #[inline]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Checks if the arena has had any elements pushed into it.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Returns an iterator over the (valid) keys of the arena, in increasing order.
    pub fn keys(&self) -> Keys<K> {
        Keys::with_len(self.slots.len())
    }

    /// Returns an iterator over the values in the arena.
    pub fn values(&self) -> slice::Iter<'_, V> {
        self.slots.iter()
    }

    /// Returns an iterator over mutable references to the values in the arena.
    pub fn values_mut(&mut self) -> slice::IterMut<'_, V> {
        self.slots.iter_mut()
    }

    /// Returns an iterator over `(key, value)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (K, &V)> + DoubleEndedIterator + ExactSizeIterator {
        self.slots
            .iter()
            .enumerate()
            .map(|(i, v)| (K::new(i), v))
    }

    /// Returns an iterator over `(key, value)` pairs with mutable values.
    pub fn iter_mut(
        &mut self,
    ) -> impl Iterator<Item = (K, &mut V)> + DoubleEndedIterator + ExactSizeIterator {
        self.slots
            .iter_mut()
            .enumerate()
            .map(|(i, v)| (K::new(i), v))
    }
}

impl<K: ArenaKey, V> FromIterator<V> for ArenaMap<K, V> {
    fn from_iter<T: IntoIterator<Item = V>>(iter: T) -> Self {
        Self {
            slots: Vec::from_iter(iter),
            _unused: PhantomData,
        }
    }
}

impl<K: ArenaKey, V> Default for ArenaMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: ArenaKey, V> Index<K> for ArenaMap<K, V> {
    type Output = V;

    #[inline]
    fn index(&self, key: K) -> &V {
        &self.slots[key.index()]
    }
}

impl<K: ArenaKey, V> IndexMut<K> for ArenaMap<K, V> {
    #[inline]
    fn index_mut(&mut self, key: K) -> &mut V {
        &mut self.slots[key.index()]
    }
}

impl<K: ArenaKey, V: Debug> Debug for ArenaMap<K, V> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        crate::arena::debug_write_map(f, "ArenaMap", self.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena_key;

    arena_key! { struct Key(u32); }

    #[test]
    fn next_key_matches_insert() {
        let mut map = ArenaMap::<Key, i32>::new();
        let predicted = map.next_key();

        assert!(!map.contains(predicted));
        assert_eq!(map.insert(3), predicted);
        assert!(map.contains(predicted));
    }

    #[test]
    fn iter_yields_keys_in_order() {
        let map: ArenaMap<Key, char> = "abc".chars().collect();
        let keys: Vec<_> = map.iter().map(|(k, _)| k.index()).collect();

        assert_eq!(keys, vec![0, 1, 2]);
        assert_eq!(map.len(), 3);
    }

    #[test]
    fn mutation_through_index() {
        let mut map = ArenaMap::<Key, Vec<u8>>::new();
        let k = map.insert(vec![]);

        map[k].push(8);
        map.get_mut(k).unwrap().push(9);

        assert_eq!(map[k], vec![8, 9]);
    }
}
