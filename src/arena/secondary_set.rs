//======---------------------------------------------------------------======//
//                                                                           //
// Copyright 2022-2023 Evan Cox <evanacox00@gmail.com>. All rights reserved. //
//                                                                           //
// Use of this source code is governed by a BSD-style license that can be    //
// found in the LICENSE.txt file at the root of this project, or at the      //
// following link: https://opensource.org/licenses/BSD-3-Clause              //
//                                                                           //
//======---------------------------------------------------------------======//

use crate::arena::{ArenaKey, ArenaMap};
use smallbitvec::{sbvec, SmallBitVec};
use std::fmt;
use std::fmt::{Debug, Formatter};
use std::marker::PhantomData;

/// A dense set of keys from a primary map, stored as one bit per key.
///
/// This is used for the small "visited"/"member" sets that the flowgraph
/// algorithms need (loop bodies, reachable blocks, address-taken declares).
/// It is *not* the bitset used for dataflow, see
/// [`BitSet`](crate::utility::BitSet) for that.
///
/// ```
/// # use opal::arena_key;
/// # use opal::arena::*;
/// arena_key! { struct Key; }
/// let mut map = ArenaMap::default();
/// let k1: Key = map.insert(15);
/// let k2 = map.insert(20);
/// let even = SecondarySet::map_keys(&map, |m, k| m[k] % 2 == 0);
///
/// assert!(!even.contains(k1));
/// assert!(even.contains(k2));
/// ```
#[derive(Clone, PartialEq, Eq)]
pub struct SecondarySet<K: ArenaKey> {
    bits: SmallBitVec,
    cardinality: usize,
    _unused: PhantomData<fn() -> K>,
}

impl<K: ArenaKey> SecondarySet<K> {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self {
            bits: SmallBitVec::new(),
            cardinality: 0,
            _unused: PhantomData,
        }
    }

    /// Creates an empty set pre-sized for `cap` keys.
    pub fn with_capacity(cap: usize) -> Self {
        Self {
            bits: sbvec![false; cap],
            cardinality: 0,
            _unused: PhantomData,
        }
    }

    /// Creates an empty set pre-sized for every key of `primary`.
    #[inline]
    pub fn with_primary<T>(primary: &ArenaMap<K, T>) -> Self {
        Self::with_capacity(primary.len())
    }

    /// Creates the set `{ k | f(k) }` over the keys of `primary`.
    pub fn map_keys<T, F>(primary: &ArenaMap<K, T>, mut f: F) -> Self
    where
        F: FnMut(&ArenaMap<K, T>, K) -> bool,
    {
        let mut set = Self::with_primary(primary);

        for key in primary.keys() {
            if f(primary, key) {
                set.insert(key);
            }
        }

        set
    }

    /// Returns the number of keys in the set.
    pub fn cardinality(&self) -> usize {
        self.cardinality
    }

    /// Returns if the set is completely empty.
    pub fn is_empty(&self) -> bool {
        self.cardinality == 0
    }

    /// Returns whether or not a key is present in the set.
    pub fn contains(&self, key: K) -> bool {
        self.bits.get(key.index()).unwrap_or(false)
    }

    /// Inserts a key into the set, returns whether the key was present before.
    pub fn insert(&mut self, key: K) -> bool {
        let idx = key.index();

        if idx >= self.bits.len() {
            self.bits.resize(idx + 1, false);
        }

        let was_present = self.bits[idx];

        if !was_present {
            self.bits.set(idx, true);
            self.cardinality += 1;
        }

        was_present
    }

    /// Removes a key from the set, returns whether the key was present before.
    pub fn remove(&mut self, key: K) -> bool {
        let was_present = self.contains(key);

        if was_present {
            self.bits.set(key.index(), false);
            self.cardinality -= 1;
        }

        was_present
    }

    /// Iterates over the keys in the set in increasing order.
    pub fn iter(&self) -> impl Iterator<Item = K> + '_ {
        self.bits
            .iter()
            .enumerate()
            .filter(|(_, present)| *present)
            .map(|(i, _)| K::new(i))
    }
}

impl<K: ArenaKey> Default for SecondarySet<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: ArenaKey> FromIterator<K> for SecondarySet<K> {
    fn from_iter<T: IntoIterator<Item = K>>(iter: T) -> Self {
        let mut set = Self::new();

        for key in iter {
            set.insert(key);
        }

        set
    }
}

impl<K: ArenaKey> Debug for SecondarySet<K> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena_key;

    arena_key! { struct Key(u32); }

    #[test]
    fn insert_and_remove_track_cardinality() {
        let mut set = SecondarySet::new();

        assert!(!set.insert(Key::new(7)));
        assert!(set.insert(Key::new(7)));
        assert_eq!(set.cardinality(), 1);
        assert!(set.remove(Key::new(7)));
        assert!(!set.remove(Key::new(7)));
        assert!(set.is_empty());
    }

    #[test]
    fn iteration_is_sorted() {
        let set: SecondarySet<Key> = [9, 1, 4].into_iter().map(Key::new).collect();

        assert_eq!(set.iter().map(|k| k.index()).collect::<Vec<_>>(), vec![1, 4, 9]);
    }
}
