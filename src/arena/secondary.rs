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
use std::fmt::{Debug, Formatter};
use std::marker::PhantomData;
use std::ops::{Index, IndexMut};
use std::{fmt, iter};

/// A dense secondary mapping `K -> V` for keys of a primary [`ArenaMap`].
///
/// Analyses use this to associate data with (most of) the blocks, declares or
/// instructions of a kernel without touching the primary arenas. Storage is
/// one slot per key up to the highest key inserted.
///
/// ```
/// # use opal::arena_key;
/// # use opal::arena::*;
/// arena_key! { struct Var; }
///
/// let mut vars = ArenaMap::new();
/// let v1: Var = vars.insert("V1");
/// let v2 = vars.insert("V2");
///
/// let sizes = SecondaryMap::map_all_keys(&vars, |_, _| 32u32);
/// let mut uses = SecondaryMap::with_primary(&vars);
/// uses.insert(v1, 3);
///
/// assert_eq!(sizes[v2], 32);
/// assert_eq!(uses.get(v2), None);
/// assert_eq!(uses[v1], 3);
/// ```
#[derive(Clone)]
pub struct SecondaryMap<K: ArenaKey, V> {
    slots: Vec<Option<V>>,
    len: usize,
    _unused: PhantomData<fn() -> K>,
}

impl<K: ArenaKey, V> SecondaryMap<K, V> {
    /// Creates an empty map.
    #[inline]
    pub fn new() -> Self {
        Self {
            slots: Vec::default(),
            len: 0,
            _unused: PhantomData,
        }
    }

    /// Creates an empty map with room for every key of `primary`.
    pub fn with_primary<T>(primary: &ArenaMap<K, T>) -> Self {
        Self {
            slots: iter::repeat_with(|| None).take(primary.len()).collect(),
            len: 0,
            _unused: PhantomData,
        }
    }

    /// Creates a map with `count` keys (`0..count`) all mapped to a clone of `value`.
    pub fn fill(count: usize, value: V) -> Self
    where
        V: Clone,
    {
        Self {
            slots: vec![Some(value); count],
            len: count,
            _unused: PhantomData,
        }
    }

    /// Maps every key of `primary` to `f(primary, key)`.
    pub fn map_all_keys<T, F>(primary: &ArenaMap<K, T>, mut f: F) -> Self
    where
        F: FnMut(&ArenaMap<K, T>, K) -> V,
    {
        let slots: Vec<_> = primary.keys().map(|k| Some(f(primary, k))).collect();

        Self {
            len: slots.len(),
            slots,
            _unused: PhantomData,
        }
    }

    /// Checks if the map contains a value for a given key.
    #[inline]
    pub fn contains(&self, key: K) -> bool {
        matches!(self.slots.get(key.index()), Some(Some(_)))
    }

    /// Inserts `key -> value`, returning the previous value if there was one.
    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        let idx = key.index();

        if idx >= self.slots.len() {
            self.slots.resize_with(idx + 1, || None);
        }

        let old = self.slots[idx].replace(value);

        if old.is_none() {
            self.len += 1;
        }

        old
    }

    /// Removes the mapping for `key`, returning it if it existed.
    pub fn remove(&mut self, key: K) -> Option<V> {
        let old = self.slots.get_mut(key.index()).and_then(Option::take);

        if old.is_some() {
            self.len -= 1;
        }

        old
    }

    /// Gets the value mapped to `key`.
    #[inline]
    pub fn get(&self, key: K) -> Option<&V> {
        self.slots.get(key.index()).and_then(Option::as_ref)
    }

    /// Gets the value mapped to `key` mutably.
    #[inline]
    pub fn get_mut(&mut self, key: K) -> Option<&mut V> {
        self.slots.get_mut(key.index()).and_then(Option::as_mut)
    }

    /// Gets the value mapped to `key`, inserting `f()` first if there is none.
    pub fn get_or_insert_with(&mut self, key: K, f: impl FnOnce() -> V) -> &mut V {
        if !self.contains(key) {
            self.insert(key, f());
        }

        self.get_mut(key).unwrap()
    }

    /// The number of keys that currently have a value.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether no key has a value.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Iterates over every `(key, value)` pair, in increasing key order.
    pub fn iter(&self) -> impl Iterator<Item = (K, &V)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, v)| v.as_ref().map(|v| (K::new(i), v)))
    }

    /// Iterates over every `(key, value)` pair with mutable values.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (K, &mut V)> + '_ {
        self.slots
            .iter_mut()
            .enumerate()
            .filter_map(|(i, v)| v.as_mut().map(|v| (K::new(i), v)))
    }

    /// Iterates over every key that has a value.
    pub fn keys(&self) -> impl Iterator<Item = K> + '_ {
        self.iter().map(|(k, _)| k)
    }

    /// Iterates over every value in the map.
    pub fn values(&self) -> impl Iterator<Item = &V> + '_ {
        self.slots.iter().filter_map(Option::as_ref)
    }
}

impl<K: ArenaKey, V> Default for SecondaryMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: ArenaKey, V> Index<K> for SecondaryMap<K, V> {
    type Output = V;

    #[inline]
    fn index(&self, key: K) -> &V {
        match self.get(key) {
            Some(v) => v,
            None => panic!("no value for key {key:?} in `SecondaryMap`"),
        }
    }
}

impl<K: ArenaKey, V> IndexMut<K> for SecondaryMap<K, V> {
    #[inline]
    fn index_mut(&mut self, key: K) -> &mut V {
        match self.get_mut(key) {
            Some(v) => v,
            None => panic!("no value for key {key:?} in `SecondaryMap`"),
        }
    }
}

impl<K: ArenaKey, V: Debug> Debug for SecondaryMap<K, V> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        crate::arena::debug_write_map(f, "SecondaryMap", self.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena_key;

    arena_key! { struct Key(u32); }

    #[test]
    fn insert_past_end_grows() {
        let mut map = SecondaryMap::<Key, &str>::new();

        assert_eq!(map.insert(Key::new(5), "r5"), None);
        assert_eq!(map.insert(Key::new(5), "r6"), Some("r5"));
        assert!(!map.contains(Key::new(4)));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn remove_updates_len() {
        let mut map = SecondaryMap::fill(3, 0u8);

        assert_eq!(map.len(), 3);
        assert_eq!(map.remove(Key::new(1)), Some(0));
        assert_eq!(map.remove(Key::new(1)), None);
        assert_eq!(map.len(), 2);
        assert_eq!(map.keys().map(|k| k.index()).collect::<Vec<_>>(), vec![0, 2]);
    }

    #[test]
    #[should_panic]
    fn indexing_missing_key_panics() {
        let map = SecondaryMap::<Key, u8>::new();

        let _ = map[Key::new(0)];
    }
}
