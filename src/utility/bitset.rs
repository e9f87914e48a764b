//======---------------------------------------------------------------======//
//                                                                           //
// Copyright 2022-2023 Evan Cox <evanacox00@gmail.com>. All rights reserved. //
//                                                                           //
// Use of this source code is governed by a BSD-style license that can be    //
// found in the LICENSE.txt file at the root of this project, or at the      //
// following link: https://opensource.org/licenses/BSD-3-Clause              //
//                                                                           //
//======---------------------------------------------------------------======//

use bitvec::order::Lsb0;
use bitvec::vec::BitVec;
use std::fmt;
use std::fmt::{Debug, Formatter};

/// A fixed-size set of dense integer ids, used for every dataflow vector.
///
/// The size is fixed at construction. Binary operations require both sides
/// to have the same size, and work a machine word at a time. Bits past
/// `len()` in the last storage word are always zero, none of the operations
/// here can set them.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct BitSet {
    bits: BitVec<u64, Lsb0>,
}

impl BitSet {
    /// Creates an empty set that can hold the ids `0..len`.
    pub fn new(len: usize) -> Self {
        Self {
            bits: BitVec::repeat(false, len),
        }
    }

    /// Creates a set that contains every id in `0..len`.
    pub fn full(len: usize) -> Self {
        Self {
            bits: BitVec::repeat(true, len),
        }
    }

    /// The number of ids the set can hold.
    #[inline]
    pub fn len(&self) -> usize {
        self.bits.len()
    }

    /// Whether the set has no room for any id.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    /// Whether `i` is in the set.
    #[inline]
    pub fn get(&self, i: usize) -> bool {
        self.bits[i]
    }

    /// Adds `i` to the set.
    #[inline]
    pub fn set(&mut self, i: usize) {
        self.bits.set(i, true);
    }

    /// Removes `i` from the set.
    #[inline]
    pub fn reset(&mut self, i: usize) {
        self.bits.set(i, false);
    }

    /// Sets the membership of `i` to `value`.
    #[inline]
    pub fn set_to(&mut self, i: usize, value: bool) {
        self.bits.set(i, value);
    }

    /// Adds the whole range `[start, end)` to the set.
    pub fn set_range(&mut self, start: usize, end: usize) {
        self.bits[start..end].fill(true);
    }

    /// Whether every id in `[start, end)` is in the set.
    pub fn all_in_range(&self, start: usize, end: usize) -> bool {
        self.bits[start..end].all()
    }

    /// Removes every id.
    pub fn clear(&mut self) {
        self.bits.fill(false);
    }

    /// Adds every id in `0..len`.
    pub fn set_all(&mut self) {
        self.bits.fill(true);
    }

    /// Whether no id is in the set.
    pub fn none(&self) -> bool {
        self.bits.not_any()
    }

    /// Whether at least one id is in the set.
    pub fn any(&self) -> bool {
        self.bits.any()
    }

    /// Number of ids in the set.
    pub fn count(&self) -> usize {
        self.bits.count_ones()
    }

    /// Iterates over the ids in the set in increasing order.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.bits.iter_ones()
    }

    /// `self = other`, returns whether `self` changed.
    pub fn assign(&mut self, other: &BitSet) -> bool {
        self.zip_words(other, |_, b| b)
    }

    /// `self |= other`, returns whether `self` changed.
    pub fn union_with(&mut self, other: &BitSet) -> bool {
        self.zip_words(other, |a, b| a | b)
    }

    /// `self &= other`, returns whether `self` changed.
    pub fn intersect_with(&mut self, other: &BitSet) -> bool {
        self.zip_words(other, |a, b| a & b)
    }

    /// `self -= other`, returns whether `self` changed.
    pub fn subtract(&mut self, other: &BitSet) -> bool {
        self.zip_words(other, |a, b| a & !b)
    }

    /// Whether `self` and `other` share any id.
    pub fn intersects(&self, other: &BitSet) -> bool {
        self.check_len(other);

        self.words()
            .iter()
            .zip(other.words())
            .any(|(a, b)| a & b != 0)
    }

    /// Whether every id in `self` is also in `other`.
    pub fn is_subset(&self, other: &BitSet) -> bool {
        self.check_len(other);

        self.words()
            .iter()
            .zip(other.words())
            .all(|(a, b)| a & !b == 0)
    }

    fn words(&self) -> &[u64] {
        self.bits.as_raw_slice()
    }

    fn check_len(&self, other: &BitSet) {
        assert_eq!(
            self.len(),
            other.len(),
            "bitset operation on sets of different sizes"
        );
    }

    fn zip_words(&mut self, other: &BitSet, op: impl Fn(u64, u64) -> u64) -> bool {
        self.check_len(other);

        let mut changed = false;

        for (a, b) in self
            .bits
            .as_raw_mut_slice()
            .iter_mut()
            .zip(other.bits.as_raw_slice())
        {
            let new = op(*a, *b);

            changed |= new != *a;
            *a = new;
        }

        changed
    }
}

impl Debug for BitSet {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_and_query() {
        let mut set = BitSet::new(130);

        set.set(0);
        set.set(64);
        set.set(129);

        assert!(set.get(64));
        assert!(!set.get(65));
        assert_eq!(set.count(), 3);
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![0, 64, 129]);

        set.reset(64);

        assert!(!set.get(64));
    }

    #[test]
    fn word_ops_report_changes() {
        let mut a = BitSet::new(70);
        let mut b = BitSet::new(70);

        a.set(1);
        b.set(1);
        b.set(69);

        assert!(a.union_with(&b));
        assert!(!a.union_with(&b));
        assert!(a.subtract(&b));
        assert!(a.none());
        assert!(!a.intersect_with(&b));
    }

    #[test]
    fn full_subtract_keeps_padding_clear() {
        let mut full = BitSet::full(3);
        let mut one = BitSet::new(3);

        one.set(2);
        full.subtract(&one);

        assert_eq!(full.count(), 2);
        assert!(full.is_subset(&BitSet::full(3)));
    }

    #[test]
    fn ranges() {
        let mut set = BitSet::new(32);

        set.set_range(4, 8);

        assert!(set.all_in_range(4, 8));
        assert!(!set.all_in_range(3, 8));
    }

    #[test]
    #[should_panic]
    fn mismatched_sizes_panic() {
        let mut a = BitSet::new(3);

        a.union_with(&BitSet::new(4));
    }
}
