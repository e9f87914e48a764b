//======---------------------------------------------------------------======//
//                                                                           //
// Copyright 2022 Evan Cox <evanacox00@gmail.com>. All rights reserved.      //
//                                                                           //
// Use of this source code is governed by a BSD-style license that can be    //
// found in the LICENSE.txt file at the root of this project, or at the      //
// following link: https://opensource.org/licenses/BSD-3-Clause              //
//                                                                           //
//======---------------------------------------------------------------======//

use std::fmt::{Debug, Formatter, Result};
use std::mem;

#[cfg(feature = "enable-serde")]
use serde::{Deserialize, Serialize};

/// Helper trait for a type that can be packed into a [`PackedOption`].
///
/// These types need to have some value that they can give up, that value
/// is used to distinguish between `None` and `Some`. Keys made with
/// [`dense_arena_key`](crate::dense_arena_key) reserve `u32::MAX`.
///
/// ```
/// # use opal::utility::*;
/// struct Row(u16);
///
/// impl Packable for Row {
///     fn reserved() -> Self {
///         Row(u16::MAX)
///     }
///
///     fn is_reserved(&self) -> bool {
///         self.0 == u16::MAX
///     }
/// }
///
/// let opt = PackedOption::some(Row(15));
///
/// assert!(opt.is_some());
/// ```
pub trait Packable {
    /// Returns the value that stands in for `None`.
    fn reserved() -> Self;

    /// Checks whether `self` is the value returned by [`Self::reserved`].
    fn is_reserved(&self) -> bool;
}

/// An [`Option`]-like type that takes exactly as much space as `T`.
///
/// Blocks store their physical-layout neighbors with this, since every
/// block has two of them and most of them are `Some`.
#[derive(Clone, Copy, PartialEq, PartialOrd, Eq, Ord, Hash)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct PackedOption<T: Packable>(T);

impl<T: Packable> PackedOption<T> {
    /// Creates a `None` instance of `PackedOption`.
    #[inline]
    pub fn none() -> Self {
        Self(T::reserved())
    }

    /// Creates a `Some` instance of `PackedOption`. Panics if `value`
    /// is the reserved value.
    #[inline]
    pub fn some(value: T) -> Self {
        assert!(!value.is_reserved(), "cannot pack the reserved value");

        Self(value)
    }

    /// Returns `true` if the packed option is a `None` value.
    #[inline]
    pub fn is_none(&self) -> bool {
        self.0.is_reserved()
    }

    /// Returns `true` if the packed option is a `Some` value.
    #[inline]
    pub fn is_some(&self) -> bool {
        !self.is_none()
    }

    /// Expand the packed option into a normal `Option` that can
    /// be pattern-matched on as expected.
    #[inline]
    pub fn expand(self) -> Option<T> {
        if self.is_none() {
            None
        } else {
            Some(self.0)
        }
    }

    /// Maps a `PackedOption<T>` to `Option<U>` by applying a function to a contained value.
    #[inline]
    pub fn map<U, F>(self, f: F) -> Option<U>
    where
        F: FnOnce(T) -> U,
    {
        self.expand().map(f)
    }

    /// Takes the value out of the packed option, leaving a `None` in its place.
    ///
    /// ```
    /// # use opal::utility::*;
    /// # #[derive(Debug, PartialEq)]
    /// # struct Row(u16);
    /// # impl Packable for Row {
    /// #     fn reserved() -> Self { Row(u16::MAX) }
    /// #     fn is_reserved(&self) -> bool { self.0 == u16::MAX }
    /// # }
    /// let mut opt = PackedOption::some(Row(3));
    /// assert_eq!(opt.take(), Some(Row(3)));
    /// assert!(opt.is_none());
    /// ```
    #[inline]
    pub fn take(&mut self) -> Option<T> {
        mem::replace(self, Self::none()).expand()
    }
}

impl<T: Packable> Default for PackedOption<T> {
    fn default() -> Self {
        Self::none()
    }
}

impl<T: Packable> From<Option<T>> for PackedOption<T> {
    fn from(opt: Option<T>) -> Self {
        match opt {
            None => Self::none(),
            Some(t) => Self::some(t),
        }
    }
}

impl<T: Packable> From<PackedOption<T>> for Option<T> {
    fn from(packed: PackedOption<T>) -> Self {
        packed.expand()
    }
}

impl<T> Debug for PackedOption<T>
where
    T: Packable + Debug,
{
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        match &self.0 {
            v if v.is_reserved() => f.write_str("None"),
            v => f.debug_tuple("Some").field(v).finish(),
        }
    }
}
