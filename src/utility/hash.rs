//======---------------------------------------------------------------======//
//                                                                           //
// Copyright 2022-2023 Evan Cox <evanacox00@gmail.com>. All rights reserved. //
//                                                                           //
// Use of this source code is governed by a BSD-style license that can be    //
// found in the LICENSE.txt file at the root of this project, or at the      //
// following link: https://opensource.org/licenses/BSD-3-Clause              //
//                                                                           //
//======---------------------------------------------------------------======//

use std::collections::{HashMap, HashSet};

/// Alias for `std::collections::HashMap<K, V, ahash::RandomState>`. Almost
/// every key in the allocator is a small integer-like key, which `ahash`
/// is much faster at than SipHash.
pub type SaHashMap<K, V> = HashMap<K, V, ahash::RandomState>;

/// Alias for `std::collections::HashSet<V, ahash::RandomState>`, see [`SaHashMap`].
pub type SaHashSet<V> = HashSet<V, ahash::RandomState>;

/// Creates an empty [`SaHashMap`] with room for `cap` entries.
#[inline]
pub fn sa_map_with_capacity<K, V>(cap: usize) -> SaHashMap<K, V> {
    HashMap::with_capacity_and_hasher(cap, ahash::RandomState::new())
}

/// Creates an empty [`SaHashSet`] with room for `cap` entries.
#[inline]
pub fn sa_set_with_capacity<V>(cap: usize) -> SaHashSet<V> {
    HashSet::with_capacity_and_hasher(cap, ahash::RandomState::new())
}
