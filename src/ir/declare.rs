//======---------------------------------------------------------------======//
//                                                                           //
// Copyright 2022-2023 Evan Cox <evanacox00@gmail.com>. All rights reserved. //
//                                                                           //
// Use of this source code is governed by a BSD-style license that can be    //
// found in the LICENSE.txt file at the root of this project, or at the      //
// following link: https://opensource.org/licenses/BSD-3-Clause              //
//                                                                           //
//======---------------------------------------------------------------======//

use crate::arena::{ArenaMap, Keys};
use crate::dense_arena_key;
use crate::ir::ElemType;
use crate::target::{GRF_BYTES, GRF_WORDS};
use std::fmt;
use std::ops::{Index, IndexMut};

#[cfg(feature = "enable-serde")]
use serde::{Deserialize, Serialize};

dense_arena_key! {
    /// A reference to a variable in a kernel's [`DeclareTable`].
    pub struct Declare;
}

/// The register file a declare lives in.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub enum RegFile {
    /// General register file.
    Grf,
    /// Address register sub-registers (`a0.N`).
    Address,
    /// Flag register sub-registers (`f0.0`, `f0.1`, ...).
    Flag,
}

/// Alignment requirement on the first GRF row of a declare.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub enum GrfAlign {
    /// Any row.
    Any,
    /// An even row.
    Even,
    /// An odd row.
    Odd,
}

impl GrfAlign {
    /// Whether row `reg` satisfies the alignment.
    #[inline]
    pub fn accepts(self, reg: u32) -> bool {
        match self {
            GrfAlign::Any => true,
            GrfAlign::Even => reg % 2 == 0,
            GrfAlign::Odd => reg % 2 == 1,
        }
    }
}

/// Alignment requirement on the first word of a declare inside a row.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Ord, PartialOrd, Hash)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub enum SubRegAlign {
    /// Any word.
    Word,
    /// Every 2 words.
    Dword,
    /// Every 4 words.
    Qword,
    /// Every 8 words.
    HalfGrf,
    /// The start of a row.
    Grf,
}

impl SubRegAlign {
    /// The alignment step, in words.
    #[inline]
    pub fn words(self) -> u32 {
        match self {
            SubRegAlign::Word => 1,
            SubRegAlign::Dword => 2,
            SubRegAlign::Qword => 4,
            SubRegAlign::HalfGrf => 8,
            SubRegAlign::Grf => GRF_WORDS,
        }
    }

    /// The natural alignment for an element type.
    pub fn natural(ty: ElemType) -> SubRegAlign {
        match ty.size() {
            1 | 2 => SubRegAlign::Word,
            4 => SubRegAlign::Dword,
            _ => SubRegAlign::Qword,
        }
    }
}

/// A physical location.
///
/// For GRF declares `reg` is the row and `sub_word` the 16-bit word inside
/// of the row. For address declares `reg` is always 0 and `sub_word` is the
/// first address sub-register. For flags `reg` is the flag register and
/// `sub_word` is the 16-bit half of it.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Ord, PartialOrd, Hash)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct PhysReg {
    /// The register number.
    pub reg: u32,
    /// The word offset inside of the register.
    pub sub_word: u32,
}

impl PhysReg {
    /// Creates a location.
    #[inline]
    pub const fn new(reg: u32, sub_word: u32) -> Self {
        Self { reg, sub_word }
    }

    /// The absolute byte address of the location in a GRF-like file.
    #[inline]
    pub fn byte_addr(self) -> u32 {
        self.reg * GRF_BYTES + self.sub_word * 2
    }
}

impl fmt::Display for PhysReg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}.{}", self.reg, self.sub_word)
    }
}

/// All of the information about a single variable.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct DeclareData {
    /// Name, only used for printing.
    pub name: String,
    /// The register file the variable lives in.
    pub file: RegFile,
    /// Element type.
    pub ty: ElemType,
    /// Number of elements.
    pub num_elems: u32,
    /// Row alignment.
    pub grf_align: GrfAlign,
    /// Word alignment inside of the first row.
    pub sub_align: SubRegAlign,
    /// When set, this declare is a view into another declare at a byte offset.
    pub alias: Option<(Declare, u32)>,
    /// Scope id, 0 is the kernel scope.
    pub scope: u32,
    /// Whether the variable holds a value on kernel entry.
    pub is_input: bool,
    /// Whether the variable is the payload of an EOT send.
    pub eot: bool,
    /// Whether the variable was spilled to scratch memory.
    pub spilled: bool,
    /// Whether the variable was split into smaller pieces.
    pub split: bool,
    /// Whether `&var` appears anywhere in the kernel.
    pub addr_taken: bool,
    /// Whether the variable must live in callee-saved rows (no wraparound).
    pub callee_save: bool,
    /// A location decided before allocation, such as a payload register.
    pub fixed: Option<PhysReg>,
    /// The location picked by the allocator.
    pub phys: Option<PhysReg>,
}

impl DeclareData {
    /// Creates a plain GRF variable with natural alignment.
    pub fn grf(name: impl Into<String>, ty: ElemType, num_elems: u32) -> Self {
        Self::new(name, RegFile::Grf, ty, num_elems)
    }

    /// Creates a variable in any file with default properties.
    pub fn new(name: impl Into<String>, file: RegFile, ty: ElemType, num_elems: u32) -> Self {
        assert!(num_elems > 0, "declare must have at least one element");

        Self {
            name: name.into(),
            file,
            ty,
            num_elems,
            grf_align: GrfAlign::Any,
            sub_align: SubRegAlign::natural(ty),
            alias: None,
            scope: 0,
            is_input: false,
            eot: false,
            spilled: false,
            split: false,
            addr_taken: false,
            callee_save: false,
            fixed: None,
            phys: None,
        }
    }

    /// Total size in bytes.
    #[inline]
    pub fn byte_size(&self) -> u32 {
        self.ty.size() * self.num_elems
    }

    /// Size in 16-bit words, rounded up.
    #[inline]
    pub fn num_words(&self) -> u32 {
        (self.byte_size() + 1) / 2
    }

    /// Number of GRF rows covered, rounded up.
    #[inline]
    pub fn num_rows(&self) -> u32 {
        (self.byte_size() + GRF_BYTES - 1) / GRF_BYTES
    }

    /// Whether the declare fits into part of a single row.
    #[inline]
    pub fn is_sub_row(&self) -> bool {
        self.byte_size() < GRF_BYTES
    }

    /// Either the fixed location or the allocated one.
    #[inline]
    pub fn location(&self) -> Option<PhysReg> {
        self.fixed.or(self.phys)
    }
}

/// Owns every declare of a kernel.
#[derive(Clone, Debug, Default)]
pub struct DeclareTable {
    decls: ArenaMap<Declare, DeclareData>,
}

impl DeclareTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a declare.
    pub fn create(&mut self, data: DeclareData) -> Declare {
        if let Some((parent, offset)) = data.alias {
            let parent_size = self.decls[parent].byte_size();

            assert!(
                offset + data.byte_size() <= parent_size,
                "alias '{}' does not fit inside of its parent",
                data.name
            );
            assert_eq!(data.file, self.decls[parent].file, "alias changes file");
        }

        self.decls.insert(data)
    }

    /// Creates an alias of `parent` at byte offset `offset` with a new type.
    pub fn create_alias(
        &mut self,
        name: impl Into<String>,
        parent: Declare,
        offset: u32,
        ty: ElemType,
        num_elems: u32,
    ) -> Declare {
        let mut data = DeclareData::new(name, self.decls[parent].file, ty, num_elems);

        data.alias = Some((parent, offset));
        data.scope = self.decls[parent].scope;

        self.create(data)
    }

    /// Walks the alias chain up to the declare that owns the storage.
    pub fn root(&self, decl: Declare) -> Declare {
        self.root_offset(decl).0
    }

    /// Walks the alias chain, returning the root and the accumulated
    /// byte offset of `decl` inside of it.
    pub fn root_offset(&self, mut decl: Declare) -> (Declare, u32) {
        let mut offset = 0;

        while let Some((parent, off)) = self.decls[decl].alias {
            decl = parent;
            offset += off;
        }

        (decl, offset)
    }

    /// Whether `decl` is an alias of something else.
    #[inline]
    pub fn is_alias(&self, decl: Declare) -> bool {
        self.decls[decl].alias.is_some()
    }

    /// Number of declares, including aliases.
    #[inline]
    pub fn len(&self) -> usize {
        self.decls.len()
    }

    /// Whether the table is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.decls.is_empty()
    }

    /// Every declare key, in creation order.
    pub fn keys(&self) -> Keys<Declare> {
        self.decls.keys()
    }

    /// Every root declare (non-alias) of a given file.
    pub fn roots_in(&self, file: RegFile) -> impl Iterator<Item = Declare> + '_ {
        self.decls
            .iter()
            .filter(move |(_, d)| d.alias.is_none() && d.file == file)
            .map(|(k, _)| k)
    }

    /// Iterates over `(key, data)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (Declare, &DeclareData)> + '_ {
        self.decls.iter()
    }

    /// The location of `decl` (alias or not) with its offset resolved,
    /// if the root has one.
    pub fn location(&self, decl: Declare) -> Option<PhysReg> {
        let (root, offset) = self.root_offset(decl);
        let base = self.decls[root].location()?;

        match self.decls[root].file {
            RegFile::Grf => {
                let byte = base.byte_addr() + offset;

                Some(PhysReg::new(byte / GRF_BYTES, (byte % GRF_BYTES) / 2))
            }
            _ => Some(PhysReg::new(base.reg, base.sub_word + offset / 2)),
        }
    }
}

impl Index<Declare> for DeclareTable {
    type Output = DeclareData;

    fn index(&self, key: Declare) -> &DeclareData {
        &self.decls[key]
    }
}

impl IndexMut<Declare> for DeclareTable {
    fn index_mut(&mut self, key: Declare) -> &mut DeclareData {
        &mut self.decls[key]
    }
}
