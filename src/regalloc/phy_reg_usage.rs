//======---------------------------------------------------------------======//
//                                                                           //
// Copyright 2022-2023 Evan Cox <evanacox00@gmail.com>. All rights reserved. //
//                                                                           //
// Use of this source code is governed by a BSD-style license that can be    //
// found in the LICENSE.txt file at the root of this project, or at the      //
// following link: https://opensource.org/licenses/BSD-3-Clause              //
//                                                                           //
//======---------------------------------------------------------------======//

use crate::ir::{DeclareData, GrfAlign, Kernel, PhysReg, RegFile, SubRegAlign};
use crate::target::GRF_WORDS;
use log::trace;
use static_assertions::const_assert_eq;

const FULL_ROW: u16 = u16::MAX;

// one bit per word of a row
const_assert_eq!(GRF_WORDS, u16::BITS);

/// Number of rows at the top of the usable file that an EOT payload is
/// bound to.
pub const EOT_ROWS: u32 = 16;

/// The bank-conflict class of a variable.
///
/// Operands of one instruction read from different banks can be fetched
/// in parallel. Variables in the first half are placed upward from r0 and
/// variables in the second half downward from the top, and the parity of
/// the start row picks the bank.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum BankClass {
    /// No preference.
    None,
    /// First half, even start row.
    FirstEven,
    /// First half, odd start row.
    FirstOdd,
    /// Second half, even start row.
    SecondEven,
    /// Second half, odd start row.
    SecondOdd,
}

impl BankClass {
    /// The class that conflicts least with `self`.
    pub fn opposite(self) -> BankClass {
        match self {
            BankClass::None => BankClass::None,
            BankClass::FirstEven => BankClass::SecondOdd,
            BankClass::FirstOdd => BankClass::SecondEven,
            BankClass::SecondEven => BankClass::FirstOdd,
            BankClass::SecondOdd => BankClass::FirstEven,
        }
    }

    fn is_first_half(self) -> bool {
        matches!(self, BankClass::FirstEven | BankClass::FirstOdd)
    }

    fn parity(self) -> GrfAlign {
        match self {
            BankClass::None => GrfAlign::Any,
            BankClass::FirstEven | BankClass::SecondEven => GrfAlign::Even,
            BankClass::FirstOdd | BankClass::SecondOdd => GrfAlign::Odd,
        }
    }
}

/// Everything needed to pick a location for one variable.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RegRequest {
    /// The register file.
    pub file: RegFile,
    /// Rows needed, for whole-row GRF requests.
    pub num_rows: u32,
    /// Words needed, for sub-row GRF, address and flag requests.
    pub num_words: u32,
    /// Start row alignment.
    pub grf_align: GrfAlign,
    /// Start word alignment inside of a row.
    pub sub_align: SubRegAlign,
    /// Bank preference.
    pub bank: BankClass,
    /// Must be bound to the last rows of the file.
    pub eot: bool,
    /// Must be placed in callee-saved rows.
    pub callee_save: bool,
}

impl RegRequest {
    /// The request for a declare's whole storage.
    pub fn for_declare(data: &DeclareData) -> Self {
        Self {
            file: data.file,
            num_rows: data.num_rows(),
            num_words: data.num_words(),
            grf_align: data.grf_align,
            sub_align: data.sub_align,
            bank: BankClass::None,
            eot: data.eot,
            callee_save: data.callee_save,
        }
    }

    /// Returns a copy with a bank preference.
    pub fn with_bank(mut self, bank: BankClass) -> Self {
        self.bank = bank;
        self
    }

    /// Whether the request fits inside a single row.
    pub fn is_sub_row(&self) -> bool {
        self.file == RegFile::Grf
            && self.num_words < GRF_WORDS
            && self.sub_align != SubRegAlign::Grf
    }

    fn biased(&self) -> bool {
        self.eot || self.callee_save
    }
}

/// Tracks which physical registers are busy while allocating.
///
/// GRF rows are tracked a 16-bit word at a time, so sub-row variables can
/// share a row. Rows at or above `top` (the reservations) are never
/// handed out.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PhyRegUsage {
    rows: Vec<u16>,
    top: u32,
    addr: Vec<bool>,
    flags: Vec<bool>,
    round_robin: bool,
    eot_binding: bool,
    next_row: u32,
    // the first bank is [0, bank1_end), the second [bank2_start, top)
    bank1_end: u32,
    bank2_start: u32,
}

impl PhyRegUsage {
    /// Creates the usage for `kernel`, with its reservations already
    /// removed from the file.
    pub fn new(kernel: &Kernel) -> Self {
        let total = kernel.total_grf();
        let reserved = kernel.options.reservations.total();

        assert!(
            reserved < total,
            "{reserved} reserved rows leave nothing of a {total} row file"
        );

        let mut usage = Self::with_limits(
            total,
            total - reserved,
            kernel.target.addr_sub_regs(),
            kernel.target.flag_regs(),
        );

        usage.round_robin = kernel.options.round_robin;
        usage.eot_binding = kernel.options.reservations.eot_binding;
        usage
    }

    /// Creates a usage with explicit limits, first-fit and no EOT binding.
    pub fn with_limits(total_grf: u32, top: u32, addr_sub_regs: u32, flag_regs: u32) -> Self {
        debug_assert!(top <= total_grf);

        Self {
            rows: vec![0; total_grf as usize],
            top,
            addr: vec![false; addr_sub_regs as usize],
            // every flag register is two words
            flags: vec![false; flag_regs as usize * 2],
            round_robin: false,
            eot_binding: false,
            next_row: 0,
            bank1_end: 0,
            bank2_start: top,
        }
    }

    /// Turns round-robin search on or off.
    pub fn set_round_robin(&mut self, on: bool) {
        self.round_robin = on;
    }

    /// Turns EOT binding on or off.
    pub fn set_eot_binding(&mut self, on: bool) {
        self.eot_binding = on;
    }

    /// The first row that is never handed out.
    pub fn top(&self) -> u32 {
        self.top
    }

    /// Whether every word of `row` is free.
    #[inline]
    pub fn is_row_free(&self, row: u32) -> bool {
        self.rows[row as usize] == 0
    }

    /// The busy-word mask of `row`.
    #[inline]
    pub fn row_mask(&self, row: u32) -> u16 {
        self.rows[row as usize]
    }

    fn callee_save_start(&self) -> u32 {
        self.top / 2
    }

    /// First-fit search for `num_rows` free rows starting at an aligned row
    /// in `[start, end)`.
    pub fn find_contiguous_grf(
        &self,
        num_rows: u32,
        align: GrfAlign,
        start: u32,
        end: u32,
    ) -> Option<u32> {
        let mut row = start;

        while row + num_rows <= end {
            if align.accepts(row) && (row..row + num_rows).all(|r| self.is_row_free(r)) {
                return Some(row);
            }

            row += 1;
        }

        None
    }

    // where a search starts, and whether it may wrap around to 0
    fn search_start(&self, req: &RegRequest) -> (u32, bool) {
        if req.eot && self.eot_binding {
            (self.top.saturating_sub(EOT_ROWS), false)
        } else if req.callee_save {
            (self.callee_save_start(), false)
        } else if self.round_robin {
            (self.next_row, true)
        } else {
            (0, false)
        }
    }

    /// Finds free rows for a whole-row request. Round-robin searches start
    /// after the last allocation and retry from r0 on failure. EOT and
    /// callee-save requests search their window only.
    pub fn find_free_regs(&self, req: &RegRequest) -> Option<u32> {
        let (start, may_wrap) = self.search_start(req);

        match self.find_contiguous_grf(req.num_rows, req.grf_align, start, self.top) {
            None if may_wrap && start > 0 => {
                self.find_contiguous_grf(req.num_rows, req.grf_align, 0, self.top)
            }
            found => found,
        }
    }

    /// Finds `num_words` free words in a row mask, at a multiple of
    /// `align_words`.
    pub fn find_contiguous_words(mask: u16, num_words: u32, align_words: u32) -> Option<u32> {
        debug_assert!(num_words > 0 && num_words <= GRF_WORDS);

        let want = ((1u32 << num_words) - 1) as u16;
        let mut word = 0;

        while word + num_words <= GRF_WORDS {
            if mask & (want << word) == 0 {
                return Some(word);
            }

            word += align_words.max(1);
        }

        None
    }

    /// Finds room for a sub-row request. Rows that are already partially
    /// occupied are tried first so whole rows stay free for bigger
    /// variables.
    pub fn find_grf_sub_reg(&self, req: &RegRequest) -> Option<PhysReg> {
        let (start, _) = self.search_start(req);
        let lo = if req.biased() { start } else { 0 };

        for row in lo..self.top {
            let mask = self.rows[row as usize];

            if mask == 0 || mask == FULL_ROW || !req.grf_align.accepts(row) {
                continue;
            }

            if let Some(word) =
                Self::find_contiguous_words(mask, req.num_words, req.sub_align.words())
            {
                return Some(PhysReg::new(row, word));
            }
        }

        let row = self.find_free_regs(&RegRequest { num_rows: 1, ..*req })?;

        Some(PhysReg::new(row, 0))
    }

    fn bank_parity(&self, req: &RegRequest) -> GrfAlign {
        match req.grf_align {
            GrfAlign::Any => req.bank.parity(),
            align => align,
        }
    }

    /// Finds rows for a request with a bank preference. First-half
    /// requests grow upward from r0 and may not reach the second bank,
    /// second-half requests grow downward from the top and may not reach
    /// the first bank.
    pub fn find_contiguous_grf_from_banks(&self, req: &RegRequest) -> Option<u32> {
        let n = req.num_rows;
        let parity = self.bank_parity(req);

        if req.bank.is_first_half() {
            return self.find_contiguous_grf(n, parity, 0, self.bank2_start);
        }

        let mut row = self.top.checked_sub(n)?;

        loop {
            if row < self.bank1_end {
                return None;
            }

            if parity.accepts(row) && (row..row + n).all(|r| self.is_row_free(r)) {
                return Some(row);
            }

            row = row.checked_sub(1)?;
        }
    }

    /// The sub-row version of [`Self::find_contiguous_grf_from_banks`].
    pub fn find_grf_sub_reg_from_banks(&self, req: &RegRequest) -> Option<PhysReg> {
        let parity = self.bank_parity(req);
        let words = |row: u32| -> Option<PhysReg> {
            let mask = self.rows[row as usize];

            if mask == 0 || mask == FULL_ROW || !parity.accepts(row) {
                return None;
            }

            Self::find_contiguous_words(mask, req.num_words, req.sub_align.words())
                .map(|w| PhysReg::new(row, w))
        };

        let partial = if req.bank.is_first_half() {
            (0..self.bank2_start).find_map(words)
        } else {
            (self.bank1_end..self.top).rev().find_map(words)
        };

        if partial.is_some() {
            return partial;
        }

        let row = self.find_contiguous_grf_from_banks(&RegRequest { num_rows: 1, ..*req })?;

        Some(PhysReg::new(row, 0))
    }

    fn find_words(slots: &[bool], num_words: u32, align: u32) -> Option<u32> {
        let n = num_words as usize;
        let mut i = 0;

        while i + n <= slots.len() {
            if slots[i..i + n].iter().all(|busy| !busy) {
                return Some(i as u32);
            }

            i += align.max(1) as usize;
        }

        None
    }

    /// Picks a location for `req` and marks it busy. Returns `None`, with
    /// no state change, if nothing fits.
    pub fn assign_regs(&mut self, req: &RegRequest) -> Option<PhysReg> {
        let loc = match req.file {
            RegFile::Address => {
                if req.num_words as usize > self.addr.len() {
                    panic!(
                        "{} address sub-registers requested, the target only has {}",
                        req.num_words,
                        self.addr.len()
                    );
                }

                let sub = Self::find_words(&self.addr, req.num_words, req.sub_align.words())?;

                PhysReg::new(0, sub)
            }
            RegFile::Flag => {
                // a two-word flag takes a whole flag register
                let align = if req.num_words > 1 { 2 } else { 1 };
                let word = Self::find_words(&self.flags, req.num_words, align)?;

                PhysReg::new(word / 2, word % 2)
            }
            RegFile::Grf => {
                let use_banks = req.bank != BankClass::None && !req.biased();
                let banked = match (use_banks, req.is_sub_row()) {
                    (false, _) => None,
                    (true, true) => self.find_grf_sub_reg_from_banks(req),
                    (true, false) => self
                        .find_contiguous_grf_from_banks(req)
                        .map(|r| PhysReg::new(r, 0)),
                };

                let loc = match banked {
                    Some(loc) => {
                        let rows = if req.is_sub_row() { 1 } else { req.num_rows };

                        if req.bank.is_first_half() {
                            self.bank1_end = self.bank1_end.max(loc.reg + rows);
                        } else {
                            self.bank2_start = self.bank2_start.min(loc.reg);
                        }

                        loc
                    }
                    // the bias is only a preference, a full bank does not fail the request
                    None if req.is_sub_row() => self.find_grf_sub_reg(req)?,
                    None => PhysReg::new(self.find_free_regs(req)?, 0),
                };

                if self.round_robin && !req.biased() {
                    let rows = if req.is_sub_row() { 1 } else { req.num_rows };

                    self.next_row = (loc.reg + rows) % self.top;
                }

                loc
            }
        };

        trace!("assigned {loc} for {req:?}");

        self.mark_busy(loc, req);
        Some(loc)
    }

    /// Marks the storage of `req` placed at `loc` as busy.
    pub fn mark_busy(&mut self, loc: PhysReg, req: &RegRequest) {
        self.set_busy(loc, req, true);
    }

    /// Returns the storage of `req` placed at `loc` to the pool.
    pub fn free_regs(&mut self, loc: PhysReg, req: &RegRequest) {
        self.set_busy(loc, req, false);
    }

    /// Whether any part of the storage of `req` at `loc` is busy.
    pub fn is_busy(&self, loc: PhysReg, req: &RegRequest) -> bool {
        match req.file {
            RegFile::Address => (loc.sub_word..loc.sub_word + req.num_words)
                .any(|w| self.addr.get(w as usize).copied().unwrap_or(true)),
            RegFile::Flag => {
                let first = loc.reg * 2 + loc.sub_word;

                (first..first + req.num_words)
                    .any(|w| self.flags.get(w as usize).copied().unwrap_or(true))
            }
            RegFile::Grf => self
                .grf_masks(loc, req)
                .any(|(row, mask)| self.rows.get(row as usize).map_or(true, |m| m & mask != 0)),
        }
    }

    // (row, words) pairs covered by `req` at `loc`
    fn grf_masks(&self, loc: PhysReg, req: &RegRequest) -> impl Iterator<Item = (u32, u16)> {
        let first_words = if req.is_sub_row() {
            ((1u32 << req.num_words) - 1) << loc.sub_word
        } else {
            u32::from(FULL_ROW)
        };
        let rows = if req.is_sub_row() { 1 } else { req.num_rows };

        (loc.reg..loc.reg + rows).map(move |r| {
            if r == loc.reg {
                (r, first_words as u16)
            } else {
                (r, FULL_ROW)
            }
        })
    }

    fn set_busy(&mut self, loc: PhysReg, req: &RegRequest, busy: bool) {
        match req.file {
            RegFile::Address => {
                for w in loc.sub_word..loc.sub_word + req.num_words {
                    self.addr[w as usize] = busy;
                }
            }
            RegFile::Flag => {
                let first = loc.reg * 2 + loc.sub_word;

                for w in first..first + req.num_words {
                    self.flags[w as usize] = busy;
                }
            }
            RegFile::Grf => {
                let masks: Vec<(u32, u16)> = self.grf_masks(loc, req).collect();

                for (row, mask) in masks {
                    let slot = &mut self.rows[row as usize];

                    if busy {
                        *slot |= mask;
                    } else {
                        *slot &= !mask;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::ElemType;

    fn rows(n: u32, align: GrfAlign) -> RegRequest {
        RegRequest {
            num_rows: n,
            num_words: n * GRF_WORDS,
            grf_align: align,
            ..RegRequest::for_declare(&DeclareData::grf("V", ElemType::F, 8 * n))
        }
    }

    fn words(n: u32, align: SubRegAlign) -> RegRequest {
        RegRequest {
            num_rows: 1,
            num_words: n,
            sub_align: align,
            ..RegRequest::for_declare(&DeclareData::grf("V", ElemType::UW, n))
        }
    }

    #[test]
    fn even_request_fails_with_only_odd_start() {
        let mut usage = PhyRegUsage::with_limits(8, 8, 16, 2);

        for r in [0, 1, 2, 5, 6, 7] {
            usage.mark_busy(PhysReg::new(r, 0), &rows(1, GrfAlign::Any));
        }

        let before = usage.clone();

        assert_eq!(usage.assign_regs(&rows(2, GrfAlign::Even)), None);
        assert_eq!(usage, before);

        assert_eq!(usage.assign_regs(&rows(2, GrfAlign::Any)), Some(PhysReg::new(3, 0)));
        assert!(!usage.is_row_free(4));
    }

    #[test]
    fn round_robin_wraps_around() {
        let mut usage = PhyRegUsage::with_limits(8, 8, 16, 2);

        usage.set_round_robin(true);

        assert_eq!(usage.assign_regs(&rows(4, GrfAlign::Any)), Some(PhysReg::new(0, 0)));
        assert_eq!(usage.assign_regs(&rows(2, GrfAlign::Any)), Some(PhysReg::new(4, 0)));
        usage.free_regs(PhysReg::new(0, 0), &rows(4, GrfAlign::Any));

        // only r6..r7 is free after r4, so the search retries from r0
        assert_eq!(usage.assign_regs(&rows(3, GrfAlign::Any)), Some(PhysReg::new(0, 0)));
        assert_eq!(usage.assign_regs(&rows(2, GrfAlign::Any)), Some(PhysReg::new(6, 0)));
    }

    #[test]
    fn sub_rows_share_partial_rows_first() {
        let mut usage = PhyRegUsage::with_limits(4, 4, 16, 2);

        let a = usage.assign_regs(&words(3, SubRegAlign::Word)).unwrap();
        let b = usage.assign_regs(&words(2, SubRegAlign::Dword)).unwrap();
        let c = usage.assign_regs(&words(8, SubRegAlign::HalfGrf)).unwrap();

        assert_eq!(a, PhysReg::new(0, 0));
        assert_eq!(b, PhysReg::new(0, 4));
        assert_eq!(c, PhysReg::new(0, 8));
        assert_eq!(usage.row_mask(0), 0xff37);

        // nothing left in r0 that is 8-word aligned
        assert_eq!(
            usage.assign_regs(&words(8, SubRegAlign::HalfGrf)),
            Some(PhysReg::new(1, 0))
        );
    }

    #[test]
    fn contiguous_words() {
        assert_eq!(PhyRegUsage::find_contiguous_words(0b0000_0000_0000_0111, 2, 2), Some(4));
        assert_eq!(PhyRegUsage::find_contiguous_words(0b0000_0000_0000_0111, 1, 1), Some(3));
        assert_eq!(PhyRegUsage::find_contiguous_words(0xffff, 1, 1), None);
        assert_eq!(PhyRegUsage::find_contiguous_words(0, 16, 16), Some(0));
    }

    #[test]
    fn banks_grow_toward_each_other() {
        let mut usage = PhyRegUsage::with_limits(8, 8, 16, 2);
        let first = rows(2, GrfAlign::Any).with_bank(BankClass::FirstEven);
        let second = rows(2, GrfAlign::Any).with_bank(BankClass::SecondOdd);

        assert_eq!(usage.find_contiguous_grf_from_banks(&first), Some(0));
        assert_eq!(usage.assign_regs(&first), Some(PhysReg::new(0, 0)));
        assert_eq!(usage.assign_regs(&second), Some(PhysReg::new(5, 0)));
        assert_eq!(usage.assign_regs(&first), Some(PhysReg::new(2, 0)));

        // the first bank ends at r4 and the second starts at r5, a two-row
        // request from either side would cross
        assert_eq!(usage.find_contiguous_grf_from_banks(&first), None);
        assert_eq!(usage.find_contiguous_grf_from_banks(&second), None);
    }

    #[test]
    fn full_banks_fall_back_to_any_free_row() {
        let mut usage = PhyRegUsage::with_limits(8, 8, 16, 2);
        let first = |n| rows(n, GrfAlign::Any).with_bank(BankClass::FirstEven);
        let second = rows(2, GrfAlign::Any).with_bank(BankClass::SecondOdd);

        assert_eq!(usage.assign_regs(&second), Some(PhysReg::new(5, 0)));
        assert_eq!(usage.assign_regs(&first(2)), Some(PhysReg::new(0, 0)));
        assert_eq!(usage.assign_regs(&first(2)), Some(PhysReg::new(2, 0)));
        assert_eq!(usage.assign_regs(&first(1)), Some(PhysReg::new(4, 0)));

        // the first bank is full, r7 is only reachable without the bias
        assert_eq!(usage.find_contiguous_grf_from_banks(&first(1)), None);
        assert_eq!(usage.assign_regs(&first(1)), Some(PhysReg::new(7, 0)));
    }

    #[test]
    fn eot_binds_to_the_top() {
        let mut usage = PhyRegUsage::with_limits(32, 32, 16, 2);
        let eot = RegRequest {
            eot: true,
            ..rows(1, GrfAlign::Any)
        };

        usage.set_eot_binding(true);

        assert_eq!(usage.assign_regs(&eot), Some(PhysReg::new(16, 0)));

        // the window is full, no wraparound
        for r in 17..32 {
            usage.mark_busy(PhysReg::new(r, 0), &rows(1, GrfAlign::Any));
        }

        assert_eq!(usage.assign_regs(&eot), None);
    }

    #[test]
    fn address_and_flags() {
        let mut usage = PhyRegUsage::with_limits(4, 4, 16, 2);
        let mut addr = words(4, SubRegAlign::Word);
        let mut flag = words(1, SubRegAlign::Word);

        addr.file = RegFile::Address;
        flag.file = RegFile::Flag;

        assert_eq!(usage.assign_regs(&addr), Some(PhysReg::new(0, 0)));
        assert_eq!(usage.assign_regs(&addr), Some(PhysReg::new(0, 4)));
        assert_eq!(usage.assign_regs(&flag), Some(PhysReg::new(0, 0)));

        flag.num_words = 2;
        assert_eq!(usage.assign_regs(&flag), Some(PhysReg::new(1, 0)));
        assert_eq!(usage.assign_regs(&flag), None);
    }

    #[test]
    #[should_panic(expected = "address sub-registers")]
    fn too_many_address_registers_is_fatal() {
        let mut usage = PhyRegUsage::with_limits(4, 4, 16, 2);
        let mut addr = words(17, SubRegAlign::Word);

        addr.file = RegFile::Address;
        usage.assign_regs(&addr);
    }
}
