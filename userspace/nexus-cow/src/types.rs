// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Newtypes for environment ids, user virtual addresses and page numbers
//! OWNERS: @runtime
//! PUBLIC API: Pid, VirtAddr, PageNum, PAGE_SIZE, PT_ENTRIES, NENV
//! INVARIANTS: Page numbers and aligned addresses convert losslessly; Pid slot index < NENV

use core::fmt;

use static_assertions::const_assert;

/// Size of a page in bytes.
pub const PAGE_SIZE: usize = 4096;
/// log2 of [`PAGE_SIZE`].
pub const PAGE_SHIFT: usize = 12;
/// Number of entries in one page table (one directory span).
pub const PT_ENTRIES: usize = 1024;
/// Maximum number of live environments.
pub const NENV: usize = 1 << LOG2NENV;

const LOG2NENV: u32 = 10;
const GEN_SHIFT: u32 = 12;

const_assert!(PAGE_SIZE == 1 << PAGE_SHIFT);
const_assert!(PT_ENTRIES.is_power_of_two());
const_assert!((NENV as u32) <= 1 << GEN_SHIFT);

/// Environment (process) identifier.
///
/// The low bits select the slot in the environment table, the high bits carry a generation so
/// that a recycled slot never aliases a dead environment.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct Pid(u32);

impl Pid {
    /// Wraps a raw id as returned by the kernel.
    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Builds an id from a table slot and a generation counter.
    #[inline]
    pub const fn new(slot: usize, generation: u32) -> Self {
        Self((generation << GEN_SHIFT) | (slot as u32 & (NENV as u32 - 1)))
    }

    /// Returns the raw id.
    #[inline]
    pub const fn as_raw(self) -> u32 {
        self.0
    }

    /// Slot index of this id in the environment table.
    #[inline]
    pub const fn slot(self) -> usize {
        (self.0 & (NENV as u32 - 1)) as usize
    }

    /// Generation component.
    #[inline]
    pub const fn generation(self) -> u32 {
        self.0 >> GEN_SHIFT
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

/// User virtual address.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct VirtAddr(usize);

impl VirtAddr {
    #[inline]
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    /// Returns `Some` only for page-aligned addresses.
    #[inline]
    pub const fn page_aligned(addr: usize) -> Option<Self> {
        if addr % PAGE_SIZE == 0 {
            Some(Self(addr))
        } else {
            None
        }
    }

    #[inline]
    pub const fn raw(self) -> usize {
        self.0
    }

    #[inline]
    pub const fn is_page_aligned(self) -> bool {
        self.0 % PAGE_SIZE == 0
    }

    /// Rounds down to the start of the containing page.
    #[inline]
    pub const fn page_down(self) -> Self {
        Self(self.0 & !(PAGE_SIZE - 1))
    }

    /// Page number of the containing page.
    #[inline]
    pub const fn page(self) -> PageNum {
        PageNum(self.0 >> PAGE_SHIFT)
    }

    /// Byte offset within the containing page.
    #[inline]
    pub const fn page_offset(self) -> usize {
        self.0 & (PAGE_SIZE - 1)
    }

    #[inline]
    pub fn checked_add(self, bytes: usize) -> Option<Self> {
        self.0.checked_add(bytes).map(Self)
    }
}

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Page number within the user address space (`va >> PAGE_SHIFT`).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct PageNum(usize);

impl PageNum {
    #[inline]
    pub const fn new(pn: usize) -> Self {
        Self(pn)
    }

    #[inline]
    pub const fn raw(self) -> usize {
        self.0
    }

    /// Base address of the page.
    #[inline]
    pub const fn addr(self) -> VirtAddr {
        VirtAddr(self.0 << PAGE_SHIFT)
    }

    /// Index of the directory entry covering this page.
    #[inline]
    pub const fn dir_index(self) -> usize {
        self.0 / PT_ENTRIES
    }

    /// First page of the next directory span.
    #[inline]
    pub const fn next_dir(self) -> Self {
        Self((self.dir_index() + 1) * PT_ENTRIES)
    }
}

impl fmt::Display for PageNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pn {:#x}", self.0)
    }
}
