// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Page permission bits and the fork-time duplication classifier
//! OWNERS: @runtime
//! PUBLIC API: PteFlags, Disposition, classify()
//! INVARIANTS: SHARE always wins; WRITABLE/COW sources never yield a writable destination;
//!             classify() is pure

use bitflags::bitflags;

bitflags! {
    /// Bits of a page-table entry as seen through the read-only introspection view.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct PteFlags: u32 {
        const PRESENT = 1 << 0;
        const WRITABLE = 1 << 1;
        const USER = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const CACHE_DISABLE = 1 << 4;
        const ACCESSED = 1 << 5;
        const DIRTY = 1 << 6;
        const HUGE = 1 << 7;
        const GLOBAL = 1 << 8;
        /// Always shared across fork, never converted to copy-on-write.
        const SHARE = 1 << 10;
        /// Copy-on-write: a software convention, the hardware only sees a read-only page.
        const COW = 1 << 11;
        /// Bits available to user software.
        const AVAIL = 0b111 << 9;
    }
}

impl PteFlags {
    /// Bits a user process may pass to the map primitives.
    pub const SYSCALL: Self = Self::AVAIL.union(Self::PRESENT).union(Self::WRITABLE).union(Self::USER);
    /// Read-only user mapping.
    pub const USER_RO: Self = Self::PRESENT.union(Self::USER);
    /// Private writable user mapping.
    pub const USER_RW: Self = Self::USER_RO.union(Self::WRITABLE);
    /// Copy-on-write user mapping.
    pub const USER_COW: Self = Self::USER_RO.union(Self::COW);
}

/// How a present page is carried into a child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Mapped with the source bits verbatim (restricted to [`PteFlags::SYSCALL`]).
    Shared(PteFlags),
    /// Mapped copy-on-write in the child, and the source is downgraded to copy-on-write too.
    CopyOnWrite,
    /// Mapped read-only.
    Plain,
}

impl Disposition {
    /// Bits installed in the destination.
    pub fn child_flags(self) -> PteFlags {
        match self {
            Disposition::Shared(flags) => flags,
            Disposition::CopyOnWrite => PteFlags::USER_COW,
            Disposition::Plain => PteFlags::USER_RO,
        }
    }

    /// Bits the source must be remapped with, if any.
    pub fn parent_flags(self) -> Option<PteFlags> {
        match self {
            Disposition::CopyOnWrite => Some(PteFlags::USER_COW),
            Disposition::Shared(_) | Disposition::Plain => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Disposition::Shared(_) => "shared",
            Disposition::CopyOnWrite => "cow",
            Disposition::Plain => "plain",
        }
    }
}

/// Decides how a page currently mapped with `flags` is duplicated.
pub fn classify(flags: PteFlags) -> Disposition {
    if flags.contains(PteFlags::SHARE) {
        Disposition::Shared(flags & PteFlags::SYSCALL)
    } else if flags.intersects(PteFlags::WRITABLE | PteFlags::COW) {
        Disposition::CopyOnWrite
    } else {
        Disposition::Plain
    }
}


#[cfg(test)]
mod tests_prop;
