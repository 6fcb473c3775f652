// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! User address-space layout consumed by fork and the fault resolver.
//!
//! The duplication walk covers `[text, stack_top)`. The exception stack page sits just below
//! `xstack_top` and must stay outside that walk: every process gets a fresh exception stack
//! rather than a copy-on-write one. The scratch page used by the resolver must also stay
//! outside the walk so a fork never shares a half-finished copy.

use core::ops::Range;

use thiserror::Error;

use crate::types::{PageNum, VirtAddr, PAGE_SIZE};

/// Reasons a [`Layout`] is rejected.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum LayoutError {
    #[error("layout address {0} is not page aligned")]
    Unaligned(VirtAddr),
    #[error("text boundary must lie below the user stack top")]
    EmptyRange,
    #[error("exception stack overlaps the duplicated range")]
    ExceptionStackInRange,
    #[error("scratch page {0} overlaps the duplicated range or the exception stack")]
    ScratchOverlap(VirtAddr),
}

/// Boundaries of the user address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    text: VirtAddr,
    stack_top: VirtAddr,
    xstack_top: VirtAddr,
    scratch: VirtAddr,
}

impl Layout {
    /// Validates and builds a layout.
    pub fn new(
        text: VirtAddr,
        stack_top: VirtAddr,
        xstack_top: VirtAddr,
        scratch: VirtAddr,
    ) -> Result<Self, LayoutError> {
        for addr in [text, stack_top, xstack_top, scratch] {
            if !addr.is_page_aligned() {
                return Err(LayoutError::Unaligned(addr));
            }
        }
        if text >= stack_top {
            return Err(LayoutError::EmptyRange);
        }
        // stack_top > text >= 0, so a zero xstack_top always sits under the walk.
        let xstack = xstack_top
            .raw()
            .checked_sub(PAGE_SIZE)
            .ok_or(LayoutError::ExceptionStackInRange)?;
        if xstack < stack_top.raw() {
            return Err(LayoutError::ExceptionStackInRange);
        }
        if (text..stack_top).contains(&scratch) || scratch.raw() == xstack {
            return Err(LayoutError::ScratchOverlap(scratch));
        }
        Ok(Self { text, stack_top, xstack_top, scratch })
    }

    /// Lowest duplicated address.
    pub const fn text(&self) -> VirtAddr {
        self.text
    }

    /// Exclusive upper bound of the duplicated range.
    pub const fn stack_top(&self) -> VirtAddr {
        self.stack_top
    }

    pub const fn xstack_top(&self) -> VirtAddr {
        self.xstack_top
    }

    /// Base of the single exception-stack page.
    pub const fn xstack_page(&self) -> VirtAddr {
        VirtAddr::new(self.xstack_top.raw() - PAGE_SIZE)
    }

    /// Scratch address the fault resolver stages private copies at.
    pub const fn scratch(&self) -> VirtAddr {
        self.scratch
    }

    /// Page numbers visited by the fork walk.
    pub fn user_pages(&self) -> Range<PageNum> {
        self.text.page()..self.stack_top.page()
    }
}

impl Default for Layout {
    fn default() -> Self {
        Self {
            text: VirtAddr::new(0x0080_0000),
            stack_top: VirtAddr::new(0xeebf_e000),
            xstack_top: VirtAddr::new(0xeec0_0000),
            scratch: VirtAddr::new(0x007f_f000),
        }
    }
}
