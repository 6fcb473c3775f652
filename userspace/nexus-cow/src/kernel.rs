// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Kernel primitives consumed by the copy-on-write fork runtime
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Unstable
//!
//! PUBLIC API:
//!   - Kernel trait: syscalls issued by the calling environment
//!   - KernelError: primitive failures and their ABI codes
//!   - EnvStatus / EnvInfo / Exofork: environment lifecycle
//!   - FaultRecord / FaultCode: one page-fault occurrence
//!   - Upcall / FaultHandler: what the trap trampoline dispatches to
//!
//! Every method is issued *by* the current environment. Methods taking a `Pid` act on that
//! environment, which must be the caller or a child the caller created.

use core::fmt;

use bitflags::bitflags;
use thiserror::Error;

use crate::error::FaultError;
use crate::layout::Layout;
use crate::perm::PteFlags;
use crate::types::{PageNum, Pid, VirtAddr};

/// Failure reported by a kernel primitive.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    /// Target environment does not exist or the caller may not act on it.
    #[error("bad environment")]
    BadEnv,
    /// Invalid argument (unaligned address, illegal permissions, unmapped source).
    #[error("invalid parameter")]
    Inval,
    /// Out of physical frames.
    #[error("out of memory")]
    NoMem,
    /// Environment table is full.
    #[error("out of environments")]
    NoFreeEnv,
}

impl KernelError {
    /// Negative code returned across the syscall ABI.
    pub const fn code(self) -> i32 {
        match self {
            KernelError::BadEnv => -2,
            KernelError::Inval => -3,
            KernelError::NoMem => -4,
            KernelError::NoFreeEnv => -5,
        }
    }

    /// Decodes a negative ABI code. Unknown codes map to `None`.
    pub const fn from_code(code: i32) -> Option<Self> {
        match code {
            -2 => Some(KernelError::BadEnv),
            -3 => Some(KernelError::Inval),
            -4 => Some(KernelError::NoMem),
            -5 => Some(KernelError::NoFreeEnv),
            _ => None,
        }
    }
}

/// Scheduling status of an environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvStatus {
    Free,
    Runnable,
    NotRunnable,
    Dying,
}

/// Read-only descriptor of an environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvInfo {
    pub id: Pid,
    pub parent: Option<Pid>,
    pub status: EnvStatus,
}

/// Outcome of `exofork` as observed by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exofork {
    /// Running in the creator; carries the new environment's id.
    Parent(Pid),
    /// Running in the freshly created environment.
    Child,
}

bitflags! {
    /// Reason bits delivered with a page fault.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct FaultCode: u32 {
        /// Protection violation (the page was present).
        const PRESENT = 1 << 0;
        /// The faulting access was a write.
        const WRITE = 1 << 1;
        /// The fault happened in user mode.
        const USER = 1 << 2;
    }
}

/// One page-fault occurrence, built by the trampoline on the exception stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultRecord {
    pub va: VirtAddr,
    pub code: FaultCode,
}

impl FaultRecord {
    pub fn new(va: VirtAddr, code: FaultCode) -> Self {
        Self { va, code }
    }

    pub fn is_write(&self) -> bool {
        self.code.contains(FaultCode::WRITE)
    }
}

/// User-level fault handler invoked by the trampoline.
pub type FaultHandler = fn(&mut dyn Kernel, &Layout, &FaultRecord) -> Result<(), FaultError>;

/// Fault-upcall entry point installed for an environment.
#[derive(Clone, Copy)]
pub struct Upcall {
    handler: FaultHandler,
    layout: Layout,
}

impl Upcall {
    pub fn new(handler: FaultHandler, layout: Layout) -> Self {
        Self { handler, layout }
    }

    /// Runs the handler for `record` in the context of `kernel`'s environment.
    pub fn dispatch(&self, kernel: &mut dyn Kernel, record: &FaultRecord) -> Result<(), FaultError> {
        (self.handler)(kernel, &self.layout, record)
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }
}

impl fmt::Debug for Upcall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Upcall")
            .field("handler", &(self.handler as usize as *const ()))
            .field("layout", &self.layout)
            .finish()
    }
}

/// Primitives the surrounding kernel provides.
pub trait Kernel {
    /// Id of the calling environment.
    fn getenvid(&self) -> Pid;

    /// Reads the descriptor of `pid` from the read-only environment table.
    fn env_info(&self, pid: Pid) -> Result<EnvInfo, KernelError>;

    /// Creates a blank, not-yet-runnable environment.
    fn exofork(&mut self) -> Result<Exofork, KernelError>;

    /// Allocates a zeroed frame and maps it at `va` in `pid`.
    fn page_alloc(&mut self, pid: Pid, va: VirtAddr, perm: PteFlags) -> Result<(), KernelError>;

    /// Maps the frame behind `src_va` in `src` at `dst_va` in `dst`, replacing any existing
    /// mapping there.
    fn page_map(
        &mut self,
        src: Pid,
        src_va: VirtAddr,
        dst: Pid,
        dst_va: VirtAddr,
        perm: PteFlags,
    ) -> Result<(), KernelError>;

    /// Removes the mapping at `va` in `pid`. Unmapping an absent page succeeds.
    fn page_unmap(&mut self, pid: Pid, va: VirtAddr) -> Result<(), KernelError>;

    fn env_set_status(&mut self, pid: Pid, status: EnvStatus) -> Result<(), KernelError>;

    fn env_set_pgfault_upcall(&mut self, pid: Pid, upcall: Upcall) -> Result<(), KernelError>;

    /// Directory-level bits covering `pn` in the caller, empty if no page table exists.
    fn dir_flags(&self, pn: PageNum) -> PteFlags;

    /// Entry-level bits of `pn` in the caller, empty if unmapped.
    fn page_flags(&self, pn: PageNum) -> PteFlags;

    /// Copies one whole page inside the caller's own address space.
    ///
    /// `src` must be readable and `dst` writable, so the copy never faults.
    fn copy_page(&mut self, dst: VirtAddr, src: VirtAddr) -> Result<(), KernelError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_roundtrip() {
        for err in [KernelError::BadEnv, KernelError::Inval, KernelError::NoMem, KernelError::NoFreeEnv] {
            assert!(err.code() < 0);
            assert_eq!(KernelError::from_code(err.code()), Some(err));
        }
        assert_eq!(KernelError::from_code(0), None);
    }

    #[test]
    fn fault_record_write_bit() {
        let va = VirtAddr::new(0x1000);
        assert!(FaultRecord::new(va, FaultCode::WRITE | FaultCode::USER).is_write());
        assert!(!FaultRecord::new(va, FaultCode::PRESENT).is_write());
    }
}
