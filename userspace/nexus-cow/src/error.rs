// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Two-tier error taxonomy for fork and copy-on-write fault resolution
//! OWNERS: @runtime
//! INVARIANTS: Every `Fatal` leaves the process (or the child) in a state that must not be
//!             retried in place; every other `ForkError` is reported once and leaves retry
//!             policy to the caller.

use thiserror::Error;

use crate::kernel::{FaultCode, KernelError};
use crate::perm::PteFlags;
use crate::types::{PageNum, Pid, VirtAddr};

/// Failure of [`crate::fork::ProcessCtx::fork`].
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ForkError {
    /// The fault handler could not be installed in the caller.
    #[error("installing the fault handler failed: {0}")]
    Register(#[source] KernelError),
    /// The child environment could not be created.
    #[error("exofork failed: {0}")]
    Exofork(#[source] KernelError),
    /// Duplicating one page into the child failed. Pages before it stay remapped.
    #[error("duplicating {page} into {child} failed: {source}")]
    Duplicate {
        child: Pid,
        page: PageNum,
        #[source]
        source: KernelError,
    },
    #[error(transparent)]
    Fatal(#[from] Fatal),
}

impl ForkError {
    /// Returns `true` when the caller must not continue.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ForkError::Fatal(_))
    }

    /// Underlying primitive error, if any.
    pub fn kernel_error(&self) -> Option<KernelError> {
        match *self {
            ForkError::Register(err) | ForkError::Exofork(err) => Some(err),
            ForkError::Duplicate { source, .. } => Some(source),
            ForkError::Fatal(Fatal::ChildSetup { source, .. }) => Some(source),
        }
    }

    /// Negative ABI code reported to the caller of `fork`.
    pub fn code(&self) -> i32 {
        self.kernel_error().map_or(KernelError::Inval.code(), KernelError::code)
    }
}

/// Stage of child setup that runs after the address-space walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupStage {
    ExceptionStack,
    Upcall,
    Status,
}

/// Conditions this runtime cannot recover from locally.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Fatal {
    /// A child whose address space is already populated could not be finished.
    #[error("child {child} setup failed at {stage:?}: {source}")]
    ChildSetup {
        child: Pid,
        stage: SetupStage,
        #[source]
        source: KernelError,
    },
}

/// Step of the copy-on-write resolution that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveStep {
    AllocScratch,
    Copy,
    Remap,
    UnmapScratch,
}

/// Failure of the copy-on-write fault handler. Always fatal to the faulting process.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum FaultError {
    /// The fault was not caused by a write.
    #[error("fault at {va} is not a write (code {code:?})")]
    NotWrite { va: VirtAddr, code: FaultCode },
    /// The faulting page is not marked copy-on-write.
    #[error("write fault at {va} hit a non copy-on-write page ({flags:?})")]
    NotCow { va: VirtAddr, flags: PteFlags },
    /// A primitive failed while materialising the private copy.
    #[error("copy-on-write resolution at {va} failed during {step:?}: {source}")]
    Resolve {
        va: VirtAddr,
        step: ResolveStep,
        #[source]
        source: KernelError,
    },
}

impl FaultError {
    /// Protocol violations are faults this handler was never meant to see.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, FaultError::NotWrite { .. } | FaultError::NotCow { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_is_flagged() {
        let err = ForkError::from(Fatal::ChildSetup {
            child: Pid::new(1, 1),
            stage: SetupStage::Status,
            source: KernelError::BadEnv,
        });
        assert!(err.is_fatal());
        assert_eq!(err.code(), KernelError::BadEnv.code());
        assert!(!ForkError::Exofork(KernelError::NoFreeEnv).is_fatal());
    }

    #[test]
    fn duplicate_reports_primitive_code() {
        let err = ForkError::Duplicate {
            child: Pid::new(2, 1),
            page: PageNum::new(0x800),
            source: KernelError::NoMem,
        };
        assert_eq!(err.code(), -4);
        assert!(err.to_string().contains("pn 0x800"));
    }
}
