// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: User-level copy-on-write fork for microkernel environments
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests per module, property tests for the classifier, integration tests
//!
//! PUBLIC API:
//!   - ProcessCtx::fork() / fork(): duplicate the calling environment
//!   - duppage(): carry one page into a child
//!   - resolve_cow_fault() / cow_fault_handler: private copy on first write
//!   - set_pgfault_handler(): install the fault upcall once
//!   - classify(): fork-time disposition of a page
//!   - Kernel: the primitives all of the above are built on
//!
//! The runtime never touches page tables itself. Every mapping change goes through
//! [`Kernel`], so the same code runs against the in-memory [`host`] backend and a real kernel.
//!
//! FEATURES:
//!   - backend-host: in-memory microkernel used by the tests
//!   - failpoints: syscall error injection in the host backend

#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::unwrap_used, clippy::expect_used))]

pub mod dup;
pub mod error;
pub mod fault;
pub mod fork;
pub mod kernel;
pub mod layout;
pub mod perm;
pub mod pgfault;
pub mod types;

#[cfg(feature = "backend-host")]
pub mod host;

pub use dup::duppage;
pub use error::{Fatal, FaultError, ForkError, ResolveStep, SetupStage};
pub use fault::{cow_fault_handler, resolve_cow_fault};
pub use fork::{fork, ForkStats, Forked, ProcessCtx};
pub use kernel::{
    EnvInfo, EnvStatus, Exofork, FaultCode, FaultHandler, FaultRecord, Kernel, KernelError, Upcall,
};
pub use layout::{Layout, LayoutError};
pub use perm::{classify, Disposition, PteFlags};
pub use pgfault::set_pgfault_handler;
pub use types::{PageNum, Pid, VirtAddr, NENV, PAGE_SIZE, PT_ENTRIES};

static_assertions::assert_impl_all!(Layout: Copy, Send, Sync);
static_assertions::assert_impl_all!(Upcall: Copy, Send, Sync);
static_assertions::assert_impl_all!(ForkError: std::error::Error, Send, Sync);
static_assertions::assert_impl_all!(FaultError: std::error::Error, Send, Sync);
static_assertions::assert_obj_safe!(Kernel);
#[cfg(feature = "backend-host")]
static_assertions::assert_impl_all!(host::Machine: Send, Sync);
