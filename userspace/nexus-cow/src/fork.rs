// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: User-level fork with copy-on-write address-space duplication
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Integration tests in tests/fork_cow.rs and tests/fork_failures.rs
//!
//! PUBLIC API:
//!   - ProcessCtx: per-process runtime state (own descriptor, layout, installed upcall)
//!   - ProcessCtx::fork(): duplicate the calling environment
//!   - Forked / ForkStats: fork outcome as seen by parent and child
//!
//! ORDERING: every copy-on-write downgrade of the parent's own mappings happens during the
//! walk, strictly before the child is marked runnable.

use log::{error, info, warn};

use crate::dup::duppage;
use crate::error::{Fatal, ForkError, SetupStage};
use crate::fault::cow_fault_handler;
use crate::kernel::{EnvInfo, EnvStatus, Exofork, Kernel, KernelError, Upcall};
use crate::layout::Layout;
use crate::perm::{Disposition, PteFlags};
use crate::pgfault::set_pgfault_handler;
use crate::types::{PageNum, Pid, VirtAddr};

/// Count of pages duplicated per disposition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ForkStats {
    pub shared: usize,
    pub copy_on_write: usize,
    pub plain: usize,
}

impl ForkStats {
    fn record(&mut self, disposition: Disposition) {
        match disposition {
            Disposition::Shared(_) => self.shared += 1,
            Disposition::CopyOnWrite => self.copy_on_write += 1,
            Disposition::Plain => self.plain += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.shared + self.copy_on_write + self.plain
    }
}

/// Result of a successful fork.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Forked {
    /// Returned in the parent.
    Parent { child: Pid, stats: ForkStats },
    /// Returned in the child, which resumes at the fork call site.
    Child,
}

impl Forked {
    /// Child id in the parent, `None` in the child.
    pub fn child(&self) -> Option<Pid> {
        match self {
            Forked::Parent { child, .. } => Some(*child),
            Forked::Child => None,
        }
    }
}

/// Runtime state owned by one process.
///
/// A forked child starts with a copy of its parent's context, so the descriptor is stale in
/// the child until [`ProcessCtx::fork`] refreshes it on the child side.
#[derive(Debug, Clone)]
pub struct ProcessCtx {
    this: EnvInfo,
    layout: Layout,
    upcall: Option<Upcall>,
}

impl ProcessCtx {
    /// Builds the context for the calling environment.
    pub fn attach<K: Kernel + ?Sized>(kernel: &K, layout: Layout) -> Result<Self, KernelError> {
        let this = kernel.env_info(kernel.getenvid())?;
        Ok(Self { this, layout, upcall: None })
    }

    /// Descriptor of the environment this context belongs to.
    pub fn this(&self) -> &EnvInfo {
        &self.this
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn upcall(&self) -> Option<Upcall> {
        self.upcall
    }

    pub(crate) fn set_upcall(&mut self, upcall: Upcall) {
        self.upcall = Some(upcall);
    }

    /// Duplicates the calling environment.
    ///
    /// In the parent, returns the child id once the child is runnable. In the child, returns
    /// [`Forked::Child`] after refreshing the context's descriptor.
    ///
    /// A failure during the walk leaves the child non-runnable and the parent's already
    /// visited writable pages downgraded to copy-on-write. Nothing is rolled back.
    pub fn fork<K: Kernel + ?Sized>(&mut self, kernel: &mut K) -> Result<Forked, ForkError> {
        let upcall =
            set_pgfault_handler(kernel, self, cow_fault_handler).map_err(ForkError::Register)?;

        let child = match kernel.exofork().map_err(ForkError::Exofork)? {
            Exofork::Child => {
                self.this = kernel.env_info(kernel.getenvid()).map_err(ForkError::Exofork)?;
                return Ok(Forked::Child);
            }
            Exofork::Parent(child) => child,
        };

        let stats = self.copy_address_space(kernel, child)?;
        finish_child(kernel, child, self.layout.xstack_page(), upcall)?;

        info!(
            target: "cow",
            "{} forked {}: {} pages ({} cow, {} shared, {} plain)",
            self.this.id,
            child,
            stats.total(),
            stats.copy_on_write,
            stats.shared,
            stats.plain
        );
        Ok(Forked::Parent { child, stats })
    }

    fn copy_address_space<K: Kernel + ?Sized>(
        &self,
        kernel: &mut K,
        child: Pid,
    ) -> Result<ForkStats, ForkError> {
        let pages = self.layout.user_pages();
        let mut stats = ForkStats::default();
        let mut pn = pages.start;
        while pn < pages.end {
            if !kernel.dir_flags(pn).contains(PteFlags::PRESENT) {
                pn = pn.next_dir();
                continue;
            }
            if kernel.page_flags(pn).contains(PteFlags::PRESENT) {
                let disposition = duppage(kernel, child, pn).map_err(|source| {
                    warn!(target: "cow", "fork into {} aborted at {}: {}", child, pn, source);
                    ForkError::Duplicate { child, page: pn, source }
                })?;
                stats.record(disposition);
            }
            pn = PageNum::new(pn.raw() + 1);
        }
        Ok(stats)
    }
}

fn finish_child<K: Kernel + ?Sized>(
    kernel: &mut K,
    child: Pid,
    xstack: VirtAddr,
    upcall: Upcall,
) -> Result<(), Fatal> {
    let fatal = move |stage: SetupStage| {
        move |source: KernelError| {
            error!(target: "cow", "child {} left unusable at {:?}: {}", child, stage, source);
            Fatal::ChildSetup { child, stage, source }
        }
    };
    kernel
        .page_alloc(child, xstack, PteFlags::USER_RW)
        .map_err(fatal(SetupStage::ExceptionStack))?;
    kernel
        .env_set_pgfault_upcall(child, upcall)
        .map_err(fatal(SetupStage::Upcall))?;
    kernel
        .env_set_status(child, EnvStatus::Runnable)
        .map_err(fatal(SetupStage::Status))?;
    Ok(())
}

/// Duplicates the calling environment; see [`ProcessCtx::fork`].
pub fn fork<K: Kernel + ?Sized>(kernel: &mut K, ctx: &mut ProcessCtx) -> Result<Forked, ForkError> {
    ctx.fork(kernel)
}
