// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Copy-on-write write-fault resolution, run in the faulting environment
//! OWNERS: @runtime
//! PUBLIC API: resolve_cow_fault(), cow_fault_handler
//! INVARIANTS: Only write faults on COW pages are resolved; the scratch page is always
//!             writable and unmapped again before returning

use log::{error, trace};

use crate::error::{FaultError, ResolveStep};
use crate::kernel::{FaultRecord, Kernel, KernelError};
use crate::layout::Layout;
use crate::perm::PteFlags;
use crate::types::VirtAddr;

/// Replaces the copy-on-write mapping under `record.va` with a private writable copy.
///
/// Steps: allocate a frame at the scratch address, copy the faulting page into it, remap the
/// scratch frame over the faulting page, unmap the scratch address. Other environments keep
/// their mapping of the original frame.
pub fn resolve_cow_fault<K: Kernel + ?Sized>(
    kernel: &mut K,
    layout: &Layout,
    record: &FaultRecord,
) -> Result<(), FaultError> {
    let va = record.va;
    if !record.is_write() {
        return Err(FaultError::NotWrite { va, code: record.code });
    }
    let flags = kernel.page_flags(va.page());
    if !flags.contains(PteFlags::COW) {
        return Err(FaultError::NotCow { va, flags });
    }

    let me = kernel.getenvid();
    let page = va.page_down();
    let scratch = layout.scratch();

    kernel
        .page_alloc(me, scratch, PteFlags::USER_RW)
        .map_err(|err| resolve_error(va, ResolveStep::AllocScratch, err))?;
    kernel
        .copy_page(scratch, page)
        .map_err(|err| resolve_error(va, ResolveStep::Copy, err))?;
    kernel
        .page_map(me, scratch, me, page, PteFlags::USER_RW)
        .map_err(|err| resolve_error(va, ResolveStep::Remap, err))?;
    kernel
        .page_unmap(me, scratch)
        .map_err(|err| resolve_error(va, ResolveStep::UnmapScratch, err))?;

    trace!(target: "cow", "{}: private copy of {}", me, page);
    Ok(())
}

fn resolve_error(va: VirtAddr, step: ResolveStep, source: KernelError) -> FaultError {
    error!(target: "cow", "resolving {} failed at {:?}: {}", va, step, source);
    FaultError::Resolve { va, step, source }
}

/// Handler installed as the fault upcall target by [`crate::pgfault::set_pgfault_handler`].
pub fn cow_fault_handler(
    kernel: &mut dyn Kernel,
    layout: &Layout,
    record: &FaultRecord,
) -> Result<(), FaultError> {
    resolve_cow_fault(kernel, layout, record).inspect_err(|err| {
        if err.is_protocol_violation() {
            error!(target: "cow", "unexpected fault: {}", err);
        }
    })
}
