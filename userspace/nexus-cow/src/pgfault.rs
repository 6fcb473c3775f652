// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Fault-handler registration for the current environment.

use log::debug;

use crate::fork::ProcessCtx;
use crate::kernel::{FaultHandler, Kernel, KernelError, Upcall};
use crate::perm::PteFlags;

/// Installs `handler` as the fault upcall target of the calling environment.
///
/// The first call maps the exception stack page and installs the upcall. Later calls return
/// the upcall already in place without touching the kernel, so calling this before every
/// fork is safe.
pub fn set_pgfault_handler<K: Kernel + ?Sized>(
    kernel: &mut K,
    ctx: &mut ProcessCtx,
    handler: FaultHandler,
) -> Result<Upcall, KernelError> {
    if let Some(upcall) = ctx.upcall() {
        return Ok(upcall);
    }
    let me = kernel.getenvid();
    let layout = *ctx.layout();
    kernel.page_alloc(me, layout.xstack_page(), PteFlags::USER_RW)?;
    let upcall = Upcall::new(handler, layout);
    kernel.env_set_pgfault_upcall(me, upcall)?;
    ctx.set_upcall(upcall);
    debug!(target: "cow", "{}: fault upcall installed, xstack at {}", me, layout.xstack_page());
    Ok(upcall)
}
