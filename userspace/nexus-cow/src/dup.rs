// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Per-page duplication from the calling environment into a child.

use log::debug;

use crate::kernel::{Kernel, KernelError};
use crate::perm::{classify, Disposition};
use crate::types::{PageNum, Pid};

/// Maps page `pn` of the caller into `child` at the same address.
///
/// Writable and copy-on-write pages are mapped copy-on-write into the child first, then the
/// caller's own mapping is remapped copy-on-write as well. The second remap is required even
/// when the page was already copy-on-write: once the frame is referenced by two environments
/// neither may hold a writable mapping to it, and the caller's entry may have been upgraded
/// to writable by an earlier fault resolution.
///
/// Returns the disposition that was applied.
pub fn duppage<K: Kernel + ?Sized>(
    kernel: &mut K,
    child: Pid,
    pn: PageNum,
) -> Result<Disposition, KernelError> {
    let me = kernel.getenvid();
    let va = pn.addr();
    let disposition = classify(kernel.page_flags(pn));

    kernel.page_map(me, va, child, va, disposition.child_flags())?;
    if let Some(parent_flags) = disposition.parent_flags() {
        kernel.page_map(me, va, me, va, parent_flags)?;
    }

    debug!(target: "cow", "dup {} -> {}: {}", pn, child, disposition.label());
    Ok(disposition)
}
