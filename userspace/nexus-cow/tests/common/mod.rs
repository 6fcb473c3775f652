// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Shared fixtures for the host-backed integration tests.

#![allow(dead_code)]

use nexus_cow::host::{HostKernel, Machine, MachineConfig};
use nexus_cow::{ForkStats, Forked, Kernel, Layout, Pid, ProcessCtx, PteFlags, VirtAddr, PAGE_SIZE};

pub fn boot() -> (Machine, HostKernel, ProcessCtx) {
    boot_with(MachineConfig::default())
}

pub fn boot_with(config: MachineConfig) -> (Machine, HostKernel, ProcessCtx) {
    let machine = Machine::new(config);
    let kernel = machine.boot().expect("boot root environment");
    let ctx = ProcessCtx::attach(&kernel, Layout::default()).expect("attach root");
    (machine, kernel, ctx)
}

/// Page `index` of the duplicated range.
pub fn text_page(index: usize) -> VirtAddr {
    VirtAddr::new(Layout::default().text().raw() + index * PAGE_SIZE)
}

/// Maps a fresh page at `va` and fills it with `byte` through user stores.
pub fn map_filled(kernel: &mut HostKernel, va: VirtAddr, byte: u8) {
    let me = kernel.getenvid();
    kernel.page_alloc(me, va, PteFlags::USER_RW).expect("page_alloc");
    kernel.fill(va, byte, PAGE_SIZE).expect("fill");
}

/// Same as [`map_filled`], then drops write access.
pub fn map_read_only(kernel: &mut HostKernel, va: VirtAddr, byte: u8) {
    map_filled(kernel, va, byte);
    let me = kernel.getenvid();
    kernel.page_map(me, va, me, va, PteFlags::USER_RO).expect("downgrade");
}

pub fn fork_parent(kernel: &mut HostKernel, ctx: &mut ProcessCtx) -> (Pid, ForkStats) {
    match ctx.fork(kernel).expect("fork") {
        Forked::Parent { child, stats } => (child, stats),
        Forked::Child => panic!("parent observed the child branch"),
    }
}
