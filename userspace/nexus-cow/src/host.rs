// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: In-memory microkernel for host-based testing of the fork runtime
//!
//! OWNERS: @runtime
//!
//! PUBLIC API:
//!   - Machine: shared physical memory, environment table and page tables
//!   - MachineConfig: frame pool and environment table bounds
//!   - HostKernel: `Kernel` handle issuing syscalls as one environment, plus load/store
//!   - Trap / KillReason: outcome of an access the environment could not survive
//!   - FrameId: identity of a physical frame, for sharing assertions
//!
//! SECURITY INVARIANTS:
//!   - No unsafe code
//!   - Mapping permissions must contain PRESENT|USER and stay within PteFlags::SYSCALL
//!   - WRITABLE can never be added on top of a read-only source mapping
//!   - Syscalls only act on the caller or a direct child of the caller
//!
//! TRAP MODEL:
//!   - A load or store the page table does not permit raises a fault record
//!   - The record is delivered to the installed upcall, which needs a writable exception stack
//!   - The access is retried once; a second fault or a handler error destroys the environment
//!   - The lock is never held while the upcall runs, so handlers reenter freely
//!
//! FEATURES:
//!   - failpoints: inject a kernel error into the N-th subsequent call of a chosen syscall

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use log::{trace, warn};
use parking_lot::{Mutex, MutexGuard};
use thiserror::Error;

use crate::error::FaultError;
use crate::kernel::{
    EnvInfo, EnvStatus, Exofork, FaultCode, FaultRecord, Kernel, KernelError, Upcall,
};
use crate::perm::PteFlags;
use crate::types::{PageNum, Pid, VirtAddr, NENV, PAGE_SIZE};

/// First address above the user-accessible part of every address space.
pub const UTOP: usize = 0xeec0_0000;

/// Bounds of a [`Machine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MachineConfig {
    /// Physical frames available, page-table pages included.
    pub frame_limit: usize,
    /// Environment slots available, clamped to [`NENV`].
    pub env_limit: usize,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self { frame_limit: 4096, env_limit: NENV }
    }
}

/// Identity of a physical frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FrameId(usize);

/// Why an environment was destroyed.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum KillReason {
    #[error("page fault with no upcall installed")]
    NoUpcall,
    #[error("exception stack is not mapped writable")]
    NoExceptionStack,
    #[error("fault handler failed: {0}")]
    Handler(#[source] FaultError),
    #[error("access at {0} still faults after the handler returned")]
    Unresolved(VirtAddr),
}

/// An access that did not complete.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Trap {
    #[error("environment {pid} destroyed: {reason}")]
    Killed { pid: Pid, reason: KillReason },
    #[error("environment {0} is not running")]
    NotRunning(Pid),
}

/// Syscalls a failpoint can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Syscall {
    Exofork,
    PageAlloc,
    PageMap,
    PageUnmap,
    SetStatus,
    SetUpcall,
}

#[cfg(feature = "failpoints")]
#[derive(Debug, Clone, Copy)]
struct Failpoint {
    call: Syscall,
    remaining: usize,
    error: KernelError,
}

struct Frame {
    data: Box<[u8]>,
    refs: usize,
}

#[derive(Debug, Clone, Copy)]
struct Pte {
    frame: FrameId,
    flags: PteFlags,
}

struct Env {
    id: Pid,
    parent: Option<Pid>,
    status: EnvStatus,
    tables: BTreeSet<usize>,
    ptes: BTreeMap<PageNum, Pte>,
    upcall: Option<Upcall>,
    pending_child_return: bool,
}

impl Env {
    fn info(&self) -> EnvInfo {
        EnvInfo { id: self.id, parent: self.parent, status: self.status }
    }

    fn is_live(&self) -> bool {
        matches!(self.status, EnvStatus::Runnable | EnvStatus::NotRunnable)
    }
}

struct State {
    frames: BTreeMap<FrameId, Frame>,
    next_frame: usize,
    tables_in_use: usize,
    frame_limit: usize,
    envs: Vec<Option<Env>>,
    generations: Vec<u32>,
    #[cfg(feature = "failpoints")]
    failpoints: Vec<Failpoint>,
}

impl State {
    fn new(config: MachineConfig) -> Self {
        let slots = config.env_limit.min(NENV);
        Self {
            frames: BTreeMap::new(),
            next_frame: 0,
            tables_in_use: 0,
            frame_limit: config.frame_limit,
            envs: (0..slots).map(|_| None).collect(),
            generations: vec![0; slots],
            #[cfg(feature = "failpoints")]
            failpoints: Vec::new(),
        }
    }

    fn frames_in_use(&self) -> usize {
        self.frames.len() + self.tables_in_use
    }

    fn env(&self, pid: Pid) -> Option<&Env> {
        self.envs.get(pid.slot())?.as_ref().filter(|env| env.id == pid)
    }

    fn env_mut(&mut self, pid: Pid) -> Result<&mut Env, KernelError> {
        self.envs
            .get_mut(pid.slot())
            .and_then(Option::as_mut)
            .filter(|env| env.id == pid)
            .ok_or(KernelError::BadEnv)
    }

    /// Permission check for a syscall issued by `caller` against `target`.
    fn check_target(&self, caller: Pid, target: Pid) -> Result<(), KernelError> {
        let env = self.env(target).filter(|env| env.is_live()).ok_or(KernelError::BadEnv)?;
        if target != caller && env.parent != Some(caller) {
            return Err(KernelError::BadEnv);
        }
        Ok(())
    }

    /// Takes the first slot that is empty or whose environment was destroyed. A destroyed
    /// environment holds no mappings, so it reports `Dying` only until its slot is reused.
    fn spawn(&mut self, parent: Option<Pid>, status: EnvStatus) -> Result<Pid, KernelError> {
        let slot = self
            .envs
            .iter()
            .position(|env| env.as_ref().map_or(true, |env| !env.is_live()))
            .ok_or(KernelError::NoFreeEnv)?;
        let generation = self.generations[slot].wrapping_add(1).max(1);
        self.generations[slot] = generation;
        let id = Pid::new(slot, generation);
        self.envs[slot] = Some(Env {
            id,
            parent,
            status,
            tables: BTreeSet::new(),
            ptes: BTreeMap::new(),
            upcall: None,
            pending_child_return: false,
        });
        Ok(id)
    }

    fn alloc_frame(&mut self) -> Result<FrameId, KernelError> {
        if self.frames_in_use() >= self.frame_limit {
            return Err(KernelError::NoMem);
        }
        let id = FrameId(self.next_frame);
        self.next_frame += 1;
        self.frames.insert(id, Frame { data: vec![0u8; PAGE_SIZE].into_boxed_slice(), refs: 0 });
        Ok(id)
    }

    fn decref(&mut self, frame: FrameId) {
        let unused = match self.frames.get_mut(&frame) {
            Some(slot) => {
                slot.refs = slot.refs.saturating_sub(1);
                slot.refs == 0
            }
            None => false,
        };
        if unused {
            self.frames.remove(&frame);
        }
    }

    /// Charges a page-table page for the directory span of `pn` on first use.
    fn ensure_table(&mut self, pid: Pid, pn: PageNum) -> Result<(), KernelError> {
        let dir = pn.dir_index();
        if self.env_mut(pid)?.tables.contains(&dir) {
            return Ok(());
        }
        if self.frames_in_use() >= self.frame_limit {
            return Err(KernelError::NoMem);
        }
        self.tables_in_use += 1;
        self.env_mut(pid)?.tables.insert(dir);
        Ok(())
    }

    /// Installs `pte` at `pn`, releasing whatever was mapped there before.
    fn install(&mut self, pid: Pid, pn: PageNum, pte: Pte) -> Result<(), KernelError> {
        let env = self.env_mut(pid)?;
        let old = env.ptes.insert(pn, pte);
        if let Some(frame) = self.frames.get_mut(&pte.frame) {
            frame.refs += 1;
        }
        if let Some(old) = old {
            self.decref(old.frame);
        }
        Ok(())
    }

    fn remove(&mut self, pid: Pid, pn: PageNum) -> Result<(), KernelError> {
        if let Some(old) = self.env_mut(pid)?.ptes.remove(&pn) {
            self.decref(old.frame);
        }
        Ok(())
    }

    /// Drops every mapping and page-table page of `pid`.
    fn release(&mut self, pid: Pid) {
        let Ok(env) = self.env_mut(pid) else {
            return;
        };
        let ptes = std::mem::take(&mut env.ptes);
        let tables = std::mem::take(&mut env.tables).len();
        env.upcall = None;
        self.tables_in_use = self.tables_in_use.saturating_sub(tables);
        for pte in ptes.into_values() {
            self.decref(pte.frame);
        }
    }

    fn lookup(&self, pid: Pid, pn: PageNum) -> Option<Pte> {
        self.env(pid)?.ptes.get(&pn).copied()
    }

    fn mark(&mut self, pid: Pid, pn: PageNum, bits: PteFlags) {
        if let Ok(env) = self.env_mut(pid) {
            if let Some(pte) = env.ptes.get_mut(&pn) {
                pte.flags |= bits;
            }
        }
    }

    /// Performs one user-mode access, or reports the fault it raises.
    fn touch(&mut self, pid: Pid, va: VirtAddr, write: Option<u8>) -> Result<u8, FaultCode> {
        let pn = va.page();
        let access = match write {
            Some(_) => FaultCode::USER | FaultCode::WRITE,
            None => FaultCode::USER,
        };
        let pte = match self.lookup(pid, pn) {
            Some(pte) if pte.flags.contains(PteFlags::USER_RO) => pte,
            _ => return Err(access),
        };
        if write.is_some() && !pte.flags.contains(PteFlags::WRITABLE) {
            return Err(access | FaultCode::PRESENT);
        }
        let frame = self.frames.get_mut(&pte.frame).ok_or(access)?;
        let offset = va.page_offset();
        let value = match write {
            Some(byte) => {
                frame.data[offset] = byte;
                byte
            }
            None => frame.data[offset],
        };
        let touched = if write.is_some() {
            PteFlags::ACCESSED | PteFlags::DIRTY
        } else {
            PteFlags::ACCESSED
        };
        self.mark(pid, pn, touched);
        Ok(value)
    }

    /// Where a fault in `pid` is delivered, if it can be delivered at all.
    fn upcall_target(&self, pid: Pid) -> Result<Upcall, KillReason> {
        let upcall = self.env(pid).and_then(|env| env.upcall).ok_or(KillReason::NoUpcall)?;
        let xstack = upcall.layout().xstack_page().page();
        match self.lookup(pid, xstack) {
            Some(pte) if pte.flags.contains(PteFlags::USER_RW) => Ok(upcall),
            _ => Err(KillReason::NoExceptionStack),
        }
    }

    #[cfg(feature = "failpoints")]
    fn trip(&mut self, call: Syscall) -> Result<(), KernelError> {
        let Some(index) = self.failpoints.iter().position(|fp| fp.call == call) else {
            return Ok(());
        };
        let failpoint = &mut self.failpoints[index];
        if failpoint.remaining > 0 {
            failpoint.remaining -= 1;
            return Ok(());
        }
        let error = failpoint.error;
        self.failpoints.remove(index);
        trace!(target: "cow::host", "failpoint {:?} -> {}", call, error);
        Err(error)
    }

    #[cfg(not(feature = "failpoints"))]
    fn trip(&mut self, _call: Syscall) -> Result<(), KernelError> {
        Ok(())
    }
}

fn check_va(va: VirtAddr) -> Result<(), KernelError> {
    if !va.is_page_aligned() || va.raw() >= UTOP {
        return Err(KernelError::Inval);
    }
    Ok(())
}

fn check_perm(perm: PteFlags) -> Result<(), KernelError> {
    if !perm.contains(PteFlags::USER_RO) || !PteFlags::SYSCALL.contains(perm) {
        return Err(KernelError::Inval);
    }
    Ok(())
}

/// Physical memory and environment table shared by every [`HostKernel`] handle.
#[derive(Clone)]
pub struct Machine {
    state: Arc<Mutex<State>>,
}

impl Machine {
    pub fn new(config: MachineConfig) -> Self {
        Self { state: Arc::new(Mutex::new(State::new(config))) }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock()
    }

    /// Creates a runnable root environment and returns a handle running as it.
    pub fn boot(&self) -> Result<HostKernel, KernelError> {
        let pid = self.lock().spawn(None, EnvStatus::Runnable)?;
        trace!(target: "cow::host", "boot {}", pid);
        Ok(HostKernel { machine: self.clone(), pid })
    }

    /// Schedules `pid`, which must be runnable.
    pub fn run(&self, pid: Pid) -> Result<HostKernel, KernelError> {
        match self.status(pid) {
            Some(EnvStatus::Runnable) => Ok(HostKernel { machine: self.clone(), pid }),
            _ => Err(KernelError::BadEnv),
        }
    }

    pub fn status(&self, pid: Pid) -> Option<EnvStatus> {
        self.lock().env(pid).map(|env| env.status)
    }

    /// Frame mapped at `va` in `pid`.
    pub fn frame_of(&self, pid: Pid, va: VirtAddr) -> Option<FrameId> {
        self.lock().lookup(pid, va.page()).map(|pte| pte.frame)
    }

    /// Entry bits at `va` in `pid`, empty if unmapped.
    pub fn flags_of(&self, pid: Pid, va: VirtAddr) -> PteFlags {
        self.lock().lookup(pid, va.page()).map_or(PteFlags::empty(), |pte| pte.flags)
    }

    /// Number of mappings referencing `frame`; zero once it is freed.
    pub fn refs(&self, frame: FrameId) -> usize {
        self.lock().frames.get(&frame).map_or(0, |frame| frame.refs)
    }

    pub fn frames_in_use(&self) -> usize {
        self.lock().frames_in_use()
    }

    /// Kernel-side read that ignores user permissions.
    pub fn peek(&self, pid: Pid, va: VirtAddr) -> Option<u8> {
        let state = self.lock();
        let pte = state.lookup(pid, va.page())?;
        state.frames.get(&pte.frame).map(|frame| frame.data[va.page_offset()])
    }

    /// Makes the call to `call` after the next `successes` ones fail with `error`.
    #[cfg(feature = "failpoints")]
    pub fn fail_after(&self, call: Syscall, successes: usize, error: KernelError) {
        self.lock().failpoints.push(Failpoint { call, remaining: successes, error });
    }

    #[cfg(feature = "failpoints")]
    pub fn clear_failpoints(&self) {
        self.lock().failpoints.clear();
    }

    fn kill(&self, pid: Pid, reason: KillReason) -> Trap {
        let mut state = self.lock();
        state.release(pid);
        if let Ok(env) = state.env_mut(pid) {
            env.status = EnvStatus::Dying;
        }
        warn!(target: "cow::host", "destroying {}: {}", pid, reason);
        Trap::Killed { pid, reason }
    }
}

/// Handle through which one environment issues syscalls and touches memory.
#[derive(Clone)]
pub struct HostKernel {
    machine: Machine,
    pid: Pid,
}

impl HostKernel {
    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn machine(&self) -> &Machine {
        &self.machine
    }

    pub fn load(&mut self, va: VirtAddr) -> Result<u8, Trap> {
        self.access(va, None)
    }

    pub fn store(&mut self, va: VirtAddr, byte: u8) -> Result<(), Trap> {
        self.access(va, Some(byte)).map(|_| ())
    }

    /// Fills `len` bytes starting at `va` with `byte`.
    pub fn fill(&mut self, va: VirtAddr, byte: u8, len: usize) -> Result<(), Trap> {
        for addr in va.raw()..va.raw().saturating_add(len) {
            self.store(VirtAddr::new(addr), byte)?;
        }
        Ok(())
    }

    fn access(&mut self, va: VirtAddr, write: Option<u8>) -> Result<u8, Trap> {
        let mut faulted = false;
        loop {
            let outcome = {
                let mut state = self.machine.lock();
                let running = state.env(self.pid).map(|env| env.status);
                if running != Some(EnvStatus::Runnable) {
                    return Err(Trap::NotRunning(self.pid));
                }
                state.touch(self.pid, va, write)
            };
            let code = match outcome {
                Ok(value) => return Ok(value),
                Err(code) => code,
            };
            if faulted {
                return Err(self.machine.kill(self.pid, KillReason::Unresolved(va)));
            }
            faulted = true;
            self.deliver(FaultRecord::new(va, code))?;
        }
    }

    fn deliver(&mut self, record: FaultRecord) -> Result<(), Trap> {
        let target = self.machine.lock().upcall_target(self.pid);
        let upcall = match target {
            Ok(upcall) => upcall,
            Err(reason) => return Err(self.machine.kill(self.pid, reason)),
        };
        trace!(target: "cow::host", "{}: fault at {} ({:?})", self.pid, record.va, record.code);
        match upcall.dispatch(&mut *self, &record) {
            Ok(()) => Ok(()),
            Err(err) => Err(self.machine.kill(self.pid, KillReason::Handler(err))),
        }
    }
}

impl Kernel for HostKernel {
    fn getenvid(&self) -> Pid {
        self.pid
    }

    fn env_info(&self, pid: Pid) -> Result<EnvInfo, KernelError> {
        self.machine.lock().env(pid).map(Env::info).ok_or(KernelError::BadEnv)
    }

    fn exofork(&mut self) -> Result<Exofork, KernelError> {
        let mut state = self.machine.lock();
        let me = state.env_mut(self.pid)?;
        if me.pending_child_return {
            me.pending_child_return = false;
            return Ok(Exofork::Child);
        }
        state.trip(Syscall::Exofork)?;
        let child = state.spawn(Some(self.pid), EnvStatus::NotRunnable)?;
        state.env_mut(child)?.pending_child_return = true;
        trace!(target: "cow::host", "{}: exofork -> {}", self.pid, child);
        Ok(Exofork::Parent(child))
    }

    fn page_alloc(&mut self, pid: Pid, va: VirtAddr, perm: PteFlags) -> Result<(), KernelError> {
        let mut state = self.machine.lock();
        state.check_target(self.pid, pid)?;
        check_va(va)?;
        check_perm(perm)?;
        state.trip(Syscall::PageAlloc)?;
        let pn = va.page();
        state.ensure_table(pid, pn)?;
        let frame = state.alloc_frame()?;
        state.install(pid, pn, Pte { frame, flags: perm })?;
        trace!(target: "cow::host", "{}: page_alloc {} {} {:?}", self.pid, pid, va, perm);
        Ok(())
    }

    fn page_map(
        &mut self,
        src: Pid,
        src_va: VirtAddr,
        dst: Pid,
        dst_va: VirtAddr,
        perm: PteFlags,
    ) -> Result<(), KernelError> {
        let mut state = self.machine.lock();
        state.check_target(self.pid, src)?;
        state.check_target(self.pid, dst)?;
        check_va(src_va)?;
        check_va(dst_va)?;
        check_perm(perm)?;
        let source = state.lookup(src, src_va.page()).ok_or(KernelError::Inval)?;
        if perm.contains(PteFlags::WRITABLE) && !source.flags.contains(PteFlags::WRITABLE) {
            return Err(KernelError::Inval);
        }
        state.trip(Syscall::PageMap)?;
        let pn = dst_va.page();
        state.ensure_table(dst, pn)?;
        state.install(dst, pn, Pte { frame: source.frame, flags: perm })?;
        trace!(
            target: "cow::host",
            "{}: page_map {}:{} -> {}:{} {:?}",
            self.pid,
            src,
            src_va,
            dst,
            dst_va,
            perm
        );
        Ok(())
    }

    fn page_unmap(&mut self, pid: Pid, va: VirtAddr) -> Result<(), KernelError> {
        let mut state = self.machine.lock();
        state.check_target(self.pid, pid)?;
        check_va(va)?;
        state.trip(Syscall::PageUnmap)?;
        state.remove(pid, va.page())?;
        trace!(target: "cow::host", "{}: page_unmap {} {}", self.pid, pid, va);
        Ok(())
    }

    fn env_set_status(&mut self, pid: Pid, status: EnvStatus) -> Result<(), KernelError> {
        if !matches!(status, EnvStatus::Runnable | EnvStatus::NotRunnable) {
            return Err(KernelError::Inval);
        }
        let mut state = self.machine.lock();
        state.check_target(self.pid, pid)?;
        state.trip(Syscall::SetStatus)?;
        state.env_mut(pid)?.status = status;
        trace!(target: "cow::host", "{}: status of {} -> {:?}", self.pid, pid, status);
        Ok(())
    }

    fn env_set_pgfault_upcall(&mut self, pid: Pid, upcall: Upcall) -> Result<(), KernelError> {
        let mut state = self.machine.lock();
        state.check_target(self.pid, pid)?;
        state.trip(Syscall::SetUpcall)?;
        state.env_mut(pid)?.upcall = Some(upcall);
        Ok(())
    }

    fn dir_flags(&self, pn: PageNum) -> PteFlags {
        let state = self.machine.lock();
        match state.env(self.pid) {
            Some(env) if env.tables.contains(&pn.dir_index()) => PteFlags::USER_RW,
            _ => PteFlags::empty(),
        }
    }

    fn page_flags(&self, pn: PageNum) -> PteFlags {
        self.machine.lock().lookup(self.pid, pn).map_or(PteFlags::empty(), |pte| pte.flags)
    }

    fn copy_page(&mut self, dst: VirtAddr, src: VirtAddr) -> Result<(), KernelError> {
        check_va(dst)?;
        check_va(src)?;
        let mut state = self.machine.lock();
        let from = state
            .lookup(self.pid, src.page())
            .filter(|pte| pte.flags.contains(PteFlags::USER_RO))
            .ok_or(KernelError::Inval)?;
        let to = state
            .lookup(self.pid, dst.page())
            .filter(|pte| pte.flags.contains(PteFlags::USER_RW))
            .ok_or(KernelError::Inval)?;
        if from.frame != to.frame {
            let data = state.frames.get(&from.frame).map(|frame| frame.data.clone());
            let target = state.frames.get_mut(&to.frame);
            match (data, target) {
                (Some(data), Some(target)) => target.data.copy_from_slice(&data),
                _ => return Err(KernelError::Inval),
            }
        }
        state.mark(self.pid, src.page(), PteFlags::ACCESSED);
        state.mark(self.pid, dst.page(), PteFlags::ACCESSED | PteFlags::DIRTY);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::Layout;

    const PAGE: VirtAddr = VirtAddr::new(0x0080_0000);
    const OTHER: VirtAddr = VirtAddr::new(0x0080_1000);

    fn boot_with(frames: usize) -> (Machine, HostKernel) {
        let machine = Machine::new(MachineConfig { frame_limit: frames, ..MachineConfig::default() });
        let kernel = machine.boot().unwrap();
        (machine, kernel)
    }

    #[test]
    fn page_alloc_zeroes_and_charges_table() {
        let (machine, mut k) = boot_with(8);
        let me = k.pid();
        k.page_alloc(me, PAGE, PteFlags::USER_RW).unwrap();
        assert_eq!(machine.frames_in_use(), 2);
        assert_eq!(k.load(PAGE).unwrap(), 0);
        k.page_alloc(me, OTHER, PteFlags::USER_RW).unwrap();
        assert_eq!(machine.frames_in_use(), 3);
        assert!(k.dir_flags(PAGE.page()).contains(PteFlags::PRESENT));
        assert!(k.dir_flags(PageNum::new(0)).is_empty());
    }

    #[test]
    fn rejects_illegal_permissions_and_addresses() {
        let (_machine, mut k) = boot_with(8);
        let me = k.pid();
        assert_eq!(k.page_alloc(me, PAGE, PteFlags::WRITABLE), Err(KernelError::Inval));
        assert_eq!(
            k.page_alloc(me, PAGE, PteFlags::USER_RW | PteFlags::DIRTY),
            Err(KernelError::Inval)
        );
        assert_eq!(
            k.page_alloc(me, VirtAddr::new(0x0080_0010), PteFlags::USER_RW),
            Err(KernelError::Inval)
        );
        assert_eq!(k.page_alloc(me, VirtAddr::new(UTOP), PteFlags::USER_RW), Err(KernelError::Inval));
    }

    #[test]
    fn cannot_add_write_to_read_only_source() {
        let (_machine, mut k) = boot_with(8);
        let me = k.pid();
        k.page_alloc(me, PAGE, PteFlags::USER_RO).unwrap();
        assert_eq!(k.page_map(me, PAGE, me, OTHER, PteFlags::USER_RW), Err(KernelError::Inval));
        k.page_map(me, PAGE, me, OTHER, PteFlags::USER_RO).unwrap();
    }

    #[test]
    fn map_shares_frame_and_unmap_releases_it() {
        let (machine, mut k) = boot_with(8);
        let me = k.pid();
        k.page_alloc(me, PAGE, PteFlags::USER_RW).unwrap();
        k.page_map(me, PAGE, me, OTHER, PteFlags::USER_RO).unwrap();
        let frame = machine.frame_of(me, PAGE).unwrap();
        assert_eq!(machine.frame_of(me, OTHER), Some(frame));
        assert_eq!(machine.refs(frame), 2);
        k.page_map(me, PAGE, me, PAGE, PteFlags::USER_COW).unwrap();
        assert_eq!(machine.refs(frame), 2);
        k.page_unmap(me, PAGE).unwrap();
        k.page_unmap(me, PAGE).unwrap();
        k.page_unmap(me, OTHER).unwrap();
        assert_eq!(machine.refs(frame), 0);
    }

    #[test]
    fn frame_pool_is_bounded() {
        let (_machine, mut k) = boot_with(2);
        let me = k.pid();
        k.page_alloc(me, PAGE, PteFlags::USER_RW).unwrap();
        assert_eq!(k.page_alloc(me, OTHER, PteFlags::USER_RW), Err(KernelError::NoMem));
    }

    #[test]
    fn only_self_or_children_are_targets() {
        let (machine, mut root) = boot_with(16);
        let Exofork::Parent(child) = root.exofork().unwrap() else {
            panic!("root saw the child branch");
        };
        root.page_alloc(child, PAGE, PteFlags::USER_RW).unwrap();

        let mut other = machine.boot().unwrap();
        assert_eq!(other.page_alloc(child, PAGE, PteFlags::USER_RW), Err(KernelError::BadEnv));
        assert_eq!(other.env_set_status(child, EnvStatus::Runnable), Err(KernelError::BadEnv));
        assert_eq!(root.env_set_status(child, EnvStatus::Dying), Err(KernelError::Inval));
    }

    #[test]
    fn exofork_child_resumes_with_child_branch() {
        let (machine, mut root) = boot_with(16);
        let Exofork::Parent(child) = root.exofork().unwrap() else {
            panic!("root saw the child branch");
        };
        assert_eq!(machine.status(child), Some(EnvStatus::NotRunnable));
        assert!(machine.run(child).is_err());
        root.env_set_status(child, EnvStatus::Runnable).unwrap();
        let mut resumed = machine.run(child).unwrap();
        assert_eq!(resumed.exofork(), Ok(Exofork::Child));
        let info = resumed.env_info(child).unwrap();
        assert_eq!(info.parent, Some(root.pid()));
    }

    #[test]
    fn env_table_is_bounded() {
        let machine = Machine::new(MachineConfig { frame_limit: 4, env_limit: 2 });
        let mut root = machine.boot().unwrap();
        assert!(matches!(root.exofork(), Ok(Exofork::Parent(_))));
        assert_eq!(root.exofork(), Err(KernelError::NoFreeEnv));
    }

    #[test]
    fn destroyed_env_slot_is_reused() {
        let machine = Machine::new(MachineConfig { frame_limit: 8, env_limit: 2 });
        let mut root = machine.boot().unwrap();
        let Exofork::Parent(child) = root.exofork().unwrap() else {
            panic!("root saw the child branch");
        };
        assert_eq!(root.exofork(), Err(KernelError::NoFreeEnv));

        root.env_set_status(child, EnvStatus::Runnable).unwrap();
        let mut kid = machine.run(child).unwrap();
        assert!(matches!(kid.load(PAGE), Err(Trap::Killed { reason: KillReason::NoUpcall, .. })));
        assert_eq!(machine.status(child), Some(EnvStatus::Dying));

        let Exofork::Parent(next) = root.exofork().unwrap() else {
            panic!("root saw the child branch");
        };
        assert_eq!(next.slot(), child.slot());
        assert_ne!(next, child);
        assert_eq!(machine.status(child), None);
        assert_eq!(machine.status(next), Some(EnvStatus::NotRunnable));
    }

    #[test]
    fn fault_without_upcall_destroys_env() {
        let (machine, mut k) = boot_with(8);
        let me = k.pid();
        k.page_alloc(me, PAGE, PteFlags::USER_RO).unwrap();
        let trap = k.store(PAGE, 1).unwrap_err();
        assert_eq!(trap, Trap::Killed { pid: me, reason: KillReason::NoUpcall });
        assert_eq!(machine.status(me), Some(EnvStatus::Dying));
        assert_eq!(machine.frames_in_use(), 0);
        assert_eq!(k.load(PAGE), Err(Trap::NotRunning(me)));
    }

    fn ignore(_: &mut dyn Kernel, _: &Layout, _: &FaultRecord) -> Result<(), FaultError> {
        Ok(())
    }

    #[test]
    fn fault_needs_writable_exception_stack() {
        let (_machine, mut k) = boot_with(8);
        let me = k.pid();
        let layout = Layout::default();
        k.env_set_pgfault_upcall(me, Upcall::new(ignore, layout)).unwrap();
        let trap = k.load(PAGE).unwrap_err();
        assert_eq!(trap, Trap::Killed { pid: me, reason: KillReason::NoExceptionStack });
    }

    #[test]
    fn unresolved_fault_is_retried_once() {
        let (_machine, mut k) = boot_with(8);
        let me = k.pid();
        let layout = Layout::default();
        k.page_alloc(me, layout.xstack_page(), PteFlags::USER_RW).unwrap();
        k.env_set_pgfault_upcall(me, Upcall::new(ignore, layout)).unwrap();
        let trap = k.load(PAGE).unwrap_err();
        assert_eq!(trap, Trap::Killed { pid: me, reason: KillReason::Unresolved(PAGE) });
    }

    #[test]
    fn stores_mark_accessed_and_dirty() {
        let (machine, mut k) = boot_with(8);
        let me = k.pid();
        k.page_alloc(me, PAGE, PteFlags::USER_RW).unwrap();
        k.store(PAGE, 7).unwrap();
        let flags = machine.flags_of(me, PAGE);
        assert!(flags.contains(PteFlags::ACCESSED | PteFlags::DIRTY));
        assert_eq!(machine.peek(me, PAGE), Some(7));
    }

    #[cfg(feature = "failpoints")]
    #[test]
    fn failpoint_fires_once_after_successes() {
        let (machine, mut k) = boot_with(8);
        let me = k.pid();
        k.page_alloc(me, PAGE, PteFlags::USER_RW).unwrap();
        machine.fail_after(Syscall::PageMap, 1, KernelError::NoMem);
        k.page_map(me, PAGE, me, PAGE, PteFlags::USER_COW).unwrap();
        assert_eq!(k.page_map(me, PAGE, me, PAGE, PteFlags::USER_COW), Err(KernelError::NoMem));
        k.page_map(me, PAGE, me, PAGE, PteFlags::USER_COW).unwrap();
    }
}
