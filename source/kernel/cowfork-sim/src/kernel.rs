// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Process table and syscall implementations.
//!
//! Everything here runs with the machine lock held. Upcalls and child
//! entries are never invoked from this module; the caller drops the lock
//! first.

use cowfork_abi::layout::{is_page_aligned, PGSIZE, UTOP, UXSTACKTOP};
use cowfork_abi::{
    AbiError, ChildEntry, EnvId, EnvInfo, EnvStatus, FaultCode, PgfaultUpcall, Pde, Pte,
    PteFlags, SysResult, UTrapframe, CURENV,
};
use log::{debug, info, warn};

use crate::config::SimConfig;
use crate::failpoints::{FailPoint, FailPoints, Syscall};
use crate::frames::FrameTable;
use crate::page_table::PageTable;
use crate::{Mapping, SimError};

pub(crate) const ENVGENSHIFT: u32 = 12;
pub(crate) const ENVX_MASK: u32 = (1 << ENVGENSHIFT) - 1;
const GENERATION_LIMIT: u32 = u32::MAX >> (ENVGENSHIFT + 1);

// One nested fault record plus a spare word, as pushed on the exception stack.
const XSTACK_SLOT: usize = UTrapframe::SIZE + 4;
const MAX_UPCALL_DEPTH: usize = PGSIZE / XSTACK_SLOT;

const fn envx(id: EnvId) -> usize {
    (id & ENVX_MASK) as usize
}

struct Process {
    id: EnvId,
    parent_id: EnvId,
    status: EnvStatus,
    pgdir: PageTable,
    pgfault_upcall: Option<PgfaultUpcall>,
    entry: Option<ChildEntry>,
    runs: u32,
    upcall_depth: usize,
}

impl Process {
    fn info(&self) -> EnvInfo {
        EnvInfo {
            id: self.id,
            parent_id: self.parent_id,
            status: self.status,
            pgfault_upcall: self.pgfault_upcall,
            runs: self.runs,
        }
    }
}

fn find(envs: &[Option<Process>], id: EnvId) -> Option<&Process> {
    envs.get(envx(id))?.as_ref().filter(|process| process.id == id)
}

fn find_mut(envs: &mut [Option<Process>], id: EnvId) -> Option<&mut Process> {
    envs.get_mut(envx(id))?.as_mut().filter(|process| process.id == id)
}

fn check_va(va: usize) -> SysResult<()> {
    if va >= UTOP || !is_page_aligned(va) {
        return Err(AbiError::Inval);
    }
    Ok(())
}

/// Kernel state of a simulated machine.
pub(crate) struct Kernel {
    config: SimConfig,
    frames: FrameTable,
    envs: Vec<Option<Process>>,
    generations: Vec<u32>,
    failpoints: FailPoints,
}

impl Kernel {
    pub(crate) fn new(config: SimConfig) -> Self {
        let frames = FrameTable::new(config.frames);
        let envs = (0..config.max_envs).map(|_| None).collect();
        let generations = vec![0; config.max_envs];
        Self { config, frames, envs, generations, failpoints: FailPoints::default() }
    }

    pub(crate) fn config(&self) -> &SimConfig {
        &self.config
    }

    fn alloc_env(&mut self, parent_id: EnvId, status: EnvStatus) -> SysResult<EnvId> {
        let index = self.envs.iter().position(Option::is_none).ok_or(AbiError::NoFreeEnv)?;
        let generation = &mut self.generations[index];
        *generation = if *generation >= GENERATION_LIMIT { 1 } else { *generation + 1 };
        let id = (*generation << ENVGENSHIFT) | index as EnvId;
        self.envs[index] = Some(Process {
            id,
            parent_id,
            status,
            pgdir: PageTable::new(),
            pgfault_upcall: None,
            entry: None,
            runs: 0,
            upcall_depth: 0,
        });
        Ok(id)
    }

    /// Creates a parentless, already running process.
    pub(crate) fn create_root(&mut self) -> SysResult<EnvId> {
        let id = self.alloc_env(CURENV, EnvStatus::Running)?;
        if let Some(process) = find_mut(&mut self.envs, id) {
            process.runs = 1;
        }
        info!(target: "cowfork_sim::kernel", "booted root env {id:#x}");
        Ok(id)
    }

    pub(crate) fn is_alive(&self, id: EnvId) -> bool {
        find(&self.envs, id).is_some()
    }

    /// Rejects calls from dead processes and applies armed fail points.
    fn enter(&mut self, caller: EnvId, syscall: Syscall) -> SysResult<()> {
        if !self.is_alive(caller) {
            return Err(AbiError::BadEnv);
        }
        self.failpoints.check(syscall)
    }

    /// Resolves `env` relative to `caller`. With `checkperm`, the target must
    /// be the caller or one of its direct children.
    fn resolve(&self, caller: EnvId, env: EnvId, checkperm: bool) -> SysResult<EnvId> {
        let id = if env == CURENV { caller } else { env };
        let target = find(&self.envs, id).ok_or(AbiError::BadEnv)?;
        if checkperm && target.id != caller && target.parent_id != caller {
            return Err(AbiError::BadEnv);
        }
        Ok(id)
    }

    /// Maps `pte` at `va` in `id`, taking a frame reference and dropping the
    /// one held by any replaced entry.
    fn install(&mut self, id: EnvId, va: usize, pte: Pte) -> SysResult<()> {
        let Self { envs, frames, .. } = self;
        let process = find_mut(envs, id).ok_or(AbiError::BadEnv)?;
        frames.incref(pte.frame());
        match process.pgdir.insert(va, pte) {
            Ok(Some(old)) => frames.decref(old.frame()),
            Ok(None) => {}
            Err(_) => {
                frames.decref(pte.frame());
                return Err(AbiError::Inval);
            }
        }
        Ok(())
    }

    fn destroy(&mut self, id: EnvId) {
        if find(&self.envs, id).is_none() {
            return;
        }
        let Some(mut process) = self.envs[envx(id)].take() else {
            return;
        };
        for pte in process.pgdir.drain() {
            self.frames.decref(pte.frame());
        }
        info!(target: "cowfork_sim::kernel", "env {id:#x} destroyed");
    }

    pub(crate) fn sys_page_alloc(
        &mut self,
        caller: EnvId,
        env: EnvId,
        va: usize,
        perm: PteFlags,
    ) -> SysResult<()> {
        self.enter(caller, Syscall::PageAlloc)?;
        let id = self.resolve(caller, env, true)?;
        check_va(va)?;
        if !perm.is_valid_syscall_perm() {
            return Err(AbiError::Inval);
        }
        let frame = self.frames.alloc().ok_or(AbiError::NoMem)?;
        self.install(id, va, Pte::new(frame, perm))
    }

    pub(crate) fn sys_page_map(
        &mut self,
        caller: EnvId,
        src_env: EnvId,
        src_va: usize,
        dst_env: EnvId,
        dst_va: usize,
        perm: PteFlags,
    ) -> SysResult<()> {
        self.enter(caller, Syscall::PageMap)?;
        let src = self.resolve(caller, src_env, true)?;
        let dst = self.resolve(caller, dst_env, true)?;
        check_va(src_va)?;
        check_va(dst_va)?;
        if !perm.is_valid_syscall_perm() {
            return Err(AbiError::Inval);
        }
        let pte = find(&self.envs, src)
            .and_then(|process| process.pgdir.lookup(src_va))
            .filter(|pte| pte.is_present())
            .ok_or(AbiError::Inval)?;
        if perm.contains(PteFlags::WRITABLE) && !pte.flags().contains(PteFlags::WRITABLE) {
            return Err(AbiError::Inval);
        }
        self.install(dst, dst_va, Pte::new(pte.frame(), perm))
    }

    pub(crate) fn sys_page_unmap(&mut self, caller: EnvId, env: EnvId, va: usize) -> SysResult<()> {
        self.enter(caller, Syscall::PageUnmap)?;
        let id = self.resolve(caller, env, true)?;
        check_va(va)?;
        let Self { envs, frames, .. } = self;
        let process = find_mut(envs, id).ok_or(AbiError::BadEnv)?;
        if let Some(old) = process.pgdir.remove(va).map_err(|_| AbiError::Inval)? {
            frames.decref(old.frame());
        }
        Ok(())
    }

    pub(crate) fn sys_exofork(&mut self, caller: EnvId, entry: ChildEntry) -> SysResult<EnvId> {
        self.enter(caller, Syscall::Exofork)?;
        let id = self.alloc_env(caller, EnvStatus::NotRunnable)?;
        if let Some(process) = find_mut(&mut self.envs, id) {
            process.entry = Some(entry);
        }
        debug!(target: "cowfork_sim::kernel", "env {caller:#x} created shell {id:#x}");
        Ok(id)
    }

    pub(crate) fn sys_env_set_status(
        &mut self,
        caller: EnvId,
        env: EnvId,
        status: EnvStatus,
    ) -> SysResult<()> {
        self.enter(caller, Syscall::EnvSetStatus)?;
        let id = self.resolve(caller, env, true)?;
        if status == EnvStatus::Running {
            return Err(AbiError::Inval);
        }
        let process = find_mut(&mut self.envs, id).ok_or(AbiError::BadEnv)?;
        process.status = status;
        Ok(())
    }

    pub(crate) fn sys_env_set_pgfault_upcall(
        &mut self,
        caller: EnvId,
        env: EnvId,
        upcall: PgfaultUpcall,
    ) -> SysResult<()> {
        self.enter(caller, Syscall::EnvSetPgfaultUpcall)?;
        let id = self.resolve(caller, env, true)?;
        let process = find_mut(&mut self.envs, id).ok_or(AbiError::BadEnv)?;
        process.pgfault_upcall = Some(upcall);
        Ok(())
    }

    pub(crate) fn sys_env_destroy(&mut self, caller: EnvId, env: EnvId) -> SysResult<()> {
        self.enter(caller, Syscall::EnvDestroy)?;
        let id = self.resolve(caller, env, true)?;
        self.destroy(id);
        Ok(())
    }

    pub(crate) fn uvpd(&self, caller: EnvId, pdx: usize) -> Pde {
        find(&self.envs, caller).map_or(Pde::EMPTY, |process| process.pgdir.directory_entry(pdx))
    }

    pub(crate) fn uvpt(&self, caller: EnvId, pn: usize) -> Pte {
        find(&self.envs, caller).map_or(Pte::EMPTY, |process| process.pgdir.entry(pn))
    }

    pub(crate) fn env_info(&self, caller: EnvId, env: EnvId) -> Option<EnvInfo> {
        let id = if env == CURENV { caller } else { env };
        find(&self.envs, id).map(Process::info)
    }

    /// Translates a user access. `None` means the caller no longer exists;
    /// `Some(Err(_))` carries the fault code the access raises.
    pub(crate) fn translate(
        &self,
        caller: EnvId,
        va: usize,
        write: bool,
    ) -> Option<Result<usize, FaultCode>> {
        let process = find(&self.envs, caller)?;
        let mut needed = PteFlags::PRESENT | PteFlags::USER;
        let mut code = FaultCode::USER;
        if write {
            needed |= PteFlags::WRITABLE;
            code |= FaultCode::WRITE;
        }
        let translation = match process.pgdir.lookup(va) {
            Some(pte) if pte.flags().contains(needed) => Ok(pte.frame()),
            Some(pte) if pte.is_present() => Err(code | FaultCode::PROTECTION),
            _ => Err(code),
        };
        Some(translation)
    }

    pub(crate) fn frame_data(&self, frame: usize) -> &[u8] {
        self.frames.bytes(frame)
    }

    pub(crate) fn frame_bytes_mut(&mut self, frame: usize) -> &mut [u8] {
        self.frames.bytes_mut(frame)
    }

    /// Pushes `utf` onto the caller's exception stack and returns the upcall
    /// to run. The error names the reason the fault cannot be delivered.
    pub(crate) fn begin_upcall(
        &mut self,
        caller: EnvId,
        utf: &UTrapframe,
    ) -> Result<PgfaultUpcall, &'static str> {
        let Self { envs, frames, .. } = self;
        let process = find_mut(envs, caller).ok_or("env is gone")?;
        let upcall = process.pgfault_upcall.ok_or("no page fault upcall registered")?;
        let xstack = process
            .pgdir
            .lookup(UXSTACKTOP - PGSIZE)
            .filter(|pte| pte.is_user_writable())
            .ok_or("exception stack missing or not writable")?;
        if process.upcall_depth >= MAX_UPCALL_DEPTH {
            return Err("exception stack overflow");
        }
        let offset = PGSIZE - (process.upcall_depth + 1) * XSTACK_SLOT;
        process.upcall_depth += 1;
        frames.bytes_mut(xstack.frame())[offset..offset + UTrapframe::SIZE]
            .copy_from_slice(&utf.to_le_bytes());
        Ok(upcall)
    }

    pub(crate) fn end_upcall(&mut self, caller: EnvId) {
        if let Some(process) = find_mut(&mut self.envs, caller) {
            process.upcall_depth = process.upcall_depth.saturating_sub(1);
        }
    }

    pub(crate) fn kill(&mut self, id: EnvId, va: usize, reason: &str) {
        warn!(target: "cowfork_sim::kernel", "env {id:#x}: fault at {va:#x} not handled: {reason}");
        self.destroy(id);
    }

    /// Marks `id` running and hands back its first-run entry, if still pending.
    pub(crate) fn schedule(&mut self, id: EnvId) -> Result<Option<ChildEntry>, SimError> {
        let process = find_mut(&mut self.envs, id).ok_or(SimError::NoSuchEnv(id))?;
        if process.status == EnvStatus::NotRunnable {
            return Err(SimError::NotRunnable(id));
        }
        process.status = EnvStatus::Running;
        process.runs += 1;
        Ok(process.entry.take())
    }

    pub(crate) fn status(&self, id: EnvId) -> Option<EnvStatus> {
        find(&self.envs, id).map(|process| process.status)
    }

    pub(crate) fn live_envs(&self) -> Vec<EnvId> {
        self.envs.iter().flatten().map(|process| process.id).collect()
    }

    pub(crate) fn lookup(&self, id: EnvId, va: usize) -> Option<Pte> {
        find(&self.envs, id).and_then(|process| process.pgdir.lookup(va))
    }

    pub(crate) fn mappings(&self) -> Vec<Mapping> {
        self.envs
            .iter()
            .flatten()
            .flat_map(|process| {
                process.pgdir.iter().map(move |(va, pte)| Mapping {
                    env: process.id,
                    va,
                    frame: pte.frame(),
                    flags: pte.flags(),
                })
            })
            .collect()
    }

    pub(crate) fn frames_in_use(&self) -> usize {
        self.frames.in_use()
    }

    pub(crate) fn frame_allocations(&self) -> u64 {
        self.frames.allocations()
    }

    pub(crate) fn frame_refs(&self, frame: usize) -> u32 {
        self.frames.refs(frame)
    }

    pub(crate) fn frame_bytes(&self, frame: usize) -> Vec<u8> {
        self.frames.bytes(frame).to_vec()
    }

    pub(crate) fn arm_failpoint(&mut self, point: FailPoint) {
        self.failpoints.arm(point);
    }

    pub(crate) fn clear_failpoints(&mut self) {
        self.failpoints.clear();
    }
}
