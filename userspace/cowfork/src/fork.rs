// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Fork orchestration.

use cowfork_abi::layout::{pgaddr, pgnum, NPTENTRIES, PGSIZE, USTACKTOP, UXSTACKTOP};
use cowfork_abi::{AbiError, Env, EnvId, EnvStatus, PteFlags, CURENV};
use log::{debug, error, info, warn};

use crate::duppage::{duppage, DupKind};
use crate::error::{ForkError, ForkResult};
use crate::pgfault::{pgfault_upcall, set_pgfault_handler};
use crate::runtime::{self, RuntimeError};

#[derive(Debug, Default)]
struct DupSummary {
    cow_both: usize,
    cow_child_only: usize,
    read_only: usize,
}

impl DupSummary {
    fn record(&mut self, kind: DupKind) {
        match kind {
            DupKind::CowBoth => self.cow_both += 1,
            DupKind::CowChildOnly => self.cow_child_only += 1,
            DupKind::ReadOnly => self.read_only += 1,
        }
    }
}

/// Creates a copy-on-write clone of the calling process and returns its id.
///
/// Every page below `USTACKTOP` is shared with the child; writable pages
/// become copy-on-write on both sides. The child gets a private exception
/// stack and the parent's fault upcall, and starts in [`child_entry`] when
/// first scheduled. On failure the partially built child is destroyed; pages
/// already re-marked in the parent stay copy-on-write.
pub fn fork(env: &dyn Env) -> ForkResult<EnvId> {
    set_pgfault_handler(env, pgfault_upcall).map_err(ForkError::HandlerInstall)?;
    let child = env.exofork(child_entry).map_err(ForkError::Exofork)?;

    match populate(env, child) {
        Ok(summary) => {
            info!(target: "cowfork::fork", "env {:#x} forked child {child:#x}", env.getenvid());
            debug!(target: "cowfork::fork", "child {child:#x}: {summary:?}");
            Ok(child)
        }
        Err(err) => {
            reclaim(env, child, &err);
            Err(err)
        }
    }
}

fn populate(env: &dyn Env, child: EnvId) -> ForkResult<DupSummary> {
    let mut summary = DupSummary::default();
    let end = pgnum(USTACKTOP);
    let mut pn = 0;
    while pn < end {
        if !env.uvpd(pn / NPTENTRIES).is_present() {
            pn = (pn / NPTENTRIES + 1) * NPTENTRIES;
            continue;
        }
        if env.uvpt(pn).is_present() {
            let kind = duppage(env, child, pn)
                .map_err(|source| ForkError::Duplicate { va: pgaddr(pn), source })?;
            summary.record(kind);
        }
        pn += 1;
    }

    env.page_alloc(
        child,
        UXSTACKTOP - PGSIZE,
        PteFlags::PRESENT | PteFlags::USER | PteFlags::WRITABLE,
    )
    .map_err(ForkError::ExceptionStack)?;

    let upcall = env
        .env_info(CURENV)
        .and_then(|info| info.pgfault_upcall)
        .ok_or(ForkError::Upcall(AbiError::Inval))?;
    env.env_set_pgfault_upcall(child, upcall).map_err(ForkError::Upcall)?;
    env.env_set_status(child, EnvStatus::Runnable).map_err(ForkError::Status)?;
    Ok(summary)
}

fn reclaim(env: &dyn Env, child: EnvId, err: &ForkError) {
    error!(target: "cowfork::fork", "fork failed: {err}; reclaiming env {child:#x}");
    if let Err(destroy) = env.env_destroy(child) {
        warn!(target: "cowfork::fork", "env {child:#x} left orphaned: {destroy}");
    }
}

/// Runs in a freshly forked child the first time it is scheduled.
///
/// The identity slot still holds the parent's id, so it is rewritten from
/// the kernel's answer. No duplication work happens here.
pub fn child_entry(env: &dyn Env) {
    match runtime::init(env) {
        Ok(id) => debug!(target: "cowfork::fork", "child {id:#x} running"),
        Err(RuntimeError::Memory(fault)) => {
            error!(target: "cowfork::fork", "child runtime init faulted: {fault}");
        }
        Err(err) => {
            error!(target: "cowfork::fork", "child runtime init failed: {err}");
            if let Err(destroy) = env.env_destroy(CURENV) {
                error!(target: "cowfork::fork", "child self-destroy failed: {destroy}");
            }
        }
    }
}

/// Shared-memory fork. Not provided; always fails.
pub fn sfork(_env: &dyn Env) -> ForkResult<EnvId> {
    error!(target: "cowfork::fork", "sfork is not supported");
    Err(ForkError::Unsupported)
}
