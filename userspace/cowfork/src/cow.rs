// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Copy-on-write fault resolution.

use cowfork_abi::layout::{pdx, pgnum, round_down, PFTEMP, PGSIZE};
use cowfork_abi::{AbiError, Env, Pte, PteFlags, UTrapframe, CURENV};
use log::debug;

use crate::error::FaultError;

const PRIVATE: PteFlags = PteFlags::PRESENT.union(PteFlags::USER).union(PteFlags::WRITABLE);

fn syscall(op: &'static str) -> impl FnOnce(AbiError) -> FaultError {
    move |source| FaultError::Syscall { op, source }
}

/// Gives the calling process a private writable copy of the page that
/// faulted.
///
/// Only a write to a page carrying [`PteFlags::COW`] is resolvable. The copy
/// is staged at `PFTEMP` and then mapped over the faulting page, which drops
/// this process's reference to the shared frame.
pub fn resolve(env: &dyn Env, utf: &UTrapframe) -> Result<(), FaultError> {
    let va = utf.fault_va;
    if !utf.is_write() {
        return Err(FaultError::NotWrite { va });
    }
    let pte = if env.uvpd(pdx(va)).is_present() { env.uvpt(pgnum(va)) } else { Pte::EMPTY };
    if !pte.is_present() || !pte.is_cow() {
        return Err(FaultError::NotCow { va });
    }

    let page = round_down(va, PGSIZE);
    env.page_alloc(CURENV, PFTEMP, PRIVATE).map_err(syscall("page_alloc"))?;
    let mut contents = vec![0u8; PGSIZE];
    env.load(page, &mut contents)?;
    env.store(PFTEMP, &contents)?;
    env.page_map(CURENV, PFTEMP, CURENV, page, PRIVATE).map_err(syscall("page_map"))?;
    env.page_unmap(CURENV, PFTEMP).map_err(syscall("page_unmap"))?;

    debug!(target: "cowfork::cow", "env {:#x}: privatized page {page:#x}", env.getenvid());
    Ok(())
}
