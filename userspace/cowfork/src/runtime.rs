// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Process-local runtime state.
//!
//! The identity slot lives in the process's own memory at `THISENV_VA`, so a
//! forked child inherits the parent's value until [`init`] rewrites it.

use cowfork_abi::layout::{pdx, pgnum, THISENV_VA};
use cowfork_abi::{AbiError, Env, EnvId, MemoryFault, PteFlags, CURENV};
use thiserror::Error;

/// Errors raised while reading or writing the runtime slot.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RuntimeError {
    /// Mapping the slot failed.
    #[error(transparent)]
    Syscall(#[from] AbiError),
    /// Accessing the slot faulted and the process was killed.
    #[error(transparent)]
    Memory(#[from] MemoryFault),
    /// [`init`] never ran in this address space.
    #[error("runtime not initialized")]
    Uninitialized,
}

fn slot_mapped(env: &dyn Env) -> bool {
    env.uvpd(pdx(THISENV_VA)).is_present() && env.uvpt(pgnum(THISENV_VA)).is_present()
}

/// Records the caller's identity, as reported by the kernel, in its slot.
/// Maps the slot page on first use.
pub fn init(env: &dyn Env) -> Result<EnvId, RuntimeError> {
    let id = env.getenvid();
    if !slot_mapped(env) {
        env.page_alloc(
            CURENV,
            THISENV_VA,
            PteFlags::PRESENT | PteFlags::USER | PteFlags::WRITABLE,
        )?;
    }
    env.store(THISENV_VA, &id.to_le_bytes())?;
    Ok(id)
}

/// Identity stored in the caller's slot.
pub fn thisenv(env: &dyn Env) -> Result<EnvId, RuntimeError> {
    if !slot_mapped(env) {
        return Err(RuntimeError::Uninitialized);
    }
    let mut raw = [0u8; 4];
    env.load(THISENV_VA, &mut raw)?;
    match EnvId::from_le_bytes(raw) {
        CURENV => Err(RuntimeError::Uninitialized),
        id => Ok(id),
    }
}
