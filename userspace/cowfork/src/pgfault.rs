// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Fault interceptor installation and the upcall entry.

use cowfork_abi::layout::{pdx, pgnum, PGSIZE, UXSTACKTOP};
use cowfork_abi::{Env, PgfaultUpcall, PteFlags, SysResult, UTrapframe, CURENV};
use log::error;

use crate::cow;

const XSTACK_VA: usize = UXSTACKTOP - PGSIZE;

/// Registers `upcall` as the calling process's page fault handler.
///
/// The exception stack page is allocated only when the process does not
/// already own a writable one, so repeated calls are cheap and never leak a
/// frame. The upcall registration itself is always refreshed.
pub fn set_pgfault_handler(env: &dyn Env, upcall: PgfaultUpcall) -> SysResult<()> {
    if !has_exception_stack(env) {
        env.page_alloc(
            CURENV,
            XSTACK_VA,
            PteFlags::PRESENT | PteFlags::USER | PteFlags::WRITABLE,
        )?;
    }
    env.env_set_pgfault_upcall(CURENV, upcall)
}

fn has_exception_stack(env: &dyn Env) -> bool {
    env.uvpd(pdx(XSTACK_VA)).is_present() && env.uvpt(pgnum(XSTACK_VA)).is_user_writable()
}

/// Upcall entry installed by [`crate::fork`] in every process it touches.
///
/// Resolves copy-on-write faults; anything else destroys the process.
pub fn pgfault_upcall(env: &dyn Env, utf: &UTrapframe) {
    let Err(err) = cow::resolve(env, utf) else {
        return;
    };
    let id = env.getenvid();
    error!(target: "cowfork::pgfault", "env {id:#x}: unrecoverable page fault: {err}");
    if let Err(destroy) = env.env_destroy(CURENV) {
        error!(target: "cowfork::pgfault", "env {id:#x}: self-destroy failed: {destroy}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cowfork_abi::layout::UTEXT;
    use cowfork_abi::{PageTableView, UserMemory};
    use cowfork_sim::{Machine, SimConfig};

    #[test]
    fn installation_is_idempotent() {
        let machine = Machine::new(SimConfig::default()).unwrap();
        let env = machine.boot().unwrap();

        set_pgfault_handler(&env, pgfault_upcall).unwrap();
        let stack = machine.lookup(env.id(), XSTACK_VA).unwrap();
        set_pgfault_handler(&env, pgfault_upcall).unwrap();

        assert_eq!(machine.frame_allocations(), 1);
        assert_eq!(machine.lookup(env.id(), XSTACK_VA), Some(stack));
        assert!(env.env_info(CURENV).unwrap().pgfault_upcall.is_some());
    }

    #[test]
    fn non_cow_fault_destroys_process() {
        let machine = Machine::new(SimConfig::default()).unwrap();
        let env = machine.boot().unwrap();
        set_pgfault_handler(&env, pgfault_upcall).unwrap();

        let mut byte = [0u8; 1];
        assert!(env.load(UTEXT, &mut byte).is_err());
        assert!(!machine.is_alive(env.id()));
    }
}
