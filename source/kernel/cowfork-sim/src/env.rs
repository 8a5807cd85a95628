// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Per-process handle implementing the kernel primitive traits.

use cowfork_abi::layout::{pgoff, PGSIZE};
use cowfork_abi::{
    ChildEntry, EnvId, EnvInfo, EnvStatus, MemoryFault, PageTableView, Pde, PgfaultUpcall, Pte,
    PteFlags, SysResult, Syscalls, UTrapframe, UserMemory,
};

use crate::kernel::Kernel;
use crate::machine::Machine;

/// A process as seen from inside: every call acts on behalf of `id`.
#[derive(Clone)]
pub struct SimEnv {
    machine: Machine,
    id: EnvId,
}

impl SimEnv {
    pub(crate) fn new(machine: Machine, id: EnvId) -> Self {
        Self { machine, id }
    }

    /// Identifier this handle acts as.
    pub fn id(&self) -> EnvId {
        self.id
    }

    /// Machine the process lives on.
    pub fn machine(&self) -> &Machine {
        &self.machine
    }

    /// Runs `op` against the frame backing `va` once the access translates.
    ///
    /// A failed translation is delivered to the registered upcall with the
    /// lock released, then the access is retried. The process is killed when
    /// the fault cannot be delivered or keeps recurring.
    fn access<R>(
        &self,
        va: usize,
        write: bool,
        mut op: impl FnMut(&mut Kernel, usize) -> R,
    ) -> Result<R, MemoryFault> {
        let killed = MemoryFault::Killed { env: self.id, va };
        let mut delivered = 0;
        loop {
            let mut kernel = self.machine.lock();
            let code = match kernel.translate(self.id, va, write) {
                None => return Err(killed),
                Some(Ok(frame)) => return Ok(op(&mut kernel, frame)),
                Some(Err(code)) => code,
            };
            if delivered >= kernel.config().fault_retry_limit {
                kernel.kill(self.id, va, "fault keeps recurring");
                return Err(killed);
            }
            delivered += 1;
            let utf = UTrapframe { fault_va: va, err: code };
            let upcall = match kernel.begin_upcall(self.id, &utf) {
                Ok(upcall) => upcall,
                Err(reason) => {
                    kernel.kill(self.id, va, reason);
                    return Err(killed);
                }
            };
            drop(kernel);
            log::trace!(target: "cowfork_sim::env", "env {:#x}: upcall for {va:#x} ({code:?})", self.id);
            upcall(self, &utf);
            self.machine.lock().end_upcall(self.id);
        }
    }
}

impl Syscalls for SimEnv {
    fn getenvid(&self) -> EnvId {
        self.id
    }

    fn page_alloc(&self, env: EnvId, va: usize, perm: PteFlags) -> SysResult<()> {
        self.machine.lock().sys_page_alloc(self.id, env, va, perm)
    }

    fn page_map(
        &self,
        src_env: EnvId,
        src_va: usize,
        dst_env: EnvId,
        dst_va: usize,
        perm: PteFlags,
    ) -> SysResult<()> {
        self.machine.lock().sys_page_map(self.id, src_env, src_va, dst_env, dst_va, perm)
    }

    fn page_unmap(&self, env: EnvId, va: usize) -> SysResult<()> {
        self.machine.lock().sys_page_unmap(self.id, env, va)
    }

    fn exofork(&self, entry: ChildEntry) -> SysResult<EnvId> {
        self.machine.lock().sys_exofork(self.id, entry)
    }

    fn env_set_status(&self, env: EnvId, status: EnvStatus) -> SysResult<()> {
        self.machine.lock().sys_env_set_status(self.id, env, status)
    }

    fn env_set_pgfault_upcall(&self, env: EnvId, upcall: PgfaultUpcall) -> SysResult<()> {
        self.machine.lock().sys_env_set_pgfault_upcall(self.id, env, upcall)
    }

    fn env_destroy(&self, env: EnvId) -> SysResult<()> {
        self.machine.lock().sys_env_destroy(self.id, env)
    }
}

impl PageTableView for SimEnv {
    fn uvpd(&self, pdx: usize) -> Pde {
        self.machine.lock().uvpd(self.id, pdx)
    }

    fn uvpt(&self, pn: usize) -> Pte {
        self.machine.lock().uvpt(self.id, pn)
    }

    fn env_info(&self, env: EnvId) -> Option<EnvInfo> {
        self.machine.lock().env_info(self.id, env)
    }
}

impl UserMemory for SimEnv {
    fn load(&self, va: usize, buf: &mut [u8]) -> Result<(), MemoryFault> {
        let mut done = 0;
        while done < buf.len() {
            let addr = va + done;
            let offset = pgoff(addr);
            let len = (PGSIZE - offset).min(buf.len() - done);
            let chunk = &mut buf[done..done + len];
            self.access(addr, false, |kernel, frame| {
                chunk.copy_from_slice(&kernel.frame_data(frame)[offset..offset + len]);
            })?;
            done += len;
        }
        Ok(())
    }

    fn store(&self, va: usize, bytes: &[u8]) -> Result<(), MemoryFault> {
        let mut done = 0;
        while done < bytes.len() {
            let addr = va + done;
            let offset = pgoff(addr);
            let len = (PGSIZE - offset).min(bytes.len() - done);
            let chunk = &bytes[done..done + len];
            self.access(addr, true, |kernel, frame| {
                kernel.frame_bytes_mut(frame)[offset..offset + len].copy_from_slice(chunk);
            })?;
            done += len;
        }
        Ok(())
    }
}
