// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![forbid(unsafe_code)]
#![deny(clippy::all, missing_docs)]

//! CONTEXT: Kernel primitive surface consumed by the user-space fork runtime
//! OWNERS: @runtime
//! PUBLIC API: Syscalls, PageTableView, UserMemory, Env; PteFlags, Pte; UTrapframe, FaultCode; AbiError
//! DEPENDS_ON: bitflags, thiserror
//! INVARIANTS: EnvId 0 always names the caller; PteFlags::COW is never interpreted by the kernel
//!
//! The kernel exposes raw primitives only: allocate/map/unmap pages, create an
//! empty process shell, register a fault upcall, change a process's run state.
//! Process duplication policy lives entirely above this surface.

pub mod layout;
pub mod mmu;

use bitflags::bitflags;
use thiserror::Error;

pub use mmu::{Pde, Pte, PteFlags};

/// Kernel process identifier.
pub type EnvId = u32;

/// Process handle that always refers to the caller.
pub const CURENV: EnvId = 0;

/// Result returned by kernel primitives.
pub type SysResult<T> = core::result::Result<T, AbiError>;

/// Errors reported by kernel primitives.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Error)]
pub enum AbiError {
    /// Process does not exist or the caller may not act on it.
    #[error("bad environment")]
    BadEnv,
    /// Arguments were malformed (alignment, range, permissions).
    #[error("invalid parameter")]
    Inval,
    /// No physical frame was available.
    #[error("out of memory")]
    NoMem,
    /// The process table is full.
    #[error("out of environments")]
    NoFreeEnv,
    /// The request touched memory the caller cannot access.
    #[error("bad address")]
    Fault,
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    /// Access-type flags delivered with a page fault.
    pub struct FaultCode: u32 {
        /// The page was present; the fault is a protection violation.
        const PROTECTION = 1 << 0;
        /// The faulting access was a store.
        const WRITE = 1 << 1;
        /// The fault happened in user mode.
        const USER = 1 << 2;
    }
}

/// Fault context pushed onto the exception stack before the upcall runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UTrapframe {
    /// Faulting virtual address.
    pub fault_va: usize,
    /// Access-type flags.
    pub err: FaultCode,
}

impl UTrapframe {
    /// Bytes occupied by an encoded frame on the exception stack.
    pub const SIZE: usize = 8;

    /// Returns `true` when the faulting access was a store.
    pub const fn is_write(&self) -> bool {
        self.err.contains(FaultCode::WRITE)
    }

    /// Little-endian encoding written onto the exception stack.
    pub fn to_le_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[..4].copy_from_slice(&(self.fault_va as u32).to_le_bytes());
        out[4..].copy_from_slice(&self.err.bits().to_le_bytes());
        out
    }

    /// Decodes a frame previously produced by [`UTrapframe::to_le_bytes`].
    pub fn from_le_bytes(bytes: [u8; Self::SIZE]) -> Self {
        let va = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let err = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        Self { fault_va: va as usize, err: FaultCode::from_bits_truncate(err) }
    }
}

/// Scheduling state of a process.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EnvStatus {
    /// Created but not yet eligible to run.
    NotRunnable,
    /// Eligible to be scheduled.
    Runnable,
    /// Currently scheduled.
    Running,
}

/// Entry point the kernel invokes, on the exception stack, when a process faults.
pub type PgfaultUpcall = fn(&dyn Env, &UTrapframe);

/// Entry point a freshly created process runs when it is first scheduled.
pub type ChildEntry = fn(&dyn Env);

/// Read-only view of a process-table slot.
#[derive(Clone, Copy, Debug)]
pub struct EnvInfo {
    /// Process identifier.
    pub id: EnvId,
    /// Creator, or [`CURENV`] for the root process.
    pub parent_id: EnvId,
    /// Scheduling state.
    pub status: EnvStatus,
    /// Registered fault upcall, if any.
    pub pgfault_upcall: Option<PgfaultUpcall>,
    /// Number of times the process has been scheduled.
    pub runs: u32,
}

/// Kernel primitives. Every process argument accepts [`CURENV`] for the caller;
/// other handles must name the caller or one of its direct children.
pub trait Syscalls {
    /// Identifier of the calling process, fetched from the kernel.
    fn getenvid(&self) -> EnvId;

    /// Allocates a zeroed frame and maps it at `va` in `env`, replacing any
    /// previous mapping.
    fn page_alloc(&self, env: EnvId, va: usize, perm: PteFlags) -> SysResult<()>;

    /// Maps the frame behind `src_va` in `src_env` at `dst_va` in `dst_env`.
    /// `perm` is independent of the source mapping, except that a writable
    /// mapping of a read-only source is refused.
    fn page_map(
        &self,
        src_env: EnvId,
        src_va: usize,
        dst_env: EnvId,
        dst_va: usize,
        perm: PteFlags,
    ) -> SysResult<()>;

    /// Removes the mapping at `va` in `env`; unmapping nothing succeeds.
    fn page_unmap(&self, env: EnvId, va: usize) -> SysResult<()>;

    /// Creates a not-runnable process with an empty address space. `entry`
    /// runs in the new process when it is first scheduled.
    fn exofork(&self, entry: ChildEntry) -> SysResult<EnvId>;

    /// Sets the scheduling state; only [`EnvStatus::Runnable`] and
    /// [`EnvStatus::NotRunnable`] are accepted.
    fn env_set_status(&self, env: EnvId, status: EnvStatus) -> SysResult<()>;

    /// Registers the fault upcall of `env`.
    fn env_set_pgfault_upcall(&self, env: EnvId, upcall: PgfaultUpcall) -> SysResult<()>;

    /// Tears down `env` and releases its mappings.
    fn env_destroy(&self, env: EnvId) -> SysResult<()>;
}

/// Read-only reflection of the caller's page tables and of the process table.
/// Reading it never enters the kernel.
pub trait PageTableView {
    /// Page-directory entry `pdx` of the caller.
    fn uvpd(&self, pdx: usize) -> Pde;

    /// Page-table entry for page number `pn` of the caller. Only meaningful
    /// when the covering directory entry is present.
    fn uvpt(&self, pn: usize) -> Pte;

    /// Process-table slot for `env`, if it exists.
    fn env_info(&self, env: EnvId) -> Option<EnvInfo>;
}

/// Loads and stores issued by the running process.
///
/// An access the mapping does not allow raises a page fault, which the kernel
/// delivers to the registered upcall before retrying the access.
pub trait UserMemory {
    /// Copies `buf.len()` bytes starting at `va` into `buf`.
    fn load(&self, va: usize, buf: &mut [u8]) -> Result<(), MemoryFault>;

    /// Copies `bytes` to memory starting at `va`.
    fn store(&self, va: usize, bytes: &[u8]) -> Result<(), MemoryFault>;
}

/// Everything a running process can reach: syscalls, its page-table
/// reflection and its own memory.
pub trait Env: Syscalls + PageTableView + UserMemory {}

impl<T: Syscalls + PageTableView + UserMemory + ?Sized> Env for T {}

/// An access that could not complete because the process is gone.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum MemoryFault {
    /// The process was destroyed while (or before) the access was resolved.
    #[error("env {env:#x} killed by fault at {va:#x}")]
    Killed {
        /// Process that issued the access.
        env: EnvId,
        /// Address that could not be accessed.
        va: usize,
    },
}
