// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![forbid(unsafe_code)]
#![deny(clippy::all, missing_docs)]

//! CONTEXT: Deterministic host kernel backing the fork runtime in tests
//! OWNERS: @runtime
//! PUBLIC API: Machine, SimEnv, SimConfig, FailPoint, Mapping, SimError
//! DEPENDS_ON: cowfork-abi, parking_lot, log, serde/toml
//! INVARIANTS: Kernel lock is never held across an upcall or a child entry;
//!   a frame is free exactly when no page table references it
//!
//! Processes, page tables and frames live behind one lock. A faulting user
//! access is turned into a [`cowfork_abi::UTrapframe`], written to the
//! process's exception stack, and handed to its registered upcall on the
//! calling thread. Children created with `exofork` stay parked until
//! [`Machine::schedule`] runs their entry.

mod config;
mod env;
mod failpoints;
mod frames;
mod kernel;
mod machine;
mod page_table;

use cowfork_abi::{AbiError, EnvId, PteFlags};
use thiserror::Error;

pub use config::{ConfigError, SimConfig};
pub use env::SimEnv;
pub use failpoints::{FailPoint, Syscall};
pub use machine::Machine;

/// Errors surfaced by [`Machine`] operations.
#[derive(Debug, Error)]
pub enum SimError {
    /// Machine configuration was rejected.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// No live process has this identifier.
    #[error("no such env {0:#x}")]
    NoSuchEnv(EnvId),
    /// The process exists but was never marked runnable.
    #[error("env {0:#x} is not runnable")]
    NotRunnable(EnvId),
    /// The process died while running.
    #[error("env {0:#x} was killed")]
    Killed(EnvId),
    /// A kernel primitive failed.
    #[error(transparent)]
    Abi(#[from] AbiError),
}

/// One page table entry, as reported by [`Machine::mappings`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Mapping {
    /// Owning process.
    pub env: EnvId,
    /// Page-aligned virtual address.
    pub va: usize,
    /// Backing frame.
    pub frame: usize,
    /// Entry permission and software bits.
    pub flags: PteFlags,
}
