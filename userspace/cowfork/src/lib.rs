// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![forbid(unsafe_code)]
#![deny(clippy::all, missing_docs)]

//! CONTEXT: User-space copy-on-write fork over raw page primitives
//! OWNERS: @runtime
//! PUBLIC API: fork, sfork, child_entry, duppage, resolve, set_pgfault_handler, pgfault_upcall
//! DEPENDS_ON: cowfork-abi (Env), log, thiserror
//! INVARIANTS: A COW page is never mapped writable; the interceptor is registered
//!   before any page is marked COW; the exception stack is never shared
//!
//! The kernel only maps frames. Sharing, marking and privatizing pages is done
//! here, on behalf of the calling process, through the [`cowfork_abi::Env`]
//! surface.

mod cow;
mod duppage;
mod error;
mod fork;
mod pgfault;
pub mod runtime;

pub use cow::resolve;
pub use duppage::{duppage, DupKind};
pub use error::{FaultError, ForkError, ForkResult};
pub use fork::{child_entry, fork, sfork};
pub use pgfault::{pgfault_upcall, set_pgfault_handler};
