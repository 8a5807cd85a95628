// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Error types for fault resolution and fork.

use cowfork_abi::{AbiError, MemoryFault};
use thiserror::Error;

/// Why a page fault could not be resolved. Every variant is fatal to the
/// faulting process.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FaultError {
    /// The faulting access was a read.
    #[error("read fault at {va:#x}")]
    NotWrite {
        /// Faulting address.
        va: usize,
    },
    /// The page is not marked copy-on-write.
    #[error("write fault at {va:#x} on a page that is not copy-on-write")]
    NotCow {
        /// Faulting address.
        va: usize,
    },
    /// A kernel primitive failed while privatizing the page.
    #[error("{op} failed: {source}")]
    Syscall {
        /// Primitive that failed.
        op: &'static str,
        /// Kernel error.
        #[source]
        source: AbiError,
    },
    /// Copying the page contents faulted.
    #[error(transparent)]
    Memory(#[from] MemoryFault),
}

/// Why [`crate::fork`] produced no child.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ForkError {
    /// Registering the fault interceptor in the parent failed.
    #[error("failed to install page fault handler: {0}")]
    HandlerInstall(#[source] AbiError),
    /// The kernel refused to create a process shell.
    #[error("exofork failed: {0}")]
    Exofork(#[source] AbiError),
    /// Mirroring one page into the child failed.
    #[error("failed to duplicate page {va:#x}: {source}")]
    Duplicate {
        /// Page being duplicated.
        va: usize,
        /// Kernel error.
        #[source]
        source: AbiError,
    },
    /// Allocating the child's exception stack failed.
    #[error("failed to allocate child exception stack: {0}")]
    ExceptionStack(#[source] AbiError),
    /// Registering the upcall in the child failed.
    #[error("failed to set child page fault upcall: {0}")]
    Upcall(#[source] AbiError),
    /// Marking the child runnable failed.
    #[error("failed to mark child runnable: {0}")]
    Status(#[source] AbiError),
    /// Shared-memory fork is not provided.
    #[error("sfork is not supported")]
    Unsupported,
}

/// Result of a fork attempt.
pub type ForkResult<T> = core::result::Result<T, ForkError>;
