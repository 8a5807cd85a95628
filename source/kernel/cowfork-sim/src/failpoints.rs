// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Deterministic syscall failure injection.

use cowfork_abi::{AbiError, SysResult};

/// Kernel primitive a [`FailPoint`] can target.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Syscall {
    /// `page_alloc`
    PageAlloc,
    /// `page_map`
    PageMap,
    /// `page_unmap`
    PageUnmap,
    /// `exofork`
    Exofork,
    /// `env_set_status`
    EnvSetStatus,
    /// `env_set_pgfault_upcall`
    EnvSetPgfaultUpcall,
    /// `env_destroy`
    EnvDestroy,
}

/// Makes one call to `syscall` fail with `error` after `skip` calls have
/// been let through. A fail point fires once and is then discarded.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FailPoint {
    /// Targeted primitive.
    pub syscall: Syscall,
    /// Matching calls that still succeed before the failure.
    pub skip: usize,
    /// Error returned by the failing call.
    pub error: AbiError,
}

impl FailPoint {
    /// Fails the very next call to `syscall`.
    pub fn next(syscall: Syscall, error: AbiError) -> Self {
        Self { syscall, skip: 0, error }
    }
}

#[derive(Debug, Default)]
pub(crate) struct FailPoints {
    armed: Vec<FailPoint>,
}

impl FailPoints {
    pub(crate) fn arm(&mut self, point: FailPoint) {
        self.armed.push(point);
    }

    pub(crate) fn clear(&mut self) {
        self.armed.clear();
    }

    /// Consumes one matching call; returns the injected error when a point fires.
    pub(crate) fn check(&mut self, syscall: Syscall) -> SysResult<()> {
        let Some(index) = self.armed.iter().position(|point| point.syscall == syscall) else {
            return Ok(());
        };
        let point = &mut self.armed[index];
        if point.skip > 0 {
            point.skip -= 1;
            return Ok(());
        }
        let error = point.error;
        self.armed.remove(index);
        log::debug!(target: "cowfork_sim::failpoints", "injected {error:?} into {syscall:?}");
        Err(error)
    }
}
