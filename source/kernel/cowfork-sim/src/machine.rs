// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Shared machine handle and the cooperative scheduler.

use std::sync::Arc;

use cowfork_abi::{EnvId, EnvStatus, Pte};
use parking_lot::{Mutex, MutexGuard};

use crate::config::SimConfig;
use crate::env::SimEnv;
use crate::failpoints::FailPoint;
use crate::kernel::Kernel;
use crate::{Mapping, SimError};

/// Simulated uniprocessor. Clones share the same kernel state.
#[derive(Clone)]
pub struct Machine {
    kernel: Arc<Mutex<Kernel>>,
}

impl Machine {
    /// Builds a machine after validating `config`.
    pub fn new(config: SimConfig) -> Result<Self, SimError> {
        config.validate()?;
        Ok(Self { kernel: Arc::new(Mutex::new(Kernel::new(config))) })
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Kernel> {
        self.kernel.lock()
    }

    /// Creates the initial process, already running with an empty address space.
    pub fn boot(&self) -> Result<SimEnv, SimError> {
        let id = self.lock().create_root()?;
        Ok(self.env(id))
    }

    /// Handle acting as process `id`. The process need not exist; calls made
    /// through a handle of a dead process fail with `BadEnv`.
    pub fn env(&self, id: EnvId) -> SimEnv {
        SimEnv::new(self.clone(), id)
    }

    /// Gives `id` the processor.
    ///
    /// A process scheduled for the first time runs its child entry to
    /// completion before this returns. Fails with [`SimError::Killed`] if the
    /// process did not survive its entry.
    pub fn schedule(&self, id: EnvId) -> Result<SimEnv, SimError> {
        let entry = self.lock().schedule(id)?;
        let env = self.env(id);
        if let Some(entry) = entry {
            log::debug!(target: "cowfork_sim::machine", "first run of env {id:#x}");
            entry(&env);
            if !self.is_alive(id) {
                return Err(SimError::Killed(id));
            }
        }
        Ok(env)
    }

    /// Machine configuration.
    pub fn config(&self) -> SimConfig {
        self.lock().config().clone()
    }

    /// Run state of `id`, or `None` once destroyed.
    pub fn status(&self, id: EnvId) -> Option<EnvStatus> {
        self.lock().status(id)
    }

    /// Whether `id` still exists.
    pub fn is_alive(&self, id: EnvId) -> bool {
        self.lock().is_alive(id)
    }

    /// Identifiers of every live process.
    pub fn live_envs(&self) -> Vec<EnvId> {
        self.lock().live_envs()
    }

    /// Page table entry of `id` at `va`.
    pub fn lookup(&self, id: EnvId, va: usize) -> Option<Pte> {
        self.lock().lookup(id, va)
    }

    /// Snapshot of every mapping on the machine.
    pub fn mappings(&self) -> Vec<Mapping> {
        self.lock().mappings()
    }

    /// Frames with at least one mapping.
    pub fn frames_in_use(&self) -> usize {
        self.lock().frames_in_use()
    }

    /// Frames handed out since boot.
    pub fn frame_allocations(&self) -> u64 {
        self.lock().frame_allocations()
    }

    /// Number of mappings referencing `frame`.
    pub fn frame_refs(&self, frame: usize) -> u32 {
        self.lock().frame_refs(frame)
    }

    /// Copy of the contents of `frame`.
    pub fn frame_bytes(&self, frame: usize) -> Vec<u8> {
        self.lock().frame_bytes(frame)
    }

    /// Arms a fail point. Points stay armed until they fire or are cleared.
    pub fn arm_failpoint(&self, point: FailPoint) {
        self.lock().arm_failpoint(point);
    }

    /// Disarms every pending fail point.
    pub fn clear_failpoints(&self) {
        self.lock().clear_failpoints();
    }
}
