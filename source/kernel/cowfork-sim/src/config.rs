// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Machine configuration, loadable from TOML.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::kernel::ENVX_MASK;

/// Errors raised while loading a [`SimConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read simulator config {path}: {source}")]
    Read {
        /// File that was requested.
        path: PathBuf,
        /// Underlying I/O failure.
        #[source]
        source: std::io::Error,
    },
    /// The TOML document is malformed or has unknown keys.
    #[error("failed to parse simulator config: {0}")]
    Parse(#[from] toml::de::Error),
    /// A value is outside the supported range.
    #[error("invalid simulator config: {0}")]
    Invalid(&'static str),
}

/// Sizing of the simulated machine.
///
/// ```toml
/// frames = 512
/// max_envs = 64
/// fault_retry_limit = 4
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SimConfig {
    /// Physical frames available to all processes.
    pub frames: usize,
    /// Size of the process table.
    pub max_envs: usize,
    /// Faults delivered for one access before the process is killed.
    pub fault_retry_limit: usize,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self { frames: 512, max_envs: 64, fault_retry_limit: 4 }
    }
}

impl SimConfig {
    /// Parses and validates a TOML document. Missing keys keep their defaults.
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates the file at `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path)
            .map_err(|source| ConfigError::Read { path: path.to_path_buf(), source })?;
        Self::from_toml_str(&raw)
    }

    /// Checks value ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.frames == 0 {
            return Err(ConfigError::Invalid("frames must be non-zero"));
        }
        if self.max_envs == 0 || self.max_envs > ENVX_MASK as usize {
            return Err(ConfigError::Invalid("max_envs out of range"));
        }
        if self.fault_retry_limit == 0 {
            return Err(ConfigError::Invalid("fault_retry_limit must be non-zero"));
        }
        Ok(())
    }
}
