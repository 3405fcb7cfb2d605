// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Server configuration.
//!
//! Everything has a production default; tests override the object-name
//! prefix and the two `/tmp` paths to run isolated instances side by side.

use crate::pool::ShutdownMode;
use shmfab::ObjectNames;
use std::path::PathBuf;
use std::thread;

/// Default path of the single-instance lock file.
pub const DEFAULT_LOCK_PATH: &str = "/tmp/ipc_server.lock";

/// Default path of the generation counter file.
pub const DEFAULT_GENERATION_PATH: &str = "/tmp/ipc_server.generation";

/// Tunables for one server instance.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Names of the shared region and semaphores.
    pub names: ObjectNames,
    /// Worker threads in each of the two pools.
    pub threads_per_pool: usize,
    /// What happens to queued tasks when the server stops.
    pub shutdown_mode: ShutdownMode,
    /// Single-instance advisory lock file.
    pub lock_path: PathBuf,
    /// Persisted generation counter file.
    pub generation_path: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            names: ObjectNames::new(),
            threads_per_pool: default_threads_per_pool(),
            shutdown_mode: ShutdownMode::Drain,
            lock_path: PathBuf::from(DEFAULT_LOCK_PATH),
            generation_path: PathBuf::from(DEFAULT_GENERATION_PATH),
        }
    }
}

/// Workers per pool derived from the machine: half the cores minus the
/// dispatcher, never less than one.
#[must_use]
pub fn default_threads_per_pool() -> usize {
    let hw = thread::available_parallelism().map_or(1, usize::from);
    ((hw.saturating_sub(1)) / 2).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_threads_at_least_one() {
        assert!(default_threads_per_pool() >= 1);
    }

    #[test]
    fn test_default_config_paths() {
        let config = ServerConfig::default();
        assert_eq!(config.lock_path, PathBuf::from("/tmp/ipc_server.lock"));
        assert_eq!(
            config.generation_path,
            PathBuf::from("/tmp/ipc_server.generation")
        );
        assert_eq!(config.shutdown_mode, ShutdownMode::Drain);
        assert_eq!(config.names.region(), "/ipc_shm");
    }
}
