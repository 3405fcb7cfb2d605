// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Names of the shared POSIX objects.
//!
//! The server and every client derive the same four name families from a
//! common prefix, so no coordination beyond the prefix is needed:
//!
//! ```text
//! <prefix>_shm            shared region
//! <prefix>_mutex          region mutex (binary, initial 1)
//! <prefix>_server_notify  client -> server doorbell (counting, initial 0)
//! <prefix>_slot_<i>       worker -> client doorbells (counting, initial 0)
//! ```
//!
//! The default prefix is `/ipc`, giving `/ipc_shm`, `/ipc_mutex`,
//! `/ipc_server_notify`, and `/ipc_slot_0` .. `/ipc_slot_15`. Test suites
//! run isolated instances by supplying their own prefix.

use crate::{IpcError, Result};

/// Default object-name prefix.
pub const DEFAULT_PREFIX: &str = "/ipc";

/// Derives the names of the shared region and semaphores from one prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectNames {
    prefix: String,
}

impl ObjectNames {
    /// Names used by a production server and its clients.
    #[must_use]
    pub fn new() -> Self {
        Self {
            prefix: DEFAULT_PREFIX.to_string(),
        }
    }

    /// Names under a caller-supplied prefix.
    ///
    /// The prefix must follow POSIX object naming: leading `/`, no other
    /// `/`, and short enough that the longest derived name stays under the
    /// 255-character limit.
    pub fn with_prefix(prefix: &str) -> Result<Self> {
        if !prefix.starts_with('/') {
            return Err(IpcError::InvalidName(format!(
                "prefix must start with '/': {prefix}"
            )));
        }
        if prefix.len() > 1 && prefix[1..].contains('/') {
            return Err(IpcError::InvalidName(format!(
                "prefix cannot contain '/' after the first character: {prefix}"
            )));
        }
        // "_server_notify" is the longest suffix we append.
        if prefix.len() + "_server_notify".len() > 255 {
            return Err(IpcError::InvalidName(format!(
                "prefix too long: {prefix}"
            )));
        }
        Ok(Self {
            prefix: prefix.to_string(),
        })
    }

    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Name of the shared region.
    #[must_use]
    pub fn region(&self) -> String {
        format!("{}_shm", self.prefix)
    }

    /// Name of the region mutex semaphore.
    #[must_use]
    pub fn mutex(&self) -> String {
        format!("{}_mutex", self.prefix)
    }

    /// Name of the server-notify semaphore.
    #[must_use]
    pub fn server_notify(&self) -> String {
        format!("{}_server_notify", self.prefix)
    }

    /// Name of the per-slot semaphore for `index`.
    #[must_use]
    pub fn slot(&self, index: usize) -> String {
        format!("{}_slot_{}", self.prefix, index)
    }
}

impl Default for ObjectNames {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_names() {
        let names = ObjectNames::new();
        assert_eq!(names.region(), "/ipc_shm");
        assert_eq!(names.mutex(), "/ipc_mutex");
        assert_eq!(names.server_notify(), "/ipc_server_notify");
        assert_eq!(names.slot(0), "/ipc_slot_0");
        assert_eq!(names.slot(15), "/ipc_slot_15");
    }

    #[test]
    fn test_custom_prefix() {
        let names = ObjectNames::with_prefix("/fab_test").unwrap();
        assert_eq!(names.region(), "/fab_test_shm");
        assert_eq!(names.slot(3), "/fab_test_slot_3");
    }

    #[test]
    fn test_prefix_validation() {
        assert!(ObjectNames::with_prefix("noslash").is_err());
        assert!(ObjectNames::with_prefix("/a/b").is_err());
        let long = format!("/{}", "x".repeat(300));
        assert!(ObjectNames::with_prefix(&long).is_err());
    }
}
