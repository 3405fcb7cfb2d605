// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # shmfab - single-host shared-memory request/response fabric
//!
//! A server process owns a fixed ring of 16 message slots in POSIX shared
//! memory plus a set of named counting semaphores; any number of client
//! processes submit requests into free slots and collect responses either by
//! blocking on a per-slot semaphore or by polling with a request id.
//!
//! # Architecture
//!
//! ```text
//! +-----------------+                          +---------------------+
//! |  Client process |      shared region       |   Server process    |
//! |  ClientSession -+---> [slot 0..15] <-------+- dispatcher + pools |
//! |        |        |       mutex sem          |          |          |
//! |        |        |                          |          |          |
//! |        +--------+--> server_notify sem ----+--> wakes dispatcher |
//! |  blocking wait <-+-- slot_<i> sem <--------+-- posted by worker  |
//! +-----------------+                          +---------------------+
//! ```
//!
//! A submission writes one slot under the region mutex and posts the
//! server-notify semaphore; the dispatcher marks the slot as processing and
//! hands its index to the worker pool for the command family; the worker
//! publishes the response under the mutex and posts that slot's semaphore.
//! The client that reads a ready response frees the slot.
//!
//! Restarts are detected from the region's `server_generation` stamp and
//! from the identity of the kernel object backing the mapping; a
//! [`ClientSession`] that notices either change reconnects and reports
//! [`ClientError::ServerRestarted`] so the caller can re-issue work.
//!
//! This crate holds the pieces shared by every participant: the wire
//! [`layout`], the [`shm`] and [`sem`] primitives, the [`names`] scheme, and
//! the [`client`] session. The server side (bootstrap, dispatcher, worker
//! pools) lives in the `shmfab-server` crate.

pub mod client;
pub mod layout;
pub mod names;
pub mod sem;
pub mod shm;

pub use client::{ClientError, ClientSession, Reply, ReplyPayload, RequestId};
pub use layout::{
    Command, CommandFamily, MessageSlot, SharedRegion, SlotState, Status, MAX_RESULT_LEN,
    MAX_SLOTS, MAX_STRING_LEN, REGION_SIZE,
};
pub use names::ObjectNames;
pub use sem::NamedSemaphore;
pub use shm::{SegmentId, ShmSegment};

use std::fmt;
use std::io;

/// Errors from the shared-memory and semaphore primitives.
#[derive(Debug)]
pub enum IpcError {
    /// Shared memory segment creation failed.
    SegmentCreate(io::Error),

    /// Shared memory segment open failed.
    SegmentOpen(io::Error),

    /// Memory mapping failed.
    Mmap(io::Error),

    /// Semaphore creation failed.
    SemCreate { name: String, source: io::Error },

    /// Semaphore open failed.
    SemOpen { name: String, source: io::Error },

    /// Semaphore operation (post/wait) failed.
    Sem(io::Error),

    /// Object name violates POSIX naming rules.
    InvalidName(String),

    /// Named object does not exist.
    NotFound(String),
}

impl IpcError {
    /// Whether this error means the name is already registered (exclusive
    /// creation collided with a stale or live object).
    #[must_use]
    pub fn is_already_exists(&self) -> bool {
        match self {
            Self::SegmentCreate(e) | Self::SemCreate { source: e, .. } => {
                e.kind() == io::ErrorKind::AlreadyExists
            }
            _ => false,
        }
    }
}

impl fmt::Display for IpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SegmentCreate(e) => write!(f, "shared memory segment creation failed: {e}"),
            Self::SegmentOpen(e) => write!(f, "shared memory segment open failed: {e}"),
            Self::Mmap(e) => write!(f, "memory mapping failed: {e}"),
            Self::SemCreate { name, source } => {
                write!(f, "semaphore {name} creation failed: {source}")
            }
            Self::SemOpen { name, source } => write!(f, "semaphore {name} open failed: {source}"),
            Self::Sem(e) => write!(f, "semaphore operation failed: {e}"),
            Self::InvalidName(name) => write!(f, "invalid object name: {name}"),
            Self::NotFound(name) => write!(f, "object not found: {name}"),
        }
    }
}

impl std::error::Error for IpcError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::SegmentCreate(e)
            | Self::SegmentOpen(e)
            | Self::Mmap(e)
            | Self::Sem(e)
            | Self::SemCreate { source: e, .. }
            | Self::SemOpen { source: e, .. } => Some(e),
            _ => None,
        }
    }
}

/// Result type for primitive operations.
pub type Result<T> = std::result::Result<T, IpcError>;
