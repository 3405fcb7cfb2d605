// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Fabric server internals.
//!
//! The binary in `main.rs` wires these together: [`bootstrap`] creates and
//! owns the shared objects, [`Dispatcher`] runs the notify/scan loop over
//! two [`WorkerPool`]s, and [`handlers`] service the slots. Everything is
//! also usable in-process, which is how the integration tests run a whole
//! fabric inside one test binary.

pub mod bootstrap;
pub mod config;
pub mod dispatcher;
pub mod handlers;
pub mod pool;

pub use bootstrap::{bootstrap, BootstrapError, InstanceLock, ServerContext};
pub use config::{default_threads_per_pool, ServerConfig};
pub use dispatcher::{Dispatcher, ShutdownReport};
pub use pool::{ShutdownMode, WorkerPool};
