// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Server main loop.
//!
//! The dispatcher blocks on the server-notify semaphore, then scans the
//! slots in index order under the region mutex. Every `RequestPending` slot
//! is flipped to `Processing` and its index handed to the pool for its
//! command family; the mutex is released across the pool submission so
//! workers are never blocked behind the scan. Workers, not the dispatcher,
//! publish responses.
//!
//! The same semaphore doubles as the wake-up channel for the status report
//! (SIGUSR1) and for shutdown, so a post with nothing pending is normal and
//! an empty scan is harmless.

use crate::bootstrap::ServerContext;
use crate::config::ServerConfig;
use crate::handlers;
use crate::pool::{ShutdownMode, WorkerPool};
use shmfab::layout::{slot_ptr, Command, CommandFamily, SlotState, MAX_SLOTS};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Discarded-task counts reported by a pool shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    pub mode: ShutdownMode,
    pub discarded_math: usize,
    pub discarded_string: usize,
}

impl ShutdownReport {
    #[must_use]
    pub fn discarded(&self) -> usize {
        self.discarded_math + self.discarded_string
    }
}

/// Owns the two worker pools and runs the notify/scan loop.
pub struct Dispatcher {
    ctx: Arc<ServerContext>,
    math_pool: WorkerPool,
    string_pool: WorkerPool,
    running: Arc<AtomicBool>,
    status_requested: Arc<AtomicBool>,
    threads_per_pool: usize,
    shutdown_mode: ShutdownMode,
    started: Instant,
}

impl Dispatcher {
    pub fn new(ctx: Arc<ServerContext>, config: &ServerConfig) -> Self {
        let math_ctx = Arc::clone(&ctx);
        let math_pool = WorkerPool::new(config.threads_per_pool, "math", move |slot_index| {
            handlers::process_math(&math_ctx, slot_index);
        });

        let string_ctx = Arc::clone(&ctx);
        let string_pool = WorkerPool::new(config.threads_per_pool, "string", move |slot_index| {
            handlers::process_string(&string_ctx, slot_index);
        });

        Self {
            ctx,
            math_pool,
            string_pool,
            running: Arc::new(AtomicBool::new(true)),
            status_requested: Arc::new(AtomicBool::new(false)),
            threads_per_pool: config.threads_per_pool,
            shutdown_mode: config.shutdown_mode,
            started: Instant::now(),
        }
    }

    /// Flag the signal thread clears to stop the loop (post the
    /// server-notify semaphore afterwards so the loop actually wakes).
    #[must_use]
    pub fn running_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    /// Flag the signal thread sets to request a status report.
    #[must_use]
    pub fn status_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.status_requested)
    }

    /// Queued-but-unstarted tasks across both pools.
    #[must_use]
    pub fn pending_tasks(&self) -> usize {
        self.math_pool.pending_count() + self.string_pool.pending_count()
    }

    #[must_use]
    pub fn shutdown_mode(&self) -> ShutdownMode {
        self.shutdown_mode
    }

    /// Block on the doorbell and dispatch until the running flag clears.
    pub fn run(&self) {
        log::info!(
            "[DISPATCH] serving with {} worker(s) per pool",
            self.threads_per_pool
        );

        while self.running.load(Ordering::Acquire) {
            if let Err(e) = self.ctx.server_notify().wait() {
                log::error!("[DISPATCH] notify wait failed: {e}");
                break;
            }

            if self.status_requested.swap(false, Ordering::AcqRel) {
                self.emit_status();
            }

            if !self.running.load(Ordering::Acquire) {
                break;
            }

            self.dispatch_pending();
        }

        log::info!("[DISPATCH] loop stopped");
    }

    /// Stop both pools in the configured mode and join their workers.
    pub fn shutdown_pools(&mut self) -> ShutdownReport {
        let mode = self.shutdown_mode;
        let discarded_math = self.math_pool.shutdown(mode);
        let discarded_string = self.string_pool.shutdown(mode);
        ShutdownReport {
            mode,
            discarded_math,
            discarded_string,
        }
    }

    /// One scan: hand every pending slot to its pool.
    fn dispatch_pending(&self) {
        let region = self.ctx.region_ptr();

        if let Err(e) = self.ctx.mutex().wait() {
            log::error!("[DISPATCH] mutex wait failed: {e}");
            return;
        }

        let mut index = 0;
        while index < MAX_SLOTS {
            // SAFETY: mutex held, index < MAX_SLOTS.
            let (state, cmd_raw) = unsafe {
                let slot = slot_ptr(region, index);
                ((*slot).state, (*slot).command)
            };

            if state == SlotState::RequestPending.as_raw() {
                // SAFETY: mutex held; the claim must land before the mutex
                // is released so no other scan can double-dispatch it.
                unsafe {
                    (*slot_ptr(region, index)).state = SlotState::Processing.as_raw();
                }
                if let Err(e) = self.ctx.mutex().post() {
                    log::error!("[DISPATCH] mutex post failed: {e}");
                    return;
                }

                // Unrecognized command values go to the math pool, whose
                // fallback publishes InvalidInput so the slot drains.
                let accepted = match Command::from_raw(cmd_raw).map(Command::family) {
                    Some(CommandFamily::Text) => self.string_pool.submit(index),
                    _ => self.math_pool.submit(index),
                };
                if !accepted {
                    log::warn!("[DISPATCH] slot {index} arrived during pool shutdown");
                }
                log::debug!("[DISPATCH] slot {index} handed to worker pool");

                if let Err(e) = self.ctx.mutex().wait() {
                    log::error!("[DISPATCH] mutex re-acquire failed: {e}");
                    return;
                }
            }
            index += 1;
        }

        if let Err(e) = self.ctx.mutex().post() {
            log::error!("[DISPATCH] mutex post failed: {e}");
        }
    }

    /// Print the operator status report (driven by SIGUSR1).
    fn emit_status(&self) {
        let uptime = self.started.elapsed().as_secs();
        let (hours, mins, secs) = (uptime / 3600, (uptime % 3600) / 60, uptime % 60);

        let mut counts = [0usize; 4];
        if self.ctx.mutex().wait().is_ok() {
            let region = self.ctx.region_ptr();
            for index in 0..MAX_SLOTS {
                // SAFETY: mutex held, index < MAX_SLOTS.
                let state = unsafe { (*slot_ptr(region, index)).state };
                if let Some(state) = SlotState::from_raw(state) {
                    counts[state.as_raw() as usize] += 1;
                }
            }
            let _ = self.ctx.mutex().post();
        }

        println!(
            "[STATUS] pid={}, uptime={hours}h{mins:02}m{secs:02}s, mode={}, threads/pool={}",
            std::process::id(),
            self.shutdown_mode,
            self.threads_per_pool
        );
        println!(
            "[STATUS] math pool: {} pending, string pool: {} pending",
            self.math_pool.pending_count(),
            self.string_pool.pending_count()
        );
        println!(
            "[STATUS] slots: {} free, {} pending, {} processing, {} ready",
            counts[0], counts[1], counts[2], counts[3]
        );
    }
}
