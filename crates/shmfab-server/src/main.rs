// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! shmfab-server - owns the shared-memory fabric and services requests.
//!
//! ```bash
//! # Default worker count, finish queued work on shutdown
//! shmfab-server
//!
//! # Four workers per pool, discard queued work on shutdown
//! shmfab-server -t 4 --shutdown=immediate
//! ```
//!
//! SIGINT/SIGTERM stop the server; SIGUSR1 prints a status report.

use clap::Parser;
use shmfab_server::{bootstrap, Dispatcher, ServerConfig, ShutdownMode};
use signal_hook::consts::{SIGINT, SIGTERM, SIGUSR1};
use signal_hook::iterator::Signals;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;

/// Shared-memory request/response fabric server
#[derive(Parser, Debug)]
#[command(name = "shmfab-server")]
#[command(about = "Shared-memory request/response fabric server")]
#[command(version)]
struct Args {
    /// Worker threads per pool (default derived from hardware concurrency)
    #[arg(short = 't', long = "threads")]
    threads: Option<usize>,

    /// Shutdown mode: drain (finish queued tasks) or immediate (discard)
    #[arg(long = "shutdown", default_value = "drain")]
    shutdown: String,
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    if let Err(e) = run(&args) {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn run(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    let shutdown_mode = match args.shutdown.as_str() {
        "drain" => ShutdownMode::Drain,
        "immediate" => ShutdownMode::Immediate,
        other => {
            return Err(format!("unknown shutdown mode: {other} (use drain or immediate)").into())
        }
    };

    let mut config = ServerConfig {
        shutdown_mode,
        ..ServerConfig::default()
    };
    if let Some(threads) = args.threads {
        if threads == 0 {
            return Err("thread count must be positive".into());
        }
        config.threads_per_pool = threads;
    }

    let ctx = Arc::new(bootstrap(&config)?);
    let mut dispatcher = Dispatcher::new(Arc::clone(&ctx), &config);

    // Signals are handled on their own thread: set a flag, ring the
    // dispatcher's doorbell, and let all output happen on the dispatcher
    // thread.
    let mut signals = Signals::new([SIGINT, SIGTERM, SIGUSR1])?;
    let signals_handle = signals.handle();
    let signal_thread = {
        let running = dispatcher.running_flag();
        let status_requested = dispatcher.status_flag();
        let ctx = Arc::clone(&ctx);
        thread::Builder::new()
            .name("signals".to_string())
            .spawn(move || {
                for signal in signals.forever() {
                    if signal == SIGUSR1 {
                        status_requested.store(true, Ordering::Release);
                    } else {
                        log::info!("[SIGNAL] received {signal}, shutting down");
                        running.store(false, Ordering::Release);
                    }
                    if ctx.server_notify().post().is_err() {
                        break;
                    }
                }
            })?
    };

    println!(
        "Server started. PID={}, generation={}, cores={}, threads/pool={}, shutdown={}. \
         Waiting for requests...",
        std::process::id(),
        ctx.generation(),
        thread::available_parallelism().map_or(1, usize::from),
        config.threads_per_pool,
        config.shutdown_mode,
    );

    dispatcher.run();

    let pending = dispatcher.pending_tasks();
    match config.shutdown_mode {
        ShutdownMode::Drain => println!(
            "\nShutdown requested (drain mode). \
             {pending} pending task(s) will be finished before exit."
        ),
        ShutdownMode::Immediate => {
            println!("\nShutdown requested (immediate mode). Discarding pending task(s).")
        }
    }

    let report = dispatcher.shutdown_pools();
    if report.mode == ShutdownMode::Immediate && report.discarded() > 0 {
        println!("Discarded {} task(s).", report.discarded());
    }

    signals_handle.close();
    if signal_thread.join().is_err() {
        log::error!("[SIGNAL] handler thread panicked");
    }

    // Last references go away here, unlinking the region, the semaphores,
    // and the lock file.
    drop(dispatcher);
    drop(ctx);

    println!("Server shut down cleanly.");
    Ok(())
}
