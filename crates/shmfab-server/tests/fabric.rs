// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! End-to-end fabric tests.
//!
//! Each test bootstraps a real server (shared region, semaphores,
//! dispatcher thread, worker pools) inside this process under a unique
//! object-name prefix, then drives it through `ClientSession` exactly as a
//! separate client process would.

use shmfab::layout::{slot_ptr, SlotState};
use shmfab::{ClientError, ClientSession, ObjectNames, ReplyPayload, RequestId, Status};
use shmfab_server::{
    bootstrap, Dispatcher, ServerConfig, ServerContext, ShutdownMode, ShutdownReport,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

fn unique_config(tag: &str, threads: usize, mode: ShutdownMode) -> ServerConfig {
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    ServerConfig {
        names: ObjectNames::with_prefix(&format!("/shmfab_it_{tag}_{ts}")).unwrap(),
        threads_per_pool: threads,
        shutdown_mode: mode,
        lock_path: std::env::temp_dir().join(format!("shmfab_it_{tag}_{ts}.lock")),
        generation_path: std::env::temp_dir().join(format!("shmfab_it_{tag}_{ts}.generation")),
    }
}

/// One in-process server instance: context, dispatcher thread, pools.
struct TestFabric {
    config: ServerConfig,
    ctx: Arc<ServerContext>,
    running: Arc<AtomicBool>,
    status_requested: Arc<AtomicBool>,
    thread: Option<JoinHandle<ShutdownReport>>,
    cleanup_files: bool,
}

impl TestFabric {
    fn start(tag: &str, threads: usize, mode: ShutdownMode) -> Self {
        Self::start_with_config(unique_config(tag, threads, mode))
    }

    fn start_with_config(config: ServerConfig) -> Self {
        let ctx = Arc::new(bootstrap(&config).expect("bootstrap"));
        let mut dispatcher = Dispatcher::new(Arc::clone(&ctx), &config);
        let running = dispatcher.running_flag();
        let status_requested = dispatcher.status_flag();
        let thread = thread::spawn(move || {
            dispatcher.run();
            dispatcher.shutdown_pools()
        });
        Self {
            config,
            ctx,
            running,
            status_requested,
            thread: Some(thread),
            cleanup_files: true,
        }
    }

    fn client(&self) -> ClientSession {
        ClientSession::connect(self.config.names.clone()).expect("client connect")
    }

    /// Stop the dispatcher and join it, returning the pool shutdown report.
    fn stop(&mut self) -> ShutdownReport {
        self.running.store(false, Ordering::Release);
        self.ctx.server_notify().post().ok();
        self.thread
            .take()
            .map(|t| t.join().expect("dispatcher thread"))
            .unwrap_or(ShutdownReport {
                mode: self.config.shutdown_mode,
                discarded_math: 0,
                discarded_string: 0,
            })
    }

    /// Full restart: tear everything down (unlinking all names), then
    /// bootstrap a fresh instance under the same names and counter file.
    fn restart(mut self) -> Self {
        let config = self.config.clone();
        self.stop();
        self.cleanup_files = false;
        drop(self);
        Self::start_with_config(config)
    }
}

impl Drop for TestFabric {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.stop();
        }
        if self.cleanup_files {
            std::fs::remove_file(&self.config.generation_path).ok();
        }
    }
}

/// Poll until the reply lands or `deadline` passes.
fn poll_until(client: &mut ClientSession, id: RequestId, deadline: Duration) -> shmfab::Reply {
    let start = Instant::now();
    loop {
        match client.poll(id) {
            Ok(Some(reply)) => return reply,
            Ok(None) => {
                assert!(
                    start.elapsed() < deadline,
                    "request {id} did not complete within {deadline:?}"
                );
                thread::sleep(Duration::from_millis(100));
            }
            Err(e) => panic!("poll({id}) failed: {e}"),
        }
    }
}

#[test]
fn test_blocking_math_round_trips() {
    let fabric = TestFabric::start("addsub", 2, ShutdownMode::Drain);
    let mut client = fabric.client();

    assert_eq!(client.add(3, 4).unwrap(), 7);
    assert_eq!(client.add(-5, 3).unwrap(), -2);
    assert_eq!(client.subtract(10, 4).unwrap(), 6);
    assert_eq!(client.subtract(4, 10).unwrap(), -6);
}

#[test]
fn test_async_multiply_completes_after_delay() {
    let fabric = TestFabric::start("mul", 1, ShutdownMode::Drain);
    let mut client = fabric.client();

    let id = client.multiply(2, 3).unwrap();
    // The worker holds Mul for two seconds, so the first poll is in-flight.
    assert_eq!(client.poll(id).unwrap(), None);

    let reply = poll_until(&mut client, id, Duration::from_secs(10));
    assert_eq!(reply.status, Status::Ok);
    assert_eq!(reply.payload, ReplyPayload::Number(6));
}

#[test]
fn test_divide_by_zero_status() {
    let fabric = TestFabric::start("divzero", 1, ShutdownMode::Drain);
    let mut client = fabric.client();

    let id = client.divide(10, 0).unwrap();
    let reply = poll_until(&mut client, id, Duration::from_secs(10));
    assert_eq!(reply.status, Status::DivByZero);
}

#[test]
fn test_divide_truncates_toward_zero() {
    let fabric = TestFabric::start("div", 1, ShutdownMode::Drain);
    let mut client = fabric.client();

    let id = client.divide(-7, 2).unwrap();
    let reply = poll_until(&mut client, id, Duration::from_secs(10));
    assert_eq!(reply.status, Status::Ok);
    assert_eq!(reply.payload, ReplyPayload::Number(-3));
}

#[test]
fn test_concat_end_to_end() {
    let fabric = TestFabric::start("concat", 1, ShutdownMode::Drain);
    let mut client = fabric.client();

    let id = client.concat("hello", "world").unwrap();
    let reply = poll_until(&mut client, id, Duration::from_secs(5));
    assert_eq!(reply.status, Status::Ok);
    assert_eq!(reply.payload, ReplyPayload::Text("helloworld".to_string()));
}

#[test]
fn test_search_end_to_end() {
    let fabric = TestFabric::start("search", 1, ShutdownMode::Drain);
    let mut client = fabric.client();

    let id = client.search("abcdef", "cd").unwrap();
    let reply = poll_until(&mut client, id, Duration::from_secs(5));
    assert_eq!(reply.status, Status::Ok);
    assert_eq!(reply.payload, ReplyPayload::Position(2));

    let id = client.search("abcdef", "xyz").unwrap();
    let reply = poll_until(&mut client, id, Duration::from_secs(5));
    assert_eq!(reply.status, Status::NotFound);
    assert_eq!(reply.payload, ReplyPayload::Position(-1));
}

#[test]
fn test_invalid_strings_rejected_before_submission() {
    let fabric = TestFabric::start("badstr", 1, ShutdownMode::Drain);
    let mut client = fabric.client();

    assert!(matches!(
        client.concat("", "world"),
        Err(ClientError::InvalidText)
    ));
    assert!(matches!(
        client.search("abc", "0123456789abcdefg"),
        Err(ClientError::InvalidText)
    ));

    // Nothing was submitted: the fabric still serves a full round trip.
    assert_eq!(client.add(1, 1).unwrap(), 2);
}

#[test]
fn test_unknown_request_id() {
    let fabric = TestFabric::start("unknown", 1, ShutdownMode::Drain);
    let mut client = fabric.client();

    assert!(matches!(
        client.poll(RequestId(987_654)),
        Err(ClientError::UnknownRequest(987_654))
    ));
}

#[test]
fn test_request_ids_strictly_increase() {
    // No dispatcher: submissions park in their slots, which is all this
    // test needs.
    let config = unique_config("ids", 1, ShutdownMode::Drain);
    let ctx = bootstrap(&config).expect("bootstrap");
    let mut client = ClientSession::connect(config.names.clone()).expect("connect");

    let mut previous = 0;
    for i in 0..8 {
        let id = if i % 2 == 0 {
            client.multiply(i, i).unwrap()
        } else {
            client.concat("a", "b").unwrap()
        };
        assert!(id.0 > previous, "ids must strictly increase");
        previous = id.0;
    }

    drop(ctx);
    std::fs::remove_file(&config.generation_path).ok();
}

#[test]
fn test_slot_exhaustion_and_recovery() {
    // No dispatcher: all sixteen submissions stay parked in their slots.
    let config = unique_config("full", 1, ShutdownMode::Drain);
    let ctx = bootstrap(&config).expect("bootstrap");
    let mut client = ClientSession::connect(config.names.clone()).expect("connect");

    let mut ids = Vec::new();
    for _ in 0..16 {
        ids.push(client.multiply(6, 7).unwrap());
    }

    // Seventeenth in-flight submission finds no free slot.
    assert!(matches!(
        client.multiply(6, 7),
        Err(ClientError::NoFreeSlot)
    ));

    // Completing one request by hand (what a worker would do) frees its
    // slot once the client consumes the response.
    let first = ids[0];
    ctx.mutex().wait().unwrap();
    let region = ctx.region_ptr();
    // SAFETY: mutex held; the slot carrying `first` was written by the
    // submission above.
    unsafe {
        for i in 0..shmfab::MAX_SLOTS {
            let slot = slot_ptr(region, i);
            if (*slot).request_id == first.0 {
                (*slot).response.math_result = 42;
                (*slot).status = Status::Ok.as_raw();
                (*slot).state = SlotState::ResponseReady.as_raw();
                break;
            }
        }
    }
    ctx.mutex().post().unwrap();

    let reply = client.poll(first).unwrap().expect("completed by hand");
    assert_eq!(reply.payload, ReplyPayload::Number(42));

    // One slot is free again.
    assert!(client.multiply(6, 7).is_ok());

    drop(ctx);
    std::fs::remove_file(&config.generation_path).ok();
}

#[test]
fn test_restart_invalidates_inflight_request() {
    let fabric = TestFabric::start("restart", 1, ShutdownMode::Immediate);
    let mut client = fabric.client();
    let old_generation = client.generation().unwrap();

    let id = client.multiply(2, 3).unwrap();

    // Kill and relaunch the server while the request is in flight.
    let fabric = fabric.restart();

    match client.poll(id) {
        Err(ClientError::ServerRestarted) => {}
        other => panic!("expected ServerRestarted, got {other:?}"),
    }

    // The session reconnected to the fresh instance on its own; the
    // persisted counter guarantees a new generation.
    let new_generation = client.generation().unwrap();
    assert!(new_generation > old_generation);

    // Re-issuing under the new generation completes normally.
    let id = client.multiply(2, 3).unwrap();
    let reply = poll_until(&mut client, id, Duration::from_secs(10));
    assert_eq!(reply.status, Status::Ok);
    assert_eq!(reply.payload, ReplyPayload::Number(6));

    drop(fabric);
}

#[test]
fn test_immediate_shutdown_discards_queued_tasks() {
    let mut fabric = TestFabric::start("immediate", 1, ShutdownMode::Immediate);
    let mut client = fabric.client();

    // One slow task occupies the single math worker; two more queue up.
    for _ in 0..3 {
        client.multiply(3, 3).unwrap();
    }
    // Give the dispatcher time to hand all three to the pool.
    thread::sleep(Duration::from_millis(500));

    let report = fabric.stop();
    assert_eq!(report.mode, ShutdownMode::Immediate);
    assert_eq!(report.discarded(), 2, "queued tasks behind the running one");
}

#[test]
fn test_drain_shutdown_discards_nothing() {
    let mut fabric = TestFabric::start("drain", 1, ShutdownMode::Drain);
    let mut client = fabric.client();

    for _ in 0..2 {
        client.multiply(2, 2).unwrap();
    }
    thread::sleep(Duration::from_millis(500));

    let report = fabric.stop();
    assert_eq!(report.discarded(), 0);
}

#[test]
fn test_close_and_reconnect_is_observable_noop() {
    let fabric = TestFabric::start("recycle", 1, ShutdownMode::Drain);

    let mut first = fabric.client();
    let generation = first.generation().unwrap();
    assert_eq!(first.add(20, 22).unwrap(), 42);
    first.close();
    assert!(!first.is_connected());
    drop(first);

    let mut second = fabric.client();
    assert_eq!(second.generation().unwrap(), generation);
    assert_eq!(second.add(20, 22).unwrap(), 42);
}

#[test]
fn test_status_report_does_not_disturb_service() {
    let fabric = TestFabric::start("status", 1, ShutdownMode::Drain);
    let mut client = fabric.client();

    assert_eq!(client.add(1, 2).unwrap(), 3);

    // What SIGUSR1 does: raise the flag and ring the doorbell. The report
    // goes to stdout; service must continue undisturbed afterwards.
    fabric.status_requested.store(true, Ordering::Release);
    fabric.ctx.server_notify().post().unwrap();

    assert_eq!(client.add(2, 3).unwrap(), 5);
}
