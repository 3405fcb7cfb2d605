// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Worker-side request handlers.
//!
//! A handler receives a slot index that the dispatcher already moved to
//! `Processing`. It snapshots the operands under the region mutex, releases
//! the mutex across the compute step, re-acquires it to publish the
//! response, and finally posts the slot's semaphore to wake a blocking
//! client. Posting happens outside the critical section.
//!
//! Impossible command values still publish `InvalidInput` and flip the slot
//! to `ResponseReady` so it drains instead of sticking in `Processing`.

use crate::bootstrap::ServerContext;
use shmfab::layout::{
    self, slot_ptr, Command, ResponsePayload, SlotState, Status, MAX_RESULT_LEN, MAX_STRING_LEN,
};
use std::thread;
use std::time::Duration;

/// Deliberate latency applied to `Mul` and `Div` so asynchronous clients
/// can observe a request in flight.
pub const SLOW_MATH_DELAY: Duration = Duration::from_secs(2);

/// Handler for the math pool (`Add`, `Sub`, `Mul`, `Div`).
pub fn process_math(ctx: &ServerContext, slot_index: usize) {
    let region = ctx.region_ptr();

    if let Err(e) = ctx.mutex().wait() {
        log::error!("[WORKER] math slot {slot_index}: mutex wait failed: {e}");
        return;
    }
    // SAFETY: mutex held, slot_index < MAX_SLOTS.
    let (cmd_raw, a, b) = unsafe {
        let slot = slot_ptr(region, slot_index);
        ((*slot).command, (*slot).request.math.a, (*slot).request.math.b)
    };
    if let Err(e) = ctx.mutex().post() {
        log::error!("[WORKER] math slot {slot_index}: mutex post failed: {e}");
        return;
    }

    let cmd = Command::from_raw(cmd_raw);
    if matches!(cmd, Some(Command::Mul | Command::Div)) {
        thread::sleep(SLOW_MATH_DELAY);
    }

    let (result, status) = eval_math(cmd, a, b);
    publish(
        ctx,
        slot_index,
        ResponsePayload {
            math_result: result,
        },
        status,
    );
}

/// Handler for the string pool (`Concat`, `Search`).
pub fn process_string(ctx: &ServerContext, slot_index: usize) {
    let region = ctx.region_ptr();

    if let Err(e) = ctx.mutex().wait() {
        log::error!("[WORKER] string slot {slot_index}: mutex wait failed: {e}");
        return;
    }
    // SAFETY: mutex held, slot_index < MAX_SLOTS. The arrays are copied out
    // so the compute step runs without the mutex.
    let (cmd_raw, s1, s2) = unsafe {
        let slot = slot_ptr(region, slot_index);
        (
            (*slot).command,
            (*slot).request.string.s1,
            (*slot).request.string.s2,
        )
    };
    if let Err(e) = ctx.mutex().post() {
        log::error!("[WORKER] string slot {slot_index}: mutex post failed: {e}");
        return;
    }

    let (response, status) = eval_string(Command::from_raw(cmd_raw), &s1, &s2);
    publish(ctx, slot_index, response, status);
}

/// Write the response under the mutex and ring the slot doorbell.
fn publish(ctx: &ServerContext, slot_index: usize, response: ResponsePayload, status: Status) {
    let region = ctx.region_ptr();

    if let Err(e) = ctx.mutex().wait() {
        log::error!("[WORKER] slot {slot_index}: publish mutex wait failed: {e}");
        return;
    }
    // SAFETY: mutex held, slot_index < MAX_SLOTS. State flips to
    // ResponseReady only after response and status are in place.
    unsafe {
        let slot = slot_ptr(region, slot_index);
        (*slot).response = response;
        (*slot).status = status.as_raw();
        (*slot).state = SlotState::ResponseReady.as_raw();
    }
    if let Err(e) = ctx.mutex().post() {
        log::error!("[WORKER] slot {slot_index}: publish mutex post failed: {e}");
        return;
    }

    if let Err(e) = ctx.slot_sem(slot_index).post() {
        log::error!("[WORKER] slot {slot_index}: doorbell post failed: {e}");
    }
    log::debug!("[WORKER] slot {slot_index}: published {status:?}");
}

/// Math table. Wrapping arithmetic throughout; division truncates toward
/// zero and reports a zero divisor instead of computing.
fn eval_math(cmd: Option<Command>, a: i32, b: i32) -> (i32, Status) {
    match cmd {
        Some(Command::Add) => (a.wrapping_add(b), Status::Ok),
        Some(Command::Sub) => (a.wrapping_sub(b), Status::Ok),
        Some(Command::Mul) => (a.wrapping_mul(b), Status::Ok),
        Some(Command::Div) => {
            if b == 0 {
                (0, Status::DivByZero)
            } else {
                (a.wrapping_div(b), Status::Ok)
            }
        }
        _ => (0, Status::InvalidInput),
    }
}

/// String table over the two NUL-terminated input buffers.
fn eval_string(
    cmd: Option<Command>,
    s1: &[u8; MAX_STRING_LEN + 1],
    s2: &[u8; MAX_STRING_LEN + 1],
) -> (ResponsePayload, Status) {
    let a = layout::text_bytes(s1);
    let b = layout::text_bytes(s2);

    if a.is_empty() || a.len() > MAX_STRING_LEN || b.is_empty() || b.len() > MAX_STRING_LEN {
        return (ResponsePayload::zeroed(), Status::StrTooLong);
    }

    match cmd {
        Some(Command::Concat) => {
            let (text, status) = eval_concat(a, b);
            (ResponsePayload { text }, status)
        }
        Some(Command::Search) => {
            let (position, status) = eval_search(a, b);
            (ResponsePayload { position }, status)
        }
        _ => (ResponsePayload::zeroed(), Status::InvalidInput),
    }
}

/// `s1 || s2` into a NUL-terminated result buffer.
fn eval_concat(s1: &[u8], s2: &[u8]) -> ([u8; MAX_RESULT_LEN], Status) {
    let mut out = [0u8; MAX_RESULT_LEN];
    if s1.len() + s2.len() > MAX_RESULT_LEN - 1 {
        return (out, Status::StrTooLong);
    }
    out[..s1.len()].copy_from_slice(s1);
    out[s1.len()..s1.len() + s2.len()].copy_from_slice(s2);
    (out, Status::Ok)
}

/// First occurrence of `needle` in `haystack` as a zero-based byte offset,
/// or -1 when absent.
fn eval_search(haystack: &[u8], needle: &[u8]) -> (i32, Status) {
    if needle.len() <= haystack.len() {
        if let Some(pos) = haystack
            .windows(needle.len())
            .position(|window| window == needle)
        {
            return (pos as i32, Status::Ok);
        }
    }
    (-1, Status::NotFound)
}
