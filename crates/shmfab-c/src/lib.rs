// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # C FFI bindings for the fabric client
//!
//! Builds `libipc.so`, the flat C API over [`shmfab::ClientSession`]:
//! `ipc_init`/`ipc_cleanup` manage a process-global session, the operation
//! functions mirror the session methods, and `ipc_get_result` hands back
//! the raw response union.
//!
//! Return-code convention: `0` success, `-1` local error,
//! [`IPC_NOT_READY`] (`1`) when a polled result is still in flight, and
//! [`IPC_ERR_SERVER_RESTARTED`] (`-2`) when a server restart invalidated
//! the request context.
//!
//! The global session lives behind a `Mutex`, so the API may be called
//! from multiple threads, one call at a time. No call panics across the
//! FFI boundary.

use shmfab::layout::{ResponsePayload, MAX_RESULT_LEN};
use shmfab::{ClientError, ClientSession, ReplyPayload, RequestId};
use std::ffi::CStr;
use std::os::raw::{c_char, c_int};
use std::sync::Mutex;

/// Result of `ipc_get_result` while the response is not yet available.
pub const IPC_NOT_READY: c_int = 1;

/// A server restart was detected; previously issued request ids are gone.
pub const IPC_ERR_SERVER_RESTARTED: c_int = -2;

const IPC_OK: c_int = 0;
const IPC_ERR: c_int = -1;

static SESSION: Mutex<Option<ClientSession>> = Mutex::new(None);

fn with_session<F>(f: F) -> c_int
where
    F: FnOnce(&mut ClientSession) -> c_int,
{
    let Ok(mut guard) = SESSION.lock() else {
        return IPC_ERR;
    };
    match guard.as_mut() {
        Some(session) => f(session),
        None => IPC_ERR,
    }
}

fn error_code(e: &ClientError) -> c_int {
    match e {
        ClientError::ServerRestarted => IPC_ERR_SERVER_RESTARTED,
        _ => IPC_ERR,
    }
}

/// Read a C string argument; `None` for null or non-UTF-8 input.
///
/// # Safety
///
/// `ptr` must be null or point to a NUL-terminated string.
unsafe fn cstr_arg<'a>(ptr: *const c_char) -> Option<&'a str> {
    if ptr.is_null() {
        return None;
    }
    CStr::from_ptr(ptr).to_str().ok()
}

/// Connect the process-global session to a running server.
///
/// Returns 0 on success, -1 on failure. Must be called before any other
/// `ipc_` function.
#[no_mangle]
pub extern "C" fn ipc_init() -> c_int {
    let Ok(mut guard) = SESSION.lock() else {
        return IPC_ERR;
    };
    match ClientSession::connect_default() {
        Ok(session) => {
            *guard = Some(session);
            IPC_OK
        }
        Err(e) => {
            log::error!("[FFI] ipc_init failed: {e}");
            IPC_ERR
        }
    }
}

/// Disconnect and release local handles. Never unlinks the shared objects;
/// the server owns those.
#[no_mangle]
pub extern "C" fn ipc_cleanup() {
    if let Ok(mut guard) = SESSION.lock() {
        *guard = None;
    }
}

/// Blocking addition.
///
/// # Safety
///
/// `result` must be null or point to writable `i32` storage.
#[no_mangle]
pub unsafe extern "C" fn ipc_add(a: i32, b: i32, result: *mut i32) -> c_int {
    if result.is_null() {
        return IPC_ERR;
    }
    with_session(|session| match session.add(a, b) {
        Ok(value) => {
            *result = value;
            IPC_OK
        }
        Err(e) => error_code(&e),
    })
}

/// Blocking subtraction.
///
/// # Safety
///
/// `result` must be null or point to writable `i32` storage.
#[no_mangle]
pub unsafe extern "C" fn ipc_subtract(a: i32, b: i32, result: *mut i32) -> c_int {
    if result.is_null() {
        return IPC_ERR;
    }
    with_session(|session| match session.subtract(a, b) {
        Ok(value) => {
            *result = value;
            IPC_OK
        }
        Err(e) => error_code(&e),
    })
}

/// Asynchronous multiplication; poll the id with `ipc_get_result`.
///
/// # Safety
///
/// `request_id` must be null or point to writable `u64` storage.
#[no_mangle]
pub unsafe extern "C" fn ipc_multiply(a: i32, b: i32, request_id: *mut u64) -> c_int {
    if request_id.is_null() {
        return IPC_ERR;
    }
    with_session(|session| match session.multiply(a, b) {
        Ok(id) => {
            *request_id = id.0;
            IPC_OK
        }
        Err(e) => error_code(&e),
    })
}

/// Asynchronous division; a zero divisor is reported via the response
/// status, not the return code.
///
/// # Safety
///
/// `request_id` must be null or point to writable `u64` storage.
#[no_mangle]
pub unsafe extern "C" fn ipc_divide(a: i32, b: i32, request_id: *mut u64) -> c_int {
    if request_id.is_null() {
        return IPC_ERR;
    }
    with_session(|session| match session.divide(a, b) {
        Ok(id) => {
            *request_id = id.0;
            IPC_OK
        }
        Err(e) => error_code(&e),
    })
}

/// Asynchronous concatenation of two strings of 1..=16 bytes.
///
/// # Safety
///
/// `s1` and `s2` must be null or NUL-terminated; `request_id` must be null
/// or point to writable `u64` storage.
#[no_mangle]
pub unsafe extern "C" fn ipc_concat(
    s1: *const c_char,
    s2: *const c_char,
    request_id: *mut u64,
) -> c_int {
    if request_id.is_null() {
        return IPC_ERR;
    }
    let (Some(s1), Some(s2)) = (cstr_arg(s1), cstr_arg(s2)) else {
        return IPC_ERR;
    };
    with_session(|session| match session.concat(s1, s2) {
        Ok(id) => {
            *request_id = id.0;
            IPC_OK
        }
        Err(e) => error_code(&e),
    })
}

/// Asynchronous substring search.
///
/// # Safety
///
/// `haystack` and `needle` must be null or NUL-terminated; `request_id`
/// must be null or point to writable `u64` storage.
#[no_mangle]
pub unsafe extern "C" fn ipc_search(
    haystack: *const c_char,
    needle: *const c_char,
    request_id: *mut u64,
) -> c_int {
    if request_id.is_null() {
        return IPC_ERR;
    }
    let (Some(haystack), Some(needle)) = (cstr_arg(haystack), cstr_arg(needle)) else {
        return IPC_ERR;
    };
    with_session(|session| match session.search(haystack, needle) {
        Ok(id) => {
            *request_id = id.0;
            IPC_OK
        }
        Err(e) => error_code(&e),
    })
}

/// Poll for the result of an asynchronous call.
///
/// Returns 0 when the result was copied out (consuming the slot),
/// [`IPC_NOT_READY`] while in flight, [`IPC_ERR_SERVER_RESTARTED`] after a
/// restart, and -1 for unknown ids or local failures.
///
/// # Safety
///
/// `result` and `status` must be null or point to writable storage of the
/// corresponding types.
#[no_mangle]
pub unsafe extern "C" fn ipc_get_result(
    request_id: u64,
    result: *mut ResponsePayload,
    status: *mut u32,
) -> c_int {
    if result.is_null() || status.is_null() {
        return IPC_ERR;
    }
    with_session(|session| match session.poll(RequestId(request_id)) {
        Ok(Some(reply)) => {
            *result = encode_payload(&reply.payload);
            *status = reply.status.as_raw();
            IPC_OK
        }
        Ok(None) => IPC_NOT_READY,
        Err(e) => error_code(&e),
    })
}

fn encode_payload(payload: &ReplyPayload) -> ResponsePayload {
    match payload {
        ReplyPayload::Number(value) => ResponsePayload { math_result: *value },
        ReplyPayload::Position(position) => ResponsePayload {
            position: *position,
        },
        ReplyPayload::Text(text) => {
            let mut out = ResponsePayload::zeroed();
            let bytes = text.as_bytes();
            let n = bytes.len().min(MAX_RESULT_LEN - 1);
            // SAFETY: writing through the `text` view of a zeroed union;
            // the copy stays inside the buffer and keeps the terminator.
            unsafe {
                out.text[..n].copy_from_slice(&bytes[..n]);
            }
            out
        }
    }
}
