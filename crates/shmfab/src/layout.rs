// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Shared-memory wire layout.
//!
//! Every participant maps the same region and interprets it through the
//! `#[repr(C)]` structures below, so the layout is a wire format: field
//! widths and offsets are pinned and asserted at compile time. All fields
//! are plain POD; state, command, and status are stored as raw `u32` values
//! and converted through checked `from_raw` constructors on the way out.
//!
//! # Region Layout
//!
//! ```text
//! Offset  Size   Field
//! 0       8      server_generation (u64) - stamped at server startup
//! 8       8      next_request_id (u64)   - seeded to 1, bumped per submit
//! 16      1664   slots[16]               - 104 bytes each
//! ```
//!
//! # Slot Layout (104 bytes)
//!
//! ```text
//! Offset  Size   Field
//! 0       4      state (u32)
//! 8       8      request_id (u64)
//! 16      4      client_pid (i32)
//! 20      4      command (u32)
//! 24      36     request union  (MathArgs | StringArgs)
//! 60      36     response union (math_result | text | position)
//! 96      4      status (u32)
//! ```

use std::fmt;
use std::mem::{offset_of, size_of};

/// Number of concurrent in-flight requests (slot count).
pub const MAX_SLOTS: usize = 16;

/// Maximum length of an input string, excluding the NUL terminator.
pub const MAX_STRING_LEN: usize = 16;

/// Result string capacity: two concatenated inputs plus the NUL terminator.
pub const MAX_RESULT_LEN: usize = 33;

/// Lifecycle of a message slot.
///
/// `Free -> RequestPending -> Processing -> ResponseReady -> Free`.
/// Only the client that read a ready response resets the slot to `Free`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SlotState {
    Free = 0,
    RequestPending = 1,
    Processing = 2,
    ResponseReady = 3,
}

impl SlotState {
    /// Decode a raw state value read from shared memory.
    #[must_use]
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::Free),
            1 => Some(Self::RequestPending),
            2 => Some(Self::Processing),
            3 => Some(Self::ResponseReady),
            _ => None,
        }
    }

    #[inline]
    #[must_use]
    pub fn as_raw(self) -> u32 {
        self as u32
    }
}

/// Operation requested by a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Command {
    Add = 0,
    Sub = 1,
    Mul = 2,
    Div = 3,
    Concat = 4,
    Search = 5,
}

/// Which worker pool services a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandFamily {
    Math,
    Text,
}

impl Command {
    /// Decode a raw command value read from shared memory.
    #[must_use]
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::Add),
            1 => Some(Self::Sub),
            2 => Some(Self::Mul),
            3 => Some(Self::Div),
            4 => Some(Self::Concat),
            5 => Some(Self::Search),
            _ => None,
        }
    }

    #[inline]
    #[must_use]
    pub fn as_raw(self) -> u32 {
        self as u32
    }

    #[must_use]
    pub fn family(self) -> CommandFamily {
        match self {
            Self::Add | Self::Sub | Self::Mul | Self::Div => CommandFamily::Math,
            Self::Concat | Self::Search => CommandFamily::Text,
        }
    }
}

/// Outcome of a serviced request, written by the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Status {
    Ok = 0,
    DivByZero = 1,
    NotFound = 2,
    StrTooLong = 3,
    InvalidInput = 4,
    InternalError = 5,
}

impl Status {
    /// Decode a raw status value read from shared memory.
    #[must_use]
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::Ok),
            1 => Some(Self::DivByZero),
            2 => Some(Self::NotFound),
            3 => Some(Self::StrTooLong),
            4 => Some(Self::InvalidInput),
            5 => Some(Self::InternalError),
            _ => None,
        }
    }

    #[inline]
    #[must_use]
    pub fn as_raw(self) -> u32 {
        self as u32
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Ok => "ok",
            Self::DivByZero => "division by zero",
            Self::NotFound => "not found",
            Self::StrTooLong => "string too long",
            Self::InvalidInput => "invalid input",
            Self::InternalError => "internal error",
        };
        f.write_str(label)
    }
}

/// Operands for `Add`/`Sub`/`Mul`/`Div`.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct MathArgs {
    pub a: i32,
    pub b: i32,
}

/// Operands for `Concat`/`Search`: two NUL-terminated buffers, payload
/// length 1..=16.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct StringArgs {
    pub s1: [u8; MAX_STRING_LEN + 1],
    pub s2: [u8; MAX_STRING_LEN + 1],
}

/// Request operands; interpretation follows `MessageSlot::command`.
#[derive(Clone, Copy)]
#[repr(C)]
pub union RequestPayload {
    pub math: MathArgs,
    pub string: StringArgs,
}

impl RequestPayload {
    /// All-zero payload (both union views read as zeroed).
    #[must_use]
    pub const fn zeroed() -> Self {
        Self {
            string: StringArgs {
                s1: [0; MAX_STRING_LEN + 1],
                s2: [0; MAX_STRING_LEN + 1],
            },
        }
    }
}

/// Response value; interpretation follows `MessageSlot::command`.
#[derive(Clone, Copy)]
#[repr(C)]
pub union ResponsePayload {
    pub math_result: i32,
    pub text: [u8; MAX_RESULT_LEN],
    pub position: i32,
}

impl ResponsePayload {
    /// All-zero payload; `text` reads as the empty string.
    #[must_use]
    pub const fn zeroed() -> Self {
        Self {
            text: [0; MAX_RESULT_LEN],
        }
    }
}

/// One in-flight request/response pair.
///
/// `request_id` is meaningful only while `state != Free`; the consumer that
/// frees a slot clears it back to 0.
#[repr(C)]
pub struct MessageSlot {
    pub state: u32,
    pub request_id: u64,
    pub client_pid: i32,
    pub command: u32,
    pub request: RequestPayload,
    pub response: ResponsePayload,
    pub status: u32,
}

/// The entire mapped region.
#[repr(C)]
pub struct SharedRegion {
    pub server_generation: u64,
    pub next_request_id: u64,
    pub slots: [MessageSlot; MAX_SLOTS],
}

/// Byte size of one slot record.
pub const SLOT_SIZE: usize = 104;

/// Byte size of the mapped region.
pub const REGION_SIZE: usize = size_of::<SharedRegion>();

// The layout is shared between independently built processes; hold the
// compiler to the documented offsets.
const _: () = {
    assert!(size_of::<MessageSlot>() == SLOT_SIZE);
    assert!(size_of::<SharedRegion>() == 16 + MAX_SLOTS * SLOT_SIZE);
    assert!(offset_of!(SharedRegion, server_generation) == 0);
    assert!(offset_of!(SharedRegion, next_request_id) == 8);
    assert!(offset_of!(SharedRegion, slots) == 16);
    assert!(offset_of!(MessageSlot, state) == 0);
    assert!(offset_of!(MessageSlot, request_id) == 8);
    assert!(offset_of!(MessageSlot, client_pid) == 16);
    assert!(offset_of!(MessageSlot, command) == 20);
    assert!(offset_of!(MessageSlot, request) == 24);
    assert!(offset_of!(MessageSlot, response) == 60);
    assert!(offset_of!(MessageSlot, status) == 96);
};

/// Pointer to slot `index` of a mapped region.
///
/// # Safety
///
/// `region` must point to a live mapping of at least `REGION_SIZE` bytes and
/// `index` must be `< MAX_SLOTS`.
#[inline]
pub unsafe fn slot_ptr(region: *mut SharedRegion, index: usize) -> *mut MessageSlot {
    debug_assert!(index < MAX_SLOTS);
    std::ptr::addr_of_mut!((*region).slots[index])
}

/// Payload length of a NUL-terminated buffer (bytes before the first NUL,
/// capped at the buffer length).
#[must_use]
pub fn text_len(buf: &[u8]) -> usize {
    buf.iter().position(|&b| b == 0).unwrap_or(buf.len())
}

/// Payload bytes of a NUL-terminated buffer.
#[must_use]
pub fn text_bytes(buf: &[u8]) -> &[u8] {
    &buf[..text_len(buf)]
}

/// Copy `s` into a fixed NUL-terminated input buffer.
///
/// Callers validate the length first; anything longer than
/// [`MAX_STRING_LEN`] is truncated.
#[must_use]
pub fn pack_text(s: &[u8]) -> [u8; MAX_STRING_LEN + 1] {
    let mut buf = [0u8; MAX_STRING_LEN + 1];
    let n = s.len().min(MAX_STRING_LEN);
    buf[..n].copy_from_slice(&s[..n]);
    buf
}
