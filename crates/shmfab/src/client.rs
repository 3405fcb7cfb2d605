// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Client-side session.
//!
//! A [`ClientSession`] maps the shared region, opens every semaphore, and
//! remembers the server generation it connected to. All operations run the
//! same protocol skeleton: refresh the connection, take the region mutex
//! (with timeout-driven recovery), re-check the generation, then touch
//! slots.
//!
//! # Restart Recovery
//!
//! Three cues mark a server restart, any one of which triggers a full
//! reconnect (close and re-open every handle) and surfaces
//! [`ClientError::ServerRestarted`] to the caller:
//!
//! - the kernel object backing the region name changed identity,
//! - the region's `server_generation` differs from the cached value,
//! - timed waits on the region mutex exhaust their retry bound.
//!
//! Blocking calls never retry the request themselves; the caller re-issues
//! if desired.
//!
//! # Stale Wakeups
//!
//! A per-slot semaphore can still hold a token posted for an earlier tenant
//! of the same slot. A blocking waiter therefore re-checks, under the mutex,
//! that the slot's `request_id` matches its own request and that the state
//! is `ResponseReady`, and goes back to waiting on any mismatch.

use crate::layout::{
    slot_ptr, Command, CommandFamily, MathArgs, RequestPayload, ResponsePayload, SharedRegion,
    SlotState, Status, StringArgs, MAX_SLOTS, MAX_STRING_LEN, REGION_SIZE,
};
use crate::names::ObjectNames;
use crate::sem::NamedSemaphore;
use crate::shm::ShmSegment;
use crate::{layout, IpcError};
use std::fmt;
use std::ptr;
use std::time::Duration;

/// Timed waits are retried in one-second slices so restart probes run even
/// while a semaphore stays silent.
const WAIT_SLICE: Duration = Duration::from_secs(1);

/// Mutex acquisition gives up and forces a reconnect after this many timed
/// slices.
const MUTEX_RETRIES: usize = 5;

/// A blocking call abandons its slot semaphore after this many wakeups or
/// timeouts and forces a reconnect.
const SLOT_WAIT_RETRIES: usize = 16;

/// Identifier assigned to a submission, unique within a server generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Typed response value, decoded per the slot's command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyPayload {
    /// Result of `Add`/`Sub`/`Mul`/`Div`.
    Number(i32),
    /// Result of `Concat`.
    Text(String),
    /// Result of `Search`: zero-based byte offset, or -1 when absent.
    Position(i32),
}

/// A completed response as read from a slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub status: Status,
    pub payload: ReplyPayload,
}

/// Errors surfaced by [`ClientSession`] operations.
#[derive(Debug)]
pub enum ClientError {
    /// The server restarted; the session reconnected to the fresh instance
    /// and the caller should re-issue the request.
    ServerRestarted,

    /// The session holds no connection (never connected, or a reconnect
    /// failed earlier).
    NotConnected,

    /// A restart was detected but reconnecting to the new instance failed;
    /// the session is left disconnected.
    Reconnect(IpcError),

    /// All 16 slots are in flight; try again after consuming a result.
    NoFreeSlot,

    /// No in-flight slot carries this request id.
    UnknownRequest(u64),

    /// String argument outside 1..=16 bytes; nothing was submitted.
    InvalidText,

    /// The server completed the request with a non-ok status.
    Failed(Status),

    /// Primitive failure (semaphore or mapping).
    Ipc(IpcError),
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ServerRestarted => write!(f, "server restarted; request context invalidated"),
            Self::NotConnected => write!(f, "session is not connected"),
            Self::Reconnect(e) => write!(f, "server restarted and reconnect failed: {e}"),
            Self::NoFreeSlot => write!(f, "no free slots"),
            Self::UnknownRequest(id) => write!(f, "unknown request id {id}"),
            Self::InvalidText => write!(
                f,
                "string arguments must be 1..={MAX_STRING_LEN} bytes"
            ),
            Self::Failed(status) => write!(f, "request failed: {status}"),
            Self::Ipc(e) => write!(f, "ipc failure: {e}"),
        }
    }
}

impl std::error::Error for ClientError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Reconnect(e) | Self::Ipc(e) => Some(e),
            _ => None,
        }
    }
}

impl From<IpcError> for ClientError {
    fn from(e: IpcError) -> Self {
        Self::Ipc(e)
    }
}

/// Everything opened against one server incarnation.
struct Connection {
    region: ShmSegment,
    mutex: NamedSemaphore,
    server_notify: NamedSemaphore,
    slot_sems: Vec<NamedSemaphore>,
    generation: u64,
}

impl Connection {
    fn open(names: &ObjectNames) -> crate::Result<Self> {
        let region = ShmSegment::open(&names.region(), REGION_SIZE)?;
        let mutex = NamedSemaphore::open(&names.mutex())?;
        let server_notify = NamedSemaphore::open(&names.server_notify())?;
        let mut slot_sems = Vec::with_capacity(MAX_SLOTS);
        for i in 0..MAX_SLOTS {
            slot_sems.push(NamedSemaphore::open(&names.slot(i))?);
        }

        let ptr = region.as_ptr() as *mut SharedRegion;
        // SAFETY: the mapping is REGION_SIZE bytes; the generation field is
        // read without the mutex, which is tolerated for this probe (a torn
        // value either matches and we proceed or mismatches and we
        // reconnect).
        let generation = unsafe { ptr::read_volatile(ptr::addr_of!((*ptr).server_generation)) };

        log::debug!(
            "[CLIENT] connected to {} (generation {generation})",
            names.region()
        );

        Ok(Self {
            region,
            mutex,
            server_notify,
            slot_sems,
            generation,
        })
    }

    #[inline]
    fn region_ptr(&self) -> *mut SharedRegion {
        self.region.as_ptr() as *mut SharedRegion
    }

    /// Unlocked generation probe; see the tolerance note in `open`.
    fn live_generation(&self) -> u64 {
        let ptr = self.region_ptr();
        // SAFETY: the mapping stays valid for the connection's lifetime.
        unsafe { ptr::read_volatile(ptr::addr_of!((*ptr).server_generation)) }
    }
}

/// Process-local handle to the fabric.
///
/// Operations take `&mut self`; one session serves one thread at a time.
/// Wrap it in a lock to share across threads.
pub struct ClientSession {
    names: ObjectNames,
    conn: Option<Connection>,
}

impl ClientSession {
    /// Open the region and every semaphore under `names` and cache the
    /// current server generation.
    pub fn connect(names: ObjectNames) -> Result<Self, ClientError> {
        let conn = Connection::open(&names)?;
        Ok(Self {
            names,
            conn: Some(conn),
        })
    }

    /// Connect under the default object names.
    pub fn connect_default() -> Result<Self, ClientError> {
        Self::connect(ObjectNames::new())
    }

    /// Whether the session currently holds a connection.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    /// Server generation this session is bound to.
    #[must_use]
    pub fn generation(&self) -> Option<u64> {
        self.conn.as_ref().map(|c| c.generation)
    }

    /// Drop all handles. The session can be reconnected only implicitly, by
    /// the restart-recovery path of a later call, so most callers just drop
    /// the session instead.
    pub fn close(&mut self) {
        if self.conn.take().is_some() {
            log::debug!("[CLIENT] disconnected from {}", self.names.region());
        }
    }

    // --- blocking operations ---

    /// Add two integers, blocking until the server replies.
    pub fn add(&mut self, a: i32, b: i32) -> Result<i32, ClientError> {
        self.blocking_math(Command::Add, a, b)
    }

    /// Subtract `b` from `a`, blocking until the server replies.
    pub fn subtract(&mut self, a: i32, b: i32) -> Result<i32, ClientError> {
        self.blocking_math(Command::Sub, a, b)
    }

    // --- asynchronous operations ---

    /// Submit a multiplication; poll the returned id for the product.
    pub fn multiply(&mut self, a: i32, b: i32) -> Result<RequestId, ClientError> {
        self.async_math(Command::Mul, a, b)
    }

    /// Submit a division; poll the returned id for the quotient. Division
    /// by zero is reported by the server as [`Status::DivByZero`].
    pub fn divide(&mut self, a: i32, b: i32) -> Result<RequestId, ClientError> {
        self.async_math(Command::Div, a, b)
    }

    /// Submit a concatenation of two strings of 1..=16 bytes each.
    pub fn concat(&mut self, s1: &str, s2: &str) -> Result<RequestId, ClientError> {
        self.async_text(Command::Concat, s1, s2)
    }

    /// Submit a substring search for `needle` inside `haystack`.
    pub fn search(&mut self, haystack: &str, needle: &str) -> Result<RequestId, ClientError> {
        self.async_text(Command::Search, haystack, needle)
    }

    /// Poll for the response to an asynchronous submission.
    ///
    /// `Ok(Some(_))` consumes the slot; `Ok(None)` means the request is
    /// still in flight. An id no slot carries yields
    /// [`ClientError::UnknownRequest`].
    pub fn poll(&mut self, id: RequestId) -> Result<Option<Reply>, ClientError> {
        self.ensure_fresh_connection()?;
        self.lock_mutex_with_recovery()?;
        let conn = self.conn.as_ref().ok_or(ClientError::NotConnected)?;
        let region = conn.region_ptr();

        // SAFETY: mutex held; the mapping is REGION_SIZE bytes.
        let generation = unsafe { (*region).server_generation };
        if generation != conn.generation {
            let _ = conn.mutex.post();
            return Err(self.reconnect());
        }

        for i in 0..MAX_SLOTS {
            // SAFETY: mutex held, i < MAX_SLOTS.
            let slot = unsafe { slot_ptr(region, i) };
            let (state, slot_id) = unsafe { ((*slot).state, (*slot).request_id) };
            if slot_id != id.0 || state == SlotState::Free.as_raw() {
                continue;
            }
            if state == SlotState::ResponseReady.as_raw() {
                // SAFETY: mutex held; the worker published the response
                // before the state flipped to ResponseReady.
                let reply = unsafe {
                    let reply =
                        decode_reply((*slot).command, (*slot).status, &(*slot).response);
                    reset_slot(slot);
                    reply
                };
                conn.mutex.post()?;
                return Ok(Some(reply));
            }
            conn.mutex.post()?;
            return Ok(None);
        }

        conn.mutex.post()?;
        Err(ClientError::UnknownRequest(id.0))
    }

    // --- protocol internals ---

    fn blocking_math(&mut self, cmd: Command, a: i32, b: i32) -> Result<i32, ClientError> {
        let payload = RequestPayload {
            math: MathArgs { a, b },
        };
        let (slot_index, id) = self.submit(cmd, payload)?;
        self.wait_for_reply(slot_index, id)
    }

    fn async_math(&mut self, cmd: Command, a: i32, b: i32) -> Result<RequestId, ClientError> {
        let payload = RequestPayload {
            math: MathArgs { a, b },
        };
        let (_, id) = self.submit(cmd, payload)?;
        Ok(RequestId(id))
    }

    fn async_text(&mut self, cmd: Command, s1: &str, s2: &str) -> Result<RequestId, ClientError> {
        if !valid_text(s1) || !valid_text(s2) {
            return Err(ClientError::InvalidText);
        }
        let payload = RequestPayload {
            string: StringArgs {
                s1: layout::pack_text(s1.as_bytes()),
                s2: layout::pack_text(s2.as_bytes()),
            },
        };
        let (_, id) = self.submit(cmd, payload)?;
        Ok(RequestId(id))
    }

    /// Claim a free slot, fill it, and ring the server doorbell.
    fn submit(
        &mut self,
        cmd: Command,
        payload: RequestPayload,
    ) -> Result<(usize, u64), ClientError> {
        self.ensure_fresh_connection()?;
        self.lock_mutex_with_recovery()?;
        let conn = self.conn.as_ref().ok_or(ClientError::NotConnected)?;
        let region = conn.region_ptr();

        // SAFETY: mutex held for everything below until the post.
        let generation = unsafe { (*region).server_generation };
        if generation != conn.generation {
            let _ = conn.mutex.post();
            return Err(self.reconnect());
        }

        let mut free = None;
        for i in 0..MAX_SLOTS {
            // SAFETY: mutex held, i < MAX_SLOTS.
            let state = unsafe { (*slot_ptr(region, i)).state };
            if state == SlotState::Free.as_raw() {
                free = Some(i);
                break;
            }
        }
        let Some(index) = free else {
            conn.mutex.post()?;
            log::debug!("[CLIENT] submission rejected: no free slots");
            return Err(ClientError::NoFreeSlot);
        };

        // SAFETY: mutex held; `index` came from the scan above.
        let id = unsafe {
            let id = (*region).next_request_id;
            (*region).next_request_id = id + 1;
            let slot = slot_ptr(region, index);
            (*slot).request_id = id;
            (*slot).client_pid = std::process::id() as i32;
            (*slot).command = cmd.as_raw();
            (*slot).request = payload;
            (*slot).status = Status::Ok.as_raw();
            (*slot).state = SlotState::RequestPending.as_raw();
            id
        };

        conn.mutex.post()?;
        conn.server_notify.post()?;
        log::debug!("[CLIENT] submitted {cmd:?} as request {id} in slot {index}");
        Ok((index, id))
    }

    /// Block on the slot doorbell until this request's response is read.
    fn wait_for_reply(&mut self, slot_index: usize, expected_id: u64) -> Result<i32, ClientError> {
        for _ in 0..SLOT_WAIT_RETRIES {
            let conn = self.conn.as_ref().ok_or(ClientError::NotConnected)?;
            if !conn.slot_sems[slot_index].wait_timeout(WAIT_SLICE)? {
                self.ensure_fresh_connection()?;
                continue;
            }

            self.lock_mutex_with_recovery()?;
            let conn = self.conn.as_ref().ok_or(ClientError::NotConnected)?;
            let region = conn.region_ptr();
            // SAFETY: mutex held, slot_index < MAX_SLOTS.
            let slot = unsafe { slot_ptr(region, slot_index) };
            let (state, slot_id) = unsafe { ((*slot).state, (*slot).request_id) };

            if slot_id == expected_id && state == SlotState::ResponseReady.as_raw() {
                // SAFETY: mutex held; response was published before the
                // state flipped.
                let (result, status_raw) =
                    unsafe { ((*slot).response.math_result, (*slot).status) };
                unsafe { reset_slot(slot) };
                conn.mutex.post()?;

                let status = Status::from_raw(status_raw).unwrap_or(Status::InternalError);
                return if status == Status::Ok {
                    Ok(result)
                } else {
                    Err(ClientError::Failed(status))
                };
            }

            // Token left over from an earlier tenant of this slot; ignore
            // it and wait again.
            log::debug!(
                "[CLIENT] stale wakeup on slot {slot_index} (expected request {expected_id})"
            );
            conn.mutex.post()?;
        }
        Err(self.reconnect())
    }

    /// Reconnect if the region was replaced or restamped since we attached.
    fn ensure_fresh_connection(&mut self) -> Result<(), ClientError> {
        let conn = self.conn.as_ref().ok_or(ClientError::NotConnected)?;

        let replaced = match ShmSegment::current_id(&self.names.region()) {
            Some(live) => live != conn.region.id(),
            // The name cannot be opened right now (server mid-restart or
            // gone); keep the current mapping and let the timed waits drive
            // recovery.
            None => false,
        };

        if replaced || conn.live_generation() != conn.generation {
            return Err(self.reconnect());
        }
        Ok(())
    }

    /// Acquire the region mutex, probing for a dead server on every
    /// timeout. Exhausting the retry bound forces a reconnect instead of
    /// hanging on a stale semaphore.
    fn lock_mutex_with_recovery(&mut self) -> Result<(), ClientError> {
        for _ in 0..MUTEX_RETRIES {
            let conn = self.conn.as_ref().ok_or(ClientError::NotConnected)?;
            if conn.mutex.wait_timeout(WAIT_SLICE)? {
                return Ok(());
            }
            self.ensure_fresh_connection()?;
        }
        Err(self.reconnect())
    }

    /// Tear down and re-open every handle. Returns the error the caller
    /// must surface: `ServerRestarted` when the fresh instance is up,
    /// `Reconnect` when it is not.
    fn reconnect(&mut self) -> ClientError {
        self.conn = None;
        match Connection::open(&self.names) {
            Ok(conn) => {
                log::debug!(
                    "[CLIENT] reconnected to {} (generation {})",
                    self.names.region(),
                    conn.generation
                );
                self.conn = Some(conn);
                ClientError::ServerRestarted
            }
            Err(e) => {
                log::warn!("[CLIENT] reconnect to {} failed: {e}", self.names.region());
                ClientError::Reconnect(e)
            }
        }
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        self.close();
    }
}

/// Return the slot to the free pool. Clearing the id keeps retired ids from
/// ever matching a later poll.
///
/// # Safety
///
/// `slot` must point into a live mapping and the region mutex must be held.
unsafe fn reset_slot(slot: *mut crate::layout::MessageSlot) {
    (*slot).state = SlotState::Free.as_raw();
    (*slot).request_id = 0;
}

fn valid_text(s: &str) -> bool {
    (1..=MAX_STRING_LEN).contains(&s.len())
}

/// Interpret a published response through the slot's command.
///
/// # Safety
///
/// `response` must come from a slot in `ResponseReady` state, read under
/// the region mutex.
unsafe fn decode_reply(command_raw: u32, status_raw: u32, response: &ResponsePayload) -> Reply {
    let status = Status::from_raw(status_raw).unwrap_or(Status::InternalError);
    let payload = match Command::from_raw(command_raw).map(Command::family) {
        Some(CommandFamily::Math) => ReplyPayload::Number(response.math_result),
        Some(CommandFamily::Text) => match Command::from_raw(command_raw) {
            Some(Command::Search) => ReplyPayload::Position(response.position),
            _ => ReplyPayload::Text(
                String::from_utf8_lossy(layout::text_bytes(&response.text)).into_owned(),
            ),
        },
        None => ReplyPayload::Number(response.math_result),
    };
    Reply { status, payload }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_text_bounds() {
        assert!(!valid_text(""));
        assert!(valid_text("a"));
        assert!(valid_text("0123456789abcdef"));
        assert!(!valid_text("0123456789abcdefg"));
    }

    #[test]
    fn test_decode_math_reply() {
        let response = ResponsePayload { math_result: -42 };
        // SAFETY: a stack payload is trivially a published POD value.
        let reply = unsafe {
            decode_reply(Command::Add.as_raw(), Status::Ok.as_raw(), &response)
        };
        assert_eq!(reply.status, Status::Ok);
        assert_eq!(reply.payload, ReplyPayload::Number(-42));
    }

    #[test]
    fn test_decode_text_reply() {
        let mut text = [0u8; crate::MAX_RESULT_LEN];
        text[..10].copy_from_slice(b"helloworld");
        let response = ResponsePayload { text };
        // SAFETY: as above.
        let reply = unsafe {
            decode_reply(Command::Concat.as_raw(), Status::Ok.as_raw(), &response)
        };
        assert_eq!(reply.payload, ReplyPayload::Text("helloworld".to_string()));
    }

    #[test]
    fn test_decode_search_reply() {
        let response = ResponsePayload { position: -1 };
        // SAFETY: as above.
        let reply = unsafe {
            decode_reply(
                Command::Search.as_raw(),
                Status::NotFound.as_raw(),
                &response,
            )
        };
        assert_eq!(reply.status, Status::NotFound);
        assert_eq!(reply.payload, ReplyPayload::Position(-1));
    }

    #[test]
    fn test_decode_unknown_raw_values() {
        let response = ResponsePayload { math_result: 7 };
        // SAFETY: as above.
        let reply = unsafe { decode_reply(99, 99, &response) };
        assert_eq!(reply.status, Status::InternalError);
        assert_eq!(reply.payload, ReplyPayload::Number(7));
    }

    #[test]
    fn test_connect_without_server_fails() {
        let names = ObjectNames::with_prefix("/shmfab_client_none_test").unwrap();
        assert!(ClientSession::connect(names).is_err());
    }
}
