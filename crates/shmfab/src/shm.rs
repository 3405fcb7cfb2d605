// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! POSIX shared memory segment management.
//!
//! Safe wrappers around `shm_open`, `ftruncate`, and `mmap` for creating
//! and mapping the shared region.
//!
//! # Segment Lifecycle
//!
//! 1. The server creates the segment with [`ShmSegment::create`]
//! 2. Clients map it with [`ShmSegment::open`]
//! 3. Mappings are released on drop
//! 4. The server calls [`ShmSegment::unlink`] during teardown
//!
//! Every mapping captures the backing object's `(st_dev, st_ino)` pair as a
//! [`SegmentId`]; comparing it against [`ShmSegment::current_id`] for the
//! same name tells a client whether the object was replaced underneath it by
//! a restarted server.

use crate::{IpcError, Result};
use std::ffi::CString;
use std::io;
use std::mem::MaybeUninit;
use std::ptr;

/// Identity of the kernel object backing a mapping.
///
/// Two mappings of the same name compare equal only while the underlying
/// object has not been unlinked and recreated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentId {
    dev: u64,
    ino: u64,
}

/// POSIX shared memory segment wrapper.
///
/// Unmaps on drop. Does NOT unlink the name; the creator owns that.
pub struct ShmSegment {
    ptr: *mut u8,
    size: usize,
    name: String,
    id: SegmentId,
}

// SAFETY: the mapping is shared between processes by design; all access to
// the region's contents is serialized by the region mutex semaphore, and the
// wrapper itself only hands out the raw pointer.
unsafe impl Send for ShmSegment {}
unsafe impl Sync for ShmSegment {}

impl ShmSegment {
    /// Create a new segment of `size` bytes, replacing any stale object of
    /// the same name, and zero-fill it.
    pub fn create(name: &str, size: usize) -> Result<Self> {
        validate_name(name)?;
        let c_name = to_cstring(name)?;

        // SAFETY: c_name is a valid NUL-terminated string. shm_unlink on a
        // missing name is harmless (the error is ignored); shm_open with
        // O_CREAT|O_EXCL then either creates a fresh object or fails, which
        // is checked below.
        let fd = unsafe {
            libc::shm_unlink(c_name.as_ptr());
            libc::shm_open(
                c_name.as_ptr(),
                libc::O_CREAT | libc::O_RDWR | libc::O_EXCL,
                0o666,
            )
        };
        if fd < 0 {
            return Err(IpcError::SegmentCreate(io::Error::last_os_error()));
        }

        // SAFETY: fd is a valid descriptor from the shm_open above; on
        // failure we close it and drop the half-created name.
        let ret = unsafe { libc::ftruncate(fd, size as libc::off_t) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            // SAFETY: fd is still open; the name was created by us.
            unsafe {
                libc::close(fd);
                libc::shm_unlink(c_name.as_ptr());
            }
            return Err(IpcError::SegmentCreate(err));
        }

        let (id, ptr) = map_and_close(fd, size, &c_name, true)?;

        // SAFETY: ptr points to a fresh MAP_SHARED mapping of exactly `size`
        // bytes with write permission and no other users yet.
        unsafe {
            ptr::write_bytes(ptr, 0, size);
        }

        Ok(Self {
            ptr,
            size,
            name: name.to_string(),
            id,
        })
    }

    /// Map an existing segment.
    pub fn open(name: &str, size: usize) -> Result<Self> {
        validate_name(name)?;
        let c_name = to_cstring(name)?;

        // SAFETY: c_name is a valid NUL-terminated string; the result is
        // checked below.
        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDWR, 0) };
        if fd < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::NotFound {
                return Err(IpcError::NotFound(name.to_string()));
            }
            return Err(IpcError::SegmentOpen(err));
        }

        let (id, ptr) = map_and_close(fd, size, &c_name, false)?;

        Ok(Self {
            ptr,
            size,
            name: name.to_string(),
            id,
        })
    }

    /// Identity of the object this mapping was created from.
    #[inline]
    #[must_use]
    pub fn id(&self) -> SegmentId {
        self.id
    }

    /// Identity of the object currently registered under `name`, or `None`
    /// if it cannot be opened right now.
    #[must_use]
    pub fn current_id(name: &str) -> Option<SegmentId> {
        let c_name = CString::new(name).ok()?;
        // SAFETY: c_name is a valid NUL-terminated string; a failed open is
        // reported as a negative fd and handled.
        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDONLY, 0) };
        if fd < 0 {
            return None;
        }
        let id = fstat_id(fd);
        // SAFETY: fd is valid and not used past this point.
        unsafe { libc::close(fd) };
        id.ok()
    }

    /// Remove the name. Missing objects are not an error (idempotent
    /// cleanup).
    pub fn unlink(name: &str) -> Result<()> {
        let c_name = to_cstring(name)?;
        // SAFETY: c_name is a valid NUL-terminated string; unlink only
        // affects the namespace.
        let ret = unsafe { libc::shm_unlink(c_name.as_ptr()) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::NotFound {
                return Err(IpcError::SegmentOpen(err));
            }
        }
        Ok(())
    }

    /// Whether an object is currently registered under `name`.
    #[must_use]
    pub fn exists(name: &str) -> bool {
        Self::current_id(name).is_some()
    }

    /// Raw pointer to the mapped bytes.
    #[inline]
    #[must_use]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    /// Size of the mapping.
    #[inline]
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Name the segment was opened under.
    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for ShmSegment {
    fn drop(&mut self) {
        // SAFETY: ptr/size came from a successful mmap in create() or
        // open() and Drop runs once. Unlinking remains the creator's job.
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.size);
        }
    }
}

/// mmap `fd` for shared read/write access, capture its identity, and close
/// the descriptor (the mapping keeps its own reference).
fn map_and_close(
    fd: libc::c_int,
    size: usize,
    c_name: &CString,
    created: bool,
) -> Result<(SegmentId, *mut u8)> {
    let id = match fstat_id(fd) {
        Ok(id) => id,
        Err(e) => {
            // SAFETY: fd is open; on the create path the name is ours to
            // drop again.
            unsafe {
                libc::close(fd);
                if created {
                    libc::shm_unlink(c_name.as_ptr());
                }
            }
            return Err(IpcError::SegmentOpen(e));
        }
    };

    // SAFETY: fd is a valid descriptor sized by ftruncate (create) or by the
    // server (open); PROT_READ|PROT_WRITE with MAP_SHARED is the intended
    // cross-process mapping; MAP_FAILED is checked below.
    let ptr = unsafe {
        libc::mmap(
            ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            fd,
            0,
        )
    };

    // SAFETY: the mapping (if any) holds its own reference; fd is not used
    // afterwards.
    unsafe { libc::close(fd) };

    if ptr == libc::MAP_FAILED {
        let err = io::Error::last_os_error();
        if created {
            // SAFETY: the name was created by us and is unusable.
            unsafe { libc::shm_unlink(c_name.as_ptr()) };
        }
        return Err(IpcError::Mmap(err));
    }

    Ok((id, ptr as *mut u8))
}

fn fstat_id(fd: libc::c_int) -> io::Result<SegmentId> {
    let mut st = MaybeUninit::<libc::stat>::uninit();
    // SAFETY: fd is a valid descriptor and st points to writable stat
    // storage; fstat fully initializes it on success.
    let ret = unsafe { libc::fstat(fd, st.as_mut_ptr()) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: fstat returned 0, so st is initialized.
    let st = unsafe { st.assume_init() };
    Ok(SegmentId {
        dev: st.st_dev as u64,
        ino: st.st_ino as u64,
    })
}

/// Validate an object name against POSIX rules.
pub(crate) fn validate_name(name: &str) -> Result<()> {
    if !name.starts_with('/') {
        return Err(IpcError::InvalidName(format!(
            "name must start with '/': {name}"
        )));
    }
    if name.len() > 1 && name[1..].contains('/') {
        return Err(IpcError::InvalidName(format!(
            "name cannot contain '/' after prefix: {name}"
        )));
    }
    if name.len() > 255 {
        return Err(IpcError::InvalidName(format!(
            "name too long (max 255): {name}"
        )));
    }
    Ok(())
}

fn to_cstring(name: &str) -> Result<CString> {
    CString::new(name).map_err(|_| IpcError::InvalidName(name.to_string()))
}
