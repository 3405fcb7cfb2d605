// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Named POSIX counting semaphores.
//!
//! The fabric runs on three semaphore roles: one binary mutex guarding the
//! region, one server-notify doorbell posted by clients, and one doorbell
//! per slot posted by workers. All of them are `sem_open` objects so that
//! unrelated processes can share them by name alone.
//!
//! Ownership follows the segment rule: the server creates and unlinks,
//! clients open and close. Drop only closes the handle.

use crate::{IpcError, Result};
use std::ffi::CString;
use std::io;
use std::time::Duration;

/// Handle to a named POSIX semaphore.
pub struct NamedSemaphore {
    sem: *mut libc::sem_t,
    name: String,
}

// SAFETY: sem_post/sem_wait/sem_timedwait are thread-safe on the same
// semaphore object; the wrapper adds no unsynchronized state beyond the
// immutable name.
unsafe impl Send for NamedSemaphore {}
unsafe impl Sync for NamedSemaphore {}

impl NamedSemaphore {
    /// Create a semaphore with `initial` tokens, failing if the name is
    /// already registered.
    pub fn create(name: &str, initial: u32) -> Result<Self> {
        crate::shm::validate_name(name)?;
        let c_name = to_cstring(name)?;

        // SAFETY: c_name is a valid NUL-terminated string; with O_CREAT the
        // variadic mode and value arguments are read as unsigned ints, which
        // is what we pass. SEM_FAILED is checked below.
        let sem = unsafe {
            libc::sem_open(
                c_name.as_ptr(),
                libc::O_CREAT | libc::O_EXCL,
                0o666 as libc::c_uint,
                initial as libc::c_uint,
            )
        };
        if sem == libc::SEM_FAILED {
            return Err(IpcError::SemCreate {
                name: name.to_string(),
                source: io::Error::last_os_error(),
            });
        }

        Ok(Self {
            sem,
            name: name.to_string(),
        })
    }

    /// Open an existing semaphore.
    pub fn open(name: &str) -> Result<Self> {
        crate::shm::validate_name(name)?;
        let c_name = to_cstring(name)?;

        // SAFETY: c_name is a valid NUL-terminated string; without O_CREAT
        // no variadic arguments are read. SEM_FAILED is checked below.
        let sem = unsafe { libc::sem_open(c_name.as_ptr(), 0) };
        if sem == libc::SEM_FAILED {
            return Err(IpcError::SemOpen {
                name: name.to_string(),
                source: io::Error::last_os_error(),
            });
        }

        Ok(Self {
            sem,
            name: name.to_string(),
        })
    }

    /// Add one token, waking one waiter if any.
    pub fn post(&self) -> Result<()> {
        // SAFETY: self.sem is a live handle until Drop.
        let ret = unsafe { libc::sem_post(self.sem) };
        if ret < 0 {
            return Err(IpcError::Sem(io::Error::last_os_error()));
        }
        Ok(())
    }

    /// Take one token, blocking until one is available. Interrupted waits
    /// are retried.
    pub fn wait(&self) -> Result<()> {
        loop {
            // SAFETY: self.sem is a live handle until Drop.
            let ret = unsafe { libc::sem_wait(self.sem) };
            if ret == 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            return Err(IpcError::Sem(err));
        }
    }

    /// Take one token, giving up after `timeout`.
    ///
    /// Returns `Ok(true)` when a token was taken and `Ok(false)` on
    /// timeout. The deadline is absolute, so interrupted waits resume
    /// without extending it.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<bool> {
        let deadline = deadline_from_now(timeout)?;
        loop {
            // SAFETY: self.sem is a live handle until Drop and deadline is
            // a fully initialized timespec.
            let ret = unsafe { libc::sem_timedwait(self.sem, &deadline) };
            if ret == 0 {
                return Ok(true);
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::ETIMEDOUT) => return Ok(false),
                _ => return Err(IpcError::Sem(err)),
            }
        }
    }

    /// Remove the name. Missing semaphores are not an error (idempotent
    /// cleanup).
    pub fn unlink(name: &str) -> Result<()> {
        let c_name = to_cstring(name)?;
        // SAFETY: c_name is a valid NUL-terminated string; unlink only
        // affects the namespace.
        let ret = unsafe { libc::sem_unlink(c_name.as_ptr()) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ENOENT) {
                return Err(IpcError::Sem(err));
            }
        }
        Ok(())
    }

    /// Name the semaphore was opened under.
    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for NamedSemaphore {
    fn drop(&mut self) {
        // SAFETY: self.sem came from a successful sem_open and Drop runs
        // once. Closing does not unlink.
        unsafe {
            libc::sem_close(self.sem);
        }
    }
}

/// CLOCK_REALTIME now plus `timeout`, as required by `sem_timedwait`.
fn deadline_from_now(timeout: Duration) -> Result<libc::timespec> {
    let mut now = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: now points to writable timespec storage.
    let ret = unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut now) };
    if ret < 0 {
        return Err(IpcError::Sem(io::Error::last_os_error()));
    }

    const NANOS_PER_SEC: libc::c_long = 1_000_000_000;
    let mut sec = now.tv_sec + timeout.as_secs() as libc::time_t;
    let mut nsec = now.tv_nsec + timeout.subsec_nanos() as libc::c_long;
    if nsec >= NANOS_PER_SEC {
        sec += 1;
        nsec -= NANOS_PER_SEC;
    }
    Ok(libc::timespec {
        tv_sec: sec,
        tv_nsec: nsec,
    })
}

fn to_cstring(name: &str) -> Result<CString> {
    CString::new(name).map_err(|_| IpcError::InvalidName(name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    fn unique_name(tag: &str) -> String {
        use std::time::{SystemTime, UNIX_EPOCH};
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        format!("/shmfab_sem_{tag}_{ts}")
    }

    #[test]
    fn test_post_then_wait() {
        let name = unique_name("post");
        let sem = NamedSemaphore::create(&name, 0).expect("create");

        sem.post().unwrap();
        sem.wait().unwrap();

        drop(sem);
        NamedSemaphore::unlink(&name).ok();
    }

    #[test]
    fn test_initial_tokens() {
        let name = unique_name("init");
        let sem = NamedSemaphore::create(&name, 2).expect("create");

        assert!(sem.wait_timeout(Duration::from_millis(50)).unwrap());
        assert!(sem.wait_timeout(Duration::from_millis(50)).unwrap());
        assert!(!sem.wait_timeout(Duration::from_millis(50)).unwrap());

        drop(sem);
        NamedSemaphore::unlink(&name).ok();
    }

    #[test]
    fn test_wait_timeout_elapses() {
        let name = unique_name("timeout");
        let sem = NamedSemaphore::create(&name, 0).expect("create");

        let start = Instant::now();
        let acquired = sem.wait_timeout(Duration::from_millis(100)).unwrap();
        let elapsed = start.elapsed();

        assert!(!acquired);
        assert!(elapsed >= Duration::from_millis(80));
        assert!(elapsed < Duration::from_secs(2));

        drop(sem);
        NamedSemaphore::unlink(&name).ok();
    }

    #[test]
    fn test_create_existing_fails() {
        let name = unique_name("dup");
        let first = NamedSemaphore::create(&name, 0).expect("create");

        match NamedSemaphore::create(&name, 0) {
            Err(e) if e.is_already_exists() => {}
            Err(e) => panic!("unexpected error: {e}"),
            Ok(_) => panic!("duplicate create must fail"),
        }

        drop(first);
        NamedSemaphore::unlink(&name).ok();
    }

    #[test]
    fn test_open_nonexistent() {
        assert!(NamedSemaphore::open("/shmfab_sem_nonexistent_12345").is_err());
    }

    #[test]
    fn test_unlink_idempotent() {
        let name = unique_name("unlink");
        let sem = NamedSemaphore::create(&name, 0).expect("create");
        drop(sem);
        assert!(NamedSemaphore::unlink(&name).is_ok());
        assert!(NamedSemaphore::unlink(&name).is_ok());
    }

    #[test]
    fn test_cross_thread_wake() {
        let name = unique_name("wake");
        let sem = Arc::new(NamedSemaphore::create(&name, 0).expect("create"));
        let waiter = Arc::clone(&sem);

        let handle = thread::spawn(move || waiter.wait_timeout(Duration::from_secs(5)).unwrap());

        thread::sleep(Duration::from_millis(20));
        sem.post().unwrap();

        assert!(handle.join().expect("waiter panicked"));

        NamedSemaphore::unlink(&name).ok();
    }
}
