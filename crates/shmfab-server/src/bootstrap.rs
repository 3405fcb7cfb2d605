// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Server bootstrap: single-instance lock, generation numbering, and
//! creation of every shared object.
//!
//! Creation is idempotent-on-stale: a semaphore name left behind by a
//! crashed server is unlinked and recreated exactly once; a second failure
//! aborts bootstrap and unlinks everything already created. The resulting
//! [`ServerContext`] owns the region and all semaphores and unlinks them on
//! drop - clients only ever open and close.

use crate::config::ServerConfig;
use shmfab::layout::{SharedRegion, MAX_SLOTS, REGION_SIZE};
use shmfab::{IpcError, NamedSemaphore, ObjectNames, ShmSegment};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Fatal bootstrap failures. After bootstrap the server tolerates
/// individual operation failures and keeps running.
#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(
        "another server instance already holds {path:?}; \
         if the previous server crashed, remove the file and retry"
    )]
    AlreadyRunning { path: PathBuf },

    #[error("instance lock {path:?}: {source}")]
    Lock {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("shared region setup failed: {0}")]
    Region(#[source] IpcError),

    #[error("semaphore {name} could not be created: {source}")]
    Semaphore {
        name: String,
        #[source]
        source: IpcError,
    },
}

/// Exclusive advisory lock marking the one live server instance.
///
/// The lock file is removed again on drop.
pub struct InstanceLock {
    _file: File,
    path: PathBuf,
}

impl InstanceLock {
    /// Take the lock, failing fast if another instance holds it.
    pub fn acquire(path: &Path) -> Result<Self, BootstrapError> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path)
            .map_err(|source| BootstrapError::Lock {
                path: path.to_path_buf(),
                source,
            })?;

        if let Err(e) = flock(&file, libc::LOCK_EX | libc::LOCK_NB) {
            if e.raw_os_error() == Some(libc::EWOULDBLOCK) {
                return Err(BootstrapError::AlreadyRunning {
                    path: path.to_path_buf(),
                });
            }
            return Err(BootstrapError::Lock {
                path: path.to_path_buf(),
                source: e,
            });
        }

        Ok(Self {
            _file: file,
            path: path.to_path_buf(),
        })
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            log::warn!("[BOOT] could not remove lock file {}: {e}", self.path.display());
        }
    }
}

/// Everything a running server owns: the mapped region, every semaphore,
/// and the instance lock. Dropping the context unlinks all of it.
pub struct ServerContext {
    names: ObjectNames,
    region: ShmSegment,
    mutex: NamedSemaphore,
    server_notify: NamedSemaphore,
    slot_sems: Vec<NamedSemaphore>,
    generation: u64,
    _lock: InstanceLock,
}

impl ServerContext {
    #[inline]
    #[must_use]
    pub fn region_ptr(&self) -> *mut SharedRegion {
        self.region.as_ptr() as *mut SharedRegion
    }

    #[inline]
    #[must_use]
    pub fn mutex(&self) -> &NamedSemaphore {
        &self.mutex
    }

    #[inline]
    #[must_use]
    pub fn server_notify(&self) -> &NamedSemaphore {
        &self.server_notify
    }

    #[inline]
    #[must_use]
    pub fn slot_sem(&self, index: usize) -> &NamedSemaphore {
        &self.slot_sems[index]
    }

    #[inline]
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    #[inline]
    #[must_use]
    pub fn names(&self) -> &ObjectNames {
        &self.names
    }
}

impl Drop for ServerContext {
    fn drop(&mut self) {
        unlink_all(&self.names);
        log::debug!("[BOOT] unlinked shared objects under {}", self.names.prefix());
    }
}

/// Create the region and semaphores and stamp a fresh generation.
pub fn bootstrap(config: &ServerConfig) -> Result<ServerContext, BootstrapError> {
    let lock = InstanceLock::acquire(&config.lock_path)?;
    let generation = next_server_generation(&config.generation_path);

    match create_objects(&config.names, generation) {
        Ok((region, mutex, server_notify, slot_sems)) => {
            log::info!(
                "[BOOT] fabric ready under {} (generation {generation})",
                config.names.prefix()
            );
            Ok(ServerContext {
                names: config.names.clone(),
                region,
                mutex,
                server_notify,
                slot_sems,
                generation,
                _lock: lock,
            })
        }
        Err(e) => {
            // Leave no half-created names behind; unlinking tolerates the
            // ones that were never created.
            unlink_all(&config.names);
            Err(e)
        }
    }
}

type Objects = (ShmSegment, NamedSemaphore, NamedSemaphore, Vec<NamedSemaphore>);

fn create_objects(names: &ObjectNames, generation: u64) -> Result<Objects, BootstrapError> {
    let region =
        ShmSegment::create(&names.region(), REGION_SIZE).map_err(BootstrapError::Region)?;

    // SAFETY: the mapping is REGION_SIZE bytes, freshly zeroed, and no
    // other process can have opened it before the semaphores exist.
    unsafe {
        let ptr = region.as_ptr() as *mut SharedRegion;
        (*ptr).server_generation = generation;
        (*ptr).next_request_id = 1;
    }

    let mutex = create_semaphore(&names.mutex(), 1)?;
    let server_notify = create_semaphore(&names.server_notify(), 0)?;
    let mut slot_sems = Vec::with_capacity(MAX_SLOTS);
    for i in 0..MAX_SLOTS {
        slot_sems.push(create_semaphore(&names.slot(i), 0)?);
    }

    Ok((region, mutex, server_notify, slot_sems))
}

/// Exclusive-create a semaphore, unlinking a stale leftover and retrying
/// exactly once.
fn create_semaphore(name: &str, initial: u32) -> Result<NamedSemaphore, BootstrapError> {
    match NamedSemaphore::create(name, initial) {
        Ok(sem) => Ok(sem),
        Err(e) if e.is_already_exists() => {
            log::warn!("[BOOT] stale semaphore {name}, unlinking and recreating");
            NamedSemaphore::unlink(name).map_err(|source| BootstrapError::Semaphore {
                name: name.to_string(),
                source,
            })?;
            NamedSemaphore::create(name, initial).map_err(|source| BootstrapError::Semaphore {
                name: name.to_string(),
                source,
            })
        }
        Err(source) => Err(BootstrapError::Semaphore {
            name: name.to_string(),
            source,
        }),
    }
}

fn unlink_all(names: &ObjectNames) {
    for i in 0..MAX_SLOTS {
        NamedSemaphore::unlink(&names.slot(i)).ok();
    }
    NamedSemaphore::unlink(&names.server_notify()).ok();
    NamedSemaphore::unlink(&names.mutex()).ok();
    ShmSegment::unlink(&names.region()).ok();
}

/// Read, increment, and persist the generation counter under an exclusive
/// advisory lock. Any failure falls back to wall-clock seconds so a fresh
/// server never reuses a stamp a client may have cached.
pub fn next_server_generation(path: &Path) -> u64 {
    match bump_generation_file(path) {
        Ok(generation) => generation,
        Err(e) => {
            log::warn!(
                "[BOOT] generation file {} unusable ({e}); falling back to wall clock",
                path.display()
            );
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map_or(1, |d| d.as_secs())
        }
    }
}

fn bump_generation_file(path: &Path) -> io::Result<u64> {
    let mut file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .open(path)?;
    flock(&file, libc::LOCK_EX)?;

    let mut buf = [0u8; 8];
    let n = file.read(&mut buf)?;
    // A short or empty file counts as zero.
    let mut generation = if n == 8 { u64::from_ne_bytes(buf) } else { 0 };
    generation += 1;

    file.seek(SeekFrom::Start(0))?;
    file.write_all(&generation.to_ne_bytes())?;
    file.set_len(8)?;
    // The flock is released when `file` closes.
    Ok(generation)
}

fn flock(file: &File, flags: libc::c_int) -> io::Result<()> {
    // SAFETY: the descriptor is valid for the lifetime of `file`.
    let ret = unsafe { libc::flock(file.as_raw_fd(), flags) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use shmfab::layout::SLOT_SIZE;

    fn unique_tmp(tag: &str, suffix: &str) -> PathBuf {
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir().join(format!("shmfab_{tag}_{ts}.{suffix}"))
    }

    fn unique_prefix(tag: &str) -> ObjectNames {
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        ObjectNames::with_prefix(&format!("/shmfab_{tag}_{ts}")).unwrap()
    }

    #[test]
    fn test_generation_increments_across_calls() {
        let path = unique_tmp("gen", "generation");
        assert_eq!(next_server_generation(&path), 1);
        assert_eq!(next_server_generation(&path), 2);
        assert_eq!(next_server_generation(&path), 3);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_generation_short_file_restarts_from_one() {
        let path = unique_tmp("genshort", "generation");
        std::fs::write(&path, [1u8, 2, 3]).unwrap();
        assert_eq!(next_server_generation(&path), 1);
        assert_eq!(next_server_generation(&path), 2);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_instance_lock_excludes_second_holder() {
        let path = unique_tmp("lock", "lock");

        let first = InstanceLock::acquire(&path).expect("first acquire");
        match InstanceLock::acquire(&path) {
            Err(BootstrapError::AlreadyRunning { path: p }) => assert_eq!(p, path),
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("second acquire must fail"),
        }

        drop(first);
        assert!(!path.exists(), "lock file must be removed on release");

        let again = InstanceLock::acquire(&path).expect("reacquire after release");
        drop(again);
    }

    #[test]
    fn test_bootstrap_stamps_region_and_cleans_up() {
        let config = ServerConfig {
            names: unique_prefix("boot"),
            threads_per_pool: 1,
            lock_path: unique_tmp("bootlock", "lock"),
            generation_path: unique_tmp("bootgen", "generation"),
            ..ServerConfig::default()
        };

        let ctx = bootstrap(&config).expect("bootstrap");
        assert_eq!(ctx.generation(), 1);
        assert!(ShmSegment::exists(&config.names.region()));

        // SAFETY: the context owns a REGION_SIZE mapping and no other
        // participant is attached in this test.
        unsafe {
            let region = ctx.region_ptr();
            assert_eq!((*region).server_generation, 1);
            assert_eq!((*region).next_request_id, 1);
            assert_eq!((*region).slots[0].state, 0);
            assert_eq!((*region).slots[MAX_SLOTS - 1].state, 0);
        }
        assert_eq!(REGION_SIZE, 16 + MAX_SLOTS * SLOT_SIZE);

        drop(ctx);
        assert!(!ShmSegment::exists(&config.names.region()));
        assert!(NamedSemaphore::open(&config.names.mutex()).is_err());
        std::fs::remove_file(&config.generation_path).ok();
    }

    #[test]
    fn test_bootstrap_recovers_stale_semaphore() {
        let config = ServerConfig {
            names: unique_prefix("stale"),
            threads_per_pool: 1,
            lock_path: unique_tmp("stalelock", "lock"),
            generation_path: unique_tmp("stalegen", "generation"),
            ..ServerConfig::default()
        };

        // A leftover from a "crashed" previous server.
        let stale = NamedSemaphore::create(&config.names.mutex(), 0).unwrap();
        drop(stale);

        let ctx = bootstrap(&config).expect("bootstrap must replace stale semaphore");
        // The recreated mutex starts at 1 token.
        assert!(ctx
            .mutex()
            .wait_timeout(std::time::Duration::from_millis(100))
            .unwrap());
        ctx.mutex().post().unwrap();

        drop(ctx);
        std::fs::remove_file(&config.generation_path).ok();
    }
}
