// Copyright © 2026 The cowsr Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Named advisory locks shared by every process and host attached to a
//! repository.
//!
//! A lock is a `lock_<name>` file under the repository root holding an OFD
//! write lock. Three disciplines are offered over the same primitive:
//!
//! - [`VolumeLock::lock`] waits for as long as the lock is held elsewhere,
//! - [`VolumeLock::try_lock`] gives up immediately,
//! - [`VolumeLock::poll_lock`] retries a non-blocking attempt at a fixed
//!   period, with no timeout.
//!
//! The lock is released when the returned guard is dropped.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

pub use crate::fcntl::LockError;
use crate::fcntl::{acquire_lock, clear_lock, try_acquire_lock};

/// Global lock serialising every change to the shape of the volume tree.
pub const GLOBAL_LOCK: &str = "gl";
/// Serialises access to the metadata database.
pub const DB_LOCK: &str = "db";
/// Serialises rolling backups of the metadata database.
pub const DB_BACKUP_LOCK: &str = "db_backup";

const LOCK_ACQUIRE_THRESHOLD: Duration = Duration::from_secs(1);
const LOCK_HOLD_THRESHOLD: Duration = Duration::from_secs(10);

pub fn lock_path(sr_path: &Path, name: &str) -> PathBuf {
    sr_path.join(format!("lock_{name}"))
}

/// An acquired lock.
#[derive(Debug)]
pub struct VolumeLock {
    name: String,
    file: File,
    locked_at: Instant,
}

impl VolumeLock {
    fn open(path: &Path) -> Result<File, LockError> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(LockError::Io)
    }

    fn locked(name: &str, file: File, requested_at: Instant) -> Self {
        let locked_at = Instant::now();
        let waited = locked_at - requested_at;
        if waited > LOCK_ACQUIRE_THRESHOLD {
            debug!(
                "Lock name={name} took {:.3} second(s) to acquire",
                waited.as_secs_f64()
            );
        }
        VolumeLock {
            name: name.to_owned(),
            file,
            locked_at,
        }
    }

    /// Block until the lock at `path` is ours.
    pub fn lock(name: &str, path: &Path) -> Result<Self, LockError> {
        let requested_at = Instant::now();
        let file = Self::open(path)?;
        acquire_lock(&file)?;
        Ok(Self::locked(name, file, requested_at))
    }

    /// Take the lock at `path` if it is free, `None` if it is held elsewhere.
    pub fn try_lock(name: &str, path: &Path) -> Result<Option<Self>, LockError> {
        let requested_at = Instant::now();
        let file = Self::open(path)?;
        match try_acquire_lock(&file) {
            Ok(()) => Ok(Some(Self::locked(name, file, requested_at))),
            Err(LockError::AlreadyLocked) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Retry [`VolumeLock::try_lock`] every `period` until it succeeds.
    pub fn poll_lock(name: &str, path: &Path, period: Duration) -> Result<Self, LockError> {
        let requested_at = Instant::now();
        let file = Self::open(path)?;
        loop {
            match try_acquire_lock(&file) {
                Ok(()) => return Ok(Self::locked(name, file, requested_at)),
                Err(LockError::AlreadyLocked) => thread::sleep(period),
                Err(e) => return Err(e),
            }
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for VolumeLock {
    fn drop(&mut self) {
        let held = self.locked_at.elapsed();
        if held > LOCK_HOLD_THRESHOLD {
            debug!(
                "Lock name={} held for more than {} second(s)",
                self.name,
                LOCK_HOLD_THRESHOLD.as_secs()
            );
        }
        // Closing the file drops the lock anyway.
        if let Err(e) = clear_lock(&self.file) {
            warn!("Failed to release lock name={}: {e}", self.name);
        }
    }
}
