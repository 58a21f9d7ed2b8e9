// Copyright © 2026 The cowsr Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Whole-file advisory locks on top of `fcntl()` OFD locks.
//!
//! OFD locks belong to the open file description rather than to the process,
//! so two descriptors opened separately conflict even inside one process, and
//! only the last `close()` of a description drops its lock.

use std::io;
use std::os::fd::{AsRawFd, RawFd};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum LockError {
    /// Someone else holds the lock.
    #[error("The file is already locked")]
    AlreadyLocked,
    #[error("The lock state could not be changed")]
    Io(#[source] io::Error),
}

#[allow(non_camel_case_types)]
enum FcntlArg<'a> {
    F_OFD_SETLK(&'a libc::flock),
    F_OFD_SETLKW(&'a libc::flock),
}

fn fcntl(fd: RawFd, arg: FcntlArg) -> libc::c_int {
    // SAFETY: the descriptor is owned by the caller and the flock structure
    // outlives the call.
    unsafe {
        match arg {
            FcntlArg::F_OFD_SETLK(flock) => libc::fcntl(fd, libc::F_OFD_SETLK, flock),
            FcntlArg::F_OFD_SETLKW(flock) => libc::fcntl(fd, libc::F_OFD_SETLKW, flock),
        }
    }
}

#[derive(Clone, Copy, Debug)]
enum LockType {
    Unlock,
    Write,
}

impl LockType {
    const fn to_libc_val(self) -> libc::c_int {
        match self {
            Self::Unlock => libc::F_UNLCK as libc::c_int,
            Self::Write => libc::F_WRLCK as libc::c_int,
        }
    }
}

const fn get_flock(lock_type: LockType) -> libc::flock {
    libc::flock {
        l_type: lock_type.to_libc_val() as libc::c_short,
        l_whence: libc::SEEK_SET as libc::c_short,
        l_start: 0,
        l_len: 0, /* EOF */
        l_pid: 0, /* must be zero for OFD locks */
    }
}

fn set_lock(fd: RawFd, lock_type: LockType, wait: bool) -> Result<(), LockError> {
    let flock = get_flock(lock_type);
    loop {
        let arg = if wait {
            FcntlArg::F_OFD_SETLKW(&flock)
        } else {
            FcntlArg::F_OFD_SETLK(&flock)
        };
        if fcntl(fd, arg) == 0 {
            return Ok(());
        }
        let io_error = io::Error::last_os_error();
        match io_error.raw_os_error() {
            // <https://man7.org/linux/man-pages/man2/fcntl.2.html>
            Some(libc::EAGAIN) | Some(libc::EACCES) if !wait => {
                return Err(LockError::AlreadyLocked)
            }
            Some(libc::EINTR) if wait => continue,
            _ => return Err(LockError::Io(io_error)),
        }
    }
}

/// Take an exclusive lock on `file`, failing with
/// [`LockError::AlreadyLocked`] if it is held elsewhere.
pub fn try_acquire_lock<Fd: AsRawFd>(file: &Fd) -> Result<(), LockError> {
    set_lock(file.as_raw_fd(), LockType::Write, false)
}

/// Take an exclusive lock on `file`, waiting for as long as it is held
/// elsewhere.
pub fn acquire_lock<Fd: AsRawFd>(file: &Fd) -> Result<(), LockError> {
    set_lock(file.as_raw_fd(), LockType::Write, true)
}

pub fn clear_lock<Fd: AsRawFd>(file: &Fd) -> Result<(), LockError> {
    set_lock(file.as_raw_fd(), LockType::Unlock, false)
}

#[cfg(test)]
mod tests {
    use std::fs::OpenOptions;

    use vmm_sys_util::tempfile::TempFile;

    use super::*;

    #[test]
    fn test_descriptors_conflict_within_process() {
        let tmp = TempFile::new().unwrap();
        let open = || {
            OpenOptions::new()
                .read(true)
                .write(true)
                .open(tmp.as_path())
                .unwrap()
        };
        let first = open();
        let second = open();

        try_acquire_lock(&first).unwrap();
        // Re-locking through the same description is a no-op.
        try_acquire_lock(&first).unwrap();
        assert!(matches!(
            try_acquire_lock(&second),
            Err(LockError::AlreadyLocked)
        ));

        clear_lock(&first).unwrap();
        try_acquire_lock(&second).unwrap();
        drop(second);
        acquire_lock(&first).unwrap();
    }
}
