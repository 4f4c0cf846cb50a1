// SPDX-FileCopyrightText: 2025 Hyperpolymath
// SPDX-License-Identifier: PMPL-1.0-or-later

//! Advisory `flock(2)` locks.
//!
//! The throttle takes a blocking lock around its read-modify-write cycle;
//! GC takes a non-blocking lock and reports contention instead of waiting.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;

/// Open (creating if needed) a file suitable for locking, owner-only.
pub fn open_lock_file(path: &Path) -> io::Result<File> {
    let mut options = OpenOptions::new();
    options.read(true).write(true).create(true).truncate(false);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    options.open(path)
}

/// Exclusive lock held on a file until dropped.
#[derive(Debug)]
pub struct FileLockGuard<'a> {
    file: &'a File,
}

impl<'a> FileLockGuard<'a> {
    /// Block until the exclusive lock is acquired.
    pub fn lock(file: &'a File) -> io::Result<Self> {
        lock_exclusive(file)?;
        Ok(Self { file })
    }

    /// Try to take the lock without waiting. `Ok(None)` means another
    /// holder has it.
    pub fn try_lock(file: &'a File) -> io::Result<Option<Self>> {
        if try_lock_exclusive(file)? {
            Ok(Some(Self { file }))
        } else {
            Ok(None)
        }
    }

    pub fn file(&self) -> &'a File {
        self.file
    }
}

impl Drop for FileLockGuard<'_> {
    fn drop(&mut self) {
        let _ = unlock(self.file);
    }
}

#[cfg(unix)]
fn flock(file: &File, operation: libc::c_int) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;
    // SAFETY: the descriptor is owned by `file` and stays open for the call.
    let result = unsafe { libc::flock(file.as_raw_fd(), operation) };
    if result == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(unix)]
fn lock_exclusive(file: &File) -> io::Result<()> {
    loop {
        match flock(file, libc::LOCK_EX) {
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            other => return other,
        }
    }
}

#[cfg(unix)]
fn try_lock_exclusive(file: &File) -> io::Result<bool> {
    match flock(file, libc::LOCK_EX | libc::LOCK_NB) {
        Ok(()) => Ok(true),
        Err(err)
            if err.kind() == io::ErrorKind::WouldBlock
                || err.raw_os_error() == Some(libc::EWOULDBLOCK) =>
        {
            Ok(false)
        }
        Err(err) => Err(err),
    }
}

#[cfg(unix)]
fn unlock(file: &File) -> io::Result<()> {
    flock(file, libc::LOCK_UN)
}

#[cfg(not(unix))]
fn lock_exclusive(_file: &File) -> io::Result<()> {
    Ok(())
}

#[cfg(not(unix))]
fn try_lock_exclusive(_file: &File) -> io::Result<bool> {
    Ok(true)
}

#[cfg(not(unix))]
fn unlock(_file: &File) -> io::Result<()> {
    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn test_try_lock_reports_contention() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gc.lock");

        // flock locks belong to the open file description, so two opens
        // of the same path contend even within one process.
        let first = open_lock_file(&path).unwrap();
        let second = open_lock_file(&path).unwrap();

        let guard = FileLockGuard::try_lock(&first).unwrap();
        assert!(guard.is_some());
        assert!(FileLockGuard::try_lock(&second).unwrap().is_none());

        drop(guard);
        assert!(FileLockGuard::try_lock(&second).unwrap().is_some());
    }
}
