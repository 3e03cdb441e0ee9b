//! Advisory byte-range file locks.
//!
//! Cross-process mutual exclusion on the queue file uses POSIX `fcntl`
//! record locks: one range for the header/allocator, one per index, and one
//! per slot-table entry. Locks are advisory and per-process; intra-process
//! coordination is layered separately in [`super::ProductQueue`]. Any holder
//! may die at any point; the kernel releases its ranges, so another process
//! can always recover.

use std::fs::File;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};

/// Which way a range is locked.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockKind {
    Shared,
    Exclusive,
}

/// A held byte-range lock; unlocks on drop.
#[derive(Debug)]
pub struct RangeLock {
    fd: RawFd,
    offset: u64,
    length: u64,
}

fn flock(kind: i16, offset: u64, length: u64) -> libc::flock {
    // SAFETY: flock is plain old data; zeroed is a valid initial value.
    let mut fl: libc::flock = unsafe { std::mem::zeroed() };
    fl.l_type = kind;
    fl.l_whence = libc::SEEK_SET as i16;
    fl.l_start = offset as libc::off_t;
    fl.l_len = length as libc::off_t;
    fl
}

fn set_lock(fd: RawFd, fl: &mut libc::flock, wait: bool) -> io::Result<bool> {
    let cmd = if wait { libc::F_SETLKW } else { libc::F_SETLK };
    loop {
        // SAFETY: fd is a valid open descriptor for the queue file and fl
        // points at an initialized flock record.
        let rc = unsafe { libc::fcntl(fd, cmd, fl as *mut libc::flock) };
        if rc == 0 {
            return Ok(true);
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            // Interrupted blocking wait: retry.
            Some(libc::EINTR) if wait => continue,
            // Non-blocking attempt lost the race.
            Some(libc::EAGAIN) | Some(libc::EACCES) if !wait => return Ok(false),
            _ => return Err(err),
        }
    }
}

/// Blocks until the range is locked.
pub fn lock_range(
    file: &File,
    offset: u64,
    length: u64,
    kind: LockKind,
) -> io::Result<RangeLock> {
    let l_type = match kind {
        LockKind::Shared => libc::F_RDLCK as i16,
        LockKind::Exclusive => libc::F_WRLCK as i16,
    };
    let mut fl = flock(l_type, offset, length);
    set_lock(file.as_raw_fd(), &mut fl, true)?;
    Ok(RangeLock {
        fd: file.as_raw_fd(),
        offset,
        length,
    })
}

/// Tries the range without blocking; `None` means another process holds it.
pub fn try_lock_range(
    file: &File,
    offset: u64,
    length: u64,
    kind: LockKind,
) -> io::Result<Option<RangeLock>> {
    let l_type = match kind {
        LockKind::Shared => libc::F_RDLCK as i16,
        LockKind::Exclusive => libc::F_WRLCK as i16,
    };
    let mut fl = flock(l_type, offset, length);
    if set_lock(file.as_raw_fd(), &mut fl, false)? {
        Ok(Some(RangeLock {
            fd: file.as_raw_fd(),
            offset,
            length,
        }))
    } else {
        Ok(None)
    }
}

impl Drop for RangeLock {
    fn drop(&mut self) {
        let mut fl = flock(libc::F_UNLCK as i16, self.offset, self.length);
        // Unlock failure leaves the range held until process exit; nothing
        // useful to do beyond logging.
        if let Err(err) = set_lock(self.fd, &mut fl, true) {
            log::error!("failed to release queue range lock: {}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn lock_shared_ranges_coexist() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(&[0u8; 64]).unwrap();
        let file = f.reopen().unwrap();
        let a = lock_range(&file, 0, 8, LockKind::Shared).unwrap();
        let b = try_lock_range(&file, 0, 8, LockKind::Shared).unwrap();
        assert!(b.is_some());
        drop(a);
    }

    #[test]
    fn lock_disjoint_ranges_are_independent() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(&[0u8; 64]).unwrap();
        let file = f.reopen().unwrap();
        let _a = lock_range(&file, 0, 8, LockKind::Exclusive).unwrap();
        // fcntl locks are per-process, so a same-process exclusive claim on a
        // disjoint range must succeed outright.
        let b = try_lock_range(&file, 8, 8, LockKind::Exclusive).unwrap();
        assert!(b.is_some());
    }
}
