//! A file descriptor that can be marked closed from any thread
//!
//! The uinput control file must be closable while another thread may still
//! be injecting through it. `ClosableFd` owns the descriptor for its whole
//! lifetime and `close()` only flips a flag, so a syscall racing with
//! `close()` always lands on this descriptor and never on a reused number.
//! The descriptor itself is released on drop.

use std::io;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug)]
pub struct ClosableFd {
    fd: OwnedFd,
    closed: AtomicBool,
}

impl ClosableFd {
    pub fn new(fd: impl Into<OwnedFd>) -> Self {
        Self {
            fd: fd.into(),
            closed: AtomicBool::new(false),
        }
    }

    /// The live descriptor, or `EBADF` once closed.
    pub fn get(&self) -> io::Result<BorrowedFd<'_>> {
        if self.is_closed() {
            return Err(io::Error::from_raw_os_error(nix::libc::EBADF));
        }
        Ok(self.fd.as_fd())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Mark the descriptor closed. Returns `false` if it already was.
    pub fn close(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }
}
