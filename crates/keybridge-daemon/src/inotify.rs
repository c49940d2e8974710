//! Filesystem change notifications via inotify
//!
//! [`FileChangeDecoder`] owns one inotify instance, remembers which path
//! every watch descriptor belongs to, and turns the kernel's packed record
//! stream into [`FileEvent`]s.
//!
//! Each record is a 16-byte header (`wd`, `mask`, `cookie`, `len`, native
//! byte order) followed by `len` bytes of NUL-padded name. Linux already
//! counts the alignment padding in `len`, so the next record starts exactly
//! `16 + len` bytes later. Every field read is bounds checked; a record that
//! runs past the end of the buffer is a [`DecodeError`].

use std::collections::HashMap;
use std::ffi::OsStr;
use std::io;
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use bitflags::bitflags;
use keybridge_config::WatchEvent;
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::libc;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::inotify::{InitFlags, Inotify};
use nix::unistd;
use nix::NixPath;
use thiserror::Error;

/// Size of `struct inotify_event` without its name
pub const HEADER_SIZE: usize = 16;

const READ_BUFFER_SIZE: usize = 4096;

bitflags! {
    /// inotify event bits. Bits the kernel reports that are not named here
    /// are kept as-is.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct EventMask: u32 {
        const ACCESS = libc::IN_ACCESS;
        const MODIFY = libc::IN_MODIFY;
        const ATTRIB = libc::IN_ATTRIB;
        const CLOSE_WRITE = libc::IN_CLOSE_WRITE;
        const CLOSE_NOWRITE = libc::IN_CLOSE_NOWRITE;
        const OPEN = libc::IN_OPEN;
        const MOVED_FROM = libc::IN_MOVED_FROM;
        const MOVED_TO = libc::IN_MOVED_TO;
        const CREATE = libc::IN_CREATE;
        const DELETE = libc::IN_DELETE;
        const DELETE_SELF = libc::IN_DELETE_SELF;
        const MOVE_SELF = libc::IN_MOVE_SELF;

        // Only ever reported, never requested
        const UNMOUNT = libc::IN_UNMOUNT;
        const Q_OVERFLOW = libc::IN_Q_OVERFLOW;
        const IGNORED = libc::IN_IGNORED;
        const ISDIR = libc::IN_ISDIR;

        const CLOSE = Self::CLOSE_WRITE.bits() | Self::CLOSE_NOWRITE.bits();
        const MOVE = Self::MOVED_FROM.bits() | Self::MOVED_TO.bits();
    }
}

impl From<WatchEvent> for EventMask {
    fn from(event: WatchEvent) -> Self {
        match event {
            WatchEvent::Access => EventMask::ACCESS,
            WatchEvent::Modify => EventMask::MODIFY,
            WatchEvent::Attrib => EventMask::ATTRIB,
            WatchEvent::CloseWrite => EventMask::CLOSE_WRITE,
            WatchEvent::CloseNoWrite => EventMask::CLOSE_NOWRITE,
            WatchEvent::Open => EventMask::OPEN,
            WatchEvent::MovedFrom => EventMask::MOVED_FROM,
            WatchEvent::MovedTo => EventMask::MOVED_TO,
            WatchEvent::Create => EventMask::CREATE,
            WatchEvent::Delete => EventMask::DELETE,
            WatchEvent::DeleteSelf => EventMask::DELETE_SELF,
            WatchEvent::MoveSelf => EventMask::MOVE_SELF,
        }
    }
}

impl FromIterator<WatchEvent> for EventMask {
    fn from_iter<I: IntoIterator<Item = WatchEvent>>(iter: I) -> Self {
        iter.into_iter()
            .fold(EventMask::empty(), |mask, event| mask | EventMask::from(event))
    }
}

/// One decoded filesystem change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEvent {
    /// Watched path, joined with the entry name for directory watches
    pub path: PathBuf,
    pub mask: EventMask,
    /// Pairs the two halves of a rename; zero otherwise
    pub cookie: u32,
}

/// A record as it appears on the wire, name still unresolved
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord<'a> {
    pub wd: i32,
    pub mask: u32,
    pub cookie: u32,
    /// Name with the NUL padding stripped. Empty for events on the watched
    /// path itself.
    pub name: &'a [u8],
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Truncated inotify header at offset {offset}: {available} byte(s) left")]
    TruncatedHeader { offset: usize, available: usize },

    #[error("Truncated inotify name at offset {offset}: need {len} byte(s), {available} left")]
    TruncatedName {
        offset: usize,
        len: usize,
        available: usize,
    },
}

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("Failed to initialize inotify: {0}")]
    Unavailable(#[source] io::Error),

    #[error("Failed to watch {path}: {source}")]
    AddWatch {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Error)]
pub enum ListenError {
    #[error("Failed to read inotify events: {0}")]
    Read(#[source] io::Error),

    #[error("inotify channel has been closed")]
    Closed,

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("Event for unknown watch descriptor {0}")]
    UnknownWatchDescriptor(i32),

    #[error("File event handler failed: {0}")]
    Handler(anyhow::Error),
}

/// Watch descriptor to registered path
pub type WatchTable = HashMap<i32, PathBuf>;

fn read_u32(buf: &[u8], at: usize) -> Option<u32> {
    let bytes = buf.get(at..at + 4)?;
    Some(u32::from_ne_bytes(bytes.try_into().ok()?))
}

fn read_i32(buf: &[u8], at: usize) -> Option<i32> {
    read_u32(buf, at).map(|v| v as i32)
}

/// Split a buffer filled by `read(2)` into records.
pub fn decode_records(buf: &[u8]) -> Result<Vec<RawRecord<'_>>, DecodeError> {
    let mut records = Vec::new();
    let mut offset = 0;

    while offset < buf.len() {
        let available = buf.len() - offset;
        let truncated = || DecodeError::TruncatedHeader { offset, available };

        let wd = read_i32(buf, offset).ok_or_else(truncated)?;
        let mask = read_u32(buf, offset + 4).ok_or_else(truncated)?;
        let cookie = read_u32(buf, offset + 8).ok_or_else(truncated)?;
        let len = read_u32(buf, offset + 12).ok_or_else(truncated)? as usize;

        let start = offset + HEADER_SIZE;
        let name = buf
            .get(start..)
            .and_then(|rest| rest.get(..len))
            .ok_or(DecodeError::TruncatedName {
                offset,
                len,
                available: buf.len() - start,
            })?;
        let name = match name.iter().position(|&b| b == 0) {
            Some(end) => &name[..end],
            None => name,
        };

        records.push(RawRecord {
            wd,
            mask,
            cookie,
            name,
        });
        offset = start + len;
    }

    Ok(records)
}

/// Decode a buffer and resolve every record against `watches`.
pub fn decode_events(buf: &[u8], watches: &WatchTable) -> Result<Vec<FileEvent>, ListenError> {
    decode_records(buf)?
        .into_iter()
        .map(|record| -> Result<FileEvent, ListenError> {
            let watched = watches
                .get(&record.wd)
                .ok_or(ListenError::UnknownWatchDescriptor(record.wd))?;
            let path = if record.name.is_empty() {
                watched.clone()
            } else {
                watched.join(OsStr::from_bytes(record.name))
            };
            Ok(FileEvent {
                path,
                mask: EventMask::from_bits_retain(record.mask),
                cookie: record.cookie,
            })
        })
        .collect()
}

/// An inotify instance and the paths watched through it.
///
/// `listen` waits in `poll` on both the inotify descriptor and a private wake
/// pipe. `close` writes to that pipe, so a blocked listener returns
/// [`ListenError::Closed`] promptly. Both descriptors stay open until drop.
pub struct FileChangeDecoder {
    inotify: Inotify,
    wake_rx: OwnedFd,
    wake_tx: OwnedFd,
    closed: AtomicBool,
    watches: WatchTable,
}

impl FileChangeDecoder {
    pub fn open() -> Result<Self, WatchError> {
        let inotify = Inotify::init(InitFlags::IN_CLOEXEC | InitFlags::IN_NONBLOCK)
            .map_err(|e| WatchError::Unavailable(e.into()))?;
        let (wake_rx, wake_tx) = unistd::pipe2(OFlag::O_CLOEXEC | OFlag::O_NONBLOCK)
            .map_err(|e| WatchError::Unavailable(e.into()))?;
        tracing::debug!("Opened inotify instance on fd {}", inotify.as_fd().as_raw_fd());
        Ok(Self {
            inotify,
            wake_rx,
            wake_tx,
            closed: AtomicBool::new(false),
            watches: WatchTable::new(),
        })
    }

    /// Watch `path` for `mask`. Nothing is recorded if the kernel refuses.
    pub fn add_watch(&mut self, path: &Path, mask: EventMask) -> Result<i32, WatchError> {
        let add_watch_error = |source: io::Error| WatchError::AddWatch {
            path: path.to_path_buf(),
            source,
        };

        if self.is_closed() {
            return Err(add_watch_error(Errno::EBADF.into()));
        }

        // nix hides the numeric descriptor, and records are keyed by it
        let fd = self.inotify.as_fd().as_raw_fd();
        let wd = path
            .with_nix_path(|cstr| unsafe { libc::inotify_add_watch(fd, cstr.as_ptr(), mask.bits()) })
            .and_then(Errno::result)
            .map_err(|e| add_watch_error(e.into()))?;

        tracing::info!("Watching {} for {:?}", path.display(), mask);
        self.watches.insert(wd, path.to_path_buf());
        Ok(wd)
    }

    pub fn watch_count(&self) -> usize {
        self.watches.len()
    }

    pub fn watches(&self) -> &WatchTable {
        &self.watches
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Read and dispatch events until the channel fails, is closed, or the
    /// handler returns an error. Blocks the calling thread.
    pub fn listen<F>(&self, mut handler: F) -> Result<(), ListenError>
    where
        F: FnMut(&FileEvent) -> anyhow::Result<()>,
    {
        let mut buf = [0u8; READ_BUFFER_SIZE];

        loop {
            let n = self.read(&mut buf)?;
            for event in decode_events(&buf[..n], &self.watches)? {
                tracing::debug!("{} {:?}", event.path.display(), event.mask);
                handler(&event).map_err(ListenError::Handler)?;
            }
        }
    }

    fn read(&self, buf: &mut [u8]) -> Result<usize, ListenError> {
        loop {
            self.wait_readable()?;
            match unistd::read(self.inotify.as_fd().as_raw_fd(), buf) {
                Ok(0) => {
                    return Err(ListenError::Read(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "inotify returned end of file",
                    )))
                }
                Ok(n) => return Ok(n),
                Err(Errno::EAGAIN | Errno::EINTR) => continue,
                Err(e) => return Err(ListenError::Read(e.into())),
            }
        }
    }

    /// Block until inotify has data. A wake-up on the pipe means closed.
    fn wait_readable(&self) -> Result<(), ListenError> {
        loop {
            if self.is_closed() {
                return Err(ListenError::Closed);
            }

            let mut fds = [
                PollFd::new(self.inotify.as_fd(), PollFlags::POLLIN),
                PollFd::new(self.wake_rx.as_fd(), PollFlags::POLLIN),
            ];
            match poll(&mut fds, PollTimeout::NONE) {
                Ok(_) => {}
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(ListenError::Read(e.into())),
            }

            if fds[1].any().unwrap_or(false) || self.is_closed() {
                return Err(ListenError::Closed);
            }
            if fds[0].any().unwrap_or(false) {
                return Ok(());
            }
        }
    }

    /// Close the instance and wake any blocked `listen`. Idempotent,
    /// callable from any thread.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(e) = unistd::write(&self.wake_tx, &[1]) {
            tracing::warn!("Failed to wake inotify listener: {}", e);
        }
        tracing::debug!("Closed inotify instance");
    }
}
