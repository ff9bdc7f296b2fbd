/* Synchronous byte pipe over a character-device file descriptor.   */
/*                                                                  */
/* All hardware I/O goes through this struct so that the transport  */
/* backends never touch raw file handles directly. Reads are timed  */
/* with poll(2); the descriptor is kept O_NONBLOCK and only flipped */
/* to blocking mode for the duration of a call that asks for it.    */

use std::fs::File;
use std::io::{ErrorKind, Read, Write};
use std::os::fd::{AsFd, AsRawFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use bitflags::bitflags;
use nix::fcntl::{FcntlArg, OFlag, fcntl};
use nix::libc;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use tracing::debug;

use crate::error::RmiError;

bitflags! {
    /* Per-call behavior of a read or write. */
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IoFlags: u8 {
        const NONE = 0;
        /* One syscall only, do not loop to fill the buffer. */
        const SINGLE_SHOT = 1 << 0;
        /* Temporarily clear O_NONBLOCK around the syscall. */
        const USE_BLOCKING_IO = 1 << 1;
        /* Drain pending input before writing. */
        const FLUSH_INPUT = 1 << 2;
    }
}

#[derive(Debug)]
pub struct IoChannel {
    file: File,
    label: String,
}

/* Restores O_NONBLOCK when a USE_BLOCKING_IO call leaves scope,
 * on every exit path including error returns. */
struct BlockingGuard<'a> {
    fd: RawFd,
    saved: OFlag,
    _channel: &'a IoChannel,
}

impl<'a> BlockingGuard<'a> {
    fn engage(channel: &'a IoChannel, flags: IoFlags) -> Result<Option<Self>> {
        if !flags.contains(IoFlags::USE_BLOCKING_IO) {
            return Ok(None);
        }
        let fd = channel.file.as_raw_fd();
        let saved = OFlag::from_bits_truncate(
            fcntl(fd, FcntlArg::F_GETFL).map_err(|e| channel.errno_error(e))?,
        );
        fcntl(fd, FcntlArg::F_SETFL(saved & !OFlag::O_NONBLOCK))
            .map_err(|e| channel.errno_error(e))?;
        Ok(Some(Self {
            fd,
            saved,
            _channel: channel,
        }))
    }
}

impl Drop for BlockingGuard<'_> {
    fn drop(&mut self) {
        let _ = fcntl(self.fd, FcntlArg::F_SETFL(self.saved));
    }
}

impl IoChannel {
    /* Open the device node at `path` for read/write, non-blocking. */
    pub fn open(path: &Path) -> Result<Self> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path)
            .map_err(|source| RmiError::Io {
                device: path.display().to_string(),
                source,
            })?;
        Ok(Self {
            file,
            label: path.display().to_string(),
        })
    }

    /* Wrap an already-open descriptor; `label` names it in errors.
     * This is also how simulators stand in for the real device. */
    pub fn from_file(file: File, label: impl Into<String>) -> Self {
        Self {
            file,
            label: label.into(),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    fn errno_error(&self, errno: nix::errno::Errno) -> anyhow::Error {
        RmiError::Io {
            device: self.label.clone(),
            source: std::io::Error::from_raw_os_error(errno as i32),
        }
        .into()
    }

    fn io_error(&self, source: std::io::Error) -> anyhow::Error {
        RmiError::Io {
            device: self.label.clone(),
            source,
        }
        .into()
    }

    fn wait_for(&self, events: PollFlags, timeout: Duration) -> Result<()> {
        let ms = u16::try_from(timeout.as_millis()).unwrap_or(u16::MAX);
        loop {
            let mut fds = [PollFd::new(self.file.as_fd(), events)];
            match poll(&mut fds, PollTimeout::from(ms)) {
                Ok(0) => {
                    return Err(RmiError::TimedOut(format!(
                        "no data on {} within {}ms",
                        self.label, ms
                    ))
                    .into());
                }
                Ok(_) => return Ok(()),
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(self.errno_error(e)),
            }
        }
    }

    /* Read into `buf`, returning the number of bytes actually read.
     * Loops until the buffer is full unless SINGLE_SHOT; a poll
     * timeout surfaces as `RmiError::TimedOut`. */
    pub fn read_raw(&self, buf: &mut [u8], timeout: Duration, flags: IoFlags) -> Result<usize> {
        let _guard = BlockingGuard::engage(self, flags)?;
        let mut total = 0;
        while total < buf.len() {
            self.wait_for(PollFlags::POLLIN, timeout)?;
            let n = match (&self.file).read(&mut buf[total..]) {
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::WouldBlock => continue,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(self.io_error(e)),
            };
            total += n;
            if n == 0 || flags.contains(IoFlags::SINGLE_SHOT) {
                break;
            }
        }
        debug!("RX {} bytes: {:02x?}", total, &buf[..total]);
        Ok(total)
    }

    /* Read up to `want` bytes, truncated to what arrived. */
    pub fn read(&self, want: usize, timeout: Duration, flags: IoFlags) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; want];
        let n = self.read_raw(&mut buf, timeout, flags)?;
        buf.truncate(n);
        Ok(buf)
    }

    /* Deliver all of `buf` to the device. */
    pub fn write(&self, buf: &[u8], timeout: Duration, flags: IoFlags) -> Result<()> {
        if flags.contains(IoFlags::FLUSH_INPUT) {
            self.flush_input();
        }
        let _guard = BlockingGuard::engage(self, flags)?;
        let mut written = 0;
        while written < buf.len() {
            self.wait_for(PollFlags::POLLOUT, timeout)?;
            let n = match (&self.file).write(&buf[written..]) {
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::WouldBlock => continue,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(self.io_error(e)),
            };
            written += n;
            if flags.contains(IoFlags::SINGLE_SHOT) && written < buf.len() {
                return Err(self.io_error(std::io::Error::other(format!(
                    "short write: {} of {}",
                    written,
                    buf.len()
                ))));
            }
        }
        debug!("TX {} bytes: {:02x?}", buf.len(), buf);
        Ok(())
    }

    /* Discard whatever input the device has queued up. */
    pub fn flush_input(&self) {
        let mut drained = 0usize;
        let mut scratch = [0u8; 64];
        loop {
            match (&self.file).read(&mut scratch) {
                Ok(0) => break,
                Ok(n) => drained += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
        if drained > 0 {
            debug!("flushed {drained} stale bytes from {}", self.label);
        }
    }
}

impl AsRawFd for IoChannel {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}
