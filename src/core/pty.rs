//! Pseudo-terminal pair wrapper
//!
//! Allocates a master/slave PTY pair sized like the user's terminal. The
//! master stays with the proxy for its whole lifetime; the slave is handed to
//! the shell exactly once via [`Pty::take_slave`].

use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, FdFlag, OFlag};
use nix::pty::openpty;
use nix::unistd;
use thiserror::Error;
use tracing::debug;

use super::term::Geometry;

#[derive(Error, Debug)]
pub enum PtyError {
    #[error("Failed to allocate pseudo terminal: {0}")]
    Allocate(#[source] nix::Error),

    #[error("Failed to configure pseudo terminal: {0}")]
    Configure(#[source] nix::Error),

    #[error("Failed to resize pseudo terminal: {0}")]
    Resize(#[source] io::Error),

    #[error("Failed to read from PTY: {0}")]
    Read(#[source] nix::Error),

    #[error("Failed to write to PTY: {0}")]
    Write(#[source] nix::Error),

    #[error("PTY slave was already handed out")]
    SlaveTaken,
}

pub type Result<T> = std::result::Result<T, PtyError>;

/// Outcome of a non-blocking read from the master side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PtyRead {
    /// `n` bytes were read into the buffer.
    Data(usize),
    /// Nothing available right now.
    Empty,
    /// Every slave descriptor is closed: the shell is gone.
    Closed,
}

/// A master/slave pseudo-terminal pair.
pub struct Pty {
    master: OwnedFd,
    slave: Option<OwnedFd>,
    size: Geometry,
}

impl Pty {
    /// Allocate a pair with the given geometry.
    ///
    /// Both descriptors are close-on-exec so the shell only ever sees the
    /// slave through its standard streams. The master is non-blocking.
    pub fn allocate(size: Geometry) -> Result<Self> {
        let pair = openpty(&size.to_winsize(), None).map_err(PtyError::Allocate)?;

        set_cloexec(pair.master.as_raw_fd())?;
        set_cloexec(pair.slave.as_raw_fd())?;

        let flags = fcntl(pair.master.as_raw_fd(), FcntlArg::F_GETFL).map_err(PtyError::Configure)?;
        let flags = OFlag::from_bits_truncate(flags);
        fcntl(
            pair.master.as_raw_fd(),
            FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK),
        )
        .map_err(PtyError::Configure)?;

        debug!("allocated pty {}x{}", size.cols, size.rows);
        Ok(Self {
            master: pair.master,
            slave: Some(pair.slave),
            size,
        })
    }

    /// Hand over the slave side. Returns `None` once it has been taken.
    pub fn take_slave(&mut self) -> Option<OwnedFd> {
        self.slave.take()
    }

    pub fn master(&self) -> BorrowedFd<'_> {
        self.master.as_fd()
    }

    /// Geometry most recently applied to the pair.
    #[allow(dead_code)]
    pub fn size(&self) -> Geometry {
        self.size
    }

    /// Apply new dimensions. Returns `false` without touching the device
    /// when they equal the current ones, so repeated notifications do not
    /// turn into repeated SIGWINCHs for the shell.
    pub fn resize(&mut self, size: Geometry) -> Result<bool> {
        if size == self.size {
            return Ok(false);
        }
        let ws = size.to_winsize();
        // Safety: TIOCSWINSZ only reads the `winsize` we pass.
        let rc = unsafe { libc::ioctl(self.master.as_raw_fd(), libc::TIOCSWINSZ as _, &ws) };
        if rc < 0 {
            return Err(PtyError::Resize(io::Error::last_os_error()));
        }
        self.size = size;
        Ok(true)
    }

    /// Non-blocking read of shell output.
    pub fn read(&self, buf: &mut [u8]) -> Result<PtyRead> {
        match unistd::read(self.master.as_raw_fd(), buf) {
            Ok(0) => Ok(PtyRead::Closed),
            Ok(n) => Ok(PtyRead::Data(n)),
            Err(Errno::EAGAIN) | Err(Errno::EINTR) => Ok(PtyRead::Empty),
            // EIO on the master means the last slave descriptor was closed
            Err(Errno::EIO) => Ok(PtyRead::Closed),
            Err(e) => Err(PtyError::Read(e)),
        }
    }

    /// Non-blocking write of shell input. Returns how many bytes the master
    /// took; `0` when the slave's input queue is full.
    pub fn write(&self, data: &[u8]) -> Result<usize> {
        match unistd::write(&self.master, data) {
            Ok(n) => Ok(n),
            Err(Errno::EAGAIN) | Err(Errno::EINTR) => Ok(0),
            Err(e) => Err(PtyError::Write(e)),
        }
    }
}

fn set_cloexec(fd: RawFd) -> Result<()> {
    fcntl(fd, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))
        .map(drop)
        .map_err(PtyError::Configure)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::term;
    use nix::sys::termios::{self, SetArg};
    use std::time::{Duration, Instant};

    #[test]
    fn allocate_uses_requested_geometry() {
        let mut pty = Pty::allocate(Geometry::new(24, 80)).expect("allocate");
        let slave = pty.take_slave().expect("slave");
        assert_eq!(term::geometry(&slave).unwrap(), Geometry::new(24, 80));
        assert!(pty.take_slave().is_none());
    }

    #[test]
    fn resize_applies_and_skips_unchanged() {
        let mut pty = Pty::allocate(Geometry::new(24, 80)).expect("allocate");
        let slave = pty.take_slave().unwrap();

        assert!(!pty.resize(Geometry::new(24, 80)).unwrap());
        assert!(pty.resize(Geometry::new(30, 100)).unwrap());
        assert_eq!(term::geometry(&slave).unwrap(), Geometry::new(30, 100));
        assert!(!pty.resize(Geometry::new(30, 100)).unwrap());
        assert_eq!(pty.size(), Geometry::new(30, 100));
    }

    #[test]
    fn read_is_non_blocking() {
        let pty = Pty::allocate(Geometry::default()).expect("allocate");
        let mut buf = [0u8; 64];
        assert_eq!(pty.read(&mut buf).unwrap(), PtyRead::Empty);
    }

    #[test]
    fn read_reports_closed_slave() {
        let mut pty = Pty::allocate(Geometry::default()).expect("allocate");
        drop(pty.take_slave());
        let mut buf = [0u8; 64];
        assert_eq!(pty.read(&mut buf).unwrap(), PtyRead::Closed);
    }

    #[test]
    fn master_write_reaches_slave() {
        let mut pty = Pty::allocate(Geometry::default()).expect("allocate");
        let slave = pty.take_slave().unwrap();
        assert_eq!(pty.write(b"hello\n").unwrap(), 6);

        let mut buf = [0u8; 64];
        let n = unistd::read(slave.as_raw_fd(), &mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello\n");
    }

    #[test]
    fn write_returns_short_when_raw_slave_is_not_reading() {
        let mut pty = Pty::allocate(Geometry::default()).expect("allocate");
        let slave = pty.take_slave().unwrap();
        let mut raw = termios::tcgetattr(&slave).unwrap();
        termios::cfmakeraw(&mut raw);
        termios::tcsetattr(&slave, SetArg::TCSANOW, &raw).unwrap();

        let data = vec![b'a'; 200_000];
        let started = Instant::now();
        let mut written = 0;
        loop {
            match pty.write(&data[written..]).unwrap() {
                0 => break,
                n => written += n,
            }
        }
        assert!(written > 0 && written < data.len(), "wrote {written}");
        assert!(started.elapsed() < Duration::from_secs(1));

        // Everything the master accepted is there to read, in order
        let mut buf = [0u8; 4096];
        let n = unistd::read(slave.as_raw_fd(), &mut buf).unwrap();
        assert!(n > 0);
        assert!(buf[..n].iter().all(|&b| b == b'a'));
    }

    #[test]
    fn descriptors_are_close_on_exec() {
        let mut pty = Pty::allocate(Geometry::default()).expect("allocate");
        let slave = pty.take_slave().unwrap();
        for fd in [pty.master().as_raw_fd(), slave.as_raw_fd()] {
            let flags = fcntl(fd, FcntlArg::F_GETFD).unwrap();
            assert!(FdFlag::from_bits_truncate(flags).contains(FdFlag::FD_CLOEXEC));
        }
    }
}
