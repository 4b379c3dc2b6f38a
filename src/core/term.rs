//! Controlling terminal mode and geometry.
//!
//! [`RawMode`] snapshots the line discipline of the user's terminal, switches
//! it to raw mode and puts the snapshot back exactly once, whichever way the
//! session ends. [`TerminalIo`] bundles the user-facing descriptors the proxy
//! reads keystrokes from and writes shell output to.

use std::fs::File;
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};

use nix::errno::Errno;
use nix::pty::Winsize;
use nix::sys::termios::{self, SetArg, Termios};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum TermError {
    #[error("Standard input is not a terminal")]
    NotATerminal,

    #[error("Failed to read terminal attributes: {0}")]
    Capture(#[source] nix::Error),

    #[error("Failed to apply terminal attributes: {0}")]
    Apply(#[source] nix::Error),

    #[error("Failed to duplicate terminal descriptor: {0}")]
    Duplicate(#[source] io::Error),

    #[error("Failed to query terminal size: {0}")]
    Geometry(#[source] io::Error),
}

pub type Result<T> = std::result::Result<T, TermError>;

/// Terminal geometry in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub rows: u16,
    pub cols: u16,
}

impl Default for Geometry {
    fn default() -> Self {
        Self { rows: 24, cols: 80 }
    }
}

impl Geometry {
    pub const fn new(rows: u16, cols: u16) -> Self {
        Self { rows, cols }
    }

    pub fn to_winsize(self) -> Winsize {
        Winsize {
            ws_row: self.rows,
            ws_col: self.cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        }
    }
}

/// Read the current geometry of the terminal behind `fd`.
///
/// A terminal that reports zero rows or columns (some serial consoles and
/// detached sessions do) falls back to 24x80.
pub fn geometry<Fd: AsFd>(fd: Fd) -> Result<Geometry> {
    let mut ws = Geometry::default().to_winsize();
    // Safety: TIOCGWINSZ writes a `winsize` into the pointer we pass.
    let rc = unsafe { libc::ioctl(fd.as_fd().as_raw_fd(), libc::TIOCGWINSZ as _, &mut ws) };
    if rc < 0 {
        return Err(TermError::Geometry(io::Error::last_os_error()));
    }
    if ws.ws_row == 0 || ws.ws_col == 0 {
        return Ok(Geometry::default());
    }
    Ok(Geometry::new(ws.ws_row, ws.ws_col))
}

/// Raw mode on the controlling terminal, restored when dropped.
pub struct RawMode {
    fd: OwnedFd,
    saved: Termios,
    restored: bool,
}

impl RawMode {
    /// Capture the current attributes of `fd`, then switch it to raw mode.
    ///
    /// Nothing is changed on the terminal if the capture fails.
    pub fn enter<Fd: AsFd>(fd: Fd) -> Result<Self> {
        let fd = fd.as_fd();
        let saved = termios::tcgetattr(fd).map_err(|e| match e {
            Errno::ENOTTY => TermError::NotATerminal,
            other => TermError::Capture(other),
        })?;
        let fd = fd.try_clone_to_owned().map_err(TermError::Duplicate)?;

        let mut raw = saved.clone();
        termios::cfmakeraw(&mut raw);
        termios::tcsetattr(&fd, SetArg::TCSANOW, &raw).map_err(TermError::Apply)?;
        debug!("terminal switched to raw mode");

        Ok(Self {
            fd,
            saved,
            restored: false,
        })
    }

    /// Reapply the captured attributes. Later calls are no-ops.
    pub fn restore(&mut self) -> Result<()> {
        if self.restored {
            return Ok(());
        }
        self.restored = true;
        termios::tcsetattr(&self.fd, SetArg::TCSADRAIN, &self.saved).map_err(TermError::Apply)?;
        debug!("terminal mode restored");
        Ok(())
    }

    #[allow(dead_code)]
    pub fn is_active(&self) -> bool {
        !self.restored
    }
}

impl Drop for RawMode {
    fn drop(&mut self) {
        if let Err(e) = self.restore() {
            warn!("failed to restore terminal mode: {}", e);
        }
    }
}

/// User-facing descriptors: keystrokes come in on `input`, shell output and
/// overlays go out on `output`. `input` is also the terminal whose mode and
/// geometry the session controls.
pub struct TerminalIo {
    pub input: OwnedFd,
    pub output: File,
}

impl TerminalIo {
    /// Duplicate the process's stdin and stdout.
    pub fn stdio() -> io::Result<Self> {
        let input = io::stdin().as_fd().try_clone_to_owned()?;
        let output = io::stdout().as_fd().try_clone_to_owned()?;
        Ok(Self {
            input,
            output: File::from(output),
        })
    }

    /// Use one terminal descriptor for both directions.
    #[allow(dead_code)]
    pub fn from_terminal(fd: OwnedFd) -> io::Result<Self> {
        let output = fd.try_clone()?;
        Ok(Self {
            input: fd,
            output: File::from(output),
        })
    }

    pub fn input_fd(&self) -> BorrowedFd<'_> {
        self.input.as_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::pty::openpty;
    use nix::sys::termios::{InputFlags, LocalFlags};

    #[test]
    fn geometry_reads_pty_size() {
        let size = Geometry::new(30, 100).to_winsize();
        let pty = openpty(&size, None).expect("openpty");
        assert_eq!(geometry(&pty.slave).unwrap(), Geometry::new(30, 100));
    }

    #[test]
    fn geometry_falls_back_when_zero() {
        let size = Geometry::new(0, 0).to_winsize();
        let pty = openpty(&size, None).expect("openpty");
        assert_eq!(geometry(&pty.slave).unwrap(), Geometry::default());
    }

    #[test]
    fn geometry_of_non_terminal_fails() {
        let file = tempfile::tempfile().unwrap();
        assert!(matches!(geometry(&file), Err(TermError::Geometry(_))));
    }

    #[test]
    fn raw_mode_round_trip() {
        let pty = openpty(None, None).expect("openpty");
        let before = termios::tcgetattr(&pty.slave).unwrap();
        assert!(before.local_flags.contains(LocalFlags::ICANON));

        let mut raw = RawMode::enter(&pty.slave).expect("enter raw mode");
        let during = termios::tcgetattr(&pty.slave).unwrap();
        assert!(!during.local_flags.contains(LocalFlags::ICANON));
        assert!(!during.local_flags.contains(LocalFlags::ECHO));
        assert!(raw.is_active());

        raw.restore().unwrap();
        let after = termios::tcgetattr(&pty.slave).unwrap();
        assert_eq!(after.local_flags, before.local_flags);
        assert_eq!(after.input_flags, before.input_flags);
        assert_eq!(after.output_flags, before.output_flags);
        assert!(!raw.is_active());
    }

    #[test]
    fn restore_is_idempotent() {
        let pty = openpty(None, None).expect("openpty");
        let mut raw = RawMode::enter(&pty.slave).unwrap();
        assert!(raw.restore().is_ok());
        assert!(raw.restore().is_ok());
        drop(raw);
        let after = termios::tcgetattr(&pty.slave).unwrap();
        assert!(after.local_flags.contains(LocalFlags::ECHO));
    }

    #[test]
    fn drop_restores_mode() {
        let pty = openpty(None, None).expect("openpty");
        let before = termios::tcgetattr(&pty.slave).unwrap();
        {
            let _raw = RawMode::enter(&pty.slave).unwrap();
            let during = termios::tcgetattr(&pty.slave).unwrap();
            assert!(!during.input_flags.contains(InputFlags::ICRNL));
        }
        let after = termios::tcgetattr(&pty.slave).unwrap();
        assert_eq!(after.input_flags, before.input_flags);
    }

    #[test]
    fn enter_on_non_terminal_changes_nothing() {
        let file = tempfile::tempfile().unwrap();
        assert!(matches!(RawMode::enter(&file), Err(TermError::NotATerminal)));
    }
}
