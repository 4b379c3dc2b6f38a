//! Session management
//!
//! A [`Session`] owns everything one proxied shell needs: raw mode on the
//! user's terminal, the PTY master, the shell process and the assistance
//! layer. [`Session::run`] is the event loop; it is the only code that reads
//! or writes the master or the user's terminal.
//!
//! Every way out of a session (shell exit, fatal I/O error, quit signal,
//! setup failure, unwinding) goes through [`Session::teardown`], which puts
//! the terminal back the way it was exactly once.

use std::collections::VecDeque;
use std::io;
use std::os::fd::{AsFd, AsRawFd};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::signal::Signal;
use nix::unistd;
use signal_hook::consts::{SIGHUP, SIGINT, SIGQUIT, SIGTERM, SIGWINCH};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::interceptor::Interceptor;
use super::pty::{Pty, PtyError, PtyRead};
use super::shell::{ChildStatus, ShellError, ShellProcess};
use super::term::{self, Geometry, RawMode, TermError, TerminalIo};

/// Loop tick while a suggestion is outstanding, so answers show promptly.
const SUGGESTION_TICK: Duration = Duration::from_millis(10);

/// Upper bound on reads when draining the master after the shell exits.
const DRAIN_READ_LIMIT: usize = 1024;

const READ_BUF_SIZE: usize = 4096;

/// Queued shell input above which the user's terminal is no longer read.
/// Keystrokes then wait in the terminal's own buffer instead.
const MAX_PENDING_INPUT: usize = 64 * 1024;

#[derive(Error, Debug)]
pub enum SetupError {
    #[error(transparent)]
    Terminal(#[from] TermError),

    #[error(transparent)]
    Pty(#[from] PtyError),

    #[error(transparent)]
    Shell(#[from] ShellError),
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Session setup failed: {0}")]
    Setup(#[from] SetupError),

    #[error("Session aborted: {0}")]
    Fatal(String),
}

pub type Result<T> = std::result::Result<T, SessionError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Initializing,
    Running,
    Terminating,
    Terminated,
}

/// Flags set from signal context and acted on by the loop.
#[derive(Debug, Clone, Default)]
pub struct Signals {
    pub resize: Arc<AtomicBool>,
    pub quit: Arc<AtomicBool>,
    pub interrupt: Arc<AtomicBool>,
}

impl Signals {
    /// Hook SIGWINCH, the quit signals and SIGINT to the flags.
    pub fn register() -> io::Result<Self> {
        let signals = Self::default();
        signal_hook::flag::register(SIGWINCH, Arc::clone(&signals.resize))?;
        for sig in [SIGTERM, SIGHUP, SIGQUIT] {
            signal_hook::flag::register(sig, Arc::clone(&signals.quit))?;
        }
        signal_hook::flag::register(SIGINT, Arc::clone(&signals.interrupt))?;
        Ok(signals)
    }

    fn take(flag: &AtomicBool) -> bool {
        flag.swap(false, Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub shell: PathBuf,
    pub poll_interval: Duration,
    pub kill_grace: Duration,
    /// Consecutive failures on one descriptor before the session gives up.
    pub max_io_errors: u32,
}

impl SessionOptions {
    pub fn new(shell: impl Into<PathBuf>) -> Self {
        Self {
            shell: shell.into(),
            poll_interval: Duration::from_millis(100),
            kill_grace: Duration::from_millis(500),
            max_io_errors: 3,
        }
    }
}

/// Which descriptors `poll` reported ready.
#[derive(Debug, Clone, Copy, Default)]
struct Ready {
    input: bool,
    master_in: bool,
    master_out: bool,
}

/// Consecutive failure count for one descriptor.
#[derive(Debug)]
struct ErrorCounter {
    name: &'static str,
    count: u32,
    limit: u32,
}

impl ErrorCounter {
    fn new(name: &'static str, limit: u32) -> Self {
        Self {
            name,
            count: 0,
            limit: limit.max(1),
        }
    }

    fn reset(&mut self) {
        self.count = 0;
    }

    fn record(&mut self, err: impl std::fmt::Display) -> Result<()> {
        self.count += 1;
        warn!("{} error ({}/{}): {}", self.name, self.count, self.limit, err);
        if self.count >= self.limit {
            return Err(SessionError::Fatal(format!(
                "{} failed {} times in a row: {}",
                self.name, self.count, err
            )));
        }
        Ok(())
    }
}

pub struct Session {
    state: SessionState,
    options: SessionOptions,
    io: TerminalIo,
    raw: Option<RawMode>,
    pty: Option<Pty>,
    shell: Option<ShellProcess>,
    interceptor: Interceptor,
    signals: Signals,
    exit: Option<ChildStatus>,
    /// Bytes for the shell that the master has not taken yet.
    pending: VecDeque<u8>,
    input_errors: ErrorCounter,
    output_errors: ErrorCounter,
    master_errors: ErrorCounter,
}

impl Session {
    /// Put the user's terminal in raw mode, allocate a PTY of the same size
    /// and start the shell on it.
    ///
    /// On failure nothing is left behind: the terminal is restored and the
    /// PTY closed before the error is returned.
    pub fn start(
        options: SessionOptions,
        io: TerminalIo,
        interceptor: Interceptor,
        signals: Signals,
    ) -> Result<Self> {
        let limit = options.max_io_errors;
        let mut session = Self {
            state: SessionState::Initializing,
            options,
            io,
            raw: None,
            pty: None,
            shell: None,
            interceptor,
            signals,
            exit: None,
            pending: VecDeque::new(),
            input_errors: ErrorCounter::new("terminal input", limit),
            output_errors: ErrorCounter::new("terminal output", limit),
            master_errors: ErrorCounter::new("pty master", limit),
        };

        if let Err(e) = session.setup() {
            session.teardown();
            return Err(SessionError::Setup(e));
        }
        Ok(session)
    }

    fn setup(&mut self) -> std::result::Result<(), SetupError> {
        self.raw = Some(RawMode::enter(self.io.input_fd())?);

        let size = term::geometry(self.io.input_fd()).unwrap_or_else(|e| {
            warn!("{}, assuming {:?}", e, Geometry::default());
            Geometry::default()
        });
        self.interceptor.set_cols(size.cols);

        let mut pty = Pty::allocate(size)?;
        let slave = pty.take_slave().ok_or(PtyError::SlaveTaken)?;
        self.pty = Some(pty);

        let shell = ShellProcess::spawn(&self.options.shell, slave)?;
        info!(
            "session running: shell pid {}, {}x{}",
            shell.pid(),
            size.cols,
            size.rows
        );
        self.shell = Some(shell);
        self.state = SessionState::Running;
        Ok(())
    }

    #[allow(dead_code)]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Run the event loop until the session ends, then tear it down.
    pub fn run(&mut self) -> Result<Option<ChildStatus>> {
        let result = self.event_loop();
        if let Err(e) = &result {
            warn!("{}", e);
        }
        self.teardown();
        result.map(|()| self.exit)
    }

    fn event_loop(&mut self) -> Result<()> {
        let mut buf = [0u8; READ_BUF_SIZE];

        while self.state == SessionState::Running {
            if Signals::take(&self.signals.quit) {
                info!("quit requested");
                self.state = SessionState::Terminating;
                break;
            }
            if Signals::take(&self.signals.interrupt) {
                self.forward_interrupt();
            }
            if Signals::take(&self.signals.resize) {
                self.propagate_resize();
            }

            let ready = match self.wait_ready()? {
                Some(ready) => ready,
                // Interrupted by a signal: go round and look at the flags
                None => continue,
            };

            if ready.master_in {
                self.pump_output(&mut buf)?;
            }
            if ready.master_out {
                self.flush_pending()?;
            }
            if ready.input && self.state == SessionState::Running {
                self.pump_input(&mut buf)?;
            }

            let released = self.interceptor.on_tick(Instant::now(), &mut self.io.output);
            self.send_to_shell(&released)?;

            self.check_shell(&mut buf)?;
        }
        Ok(())
    }

    fn poll_timeout(&self) -> PollTimeout {
        let mut timeout = self.options.poll_interval;
        if self.interceptor.is_waiting() {
            timeout = timeout.min(SUGGESTION_TICK);
            if let Some(deadline) = self.interceptor.deadline() {
                timeout = timeout.min(deadline.saturating_duration_since(Instant::now()));
            }
        }
        PollTimeout::from(timeout.as_millis().min(u128::from(u16::MAX)) as u16)
    }

    /// Wait for the user's terminal or the master to become ready. The
    /// master is watched for writability only while input is queued for it,
    /// and the terminal is not read while that queue is full. Returns `None`
    /// when a signal cut the wait short.
    fn wait_ready(&self) -> Result<Option<Ready>> {
        let Some(pty) = self.pty.as_ref() else {
            return Err(SessionError::Fatal("pty master is gone".into()));
        };

        let input_events = if self.pending.len() < MAX_PENDING_INPUT {
            PollFlags::POLLIN
        } else {
            PollFlags::empty()
        };
        let master_events = if self.pending.is_empty() {
            PollFlags::POLLIN
        } else {
            PollFlags::POLLIN | PollFlags::POLLOUT
        };
        let mut fds = [
            PollFd::new(self.io.input.as_fd(), input_events),
            PollFd::new(pty.master(), master_events),
        ];
        match poll(&mut fds, self.poll_timeout()) {
            Ok(_) => {}
            Err(Errno::EINTR) => return Ok(None),
            Err(e) => return Err(SessionError::Fatal(format!("poll failed: {}", e))),
        }

        let has = |fd: &PollFd, flags: PollFlags| fd.revents().is_some_and(|r| r.intersects(flags));
        let hangup = PollFlags::POLLHUP | PollFlags::POLLERR;
        Ok(Some(Ready {
            input: !input_events.is_empty() && has(&fds[0], PollFlags::POLLIN | hangup),
            master_in: has(&fds[1], PollFlags::POLLIN | hangup),
            master_out: has(&fds[1], PollFlags::POLLOUT),
        }))
    }

    /// Relay one read of shell output to the user. Returns false once the
    /// master reports that the shell side is closed or has nothing more.
    fn pump_output(&mut self, buf: &mut [u8]) -> Result<bool> {
        let Some(pty) = self.pty.as_ref() else {
            return Ok(false);
        };
        match pty.read(buf) {
            Ok(PtyRead::Data(n)) => {
                self.master_errors.reset();
                match self.interceptor.on_output(&buf[..n], &mut self.io.output) {
                    Ok(()) => self.output_errors.reset(),
                    Err(e) => self.output_errors.record(e)?,
                }
                Ok(true)
            }
            Ok(PtyRead::Empty) => Ok(false),
            Ok(PtyRead::Closed) => {
                if self.state == SessionState::Running {
                    info!("shell side of the pty closed");
                    self.state = SessionState::Terminating;
                }
                Ok(false)
            }
            Err(e) => {
                self.master_errors.record(e)?;
                Ok(false)
            }
        }
    }

    fn pump_input(&mut self, buf: &mut [u8]) -> Result<()> {
        match unistd::read(self.io.input.as_raw_fd(), buf) {
            Ok(0) | Err(Errno::EIO) => {
                info!("user terminal hung up");
                self.state = SessionState::Terminating;
            }
            Ok(n) => {
                self.input_errors.reset();
                let forward = self.interceptor.on_input(&buf[..n]);
                self.send_to_shell(&forward)?;
            }
            Err(Errno::EAGAIN) | Err(Errno::EINTR) => {}
            Err(e) => self.input_errors.record(e)?,
        }
        Ok(())
    }

    /// Queue bytes for the shell behind anything still pending and write
    /// what the master takes now. The rest goes out as it becomes writable.
    fn send_to_shell(&mut self, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        self.pending.extend(data);
        self.flush_pending()
    }

    fn flush_pending(&mut self) -> Result<()> {
        let Some(pty) = self.pty.as_ref() else {
            self.pending.clear();
            return Ok(());
        };
        while !self.pending.is_empty() {
            let (front, _) = self.pending.as_slices();
            match pty.write(front) {
                Ok(0) => break,
                Ok(n) => {
                    self.pending.drain(..n);
                    self.master_errors.reset();
                }
                Err(e) => {
                    self.master_errors.record(e)?;
                    break;
                }
            }
        }
        Ok(())
    }

    /// Notice a shell exit and flush whatever it wrote before dying.
    fn check_shell(&mut self, buf: &mut [u8]) -> Result<()> {
        let Some(shell) = self.shell.as_mut() else {
            return Ok(());
        };
        match shell.poll() {
            Ok(ChildStatus::Running) => return Ok(()),
            Ok(status) => {
                info!("shell exited: {:?}", status);
                self.exit = Some(status);
            }
            Err(e) => {
                warn!("{}", e);
                return Ok(());
            }
        }

        for _ in 0..DRAIN_READ_LIMIT {
            if !self.pump_output(buf)? {
                break;
            }
        }
        self.state = SessionState::Terminating;
        Ok(())
    }

    fn forward_interrupt(&mut self) {
        if let Some(shell) = self.shell.as_mut() {
            debug!("forwarding SIGINT to shell");
            if let Err(e) = shell.signal(Signal::SIGINT) {
                warn!("{}", e);
            }
        }
    }

    /// Copy the user's terminal size to the PTY. Failures are logged only.
    fn propagate_resize(&mut self) {
        let size = match term::geometry(self.io.input_fd()) {
            Ok(size) => size,
            Err(e) => {
                warn!("resize ignored: {}", e);
                return;
            }
        };
        let Some(pty) = self.pty.as_mut() else {
            return;
        };
        match pty.resize(size) {
            Ok(true) => {
                debug!("pty resized to {}x{}", size.cols, size.rows);
                self.interceptor.set_cols(size.cols);
            }
            Ok(false) => {}
            Err(e) => warn!("{}", e),
        }
    }

    /// Stop the shell, take the overlay down, restore the terminal and close
    /// the master. Runs once; later calls do nothing.
    pub fn teardown(&mut self) {
        if self.state == SessionState::Terminated {
            return;
        }
        self.state = SessionState::Terminating;

        if let Err(e) = self.interceptor.finish(&mut self.io.output) {
            debug!("failed to clear overlay: {}", e);
        }

        if let Some(mut shell) = self.shell.take() {
            let status = match shell.poll() {
                Ok(ChildStatus::Running) | Err(_) => shell.terminate(self.options.kill_grace),
                Ok(status) => status,
            };
            self.exit = Some(status);
        }

        if !self.pending.is_empty() {
            debug!("dropping {} bytes of unsent shell input", self.pending.len());
            self.pending.clear();
        }

        if let Some(mut raw) = self.raw.take() {
            if let Err(e) = raw.restore() {
                warn!("failed to restore terminal mode: {}", e);
            }
        }

        drop(self.pty.take());
        self.state = SessionState::Terminated;
        info!("session terminated, shell status {:?}", self.exit);
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.teardown();
    }
}
