//! Shell process management
//!
//! Spawns the user's shell as a session leader whose controlling terminal
//! and standard streams are the PTY slave, and tracks it until it is reaped.

use std::io;
use std::os::fd::OwnedFd;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Interval between liveness checks while waiting for the shell to exit.
const REAP_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// How long to wait for the kernel to reap a SIGKILLed shell.
const KILL_REAP_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Error, Debug)]
pub enum ShellError {
    #[error("Failed to start shell {}: {source}", path.display())]
    Spawn {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to wait for shell: {0}")]
    Wait(#[source] io::Error),

    #[error("Failed to signal shell: {0}")]
    Signal(#[source] nix::Error),
}

pub type Result<T> = std::result::Result<T, ShellError>;

/// Liveness of the shell process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildStatus {
    Running,
    Exited(i32),
    Signaled(i32),
}

impl From<ExitStatus> for ChildStatus {
    fn from(status: ExitStatus) -> Self {
        match (status.code(), status.signal()) {
            (Some(code), _) => ChildStatus::Exited(code),
            (None, Some(sig)) => ChildStatus::Signaled(sig),
            (None, None) => ChildStatus::Exited(-1),
        }
    }
}

/// The spawned shell.
pub struct ShellProcess {
    child: Child,
    status: ChildStatus,
}

impl ShellProcess {
    /// Start `path` with no arguments on the given PTY slave.
    ///
    /// The child becomes a session leader with the slave as its controlling
    /// terminal and as stdin/stdout/stderr, inheriting our environment and
    /// working directory. The parent's copies of the slave are closed before
    /// this returns. An exec failure is reported here and never retried.
    pub fn spawn(path: &Path, slave: OwnedFd) -> Result<Self> {
        let spawn_err = |source| ShellError::Spawn {
            path: path.to_path_buf(),
            source,
        };

        let stdin = slave.try_clone().map_err(spawn_err)?;
        let stdout = slave.try_clone().map_err(spawn_err)?;

        let mut command = Command::new(path);
        command
            .stdin(Stdio::from(stdin))
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(slave))
            .env("HINTSH", "1")
            .env("HINTSH_VERSION", env!("CARGO_PKG_VERSION"));

        // Safety: only async-signal-safe libc calls run between fork and exec.
        unsafe {
            command.pre_exec(|| {
                if libc::setsid() == -1 {
                    return Err(io::Error::last_os_error());
                }
                // stdin is already the slave; make it the controlling terminal
                if libc::ioctl(libc::STDIN_FILENO, libc::TIOCSCTTY as _, 0) == -1 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let child = command.spawn().map_err(spawn_err)?;
        // Dropping the command closes the parent's slave descriptors.
        drop(command);

        info!("spawned shell {} (pid {})", path.display(), child.id());
        Ok(Self {
            child,
            status: ChildStatus::Running,
        })
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// Non-blocking liveness check. Once the shell has been reaped the final
    /// status is returned on every later call.
    pub fn poll(&mut self) -> Result<ChildStatus> {
        if self.status != ChildStatus::Running {
            return Ok(self.status);
        }
        if let Some(status) = self.child.try_wait().map_err(ShellError::Wait)? {
            self.status = ChildStatus::from(status);
            debug!("shell reaped: {:?}", self.status);
        }
        Ok(self.status)
    }

    /// Send `sig` to the shell. Does nothing once it has been reaped, so a
    /// recycled pid is never signalled.
    pub fn signal(&mut self, sig: Signal) -> Result<()> {
        if self.poll()? != ChildStatus::Running {
            return Ok(());
        }
        let pid = Pid::from_raw(self.child.id() as i32);
        signal::kill(pid, sig).map_err(ShellError::Signal)
    }

    /// Ask the shell to go away and wait at most `grace` for it.
    ///
    /// Sends SIGHUP (what a closing terminal would send), then SIGKILL if the
    /// shell is still alive when the grace period ends. Returns the last
    /// observed status, which is `Running` only if even SIGKILL went
    /// unanswered.
    pub fn terminate(&mut self, grace: Duration) -> ChildStatus {
        if let Err(e) = self.signal(Signal::SIGHUP) {
            warn!("failed to send SIGHUP to shell: {}", e);
        }
        if let Some(status) = self.wait_for_exit(grace) {
            return status;
        }

        warn!("shell ignored SIGHUP for {:?}, killing it", grace);
        if let Err(e) = self.signal(Signal::SIGKILL) {
            warn!("failed to send SIGKILL to shell: {}", e);
        }
        self.wait_for_exit(KILL_REAP_TIMEOUT).unwrap_or(ChildStatus::Running)
    }

    fn wait_for_exit(&mut self, timeout: Duration) -> Option<ChildStatus> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.poll() {
                Ok(ChildStatus::Running) => {}
                Ok(status) => return Some(status),
                Err(e) => {
                    warn!("{}", e);
                    return None;
                }
            }
            if Instant::now() >= deadline {
                return None;
            }
            thread::sleep(REAP_POLL_INTERVAL);
        }
    }
}

impl Drop for ShellProcess {
    fn drop(&mut self) {
        // Best effort: never leave a zombie behind, never block for long.
        if matches!(self.poll(), Ok(ChildStatus::Running)) {
            let _ = self.signal(Signal::SIGKILL);
            let _ = self.wait_for_exit(KILL_REAP_TIMEOUT);
        }
    }
}
