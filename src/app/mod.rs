//! Application orchestration
//!
//! Wires the components together in a fixed order: allocate the PTY,
//! announce the slave path, switch the terminal to raw mode, install the
//! signal bridge, optionally spawn a child onto the slave, then proxy until
//! the session ends. Teardown runs in reverse, and the terminal is restored
//! on every exit path after raw mode was acquired.

mod config;

pub use config::{AnnounceStream, CliArgs, Config, ConfigError};

use std::io::{self, Write};
use std::os::fd::{AsFd, BorrowedFd};

use nix::errno::Errno;
use nix::sys::signal::Signal;

use crate::proxy::{NotificationSource, ProxyError, ProxyLoop, ShutdownReason};
use crate::pty::{Child, PtyError, PtyPair};
use crate::signal::{sync_window_size, SignalBridge, SignalError, TerminationBlock};
use crate::tty::{ModeError, RawModeGuard};

/// Errors that abort a proxy session
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Pty(#[from] PtyError),

    #[error(transparent)]
    Mode(#[from] ModeError),

    #[error(transparent)]
    Signal(#[from] SignalError),

    #[error(transparent)]
    Proxy(#[from] ProxyError),

    #[error("Failed to announce PTY device: {0}")]
    Io(#[from] io::Error),
}

/// A configured proxy session
#[derive(Debug, Clone)]
pub struct App {
    config: Config,
}

impl App {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Proxy the process's stdin and stdout through a new PTY
    ///
    /// Returns the exit status the process should end with.
    pub fn run(&self) -> Result<i32, AppError> {
        let stdin = io::stdin();
        let stdout = io::stdout();

        match self.config.announce {
            AnnounceStream::Stdout => {
                self.run_with(stdin.as_fd(), stdout.as_fd(), &mut io::stdout())
            },
            AnnounceStream::Stderr => {
                self.run_with(stdin.as_fd(), stdout.as_fd(), &mut io::stderr())
            },
        }
    }

    /// Proxy explicit handles through a new PTY
    ///
    /// `input` must be a terminal; it is put in raw mode for the duration of
    /// the session and its size is mirrored onto the PTY. The slave path is
    /// written to `announce` before anything else can fail.
    pub fn run_with(
        &self,
        input: BorrowedFd<'_>,
        output: BorrowedFd<'_>,
        announce: &mut dyn Write,
    ) -> Result<i32, AppError> {
        let mut pty = PtyPair::allocate()?;

        writeln!(announce, "Opened new PTY device: {}", pty.slave_path().display())?;
        announce.flush()?;

        // Termination signals wait until the bridge can turn them into a
        // clean shutdown, so raw mode is never left behind
        let blocked = TerminationBlock::new()?;

        let mut guard = RawModeGuard::acquire(input)?;
        pty.set_nonblocking(true)?;

        // Size the PTY before a child can query it
        sync_window_size(input, pty.master());

        let mut child = if self.config.command.is_empty() {
            None
        } else {
            let child = Child::spawn(&pty, &self.config.command)?;
            // From here on only the child keeps the slave open
            pty.release_slave();
            Some(child)
        };

        let code = {
            let mut bridge = SignalBridge::install(pty.master(), Some(input))?;
            if let Some(child) = &child {
                bridge.watch_child(child.pid());
            }
            drop(blocked);

            let mut proxy =
                ProxyLoop::new(input, output, pty.master(), self.config.proxy_options());
            let notifications: &mut dyn NotificationSource = &mut bridge;
            let outcome = proxy.run(Some(notifications))?;
            tracing::debug!(
                to_pty = outcome.bytes_to_pty,
                to_output = outcome.bytes_to_output,
                "proxy finished"
            );

            match (outcome.reason, child.as_mut()) {
                (Some(ShutdownReason::ChildExited(code)), Some(child)) => {
                    child.set_exited(code);
                    code
                },
                (Some(reason @ ShutdownReason::Terminated(_)), Some(child)) => {
                    hang_up(child);
                    reason.exit_code()
                },
                (Some(reason), None) => reason.exit_code(),
                (None, Some(child)) => match bridge.child_status() {
                    Some(code) => {
                        child.set_exited(code);
                        code
                    },
                    None => finish_child(child)?,
                },
                (None, None) => 0,
            }
        };

        match guard.release() {
            Ok(()) => {},
            // A hung-up terminal has no attributes left to restore
            Err(ModeError::Restore(Errno::EIO)) => {
                tracing::debug!("terminal hung up before its mode was restored");
            },
            Err(e) => return Err(e.into()),
        }
        Ok(code)
    }
}

/// Collect the exit status of a child whose PTY session ended
///
/// A child that is still running gets `SIGHUP` first, as it would from a
/// closing terminal.
fn finish_child(child: &mut Child) -> Result<i32, PtyError> {
    if let Some(code) = child.try_wait()? {
        return Ok(code);
    }

    tracing::info!(pid = child.pid().as_raw(), "sending SIGHUP to child");
    child.signal(Signal::SIGHUP)?;
    child.wait()
}

/// Best-effort `SIGHUP` for a child left behind by a termination signal
fn hang_up(child: &mut Child) {
    match child.try_wait() {
        Ok(Some(_)) => {},
        Ok(None) => {
            if let Err(e) = child.signal(Signal::SIGHUP) {
                tracing::warn!("{}", e);
            }
        },
        Err(e) => tracing::warn!("{}", e),
    }
}
