//! Raw mode for the controlling terminal
//!
//! [`RawModeGuard`] switches a terminal into raw mode and puts the original
//! attributes back when released or dropped. Release is idempotent, so it can
//! be called explicitly on one exit path and again by `Drop` on another.

use std::os::fd::{AsRawFd, BorrowedFd};

use nix::sys::termios::{self, SetArg, SpecialCharacterIndices, Termios};
use nix::unistd::isatty;

/// Errors acquiring or releasing raw mode
#[derive(Debug, thiserror::Error)]
pub enum ModeError {
    #[error("Standard input is not a terminal")]
    NotATerminal,

    #[error("Failed to read terminal attributes: {0}")]
    GetAttributes(#[source] nix::Error),

    #[error("Failed to set terminal attributes: {0}")]
    SetAttributes(#[source] nix::Error),

    #[error("Failed to restore terminal attributes: {0}")]
    Restore(#[source] nix::Error),
}

/// RAII guard for raw terminal mode
#[derive(Debug)]
pub struct RawModeGuard<'fd> {
    fd: BorrowedFd<'fd>,
    /// Attributes captured at acquisition, `None` once restored
    original: Option<Termios>,
}

impl<'fd> RawModeGuard<'fd> {
    /// Put the terminal behind `fd` into raw mode
    ///
    /// Disables canonical input, echo and signal-generating characters, so
    /// every byte (including ^C and ^Z) reaches the reader unmodified.
    pub fn acquire(fd: BorrowedFd<'fd>) -> Result<Self, ModeError> {
        if !isatty(fd.as_raw_fd()).unwrap_or(false) {
            return Err(ModeError::NotATerminal);
        }

        let original = termios::tcgetattr(fd).map_err(ModeError::GetAttributes)?;

        let mut raw = original.clone();
        termios::cfmakeraw(&mut raw);
        raw.control_chars[SpecialCharacterIndices::VMIN as usize] = 1;
        raw.control_chars[SpecialCharacterIndices::VTIME as usize] = 0;

        if let Err(e) = termios::tcsetattr(fd, SetArg::TCSANOW, &raw) {
            // tcsetattr may apply part of the request before failing
            let _ = termios::tcsetattr(fd, SetArg::TCSANOW, &original);
            return Err(ModeError::SetAttributes(e));
        }

        tracing::debug!(fd = fd.as_raw_fd(), "terminal switched to raw mode");

        Ok(Self {
            fd,
            original: Some(original),
        })
    }

    /// Whether raw mode is still applied by this guard
    pub fn is_active(&self) -> bool {
        self.original.is_some()
    }

    /// Attributes captured before raw mode was applied
    pub fn original(&self) -> Option<&Termios> {
        self.original.as_ref()
    }

    /// Restore the original attributes
    ///
    /// Only the first call does anything; later calls return `Ok(())`.
    pub fn release(&mut self) -> Result<(), ModeError> {
        let Some(original) = self.original.take() else {
            return Ok(());
        };

        termios::tcsetattr(self.fd, SetArg::TCSANOW, &original).map_err(ModeError::Restore)?;
        tracing::debug!(fd = self.fd.as_raw_fd(), "terminal mode restored");
        Ok(())
    }
}

impl Drop for RawModeGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            tracing::warn!("{}", e);
        }
    }
}
