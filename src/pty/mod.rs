//! PTY (Pseudoterminal) allocation
//!
//! This module opens master/slave pseudoterminal pairs, manages their
//! window size, and optionally spawns a child process onto the slave.

#[cfg(unix)]
mod child;
#[cfg(unix)]
mod unix;

#[cfg(unix)]
pub use child::{exit_code, Child};
#[cfg(unix)]
pub use unix::PtyPair;

use std::os::fd::{AsRawFd, BorrowedFd};

use nix::libc;

/// Error type for PTY operations
#[derive(Debug, thiserror::Error)]
pub enum PtyError {
    #[error("Failed to open PTY master: {0}")]
    OpenMaster(#[source] nix::Error),

    #[error("Failed to grant PTY access: {0}")]
    GrantPty(#[source] nix::Error),

    #[error("Failed to unlock PTY: {0}")]
    UnlockPty(#[source] nix::Error),

    #[error("Failed to get PTY slave name: {0}")]
    PtsName(#[source] nix::Error),

    #[error("Failed to open PTY slave {path}: {source}")]
    OpenSlave {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to set non-blocking mode: {0}")]
    SetNonBlocking(#[source] nix::Error),

    #[error("Failed to set window size: {0}")]
    SetWindowSize(#[source] nix::Error),

    #[error("Failed to get window size: {0}")]
    GetWindowSize(#[source] nix::Error),

    #[error("Failed to fork: {0}")]
    Fork(#[source] nix::Error),

    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    #[error("Failed to wait for child: {0}")]
    Wait(#[source] nix::Error),
}

/// Result type for PTY operations
pub type PtyResult<T> = Result<T, PtyError>;

/// Window size for PTY
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSize {
    pub rows: u16,
    pub cols: u16,
    pub pixel_width: u16,
    pub pixel_height: u16,
}

impl WindowSize {
    /// Create a new window size with just rows and columns
    pub fn new(cols: u16, rows: u16) -> Self {
        Self {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        }
    }

    /// Whether this size carries usable dimensions
    ///
    /// Terminals that were never sized (serial consoles, some CI runners)
    /// report 0x0.
    pub fn is_empty(&self) -> bool {
        self.rows == 0 || self.cols == 0
    }

    /// Read the window size of a terminal or PTY master
    pub fn from_fd(fd: BorrowedFd<'_>) -> PtyResult<Self> {
        let mut ws = libc::winsize {
            ws_row: 0,
            ws_col: 0,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };

        // SAFETY: TIOCGWINSZ writes a winsize into the pointed-to struct
        let result = unsafe { libc::ioctl(fd.as_raw_fd(), libc::TIOCGWINSZ, &mut ws) };

        if result < 0 {
            Err(PtyError::GetWindowSize(nix::errno::Errno::last()))
        } else {
            Ok(ws.into())
        }
    }

    /// Apply this window size to a terminal or PTY master
    pub fn apply_to(&self, fd: BorrowedFd<'_>) -> PtyResult<()> {
        let ws: libc::winsize = (*self).into();

        // SAFETY: TIOCSWINSZ only reads the pointed-to winsize
        let result = unsafe { libc::ioctl(fd.as_raw_fd(), libc::TIOCSWINSZ, &ws) };

        if result < 0 {
            Err(PtyError::SetWindowSize(nix::errno::Errno::last()))
        } else {
            Ok(())
        }
    }
}

impl Default for WindowSize {
    fn default() -> Self {
        Self::new(80, 24)
    }
}

impl From<WindowSize> for libc::winsize {
    fn from(ws: WindowSize) -> Self {
        libc::winsize {
            ws_row: ws.rows,
            ws_col: ws.cols,
            ws_xpixel: ws.pixel_width,
            ws_ypixel: ws.pixel_height,
        }
    }
}

impl From<libc::winsize> for WindowSize {
    fn from(ws: libc::winsize) -> Self {
        Self {
            rows: ws.ws_row,
            cols: ws.ws_col,
            pixel_width: ws.ws_xpixel,
            pixel_height: ws.ws_ypixel,
        }
    }
}
