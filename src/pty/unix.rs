//! Unix PTY implementation
//!
//! Allocates PTY pairs using the POSIX PTY functions.
//!
//! # References
//!
//! - posix_openpt(3): https://man7.org/linux/man-pages/man3/posix_openpt.3.html
//! - grantpt(3), unlockpt(3), ptsname(3)
//! - tty_ioctl(4): https://man7.org/linux/man-pages/man4/tty_ioctl.4.html

use std::fs::{File, OpenOptions};
use std::os::fd::{AsFd, BorrowedFd, FromRawFd, IntoRawFd, OwnedFd};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use nix::fcntl::{fcntl, FcntlArg, FdFlag, OFlag};
use nix::libc;
use nix::pty::{grantpt, posix_openpt, ptsname, unlockpt};

use super::{PtyError, PtyResult, WindowSize};

/// A PTY master/slave pair
///
/// The master is owned for the lifetime of the pair. The slave is opened once
/// during allocation to prove the path is usable and is held until
/// [`PtyPair::release_slave`] is called. While the slave is held the master
/// never reports a hangup, so an external process can attach to the path at
/// any time.
#[derive(Debug)]
pub struct PtyPair {
    /// The PTY master file descriptor
    master: OwnedFd,
    /// Path of the slave device (e.g. /dev/pts/3)
    slave_path: PathBuf,
    /// Slave handle held by this process, if any
    slave: Option<File>,
}

impl PtyPair {
    /// Allocate a new PTY pair
    pub fn allocate() -> PtyResult<Self> {
        // Open PTY master
        let master = posix_openpt(OFlag::O_RDWR | OFlag::O_NOCTTY).map_err(PtyError::OpenMaster)?;

        // Grant and unlock the slave
        grantpt(&master).map_err(PtyError::GrantPty)?;
        unlockpt(&master).map_err(PtyError::UnlockPty)?;

        // SAFETY: ptsname is not thread-safe, but the returned string is copied
        // out immediately after unlockpt
        let slave_name = unsafe { ptsname(&master) }.map_err(PtyError::PtsName)?;

        // SAFETY: into_raw_fd hands over sole ownership of the descriptor
        let master = unsafe { OwnedFd::from_raw_fd(master.into_raw_fd()) };
        fcntl(master.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))
            .map_err(PtyError::OpenMaster)?;

        let slave_path = PathBuf::from(slave_name);
        let slave = open_slave(&slave_path)?;

        tracing::debug!(
            master_fd = master.as_raw_fd(),
            slave = %slave_path.display(),
            "allocated PTY pair"
        );

        Ok(Self {
            master,
            slave_path,
            slave: Some(slave),
        })
    }

    /// Path of the slave device
    pub fn slave_path(&self) -> &Path {
        &self.slave_path
    }

    /// Borrow the master file descriptor
    pub fn master(&self) -> BorrowedFd<'_> {
        self.master.as_fd()
    }

    /// Whether this process still holds a slave handle
    pub fn holds_slave(&self) -> bool {
        self.slave.is_some()
    }

    /// Borrow the slave handle held by this process, if any
    pub(crate) fn slave_fd(&self) -> Option<BorrowedFd<'_>> {
        self.slave.as_ref().map(|slave| slave.as_fd())
    }

    /// Close the slave handle held by this process
    ///
    /// Calling this more than once is a no-op. Once every other process has
    /// closed the slave too, reads on the master fail with `EIO`.
    pub fn release_slave(&mut self) {
        if self.slave.take().is_some() {
            tracing::debug!(slave = %self.slave_path.display(), "released slave handle");
        }
    }

    /// Set or clear `O_NONBLOCK` on the master
    pub fn set_nonblocking(&self, nonblocking: bool) -> PtyResult<()> {
        let fd = self.master.as_raw_fd();
        let flags = fcntl(fd, FcntlArg::F_GETFL).map_err(PtyError::SetNonBlocking)?;
        let flags = OFlag::from_bits_truncate(flags);
        let new_flags = if nonblocking {
            flags | OFlag::O_NONBLOCK
        } else {
            flags & !OFlag::O_NONBLOCK
        };
        fcntl(fd, FcntlArg::F_SETFL(new_flags)).map_err(PtyError::SetNonBlocking)?;
        Ok(())
    }

    /// Resize the PTY
    pub fn resize(&self, size: WindowSize) -> PtyResult<()> {
        size.apply_to(self.master())
    }

    /// Current window size of the PTY
    pub fn window_size(&self) -> PtyResult<WindowSize> {
        WindowSize::from_fd(self.master())
    }
}

impl AsFd for PtyPair {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.master.as_fd()
    }
}

/// Open a PTY slave by path without making it the controlling terminal
pub(crate) fn open_slave(path: &Path) -> PtyResult<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_NOCTTY | libc::O_CLOEXEC)
        .open(path)
        .map_err(|source| PtyError::OpenSlave {
            path: path.display().to_string(),
            source,
        })
}
