//! Signal handling for the proxy
//!
//! Signal handlers run asynchronously and may only do async-signal-safe work,
//! so the handler installed here writes the signal number into a self-pipe
//! and returns. [`SignalBridge::dispatch`] runs later on the proxy thread,
//! when the pipe polls readable, and does the real work: propagating the
//! window size on `SIGWINCH`, reaping the child on `SIGCHLD` and turning
//! termination signals into a shutdown request.

use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicI32, Ordering};

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, FdFlag, OFlag};
use nix::libc;
use nix::sys::signal::{
    pthread_sigmask, sigaction, SaFlags, SigAction, SigHandler, SigSet, SigmaskHow, Signal,
};
use nix::sys::wait::{waitpid, WaitPidFlag};
use nix::unistd::{pipe, read, Pid};

pub use crate::proxy::ShutdownReason;

use crate::proxy::NotificationSource;
use crate::pty::{exit_code, WindowSize};

/// Write end of the self-pipe of the installed bridge, -1 when none
static WAKE_FD: AtomicI32 = AtomicI32::new(-1);

/// Signals that end the proxy
const TERMINATION_SIGNALS: [Signal; 4] = [
    Signal::SIGTERM,
    Signal::SIGHUP,
    Signal::SIGINT,
    Signal::SIGQUIT,
];

/// Every signal the bridge installs a handler for
const HANDLED_SIGNALS: [Signal; 6] = [
    Signal::SIGWINCH,
    Signal::SIGCHLD,
    Signal::SIGTERM,
    Signal::SIGHUP,
    Signal::SIGINT,
    Signal::SIGQUIT,
];

/// Errors installing the signal bridge
#[derive(Debug, thiserror::Error)]
pub enum SignalError {
    #[error("A signal bridge is already installed in this process")]
    AlreadyInstalled,

    #[error("Failed to create notification pipe: {0}")]
    Pipe(#[source] nix::Error),

    #[error("Failed to change signal mask: {0}")]
    Mask(#[source] nix::Error),

    #[error("Failed to install handler for {signal}: {source}")]
    Install {
        signal: Signal,
        #[source]
        source: nix::Error,
    },
}

extern "C" fn on_signal(signo: libc::c_int) {
    // The interrupted code may be about to inspect errno
    // SAFETY: errno_location points at this thread's errno
    let saved_errno = unsafe { *errno_location() };

    let fd = WAKE_FD.load(Ordering::SeqCst);
    if fd >= 0 {
        let byte = signo as u8;
        // SAFETY: write(2) is async-signal-safe. A full pipe drops the byte,
        // which is fine because one pending byte per signal kind is enough.
        unsafe {
            libc::write(fd, &byte as *const u8 as *const libc::c_void, 1);
        }
    }

    // SAFETY: as above
    unsafe { *errno_location() = saved_errno };
}

#[cfg(any(target_os = "linux", target_os = "emscripten", target_os = "redox"))]
unsafe fn errno_location() -> *mut libc::c_int {
    libc::__errno_location()
}

#[cfg(any(target_os = "android", target_os = "netbsd", target_os = "openbsd"))]
unsafe fn errno_location() -> *mut libc::c_int {
    libc::__errno()
}

#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "dragonfly"
))]
unsafe fn errno_location() -> *mut libc::c_int {
    libc::__error()
}

/// Termination signals held pending on the calling thread
///
/// Covers the startup window before a [`SignalBridge`] exists, when those
/// signals still have their default disposition. Dropping the block restores
/// the previous mask, and anything that arrived meanwhile is delivered then.
pub struct TerminationBlock {
    previous: SigSet,
}

impl TerminationBlock {
    pub fn new() -> Result<Self, SignalError> {
        let mut blocked = SigSet::empty();
        for signal in TERMINATION_SIGNALS {
            blocked.add(signal);
        }

        let mut previous = SigSet::empty();
        pthread_sigmask(SigmaskHow::SIG_BLOCK, Some(&blocked), Some(&mut previous))
            .map_err(SignalError::Mask)?;
        Ok(Self { previous })
    }
}

impl Drop for TerminationBlock {
    fn drop(&mut self) {
        if let Err(e) = pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&self.previous), None) {
            tracing::warn!("Failed to restore signal mask: {}", e);
        }
    }
}

/// Copy the size of `terminal` onto `master`
///
/// Failures are logged and ignored; a zero-sized terminal is not copied.
pub fn sync_window_size(terminal: BorrowedFd<'_>, master: BorrowedFd<'_>) -> Option<WindowSize> {
    let size = match WindowSize::from_fd(terminal) {
        Ok(size) if !size.is_empty() => size,
        Ok(_) => return None,
        Err(e) => {
            tracing::warn!("{}", e);
            return None;
        },
    };

    match size.apply_to(master) {
        Ok(()) => {
            tracing::debug!(rows = size.rows, cols = size.cols, "window size propagated");
            Some(size)
        },
        Err(e) => {
            tracing::warn!("{}", e);
            None
        },
    }
}

/// Translates process signals into proxy events
///
/// Only one bridge can be installed per process. Dropping it restores the
/// signal dispositions that were in place before [`SignalBridge::install`].
pub struct SignalBridge<'a> {
    read_end: OwnedFd,
    write_end: OwnedFd,
    /// PTY master that receives window size updates
    master: BorrowedFd<'a>,
    /// Terminal whose size is mirrored onto the master
    terminal: Option<BorrowedFd<'a>>,
    /// Child attached to the slave, if one was spawned
    child: Option<Pid>,
    child_status: Option<i32>,
    previous: Vec<(Signal, SigAction)>,
}

impl<'a> SignalBridge<'a> {
    /// Install handlers for resize, child and termination signals
    ///
    /// `terminal` is the controlling terminal whose size is read on every
    /// `SIGWINCH`; pass `None` when the input is not a terminal.
    pub fn install(
        master: BorrowedFd<'a>,
        terminal: Option<BorrowedFd<'a>>,
    ) -> Result<Self, SignalError> {
        let (read_fd, write_fd) = pipe().map_err(SignalError::Pipe)?;
        // SAFETY: pipe() returned two fresh descriptors owned by nobody else
        let (read_end, write_end) =
            unsafe { (OwnedFd::from_raw_fd(read_fd), OwnedFd::from_raw_fd(write_fd)) };
        configure_pipe_end(read_fd)?;
        configure_pipe_end(write_fd)?;

        WAKE_FD
            .compare_exchange(-1, write_fd, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| SignalError::AlreadyInstalled)?;

        let mut bridge = Self {
            read_end,
            write_end,
            master,
            terminal,
            child: None,
            child_status: None,
            previous: Vec::with_capacity(HANDLED_SIGNALS.len()),
        };

        let action = SigAction::new(
            SigHandler::Handler(on_signal),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );
        for signal in HANDLED_SIGNALS {
            // SAFETY: on_signal only loads an atomic and calls write(2)
            let previous = unsafe { sigaction(signal, &action) }
                .map_err(|source| SignalError::Install { signal, source })?;
            bridge.previous.push((signal, previous));
        }

        tracing::debug!(pipe = bridge.write_end.as_raw_fd(), "signal handlers installed");
        Ok(bridge)
    }

    /// Report `SIGCHLD` for this process as a shutdown request
    pub fn watch_child(&mut self, pid: Pid) {
        self.child = Some(pid);
        self.child_status = None;
    }

    /// Exit code of the watched child, once reaped
    pub fn child_status(&self) -> Option<i32> {
        self.child_status
    }

    /// Copy the terminal's current size onto the PTY master
    ///
    /// The size is read fresh on every call. Failures are logged and ignored;
    /// the proxy keeps working with the stale size.
    pub fn propagate_window_size(&self) -> Option<WindowSize> {
        sync_window_size(self.terminal?, self.master)
    }

    /// Drain pending signals and act on them
    ///
    /// Returns a shutdown request when a termination signal arrived or the
    /// watched child exited.
    pub fn dispatch(&mut self) -> Option<ShutdownReason> {
        let mut resized = false;
        let mut child_changed = false;
        let mut terminate = None;

        let mut buf = [0u8; 64];
        loop {
            match read(self.read_end.as_raw_fd(), &mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    for &byte in &buf[..n] {
                        match Signal::try_from(byte as i32) {
                            Ok(Signal::SIGWINCH) => resized = true,
                            Ok(Signal::SIGCHLD) => child_changed = true,
                            Ok(sig) if TERMINATION_SIGNALS.contains(&sig) => {
                                terminate.get_or_insert(sig);
                            },
                            _ => {},
                        }
                    }
                },
                Err(Errno::EINTR) => continue,
                Err(Errno::EAGAIN) => break,
                Err(e) => {
                    tracing::warn!("Failed to read signal pipe: {}", e);
                    break;
                },
            }
        }

        if resized {
            self.propagate_window_size();
        }

        if let Some(signal) = terminate {
            tracing::info!(%signal, "termination requested");
            return Some(ShutdownReason::Terminated(signal));
        }

        if child_changed {
            if let Some(code) = self.reap_child() {
                return Some(ShutdownReason::ChildExited(code));
            }
        }

        None
    }

    /// Collect the watched child's status if it has exited
    fn reap_child(&mut self) -> Option<i32> {
        let pid = self.child?;
        if self.child_status.is_some() {
            return None;
        }

        match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(status) => {
                self.child_status = exit_code(status);
                if let Some(code) = self.child_status {
                    tracing::info!(pid = pid.as_raw(), code, "child exited");
                }
                self.child_status
            },
            Err(e) => {
                tracing::warn!(pid = pid.as_raw(), "waitpid failed: {}", e);
                None
            },
        }
    }
}

impl NotificationSource for SignalBridge<'_> {
    fn fd(&self) -> BorrowedFd<'_> {
        self.read_end.as_fd()
    }

    fn dispatch(&mut self) -> Option<ShutdownReason> {
        SignalBridge::dispatch(self)
    }
}

impl Drop for SignalBridge<'_> {
    fn drop(&mut self) {
        for (signal, previous) in self.previous.drain(..).rev() {
            // SAFETY: restores a disposition previously returned by sigaction
            if let Err(e) = unsafe { sigaction(signal, &previous) } {
                tracing::warn!(%signal, "Failed to restore signal handler: {}", e);
            }
        }

        let _ = WAKE_FD.compare_exchange(
            self.write_end.as_raw_fd(),
            -1,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }
}

/// Make a self-pipe end non-blocking and close-on-exec
fn configure_pipe_end(fd: RawFd) -> Result<(), SignalError> {
    let flags = fcntl(fd, FcntlArg::F_GETFL).map_err(SignalError::Pipe)?;
    fcntl(
        fd,
        FcntlArg::F_SETFL(OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK),
    )
    .map_err(SignalError::Pipe)?;
    fcntl(fd, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC)).map_err(SignalError::Pipe)?;
    Ok(())
}

/// Serializes tests that install signal handlers (dispositions are process-wide)
#[cfg(test)]
pub(crate) static TEST_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pty::PtyPair;
    use nix::poll::{poll, PollFd, PollFlags};
    use nix::sys::signal::raise;
    use std::time::{Duration, Instant};

    fn lock() -> std::sync::MutexGuard<'static, ()> {
        TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Dispatch until a shutdown request shows up or the deadline passes
    fn dispatch_until_shutdown(bridge: &mut SignalBridge<'_>, timeout: Duration) -> Option<ShutdownReason> {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            let fd = bridge.read_end.as_fd();
            let mut fds = [PollFd::new(&fd, PollFlags::POLLIN)];
            let _ = poll(&mut fds, 50);
            if let Some(reason) = bridge.dispatch() {
                return Some(reason);
            }
        }
        None
    }

    #[test]
    fn test_only_one_bridge_per_process() {
        let _lock = lock();
        let pty = PtyPair::allocate().unwrap();

        let first = SignalBridge::install(pty.master(), None).unwrap();
        assert!(matches!(
            SignalBridge::install(pty.master(), None),
            Err(SignalError::AlreadyInstalled)
        ));

        drop(first);
        assert!(SignalBridge::install(pty.master(), None).is_ok());
    }

    #[test]
    fn test_resize_propagates_terminal_size() {
        let _lock = lock();
        let target = PtyPair::allocate().unwrap();
        let terminal = PtyPair::allocate().unwrap();
        terminal.resize(WindowSize::new(120, 40)).unwrap();

        let mut bridge = SignalBridge::install(target.master(), Some(terminal.master())).unwrap();

        // Re-delivering the same size leaves the PTY at that size
        for _ in 0..3 {
            raise(Signal::SIGWINCH).unwrap();
            assert_eq!(bridge.dispatch(), None);

            let size = target.window_size().unwrap();
            assert_eq!(size.rows, 40);
            assert_eq!(size.cols, 120);
        }
    }

    #[test]
    fn test_resize_without_terminal_is_ignored() {
        let _lock = lock();
        let target = PtyPair::allocate().unwrap();
        let mut bridge = SignalBridge::install(target.master(), None).unwrap();

        raise(Signal::SIGWINCH).unwrap();
        assert_eq!(bridge.dispatch(), None);
        assert_eq!(bridge.propagate_window_size(), None);
    }

    #[test]
    fn test_termination_signal_requests_shutdown() {
        let _lock = lock();
        let pty = PtyPair::allocate().unwrap();
        let mut bridge = SignalBridge::install(pty.master(), None).unwrap();

        raise(Signal::SIGTERM).unwrap();
        assert_eq!(
            bridge.dispatch(),
            Some(ShutdownReason::Terminated(Signal::SIGTERM))
        );

        // Nothing left in the pipe
        assert_eq!(bridge.dispatch(), None);
    }

    #[test]
    fn test_handler_preserves_errno() {
        let _lock = lock();
        let pty = PtyPair::allocate().unwrap();
        let mut bridge = SignalBridge::install(pty.master(), None).unwrap();

        // Fill the pipe so the handler's own write fails with EAGAIN
        let filler = [0u8; 4096];
        while nix::unistd::write(bridge.write_end.as_raw_fd(), &filler).is_ok() {}

        // SAFETY: errno_location points at this thread's errno
        unsafe { *errno_location() = libc::ENOENT };
        raise(Signal::SIGWINCH).unwrap();
        assert_eq!(Errno::last(), Errno::ENOENT);

        // Filler bytes are not signals
        assert_eq!(bridge.dispatch(), None);
    }

    #[test]
    fn test_termination_held_until_bridge_installed() {
        let _lock = lock();
        let pty = PtyPair::allocate().unwrap();

        let block = TerminationBlock::new().unwrap();
        // Without the block the default action would end the test process
        raise(Signal::SIGTERM).unwrap();

        let mut bridge = SignalBridge::install(pty.master(), None).unwrap();
        drop(block);

        assert_eq!(
            bridge.dispatch(),
            Some(ShutdownReason::Terminated(Signal::SIGTERM))
        );
    }

    #[test]
    fn test_child_exit_requests_shutdown() {
        let _lock = lock();
        let pty = PtyPair::allocate().unwrap();
        let mut bridge = SignalBridge::install(pty.master(), None).unwrap();

        let child = std::process::Command::new("sh")
            .args(["-c", "exit 5"])
            .spawn()
            .unwrap();
        bridge.watch_child(Pid::from_raw(child.id() as i32));

        let reason = dispatch_until_shutdown(&mut bridge, Duration::from_secs(5));
        assert_eq!(reason, Some(ShutdownReason::ChildExited(5)));
        assert_eq!(bridge.child_status(), Some(5));
    }
}
