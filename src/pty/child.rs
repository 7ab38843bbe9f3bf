//! Child process management
//!
//! Spawns a program with the PTY slave as its controlling terminal and
//! standard streams, and collects its exit status.

use std::ffi::CString;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::ffi::OsStrExt;

use nix::fcntl::{open, OFlag};
use nix::libc::{self, STDERR_FILENO, STDIN_FILENO, STDOUT_FILENO};
use nix::sys::signal::{self, SigSet, SigmaskHow, Signal};
use nix::sys::stat::Mode;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{close, dup2, execvp, fork, setsid, ForkResult, Pid};

use super::{PtyError, PtyPair, PtyResult};

/// Exit code reported when the program could not be executed
const EXEC_FAILED: i32 = 127;

/// A child process attached to a PTY slave
#[derive(Debug)]
pub struct Child {
    pid: Pid,
    /// Exit code once the child has been reaped
    status: Option<i32>,
}

impl Child {
    /// Fork and exec `command` on the slave side of `pty`
    ///
    /// `command[0]` is looked up in `PATH`. The child inherits the slave handle
    /// held by `pty` (falling back to opening the slave path), so the caller
    /// may release its own slave handle as soon as this returns.
    pub fn spawn(pty: &PtyPair, command: &[String]) -> PtyResult<Self> {
        let program = command
            .first()
            .ok_or_else(|| PtyError::InvalidCommand("empty command".to_string()))?;

        // Everything the child needs is allocated before fork
        let program_cstr = CString::new(program.as_str())
            .map_err(|_| PtyError::InvalidCommand(program.clone()))?;
        let argv = command
            .iter()
            .map(|arg| CString::new(arg.as_str()).map_err(|_| PtyError::InvalidCommand(arg.clone())))
            .collect::<PtyResult<Vec<_>>>()?;
        let slave_path = CString::new(pty.slave_path().as_os_str().as_bytes())
            .map_err(|_| PtyError::InvalidCommand(pty.slave_path().display().to_string()))?;
        let inherited_slave = pty.slave_fd().map(|fd| fd.as_raw_fd());

        // SAFETY: the child only calls async-signal-safe functions before exec
        match unsafe { fork() }.map_err(PtyError::Fork)? {
            ForkResult::Parent { child } => {
                tracing::info!(pid = child.as_raw(), program = %program, "spawned child");
                Ok(Self {
                    pid: child,
                    status: None,
                })
            },
            ForkResult::Child => {
                setup_child(inherited_slave, &slave_path, &program_cstr, &argv);
                // SAFETY: _exit skips atexit handlers, which are not fork-safe
                unsafe { libc::_exit(EXEC_FAILED) }
            },
        }
    }

    /// Child process ID
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Record an exit code collected elsewhere (e.g. by a SIGCHLD handler)
    pub fn set_exited(&mut self, code: i32) {
        self.status = Some(code);
    }

    /// Check whether the child has exited, without blocking
    pub fn try_wait(&mut self) -> PtyResult<Option<i32>> {
        if self.status.is_some() {
            return Ok(self.status);
        }

        let status = waitpid(self.pid, Some(WaitPidFlag::WNOHANG)).map_err(PtyError::Wait)?;
        self.status = exit_code(status);
        Ok(self.status)
    }

    /// Wait for the child process to exit
    pub fn wait(&mut self) -> PtyResult<i32> {
        loop {
            if let Some(code) = self.status {
                return Ok(code);
            }
            match waitpid(self.pid, None) {
                Ok(status) => self.status = exit_code(status),
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(PtyError::Wait(e)),
            }
        }
    }

    /// Send a signal to the child process
    pub fn signal(&self, signal: Signal) -> PtyResult<()> {
        signal::kill(self.pid, signal).map_err(PtyError::Wait)
    }
}

/// Convert a wait status into a shell-style exit code
///
/// Returns `None` while the child is still running or merely stopped.
pub fn exit_code(status: WaitStatus) -> Option<i32> {
    match status {
        WaitStatus::Exited(_, code) => Some(code),
        WaitStatus::Signaled(_, sig, _) => Some(128 + sig as i32),
        _ => None,
    }
}

/// Set up the forked child and exec the program (runs in forked child)
fn setup_child(
    inherited_slave: Option<RawFd>,
    slave_path: &CString,
    program: &CString,
    argv: &[CString],
) {
    // The program starts with no signals blocked, whatever the parent held
    let _ = signal::pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&SigSet::empty()), None);

    // Create a new session
    if setsid().is_err() {
        return;
    }

    // The slave becomes the controlling terminal of the new session
    let slave_fd = match inherited_slave {
        Some(fd) => fd,
        None => match open(slave_path.as_c_str(), OFlag::O_RDWR, Mode::empty()) {
            Ok(fd) => fd,
            Err(_) => return,
        },
    };

    // SAFETY: TIOCSCTTY is a valid ioctl for setting the controlling terminal
    unsafe {
        if libc::ioctl(slave_fd, libc::TIOCSCTTY as _, 0) < 0 {
            // Some systems make the first tty opened by a session leader
            // the controlling terminal already
        }
    }

    if dup2(slave_fd, STDIN_FILENO).is_err()
        || dup2(slave_fd, STDOUT_FILENO).is_err()
        || dup2(slave_fd, STDERR_FILENO).is_err()
    {
        return;
    }

    if slave_fd > STDERR_FILENO {
        let _ = close(slave_fd);
    }

    // Only returns on failure
    let _ = execvp(program.as_c_str(), argv);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    use nix::poll::{poll, PollFd, PollFlags};

    fn command(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    /// Read everything the child writes until the slave hangs up
    fn read_until_hangup(pty: &PtyPair, timeout: Duration) -> Vec<u8> {
        let deadline = Instant::now() + timeout;
        let mut output = Vec::new();
        let mut buf = [0u8; 1024];
        let master = pty.master();

        while Instant::now() < deadline {
            let mut fds = [PollFd::new(&master, PollFlags::POLLIN)];
            if !matches!(poll(&mut fds, 50), Ok(n) if n > 0) {
                continue;
            }
            match nix::unistd::read(master.as_raw_fd(), &mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => output.extend_from_slice(&buf[..n]),
            }
        }

        output
    }

    #[test]
    fn test_spawn_echo() {
        let mut pty = PtyPair::allocate().unwrap();
        let mut child = Child::spawn(&pty, &command(&["echo", "hello"])).expect("Failed to spawn");
        pty.release_slave();

        let output = read_until_hangup(&pty, Duration::from_secs(2));
        let text = String::from_utf8_lossy(&output);
        assert!(text.contains("hello"), "Unexpected output: {}", text);

        assert_eq!(child.wait().unwrap(), 0);
    }

    #[test]
    fn test_exit_status_propagates() {
        let mut pty = PtyPair::allocate().unwrap();
        let mut child = Child::spawn(&pty, &command(&["sh", "-c", "exit 3"])).unwrap();
        pty.release_slave();

        assert_eq!(child.wait().unwrap(), 3);
        // Status is cached once reaped
        assert_eq!(child.try_wait().unwrap(), Some(3));
    }

    #[test]
    fn test_missing_program_exits_127() {
        let pty = PtyPair::allocate().unwrap();
        let mut child = Child::spawn(&pty, &command(&["/nonexistent/program"])).unwrap();
        assert_eq!(child.wait().unwrap(), EXEC_FAILED);
    }

    #[test]
    fn test_empty_command_rejected() {
        let pty = PtyPair::allocate().unwrap();
        assert!(matches!(
            Child::spawn(&pty, &[]),
            Err(PtyError::InvalidCommand(_))
        ));
    }

    #[test]
    fn test_signaled_exit_code() {
        let pty = PtyPair::allocate().unwrap();
        let mut child = Child::spawn(&pty, &command(&["sleep", "10"])).unwrap();
        child.signal(Signal::SIGKILL).unwrap();
        assert_eq!(child.wait().unwrap(), 128 + Signal::SIGKILL as i32);
    }

    #[test]
    fn test_child_starts_with_signals_unblocked() {
        let pty = PtyPair::allocate().unwrap();

        let blocked = crate::signal::TerminationBlock::new().unwrap();
        let mut child =
            Child::spawn(&pty, &command(&["sh", "-c", "kill -TERM $$; exit 0"])).unwrap();
        drop(blocked);

        // A blocked SIGTERM would stay pending and the shell would exit 0
        assert_eq!(child.wait().unwrap(), 128 + Signal::SIGTERM as i32);
    }
}
