//! Bidirectional proxy between a terminal and a PTY master
//!
//! [`ProxyLoop`] waits on every readable source with a single `poll(2)` call
//! and shuttles bytes in two independent directions:
//!
//! - input → PTY master (keystrokes)
//! - PTY master → output (program output)
//!
//! Each direction holds at most one chunk that has been read but not yet
//! written. A direction only reads again once its chunk is fully written, so
//! bytes are forwarded in order and a slow writer applies backpressure to
//! its own reader without stalling the other direction.

use std::os::fd::{AsRawFd, BorrowedFd};
use std::time::Duration;

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags};
use nix::sys::signal::Signal;
use nix::unistd::{read, write};

/// Default read chunk size
pub const DEFAULT_BUFFER_SIZE: usize = 2048;

/// Default idle time after which a shutting-down loop stops
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_millis(100);

/// Lifecycle of the proxy loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyState {
    /// Both directions are forwarding
    Running,
    /// A direction ended or shutdown was requested; draining what is left
    ShuttingDown,
    /// No further reads or writes will be issued
    Stopped,
}

/// Why the proxy was asked to stop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// The child attached to the slave exited with this code
    ChildExited(i32),
    /// The process received a termination signal
    Terminated(Signal),
}

impl ShutdownReason {
    /// Shell-style exit code for this reason
    pub fn exit_code(&self) -> i32 {
        match *self {
            ShutdownReason::ChildExited(code) => code,
            ShutdownReason::Terminated(signal) => 128 + signal as i32,
        }
    }
}

/// An out-of-band event source watched alongside the data streams
pub trait NotificationSource {
    /// Descriptor that polls readable while notifications are pending
    fn fd(&self) -> BorrowedFd<'_>;

    /// Handle pending notifications, possibly requesting shutdown
    fn dispatch(&mut self) -> Option<ShutdownReason>;
}

/// Tuning for [`ProxyLoop`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxyOptions {
    /// Maximum bytes read per chunk
    pub buffer_size: usize,
    /// How long a shutting-down loop waits for more data before stopping
    pub drain_timeout: Duration,
    /// After input EOF, keep draining until the PTY side hangs up instead of
    /// stopping on the drain timeout. Only useful when the slave is owned by
    /// a spawned child, since a held slave never hangs up.
    pub wait_for_hangup: bool,
}

impl Default for ProxyOptions {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            wait_for_hangup: false,
        }
    }
}

/// Summary of a finished proxy run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProxyOutcome {
    /// Explicit shutdown request, `None` when the streams simply ended
    pub reason: Option<ShutdownReason>,
    /// Bytes written to the PTY master
    pub bytes_to_pty: u64,
    /// Bytes written to the output stream
    pub bytes_to_output: u64,
}

/// Errors that abort the whole loop
///
/// Read and write errors never show up here: they end the affected
/// direction and are logged.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("Failed to poll: {0}")]
    Poll(#[source] nix::Error),
}

/// One direction of the proxy
struct Channel<'a> {
    name: &'static str,
    source: BorrowedFd<'a>,
    sink: BorrowedFd<'a>,
    buf: Vec<u8>,
    /// Unwritten bytes are `buf[start..end]`
    start: usize,
    end: usize,
    /// The source reached end-of-file or hung up, as opposed to failing
    eof: bool,
    /// Finished: nothing more will be read or written
    closed: bool,
    transferred: u64,
}

impl<'a> Channel<'a> {
    fn new(
        name: &'static str,
        source: BorrowedFd<'a>,
        sink: BorrowedFd<'a>,
        buffer_size: usize,
    ) -> Self {
        Self {
            name,
            source,
            sink,
            buf: vec![0; buffer_size.max(1)],
            start: 0,
            end: 0,
            eof: false,
            closed: false,
            transferred: 0,
        }
    }

    fn has_pending(&self) -> bool {
        self.start < self.end
    }

    fn wants_read(&self) -> bool {
        !self.closed && !self.eof && !self.has_pending()
    }

    fn wants_write(&self) -> bool {
        !self.closed && self.has_pending()
    }

    /// Read one chunk from the source
    fn fill(&mut self) {
        loop {
            match read(self.source.as_raw_fd(), &mut self.buf) {
                Ok(0) => {
                    tracing::debug!(direction = self.name, "end of file");
                    self.eof = true;
                },
                Ok(n) => {
                    self.start = 0;
                    self.end = n;
                },
                Err(Errno::EINTR) => continue,
                Err(Errno::EAGAIN) => {},
                // A PTY master reports EIO once every slave handle is closed
                Err(Errno::EIO) => {
                    tracing::debug!(direction = self.name, "source hung up");
                    self.eof = true;
                },
                Err(e) => {
                    tracing::warn!(direction = self.name, "read failed: {}", e);
                    self.close();
                },
            }
            break;
        }
        self.settle();
    }

    /// Write as much of the pending chunk as the sink accepts
    fn flush(&mut self) {
        while self.has_pending() && !self.closed {
            match write(self.sink.as_raw_fd(), &self.buf[self.start..self.end]) {
                Ok(0) => break,
                Ok(n) => {
                    self.start += n;
                    self.transferred += n as u64;
                },
                Err(Errno::EINTR) => continue,
                Err(Errno::EAGAIN) => break,
                Err(e) => {
                    tracing::warn!(direction = self.name, "write failed: {}", e);
                    self.close();
                },
            }
        }
        self.settle();
    }

    /// Stop this direction, discarding anything unwritten
    fn close(&mut self) {
        self.closed = true;
        self.start = 0;
        self.end = 0;
    }

    fn settle(&mut self) {
        if !self.has_pending() {
            self.start = 0;
            self.end = 0;
            if self.eof {
                self.closed = true;
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Input,
    Output,
    Master,
    Notify,
}

/// The data-shuttling state machine
pub struct ProxyLoop<'a> {
    /// input → PTY master
    inbound: Channel<'a>,
    /// PTY master → output
    outbound: Channel<'a>,
    options: ProxyOptions,
    state: ProxyState,
    reason: Option<ShutdownReason>,
}

impl<'a> ProxyLoop<'a> {
    /// Create a loop over the given handles
    ///
    /// The master should be non-blocking; `input` and `output` are used as
    /// they are, since their file status flags are usually shared with the
    /// parent shell.
    pub fn new(
        input: BorrowedFd<'a>,
        output: BorrowedFd<'a>,
        master: BorrowedFd<'a>,
        options: ProxyOptions,
    ) -> Self {
        Self {
            inbound: Channel::new("input->pty", input, master, options.buffer_size),
            outbound: Channel::new("pty->output", master, output, options.buffer_size),
            options,
            state: ProxyState::Running,
            reason: None,
        }
    }

    /// Current state
    pub fn state(&self) -> ProxyState {
        self.state
    }

    /// Run until both directions are done or shutdown is requested
    pub fn run(
        &mut self,
        mut notifications: Option<&mut dyn NotificationSource>,
    ) -> Result<ProxyOutcome, ProxyError> {
        let drain_timeout_ms =
            i32::try_from(self.options.drain_timeout.as_millis()).unwrap_or(i32::MAX);

        while self.state != ProxyState::Stopped {
            let timeout = if self.drain_is_bounded() {
                drain_timeout_ms
            } else {
                -1
            };

            let events = {
                let notify_fd = notifications.as_ref().map(|source| source.fd());
                let slots = self.interest(notify_fd);
                if slots.is_empty() {
                    self.set_state(ProxyState::Stopped);
                    break;
                }

                let mut fds: Vec<PollFd<'_>> = slots
                    .iter()
                    .map(|(_, fd, flags)| PollFd::new(fd, *flags))
                    .collect();

                match poll(&mut fds, timeout) {
                    Ok(_) => slots
                        .iter()
                        .zip(fds.iter())
                        .filter_map(|((slot, _, _), fd)| {
                            fd.revents()
                                .filter(|revents| !revents.is_empty())
                                .map(|revents| (*slot, revents))
                        })
                        .collect::<Vec<_>>(),
                    Err(Errno::EINTR) => continue,
                    Err(e) => return Err(ProxyError::Poll(e)),
                }
            };

            if events.is_empty() {
                tracing::debug!("drain timeout elapsed");
                self.set_state(ProxyState::Stopped);
                break;
            }

            for (slot, revents) in events {
                if slot == Slot::Notify {
                    let reason = notifications.as_mut().and_then(|source| source.dispatch());
                    if let Some(reason) = reason {
                        self.request_shutdown(reason);
                    }
                } else {
                    self.handle(slot, revents);
                }
                if self.state == ProxyState::Stopped {
                    break;
                }
            }

            self.update_state();
        }

        Ok(ProxyOutcome {
            reason: self.reason,
            bytes_to_pty: self.inbound.transferred,
            bytes_to_output: self.outbound.transferred,
        })
    }

    /// Descriptors to wait on and the events wanted for each
    fn interest<'s>(
        &self,
        notify_fd: Option<BorrowedFd<'s>>,
    ) -> Vec<(Slot, BorrowedFd<'s>, PollFlags)>
    where
        'a: 's,
    {
        let mut slots = Vec::with_capacity(4);

        if self.inbound.wants_read() {
            slots.push((Slot::Input, self.inbound.source, PollFlags::POLLIN));
        }
        if self.outbound.wants_write() {
            slots.push((Slot::Output, self.outbound.sink, PollFlags::POLLOUT));
        }

        let mut master = PollFlags::empty();
        if self.outbound.wants_read() {
            master |= PollFlags::POLLIN;
        }
        if self.inbound.wants_write() {
            master |= PollFlags::POLLOUT;
        }
        if !master.is_empty() {
            slots.push((Slot::Master, self.outbound.source, master));
        }

        if let Some(fd) = notify_fd {
            slots.push((Slot::Notify, fd, PollFlags::POLLIN));
        }

        slots
    }

    fn handle(&mut self, slot: Slot, revents: PollFlags) {
        let hangup = PollFlags::POLLHUP | PollFlags::POLLERR | PollFlags::POLLNVAL;
        let readable = PollFlags::POLLIN | hangup;
        let writable = PollFlags::POLLOUT | hangup;

        match slot {
            Slot::Input => {
                if revents.intersects(readable) && self.inbound.wants_read() {
                    self.inbound.fill();
                    self.inbound.flush();
                }
            },
            Slot::Output => {
                if revents.intersects(writable) {
                    self.outbound.flush();
                }
            },
            Slot::Master => {
                if revents.intersects(readable) && self.outbound.wants_read() {
                    self.outbound.fill();
                    self.outbound.flush();
                }
                if revents.intersects(writable) && self.inbound.wants_write() {
                    self.inbound.flush();
                }
            },
            Slot::Notify => {},
        }
    }

    /// Act on a shutdown request from a notification source
    fn request_shutdown(&mut self, reason: ShutdownReason) {
        self.reason.get_or_insert(reason);

        match reason {
            ShutdownReason::Terminated(_) => {
                self.inbound.close();
                self.outbound.close();
                self.set_state(ProxyState::Stopped);
            },
            ShutdownReason::ChildExited(_) => {
                // Keep reading what the child wrote before it exited
                self.inbound.close();
                self.set_state(ProxyState::ShuttingDown);
            },
        }
    }

    /// Whether waits are capped by the drain timeout
    fn drain_is_bounded(&self) -> bool {
        match self.state {
            ProxyState::Running => false,
            ProxyState::Stopped => true,
            // Only input has ended: the PTY side may still have a lot to say
            ProxyState::ShuttingDown => {
                !self.options.wait_for_hangup
                    || self.reason.is_some()
                    || self.outbound.eof
                    || self.outbound.closed
            },
        }
    }

    fn update_state(&mut self) {
        // Once the PTY side hangs up nothing can read what we would send it
        if self.outbound.eof && !self.inbound.closed {
            tracing::debug!("pty hung up, closing input direction");
            self.inbound.close();
        }

        if self.inbound.closed && self.outbound.closed {
            self.set_state(ProxyState::Stopped);
        } else if self.inbound.eof
            || self.outbound.eof
            || self.inbound.closed
            || self.outbound.closed
        {
            self.set_state(ProxyState::ShuttingDown);
        }
    }

    fn set_state(&mut self, state: ProxyState) {
        let allowed = matches!(
            (self.state, state),
            (ProxyState::Running, ProxyState::ShuttingDown)
                | (ProxyState::Running, ProxyState::Stopped)
                | (ProxyState::ShuttingDown, ProxyState::Stopped)
        );
        if allowed {
            tracing::debug!(from = ?self.state, to = ?state, "proxy state change");
            self.state = state;
        }
    }
}
