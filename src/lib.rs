//! pty-proxy library
//!
//! Allocates a pseudo-terminal, puts the invoking terminal into raw mode and
//! shuttles bytes between the two until the session ends:
//!
//! - `pty`: PTY pair allocation, window size and the optional child process
//! - `tty`: raw mode guard for the invoking terminal
//! - `signal`: self-pipe bridge for resize, child and termination signals
//! - `proxy`: the bidirectional poll loop
//! - `app`: configuration and orchestration

pub mod app;
pub mod proxy;
pub mod pty;
pub mod signal;
pub mod tty;

pub use app::{App, AppError, CliArgs, Config, ConfigError};
