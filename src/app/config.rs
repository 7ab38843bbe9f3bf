//! Configuration for pty-proxy
//!
//! Settings come from four layers, highest priority first:
//! - CLI arguments
//! - environment variables (`PTY_PROXY_*`)
//! - a JSON config file
//! - built-in defaults

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};

use crate::proxy::{ProxyOptions, DEFAULT_BUFFER_SIZE, DEFAULT_DRAIN_TIMEOUT};

/// Smallest accepted read chunk
pub const MIN_BUFFER_SIZE: usize = 64;
/// Largest accepted read chunk
pub const MAX_BUFFER_SIZE: usize = 1024 * 1024;
/// Largest accepted drain timeout in milliseconds
pub const MAX_DRAIN_TIMEOUT_MS: u64 = 60_000;

/// CLI arguments for pty-proxy
#[derive(Parser, Debug, Clone, Default)]
#[command(name = "pty-proxy")]
#[command(version)]
#[command(
    about = "Allocate a pseudo-terminal and proxy this terminal through it",
    long_about = None
)]
pub struct CliArgs {
    /// Path to a JSON config file
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Bytes read per chunk
    #[arg(short, long, value_name = "BYTES")]
    pub buffer_size: Option<usize>,

    /// Milliseconds to keep draining output after shutdown starts
    #[arg(short, long, value_name = "MS")]
    pub drain_timeout_ms: Option<u64>,

    /// Stream that receives the "Opened new PTY device" line
    #[arg(long, value_enum, value_name = "STREAM")]
    pub announce: Option<AnnounceStream>,

    /// Program to run on the PTY slave; without one the slave waits for an
    /// external process to attach
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, value_name = "COMMAND")]
    pub command: Vec<String>,
}

/// Where the slave path is announced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum AnnounceStream {
    #[default]
    Stdout,
    Stderr,
}

impl AnnounceStream {
    /// Parse a stream name, ignoring case
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "stdout" => Some(AnnounceStream::Stdout),
            "stderr" => Some(AnnounceStream::Stderr),
            _ => None,
        }
    }
}

/// Runtime configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Bytes read per chunk in each direction
    pub buffer_size: usize,
    /// Idle time before a shutting-down proxy stops
    pub drain_timeout_ms: u64,
    /// Stream for the slave path announcement
    pub announce: AnnounceStream,
    /// Program and arguments to run on the slave, empty for external attach
    pub command: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            drain_timeout_ms: DEFAULT_DRAIN_TIMEOUT.as_millis() as u64,
            announce: AnnounceStream::Stdout,
            command: Vec::new(),
        }
    }
}

/// Configuration error
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {}: {source}", .path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Config error in '{field}': {message}")]
    Invalid { field: &'static str, message: String },
}

impl Config {
    /// Load configuration with full precedence:
    /// CLI args > environment variables > config file > defaults
    pub fn load_with_args(args: &CliArgs) -> Result<Self, ConfigError> {
        let mut config = match &args.config {
            // An explicit file has to exist
            Some(path) => Self::load_from_file(path)?,
            None => match Self::default_config_path() {
                Some(path) if path.exists() => Self::load_from_file(&path)?,
                _ => Config::default(),
            },
        };

        config.apply_env_vars();
        config.apply_cli_args(args);
        config.validate()?;

        Ok(config)
    }

    /// Load configuration from a specific file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let config = serde_json::from_str(&content).map_err(|source| ConfigError::Json {
            path: path.to_path_buf(),
            source,
        })?;

        tracing::debug!(path = %path.display(), "loaded config file");
        Ok(config)
    }

    /// Get the default configuration file path
    ///
    /// `$XDG_CONFIG_HOME/pty-proxy/config.json`, falling back to
    /// `$HOME/.config/pty-proxy/config.json`.
    pub fn default_config_path() -> Option<PathBuf> {
        let base = env::var_os("XDG_CONFIG_HOME")
            .filter(|dir| !dir.is_empty())
            .map(PathBuf::from)
            .or_else(|| env::var_os("HOME").map(|home| PathBuf::from(home).join(".config")))?;
        Some(base.join("pty-proxy").join("config.json"))
    }

    fn apply_env_vars(&mut self) {
        self.apply_env(|key| env::var(key).ok());
    }

    /// Apply `PTY_PROXY_*` overrides looked up through `var`
    fn apply_env<F>(&mut self, var: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(val) = var("PTY_PROXY_BUFFER_SIZE") {
            match val.trim().parse() {
                Ok(size) => self.buffer_size = size,
                Err(_) => tracing::warn!("Ignoring PTY_PROXY_BUFFER_SIZE={:?}", val),
            }
        }
        if let Some(val) = var("PTY_PROXY_DRAIN_TIMEOUT_MS") {
            match val.trim().parse() {
                Ok(ms) => self.drain_timeout_ms = ms,
                Err(_) => tracing::warn!("Ignoring PTY_PROXY_DRAIN_TIMEOUT_MS={:?}", val),
            }
        }
        if let Some(val) = var("PTY_PROXY_ANNOUNCE") {
            match AnnounceStream::parse(&val) {
                Some(stream) => self.announce = stream,
                None => tracing::warn!("Ignoring PTY_PROXY_ANNOUNCE={:?}", val),
            }
        }
    }

    fn apply_cli_args(&mut self, args: &CliArgs) {
        if let Some(size) = args.buffer_size {
            self.buffer_size = size;
        }
        if let Some(ms) = args.drain_timeout_ms {
            self.drain_timeout_ms = ms;
        }
        if let Some(stream) = args.announce {
            self.announce = stream;
        }
        if !args.command.is_empty() {
            self.command = args.command.clone();
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(MIN_BUFFER_SIZE..=MAX_BUFFER_SIZE).contains(&self.buffer_size) {
            return Err(ConfigError::Invalid {
                field: "buffer_size",
                message: format!(
                    "must be between {} and {}, got {}",
                    MIN_BUFFER_SIZE, MAX_BUFFER_SIZE, self.buffer_size
                ),
            });
        }

        if !(1..=MAX_DRAIN_TIMEOUT_MS).contains(&self.drain_timeout_ms) {
            return Err(ConfigError::Invalid {
                field: "drain_timeout_ms",
                message: format!(
                    "must be between 1 and {}, got {}",
                    MAX_DRAIN_TIMEOUT_MS, self.drain_timeout_ms
                ),
            });
        }

        if self.command.first().is_some_and(|program| program.is_empty()) {
            return Err(ConfigError::Invalid {
                field: "command",
                message: "program name must not be empty".to_string(),
            });
        }

        Ok(())
    }

    /// Loop tuning derived from this configuration
    pub fn proxy_options(&self) -> ProxyOptions {
        ProxyOptions {
            buffer_size: self.buffer_size,
            drain_timeout: Duration::from_millis(self.drain_timeout_ms),
            wait_for_hangup: !self.command.is_empty(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.buffer_size, 2048);
        assert_eq!(config.drain_timeout_ms, 100);
        assert_eq!(config.announce, AnnounceStream::Stdout);
        assert!(config.command.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();

        config.buffer_size = 16;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "buffer_size", .. })
        ));
        config.buffer_size = 4096;

        config.drain_timeout_ms = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "drain_timeout_ms", .. })
        ));
        config.drain_timeout_ms = 100;

        config.command = vec![String::new()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_json_parsing() {
        let file = write_config(
            r#"{ "buffer_size": 8192, "announce": "stderr", "command": ["sh", "-l"] }"#,
        );

        let config = Config::load_from_file(file.path()).unwrap();
        assert_eq!(config.buffer_size, 8192);
        // Missing fields fall back to defaults
        assert_eq!(config.drain_timeout_ms, 100);
        assert_eq!(config.announce, AnnounceStream::Stderr);
        assert_eq!(config.command, vec!["sh", "-l"]);
    }

    #[test]
    fn test_invalid_json_is_error() {
        let file = write_config("{ buffer_size = 1 }");
        assert!(matches!(
            Config::load_from_file(file.path()),
            Err(ConfigError::Json { .. })
        ));
    }

    #[test]
    fn test_explicit_missing_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let args = CliArgs {
            config: Some(dir.path().join("missing.json")),
            ..CliArgs::default()
        };
        assert!(matches!(
            Config::load_with_args(&args),
            Err(ConfigError::Io { .. })
        ));
    }

    #[test]
    fn test_cli_overrides_file() {
        let file = write_config(r#"{ "buffer_size": 8192, "drain_timeout_ms": 250 }"#);
        let args = CliArgs {
            config: Some(file.path().to_path_buf()),
            buffer_size: Some(512),
            announce: Some(AnnounceStream::Stderr),
            command: vec!["cat".to_string()],
            ..CliArgs::default()
        };

        let config = Config::load_with_args(&args).unwrap();
        assert_eq!(config.buffer_size, 512);
        assert_eq!(config.drain_timeout_ms, 250);
        assert_eq!(config.announce, AnnounceStream::Stderr);
        assert_eq!(config.command, vec!["cat"]);
    }

    #[test]
    fn test_out_of_range_cli_value_is_rejected() {
        let file = write_config("{}");
        let args = CliArgs {
            config: Some(file.path().to_path_buf()),
            drain_timeout_ms: Some(MAX_DRAIN_TIMEOUT_MS + 1),
            ..CliArgs::default()
        };
        assert!(matches!(
            Config::load_with_args(&args),
            Err(ConfigError::Invalid { field: "drain_timeout_ms", .. })
        ));
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("PTY_PROXY_BUFFER_SIZE", "4096"),
            ("PTY_PROXY_DRAIN_TIMEOUT_MS", "not a number"),
            ("PTY_PROXY_ANNOUNCE", "STDERR"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_env(|key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(config.buffer_size, 4096);
        // Unparseable values leave the previous setting alone
        assert_eq!(config.drain_timeout_ms, 100);
        assert_eq!(config.announce, AnnounceStream::Stderr);
    }

    #[test]
    fn test_cli_parsing() {
        let args = CliArgs::try_parse_from([
            "pty-proxy",
            "-b",
            "1024",
            "--announce",
            "stderr",
            "--",
            "sh",
            "-c",
            "exit 3",
        ])
        .unwrap();

        assert_eq!(args.buffer_size, Some(1024));
        assert_eq!(args.announce, Some(AnnounceStream::Stderr));
        assert_eq!(args.command, vec!["sh", "-c", "exit 3"]);
    }

    #[test]
    fn test_proxy_options() {
        let config = Config {
            buffer_size: 512,
            drain_timeout_ms: 250,
            ..Config::default()
        };
        let options = config.proxy_options();
        assert_eq!(options.buffer_size, 512);
        assert_eq!(options.drain_timeout, Duration::from_millis(250));
        assert!(!options.wait_for_hangup);

        let with_child = Config {
            command: vec!["sh".to_string()],
            ..Config::default()
        };
        assert!(with_child.proxy_options().wait_for_hangup);
    }
}
