//! Tests for the pty-proxy binary

use std::process::{Command, Stdio};

fn pty_proxy() -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_pty-proxy"));
    cmd.env_remove("PTY_PROXY_BUFFER_SIZE")
        .env_remove("PTY_PROXY_DRAIN_TIMEOUT_MS")
        .env_remove("PTY_PROXY_ANNOUNCE")
        .env("XDG_CONFIG_HOME", std::env::temp_dir().join("pty-proxy-cli-tests"));
    cmd
}

#[test]
fn test_piped_stdin_is_rejected() {
    let output = pty_proxy()
        .stdin(Stdio::piped())
        .output()
        .expect("Failed to run pty-proxy");

    assert_eq!(output.status.code(), Some(1));

    // The device is announced before the terminal check fails
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(
        stdout.starts_with("Opened new PTY device: /dev/"),
        "stdout: {:?}",
        stdout
    );

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("not a terminal"), "stderr: {:?}", stderr);
}

#[test]
fn test_announce_on_stderr() {
    let output = pty_proxy()
        .args(["--announce", "stderr"])
        .stdin(Stdio::null())
        .output()
        .expect("Failed to run pty-proxy");

    assert_eq!(output.status.code(), Some(1));
    assert!(output.stdout.is_empty());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Opened new PTY device: /dev/"), "stderr: {:?}", stderr);
}

#[test]
fn test_invalid_buffer_size_is_rejected() {
    let output = pty_proxy()
        .args(["--buffer-size", "1"])
        .stdin(Stdio::null())
        .output()
        .expect("Failed to run pty-proxy");

    assert_eq!(output.status.code(), Some(1));
    // Configuration is checked before any PTY is allocated
    assert!(output.stdout.is_empty());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("buffer_size"), "stderr: {:?}", stderr);
}

#[test]
fn test_missing_config_file_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let output = pty_proxy()
        .arg("--config")
        .arg(dir.path().join("absent.json"))
        .stdin(Stdio::null())
        .output()
        .expect("Failed to run pty-proxy");

    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.starts_with("pty-proxy: "), "stderr: {:?}", stderr);
}

#[test]
fn test_help() {
    let output = pty_proxy()
        .arg("--help")
        .output()
        .expect("Failed to run pty-proxy");

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("--buffer-size"));
    assert!(stdout.contains("--drain-timeout-ms"));
}
