//! CLI integration tests for `sluice`.
//!
//! These tests invoke the compiled `sluice` binary as a subprocess and verify
//! its behavior end-to-end. Each test operates in an isolated temp directory
//! that also stands in for the user's home, so the global config is never
//! touched.
//!
//! # Running
//!
//! ```bash
//! cargo test --test integration_test
//! ```
//!
//! Proxy tests bind loopback sockets and are skipped when that is not
//! permitted.

#![allow(clippy::unwrap_used)]

use std::fs;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::Path;
use std::process::{Child, Command, Output, Stdio};
use std::time::Duration;
use tempfile::TempDir;

// ============================================================================
// Infrastructure
// ============================================================================

/// Path to the compiled `sluice` binary, injected by Cargo at compile time.
const SLUICE: &str = env!("CARGO_BIN_EXE_sluice");

fn sluice_command(cwd: &Path) -> Command {
    let mut cmd = Command::new(SLUICE);
    cmd.current_dir(cwd)
        .env("HOME", cwd)
        .env("XDG_CONFIG_HOME", cwd.join(".config"))
        .env_remove("SLUICE_LOG"); // keep test output clean
    cmd
}

/// Invoke `sluice` with the given arguments in `cwd` and return the full Output.
fn run_sluice(cwd: &Path, args: &[&str]) -> Output {
    sluice_command(cwd)
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to spawn sluice binary: {e}"))
}

/// Assert exit-success and return stdout as a String.
#[track_caller]
fn expect_success(out: &Output) -> String {
    assert!(
        out.status.success(),
        "sluice exited {:?}\nstdout: {}\nstderr: {}",
        out.status.code(),
        String::from_utf8_lossy(&out.stdout),
        String::from_utf8_lossy(&out.stderr),
    );
    String::from_utf8_lossy(&out.stdout).into_owned()
}

/// Assert that the command exited with a non-zero status.
#[track_caller]
fn expect_failure(out: &Output) {
    assert!(
        !out.status.success(),
        "Expected sluice to fail but it succeeded\nstdout: {}\nstderr: {}",
        String::from_utf8_lossy(&out.stdout),
        String::from_utf8_lossy(&out.stderr),
    );
}

fn loopback_or_skip() -> Option<TcpListener> {
    match TcpListener::bind("127.0.0.1:0") {
        Ok(listener) => Some(listener),
        Err(err) if err.kind() == std::io::ErrorKind::PermissionDenied => None,
        Err(err) => panic!("Failed to bind TCP listener for test: {err}"),
    }
}

/// A running `sluice serve`, killed on drop.
struct ServeProcess {
    child: Child,
    addr: SocketAddr,
}

impl ServeProcess {
    fn start(cwd: &Path) -> Self {
        let mut child = sluice_command(cwd)
            .args(["serve", "--no-config", "--host", "127.0.0.1", "--port", "0"])
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .unwrap_or_else(|e| panic!("Failed to spawn sluice serve: {e}"));

        let stdout = child.stdout.take().unwrap();
        let mut line = String::new();
        BufReader::new(stdout).read_line(&mut line).unwrap();
        let addr = line
            .trim()
            .strip_prefix("Listening on ")
            .unwrap_or_else(|| panic!("Unexpected serve output: {line:?}"))
            .parse()
            .unwrap();

        Self { child, addr }
    }

    fn connect(&self) -> TcpStream {
        let stream = TcpStream::connect(self.addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream
    }
}

impl Drop for ServeProcess {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

// ============================================================================
// A. Config command tests
// ============================================================================

#[test]
fn test_config_init_creates_project_config() {
    let dir = TempDir::new().unwrap();
    let out = run_sluice(dir.path(), &["config", "init"]);
    expect_success(&out);

    let config_path = dir.path().join(".sluice").join("sluice.toml");
    assert!(config_path.exists(), ".sluice/sluice.toml was not created");
    let contents = fs::read_to_string(&config_path).unwrap();
    let value: toml::Value = toml::from_str(&contents)
        .unwrap_or_else(|e| panic!("Generated config is not valid TOML: {e}\n{contents}"));
    assert_eq!(value["proxy"]["port"].as_integer(), Some(8080));
}

#[test]
fn test_config_init_fails_if_already_exists() {
    let dir = TempDir::new().unwrap();
    expect_success(&run_sluice(dir.path(), &["config", "init"]));

    let out = run_sluice(dir.path(), &["config", "init"]);
    expect_failure(&out);
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(
        stderr.contains("already exists"),
        "Expected 'already exists' in stderr, got: {stderr}"
    );
}

#[test]
fn test_config_show_toml_is_valid() {
    let dir = TempDir::new().unwrap();
    expect_success(&run_sluice(dir.path(), &["config", "init"]));

    let out = run_sluice(dir.path(), &["config", "show", "--format", "toml"]);
    let stdout = expect_success(&out);
    assert!(
        toml::from_str::<toml::Value>(&stdout).is_ok(),
        "config show --format toml is not valid TOML:\n{stdout}"
    );
}

#[test]
fn test_config_show_without_config_file_uses_defaults() {
    let dir = TempDir::new().unwrap();
    let out = run_sluice(dir.path(), &["config", "show", "--format", "json"]);
    let stdout = expect_success(&out);
    let json: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert!(json.get("proxy").is_some(), "Missing 'proxy' key");
}

#[test]
fn test_config_project_overrides_global() {
    let dir = TempDir::new().unwrap();
    expect_success(&run_sluice(dir.path(), &["config", "init", "--global"]));

    let project = dir.path().join(".sluice");
    fs::create_dir_all(&project).unwrap();
    fs::write(project.join("sluice.toml"), "[proxy]\nport = 3128\n").unwrap();

    let out = run_sluice(dir.path(), &["config", "show", "--format", "json"]);
    let json: serde_json::Value = serde_json::from_str(&expect_success(&out)).unwrap();
    assert_eq!(json["proxy"]["port"], 3128);
    assert_eq!(json["proxy"]["host"], "0.0.0.0");
}

// ============================================================================
// B. Check command
// ============================================================================

#[test]
fn test_check_reports_platform_and_proxy() {
    let dir = TempDir::new().unwrap();
    let out = run_sluice(dir.path(), &["check"]);
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(
        stdout.contains("Platform:"),
        "Expected 'Platform:' in check output, got: {stdout}"
    );
    if loopback_or_skip().is_some() {
        let stdout = expect_success(&out);
        assert!(stdout.contains("Proxy (CONNECT tunnel): OK"), "{stdout}");
        assert!(stdout.contains("Proxy (plain HTTP): OK"), "{stdout}");
    }
}

#[test]
fn test_check_fails_on_invalid_project_config() {
    let dir = TempDir::new().unwrap();
    let project = dir.path().join(".sluice");
    fs::create_dir_all(&project).unwrap();
    fs::write(project.join("sluice.toml"), "[proxy]\nport = \"nope\"\n").unwrap();

    let out = run_sluice(dir.path(), &["check"]);
    expect_failure(&out);
    assert!(String::from_utf8_lossy(&out.stdout).contains("invalid"));
}

// ============================================================================
// C. Serve
// ============================================================================

#[test]
fn test_serve_fails_when_port_in_use() {
    let Some(taken) = loopback_or_skip() else {
        return;
    };
    let port = taken.local_addr().unwrap().port().to_string();
    let dir = TempDir::new().unwrap();

    let out = run_sluice(
        dir.path(),
        &["serve", "--no-config", "--host", "127.0.0.1", "--port", &port],
    );
    expect_failure(&out);
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("Failed to bind"), "stderr: {stderr}");
}

#[test]
fn test_serve_tunnels_connect_requests() {
    let Some(upstream) = loopback_or_skip() else {
        return;
    };
    let target = upstream.local_addr().unwrap();
    let dir = TempDir::new().unwrap();
    let server = ServeProcess::start(dir.path());

    let mut client = server.connect();
    write!(client, "CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n\r\n").unwrap();

    let (mut service, _) = upstream.accept().unwrap();
    service
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();

    let mut ack = [0u8; 19];
    client.read_exact(&mut ack).unwrap();
    assert_eq!(&ack, b"HTTP/1.1 200 OK\r\n\r\n");

    client.write_all(b"opaque").unwrap();
    let mut relayed = [0u8; 6];
    service.read_exact(&mut relayed).unwrap();
    assert_eq!(&relayed, b"opaque");

    service.write_all(b"reply").unwrap();
    let mut reply = [0u8; 5];
    client.read_exact(&mut reply).unwrap();
    assert_eq!(&reply, b"reply");

    // Closing the upstream closes the client.
    drop(service);
    let mut rest = Vec::new();
    client.read_to_end(&mut rest).unwrap();
    assert!(rest.is_empty());
}

#[test]
fn test_serve_forwards_plain_http() {
    let Some(upstream) = loopback_or_skip() else {
        return;
    };
    let target = upstream.local_addr().unwrap();
    let dir = TempDir::new().unwrap();
    let server = ServeProcess::start(dir.path());

    let request = format!("GET /status HTTP/1.1\r\nHost: {target}\r\nAccept: */*\r\n\r\n");
    let mut client = server.connect();
    client.write_all(request.as_bytes()).unwrap();

    let (mut service, _) = upstream.accept().unwrap();
    service
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let mut received = vec![0u8; request.len()];
    service.read_exact(&mut received).unwrap();
    assert_eq!(received, request.as_bytes());

    let response = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nup";
    service.write_all(response).unwrap();
    drop(service);

    let mut got = Vec::new();
    client.read_to_end(&mut got).unwrap();
    assert_eq!(got, response);
}

#[test]
fn test_serve_rejects_request_without_host() {
    if loopback_or_skip().is_none() {
        return;
    }
    let dir = TempDir::new().unwrap();
    let server = ServeProcess::start(dir.path());

    let mut client = server.connect();
    client.write_all(b"GET / HTTP/1.1\r\n\r\n").unwrap();

    let mut got = Vec::new();
    client.read_to_end(&mut got).unwrap();
    assert!(got.starts_with(b"HTTP/1.1 400"));
}
