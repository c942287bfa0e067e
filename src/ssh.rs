// src/ssh.rs
// C4: SSH Executor — key-only auth, bounded timeouts, concurrent
// stdout/stderr drain, SFTP put with parent-directory creation.
//
// Grounded on the `ssh2::Session::new()` / `set_tcp_stream` / `handshake()`
// sequence from cloud-hypervisor's integration-test SSH helper, and on the
// exact timeout/readiness/key-permission semantics of the original tool's
// `run_ssh_command`/`wait_for_vm_ready`.

use std::fs;
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use std::time::{Duration, Instant};

use ssh2::Session;
use tracing::{debug, warn};

use crate::errors::{LpemError, Result};

/// SSH key permission mask: any of these bits set (group/other
/// read/write/execute) triggers a warning (spec §4.4 "Key validation",
/// matching the original tool's `SSH_KEY_PERMISSIONS_MASK = 0o077`).
pub const KEY_PERMISSIONS_MASK: u32 = 0o077;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Code(i32),
    TimedOut,
    Transport,
}

#[derive(Debug, Clone)]
pub struct ExecResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_status: ExitStatus,
    pub error: Option<String>,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        matches!(self.exit_status, ExitStatus::Code(0)) && self.error.is_none()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    pub timeout: Option<Duration>,
    pub stdin: Option<String>,
    pub pty: bool,
}

/// Resolves `~`, requires a regular file, and checks the permission mask.
/// A violation is only a warning unless `hard_fail` is set (spec §4.4).
pub fn validate_key_permissions(key_path: &str, hard_fail: bool) -> Result<String> {
    let expanded = shellexpand::tilde(key_path).into_owned();
    let meta = fs::metadata(&expanded)
        .map_err(|e| LpemError::SshTransport(format!("cannot stat key '{expanded}': {e}")))?;
    if !meta.is_file() {
        return Err(LpemError::SshTransport(format!(
            "key path '{expanded}' is not a regular file"
        )));
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = meta.permissions().mode();
        if mode & KEY_PERMISSIONS_MASK != 0 {
            let msg = format!(
                "SSH key '{expanded}' has overly permissive mode {:o} (group/other bits set)",
                mode & 0o777
            );
            if hard_fail {
                return Err(LpemError::SshTransport(msg));
            }
            warn!("{msg}");
        }
    }

    Ok(expanded)
}

pub trait SshClient: Send + Sync {
    fn exec(&self, host: &str, user: &str, key_path: &str, command: &str, opts: &ExecOptions) -> Result<ExecResult>;

    /// Polls `exec` with `echo ready` every `interval` until one probe
    /// succeeds with exit status 0 and the token in stdout, or `timeout`
    /// elapses. An authentication failure short-circuits to a
    /// warning-success: the server is reachable, only the key is wrong
    /// (spec §4.4 "Readiness wait").
    fn wait_ready(&self, host: &str, user: &str, key_path: &str, timeout: Duration, interval: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let probe_opts = ExecOptions {
            timeout: Some(Duration::from_secs(5)),
            stdin: None,
            pty: false,
        };
        loop {
            match self.exec(host, user, key_path, "echo ready", &probe_opts) {
                Ok(result) if matches!(result.exit_status, ExitStatus::Code(0)) && result.stdout.contains("ready") => {
                    return Ok(());
                }
                Ok(_) => {}
                Err(LpemError::SshTransport(msg)) if msg.to_lowercase().contains("auth") => {
                    warn!(host, "SSH reachable but authentication failed during readiness probe");
                    return Ok(());
                }
                Err(_) => {}
            }
            if Instant::now() >= deadline {
                return Err(LpemError::SshTransport(format!(
                    "'{host}' did not become SSH-ready within {:?}",
                    timeout
                )));
            }
            std::thread::sleep(interval);
        }
    }

    fn put(&self, host: &str, user: &str, key_path: &str, local: &Path, remote: &str, create_dirs: bool) -> Result<()>;
}

pub struct Ssh2Client {
    pub connect_timeout: Duration,
}

impl Ssh2Client {
    pub fn new(connect_timeout: Duration) -> Self {
        Ssh2Client { connect_timeout }
    }

    fn connect(&self, host: &str, user: &str, key_path: &str) -> Result<Session> {
        let addr = format!("{host}:22");
        let mut addrs = addr
            .to_socket_addrs()
            .map_err(|e| LpemError::SshTransport(format!("cannot resolve '{host}': {e}")))?;
        let sock_addr = addrs
            .next()
            .ok_or_else(|| LpemError::SshTransport(format!("no addresses for '{host}'")))?;

        let tcp = TcpStream::connect_timeout(&sock_addr, self.connect_timeout)
            .map_err(|e| LpemError::SshTransport(format!("TCP connect to '{host}' failed: {e}")))?;
        tcp.set_read_timeout(Some(self.connect_timeout)).ok();

        let mut session = Session::new()
            .map_err(|e| LpemError::SshTransport(format!("failed to create SSH session: {e}")))?;
        session.set_tcp_stream(tcp);
        session
            .handshake()
            .map_err(|e| LpemError::SshTransport(format!("SSH handshake with '{host}' failed: {e}")))?;

        session
            .userauth_pubkey_file(user, None, Path::new(key_path), None)
            .map_err(|e| LpemError::SshTransport(format!("SSH authentication failed: {e}")))?;
        if !session.authenticated() {
            return Err(LpemError::SshTransport(
                "SSH authentication did not complete".into(),
            ));
        }
        Ok(session)
    }
}

impl SshClient for Ssh2Client {
    fn exec(&self, host: &str, user: &str, key_path: &str, command: &str, opts: &ExecOptions) -> Result<ExecResult> {
        let session = match self.connect(host, user, key_path) {
            Ok(s) => s,
            Err(LpemError::SshTransport(msg)) => {
                return Ok(ExecResult {
                    stdout: String::new(),
                    stderr: String::new(),
                    exit_status: ExitStatus::Transport,
                    error: Some(msg),
                })
            }
            Err(e) => return Err(e),
        };

        let mut channel = session
            .channel_session()
            .map_err(|e| LpemError::SshCommand(format!("failed to open channel: {e}")))?;

        if opts.pty {
            channel
                .request_pty("xterm", None, None)
                .map_err(|e| LpemError::SshCommand(format!("failed to allocate PTY: {e}")))?;
        }

        channel
            .exec(command)
            .map_err(|e| LpemError::SshCommand(format!("failed to exec command: {e}")))?;

        if let Some(stdin) = &opts.stdin {
            channel
                .write_all(stdin.as_bytes())
                .map_err(|e| LpemError::SshCommand(format!("failed to write stdin: {e}")))?;
        }
        channel
            .send_eof()
            .map_err(|e| LpemError::SshCommand(format!("failed to half-close write side: {e}")))?;

        let timeout = opts.timeout.unwrap_or(Duration::from_secs(30)) + Duration::from_secs(5);
        let deadline = Instant::now() + timeout;

        let mut stdout = String::new();
        let mut stderr = String::new();
        let mut stdout_buf = [0u8; 4096];
        let mut stderr_buf = [0u8; 4096];
        let mut timed_out = false;

        loop {
            if Instant::now() >= deadline {
                timed_out = true;
                break;
            }
            let mut made_progress = false;

            match channel.read(&mut stdout_buf) {
                Ok(0) => {}
                Ok(n) => {
                    stdout.push_str(&String::from_utf8_lossy(&stdout_buf[..n]));
                    made_progress = true;
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(_) => {}
            }
            match channel.stderr().read(&mut stderr_buf) {
                Ok(0) => {}
                Ok(n) => {
                    stderr.push_str(&String::from_utf8_lossy(&stderr_buf[..n]));
                    made_progress = true;
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(_) => {}
            }

            if channel.eof() {
                break;
            }
            if !made_progress {
                std::thread::sleep(Duration::from_millis(50));
            }
        }

        if timed_out {
            let _ = channel.close();
            return Ok(ExecResult {
                stdout,
                stderr,
                exit_status: ExitStatus::TimedOut,
                error: Some(format!("command timed out after {timeout:?}")),
            });
        }

        channel
            .wait_close()
            .map_err(|e| LpemError::SshCommand(format!("failed to close channel: {e}")))?;
        let code = channel.exit_status().unwrap_or(-1);

        Ok(ExecResult {
            stdout,
            stderr,
            exit_status: ExitStatus::Code(code),
            error: None,
        })
    }

    fn put(&self, host: &str, user: &str, key_path: &str, local: &Path, remote: &str, create_dirs: bool) -> Result<()> {
        let session = self.connect(host, user, key_path)?;
        let sftp = session
            .sftp()
            .map_err(|e| LpemError::SshCommand(format!("failed to start SFTP session: {e}")))?;

        if create_dirs {
            if let Some(parent) = Path::new(remote).parent() {
                let mut missing = Vec::new();
                let mut cursor = parent.to_path_buf();
                loop {
                    if sftp.stat(&cursor).is_ok() || cursor.as_os_str().is_empty() || cursor == Path::new("/") {
                        break;
                    }
                    missing.push(cursor.clone());
                    match cursor.parent() {
                        Some(p) => cursor = p.to_path_buf(),
                        None => break,
                    }
                }
                for dir in missing.into_iter().rev() {
                    debug!(dir = %dir.display(), "creating missing remote directory");
                    if let Err(e) = sftp.mkdir(&dir, 0o755) {
                        debug!(dir = %dir.display(), error = %e, "mkdir failed (may already exist)");
                    }
                }
            }
        }

        let data = fs::read(local).map_err(LpemError::Io)?;
        let mut remote_file = sftp
            .create(Path::new(remote))
            .map_err(|e| LpemError::SshCommand(format!("failed to create remote file '{remote}': {e}")))?;
        remote_file
            .write_all(&data)
            .map_err(|e| LpemError::SshCommand(format!("failed to write remote file '{remote}': {e}")))?;
        Ok(())
    }
}

#[cfg(any(test, feature = "test-support"))]
pub mod mock {
    use super::*;
    use std::cell::RefCell;
    use std::collections::HashMap;

    pub struct MockSshClient {
        pub responses: RefCell<HashMap<String, ExecResult>>,
        pub exec_log: RefCell<Vec<String>>,
        pub ready_after_calls: RefCell<Option<usize>>,
    }

    impl MockSshClient {
        pub fn new() -> Self {
            MockSshClient {
                responses: RefCell::new(HashMap::new()),
                exec_log: RefCell::new(Vec::new()),
                ready_after_calls: RefCell::new(None),
            }
        }

        pub fn set_response(&self, command: &str, result: ExecResult) {
            self.responses.borrow_mut().insert(command.to_string(), result);
        }
    }

    impl Default for MockSshClient {
        fn default() -> Self {
            Self::new()
        }
    }

    impl SshClient for MockSshClient {
        fn exec(&self, _host: &str, _user: &str, _key_path: &str, command: &str, _opts: &ExecOptions) -> Result<ExecResult> {
            self.exec_log.borrow_mut().push(command.to_string());
            Ok(self
                .responses
                .borrow()
                .get(command)
                .cloned()
                .unwrap_or(ExecResult {
                    stdout: String::new(),
                    stderr: String::new(),
                    exit_status: ExitStatus::Code(0),
                    error: None,
                }))
        }

        fn wait_ready(&self, _host: &str, _user: &str, _key_path: &str, _timeout: Duration, _interval: Duration) -> Result<()> {
            Ok(())
        }

        fn put(&self, _host: &str, _user: &str, _key_path: &str, _local: &Path, remote: &str, _create_dirs: bool) -> Result<()> {
            self.exec_log.borrow_mut().push(format!("put:{remote}"));
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    #[test]
    fn permissive_key_warns_but_does_not_fail_by_default() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        fs::set_permissions(tmp.path(), fs::Permissions::from_mode(0o644)).unwrap();
        let result = validate_key_permissions(tmp.path().to_str().unwrap(), false);
        assert!(result.is_ok());
    }

    #[test]
    fn permissive_key_hard_fails_when_requested() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        fs::set_permissions(tmp.path(), fs::Permissions::from_mode(0o644)).unwrap();
        let result = validate_key_permissions(tmp.path().to_str().unwrap(), true);
        assert!(result.is_err());
    }

    #[test]
    fn strict_key_permissions_pass_cleanly() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        fs::set_permissions(tmp.path(), fs::Permissions::from_mode(0o600)).unwrap();
        let result = validate_key_permissions(tmp.path().to_str().unwrap(), true);
        assert!(result.is_ok());
    }

    #[test]
    fn missing_key_is_an_error() {
        let result = validate_key_permissions("/nonexistent/path/to/key", false);
        assert!(result.is_err());
    }
}
