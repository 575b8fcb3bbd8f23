//! Abstract wrapper around the source-control CLI used by workspace handlers.
//!
//! The workspace handlers (`handlers::workspace`) never shell out directly —
//! they go through a [`Runner`], so tests can substitute a scripted fake
//! without touching a real repository. [`JjRunner`] is the production
//! implementation, wrapping the `jj` binary the same way
//! `attractor-tools::local_env::LocalExecutionEnvironment::exec_command`
//! wraps `bash`: a `tokio::process::Command` raced against a timeout, with
//! `SIGTERM` then a forced kill on expiry.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use attractor_types::{AttractorError, Result};

/// Per-command timeout for source-control invocations (spec §4.9, §5).
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Grace period between `SIGTERM` and a forced kill once a command times out.
const KILL_GRACE: Duration = Duration::from_secs(2);

/// Abstract source-control command runner: `Runner(args[], cwd?) -> stdout`.
#[async_trait]
pub trait Runner: Send + Sync {
    async fn run(&self, args: &[String], cwd: Option<&Path>) -> Result<String>;
}

/// Runs the real `jj` binary, filtering environment variables the way
/// `LocalExecutionEnvironment` does and forcing `NO_COLOR=1` so output is
/// safe to substring-match (e.g. for "conflict" detection in merges).
pub struct JjRunner {
    binary: String,
    timeout: Duration,
}

impl JjRunner {
    pub fn new() -> Self {
        Self {
            binary: "jj".to_string(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl Default for JjRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Runner for JjRunner {
    async fn run(&self, args: &[String], cwd: Option<&Path>) -> Result<String> {
        let mut cmd = tokio::process::Command::new(&self.binary);
        cmd.args(args)
            .env("NO_COLOR", "1")
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }

        #[cfg(unix)]
        {
            cmd.process_group(0);
        }

        let mut child = cmd.spawn().map_err(|e| AttractorError::WorkspaceError {
            name: String::new(),
            message: format!("failed to spawn '{}': {e}", self.binary),
        })?;

        tokio::select! {
            res = child.wait() => {
                let status = res.map_err(|e| AttractorError::WorkspaceError {
                    name: String::new(),
                    message: format!("'{}' execution failed: {e}", self.binary),
                })?;
                let mut stdout_buf = Vec::new();
                let mut stderr_buf = Vec::new();
                use tokio::io::AsyncReadExt;
                if let Some(mut out) = child.stdout.take() {
                    let _ = out.read_to_end(&mut stdout_buf).await;
                }
                if let Some(mut err) = child.stderr.take() {
                    let _ = err.read_to_end(&mut stderr_buf).await;
                }
                finish(status, stdout_buf, stderr_buf, &self.binary, args)
            }
            _ = tokio::time::sleep(self.timeout) => {
                #[cfg(unix)]
                {
                    if let Some(pid) = child.id() {
                        unsafe { libc::kill(-(pid as i32), libc::SIGTERM); }
                    }
                    tokio::select! {
                        _ = child.wait() => {}
                        _ = tokio::time::sleep(KILL_GRACE) => {
                            let _ = child.kill().await;
                        }
                    }
                }
                #[cfg(not(unix))]
                {
                    let _ = child.kill().await;
                }
                Err(AttractorError::CommandTimeout {
                    timeout_ms: self.timeout.as_millis() as u64,
                })
            }
        }
    }
}

fn finish(
    status: std::process::ExitStatus,
    stdout_buf: Vec<u8>,
    stderr_buf: Vec<u8>,
    binary: &str,
    args: &[String],
) -> Result<String> {
    let stdout = String::from_utf8_lossy(&stdout_buf).into_owned();
    let stderr = String::from_utf8_lossy(&stderr_buf).into_owned();

    if !status.success() {
        return Err(AttractorError::WorkspaceError {
            name: String::new(),
            message: if stderr.trim().is_empty() {
                format!("'{} {}' exited with {}", binary, args.join(" "), status)
            } else {
                stderr.trim().to_string()
            },
        });
    }

    Ok(stdout)
}

/// In-process fake runner for tests: maps an exact argv to a canned stdout
/// response (or error), recording every invocation for assertions.
#[cfg(any(test, feature = "test-util"))]
pub struct ScriptedRunner {
    responses: std::sync::Mutex<std::collections::VecDeque<std::result::Result<String, String>>>,
    calls: std::sync::Mutex<Vec<Vec<String>>>,
}

#[cfg(any(test, feature = "test-util"))]
impl ScriptedRunner {
    pub fn new(responses: Vec<std::result::Result<String, String>>) -> Self {
        Self {
            responses: std::sync::Mutex::new(responses.into()),
            calls: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().unwrap().clone()
    }
}

#[cfg(any(test, feature = "test-util"))]
#[async_trait]
impl Runner for ScriptedRunner {
    async fn run(&self, args: &[String], _cwd: Option<&Path>) -> Result<String> {
        self.calls.lock().unwrap().push(args.to_vec());
        match self.responses.lock().unwrap().pop_front() {
            Some(Ok(out)) => Ok(out),
            Some(Err(msg)) => Err(AttractorError::WorkspaceError {
                name: String::new(),
                message: msg,
            }),
            None => Ok(String::new()),
        }
    }
}
