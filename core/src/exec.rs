//! Sandboxed child-process execution for the setup-commands rule.
//!
//! Every spawn goes through the allow-list, runs without a shell in a
//! scrubbed environment, is confined to a cwd inside the session root, and
//! has its output capped and its runtime bounded. There is deliberately no
//! way to reach this module without those checks.

#[cfg(unix)]
use std::os::unix::process::ExitStatusExt;

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::process::Stdio;
use std::sync::LazyLock;
use std::time::Duration;
use std::time::Instant;

use chrono::DateTime;
use chrono::Utc;
use regex_lite::Regex;
use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::io::BufReader;
use tokio::process::Child;
use tokio::process::Command;
use tracing::debug;
use tracing::warn;

use crate::allowed_command::assert_allowed;
use crate::error::Result;
use crate::error::SxnErr;
use crate::sandbox::SandboxRoot;

/// Maximum bytes captured per stream; everything past the cap is read and
/// dropped so the child never blocks on a full pipe.
pub const MAX_STREAM_OUTPUT: usize = 1024 * 1024;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);
const MIN_TIMEOUT: Duration = Duration::from_secs(1);
const MAX_TIMEOUT: Duration = Duration::from_secs(1800);

/// How long a SIGTERM'd child gets before the follow-up SIGKILL.
const KILL_GRACE: Duration = Duration::from_secs(5);

/// Variables carried over from the parent process when set. Everything else
/// starts from an empty environment.
const INHERITED_ENV_VARS: &[&str] = &["PATH", "HOME", "USER", "LANG", "LC_ALL"];

static ENV_NAME: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").ok());

#[derive(Debug, Clone)]
pub struct ExecParams {
    pub command: Vec<String>,
    /// Working directory, resolved against (and contained in) the session
    /// root.
    pub cwd: PathBuf,
    /// Extra variables overlaid on the scrubbed base environment.
    pub env: HashMap<String, String>,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct CommandResult {
    pub command: Vec<String>,
    pub exit_status: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
    pub duration: Duration,
    pub started_at: DateTime<Utc>,
}

impl CommandResult {
    pub fn ok(&self) -> bool {
        self.exit_status == 0
    }
}

/// Run `params.command` to completion under the full set of sandbox checks.
///
/// A non-zero exit is a *successful* execution with `ok() == false`; errors
/// are reserved for commands that never ran properly (not allowed, bad
/// environment, spawn failure, timeout).
pub async fn execute(params: ExecParams, session_root: &SandboxRoot) -> Result<CommandResult> {
    assert_allowed(&params.command)?;

    let cwd = session_root.contain(&params.cwd)?;
    let env = build_environment(&params.env)?;
    let timeout = params.timeout.clamp(MIN_TIMEOUT, MAX_TIMEOUT);

    let program = params.command[0].clone();
    let started_at = Utc::now();
    let start = Instant::now();

    let mut child = spawn_child(&params.command, &cwd, &env)?;

    // Both streams were configured with `Stdio::piped()`, so `take()` should
    // normally return `Some`; treat anything else as an exceptional I/O
    // error.
    let stdout_reader = child.stdout.take().ok_or_else(|| {
        SxnErr::Io(std::io::Error::other(
            "stdout pipe was unexpectedly not available",
        ))
    })?;
    let stderr_reader = child.stderr.take().ok_or_else(|| {
        SxnErr::Io(std::io::Error::other(
            "stderr pipe was unexpectedly not available",
        ))
    })?;

    let stdout_handle = tokio::spawn(read_capped(BufReader::new(stdout_reader), MAX_STREAM_OUTPUT));
    let stderr_handle = tokio::spawn(read_capped(BufReader::new(stderr_reader), MAX_STREAM_OUTPUT));

    let exit_status = match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) => status,
        Ok(Err(err)) => return Err(err.into()),
        Err(_) => {
            terminate(&mut child).await;
            warn!(%program, ?timeout, "command timed out");
            return Err(SxnErr::Timeout { program, timeout });
        }
    };

    let (stdout, stdout_truncated) = stdout_handle.await??;
    let (stderr, stderr_truncated) = stderr_handle.await??;
    let duration = start.elapsed();

    let exit_code = exit_code_of(exit_status);
    debug!(%program, exit_code, ?duration, "command finished");

    Ok(CommandResult {
        command: params.command,
        exit_status: exit_code,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        duration,
        started_at,
    })
}

/// Start from an empty environment, inherit the well-known basics, then
/// overlay the caller's variables. Names and values are validated before
/// anything reaches the child.
pub fn build_environment(overlay: &HashMap<String, String>) -> Result<HashMap<String, String>> {
    let mut env = HashMap::new();
    for name in INHERITED_ENV_VARS {
        if let Ok(value) = std::env::var(name) {
            env.insert((*name).to_string(), value);
        }
    }

    for (name, value) in overlay {
        let valid_name = ENV_NAME.as_ref().is_some_and(|re| re.is_match(name));
        if !valid_name {
            return Err(SxnErr::BadEnvironment {
                reason: format!("invalid variable name '{name}'"),
            });
        }
        if value.contains('\0') {
            return Err(SxnErr::BadEnvironment {
                reason: format!("value of '{name}' contains NUL"),
            });
        }
        env.insert(name.clone(), value.clone());
    }
    Ok(env)
}

fn spawn_child(
    command: &[String],
    cwd: &std::path::Path,
    env: &HashMap<String, String>,
) -> Result<Child> {
    let mut cmd = Command::new(&command[0]);
    cmd.args(&command[1..]);
    cmd.current_dir(cwd);
    cmd.env_clear();
    cmd.envs(env);

    // Do not create a file descriptor for stdin, otherwise some commands may
    // hang forever waiting for input.
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    cmd.kill_on_drop(true)
        .spawn()
        .map_err(|err| SxnErr::SpawnFailed {
            program: command[0].clone(),
            source: err,
        })
}

/// SIGTERM first so the child can clean up; escalate to SIGKILL when the
/// grace period runs out.
async fn terminate(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // Safety: plain signal delivery to a child we own.
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
        if tokio::time::timeout(KILL_GRACE, child.wait()).await.is_ok() {
            return;
        }
    }
    if let Err(err) = child.start_kill() {
        warn!("failed to kill timed-out child: {err}");
    }
    let _ = child.wait().await;
}

#[cfg(unix)]
fn exit_code_of(status: ExitStatus) -> i32 {
    match status.code() {
        Some(code) => code,
        // Killed by a signal: report the conventional 128+N failure code.
        None => status.signal().map_or(-1, |signal| 128 + signal),
    }
}

#[cfg(not(unix))]
fn exit_code_of(status: ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

/// Read a stream to EOF, keeping at most `max_output` bytes. The remainder
/// is consumed and dropped to avoid back-pressure on the child; the flag
/// reports whether anything was dropped.
async fn read_capped<R: AsyncRead + Unpin>(
    mut reader: R,
    max_output: usize,
) -> std::io::Result<(Vec<u8>, bool)> {
    let mut buf = Vec::with_capacity(max_output.min(8 * 1024));
    let mut tmp = [0u8; 8192];
    let mut truncated = false;

    loop {
        let n = reader.read(&mut tmp).await?;
        if n == 0 {
            break;
        }
        let remaining = max_output - buf.len();
        if remaining >= n {
            buf.extend_from_slice(&tmp[..n]);
        } else {
            buf.extend_from_slice(&tmp[..remaining]);
            truncated = true;
        }
    }

    Ok((buf, truncated))
}
