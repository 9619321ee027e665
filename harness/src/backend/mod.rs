//! Execution backends: where worker processes run.
//!
//! A backend owns the transport to a [`Target`] (a remote machine, a pod, or
//! the local host) and exposes the handful of operations a trial needs:
//! spawn, readiness, file transfer in both directions, the control channel,
//! the log stream, exit polling, and teardown.

mod kube;
mod local;
mod ssh;

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    pin::Pin,
    process::Output,
    sync::{
        Mutex, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use fedrun_config::{ControlToken, END_OF_FILE_MARKER, Role};
use serde::{Deserialize, Serialize};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::{Child, ChildStdin, ChildStdout, Command},
};
use tokio_stream::{Stream, wrappers::LinesStream};

pub use kube::{KubeBackend, KubeSettings};
pub use local::LocalBackend;
pub use ssh::SshBackend;

/// File the bootstrap writes its process group id to once it is running.
/// Teardown signals the whole group: the worker runs in a pipeline subshell,
/// not in the bootstrap shell itself.
pub const PID_FILE: &str = "worker.pid";
/// File the bootstrap writes the worker's exit code to.
pub const EXIT_FILE: &str = "worker.exit";
/// File the control sequence is delivered through when a backend has no
/// attached stdin.
pub const COMMANDS_FILE: &str = "commands.txt";

/// Lines of a worker's stdout, in emission order.
pub type LogStream = Pin<Box<dyn Stream<Item = std::io::Result<String>> + Send>>;

/// An execution endpoint for one role's worker process.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    /// Label from the machine pool, or a cluster name for pods.
    pub name: String,
    /// Host name or IP address.
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub identity_file: Option<String>,
    /// Kubernetes context (container backend).
    #[serde(default)]
    pub context: Option<String>,
    /// Kubernetes namespace (container backend).
    #[serde(default)]
    pub namespace: Option<String>,
    /// Root of the staging area on the target.
    #[serde(default = "default_staging_dir")]
    pub staging_dir: String,
    /// Directory the worker runs in.
    #[serde(default)]
    pub work_dir: Option<String>,
    /// Shell snippet run before the worker, e.g. activating a venv.
    #[serde(default)]
    pub env_setup: Option<String>,
}

fn default_staging_dir() -> String {
    "/tmp/fedrun".to_string()
}

impl Target {
    /// `user@address`, or just the address.
    #[must_use]
    pub fn destination(&self) -> String {
        match &self.user {
            Some(user) => format!("{user}@{}", self.address),
            None => self.address.clone(),
        }
    }
}

/// What to run for one role of one trial.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub role: Role,
    /// Unique, DNS-safe resource name (`{experiment}-t{trial}-{tag}`).
    pub name: String,
    /// Worker command line; the config document path is already filled in.
    pub command: String,
    /// Staging directory for this role on the target.
    pub staging_dir: String,
    /// Container port to expose, if the backend creates endpoints.
    pub port: Option<u16>,
}

/// Reference to a process started by a backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProcessHandle {
    pub id: u64,
    pub name: String,
    pub role: Role,
    /// Name of the target the process runs on.
    pub target: String,
    pub staging_dir: String,
}

impl ProcessHandle {
    /// Absolute path of a staging-relative file on the target.
    #[must_use]
    pub fn remote_path(&self, name: &str) -> String {
        if name.starts_with('/') {
            name.to_string()
        } else {
            format!("{}/{name}", self.staging_dir.trim_end_matches('/'))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    Running,
    Exited(i32),
}

/// Outcome of a best-effort retrieval.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PullReport {
    pub retrieved: Vec<PathBuf>,
    /// Remote paths that did not exist.
    pub missing: Vec<String>,
}

/// Transport-specific process management.
#[async_trait::async_trait]
pub trait ExecutionBackend: Send + Sync {
    /// Short name for logs (`ssh`, `kube`, `local`).
    fn name(&self) -> &'static str;

    /// Start the bootstrap for `spec` on `target`.
    async fn spawn(&self, target: &Target, spec: &LaunchSpec)
    -> Result<ProcessHandle, BackendError>;

    /// Wait until the process reports a running state, polling at `poll`.
    async fn await_ready(
        &self,
        handle: &ProcessHandle,
        poll: Duration,
        timeout: Duration,
    ) -> Result<(), BackendError>;

    /// Copy files and directories into the staging directory, then signal
    /// completion with the end-of-file marker.
    async fn push_files(&self, handle: &ProcessHandle, files: &[PathBuf])
    -> Result<(), BackendError>;

    /// Deliver the control sequence and close the channel.
    async fn send_commands(
        &self,
        handle: &ProcessHandle,
        tokens: &[ControlToken],
    ) -> Result<(), BackendError>;

    /// Live stdout lines. Can be taken once per handle.
    async fn stream_logs(&self, handle: &ProcessHandle) -> Result<LogStream, BackendError>;

    async fn poll_exit(&self, handle: &ProcessHandle) -> Result<ProcessStatus, BackendError>;

    /// Retrieve files into `local_dir`. Relative names resolve against the
    /// handle's staging directory. Missing files are reported, not fatal.
    async fn pull_files(
        &self,
        handle: &ProcessHandle,
        remote: &[String],
        local_dir: &Path,
    ) -> Result<PullReport, BackendError>;

    /// Stop the process and release its endpoints. Idempotent, never fails;
    /// problems are logged.
    async fn teardown(&self, handle: &ProcessHandle);

    /// Externally reachable URL of the process, if the backend exposes one.
    async fn endpoint(&self, _handle: &ProcessHandle) -> Option<String> {
        None
    }

    /// Whether two concurrent trials must never share a target.
    fn targets_are_exclusive(&self) -> bool {
        true
    }
}

/// Errors raised by execution backends.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("target {target} is unreachable: {reason}")]
    UnreachableTarget { target: String, reason: String },
    #[error("target {target} rejected {name}: {reason}")]
    SpawnRejected {
        target: String,
        name: String,
        reason: String,
    },
    #[error("{name} on {target} not ready after {waited:?}")]
    ReadyTimeout {
        target: String,
        name: String,
        waited: Duration,
    },
    #[error("failed to transfer {} to {target}: {reason}", path.display())]
    TransferError {
        target: String,
        path: PathBuf,
        reason: String,
    },
    #[error("{name} on {target} exited with status {code}")]
    RemoteProcessError {
        target: String,
        name: String,
        code: i32,
    },
    #[error("unknown process handle {0}")]
    UnknownHandle(String),
    #[error("{0}: {1}")]
    Io(String, std::io::Error),
}

/// Shell script wrapped around every worker command.
///
/// Runs under `bash`: creates the staging dir, records its pid, waits for the
/// end-of-file marker, runs the worker in its working directory with stderr
/// and stdout captured to the role's log files, and records the exit code.
#[derive(Debug, Clone)]
pub struct Bootstrap<'a> {
    pub role: Role,
    pub staging_dir: &'a str,
    pub work_dir: Option<&'a str>,
    pub env_setup: Option<&'a str>,
    pub command: &'a str,
    /// Read the control sequence from [`COMMANDS_FILE`] instead of stdin.
    pub commands_from_file: bool,
    /// Keep the shell alive after the worker exits so files can be pulled.
    pub hold_after_exit: bool,
}

impl<'a> Bootstrap<'a> {
    #[must_use]
    pub fn new(target: &'a Target, spec: &'a LaunchSpec) -> Self {
        Self {
            role: spec.role,
            staging_dir: &spec.staging_dir,
            work_dir: target.work_dir.as_deref(),
            env_setup: target.env_setup.as_deref(),
            command: &spec.command,
            commands_from_file: false,
            hold_after_exit: false,
        }
    }

    #[must_use]
    pub fn script(&self) -> String {
        let stage = |name: &str| shell_quote(&format!("{}/{name}", self.staging_dir));
        let mut lines = vec![
            "set -o pipefail".to_string(),
            format!("mkdir -p {}", shell_quote(self.staging_dir)),
            format!(
                "rm -f {} {} {}",
                stage(END_OF_FILE_MARKER),
                stage(EXIT_FILE),
                stage(COMMANDS_FILE)
            ),
            "pgid=$(ps -o pgid= -p $$ 2>/dev/null | tr -d ' ')".to_string(),
            format!(
                "echo \"${{pgid:-$$}}\" > {tmp} && mv {tmp} {}",
                stage(PID_FILE),
                tmp = stage(&format!("{PID_FILE}.tmp"))
            ),
            format!(
                "while [ ! -f {} ]; do sleep 1; done",
                stage(END_OF_FILE_MARKER)
            ),
        ];
        if self.commands_from_file {
            lines.push(format!(
                "while [ ! -f {} ]; do sleep 1; done",
                stage(COMMANDS_FILE)
            ));
        }
        if let Some(dir) = self.work_dir {
            lines.push(format!("cd {} || exit 1", shell_quote(dir)));
        }
        if let Some(setup) = self.env_setup {
            lines.push(setup.to_string());
        }
        let input = if self.commands_from_file {
            format!(" < {}", stage(COMMANDS_FILE))
        } else {
            String::new()
        };
        lines.push(format!(
            "{{ {}\n}}{input} 2> {} | tee {}",
            self.command,
            stage(&self.role.stderr_file_name()),
            stage(&self.role.stdout_file_name()),
        ));
        lines.push("status=$?".to_string());
        lines.push(format!("echo $status > {}", stage(EXIT_FILE)));
        if self.hold_after_exit {
            lines.push("exec sleep infinity".to_string());
        } else {
            lines.push("exit $status".to_string());
        }
        lines.join("\n")
    }
}

/// Single-quote `s` for a POSIX shell.
#[must_use]
pub fn shell_quote(s: &str) -> String {
    if !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "/._-=:@,+".contains(c))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Run a command to completion, capturing output.
pub(crate) async fn run_captured(cmd: &mut Command) -> std::io::Result<Output> {
    tracing::debug!("Running: {:?}", cmd.as_std());
    cmd.kill_on_drop(true).output().await
}

/// Trimmed stderr of a finished command, or its exit status if silent.
pub(crate) fn failure_reason(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    if stderr.is_empty() {
        format!("exit status {}", output.status)
    } else {
        stderr
    }
}

/// Per-handle state kept by a backend.
///
/// The lock is only held for map operations, never across an await.
pub(crate) struct Registry<E> {
    next_id: AtomicU64,
    entries: Mutex<HashMap<u64, E>>,
}

impl<E> Default for Registry<E> {
    fn default() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl<E> Registry<E> {
    pub(crate) fn insert(&self, entry: E) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, entry);
        id
    }

    pub(crate) fn with<R>(&self, id: u64, f: impl FnOnce(&mut E) -> R) -> Option<R> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(&id)
            .map(f)
    }

    pub(crate) fn remove(&self, id: u64) -> Option<E> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
    }
}

/// A locally spawned child with its pipes, as kept by the `ssh` and
/// `local` backends.
pub(crate) struct Piped {
    pub child: Child,
    pub stdin: Option<ChildStdin>,
    pub stdout: Option<ChildStdout>,
}

impl Piped {
    pub(crate) fn spawn(cmd: &mut Command) -> std::io::Result<Self> {
        tracing::debug!("Spawning: {:?}", cmd.as_std());
        let mut child = cmd
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()?;
        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        Ok(Self {
            child,
            stdin,
            stdout,
        })
    }

    /// Exit code if the child has exited; `-1` when killed by a signal.
    pub(crate) fn exit_code(&mut self) -> std::io::Result<Option<i32>> {
        Ok(self
            .child
            .try_wait()?
            .map(|status| status.code().unwrap_or(-1)))
    }
}

/// Write the encoded sequence and close the pipe.
pub(crate) async fn write_commands(
    mut stdin: ChildStdin,
    tokens: &[ControlToken],
) -> std::io::Result<()> {
    stdin
        .write_all(ControlToken::encode_sequence(tokens).as_bytes())
        .await?;
    stdin.flush().await?;
    stdin.shutdown().await
}

pub(crate) fn line_stream(stdout: ChildStdout) -> LogStream {
    Box::pin(LinesStream::new(BufReader::new(stdout).lines()))
}

pub(crate) fn unknown(handle: &ProcessHandle) -> BackendError {
    BackendError::UnknownHandle(handle.name.clone())
}

/// Fail with `TransferError` on the first local path that does not exist.
pub(crate) fn check_local_files(target: &str, files: &[PathBuf]) -> Result<(), BackendError> {
    match files.iter().find(|p| !p.exists()) {
        Some(path) => Err(BackendError::TransferError {
            target: target.to_string(),
            path: path.clone(),
            reason: "no such file or directory".to_string(),
        }),
        None => Ok(()),
    }
}

/// Local file name a pulled remote path lands under.
pub(crate) fn pulled_name(remote: &str) -> &str {
    remote.rsplit('/').next().unwrap_or(remote)
}
