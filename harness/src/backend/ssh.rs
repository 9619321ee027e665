//! Remote machines reached over `ssh`/`scp`.
//!
//! The bootstrap runs as the remote command of a long-lived `ssh` session,
//! so the session's stdin is the worker's control channel and its stdout is
//! the worker's log stream.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use fedrun_config::{ControlToken, END_OF_FILE_MARKER};
use tokio::{process::Command, time::Instant};

use super::{
    BackendError, Bootstrap, ExecutionBackend, LaunchSpec, LogStream, PID_FILE, Piped,
    ProcessHandle, ProcessStatus, PullReport, Registry, Target, check_local_files,
    failure_reason, line_stream, pulled_name, run_captured, shell_quote, unknown, write_commands,
};

/// `ssh` reserves this exit status for its own connection failures.
const SSH_CONNECTION_FAILURE: i32 = 255;

struct Session {
    target: Target,
    piped: Piped,
}

/// Spawns workers on remote machines with the system `ssh` client.
pub struct SshBackend {
    connect_timeout_secs: u64,
    sessions: Registry<Session>,
}

impl Default for SshBackend {
    fn default() -> Self {
        Self::new(10)
    }
}

impl SshBackend {
    #[must_use]
    pub fn new(connect_timeout_secs: u64) -> Self {
        Self {
            connect_timeout_secs,
            sessions: Registry::default(),
        }
    }

    fn ssh(&self, target: &Target) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.args(["-o", "BatchMode=yes"])
            .args(["-o", "StrictHostKeyChecking=accept-new"])
            .arg("-o")
            .arg(format!("ConnectTimeout={}", self.connect_timeout_secs));
        if let Some(port) = target.port {
            cmd.arg("-p").arg(port.to_string());
        }
        if let Some(identity) = &target.identity_file {
            cmd.arg("-i").arg(identity);
        }
        cmd.arg(target.destination());
        cmd
    }

    fn scp(&self, target: &Target) -> Command {
        let mut cmd = Command::new("scp");
        cmd.args(["-r", "-q", "-o", "BatchMode=yes"])
            .arg("-o")
            .arg(format!("ConnectTimeout={}", self.connect_timeout_secs));
        if let Some(port) = target.port {
            cmd.arg("-P").arg(port.to_string());
        }
        if let Some(identity) = &target.identity_file {
            cmd.arg("-i").arg(identity);
        }
        cmd
    }

    /// Run a one-off remote shell command.
    async fn remote(
        &self,
        target: &Target,
        command: &str,
    ) -> Result<std::process::Output, BackendError> {
        let output = run_captured(self.ssh(target).arg(command))
            .await
            .map_err(|e| BackendError::Io(format!("ssh {}", target.name), e))?;
        if output.status.code() == Some(SSH_CONNECTION_FAILURE) {
            return Err(BackendError::UnreachableTarget {
                target: target.name.clone(),
                reason: failure_reason(&output),
            });
        }
        Ok(output)
    }

    fn target_of(&self, handle: &ProcessHandle) -> Result<Target, BackendError> {
        self.sessions
            .with(handle.id, |s| s.target.clone())
            .ok_or_else(|| unknown(handle))
    }
}

fn io_error(handle: &ProcessHandle, e: std::io::Error) -> BackendError {
    BackendError::Io(format!("{} on {}", handle.name, handle.target), e)
}

#[async_trait::async_trait]
impl ExecutionBackend for SshBackend {
    fn name(&self) -> &'static str {
        "ssh"
    }

    async fn spawn(
        &self,
        target: &Target,
        spec: &LaunchSpec,
    ) -> Result<ProcessHandle, BackendError> {
        let probe = self.remote(target, "true").await?;
        if !probe.status.success() {
            return Err(BackendError::SpawnRejected {
                target: target.name.clone(),
                name: spec.name.clone(),
                reason: failure_reason(&probe),
            });
        }

        let script = Bootstrap::new(target, spec).script();
        let remote_command = format!("bash -c {}", shell_quote(&script));
        let piped = Piped::spawn(self.ssh(target).arg(remote_command)).map_err(|e| {
            BackendError::Io(format!("ssh {}", target.name), e)
        })?;
        let id = self.sessions.insert(Session {
            target: target.clone(),
            piped,
        });
        tracing::debug!("Spawned {} on {} (handle {id})", spec.name, target.name);
        Ok(ProcessHandle {
            id,
            name: spec.name.clone(),
            role: spec.role,
            target: target.name.clone(),
            staging_dir: spec.staging_dir.clone(),
        })
    }

    async fn await_ready(
        &self,
        handle: &ProcessHandle,
        poll: Duration,
        timeout: Duration,
    ) -> Result<(), BackendError> {
        let target = self.target_of(handle)?;
        let deadline = Instant::now() + timeout;
        let probe = format!("test -f {}", shell_quote(&handle.remote_path(PID_FILE)));
        loop {
            let exited = self
                .sessions
                .with(handle.id, |s| s.piped.exit_code())
                .ok_or_else(|| unknown(handle))?
                .map_err(|e| io_error(handle, e))?;
            match exited {
                Some(SSH_CONNECTION_FAILURE) => {
                    return Err(BackendError::UnreachableTarget {
                        target: handle.target.clone(),
                        reason: "ssh session dropped before the worker started".to_string(),
                    });
                }
                Some(code) => {
                    return Err(BackendError::SpawnRejected {
                        target: handle.target.clone(),
                        name: handle.name.clone(),
                        reason: format!("bootstrap exited with status {code}"),
                    });
                }
                None => {}
            }
            if self.remote(&target, &probe).await?.status.success() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(BackendError::ReadyTimeout {
                    target: handle.target.clone(),
                    name: handle.name.clone(),
                    waited: timeout,
                });
            }
            tokio::time::sleep(poll).await;
        }
    }

    async fn push_files(
        &self,
        handle: &ProcessHandle,
        files: &[PathBuf],
    ) -> Result<(), BackendError> {
        check_local_files(&handle.target, files)?;
        let target = self.target_of(handle)?;
        let staging = shell_quote(&handle.staging_dir);
        self.remote(&target, &format!("mkdir -p {staging}")).await?;

        let destination = format!("{}:{}/", target.destination(), handle.staging_dir);
        for file in files {
            let output = run_captured(self.scp(&target).arg(file).arg(&destination))
                .await
                .map_err(|e| io_error(handle, e))?;
            if !output.status.success() {
                return Err(BackendError::TransferError {
                    target: handle.target.clone(),
                    path: file.clone(),
                    reason: failure_reason(&output),
                });
            }
        }

        let marker = shell_quote(&handle.remote_path(END_OF_FILE_MARKER));
        let output = self.remote(&target, &format!("touch {marker}")).await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(BackendError::TransferError {
                target: handle.target.clone(),
                path: PathBuf::from(END_OF_FILE_MARKER),
                reason: failure_reason(&output),
            })
        }
    }

    async fn send_commands(
        &self,
        handle: &ProcessHandle,
        tokens: &[ControlToken],
    ) -> Result<(), BackendError> {
        let stdin = self
            .sessions
            .with(handle.id, |s| s.piped.stdin.take())
            .ok_or_else(|| unknown(handle))?
            .ok_or_else(|| {
                io_error(handle, std::io::Error::other("control channel already closed"))
            })?;
        write_commands(stdin, tokens)
            .await
            .map_err(|e| io_error(handle, e))
    }

    async fn stream_logs(&self, handle: &ProcessHandle) -> Result<LogStream, BackendError> {
        let stdout = self
            .sessions
            .with(handle.id, |s| s.piped.stdout.take())
            .ok_or_else(|| unknown(handle))?
            .ok_or_else(|| io_error(handle, std::io::Error::other("log stream already taken")))?;
        Ok(line_stream(stdout))
    }

    async fn poll_exit(&self, handle: &ProcessHandle) -> Result<ProcessStatus, BackendError> {
        let code = self
            .sessions
            .with(handle.id, |s| s.piped.exit_code())
            .ok_or_else(|| unknown(handle))?
            .map_err(|e| io_error(handle, e))?;
        Ok(code.map_or(ProcessStatus::Running, ProcessStatus::Exited))
    }

    async fn pull_files(
        &self,
        handle: &ProcessHandle,
        remote: &[String],
        local_dir: &Path,
    ) -> Result<PullReport, BackendError> {
        let target = self.target_of(handle)?;
        std::fs::create_dir_all(local_dir).map_err(|e| io_error(handle, e))?;
        let mut report = PullReport::default();
        for name in remote {
            let path = handle.remote_path(name);
            let dest = local_dir.join(pulled_name(name));
            let source = format!("{}:{path}", target.destination());
            let output = run_captured(self.scp(&target).arg(&source).arg(&dest))
                .await
                .map_err(|e| io_error(handle, e))?;
            if output.status.success() {
                report.retrieved.push(dest);
            } else {
                tracing::debug!("scp {source}: {}", failure_reason(&output));
                report.missing.push(path);
            }
        }
        Ok(report)
    }

    async fn teardown(&self, handle: &ProcessHandle) {
        let Some(mut session) = self.sessions.remove(handle.id) else {
            return;
        };
        let pid_file = shell_quote(&handle.remote_path(PID_FILE));
        let kill = format!(
            "pgid=$(cat {pid_file} 2>/dev/null) && kill -TERM -\"$pgid\"; rm -f {pid_file}"
        );
        match tokio::time::timeout(Duration::from_secs(30), self.remote(&session.target, &kill))
            .await
        {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => tracing::warn!("Failed to stop {} on {}: {e}", handle.name, handle.target),
            Err(_) => tracing::warn!("Timed out stopping {} on {}", handle.name, handle.target),
        }
        if matches!(session.piped.exit_code(), Ok(None))
            && let Err(e) = session.piped.child.kill().await
        {
            tracing::warn!("Failed to close ssh session for {}: {e}", handle.name);
        }
        tracing::debug!("Tore down {} on {}", handle.name, handle.target);
    }
}
