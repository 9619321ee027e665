//! Workers as child processes of the orchestrator.
//!
//! Used for single-host runs and tests. Targets only contribute their
//! working directory and environment setup; the staging directory is a
//! local path.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use fedrun_config::{ControlToken, END_OF_FILE_MARKER};
use tokio::{process::Command, time::Instant};

use super::{
    BackendError, Bootstrap, ExecutionBackend, LaunchSpec, LogStream, PID_FILE, Piped,
    ProcessHandle, ProcessStatus, PullReport, Registry, Target, check_local_files, line_stream,
    pulled_name, run_captured, unknown, write_commands,
};
use crate::stager::copy_path;

/// Runs every role on the orchestrating host.
#[derive(Default)]
pub struct LocalBackend {
    processes: Registry<Piped>,
}

impl LocalBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

fn io_error(handle: &ProcessHandle, e: std::io::Error) -> BackendError {
    BackendError::Io(format!("{} on {}", handle.name, handle.target), e)
}

/// Signal every process in the bootstrap's group.
async fn signal_group(handle: &ProcessHandle, pgid: u32, signal: &str) {
    let mut kill = Command::new("kill");
    kill.arg(format!("-{signal}")).arg("--").arg(format!("-{pgid}"));
    if let Err(e) = run_captured(&mut kill).await {
        tracing::warn!("Failed to signal {}: {e}", handle.name);
    }
}

#[async_trait::async_trait]
impl ExecutionBackend for LocalBackend {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn spawn(
        &self,
        target: &Target,
        spec: &LaunchSpec,
    ) -> Result<ProcessHandle, BackendError> {
        let script = Bootstrap::new(target, spec).script();
        // Own process group, so teardown reaches the worker's pipeline too.
        let mut cmd = Command::new("bash");
        cmd.arg("-c").arg(script).process_group(0);
        let piped = Piped::spawn(&mut cmd).map_err(|e| {
            BackendError::SpawnRejected {
                target: target.name.clone(),
                name: spec.name.clone(),
                reason: e.to_string(),
            }
        })?;
        let id = self.processes.insert(piped);
        tracing::debug!("Spawned {} locally (handle {id})", spec.name);
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
        let deadline = Instant::now() + timeout;
        let pid_file = PathBuf::from(handle.remote_path(PID_FILE));
        loop {
            let exited = self
                .processes
                .with(handle.id, Piped::exit_code)
                .ok_or_else(|| unknown(handle))?
                .map_err(|e| io_error(handle, e))?;
            if let Some(code) = exited {
                return Err(BackendError::SpawnRejected {
                    target: handle.target.clone(),
                    name: handle.name.clone(),
                    reason: format!("bootstrap exited with status {code}"),
                });
            }
            if pid_file.exists() {
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
        let staging = PathBuf::from(&handle.staging_dir);
        for file in files {
            let Some(name) = file.file_name() else {
                continue;
            };
            copy_path(file, &staging.join(name)).map_err(|e| BackendError::TransferError {
                target: handle.target.clone(),
                path: file.clone(),
                reason: e.to_string(),
            })?;
        }
        std::fs::write(staging.join(END_OF_FILE_MARKER), b"")
            .map_err(|e| io_error(handle, e))
    }

    async fn send_commands(
        &self,
        handle: &ProcessHandle,
        tokens: &[ControlToken],
    ) -> Result<(), BackendError> {
        let stdin = self
            .processes
            .with(handle.id, |p| p.stdin.take())
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
            .processes
            .with(handle.id, |p| p.stdout.take())
            .ok_or_else(|| unknown(handle))?
            .ok_or_else(|| io_error(handle, std::io::Error::other("log stream already taken")))?;
        Ok(line_stream(stdout))
    }

    async fn poll_exit(&self, handle: &ProcessHandle) -> Result<ProcessStatus, BackendError> {
        let code = self
            .processes
            .with(handle.id, Piped::exit_code)
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
        std::fs::create_dir_all(local_dir).map_err(|e| io_error(handle, e))?;
        let mut report = PullReport::default();
        for name in remote {
            let source = PathBuf::from(handle.remote_path(name));
            if !source.exists() {
                report.missing.push(source.display().to_string());
                continue;
            }
            let dest = local_dir.join(pulled_name(name));
            copy_path(&source, &dest).map_err(|e| io_error(handle, e))?;
            report.retrieved.push(dest);
        }
        Ok(report)
    }

    async fn teardown(&self, handle: &ProcessHandle) {
        let Some(mut piped) = self.processes.remove(handle.id) else {
            return;
        };
        match piped.exit_code() {
            Ok(Some(_)) => return,
            Ok(None) => {}
            Err(e) => tracing::warn!("Failed to query {}: {e}", handle.name),
        }
        let pgid = piped.child.id();
        if let Some(pgid) = pgid {
            signal_group(handle, pgid, "TERM").await;
        }
        if tokio::time::timeout(Duration::from_secs(10), piped.child.wait())
            .await
            .is_err()
        {
            if let Some(pgid) = pgid {
                signal_group(handle, pgid, "KILL").await;
            }
            if let Err(e) = piped.child.kill().await {
                tracing::warn!("Failed to kill {}: {e}", handle.name);
            }
        }
        tracing::debug!("Tore down {}", handle.name);
    }

    fn targets_are_exclusive(&self) -> bool {
        false
    }
}
