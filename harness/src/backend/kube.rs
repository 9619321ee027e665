//! Workers as pods created with `kubectl`.
//!
//! Each role gets a pod (and a service when it listens on a port, plus an
//! OpenShift route when requested). Pods have no attached stdin, so the
//! control sequence is delivered as a file the bootstrap waits for, and the
//! bootstrap keeps the container alive after the worker exits so results can
//! still be copied out.

use std::{
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};

use fedrun_config::{ControlToken, END_OF_FILE_MARKER};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::{io::AsyncWriteExt, process::Child, process::Command, time::Instant};

use super::{
    BackendError, Bootstrap, COMMANDS_FILE, EXIT_FILE, ExecutionBackend, LaunchSpec, LogStream,
    ProcessHandle, ProcessStatus, PullReport, Registry, Target, check_local_files,
    failure_reason, line_stream, pulled_name, run_captured, shell_quote, unknown,
};

/// Pod template shared by every role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KubeSettings {
    /// Worker image.
    pub image: String,
    #[serde(default = "default_cpu")]
    pub cpu: String,
    #[serde(default = "default_memory")]
    pub memory: String,
    /// Explicit kubeconfig; otherwise kubectl's default lookup applies.
    #[serde(default)]
    pub kube_config: Option<String>,
    /// Create an OpenShift route for every service.
    #[serde(default)]
    pub expose_route: bool,
    /// Port workers listen on behind their service.
    #[serde(default = "default_service_port")]
    pub service_port: u16,
}

fn default_cpu() -> String {
    "1".to_string()
}

fn default_memory() -> String {
    "2Gi".to_string()
}

fn default_service_port() -> u16 {
    5000
}

struct Pod {
    target: Target,
    has_service: bool,
    port: Option<u16>,
    logs: Option<Child>,
}

/// Spawns workers as pods through the system `kubectl`.
pub struct KubeBackend {
    settings: KubeSettings,
    pods: Registry<Pod>,
}

impl KubeBackend {
    #[must_use]
    pub fn new(settings: KubeSettings) -> Self {
        Self {
            settings,
            pods: Registry::default(),
        }
    }

    fn kubectl(&self, target: &Target) -> Command {
        let mut cmd = Command::new("kubectl");
        if let Some(config) = &self.settings.kube_config {
            cmd.arg("--kubeconfig").arg(config);
        }
        if let Some(context) = &target.context {
            cmd.arg("--context").arg(context);
        }
        if let Some(namespace) = &target.namespace {
            cmd.arg("-n").arg(namespace);
        }
        cmd
    }

    /// Run `bash -c` inside the pod.
    async fn exec(
        &self,
        target: &Target,
        pod: &str,
        script: &str,
    ) -> Result<std::process::Output, BackendError> {
        run_captured(
            self.kubectl(target)
                .args(["exec", pod, "--", "bash", "-c", script]),
        )
        .await
        .map_err(|e| BackendError::Io(format!("kubectl exec {pod}"), e))
    }

    async fn pod_json(&self, target: &Target, pod: &str) -> Result<Value, BackendError> {
        let output = run_captured(self.kubectl(target).args(["get", "pod", pod, "-o", "json"]))
            .await
            .map_err(|e| BackendError::Io(format!("kubectl get pod {pod}"), e))?;
        if !output.status.success() {
            return Err(classify(target, pod, &output));
        }
        serde_json::from_slice(&output.stdout).map_err(|e| {
            BackendError::Io(format!("kubectl get pod {pod}"), std::io::Error::other(e))
        })
    }

    /// Pod, service and route objects for one role.
    #[must_use]
    pub fn manifest(&self, target: &Target, spec: &LaunchSpec, script: &str) -> Value {
        let labels = json!({ "app": "fedrun", "fedrun/name": spec.name });
        let mut container = json!({
            "name": "worker",
            "image": self.settings.image,
            "command": ["bash", "-c", script],
            "resources": {
                "requests": { "cpu": self.settings.cpu, "memory": self.settings.memory },
                "limits": { "cpu": self.settings.cpu, "memory": self.settings.memory },
            },
        });
        if let Some(port) = spec.port {
            container["ports"] = json!([{ "containerPort": port }]);
        }
        let mut items = vec![json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": { "name": spec.name, "labels": labels },
            "spec": { "restartPolicy": "Never", "containers": [container] },
        })];
        if let Some(port) = spec.port {
            items.push(json!({
                "apiVersion": "v1",
                "kind": "Service",
                "metadata": { "name": spec.name, "labels": labels },
                "spec": {
                    "selector": { "fedrun/name": spec.name },
                    "ports": [{ "port": port, "targetPort": port }],
                },
            }));
            if self.settings.expose_route {
                items.push(json!({
                    "apiVersion": "route.openshift.io/v1",
                    "kind": "Route",
                    "metadata": { "name": spec.name, "labels": labels },
                    "spec": {
                        "to": { "kind": "Service", "name": spec.name },
                        "port": { "targetPort": port },
                        "tls": { "termination": "edge" },
                    },
                }));
            }
        }
        if let Some(namespace) = &target.namespace {
            for item in &mut items {
                item["metadata"]["namespace"] = json!(namespace);
            }
        }
        json!({ "apiVersion": "v1", "kind": "List", "items": items })
    }

    fn target_of(&self, handle: &ProcessHandle) -> Result<Target, BackendError> {
        self.pods
            .with(handle.id, |p| p.target.clone())
            .ok_or_else(|| unknown(handle))
    }
}

/// Map a failed kubectl call to unreachable vs. rejected.
fn classify(target: &Target, name: &str, output: &std::process::Output) -> BackendError {
    let reason = failure_reason(output);
    let unreachable = ["Unable to connect", "connection refused", "no such host", "i/o timeout"];
    if unreachable.iter().any(|s| reason.contains(s)) {
        BackendError::UnreachableTarget {
            target: target.name.clone(),
            reason,
        }
    } else {
        BackendError::SpawnRejected {
            target: target.name.clone(),
            name: name.to_string(),
            reason,
        }
    }
}

/// Waiting reasons after which a pod will never start.
const FATAL_WAITING: [&str; 5] = [
    "ErrImagePull",
    "ImagePullBackOff",
    "InvalidImageName",
    "CreateContainerConfigError",
    "CrashLoopBackOff",
];

fn waiting_reason(pod: &Value) -> Option<&str> {
    pod["status"]["containerStatuses"][0]["state"]["waiting"]["reason"].as_str()
}

fn terminated_code(pod: &Value) -> Option<i32> {
    pod["status"]["containerStatuses"][0]["state"]["terminated"]["exitCode"]
        .as_i64()
        .and_then(|c| i32::try_from(c).ok())
}

fn io_error(handle: &ProcessHandle, e: std::io::Error) -> BackendError {
    BackendError::Io(format!("{} on {}", handle.name, handle.target), e)
}

#[async_trait::async_trait]
impl ExecutionBackend for KubeBackend {
    fn name(&self) -> &'static str {
        "kube"
    }

    async fn spawn(
        &self,
        target: &Target,
        spec: &LaunchSpec,
    ) -> Result<ProcessHandle, BackendError> {
        let mut bootstrap = Bootstrap::new(target, spec);
        bootstrap.commands_from_file = true;
        bootstrap.hold_after_exit = true;
        let manifest = self.manifest(target, spec, &bootstrap.script());
        let body = serde_json::to_vec(&manifest).map_err(|e| {
            BackendError::Io(format!("manifest {}", spec.name), std::io::Error::other(e))
        })?;

        let mut child = self
            .kubectl(target)
            .args(["apply", "-f", "-"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| BackendError::Io(format!("kubectl apply {}", spec.name), e))?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(&body)
                .await
                .map_err(|e| BackendError::Io(format!("kubectl apply {}", spec.name), e))?;
        }
        let output = child
            .wait_with_output()
            .await
            .map_err(|e| BackendError::Io(format!("kubectl apply {}", spec.name), e))?;
        if !output.status.success() {
            return Err(classify(target, &spec.name, &output));
        }

        let id = self.pods.insert(Pod {
            target: target.clone(),
            has_service: spec.port.is_some(),
            port: spec.port,
            logs: None,
        });
        tracing::debug!("Applied pod {} on {} (handle {id})", spec.name, target.name);
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
        loop {
            let pod = self.pod_json(&target, &handle.name).await?;
            match pod["status"]["phase"].as_str() {
                Some("Running") => return Ok(()),
                Some(phase @ ("Failed" | "Succeeded")) => {
                    return Err(BackendError::SpawnRejected {
                        target: handle.target.clone(),
                        name: handle.name.clone(),
                        reason: format!("pod reached phase {phase} before running"),
                    });
                }
                _ => {}
            }
            if let Some(reason) = waiting_reason(&pod)
                && FATAL_WAITING.contains(&reason)
            {
                return Err(BackendError::SpawnRejected {
                    target: handle.target.clone(),
                    name: handle.name.clone(),
                    reason: reason.to_string(),
                });
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
        let output = self
            .exec(
                &target,
                &handle.name,
                &format!("mkdir -p {}", shell_quote(&handle.staging_dir)),
            )
            .await?;
        if !output.status.success() {
            return Err(classify(&target, &handle.name, &output));
        }

        for file in files {
            let Some(name) = file.file_name() else {
                continue;
            };
            let dest = format!(
                "{}:{}",
                handle.name,
                handle.remote_path(&name.to_string_lossy())
            );
            let output = run_captured(self.kubectl(&target).arg("cp").arg(file).arg(&dest))
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
        let output = self
            .exec(&target, &handle.name, &format!("touch {marker}"))
            .await?;
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
        let target = self.target_of(handle)?;
        let partial = shell_quote(&handle.remote_path(&format!("{COMMANDS_FILE}.part")));
        let done = shell_quote(&handle.remote_path(COMMANDS_FILE));
        let script = format!("cat > {partial} && mv {partial} {done}");

        let mut child = self
            .kubectl(&target)
            .args(["exec", "-i", handle.name.as_str(), "--", "bash", "-c", script.as_str()])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| io_error(handle, e))?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(ControlToken::encode_sequence(tokens).as_bytes())
                .await
                .map_err(|e| io_error(handle, e))?;
        }
        let output = child
            .wait_with_output()
            .await
            .map_err(|e| io_error(handle, e))?;
        if output.status.success() {
            Ok(())
        } else {
            Err(BackendError::Io(
                format!("commands for {}", handle.name),
                std::io::Error::other(failure_reason(&output)),
            ))
        }
    }

    async fn stream_logs(&self, handle: &ProcessHandle) -> Result<LogStream, BackendError> {
        let target = self.target_of(handle)?;
        let mut cmd = self.kubectl(&target);
        cmd.args(["logs", "-f", handle.name.as_str()]);
        tracing::debug!("Spawning: {:?}", cmd.as_std());
        let mut child = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| io_error(handle, e))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io_error(handle, std::io::Error::other("no stdout from kubectl logs")))?;
        self.pods
            .with(handle.id, |p| p.logs = Some(child))
            .ok_or_else(|| unknown(handle))?;
        Ok(line_stream(stdout))
    }

    async fn poll_exit(&self, handle: &ProcessHandle) -> Result<ProcessStatus, BackendError> {
        let target = self.target_of(handle)?;
        let pod = self.pod_json(&target, &handle.name).await?;
        match pod["status"]["phase"].as_str() {
            Some("Succeeded") => return Ok(ProcessStatus::Exited(0)),
            Some("Failed") => return Ok(ProcessStatus::Exited(terminated_code(&pod).unwrap_or(1))),
            Some("Running") => {}
            _ => return Ok(ProcessStatus::Running),
        }
        let exit_file = shell_quote(&handle.remote_path(EXIT_FILE));
        let output = self
            .exec(&target, &handle.name, &format!("cat {exit_file}"))
            .await?;
        if !output.status.success() {
            return Ok(ProcessStatus::Running);
        }
        Ok(String::from_utf8_lossy(&output.stdout)
            .trim()
            .parse()
            .map_or(ProcessStatus::Running, ProcessStatus::Exited))
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
            let source = format!("{}:{path}", handle.name);
            let output = run_captured(self.kubectl(&target).arg("cp").arg(&source).arg(&dest))
                .await
                .map_err(|e| io_error(handle, e))?;
            if output.status.success() && dest.exists() {
                report.retrieved.push(dest);
            } else {
                tracing::debug!("kubectl cp {source}: {}", failure_reason(&output));
                report.missing.push(path);
            }
        }
        Ok(report)
    }

    async fn endpoint(&self, handle: &ProcessHandle) -> Option<String> {
        let (target, has_service, port) = self
            .pods
            .with(handle.id, |p| (p.target.clone(), p.has_service, p.port))?;
        if !has_service {
            return None;
        }
        if self.settings.expose_route {
            let output = run_captured(self.kubectl(&target).args([
                "get",
                "route",
                handle.name.as_str(),
                "-o",
                "jsonpath={.spec.host}",
            ]))
            .await
            .ok()?;
            let host = String::from_utf8_lossy(&output.stdout).trim().to_string();
            if output.status.success() && !host.is_empty() {
                return Some(format!("https://{host}"));
            }
            tracing::warn!("No route host for {}, using service address", handle.name);
        }
        let namespace = target.namespace.as_deref().unwrap_or("default");
        let port = port.unwrap_or(self.settings.service_port);
        Some(format!(
            "http://{}.{namespace}.svc.cluster.local:{port}",
            handle.name
        ))
    }

    async fn teardown(&self, handle: &ProcessHandle) {
        let Some(mut pod) = self.pods.remove(handle.id) else {
            return;
        };
        if let Some(mut logs) = pod.logs.take()
            && let Ok(None) = logs.try_wait()
            && let Err(e) = logs.kill().await
        {
            tracing::warn!("Failed to stop log stream for {}: {e}", handle.name);
        }
        let mut kinds = "pod".to_string();
        if pod.has_service {
            kinds.push_str(",service");
            if self.settings.expose_route {
                kinds.push_str(",route");
            }
        }
        let result = run_captured(self.kubectl(&pod.target).args([
            "delete",
            kinds.as_str(),
            handle.name.as_str(),
            "--ignore-not-found",
            "--wait=false",
        ]))
        .await;
        match result {
            Ok(output) if output.status.success() => {
                tracing::debug!("Deleted {kinds} {} on {}", handle.name, handle.target);
            }
            Ok(output) => tracing::warn!(
                "Failed to delete {} on {}: {}",
                handle.name,
                handle.target,
                failure_reason(&output)
            ),
            Err(e) => tracing::warn!("Failed to delete {} on {}: {e}", handle.name, handle.target),
        }
    }

    fn targets_are_exclusive(&self) -> bool {
        false
    }
}
