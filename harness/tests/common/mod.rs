//! Recording in-memory backend and document fixtures shared by the
//! integration tests.

#![allow(dead_code)]

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{
        Mutex,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use fedrun_config::{ConfigDocument, ControlToken, Role};
use fedrun_harness::{
    backend::{
        BackendError, ExecutionBackend, LaunchSpec, LogStream, ProcessHandle, ProcessStatus,
        PullReport, Target,
    },
    trial::{RoleAssignment, TrialPlan},
};

/// Coordinator output for a one-round run.
pub const ONE_ROUND: &[&str] = &[
    "Aggregator start successful",
    "Initiating Global Training",
    "Model update",
    "Finished Global Training",
];

/// Backend that records every call and never starts a process.
#[derive(Default)]
pub struct MockBackend {
    pub next_id: AtomicU64,
    pub calls: Mutex<Vec<String>>,
    pub teardowns: Mutex<HashMap<u64, usize>>,
    pub spawned: Mutex<Vec<ProcessHandle>>,
    pub pushed: Mutex<HashMap<String, Vec<PathBuf>>>,
    pub polls: Mutex<HashMap<u64, usize>>,
    /// Coordinator log lines.
    pub coordinator_log: Vec<String>,
    /// Coordinator exit code; `None` keeps it running forever.
    pub coordinator_exit: Option<i32>,
    /// Participant exit code; `None` keeps them running forever.
    pub participant_exit: Option<i32>,
    /// Polls a participant reports running before `participant_exit` applies.
    pub participant_polls_before_exit: usize,
    /// Role whose push panics.
    pub panic_on_push: Option<Role>,
    /// Role whose spawn is rejected.
    pub reject_spawn: Option<Role>,
    /// Extra path appended to the coordinator's push.
    pub extra_push: Option<PathBuf>,
    /// Files `pull_files` reports as missing.
    pub missing_on_pull: Vec<String>,
    pub endpoint: Option<String>,
}

impl MockBackend {
    pub fn with_log(lines: &[&str]) -> Self {
        Self {
            coordinator_log: lines.iter().map(ToString::to_string).collect(),
            coordinator_exit: Some(0),
            participant_exit: Some(0),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn spawned(&self) -> Vec<ProcessHandle> {
        self.spawned.lock().unwrap().clone()
    }

    pub fn teardown_count(&self, id: u64) -> usize {
        self.teardowns.lock().unwrap().get(&id).copied().unwrap_or(0)
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait::async_trait]
impl ExecutionBackend for MockBackend {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn spawn(&self, target: &Target, spec: &LaunchSpec) -> Result<ProcessHandle, BackendError> {
        self.record(format!("spawn {}", spec.role.tag()));
        if self.reject_spawn == Some(spec.role) {
            return Err(BackendError::SpawnRejected {
                target: target.name.clone(),
                name: spec.name.clone(),
                reason: "quota exceeded".to_string(),
            });
        }
        let handle = ProcessHandle {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            name: spec.name.clone(),
            role: spec.role,
            target: target.name.clone(),
            staging_dir: spec.staging_dir.clone(),
        };
        self.spawned.lock().unwrap().push(handle.clone());
        Ok(handle)
    }

    async fn await_ready(
        &self,
        handle: &ProcessHandle,
        _poll: Duration,
        _timeout: Duration,
    ) -> Result<(), BackendError> {
        self.record(format!("ready {}", handle.role.tag()));
        Ok(())
    }

    async fn push_files(&self, handle: &ProcessHandle, files: &[PathBuf]) -> Result<(), BackendError> {
        self.record(format!("push {}", handle.role.tag()));
        assert_ne!(self.panic_on_push, Some(handle.role), "push to {} blew up", handle.name);
        let mut files = files.to_vec();
        if handle.role.is_coordinator()
            && let Some(extra) = &self.extra_push
        {
            files.push(extra.clone());
        }
        if let Some(path) = files.iter().find(|p| !p.exists()) {
            return Err(BackendError::TransferError {
                target: handle.target.clone(),
                path: path.clone(),
                reason: "no such file or directory".to_string(),
            });
        }
        self.pushed.lock().unwrap().insert(handle.role.tag(), files);
        Ok(())
    }

    async fn send_commands(
        &self,
        handle: &ProcessHandle,
        tokens: &[ControlToken],
    ) -> Result<(), BackendError> {
        self.record(format!(
            "commands {} {}",
            handle.role.tag(),
            ControlToken::encode_sequence(tokens).trim_end().replace('\n', ",")
        ));
        Ok(())
    }

    async fn stream_logs(&self, handle: &ProcessHandle) -> Result<LogStream, BackendError> {
        let lines: Vec<std::io::Result<String>> = if handle.role.is_coordinator() {
            self.coordinator_log.iter().cloned().map(Ok).collect()
        } else {
            Vec::new()
        };
        Ok(Box::pin(tokio_stream::iter(lines)))
    }

    async fn poll_exit(&self, handle: &ProcessHandle) -> Result<ProcessStatus, BackendError> {
        let code = if handle.role.is_coordinator() {
            self.coordinator_exit
        } else {
            let mut polls = self.polls.lock().unwrap();
            let seen = polls.entry(handle.id).or_default();
            *seen += 1;
            self.participant_exit
                .filter(|_| *seen > self.participant_polls_before_exit)
        };
        let status = code.map_or(ProcessStatus::Running, ProcessStatus::Exited);
        let label = if status == ProcessStatus::Running { "running" } else { "exited" };
        self.record(format!("poll {} {label}", handle.role.tag()));
        Ok(status)
    }

    async fn pull_files(
        &self,
        handle: &ProcessHandle,
        names: &[String],
        dest: &Path,
    ) -> Result<PullReport, BackendError> {
        self.record(format!("pull {}", handle.role.tag()));
        let mut report = PullReport::default();
        for name in names {
            if self.missing_on_pull.contains(name) {
                report.missing.push(name.clone());
                continue;
            }
            let file_name = Path::new(name).file_name().unwrap();
            let local = dest.join(file_name);
            std::fs::write(&local, format!("{} {name}\n", handle.name)).unwrap();
            report.retrieved.push(local);
        }
        Ok(report)
    }

    async fn teardown(&self, handle: &ProcessHandle) {
        self.record(format!("teardown {}", handle.role.tag()));
        *self.teardowns.lock().unwrap().entry(handle.id).or_default() += 1;
    }

    async fn endpoint(&self, _handle: &ProcessHandle) -> Option<String> {
        self.endpoint.clone()
    }
}

/// Generated documents for a coordinator and `n_parties` participants.
pub struct Fixture {
    pub dir: tempfile::TempDir,
    pub generated: PathBuf,
    pub n_parties: usize,
}

impl Fixture {
    pub fn new(n_parties: usize) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let generated = dir.path().join("generated");
        std::fs::create_dir_all(generated.join("data")).unwrap();
        std::fs::write(generated.join("model.h5"), b"weights").unwrap();

        Self::coordinator_document(&generated, n_parties)
            .save(generated.join("config_agg.yml"))
            .unwrap();
        for index in 0..n_parties {
            std::fs::write(generated.join(format!("data/party{index}.npz")), b"data").unwrap();
            Self::participant_document(&generated, index)
                .save(generated.join(format!("config_party{index}.yml")))
                .unwrap();
        }
        Self {
            dir,
            generated,
            n_parties,
        }
    }

    pub fn coordinator_document(generated: &Path, n_parties: usize) -> ConfigDocument {
        ConfigDocument::from_yaml_str(&format!(
            "connection:\n  info:\n    ip: 127.0.0.1\n    port: 5000\n\
             hyperparams:\n  global:\n    num_parties: {n_parties}\n    rounds: 1\n\
             model:\n  path: {}\n",
            generated.join("model.h5").display()
        ))
        .unwrap()
    }

    pub fn participant_document(generated: &Path, index: usize) -> ConfigDocument {
        let port = 8085 + index;
        ConfigDocument::from_yaml_str(&format!(
            "connection:\n  info:\n    ip: 10.0.0.{index}\n    port: {port}\n\
             aggregator:\n  ip: 127.0.0.1\n  port: 5000\n\
             data:\n  info:\n    npz_file: {data}\n\
             model:\n  path: {model}\n\
             metrics_recorder:\n  output_file: {metrics}\n  output_type: json\n",
            data = generated.join(format!("data/party{index}.npz")).display(),
            model = generated.join("model.h5").display(),
            metrics = generated.join(format!("metrics_party{index}")).display(),
        ))
        .unwrap()
    }

    pub fn target(name: &str) -> Target {
        Target {
            name: name.to_string(),
            address: "127.0.0.1".to_string(),
            staging_dir: "/tmp/fedrun".to_string(),
            ..Target::default()
        }
    }

    fn assignment(&self, role: Role, document: ConfigDocument) -> RoleAssignment {
        let staging_dir = format!("/tmp/fedrun/exp-1/trial1/{}", role.tag());
        RoleAssignment {
            role,
            target: Self::target(&format!("m-{}", role.tag())),
            document,
            command: format!("worker {staging_dir}/{}", role.config_file_name()),
            commands: role.default_commands(),
            staging_dir,
        }
    }

    /// Plan for trial 1 with every role on its own target.
    pub fn plan(&self) -> TrialPlan {
        TrialPlan {
            experiment: "exp".to_string(),
            experiment_id: "exp-1".to_string(),
            trial: 1,
            timestamp: "1".to_string(),
            local_dir: self.dir.path().join("results/trial1"),
            generated_dir: Some(self.generated.clone()),
            dataset_roots: Vec::new(),
            coordinator: self.assignment(
                Role::Coordinator,
                Self::coordinator_document(&self.generated, self.n_parties),
            ),
            participants: (0..self.n_parties)
                .map(|index| {
                    self.assignment(
                        Role::Participant(index),
                        Self::participant_document(&self.generated, index),
                    )
                })
                .collect(),
        }
    }
}
