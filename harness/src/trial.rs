//! One trial, end to end.
//!
//! Stage documents, start the coordinator and wait for it, start every
//! participant concurrently, follow the coordinator's log until training
//! finishes (or the trial fails or times out), then retrieve logs and
//! metrics and tear down every process that was started, whatever happened.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use fedrun_config::{ConfigDocument, ControlToken, DocumentError, Role};
use serde::Serialize;
use tokio::{
    sync::{mpsc, watch},
    task::JoinSet,
    time::Instant,
};
use tokio_stream::StreamExt;

use crate::{
    backend::{
        BackendError, ExecutionBackend, LaunchSpec, ProcessHandle, ProcessStatus, Target,
        pulled_name,
    },
    progress::{LogMarkers, MarkerSettings, ProgressState, ProgressTracker, ProgressUpdate},
    stager::{DatasetRoot, StageError, StageRequest, Stager},
    state::TrialStatus,
};

/// How long to keep reading buffered log lines after the coordinator exits.
const LOG_DRAIN: Duration = Duration::from_secs(5);

/// Timing and endpoint settings shared by every trial.
#[derive(Debug, Clone)]
pub struct TrialSettings {
    pub poll_interval: Duration,
    pub ready_timeout: Duration,
    pub trial_timeout: Duration,
    /// How long every worker gets to exit on its own once training finished.
    pub exit_grace: Duration,
    pub markers: MarkerSettings,
    /// Workers listen on all interfaces behind service endpoints and
    /// participants are pointed at the coordinator's endpoint.
    pub bind_endpoints: bool,
    /// Port workers listen on when `bind_endpoints` is set.
    pub service_port: u16,
}

impl Default for TrialSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            ready_timeout: Duration::from_secs(600),
            trial_timeout: Duration::from_secs(7200),
            exit_grace: Duration::from_secs(30),
            markers: MarkerSettings::default(),
            bind_endpoints: false,
            service_port: 5000,
        }
    }
}

/// One role of a trial, fully resolved.
#[derive(Debug, Clone)]
pub struct RoleAssignment {
    pub role: Role,
    pub target: Target,
    /// Document before staging.
    pub document: ConfigDocument,
    /// Staging directory for this role on its target.
    pub staging_dir: String,
    /// Worker launch line.
    pub command: String,
    pub commands: Vec<ControlToken>,
}

/// Everything needed to run one trial.
#[derive(Debug, Clone)]
pub struct TrialPlan {
    pub experiment: String,
    /// `{name}-{timestamp}`, also the prefix of resource names.
    pub experiment_id: String,
    /// 1-based trial number.
    pub trial: usize,
    pub timestamp: String,
    /// Local directory retrieved files and staged artifacts go to.
    pub local_dir: PathBuf,
    pub generated_dir: Option<PathBuf>,
    pub dataset_roots: Vec<DatasetRoot>,
    pub coordinator: RoleAssignment,
    pub participants: Vec<RoleAssignment>,
}

impl TrialPlan {
    /// DNS-safe resource name for one role.
    #[must_use]
    pub fn resource_name(&self, role: Role) -> String {
        let mut name = format!("{}-t{}-{}", self.experiment_id, self.trial, role.tag())
            .to_ascii_lowercase()
            .replace(|c: char| !c.is_ascii_alphanumeric() && c != '-', "-");
        if name.len() > 63 {
            name = name[name.len() - 63..].trim_start_matches('-').to_string();
        }
        name
    }

    fn assignments(&self) -> impl Iterator<Item = &RoleAssignment> {
        std::iter::once(&self.coordinator).chain(&self.participants)
    }
}

/// Result of one trial.
#[derive(Debug)]
pub struct TrialOutcome {
    pub experiment: String,
    pub trial: usize,
    pub status: TrialStatus,
    pub error: Option<TrialError>,
    /// Completed rounds observed in the coordinator log.
    pub rounds: usize,
    pub final_state: ProgressState,
    pub local_dir: PathBuf,
    /// Files retrieved into `local_dir`.
    pub retrieved: Vec<PathBuf>,
    /// Retrieved participant metrics files.
    pub metrics: Vec<PathBuf>,
}

impl TrialOutcome {
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.status == TrialStatus::Completed
    }
}

#[derive(Serialize)]
struct TargetSummary<'a> {
    role: String,
    target: &'a str,
    address: &'a str,
    user: Option<&'a str>,
    staging_dir: &'a str,
}

#[derive(Serialize)]
struct TrialMetadata<'a> {
    experiment: &'a str,
    experiment_id: &'a str,
    trial: usize,
    timestamp: &'a str,
    local_staging_dir: String,
    coordinator: TargetSummary<'a>,
    participants: Vec<TargetSummary<'a>>,
}

impl<'a> TargetSummary<'a> {
    fn new(assignment: &'a RoleAssignment) -> Self {
        Self {
            role: assignment.role.tag(),
            target: &assignment.target.name,
            address: &assignment.target.address,
            user: assignment.target.user.as_deref(),
            staging_dir: &assignment.staging_dir,
        }
    }
}

/// Mutable bookkeeping for a trial in flight.
struct Run {
    /// Every handle created, in creation order.
    handles: Vec<ProcessHandle>,
    tracker: Option<ProgressTracker>,
    /// Remote metrics file per participant handle id.
    metrics: HashMap<u64, String>,
    background: JoinSet<()>,
}

impl Run {
    fn rounds(&self) -> usize {
        self.tracker.as_ref().map_or(0, ProgressTracker::round)
    }

    fn state(&self) -> ProgressState {
        self.tracker
            .as_ref()
            .map_or(ProgressState::NotStarted, ProgressTracker::state)
    }
}

/// What a participant start task hands back. Its handle is registered
/// separately, as soon as it exists.
struct Started {
    index: usize,
    own_url: Option<String>,
    result: Result<(), TrialError>,
}

/// Participant handles in spawn order, tagged with the participant index.
#[derive(Clone, Default)]
struct Spawned(Arc<Mutex<Vec<(usize, ProcessHandle)>>>);

impl Spawned {
    fn push(&self, index: usize, handle: ProcessHandle) {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((index, handle));
    }

    fn take(&self) -> Vec<(usize, ProcessHandle)> {
        let mut handles =
            std::mem::take(&mut *self.0.lock().unwrap_or_else(PoisonError::into_inner));
        handles.sort_by_key(|(index, _)| *index);
        handles
    }
}

/// Runs trials on one execution backend.
pub struct TrialOrchestrator {
    backend: Arc<dyn ExecutionBackend>,
    settings: TrialSettings,
}

impl TrialOrchestrator {
    #[must_use]
    pub fn new(backend: Arc<dyn ExecutionBackend>, mut settings: TrialSettings) -> Self {
        // A zero period would make the monitor's interval panic.
        settings.poll_interval = settings.poll_interval.max(Duration::from_millis(1));
        Self { backend, settings }
    }

    /// Run `plan` to completion. Never fails: errors are reported in the
    /// outcome, after retrieval and teardown.
    pub async fn run(
        &self,
        plan: TrialPlan,
        progress: Option<watch::Sender<ProgressUpdate>>,
    ) -> TrialOutcome {
        let mut run = Run {
            handles: Vec::new(),
            tracker: None,
            metrics: HashMap::new(),
            background: JoinSet::new(),
        };

        let result = self.execute(&plan, &mut run, progress.as_ref()).await;
        if result.is_err()
            && let Some(tracker) = run.tracker.as_mut()
        {
            tracker.fail();
        }
        if let (Some(tx), Some(tracker)) = (&progress, &run.tracker) {
            tx.send_replace(tracker.snapshot());
        }

        let (retrieved, metrics) = self.retrieve(&run, &plan.local_dir).await;
        run.background.abort_all();
        for handle in &run.handles {
            self.backend.teardown(handle).await;
        }

        let (status, error) = match result {
            Ok(()) => (TrialStatus::Completed, None),
            Err(e) => (TrialStatus::Failed, Some(e)),
        };
        TrialOutcome {
            experiment: plan.experiment,
            trial: plan.trial,
            status,
            error,
            rounds: run.rounds(),
            final_state: run.state(),
            local_dir: plan.local_dir,
            retrieved,
            metrics,
        }
    }

    async fn execute(
        &self,
        plan: &TrialPlan,
        run: &mut Run,
        progress: Option<&watch::Sender<ProgressUpdate>>,
    ) -> Result<(), TrialError> {
        let deadline = Instant::now() + self.settings.trial_timeout;

        let mut requests = self.validated_requests(plan)?;
        let manifest = Stager::new(
            plan.generated_dir.clone().unwrap_or_default(),
            &plan.local_dir,
        )
        .with_dataset_roots(plan.dataset_roots.clone())
        .stage(&mut requests)?;
        write_metadata(plan)?;
        tracing::info!(
            "{} trial {}: staged {} documents into {}",
            plan.experiment,
            plan.trial,
            manifest.len(),
            plan.local_dir.display()
        );

        // Coordinator: spawn, ready, files, commands.
        let coordinator = &plan.coordinator;
        let spec = self.launch_spec(plan, coordinator);
        let handle = self
            .backend
            .spawn(&coordinator.target, &spec)
            .await
            .map_err(|e| TrialError::backend(coordinator, e))?;
        run.handles.push(handle.clone());

        self.backend
            .await_ready(
                &handle,
                self.settings.poll_interval,
                self.settings.ready_timeout,
            )
            .await
            .map_err(|e| TrialError::backend(coordinator, e))?;
        let mut logs = self
            .backend
            .stream_logs(&handle)
            .await
            .map_err(|e| TrialError::backend(coordinator, e))?;
        let (line_tx, mut lines) = mpsc::unbounded_channel();
        run.background.spawn(async move {
            while let Some(line) = logs.next().await {
                if line_tx.send(line).is_err() {
                    break;
                }
            }
        });
        self.backend
            .push_files(&handle, manifest.files(Role::Coordinator))
            .await
            .map_err(|e| TrialError::backend(coordinator, e))?;
        self.backend
            .send_commands(&handle, &coordinator.commands)
            .await
            .map_err(|e| TrialError::backend(coordinator, e))?;
        tracing::info!(
            "{} trial {}: coordinator up on {}",
            plan.experiment,
            plan.trial,
            coordinator.target.name
        );

        let coordinator_url = if self.settings.bind_endpoints {
            self.backend.endpoint(&handle).await
        } else {
            None
        };

        // Participants: all at once.
        let spawned = Spawned::default();
        let mut starts = JoinSet::new();
        for (index, (assignment, request)) in plan
            .participants
            .iter()
            .zip(requests.iter().skip(1))
            .enumerate()
        {
            let backend = Arc::clone(&self.backend);
            let assignment = assignment.clone();
            let spec = self.launch_spec(plan, &assignment);
            let files = manifest.files(assignment.role).to_vec();
            let document = request.document.clone();
            let settings = self.settings.clone();
            let coordinator_url = coordinator_url.clone();
            let spawned = spawned.clone();
            starts.spawn(async move {
                start_participant(
                    backend.as_ref(),
                    &settings,
                    &spawned,
                    index,
                    &assignment,
                    &spec,
                    &files,
                    document,
                    coordinator_url.as_deref(),
                )
                .await
            });
        }

        let mut started: Vec<Started> = Vec::new();
        while let Some(joined) = starts.join_next().await {
            match joined {
                Ok(s) => started.push(s),
                Err(e) => tracing::error!("Participant start task panicked: {e}"),
            }
        }
        for (index, handle) in spawned.take() {
            if let Some(metrics) = requests
                .get(index + 1)
                .and_then(|r| r.document.metrics_output())
            {
                run.metrics.insert(handle.id, metrics);
            }
            run.handles.push(handle);
        }

        started.sort_by_key(|s| s.index);
        let complete = started.len() == plan.participants.len();
        let mut addresses = vec![String::new(); plan.participants.len()];
        let mut first_error = None;
        for s in started {
            addresses[s.index] = s.own_url.map_or_else(
                || participant_address(&requests[s.index + 1].document),
                |url| url_host(&url).to_string(),
            );
            if let Err(e) = s.result
                && first_error.is_none()
            {
                first_error = Some(e);
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }
        if !complete {
            return Err(TrialError::Aborted(
                "a participant start task did not complete".to_string(),
            ));
        }
        tracing::info!(
            "{} trial {}: {} participants started",
            plan.experiment,
            plan.trial,
            plan.participants.len()
        );

        // Drain participant logs so their pipes never fill.
        for handle in run.handles.iter().skip(1) {
            match self.backend.stream_logs(handle).await {
                Ok(mut stream) => {
                    let name = handle.name.clone();
                    run.background.spawn(async move {
                        while let Some(Ok(line)) = stream.next().await {
                            tracing::trace!("[{name}] {line}");
                        }
                    });
                }
                Err(e) => tracing::warn!("No log stream for {}: {e}", handle.name),
            }
        }

        run.tracker = Some(ProgressTracker::new(Box::new(LogMarkers::new(
            self.settings.markers.clone(),
            addresses,
        ))));
        self.monitor(plan, run, &mut lines, deadline, progress)
            .await
    }

    /// Follow the coordinator until a terminal state or the deadline.
    async fn monitor(
        &self,
        plan: &TrialPlan,
        run: &mut Run,
        lines: &mut mpsc::UnboundedReceiver<std::io::Result<String>>,
        deadline: Instant,
        progress: Option<&watch::Sender<ProgressUpdate>>,
    ) -> Result<(), TrialError> {
        let Run {
            handles, tracker, ..
        } = run;
        let Some(tracker) = tracker.as_mut() else {
            return Err(TrialError::Aborted("progress tracker missing".to_string()));
        };
        let Some((coordinator, participants)) = handles.split_first() else {
            return Err(TrialError::Aborted("coordinator handle missing".to_string()));
        };

        let mut tick = tokio::time::interval(self.settings.poll_interval);
        let mut logs_open = true;
        loop {
            if tracker.state() == ProgressState::Finished {
                break;
            }
            tokio::select! {
                line = lines.recv(), if logs_open => match line {
                    Some(Ok(line)) => {
                        tracker.observe_line(&line);
                        publish(progress, tracker);
                    }
                    Some(Err(e)) => {
                        tracing::warn!("Coordinator log stream failed: {e}");
                        logs_open = false;
                    }
                    None => logs_open = false,
                },
                _ = tick.tick() => {
                    if let ProcessStatus::Exited(code) = self.poll(coordinator).await? {
                        drain_lines(tracker, lines).await;
                        publish(progress, tracker);
                        if tracker.state() == ProgressState::Finished {
                            break;
                        }
                        tracker.process_exited(code);
                        publish(progress, tracker);
                        return Err(TrialError::RemoteProcessError {
                            role: Role::Coordinator.tag(),
                            target: coordinator.target.clone(),
                            code,
                        });
                    }
                    for handle in participants {
                        if let ProcessStatus::Exited(code) = self.poll(handle).await?
                            && code != 0
                        {
                            tracker.fail();
                            return Err(TrialError::RemoteProcessError {
                                role: handle.role.tag(),
                                target: handle.target.clone(),
                                code,
                            });
                        }
                    }
                },
                () = tokio::time::sleep_until(deadline) => {
                    let state = tracker.state();
                    tracker.fail();
                    return Err(TrialError::ProgressTimeout {
                        waited: self.settings.trial_timeout,
                        state,
                        round: tracker.round(),
                    });
                }
            }
        }

        tracing::info!(
            "{} trial {}: training finished after {} rounds",
            plan.experiment,
            plan.trial,
            tracker.round()
        );
        // Workers flush logs and metrics on their way out; retrieval waits for them.
        let exit_by = deadline.min(Instant::now() + self.settings.exit_grace);
        let mut pending: Vec<&ProcessHandle> = handles.iter().collect();
        loop {
            let mut running = Vec::with_capacity(pending.len());
            for handle in pending {
                match self.poll(handle).await {
                    Ok(ProcessStatus::Exited(0)) => {}
                    Ok(ProcessStatus::Exited(code)) => tracing::warn!(
                        "{} on {} exited with {code} after training finished",
                        handle.name,
                        handle.target
                    ),
                    Ok(ProcessStatus::Running) => running.push(handle),
                    Err(e) => tracing::warn!("{e}"),
                }
            }
            pending = running;
            if pending.is_empty() || Instant::now() >= exit_by {
                break;
            }
            tokio::time::sleep(self.settings.poll_interval).await;
        }
        for handle in pending {
            tracing::warn!(
                "{} on {} still running after training finished; tearing it down",
                handle.name,
                handle.target
            );
        }
        Ok(())
    }

    async fn poll(&self, handle: &ProcessHandle) -> Result<ProcessStatus, TrialError> {
        self.backend
            .poll_exit(handle)
            .await
            .map_err(|source| TrialError::Backend {
                role: handle.role.tag(),
                target: handle.target.clone(),
                source,
            })
    }

    /// Validate every document and check the coordinator's party count.
    fn validated_requests(&self, plan: &TrialPlan) -> Result<Vec<StageRequest>, TrialError> {
        let mut requests = Vec::with_capacity(plan.participants.len() + 1);
        for assignment in plan.assignments() {
            let summary = assignment.document.validate(assignment.role).map_err(|source| {
                TrialError::Document {
                    role: assignment.role.tag(),
                    source,
                }
            })?;
            if let Some(found) = summary.num_parties
                && found != plan.participants.len()
            {
                return Err(TrialError::PartyCountMismatch {
                    expected: plan.participants.len(),
                    found,
                });
            }
            let mut document = assignment.document.clone();
            if self.settings.bind_endpoints && assignment.role.is_coordinator() {
                document.bind_all_interfaces(Some(self.settings.service_port));
            }
            requests.push(StageRequest {
                role: assignment.role,
                document,
                staging_dir: assignment.staging_dir.clone(),
            });
        }
        Ok(requests)
    }

    fn launch_spec(&self, plan: &TrialPlan, assignment: &RoleAssignment) -> LaunchSpec {
        LaunchSpec {
            role: assignment.role,
            name: plan.resource_name(assignment.role),
            command: assignment.command.clone(),
            staging_dir: assignment.staging_dir.clone(),
            port: self
                .settings
                .bind_endpoints
                .then_some(self.settings.service_port),
        }
    }

    /// Best-effort retrieval of logs and metrics from every handle.
    async fn retrieve(&self, run: &Run, local_dir: &Path) -> (Vec<PathBuf>, Vec<PathBuf>) {
        let mut retrieved = Vec::new();
        let mut metrics = Vec::new();
        for handle in &run.handles {
            let mut wanted = vec![
                handle.role.stdout_file_name(),
                handle.role.stderr_file_name(),
            ];
            let metrics_file = run.metrics.get(&handle.id);
            if let Some(file) = metrics_file {
                wanted.push(file.clone());
            }
            match self.backend.pull_files(handle, &wanted, local_dir).await {
                Ok(report) => {
                    for missing in &report.missing {
                        tracing::warn!("{} did not produce {missing}", handle.name);
                    }
                    if let Some(file) = metrics_file {
                        let name = pulled_name(file);
                        metrics.extend(
                            report
                                .retrieved
                                .iter()
                                .filter(|p| p.file_name().is_some_and(|n| n == name))
                                .cloned(),
                        );
                    }
                    retrieved.extend(report.retrieved);
                }
                Err(e) => tracing::warn!("Failed to retrieve files from {}: {e}", handle.name),
            }
        }
        (retrieved, metrics)
    }
}

#[allow(clippy::too_many_arguments)]
async fn start_participant(
    backend: &dyn ExecutionBackend,
    settings: &TrialSettings,
    spawned: &Spawned,
    index: usize,
    assignment: &RoleAssignment,
    spec: &LaunchSpec,
    files: &[PathBuf],
    mut document: ConfigDocument,
    coordinator_url: Option<&str>,
) -> Started {
    let fail = |e: BackendError| Started {
        index,
        own_url: None,
        result: Err(TrialError::backend(assignment, e)),
    };

    let handle = match backend.spawn(&assignment.target, spec).await {
        Ok(handle) => handle,
        Err(e) => return fail(e),
    };
    spawned.push(index, handle.clone());
    if let Err(e) = backend
        .await_ready(&handle, settings.poll_interval, settings.ready_timeout)
        .await
    {
        return fail(e);
    }

    let mut own_url = None;
    if let Some(url) = coordinator_url {
        own_url = backend.endpoint(&handle).await;
        document.point_at_coordinator(url, own_url.as_deref());
        document.bind_all_interfaces(Some(settings.service_port));
        if let Some(config) = files.first()
            && let Err(e) = document.save(config)
        {
            return Started {
                index,
                own_url,
                result: Err(TrialError::Document {
                    role: assignment.role.tag(),
                    source: e,
                }),
            };
        }
    }

    if let Err(e) = backend.push_files(&handle, files).await {
        return fail(e);
    }
    if let Err(e) = backend.send_commands(&handle, &assignment.commands).await {
        return fail(e);
    }
    tracing::debug!("{} up on {}", assignment.role, assignment.target.name);
    Started {
        index,
        own_url,
        result: Ok(()),
    }
}

fn publish(progress: Option<&watch::Sender<ProgressUpdate>>, tracker: &ProgressTracker) {
    if let Some(tx) = progress {
        tx.send_replace(tracker.snapshot());
    }
}

/// Read whatever the coordinator still has buffered, briefly.
async fn drain_lines(
    tracker: &mut ProgressTracker,
    lines: &mut mpsc::UnboundedReceiver<std::io::Result<String>>,
) {
    let until = Instant::now() + LOG_DRAIN;
    while let Ok(Some(Ok(line))) = tokio::time::timeout_at(until, lines.recv()).await {
        tracker.observe_line(&line);
    }
}

/// Address a participant appears under in the coordinator's output.
fn participant_address(document: &ConfigDocument) -> String {
    document
        .get("connection.info.ip")
        .and_then(|v| match v {
            serde_yaml::Value::String(s) => Some(s.clone()),
            serde_yaml::Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
        .unwrap_or_default()
}

fn url_host(url: &str) -> &str {
    let rest = url.split_once("://").map_or(url, |(_, rest)| rest);
    rest.split(['/', ':']).next().unwrap_or(rest)
}

fn write_metadata(plan: &TrialPlan) -> Result<(), TrialError> {
    let metadata = TrialMetadata {
        experiment: &plan.experiment,
        experiment_id: &plan.experiment_id,
        trial: plan.trial,
        timestamp: &plan.timestamp,
        local_staging_dir: plan.local_dir.display().to_string(),
        coordinator: TargetSummary::new(&plan.coordinator),
        participants: plan.participants.iter().map(TargetSummary::new).collect(),
    };
    let path = plan.local_dir.join("metadata.yml");
    let yaml = serde_yaml::to_string(&metadata)
        .map_err(|e| TrialError::Io(path.clone(), std::io::Error::other(e)))?;
    std::fs::write(&path, yaml).map_err(|e| TrialError::Io(path, e))
}

/// Errors that fail a trial.
#[derive(Debug, thiserror::Error)]
pub enum TrialError {
    #[error("{role} document is invalid: {source}")]
    Document {
        role: String,
        #[source]
        source: DocumentError,
    },
    #[error("coordinator document expects {found} participants, experiment has {expected}")]
    PartyCountMismatch { expected: usize, found: usize },
    #[error(transparent)]
    Stage(#[from] StageError),
    #[error("{role} on {target}: {source}")]
    Backend {
        role: String,
        target: String,
        #[source]
        source: BackendError,
    },
    #[error("no terminal progress after {waited:?} (state {state:?}, round {round})")]
    ProgressTimeout {
        waited: Duration,
        state: ProgressState,
        round: usize,
    },
    #[error("{role} on {target} exited with status {code} before training finished")]
    RemoteProcessError {
        role: String,
        target: String,
        code: i32,
    },
    #[error("failed to write {0}: {1}")]
    Io(PathBuf, std::io::Error),
    #[error("trial aborted: {0}")]
    Aborted(String),
}

impl TrialError {
    fn backend(assignment: &RoleAssignment, source: BackendError) -> Self {
        Self::Backend {
            role: assignment.role.tag(),
            target: assignment.target.name.clone(),
            source,
        }
    }

    /// Target involved in the failure, when there is one.
    #[must_use]
    pub fn target(&self) -> Option<&str> {
        match self {
            Self::Backend { target, .. } | Self::RemoteProcessError { target, .. } => {
                Some(target.as_str())
            }
            _ => None,
        }
    }
}
