//! Experiment scheduling: allocation, trial sequencing and parallel experiments.

use std::{
    collections::{HashMap, HashSet},
    path::{Path, PathBuf},
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use fedrun_config::{ConfigDocument, ConfigTemplate, DocumentError, Role, TemplateError, TemplateVars};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use tokio::{
    sync::{Notify, Semaphore, watch},
    task::JoinSet,
};

use crate::{
    allocation::{PartyAllocator, cluster_assignment},
    backend::{ExecutionBackend, Target},
    config::{BackendKind, ExecMode, ExperimentConfig, FedrunConfig},
    postprocess::{HookInvocation, metrics_template, run_hook},
    progress::ProgressUpdate,
    state::{StateError, StateManager},
    trial::{RoleAssignment, TrialOrchestrator, TrialOutcome, TrialPlan, TrialSettings},
};

/// Targets of one trial.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrialAssignment {
    /// 1-based trial number.
    pub trial: usize,
    pub coordinator: Target,
    /// One target per participant index.
    pub participants: Vec<Target>,
}

impl TrialAssignment {
    /// Distinct target names, coordinator first.
    #[must_use]
    pub fn target_names(&self) -> Vec<String> {
        let mut names = Vec::new();
        for target in std::iter::once(&self.coordinator).chain(&self.participants) {
            if !names.contains(&target.name) {
                names.push(target.name.clone());
            }
        }
        names
    }
}

/// Allocation for every trial of one experiment.
#[derive(Debug, Clone)]
pub struct ExperimentPlan {
    pub experiment: ExperimentConfig,
    pub trials: Vec<TrialAssignment>,
}

/// Outcome of one experiment.
#[derive(Debug, Clone)]
pub struct ExperimentResult {
    pub name: String,
    pub experiment_dir: Option<PathBuf>,
    pub completed: usize,
    pub failed: usize,
}

/// Result of a scheduler run.
#[derive(Debug)]
pub struct SchedulerResult {
    /// Total number of trials.
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub experiments: Vec<ExperimentResult>,
}

impl SchedulerResult {
    #[must_use]
    pub fn all_completed(&self) -> bool {
        self.failed == 0 && self.completed == self.total
    }
}

/// Exclusive claims on targets, so concurrent experiments never share one.
///
/// A trial's targets are taken all at once or not at all.
#[derive(Debug, Default)]
pub struct TargetLeases {
    held: Mutex<HashSet<String>>,
    released: Notify,
}

/// Held targets, released on drop.
#[derive(Debug)]
pub struct Lease {
    leases: Arc<TargetLeases>,
    names: Vec<String>,
}

impl TargetLeases {
    /// Wait until every named target is free, then hold them all.
    pub async fn acquire(self: &Arc<Self>, names: Vec<String>) -> Lease {
        loop {
            let released = self.released.notified();
            if self.try_take(&names) {
                return Lease {
                    leases: Arc::clone(self),
                    names,
                };
            }
            tracing::debug!("Waiting for targets {names:?}");
            released.await;
        }
    }

    fn try_take(&self, names: &[String]) -> bool {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        if names.iter().any(|n| held.contains(n)) {
            return false;
        }
        held.extend(names.iter().cloned());
        true
    }

    #[must_use]
    pub fn is_held(&self, name: &str) -> bool {
        self.held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(name)
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        {
            let mut held = self
                .leases
                .held
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            for name in &self.names {
                held.remove(name);
            }
        }
        self.leases.released.notify_waiters();
    }
}

/// Runs every configured experiment.
#[derive(Clone)]
pub struct Scheduler {
    config: Arc<FedrunConfig>,
    backend: Arc<dyn ExecutionBackend>,
    state: StateManager,
    leases: Arc<TargetLeases>,
    multi: MultiProgress,
}

impl Scheduler {
    #[must_use]
    pub fn new(
        config: FedrunConfig,
        backend: Arc<dyn ExecutionBackend>,
        state: StateManager,
    ) -> Self {
        Self {
            config: Arc::new(config),
            backend,
            state,
            leases: Arc::new(TargetLeases::default()),
            multi: MultiProgress::new(),
        }
    }

    /// Draw progress bars into `multi` instead of a private one.
    #[must_use]
    pub fn with_progress(mut self, multi: MultiProgress) -> Self {
        self.multi = multi;
        self
    }

    #[must_use]
    pub fn state_manager(&self) -> &StateManager {
        &self.state
    }

    /// Role to target assignment for every trial of every experiment.
    pub fn plan(&self) -> Result<Vec<ExperimentPlan>, SchedulerError> {
        self.config
            .experiments
            .iter()
            .map(|experiment| {
                Ok(ExperimentPlan {
                    experiment: experiment.clone(),
                    trials: self.allocate(experiment)?,
                })
            })
            .collect()
    }

    fn allocate(&self, experiment: &ExperimentConfig) -> Result<Vec<TrialAssignment>, SchedulerError> {
        let n = experiment.n_parties;
        let trials = 1..=experiment.n_trials;

        if self.config.harness.backend == BackendKind::Kube {
            let clusters = self
                .config
                .kube
                .as_ref()
                .map(|k| k.clusters.as_slice())
                .unwrap_or_default();
            let Some(first) = clusters.first() else {
                return Err(SchedulerError::NoTargets(experiment.name.clone()));
            };
            let by_name: HashMap<&str, Target> =
                clusters.iter().map(|c| (c.name.as_str(), c.target())).collect();
            let names: Vec<String> = clusters.iter().map(|c| c.name.clone()).collect();
            let participants: Vec<Target> = cluster_assignment(n, &names)
                .iter()
                .filter_map(|name| by_name.get(name.as_str()).cloned())
                .collect();
            return Ok(trials
                .map(|trial| TrialAssignment {
                    trial,
                    coordinator: first.target(),
                    participants: participants.clone(),
                })
                .collect());
        }

        let coordinator = match &experiment.agg_machine {
            Some(label) => self.machine(experiment, label)?,
            None => local_target(),
        };
        if experiment.party_machines.is_empty() {
            return Ok(trials
                .map(|trial| TrialAssignment {
                    trial,
                    coordinator: coordinator.clone(),
                    participants: vec![local_target(); n],
                })
                .collect());
        }

        let seed = self.config.harness.shuffle_seed.unwrap_or_else(rand::random);
        let mut allocator = PartyAllocator::new(
            experiment.party_machines.clone(),
            n,
            experiment.shuffle_party_machines,
            seed,
        );
        trials
            .map(|trial| {
                let participants = allocator
                    .next_trial()
                    .iter()
                    .map(|label| self.machine(experiment, label))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(TrialAssignment {
                    trial,
                    coordinator: coordinator.clone(),
                    participants,
                })
            })
            .collect()
    }

    fn machine(&self, experiment: &ExperimentConfig, label: &str) -> Result<Target, SchedulerError> {
        self.config
            .machines
            .get(label)
            .cloned()
            .ok_or_else(|| SchedulerError::UnknownMachine(experiment.name.clone(), label.to_string()))
    }

    fn trial_settings(&self) -> TrialSettings {
        let harness = &self.config.harness;
        TrialSettings {
            poll_interval: Duration::from_secs(harness.poll_interval_secs),
            ready_timeout: Duration::from_secs(harness.ready_timeout_secs),
            trial_timeout: Duration::from_secs(harness.trial_timeout_secs),
            exit_grace: Duration::from_secs(harness.exit_grace_secs),
            markers: harness.markers.clone(),
            bind_endpoints: harness.backend == BackendKind::Kube,
            service_port: self
                .config
                .kube
                .as_ref()
                .map_or(5000, |k| k.settings.service_port),
        }
    }

    /// Run every experiment; trials within an experiment run one after another.
    pub async fn run(&self) -> Result<SchedulerResult, SchedulerError> {
        let interrupted = self.state.recover_interrupted()?;
        if !interrupted.is_empty() {
            tracing::info!(
                "Marked {} interrupted trials as failed: {:?}",
                interrupted.len(),
                interrupted
            );
        }

        let plans = self.plan()?;
        let total = plans.iter().map(|p| p.trials.len()).sum();
        let mut experiments = Vec::with_capacity(plans.len());

        match self.config.harness.exec_mode {
            ExecMode::Seq => {
                for plan in plans {
                    experiments.push(self.run_experiment(plan).await);
                }
            }
            ExecMode::Parallel => {
                let permits = Arc::new(Semaphore::new(self.config.harness.max_concurrency));
                let mut running = JoinSet::new();
                for plan in plans {
                    let scheduler = self.clone();
                    let permits = Arc::clone(&permits);
                    running.spawn(async move {
                        let _permit = permits.acquire_owned().await;
                        scheduler.run_experiment(plan).await
                    });
                }
                while let Some(joined) = running.join_next().await {
                    experiments.push(joined.map_err(|e| SchedulerError::Join(e.to_string()))?);
                }
            }
        }

        Ok(SchedulerResult {
            total,
            completed: experiments.iter().map(|e| e.completed).sum(),
            failed: experiments.iter().map(|e| e.failed).sum(),
            experiments,
        })
    }

    async fn run_experiment(&self, plan: ExperimentPlan) -> ExperimentResult {
        let name = plan.experiment.name.clone();
        match self.try_run_experiment(&plan).await {
            Ok(result) => result,
            Err(e) => {
                tracing::error!("Experiment {name} could not start: {e}");
                ExperimentResult {
                    name,
                    experiment_dir: None,
                    completed: 0,
                    failed: plan.trials.len(),
                }
            }
        }
    }

    async fn try_run_experiment(&self, plan: &ExperimentPlan) -> Result<ExperimentResult, SchedulerError> {
        let experiment = &plan.experiment;
        let ts = chrono::Local::now().format("%Y%m%d-%H%M%S").to_string();
        let run = ExperimentRun {
            id: format!("{}-{ts}", experiment.name),
            dir: experiment
                .local_staging_dir
                .join(format!("{}-{ts}", experiment.name)),
            ts,
        };
        std::fs::create_dir_all(&run.dir).map_err(|e| SchedulerError::Io(run.dir.clone(), e))?;
        link_latest(&experiment.local_staging_dir, &run.id);
        self.state
            .initialize_experiment(&experiment.name, &run.id, &run.dir, plan.trials.len())?;
        tracing::info!(
            "Experiment {}: {} trials, {} participants, results in {}",
            experiment.name,
            plan.trials.len(),
            experiment.n_parties,
            run.dir.display()
        );

        let orchestrator = TrialOrchestrator::new(Arc::clone(&self.backend), self.trial_settings());
        let mut result = ExperimentResult {
            name: experiment.name.clone(),
            experiment_dir: Some(run.dir.clone()),
            completed: 0,
            failed: 0,
        };
        let mut metrics_file = None;
        for assignment in &plan.trials {
            match self.run_trial(&orchestrator, experiment, &run, assignment).await {
                Some(outcome) if outcome.succeeded() => {
                    result.completed += 1;
                    if metrics_file.is_none() {
                        metrics_file = outcome
                            .metrics
                            .first()
                            .and_then(|p| p.file_name())
                            .map(|n| n.to_string_lossy().to_string());
                    }
                }
                _ => result.failed += 1,
            }
        }

        if let Some(hook) = &experiment.postprocess {
            match metrics_file {
                Some(file) => {
                    let invocation = HookInvocation {
                        name: experiment.name.clone(),
                        experiment_dir: run.dir.clone(),
                        metrics_template: metrics_template(&run.dir, &file),
                        n_trials: plan.trials.len(),
                        n_parties: experiment.n_parties,
                    };
                    if let Err(e) = run_hook(hook, &invocation).await {
                        tracing::warn!("Post-processing for {} failed: {e}", experiment.name);
                    }
                }
                None => tracing::warn!(
                    "No metrics retrieved for {}; skipping post-processing",
                    experiment.name
                ),
            }
        }
        Ok(result)
    }

    /// Run one trial. `None` when the trial could not be planned.
    async fn run_trial(
        &self,
        orchestrator: &TrialOrchestrator,
        experiment: &ExperimentConfig,
        run: &ExperimentRun,
        assignment: &TrialAssignment,
    ) -> Option<TrialOutcome> {
        let trial = assignment.trial;
        let local_dir = run.dir.join(format!("trial{trial}"));

        let _lease = if self.backend.targets_are_exclusive() {
            Some(self.leases.acquire(assignment.target_names()).await)
        } else {
            None
        };

        let plan = match self.trial_plan(experiment, run, assignment, &local_dir) {
            Ok(plan) => plan,
            Err(e) => {
                tracing::error!("{} trial {trial} failed: {e}", experiment.name);
                self.record(|s| s.mark_trial_failed(&experiment.name, trial, &e.to_string(), 0));
                return None;
            }
        };
        let participants: Vec<String> = assignment.participants.iter().map(|t| t.name.clone()).collect();
        self.record(|s| {
            s.mark_trial_started(
                &experiment.name,
                trial,
                &assignment.coordinator.name,
                &participants,
                &local_dir,
            )
        });

        let total_rounds = plan
            .coordinator
            .document
            .validate(Role::Coordinator)
            .ok()
            .and_then(|s| s.rounds)
            .or(experiment.rounds)
            .unwrap_or(0);
        let label = format!("{} t{trial}", experiment.name);
        let pb = self.progress_bar(&label, total_rounds);
        let (progress_tx, progress_rx) = watch::channel(ProgressUpdate::default());
        tokio::spawn(follow_progress(
            pb.clone(),
            progress_rx,
            label.clone(),
            experiment.n_parties,
        ));

        let outcome = orchestrator.run(plan, Some(progress_tx)).await;

        match &outcome.error {
            None => {
                pb.finish_with_message(format!("{label:20}: completed ({} rounds)", outcome.rounds));
                tracing::info!("{label} completed after {} rounds", outcome.rounds);
                self.record(|s| s.mark_trial_completed(&experiment.name, trial, outcome.rounds));
            }
            Some(error) => {
                pb.abandon_with_message(format!("{label:20}: failed"));
                if outcome.retrieved.is_empty() {
                    tracing::error!("{label} failed: {error}");
                } else {
                    tracing::error!(
                        "{label} failed: {error} (partial logs in {})",
                        outcome.local_dir.display()
                    );
                }
                self.record(|s| {
                    s.mark_trial_failed(&experiment.name, trial, &error.to_string(), outcome.rounds)
                });
            }
        }
        Some(outcome)
    }

    /// State file updates are bookkeeping; a failure is logged, not fatal.
    fn record(&self, f: impl FnOnce(&StateManager) -> Result<(), StateError>) {
        if let Err(e) = f(&self.state) {
            tracing::warn!("Failed to update state file: {e}");
        }
    }

    fn progress_bar(&self, label: &str, total_rounds: usize) -> ProgressBar {
        let pb = self.multi.add(ProgressBar::new(total_rounds as u64));
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] {msg:42} [{wide_bar:.cyan/blue}] {pos:>3}/{len:3}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("#*-"),
        );
        pb.set_message(format!("{label:20}: staging"));
        pb.enable_steady_tick(Duration::from_millis(100));
        pb
    }

    fn trial_plan(
        &self,
        experiment: &ExperimentConfig,
        run: &ExperimentRun,
        assignment: &TrialAssignment,
        local_dir: &Path,
    ) -> Result<TrialPlan, SchedulerError> {
        let mut vars = TemplateVars::new();
        vars.insert("agg_ip".into(), host_of(&assignment.coordinator).to_string());
        vars.insert("agg_port".into(), experiment.agg_port.to_string());
        vars.insert("n_parties".into(), experiment.n_parties.to_string());
        vars.insert("ts".into(), run.ts.clone());
        if let Some(rounds) = experiment.rounds {
            vars.insert("n_rounds".into(), rounds.to_string());
        }

        let coordinator = self.role_assignment(
            experiment,
            run,
            assignment.trial,
            Role::Coordinator,
            &assignment.coordinator,
            vars.clone(),
        )?;
        let participants = assignment
            .participants
            .iter()
            .enumerate()
            .map(|(index, target)| {
                let mut vars = vars.clone();
                vars.insert("id".into(), index.to_string());
                vars.insert("party_ip".into(), host_of(target).to_string());
                vars.insert(
                    "party_port".into(),
                    (usize::from(experiment.party_port_base) + index).to_string(),
                );
                self.role_assignment(
                    experiment,
                    run,
                    assignment.trial,
                    Role::Participant(index),
                    target,
                    vars,
                )
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(TrialPlan {
            experiment: experiment.name.clone(),
            experiment_id: run.id.clone(),
            trial: assignment.trial,
            timestamp: run.ts.clone(),
            local_dir: local_dir.to_path_buf(),
            generated_dir: experiment
                .generated_dir
                .clone()
                .or_else(|| experiment.config_dir.clone()),
            dataset_roots: experiment.dataset_roots.clone(),
            coordinator,
            participants,
        })
    }

    fn role_assignment(
        &self,
        experiment: &ExperimentConfig,
        run: &ExperimentRun,
        trial: usize,
        role: Role,
        target: &Target,
        mut vars: TemplateVars,
    ) -> Result<RoleAssignment, SchedulerError> {
        let staging_dir = format!(
            "{}/{}/trial{trial}/{}",
            target.staging_dir.trim_end_matches('/'),
            run.id,
            role.tag()
        );
        vars.insert("staging_dir".into(), staging_dir.clone());
        vars.insert(
            "work_dir".into(),
            target.work_dir.clone().unwrap_or_else(|| staging_dir.clone()),
        );

        let document = if let Some(templates) = &experiment.templates {
            let path = if role.is_coordinator() {
                &templates.coordinator
            } else {
                &templates.participant
            };
            ConfigTemplate::load(path)?.render(&vars, true)?
        } else if let Some(dir) = experiment.document_dir() {
            ConfigDocument::load(dir.join(role.config_file_name()))?
        } else {
            return Err(SchedulerError::NoDocuments(experiment.name.clone()));
        };

        Ok(RoleAssignment {
            role,
            target: target.clone(),
            document,
            command: experiment.launch_command(role, &staging_dir),
            commands: experiment.commands_for(role).to_vec(),
            staging_dir,
        })
    }
}

/// Identity of one execution of an experiment.
struct ExperimentRun {
    /// `{name}-{ts}`.
    id: String,
    ts: String,
    dir: PathBuf,
}

async fn follow_progress(
    pb: ProgressBar,
    mut rx: watch::Receiver<ProgressUpdate>,
    label: String,
    n_parties: usize,
) {
    while rx.changed().await.is_ok() {
        let p = rx.borrow_and_update().clone();
        pb.set_position(p.round as u64);
        pb.set_message(format!(
            "{label:20}: {:>13} ({}/{n_parties} parties)",
            format!("{:?}", p.state).to_lowercase(),
            p.party_responses
        ));
    }
}

fn local_target() -> Target {
    Target {
        name: "localhost".to_string(),
        address: "127.0.0.1".to_string(),
        staging_dir: "/tmp/fedrun".to_string(),
        ..Target::default()
    }
}

fn host_of(target: &Target) -> &str {
    if target.address.is_empty() {
        "127.0.0.1"
    } else {
        &target.address
    }
}

/// Point `{root}/latest` at the newest experiment directory.
///
/// The link is created under a per-experiment name and renamed over
/// `latest`, so concurrent experiments never observe it missing.
fn link_latest(root: &Path, experiment_id: &str) {
    #[cfg(unix)]
    {
        let link = root.join("latest");
        let staged = root.join(format!(".latest-{experiment_id}"));
        let _ = std::fs::remove_file(&staged);
        if let Err(e) = std::os::unix::fs::symlink(experiment_id, &staged)
            .and_then(|()| std::fs::rename(&staged, &link))
        {
            tracing::warn!("Failed to link {}: {e}", link.display());
            let _ = std::fs::remove_file(&staged);
        }
    }
    #[cfg(not(unix))]
    let _ = (root, experiment_id);
}

/// Errors that can occur during scheduling.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("state error: {0}")]
    State(#[from] StateError),
    #[error("failed to create {0}: {1}")]
    Io(PathBuf, std::io::Error),
    #[error("experiment {0}: unknown machine '{1}'")]
    UnknownMachine(String, String),
    #[error("experiment {0}: no targets available")]
    NoTargets(String),
    #[error("experiment {0}: no document source")]
    NoDocuments(String),
    #[error("document: {0}")]
    Document(#[from] DocumentError),
    #[error("template: {0}")]
    Template(#[from] TemplateError),
    #[error("experiment task failed: {0}")]
    Join(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_leases_are_exclusive_until_dropped() {
        let leases = Arc::new(TargetLeases::default());
        let first = leases
            .acquire(vec!["m1".to_string(), "m2".to_string()])
            .await;
        assert!(leases.is_held("m1"));

        let waiter = {
            let leases = Arc::clone(&leases);
            tokio::spawn(async move { leases.acquire(vec!["m2".to_string()]).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        drop(first);
        let second = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(leases.is_held("m2"));
        assert!(!leases.is_held("m1"));
        drop(second);
        assert!(!leases.is_held("m2"));
    }

    #[test]
    fn test_target_names_are_distinct() {
        let t = |name: &str| Target {
            name: name.to_string(),
            ..Target::default()
        };
        let assignment = TrialAssignment {
            trial: 1,
            coordinator: t("m1"),
            participants: vec![t("m2"), t("m1"), t("m2")],
        };
        assert_eq!(assignment.target_names(), vec!["m1", "m2"]);
    }

    #[cfg(unix)]
    #[test]
    fn test_latest_link_is_replaced_in_place() {
        let root = tempfile::tempdir().unwrap();
        link_latest(root.path(), "fedavg-20260101-000000");
        link_latest(root.path(), "fedavg-20260102-000000");

        let link = root.path().join("latest");
        assert_eq!(
            std::fs::read_link(&link).unwrap(),
            PathBuf::from("fedavg-20260102-000000")
        );
        let leftovers: Vec<_> = std::fs::read_dir(root.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .filter(|n| n != "latest")
            .collect();
        assert!(leftovers.is_empty(), "{leftovers:?}");
    }
}
