//! Trial state tracking and persistence.
//!
//! Tracks the status of every trial of every experiment and persists it to
//! JSON so `fedrun status` can report on a run in progress or after a crash.

use std::{
    collections::BTreeMap,
    fs::File,
    io::{BufReader, BufWriter, Seek, SeekFrom},
    path::Path,
};

use fs2::FileExt;
use serde::{Deserialize, Serialize};

/// Status of a trial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrialStatus {
    /// Trial has not started yet.
    Pending,
    /// Trial is currently executing.
    Running,
    /// Coordinator reported training finished and exited cleanly.
    Completed,
    /// Any step failed.
    Failed,
}

impl TrialStatus {
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }
}

/// State of a single trial.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrialState {
    /// Current status.
    pub status: TrialStatus,
    /// Coordinator target name.
    #[serde(default)]
    pub coordinator: Option<String>,
    /// Participant target names, by index.
    #[serde(default)]
    pub participants: Vec<String>,
    /// Local trial directory with retrieved logs.
    #[serde(default)]
    pub local_dir: Option<String>,
    /// Completed training rounds observed.
    #[serde(default)]
    pub rounds: usize,
    /// Error messages from failures.
    #[serde(default)]
    pub errors: Vec<String>,
    /// Timestamp when trial started.
    pub started_at: Option<String>,
    /// Timestamp when trial completed/failed.
    pub finished_at: Option<String>,
}

impl Default for TrialState {
    fn default() -> Self {
        Self {
            status: TrialStatus::Pending,
            coordinator: None,
            participants: Vec::new(),
            local_dir: None,
            rounds: 0,
            errors: Vec::new(),
            started_at: None,
            finished_at: None,
        }
    }
}

/// State of one experiment's latest execution.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExperimentState {
    /// `{name}-{timestamp}`.
    #[serde(default)]
    pub experiment_id: Option<String>,
    #[serde(default)]
    pub experiment_dir: Option<String>,
    /// Trials keyed by trial number (1-based).
    #[serde(default)]
    pub trials: BTreeMap<usize, TrialState>,
}

impl ExperimentState {
    #[must_use]
    pub fn count(&self, status: TrialStatus) -> usize {
        self.trials.values().filter(|t| t.status == status).count()
    }
}

/// Persistent state for all experiments.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RunState {
    /// State of each experiment, keyed by experiment name.
    pub experiments: BTreeMap<String, ExperimentState>,
    /// Version for future compatibility.
    #[serde(default = "default_version")]
    pub version: u32,
}

fn default_version() -> u32 {
    1
}

/// Manages state persistence with file locking.
#[derive(Debug, Clone)]
pub struct StateManager {
    /// Path to the state file.
    pub path: std::path::PathBuf,
}

impl StateManager {
    /// Create a new state manager for the given path.
    #[must_use]
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Load state from file, or create empty state if file doesn't exist.
    pub fn load(&self) -> Result<RunState, StateError> {
        if !self.path.exists() {
            return Ok(RunState::default());
        }

        let file = File::open(&self.path).map_err(|e| StateError::Io(self.path.clone(), e))?;
        file.lock_shared()
            .map_err(|e| StateError::Lock(self.path.clone(), e))?;

        let reader = BufReader::new(&file);
        let state = serde_json::from_reader(reader)
            .map_err(|e| StateError::Parse(self.path.clone(), e.to_string()))?;

        file.unlock()
            .map_err(|e| StateError::Lock(self.path.clone(), e))?;

        Ok(state)
    }

    /// Update state atomically with a closure (holds lock for entire operation).
    pub fn update<F>(&self, f: F) -> Result<RunState, StateError>
    where
        F: FnOnce(&mut RunState),
    {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StateError::Io(parent.to_path_buf(), e))?;
        }

        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)
            .map_err(|e| StateError::Io(self.path.clone(), e))?;

        // Hold exclusive lock for entire operation
        file.lock_exclusive()
            .map_err(|e| StateError::Lock(self.path.clone(), e))?;

        let mut state: RunState = if file.metadata().map(|m| m.len()).unwrap_or(0) > 0 {
            let reader = BufReader::new(&file);
            serde_json::from_reader(reader)
                .map_err(|e| StateError::Parse(self.path.clone(), e.to_string()))?
        } else {
            RunState::default()
        };

        f(&mut state);

        file.set_len(0)
            .map_err(|e| StateError::Io(self.path.clone(), e))?;
        (&file)
            .seek(SeekFrom::Start(0))
            .map_err(|e| StateError::Io(self.path.clone(), e))?;

        let writer = BufWriter::new(&file);
        serde_json::to_writer_pretty(writer, &state)
            .map_err(|e| StateError::Write(self.path.clone(), e.to_string()))?;

        file.unlock()
            .map_err(|e| StateError::Lock(self.path.clone(), e))?;

        Ok(state)
    }

    /// Start a fresh execution of an experiment with `n_trials` pending trials.
    pub fn initialize_experiment(
        &self,
        name: &str,
        experiment_id: &str,
        experiment_dir: &Path,
        n_trials: usize,
    ) -> Result<(), StateError> {
        self.update(|state| {
            state.experiments.insert(
                name.to_string(),
                ExperimentState {
                    experiment_id: Some(experiment_id.to_string()),
                    experiment_dir: Some(experiment_dir.display().to_string()),
                    trials: (1..=n_trials).map(|t| (t, TrialState::default())).collect(),
                },
            );
        })?;
        Ok(())
    }

    /// Mark a trial as running on the given targets.
    pub fn mark_trial_started(
        &self,
        name: &str,
        trial: usize,
        coordinator: &str,
        participants: &[String],
        local_dir: &Path,
    ) -> Result<(), StateError> {
        self.with_trial(name, trial, |t| {
            t.status = TrialStatus::Running;
            t.coordinator = Some(coordinator.to_string());
            t.participants = participants.to_vec();
            t.local_dir = Some(local_dir.display().to_string());
            t.started_at = Some(now_timestamp());
        })
    }

    /// Mark a trial as completed.
    pub fn mark_trial_completed(
        &self,
        name: &str,
        trial: usize,
        rounds: usize,
    ) -> Result<(), StateError> {
        self.with_trial(name, trial, |t| {
            t.status = TrialStatus::Completed;
            t.rounds = rounds;
            t.finished_at = Some(now_timestamp());
        })
    }

    /// Mark a trial as failed.
    pub fn mark_trial_failed(
        &self,
        name: &str,
        trial: usize,
        error: &str,
        rounds: usize,
    ) -> Result<(), StateError> {
        self.with_trial(name, trial, |t| {
            t.status = TrialStatus::Failed;
            t.rounds = rounds;
            t.errors.push(error.to_string());
            t.finished_at = Some(now_timestamp());
        })
    }

    /// Fail trials left running by an orchestrator that died mid-trial.
    pub fn recover_interrupted(&self) -> Result<Vec<String>, StateError> {
        let mut interrupted = Vec::new();

        self.update(|state| {
            for (name, experiment) in &mut state.experiments {
                for (number, trial) in &mut experiment.trials {
                    if trial.status == TrialStatus::Running {
                        trial.status = TrialStatus::Failed;
                        trial
                            .errors
                            .push("Orchestrator exited while the trial was running".to_string());
                        interrupted.push(format!("{name}/trial{number}"));
                    }
                }
            }
        })?;

        Ok(interrupted)
    }

    fn with_trial(
        &self,
        name: &str,
        trial: usize,
        f: impl FnOnce(&mut TrialState),
    ) -> Result<(), StateError> {
        self.update(|state| {
            let trial = state
                .experiments
                .entry(name.to_string())
                .or_default()
                .trials
                .entry(trial)
                .or_default();
            f(trial);
        })?;
        Ok(())
    }
}

/// Get current local time as a display timestamp.
#[must_use]
pub fn now_timestamp() -> String {
    chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Errors that can occur with state management.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("failed to read/write state file {0}: {1}")]
    Io(std::path::PathBuf, std::io::Error),
    #[error("failed to lock state file {0}: {1}")]
    Lock(std::path::PathBuf, std::io::Error),
    #[error("failed to parse state file {0}: {1}")]
    Parse(std::path::PathBuf, String),
    #[error("failed to write state file {0}: {1}")]
    Write(std::path::PathBuf, String),
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn test_trial_lifecycle() {
        let dir = tempdir().unwrap();
        let manager = StateManager::new(dir.path().join("state.json"));

        manager
            .initialize_experiment("e1", "e1-20260101-000000", dir.path(), 2)
            .unwrap();
        manager
            .mark_trial_started(
                "e1",
                1,
                "agg",
                &["p1".to_string(), "p2".to_string()],
                &dir.path().join("trial1"),
            )
            .unwrap();
        manager.mark_trial_completed("e1", 1, 3).unwrap();
        manager.mark_trial_failed("e1", 2, "ready timeout", 0).unwrap();

        let state = manager.load().unwrap();
        let experiment = &state.experiments["e1"];
        assert_eq!(experiment.trials[&1].status, TrialStatus::Completed);
        assert_eq!(experiment.trials[&1].rounds, 3);
        assert_eq!(experiment.trials[&1].participants, ["p1", "p2"]);
        assert_eq!(experiment.trials[&2].errors, ["ready timeout"]);
        assert_eq!(experiment.count(TrialStatus::Failed), 1);
    }

    #[test]
    fn test_recover_interrupted() {
        let dir = tempdir().unwrap();
        let manager = StateManager::new(dir.path().join("nested/state.json"));
        manager
            .initialize_experiment("e1", "e1-ts", dir.path(), 2)
            .unwrap();
        manager
            .mark_trial_started("e1", 2, "agg", &[], dir.path())
            .unwrap();

        assert_eq!(manager.recover_interrupted().unwrap(), ["e1/trial2"]);
        let state = manager.load().unwrap();
        assert_eq!(state.experiments["e1"].trials[&2].status, TrialStatus::Failed);
        assert_eq!(state.experiments["e1"].trials[&1].status, TrialStatus::Pending);
    }

    #[test]
    fn test_initialize_replaces_previous_execution() {
        let dir = tempdir().unwrap();
        let manager = StateManager::new(dir.path().join("state.json"));
        manager.initialize_experiment("e1", "old", dir.path(), 3).unwrap();
        manager.mark_trial_failed("e1", 1, "boom", 0).unwrap();
        manager.initialize_experiment("e1", "new", dir.path(), 1).unwrap();

        let state = manager.load().unwrap();
        let experiment = &state.experiments["e1"];
        assert_eq!(experiment.experiment_id.as_deref(), Some("new"));
        assert_eq!(experiment.trials.len(), 1);
        assert_eq!(experiment.count(TrialStatus::Pending), 1);
    }
}
