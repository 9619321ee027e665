#![warn(clippy::pedantic)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::cast_possible_truncation,
    clippy::too_many_lines
)]

//! Federated learning trial orchestrator.
//!
//! Runs a coordinator and its participants on remote machines, pods, or the
//! local host, follows training through the coordinator's log, retrieves logs
//! and metrics, and always tears everything down.

pub mod allocation;
pub mod backend;
pub mod config;
pub mod postprocess;
pub mod progress;
pub mod scheduler;
pub mod stager;
pub mod state;
pub mod trial;

pub use backend::{ExecutionBackend, KubeBackend, LocalBackend, SshBackend};
pub use config::{ExperimentConfig, FedrunConfig};
pub use progress::{ProgressState, ProgressTracker};
pub use scheduler::Scheduler;
pub use state::{RunState, StateManager, TrialStatus};
pub use trial::{TrialOrchestrator, TrialOutcome, TrialPlan};
