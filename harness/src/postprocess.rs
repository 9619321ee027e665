//! Post-processing hook run after an experiment's trials.
//!
//! The hook is an external command. It receives a metrics path template,
//! `{experiment_dir}/trial${trial}/<metrics file>` with `party0` replaced by
//! `party${id}`, which it expands once per trial and participant.

use std::path::{Path, PathBuf};

use tokio::process::Command;

use crate::config::HookConfig;

/// Metrics path template for one experiment.
///
/// `metrics_file` is the name of participant 0's retrieved metrics file.
#[must_use]
pub fn metrics_template(experiment_dir: &Path, metrics_file: &str) -> String {
    format!(
        "{}/trial${{trial}}/{}",
        experiment_dir.display(),
        metrics_file.replace("party0", "party${id}")
    )
}

/// Everything a hook is told about the experiment it runs after.
#[derive(Debug, Clone)]
pub struct HookInvocation {
    pub name: String,
    pub experiment_dir: PathBuf,
    pub metrics_template: String,
    pub n_trials: usize,
    pub n_parties: usize,
}

impl HookInvocation {
    fn expand(&self, arg: &str) -> String {
        arg.replace("{metrics}", &self.metrics_template)
            .replace("{n_trials}", &self.n_trials.to_string())
            .replace("{n_parties}", &self.n_parties.to_string())
            .replace("{experiment_dir}", &self.experiment_dir.display().to_string())
            .replace("{name}", &self.name)
    }

    fn command(&self, hook: &HookConfig) -> Command {
        let mut cmd = Command::new(&hook.command);
        cmd.args(hook.args.iter().map(|a| self.expand(a)))
            .current_dir(&self.experiment_dir)
            .env("FEDRUN_EXPERIMENT", &self.name)
            .env("FEDRUN_EXPERIMENT_DIR", &self.experiment_dir)
            .env("FEDRUN_METRICS", &self.metrics_template)
            .env("FEDRUN_N_TRIALS", self.n_trials.to_string())
            .env("FEDRUN_N_PARTIES", self.n_parties.to_string());
        cmd
    }
}

/// Run the hook to completion.
pub async fn run_hook(hook: &HookConfig, invocation: &HookInvocation) -> Result<(), HookError> {
    let mut cmd = invocation.command(hook);
    tracing::info!("Running post-processing hook for {}", invocation.name);
    tracing::debug!("{cmd:?}");
    let status = cmd
        .status()
        .await
        .map_err(|e| HookError::Spawn(hook.command.clone(), e))?;
    if status.success() {
        Ok(())
    } else {
        Err(HookError::Failed {
            command: hook.command.clone(),
            code: status.code(),
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HookError {
    #[error("failed to start hook '{0}': {1}")]
    Spawn(String, std::io::Error),
    #[error("hook '{command}' exited with {code:?}")]
    Failed { command: String, code: Option<i32> },
}
