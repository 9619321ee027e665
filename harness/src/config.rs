//! Orchestrator configuration (`fedrun.toml`).
//!
//! `[defaults]` is merged into every `[[experiments]]` entry and
//! `[machines.default]` into every other machine, the experiment or machine
//! value winning. Everything is validated at load so a bad config fails
//! before any target is touched.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use fedrun_config::{ControlToken, Role};
use serde::{Deserialize, Serialize};

use crate::{
    backend::{KubeSettings, Target},
    progress::MarkerSettings,
    stager::DatasetRoot,
};

/// Machine entry other machines fall back to.
pub const DEFAULT_MACHINE: &str = "default";

/// Top-level configuration loaded from TOML (raw, before merging).
#[derive(Debug, Clone, Deserialize)]
struct RawFedrunConfig {
    #[serde(default)]
    pub harness: HarnessSettings,
    #[serde(default = "empty_table")]
    pub defaults: toml::Value,
    #[serde(default)]
    pub machines: BTreeMap<String, toml::Value>,
    #[serde(default)]
    pub kube: Option<KubeConfig>,
    #[serde(default)]
    pub experiments: Vec<toml::Value>,
}

fn empty_table() -> toml::Value {
    toml::Value::Table(toml::map::Map::new())
}

/// Top-level configuration after merging and validation.
#[derive(Debug, Clone)]
pub struct FedrunConfig {
    pub harness: HarnessSettings,
    /// Machine pool keyed by label, `default` already applied and removed.
    pub machines: BTreeMap<String, Target>,
    pub kube: Option<KubeConfig>,
    pub experiments: Vec<ExperimentConfig>,
}

/// Orchestrator-level settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarnessSettings {
    #[serde(default)]
    pub backend: BackendKind,
    #[serde(default)]
    pub exec_mode: ExecMode,
    /// Experiments run at once when `exec_mode = "parallel"`.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Deadline for a worker to report running.
    #[serde(default = "default_ready_timeout")]
    pub ready_timeout_secs: u64,
    /// Deadline for a whole trial, from coordinator start to exit.
    #[serde(default = "default_trial_timeout")]
    pub trial_timeout_secs: u64,
    /// Time workers get to exit on their own after training finished.
    #[serde(default = "default_exit_grace")]
    pub exit_grace_secs: u64,
    /// SSH connect timeout.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_state_file")]
    pub state_file: String,
    /// Seed for shuffled machine allocation.
    #[serde(default)]
    pub shuffle_seed: Option<u64>,
    #[serde(default)]
    pub markers: MarkerSettings,
}

impl Default for HarnessSettings {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            exec_mode: ExecMode::default(),
            max_concurrency: default_max_concurrency(),
            poll_interval_secs: default_poll_interval(),
            ready_timeout_secs: default_ready_timeout(),
            trial_timeout_secs: default_trial_timeout(),
            exit_grace_secs: default_exit_grace(),
            connect_timeout_secs: default_connect_timeout(),
            state_file: default_state_file(),
            shuffle_seed: None,
            markers: MarkerSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Ssh,
    Kube,
    Local,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecMode {
    /// One experiment at a time.
    #[default]
    Seq,
    /// Up to `max_concurrency` experiments at once.
    Parallel,
}

/// Container backend settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KubeConfig {
    #[serde(flatten)]
    pub settings: KubeSettings,
    #[serde(default)]
    pub clusters: Vec<ClusterConfig>,
}

/// One cluster pods can be created in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub name: String,
    pub context: String,
    pub namespace: String,
    #[serde(default = "default_pod_staging_dir")]
    pub staging_dir: String,
    #[serde(default)]
    pub work_dir: Option<String>,
    #[serde(default)]
    pub env_setup: Option<String>,
}

impl ClusterConfig {
    #[must_use]
    pub fn target(&self) -> Target {
        Target {
            name: self.name.clone(),
            context: Some(self.context.clone()),
            namespace: Some(self.namespace.clone()),
            staging_dir: self.staging_dir.clone(),
            work_dir: self.work_dir.clone(),
            env_setup: self.env_setup.clone(),
            ..Target::default()
        }
    }
}

/// Template documents rendered per trial instead of pre-generated ones.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateFiles {
    pub coordinator: PathBuf,
    pub participant: PathBuf,
}

/// Control sequences per role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSettings {
    #[serde(default = "default_coordinator_commands")]
    pub coordinator: Vec<ControlToken>,
    #[serde(default = "default_participant_commands")]
    pub participant: Vec<ControlToken>,
}

impl Default for CommandSettings {
    fn default() -> Self {
        Self {
            coordinator: default_coordinator_commands(),
            participant: default_participant_commands(),
        }
    }
}

/// External command run after an experiment's trials.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookConfig {
    pub command: String,
    /// Arguments; `{metrics}`, `{n_trials}`, `{n_parties}`, `{experiment_dir}`
    /// and `{name}` are substituted.
    #[serde(default)]
    pub args: Vec<String>,
}

/// Configuration for one experiment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentConfig {
    pub name: String,
    #[serde(default = "default_n_trials")]
    pub n_trials: usize,
    pub n_parties: usize,
    /// Machine label for the coordinator.
    #[serde(default)]
    pub agg_machine: Option<String>,
    /// Machine labels participants are allocated from.
    #[serde(default)]
    pub party_machines: Vec<String>,
    #[serde(default)]
    pub shuffle_party_machines: bool,
    /// Local root for experiment directories.
    #[serde(default = "default_local_staging_dir")]
    pub local_staging_dir: PathBuf,
    /// Directory of generated artifacts; references under it are staged.
    #[serde(default)]
    pub generated_dir: Option<PathBuf>,
    /// Where `config_agg.yml` / `config_party{N}.yml` are read from.
    /// Defaults to `generated_dir`.
    #[serde(default)]
    pub config_dir: Option<PathBuf>,
    #[serde(default)]
    pub templates: Option<TemplateFiles>,
    /// Rounds passed to templates as `n_rounds`.
    #[serde(default)]
    pub rounds: Option<usize>,
    /// Coordinator port passed to templates as `agg_port`.
    #[serde(default = "default_agg_port")]
    pub agg_port: u16,
    /// Participant `i` gets `party_port_base + i` as `party_port`.
    #[serde(default = "default_party_port_base")]
    pub party_port_base: u16,
    #[serde(default)]
    pub dataset_roots: Vec<DatasetRoot>,
    #[serde(default)]
    pub commands: CommandSettings,
    /// Worker launch line; `{config}` is replaced by the staged document path.
    #[serde(default = "default_coordinator_command")]
    pub coordinator_command: String,
    #[serde(default = "default_participant_command")]
    pub participant_command: String,
    #[serde(default)]
    pub postprocess: Option<HookConfig>,
}

impl ExperimentConfig {
    /// Launch line for `role`, pointing at its staged document.
    #[must_use]
    pub fn launch_command(&self, role: Role, staging_dir: &str) -> String {
        let template = if role.is_coordinator() {
            &self.coordinator_command
        } else {
            &self.participant_command
        };
        let config = format!(
            "{}/{}",
            staging_dir.trim_end_matches('/'),
            role.config_file_name()
        );
        template.replace("{config}", &config)
    }

    #[must_use]
    pub fn commands_for(&self, role: Role) -> &[ControlToken] {
        if role.is_coordinator() {
            &self.commands.coordinator
        } else {
            &self.commands.participant
        }
    }

    /// Directory pre-generated documents are read from.
    #[must_use]
    pub fn document_dir(&self) -> Option<&Path> {
        self.config_dir.as_deref().or(self.generated_dir.as_deref())
    }
}

fn default_max_concurrency() -> usize {
    5
}

fn default_poll_interval() -> u64 {
    1
}

fn default_ready_timeout() -> u64 {
    600
}

fn default_trial_timeout() -> u64 {
    7200
}

fn default_exit_grace() -> u64 {
    30
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_state_file() -> String {
    "./fedrun_state.json".to_string()
}

fn default_pod_staging_dir() -> String {
    "/tmp/fedrun".to_string()
}

fn default_n_trials() -> usize {
    1
}

fn default_local_staging_dir() -> PathBuf {
    PathBuf::from("./experiments")
}

fn default_agg_port() -> u16 {
    5000
}

fn default_party_port_base() -> u16 {
    8085
}

fn default_coordinator_commands() -> Vec<ControlToken> {
    Role::Coordinator.default_commands()
}

fn default_participant_commands() -> Vec<ControlToken> {
    Role::Participant(0).default_commands()
}

fn default_coordinator_command() -> String {
    "python -m ibmfl.aggregator.aggregator {config}".to_string()
}

fn default_participant_command() -> String {
    "python -m ibmfl.party.party {config}".to_string()
}

/// Merge two TOML tables, with `overlay` values taking precedence.
fn merge_toml(base: &toml::Value, overlay: &toml::Value) -> toml::Value {
    match (base, overlay) {
        (toml::Value::Table(base_map), toml::Value::Table(overlay_map)) => {
            let mut merged = base_map.clone();
            for (k, v) in overlay_map {
                merged.insert(
                    k.clone(),
                    if let Some(base_v) = base_map.get(k) {
                        merge_toml(base_v, v)
                    } else {
                        v.clone()
                    },
                );
            }
            toml::Value::Table(merged)
        }
        (_, overlay) => overlay.clone(),
    }
}

impl FedrunConfig {
    /// Load configuration from a TOML file, merging defaults and validating.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Io(path.as_ref().display().to_string(), e))?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let raw: RawFedrunConfig =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;

        let fallback = raw
            .machines
            .get(DEFAULT_MACHINE)
            .cloned()
            .unwrap_or_else(empty_table);
        let machines = raw
            .machines
            .iter()
            .filter(|(label, _)| label.as_str() != DEFAULT_MACHINE)
            .map(|(label, value)| {
                let mut merged = merge_toml(&fallback, value);
                if let toml::Value::Table(ref mut t) = merged {
                    t.insert("name".into(), toml::Value::String(label.clone()));
                }
                let target: Target = merged.try_into().map_err(|e: toml::de::Error| {
                    ConfigError::Parse(format!("machine '{label}': {e}"))
                })?;
                Ok((label.clone(), target))
            })
            .collect::<Result<BTreeMap<_, _>, ConfigError>>()?;

        let experiments = raw
            .experiments
            .iter()
            .map(|value| {
                merge_toml(&raw.defaults, value)
                    .try_into()
                    .map_err(|e: toml::de::Error| ConfigError::Parse(e.to_string()))
            })
            .collect::<Result<Vec<ExperimentConfig>, _>>()?;

        let config = Self {
            harness: raw.harness,
            machines,
            kube: raw.kube,
            experiments,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.harness.max_concurrency == 0 {
            return Err(ConfigError::Invalid(
                "harness.max_concurrency must be at least 1".to_string(),
            ));
        }
        if self.harness.poll_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "harness.poll_interval_secs must be at least 1".to_string(),
            ));
        }
        if self.harness.backend == BackendKind::Kube
            && self.kube.as_ref().is_none_or(|k| k.clusters.is_empty())
        {
            return Err(ConfigError::Invalid(
                "the kube backend needs at least one [[kube.clusters]] entry".to_string(),
            ));
        }

        let mut names = std::collections::HashSet::new();
        for experiment in &self.experiments {
            let invalid = |msg: String| ConfigError::Experiment(experiment.name.clone(), msg);

            if !is_dns_label(&experiment.name) {
                return Err(invalid(
                    "name must be lowercase alphanumerics and '-', starting and ending alphanumeric"
                        .to_string(),
                ));
            }
            if !names.insert(experiment.name.as_str()) {
                return Err(invalid("duplicate experiment name".to_string()));
            }
            if experiment.n_parties == 0 {
                return Err(invalid("n_parties must be at least 1".to_string()));
            }
            if experiment.n_trials == 0 {
                return Err(invalid("n_trials must be at least 1".to_string()));
            }
            match (&experiment.generated_dir, &experiment.templates) {
                (Some(_), Some(_)) => {
                    return Err(invalid(
                        "set either generated_dir or templates, not both".to_string(),
                    ));
                }
                (None, None) => {
                    return Err(invalid(
                        "one of generated_dir or templates is required".to_string(),
                    ));
                }
                _ => {}
            }
            for (role, tokens) in [
                (Role::Coordinator, &experiment.commands.coordinator),
                (Role::Participant(0), &experiment.commands.participant),
            ] {
                ControlToken::validate_sequence(tokens, role).map_err(|e| invalid(e.to_string()))?;
            }

            if self.harness.backend == BackendKind::Ssh {
                let Some(agg) = &experiment.agg_machine else {
                    return Err(invalid("agg_machine is required for the ssh backend".to_string()));
                };
                if experiment.party_machines.is_empty() {
                    return Err(invalid(
                        "party_machines is required for the ssh backend".to_string(),
                    ));
                }
                for label in std::iter::once(agg).chain(&experiment.party_machines) {
                    let Some(machine) = self.machines.get(label) else {
                        return Err(invalid(format!("unknown machine '{label}'")));
                    };
                    if machine.address.is_empty() {
                        return Err(invalid(format!("machine '{label}' has no address")));
                    }
                }
            } else {
                for label in experiment.agg_machine.iter().chain(&experiment.party_machines) {
                    if !self.machines.contains_key(label) {
                        return Err(invalid(format!("unknown machine '{label}'")));
                    }
                }
            }
        }
        Ok(())
    }
}

/// `[a-z0-9]([-a-z0-9]*[a-z0-9])?`
fn is_dns_label(name: &str) -> bool {
    let valid_char = |c: char| c.is_ascii_lowercase() || c.is_ascii_digit();
    !name.is_empty()
        && name.len() <= 40
        && name.chars().all(|c| valid_char(c) || c == '-')
        && name.chars().next().is_some_and(valid_char)
        && name.chars().last().is_some_and(valid_char)
}

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    Io(String, std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(String),
    #[error("invalid config: {0}")]
    Invalid(String),
    #[error("experiment '{0}': {1}")]
    Experiment(String, String),
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;
    use test_case::test_case;

    use super::*;

    const BASE: &str = r#"
[harness]
backend = "ssh"
exec_mode = "parallel"

[machines.default]
user = "fl"
staging_dir = "/home/fl/stage"
work_dir = "/home/fl/federated-learning-lib"

[machines.agg]
address = "10.0.0.1"

[machines.p1]
address = "10.0.0.2"
user = "alice"

[machines.p2]
address = "10.0.0.3"

[defaults]
n_trials = 3
generated_dir = "/gen"
local_staging_dir = "/results"
"#;

    fn parse_config(toml_str: &str) -> FedrunConfig {
        let dir = tempdir().unwrap();
        let path = dir.path().join("fedrun.toml");
        std::fs::write(&path, toml_str).unwrap();
        FedrunConfig::load(&path).unwrap()
    }

    fn with_experiment(extra: &str) -> String {
        format!("{BASE}\n[[experiments]]\n{extra}")
    }

    #[test]
    fn test_parse_and_merge() {
        let config = parse_config(&with_experiment(
            r#"
name = "fedavg-mnist"
n_parties = 2
agg_machine = "agg"
party_machines = ["p1", "p2"]
n_trials = 5
"#,
        ));
        assert_eq!(config.harness.exec_mode, ExecMode::Parallel);
        assert_eq!(config.harness.max_concurrency, 5);
        assert_eq!(config.machines.len(), 3);
        assert_eq!(config.machines["p1"].user.as_deref(), Some("alice"));
        assert_eq!(config.machines["p2"].user.as_deref(), Some("fl"));
        assert_eq!(config.machines["p2"].staging_dir, "/home/fl/stage");
        assert_eq!(config.machines["p2"].name, "p2");

        let experiment = &config.experiments[0];
        assert_eq!(experiment.n_trials, 5);
        assert_eq!(experiment.local_staging_dir, PathBuf::from("/results"));
        assert_eq!(experiment.document_dir(), Some(Path::new("/gen")));
        assert_eq!(
            experiment.commands_for(Role::Coordinator),
            Role::Coordinator.default_commands()
        );
    }

    #[test]
    fn test_launch_command() {
        let config = parse_config(&with_experiment(
            r#"
name = "e1"
n_parties = 1
agg_machine = "agg"
party_machines = ["p1"]
participant_command = "cd fl && python -m ibmfl.party.party {config} --verbose"
"#,
        ));
        let experiment = &config.experiments[0];
        assert_eq!(
            experiment.launch_command(Role::Participant(0), "/stage/"),
            "cd fl && python -m ibmfl.party.party /stage/config_party0.yml --verbose"
        );
        assert_eq!(
            experiment.launch_command(Role::Coordinator, "/s"),
            "python -m ibmfl.aggregator.aggregator /s/config_agg.yml"
        );
    }

    #[test_case("name = \"Bad_Name\"\nn_parties = 1\nagg_machine = \"agg\"\nparty_machines = [\"p1\"]", "name must" ; "bad name")]
    #[test_case("name = \"e\"\nn_parties = 0\nagg_machine = \"agg\"\nparty_machines = [\"p1\"]", "n_parties" ; "zero parties")]
    #[test_case("name = \"e\"\nn_parties = 1\nagg_machine = \"nope\"\nparty_machines = [\"p1\"]", "unknown machine" ; "unknown machine")]
    #[test_case("name = \"e\"\nn_parties = 1\nparty_machines = [\"p1\"]", "agg_machine" ; "missing coordinator machine")]
    #[test_case("name = \"e\"\nn_parties = 1\nagg_machine = \"agg\"\nparty_machines = [\"p1\"]\ncommands = { coordinator = [\"START\", \"REGISTER\"] }", "REGISTER" ; "register on coordinator")]
    #[test_case("name = \"e\"\nn_parties = 1\nagg_machine = \"agg\"\nparty_machines = [\"p1\"]\ntemplates = { coordinator = \"a.yml\", participant = \"p.yml\" }", "not both" ; "two document sources")]
    fn test_validation_errors(experiment: &str, expected: &str) {
        let err = FedrunConfig::from_toml_str(&with_experiment(experiment)).unwrap_err();
        assert!(
            err.to_string().contains(expected),
            "'{err}' does not mention '{expected}'"
        );
    }

    #[test_case("poll_interval_secs = 0", "poll_interval_secs" ; "zero poll interval")]
    #[test_case("max_concurrency = 0", "max_concurrency" ; "zero concurrency")]
    fn test_harness_validation_errors(setting: &str, expected: &str) {
        let toml_str = format!(
            "{}\n[[experiments]]\nname = \"e\"\nn_parties = 1\nagg_machine = \"agg\"\nparty_machines = [\"p1\"]\n",
            BASE.replacen("[harness]\n", &format!("[harness]\n{setting}\n"), 1)
        );
        let err = FedrunConfig::from_toml_str(&toml_str).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)), "{err}");
        assert!(err.to_string().contains(expected), "'{err}' does not mention '{expected}'");
    }

    #[test]
    fn test_kube_backend_requires_cluster() {
        let err = FedrunConfig::from_toml_str(
            r#"
[harness]
backend = "kube"

[kube]
image = "fl:latest"
"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        let config = FedrunConfig::from_toml_str(
            r#"
[harness]
backend = "kube"

[kube]
image = "fl:latest"
expose_route = true

[[kube.clusters]]
name = "east"
context = "east-ctx"
namespace = "fl"
"#,
        )
        .unwrap();
        let kube = config.kube.unwrap();
        assert!(kube.settings.expose_route);
        assert_eq!(kube.settings.service_port, 5000);
        assert_eq!(kube.clusters[0].target().namespace.as_deref(), Some("fl"));
    }

    #[test_case("fedavg", true ; "plain")]
    #[test_case("a-1", true ; "inner dash")]
    #[test_case("-a", false ; "leading dash")]
    #[test_case("a-", false ; "trailing dash")]
    #[test_case("A", false ; "uppercase")]
    #[test_case("", false ; "empty")]
    fn test_dns_label(name: &str, valid: bool) {
        assert_eq!(is_dns_label(name), valid);
    }
}
