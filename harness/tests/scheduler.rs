//! Experiment scheduling end to end against the recording backend.

mod common;

use std::sync::Arc;

use common::{Fixture, MockBackend, ONE_ROUND};
use fedrun_config::Role;
use fedrun_harness::{
    config::FedrunConfig,
    scheduler::Scheduler,
    state::{StateManager, TrialStatus},
};
use indicatif::{MultiProgress, ProgressDrawTarget};

fn local_config(fixture: &Fixture, extra: &str) -> FedrunConfig {
    let root = fixture.dir.path();
    FedrunConfig::from_toml_str(&format!(
        r#"
[harness]
backend = "local"
state_file = "{state}"

[[experiments]]
name = "fedavg"
n_trials = 2
n_parties = {n}
generated_dir = "{generated}"
local_staging_dir = "{results}"
{extra}
"#,
        state = root.join("state.json").display(),
        n = fixture.n_parties,
        generated = fixture.generated.display(),
        results = root.join("results").display(),
    ))
    .unwrap()
}

fn scheduler(config: FedrunConfig, backend: &Arc<MockBackend>) -> Scheduler {
    let state = StateManager::new(&config.harness.state_file);
    Scheduler::new(config, backend.clone(), state)
        .with_progress(MultiProgress::with_draw_target(ProgressDrawTarget::hidden()))
}

#[tokio::test]
async fn test_runs_every_trial_and_records_state() {
    let fixture = Fixture::new(2);
    let backend = Arc::new(MockBackend::with_log(ONE_ROUND));
    let config = local_config(&fixture, "");
    let state_file = config.harness.state_file.clone();

    let result = scheduler(config, &backend).run().await.unwrap();

    assert_eq!(result.total, 2);
    assert_eq!(result.completed, 2);
    assert!(result.all_completed());
    // Three processes per trial, each torn down once.
    assert_eq!(backend.spawned().len(), 6);
    for handle in backend.spawned() {
        assert_eq!(backend.teardown_count(handle.id), 1);
    }

    let state = StateManager::new(&state_file).load().unwrap();
    let experiment = &state.experiments["fedavg"];
    assert_eq!(experiment.count(TrialStatus::Completed), 2);
    assert_eq!(experiment.trials[&1].rounds, 1);
    assert_eq!(experiment.trials[&2].coordinator.as_deref(), Some("localhost"));

    let experiment_dir = result.experiments[0].experiment_dir.clone().unwrap();
    assert!(experiment_dir.join("trial1/stdout_agg.txt").exists());
    assert!(experiment_dir.join("trial2/metrics_party1.json").exists());
    #[cfg(unix)]
    assert!(
        fixture
            .dir
            .path()
            .join("results/latest")
            .join("trial1/metadata.yml")
            .exists()
    );
}

#[tokio::test]
async fn test_failed_trials_do_not_stop_the_run() {
    let fixture = Fixture::new(1);
    let backend = Arc::new(MockBackend {
        reject_spawn: Some(Role::Coordinator),
        ..MockBackend::with_log(ONE_ROUND)
    });
    let config = local_config(&fixture, "");
    let state_file = config.harness.state_file.clone();

    let result = scheduler(config, &backend).run().await.unwrap();

    assert_eq!(result.failed, 2);
    assert!(!result.all_completed());
    assert_eq!(
        backend.calls().iter().filter(|c| *c == "spawn agg").count(),
        2
    );

    let state = StateManager::new(&state_file).load().unwrap();
    let trial = &state.experiments["fedavg"].trials[&1];
    assert_eq!(trial.status, TrialStatus::Failed);
    assert!(trial.errors[0].contains("quota exceeded"));
}

#[tokio::test]
async fn test_postprocess_hook_gets_metrics_template() {
    let fixture = Fixture::new(2);
    let backend = Arc::new(MockBackend::with_log(ONE_ROUND));
    let config = local_config(
        &fixture,
        r#"postprocess = { command = "sh", args = ["-c", "printf '%s %s' \"$FEDRUN_METRICS\" {n_trials} > hook.out"] }"#,
    );

    let result = scheduler(config, &backend).run().await.unwrap();

    let experiment_dir = result.experiments[0].experiment_dir.clone().unwrap();
    let out = std::fs::read_to_string(experiment_dir.join("hook.out")).unwrap();
    assert_eq!(
        out,
        format!(
            "{}/trial${{trial}}/metrics_party${{id}}.json 2",
            experiment_dir.display()
        )
    );
}

#[tokio::test]
async fn test_parallel_experiments_all_complete() {
    let fixture = Fixture::new(1);
    let backend = Arc::new(MockBackend::with_log(ONE_ROUND));
    let root = fixture.dir.path();
    let mut toml = format!(
        "[harness]\nbackend = \"local\"\nexec_mode = \"parallel\"\nmax_concurrency = 2\nstate_file = \"{}\"\n",
        root.join("state.json").display()
    );
    for name in ["a", "b", "c"] {
        toml.push_str(&format!(
            "\n[[experiments]]\nname = \"{name}\"\nn_parties = 1\ngenerated_dir = \"{}\"\nlocal_staging_dir = \"{}\"\n",
            fixture.generated.display(),
            root.join("results").display()
        ));
    }
    let config = FedrunConfig::from_toml_str(&toml).unwrap();

    let result = scheduler(config, &backend).run().await.unwrap();

    assert_eq!(result.total, 3);
    assert_eq!(result.completed, 3);
    let mut names: Vec<_> = result.experiments.iter().map(|e| e.name.as_str()).collect();
    names.sort_unstable();
    assert_eq!(names, ["a", "b", "c"]);
}

fn ssh_config(shuffle: bool, n_trials: usize) -> FedrunConfig {
    FedrunConfig::from_toml_str(&format!(
        r#"
[machines.agg]
address = "10.0.0.1"
[machines.m1]
address = "10.0.0.2"
[machines.m2]
address = "10.0.0.3"
[machines.m3]
address = "10.0.0.4"

[[experiments]]
name = "e"
n_trials = {n_trials}
n_parties = 2
agg_machine = "agg"
party_machines = ["m1", "m2", "m3"]
shuffle_party_machines = {shuffle}
generated_dir = "/gen"

[harness]
shuffle_seed = 7
"#
    ))
    .unwrap()
}

fn participant_names(plan: &fedrun_harness::scheduler::TrialAssignment) -> Vec<&str> {
    plan.participants.iter().map(|t| t.name.as_str()).collect()
}

#[test]
fn test_plan_without_shuffle_cycles_from_start() {
    let backend = Arc::new(MockBackend::default());
    let plans = scheduler(ssh_config(false, 3), &backend).plan().unwrap();
    for trial in &plans[0].trials {
        assert_eq!(trial.coordinator.name, "agg");
        assert_eq!(participant_names(trial), ["m1", "m2"]);
    }
}

#[test]
fn test_plan_with_shuffle_covers_pool_before_repeating() {
    let backend = Arc::new(MockBackend::default());
    let plans = scheduler(ssh_config(true, 2), &backend).plan().unwrap();
    let mut seen: Vec<&str> = plans[0].trials.iter().flat_map(participant_names).collect();
    seen.sort_unstable();
    seen.dedup();
    assert_eq!(seen, ["m1", "m2", "m3"]);
}

#[test]
fn test_plan_is_reproducible_with_seed() {
    let backend = Arc::new(MockBackend::default());
    let first = scheduler(ssh_config(true, 4), &backend).plan().unwrap();
    let second = scheduler(ssh_config(true, 4), &backend).plan().unwrap();
    assert_eq!(first[0].trials, second[0].trials);
    assert_eq!(first[0].trials.len(), 4);
}
