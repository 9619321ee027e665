//! fedrun CLI
//!
//! Runs federated learning experiments across machines or clusters and
//! reports on their persisted status.

use std::{process::ExitCode, sync::Arc};

use clap::{Parser, Subcommand};
use fedrun_harness::{
    backend::{ExecutionBackend, KubeBackend, LocalBackend, SshBackend},
    config::{BackendKind, FedrunConfig},
    scheduler::Scheduler,
    state::{StateManager, TrialStatus},
};
use tracing_indicatif::IndicatifLayer;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "fedrun", about = "Federated learning trial orchestrator")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every configured experiment
    Run {
        /// Path to fedrun.toml config file
        #[arg(short, long, default_value = "fedrun.toml")]
        config: String,

        /// Print the allocation plan without touching any target
        #[arg(long)]
        dry_run: bool,
    },

    /// Show status of trials
    Status {
        /// Path to state file
        #[arg(short, long, default_value = "./fedrun_state.json")]
        state: String,
    },

    /// Print role -> target assignments for every trial
    Plan {
        /// Path to fedrun.toml config file
        #[arg(short, long, default_value = "fedrun.toml")]
        config: String,
    },
}

fn backend_for(config: &FedrunConfig) -> Result<Arc<dyn ExecutionBackend>, String> {
    Ok(match config.harness.backend {
        BackendKind::Ssh => Arc::new(SshBackend::new(config.harness.connect_timeout_secs)),
        BackendKind::Local => Arc::new(LocalBackend::default()),
        BackendKind::Kube => {
            let kube = config
                .kube
                .as_ref()
                .ok_or("the kube backend needs a [kube] section")?;
            Arc::new(KubeBackend::new(kube.settings.clone()))
        }
    })
}

fn print_plan(scheduler: &Scheduler) -> Result<(), Box<dyn std::error::Error>> {
    for plan in scheduler.plan()? {
        println!("=== {} ===", plan.experiment.name);
        for trial in &plan.trials {
            println!("trial {}:", trial.trial);
            println!("  agg    -> {}", trial.coordinator.name);
            for (index, target) in trial.participants.iter().enumerate() {
                println!("  party{index:<2} -> {}", target.name);
            }
        }
        println!();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    // tracing needs to be initialized with indicatif_layer to not clobber progress bars
    let indicatif_layer = IndicatifLayer::new();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(indicatif_layer.get_stderr_writer()))
        .with(
            EnvFilter::builder()
                .with_default_directive(tracing::Level::INFO.into())
                .from_env_lossy(),
        )
        .with(indicatif_layer)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config, dry_run } => {
            let fedrun_config = FedrunConfig::load(&config)?;
            let state_manager = StateManager::new(&fedrun_config.harness.state_file);
            let backend = backend_for(&fedrun_config)?;
            let scheduler = Scheduler::new(fedrun_config, backend, state_manager);

            if dry_run {
                println!("=== Dry Run: allocation plan ===");
                print_plan(&scheduler)?;
                return Ok(ExitCode::SUCCESS);
            }

            println!("Starting fedrun with config: {config}");
            let result = scheduler.run().await?;

            println!();
            println!("=== fedrun Complete ===");
            for experiment in &result.experiments {
                println!(
                    "{}: {} completed, {} failed{}",
                    experiment.name,
                    experiment.completed,
                    experiment.failed,
                    experiment
                        .experiment_dir
                        .as_ref()
                        .map(|d| format!(" ({})", d.display()))
                        .unwrap_or_default()
                );
            }
            println!("Total: {}", result.total);
            println!("Completed: {}", result.completed);
            println!("Failed: {}", result.failed);

            if !result.all_completed() {
                return Ok(ExitCode::FAILURE);
            }
        }

        Commands::Status { state } => {
            let state_manager = StateManager::new(&state);
            let run_state = state_manager.load()?;

            if run_state.experiments.is_empty() {
                println!("No experiments in state file.");
                return Ok(ExitCode::SUCCESS);
            }

            println!("=== Trial Status ===");
            for (name, experiment) in &run_state.experiments {
                println!();
                println!(
                    "{name}: {}/{} completed, {} failed{}",
                    experiment.count(TrialStatus::Completed),
                    experiment.trials.len(),
                    experiment.count(TrialStatus::Failed),
                    experiment
                        .experiment_dir
                        .as_ref()
                        .map(|d| format!(" ({d})"))
                        .unwrap_or_default()
                );

                for (number, trial) in &experiment.trials {
                    print!("  trial {number}: {}", trial.status.label());
                    if trial.rounds > 0 {
                        print!(" [rounds: {}]", trial.rounds);
                    }
                    if let Some(coordinator) = &trial.coordinator {
                        print!(" agg={coordinator}");
                    }
                    if !trial.participants.is_empty() {
                        print!(" parties={}", trial.participants.join(","));
                    }
                    println!();

                    for error in &trial.errors {
                        println!("    Error: {error}");
                    }
                }
            }
        }

        Commands::Plan { config } => {
            let fedrun_config = FedrunConfig::load(&config)?;
            let state_manager = StateManager::new(&fedrun_config.harness.state_file);
            let backend = backend_for(&fedrun_config)?;
            print_plan(&Scheduler::new(fedrun_config, backend, state_manager))?;
        }
    }

    Ok(ExitCode::SUCCESS)
}
