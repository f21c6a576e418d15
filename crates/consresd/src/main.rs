//! consresd — driver for the consumable-resource node selector.
//!
//! # Usage
//!
//! ```text
//! consresd simulate --config cluster.toml --workload jobs.toml --state-dir /tmp/cr
//! consresd show-state --config cluster.toml --state-dir /tmp/cr
//! ```

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;

use consres_core::ClusterConfig;

mod show;
mod workload;

use workload::{Simulator, Workload};

#[derive(Parser)]
#[command(
    name = "consresd",
    about = "Consumable-resource node selector",
    version,
    propagate_version = true
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum Format {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Replay a workload against a cluster and print every decision.
    Simulate {
        /// Cluster description (TOML).
        #[arg(short, long)]
        config: PathBuf,
        /// Workload to replay (TOML).
        #[arg(short, long)]
        workload: PathBuf,
        #[arg(short, long, value_enum, default_value = "text")]
        format: Format,
        /// Directory for the state file. Defaults to `[state].dir` from the
        /// cluster file; without either, checkpoints are skipped.
        #[arg(long)]
        state_dir: Option<PathBuf>,
    },
    /// Decode a saved state file and print its job records.
    ShowState {
        #[arg(short, long)]
        config: PathBuf,
        #[arg(long)]
        state_dir: Option<PathBuf>,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .or_else(|_| tracing_subscriber::EnvFilter::try_new("info,consresd=debug,consres=debug"))?,
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Simulate {
            config,
            workload,
            format,
            state_dir,
        } => simulate(&config, &workload, format, state_dir),
        Command::ShowState { config, state_dir } => {
            let config = ClusterConfig::from_file(&config)?;
            let dir = state_dir_for(&config, state_dir)
                .ok_or_else(|| anyhow::anyhow!("no state directory: pass --state-dir or set [state].dir"))?;
            show::show_state(&config, &dir)
        }
    }
}

fn state_dir_for(config: &ClusterConfig, flag: Option<PathBuf>) -> Option<PathBuf> {
    flag.or_else(|| config.state.as_ref().map(|s| s.dir.clone()))
}

fn simulate(config_path: &Path, workload_path: &Path, format: Format, state_dir: Option<PathBuf>) -> anyhow::Result<()> {
    let config = ClusterConfig::from_file(config_path)?;
    let workload = Workload::from_file(workload_path)?;
    let state_dir = state_dir_for(&config, state_dir);
    let base_dir = workload_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_default();

    info!(
        config = %config_path.display(),
        workload = %workload_path.display(),
        events = workload.events.len(),
        "replaying workload"
    );
    let mut sim = Simulator::new(config, &workload, state_dir, base_dir)?;
    let decisions = sim.run(&workload.events)?;
    {
        let engine = sim.engine();
        let engine = engine.lock().map_err(|_| anyhow::anyhow!("engine lock poisoned"))?;
        info!(
            clock = sim.clock(),
            jobs = engine.jobs().count(),
            queued = sim.queue().len(),
            generation = engine.generation(),
            "workload finished"
        );
    }

    match format {
        Format::Json => println!("{}", serde_json::to_string_pretty(&decisions)?),
        Format::Text => {
            for decision in &decisions {
                println!("{}", decision.render());
            }
        }
    }
    Ok(())
}
