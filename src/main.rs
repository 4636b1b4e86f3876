use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use portweave::checkpoint::{CheckpointStorage, Epoch, FileCheckpointStorage};
use portweave::config::RuntimeConfig;
use portweave::harness::{Harness, RunReport, RunningGraph, SystemStatus, Topology};
use portweave::recipe::RecipeLibrary;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info};

const EXIT_INVALID: u8 = 1;
const EXIT_RESTORE: u8 = 2;
const EXIT_CRASHED: u8 = 3;

#[derive(Parser)]
#[command(
  name = "portweave",
  version,
  about = "Runs component graphs with crash-safe checkpoints"
)]
struct Cli {
  #[command(subcommand)]
  command: Commands,

  /// Runtime config file (JSON)
  #[arg(long, global = true)]
  config: Option<PathBuf>,

  /// Storage root; overrides the config file and environment
  #[arg(long, global = true)]
  root: Option<PathBuf>,

  /// More logging (-v debug, -vv trace); RUST_LOG takes precedence
  #[arg(short, long, action = ArgAction::Count, global = true)]
  verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
  /// Wire a topology and run it to completion
  Run {
    /// Path to the topology JSON file
    topology: PathBuf,
    /// Restore before starting: the given epoch, or the newest valid one
    #[arg(long, value_name = "EPOCH", num_args = 0..=1)]
    restore: Option<Option<u64>>,
  },
  /// Same as `run --restore EPOCH`
  Restore {
    /// Checkpoint epoch
    epoch: u64,
    /// Path to the topology JSON file
    topology: PathBuf,
  },
  /// Print the last status written for a system
  Status {
    /// System id
    #[arg(long)]
    system: String,
  },
  /// List stored checkpoints of a system
  Checkpoints {
    /// System id
    #[arg(long)]
    system: String,
  },
}

#[tokio::main]
async fn main() -> ExitCode {
  let cli = Cli::parse();
  portweave::logging::init(match cli.verbose {
    0 => "info",
    1 => "debug",
    _ => "trace",
  });

  let config = match load_config(cli.config.as_deref(), cli.root) {
    Ok(config) => config,
    Err(e) => {
      eprintln!("error: {e:#}");
      return ExitCode::from(EXIT_INVALID);
    }
  };

  let result = match cli.command {
    Commands::Run { topology, restore } => run(config, &topology, restore).await,
    Commands::Restore { epoch, topology } => run(config, &topology, Some(Some(epoch))).await,
    Commands::Status { system } => status(&config, &system),
    Commands::Checkpoints { system } => checkpoints(&config, &system),
  };
  result.unwrap_or_else(|e| {
    eprintln!("error: {e:#}");
    ExitCode::from(EXIT_INVALID)
  })
}

fn load_config(path: Option<&Path>, root: Option<PathBuf>) -> Result<RuntimeConfig> {
  let mut config = RuntimeConfig::load(path)?;
  if let Some(root) = root {
    config.root = root;
  }
  config.validate()?;
  Ok(config)
}

async fn run(config: RuntimeConfig, path: &Path, restore: Option<Option<u64>>) -> Result<ExitCode> {
  let topology = Topology::load(path)?;
  let harness = Harness::new(config, RecipeLibrary::with_builtins());
  let mut graph = harness
    .wire(&topology)
    .with_context(|| format!("cannot wire {}", path.display()))?;

  if let Some(epoch) = restore {
    match graph.restore(epoch.map(Epoch::new)) {
      Ok(epoch) => info!(epoch = epoch.as_u64(), "resuming from checkpoint"),
      Err(e) => {
        error!(system = graph.system(), error = %e, "restore failed");
        eprintln!("error: restore failed: {e}");
        return Ok(ExitCode::from(EXIT_RESTORE));
      }
    }
  }

  let report = supervise(graph.start()).await;
  print_report(&report);
  if report.crashed().next().is_some() {
    Ok(ExitCode::from(EXIT_CRASHED))
  } else {
    Ok(ExitCode::SUCCESS)
  }
}

/// Operator console on stdin until every component exits.
async fn supervise(running: RunningGraph) -> RunReport {
  let mut lines = BufReader::new(tokio::io::stdin()).lines();
  let mut stdin_open = true;
  loop {
    tokio::select! {
      _ = running.finished() => break,
      _ = tokio::signal::ctrl_c() => running.cancel(),
      line = lines.next_line(), if stdin_open => match line {
        Ok(Some(line)) => match line.trim() {
          "checkpoint now" | "checkpoint" => match running.checkpoint_now().await {
            Ok(epoch) => println!("checkpoint {epoch} written"),
            Err(e) => println!("checkpoint failed: {e}"),
          },
          "status" => print_status(&running.status()),
          "quit" => running.cancel(),
          "" => {}
          other => println!("unknown command '{other}' (checkpoint now | status | quit)"),
        },
        Ok(None) | Err(_) => stdin_open = false,
      },
    }
  }
  running.wait().await
}

fn status(config: &RuntimeConfig, system: &str) -> Result<ExitCode> {
  let path = config.status_path(system);
  let status = SystemStatus::read(&path).with_context(|| format!("no status at {}", path.display()))?;
  print_status(&status);
  Ok(ExitCode::SUCCESS)
}

fn checkpoints(config: &RuntimeConfig, system: &str) -> Result<ExitCode> {
  let storage = FileCheckpointStorage::new(config.checkpoint_dir(system));
  let epochs = storage.list()?;
  if epochs.is_empty() {
    println!("no checkpoints for '{system}'");
  }
  for epoch in epochs {
    match storage.load(epoch) {
      Ok(checkpoint) => println!(
        "{:>6}  {}  {} components  {} in flight",
        epoch.as_u64(),
        checkpoint.timestamp.to_rfc3339(),
        checkpoint.component_states.len(),
        checkpoint.in_flight_len()
      ),
      Err(e) => println!("{:>6}  unreadable: {e}", epoch.as_u64()),
    }
  }
  Ok(ExitCode::SUCCESS)
}

fn print_status(status: &SystemStatus) {
  let last = status
    .last_checkpoint
    .map_or_else(|| "none".to_string(), |epoch| epoch.to_string());
  println!("system '{}' at {} (last checkpoint: {last})", status.system, status.taken_at.to_rfc3339());
  for component in &status.components {
    let metrics = &component.metrics;
    let recipe = component
      .provenance
      .as_ref()
      .map_or_else(String::new, |p| format!(" [{p}]"));
    println!(
      "  {}{recipe} ({}) {}: in={} out={} dropped={} errors={} queued={}",
      component.name,
      component.shape,
      component.state,
      metrics.messages_in,
      metrics.messages_out,
      metrics.dropped,
      metrics.errors,
      metrics.queue_depth
    );
    for (port, m) in &component.ports {
      println!(
        "    {port}: seq={} messages={} dropped={} errors={} queued={}",
        m.sequence, m.messages, m.dropped, m.errors, m.queue_depth
      );
    }
  }
  println!("  collected errors: {}", status.collected_errors);
}

fn print_report(report: &RunReport) {
  println!("system '{}' finished", report.system);
  for (name, outcome) in &report.outcomes {
    println!("  {name}: {}", portweave::harness::RunState::from(outcome.clone()));
  }
  if !report.errors.is_empty() {
    println!("  {} error envelopes collected", report.errors.len());
  }
  if let Some(epoch) = report.last_checkpoint {
    println!("  last checkpoint: {epoch}");
  }
}
