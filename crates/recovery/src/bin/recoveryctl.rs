//! Operator CLI for inspecting and exercising the recovery engine.
//!
//! Run `recoveryctl --help` for usage information.

// CLI binaries legitimately need println! for user output
#![allow(clippy::disallowed_macros)]

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use recovery::{
    apply_heartbeat, apply_registration, ActionStore, ComponentState, HeartbeatResponse,
    ManagerOptions, RecoveryManager, RecoveryReport, RecoverySummary, RegistrationResponse,
};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "recoveryctl")]
#[command(about = "Inspect and exercise agent auto-recovery state")]
#[command(version)]
struct Cli {
    /// Output format: json, text
    #[arg(short, long, default_value = "text")]
    format: OutputFormat,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Default, clap::ValueEnum)]
enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the persisted action counters
    Inspect {
        /// Directory holding recovery.json
        #[arg(short, long, env = "RECOVERY_CACHE_DIR")]
        cache_dir: PathBuf,
    },

    /// Print the recovery status report for the persisted counters
    Report {
        /// Directory holding recovery.json
        #[arg(short, long, env = "RECOVERY_CACHE_DIR")]
        cache_dir: PathBuf,

        /// Registration response JSON carrying the recoveryConfig section
        #[arg(long)]
        config: PathBuf,
    },

    /// Apply a registration and a heartbeat, then print the recovery commands
    Simulate {
        /// Directory holding recovery.json
        #[arg(short, long, env = "RECOVERY_CACHE_DIR")]
        cache_dir: PathBuf,

        /// Registration response JSON
        #[arg(long)]
        registration: PathBuf,

        /// Heartbeat response JSON
        #[arg(long)]
        heartbeat: PathBuf,

        /// Current component state, e.g. DATANODE=INSTALLED
        #[arg(long, value_parser = parse_current)]
        current: Vec<(String, String)>,

        /// Cluster id stamped into synthesized commands
        #[arg(long)]
        cluster_id: Option<String>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .init();

    match cli.command {
        Commands::Inspect { cache_dir } => run_inspect(&cache_dir, cli.format),
        Commands::Report { cache_dir, config } => run_report(&cache_dir, &config, cli.format),
        Commands::Simulate {
            cache_dir,
            registration,
            heartbeat,
            current,
            cluster_id,
        } => run_simulate(
            &cache_dir,
            &registration,
            &heartbeat,
            &current,
            cluster_id,
            cli.format,
        ),
    }
}

fn parse_current(value: &str) -> Result<(String, String), String> {
    let (component, state) = value
        .split_once('=')
        .ok_or_else(|| format!("expected COMPONENT=STATE, got '{value}'"))?;
    if component.trim().is_empty() {
        return Err(format!("missing component name in '{value}'"));
    }
    Ok((component.trim().to_string(), state.trim().to_string()))
}

fn read_file(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))
}

fn run_inspect(cache_dir: &Path, format: OutputFormat) -> Result<()> {
    let store = ActionStore::new(cache_dir);
    let actions = store
        .load()
        .with_context(|| format!("Failed to load {}", store.path().display()))?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&actions)?),
        OutputFormat::Text => {
            if actions.is_empty() {
                println!("No recovery actions recorded in {}", store.path().display());
                return Ok(());
            }
            println!("{}", format!("Recovery actions in {}", store.path().display()).bold());
            for (name, counter) in &actions {
                println!(
                    "  {:<24} count={} lifetime={} lastAttempt={} lastReset={}",
                    name.cyan(),
                    counter.count,
                    counter.lifetime_count,
                    counter.last_attempt,
                    counter.last_reset
                );
            }
        }
    }
    Ok(())
}

fn load_manager(cache_dir: &Path, registration: &Path) -> Result<RecoveryManager> {
    let response = RegistrationResponse::parse(&read_file(registration)?)
        .with_context(|| format!("Invalid registration response {}", registration.display()))?;

    let manager = RecoveryManager::new(&ManagerOptions::new(cache_dir).restore_counters(true));
    apply_registration(&manager, &response);
    Ok(manager)
}

fn run_report(cache_dir: &Path, config: &Path, format: OutputFormat) -> Result<()> {
    let manager = load_manager(cache_dir, config)?;
    let report = manager.get_recovery_status();

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Text => print_report(&report),
    }
    Ok(())
}

fn print_report(report: &RecoveryReport) {
    let summary = report.summary.to_string();
    let summary = match report.summary {
        RecoverySummary::Recoverable => summary.green(),
        RecoverySummary::PartiallyRecoverable => summary.yellow(),
        RecoverySummary::Unrecoverable => summary.red(),
        RecoverySummary::Disabled => summary.dimmed(),
    };
    println!("Recovery: {summary}");

    for component in report.component_reports.iter().flatten() {
        let marker = if component.limit_reached {
            "✗".red().to_string()
        } else {
            "✓".green().to_string()
        };
        println!(
            "  {marker} {:<24} attempts={}",
            component.name, component.num_attempts
        );
    }
}

fn run_simulate(
    cache_dir: &Path,
    registration: &Path,
    heartbeat: &Path,
    current: &[(String, String)],
    cluster_id: Option<String>,
    format: OutputFormat,
) -> Result<()> {
    let manager = load_manager(cache_dir, registration)?;
    manager.set_cluster_id(cluster_id);

    let response = HeartbeatResponse::parse(&read_file(heartbeat)?)
        .with_context(|| format!("Invalid heartbeat response {}", heartbeat.display()))?;
    let applied = apply_heartbeat(&manager, &response);

    for (component, state) in current {
        manager.update_current_status(component, ComponentState::from(state.as_str()));
    }

    let commands = manager.get_recovery_commands();

    match format {
        OutputFormat::Json => {
            let values: Vec<_> = commands.iter().map(recovery::ExecutionCommand::to_value).collect();
            println!("{}", serde_json::to_string_pretty(&values)?);
        }
        OutputFormat::Text => {
            println!(
                "Applied {} status and {} execution commands ({} skipped)",
                applied.status_commands, applied.execution_commands, applied.skipped
            );
            if !manager.enabled() {
                println!("{}", "Recovery is disabled by the registration response".yellow());
            }
            if commands.is_empty() {
                println!("No recovery commands");
            }
            for command in &commands {
                println!(
                    "  {} {} (task {})",
                    command.role_command.to_string().bold(),
                    command.role.cyan(),
                    command.task_id.unwrap_or_default()
                );
            }
        }
    }
    Ok(())
}
