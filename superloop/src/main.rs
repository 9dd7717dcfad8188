//! Superloop CLI.
//!
//! Runs configured loops of agent roles against a repository until each loop
//! completes, pauses for a human, or stops with a resumable reason. All state
//! lives under `.superloop/`.

use std::path::{Path, PathBuf};

use anyhow::{Result, bail};
use chrono::Utc;
use clap::{Parser, Subcommand};
use superloop::error::{SuperloopError, exit_code_for};
use superloop::io::approval::{ApprovalStatus, record_decision};
use superloop::io::config::load_config;
use superloop::io::executor::CommandRoleExecutor;
use superloop::io::init::{InitOptions, init_superloop};
use superloop::io::paths::SuperloopPaths;
use superloop::io::test_gate::ShellTestRunner;
use superloop::logging;
use superloop::looping::{RunOptions, run_loops};
use superloop::snapshot::{render_snapshots, snapshot_all};
use superloop::status::{collect_status, render_status};

#[derive(Parser)]
#[command(
    name = "superloop",
    version,
    about = "Iteration orchestration engine for autonomous coding agents"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Scaffold `.superloop/config.toml` and role prompt placeholders.
    Init {
        #[arg(long, default_value = ".")]
        repo: PathBuf,
        /// Overwrite existing files.
        #[arg(short, long)]
        force: bool,
    },
    /// Run loops from the persisted position.
    Run {
        #[arg(long, default_value = ".")]
        repo: PathBuf,
        /// Run only this loop.
        #[arg(long = "loop", value_name = "ID")]
        loop_id: Option<String>,
        /// Use `runner.fast_command`.
        #[arg(long)]
        fast: bool,
        /// Print the gate snapshot from existing artifacts and exit.
        #[arg(long)]
        dry_run: bool,
    },
    /// Approve the pending candidate of a loop.
    Approve(DecisionArgs),
    /// Reject the pending candidate of a loop.
    Reject(DecisionArgs),
    /// Print run state and a per-loop digest.
    Status {
        #[arg(long, default_value = ".")]
        repo: PathBuf,
    },
}

#[derive(clap::Args)]
struct DecisionArgs {
    #[arg(long, default_value = ".")]
    repo: PathBuf,
    #[arg(long = "loop", value_name = "ID")]
    loop_id: String,
    /// Who decided; defaults to `$USER`.
    #[arg(long)]
    by: Option<String>,
    #[arg(long)]
    note: Option<String>,
}

fn main() {
    logging::init();
    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(exit_code_for(&err));
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Init { repo, force } => cmd_init(&repo, force),
        Command::Run {
            repo,
            loop_id,
            fast,
            dry_run,
        } => cmd_run(&repo, loop_id, fast, dry_run),
        Command::Approve(args) => cmd_decide(args, ApprovalStatus::Approved),
        Command::Reject(args) => cmd_decide(args, ApprovalStatus::Rejected),
        Command::Status { repo } => cmd_status(&repo),
    }
}

fn cmd_init(repo: &Path, force: bool) -> Result<()> {
    let paths = init_superloop(repo, &InitOptions { force })?;
    println!("wrote {}", paths.config.display());
    Ok(())
}

fn cmd_run(repo: &Path, loop_id: Option<String>, fast: bool, dry_run: bool) -> Result<()> {
    let paths = SuperloopPaths::new(repo);
    let config = load_config(&paths.config)?;

    if dry_run {
        let mut snapshots = snapshot_all(repo, &config)?;
        if let Some(id) = &loop_id {
            snapshots.retain(|snap| &snap.loop_id == id);
            if snapshots.is_empty() {
                return Err(SuperloopError::Config(format!("unknown loop '{id}'")).into());
            }
        }
        print!("{}", render_snapshots(&snapshots));
        return Ok(());
    }

    if fast && config.runner.fast_command.is_none() {
        bail!("--fast requires runner.fast_command in {}", paths.config.display());
    }
    let executor = CommandRoleExecutor::new(&config.runner, fast);
    let outcome = run_loops(
        repo,
        &config,
        &executor,
        &ShellTestRunner,
        &RunOptions { loop_id },
    )?;
    println!(
        "{} ({} iteration(s) this run)",
        outcome.stop.resume_hint(),
        outcome.iterations_run
    );
    Ok(())
}

fn cmd_decide(args: DecisionArgs, status: ApprovalStatus) -> Result<()> {
    let paths = SuperloopPaths::new(&args.repo);
    let config = load_config(&paths.config)?;
    if config.loop_by_id(&args.loop_id).is_none() {
        return Err(SuperloopError::Config(format!("unknown loop '{}'", args.loop_id)).into());
    }
    let by = args
        .by
        .or_else(|| std::env::var("USER").ok())
        .unwrap_or_else(|| "operator".to_string());
    let request = record_decision(
        &paths.loop_paths(&args.loop_id).approval,
        status,
        &by,
        args.note,
        Utc::now(),
    )?;
    println!(
        "{} iteration {} of loop '{}'; run `superloop run` to continue",
        status.as_str(),
        request.iteration,
        args.loop_id
    );
    Ok(())
}

fn cmd_status(repo: &Path) -> Result<()> {
    let paths = SuperloopPaths::new(repo);
    let config = load_config(&paths.config)?;
    print!("{}", render_status(&collect_status(repo, &config)?));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_init_force() {
        let cli = Cli::parse_from(["superloop", "init", "--force"]);
        assert!(matches!(cli.command, Command::Init { force: true, .. }));
    }

    #[test]
    fn parse_run_flags() {
        let cli = Cli::parse_from([
            "superloop", "run", "--repo", "/tmp/r", "--loop", "docs", "--fast", "--dry-run",
        ]);
        match cli.command {
            Command::Run {
                repo,
                loop_id,
                fast,
                dry_run,
            } => {
                assert_eq!(repo, PathBuf::from("/tmp/r"));
                assert_eq!(loop_id.as_deref(), Some("docs"));
                assert!(fast && dry_run);
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn approve_requires_a_loop() {
        assert!(Cli::try_parse_from(["superloop", "approve"]).is_err());
        let cli = Cli::try_parse_from(["superloop", "reject", "--loop", "main", "--note", "no"])
            .expect("parse");
        assert!(matches!(cli.command, Command::Reject(ref a) if a.note.as_deref() == Some("no")));
    }
}
