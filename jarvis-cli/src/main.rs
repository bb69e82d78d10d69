use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use jarvis_core::{GovernanceError, Orchestrator, RunReport, RunStatus};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(
    name = "jarvis",
    about = "Constitutional code governance: rule-gated scan, heal and audit of a git workspace"
)]
struct Cli {
    /// Workspace root (default: $JARVIS_WORKSPACE, then the current directory)
    #[arg(long, global = true)]
    workspace: Option<PathBuf>,
    /// Debug-level logs on stderr
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Create .jarvis/ with a default config and an empty audit log
    Init,
    /// Report violations under a path
    Scan { path: PathBuf },
    /// Fix every fixable violation under a path the rules allow writing
    Heal { path: PathBuf },
    /// Print the last audit records
    Audit {
        #[arg(long, default_value_t = 20)]
        tail: usize,
    },
    /// Recompute every audit hash and link
    VerifyAudit,
    /// Rebuild the memory index from history and a full scan
    RebuildIndex,
    /// Commits, changed files and new findings in a recent window
    Activity {
        #[arg(long, default_value_t = 7)]
        days: u32,
    },
    /// Open TODO markers older than a number of days
    Todos {
        #[arg(long)]
        older_than: Option<u32>,
    },
    /// Suggested follow-ups (never applied without approval)
    Opportunities,
}

const EXIT_CLEAN: u8 = 0;
const EXIT_FINDINGS: u8 = 1;
const EXIT_DENIED: u8 = 2;
const EXIT_IO: u8 = 3;
const EXIT_INTERNAL: u8 = 4;

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    match run(cli) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            let gov = e.downcast_ref::<GovernanceError>();
            let body = serde_json::json!({
                "error": gov.map(GovernanceError::kind).unwrap_or("InternalError"),
                "message": format!("{e:#}"),
                "denied_by": gov.map(GovernanceError::denied_by).unwrap_or(&[]),
            });
            println!("{body:#}");
            eprintln!("jarvis: {e:#}");
            ExitCode::from(gov.map(exit_code_for).unwrap_or(EXIT_INTERNAL))
        }
    }
}

/// Logs go to stderr; stdout carries only JSON results.
fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("jarvis_core=debug,info"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("jarvis_core=info,warn"))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn run(cli: Cli) -> Result<u8> {
    let mut orch = Orchestrator::open(cli.workspace.as_deref())?;
    tracing::debug!(root = %orch.workspace().root().display(), "workspace bound");
    match cli.cmd {
        Cmd::Init => {
            print_json(orch.init_report())?;
            Ok(EXIT_CLEAN)
        }
        Cmd::Scan { path } => {
            let report = orch.scan(&path)?;
            print_json(&report)?;
            Ok(run_exit_code(&report))
        }
        Cmd::Heal { path } => {
            let report = orch.heal(&path)?;
            print_json(&report)?;
            Ok(run_exit_code(&report))
        }
        Cmd::Audit { tail } => {
            for record in orch.audit_tail(tail)? {
                println!("{}", serde_json::to_string(&record).context("serialize audit record")?);
            }
            Ok(EXIT_CLEAN)
        }
        Cmd::VerifyAudit => {
            let report = orch.verify_audit()?;
            print_json(&report)?;
            Ok(if report.valid { EXIT_CLEAN } else { EXIT_FINDINGS })
        }
        Cmd::RebuildIndex => {
            print_json(&orch.rebuild_index()?)?;
            Ok(EXIT_CLEAN)
        }
        Cmd::Activity { days } => {
            print_json(&orch.recent_activity(days)?)?;
            Ok(EXIT_CLEAN)
        }
        Cmd::Todos { older_than } => {
            let todos = orch.stale_todos(older_than)?;
            print_json(&todos)?;
            Ok(if todos.is_empty() { EXIT_CLEAN } else { EXIT_FINDINGS })
        }
        Cmd::Opportunities => {
            print_json(&orch.opportunities()?)?;
            Ok(EXIT_CLEAN)
        }
    }
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value).context("serialize output")?;
    println!("{text}");
    Ok(())
}

fn run_exit_code(report: &RunReport) -> u8 {
    match report.status {
        RunStatus::Clean | RunStatus::Healed => EXIT_CLEAN,
        RunStatus::Findings => EXIT_FINDINGS,
        RunStatus::Partial if report.has_denials() => EXIT_DENIED,
        RunStatus::Partial => EXIT_IO,
    }
}

fn exit_code_for(e: &GovernanceError) -> u8 {
    match e {
        GovernanceError::Containment { .. } | GovernanceError::ConstitutionalDenial { .. } => {
            EXIT_DENIED
        }
        GovernanceError::AuditWriteFailure(_)
        | GovernanceError::FixFailedIo(_)
        | GovernanceError::Io(_) => EXIT_IO,
        _ => EXIT_INTERNAL,
    }
}
