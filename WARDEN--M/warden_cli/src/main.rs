use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use shared_logging::{init_tracing, TracingFormat};
use tracing::info;
use warden_controlplane::{
    bootstrap::{self, DispatchMode},
    config::{ControlPlaneConfig, SecretSource, Secrets},
    ledger::{parse_entries, recomputed_mismatches, verify_chain},
};

#[derive(Parser, Debug)]
#[command(name = "warden", version, about = "Warden command poller and audit tooling")]
struct Cli {
    /// TOML configuration file; environment variables override it.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    json_logs: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Polls the command queue until interrupted.
    Run {
        /// Authorize and execute in-process instead of calling the service.
        #[arg(long)]
        local: bool,
    },
    /// Runs a single poll cycle and prints its report.
    Once {
        /// Authorize and execute in-process instead of calling the service.
        #[arg(long)]
        local: bool,
    },
    /// Loads configuration and secrets, then prints the effective settings.
    Check,
    /// Verifies the hash chain of a ledger file.
    VerifyLedger {
        /// Ledger file; defaults to the configured path.
        path: Option<PathBuf>,
    },
}

const fn dispatch_mode(local: bool) -> DispatchMode {
    if local {
        DispatchMode::Local
    } else {
        DispatchMode::Http
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let format = if cli.json_logs {
        TracingFormat::Json
    } else {
        TracingFormat::Pretty
    };
    init_tracing("info", format)?;

    let config = ControlPlaneConfig::load(cli.config.as_deref()).context("loading configuration")?;
    match cli.command {
        Commands::Run { local } => run(&config, dispatch_mode(local)).await,
        Commands::Once { local } => once(&config, dispatch_mode(local)).await,
        Commands::Check => check(&config),
        Commands::VerifyLedger { path } => {
            verify_ledger(path.as_deref().unwrap_or(config.ledger_path.as_path()))
        }
    }
}

fn secrets() -> Result<Secrets> {
    Secrets::load(&SecretSource::default()).context("loading secrets")
}

async fn run(config: &ControlPlaneConfig, mode: DispatchMode) -> Result<()> {
    let poller = bootstrap::poller(config, &secrets()?, mode).await?;
    info!(interval_secs = config.poll_interval.as_secs(), "command poller started");
    poller
        .run_until(async {
            if tokio::signal::ctrl_c().await.is_err() {
                std::future::pending::<()>().await;
            }
        })
        .await;
    let snapshot = poller.pipeline().metrics().snapshot();
    info!(
        processed = snapshot.processed,
        success = snapshot.success,
        failed = snapshot.failed,
        blocked = snapshot.blocked,
        "command poller stopped"
    );
    Ok(())
}

async fn once(config: &ControlPlaneConfig, mode: DispatchMode) -> Result<()> {
    let poller = bootstrap::poller(config, &secrets()?, mode).await?;
    let report = poller.run_cycle().await?;
    let processed: Vec<_> = report
        .processed
        .iter()
        .map(|item| {
            json!({
                "action_id": item.result.action_id,
                "command_type": item.result.command_type,
                "status": item.result.status,
                "rationale": item.result.rationale,
                "receipt": item.receipt(),
                "duplicate": item.duplicate,
            })
        })
        .collect();
    let summary = json!({
        "lease_acquired": report.lease_acquired,
        "processed": processed,
        "skipped": report.skipped,
        "unparsable": report.unparsable,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn check(config: &ControlPlaneConfig) -> Result<()> {
    let secrets = secrets()?;
    bootstrap::signer(&secrets)?;
    println!("{}", serde_json::to_string_pretty(config)?);
    println!("{secrets:?}");
    Ok(())
}

fn verify_ledger(path: &Path) -> Result<()> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading ledger {}", path.display()))?;
    let entries = parse_entries(&raw)?;
    let report = verify_chain(&entries);
    println!("{}", serde_json::to_string_pretty(&report)?);
    if !report.valid {
        let mismatches = recomputed_mismatches(&entries);
        bail!(
            "ledger {} failed verification; entries with mismatched hashes: {mismatches:?}",
            path.display()
        );
    }
    Ok(())
}
