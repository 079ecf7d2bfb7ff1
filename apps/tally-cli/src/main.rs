//! # Tally CLI
//!
//! Entry point for schedulers and operators.
//!
//! ```text
//! scheduler tick ──► tally sync ... ──► SyncEngine ──► stdout (JSON)
//!                                          │
//!                                          └──► stderr (tracing)
//! ```
//!
//! A skipped sync exits 0: being gated is a normal outcome, not a failure.
//! `sync` prints a JSON array with one outcome per day. The first failing
//! day stops the walk; the outcomes before it are still printed.

use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tally_core::{CredentialPayload, DateRange, VaultKey};
use tally_sync::{SyncEngine, SyncRequest, TallyConfig};

/// Env var the enroll command reads the API key from.
const ENROLL_API_KEY_ENV: &str = "TALLY_ENROLL_API_KEY";
const ENROLL_REFRESH_TOKEN_ENV: &str = "TALLY_ENROLL_REFRESH_TOKEN";

#[derive(Debug, Parser)]
#[command(name = "tally", version, about = "POS sales ingestion")]
struct Cli {
    /// Config file (defaults to the platform config dir).
    #[arg(long, global = true, env = "TALLY_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Sync a location/provider, one run per day of the window.
    Sync(SyncArgs),
    /// Run one credential rotation batch.
    Rotate,
    /// Validate and store a provider credential.
    Enroll(EnrollArgs),
    /// Show gate state and recent runs for a pair.
    Status(StatusArgs),
    /// Print a fresh vault key.
    Keygen,
}

#[derive(Debug, Args)]
struct SyncArgs {
    #[arg(long)]
    client: String,
    #[arg(long)]
    location: String,
    #[arg(long)]
    provider: String,
    /// First day (YYYY-MM-DD, UTC).
    #[arg(long)]
    from: NaiveDate,
    /// Last day, inclusive. Defaults to `--from`.
    #[arg(long)]
    to: Option<NaiveDate>,
    /// Fetch and aggregate without storing.
    #[arg(long)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct EnrollArgs {
    #[arg(long)]
    location: String,
    #[arg(long)]
    provider: String,
    /// Provider-side merchant / restaurant id.
    #[arg(long)]
    merchant_ref: Option<String>,
    /// Token expiry (RFC 3339), for providers that issue expiring tokens.
    #[arg(long)]
    expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Args)]
struct StatusArgs {
    #[arg(long)]
    location: String,
    #[arg(long)]
    provider: String,
    /// Number of recent runs to show.
    #[arg(long, default_value = "10")]
    runs: u32,
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    if let Commands::Keygen = cli.command {
        return keygen();
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let config = TallyConfig::load(cli.config).context("Failed to load configuration")?;
        let engine = SyncEngine::open(&config)
            .await
            .context("Failed to start sync engine")?;
        run(&engine, cli.command).await
    })
}

async fn run(engine: &SyncEngine, command: Commands) -> Result<()> {
    match command {
        Commands::Sync(args) => {
            let range = DateRange::new(args.from, args.to.unwrap_or(args.from))?;
            let mut outcomes = Vec::new();
            for day in range.split_days() {
                let request = SyncRequest {
                    client_id: args.client.clone(),
                    location_id: args.location.clone(),
                    provider: args.provider.clone(),
                    range: day,
                    dry_run: args.dry_run,
                };
                match engine.sync(&request).await {
                    Ok(outcome) => {
                        if outcome.is_skipped() {
                            info!(date = %day.from, "Sync skipped by gate");
                        }
                        outcomes.push(outcome);
                    }
                    Err(e) => {
                        print_json(&outcomes)?;
                        return Err(e).with_context(|| format!("Sync failed for {}", day.from));
                    }
                }
            }
            print_json(&outcomes)
        }
        Commands::Rotate => print_json(&engine.rotate().await?),
        Commands::Enroll(args) => {
            let api_key = std::env::var(ENROLL_API_KEY_ENV)
                .with_context(|| format!("{} is not set", ENROLL_API_KEY_ENV))?;
            let payload = CredentialPayload {
                api_key,
                refresh_token: std::env::var(ENROLL_REFRESH_TOKEN_ENV).ok(),
                expires_at: args.expires_at,
                merchant_ref: args.merchant_ref,
            };
            let version = engine
                .enroll(&args.location, &args.provider, payload)
                .await?;
            print_json(&serde_json::json!({
                "location_id": args.location,
                "provider": args.provider,
                "version": version,
            }))
        }
        Commands::Status(args) => {
            let (status, runs) = engine
                .status(&args.location, &args.provider, args.runs)
                .await?;
            print_json(&serde_json::json!({
                "status": status,
                "runs": runs,
            }))
        }
        Commands::Keygen => keygen(),
    }
}

/// Needs neither config nor database.
fn keygen() -> Result<()> {
    print_json(&serde_json::json!({
        "key_hex": VaultKey::generate().to_hex()
    }))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
