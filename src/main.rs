//! Command-line entry point for shift-redeemer.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use shift_redeemer::redeem::{
    CodeFeed, HttpCodeFeed, KeyStorage, RedeemClient, RedeemMapping, RedemptionPlanner, RedemptionSession,
    RewardFilter, SimulatedRedeemClient, SqliteKeyStore, StaticFeed,
};
use shift_redeemer::{NormalizedCode, RedeemConfig, RedeemConfigBuilder};

#[derive(Parser)]
#[command(name = "shift-redeemer")]
#[command(about = "Plan and redeem promotional codes across games and platforms")]
struct Cli {
    /// Named profile; keeps a separate database under data/<profile>/
    #[arg(long, global = true)]
    profile: Option<String>,

    /// Codes feed URL or local JSON file
    #[arg(long = "shift-source", global = true)]
    shift_source: Option<String>,

    /// Explicit database path
    #[arg(long, global = true)]
    database: Option<PathBuf>,

    /// Re-attempt recorded failures and expired codes
    #[arg(long = "bypass-fail", global = true)]
    bypass_fail: bool,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the redemption plan for a code as JSON
    Plan {
        code: String,
        #[arg(long = "platform", value_delimiter = ',')]
        platforms: Vec<String>,
    },
    /// List recorded outcomes for a code
    Status { code: String },
    /// Redeem one code across games and platforms
    Redeem {
        code: String,
        #[arg(long = "platform", value_delimiter = ',')]
        platforms: Vec<String>,
        /// Use the offline simulated client
        #[arg(long)]
        simulate: bool,
    },
    /// Redeem stored codes for game:platform targets (e.g. bl3:steam,epic)
    Bulk {
        #[arg(required = true)]
        targets: Vec<String>,
        #[arg(long, conflicts_with = "non_golden")]
        golden: bool,
        #[arg(long = "non-golden")]
        non_golden: bool,
        #[arg(long)]
        other: bool,
        /// Live attempts per target
        #[arg(long)]
        limit: Option<usize>,
        /// Use the offline simulated client
        #[arg(long)]
        simulate: bool,
    },
}

fn init_tracing(verbose: bool) {
    let default_filter = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn build_config(cli: &Cli) -> RedeemConfig {
    let mut builder = RedeemConfigBuilder::from_config(RedeemConfig::from_env())
        .with_bypass_failures(cli.bypass_fail);
    if let Some(profile) = &cli.profile {
        builder = builder.with_profile(profile.clone());
    }
    if let Some(source) = &cli.shift_source {
        builder = builder.with_feed_source(source.clone());
    }
    if let Some(path) = &cli.database {
        builder = builder.with_database_path(path.clone());
    }
    builder.build()
}

fn build_feed(config: &RedeemConfig) -> Result<Arc<dyn CodeFeed>> {
    Ok(match HttpCodeFeed::from_config(config)? {
        Some(feed) => Arc::new(feed),
        None => {
            info!("No codes feed configured; using stored codes only");
            Arc::new(StaticFeed::empty())
        }
    })
}

fn live_client(simulate: bool) -> Result<Arc<dyn RedeemClient>> {
    if !simulate {
        bail!("no live redemption client is available in this build; pass --simulate");
    }
    warn!("Using the simulated redemption client; nothing is sent to the rewards platform");
    Ok(Arc::new(SimulatedRedeemClient))
}

fn exit_code(successful: bool) -> ExitCode {
    if successful {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let config = build_config(&cli);
    let storage: Arc<dyn KeyStorage> = SqliteKeyStore::open(&config.database_path()).await?;
    let feed = build_feed(&config)?;

    match cli.command {
        Command::Plan { code, platforms } => {
            let planner = RedemptionPlanner::new(storage, feed, config.bypass_failures);
            let plan = planner.plan(&code, &platforms).await?;
            let rendered = serde_json::to_string_pretty(&plan.to_json())
                .context("Failed to render plan")?;
            println!("{}", rendered);
            Ok(ExitCode::SUCCESS)
        }
        Command::Status { code } => {
            let code = NormalizedCode::parse(&code)?;
            let keys = storage.fetch_keys_for_code(&code).await?;
            if keys.is_empty() {
                println!("{} is not in the store", code);
                return Ok(exit_code(false));
            }
            for key in &keys {
                println!(
                    "{} {} [{}] reward={} source={}",
                    code,
                    key.game,
                    key.platform.as_str(),
                    key.reward,
                    key.source.as_deref().unwrap_or("-")
                );
            }
            let mut outcomes = storage.fetch_successes_for_code(&code).await?;
            outcomes.extend(storage.fetch_failures_for_code(&code).await?);
            outcomes.sort_by_key(|o| (o.game.rank(), o.platform.rank()));
            for outcome in &outcomes {
                println!(
                    "  {}:{} {} at {}: {}",
                    outcome.platform,
                    outcome.game,
                    outcome.status,
                    outcome.attempted_at.to_rfc3339(),
                    outcome.detail.as_deref().unwrap_or("")
                );
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Redeem { code, platforms, simulate } => {
            let client = live_client(simulate)?;
            let mut session = RedemptionSession::new(&config, storage, feed, client);
            let report = session.redeem_code(&code, &platforms).await?;

            for skipped in &report.skipped {
                println!(
                    "{}:{} skipped ({}{})",
                    skipped.platform,
                    skipped.game,
                    skipped.reason.as_str(),
                    skipped
                        .label
                        .as_deref()
                        .map(|l| format!(", {}", l))
                        .unwrap_or_default()
                );
            }
            for result in &report.summary.results {
                println!("{}:{} {} - {}", result.platform, result.game, result.status, result.detail);
            }
            Ok(exit_code(report.summary.is_successful()))
        }
        Command::Bulk {
            targets,
            golden,
            non_golden,
            other,
            limit,
            simulate,
        } => {
            let mapping = RedeemMapping::parse(&targets)?;
            let client = live_client(simulate)?;
            let filter = RewardFilter {
                golden,
                non_golden,
                other,
            };
            let limit = limit.unwrap_or(config.default_limit);
            let mut session = RedemptionSession::new(&config, storage, feed, client);
            let summary = session.redeem_mapping(&mapping, filter, limit).await?;

            println!(
                "{} succeeded, {} already redeemed, {} failed, {} skipped{}",
                summary.succeeded,
                summary.already_redeemed,
                summary.failed,
                summary.skipped(),
                if summary.halted { " (stopped: try again later)" } else { "" }
            );
            Ok(exit_code(summary.is_successful()))
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    tokio::select! {
        result = run(cli) => result,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted; outcomes recorded so far are kept");
            Ok(ExitCode::from(130))
        }
    }
}
