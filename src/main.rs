use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use clap::{Args, Parser, Subcommand};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use stock_ingest::api::YahooClient;
use stock_ingest::database::Database;
use stock_ingest::models::Config;
use stock_ingest::orchestrator::{
    install_ctrl_c_handler, Orchestrator, OrchestratorSettings, OutcomeKind, RunMode, RunRequest,
    RunSummary,
};
use stock_ingest::registry::TickerSync;
use stock_ingest::status::{StatusReport, TickerDetail};

#[derive(Parser, Debug)]
#[command(name = "stock-ingest", author, version, about = "Resumable US equity price and fundamentals ingestion", long_about = None)]
struct Cli {
    /// SQLite database path (overrides DATABASE_PATH)
    #[arg(long, global = true)]
    database: Option<String>,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug, Clone)]
struct Selection {
    /// Comma separated tickers; every active ticker when omitted
    #[arg(long, value_delimiter = ',')]
    tickers: Vec<String>,

    /// Maximum number of tickers processed in this run
    #[arg(long)]
    limit: Option<usize>,

    /// Treat this date (YYYY-MM-DD) as today
    #[arg(long)]
    as_of: Option<NaiveDate>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the database and schema
    InitDb,
    /// Refresh the ticker registry from the exchange listings
    SyncTickers,
    /// List active tickers missing from the current listing
    DetectDelistings,
    /// Backfill price history
    Download {
        #[command(flatten)]
        selection: Selection,
        /// Re-fetch tickers that are already complete
        #[arg(long)]
        no_resume: bool,
    },
    /// Fetch prices since the last covered date
    Update {
        #[command(flatten)]
        selection: Selection,
        /// Refresh stale fundamentals afterwards
        #[arg(long)]
        with_fundamentals: bool,
    },
    /// Retry failed tickers, oldest failure first
    RetryFailed {
        #[command(flatten)]
        selection: Selection,
    },
    /// Fetch fundamentals snapshots
    Fundamentals {
        #[command(flatten)]
        selection: Selection,
        /// Ignore the staleness threshold
        #[arg(long)]
        force: bool,
    },
    /// Show download progress
    Status {
        /// Detail for a single ticker
        #[arg(long)]
        ticker: Option<String>,
        /// Number of recent failures to list
        #[arg(long, default_value_t = 10)]
        errors: usize,
    },
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("stock_ingest=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("stock_ingest=info"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!("❌ {:#}", e);
            eprintln!("❌ Error: {:#}", e);
            ExitCode::from(1)
        }
    }
}

async fn run(cli: Cli) -> Result<u8> {
    let mut config = Config::from_env().context("failed to load configuration")?;
    if let Some(database) = cli.database {
        config.database_path = database;
    }

    let db = Arc::new(
        Database::new(&config.database_path)
            .await
            .with_context(|| format!("failed to open database {}", config.database_path))?,
    );

    match cli.command {
        Command::InitDb => {
            println!("✅ Database initialized at {}", config.database_path);
            Ok(0)
        }

        Command::SyncTickers => {
            let stats = TickerSync::from_config(&config)?.sync(&db).await?;
            println!("✅ Ticker registry synced");
            println!("   - Listed: {}", stats.total);
            println!("   - New: {}", stats.new);
            println!("   - Updated: {}", stats.updated);
            println!("   - Deactivated: {}", stats.deactivated);
            println!("   - Reactivated: {}", stats.reactivated);
            Ok(0)
        }

        Command::DetectDelistings => {
            let delisted = TickerSync::from_config(&config)?.detect_delistings(&db).await?;
            if delisted.is_empty() {
                println!("✅ Every active ticker is still listed");
            } else {
                println!("⚠️ {} active tickers are no longer listed:", delisted.len());
                for symbol in &delisted {
                    println!("   - {}", symbol);
                }
            }
            Ok(0)
        }

        Command::Download { selection, no_resume } => {
            let orchestrator = build_orchestrator(&config, &db)?;
            let request = request(RunMode::FullBackfill, &selection).with_resume(!no_resume);
            execute(&orchestrator, request).await
        }

        Command::Update {
            selection,
            with_fundamentals,
        } => {
            let orchestrator = build_orchestrator(&config, &db)?;
            let code = execute(&orchestrator, request(RunMode::IncrementalUpdate, &selection)).await?;
            if !with_fundamentals || code == 1 {
                return Ok(code);
            }
            let fundamentals = execute(&orchestrator, request(RunMode::Fundamentals, &selection)).await?;
            Ok(combine_exit_codes(code, fundamentals))
        }

        Command::RetryFailed { selection } => {
            let orchestrator = build_orchestrator(&config, &db)?;
            execute(&orchestrator, request(RunMode::RetryFailed, &selection)).await
        }

        Command::Fundamentals { selection, force } => {
            let orchestrator = build_orchestrator(&config, &db)?;
            let request = request(RunMode::Fundamentals, &selection).with_resume(!force);
            execute(&orchestrator, request).await
        }

        Command::Status { ticker, errors } => {
            match ticker {
                Some(ticker) => match TickerDetail::collect(&db, &ticker).await? {
                    Some(detail) => println!("{}", detail),
                    None => println!("❓ No progress recorded for {}", ticker.to_uppercase()),
                },
                None => {
                    let report = StatusReport::collect(&db, Utc::now().date_naive(), errors).await?;
                    println!("{}", report);
                }
            }
            Ok(0)
        }
    }
}

fn build_orchestrator(config: &Config, db: &Arc<Database>) -> Result<Orchestrator> {
    let fetcher = Arc::new(YahooClient::new(config)?);
    let orchestrator = Orchestrator::new(
        fetcher,
        db.clone(),
        db.clone(),
        OrchestratorSettings::from_config(config),
    );
    install_ctrl_c_handler(orchestrator.cancel_handle());
    Ok(orchestrator)
}

fn request(mode: RunMode, selection: &Selection) -> RunRequest {
    let as_of = selection.as_of.unwrap_or_else(|| Utc::now().date_naive());
    let mut request = RunRequest::new(mode, as_of);
    if !selection.tickers.is_empty() {
        request = request.with_tickers(selection.tickers.iter().map(String::as_str));
    }
    if let Some(limit) = selection.limit {
        request = request.with_limit(limit);
    }
    request
}

async fn execute(orchestrator: &Orchestrator, request: RunRequest) -> Result<u8> {
    let summary = orchestrator.run(request).await?;
    print_summary(&summary);
    Ok(summary.exit_code())
}

/// A fatal exit wins over failures, failures over a clean run
fn combine_exit_codes(first: u8, second: u8) -> u8 {
    match (first, second) {
        (1, _) | (_, 1) => 1,
        (2, _) | (_, 2) => 2,
        _ => 0,
    }
}

fn print_summary(summary: &RunSummary) {
    info!("📊 Run {} ({}) finished with status {}", summary.run_id, summary.mode, summary.status);
    println!("📊 {} run {}: {}", summary.mode, summary.run_id, summary.status);
    println!("   - Fetched: {}", summary.fetched);
    println!("   - Empty: {}", summary.empty);
    println!("   - Skipped: {}", summary.skipped);
    println!("   - Failed: {}", summary.failed);
    println!("   - Rows written: {}", summary.rows_written);
    println!("   - Remaining: {}", summary.remaining);
    println!("   - Elapsed: {:.1?}", summary.elapsed);

    if summary.mode == RunMode::RetryFailed {
        println!("🔁 Retried tickers:");
        for outcome in &summary.outcomes {
            println!("   - {}", outcome);
        }
        return;
    }

    let failures: Vec<_> = summary
        .outcomes
        .iter()
        .filter_map(|o| match &o.kind {
            OutcomeKind::Failed(kind) => Some((o, kind)),
            _ => None,
        })
        .collect();
    if !failures.is_empty() {
        println!("❌ Failed tickers:");
        for (outcome, kind) in failures.iter().take(20) {
            println!(
                "   - {} [{}] {}",
                outcome.ticker,
                kind,
                outcome.message.as_deref().unwrap_or_default()
            );
        }
        if failures.len() > 20 {
            println!("   ... and {} more", failures.len() - 20);
        }
    }
}
