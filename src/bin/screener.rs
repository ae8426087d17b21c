//! CLI entry point: a thin `clap`-derive wrapper around
//! `kr_equity_snapshot`'s three batch sub-pipelines.

use std::path::PathBuf;
use std::process::ExitCode;

use chrono::NaiveDate;
use clap::Parser;
use kr_equity_snapshot::config::Config;
use kr_equity_snapshot::market_data::KrxClient;
use kr_equity_snapshot::orchestrator::BatchOrchestrator;
use kr_equity_snapshot::scraper::{ReserveRatioScraper, ScraperConfig};
use kr_equity_snapshot::storage::Storage;

/// Run the daily batch for the stock screener.
#[derive(Parser, Debug)]
#[command(name = "screener", version, about)]
struct Args {
    #[arg(long, value_name = "PATH")]
    db_path: Option<PathBuf>,

    #[arg(long, value_name = "YYYY-MM-DD")]
    asof_date: Option<String>,

    #[arg(long)]
    lookback_days: Option<i64>,

    #[arg(long, default_value = "info")]
    log_level: String,

    /// Rebuild the snapshot from cached DB data only.
    #[arg(long)]
    snapshot_only: bool,

    /// Update reserve ratio only (Naver crawl).
    #[arg(long)]
    update_reserve_only: bool,

    /// With `--update-reserve-only`, rebuild `snapshot_metrics` right after.
    #[arg(long)]
    rebuild_snapshot: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(args.log_level.clone()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e:#}");
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> anyhow::Result<()> {
    let mut config = Config::from_env();
    if let Some(db_path) = args.db_path {
        config.db_path = db_path;
    }
    if let Some(lookback) = args.lookback_days {
        config.lookback_days = lookback;
    }
    let asof = args
        .asof_date
        .as_deref()
        .map(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d"))
        .transpose()?;

    let storage = Storage::open(&config.db_path)?;
    let market = KrxClient::new(
        "https://krx-data.internal",
        config.market_data_retries,
        config.market_data_backoff_base_secs,
    );
    let scraper = ReserveRatioScraper::new(ScraperConfig {
        retries: config.scraper_retries,
        sleep_seconds: config.scraper_backoff_base_secs,
        timeout_seconds: config.scraper_timeout_secs,
        max_workers: config.scraper_max_workers,
        save_parse_miss_html: true,
        parse_miss_html_path: config.parse_miss_html_path.clone(),
    });
    let orchestrator = BatchOrchestrator::new(&storage, &market, &scraper);

    if args.update_reserve_only {
        let result = orchestrator.update_reserve_ratio_only(asof)?;
        println!(
            "reserve_ratio updated: asof={}, rows={}",
            result.asof_date, result.snapshot_rows
        );

        if args.rebuild_snapshot {
            let snapshot = orchestrator.rebuild_snapshot_only(Some(result.asof_date), config.lookback_days)?;
            println!(
                "snapshot_metrics rebuilt: asof={}, rows={}",
                snapshot.asof_date, snapshot.snapshot_rows
            );
        } else {
            let warning = "reserve_ratio is updated but snapshot_metrics is unchanged. \
                Run --snapshot-only or add --rebuild-snapshot to reflect reserve_ratio changes in the UI.";
            tracing::warn!("{warning}");
            println!("{warning}");
        }
    } else if args.snapshot_only {
        let result = orchestrator.rebuild_snapshot_only(asof, config.lookback_days)?;
        println!("{result:?}");
    } else {
        let result = orchestrator.run(asof, config.lookback_days)?;
        println!("{result:?}");
    }

    Ok(())
}
