//! End-to-end coverage of `BatchOrchestrator`'s three sub-pipelines, backed
//! by a fake `MarketDataClient` so no network access is required.

use std::sync::Mutex;

use chrono::NaiveDate;
use kr_equity_snapshot::errors::{Result, ScreenerError};
use kr_equity_snapshot::market_data::MarketDataClient;
use kr_equity_snapshot::orchestrator::BatchOrchestrator;
use kr_equity_snapshot::scraper::{ReserveRatioScraper, ScraperConfig};
use kr_equity_snapshot::storage::Storage;
use kr_equity_snapshot::types::{CapRow, FundamentalRow, Market, PriceRow, Ticker};

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

/// Deterministic in-memory market-data double: a flat close price that
/// climbs by one won per day, so rolling windows have unambiguous values.
struct FakeMarket {
    tickers: Vec<Ticker>,
    business_day: NaiveDate,
    fail_schema: Mutex<bool>,
}

impl FakeMarket {
    fn new(business_day: NaiveDate) -> Self {
        Self {
            tickers: vec![Ticker {
                ticker: "005930".into(),
                name: "Samsung Electronics".into(),
                market: Market::Kospi,
                active_flag: true,
            }],
            business_day,
            fail_schema: Mutex::new(false),
        }
    }
}

impl MarketDataClient for FakeMarket {
    fn recent_business_day(&self) -> Result<NaiveDate> {
        Ok(self.business_day)
    }

    fn trading_dates(&self, from: NaiveDate, to: NaiveDate) -> Result<Vec<NaiveDate>> {
        let mut dates = Vec::new();
        let mut d = from;
        while d <= to {
            dates.push(d);
            d += chrono::Duration::days(1);
        }
        Ok(dates)
    }

    fn tickers(&self) -> Result<Vec<Ticker>> {
        Ok(self.tickers.clone())
    }

    fn ohlcv(&self, from: NaiveDate, to: NaiveDate, ticker: &str) -> Result<Vec<PriceRow>> {
        if *self.fail_schema.lock().unwrap() {
            return Err(ScreenerError::SchemaMissingColumn {
                target: "close",
                observed: vec!["open".into()],
            });
        }
        let mut rows = Vec::new();
        let mut d = from;
        let mut base = 100.0;
        while d <= to {
            rows.push(PriceRow {
                date: d,
                ticker: ticker.to_string(),
                open: Some(base),
                high: Some(base + 1.0),
                low: Some(base - 1.0),
                close: Some(base),
                volume: Some(1000.0),
                value: Some(base * 1000.0),
            });
            base += 1.0;
            d += chrono::Duration::days(1);
        }
        Ok(rows)
    }

    fn market_cap(&self, date: NaiveDate) -> Result<Vec<CapRow>> {
        Ok(self
            .tickers
            .iter()
            .map(|t| CapRow {
                date,
                ticker: t.ticker.clone(),
                mcap: Some(1_000_000.0),
                shares: Some(100.0),
                volume: Some(1000.0),
                value: Some(100_000.0),
            })
            .collect())
    }

    fn fundamental(&self, date: NaiveDate) -> Result<(NaiveDate, Vec<FundamentalRow>)> {
        Ok((
            date,
            self.tickers
                .iter()
                .map(|t| FundamentalRow {
                    date,
                    ticker: t.ticker.clone(),
                    per: Some(10.0),
                    pbr: Some(1.5),
                    eps: Some(500.0),
                    bps: Some(5000.0),
                    div: Some(2.0),
                    dps: Some(100.0),
                })
                .collect(),
        ))
    }
}

fn open_temp_storage() -> (tempfile::TempDir, Storage) {
    let dir = tempfile::tempdir().unwrap();
    let storage = Storage::open(&dir.path().join("screener.db")).unwrap();
    (dir, storage)
}

fn empty_scraper() -> ReserveRatioScraper {
    ReserveRatioScraper::new(ScraperConfig {
        retries: 1,
        sleep_seconds: 0.0,
        timeout_seconds: 1,
        max_workers: 1,
        save_parse_miss_html: false,
        parse_miss_html_path: std::env::temp_dir().join("unused.html"),
    })
}

#[test]
fn full_run_produces_a_snapshot_row_per_ticker() {
    let (_dir, storage) = open_temp_storage();
    let market = FakeMarket::new(date(2026, 3, 2));
    let scraper = empty_scraper();
    let orchestrator = BatchOrchestrator::new(&storage, &market, &scraper);

    let result = orchestrator.run(None, 400).unwrap();

    assert_eq!(result.asof_date, date(2026, 3, 2));
    assert_eq!(result.tickers_refreshed, 1);
    assert_eq!(result.snapshot_rows, 1);

    let snapshot = storage.load_snapshot("2026-03-02").unwrap();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].ticker, "005930");
    assert_eq!(snapshot[0].calc_version, "v1.1");

    // Fundamental anchors must reach back a full 6 years so eps_cagr_5y (which
    // needs an EPS observation at asof - 5y) can ever be non-null.
    assert!(snapshot[0].eps_cagr_5y.is_some());
}

#[test]
fn snapshot_only_rebuild_fails_on_empty_cache() {
    let (_dir, storage) = open_temp_storage();
    let market = FakeMarket::new(date(2026, 3, 2));
    let scraper = empty_scraper();
    let orchestrator = BatchOrchestrator::new(&storage, &market, &scraper);

    let err = orchestrator
        .rebuild_snapshot_only(Some(date(2026, 3, 2)), 400)
        .unwrap_err();
    assert!(matches!(err, ScreenerError::EmptyCache { .. }));
}

#[test]
fn snapshot_only_rebuild_succeeds_after_full_run() {
    let (_dir, storage) = open_temp_storage();
    let market = FakeMarket::new(date(2026, 3, 2));
    let scraper = empty_scraper();
    let orchestrator = BatchOrchestrator::new(&storage, &market, &scraper);

    orchestrator.run(None, 400).unwrap();
    let result = orchestrator
        .rebuild_snapshot_only(Some(date(2026, 3, 2)), 400)
        .unwrap();
    assert_eq!(result.snapshot_rows, 1);
}

#[test]
fn schema_missing_column_is_fatal_to_the_run() {
    let (_dir, storage) = open_temp_storage();
    let market = FakeMarket::new(date(2026, 3, 2));
    *market.fail_schema.lock().unwrap() = true;
    let scraper = empty_scraper();
    let orchestrator = BatchOrchestrator::new(&storage, &market, &scraper);

    let err = orchestrator.run(None, 400).unwrap_err();
    assert!(matches!(err, ScreenerError::SchemaMissingColumn { .. }));
}

#[test]
fn reserve_only_update_on_empty_universe_is_a_no_op() {
    let (_dir, storage) = open_temp_storage();
    let market = FakeMarket {
        tickers: Vec::new(),
        business_day: date(2026, 3, 2),
        fail_schema: Mutex::new(false),
    };
    let scraper = empty_scraper();
    let orchestrator = BatchOrchestrator::new(&storage, &market, &scraper);

    let result = orchestrator
        .update_reserve_ratio_only(Some(date(2026, 3, 2)))
        .unwrap();
    assert_eq!(result.snapshot_rows, 0);
}

#[test]
fn resolve_asof_without_history_or_input_is_an_empty_cache_error() {
    let (_dir, storage) = open_temp_storage();
    let market = FakeMarket::new(date(2026, 3, 2));
    let scraper = empty_scraper();
    let orchestrator = BatchOrchestrator::new(&storage, &market, &scraper);

    let err = orchestrator.rebuild_snapshot_only(None, 400).unwrap_err();
    assert!(matches!(err, ScreenerError::EmptyCache { .. }));
}

