//! Batch Orchestrator (C5, §4.5). Three sub-pipelines sharing one `Storage`
//! and one `MarketDataClient`.

use chrono::{Datelike, NaiveDate};
use uuid::Uuid;

use crate::errors::{Result, ScreenerError};
use crate::market_data::MarketDataClient;
use crate::metrics;
use crate::scraper::ReserveRatioScraper;
use crate::storage::Storage;
use crate::types::{SnapshotRow, Ticker};

/// Counts from one pipeline run, logged and returned for CLI reporting.
#[derive(Debug, Clone, Default)]
pub struct BatchResult {
    pub asof_date: NaiveDate,
    pub tickers_refreshed: usize,
    pub price_rows: usize,
    pub cap_rows: usize,
    pub fundamental_rows: usize,
    pub snapshot_rows: usize,
}

pub struct BatchOrchestrator<'a> {
    storage: &'a Storage,
    market: &'a dyn MarketDataClient,
    scraper: &'a ReserveRatioScraper,
}

const TICKER_PROGRESS_EVERY: usize = 200;
const DATE_PROGRESS_EVERY: usize = 30;

impl<'a> BatchOrchestrator<'a> {
    pub fn new(
        storage: &'a Storage,
        market: &'a dyn MarketDataClient,
        scraper: &'a ReserveRatioScraper,
    ) -> Self {
        Self {
            storage,
            market,
            scraper,
        }
    }

    /// Full run: refresh tickers, OHLCV, market-cap, fundamentals, then
    /// rebuild the snapshot. §4.5 steps 1-6.
    pub fn run(&self, asof: Option<NaiveDate>, lookback_days: i64) -> Result<BatchResult> {
        let run_id = Uuid::new_v4().to_string();
        let asof = match asof {
            Some(d) => d,
            None => self.market.recent_business_day()?,
        };
        tracing::info!(run_id, %asof, "starting full batch run");

        let tickers = self.refresh_tickers(&run_id)?;

        let window_start = asof - chrono::Duration::days(2 * lookback_days);
        let price_rows = self.refresh_prices(&run_id, &tickers, window_start, asof)?;

        let trading_dates = self.market.trading_dates(window_start, asof)?;
        let cap_rows = self.refresh_market_cap(&run_id, &trading_dates)?;

        let fundamental_window_start = asof
            .with_year(asof.year() - 6)
            .unwrap_or(window_start);
        let fundamental_trading_dates = self
            .market
            .trading_dates(fundamental_window_start, asof)?;
        let anchors = fundamental_anchor_dates(&fundamental_trading_dates, asof);
        let fundamental_rows = self.refresh_fundamentals(&run_id, &anchors)?;

        let snapshot_rows = self.rebuild_snapshot(&run_id, asof, lookback_days)?;

        self.storage
            .log_stage(&run_id, "full_run", "success", Some(snapshot_rows as i64), None)?;
        Ok(BatchResult {
            asof_date: asof,
            tickers_refreshed: tickers.len(),
            price_rows,
            cap_rows,
            fundamental_rows,
            snapshot_rows,
        })
    }

    /// Snapshot-only rebuild: resolve `asof`, then run step 6 alone.
    pub fn rebuild_snapshot_only(
        &self,
        asof: Option<NaiveDate>,
        lookback_days: i64,
    ) -> Result<BatchResult> {
        let run_id = Uuid::new_v4().to_string();
        let asof = self.resolve_snapshot_asof(asof)?;

        if self.storage.count_active_tickers()? == 0 {
            return Err(ScreenerError::EmptyCache {
                remediation: "ticker_master is empty; run a full batch at least once before rebuilding a snapshot".into(),
            });
        }
        let has_prices = !self.storage.get_price_window(asof, 1)?.is_empty();
        if !has_prices {
            return Err(ScreenerError::EmptyCache {
                remediation: format!("no cached price data for {asof}; run a full batch first"),
            });
        }

        let snapshot_rows = self.rebuild_snapshot(&run_id, asof, lookback_days)?;
        self.storage.log_stage(
            &run_id,
            "rebuild_snapshot_only",
            "success",
            Some(snapshot_rows as i64),
            None,
        )?;
        Ok(BatchResult {
            asof_date: asof,
            snapshot_rows,
            ..Default::default()
        })
    }

    /// Reserve-only update: resolve `asof`, ensure a ticker list exists,
    /// scrape, upsert `(ticker, reserve_ratio)` onto the existing snapshot.
    /// Does **not** chain a snapshot rebuild — callers that need the rebuilt
    /// snapshot call `rebuild_snapshot_only` afterward themselves.
    pub fn update_reserve_ratio_only(&self, asof: Option<NaiveDate>) -> Result<BatchResult> {
        let run_id = Uuid::new_v4().to_string();
        let asof = self.resolve_snapshot_asof(asof)?;

        let mut tickers = self.storage.list_tickers(true)?;
        if tickers.is_empty() {
            tickers = self.refresh_tickers(&run_id)?;
        }
        let ticker_ids: Vec<String> = tickers.iter().map(|t| t.ticker.clone()).collect();

        let ratios = self.scraper.latest_reserve_ratios(&ticker_ids);
        let updated = self.storage.update_reserve_ratio(&asof.to_string(), &ratios)?;

        self.storage.log_stage(
            &run_id,
            "update_reserve_ratio_only",
            "success",
            Some(updated as i64),
            None,
        )?;
        Ok(BatchResult {
            asof_date: asof,
            tickers_refreshed: tickers.len(),
            snapshot_rows: updated,
            ..Default::default()
        })
    }

    fn resolve_snapshot_asof(&self, asof: Option<NaiveDate>) -> Result<NaiveDate> {
        if let Some(d) = asof {
            return Ok(d);
        }
        if let Some(d) = self.storage.get_latest_price_date()? {
            return Ok(d);
        }
        if let Some(d) = self.storage.get_latest_snapshot_date()? {
            return Ok(d);
        }
        Err(ScreenerError::EmptyCache {
            remediation: "no asof date given and storage has no price or snapshot history to infer one from".into(),
        })
    }

    fn refresh_tickers(&self, run_id: &str) -> Result<Vec<Ticker>> {
        let tickers = self.market.tickers()?;
        let n = self.storage.upsert_tickers(&tickers)?;
        tracing::info!(run_id, count = n, "refreshed ticker master");
        self.storage.log_stage(run_id, "refresh_tickers", "success", Some(n as i64), None)?;
        Ok(tickers)
    }

    fn refresh_prices(
        &self,
        run_id: &str,
        tickers: &[Ticker],
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<usize> {
        let total = tickers.len();
        let mut total_rows = 0usize;
        for (i, ticker) in tickers.iter().enumerate() {
            let rows = self.market.ohlcv(from, to, &ticker.ticker)?;
            total_rows += self.storage.upsert_prices(&rows)?;
            if (i + 1) % TICKER_PROGRESS_EVERY == 0 || i + 1 == total {
                tracing::info!(run_id, done = i + 1, total, "OHLCV refresh progress");
            }
        }
        self.storage
            .log_stage(run_id, "refresh_prices", "success", Some(total_rows as i64), None)?;
        Ok(total_rows)
    }

    fn refresh_market_cap(&self, run_id: &str, trading_dates: &[NaiveDate]) -> Result<usize> {
        let total = trading_dates.len();
        let mut total_rows = 0usize;
        for (i, date) in trading_dates.iter().enumerate() {
            let rows = self.market.market_cap(*date)?;
            total_rows += self.storage.upsert_cap(&rows)?;
            if (i + 1) % DATE_PROGRESS_EVERY == 0 || i + 1 == total {
                tracing::info!(run_id, done = i + 1, total, "market-cap refresh progress");
            }
        }
        self.storage
            .log_stage(run_id, "refresh_market_cap", "success", Some(total_rows as i64), None)?;
        Ok(total_rows)
    }

    fn refresh_fundamentals(&self, run_id: &str, anchors: &[NaiveDate]) -> Result<usize> {
        let mut total_rows = 0usize;
        for anchor in anchors {
            let (sourced_date, rows) = self.market.fundamental(*anchor)?;
            if sourced_date != *anchor {
                tracing::info!(
                    run_id,
                    requested = %anchor,
                    sourced = %sourced_date,
                    "fundamentals substituted from nearest prior business day",
                );
            }
            total_rows += self.storage.upsert_fundamental(&rows)?;
        }
        self.storage.log_stage(
            run_id,
            "refresh_fundamentals",
            "success",
            Some(total_rows as i64),
            None,
        )?;
        Ok(total_rows)
    }

    fn rebuild_snapshot(&self, run_id: &str, asof: NaiveDate, lookback_days: i64) -> Result<usize> {
        let price_window = self.storage.get_price_window(asof, 2 * lookback_days)?;
        let daily = self.storage.get_daily_join(asof)?;
        let fund_hist = self.storage.get_fundamental_window(asof, 6)?;

        let rows: Vec<SnapshotRow> = metrics::build_snapshot(asof, price_window, &daily, &fund_hist);
        let n = self.storage.replace_snapshot(&asof.to_string(), &rows)?;
        tracing::info!(run_id, asof = %asof, rows = n, "snapshot rebuilt");
        self.storage
            .log_stage(run_id, "rebuild_snapshot", "success", Some(n as i64), None)?;
        Ok(n)
    }
}

/// §4.5 step 5: last trading day of each calendar month and quarter within
/// `trading_dates`, plus the last trading day on/before `asof - k years` for
/// `k` in 1..=5, plus `trading_dates`'s last date itself; de-duplicated and
/// sorted.
fn fundamental_anchor_dates(trading_dates: &[NaiveDate], asof: NaiveDate) -> Vec<NaiveDate> {
    let mut anchors = Vec::new();

    // `or_insert` keeps the first-seen date per bucket; scanning
    // `trading_dates` in reverse means that's the last trading day of the
    // month/quarter.
    let mut by_month: std::collections::BTreeMap<(i32, u32), NaiveDate> = Default::default();
    let mut by_quarter: std::collections::BTreeMap<(i32, u32), NaiveDate> = Default::default();
    for &d in trading_dates.iter().rev() {
        by_month.entry((d.year(), d.month())).or_insert(d);
        by_quarter
            .entry((d.year(), (d.month0() / 3) + 1))
            .or_insert(d);
    }
    anchors.extend(by_month.values().copied());
    anchors.extend(by_quarter.values().copied());

    for k in 1..=5 {
        if let Some(target) = asof.with_year(asof.year() - k) {
            if let Some(last_on_or_before) = trading_dates.iter().rev().find(|d| **d <= target) {
                anchors.push(*last_on_or_before);
            }
        }
    }

    if let Some(&last) = trading_dates.last() {
        anchors.push(last);
    }

    anchors.sort_unstable();
    anchors.dedup();
    anchors
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn anchor_dates_include_month_and_quarter_ends() {
        let dates = vec![
            d(2025, 1, 30),
            d(2025, 1, 31),
            d(2025, 2, 27),
            d(2025, 2, 28),
            d(2025, 3, 28),
            d(2025, 3, 31),
        ];
        let anchors = fundamental_anchor_dates(&dates, d(2025, 3, 31));
        assert!(anchors.contains(&d(2025, 1, 31)));
        assert!(anchors.contains(&d(2025, 2, 28)));
        assert!(anchors.contains(&d(2025, 3, 31)));
    }

    #[test]
    fn anchor_dates_are_sorted_and_deduplicated() {
        let dates = vec![d(2025, 1, 31), d(2025, 2, 28), d(2025, 3, 31)];
        let anchors = fundamental_anchor_dates(&dates, d(2025, 3, 31));
        let mut sorted = anchors.clone();
        sorted.sort_unstable();
        assert_eq!(anchors, sorted);
        let mut deduped = anchors.clone();
        deduped.dedup();
        assert_eq!(anchors.len(), deduped.len());
    }
}
