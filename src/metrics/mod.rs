//! Metrics Engine (C4, §4.4). Derives the wide per-ticker `SnapshotRow` from
//! a price window, a same-day cap+fundamentals join, and fundamentals
//! history. Rolling windows are plain `Vec<f64>` slices with explicit
//! min-periods guards rather than a dataframe library.

use chrono::{Datelike, NaiveDate};
use rayon::prelude::*;

use crate::types::{DailyJoinRow, FundamentalRow, PriceRow, SnapshotRow, CALC_VERSION};

/// A ticker's price history within the lookback window, sorted ascending by
/// date. One row per ticker is the expected shape of `Storage::get_price_window`
/// grouped by ticker.
#[derive(Debug, Clone)]
pub struct TickerSeries {
    pub ticker: String,
    pub rows: Vec<PriceRow>,
}

/// Group a flat, `(ticker, date)`-ordered price window into per-ticker
/// series, preserving ascending date order within each group.
pub fn group_by_ticker(rows: Vec<PriceRow>) -> Vec<TickerSeries> {
    let mut out: Vec<TickerSeries> = Vec::new();
    for row in rows {
        match out.last_mut() {
            Some(series) if series.ticker == row.ticker => series.rows.push(row),
            _ => out.push(TickerSeries {
                ticker: row.ticker.clone(),
                rows: vec![row],
            }),
        }
    }
    out
}

fn rolling_mean(values: &[f64], window: usize) -> Option<f64> {
    if values.len() < window || window == 0 {
        return None;
    }
    let slice = &values[values.len() - window..];
    Some(slice.iter().sum::<f64>() / window as f64)
}

fn rolling_max(values: &[f64], window: usize) -> Option<f64> {
    if values.len() < window || window == 0 {
        return None;
    }
    let slice = &values[values.len() - window..];
    slice.iter().copied().fold(None, |acc, v| {
        Some(acc.map_or(v, |m: f64| m.max(v)))
    })
}

fn rolling_min(values: &[f64], window: usize) -> Option<f64> {
    if values.len() < window || window == 0 {
        return None;
    }
    let slice = &values[values.len() - window..];
    slice.iter().copied().fold(None, |acc, v| {
        Some(acc.map_or(v, |m: f64| m.min(v)))
    })
}

/// Population-style sample standard deviation (`ddof=1`, matching pandas'
/// `Series.rolling(...).std()` default) of the trailing `window` values.
fn rolling_std(values: &[f64], window: usize) -> Option<f64> {
    if values.len() < window || window < 2 {
        return None;
    }
    let slice = &values[values.len() - window..];
    let mean = slice.iter().sum::<f64>() / window as f64;
    let variance = slice.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (window as f64 - 1.0);
    Some(variance.sqrt())
}

/// `close[t] / close[t - n] - 1` by row position, `None` if either endpoint
/// is missing/zero or there aren't `n` prior rows. Only the two endpoints
/// need to be present — unlike a rolling aggregate, a point-to-point change
/// doesn't care about gaps strictly between them.
fn pct_change(closes: &[Option<f64>], n: usize) -> Option<f64> {
    if closes.len() <= n {
        return None;
    }
    let cur = closes[closes.len() - 1]?;
    let prev = closes[closes.len() - 1 - n]?;
    if prev == 0.0 {
        return None;
    }
    Some(cur / prev - 1.0)
}

/// The trailing `window` entries of `values`, or `None` if there are fewer
/// than `window` rows or any of them is missing. Mirrors pandas'
/// `min_periods == window`: a rolling aggregate needs every value in its own
/// window present, but values outside that window don't matter.
fn trailing_dense_window(values: &[Option<f64>], window: usize) -> Option<Vec<f64>> {
    if values.len() < window {
        return None;
    }
    values[values.len() - window..]
        .iter()
        .copied()
        .collect::<Option<Vec<f64>>>()
}

struct LatestRow {
    date: NaiveDate,
    close: Option<f64>,
    sma20: Option<f64>,
    sma50: Option<f64>,
    sma200: Option<f64>,
    avg_value_20d: Option<f64>,
    high_52w: Option<f64>,
    low_52w: Option<f64>,
    vol_20d: Option<f64>,
    ret_1w: Option<f64>,
    ret_1m: Option<f64>,
    ret_3m: Option<f64>,
    ret_6m: Option<f64>,
    ret_1y: Option<f64>,
}

/// Compute every rolling/derived field for one ticker's series, keeping only
/// the last (most recent) row.
fn compute_latest(series: &TickerSeries) -> Option<LatestRow> {
    let last = series.rows.last()?;
    let closes_opt: Vec<Option<f64>> = series.rows.iter().map(|r| r.close).collect();
    let values_opt: Vec<Option<f64>> = series.rows.iter().map(|r| r.value).collect();

    // Each rolling field is gated on presence over its own trailing window
    // only — a null close 700 rows back must not null sma20 or ret_1y at the
    // tail, matching pandas' `rolling(window, min_periods=window)`.
    let sma20 = trailing_dense_window(&closes_opt, 20).and_then(|w| rolling_mean(&w, 20));
    let sma50 = trailing_dense_window(&closes_opt, 50).and_then(|w| rolling_mean(&w, 50));
    let sma200 = trailing_dense_window(&closes_opt, 200).and_then(|w| rolling_mean(&w, 200));
    let high_52w = trailing_dense_window(&closes_opt, 252).and_then(|w| rolling_max(&w, 252));
    let low_52w = trailing_dense_window(&closes_opt, 252).and_then(|w| rolling_min(&w, 252));

    // vol_20d needs 20 trailing daily returns, which needs 21 trailing
    // closes all present (and no zero close in between, else a return is
    // undefined and the window can't be computed).
    let vol_20d = trailing_dense_window(&closes_opt, 21).and_then(|w| {
        let returns: Option<Vec<f64>> = w
            .windows(2)
            .map(|p| if p[0] != 0.0 { Some(p[1] / p[0] - 1.0) } else { None })
            .collect();
        returns.and_then(|r| rolling_std(&r, 20))
    });

    let ret_1w = pct_change(&closes_opt, 5);
    let ret_1m = pct_change(&closes_opt, 21);
    let ret_3m = pct_change(&closes_opt, 63);
    let ret_6m = pct_change(&closes_opt, 126);
    let ret_1y = pct_change(&closes_opt, 252);

    let avg_value_20d = trailing_dense_window(&values_opt, 20).and_then(|w| rolling_mean(&w, 20));

    Some(LatestRow {
        date: last.date,
        close: last.close,
        sma20,
        sma50,
        sma200,
        avg_value_20d,
        high_52w,
        low_52w,
        vol_20d,
        ret_1w,
        ret_1m,
        ret_3m,
        ret_6m,
        ret_1y,
    })
}

fn nearest_on_or_before(eps_history: &[(NaiveDate, f64)], target: NaiveDate) -> Option<f64> {
    eps_history
        .iter()
        .rev()
        .find(|(d, _)| *d <= target)
        .map(|(_, v)| *v)
}

/// `eps_cagr_5y` and `eps_yoy_q` for one ticker, per §4.4.
fn eps_growth_metrics(
    fund_hist: &[FundamentalRow],
    ticker: &str,
    asof: NaiveDate,
) -> (Option<f64>, Option<f64>) {
    let mut eps_series: Vec<(NaiveDate, f64)> = fund_hist
        .iter()
        .filter(|r| r.ticker == ticker)
        .filter_map(|r| r.eps.map(|eps| (r.date, eps)))
        .collect();
    eps_series.sort_by_key(|(d, _)| *d);
    if eps_series.is_empty() {
        return (None, None);
    }

    let eps_now = nearest_on_or_before(&eps_series, asof);
    let five_years_ago = asof
        .with_year(asof.year() - 5)
        .unwrap_or(asof);
    let eps_5y_ago = nearest_on_or_before(&eps_series, five_years_ago);
    let eps_cagr_5y = match (eps_now, eps_5y_ago) {
        (Some(now), Some(then)) if now > 0.0 && then > 0.0 => Some((now / then).powf(0.2) - 1.0),
        _ => None,
    };

    let q_end = quarter_end(asof);
    let q_prev_year = q_end.with_year(q_end.year() - 1).unwrap_or(q_end);
    let eps_q = nearest_on_or_before(&eps_series, q_end);
    let eps_q_prev = nearest_on_or_before(&eps_series, q_prev_year);
    let eps_yoy_q = match (eps_q, eps_q_prev) {
        (Some(q), Some(prev)) if prev > 0.0 => Some(q / prev - 1.0),
        _ => None,
    };

    (eps_cagr_5y, eps_yoy_q)
}

fn quarter_end(date: NaiveDate) -> NaiveDate {
    let quarter = (date.month0() / 3) + 1;
    let (end_month, end_day) = match quarter {
        1 => (3, 31),
        2 => (6, 30),
        3 => (9, 30),
        _ => (12, 31),
    };
    NaiveDate::from_ymd_opt(date.year(), end_month, end_day).unwrap_or(date)
}

/// Build one ticker's final `SnapshotRow` by joining its latest rolling
/// metrics with the same-day `DailyJoinRow` and fundamentals history.
fn build_row(
    asof: NaiveDate,
    series: &TickerSeries,
    daily: Option<&DailyJoinRow>,
    fund_hist: &[FundamentalRow],
) -> Option<SnapshotRow> {
    let latest = compute_latest(series)?;
    if latest.date != asof {
        return None;
    }

    let name = daily.and_then(|d| d.name.clone());
    let market = daily.and_then(|d| d.market.clone());
    let mcap = daily.and_then(|d| d.mcap);
    let per = daily.and_then(|d| d.per);
    let pbr = daily.and_then(|d| d.pbr);
    let div = daily.and_then(|d| d.div);
    let dps = daily.and_then(|d| d.dps);
    let eps = daily.and_then(|d| d.eps);
    let bps = daily.and_then(|d| d.bps);

    let roe_proxy = match (eps, bps) {
        (Some(eps), Some(bps)) if bps > 0.0 => Some(eps / bps),
        _ => None,
    };
    let eps_positive = Some(i64::from(eps.unwrap_or(0.0) > 0.0));

    let dist = |sma: Option<f64>| match (latest.close, sma) {
        (Some(c), Some(s)) if s != 0.0 => Some(c / s - 1.0),
        _ => None,
    };
    let dist_sma20 = dist(latest.sma20);
    let dist_sma50 = dist(latest.sma50);
    let dist_sma200 = dist(latest.sma200);

    let pos_52w = match (latest.close, latest.high_52w, latest.low_52w) {
        (Some(c), Some(h), Some(l)) if h - l > 0.0 => Some((c - l) / (h - l)),
        _ => None,
    };
    let near_52w_high_ratio = match (latest.close, latest.high_52w) {
        (Some(c), Some(h)) if h > 0.0 => Some(c / h),
        _ => None,
    };
    let turnover_20d = match (latest.avg_value_20d, mcap) {
        (Some(v), Some(m)) if m != 0.0 => Some(v / m),
        _ => None,
    };

    let (eps_cagr_5y, eps_yoy_q) = eps_growth_metrics(fund_hist, &series.ticker, asof);

    Some(SnapshotRow {
        asof_date: asof.to_string(),
        ticker: series.ticker.clone(),
        name,
        market,
        close: latest.close,
        mcap,
        avg_value_20d: latest.avg_value_20d,
        turnover_20d,
        per,
        pbr,
        div,
        dps,
        eps,
        bps,
        roe_proxy,
        eps_positive,
        sma20: latest.sma20,
        sma50: latest.sma50,
        sma200: latest.sma200,
        dist_sma20,
        dist_sma50,
        dist_sma200,
        high_52w: latest.high_52w,
        low_52w: latest.low_52w,
        pos_52w,
        near_52w_high_ratio,
        vol_20d: latest.vol_20d,
        ret_1w: latest.ret_1w,
        ret_1m: latest.ret_1m,
        ret_3m: latest.ret_3m,
        ret_6m: latest.ret_6m,
        ret_1y: latest.ret_1y,
        eps_cagr_5y,
        eps_yoy_q,
        reserve_ratio: None,
        calc_version: CALC_VERSION.to_string(),
    })
}

/// Build the full snapshot for `asof`, one row per ticker that has a price
/// row dated exactly `asof` within `price_window`. Per-ticker computation
/// runs on a `rayon` thread pool since each ticker's rolling-window math is
/// independent of every other's.
pub fn build_snapshot(
    asof: NaiveDate,
    price_window: Vec<PriceRow>,
    daily: &[DailyJoinRow],
    fund_hist: &[FundamentalRow],
) -> Vec<SnapshotRow> {
    let series = group_by_ticker(price_window);
    let daily_by_ticker: std::collections::HashMap<&str, &DailyJoinRow> =
        daily.iter().map(|d| (d.ticker.as_str(), d)).collect();

    series
        .par_iter()
        .filter_map(|s| {
            let daily_row = daily_by_ticker.get(s.ticker.as_str()).copied();
            build_row(asof, s, daily_row, fund_hist)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DailyJoinRow;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn price(d: NaiveDate, close: f64, value: f64) -> PriceRow {
        PriceRow {
            date: d,
            ticker: "005930".into(),
            open: Some(close),
            high: Some(close),
            low: Some(close),
            close: Some(close),
            volume: Some(1000.0),
            value: Some(value),
        }
    }

    fn make_series(n: usize, start: NaiveDate) -> TickerSeries {
        let rows = (0..n)
            .map(|i| price(start + chrono::Duration::days(i as i64), 100.0 + i as f64, 1000.0))
            .collect();
        TickerSeries {
            ticker: "005930".into(),
            rows,
        }
    }

    #[test]
    fn rolling_mean_requires_full_window() {
        let values: Vec<f64> = (0..19).map(f64::from).collect();
        assert_eq!(rolling_mean(&values, 20), None);
        let values: Vec<f64> = (0..20).map(f64::from).collect();
        assert!(rolling_mean(&values, 20).is_some());
    }

    #[test]
    fn sma_is_null_with_insufficient_history() {
        let series = make_series(10, date(2026, 1, 1));
        let latest = compute_latest(&series).unwrap();
        assert!(latest.sma20.is_none());
    }

    #[test]
    fn sma_populates_once_window_is_full() {
        let series = make_series(20, date(2026, 1, 1));
        let latest = compute_latest(&series).unwrap();
        assert!(latest.sma20.is_some());
        assert!(latest.sma50.is_none());
    }

    #[test]
    fn a_single_interior_null_close_does_not_null_the_whole_ticker() {
        let mut series = make_series(300, date(2025, 1, 1));
        // Knock out one close far back in the history, well outside every
        // rolling window computed at the tail.
        series.rows[10].close = None;
        let latest = compute_latest(&series).unwrap();
        assert!(latest.sma20.is_some());
        assert!(latest.sma50.is_some());
        assert!(latest.sma200.is_some());
        assert!(latest.high_52w.is_some());
        assert!(latest.low_52w.is_some());
        assert!(latest.vol_20d.is_some());
        assert!(latest.ret_1w.is_some());
        assert!(latest.ret_1y.is_some());
    }

    #[test]
    fn a_null_close_inside_a_specific_window_only_nulls_that_window() {
        let mut series = make_series(300, date(2025, 1, 1));
        // 30 rows back is inside the sma50/sma200/high_52w windows but
        // outside the sma20 window.
        let idx = series.rows.len() - 30;
        series.rows[idx].close = None;
        let latest = compute_latest(&series).unwrap();
        assert!(latest.sma20.is_some());
        assert!(latest.sma50.is_none());
        assert!(latest.sma200.is_none());
    }

    #[test]
    fn pos_52w_null_when_high_equals_low() {
        let rows = vec![price(date(2026, 1, 1), 100.0, 1.0); 252];
        let series = TickerSeries {
            ticker: "005930".into(),
            rows,
        };
        let daily = DailyJoinRow {
            ticker: "005930".into(),
            mcap: Some(1.0),
            ..Default::default()
        };
        let row = build_row(date(2026, 1, 1), &series, Some(&daily), &[]).unwrap();
        assert_eq!(row.pos_52w, None);
    }

    #[test]
    fn roe_proxy_null_when_bps_non_positive() {
        let series = make_series(1, date(2026, 1, 1));
        let daily = DailyJoinRow {
            ticker: "005930".into(),
            eps: Some(500.0),
            bps: Some(0.0),
            ..Default::default()
        };
        let row = build_row(date(2026, 1, 1), &series, Some(&daily), &[]).unwrap();
        assert_eq!(row.roe_proxy, None);
    }

    #[test]
    fn eps_cagr_5y_requires_both_endpoints_positive() {
        let fund_hist = vec![
            FundamentalRow {
                date: date(2021, 1, 1),
                ticker: "005930".into(),
                per: None,
                pbr: None,
                eps: Some(-10.0),
                bps: None,
                div: None,
                dps: None,
            },
            FundamentalRow {
                date: date(2026, 1, 1),
                ticker: "005930".into(),
                per: None,
                pbr: None,
                eps: Some(500.0),
                bps: None,
                div: None,
                dps: None,
            },
        ];
        let (cagr, _) = eps_growth_metrics(&fund_hist, "005930", date(2026, 1, 1));
        assert_eq!(cagr, None);
    }

    #[test]
    fn eps_cagr_5y_computed_when_both_endpoints_positive() {
        let fund_hist = vec![
            FundamentalRow {
                date: date(2021, 1, 1),
                ticker: "005930".into(),
                per: None,
                pbr: None,
                eps: Some(100.0),
                bps: None,
                div: None,
                dps: None,
            },
            FundamentalRow {
                date: date(2026, 1, 1),
                ticker: "005930".into(),
                per: None,
                pbr: None,
                eps: Some(200.0),
                bps: None,
                div: None,
                dps: None,
            },
        ];
        let (cagr, _) = eps_growth_metrics(&fund_hist, "005930", date(2026, 1, 1));
        assert!(cagr.is_some());
        assert!((cagr.unwrap() - (2f64.powf(0.2) - 1.0)).abs() < 1e-9);
    }

    #[test]
    fn build_snapshot_skips_tickers_without_a_row_on_asof() {
        let series = make_series(5, date(2026, 1, 1));
        let snapshot = build_snapshot(date(2099, 1, 1), series.rows, &[], &[]);
        assert!(snapshot.is_empty());
    }
}
