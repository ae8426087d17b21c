//! Typed rows for every persisted entity (§3 DATA MODEL).
//!
//! Source data arrives as heterogeneous, inconsistently-columned tabular
//! frames from the upstream data sources. Rather than pass `DataFrame`-like
//! structures between stages, each entity gets one struct here with explicit
//! `Option<T>` fields wherever the column can legitimately be missing.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Metrics-engine algorithm version, stamped onto every `SnapshotRow`.
pub const CALC_VERSION: &str = "v1.1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Market {
    Kospi,
    Kosdaq,
}

impl Market {
    pub fn as_str(self) -> &'static str {
        match self {
            Market::Kospi => "KOSPI",
            Market::Kosdaq => "KOSDAQ",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "KOSPI" => Some(Market::Kospi),
            "KOSDAQ" => Some(Market::Kosdaq),
            _ => None,
        }
    }
}

/// An equity identifier, plus display metadata. Never deleted; `active_flag`
/// governs visibility.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticker {
    pub ticker: String,
    pub name: String,
    pub market: Market,
    pub active_flag: bool,
}

/// Daily OHLCV for one `(date, ticker)`. `value` (trade value in won) may be
/// null until backfilled from the market-cap source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceRow {
    pub date: NaiveDate,
    pub ticker: String,
    pub open: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub close: Option<f64>,
    pub volume: Option<f64>,
    pub value: Option<f64>,
}

/// Market-cap + authoritative trade-value series for one `(date, ticker)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapRow {
    pub date: NaiveDate,
    pub ticker: String,
    pub mcap: Option<f64>,
    pub shares: Option<f64>,
    pub volume: Option<f64>,
    pub value: Option<f64>,
}

/// Valuation fundamentals for one `(date, ticker)`, populated only on anchor
/// dates (§4.5 step 5), not every trading day.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FundamentalRow {
    pub date: NaiveDate,
    pub ticker: String,
    pub per: Option<f64>,
    pub pbr: Option<f64>,
    pub eps: Option<f64>,
    pub bps: Option<f64>,
    pub div: Option<f64>,
    pub dps: Option<f64>,
}

/// One ticker's crawled reserve-ratio figure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReserveRatio {
    pub ticker: String,
    pub reserve_ratio: f64,
}

/// The wide derived-metrics row emitted by the Metrics Engine (§4.4) and
/// persisted by `Storage::replace_snapshot`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SnapshotRow {
    pub asof_date: String,
    pub ticker: String,
    pub name: Option<String>,
    pub market: Option<String>,
    pub close: Option<f64>,
    pub mcap: Option<f64>,
    pub avg_value_20d: Option<f64>,
    pub turnover_20d: Option<f64>,
    pub per: Option<f64>,
    pub pbr: Option<f64>,
    pub div: Option<f64>,
    pub dps: Option<f64>,
    pub eps: Option<f64>,
    pub bps: Option<f64>,
    pub roe_proxy: Option<f64>,
    pub eps_positive: Option<i64>,
    pub sma20: Option<f64>,
    pub sma50: Option<f64>,
    pub sma200: Option<f64>,
    pub dist_sma20: Option<f64>,
    pub dist_sma50: Option<f64>,
    pub dist_sma200: Option<f64>,
    pub high_52w: Option<f64>,
    pub low_52w: Option<f64>,
    pub pos_52w: Option<f64>,
    pub near_52w_high_ratio: Option<f64>,
    pub vol_20d: Option<f64>,
    pub ret_1w: Option<f64>,
    pub ret_1m: Option<f64>,
    pub ret_3m: Option<f64>,
    pub ret_6m: Option<f64>,
    pub ret_1y: Option<f64>,
    pub eps_cagr_5y: Option<f64>,
    pub eps_yoy_q: Option<f64>,
    pub reserve_ratio: Option<f64>,
    pub calc_version: String,
}

/// The left-joined cap+fundamentals row for one ticker at one exact date,
/// as returned by `Storage::get_daily_join`.
#[derive(Debug, Clone, Default)]
pub struct DailyJoinRow {
    pub ticker: String,
    pub name: Option<String>,
    pub market: Option<String>,
    pub mcap: Option<f64>,
    pub per: Option<f64>,
    pub pbr: Option<f64>,
    pub eps: Option<f64>,
    pub bps: Option<f64>,
    pub div: Option<f64>,
    pub dps: Option<f64>,
}
