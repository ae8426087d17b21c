//! Tabular market-data client (C2, §4.2).

use chrono::NaiveDate;

use crate::errors::Result;
use crate::types::{CapRow, FundamentalRow, PriceRow, Ticker};

mod krx;
pub use krx::KrxClient;

/// Uniform interface over an external KRX-style data source. One concrete
/// implementation (`KrxClient`) ships; the trait exists so orchestrator and
/// tests can substitute a fake.
pub trait MarketDataClient: Send + Sync {
    /// Starting today, walk backward at most 10 calendar days, probing a
    /// reference ticker's OHLCV; the first non-empty day wins.
    fn recent_business_day(&self) -> Result<NaiveDate>;

    /// Sorted, deduplicated trading days in `[from, to]`, derived from a
    /// reference ticker's index.
    fn trading_dates(&self, from: NaiveDate, to: NaiveDate) -> Result<Vec<NaiveDate>>;

    /// Union of KOSPI and KOSDAQ tickers with display names, all active.
    fn tickers(&self) -> Result<Vec<Ticker>>;

    /// Normalized OHLCV rows for `ticker` in `[from, to]`. Fails with
    /// `ScreenerError::SchemaMissingColumn` if any of open/high/low/close/
    /// volume cannot be resolved from the response.
    fn ohlcv(&self, from: NaiveDate, to: NaiveDate, ticker: &str) -> Result<Vec<PriceRow>>;

    /// Normalized market-cap rows for every ticker on `date`.
    fn market_cap(&self, date: NaiveDate) -> Result<Vec<CapRow>>;

    /// Normalized fundamentals for every ticker, anchored at `date` or, if
    /// `date` yields no rows, at the first of up to 7 prior calendar days
    /// that does. Returns the rows plus the date they were actually sourced
    /// from.
    fn fundamental(&self, date: NaiveDate) -> Result<(NaiveDate, Vec<FundamentalRow>)>;
}
