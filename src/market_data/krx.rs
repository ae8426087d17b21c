//! `KrxClient`: a blocking HTTP client over a KRX-style JSON data source.
//!
//! Resolves Korean/English column name variants via a fixed alias table per
//! target field, so the response schema can vary without the caller caring
//! which labels a given endpoint happened to use.

use std::collections::HashMap;
use std::thread;
use std::time::Duration;

use chrono::NaiveDate;
use reqwest::blocking::Client;
use serde_json::Value;

use crate::errors::{Result, ScreenerError};
use crate::types::{CapRow, FundamentalRow, Market, PriceRow, Ticker};

use super::MarketDataClient;

const REFERENCE_TICKER: &str = "005930";
const USER_AGENT: &str = "Mozilla/5.0 (compatible; kr-equity-snapshot/1.0)";

/// Candidate column names per normalized OHLCV field, Korean first (matching
/// the source's native labels) then English.
const OHLCV_COLUMNS: &[(&str, &[&str])] = &[
    ("open", &["시가", "open"]),
    ("high", &["고가", "high"]),
    ("low", &["저가", "low"]),
    ("close", &["종가", "close"]),
    ("volume", &["거래량", "volume"]),
    ("value", &["거래대금", "value"]),
];

const CAP_COLUMNS: &[(&str, &[&str])] = &[
    ("mcap", &["시가총액", "mcap"]),
    ("shares", &["상장주식수", "shares"]),
    ("volume", &["거래량", "volume"]),
    ("value", &["거래대금", "value"]),
];

const FUNDAMENTAL_COLUMNS: &[(&str, &[&str])] = &[
    ("per", &["PER", "per"]),
    ("pbr", &["PBR", "pbr"]),
    ("eps", &["EPS", "eps"]),
    ("bps", &["BPS", "bps"]),
    ("div", &["DIV", "div"]),
    ("dps", &["DPS", "dps"]),
];

/// Resolve `target`'s value out of a JSON object by trying each candidate
/// column name in order. Returns `None` if no candidate is present.
fn resolve_column(obj: &serde_json::Map<String, Value>, candidates: &[&str]) -> Option<Value> {
    candidates.iter().find_map(|name| obj.get(*name).cloned())
}

fn to_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.replace(',', "").parse::<f64>().ok(),
        _ => None,
    }
}

pub struct KrxClient {
    client: Client,
    base_url: String,
    retries: u32,
    backoff_base_secs: f64,
}

impl KrxClient {
    pub fn new(base_url: impl Into<String>, retries: u32, backoff_base_secs: f64) -> Self {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(30))
            .build()
            .expect("reqwest client build with static config never fails");
        Self {
            client,
            base_url: base_url.into(),
            retries: retries.max(1),
            backoff_base_secs,
        }
    }

    /// GET `path` with `query`, retrying transport/5xx failures with
    /// exponential backoff (`backoff_base_secs * 2^attempt`).
    fn get_json(&self, path: &str, query: &[(&str, String)]) -> Result<Value> {
        let url = format!("{}{}", self.base_url, path);
        let mut last_err = None;
        for attempt in 0..self.retries {
            let resp = self
                .client
                .get(&url)
                .query(query)
                .send()
                .and_then(reqwest::blocking::Response::error_for_status);
            match resp {
                Ok(resp) => match resp.json::<Value>() {
                    Ok(body) => return Ok(body),
                    Err(e) => last_err = Some(e.to_string()),
                },
                Err(e) => last_err = Some(e.to_string()),
            }
            if attempt + 1 < self.retries {
                let wait = self.backoff_base_secs * 2f64.powi(attempt as i32);
                thread::sleep(Duration::from_secs_f64(wait));
            }
        }
        Err(ScreenerError::MarketDataRequest(
            last_err.unwrap_or_else(|| "unknown error".to_string()),
        ))
    }

    fn rows(value: &Value) -> &[Value] {
        value
            .get("rows")
            .or_else(|| value.as_array().map(|_| value))
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

impl MarketDataClient for KrxClient {
    fn recent_business_day(&self) -> Result<NaiveDate> {
        let mut candidate = chrono::Local::now().date_naive();
        for _ in 0..10 {
            let body = self.get_json(
                "/ohlcv",
                &[
                    ("from", candidate.format("%Y%m%d").to_string()),
                    ("to", candidate.format("%Y%m%d").to_string()),
                    ("ticker", REFERENCE_TICKER.to_string()),
                ],
            )?;
            if !Self::rows(&body).is_empty() {
                return Ok(candidate);
            }
            candidate -= chrono::Duration::days(1);
        }
        Err(ScreenerError::NoRecentBusinessDay { tried: 10 })
    }

    fn trading_dates(&self, from: NaiveDate, to: NaiveDate) -> Result<Vec<NaiveDate>> {
        let body = self.get_json(
            "/ohlcv",
            &[
                ("from", from.format("%Y%m%d").to_string()),
                ("to", to.format("%Y%m%d").to_string()),
                ("ticker", REFERENCE_TICKER.to_string()),
            ],
        )?;
        let mut dates: Vec<NaiveDate> = Self::rows(&body)
            .iter()
            .filter_map(|row| row.get("date").and_then(Value::as_str))
            .filter_map(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok())
            .collect();
        dates.sort_unstable();
        dates.dedup();
        Ok(dates)
    }

    fn tickers(&self) -> Result<Vec<Ticker>> {
        let mut out = Vec::new();
        for market in [Market::Kospi, Market::Kosdaq] {
            let body = self.get_json("/tickers", &[("market", market.as_str().to_string())])?;
            for row in Self::rows(&body) {
                let (Some(ticker), Some(name)) = (
                    row.get("ticker").and_then(Value::as_str),
                    row.get("name").and_then(Value::as_str),
                ) else {
                    continue;
                };
                out.push(Ticker {
                    ticker: ticker.to_string(),
                    name: name.to_string(),
                    market,
                    active_flag: true,
                });
            }
        }
        Ok(out)
    }

    fn ohlcv(&self, from: NaiveDate, to: NaiveDate, ticker: &str) -> Result<Vec<PriceRow>> {
        let body = self.get_json(
            "/ohlcv",
            &[
                ("from", from.format("%Y%m%d").to_string()),
                ("to", to.format("%Y%m%d").to_string()),
                ("ticker", ticker.to_string()),
            ],
        )?;
        let mut out = Vec::new();
        for row in Self::rows(&body) {
            let Some(obj) = row.as_object() else { continue };
            let mut resolved: HashMap<&str, Option<f64>> = HashMap::new();
            let mut name_present: HashMap<&str, bool> = HashMap::new();
            for (target, candidates) in OHLCV_COLUMNS {
                let raw = resolve_column(obj, candidates);
                name_present.insert(target, raw.is_some());
                resolved.insert(target, raw.as_ref().and_then(to_f64));
            }
            for required in ["open", "high", "low", "close", "volume"] {
                if !name_present.get(required).copied().unwrap_or(false) {
                    return Err(ScreenerError::SchemaMissingColumn {
                        target: match required {
                            "open" => "open",
                            "high" => "high",
                            "low" => "low",
                            "close" => "close",
                            _ => "volume",
                        },
                        observed: obj.keys().cloned().collect(),
                    });
                }
            }
            let Some(date) = row
                .get("date")
                .and_then(Value::as_str)
                .and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok())
            else {
                continue;
            };
            out.push(PriceRow {
                date,
                ticker: ticker.to_string(),
                open: resolved["open"],
                high: resolved["high"],
                low: resolved["low"],
                close: resolved["close"],
                volume: resolved["volume"],
                value: resolved.get("value").copied().flatten(),
            });
        }
        Ok(out)
    }

    fn market_cap(&self, date: NaiveDate) -> Result<Vec<CapRow>> {
        let body = self.get_json("/market-cap", &[("date", date.format("%Y%m%d").to_string())])?;
        let mut out = Vec::new();
        for row in Self::rows(&body) {
            let Some(obj) = row.as_object() else { continue };
            let Some(ticker) = obj.get("ticker").and_then(Value::as_str) else {
                continue;
            };
            out.push(CapRow {
                date,
                ticker: ticker.to_string(),
                mcap: resolve_column(obj, CAP_COLUMNS[0].1).as_ref().and_then(to_f64),
                shares: resolve_column(obj, CAP_COLUMNS[1].1).as_ref().and_then(to_f64),
                volume: resolve_column(obj, CAP_COLUMNS[2].1).as_ref().and_then(to_f64),
                value: resolve_column(obj, CAP_COLUMNS[3].1).as_ref().and_then(to_f64),
            });
        }
        Ok(out)
    }

    fn fundamental(&self, date: NaiveDate) -> Result<(NaiveDate, Vec<FundamentalRow>)> {
        let mut candidate = date;
        for attempt in 0..=7 {
            let body = self.get_json(
                "/fundamental",
                &[("date", candidate.format("%Y%m%d").to_string())],
            )?;
            let rows = Self::rows(&body);
            if rows.is_empty() {
                if attempt < 7 {
                    candidate -= chrono::Duration::days(1);
                    continue;
                }
                return Ok((candidate, Vec::new()));
            }
            let mut out = Vec::with_capacity(rows.len());
            for row in rows {
                let Some(obj) = row.as_object() else { continue };
                let Some(ticker) = obj.get("ticker").and_then(Value::as_str) else {
                    continue;
                };
                out.push(FundamentalRow {
                    date: candidate,
                    ticker: ticker.to_string(),
                    per: resolve_column(obj, FUNDAMENTAL_COLUMNS[0].1).as_ref().and_then(to_f64),
                    pbr: resolve_column(obj, FUNDAMENTAL_COLUMNS[1].1).as_ref().and_then(to_f64),
                    eps: resolve_column(obj, FUNDAMENTAL_COLUMNS[2].1).as_ref().and_then(to_f64),
                    bps: resolve_column(obj, FUNDAMENTAL_COLUMNS[3].1).as_ref().and_then(to_f64),
                    div: resolve_column(obj, FUNDAMENTAL_COLUMNS[4].1).as_ref().and_then(to_f64),
                    dps: resolve_column(obj, FUNDAMENTAL_COLUMNS[5].1).as_ref().and_then(to_f64),
                });
            }
            return Ok((candidate, out));
        }
        unreachable!("loop always returns within 8 iterations")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn resolve_column_prefers_first_matching_candidate() {
        let obj = json!({"시가": 100, "open": 200}).as_object().unwrap().clone();
        let resolved = resolve_column(&obj, &["시가", "open"]);
        assert_eq!(resolved.and_then(|v| to_f64(&v)), Some(100.0));
    }

    #[test]
    fn resolve_column_falls_back_to_english() {
        let obj = json!({"open": 200}).as_object().unwrap().clone();
        let resolved = resolve_column(&obj, &["시가", "open"]);
        assert_eq!(resolved.and_then(|v| to_f64(&v)), Some(200.0));
    }

    #[test]
    fn to_f64_strips_thousands_separators() {
        assert_eq!(to_f64(&json!("1,234.5")), Some(1234.5));
    }

    #[test]
    fn rows_unwraps_object_with_rows_key() {
        let body = json!({"rows": [{"a": 1}, {"a": 2}]});
        assert_eq!(KrxClient::rows(&body).len(), 2);
    }

    #[test]
    fn rows_accepts_bare_array() {
        let body = json!([{"a": 1}]);
        assert_eq!(KrxClient::rows(&body).len(), 1);
    }

    #[test]
    fn resolve_column_is_none_only_when_no_candidate_name_is_present() {
        let obj = json!({"시가": "N/A", "open": 200}).as_object().unwrap().clone();
        // "시가" is present but unparseable; resolve_column still finds it
        // first since it checks key presence, not value validity.
        let resolved = resolve_column(&obj, &["시가", "open"]);
        assert!(resolved.is_some());
        assert_eq!(to_f64(&resolved.unwrap()), None);

        let missing = json!({}).as_object().unwrap().clone();
        assert!(resolve_column(&missing, &["시가", "open"]).is_none());
    }
}
