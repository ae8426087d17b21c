//! Reserve-ratio scraper (C3, §4.3).
//!
//! The row-based `<th>…</th>` table walk is tried first; a marker-proximity
//! regex scan is the documented fallback for pages where the table can't be
//! located at all.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use encoding_rs::{EUC_KR, UTF_8};
use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use regex::Regex;
use reqwest::blocking::Client;
use reqwest::header::{ACCEPT_LANGUAGE, REFERER, USER_AGENT};
use scraper::{Html, Selector};
use std::sync::OnceLock;

use crate::types::ReserveRatio;

const BASE_URL: &str = "https://navercomp.wisereport.co.kr/v2/company/cF1001.aspx";
const BLOCKED_MARKERS: &[&str] = &[
    "비정상적인 접근",
    "접근이 제한",
    "Access Denied",
    "자동화된 요청",
];
const RATIO_MARKERS: &[&str] = &["자본유보율", "유보율"];
const PROXIMITY_WINDOW: usize = 3000;
const MIN_VALUE: f64 = -1000.0;
const MAX_VALUE: f64 = 100_000.0;
const MAX_PARSE_MISS_PREVIEWS: usize = 5;

/// Outcome of scraping one ticker.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    Success(f64),
    FetchFail,
    NoData,
    ParseError,
    MarkerMissing,
}

#[derive(Debug, Clone)]
pub struct ScrapeResult {
    pub ticker: String,
    pub outcome: FetchOutcome,
    pub html_preview: Option<String>,
}

pub struct ScraperConfig {
    pub retries: u32,
    pub sleep_seconds: f64,
    pub timeout_seconds: u64,
    pub max_workers: usize,
    pub save_parse_miss_html: bool,
    pub parse_miss_html_path: std::path::PathBuf,
}

impl Default for ScraperConfig {
    fn default() -> Self {
        Self {
            retries: 3,
            sleep_seconds: 0.5,
            timeout_seconds: 8,
            max_workers: 8,
            save_parse_miss_html: true,
            parse_miss_html_path: "artifacts/naver_ratio_parse_miss_sample.html".into(),
        }
    }
}

pub struct ReserveRatioScraper {
    client: Client,
    config: ScraperConfig,
}

fn number_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"-?\d+(?:,\d{3})*(?:\.\d+)?").expect("static pattern"))
}

fn tag_number_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r">\s*(-?\d+(?:,\d{3})*(?:\.\d+)?)\s*<").expect("static pattern")
    })
}

fn nearby_number_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"유보율[^0-9-]{0,30}(-?\d+(?:,\d{3})*(?:\.\d+)?)").expect("static pattern")
    })
}

fn parse_valid_numbers<'a>(raw: impl Iterator<Item = &'a str>) -> Vec<f64> {
    raw.filter_map(|s| s.replace(',', "").parse::<f64>().ok())
        .filter(|v| (MIN_VALUE..=MAX_VALUE).contains(v))
        .collect()
}

fn select_value(values: &[f64]) -> Option<f64> {
    values
        .iter()
        .find(|v| **v > 0.0)
        .or_else(|| values.first())
        .copied()
}

fn is_blocked_response(html: &str) -> bool {
    BLOCKED_MARKERS.iter().any(|m| html.contains(m))
}

fn preview_html(html: &str, max_chars: usize) -> String {
    let collapsed: String = html.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed.chars().take(max_chars).collect()
}

fn decode_response(raw: &[u8], content_charset: Option<&str>) -> String {
    if let Some(label) = content_charset {
        if let Some(encoding) = encoding_rs::Encoding::for_label(label.as_bytes()) {
            let (text, _, had_errors) = encoding.decode(raw);
            if !had_errors {
                return text.into_owned();
            }
        }
    }
    let (text, _, had_errors) = UTF_8.decode(raw);
    if !had_errors {
        return text.into_owned();
    }
    let (text, _, had_errors) = EUC_KR.decode(raw);
    if !had_errors {
        return text.into_owned();
    }
    let (text, _, _) = UTF_8.decode(raw);
    text.into_owned()
}

/// Step 1-4 of the parse algorithm: locate the `<th>` row for a reserve-ratio
/// marker via DOM selectors, extract its `<td>` cells, and apply the
/// no-data / numeric-extraction rules.
fn parse_table_row(html: &str) -> Option<FetchOutcome> {
    let document = Html::parse_document(html);
    let row_selector = Selector::parse("tr").ok()?;
    let th_selector = Selector::parse("th").ok()?;
    let td_selector = Selector::parse("td").ok()?;

    for row in document.select(&row_selector) {
        let has_marker = row.select(&th_selector).any(|th| {
            let text = th.text().collect::<String>();
            RATIO_MARKERS.iter().any(|m| text.contains(m))
        });
        if !has_marker {
            continue;
        }

        let cells: Vec<String> = row
            .select(&td_selector)
            .map(|td| td.text().collect::<String>().trim().to_string())
            .collect();
        if cells.is_empty() {
            continue;
        }

        let all_empty_or_dash = cells.iter().all(|c| c.is_empty() || c == "-");
        if all_empty_or_dash {
            return Some(FetchOutcome::NoData);
        }

        let numbers: Vec<&str> = cells
            .iter()
            .flat_map(|c| number_pattern().find_iter(c).map(|m| m.as_str()))
            .collect();
        let values = parse_valid_numbers(numbers.into_iter());
        return Some(match select_value(&values) {
            Some(v) => FetchOutcome::Success(v),
            None => FetchOutcome::ParseError,
        });
    }
    None
}

/// Step 5: marker-proximity fallback when the row-based walk can't locate a
/// `<th>` at all.
fn parse_marker_proximity(html: &str) -> FetchOutcome {
    let positions: Vec<usize> = RATIO_MARKERS
        .iter()
        .filter_map(|m| html.find(m))
        .collect();
    if positions.is_empty() {
        return FetchOutcome::MarkerMissing;
    }

    let mut values = Vec::new();
    for idx in positions {
        let start = idx.saturating_sub(PROXIMITY_WINDOW);
        let end = (idx + PROXIMITY_WINDOW).min(html.len());
        // Snap to char boundaries; html is scraped text, ASCII-safe padding
        // on either side of any Korean marker keeps this from landing
        // mid-codepoint except in pathological inputs, which we tolerate by
        // widening outward.
        let start = (0..=start).rev().find(|i| html.is_char_boundary(*i)).unwrap_or(0);
        let end = (end..=html.len()).find(|i| html.is_char_boundary(*i)).unwrap_or(html.len());
        let snippet = &html[start..end];

        let tag_numbers = tag_number_pattern()
            .captures_iter(snippet)
            .filter_map(|c| c.get(1).map(|m| m.as_str()));
        values.extend(parse_valid_numbers(tag_numbers));

        let nearby_numbers = nearby_number_pattern()
            .captures_iter(snippet)
            .filter_map(|c| c.get(1).map(|m| m.as_str()));
        values.extend(parse_valid_numbers(nearby_numbers));
    }

    match select_value(&values) {
        Some(v) => FetchOutcome::Success(v),
        None => FetchOutcome::ParseError,
    }
}

fn extract_reserve_ratio(html: &str) -> FetchOutcome {
    match parse_table_row(html) {
        Some(outcome) => outcome,
        None => parse_marker_proximity(html),
    }
}

impl ReserveRatioScraper {
    pub fn new(config: ScraperConfig) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .expect("reqwest client build with static config never fails");
        Self { client, config }
    }

    fn fetch_html(&self, ticker: &str) -> Option<String> {
        let url = format!("{BASE_URL}?cmp_cd={ticker}&fin_typ=0&freq_typ=Y");
        let referer = format!("https://finance.naver.com/item/main.naver?code={ticker}");

        for attempt in 0..self.config.retries {
            let resp = self
                .client
                .get(&url)
                .header(USER_AGENT, "Mozilla/5.0")
                .header(REFERER, referer.clone())
                .header(ACCEPT_LANGUAGE, "ko-KR,ko;q=0.9,en-US;q=0.8,en;q=0.7")
                .send();

            let resp = match resp {
                Ok(r) => r,
                Err(_) => {
                    self.backoff(attempt);
                    continue;
                }
            };

            let content_charset = resp
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .and_then(|ct| ct.split("charset=").nth(1))
                .map(str::to_string);

            let Ok(raw) = resp.bytes() else {
                self.backoff(attempt);
                continue;
            };
            let html = decode_response(&raw, content_charset.as_deref());

            if is_blocked_response(&html) {
                self.backoff(attempt);
                continue;
            }
            return Some(html);
        }
        None
    }

    fn backoff(&self, attempt: u32) {
        if attempt + 1 < self.config.retries {
            let wait = self.config.sleep_seconds * 2f64.powi(attempt as i32);
            std::thread::sleep(Duration::from_secs_f64(wait));
        }
    }

    fn collect_one(&self, ticker: &str, html_sample_saved: &Mutex<bool>) -> ScrapeResult {
        self.collect_one_with(ticker, html_sample_saved, |t| self.fetch_html(t))
    }

    /// `collect_one`, parameterized over the HTML fetch so tests can inject a
    /// fake transport (with artificial per-ticker delay) instead of a real
    /// HTTP round-trip.
    fn collect_one_with(
        &self,
        ticker: &str,
        html_sample_saved: &Mutex<bool>,
        fetch: impl FnOnce(&str) -> Option<String>,
    ) -> ScrapeResult {
        let Some(html) = fetch(ticker) else {
            return ScrapeResult {
                ticker: ticker.to_string(),
                outcome: FetchOutcome::FetchFail,
                html_preview: None,
            };
        };

        let outcome = extract_reserve_ratio(&html);
        let html_preview = match &outcome {
            FetchOutcome::ParseError | FetchOutcome::MarkerMissing => {
                if self.config.save_parse_miss_html {
                    let mut saved = html_sample_saved.lock().unwrap();
                    if !*saved {
                        if let Err(e) = save_html_sample(&self.config.parse_miss_html_path, ticker, &html) {
                            tracing::warn!("failed to save parse-miss HTML sample: {e}");
                        } else {
                            *saved = true;
                        }
                    }
                }
                Some(preview_html(&html, 120))
            }
            _ => None,
        };

        ScrapeResult {
            ticker: ticker.to_string(),
            outcome,
            html_preview,
        }
    }

    /// Scrape every ticker, preserving input order in the result vector.
    /// A bounded `rayon` thread pool does the I/O-bound fan-out; `rayon`'s
    /// `par_iter().map().collect()` already preserves input order regardless
    /// of which ticker's fetch happens to finish first.
    pub fn scrape_all(&self, tickers: &[String]) -> Vec<ScrapeResult> {
        self.scrape_all_with(tickers, |t| self.fetch_html(t))
    }

    /// `scrape_all`, parameterized over the HTML fetch. Exists so tests can
    /// inject a fake transport with an artificial per-ticker delay to verify
    /// that concurrent completion never disturbs the input-order contract.
    fn scrape_all_with(
        &self,
        tickers: &[String],
        fetch: impl Fn(&str) -> Option<String> + Sync,
    ) -> Vec<ScrapeResult> {
        let total = tickers.len();
        tracing::info!(total, "starting reserve-ratio crawl");
        if total == 0 {
            return Vec::new();
        }

        let worker_count = self.config.max_workers.clamp(1, total);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(worker_count)
            .build()
            .expect("thread pool with a positive worker count always builds");

        let html_sample_saved = Mutex::new(false);
        let done = AtomicUsize::new(0);
        let success = AtomicUsize::new(0);
        let fetch_fail = AtomicUsize::new(0);
        let parse_miss = AtomicUsize::new(0);
        let parse_miss_logged = AtomicUsize::new(0);
        let started_at = Instant::now();

        let progress = ProgressBar::new(total as u64);
        progress.set_style(
            ProgressStyle::with_template("{msg} [{bar:40}] {pos}/{len}")
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );

        let results = pool.install(|| {
            tickers
                .par_iter()
                .map(|ticker| {
                    let result = self.collect_one_with(ticker, &html_sample_saved, |t| fetch(t));
                    match result.outcome {
                        FetchOutcome::FetchFail => {
                            fetch_fail.fetch_add(1, Ordering::Relaxed);
                        }
                        FetchOutcome::ParseError | FetchOutcome::MarkerMissing => {
                            let n = parse_miss.fetch_add(1, Ordering::Relaxed) + 1;
                            let logged = parse_miss_logged.fetch_add(1, Ordering::Relaxed);
                            if logged < MAX_PARSE_MISS_PREVIEWS {
                                tracing::warn!(
                                    ticker = %result.ticker,
                                    preview = result.html_preview.as_deref().unwrap_or(""),
                                    "reserve-ratio parse miss sample ({n})",
                                );
                            }
                        }
                        FetchOutcome::Success(_) => {
                            success.fetch_add(1, Ordering::Relaxed);
                        }
                        FetchOutcome::NoData => {}
                    }
                    let n_done = done.fetch_add(1, Ordering::Relaxed) + 1;
                    if n_done % 50 == 0 || n_done == total {
                        let elapsed = started_at.elapsed().as_secs_f64();
                        let per_item = if n_done > 0 { elapsed / n_done as f64 } else { 0.0 };
                        let remaining = total.saturating_sub(n_done);
                        let eta_min = (remaining as f64 * per_item) / 60.0;
                        progress.set_position(n_done as u64);
                        tracing::info!(
                            n_done,
                            total,
                            success = success.load(Ordering::Relaxed),
                            fetch_fail = fetch_fail.load(Ordering::Relaxed),
                            parse_miss = parse_miss.load(Ordering::Relaxed),
                            elapsed,
                            eta_min,
                            "reserve-ratio crawl progress",
                        );
                    }
                    result
                })
                .collect::<Vec<_>>()
        });

        progress.finish_and_clear();
        tracing::info!(
            total,
            success = success.load(Ordering::Relaxed),
            fetch_fail = fetch_fail.load(Ordering::Relaxed),
            parse_miss = parse_miss.load(Ordering::Relaxed),
            "reserve-ratio crawl completed",
        );
        results
    }

    /// Convenience wrapper returning only successful outcomes, in input
    /// order, as `ReserveRatio` rows.
    pub fn latest_reserve_ratios(&self, tickers: &[String]) -> Vec<ReserveRatio> {
        self.scrape_all(tickers)
            .into_iter()
            .filter_map(|r| match r.outcome {
                FetchOutcome::Success(v) => Some(ReserveRatio {
                    ticker: r.ticker,
                    reserve_ratio: v,
                }),
                _ => None,
            })
            .collect()
    }
}

fn save_html_sample(path: &std::path::Path, ticker: &str, html: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    std::fs::write(path, format!("<!-- ticker={ticker} -->\n{html}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_data_detects_all_dash_cells() {
        let html = r#"<table><tr><th>자본유보율</th><td>-</td><td></td></tr></table>"#;
        assert_eq!(extract_reserve_ratio(html), FetchOutcome::NoData);
    }

    #[test]
    fn prefers_first_positive_value() {
        let html = r#"<table><tr><th>유보율</th><td>-500</td><td>1,234.5</td><td>6789</td></tr></table>"#;
        assert_eq!(extract_reserve_ratio(html), FetchOutcome::Success(1234.5));
    }

    #[test]
    fn falls_back_to_first_value_when_no_positive() {
        let html = r#"<table><tr><th>유보율</th><td>-500</td><td>-10</td></tr></table>"#;
        assert_eq!(extract_reserve_ratio(html), FetchOutcome::Success(-500.0));
    }

    #[test]
    fn out_of_range_values_are_dropped() {
        let html = r#"<table><tr><th>유보율</th><td>999999</td><td>42</td></tr></table>"#;
        assert_eq!(extract_reserve_ratio(html), FetchOutcome::Success(42.0));
    }

    #[test]
    fn missing_header_and_marker_is_marker_missing() {
        let html = r#"<html><body>no relevant content here</body></html>"#;
        assert_eq!(extract_reserve_ratio(html), FetchOutcome::MarkerMissing);
    }

    #[test]
    fn marker_without_table_falls_back_to_proximity_scan() {
        let html = "some page text ... 유보율 123.4 more text after";
        assert_eq!(extract_reserve_ratio(html), FetchOutcome::Success(123.4));
    }

    #[test]
    fn blocked_response_markers_are_detected() {
        assert!(is_blocked_response("이것은 비정상적인 접근입니다"));
        assert!(!is_blocked_response("정상 페이지"));
    }

    #[test]
    fn preview_collapses_whitespace_and_truncates() {
        let html = "a   b\n\nc".repeat(50);
        let preview = preview_html(&html, 10);
        assert_eq!(preview.chars().count(), 10);
        assert!(!preview.contains('\n'));
    }

    #[test]
    fn scrape_all_preserves_input_order() {
        // extract_reserve_ratio is deterministic and pure; exercising it
        // directly here (rather than scrape_all, which needs network I/O)
        // confirms the parser contributes nothing that would reorder rows.
        let a = extract_reserve_ratio(r#"<tr><th>유보율</th><td>1</td></tr>"#);
        let b = extract_reserve_ratio(r#"<tr><th>유보율</th><td>2</td></tr>"#);
        assert_eq!(a, FetchOutcome::Success(1.0));
        assert_eq!(b, FetchOutcome::Success(2.0));
    }

    #[test]
    fn scrape_all_with_preserves_input_order_under_concurrency() {
        // Ticker "1" sleeps longest, "3" returns instantly: if the pool
        // emitted results as they completed rather than buffering by input
        // index, "3" would surface before "1" in the output vector.
        let scraper = ReserveRatioScraper::new(ScraperConfig {
            max_workers: 4,
            save_parse_miss_html: false,
            ..ScraperConfig::default()
        });
        let tickers: Vec<String> = vec!["1".into(), "2".into(), "3".into()];
        let delays = [30u64, 10, 0];

        let results = scraper.scrape_all_with(&tickers, |ticker| {
            let idx: usize = ticker.parse().unwrap();
            std::thread::sleep(Duration::from_millis(delays[idx - 1]));
            Some(format!(r#"<tr><th>유보율</th><td>{idx}</td></tr>"#))
        });

        let order: Vec<&str> = results.iter().map(|r| r.ticker.as_str()).collect();
        assert_eq!(order, vec!["1", "2", "3"]);
        assert_eq!(results[0].outcome, FetchOutcome::Success(1.0));
        assert_eq!(results[2].outcome, FetchOutcome::Success(3.0));
    }
}
