//! Environment/TOML configuration, following `CachedStore::from_env`'s
//! env-var-with-defaults constructor pattern.

use std::path::PathBuf;

/// Runtime configuration for the batch orchestrator and its clients.
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite database path.
    pub db_path: PathBuf,
    /// Lookback window (calendar days) for a full run.
    pub lookback_days: i64,
    /// Market-data client retry count.
    pub market_data_retries: u32,
    /// Market-data client base backoff, seconds.
    pub market_data_backoff_base_secs: f64,
    /// Reserve-ratio scraper worker pool size.
    pub scraper_max_workers: usize,
    /// Reserve-ratio scraper retry count.
    pub scraper_retries: u32,
    /// Reserve-ratio scraper base backoff, seconds.
    pub scraper_backoff_base_secs: f64,
    /// Reserve-ratio scraper per-request timeout, seconds.
    pub scraper_timeout_secs: u64,
    /// Where to persist the (at most one per run) parse-miss HTML sample.
    pub parse_miss_html_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("data/screener.db"),
            lookback_days: 400,
            market_data_retries: 3,
            market_data_backoff_base_secs: 0.5,
            scraper_max_workers: 8,
            scraper_retries: 3,
            scraper_backoff_base_secs: 0.5,
            scraper_timeout_secs: 8,
            parse_miss_html_path: PathBuf::from("artifacts/naver_ratio_parse_miss_sample.html"),
        }
    }
}

impl Config {
    /// Build from environment variables, falling back to defaults.
    ///
    /// | Env Var | Default | Purpose |
    /// |---------|---------|---------|
    /// | `SCREENER_DB_PATH` | `data/screener.db` | SQLite database path |
    /// | `SCREENER_LOOKBACK_DAYS` | `400` | Full-run lookback window |
    /// | `SCREENER_SCRAPER_MAX_WORKERS` | `8` | Reserve-ratio worker pool size |
    /// | `SCREENER_PARSE_MISS_HTML_PATH` | `artifacts/...html` | Parse-miss sample path |
    ///
    /// Reads a `.env` file first (via `dotenvy`), then overrides from
    /// process environment variables.
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();
        let mut cfg = Self::default();

        if let Ok(val) = std::env::var("SCREENER_DB_PATH") {
            cfg.db_path = PathBuf::from(val);
        }
        if let Some(val) = env_parse("SCREENER_LOOKBACK_DAYS") {
            cfg.lookback_days = val;
        }
        if let Some(val) = env_parse("SCREENER_MARKET_DATA_RETRIES") {
            cfg.market_data_retries = val;
        }
        if let Some(val) = env_parse("SCREENER_SCRAPER_MAX_WORKERS") {
            cfg.scraper_max_workers = val;
        }
        if let Some(val) = env_parse("SCREENER_SCRAPER_RETRIES") {
            cfg.scraper_retries = val;
        }
        if let Some(val) = env_parse("SCREENER_SCRAPER_TIMEOUT_SECS") {
            cfg.scraper_timeout_secs = val;
        }
        if let Ok(val) = std::env::var("SCREENER_PARSE_MISS_HTML_PATH") {
            cfg.parse_miss_html_path = PathBuf::from(val);
        }

        cfg
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}
