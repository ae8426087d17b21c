use thiserror::Error;

/// Domain-level failures that are fatal to a pipeline run.
///
/// Per-ticker failures (scraper fetch/parse misses, market-data retries that
/// eventually succeed) are *not* represented here — they are counted and
/// logged, never propagated as an error. Only failures that make the rest of
/// a run meaningless surface through this type.
#[derive(Debug, Error)]
pub enum ScreenerError {
    #[error(
        "market data response is missing required column `{target}`; observed columns: {observed:?}"
    )]
    SchemaMissingColumn {
        target: &'static str,
        observed: Vec<String>,
    },

    #[error("{remediation}")]
    EmptyCache { remediation: String },

    #[error("storage commit failed: {0}")]
    StorageCommit(#[from] rusqlite::Error),

    #[error("could not determine a recent business day after {tried} calendar days")]
    NoRecentBusinessDay { tried: u32 },

    #[error("market data request failed after retries: {0}")]
    MarketDataRequest(String),
}

pub type Result<T> = std::result::Result<T, ScreenerError>;
