//! §8 Testable Properties covering `Storage`: idempotent upserts and atomic
//! snapshot replacement against a real (tempfile-backed) SQLite database.

use chrono::NaiveDate;
use kr_equity_snapshot::storage::Storage;
use kr_equity_snapshot::types::{Market, PriceRow, SnapshotRow, Ticker};

fn open_temp() -> (tempfile::TempDir, Storage) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("screener.db");
    let storage = Storage::open(&path).unwrap();
    (dir, storage)
}

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

#[test]
fn upsert_ticker_twice_does_not_duplicate() {
    let (_dir, storage) = open_temp();
    let ticker = Ticker {
        ticker: "005930".into(),
        name: "Samsung Electronics".into(),
        market: Market::Kospi,
        active_flag: true,
    };
    storage.upsert_tickers(&[ticker.clone()]).unwrap();
    storage.upsert_tickers(&[ticker]).unwrap();
    assert_eq!(storage.count_active_tickers().unwrap(), 1);
}

#[test]
fn upsert_price_twice_with_changed_close_keeps_one_row() {
    let (_dir, storage) = open_temp();
    storage
        .upsert_tickers(&[Ticker {
            ticker: "005930".into(),
            name: "Samsung Electronics".into(),
            market: Market::Kospi,
            active_flag: true,
        }])
        .unwrap();

    let mut row = PriceRow {
        date: date(2026, 1, 2),
        ticker: "005930".into(),
        open: Some(100.0),
        high: Some(100.0),
        low: Some(100.0),
        close: Some(100.0),
        volume: Some(10.0),
        value: Some(1000.0),
    };
    storage.upsert_prices(&[row.clone()]).unwrap();
    row.close = Some(105.0);
    storage.upsert_prices(&[row]).unwrap();

    let window = storage.get_price_window(date(2026, 1, 2), 10).unwrap();
    assert_eq!(window.len(), 1);
    assert_eq!(window[0].close, Some(105.0));
}

#[test]
fn replace_snapshot_is_atomic_per_date() {
    let (_dir, storage) = open_temp();
    let row_for = |asof: &str, ticker: &str| SnapshotRow {
        asof_date: asof.into(),
        ticker: ticker.into(),
        calc_version: "v1.1".into(),
        ..Default::default()
    };

    storage
        .replace_snapshot("2026-01-02", &[row_for("2026-01-02", "005930")])
        .unwrap();
    storage
        .replace_snapshot(
            "2026-01-05",
            &[
                row_for("2026-01-05", "005930"),
                row_for("2026-01-05", "000660"),
            ],
        )
        .unwrap();

    assert_eq!(storage.load_snapshot("2026-01-02").unwrap().len(), 1);
    assert_eq!(storage.load_snapshot("2026-01-05").unwrap().len(), 2);

    // Replacing one date's rows never disturbs another date's rows.
    storage.replace_snapshot("2026-01-02", &[]).unwrap();
    assert!(storage.load_snapshot("2026-01-02").unwrap().is_empty());
    assert_eq!(storage.load_snapshot("2026-01-05").unwrap().len(), 2);
}

#[test]
fn schema_migrations_add_v1_1_columns_without_losing_data() {
    let (_dir, storage) = open_temp();
    let row = SnapshotRow {
        asof_date: "2026-01-02".into(),
        ticker: "005930".into(),
        calc_version: "v1.1".into(),
        reserve_ratio: Some(42.0),
        ..Default::default()
    };
    storage.replace_snapshot("2026-01-02", &[row]).unwrap();
    let loaded = storage.load_snapshot("2026-01-02").unwrap();
    assert_eq!(loaded.len(), 1);
    assert_eq!(loaded[0].reserve_ratio, Some(42.0));
}
