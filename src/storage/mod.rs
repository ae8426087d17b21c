//! Relational cache (C1, §4.1). One `rusqlite` connection, schema managed by
//! `refinery` migrations embedded at compile time.
//!
//! Upsert is by primary key with full-row replacement of non-key columns and
//! a `source_ts` refresh. `replace_snapshot` runs `DELETE` then `INSERT`
//! inside one transaction so a reader never observes a partial rewrite.

use std::path::Path;
use std::sync::Mutex;

use chrono::{Datelike, NaiveDate};
use rusqlite::{params, Connection, OptionalExtension};

use crate::errors::{Result, ScreenerError};
use crate::types::{CapRow, DailyJoinRow, FundamentalRow, Market, PriceRow, SnapshotRow, Ticker};

mod migrations {
    refinery::embed_migrations!("src/storage/migrations");
}

pub struct Storage {
    conn: Mutex<Connection>,
}

impl Storage {
    /// Open (creating if absent) the SQLite database at `path` and bring its
    /// schema up to date.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| ScreenerError::EmptyCache {
                    remediation: format!("failed to create database directory {parent:?}: {e}"),
                })?;
            }
        }
        let mut conn = Connection::open(path)?;
        migrations::migrations::runner()
            .run(&mut conn)
            .map_err(|e| ScreenerError::EmptyCache {
                remediation: format!("failed to run schema migrations: {e}"),
            })?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory database, for tests.
    pub fn open_in_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        migrations::migrations::runner()
            .run(&mut conn)
            .map_err(|e| ScreenerError::EmptyCache {
                remediation: format!("failed to run schema migrations: {e}"),
            })?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn upsert_tickers(&self, rows: &[Ticker]) -> Result<usize> {
        if rows.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO ticker_master(ticker, name, market, active_flag, updated_at)
                 VALUES (?1, ?2, ?3, ?4, CURRENT_TIMESTAMP)
                 ON CONFLICT(ticker) DO UPDATE SET
                     name = excluded.name,
                     market = excluded.market,
                     active_flag = excluded.active_flag,
                     updated_at = CURRENT_TIMESTAMP",
            )?;
            for row in rows {
                stmt.execute(params![
                    row.ticker,
                    row.name,
                    row.market.as_str(),
                    i64::from(row.active_flag)
                ])?;
            }
        }
        tx.commit()?;
        Ok(rows.len())
    }

    pub fn upsert_prices(&self, rows: &[PriceRow]) -> Result<usize> {
        if rows.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO prices_daily(date, ticker, open, high, low, close, volume, value, source_ts)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, CURRENT_TIMESTAMP)
                 ON CONFLICT(date, ticker) DO UPDATE SET
                     open = excluded.open,
                     high = excluded.high,
                     low = excluded.low,
                     close = excluded.close,
                     volume = excluded.volume,
                     value = excluded.value,
                     source_ts = CURRENT_TIMESTAMP",
            )?;
            for row in rows {
                stmt.execute(params![
                    row.date.to_string(),
                    row.ticker,
                    row.open,
                    row.high,
                    row.low,
                    row.close,
                    row.volume,
                    row.value,
                ])?;
            }
        }
        tx.commit()?;
        Ok(rows.len())
    }

    pub fn upsert_cap(&self, rows: &[CapRow]) -> Result<usize> {
        if rows.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO cap_daily(date, ticker, mcap, shares, volume, value, source_ts)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, CURRENT_TIMESTAMP)
                 ON CONFLICT(date, ticker) DO UPDATE SET
                     mcap = excluded.mcap,
                     shares = excluded.shares,
                     volume = excluded.volume,
                     value = excluded.value,
                     source_ts = CURRENT_TIMESTAMP",
            )?;
            for row in rows {
                stmt.execute(params![
                    row.date.to_string(),
                    row.ticker,
                    row.mcap,
                    row.shares,
                    row.volume,
                    row.value,
                ])?;
            }
        }
        tx.commit()?;
        Ok(rows.len())
    }

    pub fn upsert_fundamental(&self, rows: &[FundamentalRow]) -> Result<usize> {
        if rows.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO fundamental_daily(date, ticker, per, pbr, eps, bps, div, dps, source_ts)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, CURRENT_TIMESTAMP)
                 ON CONFLICT(date, ticker) DO UPDATE SET
                     per = excluded.per,
                     pbr = excluded.pbr,
                     eps = excluded.eps,
                     bps = excluded.bps,
                     div = excluded.div,
                     dps = excluded.dps,
                     source_ts = CURRENT_TIMESTAMP",
            )?;
            for row in rows {
                stmt.execute(params![
                    row.date.to_string(),
                    row.ticker,
                    row.per,
                    row.pbr,
                    row.eps,
                    row.bps,
                    row.div,
                    row.dps,
                ])?;
            }
        }
        tx.commit()?;
        Ok(rows.len())
    }

    /// Atomically replace every `snapshot_metrics` row for `asof` with `rows`.
    /// `DELETE` then `INSERT` inside one transaction — on failure the
    /// transaction rolls back and the previous snapshot is untouched.
    pub fn replace_snapshot(&self, asof: &str, rows: &[SnapshotRow]) -> Result<usize> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM snapshot_metrics WHERE asof_date = ?1",
            params![asof],
        )?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO snapshot_metrics (
                    asof_date, ticker, name, market, close, mcap, avg_value_20d, turnover_20d,
                    per, pbr, div, eps, bps, roe_proxy, eps_positive, sma20, sma50, sma200,
                    dist_sma20, dist_sma50, dist_sma200, high_52w, low_52w, pos_52w, vol_20d,
                    ret_1w, ret_1m, ret_3m, ret_6m, ret_1y, calc_version,
                    dps, near_52w_high_ratio, eps_cagr_5y, eps_yoy_q, reserve_ratio
                ) VALUES (
                    ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17,
                    ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27, ?28, ?29, ?30, ?31,
                    ?32, ?33, ?34, ?35, ?36
                )",
            )?;
            for row in rows {
                stmt.execute(params![
                    row.asof_date,
                    row.ticker,
                    row.name,
                    row.market,
                    row.close,
                    row.mcap,
                    row.avg_value_20d,
                    row.turnover_20d,
                    row.per,
                    row.pbr,
                    row.div,
                    row.eps,
                    row.bps,
                    row.roe_proxy,
                    row.eps_positive,
                    row.sma20,
                    row.sma50,
                    row.sma200,
                    row.dist_sma20,
                    row.dist_sma50,
                    row.dist_sma200,
                    row.high_52w,
                    row.low_52w,
                    row.pos_52w,
                    row.vol_20d,
                    row.ret_1w,
                    row.ret_1m,
                    row.ret_3m,
                    row.ret_6m,
                    row.ret_1y,
                    row.calc_version,
                    row.dps,
                    row.near_52w_high_ratio,
                    row.eps_cagr_5y,
                    row.eps_yoy_q,
                    row.reserve_ratio,
                ])?;
            }
        }
        tx.commit()?;
        Ok(rows.len())
    }

    /// Upsert `(ticker, reserve_ratio)` pairs onto an existing snapshot at
    /// `asof`, used by the reserve-only sub-pipeline. Rows for tickers not
    /// already present in the snapshot are ignored (a reserve-only update
    /// cannot create new snapshot rows).
    pub fn update_reserve_ratio(&self, asof: &str, rows: &[crate::types::ReserveRatio]) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "UPDATE snapshot_metrics SET reserve_ratio = ?1 WHERE asof_date = ?2 AND ticker = ?3",
        )?;
        let mut updated = 0usize;
        for row in rows {
            let n = stmt.execute(params![row.reserve_ratio, asof, row.ticker])?;
            updated += n;
        }
        Ok(updated)
    }

    /// For every ticker, up to `window` most-recent rows with `date <=
    /// end_date`, ordered `(ticker, date asc)`. `value` is
    /// `COALESCE(cap.value, price.value)`.
    pub fn get_price_window(&self, end_date: NaiveDate, window: i64) -> Result<Vec<PriceRow>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "WITH ranked AS (
                SELECT p.date, p.ticker, p.open, p.high, p.low, p.close, p.volume,
                       COALESCE(c.value, p.value) AS value,
                       ROW_NUMBER() OVER (PARTITION BY p.ticker ORDER BY p.date DESC) AS rn
                FROM prices_daily p
                LEFT JOIN cap_daily c ON c.ticker = p.ticker AND c.date = p.date
                WHERE p.date <= ?1
             )
             SELECT date, ticker, open, high, low, close, volume, value
             FROM ranked
             WHERE rn <= ?2
             ORDER BY ticker, date",
        )?;
        let rows = stmt
            .query_map(params![end_date.to_string(), window], |r| {
                Ok(PriceRow {
                    date: parse_date(&r.get::<_, String>(0)?),
                    ticker: r.get(1)?,
                    open: r.get(2)?,
                    high: r.get(3)?,
                    low: r.get(4)?,
                    close: r.get(5)?,
                    volume: r.get(6)?,
                    value: r.get(7)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// For every active ticker, the cap+fundamentals row at exact `dt`.
    pub fn get_daily_join(&self, dt: NaiveDate) -> Result<Vec<DailyJoinRow>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT t.ticker, t.name, t.market, c.mcap,
                    f.per, f.pbr, f.eps, f.bps, f.div, f.dps
             FROM ticker_master t
             LEFT JOIN cap_daily c ON c.ticker = t.ticker AND c.date = ?1
             LEFT JOIN fundamental_daily f ON f.ticker = t.ticker AND f.date = ?1
             WHERE t.active_flag = 1",
        )?;
        let dt_str = dt.to_string();
        let rows = stmt
            .query_map(params![dt_str], |r| {
                Ok(DailyJoinRow {
                    ticker: r.get(0)?,
                    name: r.get(1)?,
                    market: r.get(2)?,
                    mcap: r.get(3)?,
                    per: r.get(4)?,
                    pbr: r.get(5)?,
                    eps: r.get(6)?,
                    bps: r.get(7)?,
                    div: r.get(8)?,
                    dps: r.get(9)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// All `FundamentalRow`s with `end_date - years <= date <= end_date`.
    pub fn get_fundamental_window(
        &self,
        end_date: NaiveDate,
        years: i64,
    ) -> Result<Vec<FundamentalRow>> {
        let conn = self.conn.lock().unwrap();
        let start = end_date
            .with_year(end_date.year() - i32::try_from(years).unwrap_or(0))
            .unwrap_or(end_date);
        let mut stmt = conn.prepare(
            "SELECT date, ticker, per, pbr, eps, bps, div, dps
             FROM fundamental_daily
             WHERE date >= ?1 AND date <= ?2
             ORDER BY ticker, date",
        )?;
        let rows = stmt
            .query_map(params![start.to_string(), end_date.to_string()], |r| {
                Ok(FundamentalRow {
                    date: parse_date(&r.get::<_, String>(0)?),
                    ticker: r.get(1)?,
                    per: r.get(2)?,
                    pbr: r.get(3)?,
                    eps: r.get(4)?,
                    bps: r.get(5)?,
                    div: r.get(6)?,
                    dps: r.get(7)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn get_latest_price_date(&self) -> Result<Option<NaiveDate>> {
        let conn = self.conn.lock().unwrap();
        let d: Option<String> = conn
            .query_row("SELECT MAX(date) FROM prices_daily", [], |r| r.get(0))
            .optional()?
            .flatten();
        Ok(d.map(|s| parse_date(&s)))
    }

    pub fn get_latest_snapshot_date(&self) -> Result<Option<NaiveDate>> {
        let conn = self.conn.lock().unwrap();
        let d: Option<String> = conn
            .query_row("SELECT MAX(asof_date) FROM snapshot_metrics", [], |r| {
                r.get(0)
            })
            .optional()?
            .flatten();
        Ok(d.map(|s| parse_date(&s)))
    }

    pub fn count_active_tickers(&self) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM ticker_master WHERE active_flag = 1",
            [],
            |r| r.get(0),
        )?;
        Ok(n)
    }

    /// All tickers (active and inactive) in storage order.
    pub fn list_tickers(&self, active_only: bool) -> Result<Vec<Ticker>> {
        let conn = self.conn.lock().unwrap();
        let sql = if active_only {
            "SELECT ticker, name, market, active_flag FROM ticker_master WHERE active_flag = 1 ORDER BY ticker"
        } else {
            "SELECT ticker, name, market, active_flag FROM ticker_master ORDER BY ticker"
        };
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt
            .query_map([], |r| {
                let market_str: String = r.get(2)?;
                Ok(Ticker {
                    ticker: r.get(0)?,
                    name: r.get(1)?,
                    market: Market::parse(&market_str).unwrap_or(Market::Kospi),
                    active_flag: r.get::<_, i64>(3)? != 0,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn load_snapshot(&self, asof: &str) -> Result<Vec<SnapshotRow>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT asof_date, ticker, name, market, close, mcap, avg_value_20d, turnover_20d,
                    per, pbr, div, dps, eps, bps, roe_proxy, eps_positive, sma20, sma50, sma200,
                    dist_sma20, dist_sma50, dist_sma200, high_52w, low_52w, pos_52w,
                    near_52w_high_ratio, vol_20d, ret_1w, ret_1m, ret_3m, ret_6m, ret_1y,
                    eps_cagr_5y, eps_yoy_q, reserve_ratio, calc_version
             FROM snapshot_metrics
             WHERE asof_date = ?1
             ORDER BY ticker",
        )?;
        let rows = stmt
            .query_map(params![asof], |r| {
                Ok(SnapshotRow {
                    asof_date: r.get(0)?,
                    ticker: r.get(1)?,
                    name: r.get(2)?,
                    market: r.get(3)?,
                    close: r.get(4)?,
                    mcap: r.get(5)?,
                    avg_value_20d: r.get(6)?,
                    turnover_20d: r.get(7)?,
                    per: r.get(8)?,
                    pbr: r.get(9)?,
                    div: r.get(10)?,
                    dps: r.get(11)?,
                    eps: r.get(12)?,
                    bps: r.get(13)?,
                    roe_proxy: r.get(14)?,
                    eps_positive: r.get(15)?,
                    sma20: r.get(16)?,
                    sma50: r.get(17)?,
                    sma200: r.get(18)?,
                    dist_sma20: r.get(19)?,
                    dist_sma50: r.get(20)?,
                    dist_sma200: r.get(21)?,
                    high_52w: r.get(22)?,
                    low_52w: r.get(23)?,
                    pos_52w: r.get(24)?,
                    near_52w_high_ratio: r.get(25)?,
                    vol_20d: r.get(26)?,
                    ret_1w: r.get(27)?,
                    ret_1m: r.get(28)?,
                    ret_3m: r.get(29)?,
                    ret_6m: r.get(30)?,
                    ret_1y: r.get(31)?,
                    eps_cagr_5y: r.get(32)?,
                    eps_yoy_q: r.get(33)?,
                    reserve_ratio: r.get(34)?,
                    calc_version: r.get(35)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Record a stage's outcome in the audit log (§6 `job_log`).
    pub fn log_stage(
        &self,
        run_id: &str,
        stage: &str,
        status: &str,
        row_count: Option<i64>,
        message: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO job_log(run_id, stage, status, started_at, ended_at, message, row_count)
             VALUES (?1, ?2, ?3, CURRENT_TIMESTAMP, CURRENT_TIMESTAMP, ?4, ?5)
             ON CONFLICT(run_id, stage) DO UPDATE SET
                 status = excluded.status,
                 ended_at = CURRENT_TIMESTAMP,
                 message = excluded.message,
                 row_count = excluded.row_count",
            params![run_id, stage, status, message, row_count],
        )?;
        Ok(())
    }
}

fn parse_date(s: &str) -> NaiveDate {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").expect("dates are always stored as YYYY-MM-DD")
}
