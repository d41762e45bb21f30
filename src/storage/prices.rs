use anyhow::{Context, Result};
use chrono::{Duration, NaiveDate, NaiveDateTime};
use rusqlite::{params, OptionalExtension};
use serde::Serialize;
use tracing::{debug, info};

use super::{date_col, datetime_col, fmt_date, fmt_datetime, StockDb};
use crate::models::{Country, DailyBar, MinuteBar, StatisticsRecord};

/// Row counts and coverage per table, for `status` output.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DataStatus {
    pub daily_rows: i64,
    pub daily_tickers: i64,
    pub daily_first: Option<String>,
    pub daily_last: Option<String>,
    pub minute_rows: i64,
    pub minute_last: Option<String>,
    pub cached_statistics: i64,
    pub cache_last: Option<String>,
}

impl StockDb {
    /// Insert or replace daily bars in one transaction. Returns rows written.
    pub fn insert_daily_bars(&self, bars: &[DailyBar]) -> Result<usize> {
        if bars.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR REPLACE INTO daily_prices
                    (ticker, ticker_name, date, open, high, low, close, volume)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            )?;
            for bar in bars {
                stmt.execute(params![
                    bar.ticker,
                    bar.ticker_name,
                    fmt_date(bar.date),
                    bar.open,
                    bar.high,
                    bar.low,
                    bar.close,
                    bar.volume,
                ])?;
            }
        }
        tx.commit().context("Failed to commit daily bars")?;
        debug!(rows = bars.len(), ticker = %bars[0].ticker, "Stored daily bars");
        Ok(bars.len())
    }

    /// Last `limit` closes for a ticker, oldest first.
    pub fn get_daily_prices(&self, ticker: &str, limit: usize) -> Result<Vec<DailyBar>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT ticker, ticker_name, date, open, high, low, close, volume
             FROM (
                SELECT * FROM daily_prices WHERE ticker = ?1 ORDER BY date DESC LIMIT ?2
             ) ORDER BY date ASC",
        )?;
        let rows = stmt
            .query_map(params![ticker, limit as i64], daily_bar_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn get_daily_prices_range(
        &self,
        ticker: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<DailyBar>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT ticker, ticker_name, date, open, high, low, close, volume
             FROM daily_prices
             WHERE ticker = ?1 AND date >= ?2 AND date <= ?3
             ORDER BY date ASC",
        )?;
        let rows = stmt
            .query_map(
                params![ticker, fmt_date(start), fmt_date(end)],
                daily_bar_from_row,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn get_latest_date(&self, ticker: &str) -> Result<Option<NaiveDate>> {
        let conn = self.conn.lock();
        let raw: Option<String> = conn.query_row(
            "SELECT MAX(date) FROM daily_prices WHERE ticker = ?1",
            params![ticker],
            |row| row.get(0),
        )?;
        raw.map(|s| NaiveDate::parse_from_str(&s, super::DATE_FMT))
            .transpose()
            .context("Corrupt date in daily_prices")
    }

    /// Most recent stored name for a ticker, if any bar carried one.
    pub fn get_ticker_name(&self, ticker: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();
        let name = conn
            .query_row(
                "SELECT ticker_name FROM daily_prices
                 WHERE ticker = ?1 AND ticker_name IS NOT NULL
                 ORDER BY date DESC LIMIT 1",
                params![ticker],
                |row| row.get(0),
            )
            .optional()?;
        Ok(name)
    }

    /// Tickers with any daily history.
    pub fn get_all_tickers(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare_cached("SELECT DISTINCT ticker FROM daily_prices ORDER BY ticker")?;
        let rows = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(rows)
    }

    pub fn insert_minute_bars(&self, bars: &[MinuteBar]) -> Result<usize> {
        if bars.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR REPLACE INTO minute_prices
                    (ticker, ticker_name, datetime, datetime_utc, market_date, price, volume)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;
            for bar in bars {
                stmt.execute(params![
                    bar.ticker,
                    bar.ticker_name,
                    fmt_datetime(bar.timestamp),
                    fmt_datetime(bar.timestamp_utc),
                    fmt_date(bar.market_date),
                    bar.price,
                    bar.volume,
                ])?;
            }
        }
        tx.commit().context("Failed to commit minute bars")?;
        Ok(bars.len())
    }

    /// Intraday snapshots at or after `since`, oldest first.
    pub fn get_minute_prices(&self, ticker: &str, since: NaiveDateTime) -> Result<Vec<MinuteBar>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT ticker, ticker_name, datetime, datetime_utc, market_date, price, volume
             FROM minute_prices
             WHERE ticker = ?1 AND datetime >= ?2
             ORDER BY datetime ASC",
        )?;
        let rows = stmt
            .query_map(params![ticker, fmt_datetime(since)], |row| {
                Ok(MinuteBar {
                    ticker: row.get(0)?,
                    ticker_name: row.get(1)?,
                    timestamp: datetime_col(row, 2)?,
                    timestamp_utc: datetime_col(row, 3)?,
                    market_date: date_col(row, 4)?,
                    price: row.get(5)?,
                    volume: row.get(6)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Drop intraday rows older than `keep_days` before `today`.
    pub fn cleanup_minute_data(&self, today: NaiveDate, keep_days: i64) -> Result<usize> {
        let cutoff = today - Duration::days(keep_days);
        let deleted = {
            let conn = self.conn.lock();
            conn.execute(
                "DELETE FROM minute_prices WHERE market_date < ?1",
                params![fmt_date(cutoff)],
            )?
        };
        if deleted > 0 {
            info!(deleted, cutoff = %cutoff, "🧹 Pruned old minute data");
        }
        Ok(deleted)
    }

    /// Insert or overwrite the cached targets for (ticker, date).
    pub fn upsert_statistics(&self, record: &StatisticsRecord) -> Result<()> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "INSERT INTO statistics_cache
                (ticker, ticker_name, country, date, data_date, mean_return, std_dev,
                 current_price, target_05sigma, target_1sigma, target_2sigma,
                 drop_05x, drop_1x, drop_2x, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14,
                     datetime('now', 'localtime'))
             ON CONFLICT(ticker, date) DO UPDATE SET
                ticker_name = excluded.ticker_name,
                country = excluded.country,
                data_date = excluded.data_date,
                mean_return = excluded.mean_return,
                std_dev = excluded.std_dev,
                current_price = excluded.current_price,
                target_05sigma = excluded.target_05sigma,
                target_1sigma = excluded.target_1sigma,
                target_2sigma = excluded.target_2sigma,
                drop_05x = excluded.drop_05x,
                drop_1x = excluded.drop_1x,
                drop_2x = excluded.drop_2x,
                updated_at = excluded.updated_at",
        )?;
        stmt.execute(params![
            record.ticker,
            record.ticker_name,
            record.country.as_str(),
            fmt_date(record.date),
            fmt_date(record.data_date),
            record.mean_return,
            record.std_dev,
            record.current_price,
            record.target_05sigma,
            record.target_1sigma,
            record.target_2sigma,
            record.drop_05x,
            record.drop_1x,
            record.drop_2x,
        ])
        .with_context(|| format!("Failed to cache statistics for {}", record.ticker))?;
        Ok(())
    }

    pub fn get_statistics(&self, ticker: &str, date: NaiveDate) -> Result<Option<StatisticsRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "{} WHERE ticker = ?1 AND date = ?2",
            STATS_SELECT
        ))?;
        let record = stmt
            .query_row(params![ticker, fmt_date(date)], statistics_from_row)
            .optional()?;
        Ok(record)
    }

    pub fn get_latest_statistics(&self, ticker: &str) -> Result<Option<StatisticsRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "{} WHERE ticker = ?1 ORDER BY date DESC LIMIT 1",
            STATS_SELECT
        ))?;
        let record = stmt
            .query_row(params![ticker], statistics_from_row)
            .optional()?;
        Ok(record)
    }

    pub fn data_status(&self) -> Result<DataStatus> {
        let conn = self.conn.lock();
        let (daily_rows, daily_tickers, daily_first, daily_last) = conn.query_row(
            "SELECT COUNT(*), COUNT(DISTINCT ticker), MIN(date), MAX(date) FROM daily_prices",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )?;
        let (minute_rows, minute_last) = conn.query_row(
            "SELECT COUNT(*), MAX(datetime) FROM minute_prices",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        let (cached_statistics, cache_last) = conn.query_row(
            "SELECT COUNT(*), MAX(date) FROM statistics_cache",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        Ok(DataStatus {
            daily_rows,
            daily_tickers,
            daily_first,
            daily_last,
            minute_rows,
            minute_last,
            cached_statistics,
            cache_last,
        })
    }
}

const STATS_SELECT: &str = "SELECT ticker, ticker_name, country, date, data_date, mean_return,
        std_dev, current_price, target_05sigma, target_1sigma, target_2sigma,
        drop_05x, drop_1x, drop_2x, updated_at
     FROM statistics_cache";

fn daily_bar_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DailyBar> {
    Ok(DailyBar {
        ticker: row.get(0)?,
        ticker_name: row.get(1)?,
        date: date_col(row, 2)?,
        open: row.get(3)?,
        high: row.get(4)?,
        low: row.get(5)?,
        close: row.get(6)?,
        volume: row.get(7)?,
    })
}

fn statistics_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<StatisticsRecord> {
    let country: String = row.get(2)?;
    Ok(StatisticsRecord {
        ticker: row.get(0)?,
        ticker_name: row.get(1)?,
        country: Country::from_str(&country).unwrap_or(Country::Us),
        date: date_col(row, 3)?,
        data_date: date_col(row, 4)?,
        mean_return: row.get(5)?,
        std_dev: row.get(6)?,
        current_price: row.get(7)?,
        target_05sigma: row.get(8)?,
        target_1sigma: row.get(9)?,
        target_2sigma: row.get(10)?,
        drop_05x: row.get(11)?,
        drop_1x: row.get(12)?,
        drop_2x: row.get(13)?,
        updated_at: row.get(14)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 1, d).unwrap()
    }

    fn bar(ticker: &str, d: u32, close: f64) -> DailyBar {
        DailyBar {
            ticker: ticker.to_string(),
            ticker_name: Some(format!("{} Inc", ticker)),
            date: day(d),
            open: Some(close),
            high: Some(close + 1.0),
            low: Some(close - 1.0),
            close,
            volume: Some(1_000),
        }
    }

    fn stats(ticker: &str, date: NaiveDate, current: f64) -> StatisticsRecord {
        StatisticsRecord {
            ticker: ticker.to_string(),
            ticker_name: None,
            country: Country::Us,
            date,
            data_date: date,
            mean_return: 0.1,
            std_dev: 2.0,
            current_price: current,
            target_05sigma: current * 0.99,
            target_1sigma: current * 0.98,
            target_2sigma: current * 0.96,
            drop_05x: 1.0,
            drop_1x: 2.0,
            drop_2x: 4.0,
            updated_at: None,
        }
    }

    #[test]
    fn test_daily_prices_last_n_ascending() {
        let db = StockDb::in_memory().unwrap();
        let bars: Vec<_> = (1..=10).map(|d| bar("SPY", d, 100.0 + d as f64)).collect();
        assert_eq!(db.insert_daily_bars(&bars).unwrap(), 10);

        let last3 = db.get_daily_prices("SPY", 3).unwrap();
        let dates: Vec<_> = last3.iter().map(|b| b.date).collect();
        assert_eq!(dates, vec![day(8), day(9), day(10)]);
        assert_eq!(db.get_latest_date("SPY").unwrap(), Some(day(10)));
        assert_eq!(db.get_latest_date("QQQ").unwrap(), None);
    }

    #[test]
    fn test_daily_insert_replaces_same_date() {
        let db = StockDb::in_memory().unwrap();
        db.insert_daily_bars(&[bar("SPY", 2, 100.0)]).unwrap();
        db.insert_daily_bars(&[bar("SPY", 2, 105.0)]).unwrap();

        let rows = db.get_daily_prices_range("SPY", day(1), day(31)).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].close, 105.0);
        assert_eq!(db.get_ticker_name("SPY").unwrap().as_deref(), Some("SPY Inc"));
    }

    #[test]
    fn test_statistics_cache_one_row_per_day() {
        let db = StockDb::in_memory().unwrap();
        db.upsert_statistics(&stats("TQQQ", day(5), 50.0)).unwrap();
        db.upsert_statistics(&stats("TQQQ", day(5), 55.0)).unwrap();
        db.upsert_statistics(&stats("TQQQ", day(6), 60.0)).unwrap();

        let cached = db.get_statistics("TQQQ", day(5)).unwrap().unwrap();
        assert_eq!(cached.current_price, 55.0);
        assert!(db.get_statistics("TQQQ", day(7)).unwrap().is_none());

        let latest = db.get_latest_statistics("TQQQ").unwrap().unwrap();
        assert_eq!(latest.date, day(6));
        assert_eq!(db.data_status().unwrap().cached_statistics, 2);
    }

    #[test]
    fn test_minute_cleanup_keeps_recent() {
        let db = StockDb::in_memory().unwrap();
        let make = |d: u32| {
            let ts = day(d).and_hms_opt(10, 0, 0).unwrap();
            MinuteBar {
                ticker: "005930".to_string(),
                ticker_name: None,
                timestamp: ts,
                timestamp_utc: ts - Duration::hours(9),
                market_date: day(d),
                price: 70_000.0,
                volume: None,
            }
        };
        db.insert_minute_bars(&[make(1), make(20), make(30)]).unwrap();

        let removed = db.cleanup_minute_data(day(31), 15).unwrap();
        assert_eq!(removed, 1);

        let since = day(1).and_hms_opt(0, 0, 0).unwrap();
        let left = db.get_minute_prices("005930", since).unwrap();
        assert_eq!(left.len(), 2);
        assert_eq!(left[0].market_date, day(20));
    }

    #[test]
    fn test_data_status_counts() {
        let db = StockDb::in_memory().unwrap();
        db.insert_daily_bars(&[bar("SPY", 1, 1.0), bar("QQQ", 2, 2.0)])
            .unwrap();
        let status = db.data_status().unwrap();
        assert_eq!(status.daily_rows, 2);
        assert_eq!(status.daily_tickers, 2);
        assert_eq!(status.daily_first.as_deref(), Some("2025-01-01"));
        assert_eq!(db.get_all_tickers().unwrap(), vec!["QQQ", "SPY"]);
    }
}
