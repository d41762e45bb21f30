use anyhow::{Context, Result};
use chrono::NaiveDate;
use rusqlite::params;
use tracing::{debug, info};

use super::{date_col, datetime_col, fmt_date, fmt_datetime, StockDb};
use crate::models::{AlertHistoryEntry, AlertLevel, AlertRecord, Country};

/// Hard cap on per-ticker history queries.
pub const MAX_TICKER_HISTORY: usize = 200;

const ALERT_COLUMNS: &str = "ah.id, ah.user_id, ah.ticker, ah.ticker_name, ah.country,
        ah.alert_level, ah.alert_date, ah.target_price, ah.current_price, ah.drop_rate,
        ah.alert_time, ah.sent";

fn alert_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AlertRecord> {
    let country: String = row.get(4)?;
    let level: String = row.get(5)?;
    Ok(AlertRecord {
        id: row.get(0)?,
        user_id: row.get(1)?,
        ticker: row.get(2)?,
        ticker_name: row.get(3)?,
        country: Country::from_str(&country).unwrap_or(Country::Us),
        level: AlertLevel::from_str(&level).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                5,
                rusqlite::types::Type::Text,
                format!("unknown alert level {level}").into(),
            )
        })?,
        alert_date: date_col(row, 6)?,
        target_price: row.get(7)?,
        current_price: row.get(8)?,
        drop_rate: row.get(9)?,
        alert_time: datetime_col(row, 10)?,
        sent: row.get(11)?,
    })
}

impl StockDb {
    pub fn alert_exists(
        &self,
        user_id: i64,
        ticker: &str,
        date: NaiveDate,
        level: AlertLevel,
    ) -> Result<bool> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT EXISTS(
                SELECT 1 FROM alert_history
                WHERE user_id = ?1 AND ticker = ?2 AND alert_date = ?3 AND alert_level = ?4
             )",
        )?;
        let exists = stmt.query_row(
            params![user_id, ticker, fmt_date(date), level.as_str()],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    /// Insert an alert. Returns false when the same (user, ticker, day, level)
    /// was already recorded.
    pub fn record_alert(&self, alert: &AlertRecord) -> Result<bool> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "INSERT OR IGNORE INTO alert_history
                (user_id, ticker, ticker_name, country, alert_level, alert_date,
                 target_price, current_price, drop_rate, alert_time, sent)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        )?;
        let inserted = stmt
            .execute(params![
                alert.user_id,
                alert.ticker,
                alert.ticker_name,
                alert.country.as_str(),
                alert.level.as_str(),
                fmt_date(alert.alert_date),
                alert.target_price,
                alert.current_price,
                alert.drop_rate,
                fmt_datetime(alert.alert_time),
                alert.sent,
            ])
            .with_context(|| format!("Failed to record alert for {}", alert.ticker))?;
        if inserted == 0 {
            debug!(
                user_id = alert.user_id,
                ticker = %alert.ticker,
                level = %alert.level,
                "Duplicate alert ignored"
            );
        }
        Ok(inserted > 0)
    }

    /// Alerts recorded but not delivered, oldest first.
    pub fn unsent_alerts(&self, user_id: Option<i64>) -> Result<Vec<AlertRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {ALERT_COLUMNS} FROM alert_history ah
             WHERE ah.sent = 0 AND (?1 IS NULL OR ah.user_id = ?1)
             ORDER BY ah.alert_time ASC"
        ))?;
        let rows = stmt
            .query_map(params![user_id], alert_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn mark_alerts_sent(&self, ids: &[i64]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut updated = 0;
        {
            let mut stmt = tx.prepare_cached("UPDATE alert_history SET sent = 1 WHERE id = ?1")?;
            for id in ids {
                updated += stmt.execute(params![id])?;
            }
        }
        tx.commit()?;
        Ok(updated)
    }

    /// A user's most recent alerts with the share count the watchlist amount buys.
    pub fn user_alert_history(&self, user_id: i64, limit: usize) -> Result<Vec<AlertHistoryEntry>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {ALERT_COLUMNS}, uw.investment_amount
             FROM alert_history ah
             LEFT JOIN user_watchlist uw ON uw.user_id = ah.user_id AND uw.ticker = ah.ticker
             WHERE ah.user_id = ?1
             ORDER BY ah.alert_time DESC
             LIMIT ?2"
        ))?;
        let rows = stmt
            .query_map(params![user_id, limit as i64], |row| {
                let alert = alert_from_row(row)?;
                let investment_amount: Option<f64> = row.get(12)?;
                let shares = investment_amount
                    .filter(|a| *a > 0.0 && alert.current_price > 0.0)
                    .map(|a| (a / alert.current_price).floor() as i64);
                Ok(AlertHistoryEntry {
                    alert,
                    investment_amount,
                    shares,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn ticker_alert_history(&self, ticker: &str, limit: usize) -> Result<Vec<AlertRecord>> {
        let limit = limit.min(MAX_TICKER_HISTORY);
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {ALERT_COLUMNS} FROM alert_history ah
             WHERE ah.ticker = ?1
             ORDER BY ah.alert_time DESC
             LIMIT ?2"
        ))?;
        let rows = stmt
            .query_map(params![ticker, limit as i64], alert_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Delete alert history for one day, or all of it.
    pub fn clear_alert_history(&self, date: Option<NaiveDate>) -> Result<usize> {
        let deleted = {
            let conn = self.conn.lock();
            match date {
                Some(d) => conn.execute(
                    "DELETE FROM alert_history WHERE alert_date = ?1",
                    params![fmt_date(d)],
                )?,
                None => conn.execute("DELETE FROM alert_history", [])?,
            }
        };
        info!(deleted, "🗑️  Cleared alert history");
        Ok(deleted)
    }
}
