use anyhow::{anyhow, Context, Result};
use bcrypt::{hash, verify, DEFAULT_COST};
use rusqlite::{params, OptionalExtension};
use tracing::{info, warn};

use super::StockDb;
use crate::models::{Country, NewUser, User, WatchlistItem};

const USER_SELECT: &str = "SELECT id, name, chat_id, ntfy_topic, password_hash, enabled,
        notification_enabled, created_at
     FROM users";

fn user_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        name: row.get(1)?,
        chat_id: row.get(2)?,
        ntfy_topic: row.get(3)?,
        password_hash: row.get(4)?,
        enabled: row.get(5)?,
        notification_enabled: row.get(6)?,
        created_at: row.get(7)?,
    })
}

impl StockDb {
    pub fn add_user(&self, new_user: &NewUser) -> Result<User> {
        let name = new_user.name.trim();
        if name.is_empty() {
            return Err(anyhow!("User name must not be empty"));
        }
        let id = {
            let conn = self.conn.lock();
            conn.execute(
                "INSERT INTO users (name, chat_id, ntfy_topic) VALUES (?1, ?2, ?3)",
                params![name, new_user.chat_id, new_user.ntfy_topic],
            )
            .with_context(|| format!("Failed to add user {}", name))?;
            conn.last_insert_rowid()
        };
        info!("👤 Added user {} (id {})", name, id);
        self.get_user(id)?
            .ok_or_else(|| anyhow!("User {} vanished after insert", id))
    }

    pub fn get_user(&self, id: i64) -> Result<Option<User>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&format!("{} WHERE id = ?1", USER_SELECT))?;
        Ok(stmt.query_row(params![id], user_from_row).optional()?)
    }

    pub fn get_user_by_name(&self, name: &str) -> Result<Option<User>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&format!("{} WHERE name = ?1", USER_SELECT))?;
        Ok(stmt.query_row(params![name], user_from_row).optional()?)
    }

    pub fn get_user_by_chat_id(&self, chat_id: i64) -> Result<Option<User>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&format!("{} WHERE chat_id = ?1", USER_SELECT))?;
        Ok(stmt.query_row(params![chat_id], user_from_row).optional()?)
    }

    pub fn list_users(&self, include_disabled: bool) -> Result<Vec<User>> {
        let conn = self.conn.lock();
        let sql = if include_disabled {
            format!("{} ORDER BY id", USER_SELECT)
        } else {
            format!("{} WHERE enabled = 1 ORDER BY id", USER_SELECT)
        };
        let mut stmt = conn.prepare_cached(&sql)?;
        let users = stmt
            .query_map([], user_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(users)
    }

    fn update_user_field(&self, user_id: i64, sql: &str, value: &dyn rusqlite::ToSql) -> Result<()> {
        let changed = {
            let conn = self.conn.lock();
            conn.execute(sql, params![value, user_id])?
        };
        if changed == 0 {
            return Err(anyhow!("No user with id {}", user_id));
        }
        Ok(())
    }

    pub fn set_user_enabled(&self, user_id: i64, enabled: bool) -> Result<()> {
        self.update_user_field(user_id, "UPDATE users SET enabled = ?1 WHERE id = ?2", &enabled)
    }

    pub fn set_notification_enabled(&self, user_id: i64, enabled: bool) -> Result<()> {
        self.update_user_field(
            user_id,
            "UPDATE users SET notification_enabled = ?1 WHERE id = ?2",
            &enabled,
        )
    }

    pub fn set_ntfy_topic(&self, user_id: i64, topic: Option<&str>) -> Result<()> {
        let topic = topic.map(str::trim).filter(|t| !t.is_empty());
        self.update_user_field(user_id, "UPDATE users SET ntfy_topic = ?1 WHERE id = ?2", &topic)
    }

    pub fn set_chat_id(&self, user_id: i64, chat_id: Option<i64>) -> Result<()> {
        self.update_user_field(user_id, "UPDATE users SET chat_id = ?1 WHERE id = ?2", &chat_id)
    }

    /// Store a bcrypt hash of `password` for web login.
    pub fn set_password(&self, user_id: i64, password: &str) -> Result<()> {
        let password_hash = hash(password, DEFAULT_COST).context("Failed to hash password")?;
        self.update_user_field(
            user_id,
            "UPDATE users SET password_hash = ?1 WHERE id = ?2",
            &password_hash,
        )?;
        info!("🔐 Password updated for user {}", user_id);
        Ok(())
    }

    /// Check a login. Disabled users and users without a password never match.
    pub fn verify_password(&self, name: &str, password: &str) -> Result<Option<User>> {
        let Some(user) = self.get_user_by_name(name)? else {
            return Ok(None);
        };
        if !user.enabled {
            warn!("Login attempt for disabled user {}", name);
            return Ok(None);
        }
        let Some(stored) = user.password_hash.as_deref() else {
            return Ok(None);
        };
        let valid = verify(password, stored).context("Failed to verify password")?;
        Ok(valid.then_some(user))
    }

    /// Add a ticker, or re-enable and update it if it was removed earlier.
    pub fn add_watchlist_item(
        &self,
        user_id: i64,
        ticker: &str,
        name: Option<&str>,
        investment_amount: Option<f64>,
    ) -> Result<()> {
        let ticker = ticker.trim().to_uppercase();
        if ticker.is_empty() {
            return Err(anyhow!("Ticker must not be empty"));
        }
        let country = Country::infer(&ticker);
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO user_watchlist (user_id, ticker, name, country, investment_amount)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(user_id, ticker) DO UPDATE SET
                enabled = 1,
                name = COALESCE(excluded.name, user_watchlist.name),
                country = excluded.country,
                investment_amount = COALESCE(excluded.investment_amount, user_watchlist.investment_amount)",
            params![user_id, ticker, name, country.as_str(), investment_amount],
        )
        .with_context(|| format!("Failed to add {} to watchlist of user {}", ticker, user_id))?;
        Ok(())
    }

    /// Disable a watchlist entry, keeping its settings. Returns false if absent.
    pub fn remove_watchlist_item(&self, user_id: i64, ticker: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE user_watchlist SET enabled = 0
             WHERE user_id = ?1 AND ticker = ?2 AND enabled = 1",
            params![user_id, ticker.trim().to_uppercase()],
        )?;
        Ok(changed > 0)
    }

    pub fn delete_watchlist_item(&self, user_id: i64, ticker: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "DELETE FROM user_watchlist WHERE user_id = ?1 AND ticker = ?2",
            params![user_id, ticker.trim().to_uppercase()],
        )?;
        Ok(changed > 0)
    }

    pub fn update_investment(&self, user_id: i64, ticker: &str, amount: f64) -> Result<bool> {
        if !amount.is_finite() || amount <= 0.0 {
            return Err(anyhow!("Investment amount must be positive, got {}", amount));
        }
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE user_watchlist SET investment_amount = ?1
             WHERE user_id = ?2 AND ticker = ?3 AND enabled = 1",
            params![amount, user_id, ticker.trim().to_uppercase()],
        )?;
        Ok(changed > 0)
    }

    pub fn get_watchlist_item(&self, user_id: i64, ticker: &str) -> Result<Option<WatchlistItem>> {
        let ticker = ticker.trim().to_uppercase();
        Ok(self
            .get_watchlist(user_id)?
            .into_iter()
            .find(|item| item.ticker == ticker))
    }

    /// Enabled watchlist entries with display names resolved.
    pub fn get_watchlist(&self, user_id: i64) -> Result<Vec<WatchlistItem>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT uw.user_id, uw.ticker,
                    COALESCE(uw.name,
                             (SELECT dp.ticker_name FROM daily_prices dp
                              WHERE dp.ticker = uw.ticker AND dp.ticker_name IS NOT NULL
                              ORDER BY dp.date DESC LIMIT 1),
                             uw.ticker),
                    uw.country, uw.investment_amount, uw.enabled, uw.added_at
             FROM user_watchlist uw
             WHERE uw.user_id = ?1 AND uw.enabled = 1
             ORDER BY uw.country, uw.ticker",
        )?;
        let items = stmt
            .query_map(params![user_id], |row| {
                let country: String = row.get(3)?;
                Ok(WatchlistItem {
                    user_id: row.get(0)?,
                    ticker: row.get(1)?,
                    name: row.get(2)?,
                    country: Country::from_str(&country).unwrap_or(Country::Us),
                    investment_amount: row.get(4)?,
                    enabled: row.get(5)?,
                    added_at: row.get(6)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(items)
    }

    /// Distinct tickers watched by at least one enabled user.
    pub fn watched_tickers(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT DISTINCT uw.ticker
             FROM user_watchlist uw
             JOIN users u ON u.id = uw.user_id
             WHERE uw.enabled = 1 AND u.enabled = 1
             ORDER BY uw.ticker",
        )?;
        let tickers = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(tickers)
    }
}
