use anyhow::{anyhow, Context, Result};
use chrono::Local;
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::StockDb;
use crate::models::{Country, Setting};

/// Portable copy of settings, users and watchlists for moving between hosts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettingsSnapshot {
    pub export_date: String,
    pub version: u32,
    pub settings: Vec<Setting>,
    pub users: Vec<SnapshotUser>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotUser {
    pub name: String,
    pub chat_id: Option<i64>,
    pub ntfy_topic: Option<String>,
    pub enabled: bool,
    pub notification_enabled: bool,
    #[serde(default)]
    pub watchlist: Vec<SnapshotWatchItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotWatchItem {
    pub ticker: String,
    pub name: Option<String>,
    pub investment_amount: Option<f64>,
}

const SNAPSHOT_VERSION: u32 = 1;

impl StockDb {
    pub fn set_setting(&self, key: &str, value: &str, description: Option<&str>) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO settings (key, value, description)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                description = COALESCE(excluded.description, settings.description),
                updated_at = datetime('now', 'localtime')",
            params![key, value, description],
        )
        .with_context(|| format!("Failed to save setting {}", key))?;
        Ok(())
    }

    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached("SELECT value FROM settings WHERE key = ?1")?;
        Ok(stmt.query_row(params![key], |row| row.get(0)).optional()?)
    }

    pub fn get_setting_or(&self, key: &str, default: &str) -> Result<String> {
        Ok(self
            .get_setting(key)?
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| default.to_string()))
    }

    pub fn list_settings(&self) -> Result<Vec<Setting>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT key, value, description, updated_at FROM settings ORDER BY key",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(Setting {
                    key: row.get(0)?,
                    value: row.get(1)?,
                    description: row.get(2)?,
                    updated_at: row.get(3)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn delete_setting(&self, key: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let deleted = conn.execute("DELETE FROM settings WHERE key = ?1", params![key])?;
        Ok(deleted > 0)
    }

    pub fn export_snapshot(&self) -> Result<SettingsSnapshot> {
        let settings = self.list_settings()?;
        let mut users = Vec::new();
        for user in self.list_users(true)? {
            // Stored names only; resolved display names would pin on import.
            let watchlist = {
                let conn = self.conn.lock();
                let mut stmt = conn.prepare_cached(
                    "SELECT ticker, name, investment_amount FROM user_watchlist
                     WHERE user_id = ?1 AND enabled = 1
                     ORDER BY ticker",
                )?;
                let rows = stmt
                    .query_map(params![user.id], |row| {
                        Ok(SnapshotWatchItem {
                            ticker: row.get(0)?,
                            name: row.get(1)?,
                            investment_amount: row.get(2)?,
                        })
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            };
            users.push(SnapshotUser {
                name: user.name,
                chat_id: user.chat_id,
                ntfy_topic: user.ntfy_topic,
                enabled: user.enabled,
                notification_enabled: user.notification_enabled,
                watchlist,
            });
        }

        Ok(SettingsSnapshot {
            export_date: Local::now().to_rfc3339(),
            version: SNAPSHOT_VERSION,
            settings,
            users,
        })
    }

    /// Merge a snapshot in one transaction: settings overwrite, users are
    /// matched by name, and watchlist entries are added or re-enabled. Any
    /// failure leaves the database untouched.
    pub fn import_snapshot(&self, snapshot: &SettingsSnapshot) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        for setting in &snapshot.settings {
            tx.execute(
                "INSERT INTO settings (key, value, description)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET
                    value = excluded.value,
                    description = COALESCE(excluded.description, settings.description),
                    updated_at = datetime('now', 'localtime')",
                params![setting.key, setting.value, setting.description],
            )
            .with_context(|| format!("Failed to import setting {}", setting.key))?;
        }

        for entry in &snapshot.users {
            let name = entry.name.trim();
            if name.is_empty() {
                return Err(anyhow!("Snapshot contains a user without a name"));
            }
            tx.execute(
                "INSERT INTO users (name, chat_id, ntfy_topic, enabled, notification_enabled)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(name) DO UPDATE SET
                    chat_id = excluded.chat_id,
                    ntfy_topic = excluded.ntfy_topic,
                    enabled = excluded.enabled,
                    notification_enabled = excluded.notification_enabled",
                params![
                    name,
                    entry.chat_id,
                    entry.ntfy_topic,
                    entry.enabled,
                    entry.notification_enabled
                ],
            )
            .with_context(|| format!("Failed to import user {}", name))?;
            let user_id: i64 =
                tx.query_row("SELECT id FROM users WHERE name = ?1", params![name], |row| {
                    row.get(0)
                })?;

            for item in &entry.watchlist {
                let ticker = item.ticker.trim().to_uppercase();
                if ticker.is_empty() {
                    return Err(anyhow!("Snapshot watchlist of {} has an empty ticker", name));
                }
                tx.execute(
                    "INSERT INTO user_watchlist (user_id, ticker, name, country, investment_amount)
                     VALUES (?1, ?2, ?3, ?4, ?5)
                     ON CONFLICT(user_id, ticker) DO UPDATE SET
                        enabled = 1,
                        name = COALESCE(excluded.name, user_watchlist.name),
                        country = excluded.country,
                        investment_amount = COALESCE(excluded.investment_amount, user_watchlist.investment_amount)",
                    params![
                        user_id,
                        ticker,
                        item.name,
                        Country::infer(&ticker).as_str(),
                        item.investment_amount
                    ],
                )
                .with_context(|| format!("Failed to import {} for {}", ticker, name))?;
            }
        }

        tx.commit()?;
        info!(
            settings = snapshot.settings.len(),
            users = snapshot.users.len(),
            "📥 Imported settings snapshot"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NewUser;

    #[test]
    fn test_settings_crud() {
        let db = StockDb::in_memory().unwrap();
        assert!(db.get_setting("ntfy_topic").unwrap().is_none());
        assert_eq!(
            db.get_setting_or("notification_method", "telegram").unwrap(),
            "telegram"
        );

        db.set_setting("ntfy_topic", "alerts", Some("default topic"))
            .unwrap();
        db.set_setting("ntfy_topic", "alerts-2", None).unwrap();

        let all = db.list_settings().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].value, "alerts-2");
        assert_eq!(all[0].description.as_deref(), Some("default topic"));

        assert!(db.delete_setting("ntfy_topic").unwrap());
        assert!(!db.delete_setting("ntfy_topic").unwrap());
    }

    #[test]
    fn test_snapshot_moves_between_databases() {
        let source = StockDb::in_memory().unwrap();
        source
            .set_setting("notification_method", "ntfy", None)
            .unwrap();
        let alice = source
            .add_user(&NewUser {
                name: "alice".to_string(),
                chat_id: Some(7),
                ntfy_topic: Some("alice-alerts".to_string()),
            })
            .unwrap();
        source
            .add_watchlist_item(alice.id, "QLD", Some("ProShares Ultra QQQ"), Some(3000.0))
            .unwrap();

        let snapshot = source.export_snapshot().unwrap();
        let json = serde_json::to_string(&snapshot).unwrap();
        let parsed: SettingsSnapshot = serde_json::from_str(&json).unwrap();

        let target = StockDb::in_memory().unwrap();
        target.import_snapshot(&parsed).unwrap();

        let imported = target.get_user_by_name("alice").unwrap().unwrap();
        assert_eq!(imported.chat_id, Some(7));
        assert_eq!(imported.ntfy_topic.as_deref(), Some("alice-alerts"));
        let watchlist = target.get_watchlist(imported.id).unwrap();
        assert_eq!(watchlist.len(), 1);
        assert_eq!(watchlist[0].name, "ProShares Ultra QQQ");
        assert_eq!(
            target.get_setting("notification_method").unwrap().as_deref(),
            Some("ntfy")
        );

        // Importing twice is harmless.
        target.import_snapshot(&parsed).unwrap();
        assert_eq!(target.list_users(true).unwrap().len(), 1);
    }

    #[test]
    fn test_export_keeps_unnamed_items_unnamed() {
        let db = StockDb::in_memory().unwrap();
        let bob = db
            .add_user(&NewUser {
                name: "bob".to_string(),
                ..Default::default()
            })
            .unwrap();
        db.add_watchlist_item(bob.id, "SPY", None, None).unwrap();
        db.insert_daily_bars(&[crate::models::DailyBar {
            ticker: "SPY".to_string(),
            ticker_name: Some("SPDR S&P 500".to_string()),
            date: chrono::NaiveDate::from_ymd_opt(2025, 3, 14).unwrap(),
            open: None,
            high: None,
            low: None,
            close: 560.0,
            volume: None,
        }])
        .unwrap();
        assert_eq!(db.get_watchlist(bob.id).unwrap()[0].name, "SPDR S&P 500");

        let snapshot = db.export_snapshot().unwrap();
        assert_eq!(snapshot.users[0].watchlist[0].name, None);
    }

    #[test]
    fn test_failed_import_changes_nothing() {
        let db = StockDb::in_memory().unwrap();
        db.set_setting("notification_method", "telegram", None).unwrap();
        db.add_user(&NewUser {
            name: "carol".to_string(),
            chat_id: Some(99),
            ntfy_topic: None,
        })
        .unwrap();

        let user = |name: &str, chat_id: Option<i64>| SnapshotUser {
            name: name.to_string(),
            chat_id,
            ntfy_topic: None,
            enabled: true,
            notification_enabled: true,
            watchlist: vec![SnapshotWatchItem {
                ticker: "QQQ".to_string(),
                name: None,
                investment_amount: None,
            }],
        };
        // dave's chat id collides with carol's
        let snapshot = SettingsSnapshot {
            export_date: String::new(),
            version: SNAPSHOT_VERSION,
            settings: vec![Setting {
                key: "notification_method".to_string(),
                value: "ntfy".to_string(),
                description: None,
                updated_at: None,
            }],
            users: vec![user("erin", None), user("dave", Some(99))],
        };

        assert!(db.import_snapshot(&snapshot).is_err());
        assert_eq!(
            db.get_setting("notification_method").unwrap().as_deref(),
            Some("telegram")
        );
        assert!(db.get_user_by_name("erin").unwrap().is_none());
        assert_eq!(db.list_users(true).unwrap().len(), 1);
    }
}
