//! Versioned schema migrations.
//!
//! Each entry runs once, in order, inside its own transaction. The applied
//! version lives in `PRAGMA user_version`.

use anyhow::{bail, Context, Result};
use rusqlite::Connection;
use tracing::info;

pub struct Migration {
    pub version: i64,
    pub name: &'static str,
    pub sql: &'static str,
}

pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "price tables and statistics cache",
        sql: r#"
CREATE TABLE daily_prices (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    ticker TEXT NOT NULL,
    ticker_name TEXT,
    date TEXT NOT NULL,
    open REAL,
    high REAL,
    low REAL,
    close REAL NOT NULL,
    volume INTEGER,
    created_at TEXT NOT NULL DEFAULT (datetime('now', 'localtime')),
    UNIQUE(ticker, date)
);
CREATE INDEX idx_daily_prices_ticker_date ON daily_prices(ticker, date DESC);

CREATE TABLE minute_prices (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    ticker TEXT NOT NULL,
    ticker_name TEXT,
    datetime TEXT NOT NULL,
    datetime_utc TEXT NOT NULL,
    market_date TEXT NOT NULL,
    price REAL NOT NULL,
    volume INTEGER,
    UNIQUE(ticker, datetime)
);
CREATE INDEX idx_minute_prices_ticker_dt ON minute_prices(ticker, datetime DESC);

CREATE TABLE statistics_cache (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    ticker TEXT NOT NULL,
    ticker_name TEXT,
    country TEXT NOT NULL DEFAULT 'US',
    date TEXT NOT NULL,
    data_date TEXT NOT NULL,
    mean_return REAL NOT NULL,
    std_dev REAL NOT NULL,
    current_price REAL NOT NULL,
    target_05sigma REAL NOT NULL,
    target_1sigma REAL NOT NULL,
    target_2sigma REAL NOT NULL,
    drop_05x REAL NOT NULL,
    drop_1x REAL NOT NULL,
    drop_2x REAL NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now', 'localtime')),
    UNIQUE(ticker, date)
);
"#,
    },
    Migration {
        version: 2,
        name: "users and watchlists",
        sql: r#"
CREATE TABLE users (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    chat_id INTEGER UNIQUE,
    enabled INTEGER NOT NULL DEFAULT 1,
    notification_enabled INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL DEFAULT (datetime('now', 'localtime'))
);

CREATE TABLE user_watchlist (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    ticker TEXT NOT NULL,
    name TEXT,
    country TEXT NOT NULL DEFAULT 'US',
    investment_amount REAL,
    enabled INTEGER NOT NULL DEFAULT 1,
    added_at TEXT NOT NULL DEFAULT (datetime('now', 'localtime')),
    UNIQUE(user_id, ticker)
);
CREATE INDEX idx_user_watchlist_ticker ON user_watchlist(ticker);
"#,
    },
    Migration {
        version: 3,
        name: "settings",
        sql: r#"
CREATE TABLE settings (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    description TEXT,
    created_at TEXT NOT NULL DEFAULT (datetime('now', 'localtime')),
    updated_at TEXT NOT NULL DEFAULT (datetime('now', 'localtime'))
) WITHOUT ROWID;
"#,
    },
    Migration {
        version: 4,
        name: "alert history",
        sql: r#"
CREATE TABLE alert_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    ticker TEXT NOT NULL,
    ticker_name TEXT,
    country TEXT NOT NULL DEFAULT 'US',
    alert_level TEXT NOT NULL CHECK (alert_level IN ('0.5x', '1x', '2x')),
    alert_date TEXT NOT NULL,
    target_price REAL NOT NULL,
    current_price REAL NOT NULL,
    drop_rate REAL NOT NULL,
    alert_time TEXT NOT NULL,
    sent INTEGER NOT NULL DEFAULT 1,
    UNIQUE(user_id, ticker, alert_date, alert_level)
);
CREATE INDEX idx_alert_history_user_time ON alert_history(user_id, alert_time DESC);
CREATE INDEX idx_alert_history_unsent ON alert_history(sent, alert_time) WHERE sent = 0;
"#,
    },
    Migration {
        version: 5,
        name: "web login and ntfy topics",
        sql: r#"
ALTER TABLE users ADD COLUMN password_hash TEXT;
ALTER TABLE users ADD COLUMN ntfy_topic TEXT;
"#,
    },
];

pub fn current_version(conn: &Connection) -> Result<i64> {
    conn.query_row("PRAGMA user_version", [], |row| row.get(0))
        .context("Failed to read schema version")
}

/// Apply every migration newer than the stored version. Returns how many ran.
pub fn apply(conn: &mut Connection) -> Result<usize> {
    let current = current_version(conn)?;
    let latest = MIGRATIONS.last().map(|m| m.version).unwrap_or(0);
    if current > latest {
        bail!(
            "Database schema version {} is newer than this build supports ({})",
            current,
            latest
        );
    }

    let mut applied = 0;
    for migration in MIGRATIONS.iter().filter(|m| m.version > current) {
        let tx = conn.transaction()?;
        tx.execute_batch(migration.sql).with_context(|| {
            format!(
                "Migration {} ({}) failed",
                migration.version, migration.name
            )
        })?;
        tx.pragma_update(None, "user_version", migration.version)?;
        tx.commit()?;

        info!(
            version = migration.version,
            name = migration.name,
            "📐 Schema migration applied"
        );
        applied += 1;
    }

    Ok(applied)
}
