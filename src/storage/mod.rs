//! SQLite Storage
//! Mission: One database file for prices, cached targets, users, watchlists,
//! settings and alert history
//!
//! - WAL mode so the web API can read while the scheduler writes
//! - Schema changes ship as numbered migrations tracked in `PRAGMA user_version`
//! - Prepared statement caching on hot paths

mod alerts;
mod migrations;
mod prices;
mod settings;
mod users;

pub use migrations::{Migration, MIGRATIONS};
pub use prices::DataStatus;
pub use settings::{SettingsSnapshot, SnapshotUser, SnapshotWatchItem};

use anyhow::{bail, Context, Result};
use chrono::{NaiveDate, NaiveDateTime};
use parking_lot::Mutex;
use rusqlite::{types::Type, Connection, OpenFlags, Row};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

const DATE_FMT: &str = "%Y-%m-%d";
const DATETIME_FMT: &str = "%Y-%m-%d %H:%M:%S";

/// Shared handle to the stock database. Cloning is cheap.
#[derive(Clone)]
pub struct StockDb {
    conn: Arc<Mutex<Connection>>,
}

impl StockDb {
    /// Open (or create) the database and apply pending migrations.
    pub fn new(db_path: &str) -> Result<Self> {
        if db_path != ":memory:" {
            if let Some(parent) = Path::new(db_path).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)
                        .with_context(|| format!("Failed to create {}", parent.display()))?;
                }
            }
        }

        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let mut conn = Connection::open_with_flags(db_path, flags)
            .with_context(|| format!("Failed to open database at {}", db_path))?;

        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        conn.pragma_update(None, "foreign_keys", "ON")
            .context("Failed to enable foreign keys")?;

        let applied = migrations::apply(&mut conn)?;
        if applied > 0 {
            info!("🗄️  Applied {} schema migration(s) to {}", applied, db_path);
        } else {
            debug!("Schema up to date at {}", db_path);
        }

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn in_memory() -> Result<Self> {
        Self::new(":memory:")
    }

    pub fn schema_version(&self) -> Result<i64> {
        let conn = self.conn.lock();
        migrations::current_version(&conn)
    }

    /// Write a consistent copy of the database to `dest`.
    pub fn backup_to(&self, dest: &Path) -> Result<()> {
        if dest.exists() {
            bail!("Backup target {} already exists", dest.display());
        }
        if let Some(parent) = dest.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = self.conn.lock();
        conn.execute("VACUUM INTO ?1", [dest.to_string_lossy().as_ref()])
            .with_context(|| format!("Failed to back up database to {}", dest.display()))?;
        info!("💾 Database backed up to {}", dest.display());
        Ok(())
    }

    pub fn vacuum(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch("VACUUM").context("VACUUM failed")
    }
}

pub(crate) fn fmt_date(date: NaiveDate) -> String {
    date.format(DATE_FMT).to_string()
}

pub(crate) fn fmt_datetime(ts: NaiveDateTime) -> String {
    ts.format(DATETIME_FMT).to_string()
}

fn conversion_error(idx: usize, err: chrono::ParseError) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

pub(crate) fn date_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<NaiveDate> {
    let raw: String = row.get(idx)?;
    NaiveDate::parse_from_str(&raw, DATE_FMT).map_err(|e| conversion_error(idx, e))
}

pub(crate) fn datetime_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<NaiveDateTime> {
    let raw: String = row.get(idx)?;
    NaiveDateTime::parse_from_str(&raw, DATETIME_FMT).map_err(|e| conversion_error(idx, e))
}
