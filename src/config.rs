//! Configuration
//! Mission: One place that turns the environment into typed settings
//!
//! Static wiring (paths, bind address, secrets, schedule) comes from env vars
//! and `.env`. Values users change at runtime (notification method, ntfy
//! topic, bot token override) live in the `settings` table instead.

use chrono::{NaiveTime, Timelike, Weekday};
use dotenv::dotenv;
use std::env;
use std::path::{Path, PathBuf};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

pub const DEFAULT_NTFY_SERVER: &str = "https://ntfy.sh";
const DEV_JWT_SECRET: &str = "dev-secret-change-in-production-minimum-32-characters";

#[derive(Debug, Clone)]
pub struct ScheduleConfig {
    pub daily_analysis_time: NaiveTime,
    pub missed_summary_time: NaiveTime,
    pub cleanup_time: NaiveTime,
    pub realtime_interval_minutes: u32,
    pub realtime_enabled: bool,
    pub minute_retention_days: i64,
    pub trading_days: Vec<Weekday>,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            daily_analysis_time: hm(8, 50),
            missed_summary_time: hm(8, 0),
            cleanup_time: hm(3, 0),
            realtime_interval_minutes: 5,
            realtime_enabled: true,
            minute_retention_days: 30,
            trading_days: vec![
                Weekday::Mon,
                Weekday::Tue,
                Weekday::Wed,
                Weekday::Thu,
                Weekday::Fri,
            ],
        }
    }
}

#[derive(Debug, Clone)]
pub struct AlertConfig {
    /// Fraction of a level's drop that already counts as reaching it.
    pub trigger_ratio: f64,
    pub cooldown_minutes: i64,
    pub window_start: NaiveTime,
    pub window_end: NaiveTime,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            trigger_ratio: 0.95,
            cooldown_minutes: 60,
            window_start: hm(9, 0),
            window_end: NaiveTime::from_hms_opt(23, 59, 59).unwrap_or(NaiveTime::MIN),
        }
    }
}

impl AlertConfig {
    pub fn in_window(&self, t: NaiveTime) -> bool {
        t >= self.window_start && t <= self.window_end
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub db_path: String,
    pub chart_dir: String,
    pub bind_addr: String,
    pub jwt_secret: String,
    pub jwt_ttl_hours: i64,
    pub telegram_bot_token: Option<String>,
    pub ntfy_server: String,
    pub font_path: Option<String>,
    pub history_years: u32,
    /// Closes used for the volatility window.
    pub lookback_days: usize,
    pub schedule: ScheduleConfig,
    pub alerts: AlertConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            db_path: default_data_path("data/stockwatch.db"),
            chart_dir: default_data_path("charts"),
            bind_addr: "0.0.0.0:3000".to_string(),
            jwt_secret: DEV_JWT_SECRET.to_string(),
            jwt_ttl_hours: 24,
            telegram_bot_token: None,
            ntfy_server: DEFAULT_NTFY_SERVER.to_string(),
            font_path: None,
            history_years: 1,
            lookback_days: 252,
            schedule: ScheduleConfig::default(),
            alerts: AlertConfig::default(),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a config from any key lookup; unknown or malformed values fall
    /// back to defaults.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let d = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let parse_time = |key: &str, default: NaiveTime| {
            get(key)
                .and_then(|v| NaiveTime::parse_from_str(v.trim(), "%H:%M").ok())
                .unwrap_or(default)
        };

        let schedule = ScheduleConfig {
            daily_analysis_time: parse_time("DAILY_ANALYSIS_TIME", d.schedule.daily_analysis_time),
            missed_summary_time: parse_time("MISSED_SUMMARY_TIME", d.schedule.missed_summary_time),
            cleanup_time: parse_time("CLEANUP_TIME", d.schedule.cleanup_time),
            realtime_interval_minutes: get("REALTIME_CHECK_MINUTES")
                .and_then(|v| v.parse().ok())
                .filter(|m| *m > 0)
                .unwrap_or(d.schedule.realtime_interval_minutes),
            realtime_enabled: get("REALTIME_ENABLED")
                .map(|v| parse_bool(&v))
                .unwrap_or(d.schedule.realtime_enabled),
            minute_retention_days: get("MINUTE_RETENTION_DAYS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(d.schedule.minute_retention_days),
            trading_days: d.schedule.trading_days.clone(),
        };

        let alerts = AlertConfig {
            trigger_ratio: get("ALERT_TRIGGER_RATIO")
                .and_then(|v| v.parse().ok())
                .filter(|r: &f64| *r > 0.0 && *r <= 1.0)
                .unwrap_or(d.alerts.trigger_ratio),
            cooldown_minutes: get("ALERT_COOLDOWN_MINUTES")
                .and_then(|v| v.parse().ok())
                .unwrap_or(d.alerts.cooldown_minutes),
            window_start: parse_time("ALERT_WINDOW_START", d.alerts.window_start),
            window_end: get("ALERT_WINDOW_END")
                .and_then(|v| parse_window_end(&v))
                .unwrap_or(d.alerts.window_end),
        };

        Self {
            db_path: resolve_data_path(get("DB_PATH"), "data/stockwatch.db"),
            chart_dir: resolve_data_path(get("CHART_DIR"), "charts"),
            bind_addr: get("BIND_ADDR").unwrap_or(d.bind_addr),
            jwt_secret: get("JWT_SECRET").unwrap_or(d.jwt_secret),
            jwt_ttl_hours: get("JWT_TTL_HOURS")
                .and_then(|v| v.parse().ok())
                .filter(|h| *h > 0)
                .unwrap_or(d.jwt_ttl_hours),
            telegram_bot_token: get("TELEGRAM_BOT_TOKEN"),
            ntfy_server: get("NTFY_SERVER").unwrap_or(d.ntfy_server),
            font_path: get("CHART_FONT_PATH"),
            history_years: get("HISTORY_YEARS")
                .and_then(|v| v.parse().ok())
                .filter(|y| *y > 0)
                .unwrap_or(d.history_years),
            lookback_days: get("LOOKBACK_DAYS")
                .and_then(|v| v.parse().ok())
                .filter(|n| *n >= 2)
                .unwrap_or(d.lookback_days),
            schedule,
            alerts,
        }
    }

    pub fn uses_dev_secret(&self) -> bool {
        self.jwt_secret == DEV_JWT_SECRET
    }
}

fn hm(h: u32, m: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(h, m, 0).unwrap_or(NaiveTime::MIN)
}

/// `HH:MM:SS` is taken as given; `HH:MM` covers that whole minute.
fn parse_window_end(v: &str) -> Option<NaiveTime> {
    let v = v.trim();
    NaiveTime::parse_from_str(v, "%H:%M:%S").ok().or_else(|| {
        NaiveTime::parse_from_str(v, "%H:%M")
            .ok()
            .and_then(|t| t.with_second(59))
    })
}

pub fn parse_bool(v: &str) -> bool {
    matches!(v.trim(), "1" | "true" | "TRUE" | "on" | "ON" | "yes" | "YES")
}

pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "stockwatch_backend=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

pub fn load_env() {
    // cwd and parents first, then the crate directory
    let _ = dotenv();

    let manifest_dir = Path::new(env!("CARGO_MANIFEST_DIR"));
    let candidate = manifest_dir.join(".env");
    if candidate.exists() {
        let _ = dotenv::from_path(&candidate);
    }
}

fn default_data_path(filename: &str) -> String {
    let base = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    base.join(filename).to_string_lossy().to_string()
}

/// Relative paths resolve against the crate directory, not the caller's cwd.
pub fn resolve_data_path(env_value: Option<String>, default_filename: &str) -> String {
    let Some(raw) = env_value.filter(|v| !v.trim().is_empty()) else {
        return default_data_path(default_filename);
    };

    if raw == ":memory:" {
        return raw;
    }

    let p = PathBuf::from(raw);
    if p.is_absolute() {
        return p.to_string_lossy().to_string();
    }
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join(p)
        .to_string_lossy()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::from_lookup(|_| None);
        assert_eq!(cfg.schedule.daily_analysis_time, hm(8, 50));
        assert_eq!(cfg.schedule.realtime_interval_minutes, 5);
        assert_eq!(cfg.alerts.trigger_ratio, 0.95);
        assert_eq!(cfg.alerts.cooldown_minutes, 60);
        assert_eq!(cfg.lookback_days, 252);
        assert!(cfg.db_path.ends_with("data/stockwatch.db"));
        assert!(cfg.uses_dev_secret());
    }

    #[test]
    fn test_overrides_and_bad_values() {
        let cfg = AppConfig::from_lookup(lookup(&[
            ("DAILY_ANALYSIS_TIME", "07:30"),
            ("REALTIME_CHECK_MINUTES", "0"),
            ("ALERT_TRIGGER_RATIO", "1.5"),
            ("REALTIME_ENABLED", "off"),
            ("DB_PATH", "/tmp/x.db"),
            ("TELEGRAM_BOT_TOKEN", "  "),
        ]));
        assert_eq!(cfg.schedule.daily_analysis_time, hm(7, 30));
        assert_eq!(cfg.schedule.realtime_interval_minutes, 5);
        assert_eq!(cfg.alerts.trigger_ratio, 0.95);
        assert!(!cfg.schedule.realtime_enabled);
        assert_eq!(cfg.db_path, "/tmp/x.db");
        assert!(cfg.telegram_bot_token.is_none());
    }

    #[test]
    fn test_alert_window() {
        let cfg = AlertConfig::default();
        assert!(!cfg.in_window(hm(8, 59)));
        assert!(cfg.in_window(hm(9, 0)));
        assert!(cfg.in_window(NaiveTime::from_hms_opt(23, 59, 30).unwrap()));
    }

    #[test]
    fn test_window_end_keeps_its_last_minute() {
        let minute = AppConfig::from_lookup(lookup(&[("ALERT_WINDOW_END", "23:59")]));
        assert!(minute.alerts.in_window(NaiveTime::from_hms_opt(23, 59, 45).unwrap()));
        assert_eq!(minute.alerts.window_end, NaiveTime::from_hms_opt(23, 59, 59).unwrap());

        let exact = AppConfig::from_lookup(lookup(&[("ALERT_WINDOW_END", "18:30:00")]));
        assert!(exact.alerts.in_window(hm(18, 30)));
        assert!(!exact.alerts.in_window(NaiveTime::from_hms_opt(18, 30, 1).unwrap()));

        let garbage = AppConfig::from_lookup(lookup(&[("ALERT_WINDOW_END", "late")]));
        assert_eq!(garbage.alerts.window_end, AlertConfig::default().window_end);
        assert_eq!(garbage.jwt_ttl_hours, 24);
    }

    #[test]
    fn test_resolve_data_path() {
        assert_eq!(resolve_data_path(Some(":memory:".into()), "x.db"), ":memory:");
        assert_eq!(resolve_data_path(Some("/var/a.db".into()), "x.db"), "/var/a.db");
        let rel = resolve_data_path(Some("data/a.db".into()), "x.db");
        assert!(rel.starts_with(env!("CARGO_MANIFEST_DIR")));
    }
}
