//! Core domain records
//! Mission: Typed rows shared by storage, analysis, alerts and the API

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Listing market of a ticker. Korean codes are all digits (e.g. `005930`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Country {
    #[serde(rename = "KR")]
    Kr,
    #[serde(rename = "US")]
    Us,
}

impl Country {
    pub fn infer(ticker: &str) -> Self {
        if !ticker.is_empty() && ticker.chars().all(|c| c.is_ascii_digit()) {
            Country::Kr
        } else {
            Country::Us
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Country::Kr => "KR",
            Country::Us => "US",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().as_str() {
            "KR" => Some(Country::Kr),
            "US" => Some(Country::Us),
            _ => None,
        }
    }

    /// Amount used when a watchlist item has none: 1,000,000 KRW or 1,000 USD.
    pub fn default_investment(&self) -> f64 {
        match self {
            Country::Kr => 1_000_000.0,
            Country::Us => 1_000.0,
        }
    }
}

impl fmt::Display for Country {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sigma multiple a buy alert fired at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AlertLevel {
    #[serde(rename = "0.5x")]
    Half,
    #[serde(rename = "1x")]
    One,
    #[serde(rename = "2x")]
    Two,
}

impl AlertLevel {
    /// Most severe first.
    pub const DESCENDING: [AlertLevel; 3] = [AlertLevel::Two, AlertLevel::One, AlertLevel::Half];

    pub fn multiplier(&self) -> f64 {
        match self {
            AlertLevel::Half => 0.5,
            AlertLevel::One => 1.0,
            AlertLevel::Two => 2.0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AlertLevel::Half => "0.5x",
            AlertLevel::One => "1x",
            AlertLevel::Two => "2x",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim() {
            "0.5x" => Some(AlertLevel::Half),
            "1x" => Some(AlertLevel::One),
            "2x" => Some(AlertLevel::Two),
            _ => None,
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            AlertLevel::Half => "Test buy",
            AlertLevel::One => "1st buy",
            AlertLevel::Two => "2nd buy",
        }
    }

    /// Multiplier applied to the investment amount when sizing a buy.
    pub fn amount_factor(&self) -> f64 {
        self.multiplier()
    }
}

impl fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One trading day of OHLCV data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyBar {
    pub ticker: String,
    pub ticker_name: Option<String>,
    pub date: NaiveDate,
    pub open: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub close: f64,
    pub volume: Option<i64>,
}

/// Intraday snapshot taken by the realtime loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MinuteBar {
    pub ticker: String,
    pub ticker_name: Option<String>,
    pub timestamp: NaiveDateTime,
    pub timestamp_utc: NaiveDateTime,
    pub market_date: NaiveDate,
    pub price: f64,
    pub volume: Option<i64>,
}

/// Cached volatility targets for one ticker on one calendar day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatisticsRecord {
    pub ticker: String,
    pub ticker_name: Option<String>,
    pub country: Country,
    /// Day the record was computed for (cache key).
    pub date: NaiveDate,
    /// Date of the last bar in the window.
    pub data_date: NaiveDate,
    pub mean_return: f64,
    pub std_dev: f64,
    pub current_price: f64,
    pub target_05sigma: f64,
    pub target_1sigma: f64,
    pub target_2sigma: f64,
    pub drop_05x: f64,
    pub drop_1x: f64,
    pub drop_2x: f64,
    pub updated_at: Option<String>,
}

impl StatisticsRecord {
    pub fn target(&self, level: AlertLevel) -> f64 {
        match level {
            AlertLevel::Half => self.target_05sigma,
            AlertLevel::One => self.target_1sigma,
            AlertLevel::Two => self.target_2sigma,
        }
    }

    pub fn drop_pct(&self, level: AlertLevel) -> f64 {
        match level {
            AlertLevel::Half => self.drop_05x,
            AlertLevel::One => self.drop_1x,
            AlertLevel::Two => self.drop_2x,
        }
    }

    pub fn display_name(&self) -> &str {
        self.ticker_name.as_deref().unwrap_or(&self.ticker)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub name: String,
    pub chat_id: Option<i64>,
    pub ntfy_topic: Option<String>,
    #[serde(skip_serializing)]
    pub password_hash: Option<String>,
    pub enabled: bool,
    pub notification_enabled: bool,
    pub created_at: String,
}

/// Fields accepted when registering a user.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewUser {
    pub name: String,
    pub chat_id: Option<i64>,
    pub ntfy_topic: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchlistItem {
    pub user_id: i64,
    pub ticker: String,
    /// Resolved display name: watchlist name, then stored ticker name, then ticker.
    pub name: String,
    pub country: Country,
    pub investment_amount: Option<f64>,
    pub enabled: bool,
    pub added_at: String,
}

impl WatchlistItem {
    /// Configured amount, or the country default when unset.
    pub fn amount(&self) -> f64 {
        self.investment_amount
            .filter(|a| *a > 0.0)
            .unwrap_or_else(|| self.country.default_investment())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Setting {
    pub key: String,
    pub value: String,
    pub description: Option<String>,
    pub updated_at: Option<String>,
}

/// A buy alert, as recorded in `alert_history`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRecord {
    pub id: Option<i64>,
    pub user_id: i64,
    pub ticker: String,
    pub ticker_name: Option<String>,
    pub country: Country,
    pub level: AlertLevel,
    pub alert_date: NaiveDate,
    pub target_price: f64,
    pub current_price: f64,
    pub drop_rate: f64,
    pub alert_time: NaiveDateTime,
    pub sent: bool,
}

/// Alert history row joined with the watchlist amount for display.
#[derive(Debug, Clone, Serialize)]
pub struct AlertHistoryEntry {
    #[serde(flatten)]
    pub alert: AlertRecord,
    pub investment_amount: Option<f64>,
    pub shares: Option<i64>,
}

/// Live price observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub ticker: String,
    pub name: Option<String>,
    pub price: f64,
    pub previous_close: Option<f64>,
    pub currency: Option<String>,
    pub volume: Option<i64>,
    pub as_of: NaiveDateTime,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_country_inference() {
        assert_eq!(Country::infer("005930"), Country::Kr);
        assert_eq!(Country::infer("TQQQ"), Country::Us);
        assert_eq!(Country::infer("KS200"), Country::Us);
        assert_eq!(Country::infer(""), Country::Us);
    }

    #[test]
    fn test_alert_level_ordering() {
        assert!(AlertLevel::Two > AlertLevel::One);
        assert!(AlertLevel::One > AlertLevel::Half);
        assert_eq!(AlertLevel::DESCENDING[0], AlertLevel::Two);
        for level in AlertLevel::DESCENDING {
            assert_eq!(AlertLevel::from_str(level.as_str()), Some(level));
        }
    }

    #[test]
    fn test_alert_level_serde_names() {
        let json = serde_json::to_string(&AlertLevel::Half).unwrap();
        assert_eq!(json, "\"0.5x\"");
    }

    #[test]
    fn test_watchlist_amount_fallback() {
        let mut item = WatchlistItem {
            user_id: 1,
            ticker: "SPY".to_string(),
            name: "SPY".to_string(),
            country: Country::Us,
            investment_amount: None,
            enabled: true,
            added_at: String::new(),
        };
        assert_eq!(item.amount(), 1000.0);
        item.investment_amount = Some(0.0);
        assert_eq!(item.amount(), 1000.0);
        item.investment_amount = Some(250.0);
        assert_eq!(item.amount(), 250.0);
        item.country = Country::Kr;
        item.investment_amount = None;
        assert_eq!(item.amount(), 1_000_000.0);
    }
}
