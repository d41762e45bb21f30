//! Report Formatting
//! Mission: Turn prices, targets and alerts into the text users read
//!
//! KR prices are whole won with a `원` suffix; US prices are dollars with
//! two decimals.

use chrono::{NaiveDate, NaiveTime};
use num_format::{Locale, ToFormattedString};

use crate::analysis::backtest::BacktestResult;
use crate::analysis::volatility::{suggested_shares, VolatilityReport};
use crate::models::{AlertLevel, AlertRecord, Country, WatchlistItem};
use crate::notify::Notification;

const RULE: &str = "━━━━━━━━━━━━━━━━━━";

fn grouped(whole: i64) -> String {
    let digits = whole.unsigned_abs().to_formatted_string(&Locale::en);
    if whole < 0 {
        format!("-{}", digits)
    } else {
        digits
    }
}

pub fn format_price(price: f64, country: Country) -> String {
    match country {
        Country::Kr => format!("{}원", grouped(price.round() as i64)),
        Country::Us => {
            let cents = (price * 100.0).round() as i64;
            let sign = if cents < 0 { "-" } else { "" };
            let cents = cents.abs();
            format!("{}${}.{:02}", sign, grouped(cents / 100), cents % 100)
        }
    }
}

/// Investment amounts: KR in whole won, US in whole dollars.
pub fn format_amount(amount: f64, country: Country) -> String {
    match country {
        Country::Kr => format!("{}원", grouped(amount.round() as i64)),
        Country::Us => format!("${}", grouped(amount.round() as i64)),
    }
}

pub fn format_pct(pct: f64) -> String {
    format!("{:+.2}%", pct)
}

pub fn format_shares(shares: i64) -> String {
    format!("{} sh", grouped(shares))
}

pub fn analysis_failed(ticker: &str) -> String {
    format!("analysis failed for {}", ticker)
}

fn country_flag(country: Country) -> &'static str {
    match country {
        Country::Kr => "🇰🇷",
        Country::Us => "🇺🇸",
    }
}

fn level_priority(level: AlertLevel) -> u8 {
    match level {
        AlertLevel::Half => 3,
        AlertLevel::One => 4,
        AlertLevel::Two => 5,
    }
}

fn level_tag(level: AlertLevel) -> &'static str {
    match level {
        AlertLevel::Half => "chart_with_downwards_trend",
        AlertLevel::One => "warning",
        AlertLevel::Two => "rotating_light",
    }
}

/// Buy alert for one level crossing.
pub fn alert_notification(
    alert: &AlertRecord,
    previous_close: f64,
    std_dev: f64,
    amount: f64,
) -> Notification {
    let country = alert.country;
    let name = alert.ticker_name.as_deref().unwrap_or(&alert.ticker);
    let invest = amount * alert.level.amount_factor();
    let shares = crate::analysis::volatility::shares_for(invest, alert.current_price);

    let title = format!("{}: {} ({})", alert.level.title(), name, alert.ticker);
    let mut body = String::new();
    body.push_str(&format!("{} {} ({})\n", country_flag(country), name, alert.ticker));
    body.push_str(&format!("Prev close: {}\n", format_price(previous_close, country)));
    body.push_str(&format!("Current:    {}\n", format_price(alert.current_price, country)));
    body.push_str(&format!("Change:     {}\n", format_pct(-alert.drop_rate)));
    body.push_str(&format!(
        "Target ({}): {}\n",
        alert.level,
        format_price(alert.target_price, country)
    ));
    body.push_str(&format!("Std dev:    {:.2}%\n\n", std_dev));
    body.push_str(&format!(
        "Buy {} → {}",
        format_amount(invest, country),
        format_shares(shares)
    ));

    Notification::new(title, body)
        .with_priority(level_priority(alert.level))
        .with_tags(&[level_tag(alert.level)])
}

/// Per-ticker block used by the morning report, `/status` and `analyze`.
pub fn ticker_summary(
    ticker: &str,
    name: &str,
    country: Country,
    report: &VolatilityReport,
    amount: f64,
) -> String {
    let t = &report.targets;
    let mut out = String::new();
    out.push_str(&format!("{} {} ({})\n", country_flag(country), name, ticker));
    out.push_str(&format!(
        "  Close {}  σ {:.2}%  mean {}\n",
        format_price(t.current_price, country),
        t.std_return,
        format_pct(t.mean_return)
    ));
    for (level, shares) in suggested_shares(t, amount) {
        out.push_str(&format!(
            "  {:<7} {} (-{:.2}%) → {} for {}\n",
            level.title(),
            format_price(t.target(level), country),
            t.drop_pct(level),
            format_shares(shares),
            format_amount(amount * level.amount_factor(), country),
        ));
    }
    out.push_str(&format!(
        "  1σ drops: {} days ({:.1}%, {}) · 2σ drops: {} days ({:.1}%, {})\n",
        report.one_sigma_drops.days,
        report.one_sigma_drops.pct,
        report.one_sigma_drops.frequency.label(),
        report.two_sigma_drops.days,
        report.two_sigma_drops.pct,
        report.two_sigma_drops.frequency.label(),
    ));
    out
}

/// One watchlist entry in the morning report. `report` is `None` when the
/// analysis for the ticker failed.
pub struct MorningEntry<'a> {
    pub item: &'a WatchlistItem,
    pub report: Option<&'a VolatilityReport>,
}

pub fn morning_report(
    user_name: &str,
    date: NaiveDate,
    entries: &[MorningEntry<'_>],
    check_interval_minutes: u32,
) -> Notification {
    let title = format!("📊 {} · buy levels for {}", user_name, date.format("%Y-%m-%d"));
    let mut body = format!("Watchlist: {} ticker(s)\n{}\n\n", entries.len(), RULE);
    for entry in entries {
        match entry.report {
            Some(report) => body.push_str(&ticker_summary(
                &entry.item.ticker,
                &entry.item.name,
                entry.item.country,
                report,
                entry.item.amount(),
            )),
            None => body.push_str(&format!("⚠️  {}\n", analysis_failed(&entry.item.ticker))),
        }
        body.push('\n');
    }
    body.push_str(&format!("{}\n", RULE));
    body.push_str(&format!(
        "🔔 Live check every {} min. Test buy at 0.5σ, 1st buy at 1σ, 2nd buy at 2σ.",
        check_interval_minutes
    ));
    Notification::new(title, body)
}

/// Summary of alerts that fired outside the delivery window.
pub fn missed_summary(
    user_name: &str,
    alerts: &[AlertRecord],
    window_start: NaiveTime,
) -> Notification {
    let title = format!("🌙 {} · {} alert(s) while you were away", user_name, alerts.len());
    let mut body = format!("{}\n\n", RULE);
    for (idx, alert) in alerts.iter().enumerate() {
        let name = alert.ticker_name.as_deref().unwrap_or(&alert.ticker);
        body.push_str(&format!(
            "{}. {} {} ({})\n",
            idx + 1,
            country_flag(alert.country),
            name,
            alert.ticker
        ));
        body.push_str(&format!("   {} level reached\n", alert.level.title()));
        body.push_str(&format!("   At:     {}\n", alert.alert_time.format("%m-%d %H:%M:%S")));
        body.push_str(&format!("   Price:  {}\n", format_price(alert.current_price, alert.country)));
        body.push_str(&format!(
            "   Target: {} (-{:.2}%)\n\n",
            format_price(alert.target_price, alert.country),
            alert.drop_rate
        ));
    }
    body.push_str(&format!(
        "{}\nLive alerts are sent from {}; overnight signals are summarised here.",
        RULE,
        window_start.format("%H:%M")
    ));
    Notification::new(title, body).with_tags(&["bell"])
}

pub fn backtest_summary(ticker: &str, country: Country, result: &BacktestResult) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "Backtest {}: {} → {} ({} days, {:.1} years)\n",
        ticker,
        result.start_date,
        result.end_date,
        result.period_days,
        result.period_years()
    ));
    out.push_str(&format!(
        "  Buys: {} (1σ: {}, 2σ: {})\n",
        result.total_buys(),
        result.buys_1sigma,
        result.buys_2sigma
    ));
    out.push_str(&format!(
        "  Invested {} → {} ({})\n",
        format_amount(result.total_invested, country),
        format_amount(result.final_value, country),
        format_pct(result.total_return_pct)
    ));
    out.push_str(&format!(
        "  Buy & hold {} ({})\n",
        format_amount(result.buy_hold_value, country),
        format_pct(result.buy_hold_return_pct)
    ));
    out.push_str(&format!("  Outperformance {}\n", format_pct(result.outperformance)));
    out
}

pub fn watchlist_text(items: &[WatchlistItem]) -> String {
    if items.is_empty() {
        return "Your watchlist is empty. Add one with /add TICKER [amount].".to_string();
    }
    let mut out = format!("📋 Watchlist ({})\n", items.len());
    for item in items {
        out.push_str(&format!(
            "{} {} ({}) · {}\n",
            country_flag(item.country),
            item.name,
            item.ticker,
            format_amount(item.amount(), item.country)
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::volatility::PriceSeries;

    #[test]
    fn test_price_formats() {
        assert_eq!(format_price(71200.4, Country::Kr), "71,200원");
        assert_eq!(format_price(1234.5, Country::Us), "$1,234.50");
        assert_eq!(format_price(0.999, Country::Us), "$1.00");
        assert_eq!(format_amount(1_000_000.0, Country::Kr), "1,000,000원");
        assert_eq!(format_amount(2500.0, Country::Us), "$2,500");
        assert_eq!(format_pct(-3.456), "-3.46%");
        assert_eq!(format_pct(1.0), "+1.00%");
    }

    #[test]
    fn test_alert_notification() {
        let date = NaiveDate::from_ymd_opt(2025, 3, 4).unwrap();
        let alert = AlertRecord {
            id: None,
            user_id: 1,
            ticker: "QLD".to_string(),
            ticker_name: Some("ProShares Ultra QQQ".to_string()),
            country: Country::Us,
            level: AlertLevel::Two,
            alert_date: date,
            target_price: 90.0,
            current_price: 89.5,
            drop_rate: 8.2,
            alert_time: date.and_hms_opt(10, 0, 0).unwrap(),
            sent: false,
        };
        let n = alert_notification(&alert, 97.5, 4.1, 1000.0);
        assert_eq!(n.title, "2nd buy: ProShares Ultra QQQ (QLD)");
        assert_eq!(n.priority, 5);
        assert!(n.message.contains("$97.50"));
        assert!(n.message.contains("-8.20%"));
        // 2x level buys double the amount
        assert!(n.message.contains("$2,000 → 22 sh"));
    }

    #[test]
    fn test_morning_report_marks_failures() {
        let d = |day| NaiveDate::from_ymd_opt(2025, 1, day).unwrap();
        let series = PriceSeries::new(vec![
            (d(2), 100.0),
            (d(3), 102.0),
            (d(6), 98.0),
            (d(7), 101.0),
            (d(8), 97.0),
        ])
        .unwrap();
        let report = VolatilityReport::from_series(&series).unwrap();
        let item = |ticker: &str| WatchlistItem {
            user_id: 1,
            ticker: ticker.to_string(),
            name: ticker.to_string(),
            country: Country::infer(ticker),
            investment_amount: None,
            enabled: true,
            added_at: String::new(),
        };
        let spy = item("SPY");
        let kr = item("005930");
        let entries = [
            MorningEntry {
                item: &spy,
                report: Some(&report),
            },
            MorningEntry {
                item: &kr,
                report: None,
            },
        ];

        let n = morning_report("alice", d(9), &entries, 5);
        assert!(n.title.contains("2025-01-09"));
        assert!(n.message.contains("$97.00"));
        assert!(n.message.contains("Test buy"));
        assert!(n.message.contains("analysis failed for 005930"));
        assert!(n.message.contains("every 5 min"));
    }

    #[test]
    fn test_watchlist_text_empty() {
        assert!(watchlist_text(&[]).contains("/add"));
    }
}
