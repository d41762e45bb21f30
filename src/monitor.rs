//! Realtime Monitor
//! Mission: Compare live prices with today's targets and alert each watcher once
//!
//! - Only the most severe level reached is considered per check
//! - One record per (user, ticker, day, level)
//! - A per-(user, ticker) cooldown holds back repeats unless the level escalates
//! - Outside the delivery window alerts are queued (`sent = 0`) for the
//!   morning summary; the first check inside the window flushes whatever
//!   is still queued

use anyhow::Result;
use chrono::{Duration, NaiveDateTime};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, HashSet};
use tracing::{debug, info, warn};

use crate::collector::DataCollector;
use crate::config::AlertConfig;
use crate::models::{AlertLevel, AlertRecord, StatisticsRecord, User, WatchlistItem};
use crate::notify::{Delivery, NotificationDispatcher};
use crate::report;
use crate::storage::StockDb;

/// Drop in percent from `baseline` to `price`; positive when the price fell.
pub fn drop_rate(baseline: f64, price: f64) -> f64 {
    if baseline <= 0.0 {
        return 0.0;
    }
    (baseline - price) / baseline * 100.0
}

/// The most severe level whose drop has been reached, with the drop rate.
pub fn evaluate_levels(
    stats: &StatisticsRecord,
    price: f64,
    trigger_ratio: f64,
) -> Option<(AlertLevel, f64)> {
    let drop = drop_rate(stats.current_price, price);
    AlertLevel::DESCENDING
        .iter()
        .copied()
        .find(|level| {
            let needed = stats.drop_pct(*level);
            needed > 0.0 && drop >= trigger_ratio * needed
        })
        .map(|level| (level, drop))
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CheckSummary {
    pub tickers: usize,
    pub delivered: usize,
    pub queued: usize,
    pub suppressed: usize,
    /// Previously queued alerts delivered as a summary by this check.
    pub flushed: usize,
    pub failed: Vec<(String, String)>,
}

pub struct RealtimeMonitor {
    db: StockDb,
    collector: DataCollector,
    dispatcher: NotificationDispatcher,
    config: AlertConfig,
    /// Last recorded (level, time) per (user id, ticker).
    cooldowns: Mutex<HashMap<(i64, String), (AlertLevel, NaiveDateTime)>>,
}

impl RealtimeMonitor {
    pub fn new(
        db: StockDb,
        collector: DataCollector,
        dispatcher: NotificationDispatcher,
        config: AlertConfig,
    ) -> Self {
        Self {
            db,
            collector,
            dispatcher,
            config,
            cooldowns: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &AlertConfig {
        &self.config
    }

    fn in_cooldown(&self, user_id: i64, ticker: &str, level: AlertLevel, now: NaiveDateTime) -> bool {
        let cooldowns = self.cooldowns.lock();
        match cooldowns.get(&(user_id, ticker.to_string())) {
            Some((last_level, at)) => {
                level <= *last_level && now - *at < Duration::minutes(self.config.cooldown_minutes)
            }
            None => false,
        }
    }

    fn start_cooldown(&self, user_id: i64, ticker: &str, level: AlertLevel, now: NaiveDateTime) {
        self.cooldowns
            .lock()
            .insert((user_id, ticker.to_string()), (level, now));
    }

    /// One pass over every watched ticker.
    pub async fn run_check(&self, now: NaiveDateTime) -> Result<CheckSummary> {
        let today = now.date();
        let mut summary = CheckSummary::default();

        let mut watchers: Vec<(User, Vec<WatchlistItem>)> = Vec::new();
        let mut tickers = BTreeSet::new();
        for user in self.db.list_users(false)? {
            if !user.notification_enabled {
                continue;
            }
            let items = self.db.get_watchlist(user.id)?;
            tickers.extend(items.iter().map(|i| i.ticker.clone()));
            watchers.push((user, items));
        }
        let tickers: Vec<String> = tickers.into_iter().collect();
        summary.tickers = tickers.len();
        if tickers.is_empty() {
            debug!("No watched tickers, skipping check");
            return Ok(summary);
        }

        let (snapshot, quotes) = self.collector.collect_intraday(&tickers, now).await;
        summary.failed.extend(snapshot.failed);

        let mut triggered: HashMap<String, (StatisticsRecord, AlertLevel, f64, f64)> = HashMap::new();
        for ticker in &tickers {
            let Some(quote) = quotes.get(ticker) else {
                continue;
            };
            let stats = match self.collector.statistics_for(ticker, today).await {
                Ok(stats) => stats,
                Err(e) => {
                    summary
                        .failed
                        .push((ticker.clone(), report::analysis_failed(ticker)));
                    warn!(ticker = %ticker, "❌ {:#}", e);
                    continue;
                }
            };
            if let Some((level, drop)) = evaluate_levels(&stats, quote.price, self.config.trigger_ratio) {
                debug!(ticker = %ticker, %level, drop, price = quote.price, "Level reached");
                triggered.insert(ticker.clone(), (stats, level, drop, quote.price));
            }
        }

        let deliver_now = self.config.in_window(now.time());
        for (user, items) in &watchers {
            if deliver_now {
                summary.flushed += self.flush_queued(user).await?;
            }
            for item in items {
                let Some((stats, level, drop, price)) = triggered.get(&item.ticker) else {
                    continue;
                };
                let (level, drop, price) = (*level, *drop, *price);

                if self.db.alert_exists(user.id, &item.ticker, today, level)?
                    || self.in_cooldown(user.id, &item.ticker, level, now)
                {
                    summary.suppressed += 1;
                    continue;
                }

                let mut alert = AlertRecord {
                    id: None,
                    user_id: user.id,
                    ticker: item.ticker.clone(),
                    ticker_name: Some(item.name.clone()),
                    country: item.country,
                    level,
                    alert_date: today,
                    target_price: stats.target(level),
                    current_price: price,
                    drop_rate: drop,
                    alert_time: now,
                    sent: false,
                };

                if deliver_now {
                    let notification =
                        report::alert_notification(&alert, stats.current_price, stats.std_dev, item.amount());
                    match self.dispatcher.send(user, &notification).await {
                        Ok(Delivery::Sent) => alert.sent = true,
                        Ok(Delivery::Muted) => {}
                        Err(e) => warn!(user = %user.name, ticker = %item.ticker, "⚠️  Alert delivery failed, queued: {:#}", e),
                    }
                }

                if self.db.record_alert(&alert)? {
                    self.start_cooldown(user.id, &item.ticker, level, now);
                    if alert.sent {
                        summary.delivered += 1;
                        info!(user = %user.name, ticker = %item.ticker, %level, drop, "🔔 Alert sent");
                    } else {
                        summary.queued += 1;
                        info!(user = %user.name, ticker = %item.ticker, %level, drop, "🌙 Alert queued");
                    }
                } else {
                    summary.suppressed += 1;
                }
            }
        }

        Ok(summary)
    }

    /// Deliver each user's queued alerts as one message and mark them sent.
    /// Returns the number of alerts summarised.
    pub async fn send_missed_summary(&self) -> Result<usize> {
        let mut summarised = 0;
        for user in self.db.list_users(false)? {
            summarised += self.flush_queued(&user).await?;
        }
        if summarised > 0 {
            info!(alerts = summarised, "📬 Missed-alert summaries sent");
        }
        Ok(summarised)
    }

    /// Send one user's unsent alerts as a summary. Alerts for tickers no
    /// longer on the watchlist are left out of the message but still marked.
    /// On delivery failure nothing is marked.
    async fn flush_queued(&self, user: &User) -> Result<usize> {
        let pending = self.db.unsent_alerts(Some(user.id))?;
        if pending.is_empty() {
            return Ok(0);
        }
        let watched: HashSet<String> = self
            .db
            .get_watchlist(user.id)?
            .into_iter()
            .map(|i| i.ticker)
            .collect();
        let ids: Vec<i64> = pending.iter().filter_map(|a| a.id).collect();
        let relevant: Vec<_> = pending
            .into_iter()
            .filter(|a| watched.contains(&a.ticker))
            .collect();

        let mut summarised = 0;
        if !relevant.is_empty() {
            let notification = report::missed_summary(&user.name, &relevant, self.config.window_start);
            match self.dispatcher.send(user, &notification).await {
                Ok(_) => summarised = relevant.len(),
                Err(e) => {
                    warn!(user = %user.name, "⚠️  Missed-alert summary failed: {:#}", e);
                    return Ok(0);
                }
            }
        }
        self.db.mark_alerts_sent(&ids)?;
        Ok(summarised)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::testing::{synthetic_bars, MockProvider};
    use crate::models::{Country, NewUser};
    use crate::notify::testing::RecordingChannel;
    use crate::notify::NotificationChannel;
    use chrono::NaiveDate;
    use std::sync::Arc;

    fn stats(current: f64, std: f64) -> StatisticsRecord {
        let d = NaiveDate::from_ymd_opt(2025, 3, 14).unwrap();
        StatisticsRecord {
            ticker: "SPY".to_string(),
            ticker_name: None,
            country: Country::Us,
            date: d,
            data_date: d,
            mean_return: 0.0,
            std_dev: std,
            current_price: current,
            target_05sigma: current * (1.0 - 0.5 * std / 100.0),
            target_1sigma: current * (1.0 - std / 100.0),
            target_2sigma: current * (1.0 - 2.0 * std / 100.0),
            drop_05x: 0.5 * std,
            drop_1x: std,
            drop_2x: 2.0 * std,
            updated_at: None,
        }
    }

    #[test]
    fn test_evaluate_levels_picks_most_severe() {
        let s = stats(100.0, 2.0);
        assert_eq!(evaluate_levels(&s, 100.0, 0.95), None);
        assert_eq!(evaluate_levels(&s, 99.2, 0.95).map(|x| x.0), None);
        // 0.95 of a 1% drop is enough for the half level
        assert_eq!(evaluate_levels(&s, 99.05, 0.95).map(|x| x.0), Some(AlertLevel::Half));
        assert_eq!(evaluate_levels(&s, 98.0, 0.95).map(|x| x.0), Some(AlertLevel::One));
        assert_eq!(evaluate_levels(&s, 90.0, 0.95).map(|x| x.0), Some(AlertLevel::Two));
    }

    #[test]
    fn test_zero_sigma_never_triggers() {
        let s = stats(100.0, 0.0);
        assert_eq!(evaluate_levels(&s, 50.0, 0.95), None);
    }

    struct Fixture {
        db: StockDb,
        provider: Arc<MockProvider>,
        channel: Arc<RecordingChannel>,
        monitor: RealtimeMonitor,
        user: User,
        day: NaiveDate,
    }

    fn fixture() -> Fixture {
        let day = NaiveDate::from_ymd_opt(2025, 3, 14).unwrap();
        let db = StockDb::in_memory().unwrap();
        db.insert_daily_bars(&synthetic_bars("SPY", day, 120, 500.0))
            .unwrap();
        let user = db
            .add_user(&NewUser {
                name: "alice".to_string(),
                chat_id: Some(1),
                ntfy_topic: None,
            })
            .unwrap();
        db.add_watchlist_item(user.id, "SPY", None, Some(1000.0)).unwrap();

        let provider = Arc::new(MockProvider::default());
        let channel = Arc::new(RecordingChannel::default());
        let collector = DataCollector::new(db.clone(), provider.clone(), 252, 1);
        let dispatcher = NotificationDispatcher::new(
            db.clone(),
            Some(channel.clone() as Arc<dyn NotificationChannel>),
            None,
        );
        let monitor = RealtimeMonitor::new(db.clone(), collector, dispatcher, AlertConfig::default());
        Fixture {
            db,
            provider,
            channel,
            monitor,
            user,
            day,
        }
    }

    fn price_at(f: &Fixture, date: NaiveDate, level: AlertLevel) -> f64 {
        let stats = f.db.get_statistics("SPY", date).unwrap().unwrap();
        stats.target(level) * 0.999
    }

    #[tokio::test]
    async fn test_alert_dedupe_and_escalation() {
        let f = fixture();
        let ten = f.day.and_hms_opt(10, 0, 0).unwrap();
        f.provider.set_quote("SPY", 1.0e9);
        f.monitor.run_check(ten).await.unwrap();
        assert_eq!(f.channel.count(), 0);

        f.provider.set_quote("SPY", price_at(&f, f.day, AlertLevel::One));
        let first = f.monitor.run_check(ten).await.unwrap();
        assert_eq!(first.delivered, 1);
        assert_eq!(f.channel.count(), 1);

        let repeat = f.monitor.run_check(ten + Duration::minutes(5)).await.unwrap();
        assert_eq!(repeat.delivered, 0);
        assert_eq!(repeat.suppressed, 1);

        f.provider.set_quote("SPY", price_at(&f, f.day, AlertLevel::Two));
        let escalated = f.monitor.run_check(ten + Duration::minutes(10)).await.unwrap();
        assert_eq!(escalated.delivered, 1);
        assert!(f.channel.sent.lock()[1].1.title.starts_with("2nd buy"));
    }

    #[tokio::test]
    async fn test_cooldown_spans_midnight() {
        let f = fixture();
        let late = f.day.and_hms_opt(23, 50, 0).unwrap();
        f.provider.set_quote("SPY", 1.0e9);
        f.monitor.run_check(late).await.unwrap();
        f.provider.set_quote("SPY", price_at(&f, f.day, AlertLevel::One));
        assert_eq!(f.monitor.run_check(late).await.unwrap().delivered, 1);

        // New day, so no dedupe hit; the cooldown still holds.
        let after = late + Duration::minutes(30);
        let summary = f.monitor.run_check(after).await.unwrap();
        assert_eq!(summary.suppressed, 1);
        assert_eq!(summary.queued, 0);
    }

    #[tokio::test]
    async fn test_quiet_hours_queue_then_summary() {
        let f = fixture();
        let night = f.day.and_hms_opt(2, 0, 0).unwrap();
        f.provider.set_quote("SPY", 1.0e9);
        f.monitor.run_check(night).await.unwrap();
        f.provider.set_quote("SPY", price_at(&f, f.day, AlertLevel::Half));

        let summary = f.monitor.run_check(night).await.unwrap();
        assert_eq!(summary.queued, 1);
        assert_eq!(f.channel.count(), 0);
        assert_eq!(f.db.unsent_alerts(Some(f.user.id)).unwrap().len(), 1);

        assert_eq!(f.monitor.send_missed_summary().await.unwrap(), 1);
        assert_eq!(f.channel.count(), 1);
        assert!(f.db.unsent_alerts(None).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_alert_before_window_is_flushed_when_window_opens() {
        let f = fixture();
        let early = f.day.and_hms_opt(8, 30, 0).unwrap();
        f.provider.set_quote("SPY", 1.0e9);
        f.monitor.run_check(early).await.unwrap();
        f.provider.set_quote("SPY", price_at(&f, f.day, AlertLevel::One));

        // After the 08:00 summary but before the window opens
        let queued = f.monitor.run_check(early).await.unwrap();
        assert_eq!(queued.queued, 1);
        assert_eq!(f.channel.count(), 0);

        let opening = f.monitor.run_check(f.day.and_hms_opt(9, 5, 0).unwrap()).await.unwrap();
        assert_eq!(opening.flushed, 1);
        assert_eq!(opening.suppressed, 1);
        assert_eq!(f.channel.count(), 1);
        assert!(f.db.unsent_alerts(Some(f.user.id)).unwrap().is_empty());

        let noon = f.monitor.run_check(f.day.and_hms_opt(12, 0, 0).unwrap()).await.unwrap();
        assert_eq!(noon.flushed, 0);
        assert_eq!(f.channel.count(), 1);
    }

    #[tokio::test]
    async fn test_failed_delivery_is_queued() {
        let f = fixture();
        let ten = f.day.and_hms_opt(10, 0, 0).unwrap();
        f.provider.set_quote("SPY", 1.0e9);
        f.monitor.run_check(ten).await.unwrap();
        *f.channel.fail.lock() = true;
        f.provider.set_quote("SPY", price_at(&f, f.day, AlertLevel::One));

        let summary = f.monitor.run_check(ten).await.unwrap();
        assert_eq!(summary.queued, 1);
        let pending = f.db.unsent_alerts(Some(f.user.id)).unwrap();
        assert_eq!(pending[0].level, AlertLevel::One);
    }

    #[tokio::test]
    async fn test_summary_skips_unwatched_tickers() {
        let f = fixture();
        let night = f.day.and_hms_opt(1, 0, 0).unwrap();
        f.provider.set_quote("SPY", 1.0e9);
        f.monitor.run_check(night).await.unwrap();
        f.provider.set_quote("SPY", price_at(&f, f.day, AlertLevel::One));
        f.monitor.run_check(night).await.unwrap();

        f.db.remove_watchlist_item(f.user.id, "SPY").unwrap();
        assert_eq!(f.monitor.send_missed_summary().await.unwrap(), 0);
        assert_eq!(f.channel.count(), 0);
        assert!(f.db.unsent_alerts(None).unwrap().is_empty());
    }
}
