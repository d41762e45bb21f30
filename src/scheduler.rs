//! Scheduler
//! Mission: Run the daily analysis, live checks, overnight summary and cleanup
//!
//! A one-minute tick decides which jobs are due. Daily jobs fire inside a
//! short window after their start time and at most once per date, so a late
//! start does not replay a stale morning report.

use anyhow::Result;
use chrono::{Datelike, Duration, Local, NaiveDate, NaiveDateTime, NaiveTime};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::charts::ChartRenderer;
use crate::collector::{DataCollector, TickerAnalysis};
use crate::config::ScheduleConfig;
use crate::monitor::RealtimeMonitor;
use crate::notify::{Notification, NotificationDispatcher};
use crate::report::{self, MorningEntry};

/// How long after its start time a daily job may still fire.
const DAILY_GRACE_MINUTES: i64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Job {
    DailyAnalysis,
    MissedSummary,
    Cleanup,
    RealtimeCheck,
}

#[derive(Debug, Default)]
pub struct JobState {
    last_daily: HashMap<Job, NaiveDate>,
    last_realtime: Option<NaiveDateTime>,
}

impl JobState {
    pub fn mark(&mut self, job: Job, now: NaiveDateTime) {
        match job {
            Job::RealtimeCheck => self.last_realtime = Some(now),
            daily => {
                self.last_daily.insert(daily, now.date());
            }
        }
    }

    pub fn ran_on(&self, job: Job, date: NaiveDate) -> bool {
        self.last_daily.get(&job) == Some(&date)
    }
}

fn in_window(start: NaiveTime, now: NaiveTime) -> bool {
    now >= start && now - start < Duration::minutes(DAILY_GRACE_MINUTES)
}

/// Jobs due at `now`, in run order.
pub fn due_jobs(cfg: &ScheduleConfig, state: &JobState, now: NaiveDateTime) -> Vec<Job> {
    let today = now.date();
    let time = now.time();
    let mut jobs = Vec::new();

    if in_window(cfg.cleanup_time, time) && !state.ran_on(Job::Cleanup, today) {
        jobs.push(Job::Cleanup);
    }
    if in_window(cfg.missed_summary_time, time) && !state.ran_on(Job::MissedSummary, today) {
        jobs.push(Job::MissedSummary);
    }
    if cfg.trading_days.contains(&today.weekday())
        && in_window(cfg.daily_analysis_time, time)
        && !state.ran_on(Job::DailyAnalysis, today)
    {
        jobs.push(Job::DailyAnalysis);
    }
    if cfg.realtime_enabled {
        let interval = Duration::minutes(i64::from(cfg.realtime_interval_minutes.max(1)));
        let due = state
            .last_realtime
            .map_or(true, |last| now - last >= interval);
        if due {
            jobs.push(Job::RealtimeCheck);
        }
    }
    jobs
}

pub struct Scheduler {
    collector: DataCollector,
    monitor: Arc<RealtimeMonitor>,
    dispatcher: NotificationDispatcher,
    charts: Option<ChartRenderer>,
    config: ScheduleConfig,
    state: JobState,
}

impl Scheduler {
    pub fn new(
        collector: DataCollector,
        monitor: Arc<RealtimeMonitor>,
        dispatcher: NotificationDispatcher,
        charts: Option<ChartRenderer>,
        config: ScheduleConfig,
    ) -> Self {
        Self {
            collector,
            monitor,
            dispatcher,
            charts,
            config,
            state: JobState::default(),
        }
    }

    pub async fn run(mut self) {
        info!(
            daily = %self.config.daily_analysis_time,
            summary = %self.config.missed_summary_time,
            interval_min = self.config.realtime_interval_minutes,
            "⏰ Scheduler started"
        );
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(60));
        loop {
            ticker.tick().await;
            self.tick(Local::now().naive_local()).await;
        }
    }

    /// Run every due job; returns the jobs that ran.
    pub async fn tick(&mut self, now: NaiveDateTime) -> Vec<Job> {
        let jobs = due_jobs(&self.config, &self.state, now);
        for job in &jobs {
            // Marked before running so a failing job is not retried every minute.
            self.state.mark(*job, now);
            let result = match job {
                Job::Cleanup => self.cleanup(now.date()).map(|n| format!("{} minute rows removed", n)),
                Job::MissedSummary => self
                    .monitor
                    .send_missed_summary()
                    .await
                    .map(|n| format!("{} missed alerts summarised", n)),
                Job::DailyAnalysis => self
                    .daily_analysis(now.date())
                    .await
                    .map(|n| format!("{} morning reports sent", n)),
                Job::RealtimeCheck => self.monitor.run_check(now).await.map(|s| {
                    format!(
                        "{} tickers, {} delivered, {} flushed, {} queued, {} suppressed",
                        s.tickers, s.delivered, s.flushed, s.queued, s.suppressed
                    )
                }),
            };
            match result {
                Ok(detail) => info!(job = ?job, "✅ {}", detail),
                Err(e) => error!(job = ?job, "❌ Job failed: {:#}", e),
            }
        }
        jobs
    }

    fn cleanup(&self, today: NaiveDate) -> Result<usize> {
        self.collector
            .db()
            .cleanup_minute_data(today, self.config.minute_retention_days)
    }

    /// Update data, refresh targets, and send every user their morning report.
    pub async fn daily_analysis(&self, today: NaiveDate) -> Result<usize> {
        let db = self.collector.db();
        let tickers = db.watched_tickers()?;
        self.collector.update_daily(&tickers, today).await;
        self.collector.refresh_statistics(&tickers, today);

        let mut analyses: HashMap<String, Option<TickerAnalysis>> = HashMap::new();
        let mut charts = HashMap::new();
        for ticker in &tickers {
            let analysis = match self.collector.analyze(ticker, today).await {
                Ok(a) => Some(a),
                Err(e) => {
                    warn!(ticker = %ticker, "⚠️  {}: {:#}", report::analysis_failed(ticker), e);
                    None
                }
            };
            if let (Some(renderer), Some(a)) = (&self.charts, &analysis) {
                let name = a.stats.ticker_name.clone().unwrap_or_else(|| ticker.clone());
                match renderer
                    .render_blocking(ticker.clone(), name, a.bars.clone(), a.report.clone(), today)
                    .await
                {
                    Ok(path) => {
                        charts.insert(ticker.clone(), path);
                    }
                    Err(e) => warn!(ticker = %ticker, "Chart failed, text only: {:#}", e),
                }
            }
            analyses.insert(ticker.clone(), analysis);
        }

        let mut sent = 0;
        for user in db.list_users(false)? {
            let items = db.get_watchlist(user.id)?;
            if items.is_empty() {
                continue;
            }

            for item in &items {
                let (Some(Some(a)), Some(path)) = (analyses.get(&item.ticker), charts.get(&item.ticker)) else {
                    continue;
                };
                let caption = report::ticker_summary(
                    &item.ticker,
                    &item.name,
                    item.country,
                    &a.report,
                    item.amount(),
                );
                let n = Notification::new(String::new(), caption).with_image(path.clone());
                if let Err(e) = self.dispatcher.send(&user, &n).await {
                    warn!(user = %user.name, ticker = %item.ticker, "Chart delivery failed: {:#}", e);
                }
            }

            let entries: Vec<MorningEntry<'_>> = items
                .iter()
                .map(|item| MorningEntry {
                    item,
                    report: analyses
                        .get(&item.ticker)
                        .and_then(|a| a.as_ref())
                        .map(|a| &a.report),
                })
                .collect();
            let n = report::morning_report(
                &user.name,
                today,
                &entries,
                self.config.realtime_interval_minutes,
            );
            match self.dispatcher.send(&user, &n).await {
                Ok(_) => sent += 1,
                Err(e) => warn!(user = %user.name, "Morning report failed: {:#}", e),
            }
        }
        Ok(sent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AlertConfig;
    use crate::market::testing::{synthetic_bars, MockProvider};
    use crate::models::NewUser;
    use crate::notify::testing::RecordingChannel;
    use crate::notify::NotificationChannel;
    use crate::storage::StockDb;

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, min, 0)
            .unwrap()
    }

    #[test]
    fn test_daily_jobs_fire_once_inside_window() {
        let cfg = ScheduleConfig {
            realtime_enabled: false,
            ..Default::default()
        };
        let mut state = JobState::default();
        // Friday
        let friday = at(2025, 3, 14, 8, 50);
        assert_eq!(due_jobs(&cfg, &state, friday), vec![Job::DailyAnalysis]);
        state.mark(Job::DailyAnalysis, friday);
        assert!(due_jobs(&cfg, &state, friday + Duration::minutes(1)).is_empty());

        // Too late to replay
        let fresh = JobState::default();
        assert!(due_jobs(&cfg, &fresh, at(2025, 3, 14, 11, 0)).is_empty());
        // No morning report on Saturday, but the summary still runs
        assert_eq!(
            due_jobs(&cfg, &fresh, at(2025, 3, 15, 8, 0)),
            vec![Job::MissedSummary]
        );
        assert_eq!(due_jobs(&cfg, &fresh, at(2025, 3, 15, 8, 50)), Vec::<Job>::new());
        assert_eq!(due_jobs(&cfg, &fresh, at(2025, 3, 15, 3, 10)), vec![Job::Cleanup]);
    }

    #[test]
    fn test_realtime_interval() {
        let cfg = ScheduleConfig::default();
        let mut state = JobState::default();
        let t0 = at(2025, 3, 14, 12, 0);
        assert_eq!(due_jobs(&cfg, &state, t0), vec![Job::RealtimeCheck]);
        state.mark(Job::RealtimeCheck, t0);
        assert!(due_jobs(&cfg, &state, t0 + Duration::minutes(4)).is_empty());
        assert_eq!(
            due_jobs(&cfg, &state, t0 + Duration::minutes(5)),
            vec![Job::RealtimeCheck]
        );
    }

    #[tokio::test]
    async fn test_tick_sends_morning_report_once() {
        let day = NaiveDate::from_ymd_opt(2025, 3, 14).unwrap();
        let db = StockDb::in_memory().unwrap();
        let user = db
            .add_user(&NewUser {
                name: "alice".to_string(),
                chat_id: Some(5),
                ntfy_topic: None,
            })
            .unwrap();
        db.add_watchlist_item(user.id, "SPY", None, None).unwrap();
        db.add_watchlist_item(user.id, "BAD", None, None).unwrap();

        let provider = Arc::new(MockProvider::default().with_history(synthetic_bars("SPY", day, 200, 500.0)));
        let channel = Arc::new(RecordingChannel::default());
        let collector = DataCollector::new(db.clone(), provider, 252, 1);
        let dispatcher = NotificationDispatcher::new(
            db.clone(),
            Some(channel.clone() as Arc<dyn NotificationChannel>),
            None,
        );
        let monitor = Arc::new(RealtimeMonitor::new(
            db.clone(),
            collector.clone(),
            dispatcher.clone(),
            AlertConfig::default(),
        ));
        let config = ScheduleConfig {
            realtime_enabled: false,
            ..Default::default()
        };
        let mut scheduler = Scheduler::new(collector, monitor, dispatcher, None, config);

        let ran = scheduler.tick(day.and_hms_opt(8, 50, 0).unwrap()).await;
        assert_eq!(ran, vec![Job::DailyAnalysis]);
        assert_eq!(channel.count(), 1);
        let body = channel.sent.lock()[0].1.message.clone();
        assert!(body.contains("SPY"));
        assert!(body.contains("analysis failed for BAD"));

        let again = scheduler.tick(day.and_hms_opt(8, 51, 0).unwrap()).await;
        assert!(again.is_empty());
        assert_eq!(channel.count(), 1);
    }
}
