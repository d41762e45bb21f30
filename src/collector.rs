//! Data Collector
//! Mission: Keep daily history, intraday snapshots and the target cache current
//!
//! Batch operations never stop at the first bad ticker: each one ends up in
//! exactly one bucket of a [`BatchOutcome`].

use anyhow::{anyhow, Context, Result};
use chrono::{Duration, Local, NaiveDate, NaiveDateTime, Timelike, Utc};
use rayon::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::analysis::volatility::{PriceSeries, VolatilityReport, MIN_RELIABLE_POINTS};
use crate::analysis::AnalysisError;
use crate::market::MarketDataProvider;
use crate::models::{Country, DailyBar, MinuteBar, Quote, StatisticsRecord};
use crate::storage::StockDb;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchOutcome {
    pub succeeded: Vec<String>,
    pub skipped: Vec<(String, String)>,
    pub failed: Vec<(String, String)>,
}

impl BatchOutcome {
    pub fn total(&self) -> usize {
        self.succeeded.len() + self.skipped.len() + self.failed.len()
    }

    fn log(&self, op: &str) {
        info!(
            op,
            ok = self.succeeded.len(),
            skipped = self.skipped.len(),
            failed = self.failed.len(),
            "📦 Batch finished"
        );
        for (ticker, reason) in &self.failed {
            warn!(op, ticker = %ticker, "❌ {}", reason);
        }
    }
}

/// Everything computed for one ticker on one day.
#[derive(Debug, Clone)]
pub struct TickerAnalysis {
    pub stats: StatisticsRecord,
    pub report: VolatilityReport,
    pub bars: Vec<DailyBar>,
}

pub fn statistics_record(
    ticker: &str,
    ticker_name: Option<String>,
    today: NaiveDate,
    data_date: NaiveDate,
    report: &VolatilityReport,
) -> StatisticsRecord {
    let t = &report.targets;
    StatisticsRecord {
        ticker: ticker.to_string(),
        ticker_name,
        country: Country::infer(ticker),
        date: today,
        data_date,
        mean_return: t.mean_return,
        std_dev: t.std_return,
        current_price: t.current_price,
        target_05sigma: t.target_05,
        target_1sigma: t.target_1,
        target_2sigma: t.target_2,
        drop_05x: t.drop_05,
        drop_1x: t.drop_1,
        drop_2x: t.drop_2,
        updated_at: None,
    }
}

fn report_for(bars: &[DailyBar]) -> Result<VolatilityReport, AnalysisError> {
    let series = PriceSeries::new(bars.iter().map(|b| (b.date, b.close)).collect())?;
    VolatilityReport::from_series(&series)
}

fn latest_name(bars: &[DailyBar]) -> Option<String> {
    bars.iter().rev().find_map(|b| b.ticker_name.clone())
}

#[derive(Clone)]
pub struct DataCollector {
    db: StockDb,
    provider: Arc<dyn MarketDataProvider>,
    lookback: usize,
    history_years: u32,
}

impl DataCollector {
    pub fn new(
        db: StockDb,
        provider: Arc<dyn MarketDataProvider>,
        lookback: usize,
        history_years: u32,
    ) -> Self {
        Self {
            db,
            provider,
            lookback: lookback.max(2),
            history_years: history_years.max(1),
        }
    }

    pub fn db(&self) -> &StockDb {
        &self.db
    }

    pub fn provider(&self) -> &Arc<dyn MarketDataProvider> {
        &self.provider
    }

    async fn fetch_and_store(&self, ticker: &str, start: NaiveDate, end: NaiveDate) -> Result<usize> {
        let bars = self
            .provider
            .daily_history(ticker, start, end)
            .await
            .with_context(|| format!("Failed to fetch history for {}", ticker))?;
        self.db.insert_daily_bars(&bars)
    }

    /// Load `years` of daily bars for each ticker.
    pub async fn initialize_history(&self, tickers: &[String], years: u32, today: NaiveDate) -> BatchOutcome {
        let start = today - Duration::days(i64::from(years.max(1)) * 365 + 30);
        let mut outcome = BatchOutcome::default();

        for ticker in tickers {
            match self.fetch_and_store(ticker, start, today).await {
                Ok(0) => outcome
                    .failed
                    .push((ticker.clone(), "no data returned".to_string())),
                Ok(n) => {
                    debug!(ticker = %ticker, rows = n, "Initialized history");
                    outcome.succeeded.push(ticker.clone());
                }
                Err(e) => outcome.failed.push((ticker.clone(), format!("{:#}", e))),
            }
        }
        outcome.log("initialize_history");
        outcome
    }

    /// Fetch bars after the latest stored date; tickers with no history get
    /// a full initial load.
    pub async fn update_daily(&self, tickers: &[String], today: NaiveDate) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();

        for ticker in tickers {
            let latest = match self.db.get_latest_date(ticker) {
                Ok(latest) => latest,
                Err(e) => {
                    outcome.failed.push((ticker.clone(), format!("{:#}", e)));
                    continue;
                }
            };

            let start = match latest {
                Some(last) if last >= today => {
                    outcome
                        .skipped
                        .push((ticker.clone(), "already up to date".to_string()));
                    continue;
                }
                Some(last) => last + Duration::days(1),
                None => today - Duration::days(i64::from(self.history_years) * 365 + 30),
            };

            match self.fetch_and_store(ticker, start, today).await {
                Ok(0) => outcome
                    .skipped
                    .push((ticker.clone(), "no new bars".to_string())),
                Ok(n) => {
                    debug!(ticker = %ticker, rows = n, %start, "Daily update stored");
                    outcome.succeeded.push(ticker.clone());
                }
                Err(e) => outcome.failed.push((ticker.clone(), format!("{:#}", e))),
            }
        }
        outcome.log("update_daily");
        outcome
    }

    /// Store one price snapshot per ticker, stamped to the minute. The quotes
    /// are returned so a caller can act on them without fetching twice.
    pub async fn collect_intraday(
        &self,
        tickers: &[String],
        now: NaiveDateTime,
    ) -> (BatchOutcome, HashMap<String, Quote>) {
        let mut outcome = BatchOutcome::default();
        let mut quotes = HashMap::with_capacity(tickers.len());
        let stamp = now.with_second(0).and_then(|t| t.with_nanosecond(0)).unwrap_or(now);
        let stamp_utc = stamp
            .and_local_timezone(Local)
            .single()
            .map(|t| t.with_timezone(&Utc).naive_utc())
            .unwrap_or(stamp);

        let mut bars = Vec::with_capacity(tickers.len());
        for ticker in tickers {
            match self.provider.quote(ticker).await {
                Ok(quote) => {
                    bars.push(MinuteBar {
                        ticker: ticker.clone(),
                        ticker_name: quote.name.clone(),
                        timestamp: stamp,
                        timestamp_utc: stamp_utc,
                        market_date: quote.as_of.date(),
                        price: quote.price,
                        volume: quote.volume,
                    });
                    outcome.succeeded.push(ticker.clone());
                    quotes.insert(ticker.clone(), quote);
                }
                Err(e) => outcome.failed.push((ticker.clone(), format!("{:#}", e))),
            }
        }

        if let Err(e) = self.db.insert_minute_bars(&bars) {
            let reason = format!("{:#}", e);
            outcome.failed.extend(
                outcome
                    .succeeded
                    .drain(..)
                    .map(|t| (t, reason.clone())),
            );
        }
        outcome.log("collect_intraday");
        (outcome, quotes)
    }

    /// Recompute and cache targets for every ticker from stored closes.
    /// Series shorter than the reliability floor are skipped.
    pub fn refresh_statistics(&self, tickers: &[String], today: NaiveDate) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();

        let mut loaded = Vec::with_capacity(tickers.len());
        for ticker in tickers {
            match self.db.get_daily_prices(ticker, self.lookback) {
                Ok(bars) if bars.len() < MIN_RELIABLE_POINTS => outcome.skipped.push((
                    ticker.clone(),
                    format!("insufficient data ({} of {} points)", bars.len(), MIN_RELIABLE_POINTS),
                )),
                Ok(bars) => loaded.push((ticker.clone(), bars)),
                Err(e) => outcome.failed.push((ticker.clone(), format!("{:#}", e))),
            }
        }

        let computed: Vec<(String, Result<StatisticsRecord, AnalysisError>)> = loaded
            .par_iter()
            .map(|(ticker, bars)| {
                let record = report_for(bars).map(|report| {
                    let data_date = bars[bars.len() - 1].date;
                    statistics_record(ticker, latest_name(bars), today, data_date, &report)
                });
                (ticker.clone(), record)
            })
            .collect();

        for (ticker, record) in computed {
            let stored = record
                .map_err(anyhow::Error::from)
                .and_then(|r| self.db.upsert_statistics(&r));
            match stored {
                Ok(()) => outcome.succeeded.push(ticker),
                Err(e) => outcome.failed.push((ticker, format!("{:#}", e))),
            }
        }
        outcome.log("refresh_statistics");
        outcome
    }

    /// Stored bars for a ticker, fetching history first when too few are stored.
    pub async fn ensure_history(&self, ticker: &str, today: NaiveDate) -> Result<Vec<DailyBar>> {
        let bars = self.db.get_daily_prices(ticker, self.lookback)?;
        if bars.len() >= MIN_RELIABLE_POINTS {
            return Ok(bars);
        }

        debug!(ticker, stored = bars.len(), "Fetching history on demand");
        let start = today - Duration::days(i64::from(self.history_years) * 365 + 30);
        self.fetch_and_store(ticker, start, today).await?;
        self.db.get_daily_prices(ticker, self.lookback)
    }

    /// Full analysis for one ticker, computed from stored closes and written
    /// to the statistics cache.
    pub async fn analyze(&self, ticker: &str, today: NaiveDate) -> Result<TickerAnalysis> {
        let bars = self.ensure_history(ticker, today).await?;
        let report = report_for(&bars).with_context(|| crate::report::analysis_failed(ticker))?;
        let data_date = bars
            .last()
            .map(|b| b.date)
            .ok_or_else(|| anyhow!("No bars for {}", ticker))?;
        let name = match latest_name(&bars) {
            Some(name) => Some(name),
            None => self.db.get_ticker_name(ticker)?,
        };
        let stats = statistics_record(ticker, name, today, data_date, &report);
        self.db.upsert_statistics(&stats)?;
        Ok(TickerAnalysis { stats, report, bars })
    }

    /// Today's cached targets, computing them on a cache miss.
    pub async fn statistics_for(&self, ticker: &str, today: NaiveDate) -> Result<StatisticsRecord> {
        if let Some(cached) = self.db.get_statistics(ticker, today)? {
            return Ok(cached);
        }
        Ok(self.analyze(ticker, today).await?.stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::testing::{synthetic_bars, MockProvider};

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 3, 14).unwrap()
    }

    fn collector(provider: MockProvider) -> (DataCollector, Arc<MockProvider>) {
        let provider = Arc::new(provider);
        let db = StockDb::in_memory().unwrap();
        let collector = DataCollector::new(db, provider.clone(), 252, 1);
        (collector, provider)
    }

    #[tokio::test]
    async fn test_update_daily_initializes_then_skips() {
        let provider = MockProvider::default().with_history(synthetic_bars("SPY", today(), 300, 500.0));
        let (collector, _) = collector(provider);
        let tickers = vec!["SPY".to_string(), "NOPE".to_string()];

        let first = collector.update_daily(&tickers, today()).await;
        assert_eq!(first.succeeded, vec!["SPY"]);
        assert_eq!(first.failed.len(), 1);
        assert_eq!(first.failed[0].0, "NOPE");

        let second = collector.update_daily(&tickers[..1], today()).await;
        assert_eq!(second.skipped.len(), 1);
        assert_eq!(second.total(), 1);
    }

    #[test]
    fn test_refresh_statistics_skips_short_series() {
        let provider = MockProvider::default();
        let (collector, _) = collector(provider);
        collector
            .db()
            .insert_daily_bars(&synthetic_bars("QLD", today(), 100, 70.0))
            .unwrap();
        collector
            .db()
            .insert_daily_bars(&synthetic_bars("TINY", today(), 10, 5.0))
            .unwrap();

        let outcome = collector.refresh_statistics(&["QLD".to_string(), "TINY".to_string()], today());
        assert_eq!(outcome.succeeded, vec!["QLD"]);
        assert_eq!(outcome.skipped[0].0, "TINY");
        assert!(outcome.skipped[0].1.contains("insufficient data"));

        let cached = collector.db().get_statistics("QLD", today()).unwrap().unwrap();
        assert!(cached.target_2sigma < cached.target_1sigma);
        assert_eq!(cached.ticker_name.as_deref(), Some("QLD Corp"));
    }

    #[tokio::test]
    async fn test_statistics_for_fetches_on_demand_and_caches() {
        let provider = MockProvider::default().with_history(synthetic_bars("SOXL", today(), 260, 30.0));
        let (collector, provider) = collector(provider);

        let stats = collector.statistics_for("SOXL", today()).await.unwrap();
        assert_eq!(*provider.history_calls.lock(), 1);
        assert_eq!(stats.data_date, today());

        let again = collector.statistics_for("SOXL", today()).await.unwrap();
        assert_eq!(*provider.history_calls.lock(), 1);
        assert_eq!(again.std_dev, stats.std_dev);
    }

    #[tokio::test]
    async fn test_analyze_unknown_ticker_fails() {
        let (collector, _) = collector(MockProvider::default());
        assert!(collector.analyze("ZZZZ", today()).await.is_err());
    }

    #[tokio::test]
    async fn test_collect_intraday_stores_snapshots() {
        let provider = MockProvider::default();
        provider.set_quote("TQQQ", 55.25);
        let (collector, _) = collector(provider);
        let now = today().and_hms_opt(10, 31, 45).unwrap();

        let (outcome, quotes) = collector
            .collect_intraday(&["TQQQ".to_string(), "GONE".to_string()], now)
            .await;
        assert_eq!(outcome.succeeded, vec!["TQQQ"]);
        assert_eq!(quotes["TQQQ"].price, 55.25);
        assert_eq!(outcome.failed.len(), 1);

        let since = today().and_hms_opt(0, 0, 0).unwrap();
        let bars = collector.db().get_minute_prices("TQQQ", since).unwrap();
        assert_eq!(bars.len(), 1);
        assert_eq!(bars[0].timestamp, today().and_hms_opt(10, 31, 0).unwrap());
        assert_eq!(bars[0].price, 55.25);
    }
}
