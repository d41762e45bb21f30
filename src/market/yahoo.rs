//! Yahoo Finance chart API client.
//!
//! Korean codes are listed as `<code>.KS` (KOSPI) or `<code>.KQ` (KOSDAQ);
//! whichever answers first is remembered in the client's [`SymbolCache`].

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Local, NaiveDate, Utc};
use parking_lot::RwLock;
use reqwest::Client;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

use super::MarketDataProvider;
use crate::models::{Country, DailyBar, Quote};

const YAHOO_CHART_BASE: &str = "https://query1.finance.yahoo.com/v8/finance/chart";
const USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) stockwatch/0.1";

#[derive(Debug, Deserialize)]
pub struct ChartResponse {
    pub chart: ChartEnvelope,
}

#[derive(Debug, Deserialize)]
pub struct ChartEnvelope {
    pub result: Option<Vec<ChartResult>>,
    pub error: Option<ChartError>,
}

#[derive(Debug, Deserialize)]
pub struct ChartError {
    pub code: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ChartResult {
    pub meta: ChartMeta,
    #[serde(default)]
    pub timestamp: Vec<i64>,
    pub indicators: Indicators,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartMeta {
    pub symbol: String,
    pub currency: Option<String>,
    pub long_name: Option<String>,
    pub short_name: Option<String>,
    pub regular_market_price: Option<f64>,
    pub regular_market_time: Option<i64>,
    pub regular_market_volume: Option<i64>,
    pub chart_previous_close: Option<f64>,
    pub previous_close: Option<f64>,
    #[serde(default)]
    pub gmtoffset: i64,
}

impl ChartMeta {
    pub fn display_name(&self) -> Option<String> {
        self.long_name
            .as_deref()
            .or(self.short_name.as_deref())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct Indicators {
    #[serde(default)]
    pub quote: Vec<QuoteIndicators>,
}

/// Parallel arrays aligned with `timestamp`; any slot may be null.
#[derive(Debug, Default, Deserialize)]
pub struct QuoteIndicators {
    #[serde(default)]
    pub open: Vec<Option<f64>>,
    #[serde(default)]
    pub high: Vec<Option<f64>>,
    #[serde(default)]
    pub low: Vec<Option<f64>>,
    #[serde(default)]
    pub close: Vec<Option<f64>>,
    #[serde(default)]
    pub volume: Vec<Option<i64>>,
}

/// Resolved provider symbols and display names, owned by one client for the
/// life of the process. Call [`SymbolCache::invalidate`] to forget a ticker.
#[derive(Debug, Default)]
pub struct SymbolCache {
    symbols: RwLock<HashMap<String, String>>,
    names: RwLock<HashMap<String, String>>,
}

impl SymbolCache {
    pub fn symbol(&self, ticker: &str) -> Option<String> {
        self.symbols.read().get(ticker).cloned()
    }

    pub fn name(&self, ticker: &str) -> Option<String> {
        self.names.read().get(ticker).cloned()
    }

    pub fn remember(&self, ticker: &str, symbol: &str, name: Option<&str>) {
        self.symbols
            .write()
            .insert(ticker.to_string(), symbol.to_string());
        if let Some(name) = name {
            self.names.write().insert(ticker.to_string(), name.to_string());
        }
    }

    pub fn invalidate(&self, ticker: &str) {
        self.symbols.write().remove(ticker);
        self.names.write().remove(ticker);
    }

    pub fn clear(&self) {
        self.symbols.write().clear();
        self.names.write().clear();
    }
}

/// Provider symbols to try for a ticker, most likely first.
pub fn symbol_candidates(ticker: &str) -> Vec<String> {
    let ticker = ticker.trim().to_uppercase();
    if ticker == "KS200" || ticker == "KOSPI200" {
        return vec!["^KS200".to_string()];
    }
    match Country::infer(&ticker) {
        Country::Kr => vec![format!("{}.KS", ticker), format!("{}.KQ", ticker)],
        Country::Us => vec![ticker],
    }
}

fn exchange_date(ts: i64, gmtoffset: i64) -> Option<NaiveDate> {
    DateTime::<Utc>::from_timestamp(ts + gmtoffset, 0).map(|dt| dt.date_naive())
}

/// Convert one chart result into daily bars. Slots without a close are skipped.
pub fn bars_from_chart(ticker: &str, result: &ChartResult) -> Vec<DailyBar> {
    let Some(q) = result.indicators.quote.first() else {
        return Vec::new();
    };
    let name = result.meta.display_name();
    let at = |v: &Vec<Option<f64>>, i: usize| v.get(i).copied().flatten();

    let mut bars: Vec<DailyBar> = Vec::with_capacity(result.timestamp.len());
    for (i, ts) in result.timestamp.iter().enumerate() {
        let Some(close) = at(&q.close, i).filter(|c| c.is_finite() && *c > 0.0) else {
            continue;
        };
        let Some(date) = exchange_date(*ts, result.meta.gmtoffset) else {
            continue;
        };
        // Intraday updates of the current session can repeat the last date.
        if bars.last().map(|b| b.date) == Some(date) {
            bars.pop();
        }
        bars.push(DailyBar {
            ticker: ticker.to_string(),
            ticker_name: name.clone(),
            date,
            open: at(&q.open, i),
            high: at(&q.high, i),
            low: at(&q.low, i),
            close,
            volume: q.volume.get(i).copied().flatten(),
        });
    }
    bars
}

pub fn quote_from_chart(ticker: &str, result: &ChartResult) -> Result<Quote> {
    let meta = &result.meta;
    let price = meta
        .regular_market_price
        .filter(|p| p.is_finite() && *p > 0.0)
        .ok_or_else(|| anyhow!("No market price for {}", ticker))?;
    let as_of = meta
        .regular_market_time
        .and_then(|ts| DateTime::<Utc>::from_timestamp(ts, 0))
        .map(|dt| dt.with_timezone(&Local).naive_local())
        .unwrap_or_else(|| Local::now().naive_local());

    Ok(Quote {
        ticker: ticker.to_string(),
        name: meta.display_name(),
        price,
        previous_close: meta.previous_close.or(meta.chart_previous_close),
        currency: meta.currency.clone(),
        volume: meta.regular_market_volume,
        as_of,
    })
}

#[derive(Clone)]
pub struct YahooChartClient {
    client: Client,
    base_url: String,
    cache: std::sync::Arc<SymbolCache>,
}

impl YahooChartClient {
    pub fn new() -> Result<Self> {
        Self::with_base_url(YAHOO_CHART_BASE)
    }

    pub fn with_base_url(base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(20))
            .pool_idle_timeout(Duration::from_secs(90))
            .user_agent(USER_AGENT)
            .build()
            .context("Failed to build Yahoo chart client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            cache: std::sync::Arc::new(SymbolCache::default()),
        })
    }

    pub fn cache(&self) -> &SymbolCache {
        &self.cache
    }

    #[inline]
    fn url(&self, symbol: &str) -> String {
        format!("{}/{}", self.base_url, symbol)
    }

    async fn fetch_chart(&self, symbol: &str, query: &[(&str, String)]) -> Result<ChartResult> {
        let resp = self
            .client
            .get(self.url(symbol))
            .query(query)
            .send()
            .await
            .with_context(|| format!("GET chart/{} failed", symbol))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(anyhow!("GET chart/{} {}: {}", symbol, status, text));
        }

        let body = resp
            .json::<ChartResponse>()
            .await
            .with_context(|| format!("Failed to parse chart response for {}", symbol))?;

        if let Some(err) = body.chart.error {
            return Err(anyhow!(
                "chart/{} error {}: {}",
                symbol,
                err.code.unwrap_or_default(),
                err.description.unwrap_or_default()
            ));
        }

        body.chart
            .result
            .and_then(|mut r| if r.is_empty() { None } else { Some(r.remove(0)) })
            .ok_or_else(|| anyhow!("chart/{} returned no result", symbol))
    }

    /// Try each candidate symbol until one returns data, caching the winner.
    async fn fetch_resolved(
        &self,
        ticker: &str,
        query: &[(&str, String)],
    ) -> Result<ChartResult> {
        let candidates = match self.cache.symbol(ticker) {
            Some(symbol) => vec![symbol],
            None => symbol_candidates(ticker),
        };

        let mut last_err = None;
        for symbol in candidates {
            match self.fetch_chart(&symbol, query).await {
                Ok(result) if !result.timestamp.is_empty() || result.meta.regular_market_price.is_some() => {
                    let name = result.meta.display_name();
                    self.cache.remember(ticker, &symbol, name.as_deref());
                    return Ok(result);
                }
                Ok(_) => {
                    debug!(ticker, symbol = %symbol, "Empty chart, trying next symbol");
                    last_err = Some(anyhow!("chart/{} was empty", symbol));
                }
                Err(e) => {
                    debug!(ticker, symbol = %symbol, error = %e, "Chart fetch failed");
                    last_err = Some(e);
                }
            }
        }

        let err = last_err.unwrap_or_else(|| anyhow!("No symbol candidates for {}", ticker));
        warn!(ticker, "⚠️  No market data: {}", err);
        Err(err)
    }

    pub async fn ticker_name(&self, ticker: &str) -> Option<String> {
        if let Some(name) = self.cache.name(ticker) {
            return Some(name);
        }
        self.quote(ticker).await.ok().and_then(|q| q.name)
    }
}

#[async_trait]
impl MarketDataProvider for YahooChartClient {
    async fn daily_history(
        &self,
        ticker: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<DailyBar>> {
        let to_ts = |d: NaiveDate| d.and_hms_opt(0, 0, 0).map(|dt| dt.and_utc().timestamp());
        let period1 = to_ts(start).ok_or_else(|| anyhow!("Invalid start date {}", start))?;
        let period2 = to_ts(end.succ_opt().unwrap_or(end))
            .ok_or_else(|| anyhow!("Invalid end date {}", end))?;

        let query = [
            ("period1", period1.to_string()),
            ("period2", period2.to_string()),
            ("interval", "1d".to_string()),
            ("includePrePost", "false".to_string()),
        ];
        let result = self.fetch_resolved(ticker, &query).await?;
        let bars: Vec<DailyBar> = bars_from_chart(ticker, &result)
            .into_iter()
            .filter(|b| b.date >= start && b.date <= end)
            .collect();

        debug!(ticker, bars = bars.len(), %start, %end, "Fetched daily history");
        Ok(bars)
    }

    async fn quote(&self, ticker: &str) -> Result<Quote> {
        let query = [
            ("range", "1d".to_string()),
            ("interval", "1d".to_string()),
        ];
        let result = self.fetch_resolved(ticker, &query).await?;
        quote_from_chart(ticker, &result)
    }
}
