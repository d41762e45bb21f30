//! Market Data
//! Mission: Fetch daily history and live quotes behind one provider trait

pub mod yahoo;

use anyhow::Result;
use async_trait::async_trait;
use chrono::NaiveDate;

use crate::models::{DailyBar, Quote};

pub use yahoo::{SymbolCache, YahooChartClient};

#[async_trait]
pub trait MarketDataProvider: Send + Sync {
    /// Daily bars between `start` and `end` inclusive, oldest first.
    async fn daily_history(
        &self,
        ticker: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<DailyBar>>;

    /// Latest traded price.
    async fn quote(&self, ticker: &str) -> Result<Quote>;
}
