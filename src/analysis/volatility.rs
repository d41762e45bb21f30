//! Volatility Target Calculator
//! Mission: Turn a trailing close series into sigma-based buy-the-dip targets
//!
//! Returns are simple percentage changes; sigma is their sample standard
//! deviation (N-1). Targets sit `m * sigma` percent below the last close for
//! m in {0.5, 1, 2}.

use chrono::NaiveDate;
use serde::Serialize;
use statrs::statistics::Statistics;
use thiserror::Error;
use tracing::warn;

use crate::models::AlertLevel;

/// Below this many points the numbers are computed but flagged as unreliable.
pub const MIN_RELIABLE_POINTS: usize = 30;

/// Smallest window the calculator accepts.
pub const MIN_POINTS: usize = 2;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum AnalysisError {
    #[error("insufficient data: need at least {needed} prices, got {got}")]
    InsufficientData { needed: usize, got: usize },

    #[error("invalid price {price} at index {index}")]
    InvalidPrice { index: usize, price: f64 },

    #[error("dates must be strictly increasing ({previous} then {next})")]
    UnorderedDates { previous: NaiveDate, next: NaiveDate },

    #[error("rolling window must cover at least 2 returns, got {0}")]
    InvalidWindow(usize),
}

/// Ordered (date, close) window for one ticker.
#[derive(Debug, Clone)]
pub struct PriceSeries {
    dates: Vec<NaiveDate>,
    closes: Vec<f64>,
}

impl PriceSeries {
    pub fn new(points: Vec<(NaiveDate, f64)>) -> Result<Self, AnalysisError> {
        let mut dates = Vec::with_capacity(points.len());
        let mut closes = Vec::with_capacity(points.len());

        for (index, (date, close)) in points.into_iter().enumerate() {
            if let Some(&previous) = dates.last() {
                if date <= previous {
                    return Err(AnalysisError::UnorderedDates {
                        previous,
                        next: date,
                    });
                }
            }
            if !close.is_finite() || close <= 0.0 {
                return Err(AnalysisError::InvalidPrice {
                    index,
                    price: close,
                });
            }
            dates.push(date);
            closes.push(close);
        }

        Ok(Self { dates, closes })
    }

    pub fn len(&self) -> usize {
        self.closes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.closes.is_empty()
    }

    pub fn dates(&self) -> &[NaiveDate] {
        &self.dates
    }

    pub fn closes(&self) -> &[f64] {
        &self.closes
    }

    pub fn last_date(&self) -> Option<NaiveDate> {
        self.dates.last().copied()
    }
}

/// Buy triggers derived from one price window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct VolatilityTargets {
    pub current_price: f64,
    pub mean_return: f64,
    pub std_return: f64,
    pub target_05: f64,
    pub target_1: f64,
    pub target_2: f64,
    pub drop_05: f64,
    pub drop_1: f64,
    pub drop_2: f64,
}

impl VolatilityTargets {
    pub fn target(&self, level: AlertLevel) -> f64 {
        match level {
            AlertLevel::Half => self.target_05,
            AlertLevel::One => self.target_1,
            AlertLevel::Two => self.target_2,
        }
    }

    pub fn drop_pct(&self, level: AlertLevel) -> f64 {
        match level {
            AlertLevel::Half => self.drop_05,
            AlertLevel::One => self.drop_1,
            AlertLevel::Two => self.drop_2,
        }
    }
}

/// `(p[i] - p[i-1]) / p[i-1] * 100` for every consecutive pair.
pub fn daily_returns(prices: &[f64]) -> Vec<f64> {
    prices
        .windows(2)
        .map(|w| (w[1] - w[0]) / w[0] * 100.0)
        .collect()
}

/// Sample standard deviation; a single observation has no spread to measure.
pub fn sample_std(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    values.iter().std_dev()
}

#[inline]
pub fn target_price(current_price: f64, drop_pct: f64) -> f64 {
    current_price * (1.0 - drop_pct / 100.0)
}

/// Compute targets from raw closes (oldest first).
pub fn calculate_targets(prices: &[f64]) -> Result<VolatilityTargets, AnalysisError> {
    if prices.len() < MIN_POINTS {
        return Err(AnalysisError::InsufficientData {
            needed: MIN_POINTS,
            got: prices.len(),
        });
    }
    if let Some((index, &price)) = prices
        .iter()
        .enumerate()
        .find(|(_, p)| !p.is_finite() || **p <= 0.0)
    {
        return Err(AnalysisError::InvalidPrice { index, price });
    }
    if prices.len() < MIN_RELIABLE_POINTS {
        warn!(
            points = prices.len(),
            floor = MIN_RELIABLE_POINTS,
            "⚠️  Volatility computed from a short window; targets are low confidence"
        );
    }

    let returns = daily_returns(prices);
    let mean_return = returns.iter().mean();
    let std_return = sample_std(&returns);
    let current_price = prices[prices.len() - 1];

    let drop_05 = std_return * AlertLevel::Half.multiplier();
    let drop_1 = std_return * AlertLevel::One.multiplier();
    let drop_2 = std_return * AlertLevel::Two.multiplier();

    Ok(VolatilityTargets {
        current_price,
        mean_return,
        std_return,
        target_05: target_price(current_price, drop_05),
        target_1: target_price(current_price, drop_1),
        target_2: target_price(current_price, drop_2),
        drop_05,
        drop_1,
        drop_2,
    })
}

/// How often a drop of a given size has historically happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Frequency {
    Frequent,
    Occasional,
    Rare,
    AlmostNever,
}

impl Frequency {
    fn for_one_sigma(pct: f64) -> Self {
        if pct > 15.0 {
            Frequency::Frequent
        } else if pct > 5.0 {
            Frequency::Occasional
        } else {
            Frequency::Rare
        }
    }

    fn for_two_sigma(pct: f64) -> Self {
        if pct > 5.0 {
            Frequency::Occasional
        } else if pct > 1.0 {
            Frequency::Rare
        } else {
            Frequency::AlmostNever
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Frequency::Frequent => "frequent",
            Frequency::Occasional => "occasional",
            Frequency::Rare => "rare",
            Frequency::AlmostNever => "almost never",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DropFrequency {
    pub days: usize,
    pub pct: f64,
    pub frequency: Frequency,
}

/// Targets plus the descriptive statistics shown in reports.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VolatilityReport {
    pub targets: VolatilityTargets,
    pub points: usize,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub max_gain: f64,
    pub max_loss: f64,
    pub up_days: usize,
    pub down_days: usize,
    pub flat_days: usize,
    pub one_sigma_drops: DropFrequency,
    pub two_sigma_drops: DropFrequency,
    pub returns: Vec<f64>,
}

impl VolatilityReport {
    pub fn from_series(series: &PriceSeries) -> Result<Self, AnalysisError> {
        let targets = calculate_targets(series.closes())?;
        let returns = daily_returns(series.closes());
        let n = returns.len();

        let max_gain = returns.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let max_loss = returns.iter().copied().fold(f64::INFINITY, f64::min);
        let up_days = returns.iter().filter(|r| **r > 0.0).count();
        let down_days = returns.iter().filter(|r| **r < 0.0).count();

        let count_at_or_below = |threshold: f64| returns.iter().filter(|r| **r <= threshold).count();
        let pct_of = |days: usize| days as f64 / n as f64 * 100.0;

        // A zero-sigma series would count every flat day as a "drop".
        let (one_days, two_days) = if targets.std_return > 0.0 {
            (
                count_at_or_below(-targets.drop_1),
                count_at_or_below(-targets.drop_2),
            )
        } else {
            (0, 0)
        };

        Ok(Self {
            targets,
            points: series.len(),
            start_date: series.dates()[0],
            end_date: series.dates()[series.len() - 1],
            max_gain,
            max_loss,
            up_days,
            down_days,
            flat_days: n - up_days - down_days,
            one_sigma_drops: DropFrequency {
                days: one_days,
                pct: pct_of(one_days),
                frequency: Frequency::for_one_sigma(pct_of(one_days)),
            },
            two_sigma_drops: DropFrequency {
                days: two_days,
                pct: pct_of(two_days),
                frequency: Frequency::for_two_sigma(pct_of(two_days)),
            },
            returns,
        })
    }
}

/// Whole shares an amount buys at `price`.
pub fn shares_for(amount: f64, price: f64) -> i64 {
    if price <= 0.0 || amount <= 0.0 {
        return 0;
    }
    (amount / price).floor() as i64
}

/// Suggested share counts per level: half the amount at 0.5σ, the amount at
/// 1σ, double at 2σ.
pub fn suggested_shares(targets: &VolatilityTargets, amount: f64) -> [(AlertLevel, i64); 3] {
    [AlertLevel::Half, AlertLevel::One, AlertLevel::Two].map(|level| {
        (
            level,
            shares_for(amount * level.amount_factor(), targets.target(level)),
        )
    })
}
