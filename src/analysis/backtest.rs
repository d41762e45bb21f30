//! Sigma Dip-Buying Backtest
//! Mission: Replay the rolling-volatility buy rule over history and compare it
//! with putting the same cash in on day one

use chrono::NaiveDate;
use serde::Serialize;

use super::volatility::{daily_returns, sample_std, AnalysisError, PriceSeries};
use crate::models::AlertLevel;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BacktestParams {
    /// Number of daily returns in the rolling sigma window.
    pub window: usize,
    pub amount_1sigma: f64,
    pub amount_2sigma: f64,
}

impl Default for BacktestParams {
    fn default() -> Self {
        Self {
            window: 252,
            amount_1sigma: 1000.0,
            amount_2sigma: 2000.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BacktestTrade {
    pub date: NaiveDate,
    pub level: AlertLevel,
    pub price: f64,
    pub return_pct: f64,
    pub volatility: f64,
    pub amount: f64,
    pub shares: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BacktestResult {
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub period_days: usize,
    pub trades: Vec<BacktestTrade>,
    pub buys_1sigma: usize,
    pub buys_2sigma: usize,
    pub total_invested: f64,
    pub final_shares: f64,
    pub initial_price: f64,
    pub final_price: f64,
    pub final_value: f64,
    pub total_return_pct: f64,
    pub buy_hold_shares: f64,
    pub buy_hold_value: f64,
    pub buy_hold_return_pct: f64,
    pub outperformance: f64,
    /// Strategy mark-to-market value at each evaluated day.
    pub portfolio_values: Vec<f64>,
}

impl BacktestResult {
    pub fn total_buys(&self) -> usize {
        self.buys_1sigma + self.buys_2sigma
    }

    pub fn period_years(&self) -> f64 {
        self.period_days as f64 / 252.0
    }
}

fn pct_gain(value: f64, invested: f64) -> f64 {
    if invested > 0.0 {
        (value - invested) / invested * 100.0
    } else {
        0.0
    }
}

/// Run the rolling-sigma strategy. Day `i` is evaluated once `window` returns
/// ending at `i` exist; its sigma includes that day's own return.
pub fn run_backtest(
    series: &PriceSeries,
    params: &BacktestParams,
) -> Result<BacktestResult, AnalysisError> {
    if params.window < 2 {
        return Err(AnalysisError::InvalidWindow(params.window));
    }
    let needed = params.window + 1;
    if series.len() < needed {
        return Err(AnalysisError::InsufficientData {
            needed,
            got: series.len(),
        });
    }

    let closes = series.closes();
    let dates = series.dates();
    let returns = daily_returns(closes);

    let mut trades = Vec::new();
    let mut portfolio_values = Vec::with_capacity(closes.len() - params.window);
    let mut invested = 0.0;
    let mut shares = 0.0;

    for i in params.window..closes.len() {
        // returns[k] is the move into closes[k + 1]
        let todays_return = returns[i - 1];
        let volatility = sample_std(&returns[i - params.window..i]);
        let price = closes[i];

        let level = if todays_return <= -2.0 * volatility {
            Some((AlertLevel::Two, params.amount_2sigma))
        } else if todays_return <= -volatility {
            Some((AlertLevel::One, params.amount_1sigma))
        } else {
            None
        };

        if let Some((level, amount)) = level {
            let bought = amount / price;
            shares += bought;
            invested += amount;
            trades.push(BacktestTrade {
                date: dates[i],
                level,
                price,
                return_pct: todays_return,
                volatility,
                amount,
                shares: bought,
            });
        }

        portfolio_values.push(shares * price);
    }

    let initial_price = closes[params.window];
    let final_price = closes[closes.len() - 1];
    let final_value = shares * final_price;
    let total_return_pct = pct_gain(final_value, invested);

    let buy_hold_shares = if invested > 0.0 {
        invested / initial_price
    } else {
        0.0
    };
    let buy_hold_value = buy_hold_shares * final_price;
    let buy_hold_return_pct = pct_gain(buy_hold_value, invested);

    Ok(BacktestResult {
        start_date: dates[params.window],
        end_date: dates[dates.len() - 1],
        period_days: closes.len() - params.window,
        buys_1sigma: trades.iter().filter(|t| t.level == AlertLevel::One).count(),
        buys_2sigma: trades.iter().filter(|t| t.level == AlertLevel::Two).count(),
        trades,
        total_invested: invested,
        final_shares: shares,
        initial_price,
        final_price,
        final_value,
        total_return_pct,
        buy_hold_shares,
        buy_hold_value,
        buy_hold_return_pct,
        outperformance: total_return_pct - buy_hold_return_pct,
        portfolio_values,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn series(prices: &[f64]) -> PriceSeries {
        let start = NaiveDate::from_ymd_opt(2020, 1, 1).unwrap();
        PriceSeries::new(
            prices
                .iter()
                .enumerate()
                .map(|(i, p)| (start + chrono::Duration::days(i as i64), *p))
                .collect(),
        )
        .unwrap()
    }

    /// Gentle zig-zag followed by one sharp drop on the last day.
    fn crash_at_end() -> Vec<f64> {
        let mut prices: Vec<f64> = (0..30)
            .map(|i| if i % 2 == 0 { 100.0 } else { 101.0 })
            .collect();
        prices.push(80.0);
        prices
    }

    #[test]
    fn test_rejects_short_history() {
        let params = BacktestParams {
            window: 10,
            ..Default::default()
        };
        let err = run_backtest(&series(&[100.0; 10]), &params).unwrap_err();
        assert_eq!(err, AnalysisError::InsufficientData { needed: 11, got: 10 });
    }

    #[test]
    fn test_rejects_degenerate_window() {
        let params = BacktestParams {
            window: 1,
            ..Default::default()
        };
        assert_eq!(
            run_backtest(&series(&[100.0; 10]), &params).unwrap_err(),
            AnalysisError::InvalidWindow(1)
        );
    }

    #[test]
    fn test_steady_uptrend_never_buys() {
        let params = BacktestParams {
            window: 5,
            ..Default::default()
        };
        let prices: Vec<f64> = (0..20).map(|i| 100.0 + i as f64).collect();
        let result = run_backtest(&series(&prices), &params).unwrap();
        assert_eq!(result.total_buys(), 0);
        assert_eq!(result.total_invested, 0.0);
        assert_eq!(result.total_return_pct, 0.0);
        assert_eq!(result.outperformance, 0.0);
        assert_eq!(result.portfolio_values.len(), 15);
    }

    #[test]
    fn test_crash_triggers_two_sigma_buy() {
        let params = BacktestParams {
            window: 20,
            amount_1sigma: 1000.0,
            amount_2sigma: 2000.0,
        };
        let result = run_backtest(&series(&crash_at_end()), &params).unwrap();

        let last = result.trades.last().unwrap();
        assert_eq!(last.level, AlertLevel::Two);
        assert_eq!(last.price, 80.0);
        assert_eq!(last.amount, 2000.0);
        assert!((last.shares - 25.0).abs() < 1e-9);
        assert!(result.buys_2sigma >= 1);
    }

    #[test]
    fn test_buy_and_hold_uses_same_cash() {
        let params = BacktestParams {
            window: 20,
            ..Default::default()
        };
        let result = run_backtest(&series(&crash_at_end()), &params).unwrap();

        assert!(result.total_invested > 0.0);
        let expected_shares = result.total_invested / result.initial_price;
        assert!((result.buy_hold_shares - expected_shares).abs() < 1e-9);
        assert!(
            (result.outperformance - (result.total_return_pct - result.buy_hold_return_pct)).abs()
                < 1e-9
        );
        assert_eq!(result.final_price, 80.0);
    }
}
