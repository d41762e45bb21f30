//! Price analysis: volatility targets and the sigma backtest.

pub mod backtest;
pub mod volatility;

pub use backtest::{run_backtest, BacktestParams, BacktestResult};
pub use volatility::{
    calculate_targets, suggested_shares, AnalysisError, PriceSeries, VolatilityReport,
    VolatilityTargets,
};
