//! stockwatch backend library
//!
//! Volatility buy levels for a stock watchlist, with the storage, market data,
//! notification, bot, scheduler and web layers around them. The `stockwatch`
//! binary wires these together.

pub mod analysis;
pub mod api;
pub mod auth;
pub mod bot;
pub mod charts;
pub mod collector;
pub mod config;
pub mod market;
pub mod middleware;
pub mod models;
pub mod monitor;
pub mod notify;
pub mod report;
pub mod scheduler;
pub mod storage;
