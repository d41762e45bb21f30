//! Watchlist and per-ticker analysis endpoints.

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    Extension,
};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::{current_user, today, ApiError, WebState};
use crate::analysis::{suggested_shares, VolatilityReport};
use crate::auth::models::Claims;
use crate::models::{AlertLevel, Country, WatchlistItem};
use crate::monitor::{drop_rate, evaluate_levels};
use crate::report;

fn normalize(ticker: &str) -> String {
    ticker.trim().to_uppercase()
}

#[derive(Debug, Deserialize)]
pub struct AddStockRequest {
    pub ticker: String,
    pub name: Option<String>,
    pub amount: Option<f64>,
}

#[derive(Debug, Deserialize)]
pub struct AmountRequest {
    pub amount: f64,
}

#[derive(Debug, Serialize)]
pub struct BuyLevel {
    pub level: AlertLevel,
    pub target: f64,
    pub drop_pct: f64,
    pub amount: f64,
    pub shares: i64,
}

#[derive(Debug, Serialize)]
pub struct AnalysisResponse {
    pub ticker: String,
    pub name: String,
    pub country: Country,
    pub amount: f64,
    pub buys: Vec<BuyLevel>,
    pub report: VolatilityReport,
}

#[derive(Debug, Serialize)]
pub struct PriceResponse {
    pub ticker: String,
    pub price: f64,
    pub baseline: f64,
    pub drop_pct: f64,
    pub level: Option<AlertLevel>,
    pub as_of: NaiveDateTime,
}

/// GET /api/stocks
pub async fn list_stocks(
    State(state): State<WebState>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<Vec<WatchlistItem>>, ApiError> {
    let user = current_user(&state, &claims)?;
    Ok(Json(state.db.get_watchlist(user.id)?))
}

/// POST /api/stocks
pub async fn add_stock(
    State(state): State<WebState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<AddStockRequest>,
) -> Result<(StatusCode, Json<WatchlistItem>), ApiError> {
    let user = current_user(&state, &claims)?;
    let ticker = normalize(&req.ticker);
    if ticker.is_empty() {
        return Err(ApiError::BadRequest("Ticker must not be empty".to_string()));
    }
    if matches!(req.amount, Some(a) if !(a.is_finite() && a > 0.0)) {
        return Err(ApiError::BadRequest("Amount must be positive".to_string()));
    }

    let quote = state
        .collector
        .provider()
        .quote(&ticker)
        .await
        .map_err(|e| {
            warn!(ticker = %ticker, "Ticker lookup failed: {:#}", e);
            ApiError::BadRequest(format!("Unknown ticker {}", ticker))
        })?;
    let name = req.name.as_deref().or(quote.name.as_deref());
    state
        .db
        .add_watchlist_item(user.id, &ticker, name, req.amount)?;
    info!(user = %user.name, ticker = %ticker, "➕ Watchlist add (web)");

    let item = state
        .db
        .get_watchlist_item(user.id, &ticker)?
        .ok_or_else(|| ApiError::NotFound(format!("{} not in watchlist", ticker)))?;
    Ok((StatusCode::CREATED, Json(item)))
}

/// DELETE /api/stocks/:ticker
pub async fn remove_stock(
    State(state): State<WebState>,
    Extension(claims): Extension<Claims>,
    Path(ticker): Path<String>,
) -> Result<StatusCode, ApiError> {
    let user = current_user(&state, &claims)?;
    let ticker = normalize(&ticker);
    if !state.db.remove_watchlist_item(user.id, &ticker)? {
        return Err(ApiError::NotFound(format!("{} not in watchlist", ticker)));
    }
    info!(user = %user.name, ticker = %ticker, "➖ Watchlist remove (web)");
    Ok(StatusCode::NO_CONTENT)
}

/// PUT /api/stocks/:ticker/amount
pub async fn update_amount(
    State(state): State<WebState>,
    Extension(claims): Extension<Claims>,
    Path(ticker): Path<String>,
    Json(req): Json<AmountRequest>,
) -> Result<Json<WatchlistItem>, ApiError> {
    let user = current_user(&state, &claims)?;
    let ticker = normalize(&ticker);
    if !(req.amount.is_finite() && req.amount > 0.0) {
        return Err(ApiError::BadRequest("Amount must be positive".to_string()));
    }
    if !state.db.update_investment(user.id, &ticker, req.amount)? {
        return Err(ApiError::NotFound(format!("{} not in watchlist", ticker)));
    }
    let item = state
        .db
        .get_watchlist_item(user.id, &ticker)?
        .ok_or_else(|| ApiError::NotFound(format!("{} not in watchlist", ticker)))?;
    Ok(Json(item))
}

/// GET /api/stocks/:ticker/analysis
pub async fn analysis(
    State(state): State<WebState>,
    Extension(claims): Extension<Claims>,
    Path(ticker): Path<String>,
) -> Result<Json<AnalysisResponse>, ApiError> {
    let user = current_user(&state, &claims)?;
    let ticker = normalize(&ticker);
    let analysis = state
        .collector
        .analyze(&ticker, today())
        .await
        .map_err(|e| {
            warn!(ticker = %ticker, "{:#}", e);
            ApiError::Unprocessable(report::analysis_failed(&ticker))
        })?;

    let item = state.db.get_watchlist_item(user.id, &ticker)?;
    let country = Country::infer(&ticker);
    let amount = item
        .as_ref()
        .map(|i| i.amount())
        .unwrap_or_else(|| country.default_investment());
    let name = match item {
        Some(i) => i.name,
        None => analysis.stats.display_name().to_string(),
    };

    let targets = &analysis.report.targets;
    let buys = suggested_shares(targets, amount)
        .into_iter()
        .map(|(level, shares)| BuyLevel {
            level,
            target: targets.target(level),
            drop_pct: targets.drop_pct(level),
            amount: amount * level.amount_factor(),
            shares,
        })
        .collect();

    Ok(Json(AnalysisResponse {
        ticker,
        name,
        country,
        amount,
        buys,
        report: analysis.report,
    }))
}

/// GET /api/stocks/:ticker/price
pub async fn price(
    State(state): State<WebState>,
    Extension(claims): Extension<Claims>,
    Path(ticker): Path<String>,
) -> Result<Json<PriceResponse>, ApiError> {
    current_user(&state, &claims)?;
    let ticker = normalize(&ticker);
    let stats = state
        .collector
        .statistics_for(&ticker, today())
        .await
        .map_err(|_| ApiError::Unprocessable(report::analysis_failed(&ticker)))?;
    let quote = state
        .collector
        .provider()
        .quote(&ticker)
        .await
        .map_err(|e| ApiError::Unavailable(format!("No quote for {}: {}", ticker, e)))?;

    let level = evaluate_levels(&stats, quote.price, state.alerts.trigger_ratio).map(|(l, _)| l);
    Ok(Json(PriceResponse {
        ticker,
        price: quote.price,
        baseline: stats.current_price,
        drop_pct: drop_rate(stats.current_price, quote.price),
        level,
        as_of: quote.as_of,
    }))
}

/// GET /api/stocks/:ticker/chart
pub async fn chart(
    State(state): State<WebState>,
    Extension(claims): Extension<Claims>,
    Path(ticker): Path<String>,
) -> Result<Response, ApiError> {
    current_user(&state, &claims)?;
    let Some(renderer) = state.charts.clone() else {
        return Err(ApiError::Unavailable("Charts are disabled (no font)".to_string()));
    };
    let ticker = normalize(&ticker);
    let date = today();
    let analysis = state
        .collector
        .analyze(&ticker, date)
        .await
        .map_err(|_| ApiError::Unprocessable(report::analysis_failed(&ticker)))?;
    let name = analysis.stats.display_name().to_string();

    let path = renderer
        .render_blocking(ticker, name, analysis.bars, analysis.report, date)
        .await?;
    let bytes = tokio::fs::read(&path)
        .await
        .map_err(|e| ApiError::Internal(anyhow::Error::new(e).context("Failed to read chart")))?;

    Ok(([(header::CONTENT_TYPE, "image/png")], bytes).into_response())
}
