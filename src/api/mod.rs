//! Web API
//! Mission: JSON access to watchlists, buy levels, live prices and alert history
//!
//! `/health` and `/api/auth/login` are public; every other route needs a JWT
//! passed as a Bearer header or a `?token=` query parameter.

pub mod account;
pub mod error;
pub mod stocks;

pub use error::ApiError;

use axum::{
    body::Body,
    http::Request,
    middleware,
    response::Json,
    routing::{get, post, put},
    Router,
};
use chrono::{Local, NaiveDate};
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::auth::{api as auth_api, auth_middleware, models::Claims, AuthState, JwtHandler};
use crate::charts::ChartRenderer;
use crate::collector::DataCollector;
use crate::config::AlertConfig;
use crate::middleware::request_logging;
use crate::models::User;
use crate::storage::StockDb;

#[derive(Clone)]
pub struct WebState {
    pub db: StockDb,
    pub collector: DataCollector,
    pub charts: Option<ChartRenderer>,
    pub alerts: AlertConfig,
}

pub(crate) fn today() -> NaiveDate {
    Local::now().date_naive()
}

/// The enabled user behind a token.
pub(crate) fn current_user(state: &WebState, claims: &Claims) -> Result<User, ApiError> {
    let id = claims.user_id().ok_or(ApiError::Unauthorized)?;
    state
        .db
        .get_user(id)?
        .filter(|u| u.enabled)
        .ok_or(ApiError::Unauthorized)
}

async fn health() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Trace span keyed on the path only; `?token=` must not reach the logs.
fn request_span(request: &Request<Body>) -> tracing::Span {
    tracing::debug_span!(
        "request",
        method = %request.method(),
        path = %request.uri().path(),
    )
}

pub fn build_router(state: WebState, jwt_handler: Arc<JwtHandler>) -> Router {
    let auth_state = AuthState::new(state.db.clone(), jwt_handler.clone());
    let auth_router = Router::new()
        .route("/api/auth/login", post(auth_api::login))
        .with_state(auth_state);

    let protected = Router::new()
        .route("/api/me", get(account::me))
        .route("/api/me/notifications", put(account::set_notifications))
        .route("/api/me/ntfy-topic", put(account::set_topic))
        .route("/api/me/password", post(account::change_password))
        .route("/api/alerts", get(account::alerts))
        .route("/api/stocks", get(stocks::list_stocks).post(stocks::add_stock))
        .route("/api/stocks/:ticker", axum::routing::delete(stocks::remove_stock))
        .route("/api/stocks/:ticker/amount", put(stocks::update_amount))
        .route("/api/stocks/:ticker/analysis", get(stocks::analysis))
        .route("/api/stocks/:ticker/price", get(stocks::price))
        .route("/api/stocks/:ticker/chart", get(stocks::chart))
        .route_layer(middleware::from_fn_with_state(jwt_handler, auth_middleware))
        .with_state(state);

    Router::new()
        .route("/health", get(health))
        .merge(auth_router)
        .merge(protected)
        .layer(middleware::from_fn(request_logging))
        .layer(TraceLayer::new_for_http().make_span_with(request_span))
        .layer(CorsLayer::permissive())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::testing::{synthetic_bars, MockProvider};
    use crate::models::NewUser;
    use axum::{body::to_bytes, http::StatusCode};
    use parking_lot::Mutex;
    use std::io::Write;
    use tower::ServiceExt;

    struct Harness {
        app: Router,
        token: String,
        db: StockDb,
    }

    async fn harness() -> Harness {
        let db = StockDb::in_memory().unwrap();
        let user = db
            .add_user(&NewUser {
                name: "alice".to_string(),
                ..Default::default()
            })
            .unwrap();
        db.set_password(user.id, "correct-horse").unwrap();

        let bars = synthetic_bars("SPY", today(), 120, 500.0);
        let provider = MockProvider::default().with_history(bars);
        provider.set_quote("SPY", 480.0);
        let collector = DataCollector::new(db.clone(), Arc::new(provider), 252, 1);
        let state = WebState {
            db: db.clone(),
            collector,
            charts: None,
            alerts: AlertConfig::default(),
        };
        let app = build_router(state, Arc::new(JwtHandler::new("test-secret".to_string())));

        let resp = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/api/auth/login",
                None,
                json!({"username": "alice", "password": "correct-horse"}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        let token = body["token"].as_str().unwrap().to_string();
        Harness { app, token, db }
    }

    fn json_request(method: &str, uri: &str, token: Option<&str>, body: Value) -> Request<Body> {
        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json");
        if let Some(t) = token {
            builder = builder.header("Authorization", format!("Bearer {}", t));
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    fn get_request(uri: &str, token: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().uri(uri);
        if let Some(t) = token {
            builder = builder.header("Authorization", format!("Bearer {}", t));
        }
        builder.body(Body::empty()).unwrap()
    }

    async fn body_json(resp: axum::response::Response) -> Value {
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_is_public() {
        let h = harness().await;
        let resp = h.app.oneshot(get_request("/health", None)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_protected_routes_need_token() {
        let h = harness().await;
        let resp = h
            .app
            .clone()
            .oneshot(get_request("/api/stocks", None))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let resp = h
            .app
            .clone()
            .oneshot(get_request("/api/stocks", Some("garbage")))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let query = format!("/api/me?token={}", h.token);
        let resp = h.app.oneshot(get_request(&query, None)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["name"], "alice");
    }

    #[tokio::test]
    async fn test_wrong_password_rejected() {
        let h = harness().await;
        let resp = h
            .app
            .oneshot(json_request(
                "POST",
                "/api/auth/login",
                None,
                json!({"username": "alice", "password": "wrong"}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_watchlist_lifecycle() {
        let h = harness().await;
        let t = Some(h.token.as_str());

        let resp = h
            .app
            .clone()
            .oneshot(json_request("POST", "/api/stocks", t, json!({"ticker": "spy", "amount": 2000.0})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        let item = body_json(resp).await;
        assert_eq!(item["ticker"], "SPY");
        assert_eq!(item["name"], "SPY Corp");

        let resp = h
            .app
            .clone()
            .oneshot(json_request("POST", "/api/stocks", t, json!({"ticker": "NOPE"})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = h
            .app
            .clone()
            .oneshot(json_request("PUT", "/api/stocks/SPY/amount", t, json!({"amount": -5.0})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = h
            .app
            .clone()
            .oneshot(json_request("PUT", "/api/stocks/SPY/amount", t, json!({"amount": 3000.0})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["investment_amount"], 3000.0);

        let resp = h
            .app
            .clone()
            .oneshot(get_request("/api/stocks", t))
            .await
            .unwrap();
        assert_eq!(body_json(resp).await.as_array().unwrap().len(), 1);

        let delete = Request::builder()
            .method("DELETE")
            .uri("/api/stocks/SPY")
            .header("Authorization", format!("Bearer {}", h.token))
            .body(Body::empty())
            .unwrap();
        let resp = h.app.clone().oneshot(delete).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);

        let delete_again = Request::builder()
            .method("DELETE")
            .uri("/api/stocks/SPY")
            .header("Authorization", format!("Bearer {}", h.token))
            .body(Body::empty())
            .unwrap();
        let resp = h.app.oneshot(delete_again).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_analysis_and_price() {
        let h = harness().await;
        let t = Some(h.token.as_str());

        let resp = h
            .app
            .clone()
            .oneshot(get_request("/api/stocks/SPY/analysis", t))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["buys"].as_array().unwrap().len(), 3);
        assert_eq!(body["amount"], 1000.0);
        assert!(body["report"]["targets"]["std_return"].as_f64().unwrap() > 0.0);

        let resp = h
            .app
            .clone()
            .oneshot(get_request("/api/stocks/SPY/price", t))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["price"], 480.0);

        let resp = h
            .app
            .clone()
            .oneshot(get_request("/api/stocks/NOPE/analysis", t))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body_json(resp).await["error"], "analysis failed for NOPE");

        let resp = h
            .app
            .oneshot(get_request("/api/stocks/SPY/chart", t))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_account_settings() {
        let h = harness().await;
        let t = Some(h.token.as_str());

        let resp = h
            .app
            .clone()
            .oneshot(json_request("PUT", "/api/me/notifications", t, json!({"enabled": false})))
            .await
            .unwrap();
        assert_eq!(body_json(resp).await["notification_enabled"], false);

        let resp = h
            .app
            .clone()
            .oneshot(json_request("PUT", "/api/me/ntfy-topic", t, json!({"topic": " alice-alerts "})))
            .await
            .unwrap();
        assert_eq!(body_json(resp).await["ntfy_topic"], "alice-alerts");

        let resp = h
            .app
            .clone()
            .oneshot(json_request(
                "POST",
                "/api/me/password",
                t,
                json!({"current_password": "wrong", "new_password": "another-horse"}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let resp = h
            .app
            .clone()
            .oneshot(json_request(
                "POST",
                "/api/me/password",
                t,
                json!({"current_password": "correct-horse", "new_password": "another-horse"}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
        assert!(h.db.verify_password("alice", "another-horse").unwrap().is_some());

        let resp = h.app.oneshot(get_request("/api/alerts", t)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(body_json(resp).await.as_array().unwrap().is_empty());
    }

    #[derive(Clone, Default)]
    struct LogBuffer(Arc<Mutex<Vec<u8>>>);

    impl Write for LogBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_query_token_stays_out_of_logs() {
        let h = harness().await;
        let buffer = LogBuffer::default();
        let writer = buffer.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let query = format!("/api/me?token={}", h.token);
        let resp = h.app.oneshot(get_request(&query, None)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let logs = String::from_utf8(buffer.0.lock().clone()).unwrap();
        assert!(logs.contains("/api/me"));
        assert!(!logs.contains(&h.token));
        assert!(!logs.contains("token="));
    }
}
