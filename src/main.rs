use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::Context;
use axum::extract::{Path, Query, State};
use axum::http::header::{ACCEPT, CONTENT_TYPE};
use axum::http::{HeaderValue, Method, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::json;
use sqlx::postgres::PgPoolOptions;
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

mod config;
mod error;
mod funds;
mod lock;
mod margin;
mod models;
mod notify;
mod positions;
mod quotes;
mod state;
mod store;
mod tasks;
mod worker;

use config::load_config;
use error::ApiError;
use models::{FundTransaction, Instrument, Order, OrderSide, ProductType};
use state::AppState;
use store::{ExecutionStore, NewOrder};
use worker::Outcome;

async fn health_check(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    sqlx::query("SELECT 1").execute(&state.db).await?;
    Ok(Json(json!({ "status": "ok" })))
}

#[derive(Debug, Deserialize)]
struct OrderCreate {
    account_id: Uuid,
    symbol: String,
    side: OrderSide,
    quantity: i64,
    price: Option<Decimal>,
    product: ProductType,
}

/// Reference price used to size the margin block at placement. Same
/// precedence the worker applies at fill time.
fn reference_price(state: &AppState, req: &OrderCreate, instrument: &Instrument) -> Option<Decimal> {
    if let Some(price) = req.price {
        if price > Decimal::ZERO {
            return Some(price);
        }
    }
    if let Some(token) = instrument.quote_token {
        if let Some(tick) = state.quotes.get(token) {
            if tick.last_trade_price > Decimal::ZERO {
                return Some(tick.last_trade_price);
            }
        }
    }
    instrument.last_price.filter(|p| *p > Decimal::ZERO)
}

async fn create_order(
    State(state): State<AppState>,
    Json(req): Json<OrderCreate>,
) -> Result<(StatusCode, Json<Order>), ApiError> {
    if req.quantity <= 0 {
        return Err(ApiError::new(StatusCode::UNPROCESSABLE_ENTITY, "quantity must be positive"));
    }
    if matches!(req.price, Some(p) if p <= Decimal::ZERO) {
        return Err(ApiError::new(StatusCode::UNPROCESSABLE_ENTITY, "price must be positive"));
    }
    let instrument = state
        .store
        .instrument_by_symbol(&req.symbol)
        .await?
        .ok_or_else(|| {
            ApiError::new(StatusCode::NOT_FOUND, format!("unknown symbol: {}", req.symbol))
        })?;
    let price = reference_price(&state, &req, &instrument).ok_or_else(|| {
        ApiError::new(
            StatusCode::UNPROCESSABLE_ENTITY,
            format!("no reference price for {}", req.symbol),
        )
    })?;
    let charges = state.cfg.margin.calculate(
        instrument.segment,
        req.product,
        req.quantity,
        price,
        instrument.lot_size,
    );
    let order = state
        .store
        .create_pending_order(
            &NewOrder {
                account_id: req.account_id,
                instrument_id: Some(instrument.id),
                symbol: &req.symbol,
                side: req.side.as_str(),
                quantity: req.quantity,
                price: req.price,
                product: req.product.as_str(),
            },
            charges.required_margin,
            charges.brokerage,
        )
        .await
        .map_err(|e| ApiError::new(StatusCode::CONFLICT, format!("{e:#}")))?;
    eprintln!(
        "[orders] placed order={} account={} symbol={} segment={} side={} qty={} margin={}",
        order.id,
        order.account_id,
        order.symbol,
        instrument.segment.as_str(),
        order.side,
        order.quantity,
        charges.required_margin
    );

    // Fast path: try to fill right away so the poll interval is worst-case
    // latency, not typical. The batch loop picks the order up if this loses
    // the lock or errors.
    let worker = state.worker.clone();
    let perf = state.perf.clone();
    let order_id = order.id;
    tokio::spawn(async move {
        perf.fast_path_runs.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = worker.process_order_by_id(order_id).await {
            eprintln!("[orders] fast path order={order_id} error={e:#}");
        }
    });

    Ok((StatusCode::CREATED, Json(order)))
}

async fn get_order(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
) -> Result<Json<Order>, ApiError> {
    state
        .store
        .get_order(order_id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, "order not found"))
}

async fn get_account(
    State(state): State<AppState>,
    Path(account_id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let account = state
        .store
        .get_account(account_id)
        .await?
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, "account not found"))?;
    let positions = state.store.account_positions(account_id).await?;
    Ok(Json(json!({ "account": account, "positions": positions })))
}

#[derive(Debug, Deserialize)]
struct LedgerQuery {
    limit: Option<i64>,
}

async fn get_account_transactions(
    State(state): State<AppState>,
    Path(account_id): Path<Uuid>,
    Query(q): Query<LedgerQuery>,
) -> Result<Json<Vec<FundTransaction>>, ApiError> {
    let limit = q.limit.unwrap_or(50).clamp(1, 500);
    Ok(Json(state.store.account_transactions(account_id, limit).await?))
}

#[derive(Debug, Deserialize)]
struct QuoteIngest {
    token: i64,
    last_trade_price: Decimal,
}

async fn ingest_quotes(
    State(state): State<AppState>,
    Json(ticks): Json<Vec<QuoteIngest>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let accepted = ticks.len();
    for tick in ticks {
        state.quotes.update(tick.token, tick.last_trade_price);
    }
    state.perf.quote_updates.fetch_add(accepted as u64, Ordering::Relaxed);
    Ok(Json(json!({ "accepted": accepted })))
}

async fn get_quote(
    State(state): State<AppState>,
    Path(token): Path<i64>,
) -> Result<Json<serde_json::Value>, ApiError> {
    match state.quotes.get(token) {
        Some(tick) => Ok(Json(json!({
            "token": token,
            "last_trade_price": tick.last_trade_price,
            "received_at_ms": tick.received_at_ms,
        }))),
        None => Err(ApiError::new(StatusCode::NOT_FOUND, "no fresh quote for token")),
    }
}

async fn run_worker_batch(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let batch = tasks::run_batch(&state).await?;
    Ok(Json(json!({
        "scanned": batch.scanned,
        "executed": batch.executed,
        "cancelled": batch.cancelled,
        "skipped": batch.skipped,
        "errors": batch.errors.iter().map(|e| json!({
            "order_id": e.order_id,
            "message": e.message,
        })).collect::<Vec<_>>(),
    })))
}

async fn run_worker_for_order(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let outcome = state.worker.process_order_by_id(order_id).await?;
    let outcome = match outcome {
        Outcome::Executed => "executed",
        Outcome::Cancelled => "cancelled",
        Outcome::Skipped => "skipped",
    };
    Ok(Json(json!({ "order_id": order_id, "outcome": outcome })))
}

#[derive(Debug, Deserialize)]
struct HeartbeatQuery {
    limit: Option<i64>,
}

async fn get_worker_heartbeats(
    State(state): State<AppState>,
    Query(q): Query<HeartbeatQuery>,
) -> Result<Json<Vec<serde_json::Value>>, ApiError> {
    let limit = q.limit.unwrap_or(20).clamp(1, 200);
    Ok(Json(state.store.latest_heartbeats(limit).await?))
}

async fn get_perf(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    Ok(Json(state.perf.snapshot_json()))
}

async fn get_worker_enabled(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let enabled = state.store.worker_enabled().await?;
    Ok(Json(json!({ "enabled": enabled })))
}

#[derive(Debug, Deserialize)]
struct WorkerEnabledUpdate {
    enabled: bool,
}

async fn set_worker_enabled(
    State(state): State<AppState>,
    Json(req): Json<WorkerEnabledUpdate>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.store.set_worker_enabled(req.enabled).await?;
    eprintln!("[admin] worker enabled={}", req.enabled);
    Ok(Json(json!({ "enabled": req.enabled })))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = load_config()?;

    let db = PgPoolOptions::new()
        .min_connections(cfg.database.min_pool_size)
        .max_connections(cfg.database.max_pool_size)
        .acquire_timeout(Duration::from_secs(cfg.database.acquire_timeout_seconds))
        .max_lifetime(Duration::from_secs(cfg.database.max_lifetime_seconds))
        .connect(&cfg.database.url)
        .await
        .context("failed to connect to postgres")?;

    let state = AppState::new(cfg, db);

    let allowed_headers = [CONTENT_TYPE, ACCEPT];
    let allowed_methods = [Method::GET, Method::POST, Method::OPTIONS];
    let cors = if state.cfg.api.cors_origins.iter().any(|x| x == "*") {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(allowed_methods)
            .allow_headers(allowed_headers)
    } else {
        let origins: Vec<HeaderValue> = state
            .cfg
            .api
            .cors_origins
            .iter()
            .filter_map(|origin| HeaderValue::from_str(origin).ok())
            .collect();
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(allowed_methods)
            .allow_headers(allowed_headers)
    };

    tasks::start_background_tasks(state.clone());

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/orders", post(create_order))
        .route("/orders/{order_id}", get(get_order))
        .route("/accounts/{account_id}", get(get_account))
        .route("/accounts/{account_id}/transactions", get(get_account_transactions))
        .route("/internal/quotes", post(ingest_quotes))
        .route("/internal/quotes/{token}", get(get_quote))
        .route("/internal/worker/run", post(run_worker_batch))
        .route("/internal/worker/orders/{order_id}", post(run_worker_for_order))
        .route("/internal/worker/heartbeats", get(get_worker_heartbeats))
        .route("/admin/worker/enabled", get(get_worker_enabled).post(set_worker_enabled))
        .route("/admin/debug/perf", get(get_perf))
        .layer(cors)
        .with_state(state.clone());

    let addr: SocketAddr = format!("{}:{}", state.cfg.api.host, state.cfg.api.port).parse()?;
    println!("brokerd listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
