// Standalone execution worker: runs the same claim/fill pipeline as the API
// process, without the order-placement surface. Useful for scaling fills
// independently; any number of these can share a database.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::json;
use sqlx::postgres::PgPoolOptions;

#[path = "../config.rs"]
mod config;
#[path = "../funds.rs"]
mod funds;
#[path = "../lock.rs"]
mod lock;
#[path = "../margin.rs"]
mod margin;
#[path = "../models.rs"]
mod models;
#[path = "../notify.rs"]
mod notify;
#[path = "../positions.rs"]
mod positions;
#[path = "../quotes.rs"]
mod quotes;
#[path = "../store.rs"]
mod store;
#[path = "../worker.rs"]
mod worker;

use config::{load_config, AppConfig};
use models::WorkerHeartbeat;
use notify::LogNotifier;
use quotes::QuoteCache;
use store::{ExecutionStore, PgStore};
use worker::OrderWorker;

#[derive(Clone)]
struct WorkerState {
    cfg: Arc<AppConfig>,
    quotes: Arc<QuoteCache>,
    store: Arc<PgStore>,
    worker: Arc<OrderWorker<PgStore, LogNotifier>>,
}

async fn health(State(state): State<WorkerState>) -> Json<serde_json::Value> {
    Json(json!({ "status": "ok", "quotes_cached": state.quotes.len() }))
}

#[derive(Debug, Deserialize)]
struct QuoteIngest {
    token: i64,
    last_trade_price: Decimal,
}

async fn ingest_quotes(
    State(state): State<WorkerState>,
    Json(ticks): Json<Vec<QuoteIngest>>,
) -> Json<serde_json::Value> {
    let accepted = ticks.len();
    for tick in ticks {
        state.quotes.update(tick.token, tick.last_trade_price);
    }
    Json(json!({ "accepted": accepted }))
}

async fn run_once(state: &WorkerState) -> Result<()> {
    let started = Instant::now();
    let batch = state
        .worker
        .process_pending_orders(state.cfg.worker.batch_limit, state.cfg.worker.max_age())
        .await?;
    if batch.scanned > 0 {
        eprintln!(
            "[worker] batch scanned={} executed={} cancelled={} skipped={} errors={}",
            batch.scanned,
            batch.executed,
            batch.cancelled,
            batch.skipped,
            batch.errors.len()
        );
    }
    let hb = WorkerHeartbeat {
        host: std::env::var("HOSTNAME").unwrap_or_else(|_| "worker".to_string()),
        pid: std::process::id() as i32,
        scanned: batch.scanned as i64,
        executed: batch.executed as i64,
        cancelled: batch.cancelled as i64,
        skipped: batch.skipped as i64,
        errors: batch.errors.len() as i64,
        elapsed_ms: started.elapsed().as_millis() as i64,
    };
    state.store.record_heartbeat(&hb).await
}

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = Arc::new(load_config()?);

    let db = PgPoolOptions::new()
        .min_connections(cfg.database.min_pool_size)
        .max_connections(cfg.database.max_pool_size)
        .acquire_timeout(Duration::from_secs(cfg.database.acquire_timeout_seconds))
        .max_lifetime(Duration::from_secs(cfg.database.max_lifetime_seconds))
        .connect(&cfg.database.url)
        .await
        .context("failed to connect to postgres")?;

    let quotes = Arc::new(QuoteCache::new(cfg.worker.quote_staleness_ms));
    let store = Arc::new(PgStore::new(db));
    let worker = Arc::new(OrderWorker::new(
        store.clone(),
        quotes.clone(),
        Arc::new(LogNotifier),
        cfg.margin.clone(),
        cfg.worker.enabled_flag_ttl_ms,
    ));
    let state = WorkerState { cfg: cfg.clone(), quotes, store, worker };

    let interval = Duration::from_millis(cfg.worker.poll_interval_ms.max(10));
    let poll_state = state.clone();
    tokio::spawn(async move {
        eprintln!("[worker] poll loop started interval_ms={}", interval.as_millis());
        loop {
            tokio::time::sleep(interval).await;
            if let Err(e) = run_once(&poll_state).await {
                eprintln!("[worker] batch failed: {e:#}");
            }
        }
    });

    let app = Router::new()
        .route("/health", get(health))
        .route("/internal/quotes", post(ingest_quotes))
        .with_state(state);

    let port = std::env::var("WORKER_API_PORT")
        .ok()
        .and_then(|v| v.parse::<u16>().ok())
        .unwrap_or(8101);
    let addr: SocketAddr = format!("{}:{}", cfg.api.host, port).parse()?;
    println!("brokerd worker listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
