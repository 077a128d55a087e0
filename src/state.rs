use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::json;
use sqlx::PgPool;

use crate::config::AppConfig;
use crate::notify::LogNotifier;
use crate::quotes::QuoteCache;
use crate::store::PgStore;
use crate::worker::{BatchResult, OrderWorker};

/// Process-lifetime counters surfaced by the debug perf route. Plain atomics,
/// safe to bump from any task.
#[derive(Default)]
pub(crate) struct PerfCounters {
    pub(crate) batches: AtomicU64,
    pub(crate) orders_scanned: AtomicU64,
    pub(crate) orders_executed: AtomicU64,
    pub(crate) orders_cancelled: AtomicU64,
    pub(crate) orders_skipped: AtomicU64,
    pub(crate) order_errors: AtomicU64,
    pub(crate) fast_path_runs: AtomicU64,
    pub(crate) quote_updates: AtomicU64,
}

impl PerfCounters {
    pub(crate) fn record_batch(&self, batch: &BatchResult) {
        self.batches.fetch_add(1, Ordering::Relaxed);
        self.orders_scanned.fetch_add(batch.scanned as u64, Ordering::Relaxed);
        self.orders_executed.fetch_add(batch.executed as u64, Ordering::Relaxed);
        self.orders_cancelled.fetch_add(batch.cancelled as u64, Ordering::Relaxed);
        self.orders_skipped.fetch_add(batch.skipped as u64, Ordering::Relaxed);
        self.order_errors.fetch_add(batch.errors.len() as u64, Ordering::Relaxed);
    }

    pub(crate) fn snapshot_json(&self) -> serde_json::Value {
        json!({
            "batches": self.batches.load(Ordering::Relaxed),
            "orders_scanned": self.orders_scanned.load(Ordering::Relaxed),
            "orders_executed": self.orders_executed.load(Ordering::Relaxed),
            "orders_cancelled": self.orders_cancelled.load(Ordering::Relaxed),
            "orders_skipped": self.orders_skipped.load(Ordering::Relaxed),
            "order_errors": self.order_errors.load(Ordering::Relaxed),
            "fast_path_runs": self.fast_path_runs.load(Ordering::Relaxed),
            "quote_updates": self.quote_updates.load(Ordering::Relaxed),
        })
    }
}

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) cfg: Arc<AppConfig>,
    pub(crate) db: PgPool,
    pub(crate) quotes: Arc<QuoteCache>,
    pub(crate) store: Arc<PgStore>,
    pub(crate) worker: Arc<OrderWorker<PgStore, LogNotifier>>,
    pub(crate) perf: Arc<PerfCounters>,
}

impl AppState {
    pub(crate) fn new(cfg: AppConfig, db: PgPool) -> Self {
        let cfg = Arc::new(cfg);
        let quotes = Arc::new(QuoteCache::new(cfg.worker.quote_staleness_ms));
        let store = Arc::new(PgStore::new(db.clone()));
        let worker = Arc::new(OrderWorker::new(
            store.clone(),
            quotes.clone(),
            Arc::new(LogNotifier),
            cfg.margin.clone(),
            cfg.worker.enabled_flag_ttl_ms,
        ));
        Self {
            cfg,
            db,
            quotes,
            store,
            worker,
            perf: Arc::new(PerfCounters::default()),
        }
    }
}
