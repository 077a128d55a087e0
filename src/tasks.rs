use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use anyhow::Result;

use crate::models::WorkerHeartbeat;
use crate::state::AppState;
use crate::store::ExecutionStore;
use crate::worker::BatchResult;

/// One full worker pass: scan, execute, record counters and a heartbeat row.
/// Shared by the poll loop and the manual run route.
pub(crate) async fn run_batch(state: &AppState) -> Result<BatchResult> {
    let started = Instant::now();
    let batch = state
        .worker
        .process_pending_orders(state.cfg.worker.batch_limit, state.cfg.worker.max_age())
        .await?;
    state.perf.record_batch(&batch);
    let hb = WorkerHeartbeat {
        host: hostname(),
        pid: std::process::id() as i32,
        scanned: batch.scanned as i64,
        executed: batch.executed as i64,
        cancelled: batch.cancelled as i64,
        skipped: batch.skipped as i64,
        errors: batch.errors.len() as i64,
        elapsed_ms: started.elapsed().as_millis() as i64,
    };
    if let Err(e) = state.store.record_heartbeat(&hb).await {
        eprintln!("[worker] heartbeat write failed: {e:#}");
    }
    Ok(batch)
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "local".to_string())
}

pub(crate) fn start_background_tasks(state: AppState) {
    spawn_poll_loop(state.clone());
    spawn_telemetry_loop(state.clone());
    spawn_quote_prune_loop(state);
}

fn spawn_poll_loop(state: AppState) {
    let interval = Duration::from_millis(state.cfg.worker.poll_interval_ms.max(10));
    tokio::spawn(async move {
        eprintln!("[worker] poll loop started interval_ms={}", interval.as_millis());
        loop {
            tokio::time::sleep(interval).await;
            match run_batch(&state).await {
                Ok(batch) if batch.scanned > 0 => {
                    eprintln!(
                        "[worker] batch scanned={} executed={} cancelled={} skipped={} errors={}",
                        batch.scanned,
                        batch.executed,
                        batch.cancelled,
                        batch.skipped,
                        batch.errors.len()
                    );
                }
                Ok(_) => {}
                Err(e) => eprintln!("[worker] batch failed: {e:#}"),
            }
        }
    });
}

/// Emits counter deltas every 5s so a quiet log still shows the service alive.
fn spawn_telemetry_loop(state: AppState) {
    tokio::spawn(async move {
        let mut last_executed = 0u64;
        let mut last_cancelled = 0u64;
        let mut last_errors = 0u64;
        loop {
            tokio::time::sleep(Duration::from_secs(5)).await;
            let executed = state.perf.orders_executed.load(Ordering::Relaxed);
            let cancelled = state.perf.orders_cancelled.load(Ordering::Relaxed);
            let errors = state.perf.order_errors.load(Ordering::Relaxed);
            if executed != last_executed || cancelled != last_cancelled || errors != last_errors {
                eprintln!(
                    "[telemetry] executed_delta={} cancelled_delta={} errors_delta={} quotes_cached={}",
                    executed - last_executed,
                    cancelled - last_cancelled,
                    errors - last_errors,
                    state.quotes.len()
                );
                last_executed = executed;
                last_cancelled = cancelled;
                last_errors = errors;
            }
        }
    });
}

fn spawn_quote_prune_loop(state: AppState) {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_secs(60)).await;
            let removed = state.quotes.prune();
            if removed > 0 {
                eprintln!("[quotes] pruned={removed} remaining={}", state.quotes.len());
            }
        }
    });
}
