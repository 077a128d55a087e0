use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::margin::MarginPolicy;
use crate::models::{Instrument, Order};
use crate::notify::{Notifier, OrderEvent};
use crate::quotes::QuoteCache;
use crate::store::{CancelResult, ExecutionStore, Fill, OrderClaim};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    Executed,
    Cancelled,
    /// Lock contention, already-terminal order, or worker disabled.
    Skipped,
}

#[derive(Debug)]
pub(crate) struct BatchError {
    pub(crate) order_id: Uuid,
    pub(crate) message: String,
}

#[derive(Debug, Default)]
pub(crate) struct BatchResult {
    pub(crate) scanned: usize,
    pub(crate) executed: usize,
    pub(crate) cancelled: usize,
    pub(crate) skipped: usize,
    pub(crate) errors: Vec<BatchError>,
}

/// Drains PENDING orders: claim, price, position upsert, finalize. Any
/// instance can run against the same database; per-order locks keep them from
/// double-filling.
pub(crate) struct OrderWorker<S: ExecutionStore, N: Notifier> {
    store: Arc<S>,
    quotes: Arc<QuoteCache>,
    notifier: Arc<N>,
    margin: MarginPolicy,
    flag_ttl_ms: i64,
    flag_enabled: AtomicBool,
    flag_checked_ms: AtomicI64,
}

fn now_epoch_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

impl<S: ExecutionStore, N: Notifier> OrderWorker<S, N> {
    pub(crate) fn new(
        store: Arc<S>,
        quotes: Arc<QuoteCache>,
        notifier: Arc<N>,
        margin: MarginPolicy,
        flag_ttl_ms: i64,
    ) -> Self {
        Self {
            store,
            quotes,
            notifier,
            margin,
            flag_ttl_ms,
            flag_enabled: AtomicBool::new(true),
            flag_checked_ms: AtomicI64::new(0),
        }
    }

    /// Kill-switch state, cached for `flag_ttl_ms` to keep the hot path from
    /// hitting the flags table on every order.
    async fn enabled(&self) -> Result<bool> {
        let now = now_epoch_ms();
        let checked = self.flag_checked_ms.load(Ordering::Acquire);
        if checked != 0 && self.flag_ttl_ms > 0 && now - checked < self.flag_ttl_ms {
            return Ok(self.flag_enabled.load(Ordering::Acquire));
        }
        let enabled = self.store.worker_enabled().await?;
        self.flag_enabled.store(enabled, Ordering::Release);
        self.flag_checked_ms.store(now, Ordering::Release);
        Ok(enabled)
    }

    /// Price precedence: explicit order price, then a fresh cached quote, then
    /// the instrument's static last price. None means nothing usable exists.
    fn resolve_price(&self, order: &Order, instrument: &Instrument) -> Option<Decimal> {
        if let Some(price) = order.price {
            if price > Decimal::ZERO {
                return Some(price);
            }
        }
        if let Some(token) = instrument.quote_token {
            if let Some(tick) = self.quotes.get(token) {
                if tick.last_trade_price > Decimal::ZERO {
                    return Some(tick.last_trade_price);
                }
            }
        }
        instrument.last_price.filter(|p| *p > Decimal::ZERO)
    }

    fn fallback_margin(&self, order: &Order, instrument: Option<&Instrument>) -> Option<Decimal> {
        let instrument = instrument?;
        let price = self.resolve_price(order, instrument)?;
        let charges = self.margin.calculate(
            instrument.segment,
            order.product,
            order.quantity,
            price,
            instrument.lot_size,
        );
        Some(charges.required_margin)
    }

    /// Cancel an unfillable or failed order and give its blocked margin back.
    /// Returns Err when the cancellation itself could not run, leaving the
    /// order PENDING for a later retry.
    async fn cancel_with_reason(
        &self,
        order: &Order,
        reason: &str,
        instrument: Option<&Instrument>,
    ) -> Result<Outcome> {
        let fallback = self.fallback_margin(order, instrument);
        match self.store.cancel_pending(order.id, reason, fallback).await? {
            CancelResult::Cancelled { released } => {
                eprintln!(
                    "[worker] order={} cancelled reason={reason:?} released={released}",
                    order.id
                );
                self.notifier.notify(OrderEvent::Cancelled {
                    order_id: order.id,
                    account_id: order.account_id,
                    symbol: order.symbol.clone(),
                    reason: reason.to_string(),
                });
                Ok(Outcome::Cancelled)
            }
            CancelResult::Busy => {
                anyhow::bail!("order {} busy during cancellation ({reason})", order.id)
            }
            CancelResult::Stale => Ok(Outcome::Skipped),
        }
    }

    pub(crate) async fn process_order_by_id(&self, order_id: Uuid) -> Result<Outcome> {
        if !self.enabled().await? {
            return Ok(Outcome::Skipped);
        }
        let (mut claim, order) = match self.store.claim_order(order_id).await? {
            OrderClaim::Busy | OrderClaim::Stale => return Ok(Outcome::Skipped),
            OrderClaim::Claimed { claim, order } => (claim, order),
        };

        let instrument_id = match order.instrument_id {
            Some(id) => id,
            None => {
                self.store.abort_claim(claim).await;
                return self.cancel_with_reason(&order, "order has no instrument", None).await;
            }
        };
        let instrument = match self.store.load_instrument(&mut claim, instrument_id).await {
            Ok(Some(instrument)) => instrument,
            Ok(None) => {
                self.store.abort_claim(claim).await;
                return self.cancel_with_reason(&order, "instrument not found", None).await;
            }
            Err(e) => {
                self.store.abort_claim(claim).await;
                return self
                    .cancel_with_reason(&order, &format!("instrument load failed: {e:#}"), None)
                    .await;
            }
        };

        let price = match self.resolve_price(&order, &instrument) {
            Some(price) => price,
            None => {
                self.store.abort_claim(claim).await;
                return self
                    .cancel_with_reason(&order, "no execution price available", Some(&instrument))
                    .await;
            }
        };

        let delta = order.side.signed_quantity(order.quantity);
        let outcome = match self
            .store
            .upsert_position(&mut claim, order.account_id, instrument_id, &order.symbol, delta, price)
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                self.store.abort_claim(claim).await;
                return self
                    .cancel_with_reason(
                        &order,
                        &format!("position update failed: {e:#}"),
                        Some(&instrument),
                    )
                    .await;
            }
        };

        let fill = Fill {
            filled_quantity: order.quantity,
            average_price: price,
            position_id: outcome.position_id(),
        };
        if let Err(e) = self.store.finalize_executed(claim, &order, &fill).await {
            // Claim already rolled back inside finalize; nothing was applied.
            return self
                .cancel_with_reason(&order, &format!("finalize failed: {e:#}"), Some(&instrument))
                .await;
        }

        eprintln!(
            "[worker] order={} executed symbol={} side={} qty={} price={price}",
            order.id, order.symbol, order.side, order.quantity
        );
        self.notifier.notify(OrderEvent::Executed {
            order_id: order.id,
            account_id: order.account_id,
            symbol: order.symbol.clone(),
            side: order.side,
            filled_quantity: fill.filled_quantity,
            average_price: fill.average_price,
        });
        Ok(Outcome::Executed)
    }

    /// One batch pass: scan oldest PENDING orders and run each through the
    /// pipeline. Per-order failures are collected, never fatal to the batch.
    pub(crate) async fn process_pending_orders(
        &self,
        limit: i64,
        min_age_ms: Option<i64>,
    ) -> Result<BatchResult> {
        let mut result = BatchResult::default();
        if !self.enabled().await? {
            return Ok(result);
        }
        let ids = self
            .store
            .pending_order_ids(limit, min_age_ms)
            .await
            .context("scan pending orders")?;
        result.scanned = ids.len();
        for order_id in ids {
            match self.process_order_by_id(order_id).await {
                Ok(Outcome::Executed) => result.executed += 1,
                Ok(Outcome::Cancelled) => result.cancelled += 1,
                Ok(Outcome::Skipped) => result.skipped += 1,
                Err(e) => {
                    eprintln!("[worker] order={order_id} error={e:#}");
                    result.errors.push(BatchError {
                        order_id,
                        message: format!("{e:#}"),
                    });
                }
            }
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use tokio::sync::Mutex;

    use super::*;
    use crate::lock::{order_lock_key, InMemoryLockService, LockLease};
    use crate::models::{
        OrderSide, OrderStatus, Position, ProductType, Segment, TradingAccount, WorkerHeartbeat,
    };
    use crate::store::PositionOutcome;

    const CLAIM_TTL: Duration = Duration::from_secs(30);

    #[derive(Clone)]
    struct LedgerRow {
        account_id: Uuid,
        amount: Decimal,
        kind: String,
        order_id: Option<Uuid>,
        position_id: Option<Uuid>,
    }

    #[derive(Default)]
    struct MemDb {
        orders: HashMap<Uuid, Order>,
        instruments: HashMap<Uuid, Instrument>,
        positions: HashMap<(Uuid, Uuid), Position>,
        accounts: HashMap<Uuid, TradingAccount>,
        ledger: Vec<LedgerRow>,
        heartbeats: Vec<WorkerHeartbeat>,
        enabled: bool,
        fail_upsert: bool,
        fail_finalize: bool,
    }

    struct StagedPosition {
        position_id: Uuid,
        account_id: Uuid,
        instrument_id: Uuid,
        symbol: String,
        quantity: i64,
        average_price: Decimal,
        closed: bool,
    }

    struct MemClaim {
        order_id: Uuid,
        staged: Option<StagedPosition>,
        _lease: LockLease,
    }

    /// Hash-map store with the same claim protocol as the Postgres one:
    /// exclusive lease per order, staged position writes, atomic finalize.
    struct MemStore {
        db: Mutex<MemDb>,
        locks: Arc<InMemoryLockService>,
    }

    impl MemStore {
        fn new(db: MemDb) -> Self {
            Self { db: Mutex::new(db), locks: InMemoryLockService::new() }
        }
    }

    #[async_trait]
    impl ExecutionStore for MemStore {
        type Claim = MemClaim;

        async fn worker_enabled(&self) -> Result<bool> {
            Ok(self.db.lock().await.enabled)
        }

        async fn pending_order_ids(
            &self,
            limit: i64,
            min_age_ms: Option<i64>,
        ) -> Result<Vec<Uuid>> {
            let db = self.db.lock().await;
            let cutoff = min_age_ms.map(|ms| Utc::now() - chrono::Duration::milliseconds(ms));
            let mut pending: Vec<&Order> = db
                .orders
                .values()
                .filter(|o| o.status == OrderStatus::Pending)
                .filter(|o| cutoff.map_or(true, |c| o.created_at <= c))
                .collect();
            pending.sort_by_key(|o| o.created_at);
            Ok(pending.iter().take(limit as usize).map(|o| o.id).collect())
        }

        async fn claim_order(&self, order_id: Uuid) -> Result<OrderClaim<MemClaim>> {
            let lease = match self.locks.try_acquire(order_lock_key(order_id), CLAIM_TTL) {
                Some(lease) => lease,
                None => return Ok(OrderClaim::Busy),
            };
            let db = self.db.lock().await;
            match db.orders.get(&order_id) {
                Some(order) if order.status == OrderStatus::Pending => Ok(OrderClaim::Claimed {
                    claim: MemClaim { order_id, staged: None, _lease: lease },
                    order: order.clone(),
                }),
                _ => Ok(OrderClaim::Stale),
            }
        }

        async fn load_instrument(
            &self,
            _claim: &mut MemClaim,
            instrument_id: Uuid,
        ) -> Result<Option<Instrument>> {
            Ok(self.db.lock().await.instruments.get(&instrument_id).cloned())
        }

        async fn upsert_position(
            &self,
            claim: &mut MemClaim,
            account_id: Uuid,
            instrument_id: Uuid,
            symbol: &str,
            delta: i64,
            price: Decimal,
        ) -> Result<PositionOutcome> {
            let db = self.db.lock().await;
            if db.fail_upsert {
                anyhow::bail!("simulated position write failure");
            }
            let existing = db.positions.get(&(account_id, instrument_id));
            let (position_id, quantity, average) = match existing {
                Some(p) => (p.id, p.quantity, p.average_price),
                None => (Uuid::new_v4(), 0, Decimal::ZERO),
            };
            let (outcome, staged) = match crate::positions::apply_fill(quantity, average, delta, price)
            {
                crate::positions::FillEffect::Closed => (
                    PositionOutcome::Closed { position_id },
                    StagedPosition {
                        position_id,
                        account_id,
                        instrument_id,
                        symbol: symbol.to_string(),
                        quantity: 0,
                        average_price: Decimal::ZERO,
                        closed: true,
                    },
                ),
                crate::positions::FillEffect::Open { quantity, average_price } => (
                    PositionOutcome::Open { position_id, quantity, average_price },
                    StagedPosition {
                        position_id,
                        account_id,
                        instrument_id,
                        symbol: symbol.to_string(),
                        quantity,
                        average_price,
                        closed: false,
                    },
                ),
            };
            claim.staged = Some(staged);
            Ok(outcome)
        }

        async fn finalize_executed(
            &self,
            claim: MemClaim,
            order: &Order,
            fill: &Fill,
        ) -> Result<()> {
            let mut db = self.db.lock().await;
            if db.fail_finalize {
                anyhow::bail!("simulated finalize failure");
            }
            if let Some(staged) = claim.staged {
                let key = (staged.account_id, staged.instrument_id);
                if staged.closed {
                    db.positions.remove(&key);
                } else {
                    db.positions.insert(
                        key,
                        Position {
                            id: staged.position_id,
                            account_id: staged.account_id,
                            instrument_id: staged.instrument_id,
                            symbol: staged.symbol,
                            quantity: staged.quantity,
                            average_price: staged.average_price,
                        },
                    );
                }
            }
            let stored = db
                .orders
                .get_mut(&claim.order_id)
                .ok_or_else(|| anyhow::anyhow!("order vanished"))?;
            assert_eq!(stored.id, order.id);
            stored.status = OrderStatus::Executed;
            stored.filled_quantity = fill.filled_quantity;
            stored.average_price = Some(fill.average_price);
            stored.position_id = Some(fill.position_id);
            stored.executed_at = Some(Utc::now());
            for row in db.ledger.iter_mut() {
                if row.order_id == Some(claim.order_id) && row.position_id.is_none() {
                    row.position_id = Some(fill.position_id);
                }
            }
            Ok(())
        }

        async fn abort_claim(&self, claim: MemClaim) {
            drop(claim);
        }

        async fn cancel_pending(
            &self,
            order_id: Uuid,
            reason: &str,
            fallback_margin: Option<Decimal>,
        ) -> Result<CancelResult> {
            let _lease = match self.locks.try_acquire(order_lock_key(order_id), CLAIM_TTL) {
                Some(lease) => lease,
                None => return Ok(CancelResult::Busy),
            };
            let mut db = self.db.lock().await;
            let account_id = match db.orders.get_mut(&order_id) {
                Some(order) if order.status == OrderStatus::Pending => {
                    order.status = OrderStatus::Cancelled;
                    order.reason = Some(reason.to_string());
                    order.account_id
                }
                _ => return Ok(CancelResult::Stale),
            };
            let blocked = db
                .ledger
                .iter()
                .rev()
                .find(|l| l.order_id == Some(order_id) && l.kind == "MARGIN_BLOCKED")
                .map(|l| l.amount);
            let released = blocked.or(fallback_margin).unwrap_or(Decimal::ZERO);
            if released > Decimal::ZERO {
                if let Some(account) = db.accounts.get_mut(&account_id) {
                    account.available_margin += released;
                    account.used_margin -= released;
                }
                db.ledger.push(LedgerRow {
                    account_id,
                    amount: released,
                    kind: "MARGIN_RELEASED".to_string(),
                    order_id: Some(order_id),
                    position_id: None,
                });
            }
            Ok(CancelResult::Cancelled { released })
        }

        async fn record_heartbeat(&self, hb: &WorkerHeartbeat) -> Result<()> {
            self.db.lock().await.heartbeats.push(hb.clone());
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingNotifier {
        events: StdMutex<Vec<OrderEvent>>,
    }

    impl Notifier for RecordingNotifier {
        fn notify(&self, event: OrderEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    fn margin_policy() -> MarginPolicy {
        MarginPolicy {
            equity_intraday_leverage: dec!(200),
            equity_delivery_leverage: dec!(50),
            derivative_leverage: dec!(100),
            brokerage_rate: dec!(0.0003),
            brokerage_cap: dec!(20),
            derivative_flat_fee: dec!(20),
        }
    }

    struct Harness {
        store: Arc<MemStore>,
        worker: Arc<OrderWorker<MemStore, RecordingNotifier>>,
        notifier: Arc<RecordingNotifier>,
        quotes: Arc<QuoteCache>,
        account_id: Uuid,
        instrument_id: Uuid,
    }

    const QUOTE_TOKEN: i64 = 738_561;

    fn harness(db_tweak: impl FnOnce(&mut MemDb)) -> Harness {
        let account_id = Uuid::new_v4();
        let instrument_id = Uuid::new_v4();
        let mut db = MemDb { enabled: true, ..Default::default() };
        db.accounts.insert(
            account_id,
            TradingAccount {
                id: account_id,
                owner: "demo".to_string(),
                balance: dec!(100000),
                available_margin: dec!(100000),
                used_margin: Decimal::ZERO,
            },
        );
        db.instruments.insert(
            instrument_id,
            Instrument {
                id: instrument_id,
                symbol: "RELIANCE".to_string(),
                segment: Segment::Equity,
                lot_size: 1,
                quote_token: Some(QUOTE_TOKEN),
                last_price: Some(dec!(2900)),
            },
        );
        db_tweak(&mut db);
        let store = Arc::new(MemStore::new(db));
        let quotes = Arc::new(QuoteCache::new(60_000));
        let notifier = Arc::new(RecordingNotifier::default());
        // TTL 0 keeps the kill-switch cache transparent in tests.
        let worker = Arc::new(OrderWorker::new(
            store.clone(),
            quotes.clone(),
            notifier.clone(),
            margin_policy(),
            0,
        ));
        Harness { store, worker, notifier, quotes, account_id, instrument_id }
    }

    impl Harness {
        /// Insert a PENDING order with its margin already blocked, the way the
        /// placement route leaves it.
        async fn place_order(
            &self,
            side: OrderSide,
            quantity: i64,
            price: Option<Decimal>,
            blocked: Decimal,
            age_offset_ms: i64,
        ) -> Uuid {
            let id = Uuid::new_v4();
            let mut db = self.store.db.lock().await;
            db.orders.insert(
                id,
                Order {
                    id,
                    account_id: self.account_id,
                    instrument_id: Some(self.instrument_id),
                    symbol: "RELIANCE".to_string(),
                    side,
                    quantity,
                    price,
                    product: ProductType::Intraday,
                    status: OrderStatus::Pending,
                    filled_quantity: 0,
                    average_price: None,
                    position_id: None,
                    reason: None,
                    created_at: Utc::now() - chrono::Duration::milliseconds(age_offset_ms),
                    executed_at: None,
                },
            );
            if blocked > Decimal::ZERO {
                let account = db.accounts.get_mut(&self.account_id).unwrap();
                account.available_margin -= blocked;
                account.used_margin += blocked;
                db.ledger.push(LedgerRow {
                    account_id: self.account_id,
                    amount: blocked,
                    kind: "MARGIN_BLOCKED".to_string(),
                    order_id: Some(id),
                    position_id: None,
                });
            }
            id
        }

        async fn order(&self, id: Uuid) -> Order {
            self.store.db.lock().await.orders.get(&id).cloned().unwrap()
        }

        async fn position(&self) -> Option<Position> {
            self.store
                .db
                .lock()
                .await
                .positions
                .get(&(self.account_id, self.instrument_id))
                .cloned()
        }

        async fn account(&self) -> TradingAccount {
            self.store.db.lock().await.accounts.get(&self.account_id).cloned().unwrap()
        }
    }

    #[tokio::test]
    async fn executes_market_order_at_cached_quote() {
        let h = harness(|_| {});
        h.quotes.update(QUOTE_TOKEN, dec!(2945.10));
        let id = h.place_order(OrderSide::Buy, 10, None, dec!(147.26), 0).await;

        let outcome = h.worker.process_order_by_id(id).await.unwrap();
        assert_eq!(outcome, Outcome::Executed);

        let order = h.order(id).await;
        assert_eq!(order.status, OrderStatus::Executed);
        assert_eq!(order.filled_quantity, 10);
        assert_eq!(order.average_price, Some(dec!(2945.10)));
        assert!(order.executed_at.is_some());

        let position = h.position().await.expect("position opened");
        assert_eq!(position.quantity, 10);
        assert_eq!(position.average_price, dec!(2945.10));
        assert_eq!(order.position_id, Some(position.id));

        let events = h.notifier.events.lock().unwrap();
        assert!(matches!(
            events.as_slice(),
            [OrderEvent::Executed { filled_quantity: 10, .. }]
        ));
        drop(events);

        // Ledger rows blocked at placement now point at the funded position.
        let db = h.store.db.lock().await;
        let blocked = db
            .ledger
            .iter()
            .find(|l| l.order_id == Some(id) && l.kind == "MARGIN_BLOCKED")
            .unwrap();
        assert_eq!(blocked.position_id, Some(position.id));
    }

    #[tokio::test]
    async fn limit_price_takes_precedence_over_quote() {
        let h = harness(|_| {});
        h.quotes.update(QUOTE_TOKEN, dec!(60));
        let id = h.place_order(OrderSide::Buy, 5, Some(dec!(50)), dec!(1.25), 0).await;

        assert_eq!(h.worker.process_order_by_id(id).await.unwrap(), Outcome::Executed);
        assert_eq!(h.order(id).await.average_price, Some(dec!(50)));
    }

    #[tokio::test]
    async fn static_price_used_when_quote_cache_is_cold() {
        let h = harness(|_| {});
        let id = h.place_order(OrderSide::Buy, 5, None, dec!(72.50), 0).await;

        assert_eq!(h.worker.process_order_by_id(id).await.unwrap(), Outcome::Executed);
        // No quote ingested for the token, falls through to the instrument's
        // stored last price.
        assert_eq!(h.order(id).await.average_price, Some(dec!(2900)));
    }

    #[tokio::test]
    async fn cancels_and_releases_margin_when_no_price_exists() {
        let h = harness(|db| {
            let instrument = db.instruments.values_mut().next().unwrap();
            instrument.quote_token = None;
            instrument.last_price = None;
        });
        let id = h.place_order(OrderSide::Buy, 10, None, dec!(145), 0).await;
        let before = h.account().await;
        assert_eq!(before.used_margin, dec!(145));

        assert_eq!(h.worker.process_order_by_id(id).await.unwrap(), Outcome::Cancelled);

        let order = h.order(id).await;
        assert_eq!(order.status, OrderStatus::Cancelled);
        assert_eq!(order.reason.as_deref(), Some("no execution price available"));

        let after = h.account().await;
        assert_eq!(after.available_margin, dec!(100000));
        assert_eq!(after.used_margin, Decimal::ZERO);
        let db = h.store.db.lock().await;
        assert!(db
            .ledger
            .iter()
            .any(|l| l.kind == "MARGIN_RELEASED" && l.amount == dec!(145)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_workers_fill_an_order_exactly_once() {
        let h = harness(|_| {});
        h.quotes.update(QUOTE_TOKEN, dec!(100));
        let id = h.place_order(OrderSide::Buy, 10, None, dec!(5), 0).await;

        let mut handles = Vec::new();
        for _ in 0..4 {
            let worker = h.worker.clone();
            handles.push(tokio::spawn(async move { worker.process_order_by_id(id).await }));
        }
        let mut executed = 0;
        for handle in handles {
            match handle.await.unwrap().unwrap() {
                Outcome::Executed => executed += 1,
                Outcome::Skipped => {}
                Outcome::Cancelled => panic!("contending worker cancelled the order"),
            }
        }
        assert_eq!(executed, 1);
        assert_eq!(h.position().await.unwrap().quantity, 10);
        assert_eq!(h.order(id).await.filled_quantity, 10);
    }

    #[tokio::test]
    async fn reprocessing_a_terminal_order_is_a_noop() {
        let h = harness(|_| {});
        h.quotes.update(QUOTE_TOKEN, dec!(100));
        let id = h.place_order(OrderSide::Buy, 10, None, dec!(5), 0).await;

        assert_eq!(h.worker.process_order_by_id(id).await.unwrap(), Outcome::Executed);
        assert_eq!(h.worker.process_order_by_id(id).await.unwrap(), Outcome::Skipped);

        assert_eq!(h.position().await.unwrap().quantity, 10);
        let db = h.store.db.lock().await;
        assert_eq!(
            db.ledger.iter().filter(|l| l.kind == "MARGIN_RELEASED").count(),
            0
        );
    }

    #[tokio::test]
    async fn batch_drains_oldest_orders_first_within_limit() {
        let h = harness(|_| {});
        h.quotes.update(QUOTE_TOKEN, dec!(100));
        let oldest = h.place_order(OrderSide::Buy, 1, None, dec!(1), 3000).await;
        let middle = h.place_order(OrderSide::Buy, 1, None, dec!(1), 2000).await;
        let newest = h.place_order(OrderSide::Buy, 1, None, dec!(1), 1000).await;

        let batch = h.worker.process_pending_orders(2, None).await.unwrap();
        assert_eq!(batch.scanned, 2);
        assert_eq!(batch.executed, 2);
        assert!(batch.errors.is_empty());

        assert_eq!(h.order(oldest).await.status, OrderStatus::Executed);
        assert_eq!(h.order(middle).await.status, OrderStatus::Executed);
        assert_eq!(h.order(newest).await.status, OrderStatus::Pending);
    }

    #[tokio::test]
    async fn batch_age_filter_leaves_young_orders_for_the_fast_path() {
        let h = harness(|_| {});
        h.quotes.update(QUOTE_TOKEN, dec!(100));
        let old = h.place_order(OrderSide::Buy, 1, None, dec!(1), 10_000).await;
        let fresh = h.place_order(OrderSide::Buy, 1, None, dec!(1), 0).await;

        let batch = h.worker.process_pending_orders(10, Some(5_000)).await.unwrap();
        assert_eq!(batch.scanned, 1);
        assert_eq!(h.order(old).await.status, OrderStatus::Executed);
        assert_eq!(h.order(fresh).await.status, OrderStatus::Pending);
    }

    #[tokio::test]
    async fn position_write_failure_compensates_with_cancellation() {
        let h = harness(|db| db.fail_upsert = true);
        h.quotes.update(QUOTE_TOKEN, dec!(100));
        let id = h.place_order(OrderSide::Buy, 10, None, dec!(5), 0).await;

        assert_eq!(h.worker.process_order_by_id(id).await.unwrap(), Outcome::Cancelled);

        let order = h.order(id).await;
        assert_eq!(order.status, OrderStatus::Cancelled);
        assert!(order.reason.unwrap().contains("position update failed"));
        assert!(h.position().await.is_none());

        let account = h.account().await;
        assert_eq!(account.available_margin, dec!(100000));
        assert_eq!(account.used_margin, Decimal::ZERO);
        let events = h.notifier.events.lock().unwrap();
        assert!(matches!(events.as_slice(), [OrderEvent::Cancelled { .. }]));
    }

    #[tokio::test]
    async fn finalize_failure_discards_staged_position_and_compensates() {
        let h = harness(|db| db.fail_finalize = true);
        h.quotes.update(QUOTE_TOKEN, dec!(100));
        let id = h.place_order(OrderSide::Buy, 10, None, dec!(5), 0).await;

        assert_eq!(h.worker.process_order_by_id(id).await.unwrap(), Outcome::Cancelled);
        assert!(h.position().await.is_none());
        assert_eq!(h.order(id).await.status, OrderStatus::Cancelled);
        assert_eq!(h.account().await.used_margin, Decimal::ZERO);
    }

    #[tokio::test]
    async fn kill_switch_stops_the_batch_cold() {
        let h = harness(|db| db.enabled = false);
        h.quotes.update(QUOTE_TOKEN, dec!(100));
        let id = h.place_order(OrderSide::Buy, 10, None, dec!(5), 0).await;

        let batch = h.worker.process_pending_orders(10, None).await.unwrap();
        assert_eq!(batch.scanned, 0);
        assert_eq!(batch.executed, 0);
        assert_eq!(h.order(id).await.status, OrderStatus::Pending);
    }

    #[tokio::test]
    async fn sell_to_flat_removes_the_position_row() {
        let h = harness(|_| {});
        h.quotes.update(QUOTE_TOKEN, dec!(110));
        {
            let mut db = h.store.db.lock().await;
            db.positions.insert(
                (h.account_id, h.instrument_id),
                Position {
                    id: Uuid::new_v4(),
                    account_id: h.account_id,
                    instrument_id: h.instrument_id,
                    symbol: "RELIANCE".to_string(),
                    quantity: 10,
                    average_price: dec!(100),
                },
            );
        }
        let id = h.place_order(OrderSide::Sell, 10, None, dec!(5), 0).await;

        assert_eq!(h.worker.process_order_by_id(id).await.unwrap(), Outcome::Executed);
        assert!(h.position().await.is_none());
        let order = h.order(id).await;
        assert_eq!(order.status, OrderStatus::Executed);
        // The order still records which position it settled into.
        assert!(order.position_id.is_some());
    }

    #[tokio::test]
    async fn buy_into_existing_position_blends_the_average() {
        let h = harness(|_| {});
        h.quotes.update(QUOTE_TOKEN, dec!(200));
        {
            let mut db = h.store.db.lock().await;
            db.positions.insert(
                (h.account_id, h.instrument_id),
                Position {
                    id: Uuid::new_v4(),
                    account_id: h.account_id,
                    instrument_id: h.instrument_id,
                    symbol: "RELIANCE".to_string(),
                    quantity: 10,
                    average_price: dec!(100),
                },
            );
        }
        let id = h.place_order(OrderSide::Buy, 10, None, dec!(10), 0).await;

        assert_eq!(h.worker.process_order_by_id(id).await.unwrap(), Outcome::Executed);
        let position = h.position().await.unwrap();
        assert_eq!(position.quantity, 20);
        assert_eq!(position.average_price, dec!(150));
    }

    #[tokio::test]
    async fn missing_instrument_pointer_cancels_the_order() {
        let h = harness(|_| {});
        let id = h.place_order(OrderSide::Buy, 10, None, dec!(5), 0).await;
        {
            let mut db = h.store.db.lock().await;
            db.orders.get_mut(&id).unwrap().instrument_id = None;
        }

        assert_eq!(h.worker.process_order_by_id(id).await.unwrap(), Outcome::Cancelled);
        let order = h.order(id).await;
        assert_eq!(order.reason.as_deref(), Some("order has no instrument"));
        // Ledger lookup still restores the blocked amount without a fallback.
        assert_eq!(h.account().await.used_margin, Decimal::ZERO);
    }

    #[tokio::test]
    async fn instrument_without_quote_token_executes_on_static_price() {
        let h = harness(|db| {
            let instrument = db.instruments.values_mut().next().unwrap();
            instrument.quote_token = None;
        });
        let id = h.place_order(OrderSide::Buy, 3, None, dec!(43.50), 0).await;

        assert_eq!(h.worker.process_order_by_id(id).await.unwrap(), Outcome::Executed);
        assert_eq!(h.order(id).await.average_price, Some(dec!(2900)));
    }

    #[tokio::test]
    async fn stale_quote_falls_back_to_static_price() {
        let h = harness(|_| {});
        h.quotes.update_at(
            QUOTE_TOKEN,
            dec!(55),
            chrono::Utc::now().timestamp_millis() - 120_000,
        );
        let id = h.place_order(OrderSide::Buy, 2, None, dec!(1), 0).await;

        assert_eq!(h.worker.process_order_by_id(id).await.unwrap(), Outcome::Executed);
        assert_eq!(h.order(id).await.average_price, Some(dec!(2900)));
    }
}
