use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

use crate::funds;
use crate::lock::order_lock_key;
use crate::models::{
    FundTransaction, Instrument, Order, OrderStatus, Position, TradingAccount, WorkerHeartbeat,
};
use crate::positions::{apply_fill, FillEffect};

pub(crate) const WORKER_FLAG: &str = "order_worker";

/// Outcome of trying to take exclusive ownership of one pending order.
pub(crate) enum OrderClaim<C> {
    /// Another worker holds the lock right now.
    Busy,
    /// The order is gone or already terminal; nothing to do.
    Stale,
    Claimed { claim: C, order: Order },
}

/// What the position upsert produced inside a claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PositionOutcome {
    Open {
        position_id: Uuid,
        quantity: i64,
        average_price: Decimal,
    },
    /// Net quantity hit zero and the row was deleted. The order still records
    /// the now-gone position id for audit.
    Closed { position_id: Uuid },
}

impl PositionOutcome {
    pub(crate) fn position_id(&self) -> Uuid {
        match self {
            PositionOutcome::Open { position_id, .. } => *position_id,
            PositionOutcome::Closed { position_id } => *position_id,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Fill {
    pub(crate) filled_quantity: i64,
    pub(crate) average_price: Decimal,
    pub(crate) position_id: Uuid,
}

pub(crate) enum CancelResult {
    Cancelled { released: Decimal },
    /// Lock contention; the order is being worked on elsewhere.
    Busy,
    /// Already terminal, cancellation is a no-op.
    Stale,
}

/// Persistence seam for the execution worker. The associated claim carries
/// whatever the store needs to make claim -> mutate -> finalize atomic; for
/// Postgres that is the transaction holding the advisory lock.
#[async_trait]
pub(crate) trait ExecutionStore: Send + Sync + 'static {
    type Claim: Send;

    async fn worker_enabled(&self) -> Result<bool>;

    /// Ids of PENDING orders in FIFO order, oldest first. `min_age_ms`
    /// excludes orders younger than the cutoff when set.
    async fn pending_order_ids(&self, limit: i64, min_age_ms: Option<i64>) -> Result<Vec<Uuid>>;

    async fn claim_order(&self, order_id: Uuid) -> Result<OrderClaim<Self::Claim>>;

    async fn load_instrument(
        &self,
        claim: &mut Self::Claim,
        instrument_id: Uuid,
    ) -> Result<Option<Instrument>>;

    /// Blend a signed fill into the account's position for the instrument,
    /// staged inside the claim so a later failure discards it.
    async fn upsert_position(
        &self,
        claim: &mut Self::Claim,
        account_id: Uuid,
        instrument_id: Uuid,
        symbol: &str,
        delta: i64,
        price: Decimal,
    ) -> Result<PositionOutcome>;

    /// Mark the order EXECUTED and commit everything staged in the claim.
    async fn finalize_executed(&self, claim: Self::Claim, order: &Order, fill: &Fill)
        -> Result<()>;

    /// Discard the claim without applying staged changes.
    async fn abort_claim(&self, claim: Self::Claim);

    /// Compensation: cancel the order if still PENDING and release its blocked
    /// margin. Prefers the MARGIN_BLOCKED ledger amount; `fallback_margin` is
    /// used when no ledger row exists.
    async fn cancel_pending(
        &self,
        order_id: Uuid,
        reason: &str,
        fallback_margin: Option<Decimal>,
    ) -> Result<CancelResult>;

    async fn record_heartbeat(&self, hb: &WorkerHeartbeat) -> Result<()>;
}

pub(crate) struct PgStore {
    pool: PgPool,
}

/// In-flight claim: the transaction owns a `pg_try_advisory_xact_lock` on the
/// order key, so dropping or rolling it back releases the lock implicitly.
pub(crate) struct PgClaim {
    tx: Transaction<'static, Postgres>,
}

impl PgStore {
    pub(crate) fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn try_lock_order(
        tx: &mut Transaction<'_, Postgres>,
        order_id: Uuid,
    ) -> Result<bool> {
        let row = sqlx::query("SELECT pg_try_advisory_xact_lock($1) AS locked")
            .bind(order_lock_key(order_id))
            .fetch_one(&mut **tx)
            .await
            .context("acquire order advisory lock")?;
        Ok(row.get::<bool, _>("locked"))
    }

    async fn fetch_order_for_update(
        tx: &mut Transaction<'_, Postgres>,
        order_id: Uuid,
    ) -> Result<Option<Order>> {
        let row = sqlx::query(
            "SELECT id, account_id, instrument_id, symbol, side, quantity, price, product,
                    status, filled_quantity, average_price, position_id, reason,
                    created_at, executed_at
             FROM orders WHERE id = $1 FOR UPDATE",
        )
        .bind(order_id)
        .fetch_optional(&mut **tx)
        .await
        .context("fetch order for update")?;
        row.map(|r| order_from_row(&r)).transpose()
    }

    // --- HTTP-facing reads and writes outside the worker claim protocol ---

    pub(crate) async fn instrument_by_symbol(&self, symbol: &str) -> Result<Option<Instrument>> {
        let row = sqlx::query(
            "SELECT id, symbol, segment, lot_size, quote_token, last_price
             FROM instruments WHERE symbol = $1",
        )
        .bind(symbol)
        .fetch_optional(&self.pool)
        .await
        .context("load instrument by symbol")?;
        row.map(|r| instrument_from_row(&r)).transpose()
    }

    /// Placement: insert the PENDING order, block margin and charge brokerage
    /// in one transaction. Fails atomically when margin is insufficient.
    pub(crate) async fn create_pending_order(
        &self,
        order: &NewOrder<'_>,
        required_margin: Decimal,
        brokerage: Decimal,
    ) -> Result<Order> {
        let mut tx = self.pool.begin().await.context("begin placement tx")?;
        let row = sqlx::query(
            "INSERT INTO orders (account_id, instrument_id, symbol, side, quantity, price, product)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             RETURNING id, account_id, instrument_id, symbol, side, quantity, price, product,
                       status, filled_quantity, average_price, position_id, reason,
                       created_at, executed_at",
        )
        .bind(order.account_id)
        .bind(order.instrument_id)
        .bind(order.symbol)
        .bind(order.side)
        .bind(order.quantity)
        .bind(order.price)
        .bind(order.product)
        .fetch_one(&mut *tx)
        .await
        .context("insert pending order")?;
        let created = order_from_row(&row)?;
        funds::block_margin_tx(
            &mut tx,
            order.account_id,
            required_margin,
            &format!("margin blocked for {} {} x{}", order.side, order.symbol, order.quantity),
            created.id,
        )
        .await?;
        funds::charge_brokerage_tx(
            &mut tx,
            order.account_id,
            brokerage,
            &format!("brokerage for {}", order.symbol),
            created.id,
        )
        .await?;
        tx.commit().await.context("commit placement tx")?;
        Ok(created)
    }

    pub(crate) async fn get_order(&self, order_id: Uuid) -> Result<Option<Order>> {
        let row = sqlx::query(
            "SELECT id, account_id, instrument_id, symbol, side, quantity, price, product,
                    status, filled_quantity, average_price, position_id, reason,
                    created_at, executed_at
             FROM orders WHERE id = $1",
        )
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await
        .context("load order")?;
        row.map(|r| order_from_row(&r)).transpose()
    }

    pub(crate) async fn get_account(&self, account_id: Uuid) -> Result<Option<TradingAccount>> {
        let row = sqlx::query(
            "SELECT id, owner, balance, available_margin, used_margin
             FROM trading_accounts WHERE id = $1",
        )
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await
        .context("load account")?;
        Ok(row.map(|r| TradingAccount {
            id: r.get("id"),
            owner: r.get("owner"),
            balance: r.get("balance"),
            available_margin: r.get("available_margin"),
            used_margin: r.get("used_margin"),
        }))
    }

    pub(crate) async fn account_positions(&self, account_id: Uuid) -> Result<Vec<Position>> {
        let rows = sqlx::query(
            "SELECT id, account_id, instrument_id, symbol, quantity, average_price
             FROM positions WHERE account_id = $1 ORDER BY symbol",
        )
        .bind(account_id)
        .fetch_all(&self.pool)
        .await
        .context("load account positions")?;
        rows.iter()
            .map(|r| {
                Ok(Position {
                    id: r.get("id"),
                    account_id: r.get("account_id"),
                    instrument_id: r.get("instrument_id"),
                    symbol: r.get("symbol"),
                    quantity: r.get("quantity"),
                    average_price: r.get("average_price"),
                })
            })
            .collect()
    }

    pub(crate) async fn account_transactions(
        &self,
        account_id: Uuid,
        limit: i64,
    ) -> Result<Vec<FundTransaction>> {
        let rows = sqlx::query(
            "SELECT id, account_id, amount, direction, kind, description, order_id, position_id, created_at
             FROM fund_transactions WHERE account_id = $1
             ORDER BY created_at DESC LIMIT $2",
        )
        .bind(account_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("load account ledger")?;
        Ok(rows
            .iter()
            .map(|r| FundTransaction {
                id: r.get("id"),
                account_id: r.get("account_id"),
                amount: r.get("amount"),
                direction: r.get("direction"),
                kind: r.get("kind"),
                description: r.get("description"),
                order_id: r.get("order_id"),
                position_id: r.get("position_id"),
                created_at: r.get("created_at"),
            })
            .collect())
    }

    pub(crate) async fn set_worker_enabled(&self, enabled: bool) -> Result<()> {
        sqlx::query(
            "INSERT INTO feature_flags (name, enabled, updated_at) VALUES ($1, $2, NOW())
             ON CONFLICT (name) DO UPDATE SET enabled = $2, updated_at = NOW()",
        )
        .bind(WORKER_FLAG)
        .bind(enabled)
        .execute(&self.pool)
        .await
        .context("update worker flag")?;
        Ok(())
    }

    pub(crate) async fn latest_heartbeats(&self, limit: i64) -> Result<Vec<serde_json::Value>> {
        let rows = sqlx::query(
            "SELECT host, pid, scanned, executed, cancelled, skipped, errors, elapsed_ms, created_at
             FROM worker_heartbeats ORDER BY id DESC LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("load heartbeats")?;
        Ok(rows
            .iter()
            .map(|r| {
                serde_json::json!({
                    "host": r.get::<String, _>("host"),
                    "pid": r.get::<i32, _>("pid"),
                    "scanned": r.get::<i64, _>("scanned"),
                    "executed": r.get::<i64, _>("executed"),
                    "cancelled": r.get::<i64, _>("cancelled"),
                    "skipped": r.get::<i64, _>("skipped"),
                    "errors": r.get::<i64, _>("errors"),
                    "elapsed_ms": r.get::<i64, _>("elapsed_ms"),
                    "created_at": r.get::<DateTime<Utc>, _>("created_at").to_rfc3339(),
                })
            })
            .collect())
    }
}

/// Placement-time order fields; everything else defaults in the schema.
pub(crate) struct NewOrder<'a> {
    pub(crate) account_id: Uuid,
    pub(crate) instrument_id: Option<Uuid>,
    pub(crate) symbol: &'a str,
    pub(crate) side: &'a str,
    pub(crate) quantity: i64,
    pub(crate) price: Option<Decimal>,
    pub(crate) product: &'a str,
}

#[async_trait]
impl ExecutionStore for PgStore {
    type Claim = PgClaim;

    async fn worker_enabled(&self) -> Result<bool> {
        let row = sqlx::query("SELECT enabled FROM feature_flags WHERE name = $1")
            .bind(WORKER_FLAG)
            .fetch_optional(&self.pool)
            .await
            .context("read worker flag")?;
        // Missing flag row means nobody has ever disabled the worker.
        Ok(row.map(|r| r.get::<bool, _>("enabled")).unwrap_or(true))
    }

    async fn pending_order_ids(&self, limit: i64, min_age_ms: Option<i64>) -> Result<Vec<Uuid>> {
        let cutoff: Option<DateTime<Utc>> =
            min_age_ms.map(|ms| Utc::now() - Duration::milliseconds(ms));
        let rows = sqlx::query(
            "SELECT id FROM orders
             WHERE status = 'PENDING' AND ($2::timestamptz IS NULL OR created_at <= $2)
             ORDER BY created_at ASC LIMIT $1",
        )
        .bind(limit)
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .context("scan pending orders")?;
        Ok(rows.iter().map(|r| r.get::<Uuid, _>("id")).collect())
    }

    async fn claim_order(&self, order_id: Uuid) -> Result<OrderClaim<PgClaim>> {
        let mut tx = self.pool.begin().await.context("begin claim tx")?;
        if !Self::try_lock_order(&mut tx, order_id).await? {
            tx.rollback().await.ok();
            return Ok(OrderClaim::Busy);
        }
        // Re-read under the lock: the previous holder may have finalized the
        // order between the scan and this claim.
        let order = match Self::fetch_order_for_update(&mut tx, order_id).await? {
            Some(order) if order.status == OrderStatus::Pending => order,
            _ => {
                tx.rollback().await.ok();
                return Ok(OrderClaim::Stale);
            }
        };
        Ok(OrderClaim::Claimed { claim: PgClaim { tx }, order })
    }

    async fn load_instrument(
        &self,
        claim: &mut PgClaim,
        instrument_id: Uuid,
    ) -> Result<Option<Instrument>> {
        let row = sqlx::query(
            "SELECT id, symbol, segment, lot_size, quote_token, last_price
             FROM instruments WHERE id = $1",
        )
        .bind(instrument_id)
        .fetch_optional(&mut *claim.tx)
        .await
        .context("load instrument")?;
        row.map(|r| instrument_from_row(&r)).transpose()
    }

    async fn upsert_position(
        &self,
        claim: &mut PgClaim,
        account_id: Uuid,
        instrument_id: Uuid,
        symbol: &str,
        delta: i64,
        price: Decimal,
    ) -> Result<PositionOutcome> {
        let tx = &mut claim.tx;
        let existing = sqlx::query(
            "SELECT id, quantity, average_price FROM positions
             WHERE account_id = $1 AND instrument_id = $2 FOR UPDATE",
        )
        .bind(account_id)
        .bind(instrument_id)
        .fetch_optional(&mut **tx)
        .await
        .context("lock position row")?;

        match existing {
            None => {
                let effect = apply_fill(0, Decimal::ZERO, delta, price);
                match effect {
                    FillEffect::Closed => {
                        // Only reachable with delta == 0, which placement forbids.
                        anyhow::bail!("zero-delta fill for order on {symbol}")
                    }
                    FillEffect::Open { quantity, average_price } => {
                        let row = sqlx::query(
                            "INSERT INTO positions (account_id, instrument_id, symbol, quantity, average_price)
                             VALUES ($1, $2, $3, $4, $5) RETURNING id",
                        )
                        .bind(account_id)
                        .bind(instrument_id)
                        .bind(symbol)
                        .bind(quantity)
                        .bind(average_price)
                        .fetch_one(&mut **tx)
                        .await
                        .context("insert position")?;
                        Ok(PositionOutcome::Open {
                            position_id: row.get("id"),
                            quantity,
                            average_price,
                        })
                    }
                }
            }
            Some(row) => {
                let position_id: Uuid = row.get("id");
                let quantity: i64 = row.get("quantity");
                let average_price: Decimal = row.get("average_price");
                match apply_fill(quantity, average_price, delta, price) {
                    FillEffect::Closed => {
                        sqlx::query("DELETE FROM positions WHERE id = $1")
                            .bind(position_id)
                            .execute(&mut **tx)
                            .await
                            .context("delete closed position")?;
                        Ok(PositionOutcome::Closed { position_id })
                    }
                    FillEffect::Open { quantity, average_price } => {
                        sqlx::query(
                            "UPDATE positions SET quantity = $2, average_price = $3, updated_at = NOW()
                             WHERE id = $1",
                        )
                        .bind(position_id)
                        .bind(quantity)
                        .bind(average_price)
                        .execute(&mut **tx)
                        .await
                        .context("update position")?;
                        Ok(PositionOutcome::Open { position_id, quantity, average_price })
                    }
                }
            }
        }
    }

    async fn finalize_executed(&self, claim: PgClaim, order: &Order, fill: &Fill) -> Result<()> {
        let mut tx = claim.tx;
        match finalize_inner(&mut tx, order, fill).await {
            Ok(()) => tx.commit().await.context("commit execution"),
            Err(e) => {
                tx.rollback().await.ok();
                Err(e)
            }
        }
    }

    async fn abort_claim(&self, claim: PgClaim) {
        // Rollback releases the advisory lock with the transaction.
        claim.tx.rollback().await.ok();
    }

    async fn cancel_pending(
        &self,
        order_id: Uuid,
        reason: &str,
        fallback_margin: Option<Decimal>,
    ) -> Result<CancelResult> {
        let mut tx = self.pool.begin().await.context("begin cancel tx")?;
        if !Self::try_lock_order(&mut tx, order_id).await? {
            tx.rollback().await.ok();
            return Ok(CancelResult::Busy);
        }
        let order = match Self::fetch_order_for_update(&mut tx, order_id).await? {
            Some(order) if order.status == OrderStatus::Pending => order,
            _ => {
                tx.rollback().await.ok();
                return Ok(CancelResult::Stale);
            }
        };
        sqlx::query("UPDATE orders SET status = 'CANCELLED', reason = $2 WHERE id = $1")
            .bind(order_id)
            .bind(reason)
            .execute(&mut *tx)
            .await
            .context("mark order cancelled")?;
        let blocked = funds::blocked_amount_tx(&mut tx, order_id).await?;
        let released = blocked.or(fallback_margin).unwrap_or(Decimal::ZERO);
        if released > Decimal::ZERO {
            funds::release_margin_tx(
                &mut tx,
                order.account_id,
                released,
                &format!("margin released on cancel: {reason}"),
                order_id,
            )
            .await?;
        }
        tx.commit().await.context("commit cancellation")?;
        Ok(CancelResult::Cancelled { released })
    }

    async fn record_heartbeat(&self, hb: &WorkerHeartbeat) -> Result<()> {
        sqlx::query(
            "INSERT INTO worker_heartbeats (host, pid, scanned, executed, cancelled, skipped, errors, elapsed_ms)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(&hb.host)
        .bind(hb.pid)
        .bind(hb.scanned)
        .bind(hb.executed)
        .bind(hb.cancelled)
        .bind(hb.skipped)
        .bind(hb.errors)
        .bind(hb.elapsed_ms)
        .execute(&self.pool)
        .await
        .context("record heartbeat")?;
        Ok(())
    }
}

async fn finalize_inner(
    tx: &mut Transaction<'_, Postgres>,
    order: &Order,
    fill: &Fill,
) -> Result<()> {
    let done = sqlx::query(
        "UPDATE orders
         SET status = 'EXECUTED', filled_quantity = $2, average_price = $3,
             position_id = $4, executed_at = NOW()
         WHERE id = $1 AND status = 'PENDING'",
    )
    .bind(order.id)
    .bind(fill.filled_quantity)
    .bind(fill.average_price)
    .bind(fill.position_id)
    .execute(&mut **tx)
    .await
    .context("finalize executed order")?;
    if done.rows_affected() != 1 {
        anyhow::bail!("order {} left PENDING state during finalize", order.id);
    }
    // Backfill the position link on the order's ledger rows so reporting can
    // join margin charges to the position they funded.
    sqlx::query(
        "UPDATE fund_transactions SET position_id = $2
         WHERE order_id = $1 AND position_id IS NULL",
    )
    .bind(order.id)
    .bind(fill.position_id)
    .execute(&mut **tx)
    .await
    .context("link ledger rows to position")?;
    Ok(())
}

fn order_from_row(row: &PgRow) -> Result<Order> {
    Ok(Order {
        id: row.get("id"),
        account_id: row.get("account_id"),
        instrument_id: row.get("instrument_id"),
        symbol: row.get("symbol"),
        side: row.get::<String, _>("side").parse()?,
        quantity: row.get("quantity"),
        price: row.get("price"),
        product: row.get::<String, _>("product").parse()?,
        status: row.get::<String, _>("status").parse()?,
        filled_quantity: row.get("filled_quantity"),
        average_price: row.get("average_price"),
        position_id: row.get("position_id"),
        reason: row.get("reason"),
        created_at: row.get("created_at"),
        executed_at: row.get("executed_at"),
    })
}

fn instrument_from_row(row: &PgRow) -> Result<Instrument> {
    Ok(Instrument {
        id: row.get("id"),
        symbol: row.get("symbol"),
        segment: row.get::<String, _>("segment").parse()?,
        lot_size: row.get("lot_size"),
        quote_token: row.get("quote_token"),
        last_price: row.get("last_price"),
    })
}
