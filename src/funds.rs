use anyhow::{anyhow, bail, Context, Result};
use rust_decimal::Decimal;
use sqlx::{Postgres, Transaction};
use uuid::Uuid;

/// Ledger kinds written by the placement and worker paths. Cancel/compensation
/// looks MARGIN_BLOCKED rows up by order id to know exactly how much to return.
pub(crate) const KIND_MARGIN_BLOCKED: &str = "MARGIN_BLOCKED";
pub(crate) const KIND_MARGIN_RELEASED: &str = "MARGIN_RELEASED";
pub(crate) const KIND_BROKERAGE: &str = "BROKERAGE";

/// Move `amount` from available to used margin inside the caller's
/// transaction and write the matching DEBIT ledger row. Fails without
/// touching anything when the account lacks available margin.
pub(crate) async fn block_margin_tx(
    tx: &mut Transaction<'_, Postgres>,
    account_id: Uuid,
    amount: Decimal,
    description: &str,
    order_id: Uuid,
) -> Result<()> {
    if amount < Decimal::ZERO {
        bail!("refusing to block negative margin {amount} for account {account_id}");
    }
    if amount == Decimal::ZERO {
        return Ok(());
    }
    let updated = sqlx::query(
        "UPDATE trading_accounts
         SET available_margin = available_margin - $2,
             used_margin = used_margin + $2
         WHERE id = $1 AND available_margin >= $2",
    )
    .bind(account_id)
    .bind(amount)
    .execute(&mut **tx)
    .await
    .context("block margin")?;
    if updated.rows_affected() == 0 {
        bail!("insufficient margin for account {account_id}: need {amount}");
    }
    insert_ledger(tx, account_id, amount, "DEBIT", KIND_MARGIN_BLOCKED, description, Some(order_id))
        .await
}

/// Return `amount` from used to available margin and write the CREDIT ledger
/// row. Used by the compensation path after a failed execution.
pub(crate) async fn release_margin_tx(
    tx: &mut Transaction<'_, Postgres>,
    account_id: Uuid,
    amount: Decimal,
    description: &str,
    order_id: Uuid,
) -> Result<()> {
    if amount < Decimal::ZERO {
        bail!("refusing to release negative margin {amount} for account {account_id}");
    }
    if amount == Decimal::ZERO {
        return Ok(());
    }
    let updated = sqlx::query(
        "UPDATE trading_accounts
         SET available_margin = available_margin + $2,
             used_margin = GREATEST(used_margin - $2, 0)
         WHERE id = $1",
    )
    .bind(account_id)
    .bind(amount)
    .execute(&mut **tx)
    .await
    .context("release margin")?;
    if updated.rows_affected() == 0 {
        bail!("release margin: account {account_id} not found");
    }
    insert_ledger(tx, account_id, amount, "CREDIT", KIND_MARGIN_RELEASED, description, Some(order_id))
        .await
}

/// Deduct brokerage from the account balance. Charged once at placement.
pub(crate) async fn charge_brokerage_tx(
    tx: &mut Transaction<'_, Postgres>,
    account_id: Uuid,
    amount: Decimal,
    description: &str,
    order_id: Uuid,
) -> Result<()> {
    if amount <= Decimal::ZERO {
        return Ok(());
    }
    sqlx::query("UPDATE trading_accounts SET balance = balance - $2 WHERE id = $1")
        .bind(account_id)
        .bind(amount)
        .execute(&mut **tx)
        .await
        .context("charge brokerage")?;
    insert_ledger(tx, account_id, amount, "DEBIT", KIND_BROKERAGE, description, Some(order_id)).await
}

/// Amount blocked for an order at placement, if a ledger row exists. The
/// cancel path prefers this over recomputing the margin from current prices.
pub(crate) async fn blocked_amount_tx(
    tx: &mut Transaction<'_, Postgres>,
    order_id: Uuid,
) -> Result<Option<Decimal>> {
    let row: Option<(Decimal,)> = sqlx::query_as(
        "SELECT amount FROM fund_transactions
         WHERE order_id = $1 AND kind = $2
         ORDER BY created_at DESC LIMIT 1",
    )
    .bind(order_id)
    .bind(KIND_MARGIN_BLOCKED)
    .fetch_optional(&mut **tx)
    .await
    .context("look up blocked margin")?;
    Ok(row.map(|(amount,)| amount))
}

async fn insert_ledger(
    tx: &mut Transaction<'_, Postgres>,
    account_id: Uuid,
    amount: Decimal,
    direction: &str,
    kind: &str,
    description: &str,
    order_id: Option<Uuid>,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO fund_transactions (account_id, amount, direction, kind, description, order_id)
         VALUES ($1, $2, $3, $4, $5, $6)",
    )
    .bind(account_id)
    .bind(amount)
    .bind(direction)
    .bind(kind)
    .bind(description)
    .bind(order_id)
    .execute(&mut **tx)
    .await
    .map_err(|e| anyhow!("insert {kind} ledger row: {e}"))?;
    Ok(())
}
