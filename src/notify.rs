use rust_decimal::Decimal;
use uuid::Uuid;

use crate::models::OrderSide;

/// Terminal-state event emitted after an order's transaction has committed.
/// Delivery is fire-and-forget; execution never waits on a subscriber.
#[derive(Debug, Clone)]
pub(crate) enum OrderEvent {
    Executed {
        order_id: Uuid,
        account_id: Uuid,
        symbol: String,
        side: OrderSide,
        filled_quantity: i64,
        average_price: Decimal,
    },
    Cancelled {
        order_id: Uuid,
        account_id: Uuid,
        symbol: String,
        reason: String,
    },
}

pub(crate) trait Notifier: Send + Sync + 'static {
    fn notify(&self, event: OrderEvent);
}

/// Default sink: structured log lines, same shape the rest of the service
/// emits. A push channel can be swapped in without touching the worker.
pub(crate) struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, event: OrderEvent) {
        match event {
            OrderEvent::Executed {
                order_id,
                account_id,
                symbol,
                side,
                filled_quantity,
                average_price,
            } => {
                eprintln!(
                    "[notify] event=executed order={order_id} account={account_id} symbol={symbol} side={side} qty={filled_quantity} avg={average_price}"
                );
            }
            OrderEvent::Cancelled { order_id, account_id, symbol, reason } => {
                eprintln!(
                    "[notify] event=cancelled order={order_id} account={account_id} symbol={symbol} reason={reason:?}"
                );
            }
        }
    }
}
