use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use rust_decimal::Decimal;

#[derive(Debug, Clone, Copy)]
pub(crate) struct QuoteTick {
    pub(crate) last_trade_price: Decimal,
    pub(crate) received_at_ms: i64,
}

/// In-memory last-traded-price cache keyed by instrument token, fed by the
/// market-data ingest route. Owned by the service instance (not a module
/// global) so workers under test get independent caches.
pub(crate) struct QuoteCache {
    ticks: DashMap<i64, QuoteTick>,
    staleness_ms: i64,
}

fn now_epoch_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

impl QuoteCache {
    pub(crate) fn new(staleness_ms: i64) -> Self {
        Self { ticks: DashMap::new(), staleness_ms }
    }

    pub(crate) fn update(&self, token: i64, last_trade_price: Decimal) {
        self.update_at(token, last_trade_price, now_epoch_ms());
    }

    pub(crate) fn update_at(&self, token: i64, last_trade_price: Decimal, received_at_ms: i64) {
        self.ticks.insert(token, QuoteTick { last_trade_price, received_at_ms });
    }

    /// Best-effort read: absent or stale entries come back as None.
    pub(crate) fn get(&self, token: i64) -> Option<QuoteTick> {
        let tick = *self.ticks.get(&token)?;
        if self.staleness_ms > 0 && now_epoch_ms() - tick.received_at_ms > self.staleness_ms {
            return None;
        }
        Some(tick)
    }

    /// Drop entries past the staleness window; returns how many were removed.
    pub(crate) fn prune(&self) -> usize {
        if self.staleness_ms <= 0 {
            return 0;
        }
        let cutoff = now_epoch_ms() - self.staleness_ms;
        let before = self.ticks.len();
        self.ticks.retain(|_, tick| tick.received_at_ms >= cutoff);
        before - self.ticks.len()
    }

    pub(crate) fn len(&self) -> usize {
        self.ticks.len()
    }
}
