use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use uuid::Uuid;
use xxhash_rust::xxh64::xxh64;

/// High 32 bits of every advisory key; keeps order locks from colliding with
/// any other advisory-lock user sharing the database.
pub(crate) const ORDER_LOCK_NAMESPACE: u32 = 0x4252_4F4B;

/// Deterministic 64-bit advisory-lock key for one order: namespace constant in
/// the high half, xxh64 of the order id truncated to the low half. Every
/// worker process derives the same key for the same order.
pub(crate) fn order_lock_key(order_id: Uuid) -> i64 {
    let low = xxh64(order_id.as_bytes(), 0) as u32;
    (((ORDER_LOCK_NAMESPACE as u64) << 32) | low as u64) as i64
}

/// Lease-based mutual exclusion for stores without a transaction-scoped
/// advisory-lock primitive (the Postgres store uses
/// `pg_try_advisory_xact_lock` inside its claim transaction instead). Leases
/// expire after a TTL so a crashed holder cannot wedge an order forever.
pub(crate) struct InMemoryLockService {
    leases: DashMap<i64, Lease>,
}

#[derive(Clone, Copy)]
struct Lease {
    token: Uuid,
    expires_at: Instant,
}

pub(crate) struct LockLease {
    service: Arc<InMemoryLockService>,
    key: i64,
    token: Uuid,
}

impl InMemoryLockService {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self { leases: DashMap::new() })
    }

    pub(crate) fn try_acquire(self: &Arc<Self>, key: i64, ttl: Duration) -> Option<LockLease> {
        let now = Instant::now();
        let lease = Lease { token: Uuid::new_v4(), expires_at: now + ttl };
        match self.leases.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(mut held) => {
                if held.get().expires_at > now {
                    return None;
                }
                held.insert(lease);
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(lease);
            }
        }
        Some(LockLease { service: self.clone(), key, token: lease.token })
    }
}

impl Drop for LockLease {
    fn drop(&mut self) {
        // A guard that lost its lease to a TTL takeover must not release the
        // new holder's lease, so only the matching token may remove the entry.
        self.service
            .leases
            .remove_if(&self.key, |_, lease| lease.token == self.token);
    }
}
