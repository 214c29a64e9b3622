//! In-memory reference tables: API key bindings, per-user quotas and the
//! quota interning map, all behind a single readers-writer lock.
//!
//! Readers take short read-lock passes per request; the limits refresher is
//! the only writer and applies each refresh as one delta under the write
//! lock. Quotas are interned so the many users sharing one product share one
//! allocation; readers treat them as immutable.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::db::{ApiProduct, KeyRow, QuotaRow};
use crate::quota::{RateLimit, PRODUCT_FREE, PRODUCT_NOKEY};

/// Quota resolution for one request.
#[derive(Debug, Clone)]
pub struct CallerQuota {
    /// `-1` when no valid key was presented.
    pub user_id: i64,
    pub is_valid_key: bool,
    pub limit: Arc<RateLimit>,
}

struct Tables {
    user_by_key: HashMap<String, i64>,
    quota_by_user: HashMap<i64, Arc<RateLimit>>,
    interned: HashMap<String, Arc<RateLimit>>,
    /// Quota for callers without a key.
    nokey: Arc<RateLimit>,
    /// Quota for valid keys without an explicit `api_ratelimits` row. A
    /// separate allocation from `nokey`, so product rows can diverge them.
    free: Arc<RateLimit>,
}

pub struct LimitStore {
    inner: RwLock<Tables>,
}

impl Default for LimitStore {
    fn default() -> Self {
        Self::new()
    }
}

impl LimitStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Tables {
                user_by_key: HashMap::new(),
                quota_by_user: HashMap::new(),
                interned: HashMap::new(),
                nokey: Arc::new(RateLimit::default_nokey()),
                free: Arc::new(RateLimit::default_nokey()),
            }),
        }
    }

    /// Resolve the caller for one request in a single read-lock pass.
    pub fn resolve(&self, api_key: &str) -> CallerQuota {
        let tables = self.inner.read().expect("limit store poisoned");
        match tables.user_by_key.get(api_key) {
            None => CallerQuota {
                user_id: -1,
                is_valid_key: false,
                limit: Arc::clone(&tables.nokey),
            },
            Some(&user_id) => CallerQuota {
                user_id,
                is_valid_key: true,
                limit: tables
                    .quota_by_user
                    .get(&user_id)
                    .cloned()
                    .unwrap_or_else(|| Arc::clone(&tables.free)),
            },
        }
    }

    /// The quota applied to callers without a key.
    pub fn no_key_quota(&self) -> Arc<RateLimit> {
        Arc::clone(&self.inner.read().expect("limit store poisoned").nokey)
    }

    /// The quota applied to valid keys without an explicit quota row.
    pub fn free_quota(&self) -> Arc<RateLimit> {
        Arc::clone(&self.inner.read().expect("limit store poisoned").free)
    }

    /// Apply one refresh delta: update the reserved product quotas, evict
    /// expired bindings and install changed ones through the interning map.
    pub fn apply_refresh(
        &self,
        now: i64,
        products: &[ApiProduct],
        keys: &[KeyRow],
        quotas: &[QuotaRow],
    ) {
        let mut tables = self.inner.write().expect("limit store poisoned");

        for product in products {
            let limit = RateLimit::new(product.second, product.hour, product.month);
            if product.name == PRODUCT_NOKEY {
                tables.nokey = Arc::new(limit);
            }
            if product.name == PRODUCT_FREE {
                tables.free = Arc::new(limit);
            }
        }

        for key in keys {
            if key.valid_until < now {
                tables.user_by_key.remove(&key.api_key);
            } else {
                tables.user_by_key.insert(key.api_key.clone(), key.user_id);
            }
        }

        for quota in quotas {
            if quota.valid_until < now {
                tables.quota_by_user.remove(&quota.user_id);
                continue;
            }
            let limit = RateLimit::new(quota.second, quota.hour, quota.month);
            let interned = tables
                .interned
                .entry(limit.intern_key())
                .or_insert_with(|| Arc::new(limit))
                .clone();
            tables.quota_by_user.insert(quota.user_id, interned);
        }
    }

    /// Number of active key bindings, for refresh logging.
    pub fn key_count(&self) -> usize {
        self.inner
            .read()
            .expect("limit store poisoned")
            .user_by_key
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::FAR_FUTURE;

    fn key_row(user_id: i64, api_key: &str, valid_until: i64) -> KeyRow {
        KeyRow {
            user_id,
            api_key: api_key.to_string(),
            valid_until,
            changed_at: 1,
        }
    }

    fn quota_row(user_id: i64, second: i64, hour: i64, month: i64, valid_until: i64) -> QuotaRow {
        QuotaRow {
            user_id,
            second,
            hour,
            month,
            valid_until,
            changed_at: 1,
        }
    }

    fn product(name: &str, second: i64, hour: i64, month: i64) -> ApiProduct {
        ApiProduct {
            name: name.to_string(),
            stripe_price_id: String::new(),
            second,
            hour,
            month,
            valid_from: 0,
        }
    }

    #[test]
    fn unknown_key_resolves_to_nokey_quota() {
        let store = LimitStore::new();
        let caller = store.resolve("missing");
        assert_eq!(caller.user_id, -1);
        assert!(!caller.is_valid_key);
        assert_eq!(*caller.limit, RateLimit::default_nokey());
    }

    #[test]
    fn known_key_without_quota_resolves_to_free() {
        let store = LimitStore::new();
        store.apply_refresh(
            100,
            &[product("free", 7, 70, 700)],
            &[key_row(42, "abc", FAR_FUTURE)],
            &[],
        );

        let caller = store.resolve("abc");
        assert_eq!(caller.user_id, 42);
        assert!(caller.is_valid_key);
        assert_eq!(*caller.limit, RateLimit::new(7, 70, 700));
    }

    #[test]
    fn explicit_quota_wins_over_free() {
        let store = LimitStore::new();
        store.apply_refresh(
            100,
            &[],
            &[key_row(42, "abc", FAR_FUTURE)],
            &[quota_row(42, 10, 100, 1000, FAR_FUTURE)],
        );

        let caller = store.resolve("abc");
        assert_eq!(*caller.limit, RateLimit::new(10, 100, 1000));
    }

    #[test]
    fn equal_quotas_share_one_allocation() {
        let store = LimitStore::new();
        store.apply_refresh(
            100,
            &[],
            &[key_row(1, "a", FAR_FUTURE), key_row(2, "b", FAR_FUTURE)],
            &[
                quota_row(1, 10, 100, 0, FAR_FUTURE),
                quota_row(2, 10, 100, 0, FAR_FUTURE),
            ],
        );

        let a = store.resolve("a");
        let b = store.resolve("b");
        assert!(Arc::ptr_eq(&a.limit, &b.limit));
    }

    #[test]
    fn expired_bindings_are_evicted() {
        let store = LimitStore::new();
        store.apply_refresh(
            100,
            &[],
            &[key_row(1, "a", FAR_FUTURE)],
            &[quota_row(1, 10, 100, 0, FAR_FUTURE)],
        );
        assert!(store.resolve("a").is_valid_key);
        assert_eq!(store.key_count(), 1);

        // The refresher re-reads expired rows so they can be observed here.
        store.apply_refresh(
            200,
            &[],
            &[key_row(1, "a", 150)],
            &[quota_row(1, 10, 100, 0, 150)],
        );
        let caller = store.resolve("a");
        assert!(!caller.is_valid_key);
        assert_eq!(caller.user_id, -1);
        assert_eq!(store.key_count(), 0);
    }

    #[test]
    fn reserved_products_stay_distinct() {
        let store = LimitStore::new();
        store.apply_refresh(
            100,
            &[product("nokey", 2, 500, 0), product("free", 5, 1000, 0)],
            &[],
            &[],
        );

        assert_eq!(*store.no_key_quota(), RateLimit::new(2, 500, 0));
        assert_eq!(*store.free_quota(), RateLimit::new(5, 1000, 0));
    }

    #[test]
    fn failed_refresh_leaves_previous_snapshot_usable() {
        let store = LimitStore::new();
        store.apply_refresh(100, &[], &[key_row(1, "a", FAR_FUTURE)], &[]);

        // An empty delta (as after a relational error is skipped) changes
        // nothing.
        store.apply_refresh(200, &[], &[], &[]);
        assert!(store.resolve("a").is_valid_key);
    }
}
