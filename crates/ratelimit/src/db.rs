//! Relational store access: reference-table reads for the refreshers,
//! statistics upserts, and the operator-facing sync queries.
//!
//! Connections are opened per operation; refreshers read through read-only
//! connections while the stats writer and sync queries use writable ones.
//! All timestamps are unix seconds.

use std::path::{Path, PathBuf};
use std::time::Instant;

use rusqlite::types::Value;
use rusqlite::{Connection, OpenFlags};

use crate::error::Result;
use crate::quota::RateLimit;

/// `valid_until` sentinel for bindings without a scheduled expiry
/// (3000-01-01T00:00:00Z).
pub const FAR_FUTURE: i64 = 32_503_680_000;

/// SQLite's default bind-parameter ceiling.
const MAX_BIND_PARAMS: usize = 32_766;
/// Parameters per statistics row: ts, apikey, call, count.
const STATS_PARAMS: usize = 4;

/// One `api_keys` row relevant to a refresh pass.
#[derive(Debug, Clone)]
pub struct KeyRow {
    pub user_id: i64,
    pub api_key: String,
    pub valid_until: i64,
    pub changed_at: i64,
}

/// One `api_ratelimits` row relevant to a refresh pass.
#[derive(Debug, Clone)]
pub struct QuotaRow {
    pub user_id: i64,
    pub second: i64,
    pub hour: i64,
    pub month: i64,
    pub valid_until: i64,
    pub changed_at: i64,
}

/// One effective `api_weights` row.
#[derive(Debug, Clone)]
pub struct WeightRow {
    pub endpoint: String,
    pub weight: i64,
    pub bucket: String,
}

/// One effective `api_products` row.
#[derive(Debug, Clone)]
pub struct ApiProduct {
    pub name: String,
    pub stripe_price_id: String,
    pub second: i64,
    pub hour: i64,
    pub month: i64,
    pub valid_from: i64,
}

/// One row destined for `api_statistics`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatsRow {
    /// Hour-truncated unix timestamp.
    pub ts: i64,
    pub api_key: String,
    pub call: String,
    pub count: i64,
}

/// Handle on the relational store.
pub struct Db {
    path: PathBuf,
}

impl Db {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    fn open_read(&self) -> Result<Connection> {
        Ok(Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_ONLY,
        )?)
    }

    fn open_write(&self) -> Result<Connection> {
        Ok(Connection::open(&self.path)?)
    }

    /// Latest effective weight row per endpoint, as of `now`.
    pub fn current_weights(&self, now: i64) -> Result<Vec<WeightRow>> {
        let conn = self.open_read()?;
        let mut stmt = conn.prepare(
            "SELECT endpoint, bucket, weight, MAX(valid_from)
             FROM api_weights
             WHERE valid_from <= ?1
             GROUP BY endpoint",
        )?;
        let rows = stmt.query_map([now], |row| {
            Ok(WeightRow {
                endpoint: row.get(0)?,
                bucket: row.get(1)?,
                weight: row.get(2)?,
            })
        })?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    /// `api_keys` and `api_ratelimits` rows changed since the given
    /// watermarks or already expired, read inside one transaction so the two
    /// sets are consistent with each other.
    pub fn changed_limits(
        &self,
        keys_since: i64,
        limits_since: i64,
        now: i64,
    ) -> Result<(Vec<KeyRow>, Vec<QuotaRow>)> {
        let conn = self.open_read()?;
        let tx = conn.unchecked_transaction()?;

        let keys = {
            let mut stmt = tx.prepare(
                "SELECT user_id, api_key, valid_until, changed_at
                 FROM api_keys
                 WHERE changed_at > ?1 OR valid_until < ?2",
            )?;
            let rows = stmt.query_map([keys_since, now], |row| {
                Ok(KeyRow {
                    user_id: row.get(0)?,
                    api_key: row.get(1)?,
                    valid_until: row.get(2)?,
                    changed_at: row.get(3)?,
                })
            })?;
            rows.collect::<std::result::Result<Vec<_>, _>>()?
        };

        let quotas = {
            let mut stmt = tx.prepare(
                "SELECT user_id, second, hour, month, valid_until, changed_at
                 FROM api_ratelimits
                 WHERE changed_at > ?1 OR valid_until < ?2",
            )?;
            let rows = stmt.query_map([limits_since, now], |row| {
                Ok(QuotaRow {
                    user_id: row.get(0)?,
                    second: row.get(1)?,
                    hour: row.get(2)?,
                    month: row.get(3)?,
                    valid_until: row.get(4)?,
                    changed_at: row.get(5)?,
                })
            })?;
            rows.collect::<std::result::Result<Vec<_>, _>>()?
        };

        tx.commit()?;
        Ok((keys, quotas))
    }

    /// Latest effective product row per name, as of `now`.
    pub fn current_api_products(&self, now: i64) -> Result<Vec<ApiProduct>> {
        let conn = self.open_read()?;
        let mut stmt = conn.prepare(
            "SELECT name, stripe_price_id, second, hour, month, MAX(valid_from)
             FROM api_products
             WHERE valid_from <= ?1
             GROUP BY name",
        )?;
        let rows = stmt.query_map([now], |row| {
            Ok(ApiProduct {
                name: row.get(0)?,
                stripe_price_id: row.get(1)?,
                second: row.get(2)?,
                hour: row.get(3)?,
                month: row.get(4)?,
                valid_from: row.get(5)?,
            })
        })?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    /// The stored quota for one user, for operator inspection.
    pub fn user_api_ratelimit(&self, user_id: i64) -> Result<RateLimit> {
        let conn = self.open_read()?;
        let limit = conn.query_row(
            "SELECT second, hour, month FROM api_ratelimits WHERE user_id = ?1",
            [user_id],
            |row| Ok(RateLimit::new(row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;
        Ok(limit)
    }

    /// Upsert statistics rows, chunked so each statement stays under the
    /// bind-parameter ceiling. Conflicting rows are overwritten, not added,
    /// so re-flushing a still-open hour converges on the latest count.
    pub fn upsert_statistics(&self, rows: &[StatsRow]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut conn = self.open_write()?;
        let tx = conn.transaction()?;
        for chunk in rows.chunks(MAX_BIND_PARAMS / STATS_PARAMS) {
            let placeholders = vec!["(?, ?, ?, ?)"; chunk.len()].join(", ");
            let sql = format!(
                "INSERT INTO api_statistics (ts, apikey, call, count) VALUES {placeholders}
                 ON CONFLICT (ts, apikey, call) DO UPDATE SET count = excluded.count"
            );
            let mut values: Vec<Value> = Vec::with_capacity(chunk.len() * STATS_PARAMS);
            for row in chunk {
                values.push(Value::Integer(row.ts));
                values.push(Value::Text(row.api_key.clone()));
                values.push(Value::Text(row.call.clone()));
                values.push(Value::Integer(row.count));
            }
            tx.execute(&sql, rusqlite::params_from_iter(values))?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Materialise `api_keys` rows from `users.api_key`. Existing rows are
    /// touched only when their `valid_until` actually changes.
    pub fn update_api_keys(&self, now: i64) -> Result<usize> {
        let conn = self.open_write()?;
        let changed = conn.execute(
            "INSERT INTO api_keys (user_id, api_key, valid_until, changed_at)
             SELECT id, api_key, ?1, ?2 FROM users WHERE api_key IS NOT NULL
             ON CONFLICT (user_id, api_key) DO UPDATE SET
                 valid_until = excluded.valid_until,
                 changed_at = excluded.changed_at
             WHERE api_keys.valid_until != excluded.valid_until",
            [FAR_FUTURE, now],
        )?;
        Ok(changed)
    }

    /// Expire quota rows for users that no longer hold an API key.
    pub fn invalidate_api_keys(&self, now: i64) -> Result<usize> {
        let conn = self.open_write()?;
        let changed = conn.execute(
            "UPDATE api_ratelimits SET changed_at = ?1, valid_until = ?1
             WHERE valid_until > ?1
               AND user_id NOT IN (SELECT user_id FROM api_keys WHERE api_key IS NOT NULL)",
            [now],
        )?;
        Ok(changed)
    }

    /// Recompute each user's effective quota as the element-wise maximum of
    /// their active Stripe product and their active in-app product, both
    /// falling back to the `free` product. Rows are rewritten only when a
    /// window value changes.
    pub fn update_api_ratelimits(&self, now: i64) -> Result<usize> {
        let conn = self.open_write()?;
        let changed = conn.execute(
            "WITH current_api_products AS (
                 SELECT name, stripe_price_id, second, hour, month, MAX(valid_from) AS valid_from
                 FROM api_products
                 WHERE valid_from <= ?1
                 GROUP BY name
             )
             INSERT INTO api_ratelimits (user_id, second, hour, month, valid_until, changed_at)
             SELECT
                 u.id AS user_id,
                 MAX(COALESCE(cap1.second, 0), COALESCE(cap2.second, 0)) AS second,
                 MAX(COALESCE(cap1.hour, 0), COALESCE(cap2.hour, 0)) AS hour,
                 MAX(COALESCE(cap1.month, 0), COALESCE(cap2.month, 0)) AS month,
                 ?2 AS valid_until,
                 ?1 AS changed_at
             FROM users u
                 LEFT JOIN users_stripe_subscriptions uss
                     ON uss.customer_id = u.stripe_customer_id AND uss.active = 1
                 LEFT JOIN current_api_products cap ON cap.stripe_price_id = uss.price_id
                 LEFT JOIN current_api_products cap1 ON cap1.name = COALESCE(cap.name, 'free')
                 LEFT JOIN app_subs_view asv ON asv.user_id = u.id AND asv.active = 1
                 LEFT JOIN current_api_products cap2 ON cap2.name = COALESCE(asv.product_id, 'free')
             WHERE TRUE
             ON CONFLICT (user_id) DO UPDATE SET
                 second = excluded.second,
                 hour = excluded.hour,
                 month = excluded.month,
                 valid_until = excluded.valid_until,
                 changed_at = ?1
             WHERE api_ratelimits.second != excluded.second
                OR api_ratelimits.hour != excluded.hour
                OR api_ratelimits.month != excluded.month",
            [now, FAR_FUTURE],
        )?;
        Ok(changed)
    }

    /// Operator entry point: bring `api_keys` and `api_ratelimits` in line
    /// with the current users, subscriptions and products.
    pub fn db_update(&self, now: i64) -> Result<()> {
        let start = Instant::now();

        let keys = self.update_api_keys(now)?;
        log::info!("updated {} api_keys in {:?}", keys, start.elapsed());

        let limits = self.update_api_ratelimits(now)?;
        log::info!("updated {} api_ratelimits in {:?}", limits, start.elapsed());

        let invalidated = self.invalidate_api_keys(now)?;
        log::info!(
            "invalidated {} api_ratelimits in {:?}",
            invalidated,
            start.elapsed()
        );

        Ok(())
    }
}
