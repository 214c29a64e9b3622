//! Background refreshers for the reference tables plus the shared-store
//! health prober.
//!
//! Each worker is an infinite loop with its own cadence. A failed pass is
//! logged and retried after a short backoff without touching the tables or
//! advancing any watermark. The initial-population latch releases the
//! middleware once every table has loaded at least once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::watch;

use crate::counters::SharedStore;
use crate::db::Db;
use crate::error::Result;
use crate::keys::sanitize_bucket;
use crate::metric::Metrics;
use crate::store::LimitStore;
use crate::weights::{RouteWeight, WeightTable};

const REFRESH_INTERVAL: Duration = Duration::from_secs(10);
const RETRY_INTERVAL: Duration = Duration::from_secs(2);
const PROBE_INTERVAL: Duration = Duration::from_secs(1);

/// Count-down latch released once every refresher has populated its table.
pub struct InitLatch {
    remaining: AtomicUsize,
    tx: watch::Sender<bool>,
}

impl InitLatch {
    pub fn new(parts: usize) -> (Arc<Self>, watch::Receiver<bool>) {
        let (tx, rx) = watch::channel(parts == 0);
        (
            Arc::new(Self {
                remaining: AtomicUsize::new(parts),
                tx,
            }),
            rx,
        )
    }

    /// Mark one part as populated. Called at most once per worker.
    pub fn ready(&self) {
        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            let _ = self.tx.send(true);
        }
    }
}

/// Replaces the weights table from `api_weights` every ten seconds.
pub struct WeightsRefresher {
    db: Arc<Db>,
    weights: Arc<WeightTable>,
    metrics: Arc<Metrics>,
    latch: Arc<InitLatch>,
}

impl WeightsRefresher {
    pub(crate) fn new(
        db: Arc<Db>,
        weights: Arc<WeightTable>,
        metrics: Arc<Metrics>,
        latch: Arc<InitLatch>,
    ) -> Self {
        Self {
            db,
            weights,
            metrics,
            latch,
        }
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut first_run = true;
        loop {
            if *shutdown.borrow() {
                return;
            }
            let wait = match self.refresh(first_run) {
                Ok(()) => {
                    if first_run {
                        self.latch.ready();
                        first_run = false;
                    }
                    REFRESH_INTERVAL
                }
                Err(err) => {
                    log::error!("error updating weights: {err}");
                    RETRY_INTERVAL
                }
            };
            tokio::select! {
                _ = shutdown.changed() => {
                    return;
                }
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    pub fn refresh(&self, first_run: bool) -> Result<()> {
        let started = Instant::now();
        let now = Utc::now().timestamp();

        let rows = self.db.current_weights(now)?;
        let mut next = HashMap::with_capacity(rows.len());
        for row in rows {
            next.insert(
                row.endpoint,
                RouteWeight {
                    weight: row.weight,
                    bucket: sanitize_bucket(&row.bucket),
                },
            );
        }

        let old = self.weights.replace(next.clone());
        if !first_run {
            for (endpoint, rw) in &next {
                let previous = old.get(endpoint);
                if previous.map(|p| p.weight) != Some(rw.weight) {
                    log::info!(
                        "weight changed for {}: {} -> {}",
                        endpoint,
                        previous.map_or(1, |p| p.weight),
                        rw.weight
                    );
                }
                if previous.map(|p| p.bucket.as_str()) != Some(rw.bucket.as_str()) {
                    log::info!(
                        "bucket changed for {}: {} -> {}",
                        endpoint,
                        previous.map_or("default", |p| p.bucket.as_str()),
                        rw.bucket
                    );
                }
            }
        }

        self.metrics.observe_task("update_weights", started.elapsed());
        Ok(())
    }
}

/// Pulls changed or expired key and quota rows into the reference tables,
/// advancing the two changed-at watermarks on success.
pub struct LimitsRefresher {
    db: Arc<Db>,
    store: Arc<LimitStore>,
    metrics: Arc<Metrics>,
    latch: Arc<InitLatch>,
    /// `(keys, limits)` watermarks, guarded together.
    cursors: Mutex<(i64, i64)>,
}

impl LimitsRefresher {
    pub(crate) fn new(
        db: Arc<Db>,
        store: Arc<LimitStore>,
        metrics: Arc<Metrics>,
        latch: Arc<InitLatch>,
    ) -> Self {
        Self {
            db,
            store,
            metrics,
            latch,
            cursors: Mutex::new((0, 0)),
        }
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut first_run = true;
        loop {
            if *shutdown.borrow() {
                return;
            }
            let wait = match self.refresh() {
                Ok(()) => {
                    if first_run {
                        self.latch.ready();
                        first_run = false;
                    }
                    REFRESH_INTERVAL
                }
                Err(err) => {
                    log::error!("error updating rate limits: {err}");
                    RETRY_INTERVAL
                }
            };
            tokio::select! {
                _ = shutdown.changed() => {
                    return;
                }
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    pub fn refresh(&self) -> Result<()> {
        let started = Instant::now();
        let now = Utc::now().timestamp();

        let (keys_since, limits_since) = *self.cursors.lock().expect("cursors poisoned");

        let (keys, quotas) = self.db.changed_limits(keys_since, limits_since, now)?;
        let products = self.db.current_api_products(now)?;

        self.store.apply_refresh(now, &products, &keys, &quotas);

        let max_keys = keys
            .iter()
            .map(|row| row.changed_at)
            .max()
            .map_or(keys_since, |seen| seen.max(keys_since));
        let max_limits = quotas
            .iter()
            .map(|row| row.changed_at)
            .max()
            .map_or(limits_since, |seen| seen.max(limits_since));
        *self.cursors.lock().expect("cursors poisoned") = (max_keys, max_limits);

        if !keys.is_empty() || !quotas.is_empty() {
            log::debug!(
                "applied {} key rows and {} quota rows, {} keys active",
                keys.len(),
                quotas.len(),
                self.store.key_count()
            );
        }

        self.metrics
            .observe_task("update_ratelimits", started.elapsed());
        Ok(())
    }

    #[cfg(test)]
    fn watermarks(&self) -> (i64, i64) {
        *self.cursors.lock().expect("cursors poisoned")
    }
}

/// Pings the shared store every second and publishes the result.
pub struct HealthProber {
    shared: Arc<SharedStore>,
    healthy: Arc<AtomicBool>,
    latch: Arc<InitLatch>,
    metrics: Arc<Metrics>,
}

impl HealthProber {
    pub(crate) fn new(
        shared: Arc<SharedStore>,
        healthy: Arc<AtomicBool>,
        latch: Arc<InitLatch>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            shared,
            healthy,
            latch,
            metrics,
        }
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut first_run = true;
        loop {
            if *shutdown.borrow() {
                return;
            }
            self.probe().await;
            if first_run {
                self.latch.ready();
                first_run = false;
            }
            tokio::select! {
                _ = shutdown.changed() => {
                    return;
                }
                _ = tokio::time::sleep(PROBE_INTERVAL) => {}
            }
        }
    }

    /// One probe: connect if needed, ping, publish the transition.
    pub async fn probe(&self) {
        let started = Instant::now();
        let old_status = self.healthy.load(Ordering::Relaxed);

        let result = async {
            self.shared.ensure_connected().await?;
            self.shared.ping().await
        }
        .await;

        let new_status = match result {
            Ok(()) => true,
            Err(err) => {
                log::error!("error pinging shared store: {err}");
                self.shared.disconnect().await;
                false
            }
        };

        if old_status != new_status {
            log::info!("shared store status changed: {old_status} -> {new_status}");
        }
        self.healthy.store(new_status, Ordering::Relaxed);
        self.metrics.observe_task("update_health", started.elapsed());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::create_schema;
    use crate::db::FAR_FUTURE;
    use rusqlite::Connection;
    use tempfile::NamedTempFile;

    fn fixture() -> (NamedTempFile, Arc<Db>) {
        let file = NamedTempFile::new().unwrap();
        let conn = Connection::open(file.path()).unwrap();
        create_schema(&conn);
        let db = Arc::new(Db::new(file.path()));
        (file, db)
    }

    fn new_latch() -> Arc<InitLatch> {
        InitLatch::new(1).0
    }

    #[test]
    fn latch_releases_after_all_parts() {
        let (latch, rx) = InitLatch::new(2);
        assert!(!*rx.borrow());
        latch.ready();
        assert!(!*rx.borrow());
        latch.ready();
        assert!(*rx.borrow());
    }

    #[test]
    fn weights_refresh_installs_sanitised_buckets() {
        let (file, db) = fixture();
        let conn = Connection::open(file.path()).unwrap();
        conn.execute_batch(
            "INSERT INTO api_weights VALUES ('/api/v1/heavy', 'big:jobs', 10, 0);
             INSERT INTO api_weights VALUES ('/api/v1/light', '', 1, 0);",
        )
        .unwrap();

        let weights = Arc::new(WeightTable::new());
        let refresher = WeightsRefresher::new(
            db,
            weights.clone(),
            Arc::new(Metrics::new()),
            new_latch(),
        );
        refresher.refresh(true).unwrap();

        let heavy = weights.lookup("/api/v1/heavy");
        assert_eq!(heavy.weight, 10);
        assert_eq!(heavy.bucket, "big_jobs");
        assert_eq!(weights.lookup("/api/v1/light").bucket, "default");
    }

    #[test]
    fn limits_refresh_is_incremental_and_advances_watermarks() {
        let (file, db) = fixture();
        let conn = Connection::open(file.path()).unwrap();
        conn.execute_batch(&format!(
            "INSERT INTO api_keys VALUES (1, 'key-1', {FAR_FUTURE}, 100);
             INSERT INTO api_ratelimits VALUES (1, 10, 100, 0, {FAR_FUTURE}, 150);"
        ))
        .unwrap();

        let store = Arc::new(LimitStore::new());
        let refresher = LimitsRefresher::new(
            db,
            store.clone(),
            Arc::new(Metrics::new()),
            new_latch(),
        );
        refresher.refresh().unwrap();

        assert!(store.resolve("key-1").is_valid_key);
        assert_eq!(*store.resolve("key-1").limit, crate::quota::RateLimit::new(10, 100, 0));
        assert_eq!(refresher.watermarks(), (100, 150));

        // A later row is picked up by the next pass; the old one is not
        // re-read.
        conn.execute_batch(&format!(
            "INSERT INTO api_keys VALUES (2, 'key-2', {FAR_FUTURE}, 500);"
        ))
        .unwrap();
        refresher.refresh().unwrap();
        assert!(store.resolve("key-2").is_valid_key);
        assert_eq!(refresher.watermarks(), (500, 150));
    }

    #[test]
    fn limits_refresh_observes_expired_rows() {
        let (file, db) = fixture();
        let conn = Connection::open(file.path()).unwrap();
        conn.execute_batch(&format!(
            "INSERT INTO api_keys VALUES (1, 'key-1', {FAR_FUTURE}, 100);"
        ))
        .unwrap();

        let store = Arc::new(LimitStore::new());
        let refresher = LimitsRefresher::new(
            db,
            store.clone(),
            Arc::new(Metrics::new()),
            new_latch(),
        );
        refresher.refresh().unwrap();
        assert!(store.resolve("key-1").is_valid_key);

        // Expire the binding; the next pass matches it through the
        // valid_until filter even though its changed_at is old.
        let past = Utc::now().timestamp() - 10;
        conn.execute(
            "UPDATE api_keys SET valid_until = ?1 WHERE user_id = 1",
            [past],
        )
        .unwrap();
        refresher.refresh().unwrap();
        assert!(!store.resolve("key-1").is_valid_key);
    }

    #[test]
    fn limits_refresh_applies_reserved_products() {
        let (file, db) = fixture();
        let conn = Connection::open(file.path()).unwrap();
        conn.execute_batch(
            "INSERT INTO api_products VALUES ('nokey', '', 4, 800, 0, 0);
             INSERT INTO api_products VALUES ('free', '', 6, 1200, 0, 0);",
        )
        .unwrap();

        let store = Arc::new(LimitStore::new());
        let refresher = LimitsRefresher::new(
            db,
            store.clone(),
            Arc::new(Metrics::new()),
            new_latch(),
        );
        refresher.refresh().unwrap();

        assert_eq!(*store.no_key_quota(), crate::quota::RateLimit::new(4, 800, 0));
        assert_eq!(*store.free_quota(), crate::quota::RateLimit::new(6, 1200, 0));
    }

    #[test]
    fn failed_refresh_does_not_advance_watermarks() {
        // Point at a database that does not exist.
        let db = Arc::new(Db::new("/nonexistent/refresh.db"));
        let store = Arc::new(LimitStore::new());
        let refresher = LimitsRefresher::new(
            db,
            store,
            Arc::new(Metrics::new()),
            new_latch(),
        );
        assert!(refresher.refresh().is_err());
        assert_eq!(refresher.watermarks(), (0, 0));
    }

    #[tokio::test]
    async fn probe_against_dead_store_reports_unhealthy() {
        let shared = Arc::new(SharedStore::open("127.0.0.1:1").unwrap());
        let healthy = Arc::new(AtomicBool::new(true));
        let prober = HealthProber::new(
            shared,
            healthy.clone(),
            new_latch(),
            Arc::new(Metrics::new()),
        );
        prober.probe().await;
        assert!(!healthy.load(Ordering::Relaxed));
    }
}
