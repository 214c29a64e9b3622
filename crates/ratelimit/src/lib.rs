//! Per-user, multi-window rate limiting for a public HTTP API.
//!
//! The engine charges every metered request against per-second, per-hour and
//! per-month counters in a shared (Redis-compatible) store, annotates
//! responses with quota headers, refunds failed requests, and rolls usage
//! statistics up into a relational store. Reference tables (API keys, user
//! quotas, endpoint weights) live in memory and are refreshed in the
//! background from the relational store.
//!
//! [`init`] wires everything up and hands back the request-facing
//! [`RateLimiter`] plus the [`Workers`] the host must run: the two table
//! refreshers, the health prober, the stats scanner and the fallback-limiter
//! reaper. The limiter blocks metered traffic until every table has been
//! populated once.

mod counters;
mod db;
mod error;
mod fallback;
mod keys;
mod metric;
mod pipeline;
mod quota;
mod refresh;
mod stats;
mod store;
mod weights;

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

pub use counters::SharedStore;
pub use db::{Db, StatsRow, FAR_FUTURE};
pub use error::{RatelimitError, Result};
pub use fallback::FallbackLimiter;
pub use keys::RouteTable;
pub use metric::{Metrics, TaskStat};
pub use pipeline::{RateLimitOutcome, RateLimiter};
pub use quota::{
    RateLimit, TimeWindow, FALLBACK_RATE_LIMIT_BURST, FALLBACK_RATE_LIMIT_SECOND,
    HEADER_RATE_LIMIT_LIMIT, HEADER_RATE_LIMIT_LIMIT_HOUR,
    HEADER_RATE_LIMIT_LIMIT_MONTH, HEADER_RATE_LIMIT_LIMIT_SECOND, HEADER_RATE_LIMIT_REMAINING,
    HEADER_RATE_LIMIT_RESET, HEADER_RETRY_AFTER,
};
pub use refresh::{HealthProber, InitLatch, LimitsRefresher, WeightsRefresher};
pub use stats::StatsScanner;
pub use store::LimitStore;
pub use weights::WeightTable;

/// Construction parameters for [`init`].
#[derive(Debug, Clone)]
pub struct Options {
    /// Address of the shared counter store, with or without a scheme.
    pub shared_store_addr: String,
    /// Path of the relational database file.
    pub database_path: PathBuf,
    /// Route templates the gateway fronts, in `{param}` syntax.
    pub routes: Vec<String>,
}

/// The background workers the host must run alongside the limiter.
pub struct Workers {
    pub weights: Arc<WeightsRefresher>,
    pub limits: Arc<LimitsRefresher>,
    pub health: Arc<HealthProber>,
    pub stats: Arc<StatsScanner>,
    /// Shared with the limiter; the host runs its reaper loop.
    pub fallback: Arc<FallbackLimiter>,
}

/// Wire up the limiter and its workers. Metered traffic is held until the
/// weights table, the limit tables and the health flag have each been
/// populated once.
pub fn init(options: Options) -> Result<(Arc<RateLimiter>, Workers)> {
    let shared = Arc::new(SharedStore::open(&options.shared_store_addr)?);
    let db = Arc::new(Db::new(&options.database_path));
    let store = Arc::new(LimitStore::new());
    let weights = Arc::new(WeightTable::new());
    let routes = Arc::new(RouteTable::new(&options.routes)?);
    let fallback = Arc::new(FallbackLimiter::default());
    let metrics = Arc::new(Metrics::new());
    let healthy = Arc::new(AtomicBool::new(false));

    let (latch, ready) = InitLatch::new(3);

    let workers = Workers {
        weights: Arc::new(WeightsRefresher::new(
            Arc::clone(&db),
            Arc::clone(&weights),
            Arc::clone(&metrics),
            Arc::clone(&latch),
        )),
        limits: Arc::new(LimitsRefresher::new(
            Arc::clone(&db),
            Arc::clone(&store),
            Arc::clone(&metrics),
            Arc::clone(&latch),
        )),
        health: Arc::new(HealthProber::new(
            Arc::clone(&shared),
            Arc::clone(&healthy),
            latch,
            Arc::clone(&metrics),
        )),
        stats: Arc::new(StatsScanner::new(
            Arc::clone(&shared),
            Arc::clone(&db),
            Arc::clone(&metrics),
        )),
        fallback: Arc::clone(&fallback),
    };

    let limiter = Arc::new(RateLimiter::new(
        store, weights, routes, shared, healthy, fallback, ready, metrics,
    ));

    Ok((limiter, workers))
}
