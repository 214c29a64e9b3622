//! The per-request pipeline: derive the caller, charge the counters in one
//! pipelined round-trip, decide, and reconcile after the response.
//!
//! Infrastructure faults never turn into HTTP errors here: a failed charge
//! surfaces as an `Err` the caller logs before serving the request
//! un-metered.

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use http::{HeaderMap, Uri};
use tokio::sync::watch;

use crate::counters::{ChargePlan, RefundPlan, SharedStore};
use crate::error::Result;
use crate::fallback::FallbackLimiter;
use crate::keys::{self, RouteTable, WindowAnchors};
use crate::metric::Metrics;
use crate::quota::{RateLimit, TimeWindow};
use crate::store::LimitStore;
use crate::weights::WeightTable;

/// Deadline for the charge round-trip.
const CHARGE_DEADLINE: Duration = Duration::from_secs(1);
/// Independent deadline for post-response reconciliation.
const RECONCILE_DEADLINE: Duration = Duration::from_secs(1);

/// Everything the middleware needs to answer and later reconcile one
/// metered request.
#[derive(Debug, Clone)]
pub struct RateLimitOutcome {
    /// Reported window triple: the rejecting window, or the enforced window
    /// with the smallest remaining.
    pub limit: i64,
    pub remaining: i64,
    /// Seconds until the reported window resets.
    pub reset: i64,
    pub window: Option<TimeWindow>,
    pub rejected: bool,
    /// The caller's full quota, for the per-window headers.
    pub rate_limit: RateLimit,
    pub weight: i64,
    pub route: String,
    pub bucket: String,
    pub key: String,
    pub ip: String,
    pub user_id: i64,
    pub is_valid_key: bool,
    refund: RefundPlan,
}

/// One enforced window's post-charge state.
#[derive(Debug, Clone, Copy)]
struct WindowCharge {
    window: TimeWindow,
    limit: i64,
    value: i64,
    reset: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Decision {
    limit: i64,
    remaining: i64,
    reset: i64,
    window: Option<TimeWindow>,
    rejected: bool,
}

/// Evaluate windows in order. The first window whose post-increment value
/// exceeds its limit rejects; otherwise the window with the smallest
/// remaining is what the client gets to see.
fn decide(charges: &[WindowCharge]) -> Decision {
    let mut reported: Option<(i64, i64, i64, TimeWindow)> = None;

    for charge in charges {
        if charge.value > charge.limit {
            return Decision {
                limit: charge.limit,
                remaining: 0,
                reset: charge.reset,
                window: Some(charge.window),
                rejected: true,
            };
        }
        let remaining = charge.limit - charge.value;
        let tighter = match reported {
            None => true,
            Some((_, prev_remaining, _, _)) => remaining < prev_remaining,
        };
        if tighter {
            reported = Some((charge.limit, remaining, charge.reset, charge.window));
        }
    }

    match reported {
        Some((limit, remaining, reset, window)) => Decision {
            limit,
            remaining,
            reset,
            window: Some(window),
            rejected: false,
        },
        None => Decision {
            limit: 0,
            remaining: 0,
            reset: 0,
            window: None,
            rejected: false,
        },
    }
}

/// Build the charge for one request: an `INCRBY` per enforced window plus
/// the stats counter.
fn charge_plan(
    limit: &RateLimit,
    weight: i64,
    bucket: &str,
    id: &str,
    stats_id: &str,
    route: &str,
    anchors: &WindowAnchors,
) -> ChargePlan {
    ChargePlan {
        weight,
        second: (limit.second > 0).then(|| keys::second_key(bucket, id)),
        hour: (limit.hour > 0)
            .then(|| (keys::hour_key(anchors.now, bucket, id), anchors.hour_expire_at())),
        month: (limit.month > 0).then(|| {
            (
                keys::month_key(anchors.now, bucket, id),
                anchors.month_expire_at(),
            )
        }),
        stats: keys::stats_key(anchors.now, stats_id, route),
    }
}

/// The reversal of a charge: hour and month only. The second window
/// self-expires within a second, so refunding it is pointless and could
/// underflow the next window.
fn refund_plan(plan: &ChargePlan) -> RefundPlan {
    RefundPlan {
        weight: plan.weight,
        keys: plan.hour.iter().chain(plan.month.iter()).cloned().collect(),
        stats: plan.stats.clone(),
    }
}

/// The rate limiting engine shared by the middleware and the background
/// workers.
pub struct RateLimiter {
    store: Arc<LimitStore>,
    weights: Arc<WeightTable>,
    routes: Arc<RouteTable>,
    shared: Arc<SharedStore>,
    healthy: Arc<AtomicBool>,
    fallback: Arc<FallbackLimiter>,
    ready: watch::Receiver<bool>,
    metrics: Arc<Metrics>,
}

impl RateLimiter {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        store: Arc<LimitStore>,
        weights: Arc<WeightTable>,
        routes: Arc<RouteTable>,
        shared: Arc<SharedStore>,
        healthy: Arc<AtomicBool>,
        fallback: Arc<FallbackLimiter>,
        ready: watch::Receiver<bool>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            store,
            weights,
            routes,
            shared,
            healthy,
            fallback,
            ready,
            metrics,
        }
    }

    /// Block until every reference table has been populated at least once.
    pub async fn wait_ready(&self) {
        let mut rx = self.ready.clone();
        if !*rx.borrow() {
            let _ = rx.wait_for(|ready| *ready).await;
        }
    }

    /// Whether the shared store answered its most recent probe.
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    /// Degraded-mode admission for one caller key.
    pub fn fallback_check(&self, caller_key: &str) -> bool {
        self.fallback.check(caller_key)
    }

    /// Derive the caller key and client address without charging anything.
    pub fn caller_key(
        &self,
        headers: &HeaderMap,
        uri: &Uri,
        peer: Option<IpAddr>,
    ) -> (String, String) {
        keys::caller_key(headers, uri, peer)
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        Arc::clone(&self.metrics)
    }

    /// Charge one request against every enforced window and decide whether
    /// to admit it.
    pub async fn check(
        &self,
        headers: &HeaderMap,
        uri: &Uri,
        peer: Option<IpAddr>,
    ) -> Result<RateLimitOutcome> {
        let started = Instant::now();

        let (key, ip) = keys::caller_key(headers, uri, peer);
        let caller = self.store.resolve(&key);
        let limit = *caller.limit;

        let route = self.routes.resolve(uri.path());
        let route_weight = self.weights.lookup(&route);

        let anchors = WindowAnchors::at(Utc::now());
        let id = keys::counter_id(caller.user_id, caller.is_valid_key, &key);
        let stats_id = keys::stats_id(caller.user_id, caller.is_valid_key);

        let plan = charge_plan(
            &limit,
            route_weight.weight,
            &route_weight.bucket,
            &id,
            &stats_id,
            &route,
            &anchors,
        );

        let mut values = self.shared.charge(&plan, CHARGE_DEADLINE).await?.into_iter();
        let mut charges = Vec::with_capacity(3);
        if plan.second.is_some() {
            charges.push(WindowCharge {
                window: TimeWindow::Second,
                limit: limit.second,
                value: values.next().unwrap_or(0),
                reset: 1,
            });
        }
        if plan.hour.is_some() {
            charges.push(WindowCharge {
                window: TimeWindow::Hour,
                limit: limit.hour,
                value: values.next().unwrap_or(0),
                reset: anchors.secs_until_next_hour(),
            });
        }
        if plan.month.is_some() {
            charges.push(WindowCharge {
                window: TimeWindow::Month,
                limit: limit.month,
                value: values.next().unwrap_or(0),
                reset: anchors.secs_until_next_month(),
            });
        }

        let decision = decide(&charges);
        if decision.rejected {
            log::debug!(
                "rate limited {} on {} ({} window, reset {}s)",
                key,
                route,
                decision.window.map_or("none", |w| w.as_str()),
                decision.reset
            );
        }

        let refund = refund_plan(&plan);

        self.metrics
            .observe_task("rate_limit_request", started.elapsed());

        Ok(RateLimitOutcome {
            limit: decision.limit,
            remaining: decision.remaining,
            reset: decision.reset,
            window: decision.window,
            rejected: decision.rejected,
            rate_limit: limit,
            weight: plan.weight,
            route,
            bucket: route_weight.bucket,
            key,
            ip,
            user_id: caller.user_id,
            is_valid_key: caller.is_valid_key,
            refund,
        })
    }

    /// Undo the hour/month charges and the stats increment for a request
    /// that did not complete with a 200. The second window self-expires and
    /// is never refunded.
    pub async fn reconcile(&self, outcome: &RateLimitOutcome, status: u16) -> Result<()> {
        if status == 200 {
            return Ok(());
        }
        self.shared
            .refund(&outcome.refund, RECONCILE_DEADLINE)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn charge(window: TimeWindow, limit: i64, value: i64, reset: i64) -> WindowCharge {
        WindowCharge {
            window,
            limit,
            value,
            reset,
        }
    }

    #[test]
    fn under_quota_reports_second_window_first() {
        // nokey defaults (2, 500, 0): first request of the second.
        let decision = decide(&[
            charge(TimeWindow::Second, 2, 1, 1),
            charge(TimeWindow::Hour, 500, 1, 1800),
        ]);
        assert_eq!(decision.limit, 2);
        assert_eq!(decision.remaining, 1);
        assert_eq!(decision.reset, 1);
        assert_eq!(decision.window, Some(TimeWindow::Second));
        assert!(!decision.rejected);
    }

    #[test]
    fn exhausted_window_still_admits_at_the_boundary() {
        // Second request against (2, 500, 0): value equals the limit.
        let decision = decide(&[
            charge(TimeWindow::Second, 2, 2, 1),
            charge(TimeWindow::Hour, 500, 2, 1800),
        ]);
        assert!(!decision.rejected);
        assert_eq!(decision.remaining, 0);
        assert_eq!(decision.window, Some(TimeWindow::Second));
    }

    #[test]
    fn over_quota_rejects_with_window_reset() {
        // Third request in the same second against (2, 500, 0).
        let decision = decide(&[
            charge(TimeWindow::Second, 2, 3, 1),
            charge(TimeWindow::Hour, 500, 3, 1800),
        ]);
        assert!(decision.rejected);
        assert_eq!(decision.limit, 2);
        assert_eq!(decision.remaining, 0);
        assert_eq!(decision.reset, 1);
        assert_eq!(decision.window, Some(TimeWindow::Second));
    }

    #[test]
    fn hour_only_quota_rejects_sixth_request() {
        let decision = decide(&[charge(TimeWindow::Hour, 5, 6, 1234)]);
        assert!(decision.rejected);
        assert_eq!(decision.window, Some(TimeWindow::Hour));
        assert_eq!(decision.reset, 1234);
    }

    #[test]
    fn tightest_capped_window_is_reported() {
        // (10, 100, 1000) after one weight-1 request: the second window has
        // the smallest remaining of the three.
        let decision = decide(&[
            charge(TimeWindow::Second, 10, 1, 1),
            charge(TimeWindow::Hour, 100, 1, 1800),
            charge(TimeWindow::Month, 1000, 1, 86400),
        ]);
        assert_eq!(decision.limit, 10);
        assert_eq!(decision.remaining, 9);
        assert_eq!(decision.window, Some(TimeWindow::Second));
    }

    #[test]
    fn later_window_wins_when_tighter() {
        // A month window nearly exhausted dominates a fresh second window.
        let decision = decide(&[
            charge(TimeWindow::Second, 10, 1, 1),
            charge(TimeWindow::Month, 1000, 998, 86400),
        ]);
        assert_eq!(decision.limit, 1000);
        assert_eq!(decision.remaining, 2);
        assert_eq!(decision.window, Some(TimeWindow::Month));
    }

    #[test]
    fn earlier_window_rejects_before_later_is_considered() {
        let decision = decide(&[
            charge(TimeWindow::Second, 2, 5, 1),
            charge(TimeWindow::Hour, 100, 5, 1800),
        ]);
        assert!(decision.rejected);
        assert_eq!(decision.window, Some(TimeWindow::Second));
    }

    #[test]
    fn no_enforced_window_admits_unbounded() {
        let decision = decide(&[]);
        assert!(!decision.rejected);
        assert_eq!(decision.window, None);
        assert_eq!(decision.limit, 0);
        assert_eq!(decision.remaining, 0);
        assert_eq!(decision.reset, 0);
    }

    #[test]
    fn heavy_weight_can_reject_the_first_request() {
        // Weight 10 against a per-second limit of 5.
        let decision = decide(&[charge(TimeWindow::Second, 5, 10, 1)]);
        assert!(decision.rejected);
        assert_eq!(decision.remaining, 0);
    }

    fn anchors() -> WindowAnchors {
        use chrono::TimeZone;
        WindowAnchors::at(chrono::Utc.with_ymd_and_hms(2024, 5, 1, 13, 45, 30).unwrap())
    }

    #[test]
    fn charge_covers_only_enforced_windows() {
        let plan = charge_plan(
            &RateLimit::new(2, 500, 0),
            10,
            "heavy",
            "42",
            "42",
            "/api/v1/heavy",
            &anchors(),
        );
        assert_eq!(plan.weight, 10);
        assert_eq!(plan.second.as_deref(), Some("ratelimit:second:heavy:42"));
        let (hour_key, hour_expire) = plan.hour.clone().unwrap();
        assert_eq!(hour_key, "ratelimit:hour:2024-05-01-13:heavy:42");
        assert_eq!(hour_expire, anchors().next_hour.timestamp() + 60);
        assert!(plan.month.is_none());
        assert_eq!(plan.stats, "ratelimit:stats:2024-05-01-13:42:/api/v1/heavy");
    }

    #[test]
    fn refund_never_touches_the_second_window() {
        let plan = charge_plan(
            &RateLimit::new(2, 500, 100),
            3,
            "default",
            "7",
            "7",
            "/api/v1/foo",
            &anchors(),
        );
        let refund = refund_plan(&plan);

        assert_eq!(refund.weight, 3);
        assert_eq!(refund.stats, plan.stats);
        let keys: Vec<&str> = refund.keys.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(
            keys,
            vec![
                "ratelimit:hour:2024-05-01-13:default:7",
                "ratelimit:month:2024-05:default:7",
            ]
        );
        // Expiries ride along so a refunded key keeps its TTL.
        assert_eq!(refund.keys[0].1, anchors().hour_expire_at());
        assert_eq!(refund.keys[1].1, anchors().month_expire_at());
    }

    #[test]
    fn unlimited_quota_still_counts_stats() {
        let plan = charge_plan(
            &RateLimit::new(0, 0, 0),
            1,
            "default",
            "ip_1.2.3.4",
            "nokey",
            "/api/v1/foo",
            &anchors(),
        );
        assert!(plan.second.is_none());
        assert!(plan.hour.is_none());
        assert!(plan.month.is_none());
        assert_eq!(plan.stats, "ratelimit:stats:2024-05-01-13:nokey:/api/v1/foo");
        assert!(refund_plan(&plan).keys.is_empty());
    }
}
