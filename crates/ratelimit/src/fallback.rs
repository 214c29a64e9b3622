//! Degraded-mode limiter used while the shared counter store is
//! unreachable. Best effort and local to this process: a token bucket per
//! caller key, with a reaper that drops buckets unseen for a few minutes.

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter as TokenBucket};
use tokio::sync::watch;

use crate::quota::{FALLBACK_RATE_LIMIT_BURST, FALLBACK_RATE_LIMIT_SECOND};

/// Entries unseen for longer than this are evicted.
const MAX_IDLE: Duration = Duration::from_secs(3 * 60);
/// Cadence of the eviction pass.
const REAP_INTERVAL: Duration = Duration::from_secs(60);

type DirectBucket = TokenBucket<NotKeyed, InMemoryState, DefaultClock>;

struct Client {
    bucket: DirectBucket,
    last_seen: Instant,
}

pub struct FallbackLimiter {
    clients: Mutex<HashMap<String, Client>>,
    quota: Quota,
    rate: u32,
}

impl Default for FallbackLimiter {
    fn default() -> Self {
        Self::new(FALLBACK_RATE_LIMIT_SECOND, FALLBACK_RATE_LIMIT_BURST)
    }
}

impl FallbackLimiter {
    pub fn new(rate: u32, burst: u32) -> Self {
        let per_second = NonZeroU32::new(rate.max(1)).expect("nonzero fallback rate");
        let burst = NonZeroU32::new(burst.max(1)).expect("nonzero fallback burst");
        Self {
            clients: Mutex::new(HashMap::new()),
            quota: Quota::per_second(per_second).allow_burst(burst),
            rate,
        }
    }

    /// The per-second rate reported to rejected callers.
    pub fn rate(&self) -> u32 {
        self.rate
    }

    /// Admit or reject one request for `caller_key`.
    pub fn check(&self, caller_key: &str) -> bool {
        let mut clients = self.clients.lock().expect("fallback clients poisoned");
        let client = clients
            .entry(caller_key.to_string())
            .or_insert_with(|| Client {
                bucket: TokenBucket::direct(self.quota),
                last_seen: Instant::now(),
            });
        client.last_seen = Instant::now();
        client.bucket.check().is_ok()
    }

    /// Evict entries unseen for longer than `max_idle`; returns the number
    /// removed.
    pub fn reap(&self, max_idle: Duration) -> usize {
        let mut clients = self.clients.lock().expect("fallback clients poisoned");
        let before = clients.len();
        clients.retain(|_, client| client.last_seen.elapsed() <= max_idle);
        before - clients.len()
    }

    /// Periodic eviction loop, run as a background service.
    pub async fn run_reaper(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                return;
            }
            tokio::select! {
                _ = shutdown.changed() => {
                    return;
                }
                _ = tokio::time::sleep(REAP_INTERVAL) => {}
            }
            let evicted = self.reap(MAX_IDLE);
            if evicted > 0 {
                log::debug!("evicted {} idle fallback limiter entries", evicted);
            }
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.clients.lock().expect("fallback clients poisoned").len()
    }
}
