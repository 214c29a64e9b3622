//! Usage-statistics scanner: rolls `ratelimit:stats:*` counters up into the
//! relational store and reaps keys whose hour window has closed.
//!
//! Runs concurrently with the request pipeline. Because the upsert
//! overwrites rather than adds, open hours may be flushed repeatedly; a
//! closed hour is flushed one final time and its key deleted. Malformed
//! keys or values fail the whole pass: they mean the key grammar drifted
//! and must be noticed, not skipped.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{NaiveDate, Utc};
use tokio::sync::watch;

use crate::counters::SharedStore;
use crate::db::{Db, StatsRow};
use crate::error::{RatelimitError, Result};
use crate::keys::truncate_hour;
use crate::metric::Metrics;

const SCAN_INTERVAL: Duration = Duration::from_secs(10);
/// Deadline covering one full pass.
const PASS_DEADLINE: Duration = Duration::from_secs(300);
const STATS_PATTERN: &str = "ratelimit:stats:*:*:*";
const SCAN_PAGE: usize = 1000;
const KEY_BATCH: usize = 10_000;
const VALUE_BATCH: usize = 500;
const DELETE_BATCH: usize = 500;

/// A stats key split into its addressable parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedStatsKey {
    /// Hour-truncated unix timestamp.
    pub ts: i64,
    pub api_key: String,
    pub call: String,
}

/// Parse `ratelimit:stats:YYYY-MM-DD-HH:<uid|nokey>:<route>`.
pub fn parse_stats_key(key: &str) -> Result<ParsedStatsKey> {
    let parts: Vec<&str> = key.split(':').collect();
    if parts.len() != 5 {
        return Err(RatelimitError::KeyParse {
            key: key.to_string(),
            reason: format!("expected 5 segments, got {}", parts.len()),
        });
    }
    if parts[0] != "ratelimit" || parts[1] != "stats" {
        return Err(RatelimitError::KeyParse {
            key: key.to_string(),
            reason: "wrong prefix".to_string(),
        });
    }

    let ts = parse_hour_segment(parts[2]).ok_or_else(|| RatelimitError::KeyParse {
        key: key.to_string(),
        reason: format!("bad hour segment '{}'", parts[2]),
    })?;

    Ok(ParsedStatsKey {
        ts,
        api_key: parts[3].to_string(),
        call: parts[4].to_string(),
    })
}

/// Parse a `YYYY-MM-DD-HH` segment into the hour's unix timestamp.
fn parse_hour_segment(segment: &str) -> Option<i64> {
    let (date, hour) = segment.rsplit_once('-')?;
    let date = NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()?;
    let hour: u32 = hour.parse().ok()?;
    Some(date.and_hms_opt(hour, 0, 0)?.and_utc().timestamp())
}

pub struct StatsScanner {
    shared: Arc<SharedStore>,
    db: Arc<Db>,
    metrics: Arc<Metrics>,
}

impl StatsScanner {
    pub(crate) fn new(shared: Arc<SharedStore>, db: Arc<Db>, metrics: Arc<Metrics>) -> Self {
        Self {
            shared,
            db,
            metrics,
        }
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                return;
            }
            match tokio::time::timeout(PASS_DEADLINE, self.flush_once()).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => log::error!("error updating stats: {err}"),
                Err(_) => log::error!("stats pass exceeded its deadline"),
            }
            tokio::select! {
                _ = shutdown.changed() => {
                    return;
                }
                _ = tokio::time::sleep(SCAN_INTERVAL) => {}
            }
        }
    }

    /// One pass: scan, batch, read, upsert, reap closed hours.
    pub async fn flush_once(&self) -> Result<()> {
        let started = Instant::now();
        let current_hour = truncate_hour(Utc::now().timestamp());

        let all_keys = self.shared.scan_keys(STATS_PATTERN, SCAN_PAGE).await?;

        for batch in all_keys.chunks(KEY_BATCH) {
            let mut rows = Vec::with_capacity(batch.len());
            let mut keys_to_delete = Vec::new();

            for key in batch {
                let parsed = parse_stats_key(key)?;
                if parsed.ts < current_hour {
                    keys_to_delete.push(key.clone());
                }
                rows.push(StatsRow {
                    ts: parsed.ts,
                    api_key: parsed.api_key,
                    call: parsed.call,
                    count: 0,
                });
            }

            for (chunk_index, chunk) in batch.chunks(VALUE_BATCH).enumerate() {
                let values = self.shared.get_counts(chunk).await?;
                for (offset, value) in values.iter().enumerate() {
                    let key = &chunk[offset];
                    let raw = value.as_deref().ok_or_else(|| RatelimitError::ValueParse {
                        key: key.clone(),
                        value: "<missing>".to_string(),
                    })?;
                    let count = raw.parse::<i64>().map_err(|_| RatelimitError::ValueParse {
                        key: key.clone(),
                        value: raw.to_string(),
                    })?;
                    rows[chunk_index * VALUE_BATCH + offset].count = count;
                }
            }

            self.db.upsert_statistics(&rows)?;

            // Bounded by the delete list, not the scanned batch.
            for chunk in keys_to_delete.chunks(DELETE_BATCH) {
                if let Err(err) = self.shared.delete_keys(chunk).await {
                    log::error!("error deleting stats keys from shared store: {err}");
                }
            }
        }

        self.metrics.observe_task("update_stats", started.elapsed());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn parses_a_well_formed_key() {
        let parsed = parse_stats_key("ratelimit:stats:2024-05-01-13:42:/api/v1/block/{hash}").unwrap();
        assert_eq!(parsed.api_key, "42");
        assert_eq!(parsed.call, "/api/v1/block/{hash}");
        assert_eq!(
            parsed.ts,
            Utc.with_ymd_and_hms(2024, 5, 1, 13, 0, 0).unwrap().timestamp()
        );
    }

    #[test]
    fn parses_the_nokey_label() {
        let parsed = parse_stats_key("ratelimit:stats:2024-05-01-00:nokey:/api/v1/foo").unwrap();
        assert_eq!(parsed.api_key, "nokey");
    }

    #[test]
    fn wrong_segment_count_is_rejected() {
        let err = parse_stats_key("ratelimit:stats:2024-05-01-13:42").unwrap_err();
        assert!(matches!(err, RatelimitError::KeyParse { .. }));

        // A route containing a colon would shift the segments.
        let err = parse_stats_key("ratelimit:stats:2024-05-01-13:42:/api:extra").unwrap_err();
        assert!(matches!(err, RatelimitError::KeyParse { .. }));
    }

    #[test]
    fn wrong_prefix_is_rejected() {
        let err = parse_stats_key("ratelimit:hour:2024-05-01-13:default:42").unwrap_err();
        assert!(matches!(err, RatelimitError::KeyParse { .. }));
    }

    #[test]
    fn malformed_hour_segment_is_rejected() {
        assert!(parse_stats_key("ratelimit:stats:2024-13-01-13:42:/x").is_err());
        assert!(parse_stats_key("ratelimit:stats:2024-05-01-99:42:/x").is_err());
        assert!(parse_stats_key("ratelimit:stats:notadate:42:/x").is_err());
    }

    #[test]
    fn closed_hours_are_older_than_the_current_hour() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 13, 20, 0).unwrap().timestamp();
        let current_hour = truncate_hour(now);

        let open = parse_stats_key("ratelimit:stats:2024-05-01-13:42:/x").unwrap();
        let closed = parse_stats_key("ratelimit:stats:2024-05-01-12:42:/x").unwrap();
        assert!(open.ts >= current_hour);
        assert!(closed.ts < current_hour);
    }
}
