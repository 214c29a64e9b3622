//! Caller identification, route resolution and the counter-key grammar.
//!
//! Counter keys are colon-delimited and case-sensitive; every time segment
//! is UTC and zero-padded. Bucket names have colons replaced so they can
//! never break the delimiter grammar.

use std::net::IpAddr;

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use http::{HeaderMap, Uri};

use crate::error::{RatelimitError, Result};
use crate::quota::DEFAULT_BUCKET;

pub const HEADER_API_KEY: &str = "X-API-KEY";
pub const HEADER_CF_CONNECTING_IP: &str = "CF-Connecting-IP";
pub const HEADER_X_FORWARDED_FOR: &str = "X-Forwarded-For";

/// Route reported when the request path matches no known template.
pub const ROUTE_UNDEFINED: &str = "UNDEFINED";
/// Client address reported when no usable peer address exists.
pub const IP_INVALID: &str = "INVALID";

/// Maps concrete request paths to their `{param}` route templates.
pub struct RouteTable {
    router: matchit::Router<String>,
}

impl RouteTable {
    pub fn new<I, S>(templates: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut router = matchit::Router::new();
        for template in templates {
            let template = template.as_ref();
            router
                .insert(template, template.to_string())
                .map_err(|_| RatelimitError::RouteTemplate {
                    template: template.to_string(),
                })?;
        }
        Ok(Self { router })
    }

    /// The template for a concrete path, or [`ROUTE_UNDEFINED`].
    pub fn resolve(&self, path: &str) -> String {
        self.router
            .at(path)
            .map(|m| m.value.clone())
            .unwrap_or_else(|_| ROUTE_UNDEFINED.to_string())
    }
}

/// The key a request is counted under, in order of preference: the `apikey`
/// query parameter, the `X-API-KEY` header, or a synthetic per-address key.
/// Returns `(key, ip)`.
pub fn caller_key(headers: &HeaderMap, uri: &Uri, peer: Option<IpAddr>) -> (String, String) {
    let ip = client_ip(headers, peer);

    if let Some(key) = uri
        .query()
        .and_then(|q| q.split('&').find_map(|kv| kv.strip_prefix("apikey=")))
        .filter(|k| !k.is_empty())
    {
        return (key.to_string(), ip);
    }

    if let Some(key) = headers
        .get(HEADER_API_KEY)
        .and_then(|v| v.to_str().ok())
        .filter(|k| !k.is_empty())
    {
        return (key.to_string(), ip);
    }

    let key = format!("ip_{}", ip.replace(':', "_"));
    (key, ip)
}

/// Client address, preferring `CF-Connecting-IP`, then the last entry of
/// `X-Forwarded-For` (the proxy chain prepends client-supplied values), then
/// the socket peer.
pub fn client_ip(headers: &HeaderMap, peer: Option<IpAddr>) -> String {
    let forwarded = headers
        .get(HEADER_CF_CONNECTING_IP)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .or_else(|| {
            headers
                .get(HEADER_X_FORWARDED_FOR)
                .and_then(|v| v.to_str().ok())
        })
        .unwrap_or("");

    if let Some(last) = forwarded.split(',').next_back() {
        if let Ok(ip) = last.trim().parse::<IpAddr>() {
            return ip.to_string();
        }
    }

    match peer {
        Some(ip) => {
            let ip = ip.to_string();
            if ip == "::1" {
                "127.0.0.1".to_string()
            } else {
                ip
            }
        }
        None => IP_INVALID.to_string(),
    }
}

/// The identity counters are charged under: the user id for a valid key,
/// otherwise the synthetic per-address caller key.
pub fn counter_id(user_id: i64, is_valid_key: bool, caller_key: &str) -> String {
    if is_valid_key {
        user_id.to_string()
    } else {
        caller_key.to_string()
    }
}

/// The identity stats are recorded under: the user id or the literal
/// `nokey`.
pub fn stats_id(user_id: i64, is_valid_key: bool) -> String {
    if is_valid_key {
        user_id.to_string()
    } else {
        "nokey".to_string()
    }
}

/// Replace delimiter characters in a bucket name; empty names fall back to
/// the default bucket.
pub fn sanitize_bucket(raw: &str) -> String {
    if raw.is_empty() {
        DEFAULT_BUCKET.to_string()
    } else {
        raw.replace(':', "_")
    }
}

pub fn second_key(bucket: &str, id: &str) -> String {
    format!("ratelimit:second:{bucket}:{id}")
}

pub fn hour_key(now: DateTime<Utc>, bucket: &str, id: &str) -> String {
    format!("ratelimit:hour:{}:{bucket}:{id}", now.format("%Y-%m-%d-%H"))
}

pub fn month_key(now: DateTime<Utc>, bucket: &str, id: &str) -> String {
    format!("ratelimit:month:{}:{bucket}:{id}", now.format("%Y-%m"))
}

pub fn stats_key(now: DateTime<Utc>, stats_id: &str, route: &str) -> String {
    format!(
        "ratelimit:stats:{}:{stats_id}:{route}",
        now.format("%Y-%m-%d-%H")
    )
}

/// UTC window boundaries for one request.
#[derive(Debug, Clone, Copy)]
pub struct WindowAnchors {
    pub now: DateTime<Utc>,
    pub next_hour: DateTime<Utc>,
    pub next_month: DateTime<Utc>,
}

impl WindowAnchors {
    pub fn at(now: DateTime<Utc>) -> Self {
        let ts = now.timestamp();
        let next_hour_ts = ts - ts.rem_euclid(3600) + 3600;
        let next_hour = DateTime::from_timestamp(next_hour_ts, 0).unwrap_or(now);

        let (year, month) = if now.month() == 12 {
            (now.year() + 1, 1)
        } else {
            (now.year(), now.month() + 1)
        };
        let next_month = NaiveDate::from_ymd_opt(year, month, 1)
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|dt| dt.and_utc())
            .unwrap_or(now);

        Self {
            now,
            next_hour,
            next_month,
        }
    }

    pub fn secs_until_next_hour(&self) -> i64 {
        (self.next_hour - self.now).num_seconds()
    }

    pub fn secs_until_next_month(&self) -> i64 {
        (self.next_month - self.now).num_seconds()
    }

    /// Counter expiry for the hour window; the margin absorbs clock skew
    /// between nodes.
    pub fn hour_expire_at(&self) -> i64 {
        self.next_hour.timestamp() + 60
    }

    pub fn month_expire_at(&self) -> i64 {
        self.next_month.timestamp() + 60
    }
}

/// Hour-truncated unix timestamp.
pub fn truncate_hour(ts: i64) -> i64 {
    ts - ts.rem_euclid(3600)
}
