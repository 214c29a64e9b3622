//! Shared counter store client.
//!
//! Wraps one multiplexed connection behind a lock so the health prober can
//! re-establish it while request pipelines keep cloning cheap handles. Every
//! round-trip is a single-shot pipeline or command under an explicit
//! deadline; there are no long-lived transactions.

use std::future::Future;
use std::time::Duration;

use redis::aio::MultiplexedConnection;
use tokio::sync::RwLock;

use crate::error::{RatelimitError, Result};

/// Deadline for connection establishment and health pings.
const CONNECT_DEADLINE: Duration = Duration::from_secs(1);

/// A charge to apply in one pipelined round-trip. Only enforced windows
/// carry keys; expiries ride along with their counters.
#[derive(Debug, Clone)]
pub struct ChargePlan {
    pub weight: i64,
    /// Second-window key; its 1s TTL is set only on first increment.
    pub second: Option<String>,
    /// Hour-window key and its absolute expiry.
    pub hour: Option<(String, i64)>,
    /// Month-window key and its absolute expiry.
    pub month: Option<(String, i64)>,
    pub stats: String,
}

/// The refund applied when a request did not complete with a 200. The
/// second window is deliberately absent: it expires within a second and
/// refunding it could underflow the next window.
#[derive(Debug, Clone)]
pub struct RefundPlan {
    pub weight: i64,
    /// Hour/month keys with their expiries, reapplied so a refunded key
    /// never loses its TTL.
    pub keys: Vec<(String, i64)>,
    pub stats: String,
}

pub struct SharedStore {
    client: redis::Client,
    conn: RwLock<Option<MultiplexedConnection>>,
}

impl SharedStore {
    pub fn open(addr: &str) -> Result<Self> {
        let url = if addr.contains("://") {
            addr.to_string()
        } else {
            format!("redis://{addr}")
        };
        let client = redis::Client::open(url)?;
        Ok(Self {
            client,
            conn: RwLock::new(None),
        })
    }

    async fn connection(&self) -> Result<MultiplexedConnection> {
        self.conn
            .read()
            .await
            .clone()
            .ok_or(RatelimitError::SharedStoreUnavailable)
    }

    /// Establish the connection if none is held. Called by the health
    /// prober, never from the request path.
    pub async fn ensure_connected(&self) -> Result<()> {
        if self.conn.read().await.is_some() {
            return Ok(());
        }
        let conn = deadline(
            CONNECT_DEADLINE,
            self.client.get_multiplexed_tokio_connection(),
        )
        .await??;
        *self.conn.write().await = Some(conn);
        Ok(())
    }

    /// Drop the held connection so the next probe re-establishes it.
    pub async fn disconnect(&self) {
        *self.conn.write().await = None;
    }

    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.connection().await?;
        let _: String = deadline(
            CONNECT_DEADLINE,
            redis::cmd("PING").query_async(&mut conn),
        )
        .await??;
        Ok(())
    }

    /// Apply one charge and return the post-increment counter values in
    /// window order (second, hour, month; enforced windows only).
    pub async fn charge(&self, plan: &ChargePlan, timeout: Duration) -> Result<Vec<i64>> {
        let mut conn = self.connection().await?;
        let mut pipe = redis::pipe();

        if let Some(key) = &plan.second {
            pipe.incr(key, plan.weight);
            pipe.cmd("EXPIRE").arg(key).arg(1).arg("NX").ignore();
        }
        if let Some((key, expire_at)) = &plan.hour {
            pipe.incr(key, plan.weight);
            pipe.expire_at(key, *expire_at).ignore();
        }
        if let Some((key, expire_at)) = &plan.month {
            pipe.incr(key, plan.weight);
            pipe.expire_at(key, *expire_at).ignore();
        }
        pipe.incr(&plan.stats, 1).ignore();

        let values: Vec<i64> = deadline(timeout, pipe.query_async(&mut conn)).await??;
        Ok(values)
    }

    /// Reverse the hour/month charges and the stats increment.
    pub async fn refund(&self, plan: &RefundPlan, timeout: Duration) -> Result<()> {
        let mut conn = self.connection().await?;
        let mut pipe = redis::pipe();

        for (key, expire_at) in &plan.keys {
            pipe.decr(key, plan.weight).ignore();
            pipe.expire_at(key, *expire_at).ignore();
        }
        pipe.decr(&plan.stats, 1).ignore();

        deadline(timeout, pipe.query_async::<_, ()>(&mut conn)).await??;
        Ok(())
    }

    /// Collect every key matching `pattern` via cursor pagination.
    pub async fn scan_keys(&self, pattern: &str, page_size: usize) -> Result<Vec<String>> {
        let mut conn = self.connection().await?;
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, page): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(page_size)
                .query_async(&mut conn)
                .await?;
            keys.extend(page);
            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        Ok(keys)
    }

    /// Fetch counter values for a batch of keys. Keys that vanished between
    /// scan and read come back as `None`.
    pub async fn get_counts(&self, keys: &[String]) -> Result<Vec<Option<String>>> {
        let mut conn = self.connection().await?;
        let values: Vec<Option<String>> = redis::cmd("MGET")
            .arg(keys)
            .query_async(&mut conn)
            .await?;
        Ok(values)
    }

    /// Delete a batch of keys.
    pub async fn delete_keys(&self, keys: &[String]) -> Result<()> {
        let mut conn = self.connection().await?;
        let _: i64 = redis::cmd("DEL").arg(keys).query_async(&mut conn).await?;
        Ok(())
    }
}

/// Run `fut` under `limit`, mapping an elapsed deadline to the store
/// timeout error.
async fn deadline<F, T>(limit: Duration, fut: F) -> Result<std::result::Result<T, redis::RedisError>>
where
    F: Future<Output = std::result::Result<T, redis::RedisError>>,
{
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| RatelimitError::SharedStoreTimeout)
}
