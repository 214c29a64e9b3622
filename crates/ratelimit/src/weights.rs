//! Endpoint weight table: `route template -> (weight, bucket)`.
//!
//! Kept under its own lock and refreshed independently of the limit tables,
//! so a slow weights query never blocks quota refresh.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::quota::DEFAULT_BUCKET;

/// Cost and counter partition for one endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteWeight {
    pub weight: i64,
    pub bucket: String,
}

#[derive(Default)]
pub struct WeightTable {
    inner: RwLock<HashMap<String, RouteWeight>>,
}

impl WeightTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Weight and bucket for a route. Unknown routes cost 1 in the default
    /// bucket.
    pub fn lookup(&self, route: &str) -> RouteWeight {
        self.inner
            .read()
            .expect("weight table poisoned")
            .get(route)
            .cloned()
            .unwrap_or(RouteWeight {
                weight: 1,
                bucket: DEFAULT_BUCKET.to_string(),
            })
    }

    /// Atomically install a new table, returning the previous one so the
    /// refresher can log changes.
    pub fn replace(&self, next: HashMap<String, RouteWeight>) -> HashMap<String, RouteWeight> {
        let mut guard = self.inner.write().expect("weight table poisoned");
        std::mem::replace(&mut *guard, next)
    }
}
