//! In-memory metrics for background tasks and metered responses.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

/// Aggregated duration observations for one named task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskStat {
    pub count: u64,
    pub total: Duration,
    pub max: Duration,
}

/// Labeled task timers plus per-caller status counts.
#[derive(Default)]
pub struct Metrics {
    tasks: Mutex<HashMap<String, TaskStat>>,
    statuses: Mutex<HashMap<String, HashMap<u16, u64>>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one pass of a named background task or pipeline stage.
    pub fn observe_task(&self, name: &str, elapsed: Duration) {
        let mut guard = self.tasks.lock().expect("metrics task store poisoned");
        let stat = guard.entry(name.to_string()).or_default();
        stat.count += 1;
        stat.total += elapsed;
        if elapsed > stat.max {
            stat.max = elapsed;
        }
    }

    /// Record the final status code of a metered request.
    pub fn record_status(&self, caller_key: &str, status: u16) {
        let mut guard = self.statuses.lock().expect("metrics status store poisoned");
        let per_key = guard.entry(caller_key.to_string()).or_default();
        *per_key.entry(status).or_insert(0) += 1;
    }

    /// Snapshot the stats for one task. Returns `None` for unknown tasks.
    pub fn task(&self, name: &str) -> Option<TaskStat> {
        self.tasks
            .lock()
            .expect("metrics task store poisoned")
            .get(name)
            .copied()
    }

    /// Snapshot status counts for a caller key. Empty when the key is unknown.
    pub fn statuses(&self, caller_key: &str) -> HashMap<u16, u64> {
        self.statuses
            .lock()
            .expect("metrics status store poisoned")
            .get(caller_key)
            .cloned()
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn observe_task_accumulates_and_tracks_max() {
        let metrics = Metrics::new();
        metrics.observe_task("refresh", Duration::from_millis(10));
        metrics.observe_task("refresh", Duration::from_millis(30));
        metrics.observe_task("refresh", Duration::from_millis(20));

        let stat = metrics.task("refresh").unwrap();
        assert_eq!(stat.count, 3);
        assert_eq!(stat.total, Duration::from_millis(60));
        assert_eq!(stat.max, Duration::from_millis(30));
    }

    #[test]
    fn record_status_counts_per_key() {
        let metrics = Metrics::new();
        metrics.record_status("k", 200);
        metrics.record_status("k", 200);
        metrics.record_status("k", 429);

        let counts = metrics.statuses("k");
        assert_eq!(counts.get(&200), Some(&2));
        assert_eq!(counts.get(&429), Some(&1));
    }

    #[test]
    fn unknown_names_are_empty() {
        let metrics = Metrics::new();
        assert!(metrics.task("missing").is_none());
        assert!(metrics.statuses("missing").is_empty());
    }
}
