//! Named counters and timers.
//!
//! Each timer name accumulates a count and a total duration. Snapshots expose
//! `<name>.cnt` and `<name>.ms-avg` so reports can reconstruct cumulative time
//! as `cnt * ms-avg`.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

#[derive(Default, Clone, Copy)]
struct TimerAccum {
    count: u64,
    total: Duration,
}

/// Shared statistics registry
#[derive(Default)]
pub struct Stats {
    timers: Mutex<HashMap<String, TimerAccum>>,
}

impl Stats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Start a timer that records into `name` when stopped or dropped
    pub fn timer(self: &Arc<Self>, name: impl Into<String>) -> Timer {
        Timer {
            stats: Arc::clone(self),
            name: name.into(),
            started_at: Instant::now(),
            stopped: false,
        }
    }

    pub fn record(&self, name: &str, elapsed: Duration) {
        let mut timers = self.timers.lock().unwrap_or_else(PoisonError::into_inner);
        let accum = timers.entry(name.to_string()).or_default();
        accum.count += 1;
        accum.total += elapsed;
    }

    pub fn count(&self, name: &str) -> u64 {
        let timers = self.timers.lock().unwrap_or_else(PoisonError::into_inner);
        timers.get(name).map(|accum| accum.count).unwrap_or(0)
    }

    /// Cumulative seconds spent under `name`
    pub fn total_secs(&self, name: &str) -> f64 {
        let snapshot = self.snapshot();
        cumulative_secs(&snapshot, name)
    }

    pub fn snapshot(&self) -> BTreeMap<String, i64> {
        let timers = self.timers.lock().unwrap_or_else(PoisonError::into_inner);
        let mut snapshot = BTreeMap::new();
        for (name, accum) in timers.iter() {
            let avg_ms = if accum.count > 0 {
                accum.total.as_millis() as i64 / accum.count as i64
            } else {
                0
            };
            snapshot.insert(format!("{}.cnt", name), accum.count as i64);
            snapshot.insert(format!("{}.ms-avg", name), avg_ms);
        }
        snapshot
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self.snapshot()).unwrap_or_else(|_| serde_json::json!({}))
    }
}

/// Reconstruct cumulative seconds from a snapshot
pub fn cumulative_secs(snapshot: &BTreeMap<String, i64>, name: &str) -> f64 {
    let count = snapshot.get(&format!("{}.cnt", name)).copied().unwrap_or(0);
    let avg_ms = snapshot.get(&format!("{}.ms-avg", name)).copied().unwrap_or(0);
    (count * avg_ms) as f64 / 1000.0
}

/// Running timer; records once
pub struct Timer {
    stats: Arc<Stats>,
    name: String,
    started_at: Instant,
    stopped: bool,
}

impl Timer {
    pub fn stop(mut self) -> Duration {
        self.finish()
    }

    fn finish(&mut self) -> Duration {
        let elapsed = self.started_at.elapsed();
        if !self.stopped {
            self.stopped = true;
            self.stats.record(&self.name, elapsed);
        }
        elapsed
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.finish();
    }
}
