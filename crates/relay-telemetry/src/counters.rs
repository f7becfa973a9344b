use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use dashmap::DashMap;

/// Monotonically increasing counter.
struct Counter {
    value: AtomicU64,
}

impl Counter {
    fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }
    fn increment(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }
    fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Gauge that can go up or down.
struct Gauge {
    value: AtomicI64,
}

impl Gauge {
    fn new() -> Self {
        Self {
            value: AtomicI64::new(0),
        }
    }
    fn add(&self, delta: i64) {
        self.value.fetch_add(delta, Ordering::Relaxed);
    }
    fn set(&self, v: i64) {
        self.value.store(v, Ordering::Relaxed);
    }
    fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Operational counters for the hub. Cheap to record from hot paths;
/// snapshotted into `/health` responses and periodic logs.
#[derive(Default)]
pub struct HubCounters {
    counters: DashMap<&'static str, Counter>,
    gauges: DashMap<&'static str, Gauge>,
}

impl HubCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&self, name: &'static str) {
        self.counters
            .entry(name)
            .or_insert_with(Counter::new)
            .increment(1);
    }

    pub fn add(&self, name: &'static str, n: u64) {
        self.counters
            .entry(name)
            .or_insert_with(Counter::new)
            .increment(n);
    }

    pub fn gauge_add(&self, name: &'static str, delta: i64) {
        self.gauges
            .entry(name)
            .or_insert_with(Gauge::new)
            .add(delta);
    }

    pub fn gauge_set(&self, name: &'static str, value: i64) {
        self.gauges
            .entry(name)
            .or_insert_with(Gauge::new)
            .set(value);
    }

    pub fn counter(&self, name: &str) -> u64 {
        self.counters.get(name).map(|c| c.get()).unwrap_or(0)
    }

    pub fn gauge(&self, name: &str) -> i64 {
        self.gauges.get(name).map(|g| g.get()).unwrap_or(0)
    }

    /// All counters and gauges as a flat JSON object.
    pub fn snapshot(&self) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        for entry in self.counters.iter() {
            map.insert((*entry.key()).to_string(), entry.value().get().into());
        }
        for entry in self.gauges.iter() {
            map.insert((*entry.key()).to_string(), entry.value().get().into());
        }
        serde_json::Value::Object(map)
    }
}
