//! Counter sinks: fire-and-forget metrics.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use crate::domain::ports::CounterSink;

/// Discards every increment.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCounterSink;

impl CounterSink for NoopCounterSink {
    fn incr(&self, _name: &str) {}
}

/// In-memory counters, readable for diagnostics and tests.
#[derive(Debug, Default)]
pub struct AtomicCounterSink {
    counters: RwLock<HashMap<String, AtomicU64>>,
}

impl AtomicCounterSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> u64 {
        self.counters
            .read()
            .expect("counter lock poisoned")
            .get(name)
            .map_or(0, |c| c.load(Ordering::Relaxed))
    }

    /// Snapshot of all counters.
    pub fn snapshot(&self) -> HashMap<String, u64> {
        self.counters
            .read()
            .expect("counter lock poisoned")
            .iter()
            .map(|(k, v)| (k.clone(), v.load(Ordering::Relaxed)))
            .collect()
    }
}

impl CounterSink for AtomicCounterSink {
    fn incr(&self, name: &str) {
        {
            let counters = self.counters.read().expect("counter lock poisoned");
            if let Some(counter) = counters.get(name) {
                counter.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }
        let mut counters = self.counters.write().expect("counter lock poisoned");
        counters
            .entry(name.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }
}
