//! Per-node statistics: counters keyed by engine event name.
//!
//! Counters are written only from the engine event subscription, which
//! delivers events serially; readers take a snapshot copy.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::engine::EVENT_KEYS;

#[derive(Clone)]
pub struct Stats {
    counters: Arc<Mutex<HashMap<&'static str, u64>>>,
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

impl Stats {
    /// Creates the counter map, pre-seeded with every engine event key.
    pub fn new() -> Self {
        let counters = EVENT_KEYS.iter().map(|&key| (key, 0)).collect();
        Self {
            counters: Arc::new(Mutex::new(counters)),
        }
    }

    pub fn incr(&self, key: &'static str) {
        *self.counters.lock().unwrap().entry(key).or_insert(0) += 1;
    }

    pub fn get(&self, key: &str) -> u64 {
        self.counters.lock().unwrap().get(key).copied().unwrap_or(0)
    }

    /// Copy of all counters at this instant.
    pub fn snapshot(&self) -> HashMap<&'static str, u64> {
        self.counters.lock().unwrap().clone()
    }
}
