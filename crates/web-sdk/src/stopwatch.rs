//! Named timers used for screen dwell time and event durations.
//!
//! Entries live in volatile storage under a namespaced key so they survive
//! re-creating the tracker within one process without colliding with other
//! users of the same store.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::clock::Clock;
use crate::storage::KeyValueStore;

const KEY_PREFIX: &str = "beacon.stopwatch.";

/// Result of stopping a timer. Both fields are zero when no timer was running.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Elapsed {
    pub start_time: i64,
    pub duration: i64,
}

pub struct Stopwatch {
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
}

impl Stopwatch {
    pub fn new(store: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Start (or restart) the timer for `id`.
    pub fn start(&self, id: &str) {
        let now = self.clock.now_ms();
        if let Err(e) = self.store.set(&Self::key(id), &now.to_string()) {
            warn!(id, error = %e, "failed to start stopwatch");
        }
    }

    /// Stop the timer for `id` and forget it. A second stop yields zeros.
    pub fn stop(&self, id: &str) -> Elapsed {
        let key = Self::key(id);
        let start_time = self
            .store
            .get(&key)
            .and_then(|raw| raw.parse::<i64>().ok())
            .unwrap_or(0);
        if let Err(e) = self.store.remove(&key) {
            warn!(id, error = %e, "failed to clear stopwatch entry");
        }
        if start_time <= 0 {
            return Elapsed::default();
        }
        Elapsed {
            start_time,
            duration: (self.clock.now_ms() - start_time).max(0),
        }
    }

    /// Drop every running timer.
    pub fn clear(&self) {
        let keys: Vec<String> = self
            .store
            .keys()
            .into_iter()
            .filter(|k| k.starts_with(KEY_PREFIX))
            .collect();
        debug!(count = keys.len(), "clearing stopwatch entries");
        for key in keys {
            if let Err(e) = self.store.remove(&key) {
                warn!(key = %key, error = %e, "failed to clear stopwatch entry");
            }
        }
    }

    fn key(id: &str) -> String {
        format!("{KEY_PREFIX}{id}")
    }
}
