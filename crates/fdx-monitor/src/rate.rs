//! Throughput rate engine.
//!
//! Converts the cumulative byte counters of any set of [`Accountable`]
//! entities into rates. Every tick reads each entity's counters and derives:
//!
//! - the instantaneous rate over the interval since the previous tick
//! - the running average since the start of the sampling window
//!
//! The first tick for an entity only sets its window baseline. An interval
//! that is zero or negative, or a counter that moved backwards, rebaselines
//! the window and leaves the previous rates in place.

use dashmap::DashMap;
use fdx_core::Accountable;
use std::fmt;
use std::hash::Hash;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use tracing::warn;

const NANOS_PER_MILLI: i64 = 1_000_000;

/// Rates of one entity, in bytes per second
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RateSnapshot {
    /// Instantaneous total rate
    pub total_rate: f64,
    /// Instantaneous payload rate
    pub util_rate: f64,
    /// Average total rate since the window start
    pub avg_total_rate: f64,
    /// Average payload rate since the window start
    pub avg_util_rate: f64,
    /// Total bytes at the last sample
    pub total_bytes: u64,
    /// Payload bytes at the last sample
    pub util_bytes: u64,
    /// Samples that attempted a rate computation
    pub samples: u64,
}

#[derive(Debug, Default)]
struct EntryState {
    start_time: i64,
    last_time: Option<i64>,
    start_total: u64,
    start_util: u64,
    last_total: u64,
    last_util: u64,
    snapshot: RateSnapshot,
}

impl EntryState {
    fn rebaseline_window(&mut self, now: i64) {
        self.start_time = now;
        self.start_total = self.snapshot.total_bytes;
        self.start_util = self.snapshot.util_bytes;
    }

    fn sample(&mut self, total: u64, util: u64, now: i64) {
        self.snapshot.total_bytes = total;
        self.snapshot.util_bytes = util;

        match self.last_time {
            None => self.rebaseline_window(now),
            Some(last) => self.compute(last, now),
        }

        self.last_time = Some(now);
        self.last_total = total;
        self.last_util = util;
    }

    fn compute(&mut self, last: i64, now: i64) {
        self.snapshot.samples += 1;
        let total = self.snapshot.total_bytes;
        let util = self.snapshot.util_bytes;

        if total < self.last_total || util < self.last_util {
            warn!(
                last_total = self.last_total,
                total, "Byte counter moved backwards; resetting rate window"
            );
            self.rebaseline_window(now);
            return;
        }

        let dt = now.saturating_sub(last) / NANOS_PER_MILLI;
        if dt <= 0 {
            warn!(
                last_ns = last,
                now_ns = now,
                "Timing issue detected; resetting rate window"
            );
            self.rebaseline_window(now);
            return;
        }
        self.snapshot.total_rate = (total - self.last_total) as f64 * 1000.0 / dt as f64;
        self.snapshot.util_rate = (util - self.last_util) as f64 * 1000.0 / dt as f64;

        let dt = now.saturating_sub(self.start_time) / NANOS_PER_MILLI;
        if dt <= 0 {
            warn!(
                start_ns = self.start_time,
                now_ns = now,
                "Timing issue detected; resetting rate window"
            );
            self.rebaseline_window(now);
            return;
        }
        self.snapshot.avg_total_rate =
            total.saturating_sub(self.start_total) as f64 * 1000.0 / dt as f64;
        self.snapshot.avg_util_rate =
            util.saturating_sub(self.start_util) as f64 * 1000.0 / dt as f64;
    }

    fn reset(&mut self) {
        *self = Self::default();
    }
}

struct Entry {
    source: Arc<dyn Accountable>,
    state: Mutex<EntryState>,
}

impl Entry {
    fn state(&self) -> std::sync::MutexGuard<'_, EntryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

type TickHook<K> = Arc<dyn Fn(&RateEngine<K>) + Send + Sync>;

/// Rate sampler over a dynamic set of keyed entities
pub struct RateEngine<K: Eq + Hash + Clone> {
    entries: DashMap<K, Entry>,
    epoch: Instant,
    on_tick: Mutex<Option<TickHook<K>>>,
}

impl<K: Eq + Hash + Clone> RateEngine<K> {
    /// Create an engine tracking nothing
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            epoch: Instant::now(),
            on_tick: Mutex::new(None),
        }
    }

    /// Start tracking `source` under `key`.
    ///
    /// Returns false if `key` is already tracked.
    pub fn register(&self, key: K, source: Arc<dyn Accountable>) -> bool {
        match self.entries.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(Entry {
                    source,
                    state: Mutex::new(EntryState::default()),
                });
                true
            }
        }
    }

    /// Stop tracking `key`; returns whether it was tracked
    pub fn deregister(&self, key: &K) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Hook run after every tick
    pub fn set_on_tick<F>(&self, hook: F)
    where
        F: Fn(&RateEngine<K>) + Send + Sync + 'static,
    {
        *self.on_tick.lock().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(hook));
    }

    /// Sample every entity now
    pub fn tick(&self) {
        let now = i64::try_from(self.epoch.elapsed().as_nanos()).unwrap_or(i64::MAX);
        self.tick_at(now);
    }

    /// Sample every entity as if the clock read `now_nanos`
    pub fn tick_at(&self, now_nanos: i64) {
        for entry in self.entries.iter() {
            let total = entry.source.total_bytes();
            let util = entry.source.util_bytes();
            entry.state().sample(total, util, now_nanos);
        }

        let hook = self
            .on_tick
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(hook) = hook {
            if panic::catch_unwind(AssertUnwindSafe(|| hook(self))).is_err() {
                warn!("Rate tick hook panicked");
            }
        }
    }

    /// Current rates of `key`
    pub fn snapshot(&self, key: &K) -> Option<RateSnapshot> {
        self.entries.get(key).map(|e| e.state().snapshot)
    }

    /// Current rates of every tracked entity
    pub fn snapshots(&self) -> Vec<(K, RateSnapshot)> {
        self.entries
            .iter()
            .map(|e| (e.key().clone(), e.state().snapshot))
            .collect()
    }

    /// Zero the rates of `key`; its next tick only sets a new baseline
    pub fn reset(&self, key: &K) -> bool {
        match self.entries.get(key) {
            Some(entry) => {
                entry.state().reset();
                true
            }
            None => false,
        }
    }

    /// Zero the rates of every entity
    pub fn reset_all(&self) {
        for entry in self.entries.iter() {
            entry.state().reset();
        }
    }

    /// Number of tracked entities
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing is tracked
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: Eq + Hash + Clone> Default for RateEngine<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash + Clone> fmt::Debug for RateEngine<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateEngine")
            .field("entries", &self.entries.len())
            .finish()
    }
}
