//! Byte accounting shared by every level of the write pipeline.
//!
//! A successful write is counted four times: on the file unit, on the
//! worker that performed it, on the disk writer manager and on the owning
//! session. Each level exposes its counters through [`Accountable`] so the
//! rate engine can sample any of them.

use std::sync::atomic::{AtomicU64, Ordering};

/// An entity exposing cumulative byte counters
pub trait Accountable: Send + Sync {
    /// Total bytes moved, including any protocol or alignment overhead
    fn total_bytes(&self) -> u64;

    /// Payload bytes moved
    fn util_bytes(&self) -> u64;
}

/// Pair of monotonically increasing byte counters
#[derive(Debug, Default)]
pub struct ByteCounters {
    total: AtomicU64,
    util: AtomicU64,
}

impl ByteCounters {
    /// Create zeroed counters
    #[must_use]
    pub const fn new() -> Self {
        Self {
            total: AtomicU64::new(0),
            util: AtomicU64::new(0),
        }
    }

    /// Add to both counters independently
    pub fn add(&self, total: u64, util: u64) {
        self.total.fetch_add(total, Ordering::Relaxed);
        self.util.fetch_add(util, Ordering::Relaxed);
    }

    /// Add the same amount to both counters
    pub fn add_both(&self, n: u64) {
        self.add(n, n);
    }

    /// Current total bytes
    #[must_use]
    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    /// Current payload bytes
    #[must_use]
    pub fn util(&self) -> u64 {
        self.util.load(Ordering::Relaxed)
    }
}

impl Accountable for ByteCounters {
    fn total_bytes(&self) -> u64 {
        self.total()
    }

    fn util_bytes(&self) -> u64 {
        self.util()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_add_tracks_both_counters() {
        let counters = ByteCounters::new();
        counters.add(100, 80);
        counters.add_both(20);

        assert_eq!(counters.total(), 120);
        assert_eq!(counters.util(), 100);
        assert_eq!(counters.total_bytes(), 120);
        assert_eq!(counters.util_bytes(), 100);
    }

    #[test]
    fn test_concurrent_adds() {
        let counters = Arc::new(ByteCounters::default());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let c = Arc::clone(&counters);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        c.add_both(4096);
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(counters.total(), 8 * 1000 * 4096);
        assert_eq!(counters.util(), counters.total());
    }
}
