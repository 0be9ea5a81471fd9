//! Fuzz test for rate sampling
//!
//! Feeds arbitrary clock readings and counter movements (including clock
//! skew and counters going backwards) through the rate engine and checks
//! that it neither panics nor produces negative or non-finite rates.

#![no_main]

use arbitrary::Arbitrary;
use fdx_core::Accountable;
use fdx_monitor::RateEngine;
use libfuzzer_sys::fuzz_target;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
struct Gauge {
    total: AtomicU64,
    util: AtomicU64,
}

impl Accountable for Gauge {
    fn total_bytes(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    fn util_bytes(&self) -> u64 {
        self.util.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Arbitrary)]
enum Step {
    Sample { now: i64, total: u64, util: u64 },
    Reset,
}

fuzz_target!(|steps: Vec<Step>| {
    let gauge = Arc::new(Gauge::default());
    let engine: RateEngine<u8> = RateEngine::new();
    engine.register(0, Arc::clone(&gauge) as Arc<dyn Accountable>);

    for step in steps {
        match step {
            Step::Sample { now, total, util } => {
                gauge.total.store(total, Ordering::Relaxed);
                gauge.util.store(util, Ordering::Relaxed);
                engine.tick_at(now);
            }
            Step::Reset => {
                engine.reset(&0);
            }
        }

        if let Some(snap) = engine.snapshot(&0) {
            for rate in [
                snap.total_rate,
                snap.util_rate,
                snap.avg_total_rate,
                snap.avg_util_rate,
            ] {
                assert!(rate.is_finite() && rate >= 0.0, "bad rate {rate}: {snap:?}");
            }
        }
    }
});
