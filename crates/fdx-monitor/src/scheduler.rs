//! Periodic sampling on the tokio runtime

use crate::rate::RateEngine;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Handle to a running sampler task
#[derive(Debug)]
pub struct SamplerHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SamplerHandle {
    /// Stop sampling and wait for the task to exit
    pub async fn stop(self) {
        let _ = self.stop.send(true);
        if let Err(e) = self.task.await {
            tracing::warn!("Rate sampler task failed: {}", e);
        }
    }

    /// Returns true once the task has exited
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Tick `engine` after `initial_delay`, then again `period` after each tick
/// completes, until the handle is stopped or dropped
pub fn spawn_sampler<K>(
    engine: Arc<RateEngine<K>>,
    initial_delay: Duration,
    period: Duration,
) -> SamplerHandle
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
{
    let (stop_tx, mut stop_rx) = watch::channel(false);

    let task = tokio::spawn(async move {
        tracing::debug!(?initial_delay, ?period, "Rate sampler started");
        let mut delay = initial_delay;
        loop {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    engine.tick();
                    delay = period;
                }
                changed = stop_rx.changed() => {
                    if changed.is_err() || *stop_rx.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::debug!("Rate sampler stopped");
    });

    SamplerHandle { stop: stop_tx, task }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fdx_core::ByteCounters;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_sampler_ticks_until_stopped() {
        let engine: Arc<RateEngine<u8>> = Arc::new(RateEngine::new());
        engine.register(0, Arc::new(ByteCounters::new()));
        let ticks = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&ticks);
        engine.set_on_tick(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        let handle = spawn_sampler(
            Arc::clone(&engine),
            Duration::from_millis(200),
            Duration::from_millis(20),
        );

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(ticks.load(Ordering::SeqCst) >= 2);

        handle.stop().await;
        let stopped_at = ticks.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), stopped_at);
    }

    #[tokio::test]
    async fn test_dropping_handle_stops_sampler() {
        let engine: Arc<RateEngine<u8>> = Arc::new(RateEngine::new());
        let handle = spawn_sampler(
            Arc::clone(&engine),
            Duration::from_secs(60),
            Duration::from_secs(60),
        );
        let SamplerHandle { stop, task } = handle;
        drop(stop);
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
    }
}
