//! Disk writer manager
//!
//! Owns one queue group per partition: a bounded block queue plus a fixed
//! pool of [`DiskWriterTask`] threads. Groups are created on the first
//! block for a partition through the map's entry API, so concurrent
//! submitters for a new partition agree on a single group.

use crate::task::{DiskWriterTask, WriterStats};
use crossbeam_channel::{Sender, SendTimeoutError, bounded};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use fdx_core::{
    Accountable, Block, ByteCounters, Error, PartitionId, Result, SessionRegistry, WriterConfig,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// How [`DiskWriterManager::submit`] waits for queue space
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitMode {
    /// Wait as long as necessary
    Blocking,
    /// Give up after the timeout
    Timeout(Duration),
}

/// A block the manager did not accept; the caller gets it back
#[derive(Debug, Error)]
pub enum SubmitError {
    /// The partition queue stayed full for the whole timeout
    #[error("queue for partition {partition} is full")]
    Full {
        /// Target partition
        partition: PartitionId,
        /// The rejected block
        block: Block,
    },

    /// The partition's workers have stopped
    #[error("writers for partition {partition} have stopped")]
    Stopped {
        /// Target partition
        partition: PartitionId,
        /// The rejected block
        block: Block,
    },

    /// The manager has been shut down
    #[error("disk writer manager is shut down")]
    ShutDown {
        /// The rejected block
        block: Block,
    },

    /// The partition's queue group could not be created
    #[error("failed to start writers for partition {partition}: {source}")]
    Setup {
        /// Target partition
        partition: PartitionId,
        /// The rejected block
        block: Block,
        /// Root cause
        source: Error,
    },
}

impl SubmitError {
    /// Take back the rejected block
    pub fn into_block(self) -> Block {
        match self {
            SubmitError::Full { block, .. }
            | SubmitError::Stopped { block, .. }
            | SubmitError::ShutDown { block }
            | SubmitError::Setup { block, .. } => block,
        }
    }

    /// Returns true if retrying later may succeed
    pub fn is_full(&self) -> bool {
        matches!(self, SubmitError::Full { .. })
    }
}

/// Bounded queue plus worker pool serving one partition
struct QueueGroup {
    partition: PartitionId,
    blocks: Sender<Block>,
    capacity: usize,
    /// Set once stopping begins; sends hold the read side so none can land
    /// after the workers were told to drain
    stopped: RwLock<bool>,
    stop: Mutex<Option<Sender<()>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    stats: Vec<Arc<WriterStats>>,
}

impl QueueGroup {
    fn start(
        partition: PartitionId,
        config: &Arc<WriterConfig>,
        registry: &Arc<SessionRegistry>,
        global: &Arc<ByteCounters>,
    ) -> Result<Self> {
        let capacity = config.queue_capacity();
        let (blocks_tx, blocks_rx) = bounded(capacity);
        let (stop_tx, stop_rx) = bounded(0);

        let mut group = Self {
            partition,
            blocks: blocks_tx,
            capacity,
            stopped: RwLock::new(false),
            stop: Mutex::new(Some(stop_tx)),
            workers: Mutex::new(Vec::with_capacity(config.writers_per_partition)),
            stats: Vec::with_capacity(config.writers_per_partition),
        };

        for index in 0..config.writers_per_partition {
            let stats = Arc::new(WriterStats::default());
            let task = DiskWriterTask {
                partition,
                index,
                blocks: blocks_rx.clone(),
                stop: stop_rx.clone(),
                registry: Arc::clone(registry),
                config: Arc::clone(config),
                global: Arc::clone(global),
                stats: Arc::clone(&stats),
            };

            let spawned = thread::Builder::new()
                .name(format!("fdx-writer-p{partition}-w{index}"))
                .spawn(move || task.run());

            match spawned {
                Ok(handle) => {
                    group.stats.push(stats);
                    group
                        .workers
                        .get_mut()
                        .unwrap_or_else(PoisonError::into_inner)
                        .push(handle);
                }
                Err(e) => {
                    warn!(partition = %partition, writer = index, error = %e, "Failed to spawn disk writer");
                    group.stop();
                    return Err(Error::Io(e));
                }
            }
        }

        info!(
            partition = %partition,
            writers = config.writers_per_partition,
            queue_capacity = capacity,
            "Started partition writers"
        );
        Ok(group)
    }

    /// Queue `block` unless the group is stopping
    fn send(&self, block: Block, mode: SubmitMode) -> std::result::Result<(), SubmitError> {
        let partition = self.partition;
        let stopped = self.stopped.read().unwrap_or_else(PoisonError::into_inner);
        if *stopped {
            return Err(SubmitError::Stopped { partition, block });
        }

        match mode {
            SubmitMode::Blocking => self.blocks.send(block).map_err(|e| SubmitError::Stopped {
                partition,
                block: e.into_inner(),
            }),
            SubmitMode::Timeout(timeout) => {
                self.blocks
                    .send_timeout(block, timeout)
                    .map_err(|e| match e {
                        SendTimeoutError::Timeout(block) => SubmitError::Full { partition, block },
                        SendTimeoutError::Disconnected(block) => {
                            SubmitError::Stopped { partition, block }
                        }
                    })
            }
        }
    }

    /// Signal every worker and wait for them to drain and exit
    fn stop(&self) {
        *self.stopped.write().unwrap_or_else(PoisonError::into_inner) = true;
        drop(
            self.stop
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        );

        let workers = std::mem::take(
            &mut *self
                .workers
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for handle in workers {
            if handle.join().is_err() {
                warn!(partition = %self.partition, "Disk writer thread panicked");
            }
        }
    }
}

/// Single ingestion point for blocks bound for disk
pub struct DiskWriterManager {
    config: Arc<WriterConfig>,
    registry: Arc<SessionRegistry>,
    groups: DashMap<PartitionId, Arc<QueueGroup>>,
    group_count: AtomicUsize,
    counters: Arc<ByteCounters>,
    shut_down: AtomicBool,
}

impl DiskWriterManager {
    /// Create a manager with no partitions
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidConfig` if the writer count or queue depth is
    /// zero.
    pub fn new(config: WriterConfig, registry: Arc<SessionRegistry>) -> Result<Self> {
        if config.writers_per_partition == 0 || config.queue_capacity() == 0 {
            return Err(Error::invalid_config(
                "disk writers need at least one worker and one queue slot",
            ));
        }
        Ok(Self {
            config: Arc::new(config),
            registry,
            groups: DashMap::new(),
            group_count: AtomicUsize::new(0),
            counters: Arc::new(ByteCounters::new()),
            shut_down: AtomicBool::new(false),
        })
    }

    /// Writer configuration
    pub fn config(&self) -> &WriterConfig {
        &self.config
    }

    /// Byte counters across every partition
    pub fn counters(&self) -> &ByteCounters {
        &self.counters
    }

    fn group(&self, partition: PartitionId) -> Result<Arc<QueueGroup>> {
        if let Some(group) = self.groups.get(&partition) {
            return Ok(Arc::clone(group.value()));
        }

        match self.groups.entry(partition) {
            Entry::Occupied(e) => Ok(Arc::clone(e.get())),
            Entry::Vacant(e) => {
                if self.group_count.load(Ordering::Acquire) >= self.config.max_partitions {
                    return Err(Error::invalid_config("maximum number of partitions reached"));
                }
                let group = Arc::new(QueueGroup::start(
                    partition,
                    &self.config,
                    &self.registry,
                    &self.counters,
                )?);
                self.group_count.fetch_add(1, Ordering::AcqRel);
                e.insert(Arc::clone(&group));
                Ok(group)
            }
        }
    }

    /// Queue a block for the writers of `partition`, creating them first if
    /// this is the partition's first block.
    ///
    /// # Errors
    ///
    /// Returns the block inside a [`SubmitError`] if it was not queued.
    pub fn submit(
        &self,
        block: Block,
        partition: PartitionId,
        mode: SubmitMode,
    ) -> std::result::Result<(), SubmitError> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(SubmitError::ShutDown { block });
        }

        let group = match self.group(partition) {
            Ok(group) => group,
            Err(source) => {
                return Err(SubmitError::Setup {
                    partition,
                    block,
                    source,
                });
            }
        };

        group.send(block, mode)
    }

    /// Queue a block, waiting up to `timeout` for space
    ///
    /// # Errors
    ///
    /// See [`submit`](Self::submit).
    pub fn offer(
        &self,
        block: Block,
        partition: PartitionId,
        timeout: Duration,
    ) -> std::result::Result<(), SubmitError> {
        self.submit(block, partition, SubmitMode::Timeout(timeout))
    }

    /// Queue a block, waiting as long as necessary
    ///
    /// # Errors
    ///
    /// See [`submit`](Self::submit).
    pub fn put(&self, block: Block, partition: PartitionId) -> std::result::Result<(), SubmitError> {
        self.submit(block, partition, SubmitMode::Blocking)
    }

    /// Stop the writers of `partition` once they have drained its queue.
    ///
    /// No-op for a partition without writers.
    pub fn stop_partition(&self, partition: PartitionId) {
        if let Some((_, group)) = self.groups.remove(&partition) {
            self.group_count.fetch_sub(1, Ordering::AcqRel);
            debug!(partition = %partition, "Stopping partition writers");
            group.stop();
            info!(partition = %partition, "Partition writers stopped");
        }
    }

    /// Stop every partition and refuse further blocks
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        for partition in self.partitions() {
            self.stop_partition(partition);
        }
        info!(bytes = self.counters.total(), "Disk writer manager shut down");
    }

    /// Partitions with running writers
    pub fn partitions(&self) -> Vec<PartitionId> {
        let mut partitions: Vec<_> = self.groups.iter().map(|g| *g.key()).collect();
        partitions.sort_unstable();
        partitions
    }

    /// Number of writers serving `partition`
    pub fn worker_count(&self, partition: PartitionId) -> Option<usize> {
        self.groups.get(&partition).map(|g| g.stats.len())
    }

    /// Blocks waiting in the queue of `partition`
    pub fn queue_len(&self, partition: PartitionId) -> Option<usize> {
        self.groups.get(&partition).map(|g| g.blocks.len())
    }

    /// Queue depth of `partition`
    pub fn queue_capacity(&self, partition: PartitionId) -> Option<usize> {
        self.groups.get(&partition).map(|g| g.capacity)
    }

    /// Statistics of each writer serving `partition`
    pub fn writer_stats(&self, partition: PartitionId) -> Vec<Arc<WriterStats>> {
        self.groups
            .get(&partition)
            .map(|g| g.stats.clone())
            .unwrap_or_default()
    }
}

impl Accountable for DiskWriterManager {
    fn total_bytes(&self) -> u64 {
        self.counters.total()
    }

    fn util_bytes(&self) -> u64 {
        self.counters.util()
    }
}

impl Drop for DiskWriterManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}
