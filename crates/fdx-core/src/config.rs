//! Engine configuration

use crate::block::STORAGE_BLOCK_SIZE;
use crate::error::{Error, Result};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Engine configuration
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    /// Disk writer configuration
    pub writer: WriterConfig,

    /// Buffer pool configuration
    pub buffers: BufferPoolConfig,

    /// Session configuration
    pub session: SessionConfig,

    /// Rate sampling and reporting configuration
    pub monitor: MonitorConfig,
}

impl EngineConfig {
    /// Check every section for values the engine cannot run with
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidConfig` naming the first offending value.
    pub fn validate(&self) -> Result<()> {
        self.writer.validate()?;
        self.buffers.validate()?;
        self.session.validate()?;
        self.monitor.validate()
    }
}

/// Disk writer configuration
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Worker threads started for every partition
    pub writers_per_partition: usize,

    /// Queue depth per partition, as a multiple of the worker count
    pub queue_multiplier: usize,

    /// Maximum number of partition queue groups
    pub max_partitions: usize,

    /// How long an idle worker waits for a block before re-polling
    pub poll_interval: Duration,

    /// Flush file data to stable storage before closing a finished file
    pub force_on_close: bool,

    /// Free or usable space below this fraction of the partition size
    /// classifies a short write as "disk full"
    pub min_free_ratio: f64,

    /// Pad unaligned tail blocks to the storage block size and truncate back
    pub align_writes: bool,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            writers_per_partition: 1,
            queue_multiplier: 20,
            max_partitions: 1000,
            poll_interval: Duration::from_secs(10),
            force_on_close: false,
            min_free_ratio: 0.05,
            align_writes: true,
        }
    }
}

impl WriterConfig {
    /// Bounded queue depth of one partition
    #[must_use]
    pub fn queue_capacity(&self) -> usize {
        self.writers_per_partition.saturating_mul(self.queue_multiplier)
    }

    fn validate(&self) -> Result<()> {
        if self.writers_per_partition == 0 {
            return Err(Error::invalid_config("writers_per_partition must be > 0"));
        }
        if self.queue_multiplier == 0 {
            return Err(Error::invalid_config("queue_multiplier must be > 0"));
        }
        if self.max_partitions == 0 {
            return Err(Error::invalid_config("max_partitions must be > 0"));
        }
        if self.poll_interval.is_zero() {
            return Err(Error::invalid_config("poll_interval must be non-zero"));
        }
        if !(0.0..1.0).contains(&self.min_free_ratio) {
            return Err(Error::invalid_config("min_free_ratio must be in [0, 1)"));
        }
        Ok(())
    }
}

/// Buffer pool configuration
#[derive(Debug, Clone)]
pub struct BufferPoolConfig {
    /// Size of each buffer in bytes
    pub buffer_size: usize,

    /// Maximum number of buffers
    pub capacity: usize,
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        Self {
            buffer_size: 512 * 1024, // 512 KiB
            capacity: 256,
        }
    }
}

impl BufferPoolConfig {
    fn validate(&self) -> Result<()> {
        if self.buffer_size == 0 || self.buffer_size % STORAGE_BLOCK_SIZE != 0 {
            return Err(Error::invalid_config(
                "buffer_size must be a non-zero multiple of 4096",
            ));
        }
        if self.capacity == 0 {
            return Err(Error::invalid_config("buffer capacity must be > 0"));
        }
        Ok(())
    }
}

/// Session configuration
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Directory that writer sessions resolve file names under
    pub destination: PathBuf,

    /// This side pulls data from the peer (local sessions become writers)
    pub pull_mode: bool,

    /// Loop mode: writes append and files never complete
    pub loop_mode: bool,

    /// How often the drain barrier re-checks the session map
    pub drain_recheck_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            destination: PathBuf::from("."),
            pull_mode: false,
            loop_mode: false,
            drain_recheck_interval: Duration::from_secs(5),
        }
    }
}

impl SessionConfig {
    fn validate(&self) -> Result<()> {
        if self.drain_recheck_interval.is_zero() {
            return Err(Error::invalid_config(
                "drain_recheck_interval must be non-zero",
            ));
        }
        Ok(())
    }
}

/// Rate sampling and reporting configuration
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Delay before the first sample
    pub initial_delay: Duration,

    /// Delay between samples
    pub period: Duration,

    /// Telemetry endpoint receiving rate reports
    pub report_addr: Option<SocketAddr>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            period: Duration::from_secs(5),
            report_addr: None,
        }
    }
}

impl MonitorConfig {
    fn validate(&self) -> Result<()> {
        if self.period.is_zero() {
            return Err(Error::invalid_config("monitor period must be non-zero"));
        }
        Ok(())
    }
}
