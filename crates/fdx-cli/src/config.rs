//! Configuration file for the FDX CLI.

use fdx_core::{
    BufferPoolConfig, EngineConfig, MonitorConfig, SessionConfig, WriterConfig,
};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// FDX configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Disk writer configuration
    pub writer: WriterSection,
    /// Buffer pool configuration
    pub buffers: BuffersSection,
    /// Session configuration
    pub session: SessionSection,
    /// Rate sampling configuration
    pub monitor: MonitorSection,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// `[writer]` section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriterSection {
    /// Worker threads per partition
    #[serde(default = "default_writers_per_partition")]
    pub writers_per_partition: usize,
    /// Queue depth as a multiple of the worker count
    #[serde(default = "default_queue_multiplier")]
    pub queue_multiplier: usize,
    /// Maximum number of partitions
    #[serde(default = "default_max_partitions")]
    pub max_partitions: usize,
    /// Idle poll interval in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Sync finished files to stable storage
    #[serde(default)]
    pub force_on_close: bool,
    /// Disk-full threshold as a fraction of the partition size
    #[serde(default = "default_min_free_ratio")]
    pub min_free_ratio: f64,
    /// Pad unaligned tail blocks
    #[serde(default = "default_true")]
    pub align_writes: bool,
}

/// `[buffers]` section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuffersSection {
    /// Buffer size in bytes
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Number of buffers
    #[serde(default = "default_buffer_capacity")]
    pub capacity: usize,
}

/// `[session]` section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSection {
    /// Default destination directory
    #[serde(default = "default_destination")]
    pub destination: PathBuf,
    /// Loop mode
    #[serde(default)]
    pub loop_mode: bool,
    /// Drain barrier re-check interval in milliseconds
    #[serde(default = "default_drain_recheck_ms")]
    pub drain_recheck_ms: u64,
}

/// `[monitor]` section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorSection {
    /// Delay before the first sample in milliseconds
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    /// Sampling period in milliseconds
    #[serde(default = "default_period_ms")]
    pub period_ms: u64,
    /// Telemetry endpoint (`host:port`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report_addr: Option<String>,
}

/// `[logging]` section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values

fn default_writers_per_partition() -> usize {
    1
}

fn default_queue_multiplier() -> usize {
    20
}

fn default_max_partitions() -> usize {
    1000
}

fn default_poll_interval_ms() -> u64 {
    10_000
}

fn default_min_free_ratio() -> f64 {
    0.05
}

fn default_true() -> bool {
    true
}

fn default_buffer_size() -> usize {
    512 * 1024 // 512 KiB
}

fn default_buffer_capacity() -> usize {
    256
}

fn default_destination() -> PathBuf {
    PathBuf::from(".")
}

fn default_drain_recheck_ms() -> u64 {
    5_000
}

fn default_initial_delay_ms() -> u64 {
    1_000
}

fn default_period_ms() -> u64 {
    5_000
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for WriterSection {
    fn default() -> Self {
        Self {
            writers_per_partition: default_writers_per_partition(),
            queue_multiplier: default_queue_multiplier(),
            max_partitions: default_max_partitions(),
            poll_interval_ms: default_poll_interval_ms(),
            force_on_close: false,
            min_free_ratio: default_min_free_ratio(),
            align_writes: true,
        }
    }
}

impl Default for BuffersSection {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            capacity: default_buffer_capacity(),
        }
    }
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            destination: default_destination(),
            loop_mode: false,
            drain_recheck_ms: default_drain_recheck_ms(),
        }
    }
}

impl Default for MonitorSection {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            period_ms: default_period_ms(),
            report_addr: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    #[allow(dead_code)]
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(path, contents)?;
        Ok(())
    }

    /// Get default config path
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("fdx/config.toml")
    }

    /// Load config from the default path, or use defaults if it doesn't exist
    ///
    /// # Errors
    ///
    /// Returns an error if an existing file cannot be read or parsed.
    pub fn load_or_default() -> anyhow::Result<Self> {
        let path = Self::default_path();

        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Parse the telemetry endpoint, if one is configured
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be parsed.
    pub fn parse_report_addr(&self) -> anyhow::Result<Option<SocketAddr>> {
        self.monitor
            .report_addr
            .as_deref()
            .map(|addr| {
                addr.parse()
                    .map_err(|e| anyhow::anyhow!("Invalid report address '{addr}': {e}"))
            })
            .transpose()
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is invalid.
    pub fn validate(&self) -> anyhow::Result<()> {
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid log level: {}. Must be one of: {}",
                self.logging.level,
                valid_log_levels.join(", ")
            );
        }

        self.engine()?;
        Ok(())
    }

    /// Convert into a validated engine configuration
    ///
    /// # Errors
    ///
    /// Returns an error if any engine setting is out of range.
    pub fn engine(&self) -> anyhow::Result<EngineConfig> {
        let engine = EngineConfig {
            writer: WriterConfig {
                writers_per_partition: self.writer.writers_per_partition,
                queue_multiplier: self.writer.queue_multiplier,
                max_partitions: self.writer.max_partitions,
                poll_interval: Duration::from_millis(self.writer.poll_interval_ms),
                force_on_close: self.writer.force_on_close,
                min_free_ratio: self.writer.min_free_ratio,
                align_writes: self.writer.align_writes,
            },
            buffers: BufferPoolConfig {
                buffer_size: self.buffers.buffer_size,
                capacity: self.buffers.capacity,
            },
            session: SessionConfig {
                destination: self.session.destination.clone(),
                pull_mode: false,
                loop_mode: self.session.loop_mode,
                drain_recheck_interval: Duration::from_millis(self.session.drain_recheck_ms),
            },
            monitor: MonitorConfig {
                initial_delay: Duration::from_millis(self.monitor.initial_delay_ms),
                period: Duration::from_millis(self.monitor.period_ms),
                report_addr: self.parse_report_addr()?,
            },
        };
        engine.validate()?;
        Ok(engine)
    }
}
