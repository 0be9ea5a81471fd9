//! FDX command-line interface
//!
//! Fast Data eXchange: local transfers and throughput benchmarks through
//! the partition-aware disk write pipeline.

mod config;
mod progress;

use clap::{Parser, Subcommand};
use console::style;
use fdx_core::{
    Accountable, BufferPool, DEV_NULL_PATH, DEV_ZERO_PATH, EngineConfig, Error, FileId, FileSpec, FileUnit,
    LocalChannelProvider, SessionId, SessionRegistry,
};
use fdx_disk::{BlockReader, DiskWriterManager};
use fdx_monitor::{RateEngine, Reporter, Role, TcpCommandSink, spawn_sampler};
use indicatif::ProgressBar;
use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing_subscriber::EnvFilter;

use config::Config;
use progress::{TransferProgress, format_bytes, format_speed};

/// FDX - high-throughput file transfer
#[derive(Parser)]
#[command(name = "fdx")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file path (defaults to the user config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Copy files into a directory through the write pipeline
    Copy {
        /// Files to copy
        #[arg(required = true)]
        sources: Vec<PathBuf>,

        /// Destination directory
        #[arg(short, long)]
        dest: PathBuf,
    },

    /// Measure pipeline throughput from the zero source into the null sink
    Bench {
        /// Bytes per file
        #[arg(long, default_value_t = 1 << 30)]
        size: u64,

        /// Number of files
        #[arg(long, default_value_t = 1)]
        files: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_or_default()?,
    };
    config.validate()?;

    // RUST_LOG wins over the configured level
    let level = if cli.verbose {
        "debug"
    } else {
        config.logging.level.as_str()
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)),
        )
        .init();

    let engine = config.engine()?;

    match cli.command {
        Commands::Copy { sources, dest } => copy_files(sources, dest, engine).await?,
        Commands::Bench { size, files } => run_bench(size, files, engine).await?,
    }

    Ok(())
}

/// Entities sampled by the rate engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum RateKey {
    Manager,
    Session(SessionId),
    File(FileId),
}

impl fmt::Display for RateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateKey::Manager => f.write_str("disk-writers"),
            RateKey::Session(id) => write!(f, "session-{id}"),
            RateKey::File(id) => write!(f, "file-{id}"),
        }
    }
}

/// Registry, writers, reader and rate engine wired together
struct Pipeline {
    registry: Arc<SessionRegistry>,
    manager: Arc<DiskWriterManager>,
    reader: BlockReader,
    rates: Arc<RateEngine<RateKey>>,
}

impl Pipeline {
    fn new(engine: &EngineConfig) -> anyhow::Result<Self> {
        let registry = SessionRegistry::new(
            engine.session.clone(),
            Arc::new(LocalChannelProvider::new()),
        );
        let manager = Arc::new(DiskWriterManager::new(
            engine.writer.clone(),
            Arc::clone(&registry),
        )?);
        let pool = BufferPool::new(engine.buffers.buffer_size, engine.buffers.capacity);

        let rates = Arc::new(RateEngine::new());
        rates.register(RateKey::Manager, Arc::clone(&manager) as Arc<dyn Accountable>);

        Ok(Self {
            registry,
            manager,
            reader: BlockReader::new(pool),
            rates,
        })
    }

    /// Read `source` into the writer queues of `unit`'s partition.
    ///
    /// Stops early once the unit has been closed by a write failure.
    fn feed(&self, unit: &FileUnit, source: &Path) -> fdx_core::Result<u64> {
        self.reader.read_file(unit, source, |block| {
            if unit.is_closed() {
                return Err(Error::control("file closed before its source was read"));
            }
            self.manager
                .put(block, unit.partition())
                .map_err(|e| Error::Control(e.to_string().into()))
        })
    }

    /// Feed every `(source, unit)` pair on a blocking thread
    fn spawn_feeder(self: &Arc<Self>, inputs: Vec<(PathBuf, Arc<FileUnit>)>) -> JoinHandle<()> {
        let pipeline = Arc::clone(self);
        tokio::task::spawn_blocking(move || {
            for (source, unit) in inputs {
                match pipeline.feed(&unit, &source) {
                    Ok(_) => {}
                    Err(_) if unit.is_closed() => {}
                    Err(e) => {
                        tracing::error!(
                            source = %source.display(),
                            file = %unit.id(),
                            error = %e,
                            "Failed to read source"
                        );
                        pipeline.registry.finish(
                            unit.session_id(),
                            "source read failed",
                            Some(Arc::new(e)),
                        );
                        break;
                    }
                }
            }
        })
    }

    /// Wait for every session to end, refreshing `bars` in the meantime.
    ///
    /// Ctrl+C closes the registry; the wait then continues until the
    /// writers have released every session.
    async fn drain(&self, bars: &[(Arc<FileUnit>, ProgressBar)]) -> anyhow::Result<()> {
        let registry = Arc::clone(&self.registry);
        let mut drained = tokio::task::spawn_blocking(move || registry.await_drain());
        let mut ticker = tokio::time::interval(Duration::from_millis(100));
        let mut interrupted = false;

        loop {
            tokio::select! {
                res = &mut drained => {
                    res?;
                    break;
                }
                _ = ticker.tick() => refresh_bars(bars),
                _ = tokio::signal::ctrl_c(), if !interrupted => {
                    interrupted = true;
                    println!("\nInterrupted, stopping transfer...");
                    self.registry.close("interrupted");
                }
            }
        }

        refresh_bars(bars);
        for (unit, bar) in bars {
            match unit.cause() {
                Some(cause) => bar.abandon_with_message(format!("failed: {cause}")),
                None if unit.is_complete() => bar.finish(),
                None => bar.abandon(),
            }
        }
        Ok(())
    }
}

fn refresh_bars(bars: &[(Arc<FileUnit>, ProgressBar)]) {
    for (unit, bar) in bars {
        bar.set_position(unit.processed());
    }
}

/// Forward rate snapshots to the telemetry endpoint after every tick
fn spawn_reporter(rates: &RateEngine<RateKey>, addr: SocketAddr, role: Role) -> JoinHandle<()> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    rates.set_on_tick(move |engine| {
        let _ = tx.send(engine.snapshots());
    });

    tokio::spawn(async move {
        let mut reporter = Reporter::new(role, TcpCommandSink::new(addr, Duration::from_secs(5)));
        while let Some(snapshots) = rx.recv().await {
            for (key, snapshot) in snapshots {
                reporter.report_rates(key, &snapshot).await;
            }
        }
    })
}

/// Copy local files into `dest`
async fn copy_files(
    sources: Vec<PathBuf>,
    dest: PathBuf,
    mut engine: EngineConfig,
) -> anyhow::Result<()> {
    tracing::info!("Copying {} file(s) to {:?}", sources.len(), dest);

    std::fs::create_dir_all(&dest)?;
    engine.session.destination = dest.clone();
    engine.session.pull_mode = true;

    let pipeline = Arc::new(Pipeline::new(&engine)?);
    let session = pipeline.registry.create_local_session(0)?;
    pipeline
        .rates
        .register(RateKey::Session(session.id()), Arc::clone(&session) as Arc<dyn Accountable>);

    let progress = TransferProgress::new()?;
    let mut inputs = Vec::with_capacity(sources.len());
    let mut bars = Vec::with_capacity(sources.len());
    for source in &sources {
        let unit = match register_source(&session, source) {
            Ok(unit) => unit,
            Err(e) => {
                pipeline.registry.close("file registration failed");
                return Err(e);
            }
        };
        pipeline
            .rates
            .register(RateKey::File(unit.id()), Arc::clone(&unit) as Arc<dyn Accountable>);
        let name = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        bars.push((Arc::clone(&unit), progress.add(unit.size(), &name)));
        inputs.push((source.clone(), unit));
    }

    println!("Destination: {}", dest.display());
    println!("Session: {}", session.id());

    let reporter = engine
        .monitor
        .report_addr
        .map(|addr| spawn_reporter(&pipeline.rates, addr, Role::Client));
    pipeline.rates.tick();
    let sampler = spawn_sampler(
        Arc::clone(&pipeline.rates),
        engine.monitor.initial_delay,
        engine.monitor.period,
    );

    let feeder = pipeline.spawn_feeder(inputs);
    pipeline.drain(&bars).await?;
    feeder.await?;

    pipeline.rates.tick();
    sampler.stop().await;
    if let Some(reporter) = reporter {
        reporter.abort();
    }
    pipeline.manager.shutdown();

    let (reason, cause) = pipeline.registry.last_shutdown_reason();
    let avg = pipeline
        .rates
        .snapshot(&RateKey::Session(session.id()))
        .map(|s| s.avg_total_rate)
        .unwrap_or_default();
    println!();
    println!(
        "{} {} in {:.1}s ({})",
        style("Copied").bold(),
        format_bytes(session.counters().total()),
        session.elapsed().as_secs_f64(),
        format_speed(avg)
    );

    let reason = reason.unwrap_or_else(|| "transfer finished".to_string());
    match cause {
        Some(cause) => {
            eprintln!("{} {reason}: {cause}", style("error:").red().bold());
            anyhow::bail!("{reason}")
        }
        None => {
            println!("{}", style(reason).green());
            Ok(())
        }
    }
}

fn register_source(
    session: &fdx_core::Session,
    source: &Path,
) -> anyhow::Result<Arc<FileUnit>> {
    let meta = std::fs::metadata(source)
        .map_err(|e| anyhow::anyhow!("Cannot read {}: {e}", source.display()))?;
    if !meta.is_file() {
        anyhow::bail!("Not a regular file: {}", source.display());
    }
    let Some(name) = source.file_name() else {
        anyhow::bail!("Source has no file name: {}", source.display());
    };

    let spec = FileSpec {
        last_modified: meta.modified().ok(),
        ..FileSpec::new(name, meta.len())
    };
    Ok(session.add_file(spec)?)
}

/// Push `files` x `size` zero bytes into the null sink
async fn run_bench(size: u64, files: usize, mut engine: EngineConfig) -> anyhow::Result<()> {
    if files == 0 {
        anyhow::bail!("--files must be at least 1");
    }
    engine.session.pull_mode = true;

    println!("FDX pipeline benchmark");
    println!("Files: {files} x {}", format_bytes(size));
    println!(
        "Writers per partition: {}, buffers: {} x {}",
        engine.writer.writers_per_partition,
        engine.buffers.capacity,
        format_bytes(engine.buffers.buffer_size as u64)
    );

    let pipeline = Arc::new(Pipeline::new(&engine)?);
    let session = pipeline.registry.create_local_session(0)?;
    pipeline
        .rates
        .register(RateKey::Session(session.id()), Arc::clone(&session) as Arc<dyn Accountable>);

    let mut inputs = Vec::with_capacity(files);
    for _ in 0..files {
        let unit = session.add_file(FileSpec::new(DEV_NULL_PATH, size))?;
        inputs.push((PathBuf::from(DEV_ZERO_PATH), unit));
    }

    let started = Instant::now();
    pipeline.rates.tick();
    let feeder = pipeline.spawn_feeder(inputs);
    pipeline.drain(&[]).await?;
    feeder.await?;
    pipeline.rates.tick();
    let elapsed = started.elapsed();
    pipeline.manager.shutdown();

    println!();
    println!("Elapsed: {:.2}s", elapsed.as_secs_f64());
    for key in [RateKey::Manager, RateKey::Session(session.id())] {
        if let Some(snapshot) = pipeline.rates.snapshot(&key) {
            println!(
                "{key}: {} total, avg {} (payload avg {})",
                format_bytes(snapshot.total_bytes),
                format_speed(snapshot.avg_total_rate),
                format_speed(snapshot.avg_util_rate)
            );
        }
    }

    let (reason, cause) = pipeline.registry.last_shutdown_reason();
    if let Some(cause) = cause {
        anyhow::bail!(
            "benchmark ended early: {}: {cause}",
            reason.unwrap_or_default()
        );
    }
    Ok(())
}
