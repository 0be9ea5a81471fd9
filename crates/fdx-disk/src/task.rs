//! Disk writer worker.
//!
//! Each worker drains one partition queue and writes every block at its
//! explicit offset, so blocks of a file may be taken by any worker of the
//! partition in any order. A write step ends in one of three ways:
//!
//! - the block is written and accounted on the file, the worker, the
//!   manager and the session
//! - the block is dropped because its session or file is already gone
//! - a [`WriteFailure`] scoped to the file or to the whole session
//!
//! The block's buffer returns to the pool when the block is dropped at the
//! end of [`DiskWriterTask::process`], whatever the outcome.

use crate::space::classify_short_write;
use crossbeam_channel::{Receiver, TryRecvError, select};
use fdx_core::{
    Accountable, Block, ByteCounters, Error, FileChannel, FileKind, FileUnit, PartitionId,
    Session, SessionRegistry, WriterConfig, align_up,
};
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

/// Which scope a failed write takes down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureScope {
    /// Only the file unit the block belongs to
    File,
    /// The whole owning session
    Session,
}

/// A failed write step
#[derive(Debug)]
pub struct WriteFailure {
    /// Scope of the failure
    pub scope: FailureScope,
    /// Root cause
    pub error: Error,
}

impl WriteFailure {
    fn file(error: impl Into<Error>) -> Self {
        Self {
            scope: FailureScope::File,
            error: error.into(),
        }
    }

    fn session(error: Error) -> Self {
        Self {
            scope: FailureScope::Session,
            error,
        }
    }
}

/// Result of a write step that did not fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Bytes written at the block's offset
    Written(u64),
    /// The block's owner is gone; nothing was written
    Dropped(&'static str),
}

/// Cumulative time spent in each phase, in nanoseconds
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TimingCounters {
    /// Waiting for a block
    pub take_nanos: u64,
    /// Inside the write call
    pub write_nanos: u64,
    /// Closing finished files
    pub finish_nanos: u64,
    /// Whole iterations
    pub total_nanos: u64,
}

/// Per-worker statistics
#[derive(Debug, Default)]
pub struct WriterStats {
    counters: ByteCounters,
    blocks: AtomicU64,
    dropped: AtomicU64,
    errors: AtomicU64,
    timing: RwLock<TimingCounters>,
}

impl WriterStats {
    /// Blocks written
    pub fn blocks(&self) -> u64 {
        self.blocks.load(Ordering::Relaxed)
    }

    /// Blocks dropped because their owner was gone
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Failed write steps
    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    /// Snapshot of the timing counters
    pub fn timing(&self) -> TimingCounters {
        *self
            .timing
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn add_timing(&self, take: Duration, write: Duration, finish: Duration, total: Duration) {
        let mut t = self
            .timing
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        t.take_nanos += take.as_nanos() as u64;
        t.write_nanos += write.as_nanos() as u64;
        t.finish_nanos += finish.as_nanos() as u64;
        t.total_nanos += total.as_nanos() as u64;
    }
}

impl Accountable for WriterStats {
    fn total_bytes(&self) -> u64 {
        self.counters.total()
    }

    fn util_bytes(&self) -> u64 {
        self.counters.util()
    }
}

/// One worker of a partition queue group
pub(crate) struct DiskWriterTask {
    pub(crate) partition: PartitionId,
    pub(crate) index: usize,
    pub(crate) blocks: Receiver<Block>,
    pub(crate) stop: Receiver<()>,
    pub(crate) registry: Arc<SessionRegistry>,
    pub(crate) config: Arc<WriterConfig>,
    pub(crate) global: Arc<ByteCounters>,
    pub(crate) stats: Arc<WriterStats>,
}

impl DiskWriterTask {
    /// Worker loop: runs until stopped and the queue is empty
    pub(crate) fn run(self) {
        info!(
            partition = %self.partition,
            writer = self.index,
            "Disk writer STARTED"
        );

        let mut stopping = false;
        loop {
            let take_start = Instant::now();
            let block = if stopping {
                match self.blocks.try_recv() {
                    Ok(block) => block,
                    Err(TryRecvError::Empty | TryRecvError::Disconnected) => break,
                }
            } else {
                select! {
                    recv(self.blocks) -> msg => match msg {
                        Ok(block) => block,
                        Err(_) => break,
                    },
                    recv(self.stop) -> _ => {
                        debug!(partition = %self.partition, writer = self.index, "Stop requested, draining queue");
                        stopping = true;
                        continue;
                    },
                    default(self.config.poll_interval) => {
                        trace!(partition = %self.partition, writer = self.index, "Idle poll");
                        continue;
                    },
                }
            };
            self.process(block, take_start);
        }

        info!(
            partition = %self.partition,
            writer = self.index,
            bytes = self.stats.total_bytes(),
            blocks = self.stats.blocks(),
            errors = self.stats.errors(),
            "Disk writer STOPPED"
        );
    }

    /// Write one block, attribute any failure, and release the block
    pub(crate) fn process(&self, mut block: Block, take_start: Instant) {
        let take = take_start.elapsed();
        let mut timing = StepTiming::default();

        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            self.write_block(&mut block, &mut timing)
        }))
        .unwrap_or_else(|payload| {
            let msg = payload
                .downcast_ref::<&str>()
                .map(|s| (*s).to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "panic while writing block".to_string());
            Err(WriteFailure::file(Error::Unexpected(msg)))
        });

        match result {
            Ok(WriteOutcome::Written(n)) => {
                trace!(
                    partition = %self.partition,
                    session = %block.session_id,
                    file = %block.file_id,
                    offset = block.offset,
                    bytes = n,
                    "Block written"
                );
            }
            Ok(WriteOutcome::Dropped(reason)) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    partition = %self.partition,
                    session = %block.session_id,
                    file = %block.file_id,
                    offset = block.offset,
                    "Dropping block: {}",
                    reason
                );
            }
            Err(failure) => {
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                self.handle_failure(&block, failure);
            }
        }

        self.stats
            .add_timing(take, timing.write, timing.finish, take_start.elapsed());
        drop(block);
    }

    fn write_block(
        &self,
        block: &mut Block,
        timing: &mut StepTiming,
    ) -> Result<WriteOutcome, WriteFailure> {
        let Some(session) = self.registry.get(block.session_id) else {
            return Ok(WriteOutcome::Dropped("no such session"));
        };
        if session.is_closed() {
            return Ok(WriteOutcome::Dropped("session closed"));
        }
        let Some(file) = session.file(block.file_id) else {
            return Ok(WriteOutcome::Dropped("no such file in session"));
        };
        let Some(channel) = file.channel().map_err(WriteFailure::file)? else {
            return Ok(WriteOutcome::Dropped("file closed"));
        };

        let len = block.len();
        if len == 0 {
            if !file.is_loop() && file.processed() == file.size() {
                self.complete(&session, &file, timing);
            }
            return Ok(WriteOutcome::Written(0));
        }

        if !file.is_loop() && block.end() > file.size() {
            return Err(WriteFailure::file(Error::BlockOutOfBounds {
                path: file.path().to_path_buf(),
                offset: block.offset,
                len,
                size: file.size(),
            }));
        }

        let write_start = Instant::now();
        let written = self
            .write_to_channel(channel.as_ref(), &file, block)
            .map_err(WriteFailure::file)?;
        timing.write = write_start.elapsed();

        if written == 0 {
            return Err(WriteFailure::file(Error::NoBytesWritten {
                path: file.path().to_path_buf(),
                offset: block.offset,
            }));
        }
        if written < len {
            return Err(WriteFailure::session(classify_short_write(
                &file,
                block.offset,
                len,
                written,
                block.capacity(),
                self.config.min_free_ratio,
            )));
        }

        let n = written as u64;
        let processed = file.record_written(block.offset, n);
        self.stats.counters.add_both(n);
        self.stats.blocks.fetch_add(1, Ordering::Relaxed);
        self.global.add_both(n);
        session.counters().add_both(n);

        if !file.is_loop() && processed == file.size() {
            self.complete(&session, &file, timing);
        }
        Ok(WriteOutcome::Written(n))
    }

    /// Write the payload and return how many payload bytes landed
    fn write_to_channel(
        &self,
        channel: &dyn FileChannel,
        file: &FileUnit,
        block: &mut Block,
    ) -> io::Result<usize> {
        if file.is_loop() {
            return channel.append(block.data());
        }

        let len = block.len();
        let offset = block.offset;
        let aligned = align_up(len);
        let pad_tail = self.config.align_writes
            && file.kind() == FileKind::Regular
            && aligned != len
            && block.end() == file.size();

        if pad_tail {
            if let Some(padded) = block.padded(aligned) {
                let n = channel.write_at(padded, offset)?;
                channel.truncate(offset + len as u64)?;
                return Ok(n.min(len));
            }
        }
        channel.write_at(block.data(), offset)
    }

    /// Close a file whose last byte has been written and finish the session
    /// once every file is done
    fn complete(&self, session: &Arc<Session>, file: &Arc<FileUnit>, timing: &mut StepTiming) {
        let start = Instant::now();

        let cause = file
            .close_channel(self.config.force_on_close)
            .err()
            .map(|e| {
                error!(file = %file.id(), error = %e, "Failed to flush finished file");
                Arc::new(Error::Io(e))
            });

        let all_done = session.finish_file(file.id(), cause.clone());
        file.close(cause);
        debug!(
            partition = %self.partition,
            session = %session.id(),
            file = %file.id(),
            bytes = file.processed(),
            "File complete"
        );

        if all_done {
            self.registry
                .finish(session.id(), "transfer finished", session.first_failure());
        }
        timing.finish = start.elapsed();
    }

    fn handle_failure(&self, block: &Block, failure: WriteFailure) {
        let WriteFailure { scope, error } = failure;

        if let Error::Io(e) = &error {
            if e.kind() == io::ErrorKind::Interrupted {
                error!(
                    partition = %self.partition,
                    session = %block.session_id,
                    file = %block.file_id,
                    offset = block.offset,
                    "Disk writer interrupted while writing block"
                );
            }
        }

        let cause = Arc::new(error);
        match scope {
            FailureScope::Session => {
                error!(
                    partition = %self.partition,
                    session = %block.session_id,
                    file = %block.file_id,
                    offset = block.offset,
                    error = %cause,
                    "Session-fatal write failure"
                );
                self.registry
                    .finish(block.session_id, "disk write failed", Some(cause));
            }
            FailureScope::File => {
                error!(
                    partition = %self.partition,
                    session = %block.session_id,
                    file = %block.file_id,
                    offset = block.offset,
                    error = %cause,
                    "File-fatal write failure"
                );
                let Some(session) = self.registry.get(block.session_id) else {
                    return;
                };
                let Some(file) = session.file(block.file_id) else {
                    return;
                };
                let all_done = session.finish_file(file.id(), Some(Arc::clone(&cause)));
                file.close(Some(cause));
                if all_done {
                    self.registry.finish(
                        session.id(),
                        "transfer finished with errors",
                        session.first_failure(),
                    );
                }
            }
        }
    }
}

#[derive(Debug, Default)]
struct StepTiming {
    write: Duration,
    finish: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;
    use fdx_core::{
        BufferPool, ChannelProvider, FileSpec, LocalChannelProvider, SessionConfig, SpaceStats,
    };
    use std::path::Path;
    use tempfile::TempDir;

    struct Fixture {
        registry: Arc<SessionRegistry>,
        pool: Arc<BufferPool>,
        task: DiskWriterTask,
        _dir: TempDir,
        dir_path: std::path::PathBuf,
    }

    fn fixture_with(provider: Arc<dyn ChannelProvider>, loop_mode: bool) -> Fixture {
        let dir = TempDir::new().unwrap();
        let config = SessionConfig {
            destination: dir.path().to_path_buf(),
            pull_mode: true,
            loop_mode,
            drain_recheck_interval: Duration::from_millis(20),
        };
        let registry = SessionRegistry::new(config, provider);
        let (_tx, blocks) = bounded(1);
        let (_stop_tx, stop) = bounded(0);
        let task = DiskWriterTask {
            partition: PartitionId(1),
            index: 0,
            blocks,
            stop,
            registry: Arc::clone(&registry),
            config: Arc::new(WriterConfig::default()),
            global: Arc::new(ByteCounters::new()),
            stats: Arc::new(WriterStats::default()),
        };
        Fixture {
            registry,
            pool: BufferPool::new(8192, 8),
            task,
            dir_path: dir.path().to_path_buf(),
            _dir: dir,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(Arc::new(LocalChannelProvider::new()), false)
    }

    fn block(f: &Fixture, session: &Session, file: &FileUnit, offset: u64, data: &[u8]) -> Block {
        let mut buf = f.pool.acquire();
        let n = buf.fill_from(data);
        Block::new(session.id(), file.id(), offset, buf, n)
    }

    #[test]
    fn test_two_blocks_complete_file() {
        let f = fixture();
        let session = f.registry.create_local_session(0).unwrap();
        let file = session.add_file(FileSpec::new("out.bin", 8192)).unwrap();

        let a = vec![1u8; 4096];
        let b = vec![2u8; 4096];
        f.task.process(block(&f, &session, &file, 4096, &b), Instant::now());
        assert!(!file.is_closed());
        f.task.process(block(&f, &session, &file, 0, &a), Instant::now());

        assert_eq!(file.processed(), 8192);
        assert!(file.is_closed());
        assert_eq!(session.completions().len(), 1);
        assert!(session.completions()[0].cause.is_none());
        assert!(f.registry.get(session.id()).is_none());

        let content = std::fs::read(f.dir_path.join("out.bin")).unwrap();
        assert_eq!(&content[..4096], &a[..]);
        assert_eq!(&content[4096..], &b[..]);
        assert_eq!(f.task.global.total(), 8192);
        assert_eq!(session.counters().total(), 8192);
        assert_eq!(f.task.stats.total_bytes(), 8192);
        assert_eq!(f.pool.outstanding(), 0);
    }

    #[test]
    fn test_resent_block_does_not_complete_file() {
        let f = fixture();
        let session = f.registry.create_local_session(0).unwrap();
        let file = session.add_file(FileSpec::new("holes.bin", 3 * 4096)).unwrap();

        let data = vec![9u8; 4096];
        for offset in [0, 4096, 4096] {
            f.task
                .process(block(&f, &session, &file, offset, &data), Instant::now());
        }
        assert_eq!(file.processed(), 8192);
        assert!(!file.is_closed());
        assert_eq!(f.task.stats.total_bytes(), 3 * 4096);

        f.task
            .process(block(&f, &session, &file, 8192, &data), Instant::now());
        assert!(file.is_closed());
        assert!(f.registry.get(session.id()).is_none());
    }

    #[test]
    fn test_unaligned_tail_truncated() {
        let f = fixture();
        let session = f.registry.create_local_session(0).unwrap();
        let file = session.add_file(FileSpec::new("tail.bin", 5000)).unwrap();

        let data: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        f.task.process(block(&f, &session, &file, 0, &data), Instant::now());

        let content = std::fs::read(f.dir_path.join("tail.bin")).unwrap();
        assert_eq!(content, data);
        assert_eq!(file.processed(), 5000);
        assert!(file.is_closed());
    }

    #[test]
    fn test_missing_session_is_benign_drop() {
        let f = fixture();
        let pool = Arc::clone(&f.pool);
        let b = Block::new(
            fdx_core::SessionId::new(),
            fdx_core::FileId::new(),
            0,
            pool.acquire(),
            10,
        );
        f.task.process(b, Instant::now());

        assert_eq!(f.task.stats.dropped(), 1);
        assert_eq!(f.task.stats.errors(), 0);
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_out_of_bounds_block_fails_file() {
        let f = fixture();
        let session = f.registry.create_local_session(0).unwrap();
        let file = session.add_file(FileSpec::new("small.bin", 100)).unwrap();
        let other = session.add_file(FileSpec::new("other.bin", 100)).unwrap();

        f.task
            .process(block(&f, &session, &file, 50, &[0u8; 100]), Instant::now());

        assert!(file.is_closed());
        assert!(matches!(
            file.cause().as_deref(),
            Some(Error::BlockOutOfBounds { .. })
        ));
        assert!(!other.is_closed());
        assert!(f.registry.get(session.id()).is_some());
        assert_eq!(f.task.stats.errors(), 1);
    }

    #[test]
    fn test_empty_file_completes_on_empty_block() {
        let f = fixture();
        let session = f.registry.create_local_session(0).unwrap();
        let file = session.add_file(FileSpec::new("empty.bin", 0)).unwrap();

        f.task.process(block(&f, &session, &file, 0, &[]), Instant::now());
        assert!(file.is_closed());
        assert!(f.dir_path.join("empty.bin").exists());
        assert!(f.registry.get(session.id()).is_none());
    }

    #[derive(Debug)]
    struct PanickingChannel;

    impl FileChannel for PanickingChannel {
        fn write_at(&self, _buf: &[u8], _offset: u64) -> io::Result<usize> {
            panic!("device exploded");
        }
        fn append(&self, _buf: &[u8]) -> io::Result<usize> {
            panic!("device exploded");
        }
        fn truncate(&self, _len: u64) -> io::Result<()> {
            Ok(())
        }
        fn sync_all(&self) -> io::Result<()> {
            Ok(())
        }
    }

    struct PanickingProvider;

    impl ChannelProvider for PanickingProvider {
        fn open_writer(&self, _path: &Path) -> io::Result<Arc<dyn FileChannel>> {
            Ok(Arc::new(PanickingChannel))
        }
        fn partition_of(&self, _path: &Path) -> PartitionId {
            PartitionId(1)
        }
        fn space_stats(&self, _path: &Path) -> io::Result<SpaceStats> {
            Ok(SpaceStats::default())
        }
    }

    #[test]
    fn test_panic_is_file_fatal() {
        let f = fixture_with(Arc::new(PanickingProvider), false);
        let session = f.registry.create_local_session(0).unwrap();
        let file = session.add_file(FileSpec::new("boom.bin", 10)).unwrap();

        f.task
            .process(block(&f, &session, &file, 0, &[1u8; 10]), Instant::now());

        assert!(file.is_closed());
        assert!(matches!(file.cause().as_deref(), Some(Error::Unexpected(_))));
        assert_eq!(f.pool.outstanding(), 0);
    }

    #[test]
    fn test_loop_mode_never_completes() {
        let f = fixture_with(Arc::new(LocalChannelProvider::new()), true);
        let session = f.registry.create_local_session(0).unwrap();
        let file = session.add_file(FileSpec::new("/dev/null", 4096)).unwrap();

        for _ in 0..3 {
            f.task
                .process(block(&f, &session, &file, 0, &[0u8; 4096]), Instant::now());
        }
        assert_eq!(file.processed(), 3 * 4096);
        assert!(!file.is_closed());
        assert!(f.registry.get(session.id()).is_some());
    }

    #[test]
    fn test_timing_recorded() {
        let f = fixture();
        let session = f.registry.create_local_session(0).unwrap();
        let file = session.add_file(FileSpec::new("t.bin", 4096)).unwrap();
        f.task
            .process(block(&f, &session, &file, 0, &[3u8; 4096]), Instant::now());

        let timing = f.task.stats.timing();
        assert!(timing.total_nanos >= timing.write_nanos);
        assert_eq!(f.task.stats.blocks(), 1);
    }
}
