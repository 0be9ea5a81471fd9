//! File units and the file-channel abstraction.
//!
//! A [`FileUnit`] is one file of a transfer. Its channel is opened lazily on
//! the first write and closed once all expected bytes have arrived, so a
//! session may register many files without holding a descriptor for each.
//!
//! Channels come from a [`ChannelProvider`]. [`LocalChannelProvider`] writes
//! to the local filesystem; tests substitute providers that inject short or
//! failing writes.

use crate::accounting::Accountable;
use crate::error::Cause;
use crate::session::{FileId, SessionId};
use crate::{DEV_NULL_PATH, DEV_ZERO_PATH};
use std::collections::BTreeMap;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;
use tracing::{debug, warn};

/// Identifier of the physical device or mount a path resolves to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct PartitionId(pub u64);

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What kind of storage object a path names
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    /// A file on a real filesystem
    Regular,
    /// Discarding sink, selected by the `/dev/null` prefix
    Null,
    /// Zero-filled source, selected by the `/dev/zero` prefix
    Zero,
}

impl FileKind {
    /// Classify a path by its sentinel prefix
    #[must_use]
    pub fn of(path: &Path) -> Self {
        let s = path.to_string_lossy();
        if s.starts_with(DEV_NULL_PATH) {
            FileKind::Null
        } else if s.starts_with(DEV_ZERO_PATH) {
            FileKind::Zero
        } else {
            FileKind::Regular
        }
    }

    /// Returns true for the null and zero pseudo-files
    #[must_use]
    pub fn is_pseudo(self) -> bool {
        !matches!(self, FileKind::Regular)
    }
}

/// Space snapshot of the partition holding a file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SpaceStats {
    /// Free bytes on the partition
    pub free: u64,
    /// Bytes available to this process
    pub usable: u64,
    /// Partition size
    pub total: u64,
}

/// A writable file handle
pub trait FileChannel: Send + Sync + fmt::Debug {
    /// Write `buf` at `offset`, returning the number of bytes written
    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize>;

    /// Write `buf` at the current position
    fn append(&self, buf: &[u8]) -> io::Result<usize>;

    /// Set the file length
    fn truncate(&self, len: u64) -> io::Result<()>;

    /// Flush data and metadata to stable storage
    fn sync_all(&self) -> io::Result<()>;
}

/// Source of file channels and partition information
pub trait ChannelProvider: Send + Sync {
    /// Open `path` for writing
    fn open_writer(&self, path: &Path) -> io::Result<Arc<dyn FileChannel>>;

    /// Partition that `path` resolves to
    fn partition_of(&self, path: &Path) -> PartitionId;

    /// Free, usable and total space of the partition holding `path`
    fn space_stats(&self, path: &Path) -> io::Result<SpaceStats>;
}

/// Channel that accepts and discards every byte
#[derive(Debug, Default)]
pub struct NullChannel {
    written: AtomicU64,
}

impl NullChannel {
    /// Create a null channel
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes discarded so far
    #[must_use]
    pub fn written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }
}

impl FileChannel for NullChannel {
    fn write_at(&self, buf: &[u8], _offset: u64) -> io::Result<usize> {
        self.written.fetch_add(buf.len() as u64, Ordering::Relaxed);
        Ok(buf.len())
    }

    fn append(&self, buf: &[u8]) -> io::Result<usize> {
        self.write_at(buf, 0)
    }

    fn truncate(&self, _len: u64) -> io::Result<()> {
        Ok(())
    }

    fn sync_all(&self) -> io::Result<()> {
        Ok(())
    }
}

/// Channel over a local [`File`]
#[derive(Debug)]
struct LocalFileChannel {
    file: File,
}

impl FileChannel for LocalFileChannel {
    #[cfg(unix)]
    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize> {
        use std::os::unix::fs::FileExt;
        self.file.write_at(buf, offset)
    }

    #[cfg(windows)]
    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize> {
        use std::os::windows::fs::FileExt;
        self.file.seek_write(buf, offset)
    }

    fn append(&self, buf: &[u8]) -> io::Result<usize> {
        (&self.file).write(buf)
    }

    fn truncate(&self, len: u64) -> io::Result<()> {
        self.file.set_len(len)
    }

    fn sync_all(&self) -> io::Result<()> {
        self.file.sync_all()
    }
}

/// Channel provider backed by the local filesystem
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalChannelProvider;

impl LocalChannelProvider {
    /// Create a local provider
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

/// Walk up from `path` to the first ancestor that exists
fn nearest_existing(path: &Path) -> &Path {
    path.ancestors()
        .find(|p| !p.as_os_str().is_empty() && p.exists())
        .unwrap_or(Path::new("."))
}

impl ChannelProvider for LocalChannelProvider {
    fn open_writer(&self, path: &Path) -> io::Result<Arc<dyn FileChannel>> {
        if FileKind::of(path).is_pseudo() {
            return Ok(Arc::new(NullChannel::new()));
        }
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        Ok(Arc::new(LocalFileChannel { file }))
    }

    #[cfg(unix)]
    fn partition_of(&self, path: &Path) -> PartitionId {
        use std::os::unix::fs::MetadataExt;

        if FileKind::of(path).is_pseudo() {
            return PartitionId(0);
        }
        fs::metadata(nearest_existing(path))
            .ok()
            .map(|m| PartitionId(m.dev()))
            .unwrap_or_default()
    }

    #[cfg(not(unix))]
    fn partition_of(&self, _path: &Path) -> PartitionId {
        PartitionId(0)
    }

    fn space_stats(&self, path: &Path) -> io::Result<SpaceStats> {
        let probe = nearest_existing(path);
        Ok(SpaceStats {
            free: fs2::free_space(probe)?,
            usable: fs2::available_space(probe)?,
            total: fs2::total_space(probe)?,
        })
    }
}

enum ChannelState {
    Unopened,
    Open(Arc<dyn FileChannel>),
    Closed,
}

/// One file of a transfer session
pub struct FileUnit {
    id: FileId,
    session_id: SessionId,
    path: PathBuf,
    kind: FileKind,
    size: u64,
    processed: AtomicU64,
    /// Disjoint written ranges, start to end
    written: Mutex<BTreeMap<u64, u64>>,
    partition: PartitionId,
    last_modified: Option<SystemTime>,
    is_loop: bool,
    provider: Arc<dyn ChannelProvider>,
    channel: Mutex<ChannelState>,
    closed: AtomicBool,
    cause: Mutex<Option<Cause>>,
}

impl FileUnit {
    /// Create a file unit; the partition is resolved through `provider`
    #[must_use]
    pub fn new(
        session_id: SessionId,
        id: FileId,
        path: impl Into<PathBuf>,
        size: u64,
        is_loop: bool,
        provider: Arc<dyn ChannelProvider>,
    ) -> Self {
        let path = path.into();
        let kind = FileKind::of(&path);
        let partition = provider.partition_of(&path);
        Self {
            id,
            session_id,
            path,
            kind,
            size,
            processed: AtomicU64::new(0),
            written: Mutex::new(BTreeMap::new()),
            partition,
            last_modified: None,
            is_loop,
            provider,
            channel: Mutex::new(ChannelState::Unopened),
            closed: AtomicBool::new(false),
            cause: Mutex::new(None),
        }
    }

    /// Set the last-modified timestamp
    #[must_use]
    pub fn with_last_modified(mut self, mtime: Option<SystemTime>) -> Self {
        self.last_modified = mtime;
        self
    }

    /// File identifier
    pub fn id(&self) -> FileId {
        self.id
    }

    /// Owning session
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Target path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Storage kind
    pub fn kind(&self) -> FileKind {
        self.kind
    }

    /// Declared size in bytes
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Bytes written so far
    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Acquire)
    }

    /// Partition the target resolves to
    pub fn partition(&self) -> PartitionId {
        self.partition
    }

    /// Last-modified timestamp of the source, if known
    pub fn last_modified(&self) -> Option<SystemTime> {
        self.last_modified
    }

    /// Loop mode: writes append and the file never completes
    pub fn is_loop(&self) -> bool {
        self.is_loop
    }

    /// The open channel, opening it on first use.
    ///
    /// Returns `Ok(None)` once the unit has been closed.
    ///
    /// # Errors
    ///
    /// Returns the I/O error raised while opening the target.
    pub fn channel(&self) -> io::Result<Option<Arc<dyn FileChannel>>> {
        let mut state = lock(&self.channel);
        match &*state {
            ChannelState::Open(ch) => Ok(Some(Arc::clone(ch))),
            ChannelState::Closed => Ok(None),
            ChannelState::Unopened => {
                if self.closed.load(Ordering::Acquire) {
                    *state = ChannelState::Closed;
                    return Ok(None);
                }
                let ch = self.provider.open_writer(&self.path)?;
                debug!(file = %self.id, path = %self.path.display(), "Opened file channel");
                *state = ChannelState::Open(Arc::clone(&ch));
                Ok(Some(ch))
            }
        }
    }

    /// Add `n` written bytes and return the new total
    pub fn add_processed(&self, n: u64) -> u64 {
        self.processed.fetch_add(n, Ordering::AcqRel) + n
    }

    /// Record `len` bytes written at `offset` and return the new processed
    /// total.
    ///
    /// Only bytes no earlier write covered count towards the total, so a
    /// resent block cannot complete a file that still has a hole. Loop
    /// files append and count every byte.
    pub fn record_written(&self, offset: u64, len: u64) -> u64 {
        if self.is_loop || len == 0 {
            return self.add_processed(len);
        }

        let end = offset.saturating_add(len);
        let mut ranges = lock(&self.written);
        let (mut start, mut stop, mut overlap) = (offset, end, 0);

        let before = ranges
            .range(..offset)
            .next_back()
            .filter(|&(_, &e)| e >= offset)
            .map(|(&s, _)| s);
        let touching: Vec<u64> = before
            .into_iter()
            .chain(ranges.range(offset..=end).map(|(&s, _)| s))
            .collect();
        for s in touching {
            if let Some(e) = ranges.remove(&s) {
                overlap += e.min(end).saturating_sub(s.max(offset));
                start = start.min(s);
                stop = stop.max(e);
            }
        }
        ranges.insert(start, stop);

        self.add_processed(len - overlap)
    }

    /// Returns true once all declared bytes have been written
    pub fn is_complete(&self) -> bool {
        !self.is_loop && self.processed() >= self.size
    }

    /// Close the channel, optionally flushing it to stable storage first
    ///
    /// # Errors
    ///
    /// Returns the error raised by the flush.
    pub fn close_channel(&self, force: bool) -> io::Result<()> {
        let previous = std::mem::replace(&mut *lock(&self.channel), ChannelState::Closed);
        if let ChannelState::Open(ch) = previous {
            if force && !self.kind.is_pseudo() {
                ch.sync_all()?;
            }
        }
        Ok(())
    }

    /// Close the unit, recording `cause` if it failed.
    ///
    /// Returns true if this call closed it.
    pub fn close(&self, cause: Option<Cause>) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        if let Some(cause) = cause {
            *lock(&self.cause) = Some(cause);
        }
        if let Err(e) = self.close_channel(false) {
            warn!(file = %self.id, error = %e, "Error closing file channel");
        }
        true
    }

    /// Returns true once the unit has been closed
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Failure cause recorded at close
    pub fn cause(&self) -> Option<Cause> {
        lock(&self.cause).clone()
    }

    /// Space snapshot of the partition holding the target
    ///
    /// # Errors
    ///
    /// Returns the error raised while querying the filesystem.
    pub fn space_stats(&self) -> io::Result<SpaceStats> {
        self.provider.space_stats(&self.path)
    }
}

impl Accountable for FileUnit {
    fn total_bytes(&self) -> u64 {
        self.processed()
    }

    fn util_bytes(&self) -> u64 {
        self.processed()
    }
}

impl fmt::Debug for FileUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileUnit")
            .field("id", &self.id)
            .field("session_id", &self.session_id)
            .field("path", &self.path)
            .field("kind", &self.kind)
            .field("size", &self.size)
            .field("processed", &self.processed())
            .field("partition", &self.partition)
            .field("is_loop", &self.is_loop)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Lock a mutex, recovering the data if a writer panicked while holding it
pub(crate) fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn unit(path: impl Into<PathBuf>, size: u64) -> FileUnit {
        FileUnit::new(
            SessionId::new(),
            FileId::new(),
            path,
            size,
            false,
            Arc::new(LocalChannelProvider::new()),
        )
    }

    #[test]
    fn test_file_kind_from_prefix() {
        assert_eq!(FileKind::of(Path::new("/dev/null")), FileKind::Null);
        assert_eq!(FileKind::of(Path::new("/dev/zero")), FileKind::Zero);
        assert_eq!(FileKind::of(Path::new("/tmp/data.bin")), FileKind::Regular);
        assert!(FileKind::Null.is_pseudo());
        assert!(!FileKind::Regular.is_pseudo());
    }

    #[test]
    fn test_channel_opened_lazily() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/out.bin");
        let file = unit(&path, 4);

        assert!(!path.exists());
        let ch = file.channel().unwrap().unwrap();
        assert!(path.exists());

        assert_eq!(ch.write_at(b"abcd", 0).unwrap(), 4);
        file.close_channel(true).unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"abcd");
    }

    #[test]
    fn test_closed_unit_has_no_channel() {
        let dir = TempDir::new().unwrap();
        let file = unit(dir.path().join("out.bin"), 10);

        assert!(file.close(None));
        assert!(!file.close(None));
        assert!(file.is_closed());
        assert!(file.channel().unwrap().is_none());
    }

    #[test]
    fn test_close_records_cause() {
        let file = unit("/dev/null", 10);
        let cause: Cause = Arc::new(crate::Error::control("peer gone"));
        assert!(file.close(Some(cause)));
        assert!(file.cause().is_some());
    }

    #[test]
    fn test_add_processed_and_completion() {
        let file = unit("/dev/null", 8192);
        assert!(!file.is_complete());
        assert_eq!(file.add_processed(4096), 4096);
        assert!(!file.is_complete());
        assert_eq!(file.add_processed(4096), 8192);
        assert!(file.is_complete());
        assert_eq!(file.total_bytes(), 8192);
    }

    #[test]
    fn test_rewritten_range_is_not_counted_twice() {
        let file = unit("/dev/null", 3 * 4096);
        assert_eq!(file.record_written(0, 4096), 4096);
        assert_eq!(file.record_written(0, 4096), 4096);
        assert_eq!(file.record_written(8192, 4096), 8192);
        assert!(!file.is_complete());

        // Straddles both existing ranges and fills the hole between them
        assert_eq!(file.record_written(2048, 8192), 3 * 4096);
        assert!(file.is_complete());
    }

    #[test]
    fn test_adjacent_ranges_merge() {
        let file = unit("/dev/null", 300);
        assert_eq!(file.record_written(100, 100), 100);
        assert_eq!(file.record_written(200, 100), 200);
        assert_eq!(file.record_written(0, 100), 300);
        assert_eq!(lock(&file.written).len(), 1);
        assert_eq!(file.record_written(50, 200), 300);
    }

    #[test]
    fn test_loop_file_never_completes() {
        let file = FileUnit::new(
            SessionId::new(),
            FileId::new(),
            "/dev/null",
            10,
            true,
            Arc::new(LocalChannelProvider::new()),
        );
        file.add_processed(100);
        assert!(!file.is_complete());
    }

    #[test]
    fn test_null_sink_partition_and_channel() {
        let file = unit("/dev/null", 1024);
        assert_eq!(file.partition(), PartitionId(0));
        assert_eq!(file.kind(), FileKind::Null);

        let ch = file.channel().unwrap().unwrap();
        assert_eq!(ch.write_at(&[0u8; 1024], 0).unwrap(), 1024);
    }

    #[test]
    fn test_space_stats_of_missing_file() {
        let dir = TempDir::new().unwrap();
        let file = unit(dir.path().join("a/b/c.bin"), 1);
        let stats = file.space_stats().unwrap();
        assert!(stats.total > 0);
        assert!(stats.free <= stats.total);
    }

    #[cfg(unix)]
    #[test]
    fn test_partition_resolves_through_missing_directories() {
        let dir = TempDir::new().unwrap();
        let provider = LocalChannelProvider::new();
        let existing = provider.partition_of(dir.path());
        let missing = provider.partition_of(&dir.path().join("x/y/z.bin"));
        assert_eq!(existing, missing);
    }
}
