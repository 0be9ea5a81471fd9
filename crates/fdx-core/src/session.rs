//! Transfer sessions
//!
//! A [`Session`] is one transfer between two peers. Reader and writer
//! sessions share one record and differ only in their [`Direction`]: writer
//! sessions resolve incoming file names under the configured destination,
//! reader sessions read the paths they are given.

use crate::accounting::{Accountable, ByteCounters};
use crate::config::SessionConfig;
use crate::error::{Cause, Error, Result};
use crate::file::{ChannelProvider, FileKind, FileUnit, lock};
use dashmap::DashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Instant, SystemTime};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Process-unique session identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Generate a fresh random identifier
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID
    #[must_use]
    pub const fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    /// The underlying UUID
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Per-session file identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileId(Uuid);

impl FileId {
    /// Generate a fresh random identifier
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID
    #[must_use]
    pub const fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }
}

impl Default for FileId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Role of this side in a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Reads local files and sends them
    Reader,
    /// Receives blocks and writes them to disk
    Writer,
}

/// Control-plane message exchanged with the peer
#[derive(Debug, Clone, PartialEq)]
pub enum ControlMessage {
    /// Files the transfer will move
    FileList(Vec<FileSpec>),
    /// One file finished on the sending side
    FileFinished {
        /// Finished file
        file_id: FileId,
        /// Failure description, if the file failed
        error: Option<String>,
    },
    /// The peer aborted the transfer
    Abort {
        /// Human-readable reason
        reason: String,
    },
    /// Liveness probe
    KeepAlive,
}

/// What the registry must do after a session handled a control message
#[derive(Debug)]
pub enum ControlAction {
    /// Nothing further
    Continue,
    /// Finish the session
    Finish {
        /// Shutdown message
        message: String,
        /// Root cause, if the session failed
        cause: Option<Cause>,
    },
}

/// Transport handle for a session's control channel
pub trait ControlHandle: Send + Sync {
    /// Bind the handle to a freshly registered session
    ///
    /// # Errors
    ///
    /// Returns an error if the transport cannot be attached.
    fn attach(&self, session_id: SessionId) -> Result<()>;

    /// Session this handle is bound to
    fn session_id(&self) -> Option<SessionId>;

    /// Returns true if the remote peer asked to pull data from this side
    fn remote_pull(&self) -> bool;

    /// Send a control message to the peer
    ///
    /// # Errors
    ///
    /// Returns an error if the message could not be sent.
    fn send(&self, msg: ControlMessage) -> Result<()>;

    /// Close the transport
    fn close(&self, message: &str, cause: Option<Cause>);
}

/// Where a session's control messages come from
#[derive(Clone)]
pub enum Endpoint {
    /// A remote peer behind a control channel
    Remote(Arc<dyn ControlHandle>),
    /// A local transfer bound to a port
    Local {
        /// Local port
        port: u16,
    },
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Remote(h) => f
                .debug_tuple("Remote")
                .field(&h.session_id())
                .finish(),
            Endpoint::Local { port } => f.debug_struct("Local").field("port", port).finish(),
        }
    }
}

/// Description of one file in a transfer
#[derive(Debug, Clone, PartialEq)]
pub struct FileSpec {
    /// File identifier shared with the peer
    pub id: FileId,
    /// File name (relative for writers) or path (readers)
    pub name: PathBuf,
    /// Size in bytes; readers take it from metadata when absent
    pub size: Option<u64>,
    /// Last-modified time of the source
    pub last_modified: Option<SystemTime>,
}

impl FileSpec {
    /// Describe a file of known size
    #[must_use]
    pub fn new(name: impl Into<PathBuf>, size: u64) -> Self {
        Self {
            id: FileId::new(),
            name: name.into(),
            size: Some(size),
            last_modified: None,
        }
    }

    /// Describe a local file whose size is read from its metadata
    #[must_use]
    pub fn local(path: impl Into<PathBuf>) -> Self {
        Self {
            id: FileId::new(),
            name: path.into(),
            size: None,
            last_modified: None,
        }
    }
}

/// Outcome of one finished file
#[derive(Debug, Clone)]
pub struct FileCompletion {
    /// Finished file
    pub file_id: FileId,
    /// Failure cause, `None` on success
    pub cause: Option<Cause>,
}

#[derive(Default)]
struct Progress {
    completions: Vec<FileCompletion>,
    first_failure: Option<Cause>,
}

/// One end-to-end transfer
pub struct Session {
    id: SessionId,
    direction: Direction,
    endpoint: Endpoint,
    destination: PathBuf,
    loop_mode: bool,
    provider: Arc<dyn ChannelProvider>,
    files: DashMap<FileId, Arc<FileUnit>>,
    pending: AtomicUsize,
    progress: Mutex<Progress>,
    counters: ByteCounters,
    closed: AtomicBool,
    down: Mutex<Option<(String, Option<Cause>)>>,
    started: Instant,
}

impl Session {
    /// Create a session with no files
    #[must_use]
    pub fn new(
        id: SessionId,
        direction: Direction,
        endpoint: Endpoint,
        config: &SessionConfig,
        provider: Arc<dyn ChannelProvider>,
    ) -> Self {
        Self {
            id,
            direction,
            endpoint,
            destination: config.destination.clone(),
            loop_mode: config.loop_mode,
            provider,
            files: DashMap::new(),
            pending: AtomicUsize::new(0),
            progress: Mutex::new(Progress::default()),
            counters: ByteCounters::new(),
            closed: AtomicBool::new(false),
            down: Mutex::new(None),
            started: Instant::now(),
        }
    }

    /// Session identifier
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Role of this side
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Control endpoint
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Loop mode
    pub fn is_loop(&self) -> bool {
        self.loop_mode
    }

    /// Byte counters updated by every write for this session
    pub fn counters(&self) -> &ByteCounters {
        &self.counters
    }

    /// Time since the session was created
    pub fn elapsed(&self) -> std::time::Duration {
        self.started.elapsed()
    }

    /// Register a file to transfer
    ///
    /// # Errors
    ///
    /// Fails if the session is closed, if a writer is given a file without
    /// a size, or if a reader cannot stat its source.
    pub fn add_file(&self, spec: FileSpec) -> Result<Arc<FileUnit>> {
        if self.is_closed() {
            return Err(Error::control("session is closed"));
        }

        let kind = FileKind::of(&spec.name);
        let (path, size, mtime) = match self.direction {
            Direction::Writer => {
                let path = if kind.is_pseudo() {
                    spec.name.clone()
                } else {
                    self.destination.join(&spec.name)
                };
                let size = spec
                    .size
                    .ok_or_else(|| Error::control("file size missing from file list"))?;
                (path, size, spec.last_modified)
            }
            Direction::Reader => match (spec.size, kind) {
                (Some(size), _) => (spec.name.clone(), size, spec.last_modified),
                (None, FileKind::Regular) => {
                    let meta = std::fs::metadata(&spec.name)?;
                    (spec.name.clone(), meta.len(), meta.modified().ok())
                }
                (None, _) => (spec.name.clone(), 0, None),
            },
        };

        let unit = Arc::new(
            FileUnit::new(
                self.id,
                spec.id,
                path,
                size,
                self.loop_mode,
                Arc::clone(&self.provider),
            )
            .with_last_modified(mtime),
        );

        if self.files.insert(spec.id, Arc::clone(&unit)).is_none() {
            self.pending.fetch_add(1, Ordering::AcqRel);
        }
        debug!(
            session = %self.id,
            file = %spec.id,
            path = %unit.path().display(),
            size,
            partition = %unit.partition(),
            "Registered file"
        );
        Ok(unit)
    }

    /// Look up a file unit
    pub fn file(&self, id: FileId) -> Option<Arc<FileUnit>> {
        self.files.get(&id).map(|f| Arc::clone(f.value()))
    }

    /// All file units
    pub fn files(&self) -> Vec<Arc<FileUnit>> {
        self.files.iter().map(|f| Arc::clone(f.value())).collect()
    }

    /// Apply a control message from the peer
    ///
    /// # Errors
    ///
    /// Returns `Error::UnknownFile` for a completion naming a file this
    /// session never registered, or the error raised while adding files.
    pub fn handle_control(&self, msg: ControlMessage) -> Result<ControlAction> {
        match msg {
            ControlMessage::FileList(specs) => {
                for spec in specs {
                    self.add_file(spec)?;
                }
                Ok(ControlAction::Continue)
            }
            ControlMessage::FileFinished { file_id, error } => {
                let unit = self.file(file_id).ok_or(Error::UnknownFile {
                    session: self.id,
                    file: file_id,
                })?;
                let cause = error.map(|e| Arc::new(Error::Aborted(e)));
                unit.close(cause.clone());
                if self.complete_file(file_id, cause, false) {
                    Ok(ControlAction::Finish {
                        message: "transfer finished".to_string(),
                        cause: self.first_failure(),
                    })
                } else {
                    Ok(ControlAction::Continue)
                }
            }
            ControlMessage::Abort { reason } => Ok(ControlAction::Finish {
                cause: Some(Arc::new(Error::Aborted(reason.clone()))),
                message: reason,
            }),
            ControlMessage::KeepAlive => Ok(ControlAction::Continue),
        }
    }

    /// Record that a file finished and tell the peer.
    ///
    /// Returns true when this was the last outstanding file. A file is
    /// counted once; later calls for the same file return false.
    pub fn finish_file(&self, id: FileId, cause: Option<Cause>) -> bool {
        self.complete_file(id, cause, true)
    }

    fn complete_file(&self, id: FileId, cause: Option<Cause>, notify_peer: bool) -> bool {
        if !self.files.contains_key(&id) {
            return false;
        }

        let all_done = {
            let mut progress = lock(&self.progress);
            if progress.completions.iter().any(|c| c.file_id == id) {
                return false;
            }
            if progress.first_failure.is_none() {
                progress.first_failure.clone_from(&cause);
            }
            progress.completions.push(FileCompletion {
                file_id: id,
                cause: cause.clone(),
            });
            self.pending.fetch_sub(1, Ordering::AcqRel) == 1
        };

        match &cause {
            Some(c) => warn!(session = %self.id, file = %id, cause = %c, "File failed"),
            None => debug!(session = %self.id, file = %id, "File finished"),
        }

        if notify_peer {
            if let Endpoint::Remote(handle) = &self.endpoint {
                let msg = ControlMessage::FileFinished {
                    file_id: id,
                    error: cause.as_ref().map(|c| c.to_string()),
                };
                if let Err(e) = handle.send(msg) {
                    debug!(session = %self.id, file = %id, error = %e, "Failed to notify peer");
                }
            }
        }

        all_done
    }

    /// Finished files, in completion order
    pub fn completions(&self) -> Vec<FileCompletion> {
        lock(&self.progress).completions.clone()
    }

    /// Number of files not yet finished
    pub fn pending_files(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// First file failure recorded in this session
    pub fn first_failure(&self) -> Option<Cause> {
        lock(&self.progress).first_failure.clone()
    }

    /// Close the session, its open files and its transport.
    ///
    /// Returns true if this call closed it.
    pub fn close(&self, message: &str, cause: Option<Cause>) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        *lock(&self.down) = Some((message.to_string(), cause.clone()));

        for file in self.files.iter() {
            file.close(cause.clone());
        }
        if let Endpoint::Remote(handle) = &self.endpoint {
            handle.close(message, cause.clone());
        }

        match &cause {
            Some(c) => warn!(session = %self.id, cause = %c, "Session closed: {}", message),
            None => info!(
                session = %self.id,
                bytes = self.counters.total(),
                elapsed_ms = self.started.elapsed().as_millis() as u64,
                "Session closed: {}",
                message
            ),
        }
        true
    }

    /// Returns true once the session has been closed
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Message and cause the session was closed with
    pub fn down_reason(&self) -> Option<(String, Option<Cause>)> {
        lock(&self.down).clone()
    }
}

impl Accountable for Session {
    fn total_bytes(&self) -> u64 {
        self.counters.total()
    }

    fn util_bytes(&self) -> u64 {
        self.counters.util()
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("direction", &self.direction)
            .field("endpoint", &self.endpoint)
            .field("files", &self.files.len())
            .field("pending", &self.pending_files())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::LocalChannelProvider;
    use tempfile::TempDir;

    #[derive(Default)]
    struct RecordingHandle {
        sent: Mutex<Vec<ControlMessage>>,
        closed: AtomicBool,
    }

    impl ControlHandle for RecordingHandle {
        fn attach(&self, _session_id: SessionId) -> Result<()> {
            Ok(())
        }

        fn session_id(&self) -> Option<SessionId> {
            None
        }

        fn remote_pull(&self) -> bool {
            false
        }

        fn send(&self, msg: ControlMessage) -> Result<()> {
            self.sent.lock().unwrap().push(msg);
            Ok(())
        }

        fn close(&self, _message: &str, _cause: Option<Cause>) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    fn writer_session(dest: &std::path::Path, endpoint: Endpoint) -> Session {
        let config = SessionConfig {
            destination: dest.to_path_buf(),
            ..SessionConfig::default()
        };
        Session::new(
            SessionId::new(),
            Direction::Writer,
            endpoint,
            &config,
            Arc::new(LocalChannelProvider::new()),
        )
    }

    #[test]
    fn test_writer_resolves_under_destination() {
        let dir = TempDir::new().unwrap();
        let session = writer_session(dir.path(), Endpoint::Local { port: 0 });

        let unit = session.add_file(FileSpec::new("a/b.bin", 100)).unwrap();
        assert_eq!(unit.path(), dir.path().join("a/b.bin"));
        assert_eq!(unit.size(), 100);
        assert_eq!(session.pending_files(), 1);

        let null = session.add_file(FileSpec::new("/dev/null", 10)).unwrap();
        assert_eq!(null.path(), std::path::Path::new("/dev/null"));
    }

    #[test]
    fn test_writer_requires_size() {
        let dir = TempDir::new().unwrap();
        let session = writer_session(dir.path(), Endpoint::Local { port: 0 });
        assert!(session.add_file(FileSpec::local("x.bin")).is_err());
    }

    #[test]
    fn test_reader_takes_size_from_metadata() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src.bin");
        std::fs::write(&src, vec![7u8; 1234]).unwrap();

        let session = Session::new(
            SessionId::new(),
            Direction::Reader,
            Endpoint::Local { port: 0 },
            &SessionConfig::default(),
            Arc::new(LocalChannelProvider::new()),
        );
        let unit = session.add_file(FileSpec::local(&src)).unwrap();
        assert_eq!(unit.size(), 1234);
        assert!(unit.last_modified().is_some());
    }

    #[test]
    fn test_finish_file_counts_once_and_notifies_peer() {
        let dir = TempDir::new().unwrap();
        let handle = Arc::new(RecordingHandle::default());
        let session = writer_session(dir.path(), Endpoint::Remote(handle.clone()));

        let a = session.add_file(FileSpec::new("a", 1)).unwrap();
        let b = session.add_file(FileSpec::new("b", 1)).unwrap();

        assert!(!session.finish_file(a.id(), None));
        assert!(!session.finish_file(a.id(), None));
        assert!(session.finish_file(b.id(), None));

        assert_eq!(session.completions().len(), 2);
        assert_eq!(handle.sent.lock().unwrap().len(), 2);
        assert!(session.first_failure().is_none());
    }

    #[test]
    fn test_first_failure_recorded() {
        let dir = TempDir::new().unwrap();
        let session = writer_session(dir.path(), Endpoint::Local { port: 0 });
        let a = session.add_file(FileSpec::new("a", 1)).unwrap();
        let b = session.add_file(FileSpec::new("b", 1)).unwrap();

        let cause: Cause = Arc::new(Error::control("boom"));
        assert!(!session.finish_file(a.id(), Some(cause)));
        assert!(session.finish_file(b.id(), None));
        assert!(session.first_failure().is_some());
    }

    #[test]
    fn test_handle_control_messages() {
        let dir = TempDir::new().unwrap();
        let session = writer_session(dir.path(), Endpoint::Local { port: 0 });

        let spec = FileSpec::new("f.bin", 10);
        let id = spec.id;
        let action = session
            .handle_control(ControlMessage::FileList(vec![spec]))
            .unwrap();
        assert!(matches!(action, ControlAction::Continue));
        assert!(session.file(id).is_some());

        assert!(matches!(
            session.handle_control(ControlMessage::KeepAlive).unwrap(),
            ControlAction::Continue
        ));

        let unknown = session.handle_control(ControlMessage::FileFinished {
            file_id: FileId::new(),
            error: None,
        });
        assert!(matches!(unknown, Err(Error::UnknownFile { .. })));

        let action = session
            .handle_control(ControlMessage::FileFinished {
                file_id: id,
                error: None,
            })
            .unwrap();
        assert!(matches!(action, ControlAction::Finish { cause: None, .. }));

        let action = session
            .handle_control(ControlMessage::Abort {
                reason: "user cancelled".into(),
            })
            .unwrap();
        assert!(matches!(action, ControlAction::Finish { cause: Some(_), .. }));
    }

    #[test]
    fn test_close_is_idempotent_and_closes_transport() {
        let dir = TempDir::new().unwrap();
        let handle = Arc::new(RecordingHandle::default());
        let session = writer_session(dir.path(), Endpoint::Remote(handle.clone()));
        let unit = session.add_file(FileSpec::new("a", 10)).unwrap();

        assert!(session.close("done", None));
        assert!(!session.close("again", None));
        assert!(session.is_closed());
        assert!(unit.is_closed());
        assert!(handle.closed.load(Ordering::SeqCst));
        assert_eq!(session.down_reason().unwrap().0, "done");
        assert!(session.add_file(FileSpec::new("late", 1)).is_err());
    }
}
