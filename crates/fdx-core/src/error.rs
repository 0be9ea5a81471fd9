//! Error types for the FDX engine
//!
//! Errors are grouped by the scope they affect:
//!
//! - **Protocol**: a control message or upcall names a session the registry
//!   does not know ([`Error::UnknownSession`])
//! - **File-fatal**: a single file unit cannot make progress (zero-byte write,
//!   out-of-bounds block, I/O failure)
//! - **Session-fatal**: a write left bytes unwritten after a full attempt
//!   ([`Error::DiskFull`], [`Error::ShortWrite`])
//! - **Setup**: session or queue-group construction failed
//!
//! Termination causes are stored and shared as [`Cause`], so the same root
//! error can live in a session, its file completions, and the registry's
//! last shutdown reason.

use crate::session::{FileId, SessionId};
use std::borrow::Cow;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

/// Errors raised by the FDX core and its writers
#[derive(Debug, Error)]
pub enum Error {
    // ============ I/O Errors ============
    /// Underlying file or socket I/O failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The write call reported that nothing was written
    #[error("unable to write bytes to {} at offset {offset} (full disk or read-only partition?)", .path.display())]
    NoBytesWritten {
        /// Target file
        path: PathBuf,
        /// Block offset
        offset: u64,
    },

    /// A block reaches past the declared size of its file
    #[error("block [{offset}, +{len}) exceeds declared size {size} of {}", .path.display())]
    BlockOutOfBounds {
        /// Target file
        path: PathBuf,
        /// Block offset
        offset: u64,
        /// Block payload length
        len: usize,
        /// Declared file size
        size: u64,
    },

    /// The partition holding the file ran out of space
    #[error(
        "disk partition for {} may be full; free/usable/total space: {free} / {usable} / {total} bytes",
        .path.display()
    )]
    DiskFull {
        /// Target file
        path: PathBuf,
        /// Free bytes on the partition
        free: u64,
        /// Bytes usable by this process
        usable: u64,
        /// Partition size
        total: u64,
    },

    /// Bytes remained after a write although the partition reports space
    #[error(
        "write to {} at offset {offset} left {} of {expected} bytes unwritten; \
         free/usable/total space: {free} / {usable} / {total} bytes \
         (filesystem or kernel anomaly?)",
        .path.display(),
        .expected - .written
    )]
    ShortWrite {
        /// Target file
        path: PathBuf,
        /// Block offset
        offset: u64,
        /// Bytes handed to the write call
        expected: usize,
        /// Bytes the write call accepted
        written: usize,
        /// Free bytes on the partition
        free: u64,
        /// Bytes usable by this process
        usable: u64,
        /// Partition size
        total: u64,
    },

    // ============ Session Errors ============
    /// No live session with this identifier
    #[error("no session for id {0}")]
    UnknownSession(SessionId),

    /// The session does not contain this file unit
    #[error("no file {file} in session {session}")]
    UnknownFile {
        /// Owning session
        session: SessionId,
        /// Missing file unit
        file: FileId,
    },

    /// A session with this identifier is already registered
    #[error("session {0} is already registered")]
    DuplicateSession(SessionId),

    /// The registry no longer accepts sessions
    #[error("session registry is closed")]
    RegistryClosed,

    /// Building a session or attaching its transport failed
    #[error("session setup failed: {0}")]
    SessionSetup(String),

    /// The remote peer aborted the transfer
    #[error("transfer aborted by peer: {0}")]
    Aborted(String),

    /// Control channel failure
    #[error("control channel error: {0}")]
    Control(Cow<'static, str>),

    // ============ Configuration & Internal Errors ============
    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    InvalidConfig(Cow<'static, str>),

    /// An unexpected failure (for example a panic) inside a writer
    #[error("unexpected failure: {0}")]
    Unexpected(String),
}

impl Error {
    /// Returns true if this error reports missing storage space or a
    /// device that stopped accepting bytes mid-write
    #[must_use]
    pub fn is_space_related(&self) -> bool {
        matches!(
            self,
            Error::DiskFull { .. } | Error::ShortWrite { .. } | Error::NoBytesWritten { .. }
        )
    }

    /// Returns true if this error is a protocol violation by the peer or
    /// transport layer
    #[must_use]
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, Error::UnknownSession(_) | Error::UnknownFile { .. })
    }

    /// Create an invalid configuration error with static context (zero allocation)
    #[must_use]
    pub const fn invalid_config(context: &'static str) -> Self {
        Error::InvalidConfig(Cow::Borrowed(context))
    }

    /// Create a control channel error with static context (zero allocation)
    #[must_use]
    pub const fn control(context: &'static str) -> Self {
        Error::Control(Cow::Borrowed(context))
    }
}

/// Shared termination cause
pub type Cause = Arc<Error>;

/// Result type for FDX core operations
pub type Result<T> = std::result::Result<T, Error>;
