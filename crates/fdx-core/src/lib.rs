//! # FDX Core
//!
//! Core types for the FDX (Fast Data eXchange) transfer engine.
//!
//! This crate provides:
//! - Byte accounting shared by every level of the write pipeline
//! - A fixed-capacity buffer pool and the [`Block`] unit of transfer
//! - File units bound to a pluggable file-channel abstraction
//! - Transfer sessions and the process-wide [`SessionRegistry`]
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      SessionRegistry                             │
//! │   (live sessions, control routing, drain barrier)               │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                         Session                                  │
//! │   (one transfer: direction, endpoint, file units, counters)     │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                        FileUnit                                  │
//! │   (one file: lazily opened channel, expected size, partition)   │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Blocks carry `(session id, file id, offset)` so any worker can resolve
//! and write them independently of arrival order.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod accounting;
pub mod block;
pub mod config;
pub mod error;
pub mod file;
pub mod registry;
pub mod session;

pub use accounting::{Accountable, ByteCounters};
pub use block::{Block, BufferPool, PooledBuffer, STORAGE_BLOCK_SIZE, align_up};
pub use config::{BufferPoolConfig, EngineConfig, MonitorConfig, SessionConfig, WriterConfig};
pub use error::{Cause, Error, Result};
pub use file::{
    ChannelProvider, FileChannel, FileKind, FileUnit, LocalChannelProvider, NullChannel,
    PartitionId, SpaceStats,
};
pub use registry::SessionRegistry;
pub use session::{
    ControlAction, ControlHandle, ControlMessage, Direction, Endpoint, FileCompletion, FileId,
    FileSpec, Session, SessionId,
};

/// Path prefix selecting the discarding null sink
pub const DEV_NULL_PATH: &str = "/dev/null";

/// Path prefix selecting the zero-filled source
pub const DEV_ZERO_PATH: &str = "/dev/zero";
