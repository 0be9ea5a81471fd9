//! # FDX Disk
//!
//! Partition-aware disk write pipeline for FDX.
//!
//! Blocks enter through [`DiskWriterManager::submit`], which routes them to
//! the queue of the partition their file lives on. Each partition has its
//! own bounded queue and pool of writer threads, created on the partition's
//! first block:
//!
//! ```text
//!                      ┌─▶ partition 2049 queue ─▶ writer p2049-w0, p2049-w1
//! submit(block, p) ────┤
//!                      └─▶ partition 2065 queue ─▶ writer p2065-w0
//! ```
//!
//! A full queue blocks (or times out) the producer, so a slow disk throttles
//! whatever feeds it.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod manager;
pub mod reader;
pub mod space;
pub mod task;

pub use manager::{DiskWriterManager, SubmitError, SubmitMode};
pub use reader::BlockReader;
pub use space::{classify_short_write, is_disk_full};
pub use task::{FailureScope, TimingCounters, WriteFailure, WriteOutcome, WriterStats};
