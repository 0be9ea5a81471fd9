//! # FDX Monitor
//!
//! Throughput accounting for FDX transfers.
//!
//! - [`RateEngine`] samples the byte counters of files, sessions, writers and
//!   the disk writer manager and derives instantaneous and average rates
//! - [`spawn_sampler`] ticks an engine on the tokio runtime with a fixed delay
//! - [`Reporter`] forwards rates to a telemetry endpoint without ever
//!   failing the transfer

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod rate;
pub mod reporter;
pub mod scheduler;

pub use rate::{RateEngine, RateSnapshot};
pub use reporter::{CommandSink, Reporter, Role, TcpCommandSink, format_command};
pub use scheduler::{SamplerHandle, spawn_sampler};
