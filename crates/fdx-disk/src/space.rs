//! Disk-space classification of short writes

use fdx_core::{Error, FileUnit, SpaceStats};
use tracing::warn;

/// Returns true if `stats` describe a partition too full to take another
/// buffer of `buffer_capacity` bytes.
///
/// The partition counts as full when free or usable space is below one
/// buffer, or below `min_free_ratio` of the partition size.
#[must_use]
pub fn is_disk_full(stats: &SpaceStats, buffer_capacity: usize, min_free_ratio: f64) -> bool {
    let capacity = buffer_capacity as u64;
    if stats.free < capacity || stats.usable < capacity {
        return true;
    }
    if stats.total == 0 {
        return false;
    }
    let total = stats.total as f64;
    stats.free as f64 / total < min_free_ratio || stats.usable as f64 / total < min_free_ratio
}

/// Build the session-fatal error for a write that left
/// `expected - written` bytes unwritten
pub fn classify_short_write(
    file: &FileUnit,
    offset: u64,
    expected: usize,
    written: usize,
    buffer_capacity: usize,
    min_free_ratio: f64,
) -> Error {
    let path = file.path().to_path_buf();
    let stats = match file.space_stats() {
        Ok(stats) => stats,
        Err(e) => {
            warn!(file = %file.id(), error = %e, "Unable to query partition space");
            return Error::ShortWrite {
                path,
                offset,
                expected,
                written,
                free: 0,
                usable: 0,
                total: 0,
            };
        }
    };

    if is_disk_full(&stats, buffer_capacity, min_free_ratio) {
        Error::DiskFull {
            path,
            free: stats.free,
            usable: stats.usable,
            total: stats.total,
        }
    } else {
        Error::ShortWrite {
            path,
            offset,
            expected,
            written,
            free: stats.free,
            usable: stats.usable,
            total: stats.total,
        }
    }
}
