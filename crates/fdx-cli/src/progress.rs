//! Per-file progress bars.

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

/// Progress bars for every file of one transfer
pub struct TransferProgress {
    multi: MultiProgress,
    style: ProgressStyle,
}

impl TransferProgress {
    /// Create an empty progress display
    pub fn new() -> anyhow::Result<Self> {
        let style = ProgressStyle::default_bar()
            .template("{msg:20!} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})")?
            .progress_chars("#>-");

        Ok(Self {
            multi: MultiProgress::new(),
            style,
        })
    }

    /// Add a bar for a file of `total_bytes`
    pub fn add(&self, total_bytes: u64, filename: &str) -> ProgressBar {
        let bar = self.multi.add(ProgressBar::new(total_bytes));
        bar.set_style(self.style.clone());
        bar.set_message(filename.to_string());
        bar
    }
}

/// Format bytes in human-readable format
#[must_use]
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    format!("{size:.2} {}", UNITS[unit_idx])
}

/// Format speed in human-readable format (bytes/sec)
#[must_use]
pub fn format_speed(bytes_per_sec: f64) -> String {
    format!("{}/s", format_bytes(bytes_per_sec.max(0.0) as u64))
}
