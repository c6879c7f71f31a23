//! Terminal progress for a batch of files.

use indicatif::{ProgressBar, ProgressStyle};
use roomlink_core::ProgressEvent;

const BAR_TEMPLATE: &str =
    "{msg}\n{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})";

/// One bar spanning every file of a batch
pub struct BatchProgress {
    bar: ProgressBar,
    offsets: Vec<u64>,
    current: Option<usize>,
    names: Vec<String>,
}

impl BatchProgress {
    /// Bar for files with the given names and sizes, in send order
    #[must_use]
    pub fn new(files: &[(String, u64)]) -> Self {
        let sizes: Vec<u64> = files.iter().map(|(_, size)| *size).collect();
        let bar = ProgressBar::new(sizes.iter().sum());
        let style = ProgressStyle::with_template(BAR_TEMPLATE)
            .map(|style| style.progress_chars("#>-"))
            .unwrap_or_else(|_| ProgressStyle::default_bar());
        bar.set_style(style);
        bar.set_message(format!("Sending {} file(s)", files.len()));

        Self {
            bar,
            offsets: batch_offsets(&sizes),
            current: None,
            names: files.iter().map(|(name, _)| name.clone()).collect(),
        }
    }

    /// Apply one per-file progress report
    pub fn record(&mut self, event: &ProgressEvent) {
        let Some(offset) = self.offsets.get(event.index) else {
            return;
        };
        if self.current != Some(event.index) {
            self.current = Some(event.index);
            let name = self.names.get(event.index).map_or(event.name.as_str(), String::as_str);
            self.bar.set_message(format!(
                "[{}/{}] {}",
                event.index + 1,
                self.names.len(),
                name
            ));
        }
        self.bar.set_position(offset + event.bytes);
    }

    /// Close the bar with a summary line
    pub fn finish(&self, files: usize, bytes: u64) {
        self.bar
            .finish_with_message(format!("Sent {files} file(s), {}", format_bytes(bytes)));
    }

    /// Leave the bar where it stopped
    pub fn abandon(&self) {
        self.bar.abandon();
    }
}

/// Starting byte of each file when the batch is laid end to end
#[must_use]
pub fn batch_offsets(sizes: &[u64]) -> Vec<u64> {
    sizes
        .iter()
        .scan(0u64, |acc, size| {
            let start = *acc;
            *acc += size;
            Some(start)
        })
        .collect()
}

/// Binary-prefixed size with one decimal: `3 B`, `1.5 KiB`, `500.0 MiB`
#[must_use]
pub fn format_bytes(bytes: u64) -> String {
    const PREFIXES: [&str; 4] = ["KiB", "MiB", "GiB", "TiB"];
    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let mut value = bytes as f64 / 1024.0;
    let mut prefix = 0;
    while value >= 1024.0 && prefix + 1 < PREFIXES.len() {
        value /= 1024.0;
        prefix += 1;
    }
    format!("{value:.1} {}", PREFIXES[prefix])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes_units() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(3), "3 B");
        assert_eq!(format_bytes(1536), "1.5 KiB");
        assert_eq!(format_bytes(64 * 1024), "64.0 KiB");
        assert_eq!(format_bytes(500 * 1024 * 1024), "500.0 MiB");
        assert_eq!(format_bytes(3 * 1024_u64.pow(5)), "3072.0 TiB");
    }

    #[test]
    fn test_batch_offsets() {
        assert!(batch_offsets(&[]).is_empty());
        assert_eq!(batch_offsets(&[3, 0, 5]), vec![0, 3, 3]);
    }

    #[test]
    fn test_record_tracks_batch_position() {
        let mut progress = BatchProgress::new(&[("a".into(), 4), ("b".into(), 6)]);
        let event = |index, bytes| ProgressEvent {
            index,
            name: String::new(),
            bytes,
            total: 0,
            percent: 0,
        };

        progress.record(&event(0, 4));
        assert_eq!(progress.bar.position(), 4);
        progress.record(&event(1, 2));
        assert_eq!(progress.bar.position(), 6);
        assert_eq!(progress.current, Some(1));

        // Out of range reports are ignored
        progress.record(&event(5, 100));
        assert_eq!(progress.bar.position(), 6);
    }
}
