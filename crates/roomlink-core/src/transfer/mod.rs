//! Chunked multi-file transfer over an open direct channel.
//!
//! A batch is one `file-list` manifest, then for each file in order a
//! `file-start`, its payload in chunk-size binary slices, and a `file-end`,
//! closed by a single `transfer-complete`. Files are never interleaved and the
//! channel is ordered, so no sequence numbers are needed.

mod receiver;
mod sender;

pub use receiver::{FileManifestEntry, ProtocolViolation, ReceiveEvent, ReceivedFile, TransferReceiver};
pub use sender::{BatchSummary, OutgoingFile, TransferSender};
pub(crate) use sender::batch_size;

use std::time::Duration;

/// Default payload chunk size (64 KiB)
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Default backpressure high-watermark (16 MiB)
pub const DEFAULT_HIGH_WATERMARK: usize = 16 * 1024 * 1024;

/// Largest accepted chunk size
pub const MAX_CHUNK_SIZE: usize = 16 * 1024 * 1024;

/// Default batch size limit (500 MiB)
pub const DEFAULT_MAX_BATCH_BYTES: u64 = 500 * 1024 * 1024;

/// Transfer tuning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferConfig {
    /// Payload bytes per binary message
    pub chunk_size: usize,
    /// Buffered bytes above which sending pauses
    pub high_watermark: usize,
    /// Interval between buffered-amount checks while paused
    pub poll_interval: Duration,
    /// Longest a single pause may last
    pub max_stall: Duration,
    /// Largest accepted batch
    pub max_batch_bytes: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            high_watermark: DEFAULT_HIGH_WATERMARK,
            poll_interval: Duration::from_millis(50),
            max_stall: Duration::from_secs(30),
            max_batch_bytes: DEFAULT_MAX_BATCH_BYTES,
        }
    }
}

/// Progress of one file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressEvent {
    /// Position in the manifest
    pub index: usize,
    /// File name
    pub name: String,
    /// Bytes sent or received so far
    pub bytes: u64,
    /// Declared size
    pub total: u64,
    /// Rounded percentage, 0-100
    pub percent: u8,
}

/// `round(done / total * 100)`, 100 for an empty file
#[must_use]
pub fn progress_percent(done: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    let done = u128::from(done.min(total));
    let total = u128::from(total);
    // Half rounds up
    ((done * 100 + total / 2) / total) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_rounding() {
        assert_eq!(progress_percent(0, 3), 0);
        assert_eq!(progress_percent(1, 3), 33);
        assert_eq!(progress_percent(2, 3), 67);
        assert_eq!(progress_percent(3, 3), 100);
        assert_eq!(progress_percent(1, 200), 1);
        assert_eq!(progress_percent(1, 201), 0);
    }

    #[test]
    fn test_progress_edges() {
        assert_eq!(progress_percent(0, 0), 100);
        assert_eq!(progress_percent(10, 5), 100);
        assert_eq!(progress_percent(u64::MAX - 1, u64::MAX), 100);
    }

    #[test]
    fn test_default_config() {
        let config = TransferConfig::default();
        assert_eq!(config.chunk_size, 65_536);
        assert_eq!(config.high_watermark, 16_777_216);
        assert_eq!(config.poll_interval, Duration::from_millis(50));
    }
}
