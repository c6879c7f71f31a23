//! Sending side of a batch.

use super::{ProgressEvent, TransferConfig, progress_percent};
use crate::error::TransferError;
use crate::frame::{ControlFrame, FileDescriptor};
use crate::transport::{ChannelMessage, DataChannel};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, info};

enum Source {
    Memory(Vec<u8>),
    Reader(Box<dyn AsyncRead + Send + Unpin>),
}

/// A file queued for sending
pub struct OutgoingFile {
    descriptor: FileDescriptor,
    source: Source,
}

impl OutgoingFile {
    /// File held in memory
    pub fn from_bytes(name: impl Into<String>, mime_type: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            descriptor: FileDescriptor::new(name, data.len() as u64, mime_type),
            source: Source::Memory(data),
        }
    }

    /// File streamed from a reader that yields exactly `size` bytes
    pub fn from_reader<R>(
        name: impl Into<String>,
        size: u64,
        mime_type: impl Into<String>,
        reader: R,
    ) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        Self {
            descriptor: FileDescriptor::new(name, size, mime_type),
            source: Source::Reader(Box::new(reader)),
        }
    }

    /// Open a file on disk; the name is its final path component
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::Io`] if the file cannot be opened or stat'ed.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, TransferError> {
        let path = path.as_ref();
        let file = tokio::fs::File::open(path).await?;
        let size = file.metadata().await?.len();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string());
        let mime_type = mime_from_extension(path);
        Ok(Self::from_reader(name, size, mime_type, file))
    }

    /// Manifest entry for this file
    #[must_use]
    pub fn descriptor(&self) -> &FileDescriptor {
        &self.descriptor
    }

    /// Declared size
    #[must_use]
    pub fn size(&self) -> u64 {
        self.descriptor.size
    }

    /// Fill `buf` with the bytes at `offset`; short only at end of source
    async fn read_chunk(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize, TransferError> {
        match &mut self.source {
            Source::Memory(data) => {
                let start = usize::try_from(offset).unwrap_or(usize::MAX).min(data.len());
                let n = buf.len().min(data.len() - start);
                buf[..n].copy_from_slice(&data[start..start + n]);
                Ok(n)
            }
            Source::Reader(reader) => {
                let mut filled = 0;
                while filled < buf.len() {
                    let n = reader.read(&mut buf[filled..]).await?;
                    if n == 0 {
                        break;
                    }
                    filled += n;
                }
                Ok(filled)
            }
        }
    }
}

impl fmt::Debug for OutgoingFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutgoingFile")
            .field("descriptor", &self.descriptor)
            .finish_non_exhaustive()
    }
}

fn mime_from_extension(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "txt" | "md" | "log" => "text/plain",
        "html" | "htm" => "text/html",
        "csv" => "text/csv",
        "json" => "application/json",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "mp4" => "video/mp4",
        "mp3" => "audio/mpeg",
        _ => "application/octet-stream",
    }
}

/// Total declared size of `files`, refused above `limit`.
///
/// A sum past `u64::MAX` is reported as a total of `u64::MAX`.
///
/// # Errors
///
/// Returns [`TransferError::SizeLimitExceeded`] if the total exceeds `limit`.
pub(crate) fn batch_size(files: &[OutgoingFile], limit: u64) -> Result<u64, TransferError> {
    let total = files
        .iter()
        .try_fold(0u64, |acc, file| acc.checked_add(file.size()))
        .unwrap_or(u64::MAX);
    if total > limit {
        return Err(TransferError::SizeLimitExceeded { total, limit });
    }
    Ok(total)
}

/// Outcome of a completed batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchSummary {
    /// Files sent
    pub files: usize,
    /// Payload bytes sent
    pub bytes: u64,
}

/// Streams batches over one data channel
pub struct TransferSender {
    channel: Arc<dyn DataChannel>,
    config: TransferConfig,
    cancel: Arc<AtomicBool>,
}

impl TransferSender {
    /// Create a sender for `channel`
    #[must_use]
    pub fn new(channel: Arc<dyn DataChannel>, config: TransferConfig) -> Self {
        Self {
            channel,
            config,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Abort sending when `cancel` becomes true
    #[must_use]
    pub fn with_cancel(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }

    /// Send one batch.
    ///
    /// Sends the manifest, then each file in order, then `transfer-complete`.
    /// `on_progress` is called after every chunk.
    ///
    /// # Errors
    ///
    /// - [`TransferError::NotConnected`] if the channel is not open
    /// - [`TransferError::SizeLimitExceeded`] if the batch is too large; nothing is sent
    /// - [`TransferError::BackpressureTimeout`] if the channel does not drain in time
    /// - [`TransferError::Cancelled`] if the cancel flag is raised
    /// - [`TransferError::SourceTruncated`] if a source yields fewer bytes than declared
    /// - [`TransferError::ConnectionLost`] if the channel fails
    pub async fn send_batch<F>(
        &self,
        mut files: Vec<OutgoingFile>,
        mut on_progress: F,
    ) -> Result<BatchSummary, TransferError>
    where
        F: FnMut(ProgressEvent),
    {
        if !self.channel.is_open() {
            return Err(TransferError::NotConnected);
        }

        let total = batch_size(&files, self.config.max_batch_bytes)?;

        let manifest = files.iter().map(|f| f.descriptor.clone()).collect();
        self.send_control(&ControlFrame::FileList { files: manifest })
            .await?;
        info!("Sending {} file(s), {} bytes", files.len(), total);

        let mut buf = vec![0u8; self.config.chunk_size.max(1)];
        for (index, file) in files.iter_mut().enumerate() {
            self.send_file(index, file, &mut buf, &mut on_progress)
                .await?;
        }

        self.send_control(&ControlFrame::TransferComplete).await?;
        Ok(BatchSummary {
            files: files.len(),
            bytes: total,
        })
    }

    async fn send_file<F>(
        &self,
        index: usize,
        file: &mut OutgoingFile,
        buf: &mut [u8],
        on_progress: &mut F,
    ) -> Result<(), TransferError>
    where
        F: FnMut(ProgressEvent),
    {
        let name = file.descriptor.name.clone();
        let size = file.descriptor.size;
        self.send_control(&ControlFrame::file_start(&file.descriptor))
            .await?;
        debug!("Sending {} ({} bytes)", name, size);

        let mut sent = 0u64;
        while sent < size {
            self.check_cancelled()?;
            self.wait_for_drain().await?;

            let want = usize::try_from(size - sent)
                .unwrap_or(usize::MAX)
                .min(buf.len());
            let n = file.read_chunk(sent, &mut buf[..want]).await?;
            if n == 0 {
                return Err(TransferError::SourceTruncated {
                    name,
                    expected: size,
                    actual: sent,
                });
            }

            self.channel
                .send(ChannelMessage::Binary(buf[..n].to_vec()))
                .await
                .map_err(|e| TransferError::ConnectionLost(e.to_string()))?;
            sent += n as u64;

            on_progress(ProgressEvent {
                index,
                name: name.clone(),
                bytes: sent,
                total: size,
                percent: progress_percent(sent, size),
            });
        }

        if size == 0 {
            on_progress(ProgressEvent {
                index,
                name: name.clone(),
                bytes: 0,
                total: 0,
                percent: 100,
            });
        }

        self.send_control(&ControlFrame::FileEnd { name }).await
    }

    /// Pause while the channel holds more than the high-watermark
    async fn wait_for_drain(&self) -> Result<(), TransferError> {
        if self.channel.buffered_amount() <= self.config.high_watermark {
            return Ok(());
        }

        debug!(
            "Backpressure: {} bytes buffered, pausing",
            self.channel.buffered_amount()
        );
        let started = Instant::now();
        while self.channel.buffered_amount() > self.config.high_watermark {
            self.check_cancelled()?;
            if !self.channel.is_open() {
                return Err(TransferError::ConnectionLost("channel closed".to_string()));
            }
            let waited = started.elapsed();
            if waited >= self.config.max_stall {
                return Err(TransferError::BackpressureTimeout {
                    waited_ms: u64::try_from(waited.as_millis()).unwrap_or(u64::MAX),
                });
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
        debug!("Backpressure cleared after {:?}", started.elapsed());
        Ok(())
    }

    fn check_cancelled(&self) -> Result<(), TransferError> {
        if self.cancel.load(Ordering::Relaxed) {
            Err(TransferError::Cancelled)
        } else {
            Ok(())
        }
    }

    async fn send_control(&self, frame: &ControlFrame) -> Result<(), TransferError> {
        let message = frame.to_message()?;
        self.channel
            .send(message)
            .await
            .map_err(|e| TransferError::ConnectionLost(e.to_string()))
    }
}
