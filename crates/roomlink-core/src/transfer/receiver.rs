//! Receiving side of a batch.
//!
//! Buffers are keyed by manifest position: the N-th `file-start` of a batch
//! fills the N-th manifest entry, so two files with the same name never merge.

use super::{ProgressEvent, progress_percent};
use crate::error::TransferError;
use crate::frame::{ControlFrame, FileDescriptor, Frame};
use crate::transport::ChannelMessage;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

/// A manifest entry with its receive progress
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileManifestEntry {
    /// File name
    pub name: String,
    /// Declared size
    pub size: u64,
    /// Declared MIME type
    pub mime_type: String,
    /// Percentage received, non-decreasing
    pub progress: u8,
}

impl From<FileDescriptor> for FileManifestEntry {
    fn from(descriptor: FileDescriptor) -> Self {
        Self {
            name: descriptor.name,
            size: descriptor.size,
            mime_type: descriptor.mime_type,
            progress: 0,
        }
    }
}

/// A reconstructed file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    /// Position in the manifest
    pub index: usize,
    /// File name as sent
    pub name: String,
    /// Declared MIME type
    pub mime_type: String,
    /// Declared size
    pub declared_size: u64,
    /// File content
    pub data: Vec<u8>,
}

impl ReceivedFile {
    /// Whether every declared byte arrived
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.data.len() as u64 == self.declared_size
    }

    /// Write into `dir` under the final component of the sent name.
    ///
    /// An existing file is not overwritten; ` (N)` is appended to the stem
    /// instead.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::Io`] if writing fails.
    pub async fn save_to(&self, dir: impl AsRef<Path>) -> Result<PathBuf, TransferError> {
        let dir = dir.as_ref();
        let file_name = Path::new(&self.name)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| format!("file-{}", self.index));

        let mut path = dir.join(&file_name);
        let mut n = 1;
        while tokio::fs::try_exists(&path).await? {
            let candidate = Path::new(&file_name);
            let stem = candidate
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
            path = match candidate.extension() {
                Some(ext) => dir.join(format!("{stem} ({n}).{}", ext.to_string_lossy())),
                None => dir.join(format!("{stem} ({n})")),
            };
            n += 1;
        }

        tokio::fs::write(&path, &self.data).await?;
        Ok(path)
    }
}

/// Frame sequences the receiver ignored
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolViolation {
    /// Binary chunk with no file in progress
    #[error("{len}-byte chunk with no active file")]
    ChunkWithoutFile {
        /// Chunk length
        len: usize,
    },

    /// Bytes beyond the declared size of the active file
    #[error("{name}: {excess} bytes beyond declared size dropped")]
    ChunkOverflow {
        /// Active file
        name: String,
        /// Dropped bytes
        excess: u64,
    },

    /// `file-end` not matching the active file
    #[error("file-end for {name:?} does not match the active file")]
    UnexpectedFileEnd {
        /// Name in the frame
        name: String,
    },

    /// Text message that is not a known control frame
    #[error("malformed control frame: {0}")]
    MalformedFrame(String),
}

/// What one inbound message produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiveEvent {
    /// A manifest arrived; every entry starts at 0%
    Manifest(Vec<FileManifestEntry>),
    /// A file's progress increased
    Progress(ProgressEvent),
    /// A file was reconstructed
    FileReceived(ReceivedFile),
    /// The batch ended
    TransferComplete,
    /// A message was ignored
    ProtocolViolation(ProtocolViolation),
}

struct ReceiveBuffer {
    index: usize,
    name: String,
    size: u64,
    mime_type: String,
    chunks: Vec<Vec<u8>>,
    received: u64,
    percent: u8,
}

/// Reassembles batches from channel messages
#[derive(Default)]
pub struct TransferReceiver {
    manifest: Vec<FileManifestEntry>,
    next_index: usize,
    active: Option<ReceiveBuffer>,
    batches: usize,
}

impl TransferReceiver {
    /// Create an idle receiver
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Manifest of the current batch with progress
    #[must_use]
    pub fn manifest(&self) -> &[FileManifestEntry] {
        &self.manifest
    }

    /// Name of the file currently being received
    #[must_use]
    pub fn active_file(&self) -> Option<&str> {
        self.active.as_ref().map(|b| b.name.as_str())
    }

    /// Batches completed so far
    #[must_use]
    pub fn completed_batches(&self) -> usize {
        self.batches
    }

    /// Process one channel message
    pub fn handle(&mut self, message: ChannelMessage) -> Vec<ReceiveEvent> {
        match Frame::decode(message) {
            Ok(Frame::Control(frame)) => self.handle_control(frame),
            Ok(Frame::Chunk(data)) => self.handle_chunk(data),
            Err(TransferError::Serialization(reason)) => {
                violation(ProtocolViolation::MalformedFrame(reason))
            }
            Err(e) => violation(ProtocolViolation::MalformedFrame(e.to_string())),
        }
    }

    fn handle_control(&mut self, frame: ControlFrame) -> Vec<ReceiveEvent> {
        match frame {
            ControlFrame::FileList { files } => {
                if let Some(buffer) = self.active.take() {
                    warn!("Manifest replaced while {} was in progress", buffer.name);
                }
                info!("Receiving {} file(s)", files.len());
                self.manifest = files.into_iter().map(FileManifestEntry::from).collect();
                self.next_index = 0;
                vec![ReceiveEvent::Manifest(self.manifest.clone())]
            }
            ControlFrame::FileStart {
                name,
                size,
                file_type,
            } => {
                if let Some(buffer) = self.active.take() {
                    warn!(
                        "{} abandoned at {} of {} bytes",
                        buffer.name, buffer.received, buffer.size
                    );
                }
                let index = self.next_index;
                self.next_index += 1;
                if index >= self.manifest.len() {
                    debug!("{} not in manifest, appending", name);
                    self.manifest.push(FileManifestEntry::from(FileDescriptor::new(
                        name.clone(),
                        size,
                        file_type.clone(),
                    )));
                }
                self.active = Some(ReceiveBuffer {
                    index,
                    name,
                    size,
                    mime_type: file_type,
                    chunks: Vec::new(),
                    received: 0,
                    percent: 0,
                });
                Vec::new()
            }
            ControlFrame::FileEnd { name } => self.finish_file(name),
            ControlFrame::TransferComplete => {
                if let Some(buffer) = self.active.take() {
                    warn!("Batch ended with {} unfinished", buffer.name);
                }
                self.batches += 1;
                vec![ReceiveEvent::TransferComplete]
            }
        }
    }

    fn handle_chunk(&mut self, mut data: Vec<u8>) -> Vec<ReceiveEvent> {
        let Some(buffer) = self.active.as_mut() else {
            warn!("Ignoring {}-byte chunk with no active file", data.len());
            return violation(ProtocolViolation::ChunkWithoutFile { len: data.len() });
        };

        let mut events = Vec::new();
        let remaining = buffer.size - buffer.received;
        if data.len() as u64 > remaining {
            let excess = data.len() as u64 - remaining;
            warn!("{}: dropping {} bytes beyond declared size", buffer.name, excess);
            // remaining < data.len() so it fits in usize
            data.truncate(remaining as usize);
            events.push(ReceiveEvent::ProtocolViolation(
                ProtocolViolation::ChunkOverflow {
                    name: buffer.name.clone(),
                    excess,
                },
            ));
        }
        if data.is_empty() {
            return events;
        }

        buffer.received += data.len() as u64;
        buffer.chunks.push(data);

        // 100 is reserved for file-end
        let percent = progress_percent(buffer.received, buffer.size).min(99);
        if percent > buffer.percent {
            buffer.percent = percent;
            if let Some(entry) = self.manifest.get_mut(buffer.index) {
                entry.progress = percent;
            }
            events.push(ReceiveEvent::Progress(ProgressEvent {
                index: buffer.index,
                name: buffer.name.clone(),
                bytes: buffer.received,
                total: buffer.size,
                percent,
            }));
        }
        events
    }

    fn finish_file(&mut self, name: String) -> Vec<ReceiveEvent> {
        if !self.active.as_ref().is_some_and(|b| b.name == name) {
            warn!("Ignoring file-end for {:?}", name);
            return violation(ProtocolViolation::UnexpectedFileEnd { name });
        }
        let Some(buffer) = self.active.take() else {
            return Vec::new();
        };

        let mut data = Vec::with_capacity(usize::try_from(buffer.received).unwrap_or(0));
        for chunk in buffer.chunks {
            data.extend_from_slice(&chunk);
        }
        if buffer.received < buffer.size {
            warn!(
                "{} incomplete: {} of {} bytes",
                buffer.name, buffer.received, buffer.size
            );
        }
        if let Some(entry) = self.manifest.get_mut(buffer.index) {
            entry.progress = 100;
        }
        debug!("Received {} ({} bytes)", buffer.name, data.len());

        vec![
            ReceiveEvent::Progress(ProgressEvent {
                index: buffer.index,
                name: buffer.name.clone(),
                bytes: buffer.received,
                total: buffer.size,
                percent: 100,
            }),
            ReceiveEvent::FileReceived(ReceivedFile {
                index: buffer.index,
                name: buffer.name,
                mime_type: buffer.mime_type,
                declared_size: buffer.size,
                data,
            }),
        ]
    }
}

fn violation(v: ProtocolViolation) -> Vec<ReceiveEvent> {
    vec![ReceiveEvent::ProtocolViolation(v)]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn control(frame: ControlFrame) -> ChannelMessage {
        frame.to_message().unwrap()
    }

    fn start(name: &str, size: u64) -> ChannelMessage {
        control(ControlFrame::FileStart {
            name: name.to_string(),
            size,
            file_type: "text/plain".to_string(),
        })
    }

    fn end(name: &str) -> ChannelMessage {
        control(ControlFrame::FileEnd {
            name: name.to_string(),
        })
    }

    fn list(files: &[(&str, u64)]) -> ChannelMessage {
        control(ControlFrame::FileList {
            files: files
                .iter()
                .map(|(n, s)| FileDescriptor::new(*n, *s, "text/plain"))
                .collect(),
        })
    }

    fn received(events: &[ReceiveEvent]) -> Vec<&ReceivedFile> {
        events
            .iter()
            .filter_map(|e| match e {
                ReceiveEvent::FileReceived(f) => Some(f),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_single_small_file() {
        let mut rx = TransferReceiver::new();
        let mut events = Vec::new();
        for message in [
            list(&[("a.txt", 3)]),
            start("a.txt", 3),
            ChannelMessage::Binary(b"xyz".to_vec()),
            end("a.txt"),
            control(ControlFrame::TransferComplete),
        ] {
            events.extend(rx.handle(message));
        }

        let files = received(&events);
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].name, "a.txt");
        assert_eq!(files[0].data, b"xyz");
        assert!(files[0].is_complete());

        let percents: Vec<u8> = events
            .iter()
            .filter_map(|e| match e {
                ReceiveEvent::Progress(p) => Some(p.percent),
                _ => None,
            })
            .collect();
        assert_eq!(percents, vec![99, 100]);
        assert_eq!(events.last(), Some(&ReceiveEvent::TransferComplete));
        assert_eq!(rx.completed_batches(), 1);
    }

    #[test]
    fn test_manifest_initializes_progress() {
        let mut rx = TransferReceiver::new();
        let events = rx.handle(list(&[("a", 1), ("b", 2)]));
        match &events[..] {
            [ReceiveEvent::Manifest(entries)] => {
                assert_eq!(entries.len(), 2);
                assert!(entries.iter().all(|e| e.progress == 0));
            }
            other => panic!("unexpected events {other:?}"),
        }
    }

    #[test]
    fn test_progress_monotone_and_capped() {
        let mut rx = TransferReceiver::new();
        rx.handle(list(&[("f", 10)]));
        rx.handle(start("f", 10));

        let mut percents = Vec::new();
        for _ in 0..10 {
            for event in rx.handle(ChannelMessage::Binary(vec![0])) {
                if let ReceiveEvent::Progress(p) = event {
                    percents.push(p.percent);
                }
            }
        }
        assert_eq!(percents, vec![10, 20, 30, 40, 50, 60, 70, 80, 90, 99]);
        assert_eq!(rx.manifest()[0].progress, 99);

        rx.handle(end("f"));
        assert_eq!(rx.manifest()[0].progress, 100);
    }

    #[test]
    fn test_chunk_without_file_is_ignored() {
        let mut rx = TransferReceiver::new();
        let events = rx.handle(ChannelMessage::Binary(vec![1, 2, 3]));
        assert_eq!(
            events,
            vec![ReceiveEvent::ProtocolViolation(
                ProtocolViolation::ChunkWithoutFile { len: 3 }
            )]
        );

        // Receiver keeps working afterwards
        rx.handle(list(&[("a", 1)]));
        rx.handle(start("a", 1));
        rx.handle(ChannelMessage::Binary(vec![9]));
        let events = rx.handle(end("a"));
        assert_eq!(received(&events)[0].data, vec![9]);
    }

    #[test]
    fn test_duplicate_names_stay_separate() {
        let mut rx = TransferReceiver::new();
        rx.handle(list(&[("same", 1), ("same", 1)]));

        let mut events = Vec::new();
        for byte in [b'a', b'b'] {
            events.extend(rx.handle(start("same", 1)));
            events.extend(rx.handle(ChannelMessage::Binary(vec![byte])));
            events.extend(rx.handle(end("same")));
        }

        let files = received(&events);
        assert_eq!(files.len(), 2);
        assert_eq!((files[0].index, files[0].data.as_slice()), (0, &b"a"[..]));
        assert_eq!((files[1].index, files[1].data.as_slice()), (1, &b"b"[..]));
    }

    #[test]
    fn test_mismatched_file_end_ignored() {
        let mut rx = TransferReceiver::new();
        rx.handle(list(&[("a", 2)]));
        rx.handle(start("a", 2));
        rx.handle(ChannelMessage::Binary(vec![1]));

        let events = rx.handle(end("other"));
        assert_eq!(
            events,
            vec![ReceiveEvent::ProtocolViolation(
                ProtocolViolation::UnexpectedFileEnd {
                    name: "other".to_string()
                }
            )]
        );
        assert_eq!(rx.active_file(), Some("a"));

        rx.handle(ChannelMessage::Binary(vec![2]));
        let events = rx.handle(end("a"));
        assert_eq!(received(&events)[0].data, vec![1, 2]);
    }

    #[test]
    fn test_overflow_is_dropped() {
        let mut rx = TransferReceiver::new();
        rx.handle(list(&[("a", 2)]));
        rx.handle(start("a", 2));

        let events = rx.handle(ChannelMessage::Binary(vec![1, 2, 3, 4]));
        assert!(events.contains(&ReceiveEvent::ProtocolViolation(
            ProtocolViolation::ChunkOverflow {
                name: "a".to_string(),
                excess: 2
            }
        )));

        let events = rx.handle(end("a"));
        let file = received(&events)[0];
        assert_eq!(file.data, vec![1, 2]);
        assert!(file.is_complete());
    }

    #[test]
    fn test_short_file_flagged_incomplete() {
        let mut rx = TransferReceiver::new();
        rx.handle(list(&[("a", 5)]));
        rx.handle(start("a", 5));
        rx.handle(ChannelMessage::Binary(vec![1, 2]));

        let events = rx.handle(end("a"));
        let file = received(&events)[0];
        assert_eq!(file.data.len(), 2);
        assert!(!file.is_complete());
    }

    #[test]
    fn test_zero_length_file() {
        let mut rx = TransferReceiver::new();
        rx.handle(list(&[("empty", 0)]));
        assert!(rx.handle(start("empty", 0)).is_empty());

        let events = rx.handle(end("empty"));
        assert!(matches!(
            &events[0],
            ReceiveEvent::Progress(ProgressEvent { percent: 100, .. })
        ));
        let file = received(&events)[0];
        assert!(file.data.is_empty());
        assert!(file.is_complete());
    }

    #[test]
    fn test_malformed_text_reported() {
        let mut rx = TransferReceiver::new();
        let events = rx.handle(ChannelMessage::Text("{\"type\":\"bogus\"}".to_string()));
        assert!(matches!(
            &events[..],
            [ReceiveEvent::ProtocolViolation(ProtocolViolation::MalformedFrame(_))]
        ));
    }

    #[test]
    fn test_second_batch_resets_manifest() {
        let mut rx = TransferReceiver::new();
        rx.handle(list(&[("a", 0)]));
        rx.handle(start("a", 0));
        rx.handle(end("a"));
        rx.handle(control(ControlFrame::TransferComplete));

        rx.handle(list(&[("b", 1)]));
        assert_eq!(rx.manifest().len(), 1);
        assert_eq!(rx.manifest()[0].name, "b");
        rx.handle(start("b", 1));
        rx.handle(ChannelMessage::Binary(vec![0]));
        let events = rx.handle(end("b"));
        assert_eq!(received(&events)[0].index, 0);
    }

    #[tokio::test]
    async fn test_save_to_avoids_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let file = ReceivedFile {
            index: 0,
            name: "../escape/report.txt".to_string(),
            mime_type: "text/plain".to_string(),
            declared_size: 2,
            data: b"hi".to_vec(),
        };

        let first = file.save_to(dir.path()).await.unwrap();
        let second = file.save_to(dir.path()).await.unwrap();
        assert_eq!(first, dir.path().join("report.txt"));
        assert_eq!(second, dir.path().join("report (1).txt"));
        assert_eq!(tokio::fs::read(&second).await.unwrap(), b"hi");
    }
}
