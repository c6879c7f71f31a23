//! Data-plane frames.
//!
//! Control frames are JSON text messages with a `type` discriminator; payload
//! chunks are raw binary messages. The channel's own text/binary framing tells
//! the two apart, so chunks carry no header.

use crate::error::TransferError;
use crate::transport::ChannelMessage;
use serde::{Deserialize, Serialize};

/// One file of a manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDescriptor {
    /// File name (not guaranteed unique within a batch)
    pub name: String,
    /// Declared size in bytes
    pub size: u64,
    /// Declared MIME type, possibly empty
    #[serde(rename = "type", default)]
    pub mime_type: String,
}

impl FileDescriptor {
    /// Create a descriptor
    pub fn new(name: impl Into<String>, size: u64, mime_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            size,
            mime_type: mime_type.into(),
        }
    }
}

/// Control frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ControlFrame {
    /// Manifest of the whole batch, sent before any payload
    FileList {
        /// Files in send order
        files: Vec<FileDescriptor>,
    },

    /// Start of one file's payload
    FileStart {
        /// File name
        name: String,
        /// Declared size in bytes
        size: u64,
        /// Declared MIME type
        #[serde(rename = "fileType", default)]
        file_type: String,
    },

    /// End of one file's payload
    FileEnd {
        /// File name
        name: String,
    },

    /// End of the batch
    TransferComplete,
}

impl ControlFrame {
    /// Frame start for a descriptor
    #[must_use]
    pub fn file_start(descriptor: &FileDescriptor) -> Self {
        ControlFrame::FileStart {
            name: descriptor.name.clone(),
            size: descriptor.size,
            file_type: descriptor.mime_type.clone(),
        }
    }

    /// Encode as a text channel message
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::Serialization`] if encoding fails.
    pub fn to_message(&self) -> Result<ChannelMessage, TransferError> {
        serde_json::to_string(self)
            .map(ChannelMessage::Text)
            .map_err(|e| TransferError::Serialization(e.to_string()))
    }

    /// Decode from text
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::Serialization`] if the text is not a known frame.
    pub fn parse(text: &str) -> Result<Self, TransferError> {
        serde_json::from_str(text).map_err(|e| TransferError::Serialization(e.to_string()))
    }

    /// Wire name of the frame
    #[must_use]
    pub fn frame_type(&self) -> &'static str {
        match self {
            ControlFrame::FileList { .. } => "file-list",
            ControlFrame::FileStart { .. } => "file-start",
            ControlFrame::FileEnd { .. } => "file-end",
            ControlFrame::TransferComplete => "transfer-complete",
        }
    }
}

/// A decoded channel message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Control frame
    Control(ControlFrame),
    /// Payload chunk
    Chunk(Vec<u8>),
}

impl Frame {
    /// Classify a channel message by its framing
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::Serialization`] for malformed text.
    pub fn decode(message: ChannelMessage) -> Result<Self, TransferError> {
        match message {
            ChannelMessage::Text(text) => ControlFrame::parse(&text).map(Frame::Control),
            ChannelMessage::Binary(data) => Ok(Frame::Chunk(data)),
        }
    }
}
