//! Error types for the RoomLink client core.

use crate::state::TransferStatus;
use crate::transport::TransportError;
use thiserror::Error;

/// Client core errors
#[derive(Debug, Error)]
pub enum Error {
    /// Host platform error
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Negotiation error
    #[error("negotiation error: {0}")]
    Negotiation(#[from] NegotiationError),

    /// Transfer error
    #[error("transfer error: {0}")]
    Transfer(#[from] TransferError),

    /// Status machine error
    #[error("state error: {0}")]
    State(#[from] StateError),
}

/// Convenience alias for client core results
pub type Result<T> = std::result::Result<T, Error>;

/// Errors while pairing through the relay and opening the direct channel
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NegotiationError {
    /// The room does not exist
    #[error("room does not exist")]
    RoomNotFound,

    /// The room already holds two participants
    #[error("room full")]
    RoomFull,

    /// The room outlived its lifetime
    #[error("room expired")]
    RoomExpired,

    /// Any other relay rejection
    #[error("relay rejected request: {0}")]
    Relay(String),

    /// The peer connection failed or disconnected
    #[error("connection lost")]
    ConnectionLost,

    /// The signaling link closed before the channel opened
    #[error("signaling link closed")]
    SignalingClosed,
}

/// Errors while moving a batch over the direct channel
#[derive(Debug, Error)]
pub enum TransferError {
    /// No open channel to send on
    #[error("not connected")]
    NotConnected,

    /// The batch exceeds the configured size limit
    #[error("batch of {total} bytes exceeds limit of {limit} bytes")]
    SizeLimitExceeded {
        /// Declared batch size
        total: u64,
        /// Configured limit
        limit: u64,
    },

    /// The channel stayed above the high-watermark for too long
    #[error("backpressure did not clear within {waited_ms} ms")]
    BackpressureTimeout {
        /// Time spent waiting
        waited_ms: u64,
    },

    /// The batch was cancelled
    #[error("transfer cancelled")]
    Cancelled,

    /// A file source ended before its declared size
    #[error("{name}: source ended at {actual} of {expected} bytes")]
    SourceTruncated {
        /// File name
        name: String,
        /// Declared size
        expected: u64,
        /// Bytes actually read
        actual: u64,
    },

    /// Reading a source or writing an artifact failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The channel failed mid-transfer
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// A control frame could not be encoded or decoded
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Status machine errors
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum StateError {
    /// The requested transition is not allowed from the current status
    #[error("invalid transition from {from} to {to}")]
    InvalidTransition {
        /// Current status
        from: TransferStatus,
        /// Requested status
        to: TransferStatus,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_conversions() {
        let err: Error = NegotiationError::RoomFull.into();
        assert!(matches!(err, Error::Negotiation(NegotiationError::RoomFull)));

        let err: Error = TransferError::Cancelled.into();
        assert_eq!(err.to_string(), "transfer error: transfer cancelled");

        let err: Error = TransportError::ChannelClosed.into();
        assert!(matches!(err, Error::Transport(_)));
    }

    #[test]
    fn test_display_messages() {
        let err = TransferError::SizeLimitExceeded {
            total: 600,
            limit: 500,
        };
        assert_eq!(err.to_string(), "batch of 600 bytes exceeds limit of 500 bytes");

        let err = StateError::InvalidTransition {
            from: TransferStatus::Idle,
            to: TransferStatus::Done,
        };
        assert_eq!(err.to_string(), "invalid transition from idle to done");
    }
}
