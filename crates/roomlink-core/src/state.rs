//! Observable session status.
//!
//! ```text
//!  Idle ──► Waiting ──► Connected ──► Transferring ──► Done
//!    │         │            │              ▲  │           │
//!    │         │            │              │  └───────────┤ (next batch)
//!    └─────────┴────────────┴──► Error ◄───┴──────────────┘
//! ```
//!
//! `Error` is terminal; a new session starts from a fresh machine.

use crate::error::StateError;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

/// Session status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferStatus {
    /// Nothing started
    Idle,
    /// Joined a room, negotiating the direct channel
    Waiting,
    /// Direct channel open
    Connected,
    /// A batch is in flight
    Transferring,
    /// The last batch completed
    Done,
    /// The session failed
    Error,
}

impl TransferStatus {
    /// Whether `next` may follow this status
    #[must_use]
    pub fn can_transition_to(self, next: TransferStatus) -> bool {
        use TransferStatus::*;
        match (self, next) {
            (Error, _) => false,
            (_, Error) => true,
            (Idle, Waiting)
            | (Waiting, Connected)
            | (Connected, Transferring)
            | (Transferring, Done)
            | (Done, Transferring) => true,
            _ => false,
        }
    }

    /// Whether the status admits no further transition
    #[must_use]
    pub fn is_terminal(self) -> bool {
        self == TransferStatus::Error
    }

    /// Whether the direct channel is usable
    #[must_use]
    pub fn is_connected(self) -> bool {
        matches!(
            self,
            TransferStatus::Connected | TransferStatus::Transferring | TransferStatus::Done
        )
    }

    /// Lowercase name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            TransferStatus::Idle => "idle",
            TransferStatus::Waiting => "waiting",
            TransferStatus::Connected => "connected",
            TransferStatus::Transferring => "transferring",
            TransferStatus::Done => "done",
            TransferStatus::Error => "error",
        }
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared status cell with change notification
///
/// Clones observe and drive the same status.
#[derive(Clone)]
pub struct TransferStateMachine {
    tx: Arc<watch::Sender<TransferStatus>>,
}

impl TransferStateMachine {
    /// Create a machine in [`TransferStatus::Idle`]
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(TransferStatus::Idle);
        Self { tx: Arc::new(tx) }
    }

    /// Current status
    #[must_use]
    pub fn status(&self) -> TransferStatus {
        *self.tx.borrow()
    }

    /// Watch status changes
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<TransferStatus> {
        self.tx.subscribe()
    }

    /// Move to `next`.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::InvalidTransition`] if `next` may not follow the
    /// current status; the status is left unchanged.
    pub fn transition(&self, next: TransferStatus) -> Result<(), StateError> {
        let mut result = Ok(());
        self.tx.send_if_modified(|current| {
            if current.can_transition_to(next) {
                debug!("Status {} -> {}", current, next);
                *current = next;
                true
            } else {
                result = Err(StateError::InvalidTransition {
                    from: *current,
                    to: next,
                });
                false
            }
        });
        result
    }

    /// Move to [`TransferStatus::Error`]; no-op if already there
    pub fn fail(&self) {
        let _ = self.transition(TransferStatus::Error);
    }
}

impl Default for TransferStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TransferStateMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TransferStateMachine")
            .field(&self.status())
            .finish()
    }
}
