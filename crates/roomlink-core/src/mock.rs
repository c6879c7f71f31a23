//! In-memory host platform for tests and loopback runs.
//!
//! Offers and answers are tokens naming the mock peer that produced them;
//! applying the answer on the offering side links the two peers and opens
//! their channels. Every applied local description yields one synthesized
//! candidate.

use crate::transport::{
    ChannelMessage, ConnectionState, DataChannel, IceCandidate, PeerConnection, PeerEvent,
    PeerEvents, SdpKind, SessionDescription, TransportError,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::mpsc;
use tracing::debug;

const OFFER_PREFIX: &str = "mock-offer:";
const ANSWER_PREFIX: &str = "mock-answer:";
const CANDIDATE_PREFIX: &str = "candidate:mock ";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// Network
// ============================================================================

#[derive(Default)]
struct NetworkInner {
    next_id: u64,
    peers: HashMap<u64, Arc<PeerShared>>,
}

/// Registry of mock peers that can reach each other
#[derive(Clone, Default)]
pub struct MockNetwork {
    inner: Arc<Mutex<NetworkInner>>,
}

impl MockNetwork {
    /// Create an empty network
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a peer connection and its event stream
    #[must_use]
    pub fn peer(&self) -> (Arc<MockPeerConnection>, PeerEvents) {
        let (events, rx) = mpsc::unbounded_channel();
        let mut inner = lock(&self.inner);
        inner.next_id += 1;
        let shared = Arc::new(PeerShared {
            id: inner.next_id,
            events,
            state: Mutex::new(PeerState::default()),
        });
        inner.peers.insert(shared.id, shared.clone());

        let peer = Arc::new(MockPeerConnection {
            shared,
            network: self.clone(),
        });
        (peer, rx)
    }

    fn get(&self, id: u64) -> Option<Arc<PeerShared>> {
        lock(&self.inner).peers.get(&id).cloned()
    }
}

// ============================================================================
// Peer Connection
// ============================================================================

struct PeerShared {
    id: u64,
    events: mpsc::UnboundedSender<PeerEvent>,
    state: Mutex<PeerState>,
}

impl PeerShared {
    fn emit(&self, event: PeerEvent) {
        let _ = self.events.send(event);
    }
}

#[derive(Default)]
struct PeerState {
    channel: Option<Arc<MockDataChannel>>,
    remote: Option<u64>,
    remote_candidates: usize,
    closed: bool,
}

/// Mock peer connection
pub struct MockPeerConnection {
    shared: Arc<PeerShared>,
    network: MockNetwork,
}

impl MockPeerConnection {
    /// Network-unique peer id
    #[must_use]
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// This side's data channel, once created or received
    #[must_use]
    pub fn channel(&self) -> Option<Arc<MockDataChannel>> {
        lock(&self.shared.state).channel.clone()
    }

    /// Whether `close` has been called
    #[must_use]
    pub fn is_closed(&self) -> bool {
        lock(&self.shared.state).closed
    }

    /// Candidates applied from the peer
    #[must_use]
    pub fn remote_candidates(&self) -> usize {
        lock(&self.shared.state).remote_candidates
    }

    /// Surface one more local candidate, as a late gathering round would
    pub fn gather_candidate(&self) {
        self.shared
            .emit(PeerEvent::IceCandidate(self.local_candidate()));
    }

    fn local_candidate(&self) -> IceCandidate {
        IceCandidate {
            candidate: format!("{CANDIDATE_PREFIX}{}", self.shared.id),
            sdp_mid: Some("0".to_string()),
            sdp_m_line_index: Some(0),
        }
    }

    /// Simulate loss of the direct path on both sides
    pub fn fail(&self) {
        let (channel, remote) = {
            let state = lock(&self.shared.state);
            (state.channel.clone(), state.remote)
        };
        if let Some(channel) = channel {
            channel.open.store(false, Ordering::SeqCst);
        }
        self.shared
            .emit(PeerEvent::ConnectionState(ConnectionState::Failed));

        if let Some(remote) = remote.and_then(|id| self.network.get(id)) {
            if let Some(channel) = lock(&remote.state).channel.clone() {
                channel.open.store(false, Ordering::SeqCst);
            }
            remote.emit(PeerEvent::ConnectionState(ConnectionState::Failed));
        }
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if lock(&self.shared.state).closed {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }

    /// Link to the answering peer and open both channels
    fn link(&self, remote: &Arc<PeerShared>) {
        let local_channel = {
            let mut state = lock(&self.shared.state);
            state.remote = Some(remote.id);
            state.channel.clone()
        };
        self.shared
            .emit(PeerEvent::ConnectionState(ConnectionState::Connected));
        remote.emit(PeerEvent::ConnectionState(ConnectionState::Connected));

        let Some(local_channel) = local_channel else {
            return;
        };
        let remote_channel = Arc::new(MockDataChannel::new(local_channel.label()));
        local_channel.connect(remote.events.clone(), &remote_channel);
        remote_channel.connect(self.shared.events.clone(), &local_channel);
        lock(&remote.state).channel = Some(remote_channel.clone());

        remote.emit(PeerEvent::DataChannel(remote_channel));
        remote.emit(PeerEvent::ChannelOpen);
        self.shared.emit(PeerEvent::ChannelOpen);
        debug!("Mock peers {} and {} linked", self.shared.id, remote.id);
    }
}

fn parse_token(sdp: &str, prefix: &str) -> Result<u64, TransportError> {
    sdp.strip_prefix(prefix)
        .and_then(|id| id.parse().ok())
        .ok_or_else(|| TransportError::Negotiation(format!("unrecognized description {sdp:?}")))
}

#[async_trait]
impl PeerConnection for MockPeerConnection {
    async fn create_data_channel(
        &self,
        label: &str,
    ) -> Result<Arc<dyn DataChannel>, TransportError> {
        self.ensure_open()?;
        let channel = Arc::new(MockDataChannel::new(label));
        lock(&self.shared.state).channel = Some(channel.clone());
        Ok(channel)
    }

    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        self.ensure_open()?;
        Ok(SessionDescription {
            kind: SdpKind::Offer,
            sdp: format!("{OFFER_PREFIX}{}", self.shared.id),
        })
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        self.ensure_open()?;
        if lock(&self.shared.state).remote.is_none() {
            return Err(TransportError::Negotiation(
                "no remote offer applied".to_string(),
            ));
        }
        Ok(SessionDescription {
            kind: SdpKind::Answer,
            sdp: format!("{ANSWER_PREFIX}{}", self.shared.id),
        })
    }

    async fn set_local_description(&self, _desc: SessionDescription) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.shared
            .emit(PeerEvent::IceCandidate(self.local_candidate()));
        Ok(())
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), TransportError> {
        self.ensure_open()?;
        match desc.kind {
            SdpKind::Offer => {
                let id = parse_token(&desc.sdp, OFFER_PREFIX)?;
                if self.network.get(id).is_none() {
                    return Err(TransportError::Negotiation(format!("unknown peer {id}")));
                }
                lock(&self.shared.state).remote = Some(id);
                Ok(())
            }
            SdpKind::Answer => {
                let id = parse_token(&desc.sdp, ANSWER_PREFIX)?;
                let remote = self
                    .network
                    .get(id)
                    .ok_or_else(|| TransportError::Negotiation(format!("unknown peer {id}")))?;
                self.link(&remote);
                Ok(())
            }
        }
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        self.ensure_open()?;
        if !candidate.candidate.starts_with(CANDIDATE_PREFIX) {
            return Err(TransportError::InvalidCandidate(candidate.candidate));
        }
        lock(&self.shared.state).remote_candidates += 1;
        Ok(())
    }

    async fn close(&self) {
        let channel = {
            let mut state = lock(&self.shared.state);
            state.closed = true;
            state.channel.clone()
        };
        if let Some(channel) = channel {
            channel.close().await;
        }
    }
}

// ============================================================================
// Data Channel
// ============================================================================

/// Mock data channel delivering into the peer's event stream
pub struct MockDataChannel {
    label: String,
    open: AtomicBool,
    buffered: AtomicUsize,
    remote: Mutex<Option<mpsc::UnboundedSender<PeerEvent>>>,
    counterpart: Mutex<Weak<MockDataChannel>>,
    sent: AtomicUsize,
}

impl MockDataChannel {
    fn new(label: &str) -> Self {
        Self {
            label: label.to_string(),
            open: AtomicBool::new(false),
            buffered: AtomicUsize::new(0),
            remote: Mutex::new(None),
            counterpart: Mutex::new(Weak::new()),
            sent: AtomicUsize::new(0),
        }
    }

    fn connect(&self, remote: mpsc::UnboundedSender<PeerEvent>, counterpart: &Arc<MockDataChannel>) {
        *lock(&self.remote) = Some(remote);
        *lock(&self.counterpart) = Arc::downgrade(counterpart);
        self.open.store(true, Ordering::SeqCst);
    }

    /// Override the reported buffered amount
    pub fn set_buffered_amount(&self, bytes: usize) {
        self.buffered.store(bytes, Ordering::SeqCst);
    }

    /// Messages sent so far
    #[must_use]
    pub fn messages_sent(&self) -> usize {
        self.sent.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DataChannel for MockDataChannel {
    fn label(&self) -> &str {
        &self.label
    }

    async fn send(&self, message: ChannelMessage) -> Result<(), TransportError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(TransportError::ChannelClosed);
        }
        let remote = lock(&self.remote).clone();
        let remote = remote.ok_or(TransportError::ChannelClosed)?;
        remote
            .send(PeerEvent::ChannelMessage(message))
            .map_err(|_| TransportError::ChannelClosed)?;
        self.sent.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn buffered_amount(&self) -> usize {
        self.buffered.load(Ordering::SeqCst)
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        if !self.open.swap(false, Ordering::SeqCst) {
            return;
        }
        // Closing either end closes both
        let counterpart = lock(&self.counterpart).upgrade();
        if let Some(counterpart) = counterpart {
            counterpart.open.store(false, Ordering::SeqCst);
        }
        let remote = lock(&self.remote).take();
        if let Some(remote) = remote {
            let _ = remote.send(PeerEvent::ChannelClosed);
        }
    }
}
