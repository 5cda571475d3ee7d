use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::media::LocalTrack;
use crate::signaling::{IceCandidate, PeerId, SessionDescription};
use crate::view::RemoteStream;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PeerError {
    #[error("peer connection setup failed: {0}")]
    Setup(String),
    #[error("negotiation failed: {0}")]
    Negotiation(String),
    #[error("remote description rejected: {0}")]
    RemoteDescription(String),
    #[error("ice candidate rejected: {0}")]
    Candidate(String),
    #[error("participant limit reached ({0} remote peers)")]
    RoomFull(usize),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl PeerState {
    pub fn is_lost(self) -> bool {
        matches!(self, PeerState::Failed | PeerState::Disconnected)
    }
}

#[derive(Debug, Clone)]
pub enum PeerEventKind {
    Candidate(IceCandidate),
    Track(RemoteStream),
    /// The remote side stopped sending a previously announced track.
    TrackEnded(String),
    State(PeerState),
}

/// Callback output of one connection, tagged with the generation of the
/// entry that registered the callbacks.
#[derive(Debug, Clone)]
pub struct PeerEvent {
    pub peer_id: PeerId,
    pub generation: u64,
    pub kind: PeerEventKind,
}

/// Where an adapter reports candidate, track and state callbacks.
#[derive(Debug, Clone)]
pub struct PeerEventSink {
    peer_id: PeerId,
    generation: u64,
    tx: mpsc::UnboundedSender<PeerEvent>,
}

impl PeerEventSink {
    pub(crate) fn new(peer_id: PeerId, generation: u64, tx: mpsc::UnboundedSender<PeerEvent>) -> Self {
        Self {
            peer_id,
            generation,
            tx,
        }
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns `false` once the session stopped listening.
    pub fn emit(&self, kind: PeerEventKind) -> bool {
        self.tx
            .send(PeerEvent {
                peer_id: self.peer_id,
                generation: self.generation,
                kind,
            })
            .is_ok()
    }
}

/// A single negotiated connection to one remote participant.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn add_local_track(&self, track: &Arc<LocalTrack>) -> Result<(), PeerError>;
    async fn remove_local_track(&self, track_id: &str) -> Result<(), PeerError>;
    async fn create_offer(&self) -> Result<SessionDescription, PeerError>;
    async fn create_answer(&self) -> Result<SessionDescription, PeerError>;
    async fn set_local_description(&self, description: SessionDescription) -> Result<(), PeerError>;
    async fn set_remote_description(&self, description: SessionDescription)
    -> Result<(), PeerError>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError>;
    async fn close(&self);
}

#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    /// Creates a connection whose callbacks report through `events`.
    async fn create(
        &self,
        peer_id: PeerId,
        events: PeerEventSink,
    ) -> Result<Arc<dyn PeerConnection>, PeerError>;
}
