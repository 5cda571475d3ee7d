//! Peer Connection Manager: one negotiated connection per remote
//! participant, driven by signaling messages and adapter callbacks.

mod connection;
mod quality;
mod rtc;

pub use connection::{
    PeerConnection, PeerConnectionFactory, PeerError, PeerEvent, PeerEventKind, PeerEventSink,
    PeerState,
};
pub use quality::{ConnectionQuality, aggregate};
pub use rtc::RtcPeerFactory;

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::media::{LocalTrack, TrackKind};
use crate::signaling::{
    IceCandidate, PeerId, SessionDescription, Signal, SignalingChannel, SignalingMessage,
};
use crate::view::{RemoteStream, RemoteStreamRecord};

/// Outbound half of signaling as seen by the manager.
pub trait SignalSink: Send + Sync {
    /// Returns `false` when the message was dropped.
    fn send(&self, message: &SignalingMessage) -> bool;
}

impl SignalSink for SignalingChannel {
    fn send(&self, message: &SignalingMessage) -> bool {
        SignalingChannel::send(self, message)
    }
}

pub struct PeerEntry {
    pub peer_id: PeerId,
    pub connection: Arc<dyn PeerConnection>,
    pub is_initiator: bool,
    generation: u64,
    state: PeerState,
}

impl PeerEntry {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn state(&self) -> PeerState {
        self.state
    }
}

/// Result of handling a signal or a connection callback, applied by the
/// session to the view and to published state.
#[derive(Debug, Clone)]
pub enum PeerOutcome {
    Stream(RemoteStreamRecord),
    /// The peer no longer sends any video.
    StreamEnded(PeerId),
    /// Remote audio; it plays alongside whatever the view binds.
    Audio { peer_id: PeerId, stream: RemoteStream },
    Quality(Option<ConnectionQuality>),
    PeerLeft(PeerId),
    SignalingError { peer_id: PeerId, error: PeerError },
}

pub struct PeerConnectionManager {
    local_id: PeerId,
    factory: Arc<dyn PeerConnectionFactory>,
    signals: Arc<dyn SignalSink>,
    max_peers: usize,
    entries: HashMap<PeerId, PeerEntry>,
    // Live remote video per peer, oldest first; the last one backs the view.
    remote_video: HashMap<PeerId, Vec<RemoteStream>>,
    local_tracks: Vec<Arc<LocalTrack>>,
    next_generation: u64,
    events_tx: mpsc::UnboundedSender<PeerEvent>,
}

impl PeerConnectionManager {
    pub fn new(
        local_id: PeerId,
        factory: Arc<dyn PeerConnectionFactory>,
        signals: Arc<dyn SignalSink>,
        max_peers: usize,
    ) -> (Self, mpsc::UnboundedReceiver<PeerEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let manager = Self {
            local_id,
            factory,
            signals,
            max_peers,
            entries: HashMap::new(),
            remote_video: HashMap::new(),
            local_tracks: Vec::new(),
            next_generation: 0,
            events_tx,
        };
        (manager, events_rx)
    }

    pub fn local_id(&self) -> PeerId {
        self.local_id
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entry(&self, peer_id: PeerId) -> Option<&PeerEntry> {
        self.entries.get(&peer_id)
    }

    pub fn peer_ids(&self) -> Vec<PeerId> {
        let mut ids: Vec<PeerId> = self.entries.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    fn connection(&self, peer_id: PeerId) -> Option<Arc<dyn PeerConnection>> {
        self.entries
            .get(&peer_id)
            .map(|entry| Arc::clone(&entry.connection))
    }

    pub fn quality(&self) -> Option<ConnectionQuality> {
        aggregate(self.entries.values().map(|entry| entry.state))
    }

    /// Tracks attached to every connection created from now on.
    pub fn set_local_tracks(&mut self, tracks: Vec<Arc<LocalTrack>>) {
        self.local_tracks = tracks;
    }

    /// Returns the entry for `peer_id`, creating it on first use. Only the
    /// first call decides `is_initiator`; an initiator sends its offer here.
    pub async fn ensure_peer(
        &mut self,
        peer_id: PeerId,
        is_initiator: bool,
    ) -> Result<&PeerEntry, PeerError> {
        if self.entries.contains_key(&peer_id) {
            return self
                .entries
                .get(&peer_id)
                .ok_or_else(|| PeerError::Setup("entry vanished".into()));
        }
        if self.entries.len() >= self.max_peers {
            tracing::warn!(
                target = "lesson_room::peer",
                peer_id,
                max_peers = self.max_peers,
                "participant limit reached; ignoring peer"
            );
            return Err(PeerError::RoomFull(self.max_peers));
        }

        self.next_generation += 1;
        let generation = self.next_generation;
        let sink = PeerEventSink::new(peer_id, generation, self.events_tx.clone());
        let connection = self.factory.create(peer_id, sink).await?;

        for track in &self.local_tracks {
            if let Err(err) = connection.add_local_track(track).await {
                connection.close().await;
                return Err(err);
            }
        }

        if is_initiator {
            if let Err(err) = self.send_offer(peer_id, connection.as_ref()).await {
                connection.close().await;
                return Err(err);
            }
        }

        tracing::info!(
            target = "lesson_room::peer",
            peer_id,
            generation,
            is_initiator,
            "peer connection created"
        );
        let entry = self.entries.entry(peer_id).or_insert(PeerEntry {
            peer_id,
            connection,
            is_initiator,
            generation,
            state: PeerState::New,
        });
        Ok(&*entry)
    }

    async fn send_offer(
        &self,
        peer_id: PeerId,
        connection: &dyn PeerConnection,
    ) -> Result<(), PeerError> {
        let offer = connection.create_offer().await?;
        connection.set_local_description(offer.clone()).await?;
        if !self
            .signals
            .send(&SignalingMessage::offer(self.local_id, peer_id, &offer))
        {
            tracing::debug!(
                target = "lesson_room::peer",
                peer_id,
                "offer dropped; signaling not open"
            );
        }
        Ok(())
    }

    /// Applies one inbound signaling message.
    pub async fn handle_signal(&mut self, message: SignalingMessage) -> Vec<PeerOutcome> {
        if message.to.is_some_and(|to| to != self.local_id) {
            tracing::trace!(target = "lesson_room::peer", to = ?message.to, "message for another participant");
            return Vec::new();
        }
        let signal = match message.decode() {
            Ok(signal) => signal,
            Err(err) => {
                tracing::warn!(
                    target = "lesson_room::peer",
                    error = %err,
                    "dropping undecodable signaling message"
                );
                return Vec::new();
            }
        };

        let mut outcomes = Vec::new();
        match signal {
            Signal::Peers(ids) => {
                for peer_id in ids {
                    if peer_id == self.local_id {
                        continue;
                    }
                    match self.ensure_peer(peer_id, true).await {
                        Ok(_) | Err(PeerError::RoomFull(_)) => {}
                        Err(error) => outcomes.push(PeerOutcome::SignalingError { peer_id, error }),
                    }
                }
                outcomes.push(PeerOutcome::Quality(self.quality()));
            }
            Signal::Offer { from, description } => {
                if from == self.local_id {
                    return outcomes;
                }
                self.handle_offer(from, description, &mut outcomes).await;
            }
            Signal::Answer { from, description } => {
                let Some(connection) = self.connection(from) else {
                    tracing::debug!(target = "lesson_room::peer", peer_id = from, "answer for unknown peer dropped");
                    return outcomes;
                };
                if let Err(error) = connection.set_remote_description(description).await {
                    self.fail_peer(from, error, &mut outcomes).await;
                }
            }
            Signal::Candidate { from, candidate } => {
                self.handle_candidate(from, candidate, &mut outcomes).await;
            }
            Signal::GetPeers => {}
        }
        outcomes
    }

    async fn handle_offer(
        &mut self,
        from: PeerId,
        description: SessionDescription,
        outcomes: &mut Vec<PeerOutcome>,
    ) {
        let connection = match self.ensure_peer(from, false).await {
            Ok(entry) => Arc::clone(&entry.connection),
            Err(PeerError::RoomFull(_)) => return,
            Err(error) => {
                outcomes.push(PeerOutcome::SignalingError {
                    peer_id: from,
                    error,
                });
                return;
            }
        };
        if let Err(error) = connection.set_remote_description(description).await {
            self.fail_peer(from, error, outcomes).await;
            return;
        }
        let answer = async {
            let answer = connection.create_answer().await?;
            connection.set_local_description(answer.clone()).await?;
            Ok::<_, PeerError>(answer)
        }
        .await;
        match answer {
            Ok(answer) => {
                if !self
                    .signals
                    .send(&SignalingMessage::answer(self.local_id, from, &answer))
                {
                    tracing::debug!(target = "lesson_room::peer", peer_id = from, "answer dropped; signaling not open");
                }
            }
            Err(error) => self.fail_peer(from, error, outcomes).await,
        }
    }

    async fn handle_candidate(
        &mut self,
        from: PeerId,
        candidate: IceCandidate,
        outcomes: &mut Vec<PeerOutcome>,
    ) {
        let Some(connection) = self.connection(from) else {
            tracing::debug!(target = "lesson_room::peer", peer_id = from, "candidate for unknown peer dropped");
            return;
        };
        if let Err(error) = connection.add_ice_candidate(candidate).await {
            tracing::warn!(
                target = "lesson_room::peer",
                peer_id = from,
                error = %error,
                "failed to add remote candidate"
            );
            outcomes.push(PeerOutcome::SignalingError {
                peer_id: from,
                error,
            });
        }
    }

    // Negotiation failures are reported and cost only this peer its entry.
    async fn fail_peer(&mut self, peer_id: PeerId, error: PeerError, outcomes: &mut Vec<PeerOutcome>) {
        tracing::warn!(
            target = "lesson_room::peer",
            peer_id,
            error = %error,
            "negotiation failed; dropping peer"
        );
        outcomes.push(PeerOutcome::SignalingError { peer_id, error });
        if self.remove_peer(peer_id).await {
            outcomes.push(PeerOutcome::PeerLeft(peer_id));
            outcomes.push(PeerOutcome::Quality(self.quality()));
        }
    }

    /// Applies one adapter callback. Events from a replaced or removed entry
    /// are ignored.
    pub async fn handle_event(&mut self, event: PeerEvent) -> Vec<PeerOutcome> {
        let PeerEvent {
            peer_id,
            generation,
            kind,
        } = event;
        let live = self
            .entries
            .get(&peer_id)
            .is_some_and(|entry| entry.generation == generation);
        if !live {
            tracing::trace!(
                target = "lesson_room::peer",
                peer_id,
                generation,
                "ignoring event from stale connection"
            );
            return Vec::new();
        }

        match kind {
            PeerEventKind::Candidate(candidate) => {
                let message = SignalingMessage::ice_candidate(self.local_id, peer_id, &candidate);
                if !self.signals.send(&message) {
                    tracing::trace!(
                        target = "lesson_room::peer",
                        peer_id,
                        "local candidate dropped; signaling not open"
                    );
                }
                Vec::new()
            }
            PeerEventKind::Track(stream) => match stream.kind {
                TrackKind::Audio => vec![PeerOutcome::Audio { peer_id, stream }],
                TrackKind::Video => {
                    let is_screen_share = stream.looks_like_screen();
                    tracing::info!(
                        target = "lesson_room::peer",
                        peer_id,
                        is_screen_share,
                        track_id = %stream.track_id,
                        "remote video track"
                    );
                    let videos = self.remote_video.entry(peer_id).or_default();
                    videos.retain(|live| live.track_id != stream.track_id);
                    videos.push(stream.clone());
                    vec![PeerOutcome::Stream(RemoteStreamRecord {
                        peer_id,
                        stream,
                        is_screen_share,
                    })]
                }
            },
            PeerEventKind::TrackEnded(track_id) => self.track_ended(peer_id, &track_id),
            PeerEventKind::State(state) => {
                if let Some(entry) = self.entries.get_mut(&peer_id) {
                    entry.state = state;
                }
                if !state.is_lost() {
                    return vec![PeerOutcome::Quality(self.quality())];
                }
                tracing::info!(
                    target = "lesson_room::peer",
                    peer_id,
                    ?state,
                    "peer connection lost"
                );
                self.remove_peer(peer_id).await;
                vec![
                    PeerOutcome::PeerLeft(peer_id),
                    PeerOutcome::Quality(self.quality()),
                ]
            }
        }
    }

    // Ending the track that backs the view falls back to the peer's previous
    // live video, e.g. the camera once a screen share stops.
    fn track_ended(&mut self, peer_id: PeerId, track_id: &str) -> Vec<PeerOutcome> {
        let Some(videos) = self.remote_video.get_mut(&peer_id) else {
            return Vec::new();
        };
        let Some(index) = videos.iter().position(|live| live.track_id == track_id) else {
            return Vec::new();
        };
        let was_current = index + 1 == videos.len();
        videos.remove(index);
        tracing::debug!(
            target = "lesson_room::peer",
            peer_id,
            track_id,
            was_current,
            "remote video track ended"
        );
        if !was_current {
            return Vec::new();
        }
        match videos.last().cloned() {
            Some(previous) => vec![PeerOutcome::Stream(RemoteStreamRecord {
                peer_id,
                is_screen_share: previous.looks_like_screen(),
                stream: previous,
            })],
            None => {
                self.remote_video.remove(&peer_id);
                vec![PeerOutcome::StreamEnded(peer_id)]
            }
        }
    }

    /// Attaches a new local track to every connection and renegotiates.
    pub async fn publish_track(&mut self, track: Arc<LocalTrack>) -> Vec<PeerOutcome> {
        if self.local_tracks.iter().any(|t| t.id() == track.id()) {
            return Vec::new();
        }
        self.local_tracks.push(Arc::clone(&track));
        let mut outcomes = Vec::new();
        for peer_id in self.peer_ids() {
            let Some(connection) = self.connection(peer_id) else {
                continue;
            };
            let result = async {
                connection.add_local_track(&track).await?;
                self.send_offer(peer_id, connection.as_ref()).await
            }
            .await;
            if let Err(error) = result {
                self.fail_peer(peer_id, error, &mut outcomes).await;
            }
        }
        outcomes
    }

    /// Detaches a local track from every connection and renegotiates.
    pub async fn withdraw_track(&mut self, track_id: &str) -> Vec<PeerOutcome> {
        let before = self.local_tracks.len();
        self.local_tracks.retain(|t| t.id() != track_id);
        if self.local_tracks.len() == before {
            return Vec::new();
        }
        let mut outcomes = Vec::new();
        for peer_id in self.peer_ids() {
            let Some(connection) = self.connection(peer_id) else {
                continue;
            };
            let result = async {
                connection.remove_local_track(track_id).await?;
                self.send_offer(peer_id, connection.as_ref()).await
            }
            .await;
            if let Err(error) = result {
                self.fail_peer(peer_id, error, &mut outcomes).await;
            }
        }
        outcomes
    }

    pub async fn remove_peer(&mut self, peer_id: PeerId) -> bool {
        self.remote_video.remove(&peer_id);
        match self.entries.remove(&peer_id) {
            Some(entry) => {
                entry.connection.close().await;
                tracing::debug!(target = "lesson_room::peer", peer_id, "peer entry removed");
                true
            }
            None => false,
        }
    }

    pub async fn close_all(&mut self) {
        for (_, entry) in self.entries.drain() {
            entry.connection.close().await;
        }
        self.remote_video.clear();
        self.local_tracks.clear();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::signaling::MessageKind;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    pub(crate) struct MockPeer {
        pub tracks: Mutex<Vec<String>>,
        pub remote: Mutex<Vec<SessionDescription>>,
        pub local: Mutex<Vec<SessionDescription>>,
        pub candidates: Mutex<Vec<IceCandidate>>,
        pub closed: AtomicBool,
        pub reject_remote: AtomicBool,
    }

    #[async_trait]
    impl PeerConnection for MockPeer {
        async fn add_local_track(&self, track: &Arc<LocalTrack>) -> Result<(), PeerError> {
            self.tracks.lock().push(track.id().to_string());
            Ok(())
        }

        async fn remove_local_track(&self, track_id: &str) -> Result<(), PeerError> {
            self.tracks.lock().retain(|id| id != track_id);
            Ok(())
        }

        async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
            Ok(SessionDescription::offer(format!(
                "offer with {} tracks",
                self.tracks.lock().len()
            )))
        }

        async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
            Ok(SessionDescription::answer("answer"))
        }

        async fn set_local_description(
            &self,
            description: SessionDescription,
        ) -> Result<(), PeerError> {
            self.local.lock().push(description);
            Ok(())
        }

        async fn set_remote_description(
            &self,
            description: SessionDescription,
        ) -> Result<(), PeerError> {
            if self.reject_remote.load(Ordering::SeqCst) {
                return Err(PeerError::RemoteDescription("bad sdp".into()));
            }
            self.remote.lock().push(description);
            Ok(())
        }

        async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
            self.candidates.lock().push(candidate);
            Ok(())
        }

        async fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    pub(crate) struct MockFactory {
        pub peers: Mutex<Vec<(PeerId, Arc<MockPeer>, PeerEventSink)>>,
        pub reject_remote: AtomicBool,
    }

    impl MockFactory {
        pub fn peer(&self, peer_id: PeerId) -> Option<Arc<MockPeer>> {
            self.peers
                .lock()
                .iter()
                .rev()
                .find(|(id, _, _)| *id == peer_id)
                .map(|(_, peer, _)| Arc::clone(peer))
        }

        pub fn sink(&self, peer_id: PeerId) -> Option<PeerEventSink> {
            self.peers
                .lock()
                .iter()
                .rev()
                .find(|(id, _, _)| *id == peer_id)
                .map(|(_, _, sink)| sink.clone())
        }

        pub fn created(&self) -> usize {
            self.peers.lock().len()
        }
    }

    #[async_trait]
    impl PeerConnectionFactory for MockFactory {
        async fn create(
            &self,
            peer_id: PeerId,
            events: PeerEventSink,
        ) -> Result<Arc<dyn PeerConnection>, PeerError> {
            let peer = Arc::new(MockPeer::default());
            peer.reject_remote
                .store(self.reject_remote.load(Ordering::SeqCst), Ordering::SeqCst);
            self.peers.lock().push((peer_id, Arc::clone(&peer), events));
            Ok(peer)
        }
    }

    #[derive(Default)]
    pub(crate) struct RecordingSink {
        pub open: AtomicBool,
        pub sent: Mutex<Vec<SignalingMessage>>,
    }

    impl RecordingSink {
        pub fn opened() -> Arc<Self> {
            let sink = Self::default();
            sink.open.store(true, Ordering::SeqCst);
            Arc::new(sink)
        }

        pub fn kinds(&self) -> Vec<MessageKind> {
            self.sent.lock().iter().map(|m| m.kind).collect()
        }
    }

    impl SignalSink for RecordingSink {
        fn send(&self, message: &SignalingMessage) -> bool {
            if !self.open.load(Ordering::SeqCst) {
                return false;
            }
            self.sent.lock().push(message.clone());
            true
        }
    }

    fn manager(
        factory: &Arc<MockFactory>,
        sink: &Arc<RecordingSink>,
        max_peers: usize,
    ) -> (PeerConnectionManager, mpsc::UnboundedReceiver<PeerEvent>) {
        PeerConnectionManager::new(1, factory.clone(), sink.clone(), max_peers)
    }

    fn offer_from(from: PeerId) -> SignalingMessage {
        SignalingMessage::offer(from, 1, &SessionDescription::offer("v=0"))
    }

    #[test_timeout::tokio_timeout_test]
    async fn ensure_peer_keeps_first_initiator_flag() {
        let factory = Arc::new(MockFactory::default());
        let sink = RecordingSink::opened();
        let (mut manager, _events) = manager(&factory, &sink, 4);

        assert!(!manager.ensure_peer(7, false).await.unwrap().is_initiator);
        assert!(!manager.ensure_peer(7, true).await.unwrap().is_initiator);
        assert!(!manager.ensure_peer(7, true).await.unwrap().is_initiator);
        assert_eq!(manager.len(), 1);
        assert_eq!(factory.created(), 1);
        assert!(sink.sent.lock().is_empty());
    }

    #[test_timeout::tokio_timeout_test]
    async fn peers_list_creates_initiators_and_sends_offers() {
        let factory = Arc::new(MockFactory::default());
        let sink = RecordingSink::opened();
        let (mut manager, _events) = manager(&factory, &sink, 4);
        manager.set_local_tracks(vec![
            crate::media::tests::test_track("mic", TrackKind::Audio, "mic"),
            crate::media::tests::test_track("cam", TrackKind::Video, "cam"),
        ]);

        manager
            .handle_signal(SignalingMessage::peers(&[1, 7, 9, 7]))
            .await;

        assert_eq!(manager.peer_ids(), vec![7, 9]);
        assert!(manager.entry(7).unwrap().is_initiator);
        assert_eq!(*factory.peer(7).unwrap().tracks.lock(), vec!["mic", "cam"]);
        let offers: Vec<_> = sink
            .sent
            .lock()
            .iter()
            .filter(|m| m.kind == MessageKind::Offer)
            .map(|m| m.to)
            .collect();
        assert_eq!(offers, vec![Some(7), Some(9)]);
    }

    #[test_timeout::tokio_timeout_test]
    async fn offer_is_answered() {
        let factory = Arc::new(MockFactory::default());
        let sink = RecordingSink::opened();
        let (mut manager, _events) = manager(&factory, &sink, 4);

        manager.handle_signal(offer_from(7)).await;

        let peer = factory.peer(7).unwrap();
        assert_eq!(peer.remote.lock().len(), 1);
        assert_eq!(peer.local.lock()[0], SessionDescription::answer("answer"));
        assert!(!manager.entry(7).unwrap().is_initiator);
        let sent = sink.sent.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind, MessageKind::Answer);
        assert_eq!((sent[0].from, sent[0].to), (Some(1), Some(7)));
    }

    #[test_timeout::tokio_timeout_test]
    async fn late_answer_and_candidate_are_dropped() {
        let factory = Arc::new(MockFactory::default());
        let sink = RecordingSink::opened();
        let (mut manager, _events) = manager(&factory, &sink, 4);

        let answer = SignalingMessage::answer(7, 1, &SessionDescription::answer("v=0"));
        let candidate = SignalingMessage::ice_candidate(
            7,
            1,
            &IceCandidate {
                candidate: "candidate:0".into(),
                sdp_mid: None,
                sdp_mline_index: None,
                username_fragment: None,
            },
        );
        assert!(manager.handle_signal(answer).await.is_empty());
        assert!(manager.handle_signal(candidate).await.is_empty());
        assert!(manager.is_empty());
        assert_eq!(factory.created(), 0);
    }

    #[test_timeout::tokio_timeout_test]
    async fn rejected_remote_description_only_drops_that_peer() {
        let factory = Arc::new(MockFactory::default());
        let sink = RecordingSink::opened();
        let (mut manager, _events) = manager(&factory, &sink, 4);
        manager.ensure_peer(9, true).await.unwrap();

        factory.reject_remote.store(true, Ordering::SeqCst);
        let outcomes = manager.handle_signal(offer_from(7)).await;

        assert!(matches!(
            outcomes[0],
            PeerOutcome::SignalingError {
                peer_id: 7,
                error: PeerError::RemoteDescription(_)
            }
        ));
        assert!(outcomes.iter().any(|o| matches!(o, PeerOutcome::PeerLeft(7))));
        assert_eq!(manager.peer_ids(), vec![9]);
        assert!(factory.peer(7).unwrap().closed.load(Ordering::SeqCst));
    }

    #[test_timeout::tokio_timeout_test]
    async fn candidates_only_go_out_while_signaling_is_open() {
        let factory = Arc::new(MockFactory::default());
        let sink = Arc::new(RecordingSink::default());
        let (mut manager, mut events) = manager(&factory, &sink, 4);
        manager.ensure_peer(7, false).await.unwrap();

        let candidate = IceCandidate {
            candidate: "candidate:1".into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        };
        let adapter = factory.sink(7).unwrap();
        adapter.emit(PeerEventKind::Candidate(candidate.clone()));
        let event = events.recv().await.unwrap();
        manager.handle_event(event).await;
        assert!(sink.sent.lock().is_empty());

        sink.open.store(true, Ordering::SeqCst);
        adapter.emit(PeerEventKind::Candidate(candidate));
        let event = events.recv().await.unwrap();
        manager.handle_event(event).await;
        assert_eq!(sink.kinds(), vec![MessageKind::IceCandidate]);
    }

    #[test_timeout::tokio_timeout_test]
    async fn failed_state_removes_peer_and_ignores_stale_events() {
        let factory = Arc::new(MockFactory::default());
        let sink = RecordingSink::opened();
        let (mut manager, mut events) = manager(&factory, &sink, 4);
        manager.ensure_peer(7, false).await.unwrap();
        let stale = factory.sink(7).unwrap();

        stale.emit(PeerEventKind::State(PeerState::Failed));
        let outcomes = manager.handle_event(events.recv().await.unwrap()).await;
        assert!(matches!(outcomes[0], PeerOutcome::PeerLeft(7)));
        assert!(matches!(outcomes[1], PeerOutcome::Quality(None)));
        assert!(manager.is_empty());

        manager.ensure_peer(7, false).await.unwrap();
        stale.emit(PeerEventKind::State(PeerState::Failed));
        let outcomes = manager.handle_event(events.recv().await.unwrap()).await;
        assert!(outcomes.is_empty());
        assert_eq!(manager.len(), 1);
    }

    #[test_timeout::tokio_timeout_test]
    async fn remote_tracks_are_classified() {
        let factory = Arc::new(MockFactory::default());
        let sink = RecordingSink::opened();
        let (mut manager, mut events) = manager(&factory, &sink, 4);
        manager.ensure_peer(7, false).await.unwrap();
        let adapter = factory.sink(7).unwrap();

        adapter.emit(PeerEventKind::Track(RemoteStream::detached(
            "s1",
            "screen-abc",
            TrackKind::Video,
            "screen-abc",
        )));
        let outcomes = manager.handle_event(events.recv().await.unwrap()).await;
        assert!(matches!(
            &outcomes[0],
            PeerOutcome::Stream(record) if record.is_screen_share && record.peer_id == 7
        ));

        adapter.emit(PeerEventKind::Track(RemoteStream::detached(
            "s1",
            "mic",
            TrackKind::Audio,
            "screen audio",
        )));
        let outcomes = manager.handle_event(events.recv().await.unwrap()).await;
        assert!(matches!(outcomes[0], PeerOutcome::Audio { peer_id: 7, .. }));
    }

    #[test_timeout::tokio_timeout_test]
    async fn participant_cap_is_enforced() {
        let factory = Arc::new(MockFactory::default());
        let sink = RecordingSink::opened();
        let (mut manager, _events) = manager(&factory, &sink, 1);

        let outcomes = manager.handle_signal(SignalingMessage::peers(&[7, 9])).await;
        assert_eq!(manager.peer_ids(), vec![7]);
        assert!(
            !outcomes
                .iter()
                .any(|o| matches!(o, PeerOutcome::SignalingError { .. }))
        );
        assert!(matches!(
            manager.ensure_peer(9, false).await,
            Err(PeerError::RoomFull(1))
        ));
    }

    #[test_timeout::tokio_timeout_test]
    async fn publishing_screen_renegotiates_every_peer() {
        let factory = Arc::new(MockFactory::default());
        let sink = RecordingSink::opened();
        let (mut manager, _events) = manager(&factory, &sink, 4);
        manager.ensure_peer(7, false).await.unwrap();

        let screen = crate::media::tests::test_track("screen-1", TrackKind::Video, "screen");
        assert!(manager.publish_track(screen.clone()).await.is_empty());
        assert_eq!(*factory.peer(7).unwrap().tracks.lock(), vec!["screen-1"]);
        assert_eq!(sink.kinds(), vec![MessageKind::Offer]);

        manager.ensure_peer(9, false).await.unwrap();
        assert_eq!(*factory.peer(9).unwrap().tracks.lock(), vec!["screen-1"]);

        manager.withdraw_track("screen-1").await;
        assert!(factory.peer(7).unwrap().tracks.lock().is_empty());
        assert_eq!(sink.kinds().len(), 3);
    }

    #[test_timeout::tokio_timeout_test]
    async fn quality_reflects_survivors_after_a_peer_is_lost() {
        let factory = Arc::new(MockFactory::default());
        let sink = RecordingSink::opened();
        let (mut manager, mut events) = manager(&factory, &sink, 4);
        manager.ensure_peer(7, false).await.unwrap();
        manager.ensure_peer(9, false).await.unwrap();

        for peer_id in [7, 9] {
            factory
                .sink(peer_id)
                .unwrap()
                .emit(PeerEventKind::State(PeerState::Connected));
            manager.handle_event(events.recv().await.unwrap()).await;
        }
        assert_eq!(manager.quality(), Some(ConnectionQuality::Good));

        factory
            .sink(9)
            .unwrap()
            .emit(PeerEventKind::State(PeerState::Failed));
        let outcomes = manager.handle_event(events.recv().await.unwrap()).await;

        assert!(matches!(outcomes[0], PeerOutcome::PeerLeft(9)));
        assert!(matches!(
            outcomes.last(),
            Some(PeerOutcome::Quality(Some(ConnectionQuality::Good)))
        ));
        assert_eq!(manager.peer_ids(), vec![7]);
    }

    #[test_timeout::tokio_timeout_test]
    async fn ended_screen_share_falls_back_to_camera() {
        let factory = Arc::new(MockFactory::default());
        let sink = RecordingSink::opened();
        let (mut manager, mut events) = manager(&factory, &sink, 4);
        manager.ensure_peer(7, false).await.unwrap();
        let adapter = factory.sink(7).unwrap();

        adapter.emit(PeerEventKind::Track(RemoteStream::detached(
            "cam-stream",
            "cam-7",
            TrackKind::Video,
            "cam-7",
        )));
        adapter.emit(PeerEventKind::Track(RemoteStream::detached(
            "screen-stream",
            "screen-7",
            TrackKind::Video,
            "screen-7",
        )));
        manager.handle_event(events.recv().await.unwrap()).await;
        manager.handle_event(events.recv().await.unwrap()).await;

        adapter.emit(PeerEventKind::TrackEnded("screen-7".into()));
        let outcomes = manager.handle_event(events.recv().await.unwrap()).await;
        assert!(matches!(
            &outcomes[..],
            [PeerOutcome::Stream(record)]
                if record.stream.track_id == "cam-7" && !record.is_screen_share
        ));

        adapter.emit(PeerEventKind::TrackEnded("unknown".into()));
        assert!(manager.handle_event(events.recv().await.unwrap()).await.is_empty());

        adapter.emit(PeerEventKind::TrackEnded("cam-7".into()));
        let outcomes = manager.handle_event(events.recv().await.unwrap()).await;
        assert!(matches!(&outcomes[..], [PeerOutcome::StreamEnded(7)]));
    }
}
