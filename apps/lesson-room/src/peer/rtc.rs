//! webrtc-rs implementation of the connection seam.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::TrackLocal;

use super::connection::{
    PeerConnection, PeerConnectionFactory, PeerError, PeerEventKind, PeerEventSink, PeerState,
};
use crate::media::{LocalTrack, TrackKind};
use crate::signaling::{IceCandidate, PeerId, SdpType, SessionDescription};
use crate::view::RemoteStream;

fn to_setup_error<E: std::fmt::Display>(err: E) -> PeerError {
    PeerError::Setup(err.to_string())
}

fn to_negotiation_error<E: std::fmt::Display>(err: E) -> PeerError {
    PeerError::Negotiation(err.to_string())
}

fn build_api() -> Result<API, PeerError> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(to_setup_error)?;

    let mut registry = Registry::new();
    registry =
        register_default_interceptors(registry, &mut media_engine).map_err(to_setup_error)?;

    Ok(APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

pub struct RtcPeerFactory {
    api: API,
    ice_servers: Vec<RTCIceServer>,
}

impl RtcPeerFactory {
    pub fn new(ice_servers: Vec<RTCIceServer>) -> Result<Self, PeerError> {
        Ok(Self {
            api: build_api()?,
            ice_servers,
        })
    }
}

fn map_state(state: RTCPeerConnectionState) -> PeerState {
    match state {
        RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => PeerState::New,
        RTCPeerConnectionState::Connecting => PeerState::Connecting,
        RTCPeerConnectionState::Connected => PeerState::Connected,
        RTCPeerConnectionState::Disconnected => PeerState::Disconnected,
        RTCPeerConnectionState::Failed => PeerState::Failed,
        RTCPeerConnectionState::Closed => PeerState::Closed,
    }
}

#[async_trait]
impl PeerConnectionFactory for RtcPeerFactory {
    async fn create(
        &self,
        peer_id: PeerId,
        events: PeerEventSink,
    ) -> Result<Arc<dyn PeerConnection>, PeerError> {
        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };
        let pc = Arc::new(
            self.api
                .new_peer_connection(config)
                .await
                .map_err(to_setup_error)?,
        );

        let sink = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let sink = sink.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        sink.emit(PeerEventKind::Candidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        }));
                    }
                    Err(err) => {
                        tracing::warn!(
                            target = "lesson_room::peer",
                            peer_id = sink.peer_id(),
                            error = %err,
                            "failed to serialize local candidate"
                        );
                    }
                }
            })
        }));

        let announced: Arc<Mutex<HashSet<String>>> = Arc::default();
        let sink = events.clone();
        let seen = Arc::clone(&announced);
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let sink = sink.clone();
            let seen = Arc::clone(&seen);
            Box::pin(async move {
                let kind = match track.kind() {
                    RTPCodecType::Audio => TrackKind::Audio,
                    RTPCodecType::Video => TrackKind::Video,
                    _ => return,
                };
                // webrtc-rs exposes no track label; the sender's track id
                // carries the source name instead.
                let track_id = track.id();
                seen.lock().insert(track_id.clone());
                let stream = RemoteStream {
                    id: track.stream_id(),
                    label: track_id.clone(),
                    track_id,
                    kind,
                    track: Some(track),
                };
                tracing::debug!(
                    target = "lesson_room::peer",
                    peer_id = sink.peer_id(),
                    ?stream,
                    "remote track arrived"
                );
                sink.emit(PeerEventKind::Track(stream));
            })
        }));

        let sink = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let sink = sink.clone();
            Box::pin(async move {
                tracing::debug!(
                    target = "lesson_room::peer",
                    peer_id = sink.peer_id(),
                    ?state,
                    "peer connection state changed"
                );
                sink.emit(PeerEventKind::State(map_state(state)));
            })
        }));

        Ok(Arc::new(RtcPeer {
            peer_id,
            pc,
            senders: Mutex::new(HashMap::new()),
            announced,
            events,
        }))
    }
}

struct RtcPeer {
    peer_id: PeerId,
    pc: Arc<RTCPeerConnection>,
    senders: Mutex<HashMap<String, Arc<RTCRtpSender>>>,
    /// Remote track ids reported through `on_track` and not yet retired.
    announced: Arc<Mutex<HashSet<String>>>,
    events: PeerEventSink,
}

impl RtcPeer {
    // webrtc-rs has no per-track "ended" callback; a renegotiated remote
    // description that no longer sends a track is the removal signal.
    fn retire_withdrawn_tracks(&self, remote_sdp: &str) {
        let sending = sending_track_ids(remote_sdp);
        let ended: Vec<String> = {
            let mut announced = self.announced.lock();
            let ended: Vec<String> = announced
                .iter()
                .filter(|id| !sending.contains(*id))
                .cloned()
                .collect();
            for id in &ended {
                announced.remove(id);
            }
            ended
        };
        for track_id in ended {
            tracing::debug!(
                target = "lesson_room::peer",
                peer_id = self.peer_id,
                track_id = %track_id,
                "remote track withdrawn"
            );
            self.events.emit(PeerEventKind::TrackEnded(track_id));
        }
    }
}

fn to_rtc_description(description: SessionDescription) -> Result<RTCSessionDescription, webrtc::Error> {
    match description.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(description.sdp),
        SdpType::Answer => RTCSessionDescription::answer(description.sdp),
    }
}

/// Track ids the author of `sdp` is sending: `a=msid` entries of media
/// sections that are neither rejected (port 0) nor `recvonly`/`inactive`.
fn sending_track_ids(sdp: &str) -> HashSet<String> {
    struct Section {
        rejected: bool,
        sending: bool,
        tracks: Vec<String>,
    }

    let mut sections: Vec<Section> = Vec::new();
    for line in sdp.lines().map(str::trim) {
        if let Some(media) = line.strip_prefix("m=") {
            sections.push(Section {
                rejected: media.split_whitespace().nth(1) == Some("0"),
                sending: true,
                tracks: Vec::new(),
            });
            continue;
        }
        let Some(section) = sections.last_mut() else {
            continue;
        };
        match line {
            "a=recvonly" | "a=inactive" => section.sending = false,
            "a=sendrecv" | "a=sendonly" => section.sending = true,
            _ => {
                if let Some(msid) = line.strip_prefix("a=msid:") {
                    if let Some(track) = msid.split_whitespace().nth(1) {
                        section.tracks.push(track.to_string());
                    }
                }
            }
        }
    }
    sections
        .into_iter()
        .filter(|section| section.sending && !section.rejected)
        .flat_map(|section| section.tracks)
        .collect()
}

#[async_trait]
impl PeerConnection for RtcPeer {
    async fn add_local_track(&self, track: &Arc<LocalTrack>) -> Result<(), PeerError> {
        let rtc: Arc<dyn TrackLocal + Send + Sync> = track.rtc();
        let sender = self.pc.add_track(rtc).await.map_err(to_setup_error)?;

        // RTCP must be drained for interceptors (NACK, reports) to run.
        let rtcp_sender = Arc::clone(&sender);
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while rtcp_sender.read(&mut buf).await.is_ok() {}
        });
        self.senders.lock().insert(track.id().to_string(), sender);
        Ok(())
    }

    async fn remove_local_track(&self, track_id: &str) -> Result<(), PeerError> {
        let sender = self.senders.lock().remove(track_id);
        match sender {
            Some(sender) => self.pc.remove_track(&sender).await.map_err(to_negotiation_error),
            None => Ok(()),
        }
    }

    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(to_negotiation_error)?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(to_negotiation_error)?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<(), PeerError> {
        let description = to_rtc_description(description).map_err(to_negotiation_error)?;
        self.pc
            .set_local_description(description)
            .await
            .map_err(to_negotiation_error)
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), PeerError> {
        let remote_sdp = description.sdp.clone();
        let description = to_rtc_description(description)
            .map_err(|err| PeerError::RemoteDescription(err.to_string()))?;
        self.pc
            .set_remote_description(description)
            .await
            .map_err(|err| PeerError::RemoteDescription(err.to_string()))?;
        self.retire_withdrawn_tracks(&remote_sdp);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|err| PeerError::Candidate(err.to_string()))
    }

    async fn close(&self) {
        self.senders.lock().clear();
        self.announced.lock().clear();
        if let Err(err) = self.pc.close().await {
            tracing::debug!(
                target = "lesson_room::peer",
                peer_id = self.peer_id,
                error = %err,
                "peer connection close failed"
            );
        }
    }
}
