//! One lesson-room visit. A single driver task owns the local media, the
//! signaling channel, the peer connections and the view; the UI talks to it
//! through [`RoomHandle`] and observes published [`RoomSnapshot`]s.

use std::sync::Arc;

use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::api::Lesson;
use crate::config::{MAX_RECONNECT_ATTEMPTS, RoomConfig};
use crate::media::{CaptureDevices, LocalMedia, MediaError, MediaEvent};
use crate::peer::{
    ConnectionQuality, PeerConnectionFactory, PeerConnectionManager, PeerError, PeerEvent,
    PeerOutcome,
};
use crate::signaling::{
    ChannelSettings, ChannelState, ClosedReason, PeerId, SignalingChannel, SignalingConnector,
    SignalingMessage, TokenRefresher,
};
use crate::view::{RemoteStream, StreamReconciler, ViewSelection, ViewState};

const EVENT_CAPACITY: usize = 64;

/// Errors that gate the whole room. Everything else is an event or a log line.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("camera or microphone unavailable: {0}")]
    MediaAccessDenied(String),
    #[error("connection lost after {attempts} reconnect attempts")]
    ConnectionLost { attempts: u32 },
    #[error("session expired and could not be renewed: {0}")]
    AuthRefresh(String),
    #[error("lesson {lesson_id} is not open for joining")]
    LessonUnavailable { lesson_id: u64 },
    #[error("invalid configuration: {0}")]
    Config(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionContext {
    pub lesson_id: u64,
    pub local_user_id: PeerId,
    pub auth_token: String,
}

/// External collaborators of a session.
#[derive(Clone)]
pub struct SessionDeps {
    pub devices: Arc<dyn CaptureDevices>,
    pub connector: Arc<dyn SignalingConnector>,
    pub refresher: Arc<dyn TokenRefresher>,
    pub peers: Arc<dyn PeerConnectionFactory>,
}

pub fn ensure_joinable(lesson: &Lesson, now: OffsetDateTime) -> Result<(), SessionError> {
    if lesson.is_joinable(now) {
        Ok(())
    } else {
        Err(SessionError::LessonUnavailable {
            lesson_id: lesson.id,
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct RoomSnapshot {
    pub channel: ChannelState,
    pub quality: Option<ConnectionQuality>,
    pub view: ViewState,
    pub peers: Vec<PeerId>,
    pub audio_enabled: bool,
    pub video_enabled: bool,
    pub sharing_screen: bool,
    pub error: Option<SessionError>,
    pub ended: bool,
}

impl Default for RoomSnapshot {
    fn default() -> Self {
        Self {
            channel: ChannelState::Connecting,
            quality: None,
            view: ViewState::default(),
            peers: Vec::new(),
            audio_enabled: false,
            video_enabled: false,
            sharing_screen: false,
            error: None,
            ended: false,
        }
    }
}

#[derive(Clone, Debug)]
pub enum RoomEvent {
    PeerJoined(PeerId),
    PeerLeft(PeerId),
    RemoteAudio { peer_id: PeerId, stream: RemoteStream },
    SignalingError { peer_id: PeerId, error: PeerError },
    ScreenShareEnded,
    Failed(SessionError),
    Ended,
}

enum Command {
    SelectView(ViewSelection),
    ToggleAudio(oneshot::Sender<bool>),
    ToggleVideo(oneshot::Sender<bool>),
    StartScreenShare(oneshot::Sender<Result<(), MediaError>>),
    StopScreenShare,
    Leave,
}

pub struct RoomHandle {
    commands: mpsc::UnboundedSender<Command>,
    snapshot: watch::Receiver<RoomSnapshot>,
    events: broadcast::Sender<RoomEvent>,
    task: JoinHandle<()>,
}

impl RoomHandle {
    pub fn snapshot(&self) -> RoomSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<RoomSnapshot> {
        self.snapshot.clone()
    }

    pub fn events(&self) -> broadcast::Receiver<RoomEvent> {
        self.events.subscribe()
    }

    pub fn select_view(&self, selection: ViewSelection) {
        let _ = self.commands.send(Command::SelectView(selection));
    }

    /// Returns the new audio state, or `None` once the session has ended.
    pub async fn toggle_audio(&self) -> Option<bool> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(Command::ToggleAudio(tx)).ok()?;
        rx.await.ok()
    }

    pub async fn toggle_video(&self) -> Option<bool> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(Command::ToggleVideo(tx)).ok()?;
        rx.await.ok()
    }

    pub async fn start_screen_share(&self) -> Result<(), MediaError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::StartScreenShare(tx))
            .map_err(|_| MediaError::Released)?;
        rx.await.unwrap_or(Err(MediaError::Released))
    }

    pub fn stop_screen_share(&self) {
        let _ = self.commands.send(Command::StopScreenShare);
    }

    /// Tears the session down and waits for teardown to finish.
    pub async fn leave(self) {
        let _ = self.commands.send(Command::Leave);
        let _ = self.task.await;
    }
}

pub struct RoomSession;

impl RoomSession {
    /// Acquires local media, then starts signaling and the driver task.
    /// Media failure is fatal and nothing is started.
    pub async fn start(
        context: SessionContext,
        config: &RoomConfig,
        deps: SessionDeps,
    ) -> Result<RoomHandle, SessionError> {
        let (mut media, media_events) = LocalMedia::new(
            deps.devices,
            config.video_quality,
            config.screen_share_enabled,
        );
        if let Err(err) = media.acquire_local_media().await {
            tracing::error!(
                target = "lesson_room::session",
                lesson_id = context.lesson_id,
                error = %err,
                "local media unavailable"
            );
            media.release_all();
            let reason = match err {
                MediaError::AccessDenied(reason) => reason,
                other => other.to_string(),
            };
            return Err(SessionError::MediaAccessDenied(reason));
        }

        let (channel, messages) = SignalingChannel::spawn(
            deps.connector,
            deps.refresher,
            ChannelSettings {
                lesson_id: context.lesson_id.to_string(),
                token: context.auth_token.clone(),
                base_delay: config.reconnect_base_delay,
                max_attempts: MAX_RECONNECT_ATTEMPTS,
            },
        );
        let (mut manager, peer_events) = PeerConnectionManager::new(
            context.local_user_id,
            deps.peers,
            Arc::new(channel.clone()),
            config.max_remote_peers(),
        );
        manager.set_local_tracks(media.local_tracks());

        let initial = RoomSnapshot {
            audio_enabled: media.audio_enabled(),
            video_enabled: media.video_enabled(),
            view: StreamReconciler::new().view(),
            ..RoomSnapshot::default()
        };
        let (snapshot_tx, snapshot_rx) = watch::channel(initial);
        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();

        tracing::info!(
            target = "lesson_room::session",
            lesson_id = context.lesson_id,
            user_id = context.local_user_id,
            "lesson room session starting"
        );
        let driver = SessionDriver {
            channel_state: channel.subscribe(),
            channel,
            messages,
            media,
            media_events,
            manager,
            peer_events,
            view: StreamReconciler::new(),
            commands: commands_rx,
            snapshot: snapshot_tx,
            events: events_tx.clone(),
            screen_tracks: Vec::new(),
            torn_down: false,
        };
        let task = tokio::spawn(driver.run());

        Ok(RoomHandle {
            commands: commands_tx,
            snapshot: snapshot_rx,
            events: events_tx,
            task,
        })
    }
}

#[derive(PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

struct SessionDriver {
    channel: SignalingChannel,
    channel_state: watch::Receiver<ChannelState>,
    messages: mpsc::UnboundedReceiver<SignalingMessage>,
    media: LocalMedia,
    media_events: mpsc::UnboundedReceiver<MediaEvent>,
    manager: PeerConnectionManager,
    peer_events: mpsc::UnboundedReceiver<PeerEvent>,
    view: StreamReconciler,
    commands: mpsc::UnboundedReceiver<Command>,
    snapshot: watch::Sender<RoomSnapshot>,
    events: broadcast::Sender<RoomEvent>,
    screen_tracks: Vec<String>,
    torn_down: bool,
}

impl SessionDriver {
    async fn run(mut self) {
        loop {
            let flow = tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => Flow::Stop,
                },
                changed = self.channel_state.changed() => {
                    let mut state = self.channel_state.borrow_and_update().clone();
                    if changed.is_err() && !state.is_closed() {
                        state = ChannelState::Closed(ClosedReason::Normal);
                    }
                    self.handle_channel_state(state)
                },
                Some(message) = self.messages.recv() => {
                    let outcomes = self.manager.handle_signal(message).await;
                    self.apply(outcomes);
                    Flow::Continue
                },
                Some(event) = self.peer_events.recv() => {
                    let outcomes = self.manager.handle_event(event).await;
                    self.apply(outcomes);
                    Flow::Continue
                },
                Some(event) = self.media_events.recv() => {
                    self.handle_media_event(event).await;
                    Flow::Continue
                },
            };
            if flow == Flow::Stop {
                break;
            }
        }
        self.teardown().await;
    }

    async fn handle_command(&mut self, command: Command) -> Flow {
        match command {
            Command::SelectView(selection) => {
                let view = self.view.select(selection);
                self.snapshot.send_modify(|snapshot| snapshot.view = view);
            }
            Command::ToggleAudio(reply) => {
                let enabled = self.media.toggle_audio();
                self.snapshot
                    .send_modify(|snapshot| snapshot.audio_enabled = enabled);
                let _ = reply.send(enabled);
            }
            Command::ToggleVideo(reply) => {
                let enabled = self.media.toggle_video();
                self.snapshot
                    .send_modify(|snapshot| snapshot.video_enabled = enabled);
                let _ = reply.send(enabled);
            }
            Command::StartScreenShare(reply) => {
                let result = self.start_screen_share().await;
                let _ = reply.send(result);
            }
            Command::StopScreenShare => {
                self.media.release_screen_share();
                self.withdraw_screen().await;
            }
            Command::Leave => {
                tracing::info!(target = "lesson_room::session", "leaving lesson room");
                return Flow::Stop;
            }
        }
        Flow::Continue
    }

    async fn start_screen_share(&mut self) -> Result<(), MediaError> {
        let stream = self.media.acquire_screen_share().await?;
        self.screen_tracks = stream.tracks.iter().map(|t| t.id().to_string()).collect();
        for track in stream.tracks {
            let outcomes = self.manager.publish_track(track).await;
            self.apply(outcomes);
        }
        self.snapshot
            .send_modify(|snapshot| snapshot.sharing_screen = true);
        Ok(())
    }

    async fn withdraw_screen(&mut self) {
        for track_id in std::mem::take(&mut self.screen_tracks) {
            let outcomes = self.manager.withdraw_track(&track_id).await;
            self.apply(outcomes);
        }
        self.snapshot
            .send_modify(|snapshot| snapshot.sharing_screen = false);
    }

    async fn handle_media_event(&mut self, event: MediaEvent) {
        match event {
            MediaEvent::ScreenShareEnded { stream_id } => {
                tracing::info!(
                    target = "lesson_room::session",
                    stream_id = %stream_id,
                    "screen share stopped from system controls"
                );
                self.withdraw_screen().await;
                let _ = self.events.send(RoomEvent::ScreenShareEnded);
            }
        }
    }

    fn handle_channel_state(&mut self, state: ChannelState) -> Flow {
        tracing::debug!(target = "lesson_room::session", ?state, "signaling state");
        self.snapshot
            .send_modify(|snapshot| snapshot.channel = state.clone());
        let ChannelState::Closed(reason) = state else {
            return Flow::Continue;
        };
        let error = match reason {
            ClosedReason::Normal => None,
            ClosedReason::ConnectionLost { attempts } => {
                Some(SessionError::ConnectionLost { attempts })
            }
            ClosedReason::AuthRefreshFailed(message) => Some(SessionError::AuthRefresh(message)),
        };
        if let Some(error) = error {
            tracing::error!(target = "lesson_room::session", error = %error, "session failed");
            self.snapshot
                .send_modify(|snapshot| snapshot.error = Some(error.clone()));
            let _ = self.events.send(RoomEvent::Failed(error));
        }
        Flow::Stop
    }

    fn apply(&mut self, outcomes: Vec<PeerOutcome>) {
        let known = self.snapshot.borrow().peers.clone();
        for outcome in outcomes {
            match outcome {
                PeerOutcome::Stream(record) => {
                    let view = self.view.upsert(record);
                    self.snapshot.send_modify(|snapshot| snapshot.view = view);
                }
                PeerOutcome::StreamEnded(peer_id) => {
                    if let Some(view) = self.view.remove(peer_id) {
                        self.snapshot.send_modify(|snapshot| snapshot.view = view);
                    }
                }
                PeerOutcome::Audio { peer_id, stream } => {
                    let _ = self.events.send(RoomEvent::RemoteAudio { peer_id, stream });
                }
                PeerOutcome::Quality(quality) => {
                    self.snapshot
                        .send_modify(|snapshot| snapshot.quality = quality);
                }
                PeerOutcome::PeerLeft(peer_id) => {
                    if let Some(view) = self.view.remove(peer_id) {
                        self.snapshot.send_modify(|snapshot| snapshot.view = view);
                    }
                    let _ = self.events.send(RoomEvent::PeerLeft(peer_id));
                }
                PeerOutcome::SignalingError { peer_id, error } => {
                    let _ = self.events.send(RoomEvent::SignalingError { peer_id, error });
                }
            }
        }

        let peers = self.manager.peer_ids();
        for peer_id in peers.iter().filter(|id| !known.contains(*id)) {
            let _ = self.events.send(RoomEvent::PeerJoined(*peer_id));
        }
        self.snapshot.send_if_modified(|snapshot| {
            if snapshot.peers == peers {
                false
            } else {
                snapshot.peers = peers;
                true
            }
        });
    }

    async fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        self.media.release_all();
        self.manager.close_all().await;
        self.channel.close();
        self.view.clear();
        let view = self.view.view();
        self.snapshot.send_modify(|snapshot| {
            snapshot.ended = true;
            snapshot.peers.clear();
            snapshot.view = view;
            snapshot.sharing_screen = false;
            snapshot.audio_enabled = false;
            snapshot.video_enabled = false;
        });
        let _ = self.events.send(RoomEvent::Ended);
        tracing::info!(target = "lesson_room::session", "lesson room session ended");
    }
}
