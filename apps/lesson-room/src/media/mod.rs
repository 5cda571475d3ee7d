//! Local capture: the camera/microphone stream shared by every peer
//! connection, and the on-demand screen-share stream.

mod devices;

pub use devices::StaticSampleDevices;

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use webrtc::media::Sample;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::config::VideoQuality;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MediaError {
    #[error("camera/microphone access denied: {0}")]
    AccessDenied(String),
    #[error("screen capture denied: {0}")]
    ScreenShareDenied(String),
    #[error("screen sharing is disabled")]
    ScreenShareDisabled,
    #[error("screen share already active")]
    AlreadySharing,
    #[error("local media already released")]
    Released,
    #[error("failed to write sample: {0}")]
    Write(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackKind {
    Audio,
    Video,
}

/// A locally captured track. Capture pipelines push encoded samples through
/// [`LocalTrack::write_sample`]; the same track is attached to every peer.
pub struct LocalTrack {
    id: String,
    kind: TrackKind,
    label: String,
    enabled: AtomicBool,
    ended: watch::Sender<bool>,
    rtc: Arc<TrackLocalStaticSample>,
}

impl LocalTrack {
    pub fn new(
        id: impl Into<String>,
        kind: TrackKind,
        label: impl Into<String>,
        rtc: Arc<TrackLocalStaticSample>,
    ) -> Self {
        let (ended, _) = watch::channel(false);
        Self {
            id: id.into(),
            kind,
            label: label.into(),
            enabled: AtomicBool::new(true),
            ended,
            rtc,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_ended(&self) -> bool {
        *self.ended.borrow()
    }

    /// Marks the track ended. Capture backends call this when the source goes
    /// away on its own (e.g. the user stopped sharing from the system UI).
    pub fn stop(&self) {
        self.ended.send_replace(true);
    }

    pub fn subscribe_ended(&self) -> watch::Receiver<bool> {
        self.ended.subscribe()
    }

    pub fn rtc(&self) -> Arc<TrackLocalStaticSample> {
        Arc::clone(&self.rtc)
    }

    /// Forwards a sample to the attached connections. Samples written while
    /// the track is disabled or ended are discarded.
    pub async fn write_sample(&self, sample: &Sample) -> Result<(), MediaError> {
        if !self.is_enabled() || self.is_ended() {
            return Ok(());
        }
        self.rtc
            .write_sample(sample)
            .await
            .map_err(|err| MediaError::Write(err.to_string()))
    }
}

impl fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("label", &self.label)
            .field("enabled", &self.is_enabled())
            .field("ended", &self.is_ended())
            .finish()
    }
}

#[derive(Clone, Debug)]
pub struct LocalStream {
    pub id: String,
    pub tracks: Vec<Arc<LocalTrack>>,
}

impl LocalStream {
    pub fn tracks_of(&self, kind: TrackKind) -> impl Iterator<Item = &Arc<LocalTrack>> {
        self.tracks.iter().filter(move |track| track.kind() == kind)
    }

    fn stop_all(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}

/// Capture backend seam. Implementations own the platform capture APIs.
#[async_trait]
pub trait CaptureDevices: Send + Sync {
    /// Opens combined camera + microphone capture.
    async fn open_camera(&self, quality: VideoQuality) -> Result<LocalStream, MediaError>;

    /// Opens display capture.
    async fn open_display(&self, quality: VideoQuality) -> Result<LocalStream, MediaError>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MediaEvent {
    /// The screen-share source ended outside of `release_screen_share`.
    ScreenShareEnded { stream_id: String },
}

pub struct LocalMedia {
    devices: Arc<dyn CaptureDevices>,
    quality: VideoQuality,
    screen_share_enabled: bool,
    camera: Option<LocalStream>,
    screen: Arc<Mutex<Option<LocalStream>>>,
    events_tx: mpsc::UnboundedSender<MediaEvent>,
    released: bool,
}

impl LocalMedia {
    pub fn new(
        devices: Arc<dyn CaptureDevices>,
        quality: VideoQuality,
        screen_share_enabled: bool,
    ) -> (Self, mpsc::UnboundedReceiver<MediaEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let media = Self {
            devices,
            quality,
            screen_share_enabled,
            camera: None,
            screen: Arc::new(Mutex::new(None)),
            events_tx,
            released: false,
        };
        (media, events_rx)
    }

    /// Captures camera + microphone once; later calls hand back the same stream.
    pub async fn acquire_local_media(&mut self) -> Result<LocalStream, MediaError> {
        if self.released {
            return Err(MediaError::Released);
        }
        if let Some(stream) = &self.camera {
            return Ok(stream.clone());
        }
        let stream = self.devices.open_camera(self.quality).await?;
        if stream.tracks.is_empty() {
            return Err(MediaError::AccessDenied("capture produced no tracks".into()));
        }
        tracing::info!(
            target = "lesson_room::media",
            stream_id = %stream.id,
            tracks = stream.tracks.len(),
            "local media acquired"
        );
        self.camera = Some(stream.clone());
        Ok(stream)
    }

    pub fn camera(&self) -> Option<&LocalStream> {
        self.camera.as_ref()
    }

    pub fn toggle_audio(&self) -> bool {
        self.toggle(TrackKind::Audio)
    }

    pub fn toggle_video(&self) -> bool {
        self.toggle(TrackKind::Video)
    }

    pub fn audio_enabled(&self) -> bool {
        self.kind_enabled(TrackKind::Audio)
    }

    pub fn video_enabled(&self) -> bool {
        self.kind_enabled(TrackKind::Video)
    }

    fn kind_enabled(&self, kind: TrackKind) -> bool {
        self.camera
            .as_ref()
            .map(|stream| stream.tracks_of(kind).any(|track| track.is_enabled()))
            .unwrap_or(false)
    }

    // Flips the enabled flag only; tracks stay attached and nothing is renegotiated.
    fn toggle(&self, kind: TrackKind) -> bool {
        let Some(stream) = &self.camera else {
            return false;
        };
        let next = !self.kind_enabled(kind);
        for track in stream.tracks_of(kind) {
            track.set_enabled(next);
        }
        tracing::debug!(target = "lesson_room::media", ?kind, enabled = next, "toggled local tracks");
        next
    }

    pub fn is_sharing_screen(&self) -> bool {
        self.screen.lock().is_some()
    }

    /// Starts display capture. Calling this while a share is active is a caller
    /// error and fails with [`MediaError::AlreadySharing`].
    pub async fn acquire_screen_share(&mut self) -> Result<LocalStream, MediaError> {
        if self.released {
            return Err(MediaError::Released);
        }
        if !self.screen_share_enabled {
            return Err(MediaError::ScreenShareDisabled);
        }
        if self.is_sharing_screen() {
            return Err(MediaError::AlreadySharing);
        }
        let mut stream = self.devices.open_display(self.quality).await?;
        stream.tracks.retain(|track| {
            if track.kind() == TrackKind::Audio {
                track.stop();
                false
            } else {
                true
            }
        });
        if stream.tracks.is_empty() {
            return Err(MediaError::ScreenShareDenied(
                "display capture produced no video track".into(),
            ));
        }

        for track in &stream.tracks {
            self.watch_screen_track(&stream.id, track);
        }
        *self.screen.lock() = Some(stream.clone());
        tracing::info!(
            target = "lesson_room::media",
            stream_id = %stream.id,
            "screen share started"
        );
        Ok(stream)
    }

    fn watch_screen_track(&self, stream_id: &str, track: &Arc<LocalTrack>) {
        let mut ended = track.subscribe_ended();
        let slot = Arc::clone(&self.screen);
        let events = self.events_tx.clone();
        let stream_id = stream_id.to_string();
        tokio::spawn(async move {
            if ended.wait_for(|ended| *ended).await.is_err() {
                return;
            }
            let taken = {
                let mut guard = slot.lock();
                if guard.as_ref().map(|s| s.id == stream_id).unwrap_or(false) {
                    guard.take()
                } else {
                    None
                }
            };
            if let Some(stream) = taken {
                stream.stop_all();
                tracing::info!(
                    target = "lesson_room::media",
                    stream_id = %stream_id,
                    "screen share ended by source"
                );
                let _ = events.send(MediaEvent::ScreenShareEnded { stream_id });
            }
        });
    }

    /// Stops the screen stream if one is active. Safe to call repeatedly.
    pub fn release_screen_share(&mut self) {
        if let Some(stream) = self.screen.lock().take() {
            stream.stop_all();
            tracing::info!(
                target = "lesson_room::media",
                stream_id = %stream.id,
                "screen share released"
            );
        }
    }

    pub fn screen(&self) -> Option<LocalStream> {
        self.screen.lock().clone()
    }

    /// Every local track currently live: camera tracks followed by the screen track.
    pub fn local_tracks(&self) -> Vec<Arc<LocalTrack>> {
        let mut tracks: Vec<Arc<LocalTrack>> = self
            .camera
            .as_ref()
            .map(|stream| stream.tracks.clone())
            .unwrap_or_default();
        if let Some(screen) = self.screen.lock().as_ref() {
            tracks.extend(screen.tracks.iter().cloned());
        }
        tracks
    }

    pub fn release_all(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.release_screen_share();
        if let Some(camera) = self.camera.take() {
            camera.stop_all();
        }
        tracing::debug!(target = "lesson_room::media", "released all local media");
    }
}
