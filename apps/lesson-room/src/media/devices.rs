use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use super::{CaptureDevices, LocalStream, LocalTrack, MediaError, TrackKind};
use crate::config::VideoQuality;

/// Capture backend that hands out sample-driven tracks. An external encoder
/// (camera, test pattern, file replay) writes samples into the returned
/// tracks; this type only allocates them with the negotiated codecs.
#[derive(Debug, Default)]
pub struct StaticSampleDevices {
    with_audio: bool,
}

impl StaticSampleDevices {
    pub fn new() -> Self {
        Self { with_audio: true }
    }

    pub fn video_only() -> Self {
        Self { with_audio: false }
    }
}

fn sample_track(kind: TrackKind, id: String, stream_id: &str, label: &str) -> Arc<LocalTrack> {
    let capability = match kind {
        TrackKind::Audio => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_owned(),
            clock_rate: 48_000,
            channels: 2,
            ..Default::default()
        },
        TrackKind::Video => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_VP8.to_owned(),
            clock_rate: 90_000,
            ..Default::default()
        },
    };
    let rtc = Arc::new(TrackLocalStaticSample::new(
        capability,
        id.clone(),
        stream_id.to_string(),
    ));
    Arc::new(LocalTrack::new(id, kind, label, rtc))
}

#[async_trait]
impl CaptureDevices for StaticSampleDevices {
    async fn open_camera(&self, quality: VideoQuality) -> Result<LocalStream, MediaError> {
        let stream_id = format!("camera-{}", Uuid::new_v4());
        let (width, height, fps) = quality.dimensions();
        let mut tracks = Vec::with_capacity(2);
        if self.with_audio {
            tracks.push(sample_track(
                TrackKind::Audio,
                format!("audio-{}", Uuid::new_v4()),
                &stream_id,
                "microphone",
            ));
        }
        tracks.push(sample_track(
            TrackKind::Video,
            format!("camera-{}", Uuid::new_v4()),
            &stream_id,
            &format!("camera {width}x{height}@{fps}"),
        ));
        Ok(LocalStream {
            id: stream_id,
            tracks,
        })
    }

    async fn open_display(&self, _quality: VideoQuality) -> Result<LocalStream, MediaError> {
        let stream_id = format!("screen-{}", Uuid::new_v4());
        // Remote peers classify by this id, which surfaces as their track label.
        let track_id = format!("screen-{}", Uuid::new_v4());
        let track = sample_track(TrackKind::Video, track_id, &stream_id, "screen");
        Ok(LocalStream {
            id: stream_id,
            tracks: vec![track],
        })
    }
}
