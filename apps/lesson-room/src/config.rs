use std::env;
use std::time::Duration;

use thiserror::Error;
use url::Url;
use webrtc::ice_transport::ice_server::RTCIceServer;

const DEFAULT_API_BASE: &str = "http://127.0.0.1:8000/api/";
const DEFAULT_SIGNALING_URL: &str = "ws://127.0.0.1:8000/";
const DEFAULT_STUN: &str = "stun:stun.l.google.com:19302";
const DEFAULT_MAX_PARTICIPANTS: usize = 2;
const DEFAULT_RECONNECT_BASE_MS: u64 = 1_000;
const DEFAULT_ROSTER_POLL_MS: u64 = 5_000;

/// Upper bound on signaling reconnect attempts before the session gives up.
pub const MAX_RECONNECT_ATTEMPTS: u32 = 3;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}")]
    Invalid { key: &'static str, value: String },
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum VideoQuality {
    Low,
    #[default]
    Medium,
    High,
}

impl VideoQuality {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "low" => Some(VideoQuality::Low),
            "medium" => Some(VideoQuality::Medium),
            "high" => Some(VideoQuality::High),
            _ => None,
        }
    }

    /// Capture dimensions and frame rate requested for this quality level.
    pub fn dimensions(self) -> (u32, u32, u32) {
        match self {
            VideoQuality::Low => (320, 240, 15),
            VideoQuality::Medium => (640, 480, 30),
            VideoQuality::High => (1280, 720, 30),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TurnServer {
    pub url: String,
    pub username: String,
    pub credential: String,
}

/// Lesson room configuration, sourced from `LESSON_ROOM_*` environment variables.
#[derive(Clone, Debug)]
pub struct RoomConfig {
    pub api_base: Url,
    pub signaling_url: Url,
    pub ice_servers: Vec<String>,
    pub turn: Option<TurnServer>,
    pub screen_share_enabled: bool,
    pub max_participants: usize,
    pub video_quality: VideoQuality,
    pub reconnect_base_delay: Duration,
    pub roster_poll_interval: Duration,
}

impl RoomConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the config from an arbitrary key lookup; unset or blank keys
    /// keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let api_base = get("LESSON_ROOM_API_BASE").unwrap_or_else(|| DEFAULT_API_BASE.to_string());
        let signaling_url =
            get("LESSON_ROOM_SIGNALING_URL").unwrap_or_else(|| DEFAULT_SIGNALING_URL.to_string());
        let mut config = RoomConfig {
            api_base: parse_base_url("LESSON_ROOM_API_BASE", &api_base)?,
            signaling_url: parse_signaling_url(&signaling_url)?,
            ice_servers: vec![DEFAULT_STUN.to_string()],
            turn: None,
            screen_share_enabled: true,
            max_participants: DEFAULT_MAX_PARTICIPANTS,
            video_quality: VideoQuality::default(),
            reconnect_base_delay: Duration::from_millis(DEFAULT_RECONNECT_BASE_MS),
            roster_poll_interval: Duration::from_millis(DEFAULT_ROSTER_POLL_MS),
        };

        if let Some(raw) = get("LESSON_ROOM_ICE_SERVERS") {
            config.ice_servers = raw
                .split(',')
                .map(str::trim)
                .filter(|url| !url.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let (Some(url), Some(username), Some(credential)) = (
            get("LESSON_ROOM_TURN_URL"),
            get("LESSON_ROOM_TURN_USERNAME"),
            get("LESSON_ROOM_TURN_CREDENTIAL"),
        ) {
            config.turn = Some(TurnServer {
                url,
                username,
                credential,
            });
        }
        if let Some(raw) = get("LESSON_ROOM_SCREEN_SHARE") {
            config.screen_share_enabled = parse_flag("LESSON_ROOM_SCREEN_SHARE", &raw)?;
        }
        if let Some(raw) = get("LESSON_ROOM_MAX_PARTICIPANTS") {
            config.max_participants = raw
                .parse::<usize>()
                .ok()
                .filter(|max| *max >= 2)
                .ok_or(ConfigError::Invalid {
                    key: "LESSON_ROOM_MAX_PARTICIPANTS",
                    value: raw.clone(),
                })?;
        }
        if let Some(raw) = get("LESSON_ROOM_VIDEO_QUALITY") {
            config.video_quality = VideoQuality::parse(&raw).ok_or(ConfigError::Invalid {
                key: "LESSON_ROOM_VIDEO_QUALITY",
                value: raw.clone(),
            })?;
        }
        if let Some(raw) = get("LESSON_ROOM_RECONNECT_BASE_MS") {
            config.reconnect_base_delay = parse_millis("LESSON_ROOM_RECONNECT_BASE_MS", &raw)?;
        }
        if let Some(raw) = get("LESSON_ROOM_ROSTER_POLL_MS") {
            config.roster_poll_interval = parse_millis("LESSON_ROOM_ROSTER_POLL_MS", &raw)?;
        }
        Ok(config)
    }

    /// ICE server list handed to the peer connection adapter. The TURN entry,
    /// when configured, is appended after the plain STUN urls.
    pub fn rtc_ice_servers(&self) -> Vec<RTCIceServer> {
        let mut servers: Vec<RTCIceServer> = self
            .ice_servers
            .iter()
            .map(|url| RTCIceServer {
                urls: vec![url.clone()],
                ..Default::default()
            })
            .collect();
        if let Some(turn) = &self.turn {
            servers.push(RTCIceServer {
                urls: vec![turn.url.clone()],
                username: turn.username.clone(),
                credential: turn.credential.clone(),
                ..Default::default()
            });
        }
        servers
    }

    /// Maximum number of remote peers a single session keeps connections to.
    pub fn max_remote_peers(&self) -> usize {
        self.max_participants.saturating_sub(1).max(1)
    }
}

fn parse_base_url(key: &'static str, raw: &str) -> Result<Url, ConfigError> {
    // Url::join drops the last segment unless the base ends with a slash.
    let normalized = if raw.ends_with('/') {
        raw.to_string()
    } else {
        format!("{raw}/")
    };
    Url::parse(&normalized).map_err(|_| ConfigError::Invalid {
        key,
        value: raw.to_string(),
    })
}

fn parse_signaling_url(raw: &str) -> Result<Url, ConfigError> {
    let invalid = || ConfigError::Invalid {
        key: "LESSON_ROOM_SIGNALING_URL",
        value: raw.to_string(),
    };
    let mut url = parse_base_url("LESSON_ROOM_SIGNALING_URL", raw)?;
    let scheme = match url.scheme() {
        "ws" | "http" => "ws",
        "wss" | "https" => "wss",
        _ => return Err(invalid()),
    };
    url.set_scheme(scheme).map_err(|_| invalid())?;
    Ok(url)
}

fn parse_flag(key: &'static str, raw: &str) -> Result<bool, ConfigError> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid {
            key,
            value: raw.to_string(),
        }),
    }
}

fn parse_millis(key: &'static str, raw: &str) -> Result<Duration, ConfigError> {
    raw.parse::<u64>()
        .ok()
        .filter(|ms| *ms > 0)
        .map(Duration::from_millis)
        .ok_or(ConfigError::Invalid {
            key,
            value: raw.to_string(),
        })
}
