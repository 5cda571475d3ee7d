use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Participant identifier as assigned by the backend (the user id).
pub type PeerId = u64;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed signaling frame: {0}")]
    Frame(#[source] serde_json::Error),
    #[error("malformed {kind:?} payload: {source}")]
    Payload {
        kind: MessageKind,
        #[source]
        source: serde_json::Error,
    },
    #[error("{0:?} message is missing its sender")]
    MissingSender(MessageKind),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    #[serde(rename = "peers")]
    PeersList,
    #[serde(rename = "offer")]
    Offer,
    #[serde(rename = "answer")]
    Answer,
    #[serde(rename = "ice-candidate")]
    IceCandidate,
    #[serde(rename = "get-peers")]
    GetPeers,
}

/// Frame exchanged over the signaling channel. `payload` is itself a JSON
/// document whose shape depends on `kind`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalingMessage {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<PeerId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<PeerId>,
    #[serde(default)]
    pub payload: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate in the browser `RTCIceCandidateInit` JSON shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

/// Decoded view of an inbound [`SignalingMessage`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    Peers(Vec<PeerId>),
    Offer {
        from: PeerId,
        description: SessionDescription,
    },
    Answer {
        from: PeerId,
        description: SessionDescription,
    },
    Candidate {
        from: PeerId,
        candidate: IceCandidate,
    },
    GetPeers,
}

impl SignalingMessage {
    pub fn get_peers() -> Self {
        Self {
            kind: MessageKind::GetPeers,
            from: None,
            to: None,
            payload: "{}".to_string(),
        }
    }

    pub fn offer(from: PeerId, to: PeerId, description: &SessionDescription) -> Self {
        Self::addressed(MessageKind::Offer, from, to, encode(description))
    }

    pub fn answer(from: PeerId, to: PeerId, description: &SessionDescription) -> Self {
        Self::addressed(MessageKind::Answer, from, to, encode(description))
    }

    pub fn ice_candidate(from: PeerId, to: PeerId, candidate: &IceCandidate) -> Self {
        Self::addressed(MessageKind::IceCandidate, from, to, encode(candidate))
    }

    pub fn peers(ids: &[PeerId]) -> Self {
        Self {
            kind: MessageKind::PeersList,
            from: None,
            to: None,
            payload: encode(&ids),
        }
    }

    fn addressed(kind: MessageKind, from: PeerId, to: PeerId, payload: String) -> Self {
        Self {
            kind,
            from: Some(from),
            to: Some(to),
            payload,
        }
    }

    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(ProtocolError::Frame)
    }

    pub fn to_text(&self) -> String {
        encode(self)
    }

    pub fn decode(&self) -> Result<Signal, ProtocolError> {
        match self.kind {
            MessageKind::PeersList => Ok(Signal::Peers(self.payload_as()?)),
            MessageKind::GetPeers => Ok(Signal::GetPeers),
            MessageKind::Offer => Ok(Signal::Offer {
                from: self.sender()?,
                description: self.payload_as()?,
            }),
            MessageKind::Answer => Ok(Signal::Answer {
                from: self.sender()?,
                description: self.payload_as()?,
            }),
            MessageKind::IceCandidate => Ok(Signal::Candidate {
                from: self.sender()?,
                candidate: self.payload_as()?,
            }),
        }
    }

    fn sender(&self) -> Result<PeerId, ProtocolError> {
        self.from.ok_or(ProtocolError::MissingSender(self.kind))
    }

    fn payload_as<T: for<'de> Deserialize<'de>>(&self) -> Result<T, ProtocolError> {
        serde_json::from_str(&self.payload).map_err(|source| ProtocolError::Payload {
            kind: self.kind,
            source,
        })
    }
}

fn encode<T: Serialize + ?Sized>(value: &T) -> String {
    // Plain data types with string keys; serialization cannot fail.
    serde_json::to_string(value).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};

    #[test]
    fn uses_wire_type_names() {
        let text = SignalingMessage::get_peers().to_text();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value, json!({ "type": "get-peers", "payload": "{}" }));

        let candidate = IceCandidate {
            candidate: "candidate:1 1 udp 2122260223 10.0.0.2 50000 typ host".into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        };
        let value: Value =
            serde_json::from_str(&SignalingMessage::ice_candidate(1, 7, &candidate).to_text())
                .unwrap();
        assert_eq!(value["type"], "ice-candidate");
        assert_eq!(value["from"], 1);
        assert_eq!(value["to"], 7);
        let inner: Value = serde_json::from_str(value["payload"].as_str().unwrap()).unwrap();
        assert_eq!(inner["sdpMid"], "0");
        assert_eq!(inner["sdpMLineIndex"], 0);
    }

    #[test]
    fn decodes_browser_frames() {
        let peers = SignalingMessage::parse(r#"{"type":"peers","payload":"[7,9]"}"#).unwrap();
        assert_eq!(peers.decode().unwrap(), Signal::Peers(vec![7, 9]));

        let offer = SignalingMessage::parse(
            r#"{"type":"offer","from":7,"to":1,"payload":"{\"type\":\"offer\",\"sdp\":\"v=0\"}"}"#,
        )
        .unwrap();
        assert_eq!(
            offer.decode().unwrap(),
            Signal::Offer {
                from: 7,
                description: SessionDescription::offer("v=0"),
            }
        );
    }

    #[test]
    fn malformed_payloads_are_errors_not_panics() {
        let bad = SignalingMessage::parse(r#"{"type":"peers","payload":"not json"}"#).unwrap();
        assert!(matches!(
            bad.decode(),
            Err(ProtocolError::Payload {
                kind: MessageKind::PeersList,
                ..
            })
        ));

        let anonymous =
            SignalingMessage::parse(r#"{"type":"answer","payload":"{}"}"#).unwrap();
        assert!(matches!(
            anonymous.decode(),
            Err(ProtocolError::MissingSender(MessageKind::Answer))
        ));

        assert!(SignalingMessage::parse(r#"{"type":"hello"}"#).is_err());
    }
}
