//! Signaling: the JSON wire protocol and the reconnecting channel that
//! carries it for one lesson session.

mod channel;
mod protocol;
mod websocket;

pub use channel::{
    CLOSE_ABNORMAL, CLOSE_NORMAL, ChannelError, ChannelSettings, ChannelState, CloseReason,
    ClosedReason, SignalingChannel, SignalingConnector, SocketEvent, SocketLink, TokenRefresher,
};
pub use protocol::{
    IceCandidate, MessageKind, PeerId, ProtocolError, SdpType, SessionDescription, Signal,
    SignalingMessage,
};
pub use websocket::WebSocketConnector;
