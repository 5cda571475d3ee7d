use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::error::ProtocolError as WsProtocolError;
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use url::Url;

use super::channel::{ChannelError, CloseReason, SignalingConnector, SocketEvent, SocketLink};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
/// No close frame was present (RFC 6455 section 7.4.1).
const CLOSE_NO_STATUS: u16 = 1005;

/// Connects to `{base}/ws/lessons/{lesson_id}?token=...` over tungstenite.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    base: Url,
}

impl WebSocketConnector {
    pub fn new(base: Url) -> Self {
        Self { base }
    }

    fn lesson_url(&self, lesson_id: &str, token: &str) -> Result<Url, ChannelError> {
        let mut url = self
            .base
            .join(&format!("ws/lessons/{lesson_id}"))
            .map_err(|err| ChannelError::Connect(format!("invalid signaling url: {err}")))?;
        url.query_pairs_mut().clear().append_pair("token", token);
        Ok(url)
    }
}

#[async_trait]
impl SignalingConnector for WebSocketConnector {
    async fn connect(&self, lesson_id: &str, token: &str) -> Result<SocketLink, ChannelError> {
        let url = self.lesson_url(lesson_id, token)?;
        let (ws_stream, _) = connect_async(url.as_str()).await.map_err(|err| match &err {
            WsError::Http(response)
                if matches!(
                    response.status(),
                    StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN
                ) =>
            {
                ChannelError::Unauthorized
            }
            _ => ChannelError::Connect(err.to_string()),
        })?;
        tracing::debug!(
            target = "lesson_room::signaling",
            lesson_id,
            "signaling websocket connected"
        );
        let (mut ws_write, mut ws_read) = ws_stream.split();

        let (outbound, mut send_rx) = mpsc::unbounded_channel::<String>();
        let (events_tx, inbound) = mpsc::unbounded_channel::<SocketEvent>();

        tokio::spawn(async move {
            let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
            heartbeat.tick().await;
            loop {
                tokio::select! {
                    next = send_rx.recv() => match next {
                        Some(text) => {
                            if ws_write.send(Message::Text(text)).await.is_err() {
                                return;
                            }
                        }
                        None => break,
                    },
                    _ = heartbeat.tick() => {
                        if ws_write.send(Message::Ping(Vec::new())).await.is_err() {
                            return;
                        }
                    }
                }
            }
            let frame = CloseFrame {
                code: CloseCode::Normal,
                reason: "leave".into(),
            };
            let _ = ws_write.send(Message::Close(Some(frame))).await;
            let _ = ws_write.close().await;
        });

        tokio::spawn(async move {
            let close = loop {
                match ws_read.next().await {
                    Some(Ok(Message::Text(text))) => {
                        tracing::trace!(
                            target = "lesson_room::signaling",
                            event = "ws_in",
                            kind = "text",
                            len = text.len()
                        );
                        if events_tx.send(SocketEvent::Text(text)).is_err() {
                            return;
                        }
                    }
                    Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                        Ok(text) => {
                            if events_tx.send(SocketEvent::Text(text)).is_err() {
                                return;
                            }
                        }
                        Err(_) => {
                            tracing::warn!(
                                target = "lesson_room::signaling",
                                "dropping non-utf8 binary frame"
                            );
                        }
                    },
                    Some(Ok(Message::Close(frame))) => {
                        break match frame {
                            Some(frame) => CloseReason::new(frame.code.into(), frame.reason),
                            None => CloseReason::new(CLOSE_NO_STATUS, ""),
                        };
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        match &err {
                            WsError::ConnectionClosed
                            | WsError::AlreadyClosed
                            | WsError::Protocol(WsProtocolError::ResetWithoutClosingHandshake) => {
                                tracing::debug!(
                                    target = "lesson_room::signaling",
                                    "signaling websocket closed: {err}"
                                );
                            }
                            _ => {
                                tracing::warn!(
                                    target = "lesson_room::signaling",
                                    "signaling websocket error: {err}"
                                );
                            }
                        }
                        break CloseReason::abnormal(err.to_string());
                    }
                    None => break CloseReason::abnormal("websocket stream ended"),
                }
            };
            let _ = events_tx.send(SocketEvent::Closed(close));
        });

        Ok(SocketLink { outbound, inbound })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lesson_url_carries_token_query() {
        let connector = WebSocketConnector::new(Url::parse("wss://rtc.example.com/signal/").unwrap());
        let url = connector.lesson_url("42", "abc def").unwrap();
        assert_eq!(
            url.as_str(),
            "wss://rtc.example.com/signal/ws/lessons/42?token=abc+def"
        );
    }
}
