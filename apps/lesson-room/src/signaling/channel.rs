use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, sleep};

use super::protocol::SignalingMessage;

/// A connection that stayed open this long resets the reconnect budget.
const STABLE_CONNECTION: Duration = Duration::from_secs(30);

pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_ABNORMAL: u16 = 1006;
const CLOSE_AUTH_EXPIRED: &[u16] = &[4001, 4401];

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChannelError {
    #[error("signaling connect failed: {0}")]
    Connect(String),
    #[error("signaling server rejected the bearer token")]
    Unauthorized,
    #[error("token refresh failed: {0}")]
    Refresh(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    pub code: u16,
    pub reason: String,
}

impl CloseReason {
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    pub fn normal() -> Self {
        Self::new(CLOSE_NORMAL, "leave")
    }

    pub fn abnormal(reason: impl Into<String>) -> Self {
        Self::new(CLOSE_ABNORMAL, reason)
    }

    pub fn is_normal(&self) -> bool {
        self.code == CLOSE_NORMAL
    }

    pub fn is_auth_expired(&self) -> bool {
        if CLOSE_AUTH_EXPIRED.contains(&self.code) {
            return true;
        }
        let reason = self.reason.to_ascii_lowercase();
        reason.contains("auth") || reason.contains("token expired")
    }
}

/// Events produced by a live socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    Text(String),
    Closed(CloseReason),
}

/// One established socket. Dropping `outbound` closes the socket normally.
pub struct SocketLink {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<SocketEvent>,
}

#[async_trait]
pub trait SignalingConnector: Send + Sync {
    async fn connect(&self, lesson_id: &str, token: &str) -> Result<SocketLink, ChannelError>;
}

/// Obtains a fresh bearer token after the server reports auth expiry.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self) -> Result<String, ChannelError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClosedReason {
    /// `close()` was called or the server closed with the normal code.
    Normal,
    ConnectionLost { attempts: u32 },
    AuthRefreshFailed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Open,
    Reconnecting { attempt: u32 },
    Closed(ClosedReason),
}

impl ChannelState {
    pub fn is_open(&self) -> bool {
        matches!(self, ChannelState::Open)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, ChannelState::Closed(_))
    }
}

#[derive(Debug, Clone)]
pub struct ChannelSettings {
    pub lesson_id: String,
    pub token: String,
    pub base_delay: Duration,
    pub max_attempts: u32,
}

/// Handle to the signaling channel of one lesson session.
#[derive(Clone)]
pub struct SignalingChannel {
    state: watch::Receiver<ChannelState>,
    outbound: Arc<Mutex<Option<mpsc::UnboundedSender<String>>>>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl SignalingChannel {
    /// Starts connecting in the background. Parsed inbound messages arrive on
    /// the returned receiver in socket order.
    pub fn spawn(
        connector: Arc<dyn SignalingConnector>,
        refresher: Arc<dyn TokenRefresher>,
        settings: ChannelSettings,
    ) -> (Self, mpsc::UnboundedReceiver<SignalingMessage>) {
        let (state_tx, state_rx) = watch::channel(ChannelState::Connecting);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (messages_tx, messages_rx) = mpsc::unbounded_channel();
        let outbound = Arc::new(Mutex::new(None));

        let driver = ChannelDriver {
            connector,
            refresher,
            settings,
            state: state_tx,
            outbound: Arc::clone(&outbound),
            shutdown: shutdown_rx,
            messages: messages_tx,
        };
        tokio::spawn(driver.run());

        let channel = SignalingChannel {
            state: state_rx,
            outbound,
            shutdown: Arc::new(shutdown_tx),
        };
        (channel, messages_rx)
    }

    pub fn state(&self) -> ChannelState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ChannelState> {
        self.state.clone()
    }

    pub fn is_open(&self) -> bool {
        self.state.borrow().is_open()
    }

    /// Sends when the channel is open. Otherwise the message is dropped and
    /// `false` is returned; nothing is queued.
    pub fn send(&self, message: &SignalingMessage) -> bool {
        if !self.is_open() {
            tracing::trace!(
                target = "lesson_room::signaling",
                kind = ?message.kind,
                "dropping message while channel is not open"
            );
            return false;
        }
        let guard = self.outbound.lock();
        match guard.as_ref() {
            Some(tx) => tx.send(message.to_text()).is_ok(),
            None => false,
        }
    }

    /// Closes with the normal code. Repeated calls are no-ops.
    pub fn close(&self) {
        // Held across the flag so the driver cannot install a socket in between.
        let mut outbound = self.outbound.lock();
        if self.shutdown.send_replace(true) {
            return;
        }
        outbound.take();
        tracing::debug!(target = "lesson_room::signaling", "signaling channel close requested");
    }

    /// Resolves once the channel reaches its terminal state.
    pub async fn closed(&self) -> ClosedReason {
        let mut state = self.state.clone();
        loop {
            if let ChannelState::Closed(reason) = &*state.borrow_and_update() {
                return reason.clone();
            }
            if state.changed().await.is_err() {
                return match &*state.borrow() {
                    ChannelState::Closed(reason) => reason.clone(),
                    _ => ClosedReason::Normal,
                };
            }
        }
    }
}

struct ChannelDriver {
    connector: Arc<dyn SignalingConnector>,
    refresher: Arc<dyn TokenRefresher>,
    settings: ChannelSettings,
    state: watch::Sender<ChannelState>,
    outbound: Arc<Mutex<Option<mpsc::UnboundedSender<String>>>>,
    shutdown: watch::Receiver<bool>,
    messages: mpsc::UnboundedSender<SignalingMessage>,
}

enum Disconnect {
    Requested,
    Remote(CloseReason),
}

impl ChannelDriver {
    async fn run(mut self) {
        let reason = self.drive().await;
        self.outbound.lock().take();
        tracing::info!(target = "lesson_room::signaling", ?reason, "signaling channel closed");
        self.state.send_replace(ChannelState::Closed(reason));
    }

    async fn drive(&mut self) -> ClosedReason {
        let mut token = self.settings.token.clone();
        let mut attempt: u32 = 0;

        loop {
            let connect = self.connector.connect(&self.settings.lesson_id, &token);
            let result = tokio::select! {
                result = connect => result,
                _ = closing(&mut self.shutdown) => return ClosedReason::Normal,
            };

            let auth_expired = match result {
                Ok(link) => {
                    let opened_at = Instant::now();
                    match self.pump(link).await {
                        Disconnect::Requested => return ClosedReason::Normal,
                        Disconnect::Remote(close) if close.is_normal() => {
                            return ClosedReason::Normal;
                        }
                        Disconnect::Remote(close) => {
                            tracing::warn!(
                                target = "lesson_room::signaling",
                                code = close.code,
                                reason = %close.reason,
                                "signaling channel closed abnormally"
                            );
                            if opened_at.elapsed() >= STABLE_CONNECTION {
                                attempt = 0;
                            }
                            close.is_auth_expired()
                        }
                    }
                }
                Err(err) => {
                    tracing::warn!(
                        target = "lesson_room::signaling",
                        attempt,
                        error = %err,
                        "signaling connect failed"
                    );
                    err == ChannelError::Unauthorized
                }
            };

            if auth_expired {
                match self.refresher.refresh().await {
                    Ok(fresh) => {
                        tracing::info!(target = "lesson_room::signaling", "bearer token refreshed");
                        token = fresh;
                    }
                    Err(err) => {
                        tracing::error!(
                            target = "lesson_room::signaling",
                            error = %err,
                            "token refresh failed; giving up"
                        );
                        return ClosedReason::AuthRefreshFailed(err.to_string());
                    }
                }
            }

            attempt += 1;
            if attempt > self.settings.max_attempts {
                tracing::error!(
                    target = "lesson_room::signaling",
                    attempts = self.settings.max_attempts,
                    "exhausted signaling reconnect attempts"
                );
                return ClosedReason::ConnectionLost {
                    attempts: self.settings.max_attempts,
                };
            }

            self.state.send_replace(ChannelState::Reconnecting { attempt });
            let delay = self.settings.base_delay * attempt;
            tracing::info!(
                target = "lesson_room::signaling",
                attempt,
                delay_ms = delay.as_millis() as u64,
                "scheduling signaling reconnect"
            );
            tokio::select! {
                _ = sleep(delay) => {}
                _ = closing(&mut self.shutdown) => return ClosedReason::Normal,
            }
        }
    }

    async fn pump(&mut self, link: SocketLink) -> Disconnect {
        let SocketLink {
            outbound,
            mut inbound,
        } = link;

        {
            let mut slot = self.outbound.lock();
            if *self.shutdown.borrow() {
                return Disconnect::Requested;
            }
            let _ = outbound.send(SignalingMessage::get_peers().to_text());
            *slot = Some(outbound);
        }
        self.state.send_replace(ChannelState::Open);
        tracing::info!(
            target = "lesson_room::signaling",
            lesson_id = %self.settings.lesson_id,
            "signaling channel open"
        );

        let disconnect = loop {
            tokio::select! {
                _ = closing(&mut self.shutdown) => break Disconnect::Requested,
                event = inbound.recv() => match event {
                    Some(SocketEvent::Text(text)) => self.dispatch(&text),
                    Some(SocketEvent::Closed(reason)) => break Disconnect::Remote(reason),
                    None => break Disconnect::Remote(CloseReason::abnormal("socket dropped")),
                },
            }
        };
        // Nothing may be sent between the close and the next Open.
        self.outbound.lock().take();
        disconnect
    }

    fn dispatch(&self, text: &str) {
        match SignalingMessage::parse(text) {
            Ok(message) => {
                tracing::trace!(
                    target = "lesson_room::signaling",
                    kind = ?message.kind,
                    from = ?message.from,
                    "inbound signaling message"
                );
                let _ = self.messages.send(message);
            }
            Err(err) => {
                tracing::warn!(
                    target = "lesson_room::signaling",
                    error = %err,
                    len = text.len(),
                    "dropping malformed signaling message"
                );
            }
        }
    }
}

async fn closing(shutdown: &mut watch::Receiver<bool>) {
    // A dropped handle counts as a close request.
    let _ = shutdown.wait_for(|closing| *closing).await;
}
