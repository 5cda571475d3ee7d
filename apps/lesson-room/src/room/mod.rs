//! Room membership bookkeeping over the video-room REST service: join,
//! roster polling while the room is mounted, fire-and-forget leave.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use url::Url;

use crate::signaling::PeerId;

#[derive(Debug, Error)]
pub enum RoomError {
    #[error("invalid room endpoint: {0}")]
    InvalidEndpoint(String),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status {0}")]
    HttpStatus(StatusCode),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub user_id: PeerId,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
}

#[async_trait]
pub trait RoomBackend: Send + Sync {
    async fn exists(&self, lesson_id: &str) -> Result<bool, RoomError>;
    /// Creating a room that already exists is not an error.
    async fn create(&self, lesson_id: &str) -> Result<(), RoomError>;
    async fn roster(&self, lesson_id: &str) -> Result<Vec<Participant>, RoomError>;
    async fn leave(&self, lesson_id: &str) -> Result<(), RoomError>;
}

pub struct ReqwestRoomBackend {
    client: reqwest::Client,
    base_url: Url,
    token: String,
}

impl ReqwestRoomBackend {
    pub fn new(base_url: Url, token: impl Into<String>) -> Result<Self, RoomError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(3))
            .timeout(Duration::from_secs(8))
            .build()?;
        Ok(Self {
            client,
            base_url,
            token: token.into(),
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, RoomError> {
        self.base_url
            .join(path)
            .map_err(|err| RoomError::InvalidEndpoint(format!("{path}: {err}")))
    }
}

#[async_trait]
impl RoomBackend for ReqwestRoomBackend {
    async fn exists(&self, lesson_id: &str) -> Result<bool, RoomError> {
        let endpoint = self.endpoint(&format!("video-rooms/{lesson_id}/"))?;
        let response = self
            .client
            .get(endpoint)
            .bearer_auth(&self.token)
            .send()
            .await?;
        match response.status() {
            status if status.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => Err(RoomError::HttpStatus(status)),
        }
    }

    async fn create(&self, lesson_id: &str) -> Result<(), RoomError> {
        let endpoint = self.endpoint("video-rooms/")?;
        let response = self
            .client
            .post(endpoint)
            .bearer_auth(&self.token)
            .json(&serde_json::json!({ "lesson_id": lesson_id }))
            .send()
            .await?;
        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::CONFLICT => Ok(()),
            status => Err(RoomError::HttpStatus(status)),
        }
    }

    async fn roster(&self, lesson_id: &str) -> Result<Vec<Participant>, RoomError> {
        let endpoint = self.endpoint(&format!("video-rooms/{lesson_id}/participants/"))?;
        let response = self
            .client
            .get(endpoint)
            .bearer_auth(&self.token)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(RoomError::HttpStatus(response.status()));
        }
        Ok(response.json::<Vec<Participant>>().await?)
    }

    async fn leave(&self, lesson_id: &str) -> Result<(), RoomError> {
        let endpoint = self.endpoint(&format!("video-rooms/{lesson_id}/leave/"))?;
        let response = self
            .client
            .post(endpoint)
            .bearer_auth(&self.token)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(RoomError::HttpStatus(response.status()));
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct RoomMembership {
    backend: Arc<dyn RoomBackend>,
    lesson_id: String,
    poll_interval: Duration,
}

impl RoomMembership {
    pub fn new(
        backend: Arc<dyn RoomBackend>,
        lesson_id: impl Into<String>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            backend,
            lesson_id: lesson_id.into(),
            poll_interval,
        }
    }

    pub fn lesson_id(&self) -> &str {
        &self.lesson_id
    }

    /// Makes sure the room exists. A failed existence check still attempts
    /// creation, so joining an existing room never errors.
    pub async fn join(&self) -> Result<(), RoomError> {
        let exists = match self.backend.exists(&self.lesson_id).await {
            Ok(exists) => exists,
            Err(err) => {
                tracing::warn!(
                    target = "lesson_room::room",
                    lesson_id = %self.lesson_id,
                    error = %err,
                    "room existence check failed; creating anyway"
                );
                false
            }
        };
        if !exists {
            self.backend.create(&self.lesson_id).await?;
            tracing::info!(target = "lesson_room::room", lesson_id = %self.lesson_id, "room created");
        }
        tracing::info!(target = "lesson_room::room", lesson_id = %self.lesson_id, "joined room");
        Ok(())
    }

    /// Polls the roster until the returned handle is stopped or dropped.
    pub fn poll_roster(&self) -> RosterPoll {
        let (tx, rx) = watch::channel(Vec::new());
        let task = tokio::spawn(poll_loop(
            Arc::clone(&self.backend),
            self.lesson_id.clone(),
            self.poll_interval,
            tx,
        ));
        RosterPoll { roster: rx, task }
    }

    /// Leaves in the background; failures are only logged.
    pub fn leave(&self) -> JoinHandle<()> {
        let backend = Arc::clone(&self.backend);
        let lesson_id = self.lesson_id.clone();
        tokio::spawn(async move {
            match backend.leave(&lesson_id).await {
                Ok(()) => tracing::info!(target = "lesson_room::room", lesson_id = %lesson_id, "left room"),
                Err(err) => tracing::warn!(
                    target = "lesson_room::room",
                    lesson_id = %lesson_id,
                    error = %err,
                    "leaving room failed"
                ),
            }
        })
    }
}

pub struct RosterPoll {
    roster: watch::Receiver<Vec<Participant>>,
    task: JoinHandle<()>,
}

impl RosterPoll {
    pub fn roster(&self) -> Vec<Participant> {
        self.roster.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<Participant>> {
        self.roster.clone()
    }

    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for RosterPoll {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn poll_loop(
    backend: Arc<dyn RoomBackend>,
    lesson_id: String,
    period: Duration,
    roster: watch::Sender<Vec<Participant>>,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        // A tick that fires before the fetch resolves supersedes it.
        tokio::select! {
            result = backend.roster(&lesson_id) => {
                match result {
                    Ok(participants) => {
                        roster.send_if_modified(|current| {
                            if *current == participants {
                                false
                            } else {
                                *current = participants;
                                true
                            }
                        });
                    }
                    Err(err) => {
                        tracing::warn!(
                            target = "lesson_room::room",
                            lesson_id = %lesson_id,
                            error = %err,
                            "roster poll failed"
                        );
                    }
                }
            }
            _ = ticker.tick() => {
                tracing::debug!(
                    target = "lesson_room::room",
                    lesson_id = %lesson_id,
                    "roster fetch superseded by next poll"
                );
                continue;
            }
        }
        ticker.tick().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct MockBackend {
        exists: Mutex<Option<Result<bool, StatusCode>>>,
        creates: AtomicUsize,
        leaves: AtomicUsize,
        fail_leave: bool,
        // (delay, result) per roster call; empty means an empty roster.
        rosters: Mutex<VecDeque<(Duration, Result<Vec<Participant>, StatusCode>)>>,
        roster_calls: AtomicUsize,
    }

    #[async_trait]
    impl RoomBackend for MockBackend {
        async fn exists(&self, _lesson_id: &str) -> Result<bool, RoomError> {
            match self.exists.lock().clone().unwrap_or(Ok(false)) {
                Ok(exists) => Ok(exists),
                Err(status) => Err(RoomError::HttpStatus(status)),
            }
        }

        async fn create(&self, _lesson_id: &str) -> Result<(), RoomError> {
            self.creates.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn roster(&self, _lesson_id: &str) -> Result<Vec<Participant>, RoomError> {
            self.roster_calls.fetch_add(1, Ordering::SeqCst);
            let next = self.rosters.lock().pop_front();
            let (delay, result) = next.unwrap_or((Duration::ZERO, Ok(Vec::new())));
            tokio::time::sleep(delay).await;
            result.map_err(RoomError::HttpStatus)
        }

        async fn leave(&self, _lesson_id: &str) -> Result<(), RoomError> {
            self.leaves.fetch_add(1, Ordering::SeqCst);
            if self.fail_leave {
                return Err(RoomError::HttpStatus(StatusCode::BAD_GATEWAY));
            }
            Ok(())
        }
    }

    fn participant(user_id: PeerId) -> Participant {
        Participant {
            user_id,
            name: None,
            role: None,
        }
    }

    fn membership(backend: &Arc<MockBackend>) -> RoomMembership {
        RoomMembership::new(backend.clone(), "42", Duration::from_secs(5))
    }

    #[test_timeout::tokio_timeout_test]
    async fn join_is_idempotent_and_tolerates_failed_lookup() {
        let backend = Arc::new(MockBackend::default());
        *backend.exists.lock() = Some(Ok(true));
        membership(&backend).join().await.unwrap();
        assert_eq!(backend.creates.load(Ordering::SeqCst), 0);

        *backend.exists.lock() = Some(Err(StatusCode::INTERNAL_SERVER_ERROR));
        membership(&backend).join().await.unwrap();
        assert_eq!(backend.creates.load(Ordering::SeqCst), 1);
    }

    #[test_timeout::tokio_timeout_test(paused)]
    async fn roster_poll_survives_failures() {
        let backend = Arc::new(MockBackend::default());
        backend.rosters.lock().extend([
            (Duration::ZERO, Err(StatusCode::SERVICE_UNAVAILABLE)),
            (Duration::ZERO, Ok(vec![participant(7)])),
        ]);
        let poll = membership(&backend).poll_roster();
        let mut roster = poll.subscribe();

        roster.changed().await.unwrap();
        assert_eq!(poll.roster(), vec![participant(7)]);
        assert_eq!(backend.roster_calls.load(Ordering::SeqCst), 2);
        poll.stop();
    }

    #[test_timeout::tokio_timeout_test(paused)]
    async fn slow_fetch_is_superseded_by_next_tick() {
        let backend = Arc::new(MockBackend::default());
        backend.rosters.lock().extend([
            (Duration::from_secs(8), Ok(vec![participant(1)])),
            (Duration::from_secs(1), Ok(vec![participant(2)])),
        ]);
        let poll = membership(&backend).poll_roster();
        let mut roster = poll.subscribe();

        roster.changed().await.unwrap();
        assert_eq!(poll.roster(), vec![participant(2)]);
        drop(poll);
    }

    #[test_timeout::tokio_timeout_test]
    async fn leave_never_propagates_errors() {
        let backend = Arc::new(MockBackend {
            fail_leave: true,
            ..Default::default()
        });
        membership(&backend).leave().await.unwrap();
        assert_eq!(backend.leaves.load(Ordering::SeqCst), 1);
    }
}
