//! Thin REST collaborators: the lesson record used to gate the room and the
//! token refresh used by signaling after auth expiry.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;
use url::Url;

use crate::signaling::{ChannelError, TokenRefresher};

/// Students and tutors may enter this long before the scheduled start.
pub const EARLY_JOIN: time::Duration = time::Duration::minutes(15);

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status {0}")]
    HttpStatus(StatusCode),
    #[error("credentials rejected")]
    Unauthorized,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LessonStatus {
    Scheduled,
    Confirmed,
    InProgress,
    Completed,
    Cancelled,
    #[serde(other)]
    Unknown,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lesson {
    pub id: u64,
    pub status: LessonStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub start_time: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub end_time: OffsetDateTime,
}

impl Lesson {
    pub fn is_joinable(&self, now: OffsetDateTime) -> bool {
        if matches!(self.status, LessonStatus::Completed | LessonStatus::Cancelled) {
            return false;
        }
        now >= self.start_time - EARLY_JOIN && now <= self.end_time
    }
}

fn http_client() -> Result<reqwest::Client, ApiError> {
    Ok(reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(3))
        .timeout(Duration::from_secs(8))
        .build()?)
}

fn join(base: &Url, path: &str) -> Result<Url, ApiError> {
    base.join(path)
        .map_err(|err| ApiError::InvalidEndpoint(format!("{path}: {err}")))
}

pub struct LessonClient {
    client: reqwest::Client,
    base_url: Url,
    token: String,
}

impl LessonClient {
    pub fn new(base_url: Url, token: impl Into<String>) -> Result<Self, ApiError> {
        Ok(Self {
            client: http_client()?,
            base_url,
            token: token.into(),
        })
    }

    pub async fn lesson(&self, lesson_id: u64) -> Result<Lesson, ApiError> {
        let endpoint = join(&self.base_url, &format!("lessons/{lesson_id}/"))?;
        let response = self
            .client
            .get(endpoint)
            .bearer_auth(&self.token)
            .send()
            .await?;
        match response.status() {
            status if status.is_success() => Ok(response.json::<Lesson>().await?),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(ApiError::Unauthorized),
            status => Err(ApiError::HttpStatus(status)),
        }
    }
}

#[derive(Debug, Serialize)]
struct RefreshRequest<'a> {
    refresh: &'a str,
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    token: String,
}

/// Exchanges the long-lived refresh token for a new bearer token.
pub struct AuthClient {
    client: reqwest::Client,
    base_url: Url,
    refresh_token: Option<String>,
}

impl AuthClient {
    pub fn new(base_url: Url, refresh_token: Option<String>) -> Result<Self, ApiError> {
        Ok(Self {
            client: http_client()?,
            base_url,
            refresh_token,
        })
    }

    pub async fn refresh_token(&self) -> Result<String, ApiError> {
        let Some(refresh) = self.refresh_token.as_deref() else {
            return Err(ApiError::Unauthorized);
        };
        let endpoint = join(&self.base_url, "auth/refresh/")?;
        let response = self
            .client
            .post(endpoint)
            .json(&RefreshRequest { refresh })
            .send()
            .await?;
        match response.status() {
            status if status.is_success() => Ok(response.json::<RefreshResponse>().await?.token),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(ApiError::Unauthorized),
            status => Err(ApiError::HttpStatus(status)),
        }
    }
}

#[async_trait]
impl TokenRefresher for AuthClient {
    async fn refresh(&self) -> Result<String, ChannelError> {
        self.refresh_token()
            .await
            .map_err(|err| ChannelError::Refresh(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn lesson(status: LessonStatus) -> Lesson {
        serde_json::from_value(serde_json::json!({
            "id": 42,
            "status": status,
            "start_time": "2026-03-02T10:00:00Z",
            "end_time": "2026-03-02T11:00:00Z",
        }))
        .unwrap()
    }

    #[test]
    fn decodes_lesson_record() {
        let record: Lesson = serde_json::from_str(
            r#"{"id":7,"status":"in_progress","start_time":"2026-03-02T10:00:00+01:00","end_time":"2026-03-02T11:00:00+01:00","tutor":3}"#,
        )
        .unwrap();
        assert_eq!(record.status, LessonStatus::InProgress);
        assert_eq!(record.start_time, datetime!(2026-03-02 09:00 UTC));

        let odd: Lesson = serde_json::from_str(
            r#"{"id":7,"status":"rescheduled","start_time":"2026-03-02T10:00:00Z","end_time":"2026-03-02T11:00:00Z"}"#,
        )
        .unwrap();
        assert_eq!(odd.status, LessonStatus::Unknown);
    }

    #[test]
    fn join_window_opens_fifteen_minutes_early() {
        let scheduled = lesson(LessonStatus::Scheduled);
        assert!(!scheduled.is_joinable(datetime!(2026-03-02 09:44 UTC)));
        assert!(scheduled.is_joinable(datetime!(2026-03-02 09:45 UTC)));
        assert!(scheduled.is_joinable(datetime!(2026-03-02 11:00 UTC)));
        assert!(!scheduled.is_joinable(datetime!(2026-03-02 11:01 UTC)));
    }

    #[test]
    fn finished_lessons_are_never_joinable() {
        let now = datetime!(2026-03-02 10:30 UTC);
        assert!(!lesson(LessonStatus::Cancelled).is_joinable(now));
        assert!(!lesson(LessonStatus::Completed).is_joinable(now));
        assert!(lesson(LessonStatus::Confirmed).is_joinable(now));
    }

    #[test_timeout::tokio_timeout_test]
    async fn refresh_without_refresh_token_is_rejected() {
        let auth = AuthClient::new(Url::parse("http://127.0.0.1:9/api/").unwrap(), None).unwrap();
        assert!(matches!(
            auth.refresh().await,
            Err(ChannelError::Refresh(_))
        ));
    }
}
