use std::time::Duration;

use reqwest::StatusCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("request timed out")]
    Timeout,
    #[error("unexpected HTTP status {status}: {body}")]
    Http { status: StatusCode, body: String },
    #[error("authentication failed with HTTP {status}")]
    Auth { status: StatusCode },
    #[error("post changed on the server since it was last seen at {last_seen}")]
    Conflict {
        last_seen: String,
        server: Option<String>,
    },
    #[error("rate limited by the remote site")]
    RateLimited { retry_after: Option<Duration> },
    #[error("unexpected response format: {0}")]
    Parse(String),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("cache storage error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid url: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Coarse buckets callers can switch on when presenting a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Unauthorized,
    Forbidden,
    Conflict,
    RateLimited,
    Timeout,
    ServerError,
    NotFound,
    Gone,
    ClientError,
    Storage,
    Unknown,
}

impl FeedError {
    pub(crate) fn transport(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            FeedError::Timeout
        } else {
            FeedError::Network(err)
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            FeedError::Auth { status } if *status == StatusCode::FORBIDDEN => ErrorKind::Forbidden,
            FeedError::Auth { .. } => ErrorKind::Unauthorized,
            FeedError::Conflict { .. } => ErrorKind::Conflict,
            FeedError::RateLimited { .. } => ErrorKind::RateLimited,
            FeedError::Timeout => ErrorKind::Timeout,
            FeedError::Network(e) if e.is_timeout() => ErrorKind::Timeout,
            FeedError::Network(_) => ErrorKind::ServerError,
            FeedError::Http { status, .. } => match *status {
                StatusCode::NOT_FOUND => ErrorKind::NotFound,
                StatusCode::GONE => ErrorKind::Gone,
                s if s.is_server_error() => ErrorKind::ServerError,
                s if s.is_client_error() => ErrorKind::ClientError,
                _ => ErrorKind::Unknown,
            },
            FeedError::Io(_) | FeedError::Json(_) => ErrorKind::Storage,
            _ => ErrorKind::Unknown,
        }
    }

    /// Failures worth another attempt: transport faults, 5xx and rate limiting.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::ServerError | ErrorKind::Timeout | ErrorKind::RateLimited
        )
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no configuration directory available on this platform")]
    NoConfigDir,
    #[error("config io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config format error: {0}")]
    Format(#[from] serde_json::Error),
}
