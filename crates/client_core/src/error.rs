use shared::error::{ApiError, ErrorCode};
use thiserror::Error;

pub type ClientResult<T> = Result<T, ClientError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Message content cannot be empty")]
    EmptyContent,
    #[error("Message content cannot exceed {max} characters")]
    ContentTooLong { max: usize, actual: usize },
    #[error("Either channelId or targetUserId must be provided")]
    MissingTarget,
    #[error("Cannot provide both channelId and targetUserId")]
    ConflictingTarget,
}

#[derive(Debug, Clone, Error)]
pub enum ClientError {
    #[error("server is unreachable")]
    Offline,
    #[error("not authorized")]
    Unauthorized,
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("{}", .0.message)]
    Server(ApiError),
    #[error("invalid server response: {0}")]
    Decode(String),
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("storage failure: {0}")]
    Storage(String),
}

impl ClientError {
    pub fn server(status: u16, message: impl Into<String>) -> Self {
        Self::Server(ApiError::from_status(status, message))
    }

    /// Maps a non-success HTTP status without a usable body.
    pub fn from_status(status: u16, fallback: &str) -> Self {
        match ErrorCode::from_status(status) {
            ErrorCode::Unauthorized => Self::Unauthorized,
            ErrorCode::Unavailable => Self::Offline,
            _ => Self::server(status, fallback),
        }
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(value: serde_json::Error) -> Self {
        Self::Decode(value.to_string())
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(value: reqwest::Error) -> Self {
        if value.is_connect() || value.is_timeout() {
            Self::Offline
        } else if value.is_decode() {
            Self::Decode(value.to_string())
        } else {
            Self::Transport(value.to_string())
        }
    }
}

impl From<std::io::Error> for ClientError {
    fn from(value: std::io::Error) -> Self {
        Self::Storage(value.to_string())
    }
}
