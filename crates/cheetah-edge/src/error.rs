use http::StatusCode;
use thiserror::Error;

use crate::validator::ValidationError;

pub type EdgeResult<T> = Result<T, EdgeError>;

#[derive(Debug, Error)]
pub enum EdgeError {
    #[error("forbidden: {0}")]
    Forbidden(#[from] ValidationError),
    #[error("method {0} is not allowed")]
    MethodNotAllowed(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("upstream request failed: {0}")]
    Upstream(#[from] reqwest::Error),
    #[error("internal error: {0}")]
    Internal(String),
}

impl EdgeError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            EdgeError::Forbidden(_) => StatusCode::FORBIDDEN,
            EdgeError::MethodNotAllowed(_) => StatusCode::METHOD_NOT_ALLOWED,
            EdgeError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            EdgeError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            EdgeError::Upstream(_) => StatusCode::BAD_GATEWAY,
            EdgeError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
