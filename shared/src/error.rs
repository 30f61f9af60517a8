use serde::{Serialize, Deserialize};
use thiserror::Error;

/// Error categories exposed to API clients. Internal store details never
/// travel in these; clients only learn what to do next.
#[derive(Debug, Clone, Copy, Error, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ErrorCode {
    #[error("Invalid input provided")]
    InvalidInput,
    #[error("Option not found")]
    OptionNotFound,
    #[error("Poll not found")]
    PollNotFound,
    #[error("Service temporarily unavailable, try again")]
    TryAgain,
    #[error("Rate limit exceeded")]
    RateLimited,
    #[error("Internal system error")]
    SystemError,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorResponse {
    pub code: ErrorCode,
    pub error: String,
}

impl ErrorResponse {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            error: message.into(),
        }
    }
}

impl From<ErrorCode> for ErrorResponse {
    fn from(code: ErrorCode) -> Self {
        Self::new(code, code.to_string())
    }
}
