use rocket::http::Status;
use rocket::response::Responder;
use rocket::serde::json::Json;
use shared::{ErrorCode, ErrorResponse, ValidationError};
use thiserror::Error;
use tracing::error;
use uuid::Uuid;

use crate::cache::CacheError;
use crate::store::StoreError;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    #[error("Counter cache unavailable: {0}")]
    CacheUnavailable(String),
    #[error("Durable store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("Option {0} not found")]
    OptionNotFound(Uuid),
    #[error("Poll {0} not found")]
    PollNotFound(Uuid),
    #[error("Reconciliation failed for {failed} of {attempted} options")]
    ReconciliationPartialFailure { failed: usize, attempted: usize },
}

impl From<CacheError> for EngineError {
    fn from(e: CacheError) -> Self {
        match e {
            CacheError::Unavailable(msg) => EngineError::CacheUnavailable(msg),
        }
    }
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Unavailable(msg) => EngineError::StoreUnavailable(msg),
            StoreError::NotFound => EngineError::StoreUnavailable("record vanished".into()),
        }
    }
}

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Option not found")]
    OptionNotFound,
    #[error("Poll not found")]
    PollNotFound,
    #[error("Invalid id")]
    InvalidId,
    #[error("{0}")]
    Invalid(String),
    #[error("Try again later")]
    Unavailable,
    #[error("{0}")]
    RateLimited(String),
    #[error("Internal error")]
    Internal,
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::OptionNotFound(_) => ApiError::OptionNotFound,
            EngineError::PollNotFound(_) => ApiError::PollNotFound,
            EngineError::CacheUnavailable(_) | EngineError::StoreUnavailable(_) => {
                error!("Request failed: {}", e);
                ApiError::Unavailable
            }
            EngineError::ReconciliationPartialFailure { .. } => {
                error!("Request failed: {}", e);
                ApiError::Internal
            }
        }
    }
}

impl From<ValidationError> for ApiError {
    fn from(e: ValidationError) -> Self {
        ApiError::Invalid(e.to_string())
    }
}

impl ApiError {
    fn status_and_code(&self) -> (Status, ErrorCode) {
        match self {
            ApiError::OptionNotFound => (Status::NotFound, ErrorCode::OptionNotFound),
            ApiError::PollNotFound => (Status::NotFound, ErrorCode::PollNotFound),
            ApiError::InvalidId | ApiError::Invalid(_) => (Status::BadRequest, ErrorCode::InvalidInput),
            ApiError::Unavailable => (Status::ServiceUnavailable, ErrorCode::TryAgain),
            ApiError::RateLimited(_) => (Status::TooManyRequests, ErrorCode::RateLimited),
            ApiError::Internal => (Status::InternalServerError, ErrorCode::SystemError),
        }
    }
}

impl<'r, 'o: 'r> Responder<'r, 'o> for ApiError {
    fn respond_to(self, req: &'r rocket::Request<'_>) -> rocket::response::Result<'o> {
        let (status, code) = self.status_and_code();
        let body = Json(ErrorResponse::new(code, self.to_string()));

        rocket::Response::build_from(body.respond_to(req)?)
            .status(status)
            .ok()
    }
}
