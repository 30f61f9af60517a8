use rocket::{Request, catch, serde::json::Json};
use shared::{ErrorCode, ErrorResponse};

#[catch(429)]
pub fn too_many_requests(_req: &Request) -> Json<ErrorResponse> {
    Json(ErrorResponse::new(ErrorCode::RateLimited, "Rate limit exceeded. Please wait before trying again."))
}

#[catch(400)]
pub fn bad_request(_req: &Request) -> Json<ErrorResponse> {
    Json(ErrorResponse::new(ErrorCode::InvalidInput, "Invalid request parameters."))
}

#[catch(422)]
pub fn unprocessable(_req: &Request) -> Json<ErrorResponse> {
    Json(ErrorResponse::new(ErrorCode::InvalidInput, "Malformed request body."))
}

#[catch(503)]
pub fn unavailable(_req: &Request) -> Json<ErrorResponse> {
    Json(ErrorResponse::from(ErrorCode::TryAgain))
}

#[catch(500)]
pub fn internal_error(_req: &Request) -> Json<ErrorResponse> {
    Json(ErrorResponse::new(ErrorCode::SystemError, "An internal server error occurred."))
}

#[catch(404)]
pub fn not_found(req: &Request) -> Json<ErrorResponse> {
    let code = match req.uri().path().segments().nth(1) {
        Some("options") => ErrorCode::OptionNotFound,
        Some("polls") => ErrorCode::PollNotFound,
        _ => ErrorCode::InvalidInput,
    };
    Json(ErrorResponse::new(code, "The requested resource was not found."))
}
