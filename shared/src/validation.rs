use std::collections::HashSet;
use crate::models::CreatePollRequest;

pub const MAX_QUESTION_LENGTH: usize = 200;
pub const MAX_OPTION_LENGTH: usize = 80;
pub const MAX_OPTIONS: usize = 20;
pub const MIN_OPTIONS: usize = 2;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ValidationError {
    #[error("Question must not be empty")]
    EmptyQuestion,
    #[error("Question exceeds maximum length of {MAX_QUESTION_LENGTH}")]
    QuestionTooLong,
    #[error("Option text exceeds maximum length of {MAX_OPTION_LENGTH}")]
    OptionTooLong,
    #[error("Too many options (maximum {MAX_OPTIONS})")]
    TooManyOptions,
    #[error("Too few options (minimum {MIN_OPTIONS})")]
    TooFewOptions,
    #[error("Duplicate option: {0}")]
    DuplicateOption(String),
    #[error("Empty option text")]
    EmptyOption,
}

/// Checks a poll creation request. Option text is compared trimmed and
/// case-insensitively when looking for duplicates.
pub fn validate_poll_request(request: &CreatePollRequest) -> Result<(), ValidationError> {
    let question = request.question.trim();
    if question.is_empty() { return Err(ValidationError::EmptyQuestion); }
    if question.chars().count() > MAX_QUESTION_LENGTH { return Err(ValidationError::QuestionTooLong); }
    if request.options.len() > MAX_OPTIONS { return Err(ValidationError::TooManyOptions); }
    if request.options.len() < MIN_OPTIONS { return Err(ValidationError::TooFewOptions); }

    if request.options.iter().any(|opt| opt.trim().is_empty()) { return Err(ValidationError::EmptyOption); }
    if request.options.iter().any(|opt| opt.trim().chars().count() > MAX_OPTION_LENGTH) {
        return Err(ValidationError::OptionTooLong);
    }

    let mut seen = HashSet::with_capacity(request.options.len());
    for option in &request.options {
        if !seen.insert(option.trim().to_lowercase()) {
            return Err(ValidationError::DuplicateOption(option.trim().to_string()));
        }
    }

    Ok(())
}

/// Trimmed copy of a validated request, ready to become a `Poll`.
pub fn normalize_poll_request(request: &CreatePollRequest) -> CreatePollRequest {
    CreatePollRequest {
        question: request.question.trim().to_string(),
        options: request.options.iter().map(|o| o.trim().to_string()).collect(),
    }
}
