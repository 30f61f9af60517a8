pub mod error;
pub mod models;
pub mod tally;
pub mod validation;

pub use error::{ErrorCode, ErrorResponse};
pub use models::*;
pub use tally::{visible_total, merge_poll, merge_polls};
pub use validation::*;
