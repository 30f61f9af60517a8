pub mod cache;
pub mod catchers;
pub mod config;
pub mod cors;
pub mod engine;
pub mod error;
pub mod fanout;
pub mod ledger;
pub mod queries;
pub mod rate_limiter;
pub mod reconciler;
pub mod routes;
pub mod store;
pub mod utils;
pub use shared::{models::*, error::*};

#[cfg(test)]
mod tests;
