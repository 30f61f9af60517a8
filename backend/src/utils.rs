use crate::error::ApiError;
use uuid::Uuid;

pub fn parse_id(id: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(id).map_err(|_| ApiError::InvalidId)
}

/// Key for per-client rate limiting; requests without a known address share one bucket.
pub fn client_key(route: &str, ip: Option<std::net::IpAddr>) -> String {
    match ip {
        Some(ip) => format!("{}:{}", route, ip),
        None => format!("{}:unknown", route),
    }
}
