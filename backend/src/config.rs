use std::{fmt::Display, str::FromStr, time::Duration};

use tracing::{info, warn};

pub const DEFAULT_COUNTER_PREFIX: &str = "votes:";
pub const DEFAULT_TICKET_PREFIX: &str = "vote-sync:";

/// Runtime settings, read from the deployment's secret store.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub redis_url: Option<String>,
    pub reconcile_interval: Duration,
    pub shutdown_drain_timeout: Duration,
    pub reconcile_concurrency: usize,
    pub scan_batch: usize,
    pub counter_prefix: String,
    pub ticket_prefix: String,
    pub observer_buffer: usize,
    pub vote_rate_limit_per_minute: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl Config {
    pub fn load(secrets: &shuttle_runtime::SecretStore) -> Self {
        Self::from_lookup(|key| secrets.get(key))
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let redis_url = lookup("REDIS_URL").filter(|url| !url.trim().is_empty());
        if redis_url.is_none() {
            warn!("REDIS_URL not set, pending votes will be kept in process memory");
        }

        let (counter_prefix, ticket_prefix) = key_prefixes(lookup("COUNTER_PREFIX"), lookup("TICKET_PREFIX"));

        Self {
            redis_url,
            reconcile_interval: Duration::from_secs(
                try_load::<u64>(&lookup, "RECONCILE_INTERVAL_SECS", 5).max(1),
            ),
            shutdown_drain_timeout: Duration::from_secs(try_load(&lookup, "SHUTDOWN_DRAIN_TIMEOUT_SECS", 10)),
            reconcile_concurrency: try_load::<usize>(&lookup, "RECONCILE_CONCURRENCY", 16).max(1),
            scan_batch: try_load::<usize>(&lookup, "SCAN_BATCH", 500).max(1),
            counter_prefix,
            ticket_prefix,
            observer_buffer: try_load::<usize>(&lookup, "OBSERVER_BUFFER", 64).max(1),
            vote_rate_limit_per_minute: try_load(&lookup, "VOTE_RATE_LIMIT_PER_MINUTE", 30),
        }
    }
}

/// Counter and ticket key prefixes. Neither may be empty or a prefix of the
/// other; such a pair falls back to both defaults.
fn key_prefixes(counter: Option<String>, ticket: Option<String>) -> (String, String) {
    let counter = counter.filter(|p| !p.is_empty()).unwrap_or_else(|| DEFAULT_COUNTER_PREFIX.to_string());
    let ticket = ticket.filter(|p| !p.is_empty()).unwrap_or_else(|| DEFAULT_TICKET_PREFIX.to_string());

    if counter.starts_with(&ticket) || ticket.starts_with(&counter) {
        warn!(
            "COUNTER_PREFIX {counter:?} and TICKET_PREFIX {ticket:?} overlap, using defaults: \
             {DEFAULT_COUNTER_PREFIX:?} and {DEFAULT_TICKET_PREFIX:?}"
        );
        return (DEFAULT_COUNTER_PREFIX.to_string(), DEFAULT_TICKET_PREFIX.to_string());
    }
    (counter, ticket)
}

fn try_load<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T
where
    T: FromStr + Display,
    T::Err: Display,
{
    let Some(raw) = lookup(key) else {
        info!("{key} not set, using default: {default}");
        return default;
    };

    raw.trim().parse().unwrap_or_else(|e| {
        warn!("Invalid {key} value {raw:?}: {e}, using default: {default}");
        default
    })
}
