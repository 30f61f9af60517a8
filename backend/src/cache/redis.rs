//! Redis-backed counter cache.
//!
//! - One string key per option: `<counter_prefix><option-id>` holding an integer
//! - One string key per staged ticket: `<ticket_prefix><option-id>` holding `<token>:<amount>`
//! - `INCR` for votes, Lua scripts where a read and a write must happen together
//! - Enumeration walks the keyspace with `SCAN`, never `KEYS`, so a large
//!   number of counters does not stall the server
use std::time::Duration;

use ::redis::{
    aio::{ConnectionManager, ConnectionManagerConfig},
    Client, RedisError, Script,
};
use tracing::{info, warn};
use uuid::Uuid;

use super::{CacheError, CacheResult, CounterCache, SyncTicket};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

const DECREMENT_SCRIPT: &str = r"
local v = redis.call('DECRBY', KEYS[1], ARGV[1])
if v <= 0 then
    redis.call('DEL', KEYS[1])
    return 0
end
return v
";

const STAGE_SCRIPT: &str = r"
redis.call('SET', KEYS[1], ARGV[1], 'NX')
return redis.call('GET', KEYS[1])
";

const COMMIT_SCRIPT: &str = r"
if redis.call('GET', KEYS[2]) ~= ARGV[1] then
    local current = redis.call('GET', KEYS[1])
    if current then
        return tonumber(current)
    end
    return 0
end
redis.call('DEL', KEYS[2])
local v = redis.call('DECRBY', KEYS[1], ARGV[2])
if v <= 0 then
    redis.call('DEL', KEYS[1])
    return 0
end
return v
";

impl From<RedisError> for CacheError {
    fn from(e: RedisError) -> Self {
        CacheError::Unavailable(e.to_string())
    }
}

/// Key layout for counters and staged tickets. The two prefixes must not
/// overlap, or a counter scan would pick up ticket keys.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct KeySpace {
    counter_prefix: String,
    ticket_prefix: String,
}

impl KeySpace {
    pub(crate) fn new(counter_prefix: impl Into<String>, ticket_prefix: impl Into<String>) -> Self {
        Self {
            counter_prefix: counter_prefix.into(),
            ticket_prefix: ticket_prefix.into(),
        }
    }

    pub(crate) fn counter_key(&self, option_id: Uuid) -> String {
        format!("{}{}", self.counter_prefix, option_id)
    }

    pub(crate) fn ticket_key(&self, option_id: Uuid) -> String {
        format!("{}{}", self.ticket_prefix, option_id)
    }

    pub(crate) fn parse_counter_key(&self, key: &str) -> Option<Uuid> {
        key.strip_prefix(&self.counter_prefix)?.parse().ok()
    }

    /// `SCAN MATCH` pattern for every counter key, with glob characters in
    /// the prefix escaped.
    pub(crate) fn counter_pattern(&self) -> String {
        let mut pattern = String::with_capacity(self.counter_prefix.len() + 1);
        for c in self.counter_prefix.chars() {
            if matches!(c, '*' | '?' | '[' | ']' | '\\') {
                pattern.push('\\');
            }
            pattern.push(c);
        }
        pattern.push('*');
        pattern
    }
}

pub struct RedisCounterCache {
    connection: ConnectionManager,
    keys: KeySpace,
    scan_batch: usize,
    decrement: Script,
    stage: Script,
    commit: Script,
}

impl RedisCounterCache {
    pub async fn connect(
        redis_url: &str,
        counter_prefix: impl Into<String>,
        ticket_prefix: impl Into<String>,
        scan_batch: usize,
    ) -> CacheResult<Self> {
        let config = ConnectionManagerConfig::new().set_number_of_retries(1);

        let client = Client::open(redis_url)?;
        let connection = tokio::time::timeout(
            CONNECT_TIMEOUT,
            client.get_connection_manager_with_config(config),
        )
        .await
        .map_err(|_| CacheError::Unavailable("timed out connecting to redis".into()))??;

        info!("Connected to redis counter cache");

        Ok(Self {
            connection,
            keys: KeySpace::new(counter_prefix, ticket_prefix),
            scan_batch: scan_batch.max(1),
            decrement: Script::new(DECREMENT_SCRIPT),
            stage: Script::new(STAGE_SCRIPT),
            commit: Script::new(COMMIT_SCRIPT),
        })
    }
}

#[rocket::async_trait]
impl CounterCache for RedisCounterCache {
    async fn increment(&self, option_id: Uuid) -> CacheResult<i64> {
        let mut con = self.connection.clone();
        let value: i64 = ::redis::cmd("INCR")
            .arg(self.keys.counter_key(option_id))
            .query_async(&mut con)
            .await?;
        Ok(value)
    }

    async fn read(&self, option_id: Uuid) -> CacheResult<i64> {
        let mut con = self.connection.clone();
        let value: Option<i64> = ::redis::cmd("GET")
            .arg(self.keys.counter_key(option_id))
            .query_async(&mut con)
            .await?;
        Ok(value.unwrap_or(0).max(0))
    }

    async fn read_many(&self, option_ids: &[Uuid]) -> CacheResult<Vec<i64>> {
        if option_ids.is_empty() {
            return Ok(Vec::new());
        }

        let keys: Vec<String> = option_ids.iter().map(|id| self.keys.counter_key(*id)).collect();
        let mut con = self.connection.clone();
        let values: Vec<Option<i64>> = ::redis::cmd("MGET")
            .arg(&keys)
            .query_async(&mut con)
            .await?;
        Ok(values.into_iter().map(|v| v.unwrap_or(0).max(0)).collect())
    }

    async fn decrement_by(&self, option_id: Uuid, amount: i64) -> CacheResult<i64> {
        let mut con = self.connection.clone();
        let residual: i64 = self
            .decrement
            .key(self.keys.counter_key(option_id))
            .arg(amount)
            .invoke_async(&mut con)
            .await?;
        Ok(residual)
    }

    async fn delete(&self, option_id: Uuid) -> CacheResult<()> {
        self.delete_many(&[option_id]).await
    }

    async fn delete_many(&self, option_ids: &[Uuid]) -> CacheResult<()> {
        if option_ids.is_empty() {
            return Ok(());
        }

        let keys: Vec<String> = option_ids
            .iter()
            .flat_map(|id| [self.keys.counter_key(*id), self.keys.ticket_key(*id)])
            .collect();
        let mut con = self.connection.clone();
        let _: i64 = ::redis::cmd("DEL").arg(&keys).query_async(&mut con).await?;
        Ok(())
    }

    async fn enumerate(&self) -> CacheResult<Vec<Uuid>> {
        let pattern = self.keys.counter_pattern();
        let mut con = self.connection.clone();
        let mut cursor: u64 = 0;
        let mut ids = Vec::new();

        loop {
            let (next, keys): (u64, Vec<String>) = ::redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(self.scan_batch)
                .query_async(&mut con)
                .await?;

            for key in keys {
                match self.keys.parse_counter_key(&key) {
                    Some(id) => ids.push(id),
                    None => warn!("Ignoring unexpected key {} under counter prefix", key),
                }
            }

            if next == 0 {
                break;
            }
            cursor = next;
        }

        // SCAN may return a key more than once
        ids.sort_unstable();
        ids.dedup();
        Ok(ids)
    }

    async fn stage_sync(&self, option_id: Uuid, amount: i64) -> CacheResult<SyncTicket> {
        let proposed = SyncTicket::new(option_id, amount);
        let mut con = self.connection.clone();
        let staged: String = self
            .stage
            .key(self.keys.ticket_key(option_id))
            .arg(proposed.encode())
            .invoke_async(&mut con)
            .await?;

        SyncTicket::decode(option_id, &staged).ok_or_else(|| {
            CacheError::Unavailable(format!("malformed sync ticket for option {}", option_id))
        })
    }

    async fn staged_sync(&self, option_id: Uuid) -> CacheResult<Option<SyncTicket>> {
        let mut con = self.connection.clone();
        let raw: Option<String> = ::redis::cmd("GET")
            .arg(self.keys.ticket_key(option_id))
            .query_async(&mut con)
            .await?;

        let Some(raw) = raw else { return Ok(None) };
        match SyncTicket::decode(option_id, &raw) {
            Some(ticket) => Ok(Some(ticket)),
            None => {
                warn!("Discarding malformed sync ticket for option {}: {:?}", option_id, raw);
                let _: i64 = ::redis::cmd("DEL")
                    .arg(self.keys.ticket_key(option_id))
                    .query_async(&mut con)
                    .await?;
                Ok(None)
            }
        }
    }

    async fn commit_sync(&self, ticket: &SyncTicket) -> CacheResult<i64> {
        let mut con = self.connection.clone();
        let residual: i64 = self
            .commit
            .key(self.keys.counter_key(ticket.option_id))
            .key(self.keys.ticket_key(ticket.option_id))
            .arg(ticket.encode())
            .arg(ticket.amount)
            .invoke_async(&mut con)
            .await?;
        Ok(residual)
    }
}
