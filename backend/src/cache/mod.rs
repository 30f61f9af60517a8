//! Counter cache holding pending, not yet reconciled vote deltas.
//!
//! Every counter is keyed by option id. A missing counter means zero pending
//! votes. Besides the plain counter primitives the cache keeps one staged
//! [`SyncTicket`] per option while a reconciliation step is in progress, so
//! that an interrupted step can be resumed with the same idempotency token.
pub mod memory;
pub mod redis;

use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

pub use self::memory::MemoryCounterCache;
pub use self::redis::RedisCounterCache;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CacheError {
    #[error("cache unavailable: {0}")]
    Unavailable(String),
}

pub type CacheResult<T> = Result<T, CacheError>;

/// Amount of pending votes being moved into the durable store for one option.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncTicket {
    pub token: Uuid,
    pub option_id: Uuid,
    pub amount: i64,
}

impl SyncTicket {
    pub fn new(option_id: Uuid, amount: i64) -> Self {
        Self {
            token: Uuid::new_v4(),
            option_id,
            amount,
        }
    }

    pub(crate) fn encode(&self) -> String {
        format!("{}:{}", self.token, self.amount)
    }

    pub(crate) fn decode(option_id: Uuid, raw: &str) -> Option<Self> {
        let (token, amount) = raw.split_once(':')?;
        let amount: i64 = amount.parse().ok()?;
        if amount <= 0 {
            return None;
        }
        Some(Self {
            token: token.parse().ok()?,
            option_id,
            amount,
        })
    }
}

#[rocket::async_trait]
pub trait CounterCache: Send + Sync {
    /// Adds one pending vote and returns the new pending value.
    async fn increment(&self, option_id: Uuid) -> CacheResult<i64>;

    async fn read(&self, option_id: Uuid) -> CacheResult<i64>;

    /// Pending values for `option_ids` in one round trip, in the same order.
    async fn read_many(&self, option_ids: &[Uuid]) -> CacheResult<Vec<i64>>;

    /// Subtracts `amount`. A residual at or below zero removes the counter
    /// and is reported as zero.
    async fn decrement_by(&self, option_id: Uuid, amount: i64) -> CacheResult<i64>;

    /// Removes the counter and any staged ticket for the option.
    async fn delete(&self, option_id: Uuid) -> CacheResult<()>;

    async fn delete_many(&self, option_ids: &[Uuid]) -> CacheResult<()>;

    /// Option ids that currently have a pending counter.
    async fn enumerate(&self) -> CacheResult<Vec<Uuid>>;

    /// Stages a ticket for `amount` unless one is already staged for the
    /// option. Returns whichever ticket is staged afterwards.
    async fn stage_sync(&self, option_id: Uuid, amount: i64) -> CacheResult<SyncTicket>;

    async fn staged_sync(&self, option_id: Uuid) -> CacheResult<Option<SyncTicket>>;

    /// Decrements the counter by the ticket amount and drops the ticket in
    /// one atomic step. Returns the residual pending value. A ticket that is
    /// no longer the staged one (already committed, or cleared by a deletion)
    /// leaves the counter untouched.
    async fn commit_sync(&self, ticket: &SyncTicket) -> CacheResult<i64>;
}
