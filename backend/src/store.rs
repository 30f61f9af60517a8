use shared::models::{Poll, PollOption};
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("record not found")]
    NotFound,
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Applied,
    /// The token was recorded by an earlier attempt; nothing changed.
    AlreadyApplied,
}

/// Authoritative poll records. Option vote counts change only through
/// [`DurableStore::apply_sync`].
#[rocket::async_trait]
pub trait DurableStore: Send + Sync {
    async fn find_option(&self, option_id: Uuid) -> StoreResult<Option<PollOption>>;

    async fn find_poll(&self, poll_id: Uuid) -> StoreResult<Option<Poll>>;

    /// Every poll with its options, most recent first.
    async fn list_polls(&self) -> StoreResult<Vec<Poll>>;

    /// Adds `amount` to the option's durable count unless `token` was already
    /// applied. The count and the token are written in one transaction.
    async fn apply_sync(&self, option_id: Uuid, amount: i64, token: Uuid) -> StoreResult<SyncOutcome>;

    /// Drops ledger rows applied more than `older_than` ago, except the
    /// tokens in `keep`. A token still staged in the counter cache must stay,
    /// or resuming its ticket would apply it a second time.
    async fn prune_sync_ledger(&self, older_than: time::Duration, keep: &[Uuid]) -> StoreResult<u64>;

    async fn sum_all_votes(&self) -> StoreResult<i64>;

    async fn create_poll(&self, poll: &Poll) -> StoreResult<()>;

    async fn delete_option(&self, option_id: Uuid) -> StoreResult<()>;

    async fn delete_poll(&self, poll_id: Uuid) -> StoreResult<()>;
}
