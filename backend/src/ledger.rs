//! Housekeeping for the `vote_syncs` ledger.
//!
//! Ledger rows only matter while their ticket can still be resumed. Pruning
//! keeps every token that is still staged in the counter cache, and the
//! periodic task waits a full period before its first run so a restart
//! resumes staged tickets before anything is deleted.
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::cache::CounterCache;
use crate::error::EngineError;
use crate::store::DurableStore;

/// Tokens of every ticket currently staged in the cache. Staged tickets
/// always sit next to a counter, so listing counters finds them all.
async fn staged_tokens(cache: &dyn CounterCache) -> Result<Vec<Uuid>, EngineError> {
    let mut tokens = Vec::new();
    for option_id in cache.enumerate().await? {
        if let Some(ticket) = cache.staged_sync(option_id).await? {
            tokens.push(ticket.token);
        }
    }
    Ok(tokens)
}

/// Prunes ledger rows older than `retention`. Nothing is pruned when the
/// staged tickets cannot be listed.
pub async fn prune_ledger(
    cache: &dyn CounterCache,
    store: &dyn DurableStore,
    retention: time::Duration,
) -> Result<u64, EngineError> {
    let keep = staged_tokens(cache).await?;
    if !keep.is_empty() {
        debug!("Keeping {} ledger rows with staged tickets", keep.len());
    }
    Ok(store.prune_sync_ledger(retention, &keep).await?)
}

pub struct LedgerCleanup {
    handle: JoinHandle<()>,
}

impl LedgerCleanup {
    pub fn spawn(
        cache: Arc<dyn CounterCache>,
        store: Arc<dyn DurableStore>,
        retention: time::Duration,
        every: Duration,
    ) -> Self {
        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + every, every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!("🧹 Sync ledger cleanup started, every {:?}", every);

            loop {
                ticker.tick().await;
                match prune_ledger(cache.as_ref(), store.as_ref(), retention).await {
                    Ok(0) => {}
                    Ok(count) => info!("🗑️ Pruned {} sync ledger rows", count),
                    Err(e) => error!("Sync ledger cleanup failed: {}", e),
                }
            }
        });

        Self { handle }
    }

    pub fn stop(self) {
        self.handle.abort();
    }
}
