//! Vote tally engine: the facade the HTTP layer talks to.
//!
//! A vote is checked against the durable store and then lands in the counter
//! cache, both under the option's shared gate so no reconciliation of that
//! option runs in between. A vote that is rejected never touches the cache.
//! Reads merge durable counts with pending counters and degrade to
//! durable-only totals, flagged stale, when the cache cannot be reached.
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use shared::models::{GrandTotal, OptionTotal, Poll, PollDeleted, PollTotals, TallyEvent, VoteResponse, VoteUpdate};
use shared::tally::{merge_poll, merge_polls, visible_total};
use tracing::{error, instrument, warn};
use uuid::Uuid;

use crate::cache::CounterCache;
use crate::error::EngineError;
use crate::fanout::{Fanout, Subscription};
use crate::ledger::{prune_ledger, LedgerCleanup};
use crate::reconciler::{CycleReport, ReconcileTask, Reconciler};
use crate::store::{DurableStore, StoreError};

pub struct VoteTallyEngine {
    cache: Arc<dyn CounterCache>,
    store: Arc<dyn DurableStore>,
    fanout: Fanout,
    reconciler: Arc<Reconciler>,
    task: Mutex<Option<ReconcileTask>>,
    cleanup: Mutex<Option<LedgerCleanup>>,
}

impl VoteTallyEngine {
    pub fn new(
        cache: Arc<dyn CounterCache>,
        store: Arc<dyn DurableStore>,
        reconcile_concurrency: usize,
        observer_buffer: usize,
    ) -> Self {
        let reconciler = Arc::new(Reconciler::new(
            Arc::clone(&cache),
            Arc::clone(&store),
            reconcile_concurrency,
        ));

        Self {
            cache,
            store,
            fanout: Fanout::new(observer_buffer),
            reconciler,
            task: Mutex::new(None),
            cleanup: Mutex::new(None),
        }
    }

    pub fn subscribe(&self) -> Subscription {
        self.fanout.subscribe()
    }

    pub fn observer_count(&self) -> usize {
        self.fanout.observer_count()
    }

    /// Starts periodic reconciliation. Calling it again while running is a no-op.
    pub fn start_reconciler(&self, every: Duration) {
        let Ok(mut task) = self.task.lock() else {
            error!("Failed to acquire reconciler task lock");
            return;
        };
        if task.is_none() {
            *task = Some(ReconcileTask::spawn(Arc::clone(&self.reconciler), every));
        }
    }

    /// Starts periodic ledger pruning. The first prune runs after one full
    /// `every`, never at startup.
    pub fn start_ledger_cleanup(&self, retention: time::Duration, every: Duration) {
        let Ok(mut cleanup) = self.cleanup.lock() else {
            error!("Failed to acquire ledger cleanup lock");
            return;
        };
        if cleanup.is_none() {
            *cleanup = Some(LedgerCleanup::spawn(
                Arc::clone(&self.cache),
                Arc::clone(&self.store),
                retention,
                every,
            ));
        }
    }

    pub async fn prune_sync_ledger(&self, retention: time::Duration) -> Result<u64, EngineError> {
        prune_ledger(self.cache.as_ref(), self.store.as_ref(), retention).await
    }

    /// Stops periodic reconciliation and drains pending counters once, bounded
    /// by `timeout`. Without a running timer the drain still happens.
    pub async fn shutdown(&self, timeout: Duration) -> Option<CycleReport> {
        if let Some(cleanup) = self.cleanup.lock().ok().and_then(|mut cleanup| cleanup.take()) {
            cleanup.stop();
        }
        let task = self.task.lock().ok().and_then(|mut task| task.take());
        match task {
            Some(task) => task.shutdown(timeout).await,
            None => tokio::time::timeout(timeout, self.reconciler.run_cycle()).await.ok(),
        }
    }

    pub async fn reconcile_now(&self) -> CycleReport {
        self.reconciler.run_cycle().await
    }

    #[instrument(skip(self))]
    pub async fn record_vote(&self, option_id: Uuid) -> Result<VoteResponse, EngineError> {
        let (option, pending) = {
            let _gate = self.reconciler.gates().shared(option_id).await;
            let option = match self.store.find_option(option_id).await {
                Ok(Some(option)) => option,
                Ok(None) | Err(StoreError::NotFound) => return Err(EngineError::OptionNotFound(option_id)),
                Err(e) => {
                    warn!("Rejecting vote for {}, option lookup failed: {}", option_id, e);
                    return Err(e.into());
                }
            };
            let pending = self.cache.increment(option_id).await?;
            (option, pending)
        };

        // No drain of this option ran between the lookup and the increment.
        let visible = visible_total(option.votes, pending);

        self.fanout.publish(TallyEvent::VoteUpdate(VoteUpdate {
            option_id,
            poll_id: option.poll_id,
            votes: visible,
        }));

        Ok(VoteResponse {
            option_id,
            poll_id: option.poll_id,
            visible_total: visible,
        })
    }

    pub async fn get_total(&self, option_id: Uuid) -> Result<OptionTotal, EngineError> {
        let option = self
            .store
            .find_option(option_id)
            .await?
            .ok_or(EngineError::OptionNotFound(option_id))?;

        let (pending, stale) = match self.cache.read(option_id).await {
            Ok(pending) => (pending, false),
            Err(e) => {
                warn!("Serving durable-only total for {}: {}", option_id, e);
                (0, true)
            }
        };

        Ok(OptionTotal {
            option_id,
            poll_id: option.poll_id,
            votes: visible_total(option.votes, pending),
            stale,
        })
    }

    pub async fn get_poll_totals(&self, poll_id: Uuid) -> Result<PollTotals, EngineError> {
        let poll = self
            .store
            .find_poll(poll_id)
            .await?
            .ok_or(EngineError::PollNotFound(poll_id))?;

        let (pending, stale) = self.pending_for(&poll.option_ids()).await;
        Ok(merge_poll(poll, &pending, stale))
    }

    pub async fn get_all_poll_totals(&self) -> Result<Vec<PollTotals>, EngineError> {
        let polls = self.store.list_polls().await?;
        let option_ids: Vec<Uuid> = polls.iter().flat_map(|p| p.option_ids()).collect();

        let (pending, stale) = self.pending_for(&option_ids).await;
        Ok(merge_polls(polls, &pending, stale))
    }

    pub async fn get_grand_total(&self) -> Result<GrandTotal, EngineError> {
        let durable = self.store.sum_all_votes().await?;

        let pending = async {
            let ids = self.cache.enumerate().await?;
            self.cache.read_many(&ids).await
        };
        match pending.await {
            Ok(values) => Ok(GrandTotal {
                votes: durable + values.into_iter().map(|v| v.max(0)).sum::<i64>(),
                stale: false,
            }),
            Err(e) => {
                warn!("Serving durable-only grand total: {}", e);
                Ok(GrandTotal { votes: durable, stale: true })
            }
        }
    }

    /// Pending counters for `option_ids` in one bulk read. A cache failure
    /// yields no pending values and the stale flag.
    async fn pending_for(&self, option_ids: &[Uuid]) -> (HashMap<Uuid, i64>, bool) {
        match self.cache.read_many(option_ids).await {
            Ok(values) => (option_ids.iter().copied().zip(values).collect(), false),
            Err(e) => {
                warn!("Serving durable-only totals: {}", e);
                (HashMap::new(), true)
            }
        }
    }

    /// Clears pending counters for options about to be deleted. Runs before
    /// the rows are removed so reconciliation never targets a deleted option.
    pub async fn on_poll_deleted(&self, poll_id: Uuid, option_ids: &[Uuid]) -> Result<(), EngineError> {
        let _gates = self.reconciler.gates().exclusive_many(option_ids).await;
        self.drop_counters(poll_id, option_ids).await
    }

    async fn drop_counters(&self, poll_id: Uuid, option_ids: &[Uuid]) -> Result<(), EngineError> {
        self.cache.delete_many(option_ids).await.map_err(|e| {
            error!("Failed to clear pending counters for poll {}: {}", poll_id, e);
            EngineError::from(e)
        })
    }

    pub fn notify_poll_created(&self, poll: &Poll) {
        self.fanout.publish(TallyEvent::PollCreated(poll.clone()));
    }

    pub async fn notify_poll_deleted(&self, poll_id: Uuid, option_ids: &[Uuid]) -> Result<(), EngineError> {
        self.on_poll_deleted(poll_id, option_ids).await?;
        self.fanout.publish(TallyEvent::PollDeleted(PollDeleted { poll_id }));
        Ok(())
    }

    pub async fn clear_counters(&self, option_ids: &[Uuid]) -> Result<(), EngineError> {
        let _gates = self.reconciler.gates().exclusive_many(option_ids).await;
        Ok(self.cache.delete_many(option_ids).await?)
    }

    pub async fn create_poll(&self, poll: Poll) -> Result<Poll, EngineError> {
        self.store.create_poll(&poll).await?;
        self.notify_poll_created(&poll);
        Ok(poll)
    }

    /// Clears the poll's pending counters, deletes its rows and tells
    /// observers. Returns the deleted option ids. The options' gates are held
    /// throughout, so a vote either finishes first or finds the option gone.
    pub async fn delete_poll(&self, poll_id: Uuid) -> Result<Vec<Uuid>, EngineError> {
        let poll = self
            .store
            .find_poll(poll_id)
            .await?
            .ok_or(EngineError::PollNotFound(poll_id))?;
        let option_ids = poll.option_ids();

        let gates = self.reconciler.gates().exclusive_many(&option_ids).await;
        self.drop_counters(poll_id, &option_ids).await?;
        match self.store.delete_poll(poll_id).await {
            Ok(()) | Err(StoreError::NotFound) => {}
            Err(e) => return Err(e.into()),
        }
        drop(gates);
        self.fanout.publish(TallyEvent::PollDeleted(PollDeleted { poll_id }));
        Ok(option_ids)
    }

    pub async fn delete_option(&self, option_id: Uuid) -> Result<(), EngineError> {
        let _gate = self.reconciler.gates().exclusive(option_id).await;
        self.cache.delete(option_id).await?;
        match self.store.delete_option(option_id).await {
            Ok(()) => Ok(()),
            Err(StoreError::NotFound) => Err(EngineError::OptionNotFound(option_id)),
            Err(e) => Err(e.into()),
        }
    }
}
