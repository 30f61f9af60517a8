//! Drains pending counters into the durable store.
//!
//! For each option with a pending counter:
//!
//! 1. take the option's gate exclusively, so no other cycle and no vote
//!    recording works on it concurrently
//! 2. resume the staged ticket left by an interrupted cycle, or read the
//!    pending value and stage a new ticket for exactly that amount
//! 3. apply the ticket to the durable store (idempotent on the ticket token)
//! 4. only then decrement the counter by the ticket amount and drop the ticket
//!
//! Votes for the option wait for the gate and land in the residual counter
//! for the next cycle. A failure at step 3 leaves the counter and the ticket in place, so
//! the same amount is retried under the same token.
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio::sync::{watch, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::cache::{CounterCache, SyncTicket};
use crate::error::EngineError;
use crate::store::{DurableStore, StoreError, SyncOutcome};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncedOption {
    pub option_id: Uuid,
    pub amount: i64,
    pub residual: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedOption {
    pub option_id: Uuid,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleReport {
    pub synced: Vec<SyncedOption>,
    pub skipped: usize,
    pub failed: Vec<FailedOption>,
    /// Set when the pending counters could not be listed at all.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enumerate_error: Option<String>,
}

impl CycleReport {
    pub fn attempted(&self) -> usize {
        self.synced.len() + self.skipped + self.failed.len()
    }

    pub fn synced_votes(&self) -> i64 {
        self.synced.iter().map(|s| s.amount).sum()
    }

    pub fn partial_failure(&self) -> Option<EngineError> {
        if self.failed.is_empty() {
            return None;
        }
        Some(EngineError::ReconciliationPartialFailure {
            failed: self.failed.len(),
            attempted: self.attempted(),
        })
    }
}

enum KeyOutcome {
    Synced(SyncedOption),
    Skipped,
    Failed(FailedOption),
}

/// Per-option gates. Vote recording holds an option's gate shared, so votes
/// on the same option still run in parallel; reconciliation and deletion
/// hold it exclusively.
#[derive(Default)]
pub struct KeyGates {
    gates: Mutex<HashMap<Uuid, Arc<RwLock<()>>>>,
}

impl KeyGates {
    fn gate(&self, option_id: Uuid) -> Arc<RwLock<()>> {
        let mut gates = self.gates.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(gates.entry(option_id).or_default())
    }

    pub async fn shared(&self, option_id: Uuid) -> OwnedRwLockReadGuard<()> {
        self.gate(option_id).read_owned().await
    }

    pub async fn exclusive(&self, option_id: Uuid) -> OwnedRwLockWriteGuard<()> {
        self.gate(option_id).write_owned().await
    }

    /// Takes several gates exclusively, always in id order.
    pub async fn exclusive_many(&self, option_ids: &[Uuid]) -> Vec<OwnedRwLockWriteGuard<()>> {
        let mut ids = option_ids.to_vec();
        ids.sort_unstable();
        ids.dedup();

        let mut held = Vec::with_capacity(ids.len());
        for id in ids {
            held.push(self.exclusive(id).await);
        }
        held
    }

    /// Drops gates nobody holds or waits on.
    pub fn prune(&self) {
        let mut gates = self.gates.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        gates.retain(|_, gate| Arc::strong_count(gate) > 1);
    }

    pub fn tracked(&self) -> usize {
        self.gates.lock().map(|gates| gates.len()).unwrap_or(0)
    }
}

pub struct Reconciler {
    cache: Arc<dyn CounterCache>,
    store: Arc<dyn DurableStore>,
    concurrency: usize,
    gates: KeyGates,
    cycle: tokio::sync::Mutex<()>,
}

impl Reconciler {
    pub fn new(cache: Arc<dyn CounterCache>, store: Arc<dyn DurableStore>, concurrency: usize) -> Self {
        Self {
            cache,
            store,
            concurrency: concurrency.max(1),
            gates: KeyGates::default(),
            cycle: tokio::sync::Mutex::new(()),
        }
    }

    pub fn gates(&self) -> &KeyGates {
        &self.gates
    }

    /// Runs a cycle, waiting for one already in progress to finish first.
    pub async fn run_cycle(&self) -> CycleReport {
        let _cycle = self.cycle.lock().await;
        self.drain().await
    }

    /// Runs a cycle unless one is already in progress.
    pub async fn try_run_cycle(&self) -> Option<CycleReport> {
        let _cycle = self.cycle.try_lock().ok()?;
        Some(self.drain().await)
    }

    async fn drain(&self) -> CycleReport {
        let option_ids = match self.cache.enumerate().await {
            Ok(ids) => ids,
            Err(e) => {
                warn!("Reconciliation skipped, could not list pending counters: {}", e);
                return CycleReport {
                    enumerate_error: Some(e.to_string()),
                    ..CycleReport::default()
                };
            }
        };

        let outcomes: Vec<KeyOutcome> = stream::iter(option_ids)
            .map(|option_id| self.reconcile_option(option_id))
            .buffer_unordered(self.concurrency)
            .collect()
            .await;
        self.gates.prune();

        let mut report = CycleReport::default();
        for outcome in outcomes {
            match outcome {
                KeyOutcome::Synced(synced) => report.synced.push(synced),
                KeyOutcome::Skipped => report.skipped += 1,
                KeyOutcome::Failed(failed) => report.failed.push(failed),
            }
        }

        if let Some(e) = report.partial_failure() {
            warn!("{}", e);
        }
        if report.synced.is_empty() {
            debug!("Reconciliation cycle: nothing to sync ({} skipped)", report.skipped);
        } else {
            info!(
                "Reconciliation cycle: synced {} votes across {} options",
                report.synced_votes(),
                report.synced.len()
            );
        }
        report
    }

    async fn reconcile_option(&self, option_id: Uuid) -> KeyOutcome {
        let _gate = self.gates.exclusive(option_id).await;

        let ticket = match self.ticket_for(option_id).await {
            Ok(Some(ticket)) => ticket,
            Ok(None) => return KeyOutcome::Skipped,
            Err(reason) => return failed(option_id, reason),
        };

        match self.store.apply_sync(option_id, ticket.amount, ticket.token).await {
            Ok(SyncOutcome::Applied) => {}
            Ok(SyncOutcome::AlreadyApplied) => {
                info!("Ticket {} for option {} was already applied, finishing it", ticket.token, option_id);
            }
            Err(StoreError::NotFound) => {
                return failed(option_id, "option no longer exists in the durable store".into());
            }
            Err(e) => return failed(option_id, e.to_string()),
        }

        match self.cache.commit_sync(&ticket).await {
            Ok(residual) => KeyOutcome::Synced(SyncedOption {
                option_id,
                amount: ticket.amount,
                residual,
            }),
            Err(e) => {
                error!(
                    "Option {} synced {} votes but the counter was not decremented: {}",
                    option_id, ticket.amount, e
                );
                failed(option_id, e.to_string())
            }
        }
    }

    async fn ticket_for(&self, option_id: Uuid) -> Result<Option<SyncTicket>, String> {
        if let Some(ticket) = self.cache.staged_sync(option_id).await.map_err(|e| e.to_string())? {
            info!("Resuming staged ticket {} for option {}", ticket.token, option_id);
            return Ok(Some(ticket));
        }

        let pending = self.cache.read(option_id).await.map_err(|e| e.to_string())?;
        if pending <= 0 {
            return Ok(None);
        }

        self.cache
            .stage_sync(option_id, pending)
            .await
            .map(Some)
            .map_err(|e| e.to_string())
    }
}

fn failed(option_id: Uuid, reason: String) -> KeyOutcome {
    warn!("Reconciliation failed for option {}: {}", option_id, reason);
    KeyOutcome::Failed(FailedOption { option_id, reason })
}

/// Periodic reconciliation running on its own task.
pub struct ReconcileTask {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
    reconciler: Arc<Reconciler>,
}

impl ReconcileTask {
    pub fn spawn(reconciler: Arc<Reconciler>, every: Duration) -> Self {
        let (stop, mut stopped) = watch::channel(false);
        let worker = Arc::clone(&reconciler);

        let handle = tokio::spawn(async move {
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!("🔁 Reconciler started, interval {:?}", every);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if worker.try_run_cycle().await.is_none() {
                            debug!("Previous reconciliation still running, skipping tick");
                        }
                    }
                    _ = stopped.changed() => break,
                }
            }
            info!("Reconciler stopped");
        });

        Self {
            stop,
            handle,
            reconciler,
        }
    }

    /// Stops the timer and runs one last cycle. Gives up after `timeout`
    /// whatever state the drain is in.
    pub async fn shutdown(self, timeout: Duration) -> Option<CycleReport> {
        let _ = self.stop.send(true);
        let reconciler = self.reconciler;
        let handle = self.handle;

        let drain = async move {
            if let Err(e) = handle.await {
                error!("Reconciler task ended abnormally: {}", e);
            }
            reconciler.run_cycle().await
        };

        match tokio::time::timeout(timeout, drain).await {
            Ok(report) => {
                info!("Final reconciliation synced {} votes", report.synced_votes());
                Some(report)
            }
            Err(_) => {
                warn!("Final reconciliation did not finish within {:?}", timeout);
                None
            }
        }
    }
}
