use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use uuid::Uuid;

use super::{CacheError, CacheResult, CounterCache, SyncTicket};

#[derive(Debug, Default)]
struct Counters {
    pending: HashMap<Uuid, i64>,
    tickets: HashMap<Uuid, SyncTicket>,
}

impl Counters {
    fn decrement(&mut self, option_id: Uuid, amount: i64) -> i64 {
        let residual = self.pending.get(&option_id).copied().unwrap_or(0) - amount;
        if residual <= 0 {
            self.pending.remove(&option_id);
            0
        } else {
            self.pending.insert(option_id, residual);
            residual
        }
    }
}

/// Process-local counter cache. Used when no Redis instance is configured and
/// by the test suite; pending votes do not survive a restart.
#[derive(Debug, Default)]
pub struct MemoryCounterCache {
    counters: Mutex<Counters>,
}

impl MemoryCounterCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> CacheResult<MutexGuard<'_, Counters>> {
        self.counters
            .lock()
            .map_err(|e| CacheError::Unavailable(format!("counter lock poisoned: {}", e)))
    }
}

#[rocket::async_trait]
impl CounterCache for MemoryCounterCache {
    async fn increment(&self, option_id: Uuid) -> CacheResult<i64> {
        let mut counters = self.lock()?;
        let value = counters.pending.entry(option_id).or_insert(0);
        *value += 1;
        Ok(*value)
    }

    async fn read(&self, option_id: Uuid) -> CacheResult<i64> {
        Ok(self.lock()?.pending.get(&option_id).copied().unwrap_or(0))
    }

    async fn read_many(&self, option_ids: &[Uuid]) -> CacheResult<Vec<i64>> {
        let counters = self.lock()?;
        Ok(option_ids
            .iter()
            .map(|id| counters.pending.get(id).copied().unwrap_or(0))
            .collect())
    }

    async fn decrement_by(&self, option_id: Uuid, amount: i64) -> CacheResult<i64> {
        Ok(self.lock()?.decrement(option_id, amount))
    }

    async fn delete(&self, option_id: Uuid) -> CacheResult<()> {
        let mut counters = self.lock()?;
        counters.pending.remove(&option_id);
        counters.tickets.remove(&option_id);
        Ok(())
    }

    async fn delete_many(&self, option_ids: &[Uuid]) -> CacheResult<()> {
        let mut counters = self.lock()?;
        for id in option_ids {
            counters.pending.remove(id);
            counters.tickets.remove(id);
        }
        Ok(())
    }

    async fn enumerate(&self) -> CacheResult<Vec<Uuid>> {
        Ok(self.lock()?.pending.keys().copied().collect())
    }

    async fn stage_sync(&self, option_id: Uuid, amount: i64) -> CacheResult<SyncTicket> {
        let mut counters = self.lock()?;
        let ticket = counters
            .tickets
            .entry(option_id)
            .or_insert_with(|| SyncTicket::new(option_id, amount));
        Ok(*ticket)
    }

    async fn staged_sync(&self, option_id: Uuid) -> CacheResult<Option<SyncTicket>> {
        Ok(self.lock()?.tickets.get(&option_id).copied())
    }

    async fn commit_sync(&self, ticket: &SyncTicket) -> CacheResult<i64> {
        let mut counters = self.lock()?;
        if counters.tickets.get(&ticket.option_id) != Some(ticket) {
            return Ok(counters.pending.get(&ticket.option_id).copied().unwrap_or(0));
        }
        counters.tickets.remove(&ticket.option_id);
        Ok(counters.decrement(ticket.option_id, ticket.amount))
    }
}
