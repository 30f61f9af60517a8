#[cfg(test)]
mod tests {
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use shared::models::{Poll, PollOption, TallyEvent};
    use tokio::sync::oneshot;
    use uuid::Uuid;

    use crate::cache::{CacheError, CacheResult, CounterCache, MemoryCounterCache, SyncTicket};
    use crate::config::Config;
    use crate::engine::VoteTallyEngine;
    use crate::error::EngineError;
    use crate::fanout::Fanout;
    use crate::reconciler::KeyGates;
    use crate::store::{DurableStore, StoreError, StoreResult, SyncOutcome};

    /// Pauses one `find_option` call after it has read the option.
    struct FindGate {
        entered: oneshot::Sender<()>,
        release: oneshot::Receiver<bool>,
    }

    #[derive(Default)]
    struct TestStore {
        polls: Mutex<Vec<Poll>>,
        applied: Mutex<HashSet<Uuid>>,
        failing: Mutex<HashSet<Uuid>>,
        down: AtomicBool,
        sync_calls: AtomicUsize,
        prune_calls: AtomicUsize,
        find_gate: Mutex<Option<FindGate>>,
    }

    impl TestStore {
        fn with_poll(votes: &[i64]) -> (Arc<Self>, Poll) {
            let store = Arc::new(Self::default());
            let poll = store.insert_poll(votes);
            (store, poll)
        }

        fn insert_poll(&self, votes: &[i64]) -> Poll {
            let mut poll = Poll::new("Where should we eat?", votes.iter().map(|v| format!("place {v}")).collect());
            for (option, &v) in poll.options.iter_mut().zip(votes) {
                option.votes = v;
            }
            self.polls.lock().unwrap().insert(0, poll.clone());
            poll
        }

        fn durable(&self, option_id: Uuid) -> i64 {
            self.polls
                .lock()
                .unwrap()
                .iter()
                .flat_map(|p| p.options.iter())
                .find(|o| o.id == option_id)
                .map(|o| o.votes)
                .unwrap_or(0)
        }

        fn fail_syncs_for(&self, option_id: Uuid) {
            self.failing.lock().unwrap().insert(option_id);
        }

        /// The next `find_option` reads the option, signals `entered` and waits.
        /// Releasing it with `true` turns the result into an outage.
        fn gate_next_find(&self) -> (oneshot::Receiver<()>, oneshot::Sender<bool>) {
            let (entered_tx, entered_rx) = oneshot::channel();
            let (release_tx, release_rx) = oneshot::channel();
            *self.find_gate.lock().unwrap() = Some(FindGate {
                entered: entered_tx,
                release: release_rx,
            });
            (entered_rx, release_tx)
        }

        fn check(&self) -> StoreResult<()> {
            if self.down.load(Ordering::SeqCst) {
                return Err(StoreError::Unavailable("connection refused".into()));
            }
            Ok(())
        }
    }

    #[rocket::async_trait]
    impl DurableStore for TestStore {
        async fn find_option(&self, option_id: Uuid) -> StoreResult<Option<PollOption>> {
            self.check()?;
            let found = self
                .polls
                .lock()
                .unwrap()
                .iter()
                .flat_map(|p| p.options.iter())
                .find(|o| o.id == option_id)
                .cloned();

            let gate = self.find_gate.lock().unwrap().take();
            if let Some(gate) = gate {
                let _ = gate.entered.send(());
                if gate.release.await.unwrap_or(false) {
                    return Err(StoreError::Unavailable("connection dropped".into()));
                }
            }
            Ok(found)
        }

        async fn find_poll(&self, poll_id: Uuid) -> StoreResult<Option<Poll>> {
            self.check()?;
            Ok(self.polls.lock().unwrap().iter().find(|p| p.id == poll_id).cloned())
        }

        async fn list_polls(&self) -> StoreResult<Vec<Poll>> {
            self.check()?;
            Ok(self.polls.lock().unwrap().clone())
        }

        async fn apply_sync(&self, option_id: Uuid, amount: i64, token: Uuid) -> StoreResult<SyncOutcome> {
            self.check()?;
            self.sync_calls.fetch_add(1, Ordering::SeqCst);
            if self.failing.lock().unwrap().contains(&option_id) {
                return Err(StoreError::Unavailable("write timed out".into()));
            }

            let mut applied = self.applied.lock().unwrap();
            if applied.contains(&token) {
                return Ok(SyncOutcome::AlreadyApplied);
            }

            let mut polls = self.polls.lock().unwrap();
            let option = polls
                .iter_mut()
                .flat_map(|p| p.options.iter_mut())
                .find(|o| o.id == option_id)
                .ok_or(StoreError::NotFound)?;
            option.votes += amount;
            applied.insert(token);
            Ok(SyncOutcome::Applied)
        }

        /// Every ledger row counts as old here.
        async fn prune_sync_ledger(&self, _older_than: time::Duration, keep: &[Uuid]) -> StoreResult<u64> {
            self.check()?;
            self.prune_calls.fetch_add(1, Ordering::SeqCst);
            let mut applied = self.applied.lock().unwrap();
            let before = applied.len();
            applied.retain(|token| keep.contains(token));
            Ok((before - applied.len()) as u64)
        }

        async fn sum_all_votes(&self) -> StoreResult<i64> {
            self.check()?;
            Ok(self.polls.lock().unwrap().iter().map(|p| p.total_votes()).sum())
        }

        async fn create_poll(&self, poll: &Poll) -> StoreResult<()> {
            self.check()?;
            self.polls.lock().unwrap().insert(0, poll.clone());
            Ok(())
        }

        async fn delete_option(&self, option_id: Uuid) -> StoreResult<()> {
            self.check()?;
            let mut polls = self.polls.lock().unwrap();
            let mut found = false;
            for poll in polls.iter_mut() {
                let before = poll.options.len();
                poll.options.retain(|o| o.id != option_id);
                found |= poll.options.len() != before;
            }
            if found { Ok(()) } else { Err(StoreError::NotFound) }
        }

        async fn delete_poll(&self, poll_id: Uuid) -> StoreResult<()> {
            self.check()?;
            let mut polls = self.polls.lock().unwrap();
            let before = polls.len();
            polls.retain(|p| p.id != poll_id);
            if polls.len() != before { Ok(()) } else { Err(StoreError::NotFound) }
        }
    }

    /// Memory cache that can be switched off to simulate an outage.
    #[derive(Default)]
    struct FlakyCache {
        inner: MemoryCounterCache,
        down: AtomicBool,
    }

    impl FlakyCache {
        fn check(&self) -> CacheResult<()> {
            if self.down.load(Ordering::SeqCst) {
                return Err(CacheError::Unavailable("connection reset".into()));
            }
            Ok(())
        }
    }

    #[rocket::async_trait]
    impl CounterCache for FlakyCache {
        async fn increment(&self, option_id: Uuid) -> CacheResult<i64> {
            self.check()?;
            self.inner.increment(option_id).await
        }

        async fn read(&self, option_id: Uuid) -> CacheResult<i64> {
            self.check()?;
            self.inner.read(option_id).await
        }

        async fn read_many(&self, option_ids: &[Uuid]) -> CacheResult<Vec<i64>> {
            self.check()?;
            self.inner.read_many(option_ids).await
        }

        async fn decrement_by(&self, option_id: Uuid, amount: i64) -> CacheResult<i64> {
            self.check()?;
            self.inner.decrement_by(option_id, amount).await
        }

        async fn delete(&self, option_id: Uuid) -> CacheResult<()> {
            self.check()?;
            self.inner.delete(option_id).await
        }

        async fn delete_many(&self, option_ids: &[Uuid]) -> CacheResult<()> {
            self.check()?;
            self.inner.delete_many(option_ids).await
        }

        async fn enumerate(&self) -> CacheResult<Vec<Uuid>> {
            self.check()?;
            self.inner.enumerate().await
        }

        async fn stage_sync(&self, option_id: Uuid, amount: i64) -> CacheResult<SyncTicket> {
            self.check()?;
            self.inner.stage_sync(option_id, amount).await
        }

        async fn staged_sync(&self, option_id: Uuid) -> CacheResult<Option<SyncTicket>> {
            self.check()?;
            self.inner.staged_sync(option_id).await
        }

        async fn commit_sync(&self, ticket: &SyncTicket) -> CacheResult<i64> {
            self.check()?;
            self.inner.commit_sync(ticket).await
        }
    }

    fn engine(cache: Arc<dyn CounterCache>, store: Arc<TestStore>) -> VoteTallyEngine {
        VoteTallyEngine::new(cache, store as Arc<dyn DurableStore>, 8, 16)
    }

    fn memory_cache() -> Arc<MemoryCounterCache> {
        Arc::new(MemoryCounterCache::new())
    }

    #[tokio::test]
    async fn test_votes_then_reconcile_keeps_total() {
        let (store, poll) = TestStore::with_poll(&[0, 0]);
        let cache = memory_cache();
        let engine = engine(cache.clone(), store.clone());
        let option = poll.options[0].id;

        for expected in 1..=5 {
            let response = engine.record_vote(option).await.unwrap();
            assert_eq!(response.visible_total, expected);
            assert_eq!(response.poll_id, poll.id);
        }
        assert_eq!(engine.get_total(option).await.unwrap().votes, 5);

        let report = engine.reconcile_now().await;
        assert_eq!(report.synced_votes(), 5);
        assert!(report.failed.is_empty());

        assert_eq!(store.durable(option), 5);
        assert_eq!(cache.read(option).await.unwrap(), 0);
        assert!(cache.enumerate().await.unwrap().is_empty());

        let total = engine.get_total(option).await.unwrap();
        assert_eq!(total.votes, 5);
        assert!(!total.stale);
    }

    #[tokio::test]
    async fn test_merged_poll_totals_and_grand_total() {
        let (store, poll) = TestStore::with_poll(&[3, 7]);
        let cache = memory_cache();
        let engine = engine(cache.clone(), store);

        cache.increment(poll.options[0].id).await.unwrap();
        cache.increment(poll.options[0].id).await.unwrap();

        let merged = engine.get_poll_totals(poll.id).await.unwrap();
        let votes: Vec<i64> = merged.poll.options.iter().map(|o| o.votes).collect();
        assert_eq!(votes, vec![5, 7]);
        assert!(!merged.stale);

        let all = engine.get_all_poll_totals().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0], merged);

        let grand = engine.get_grand_total().await.unwrap();
        assert_eq!(grand.votes, 12);
        assert!(!grand.stale);

        assert!(matches!(
            engine.get_poll_totals(Uuid::new_v4()).await,
            Err(EngineError::PollNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_failed_sync_leaves_counter_and_other_keys_succeed() {
        let (store, poll) = TestStore::with_poll(&[0, 0, 0]);
        let cache = memory_cache();
        let engine = engine(cache.clone(), store.clone());
        let (ok_a, broken, ok_b) = (poll.options[0].id, poll.options[1].id, poll.options[2].id);

        for option in [ok_a, broken, broken, ok_b, ok_b, ok_b] {
            engine.record_vote(option).await.unwrap();
        }
        store.fail_syncs_for(broken);

        let report = engine.reconcile_now().await;
        assert_eq!(report.synced.len(), 2);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].option_id, broken);
        assert_eq!(
            report.partial_failure(),
            Some(EngineError::ReconciliationPartialFailure { failed: 1, attempted: 3 })
        );

        assert_eq!(store.durable(ok_a), 1);
        assert_eq!(store.durable(ok_b), 3);
        assert_eq!(store.durable(broken), 0);
        assert_eq!(cache.read(broken).await.unwrap(), 2);
        assert_eq!(engine.get_total(broken).await.unwrap().votes, 2);

        // The same amount is retried once the store recovers.
        store.failing.lock().unwrap().clear();
        cache.increment(broken).await.unwrap();
        let report = engine.reconcile_now().await;
        assert!(report.failed.is_empty());
        assert_eq!(store.durable(broken), 2);
        assert_eq!(cache.read(broken).await.unwrap(), 1);
        assert_eq!(engine.get_total(broken).await.unwrap().votes, 3);
    }

    #[tokio::test]
    async fn test_reconcile_without_pending_is_noop() {
        let (store, poll) = TestStore::with_poll(&[4, 9]);
        let cache = memory_cache();
        let engine = engine(cache.clone(), store.clone());

        let report = engine.reconcile_now().await;
        assert_eq!(report.attempted(), 0);
        assert_eq!(store.sync_calls.load(Ordering::SeqCst), 0);
        assert_eq!(store.durable(poll.options[0].id), 4);
        assert_eq!(store.durable(poll.options[1].id), 9);
        assert!(cache.enumerate().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_vote_for_missing_option_leaves_no_counter() {
        let (store, _) = TestStore::with_poll(&[0, 0]);
        let cache = memory_cache();
        let engine = engine(cache.clone(), store);
        let missing = Uuid::new_v4();

        assert!(matches!(engine.record_vote(missing).await, Err(EngineError::OptionNotFound(id)) if id == missing));
        assert_eq!(cache.read(missing).await.unwrap(), 0);
        assert!(cache.enumerate().await.unwrap().is_empty());

        cache.increment(missing).await.unwrap();
        cache.increment(missing).await.unwrap();
        assert!(engine.record_vote(missing).await.is_err());
        assert_eq!(cache.read(missing).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_store_outage_rejects_vote_without_residue() {
        let (store, poll) = TestStore::with_poll(&[0, 0]);
        let cache = memory_cache();
        let engine = engine(cache.clone(), store.clone());
        let option = poll.options[0].id;

        store.down.store(true, Ordering::SeqCst);
        assert!(matches!(engine.record_vote(option).await, Err(EngineError::StoreUnavailable(_))));
        assert_eq!(cache.read(option).await.unwrap(), 0);
        assert!(cache.enumerate().await.unwrap().is_empty());
        assert!(matches!(engine.get_total(option).await, Err(EngineError::StoreUnavailable(_))));
        assert!(matches!(engine.get_all_poll_totals().await, Err(EngineError::StoreUnavailable(_))));
    }

    #[tokio::test]
    async fn test_vote_rejected_by_store_outage_is_never_synced() {
        let (store, poll) = TestStore::with_poll(&[0, 0]);
        let cache = memory_cache();
        let engine = Arc::new(engine(cache.clone(), store.clone()));
        let option = poll.options[0].id;

        engine.record_vote(option).await.unwrap();
        engine.record_vote(option).await.unwrap();

        let (entered, release) = store.gate_next_find();
        let vote = tokio::spawn({
            let engine = Arc::clone(&engine);
            async move { engine.record_vote(option).await }
        });
        entered.await.unwrap();

        let cycle = tokio::spawn({
            let engine = Arc::clone(&engine);
            async move { engine.reconcile_now().await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        release.send(true).unwrap();

        assert!(matches!(vote.await.unwrap(), Err(EngineError::StoreUnavailable(_))));
        let report = cycle.await.unwrap();
        assert_eq!(report.synced_votes(), 2);

        assert_eq!(store.durable(option), 2);
        assert_eq!(cache.read(option).await.unwrap(), 0);
        assert_eq!(engine.get_total(option).await.unwrap().votes, 2);
    }

    #[tokio::test]
    async fn test_vote_total_counts_the_vote_once_across_a_reconcile() {
        let (store, poll) = TestStore::with_poll(&[0, 0]);
        let cache = memory_cache();
        let engine = Arc::new(engine(cache.clone(), store.clone()));
        let option = poll.options[0].id;

        engine.record_vote(option).await.unwrap();
        engine.record_vote(option).await.unwrap();
        let mut observer = engine.subscribe();

        let (entered, release) = store.gate_next_find();
        let vote = tokio::spawn({
            let engine = Arc::clone(&engine);
            async move { engine.record_vote(option).await }
        });
        entered.await.unwrap();

        let cycle = tokio::spawn({
            let engine = Arc::clone(&engine);
            async move { engine.reconcile_now().await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        release.send(false).unwrap();

        let response = vote.await.unwrap().unwrap();
        assert_eq!(response.visible_total, 3);
        match observer.recv().await.as_deref() {
            Some(TallyEvent::VoteUpdate(update)) => assert_eq!(update.votes, 3),
            other => panic!("expected VoteUpdate, got {:?}", other),
        }

        let report = cycle.await.unwrap();
        assert_eq!(report.synced_votes(), 3);
        assert_eq!(store.durable(option), 3);
        assert_eq!(cache.read(option).await.unwrap(), 0);
        assert_eq!(engine.get_total(option).await.unwrap().votes, 3);
    }

    #[tokio::test]
    async fn test_delete_poll_waits_for_in_flight_vote() {
        let (store, poll) = TestStore::with_poll(&[0, 0]);
        let cache = memory_cache();
        let engine = Arc::new(engine(cache.clone(), store.clone()));
        let option = poll.options[0].id;

        let (entered, release) = store.gate_next_find();
        let vote = tokio::spawn({
            let engine = Arc::clone(&engine);
            async move { engine.record_vote(option).await }
        });
        entered.await.unwrap();

        let delete = tokio::spawn({
            let engine = Arc::clone(&engine);
            async move { engine.delete_poll(poll.id).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!delete.is_finished());
        release.send(false).unwrap();

        vote.await.unwrap().unwrap();
        delete.await.unwrap().unwrap();
        assert!(cache.enumerate().await.unwrap().is_empty());
        assert!(matches!(engine.record_vote(option).await, Err(EngineError::OptionNotFound(_))));
        assert!(cache.enumerate().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_ledger_prune_keeps_staged_tickets() {
        let (store, poll) = TestStore::with_poll(&[0, 0]);
        let cache = memory_cache();
        let engine = engine(cache.clone(), store.clone());
        let (settled, interrupted) = (poll.options[0].id, poll.options[1].id);

        engine.record_vote(settled).await.unwrap();
        engine.reconcile_now().await;
        for _ in 0..3 {
            engine.record_vote(interrupted).await.unwrap();
        }

        // A cycle that stopped after the durable write, long before a restart.
        let ticket = cache.stage_sync(interrupted, 3).await.unwrap();
        store.apply_sync(interrupted, ticket.amount, ticket.token).await.unwrap();

        assert_eq!(engine.prune_sync_ledger(time::Duration::ZERO).await.unwrap(), 1);
        assert!(store.applied.lock().unwrap().contains(&ticket.token));

        let report = engine.reconcile_now().await;
        assert_eq!(report.synced_votes(), 3);
        assert_eq!(store.durable(interrupted), 3);
        assert_eq!(engine.get_total(interrupted).await.unwrap().votes, 3);
    }

    #[tokio::test]
    async fn test_ledger_prune_skipped_during_cache_outage() {
        let (store, poll) = TestStore::with_poll(&[0]);
        let cache = Arc::new(FlakyCache::default());
        let engine = engine(cache.clone(), store.clone());

        engine.record_vote(poll.options[0].id).await.unwrap();
        engine.reconcile_now().await;
        cache.down.store(true, Ordering::SeqCst);

        assert!(matches!(
            engine.prune_sync_ledger(time::Duration::ZERO).await,
            Err(EngineError::CacheUnavailable(_))
        ));
        assert_eq!(store.prune_calls.load(Ordering::SeqCst), 0);
        assert_eq!(store.applied.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ledger_cleanup_waits_a_full_period() {
        let store = Arc::new(TestStore::default());
        let engine = engine(memory_cache(), store.clone());
        let every = Duration::from_secs(3600);

        engine.start_ledger_cleanup(time::Duration::ZERO, every);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(store.prune_calls.load(Ordering::SeqCst), 0);

        tokio::time::sleep(every).await;
        assert_eq!(store.prune_calls.load(Ordering::SeqCst), 1);

        engine.shutdown(Duration::from_secs(1)).await;
        tokio::time::sleep(every * 2).await;
        assert_eq!(store.prune_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_key_gates_drop_idle_entries() {
        let gates = KeyGates::default();
        let (busy, idle) = (Uuid::new_v4(), Uuid::new_v4());

        let held = gates.shared(busy).await;
        drop(gates.exclusive(idle).await);
        assert_eq!(gates.tracked(), 2);

        gates.prune();
        assert_eq!(gates.tracked(), 1);

        // Shared holders do not block each other.
        let second = gates.shared(busy).await;
        drop((held, second));
        gates.prune();
        assert_eq!(gates.tracked(), 0);
    }

    #[tokio::test]
    async fn test_deleted_poll_clears_pending_counters() {
        let (store, poll) = TestStore::with_poll(&[1, 1]);
        let cache = memory_cache();
        let engine = engine(cache.clone(), store.clone());
        let (o1, o2) = (poll.options[0].id, poll.options[1].id);

        engine.record_vote(o1).await.unwrap();
        engine.record_vote(o2).await.unwrap();
        engine.record_vote(o2).await.unwrap();
        cache.stage_sync(o2, 2).await.unwrap();

        engine.notify_poll_deleted(poll.id, &[o1, o2]).await.unwrap();
        assert_eq!(cache.read(o1).await.unwrap(), 0);
        assert_eq!(cache.read(o2).await.unwrap(), 0);
        assert_eq!(cache.staged_sync(o2).await.unwrap(), None);

        let report = engine.reconcile_now().await;
        assert_eq!(report.attempted(), 0);
        assert_eq!(store.sync_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_delete_poll_flow() {
        let (store, poll) = TestStore::with_poll(&[0, 0]);
        let cache = memory_cache();
        let engine = engine(cache.clone(), store.clone());
        let mut observer = engine.subscribe();

        engine.record_vote(poll.options[1].id).await.unwrap();
        let deleted = engine.delete_poll(poll.id).await.unwrap();
        assert_eq!(deleted, poll.option_ids());
        assert!(cache.enumerate().await.unwrap().is_empty());
        assert!(store.list_polls().await.unwrap().is_empty());

        assert!(matches!(observer.recv().await.as_deref(), Some(TallyEvent::VoteUpdate(_))));
        match observer.recv().await.as_deref() {
            Some(TallyEvent::PollDeleted(event)) => assert_eq!(event.poll_id, poll.id),
            other => panic!("expected PollDeleted, got {:?}", other),
        }

        assert!(matches!(engine.delete_poll(poll.id).await, Err(EngineError::PollNotFound(_))));
    }

    #[tokio::test]
    async fn test_delete_option_clears_counter() {
        let (store, poll) = TestStore::with_poll(&[2, 0]);
        let cache = memory_cache();
        let engine = engine(cache.clone(), store.clone());
        let option = poll.options[0].id;

        engine.record_vote(option).await.unwrap();
        engine.delete_option(option).await.unwrap();
        assert_eq!(cache.read(option).await.unwrap(), 0);
        assert!(matches!(engine.get_total(option).await, Err(EngineError::OptionNotFound(_))));
        assert!(matches!(engine.delete_option(option).await, Err(EngineError::OptionNotFound(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_votes_and_cycles_do_not_double_count() {
        const VOTES: i64 = 300;
        const CYCLES: usize = 12;

        let (store, poll) = TestStore::with_poll(&[0, 0]);
        let cache = memory_cache();
        let engine = Arc::new(engine(cache.clone(), store.clone()));
        let option = poll.options[0].id;

        let mut handles = Vec::new();
        for _ in 0..VOTES {
            let engine = Arc::clone(&engine);
            handles.push(tokio::spawn(async move {
                engine.record_vote(option).await.unwrap();
            }));
        }
        for _ in 0..CYCLES {
            let engine = Arc::clone(&engine);
            handles.push(tokio::spawn(async move {
                tokio::task::yield_now().await;
                engine.reconcile_now().await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(engine.get_total(option).await.unwrap().votes, VOTES);

        engine.reconcile_now().await;
        assert_eq!(store.durable(option), VOTES);
        assert_eq!(cache.read(option).await.unwrap(), 0);
        assert_eq!(engine.get_total(option).await.unwrap().votes, VOTES);
    }

    #[tokio::test]
    async fn test_interrupted_sync_is_not_applied_twice() {
        let (store, poll) = TestStore::with_poll(&[0, 0]);
        let cache = memory_cache();
        let engine = engine(cache.clone(), store.clone());
        let option = poll.options[0].id;

        for _ in 0..3 {
            engine.record_vote(option).await.unwrap();
        }

        // A cycle that stopped right after the durable increment.
        let ticket = cache.stage_sync(option, 3).await.unwrap();
        store.apply_sync(option, ticket.amount, ticket.token).await.unwrap();
        engine.record_vote(option).await.unwrap();

        let report = engine.reconcile_now().await;
        assert_eq!(report.synced_votes(), 3);
        assert_eq!(store.durable(option), 3);
        assert_eq!(cache.read(option).await.unwrap(), 1);
        assert_eq!(cache.staged_sync(option).await.unwrap(), None);

        engine.reconcile_now().await;
        assert_eq!(store.durable(option), 4);
        assert_eq!(engine.get_total(option).await.unwrap().votes, 4);
    }

    #[tokio::test]
    async fn test_cache_outage_degrades_reads_and_fails_votes() {
        let (store, poll) = TestStore::with_poll(&[3, 7]);
        let cache = Arc::new(FlakyCache::default());
        let engine = engine(cache.clone(), store);
        let option = poll.options[0].id;

        engine.record_vote(option).await.unwrap();
        cache.down.store(true, Ordering::SeqCst);

        assert!(matches!(engine.record_vote(option).await, Err(EngineError::CacheUnavailable(_))));

        let total = engine.get_total(option).await.unwrap();
        assert_eq!(total.votes, 3);
        assert!(total.stale);

        let merged = engine.get_poll_totals(poll.id).await.unwrap();
        assert!(merged.stale);
        assert_eq!(merged.poll.total_votes(), 10);

        let grand = engine.get_grand_total().await.unwrap();
        assert_eq!(grand.votes, 10);
        assert!(grand.stale);

        let report = engine.reconcile_now().await;
        assert!(report.enumerate_error.is_some());

        cache.down.store(false, Ordering::SeqCst);
        assert_eq!(engine.get_total(option).await.unwrap().votes, 4);
    }

    #[tokio::test]
    async fn test_vote_and_poll_events_reach_observers() {
        let store = Arc::new(TestStore::default());
        let engine = engine(memory_cache(), store);
        let mut observer = engine.subscribe();

        let poll = engine
            .create_poll(Poll::new("Tabs or spaces?", vec!["Tabs".into(), "Spaces".into()]))
            .await
            .unwrap();
        engine.record_vote(poll.options[1].id).await.unwrap();
        engine.record_vote(poll.options[1].id).await.unwrap();

        match observer.recv().await.as_deref() {
            Some(TallyEvent::PollCreated(created)) => assert_eq!(created, &poll),
            other => panic!("expected PollCreated, got {:?}", other),
        }
        for expected in 1..=2 {
            match observer.recv().await.as_deref() {
                Some(TallyEvent::VoteUpdate(update)) => {
                    assert_eq!(update.option_id, poll.options[1].id);
                    assert_eq!(update.poll_id, poll.id);
                    assert_eq!(update.votes, expected);
                }
                other => panic!("expected VoteUpdate, got {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_slow_observer_does_not_block_others() {
        let fanout = Fanout::new(1);
        let mut fast = fanout.subscribe();
        let slow = fanout.subscribe();
        let event = || TallyEvent::PollDeleted(shared::models::PollDeleted { poll_id: Uuid::new_v4() });

        assert_eq!(fanout.publish(event()), 2);
        assert!(fast.recv().await.is_some());

        assert_eq!(fanout.publish(event()), 1);
        assert!(fast.recv().await.is_some());
        assert_eq!(fanout.observer_count(), 2);

        drop(slow);
        assert_eq!(fanout.observer_count(), 1);
        assert_eq!(fanout.publish(event()), 1);

        let late = fanout.subscribe();
        assert_ne!(late.id(), fast.id());
        assert_eq!(fanout.observer_count(), 2);
    }

    #[tokio::test]
    async fn test_shutdown_drains_pending_votes() {
        let (store, poll) = TestStore::with_poll(&[0, 0]);
        let cache = memory_cache();
        let engine = engine(cache.clone(), store.clone());

        engine.start_reconciler(Duration::from_secs(3600));
        for option in [poll.options[0].id, poll.options[1].id, poll.options[1].id] {
            engine.record_vote(option).await.unwrap();
        }

        let report = engine.shutdown(Duration::from_secs(5)).await;
        assert!(report.is_some());
        assert_eq!(store.durable(poll.options[0].id), 1);
        assert_eq!(store.durable(poll.options[1].id), 2);
        assert!(cache.enumerate().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_memory_cache_commit_and_clamp() {
        let cache = MemoryCounterCache::new();
        let option = Uuid::new_v4();

        for _ in 0..3 {
            cache.increment(option).await.unwrap();
        }
        assert_eq!(cache.decrement_by(option, 5).await.unwrap(), 0);
        assert!(cache.enumerate().await.unwrap().is_empty());

        for _ in 0..4 {
            cache.increment(option).await.unwrap();
        }
        let ticket = cache.stage_sync(option, 3).await.unwrap();
        assert_eq!(cache.stage_sync(option, 4).await.unwrap(), ticket);

        let stale = SyncTicket::new(option, 3);
        assert_eq!(cache.commit_sync(&stale).await.unwrap(), 4);
        assert_eq!(cache.commit_sync(&ticket).await.unwrap(), 1);
        assert_eq!(cache.commit_sync(&ticket).await.unwrap(), 1);
        assert_eq!(cache.read_many(&[option, Uuid::new_v4()]).await.unwrap(), vec![1, 0]);
    }

    #[test]
    fn test_sync_ticket_encoding() {
        let option = Uuid::new_v4();
        let ticket = SyncTicket::new(option, 12);
        assert_eq!(SyncTicket::decode(option, &ticket.encode()), Some(ticket));
        assert_eq!(SyncTicket::decode(option, "not-a-ticket"), None);
        assert_eq!(SyncTicket::decode(option, &format!("{}:0", Uuid::new_v4())), None);
    }

    #[test]
    fn test_config_from_lookup() {
        let values: HashMap<&str, &str> = [
            ("REDIS_URL", "redis://cache:6379"),
            ("RECONCILE_INTERVAL_SECS", "2"),
            ("RECONCILE_CONCURRENCY", "not-a-number"),
            ("OBSERVER_BUFFER", "0"),
            ("COUNTER_PREFIX", "pending:"),
        ]
        .into_iter()
        .collect();

        let config = Config::from_lookup(|key| values.get(key).map(|v| v.to_string()));
        assert_eq!(config.redis_url.as_deref(), Some("redis://cache:6379"));
        assert_eq!(config.reconcile_interval, Duration::from_secs(2));
        assert_eq!(config.reconcile_concurrency, 16);
        assert_eq!(config.observer_buffer, 1);
        assert_eq!(config.counter_prefix, "pending:");

        let defaults = Config::default();
        assert_eq!(defaults.redis_url, None);
        assert_eq!(defaults.reconcile_interval, Duration::from_secs(5));
        assert_eq!(defaults.shutdown_drain_timeout, Duration::from_secs(10));
        assert_eq!(defaults.counter_prefix, "votes:");
        assert_eq!(defaults.ticket_prefix, "vote-sync:");
    }

    #[test]
    fn test_config_rejects_overlapping_key_prefixes() {
        let load = |counter: &str, ticket: &str| {
            let values: HashMap<&str, String> =
                [("COUNTER_PREFIX", counter.to_string()), ("TICKET_PREFIX", ticket.to_string())]
                    .into_iter()
                    .collect();
            let config = Config::from_lookup(|key| values.get(key).cloned());
            (config.counter_prefix, config.ticket_prefix)
        };
        let defaults = ("votes:".to_string(), "vote-sync:".to_string());

        assert_eq!(load("vote", "vote-sync:"), defaults);
        assert_eq!(load("sync:votes:", "sync:"), defaults);
        assert_eq!(load("same:", "same:"), defaults);
        assert_eq!(load("", "tickets:"), ("votes:".to_string(), "tickets:".to_string()));
        assert_eq!(load("pending:", "staged:"), ("pending:".to_string(), "staged:".to_string()));
    }
}
