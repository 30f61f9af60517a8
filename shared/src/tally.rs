//! Read-path overlay: durable counts plus pending counters give the visible
//! total. Nothing here touches a store; callers fetch both sides first.
use std::collections::HashMap;
use uuid::Uuid;
use crate::models::{Poll, PollTotals};

/// Visible total for one option. A negative pending value never reaches
/// callers of the cache, but it is clamped here as well.
pub fn visible_total(durable: i64, pending: i64) -> i64 {
    durable + pending.max(0)
}

pub fn merge_poll(mut poll: Poll, pending: &HashMap<Uuid, i64>, stale: bool) -> PollTotals {
    for option in &mut poll.options {
        let delta = pending.get(&option.id).copied().unwrap_or(0);
        option.votes = visible_total(option.votes, delta);
    }
    PollTotals { poll, stale }
}

pub fn merge_polls(polls: Vec<Poll>, pending: &HashMap<Uuid, i64>, stale: bool) -> Vec<PollTotals> {
    polls
        .into_iter()
        .map(|poll| merge_poll(poll, pending, stale))
        .collect()
}
