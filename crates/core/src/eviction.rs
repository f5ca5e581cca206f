//! Cross-shard LRU eviction.
//!
//! Every shard selects its own oldest entries and reports them to one shared
//! [`EvictionCoordinator`]. The coordinator is a barrier: the last shard to
//! report merges all lists by `last_used`, keeps the oldest entries until
//! `size_to_remove` bytes are covered, and hands each shard the part of the
//! selection it owns.

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::store::{EvictionCandidate, ResId, ShardId};

/// The part of a global eviction decision owned by one shard.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvictionSelection {
    pub res_ids: Vec<ResId>,
    /// Sum of the selected candidates' `bytes_usage`.
    pub bytes_usage: i64,
}

struct Report {
    shard_id: ShardId,
    candidates: Vec<EvictionCandidate>,
    reply: oneshot::Sender<EvictionSelection>,
}

pub struct EvictionCoordinator {
    size_to_remove: i64,
    shard_count: usize,
    reports: Mutex<Vec<Report>>,
}

impl EvictionCoordinator {
    pub fn new(size_to_remove: i64, shard_count: usize) -> Self {
        Self { size_to_remove, shard_count, reports: Mutex::new(Vec::with_capacity(shard_count)) }
    }

    pub fn size_to_remove(&self) -> i64 {
        self.size_to_remove
    }

    /// Report one shard's candidates.
    ///
    /// The returned receiver resolves once every shard has reported. If this
    /// is the last report, the merge runs inline before returning.
    pub fn on_candidates(
        &self, shard_id: ShardId, candidates: Vec<EvictionCandidate>,
    ) -> oneshot::Receiver<EvictionSelection> {
        let (reply, rx) = oneshot::channel();
        let complete = {
            let mut reports = self.reports.lock();
            reports.push(Report { shard_id, candidates, reply });
            if reports.len() < self.shard_count {
                return rx;
            }
            std::mem::take(&mut *reports)
        };
        self.dispatch(complete);
        rx
    }

    fn dispatch(&self, reports: Vec<Report>) {
        let mut replies = Vec::with_capacity(reports.len());
        let mut lists = Vec::with_capacity(reports.len());
        for report in reports {
            replies.push((report.shard_id, report.reply));
            lists.push(report.candidates);
        }

        let mut per_shard: HashMap<ShardId, EvictionSelection> = HashMap::new();
        for candidate in select(self.size_to_remove, lists) {
            let selection = per_shard.entry(candidate.shard_id).or_default();
            selection.res_ids.push(candidate.res_id);
            selection.bytes_usage = selection.bytes_usage.saturating_add(candidate.bytes_usage);
        }

        let total: usize = per_shard.values().map(|s| s.res_ids.len()).sum();
        tracing::debug!(size_to_remove = self.size_to_remove, selected = total, "Eviction candidates merged");

        for (shard_id, reply) in replies {
            // A shard that went away simply does not evict.
            let _ = reply.send(per_shard.remove(&shard_id).unwrap_or_default());
        }
    }
}

/// Merge candidate lists oldest first and keep entries until their summed
/// `bytes_usage` reaches `size_to_remove` or the candidates run out.
pub fn select(size_to_remove: i64, lists: Vec<Vec<EvictionCandidate>>) -> Vec<EvictionCandidate> {
    let mut merged: Vec<EvictionCandidate> = lists.into_iter().flatten().collect();
    merged.sort_by(|a, b| {
        a.last_used.cmp(&b.last_used).then(a.shard_id.cmp(&b.shard_id)).then(a.res_id.cmp(&b.res_id))
    });

    let mut covered: i64 = 0;
    let mut selected = Vec::new();
    for candidate in merged {
        if covered >= size_to_remove {
            break;
        }
        covered = covered.saturating_add(candidate.bytes_usage);
        selected.push(candidate);
    }
    selected
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::DateTime;

    use super::*;

    fn candidate(res_id: i64, shard_id: ShardId, bytes_usage: i64, secs: i64) -> EvictionCandidate {
        EvictionCandidate {
            res_id: ResId(res_id),
            shard_id,
            bytes_usage,
            last_used: DateTime::from_timestamp(secs, 0).unwrap(),
        }
    }

    #[test]
    fn test_select_stops_once_covered() {
        let lists = vec![vec![candidate(1, 0, 100, 10)], vec![candidate(2, 1, 80, 20), candidate(3, 1, 50, 30)], vec![]];
        let selected: Vec<ResId> = select(150, lists).into_iter().map(|c| c.res_id).collect();
        assert_eq!(selected, vec![ResId(1), ResId(2)]);
    }

    #[test]
    fn test_select_orders_by_last_used() {
        let lists = vec![vec![candidate(1, 0, 10, 50)], vec![candidate(2, 1, 10, 5)]];
        let selected: Vec<ResId> = select(10, lists).into_iter().map(|c| c.res_id).collect();
        assert_eq!(selected, vec![ResId(2)]);
    }

    #[test]
    fn test_select_exhausted() {
        let lists = vec![vec![candidate(1, 0, 10, 50)]];
        assert_eq!(select(1_000, lists).len(), 1);
        assert!(select(0, vec![vec![candidate(1, 0, 10, 50)]]).is_empty());
    }

    #[tokio::test]
    async fn test_three_shard_barrier() {
        let coordinator = Arc::new(EvictionCoordinator::new(150, 3));

        let rx1 = coordinator.on_candidates(1, vec![candidate(1, 1, 100, 10)]);
        let rx2 = coordinator.on_candidates(2, vec![candidate(2, 2, 80, 20)]);
        let mut rx3 = coordinator.on_candidates(3, vec![]);

        // The last report merged inline.
        let third = rx3.try_recv().unwrap();
        assert_eq!(third, EvictionSelection::default());

        let first = rx1.await.unwrap();
        assert_eq!(first, EvictionSelection { res_ids: vec![ResId(1)], bytes_usage: 100 });
        let second = rx2.await.unwrap();
        assert_eq!(second, EvictionSelection { res_ids: vec![ResId(2)], bytes_usage: 80 });
    }

    #[tokio::test]
    async fn test_waits_for_every_shard() {
        let coordinator = EvictionCoordinator::new(10, 2);
        let mut rx = coordinator.on_candidates(0, vec![candidate(1, 0, 10, 10)]);
        assert!(rx.try_recv().is_err());
        let _other = coordinator.on_candidates(1, vec![]);
        assert_eq!(rx.await.unwrap().res_ids, vec![ResId(1)]);
    }
}
