//! Eviction candidate selection and deletion for one shard.

use std::collections::HashSet;
use std::sync::Arc;

use super::entries::delete_live_resources_while;
use super::status::update_status_and_commit;
use super::{DeletedEntry, EvictionCandidate, IdleProbe, ResId, ShardStore, WithStatus, from_micros};
use crate::Error;

/// What an eviction pass actually removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvictedEntries {
    pub entries: Vec<DeletedEntry>,
    pub bytes_usage: i64,
    /// Idle-time eviction stopped early because the process became busy.
    pub aborted: bool,
}

fn still_idle(idle: &Option<Arc<dyn IdleProbe>>) -> bool {
    idle.as_ref().is_none_or(|probe| probe.is_idle())
}

impl ShardStore {
    /// Least recently used live rows, oldest first, until their combined
    /// `bytes_usage` covers `size_to_remove`. Rows in `excluded` are skipped.
    ///
    /// With an idle probe the selection yields nothing once the process
    /// stops being idle.
    pub async fn select_eviction_candidates(
        &self, size_to_remove: i64, excluded: HashSet<ResId>, idle: Option<Arc<dyn IdleProbe>>,
    ) -> Result<Vec<EvictionCandidate>, Error> {
        let shard_id = self.shard_id();
        self.read("select_eviction_candidates", move |conn, _| {
            if !still_idle(&idle) {
                return Ok(Vec::new());
            }
            let mut stmt = conn.prepare_cached(
                "SELECT res_id, bytes_usage, last_used FROM resources WHERE doomed = 0 ORDER BY last_used, res_id",
            )?;
            let mut rows = stmt.query([])?;

            let mut candidates = Vec::new();
            let mut covered: i64 = 0;
            while covered < size_to_remove {
                let Some(row) = rows.next()? else {
                    break;
                };
                if !still_idle(&idle) {
                    return Ok(Vec::new());
                }
                let res_id = ResId(row.get(0)?);
                if excluded.contains(&res_id) {
                    continue;
                }
                let bytes_usage: i64 = row.get(1)?;
                covered = covered.saturating_add(bytes_usage);
                candidates.push(EvictionCandidate { res_id, shard_id, bytes_usage, last_used: from_micros(row.get(2)?)? });
            }
            Ok(candidates)
        })
        .await
    }

    /// Delete the selected live rows in one transaction.
    ///
    /// With an idle probe, idleness is re-checked before every deletion; on
    /// the first busy answer the deletions made so far are committed and
    /// the result is marked aborted.
    pub async fn evict_entries(
        &self, res_ids: Vec<ResId>, idle: Option<Arc<dyn IdleProbe>>,
    ) -> WithStatus<EvictedEntries> {
        self.write("evict_entries", move |conn, corruption_detected| {
            if !still_idle(&idle) {
                return Err(Error::AbortedDueToBrowserActivity);
            }
            let tx = conn.transaction().map_err(|_| Error::FailedToStartTransaction)?;
            let (deleted, bytes_usage, aborted) =
                delete_live_resources_while(&tx, res_ids, corruption_detected, |_| still_idle(&idle))?;
            update_status_and_commit(tx, -(deleted.len() as i64), bytes_usage.saturating_neg(), corruption_detected)?;
            Ok(EvictedEntries { entries: deleted, bytes_usage, aborted })
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::DateTime;
    use tempfile::TempDir;
    use tokio_rusqlite::rusqlite;

    use super::*;
    use crate::CacheEntryKey;
    use crate::store::StoreStatus;
    use crate::store::test_support::open_store;

    struct BusyAfter(AtomicUsize);

    impl IdleProbe for BusyAfter {
        fn is_idle(&self) -> bool {
            self.0.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)).is_ok()
        }
    }

    fn res_ids(evicted: &EvictedEntries) -> Vec<ResId> {
        evicted.entries.iter().map(|e| e.res_id).collect()
    }

    async fn populate(store: &ShardStore) -> Vec<ResId> {
        let mut ids = Vec::new();
        for (i, key) in ["aaaa", "bb", "cccccc", "d"].iter().enumerate() {
            let t = DateTime::from_timestamp(1_000 + i as i64, 0).unwrap();
            ids.push(store.create_entry(CacheEntryKey::new(*key), t, true).await.result.unwrap().res_id);
        }
        ids
    }

    #[tokio::test]
    async fn test_candidates_oldest_first_until_covered() {
        let dir = TempDir::new().unwrap();
        let (store, _) = open_store(&dir).await;
        let ids = populate(&store).await;

        let candidates = store.select_eviction_candidates(5, HashSet::new(), None).await.unwrap();
        let selected: Vec<ResId> = candidates.iter().map(|c| c.res_id).collect();
        assert_eq!(selected, vec![ids[0], ids[1]]);
        assert_eq!(candidates[0].bytes_usage, 4);
        assert!(candidates.iter().all(|c| c.shard_id == 0));
    }

    #[tokio::test]
    async fn test_candidates_skip_excluded() {
        let dir = TempDir::new().unwrap();
        let (store, _) = open_store(&dir).await;
        let ids = populate(&store).await;

        let candidates = store.select_eviction_candidates(5, HashSet::from([ids[0]]), None).await.unwrap();
        let selected: Vec<ResId> = candidates.iter().map(|c| c.res_id).collect();
        assert_eq!(selected, vec![ids[1], ids[2]]);
    }

    #[tokio::test]
    async fn test_candidates_exhausted() {
        let dir = TempDir::new().unwrap();
        let (store, _) = open_store(&dir).await;
        populate(&store).await;
        let candidates = store.select_eviction_candidates(1_000, HashSet::new(), None).await.unwrap();
        assert_eq!(candidates.len(), 4);
    }

    #[tokio::test]
    async fn test_evict_entries_updates_status() {
        let dir = TempDir::new().unwrap();
        let (store, _) = open_store(&dir).await;
        let ids = populate(&store).await;

        let out = store.evict_entries(vec![ids[0], ids[2]], None).await;
        let evicted = out.result.unwrap();
        assert_eq!(res_ids(&evicted), vec![ids[0], ids[2]]);
        assert_eq!(evicted.bytes_usage, 10);
        assert!(!evicted.aborted);
        assert_eq!(out.status, Some(StoreStatus { entry_count: 2, total_size: 3 }));
    }

    #[tokio::test]
    async fn test_evict_skips_doomed() {
        let dir = TempDir::new().unwrap();
        let (store, _) = open_store(&dir).await;
        let ids = populate(&store).await;
        store.doom_entry(ids[0]).await.result.unwrap();

        let evicted = store.evict_entries(vec![ids[0], ids[1]], None).await.result.unwrap();
        assert_eq!(res_ids(&evicted), vec![ids[1]]);
    }

    #[tokio::test]
    async fn test_idle_eviction_aborts_when_busy() {
        let dir = TempDir::new().unwrap();
        let (store, _) = open_store(&dir).await;
        let ids = populate(&store).await;

        let busy: Arc<dyn IdleProbe> = Arc::new(BusyAfter(AtomicUsize::new(0)));
        let candidates = store.select_eviction_candidates(100, HashSet::new(), Some(busy.clone())).await.unwrap();
        assert!(candidates.is_empty());
        let out = store.evict_entries(ids.clone(), Some(busy)).await;
        assert!(matches!(out.result, Err(Error::AbortedDueToBrowserActivity)));

        // Idle for the initial check and the first deletion only.
        let flaky: Arc<dyn IdleProbe> = Arc::new(BusyAfter(AtomicUsize::new(2)));
        let out = store.evict_entries(ids.clone(), Some(flaky)).await;
        let evicted = out.result.unwrap();
        assert!(evicted.aborted);
        assert_eq!(res_ids(&evicted), vec![ids[0]]);
        assert_eq!(out.status, Some(StoreStatus { entry_count: 3, total_size: 9 }));
    }

    fn live_rows(conn: &rusqlite::Connection) -> i64 {
        conn.query_row("SELECT COUNT(*) FROM resources WHERE doomed = 0", [], |row| row.get(0)).unwrap()
    }

    #[tokio::test]
    async fn test_idle_check_runs_between_deletions() {
        let dir = TempDir::new().unwrap();
        let (store, _) = open_store(&dir).await;
        let ids = populate(&store).await;

        // Turns busy as soon as one row has actually been deleted.
        let selected = ids.clone();
        let (deleted, bytes_usage, aborted) = store
            .conn
            .call(move |conn| -> Result<_, Error> {
                let mut corruption_detected = false;
                delete_live_resources_while(conn, selected, &mut corruption_detected, |conn| live_rows(conn) == 4)
            })
            .await
            .unwrap();

        assert!(aborted);
        assert_eq!(deleted.iter().map(|e| e.res_id).collect::<Vec<_>>(), vec![ids[0]]);
        assert_eq!(bytes_usage, 4);
        assert_eq!(store.conn.call(|conn| -> Result<_, Error> { Ok(live_rows(conn)) }).await.unwrap(), 3);
    }
}
