//! Resource-row operations: open, create, doom, delete, and metadata updates.

use std::collections::HashSet;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio_rusqlite::{params, rusqlite};

use super::status::{recalculate_status_and_commit, update_status_and_commit};
use super::{
    DeletedEntry, EntryInfo, EntryInfoWithKey, IndexRow, ResId, STATIC_RESOURCE_SIZE, ShardStore, WithStatus, from_micros,
    time_bounds, to_micros,
};
use crate::Error;
use crate::key::{CacheEntryKey, calculate_checksum};

fn begin(conn: &mut rusqlite::Connection) -> Result<rusqlite::Transaction<'_>, Error> {
    conn.transaction().map_err(|_| Error::FailedToStartTransaction)
}

/// Load the live row for `key`, verifying the header checksum.
fn open_entry_internal(conn: &rusqlite::Connection, key: &CacheEntryKey) -> Result<Option<EntryInfo>, Error> {
    let mut stmt = conn.prepare_cached(
        "SELECT res_id, last_used, body_end, check_sum, head FROM resources
         WHERE key_hash = ?1 AND doomed = 0 AND cache_key = ?2
         ORDER BY res_id DESC LIMIT 1",
    )?;
    let mut rows = stmt.query(params![key.hash().value(), key.as_str()])?;
    let Some(row) = rows.next()? else {
        return Ok(None);
    };

    let res_id = ResId(row.get(0)?);
    let last_used = from_micros(row.get(1)?)?;
    let body_end: i64 = row.get(2)?;
    let check_sum: i64 = row.get(3)?;
    let head: Option<Vec<u8>> = row.get(4)?;
    let head = head.unwrap_or_default();

    if i64::from(calculate_checksum(&head, key.hash())) != check_sum {
        return Err(Error::ChecksumError);
    }
    Ok(Some(EntryInfo { res_id, last_used, body_end, head: Bytes::from(head), opened: true }))
}

fn create_entry_internal(
    tx: &rusqlite::Transaction<'_>, key: &CacheEntryKey, creation_time: DateTime<Utc>, run_existence_check: bool,
) -> Result<EntryInfo, Error> {
    if run_existence_check && open_entry_internal(tx, key)?.is_some() {
        return Err(Error::AlreadyExists);
    }

    // Starts at the key size; header and body writes add to it.
    let bytes_usage = key.len() as i64;
    let res_id: i64 = tx.query_row(
        "INSERT INTO resources (last_used, body_end, bytes_usage, doomed, check_sum, key_hash, cache_key)
         VALUES (?1, 0, ?2, 0, ?3, ?4, ?5) RETURNING res_id",
        params![
            to_micros(creation_time),
            bytes_usage,
            i64::from(calculate_checksum(&[], key.hash())),
            key.hash().value(),
            key.as_str()
        ],
        |row| row.get(0),
    )?;

    Ok(EntryInfo { res_id: ResId(res_id), last_used: creation_time, body_end: 0, head: Bytes::new(), opened: false })
}

fn delete_blobs_by_res_id(conn: &rusqlite::Connection, res_id: ResId) -> Result<(), Error> {
    conn.prepare_cached("DELETE FROM blobs WHERE res_id = ?1")?.execute(params![res_id.value()])?;
    Ok(())
}

/// Hard-delete a live row and its blobs, returning its `bytes_usage` and
/// key hash.
fn delete_live_resource(conn: &rusqlite::Connection, res_id: ResId) -> Result<Option<(i64, i32)>, Error> {
    delete_blobs_by_res_id(conn, res_id)?;
    let mut stmt = conn
        .prepare_cached("DELETE FROM resources WHERE res_id = ?1 AND doomed = 0 RETURNING bytes_usage, key_hash")?;
    let mut rows = stmt.query(params![res_id.value()])?;
    Ok(match rows.next()? {
        Some(row) => Some((row.get(0)?, row.get(1)?)),
        None => None,
    })
}

/// Hard-delete a doomed row and its blobs. Returns false if no doomed row
/// with that id exists.
fn delete_doomed_resource(conn: &rusqlite::Connection, res_id: ResId) -> Result<bool, Error> {
    conn.prepare_cached(
        "DELETE FROM blobs WHERE res_id = ?1
         AND EXISTS (SELECT 1 FROM resources WHERE res_id = ?1 AND doomed = 1)",
    )?
    .execute(params![res_id.value()])?;
    let deleted = conn
        .prepare_cached("DELETE FROM resources WHERE res_id = ?1 AND doomed = 1")?
        .execute(params![res_id.value()])?;
    Ok(deleted > 0)
}

/// Delete the given live rows; returns the rows actually deleted and their
/// summed `bytes_usage`.
pub(crate) fn delete_live_resources(
    conn: &rusqlite::Connection, res_ids: impl IntoIterator<Item = ResId>, corruption_detected: &mut bool,
) -> Result<(Vec<DeletedEntry>, i64), Error> {
    let (deleted, total, _) = delete_live_resources_while(conn, res_ids, corruption_detected, |_| true)?;
    Ok((deleted, total))
}

/// Like [`delete_live_resources`], but asks `proceed` before every
/// deletion and stops at the first `false`. The last element of the result
/// is true when the loop stopped early.
pub(crate) fn delete_live_resources_while(
    conn: &rusqlite::Connection, res_ids: impl IntoIterator<Item = ResId>, corruption_detected: &mut bool,
    mut proceed: impl FnMut(&rusqlite::Connection) -> bool,
) -> Result<(Vec<DeletedEntry>, i64, bool), Error> {
    let mut deleted = Vec::new();
    let mut total: i64 = 0;
    for res_id in res_ids {
        if !proceed(conn) {
            return Ok((deleted, total, true));
        }
        if let Some((bytes_usage, key_hash)) = delete_live_resource(conn, res_id)? {
            total = total.checked_add(bytes_usage).unwrap_or_else(|| {
                *corruption_detected = true;
                i64::MAX
            });
            deleted.push(DeletedEntry { res_id, key_hash });
        }
    }
    Ok((deleted, total, false))
}

fn live_res_ids_for_key(conn: &rusqlite::Connection, key: &CacheEntryKey) -> Result<Vec<ResId>, Error> {
    let mut stmt =
        conn.prepare_cached("SELECT res_id FROM resources WHERE key_hash = ?1 AND doomed = 0 AND cache_key = ?2")?;
    let ids = stmt
        .query_map(params![key.hash().value(), key.as_str()], |row| row.get(0).map(ResId))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ids)
}

impl ShardStore {
    /// Look up the live entry for `key`.
    pub async fn open_entry(&self, key: CacheEntryKey) -> Result<Option<EntryInfo>, Error> {
        self.read("open_entry", move |conn, _| open_entry_internal(conn, &key)).await
    }

    /// Insert a new row for `key`; fails with `AlreadyExists` when
    /// `run_existence_check` is set and a live row exists.
    pub async fn create_entry(
        &self, key: CacheEntryKey, creation_time: DateTime<Utc>, run_existence_check: bool,
    ) -> WithStatus<EntryInfo> {
        self.write("create_entry", move |conn, corruption_detected| {
            let tx = begin(conn)?;
            let info = create_entry_internal(&tx, &key, creation_time, run_existence_check)?;
            update_status_and_commit(tx, 1, key.len() as i64, corruption_detected)?;
            Ok(info)
        })
        .await
    }

    /// Open the live entry for `key`, creating it when absent.
    pub async fn open_or_create_entry(&self, key: CacheEntryKey, creation_time: DateTime<Utc>) -> WithStatus<EntryInfo> {
        self.write("open_or_create_entry", move |conn, corruption_detected| {
            let tx = begin(conn)?;
            if let Some(info) = open_entry_internal(&tx, &key)? {
                return Ok(info);
            }
            let info = create_entry_internal(&tx, &key, creation_time, false)?;
            update_status_and_commit(tx, 1, key.len() as i64, corruption_detected)?;
            Ok(info)
        })
        .await
    }

    /// Mark the live row `res_id` as doomed and drop it from the aggregates.
    pub async fn doom_entry(&self, res_id: ResId) -> WithStatus<()> {
        self.write("doom_entry", move |conn, corruption_detected| {
            let tx = begin(conn)?;
            let bytes_usage: i64 = {
                let mut stmt = tx.prepare_cached(
                    "UPDATE resources SET doomed = 1 WHERE res_id = ?1 AND doomed = 0 RETURNING bytes_usage",
                )?;
                let mut rows = stmt.query(params![res_id.value()])?;
                match rows.next()? {
                    Some(row) => row.get(0)?,
                    None => return Err(Error::NotFound),
                }
            };
            update_status_and_commit(tx, -1, bytes_usage.saturating_neg(), corruption_detected)?;
            Ok(())
        })
        .await
    }

    /// Hard-delete one doomed row and its blobs.
    pub async fn delete_doomed_entry(&self, res_id: ResId) -> WithStatus<()> {
        self.write("delete_doomed_entry", move |conn, corruption_detected| {
            let tx = begin(conn)?;
            if !delete_doomed_resource(&tx, res_id)? {
                return Err(Error::NotFound);
            }
            update_status_and_commit(tx, 0, 0, corruption_detected)?;
            Ok(())
        })
        .await
    }

    /// Hard-delete every listed row that is doomed; live rows are skipped.
    pub async fn delete_doomed_entries(&self, res_ids: Vec<ResId>) -> WithStatus<usize> {
        self.write("delete_doomed_entries", move |conn, corruption_detected| {
            let tx = begin(conn)?;
            let mut deleted = 0;
            for res_id in res_ids {
                if delete_doomed_resource(&tx, res_id)? {
                    deleted += 1;
                }
            }
            update_status_and_commit(tx, 0, 0, corruption_detected)?;
            Ok(deleted)
        })
        .await
    }

    /// Hard-delete the live row for `key`.
    pub async fn delete_live_entry(&self, key: CacheEntryKey) -> WithStatus<Vec<DeletedEntry>> {
        self.write("delete_live_entry", move |conn, corruption_detected| {
            let tx = begin(conn)?;
            let ids = live_res_ids_for_key(&tx, &key)?;
            if ids.is_empty() {
                return Err(Error::NotFound);
            }
            let (deleted, bytes) = delete_live_resources(&tx, ids, corruption_detected)?;
            update_status_and_commit(tx, -(deleted.len() as i64), bytes.saturating_neg(), corruption_detected)?;
            Ok(deleted)
        })
        .await
    }

    /// Delete every row, live or doomed, and reset the counters.
    pub async fn delete_all_entries(&self) -> WithStatus<Vec<DeletedEntry>> {
        self.write("delete_all_entries", move |conn, _| {
            let tx = begin(conn)?;
            let ids = {
                let mut stmt = tx.prepare_cached("SELECT res_id, key_hash FROM resources")?;
                stmt.query_map([], |row| Ok(DeletedEntry { res_id: ResId(row.get(0)?), key_hash: row.get(1)? }))?
                    .collect::<Result<Vec<_>, _>>()?
            };
            tx.execute("DELETE FROM blobs", [])?;
            tx.execute("DELETE FROM resources", [])?;
            recalculate_status_and_commit(tx)?;
            Ok(ids)
        })
        .await
    }

    /// Delete live rows with `from <= last_used < to`, except `excluded`.
    pub async fn delete_live_entries_between(
        &self, from: DateTime<Utc>, to: DateTime<Utc>, excluded: HashSet<ResId>,
    ) -> WithStatus<Vec<DeletedEntry>> {
        let (lower, upper) = time_bounds(from, to);
        self.write("delete_live_entries_between", move |conn, corruption_detected| {
            let tx = begin(conn)?;
            let ids = {
                let mut stmt = tx.prepare_cached(
                    "SELECT res_id FROM resources WHERE doomed = 0 AND last_used >= ?1 AND last_used < ?2",
                )?;
                stmt.query_map(params![lower, upper], |row| row.get(0).map(ResId))?
                    .filter(|id| !id.as_ref().is_ok_and(|id| excluded.contains(id)))
                    .collect::<Result<Vec<_>, _>>()?
            };
            let (deleted, bytes) = delete_live_resources(&tx, ids, corruption_detected)?;
            update_status_and_commit(tx, -(deleted.len() as i64), bytes.saturating_neg(), corruption_detected)?;
            Ok(deleted)
        })
        .await
    }

    pub async fn update_entry_last_used_by_key(&self, key: CacheEntryKey, last_used: DateTime<Utc>) -> WithStatus<()> {
        self.write("update_entry_last_used_by_key", move |conn, corruption_detected| {
            let tx = begin(conn)?;
            let changed = tx.execute(
                "UPDATE resources SET last_used = ?1 WHERE key_hash = ?2 AND doomed = 0 AND cache_key = ?3",
                params![to_micros(last_used), key.hash().value(), key.as_str()],
            )?;
            if changed == 0 {
                return Err(Error::NotFound);
            }
            update_status_and_commit(tx, 0, 0, corruption_detected)?;
            Ok(())
        })
        .await
    }

    pub async fn update_entry_last_used_by_res_id(&self, res_id: ResId, last_used: DateTime<Utc>) -> WithStatus<()> {
        self.write("update_entry_last_used_by_res_id", move |conn, corruption_detected| {
            let tx = begin(conn)?;
            let changed = tx.execute(
                "UPDATE resources SET last_used = ?1 WHERE res_id = ?2 AND doomed = 0",
                params![to_micros(last_used), res_id.value()],
            )?;
            if changed == 0 {
                return Err(Error::NotFound);
            }
            update_status_and_commit(tx, 0, 0, corruption_detected)?;
            Ok(())
        })
        .await
    }

    /// Replace the header, adjust `bytes_usage` by `header_size_delta`, and
    /// bump `last_used`.
    pub async fn update_entry_header_and_last_used(
        &self, key: CacheEntryKey, res_id: ResId, last_used: DateTime<Utc>, head: Bytes, header_size_delta: i64,
    ) -> WithStatus<()> {
        self.write("update_entry_header_and_last_used", move |conn, corruption_detected| {
            let tx = begin(conn)?;
            let (bytes_usage, doomed): (i64, bool) = {
                let mut stmt = tx.prepare_cached(
                    "UPDATE resources SET last_used = ?1, bytes_usage = bytes_usage + ?2, check_sum = ?3, head = ?4
                     WHERE res_id = ?5 RETURNING bytes_usage, doomed",
                )?;
                let mut rows = stmt.query(params![
                    to_micros(last_used),
                    header_size_delta,
                    i64::from(calculate_checksum(&head, key.hash())),
                    &head[..],
                    res_id.value()
                ])?;
                match rows.next()? {
                    Some(row) => (row.get(0)?, row.get(1)?),
                    None => return Err(Error::NotFound),
                }
            };
            if bytes_usage < (head.len() + key.len()) as i64 {
                return Err(Error::InvalidData(format!("bytes_usage {bytes_usage} smaller than header and key")));
            }
            let delta = if doomed { 0 } else { header_size_delta };
            update_status_and_commit(tx, 0, delta, corruption_detected)?;
            Ok(())
        })
        .await
    }

    /// Sum of `bytes_usage` plus the static overhead over live rows with
    /// `from <= last_used < to`.
    pub async fn calculate_size_of_entries_between(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<i64, Error> {
        let (lower, upper) = time_bounds(from, to);
        self.read("calculate_size_of_entries_between", move |conn, _| {
            let mut stmt = conn.prepare_cached(
                "SELECT bytes_usage FROM resources WHERE doomed = 0 AND last_used >= ?1 AND last_used < ?2",
            )?;
            let mut rows = stmt.query(params![lower, upper])?;
            let mut total: i64 = 0;
            while let Some(row) = rows.next()? {
                let bytes_usage: i64 = row.get(0)?;
                total = total.saturating_add(bytes_usage).saturating_add(STATIC_RESOURCE_SIZE);
            }
            Ok(total)
        })
        .await
    }

    /// The live row with the largest `res_id` below `cursor`.
    ///
    /// Rows whose header checksum or key hash do not verify are skipped.
    pub async fn open_next_entry(&self, cursor: ResId) -> Result<Option<EntryInfoWithKey>, Error> {
        let shard_id = self.shard_id();
        self.read("open_next_entry", move |conn, corruption_detected| {
            let mut stmt = conn.prepare_cached(
                "SELECT res_id, last_used, body_end, check_sum, key_hash, cache_key, head FROM resources
                 WHERE res_id < ?1 AND doomed = 0 ORDER BY res_id DESC",
            )?;
            let mut rows = stmt.query(params![cursor.value()])?;
            while let Some(row) = rows.next()? {
                let res_id = ResId(row.get(0)?);
                let check_sum: i64 = row.get(3)?;
                let key_hash: i32 = row.get(4)?;
                let key = CacheEntryKey::new(row.get::<_, String>(5)?);
                let head: Option<Vec<u8>> = row.get(6)?;
                let head = head.unwrap_or_default();

                if key.hash().value() != key_hash || i64::from(calculate_checksum(&head, key.hash())) != check_sum {
                    *corruption_detected = true;
                    tracing::warn!(shard_id, %res_id, "Skipping entry with invalid checksum");
                    continue;
                }
                let last_used = match from_micros(row.get(1)?) {
                    Ok(last_used) => last_used,
                    Err(_) => {
                        *corruption_detected = true;
                        continue;
                    }
                };
                let info = EntryInfo { res_id, last_used, body_end: row.get(2)?, head: Bytes::from(head), opened: true };
                return Ok(Some(EntryInfoWithKey { key, info }));
            }
            Ok(None)
        })
        .await
    }

    /// Every row's id, key hash and doom flag, for building the index.
    pub async fn load_index_rows(&self) -> Result<Vec<IndexRow>, Error> {
        self.read("load_index_rows", |conn, _| {
            let mut stmt = conn.prepare("SELECT res_id, key_hash, doomed FROM resources")?;
            let rows = stmt
                .query_map([], |row| Ok(IndexRow { res_id: ResId(row.get(0)?), key_hash: row.get(1)?, doomed: row.get(2)? }))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreStatus;
    use crate::store::test_support::{now, open_store};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_create_then_open() {
        let dir = TempDir::new().unwrap();
        let (store, _) = open_store(&dir).await;
        let key = CacheEntryKey::new("https://example.com/");
        let created = store.create_entry(key.clone(), now(), true).await.result.unwrap();
        assert!(!created.opened);

        let opened = store.open_entry(key).await.unwrap().unwrap();
        assert!(opened.opened);
        assert_eq!(opened.res_id, created.res_id);
        assert_eq!(opened.body_end, 0);
        assert!(opened.head.is_empty());
    }

    #[tokio::test]
    async fn test_open_missing_is_none() {
        let dir = TempDir::new().unwrap();
        let (store, _) = open_store(&dir).await;
        assert!(store.open_entry(CacheEntryKey::new("missing")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_create_existing_fails() {
        let dir = TempDir::new().unwrap();
        let (store, _) = open_store(&dir).await;
        let key = CacheEntryKey::new("k");
        store.create_entry(key.clone(), now(), true).await.result.unwrap();
        let out = store.create_entry(key, now(), true).await;
        assert!(matches!(out.result, Err(Error::AlreadyExists)));
        assert_eq!(out.status, Some(StoreStatus { entry_count: 1, total_size: 1 }));
    }

    #[tokio::test]
    async fn test_open_or_create() {
        let dir = TempDir::new().unwrap();
        let (store, _) = open_store(&dir).await;
        let key = CacheEntryKey::new("k");
        let first = store.open_or_create_entry(key.clone(), now()).await.result.unwrap();
        assert!(!first.opened);
        let second = store.open_or_create_entry(key, now()).await.result.unwrap();
        assert!(second.opened);
        assert_eq!(first.res_id, second.res_id);
    }

    #[tokio::test]
    async fn test_doom_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let (store, _) = open_store(&dir).await;
        let key = CacheEntryKey::new("key");
        let info = store.create_entry(key.clone(), now(), true).await.result.unwrap();

        let out = store.doom_entry(info.res_id).await;
        out.result.unwrap();
        assert_eq!(out.status, Some(StoreStatus::default()));

        let again = store.doom_entry(info.res_id).await;
        assert!(matches!(again.result, Err(Error::NotFound)));
        assert_eq!(again.status, Some(StoreStatus::default()));
        assert!(store.open_entry(key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_recreate_after_doom_gets_new_res_id() {
        let dir = TempDir::new().unwrap();
        let (store, _) = open_store(&dir).await;
        let key = CacheEntryKey::new("k");
        let first = store.create_entry(key.clone(), now(), true).await.result.unwrap();
        store.doom_entry(first.res_id).await.result.unwrap();
        let second = store.create_entry(key.clone(), now(), true).await.result.unwrap();
        assert_ne!(first.res_id, second.res_id);

        store.delete_doomed_entry(first.res_id).await.result.unwrap();
        let read = store.read_entry_data(key, first.res_id, 0, 4, 0, false).await;
        assert!(matches!(read, Err(Error::NotFound)));
    }

    #[tokio::test]
    async fn test_delete_doomed_requires_doomed() {
        let dir = TempDir::new().unwrap();
        let (store, _) = open_store(&dir).await;
        let info = store.create_entry(CacheEntryKey::new("k"), now(), true).await.result.unwrap();
        let out = store.delete_doomed_entry(info.res_id).await;
        assert!(matches!(out.result, Err(Error::NotFound)));

        store.doom_entry(info.res_id).await.result.unwrap();
        store.delete_doomed_entry(info.res_id).await.result.unwrap();
        let rows = store.load_index_rows().await.unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn test_delete_doomed_entries_skips_live() {
        let dir = TempDir::new().unwrap();
        let (store, _) = open_store(&dir).await;
        let live = store.create_entry(CacheEntryKey::new("live"), now(), true).await.result.unwrap();
        let doomed = store.create_entry(CacheEntryKey::new("doomed"), now(), true).await.result.unwrap();
        store.doom_entry(doomed.res_id).await.result.unwrap();

        let out = store.delete_doomed_entries(vec![live.res_id, doomed.res_id]).await;
        assert_eq!(out.result.unwrap(), 1);
        assert_eq!(out.status, Some(StoreStatus { entry_count: 1, total_size: 4 }));
        let rows = store.load_index_rows().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].res_id, live.res_id);
    }

    #[tokio::test]
    async fn test_delete_live_entry() {
        let dir = TempDir::new().unwrap();
        let (store, _) = open_store(&dir).await;
        let key = CacheEntryKey::new("k");
        let info = store.create_entry(key.clone(), now(), true).await.result.unwrap();
        let out = store.delete_live_entry(key.clone()).await;
        assert_eq!(out.result.unwrap(), vec![DeletedEntry { res_id: info.res_id, key_hash: key.hash().value() }]);
        assert_eq!(out.status, Some(StoreStatus::default()));
        assert!(matches!(store.delete_live_entry(key).await.result, Err(Error::NotFound)));
    }

    #[tokio::test]
    async fn test_delete_between_respects_range_and_exclusions() {
        let dir = TempDir::new().unwrap();
        let (store, _) = open_store(&dir).await;
        let t = |secs| DateTime::from_timestamp(secs, 0).unwrap();
        let old = store.create_entry(CacheEntryKey::new("old"), t(100), true).await.result.unwrap();
        let mid = store.create_entry(CacheEntryKey::new("mid"), t(200), true).await.result.unwrap();
        let kept = store.create_entry(CacheEntryKey::new("kept"), t(250), true).await.result.unwrap();
        let new = store.create_entry(CacheEntryKey::new("new"), t(300), true).await.result.unwrap();

        let excluded = HashSet::from([kept.res_id]);
        let out = store.delete_live_entries_between(t(150), t(300), excluded).await;
        let deleted: Vec<ResId> = out.result.unwrap().iter().map(|d| d.res_id).collect();
        assert_eq!(deleted, vec![mid.res_id]);

        let ids: Vec<ResId> = store.load_index_rows().await.unwrap().into_iter().map(|r| r.res_id).collect();
        assert!(ids.contains(&old.res_id));
        assert!(ids.contains(&kept.res_id));
        assert!(ids.contains(&new.res_id));
        assert_eq!(out.status, Some(StoreStatus { entry_count: 3, total_size: 10 }));
    }

    #[tokio::test]
    async fn test_delete_all_entries() {
        let dir = TempDir::new().unwrap();
        let (store, _) = open_store(&dir).await;
        let a = store.create_entry(CacheEntryKey::new("a"), now(), true).await.result.unwrap();
        let b = store.create_entry(CacheEntryKey::new("b"), now(), true).await.result.unwrap();
        store.doom_entry(b.res_id).await.result.unwrap();

        let out = store.delete_all_entries().await;
        let mut ids: Vec<ResId> = out.result.unwrap().iter().map(|d| d.res_id).collect();
        ids.sort();
        assert_eq!(ids, vec![a.res_id, b.res_id]);
        assert_eq!(out.status, Some(StoreStatus::default()));
    }

    #[tokio::test]
    async fn test_update_last_used() {
        let dir = TempDir::new().unwrap();
        let (store, _) = open_store(&dir).await;
        let key = CacheEntryKey::new("k");
        let t = |secs| DateTime::from_timestamp(secs, 0).unwrap();
        let info = store.create_entry(key.clone(), t(10), true).await.result.unwrap();

        store.update_entry_last_used_by_key(key.clone(), t(20)).await.result.unwrap();
        assert_eq!(store.open_entry(key.clone()).await.unwrap().unwrap().last_used, t(20));

        store.update_entry_last_used_by_res_id(info.res_id, t(30)).await.result.unwrap();
        assert_eq!(store.open_entry(key.clone()).await.unwrap().unwrap().last_used, t(30));

        store.doom_entry(info.res_id).await.result.unwrap();
        assert!(matches!(store.update_entry_last_used_by_res_id(info.res_id, t(40)).await.result, Err(Error::NotFound)));
        assert!(matches!(store.update_entry_last_used_by_key(key, t(40)).await.result, Err(Error::NotFound)));
    }

    #[tokio::test]
    async fn test_update_header() {
        let dir = TempDir::new().unwrap();
        let (store, _) = open_store(&dir).await;
        let key = CacheEntryKey::new("k");
        let info = store.create_entry(key.clone(), now(), true).await.result.unwrap();

        let head = Bytes::from_static(b"header");
        let out = store.update_entry_header_and_last_used(key.clone(), info.res_id, now(), head.clone(), 6).await;
        out.result.unwrap();
        assert_eq!(out.status, Some(StoreStatus { entry_count: 1, total_size: 7 }));

        let opened = store.open_entry(key.clone()).await.unwrap().unwrap();
        assert_eq!(opened.head, head);

        let out = store.update_entry_header_and_last_used(key, info.res_id, now(), Bytes::from_static(b"hi"), -4).await;
        out.result.unwrap();
        assert_eq!(out.status, Some(StoreStatus { entry_count: 1, total_size: 3 }));
    }

    #[tokio::test]
    async fn test_update_header_inconsistent_size_is_invalid_data() {
        let dir = TempDir::new().unwrap();
        let (store, _) = open_store(&dir).await;
        let key = CacheEntryKey::new("k");
        let info = store.create_entry(key.clone(), now(), true).await.result.unwrap();

        let out = store.update_entry_header_and_last_used(key.clone(), info.res_id, now(), Bytes::from_static(b"abc"), 0).await;
        assert!(matches!(out.result, Err(Error::InvalidData(_))));
        assert_eq!(out.status, Some(StoreStatus { entry_count: 1, total_size: 1 }));
        assert!(store.open_entry(key).await.unwrap().unwrap().head.is_empty());
    }

    #[tokio::test]
    async fn test_header_checksum_mismatch() {
        let dir = TempDir::new().unwrap();
        let (store, _) = open_store(&dir).await;
        let key = CacheEntryKey::new("k");
        store.create_entry(key.clone(), now(), true).await.result.unwrap();
        store
            .conn
            .call(|conn| conn.execute("UPDATE resources SET check_sum = check_sum + 1", []))
            .await
            .unwrap();

        assert!(matches!(store.open_entry(key).await, Err(Error::ChecksumError)));
    }

    #[tokio::test]
    async fn test_size_between() {
        let dir = TempDir::new().unwrap();
        let (store, _) = open_store(&dir).await;
        let t = |secs| DateTime::from_timestamp(secs, 0).unwrap();
        store.create_entry(CacheEntryKey::new("aa"), t(100), true).await.result.unwrap();
        store.create_entry(CacheEntryKey::new("bbb"), t(200), true).await.result.unwrap();

        assert_eq!(store.calculate_size_of_entries_between(t(0), t(150)).await.unwrap(), 2 + STATIC_RESOURCE_SIZE);
        assert_eq!(
            store.calculate_size_of_entries_between(DateTime::<Utc>::MIN_UTC, DateTime::<Utc>::MAX_UTC).await.unwrap(),
            5 + 2 * STATIC_RESOURCE_SIZE
        );
    }

    #[tokio::test]
    async fn test_open_next_entry_descends_and_skips_corrupt() {
        let dir = TempDir::new().unwrap();
        let (store, _) = open_store(&dir).await;
        let a = store.create_entry(CacheEntryKey::new("a"), now(), true).await.result.unwrap();
        let b = store.create_entry(CacheEntryKey::new("b"), now(), true).await.result.unwrap();
        let c = store.create_entry(CacheEntryKey::new("c"), now(), true).await.result.unwrap();
        let b_id = b.res_id.value();
        store
            .conn
            .call(move |conn| conn.execute("UPDATE resources SET check_sum = check_sum + 1 WHERE res_id = ?1", [b_id]))
            .await
            .unwrap();

        let first = store.open_next_entry(ResId(i64::MAX)).await.unwrap().unwrap();
        assert_eq!(first.info.res_id, c.res_id);
        assert_eq!(first.key.as_str(), "c");
        let second = store.open_next_entry(first.info.res_id).await.unwrap().unwrap();
        assert_eq!(second.info.res_id, a.res_id);
        assert!(store.open_next_entry(second.info.res_id).await.unwrap().is_none());
    }
}
