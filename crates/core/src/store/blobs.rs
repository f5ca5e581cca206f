//! Body storage as disjoint `[start, end)` blob rows.
//!
//! A write cuts its range out of the existing blobs (re-inserting the parts
//! that survive) and inserts one new blob. Reads stitch overlapping blobs
//! together, zero-filling gaps.

use bytes::{Bytes, BytesMut};
use tokio_rusqlite::{params, rusqlite};

use super::status::update_status_and_commit;
use super::{RangeResult, ResId, ShardStore, WithStatus};
use crate::Error;
use crate::key::{CacheEntryKey, KeyHash, calculate_checksum};

/// A stored blob must hold exactly `end - start` bytes.
fn is_blob_size_valid(start: i64, end: i64, blob: &[u8]) -> bool {
    start >= 0 && end > start && end - start == blob.len() as i64
}

fn verify_blob(start: i64, end: i64, check_sum: i64, blob: &[u8], key_hash: KeyHash) -> Result<(), Error> {
    if !is_blob_size_valid(start, end, blob) {
        return Err(Error::InvalidData(format!("blob [{start}, {end}) holds {} bytes", blob.len())));
    }
    if i64::from(calculate_checksum(blob, key_hash)) != check_sum {
        return Err(Error::ChecksumError);
    }
    Ok(())
}

fn resource_exists(conn: &rusqlite::Connection, res_id: ResId) -> Result<bool, Error> {
    Ok(conn.query_row("SELECT EXISTS(SELECT 1 FROM resources WHERE res_id = ?1)", params![res_id.value()], |row| {
        row.get(0)
    })?)
}

fn insert_blob(
    conn: &rusqlite::Connection, key_hash: KeyHash, res_id: ResId, start: i64, data: &[u8], size_delta: &mut Option<i64>,
) -> Result<(), Error> {
    let end = start + data.len() as i64;
    conn.prepare_cached("INSERT INTO blobs (res_id, start, end, check_sum, blob) VALUES (?1, ?2, ?3, ?4, ?5)")?
        .execute(params![res_id.value(), start, end, i64::from(calculate_checksum(data, key_hash)), data])?;
    *size_delta = size_delta.and_then(|d| d.checked_add(data.len() as i64));
    Ok(())
}

fn subtract(size_delta: &mut Option<i64>, len: i64) {
    *size_delta = size_delta.and_then(|d| d.checked_sub(len));
}

/// Remove `[offset, end)` from the existing blobs, re-inserting the leading
/// part of any partially overlapping blob and, unless truncating, its
/// trailing part.
fn trim_overlapping_blobs(
    conn: &rusqlite::Connection, key_hash: KeyHash, res_id: ResId, offset: i64, end: i64, truncate: bool,
    size_delta: &mut Option<i64>,
) -> Result<(), Error> {
    // A zero-length write cannot contain a blob.
    if offset != end {
        let mut stmt = conn.prepare_cached(
            "DELETE FROM blobs WHERE res_id = ?1 AND start >= ?2 AND end <= ?3 RETURNING start, end",
        )?;
        let mut rows = stmt.query(params![res_id.value(), offset, end])?;
        while let Some(row) = rows.next()? {
            let (start, blob_end): (i64, i64) = (row.get(0)?, row.get(1)?);
            subtract(size_delta, blob_end - start);
        }
    }

    // A zero-length write that does not truncate changes nothing.
    if offset == end && !truncate {
        return Ok(());
    }

    let mut removed = Vec::new();
    let mut survivors: Vec<(i64, Vec<u8>)> = Vec::new();
    {
        let mut stmt = conn.prepare_cached(
            "SELECT blob_id, start, end, check_sum, blob FROM blobs WHERE res_id = ?1 AND start < ?2 AND end > ?3",
        )?;
        let mut rows = stmt.query(params![res_id.value(), end, offset])?;
        while let Some(row) = rows.next()? {
            let blob_id: i64 = row.get(0)?;
            let blob_start: i64 = row.get(1)?;
            let blob_end: i64 = row.get(2)?;
            let check_sum: i64 = row.get(3)?;
            let blob: Vec<u8> = row.get(4)?;
            verify_blob(blob_start, blob_end, check_sum, &blob, key_hash)?;

            removed.push(blob_id);
            if blob_start < offset {
                survivors.push((blob_start, blob[..(offset - blob_start) as usize].to_vec()));
            }
            if !truncate && end < blob_end {
                survivors.push((end, blob[(end - blob_start) as usize..].to_vec()));
            }
        }
    }

    for blob_id in removed {
        let mut stmt = conn.prepare_cached("DELETE FROM blobs WHERE blob_id = ?1 RETURNING start, end")?;
        let mut rows = stmt.query(params![blob_id])?;
        let Some(row) = rows.next()? else {
            return Err(Error::NotFound);
        };
        let (start, blob_end): (i64, i64) = (row.get(0)?, row.get(1)?);
        subtract(size_delta, blob_end - start);
    }

    for (start, data) in survivors {
        insert_blob(conn, key_hash, res_id, start, &data, size_delta)?;
    }
    Ok(())
}

fn truncate_blobs_after(
    conn: &rusqlite::Connection, res_id: ResId, truncate_offset: i64, size_delta: &mut Option<i64>,
) -> Result<(), Error> {
    let mut stmt = conn.prepare_cached("DELETE FROM blobs WHERE res_id = ?1 AND start >= ?2 RETURNING start, end")?;
    let mut rows = stmt.query(params![res_id.value(), truncate_offset])?;
    while let Some(row) = rows.next()? {
        let (start, end): (i64, i64) = (row.get(0)?, row.get(1)?);
        subtract(size_delta, end - start);
    }
    Ok(())
}

/// Blobs overlapping `[offset, end)`, ordered by start.
fn overlapping_blobs(
    conn: &rusqlite::Connection, res_id: ResId, offset: i64, end: i64,
) -> Result<Vec<(i64, i64, i64, Vec<u8>)>, Error> {
    let mut stmt = conn.prepare_cached(
        "SELECT start, end, check_sum, blob FROM blobs WHERE res_id = ?1 AND start < ?2 AND end > ?3 ORDER BY start",
    )?;
    let blobs = stmt
        .query_map(params![res_id.value(), end, offset], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(blobs)
}

impl ShardStore {
    /// Write `data` at `offset` into the body of `res_id`.
    ///
    /// `old_body_end` is the caller's view of the current body length; the
    /// stored value must agree or the write fails with `BodyEndMismatch`.
    /// With `truncate` the body ends at `offset + data.len()`.
    pub async fn write_entry_data(
        &self, key: CacheEntryKey, res_id: ResId, old_body_end: i64, offset: i64, data: Bytes, truncate: bool,
    ) -> WithStatus<()> {
        self.write("write_entry_data", move |conn, corruption_detected| {
            let write_end = offset.checked_add(data.len() as i64);
            let write_end = match write_end {
                Some(write_end) if old_body_end >= 0 && offset >= 0 => write_end,
                _ => return Err(Error::InvalidArgument(format!("offset {offset} len {} body_end {old_body_end}", data.len()))),
            };
            let new_body_end = if truncate { write_end } else { write_end.max(old_body_end) };
            let body_end_delta = new_body_end - old_body_end;
            let key_hash = key.hash();

            let tx = conn.transaction().map_err(|_| Error::FailedToStartTransaction)?;
            let mut size_delta = Some(0);

            if offset < old_body_end {
                trim_overlapping_blobs(&tx, key_hash, res_id, offset, write_end, truncate, &mut size_delta)?;
            }
            if body_end_delta < 0 {
                truncate_blobs_after(&tx, res_id, new_body_end, &mut size_delta)?;
            }
            if !data.is_empty() {
                insert_blob(&tx, key_hash, res_id, offset, &data, &mut size_delta)?;
            }

            let Some(mut size_delta) = size_delta else {
                return Err(Error::InvalidData("blob size delta overflowed".into()));
            };

            // Runs even when both deltas are zero so the stored body_end is
            // always checked.
            {
                let mut stmt = tx.prepare_cached(
                    "UPDATE resources SET body_end = body_end + ?1, bytes_usage = bytes_usage + ?2
                     WHERE res_id = ?3 RETURNING body_end, doomed",
                )?;
                let mut rows = stmt.query(params![body_end_delta, size_delta, res_id.value()])?;
                let Some(row) = rows.next()? else {
                    return Err(Error::NotFound);
                };
                let stored: i64 = row.get(0)?;
                let doomed: bool = row.get(1)?;
                if stored != new_body_end {
                    return Err(Error::BodyEndMismatch { expected: new_body_end, stored });
                }
                // Doomed rows are already out of the aggregates.
                if doomed {
                    size_delta = 0;
                }
            }

            update_status_and_commit(tx, 0, size_delta, corruption_detected)?;
            Ok(())
        })
        .await
    }

    /// Read up to `len` bytes at `offset`.
    ///
    /// Gaps are zero-filled up to `body_end`; in `sparse` mode the read stops
    /// at the first gap instead. The returned buffer holds exactly the bytes
    /// read.
    pub async fn read_entry_data(
        &self, key: CacheEntryKey, res_id: ResId, offset: i64, len: usize, body_end: i64, sparse: bool,
    ) -> Result<Bytes, Error> {
        self.read("read_entry_data", move |conn, _| {
            if offset < 0 {
                return Err(Error::InvalidArgument(format!("negative offset {offset}")));
            }
            if !resource_exists(conn, res_id)? {
                return Err(Error::NotFound);
            }
            let len = i64::try_from(len)
                .map_err(|_| Error::InvalidArgument(format!("read length {len} out of range")))?
                .min(i64::MAX - offset);
            let read_end = offset + len;

            // Never more than the body holds, whatever the caller asked for.
            let expected = (body_end - offset).clamp(0, len);
            let mut buffer = BytesMut::with_capacity(expected as usize);
            for (blob_start, blob_end, check_sum, blob) in overlapping_blobs(conn, res_id, offset, read_end)? {
                verify_blob(blob_start, blob_end, check_sum, &blob, key.hash())?;
                let copy_start = offset.max(blob_start);
                let copy_end = read_end.min(blob_end);
                let pos = (copy_start - offset) as usize;
                if buffer.len() < pos {
                    if sparse {
                        return Ok(buffer.freeze());
                    }
                    buffer.resize(pos, 0);
                }
                buffer.extend_from_slice(&blob[(copy_start - blob_start) as usize..(copy_end - blob_start) as usize]);
            }

            if !sparse && buffer.len() < expected as usize {
                buffer.resize(expected as usize, 0);
            }
            Ok(buffer.freeze())
        })
        .await
    }

    /// The first contiguous stored range within `[offset, offset + len)`,
    /// or a zero-length range at `offset` if nothing is stored there.
    pub async fn get_entry_available_range(&self, res_id: ResId, offset: i64, len: i64) -> Result<RangeResult, Error> {
        self.read("get_entry_available_range", move |conn, _| {
            if offset < 0 || len < 0 {
                return Err(Error::InvalidArgument(format!("offset {offset} len {len}")));
            }
            let end = offset + len.min(i64::MAX - offset);
            let mut stmt = conn.prepare_cached(
                "SELECT start, end FROM blobs WHERE res_id = ?1 AND start < ?2 AND end > ?3 ORDER BY start",
            )?;
            let mut rows = stmt.query(params![res_id.value(), end, offset])?;

            let mut available: Option<(i64, i64)> = None;
            while let Some(row) = rows.next()? {
                let (blob_start, blob_end): (i64, i64) = (row.get(0)?, row.get(1)?);
                match available {
                    None => available = Some((blob_start.max(offset), blob_end.min(end))),
                    Some((start, available_end)) if available_end == blob_start => {
                        available = Some((start, blob_end.min(end)));
                    }
                    Some(_) => break,
                }
            }
            Ok(match available {
                Some((start, available_end)) => RangeResult { start, len: available_end - start },
                None => RangeResult { start: offset, len: 0 },
            })
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_support::{now, open_store};
    use crate::store::{EntryInfo, StoreStatus};
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        store: ShardStore,
        key: CacheEntryKey,
        info: EntryInfo,
    }

    async fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let (store, _) = open_store(&dir).await;
        let key = CacheEntryKey::new("body");
        let info = store.create_entry(key.clone(), now(), true).await.result.unwrap();
        Fixture { _dir: dir, store, key, info }
    }

    impl Fixture {
        async fn write(&self, old_body_end: i64, offset: i64, data: &[u8], truncate: bool) -> WithStatus<()> {
            self.store
                .write_entry_data(self.key.clone(), self.info.res_id, old_body_end, offset, Bytes::copy_from_slice(data), truncate)
                .await
        }

        async fn read(&self, offset: i64, len: usize, body_end: i64, sparse: bool) -> Bytes {
            self.store.read_entry_data(self.key.clone(), self.info.res_id, offset, len, body_end, sparse).await.unwrap()
        }

        async fn body_end(&self) -> i64 {
            self.store.open_entry(self.key.clone()).await.unwrap().unwrap().body_end
        }
    }

    #[tokio::test]
    async fn test_overlapping_writes() {
        let f = fixture().await;
        let a = vec![b'A'; 100];
        let b = vec![b'B'; 100];
        f.write(0, 0, &a, false).await.result.unwrap();
        let out = f.write(100, 50, &b, false).await;
        out.result.unwrap();
        assert_eq!(f.body_end().await, 150);

        let data = f.read(0, 150, 150, false).await;
        let mut expected = a[..50].to_vec();
        expected.extend_from_slice(&b);
        assert_eq!(&data[..], &expected[..]);
        // key (4) + 150 body bytes
        assert_eq!(out.status, Some(StoreStatus { entry_count: 1, total_size: 154 }));
    }

    #[tokio::test]
    async fn test_write_inside_existing_blob_keeps_both_ends() {
        let f = fixture().await;
        f.write(0, 0, b"0123456789", false).await.result.unwrap();
        f.write(10, 3, b"xyz", false).await.result.unwrap();
        assert_eq!(&f.read(0, 10, 10, false).await[..], b"012xyz6789");
        assert_eq!(f.body_end().await, 10);
    }

    #[tokio::test]
    async fn test_write_covering_several_blobs() {
        let f = fixture().await;
        f.write(0, 0, b"aaaa", false).await.result.unwrap();
        f.write(4, 4, b"bbbb", false).await.result.unwrap();
        f.write(8, 8, b"cccc", false).await.result.unwrap();
        f.write(12, 2, b"XXXXXXXX", false).await.result.unwrap();
        assert_eq!(&f.read(0, 12, 12, false).await[..], b"aaXXXXXXXXcc");
    }

    #[tokio::test]
    async fn test_truncating_write_shrinks_body() {
        let f = fixture().await;
        f.write(0, 0, b"0123456789", false).await.result.unwrap();
        let out = f.write(10, 2, b"ab", true).await;
        out.result.unwrap();
        assert_eq!(f.body_end().await, 4);
        assert_eq!(&f.read(0, 10, 4, false).await[..], b"01ab");
        assert_eq!(out.status, Some(StoreStatus { entry_count: 1, total_size: 8 }));
    }

    #[tokio::test]
    async fn test_zero_length_truncate() {
        let f = fixture().await;
        f.write(0, 0, b"0123456789", false).await.result.unwrap();
        f.write(10, 5, b"", true).await.result.unwrap();
        assert_eq!(f.body_end().await, 5);
        assert_eq!(&f.read(0, 10, 5, false).await[..], b"01234");
    }

    #[tokio::test]
    async fn test_zero_fill_gap() {
        let f = fixture().await;
        f.write(0, 0, b"ab", false).await.result.unwrap();
        f.write(2, 6, b"cd", false).await.result.unwrap();
        assert_eq!(f.body_end().await, 8);
        assert_eq!(&f.read(0, 8, 8, false).await[..], b"ab\0\0\0\0cd");
        assert_eq!(&f.read(2, 4, 8, false).await[..], &[0u8; 4]);
    }

    #[tokio::test]
    async fn test_zero_fill_up_to_body_end_only() {
        let f = fixture().await;
        f.write(0, 0, b"abc", false).await.result.unwrap();
        f.write(3, 5, b"", false).await.result.unwrap();
        assert_eq!(f.body_end().await, 5);
        assert_eq!(&f.read(0, 100, 5, false).await[..], b"abc\0\0");
    }

    #[tokio::test]
    async fn test_sparse_read_stops_at_gap() {
        let f = fixture().await;
        f.write(0, 0, b"ab", false).await.result.unwrap();
        f.write(2, 6, b"cd", false).await.result.unwrap();
        assert_eq!(&f.read(0, 8, 8, true).await[..], b"ab");
        assert!(f.read(2, 6, 8, true).await.is_empty());
        assert_eq!(&f.read(6, 2, 8, true).await[..], b"cd");
    }

    #[tokio::test]
    async fn test_available_range() {
        let f = fixture().await;
        f.write(0, 10, b"0123456789", false).await.result.unwrap();
        f.write(20, 25, b"abc", false).await.result.unwrap();
        let store = &f.store;
        let res_id = f.info.res_id;

        assert_eq!(store.get_entry_available_range(res_id, 0, 100).await.unwrap(), RangeResult { start: 10, len: 10 });
        assert_eq!(store.get_entry_available_range(res_id, 15, 2).await.unwrap(), RangeResult { start: 15, len: 2 });
        assert_eq!(store.get_entry_available_range(res_id, 20, 10).await.unwrap(), RangeResult { start: 25, len: 3 });
        assert_eq!(store.get_entry_available_range(res_id, 0, 5).await.unwrap(), RangeResult { start: 0, len: 0 });
    }

    #[tokio::test]
    async fn test_available_range_joins_contiguous_blobs() {
        let f = fixture().await;
        f.write(0, 0, b"aaaa", false).await.result.unwrap();
        f.write(4, 4, b"bbbb", false).await.result.unwrap();
        let range = f.store.get_entry_available_range(f.info.res_id, 2, 100).await.unwrap();
        assert_eq!(range, RangeResult { start: 2, len: 6 });
    }

    #[tokio::test]
    async fn test_body_end_mismatch_rolls_back() {
        let f = fixture().await;
        f.write(0, 0, b"abcd", false).await.result.unwrap();
        let out = f.write(2, 4, b"zz", false).await;
        assert!(matches!(out.result, Err(Error::BodyEndMismatch { expected: 6, stored: 8 })));
        assert_eq!(f.body_end().await, 4);
        assert_eq!(&f.read(0, 4, 4, false).await[..], b"abcd");
        assert_eq!(out.status, Some(StoreStatus { entry_count: 1, total_size: 8 }));
    }

    #[tokio::test]
    async fn test_stale_body_end_detected_without_size_change() {
        let f = fixture().await;
        f.write(0, 0, b"abcd", false).await.result.unwrap();
        // Same-size overwrite with a stale body end.
        let out = f.write(6, 0, b"xy", false).await;
        assert!(matches!(out.result, Err(Error::BodyEndMismatch { expected: 6, stored: 4 })));
        assert_eq!(&f.read(0, 4, 4, false).await[..], b"abcd");

        f.write(4, 4, b"efghij", false).await.result.unwrap();
        // Truncate to the caller's stale end, which leaves nothing to delete.
        let out = f.write(4, 4, b"", true).await;
        assert!(matches!(out.result, Err(Error::BodyEndMismatch { expected: 4, stored: 10 })));
        assert_eq!(f.body_end().await, 10);
        assert_eq!(&f.read(0, 10, 10, false).await[..], b"abcdefghij");
    }

    #[tokio::test]
    async fn test_oversized_read_length() {
        let f = fixture().await;
        f.write(0, 0, b"0123456789", false).await.result.unwrap();

        let huge = f.store.read_entry_data(f.key.clone(), f.info.res_id, 0, usize::MAX, 10, false).await;
        assert!(matches!(huge, Err(Error::InvalidArgument(_))));
        assert_eq!(&f.read(0, 1 << 40, 10, false).await[..], b"0123456789");
        assert_eq!(&f.read(4, 1 << 40, 10, true).await[..], b"456789");
        assert!(f.read(20, 1 << 40, 10, false).await.is_empty());
    }

    #[tokio::test]
    async fn test_blob_checksum_error() {
        let f = fixture().await;
        f.write(0, 0, b"abcd", false).await.result.unwrap();
        f.store.conn.call(|conn| conn.execute("UPDATE blobs SET check_sum = check_sum + 1", [])).await.unwrap();

        let read = f.store.read_entry_data(f.key.clone(), f.info.res_id, 0, 4, 4, false).await;
        assert!(matches!(read, Err(Error::ChecksumError)));
        let write = f.write(4, 2, b"x", false).await;
        assert!(matches!(write.result, Err(Error::ChecksumError)));
    }

    #[tokio::test]
    async fn test_blob_size_mismatch_is_invalid_data() {
        let f = fixture().await;
        f.write(0, 0, b"abcd", false).await.result.unwrap();
        f.store.conn.call(|conn| conn.execute("UPDATE blobs SET end = 5", [])).await.unwrap();

        let read = f.store.read_entry_data(f.key.clone(), f.info.res_id, 0, 4, 4, false).await;
        assert!(matches!(read, Err(Error::InvalidData(_))));
    }

    #[tokio::test]
    async fn test_write_to_doomed_entry_keeps_aggregates() {
        let f = fixture().await;
        f.store.doom_entry(f.info.res_id).await.result.unwrap();
        let out = f.write(0, 0, b"abcdef", false).await;
        out.result.unwrap();
        assert_eq!(out.status, Some(StoreStatus::default()));
        assert_eq!(&f.read(0, 6, 6, false).await[..], b"abcdef");
    }

    #[tokio::test]
    async fn test_write_to_missing_entry() {
        let f = fixture().await;
        let out = f.store.write_entry_data(f.key.clone(), ResId(9_999), 0, 0, Bytes::from_static(b"x"), false).await;
        assert!(out.result.is_err());
    }

    #[tokio::test]
    async fn test_invalid_arguments() {
        let f = fixture().await;
        assert!(matches!(f.write(0, -1, b"x", false).await.result, Err(Error::InvalidArgument(_))));
        assert!(matches!(f.write(-1, 0, b"x", false).await.result, Err(Error::InvalidArgument(_))));
        assert!(matches!(f.write(0, i64::MAX, b"xy", false).await.result, Err(Error::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn test_round_trip_random_overlaps() {
        let f = fixture().await;
        let mut model: Vec<u8> = Vec::new();
        let writes: &[(i64, usize, bool)] =
            &[(0, 40, false), (10, 5, false), (35, 20, false), (5, 3, true), (0, 0, false), (20, 30, false), (22, 2, false)];
        for (i, &(offset, len, truncate)) in writes.iter().enumerate() {
            let data: Vec<u8> = (0..len).map(|j| (i * 31 + j) as u8).collect();
            let old_end = model.len() as i64;
            f.write(old_end, offset, &data, truncate).await.result.unwrap();

            let write_end = offset as usize + len;
            if model.len() < write_end {
                model.resize(write_end, 0);
            }
            model[offset as usize..write_end].copy_from_slice(&data);
            if truncate {
                model.truncate(write_end);
            }

            assert_eq!(&f.read(offset, len, model.len() as i64, false).await[..], &data[..]);
        }
        assert_eq!(f.body_end().await, model.len() as i64);
        assert_eq!(&f.read(0, model.len(), model.len() as i64, false).await[..], &model[..]);
    }
}
