//! Aggregate counter maintenance.
//!
//! `entry_count` and `total_size` are kept in the `meta` table and updated
//! incrementally in the same transaction as the rows they describe. Whenever
//! the arithmetic overflows or yields an out-of-range value, both counters are
//! recomputed from the live rows instead; that scan is the only recovery path.

use tokio_rusqlite::rusqlite::{self, Transaction};

use super::StoreStatus;
use super::migrations::{META_ENTRY_COUNT, META_TOTAL_SIZE, get_meta, set_meta};
use crate::Error;

/// Upper bound of a sane entry count.
const MAX_ENTRY_COUNT: i64 = i32::MAX as i64;

pub(crate) fn calculate_entry_count(conn: &rusqlite::Connection) -> Result<i64, Error> {
    Ok(conn.query_row("SELECT COUNT(*) FROM resources WHERE doomed = 0", [], |row| row.get(0))?)
}

pub(crate) fn calculate_total_size(conn: &rusqlite::Connection) -> Result<i64, Error> {
    // SUM() switches to floating point on overflow; TOTAL keeps that explicit.
    let total: f64 = conn.query_row("SELECT TOTAL(bytes_usage) FROM resources WHERE doomed = 0", [], |row| row.get(0))?;
    Ok(if total >= i64::MAX as f64 { i64::MAX } else { total as i64 })
}

pub(crate) fn load_status(conn: &rusqlite::Connection) -> Result<StoreStatus, Error> {
    let entry_count = get_meta(conn, META_ENTRY_COUNT)?.unwrap_or(0);
    let total_size = get_meta(conn, META_TOTAL_SIZE)?.unwrap_or(0);
    Ok(StoreStatus { entry_count, total_size })
}

fn is_valid(status: &StoreStatus) -> bool {
    (0..=MAX_ENTRY_COUNT).contains(&status.entry_count) && status.total_size >= 0
}

fn store(conn: &rusqlite::Connection, status: &StoreStatus) -> Result<(), Error> {
    set_meta(conn, META_ENTRY_COUNT, status.entry_count)?;
    set_meta(conn, META_TOTAL_SIZE, status.total_size)?;
    Ok(())
}

/// Load the counters at startup, initializing missing ones and recomputing
/// corrupted ones. The flag is true when a recomputation was needed.
pub(crate) fn initialize(conn: &mut rusqlite::Connection) -> Result<(StoreStatus, bool), Error> {
    let tx = conn.transaction().map_err(|_| Error::FailedToStartTransaction)?;
    let stored_count = get_meta(&tx, META_ENTRY_COUNT).map_err(|_| Error::FailedToInitializeMetaTable)?;
    let stored_size = get_meta(&tx, META_TOTAL_SIZE).map_err(|_| Error::FailedToInitializeMetaTable)?;

    match (stored_count, stored_size) {
        (Some(entry_count), Some(total_size)) => {
            let status = StoreStatus { entry_count, total_size };
            if is_valid(&status) {
                return Ok((status, false));
            }
            recalculate_status_and_commit(tx).map(|status| (status, true))
        }
        _ => {
            let status = StoreStatus::default();
            store(&tx, &status).map_err(|_| Error::FailedToInitializeMetaTable)?;
            tx.commit().map_err(|_| Error::FailedToCommitTransaction)?;
            Ok((status, false))
        }
    }
}

/// Apply the deltas to the stored counters and commit.
///
/// An overflow or out-of-range result sets `corruption_detected` and falls
/// back to recomputing both counters from the table.
pub(crate) fn update_status_and_commit(
    tx: Transaction<'_>, entry_count_delta: i64, total_size_delta: i64, corruption_detected: &mut bool,
) -> Result<StoreStatus, Error> {
    if entry_count_delta == 0 && total_size_delta == 0 {
        let status = load_status(&tx)?;
        tx.commit().map_err(|_| Error::FailedToCommitTransaction)?;
        return Ok(status);
    }

    let stored = load_status(&tx)?;
    let updated = stored.entry_count.checked_add(entry_count_delta).zip(stored.total_size.checked_add(total_size_delta));
    let status = match updated {
        Some((entry_count, total_size)) if is_valid(&StoreStatus { entry_count, total_size }) => {
            StoreStatus { entry_count, total_size }
        }
        _ => {
            *corruption_detected = true;
            StoreStatus { entry_count: calculate_entry_count(&tx)?, total_size: calculate_total_size(&tx)? }
        }
    };
    store(&tx, &status)?;

    tx.commit().map_err(|_| Error::FailedToCommitTransaction)?;
    Ok(status)
}

/// Recompute both counters from the live rows and commit.
pub(crate) fn recalculate_status_and_commit(tx: Transaction<'_>) -> Result<StoreStatus, Error> {
    let status = StoreStatus { entry_count: calculate_entry_count(&tx)?, total_size: calculate_total_size(&tx)? };
    store(&tx, &status)?;
    tx.commit().map_err(|_| Error::FailedToCommitTransaction)?;
    Ok(status)
}
