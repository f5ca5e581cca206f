//! Shard database schema migrations.
//!
//! The schema version lives in the `meta` table next to the aggregate
//! counters. A database older than [`LOWEST_SUPPORTED_VERSION`], or one
//! written by a newer build that declares it incompatible, is razed and
//! recreated from scratch.

use tokio_rusqlite::{Connection, params, rusqlite};

use crate::Error;

/// Migration list: (version, SQL).
///
/// Applied in order inside one transaction. Every statement uses
/// `IF NOT EXISTS`.
const MIGRATIONS: &[(i64, &str)] = &[
    (1, include_str!("../../migrations/001_resources.sql")),
    (2, include_str!("../../migrations/002_indexes.sql")),
];

pub const CURRENT_VERSION: i64 = 2;
pub const LOWEST_SUPPORTED_VERSION: i64 = 1;
/// Oldest build able to read a database written by this one.
pub const COMPATIBLE_VERSION: i64 = 1;

pub(crate) const META_VERSION: &str = "version";
pub(crate) const META_LAST_COMPATIBLE_VERSION: &str = "last_compatible_version";
pub(crate) const META_ENTRY_COUNT: &str = "entry_count";
pub(crate) const META_TOTAL_SIZE: &str = "total_size";

const CREATE_META: &str = "CREATE TABLE IF NOT EXISTS meta (key TEXT NOT NULL PRIMARY KEY, value INTEGER NOT NULL)";

pub(crate) fn get_meta(conn: &rusqlite::Connection, key: &str) -> Result<Option<i64>, rusqlite::Error> {
    match conn.query_row("SELECT value FROM meta WHERE key = ?1", params![key], |row| row.get(0)) {
        Ok(value) => Ok(Some(value)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e),
    }
}

pub(crate) fn set_meta(conn: &rusqlite::Connection, key: &str, value: i64) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT INTO meta (key, value) VALUES (?1, ?2) ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![key, value],
    )?;
    Ok(())
}

fn is_incompatible(conn: &rusqlite::Connection) -> Result<bool, rusqlite::Error> {
    let Some(version) = get_meta(conn, META_VERSION)? else {
        return Ok(false);
    };
    let last_compatible = get_meta(conn, META_LAST_COMPATIBLE_VERSION)?.unwrap_or(version);
    Ok(version < LOWEST_SUPPORTED_VERSION || last_compatible > CURRENT_VERSION)
}

/// Drop every user table (indexes go with them).
pub(crate) fn raze(conn: &rusqlite::Connection) -> Result<(), rusqlite::Error> {
    let tables = {
        let mut stmt =
            conn.prepare("SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%'")?;
        stmt.query_map([], |row| row.get::<_, String>(0))?.collect::<Result<Vec<_>, _>>()?
    };
    conn.execute_batch("PRAGMA foreign_keys=OFF;")?;
    let dropped = tables
        .iter()
        .try_for_each(|name| conn.execute_batch(&format!("DROP TABLE IF EXISTS \"{}\";", name.replace('"', "\"\""))));
    conn.execute_batch("PRAGMA foreign_keys=ON;")?;
    dropped
}

/// Run any pending migrations, razing an incompatible database first.
///
/// # Errors
///
/// Returns `FailedToInitializeMetaTable` if the meta table cannot be read,
/// `FailedToRazeIncompatibleDatabase` if razing fails, and
/// `FailedToInitializeSchema` if a migration fails to apply.
pub async fn run(conn: &Connection) -> Result<(), Error> {
    conn.call(|conn| -> Result<(), Error> {
        conn.execute(CREATE_META, []).map_err(|_| Error::FailedToInitializeMetaTable)?;

        if is_incompatible(conn).map_err(|_| Error::FailedToInitializeMetaTable)? {
            tracing::warn!("Razing incompatible cache database");
            raze(conn).map_err(|_| Error::FailedToRazeIncompatibleDatabase)?;
            conn.execute(CREATE_META, []).map_err(|_| Error::FailedToInitializeMetaTable)?;
        }

        let tx = conn.transaction().map_err(|_| Error::FailedToStartTransaction)?;
        let current = get_meta(&tx, META_VERSION).map_err(|_| Error::FailedToInitializeMetaTable)?.unwrap_or(0);

        for (version, sql) in MIGRATIONS {
            if *version > current {
                tx.execute_batch(sql).map_err(|e| Error::FailedToInitializeSchema(e.to_string()))?;
                set_meta(&tx, META_VERSION, *version).map_err(|_| Error::FailedToInitializeMetaTable)?;
            }
        }
        set_meta(&tx, META_LAST_COMPATIBLE_VERSION, COMPATIBLE_VERSION)
            .map_err(|_| Error::FailedToInitializeMetaTable)?;

        tx.commit().map_err(|_| Error::FailedToCommitTransaction)
    })
    .await
    .map_err(Error::from)
}
