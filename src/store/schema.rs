//! Table layout, the `meta` version table and schema upgrades.

use crate::error::StorageResult;
use rusqlite::{Connection, OptionalExtension, params};
use tracing::info;

pub const CURRENT_VERSION: i64 = 6;
/// Oldest reader that can still open a `CURRENT_VERSION` file.
pub const COMPATIBLE_VERSION: i64 = 6;
/// At or below this version a file is razed instead of upgraded.
pub const DEPRECATED_VERSION: i64 = 0;

const VERSION_KEY: &str = "version";
const COMPATIBLE_KEY: &str = "last_compatible_version";

const VALUES_MAPPING_SQL: &str = "CREATE TABLE IF NOT EXISTS values_mapping(\
    context_origin TEXT NOT NULL,\
    key BLOB NOT NULL,\
    value BLOB NOT NULL,\
    last_used_time INTEGER NOT NULL,\
    PRIMARY KEY(context_origin,key)) WITHOUT ROWID";

// num_bytes includes expired rows that have not been purged yet.
const PER_ORIGIN_MAPPING_SQL: &str = "CREATE TABLE IF NOT EXISTS per_origin_mapping(\
    context_origin TEXT NOT NULL PRIMARY KEY,\
    creation_time INTEGER NOT NULL,\
    num_bytes INTEGER NOT NULL) WITHOUT ROWID";

const BUDGET_MAPPING_SQL: &str = "CREATE TABLE IF NOT EXISTS budget_mapping(\
    id INTEGER NOT NULL PRIMARY KEY,\
    context_site TEXT NOT NULL,\
    time_stamp INTEGER NOT NULL,\
    bits_debit REAL NOT NULL)";

const SITE_TIME_INDEX_SQL: &str = "CREATE INDEX IF NOT EXISTS budget_mapping_site_time_stamp_idx \
    ON budget_mapping(context_site,time_stamp)";
const LAST_USED_INDEX_SQL: &str = "CREATE INDEX IF NOT EXISTS values_mapping_last_used_time_idx \
    ON values_mapping(last_used_time)";
const CREATION_TIME_INDEX_SQL: &str = "CREATE INDEX IF NOT EXISTS per_origin_mapping_creation_time_idx \
    ON per_origin_mapping(creation_time)";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetaVersion {
    pub version: i64,
    pub compatible_version: i64,
}

/// Creates the `meta` table on first use and returns the recorded versions.
/// A fresh table is stamped with the given versions.
pub fn init_meta(conn: &Connection, version: i64, compatible: i64) -> StorageResult<MetaVersion> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS meta(key TEXT NOT NULL PRIMARY KEY, value INTEGER NOT NULL)",
    )?;
    let Some(recorded) = read_meta(conn, VERSION_KEY)? else {
        write_versions(conn, version, compatible)?;
        return Ok(MetaVersion {
            version,
            compatible_version: compatible,
        });
    };
    let compatible_version = read_meta(conn, COMPATIBLE_KEY)?.unwrap_or(recorded);
    Ok(MetaVersion {
        version: recorded,
        compatible_version,
    })
}

fn read_meta(conn: &Connection, key: &str) -> StorageResult<Option<i64>> {
    let value = conn
        .prepare_cached("SELECT value FROM meta WHERE key=?1")?
        .query_row([key], |row| row.get::<_, i64>(0))
        .optional()?;
    Ok(value)
}

pub fn write_versions(conn: &Connection, version: i64, compatible: i64) -> StorageResult<()> {
    let mut stmt = conn.prepare_cached("INSERT OR REPLACE INTO meta(key,value) VALUES(?1,?2)")?;
    stmt.execute(params![VERSION_KEY, version])?;
    stmt.execute(params![COMPATIBLE_KEY, compatible])?;
    Ok(())
}

/// Creates any missing table. Indexes are only added once the file's version
/// has reached the one that introduced them; upgrades add them otherwise.
pub fn create_tables(conn: &Connection, version: i64) -> StorageResult<()> {
    conn.execute_batch(VALUES_MAPPING_SQL)?;
    conn.execute_batch(PER_ORIGIN_MAPPING_SQL)?;
    conn.execute_batch(BUDGET_MAPPING_SQL)?;
    if version >= 4 {
        conn.execute_batch(SITE_TIME_INDEX_SQL)?;
    }
    if version >= 2 {
        conn.execute_batch(LAST_USED_INDEX_SQL)?;
        conn.execute_batch(CREATION_TIME_INDEX_SQL)?;
    }
    Ok(())
}

/// Moves an older on-disk layout forward to [`CURRENT_VERSION`].
///
/// Runs inside the initialization transaction. `Ok(false)` means the file
/// cannot be upgraded and is razed by the caller; the caller also records
/// the new version once this returns `Ok(true)`.
pub trait SchemaUpgrade: Send {
    fn upgrade(&self, conn: &Connection, from_version: i64) -> StorageResult<bool>;
}

/// Knows the v4 (`length` entry counter) and v5 (`length` plus `num_bytes`)
/// layouts of `per_origin_mapping`.
#[derive(Debug, Default, Clone, Copy)]
pub struct StandardUpgrade;

impl SchemaUpgrade for StandardUpgrade {
    fn upgrade(&self, conn: &Connection, from_version: i64) -> StorageResult<bool> {
        if from_version < 4 {
            return Ok(false);
        }
        let mut version = from_version;
        if version == 4 {
            conn.execute_batch(
                "ALTER TABLE per_origin_mapping ADD COLUMN num_bytes INTEGER NOT NULL DEFAULT 0;\
                 UPDATE per_origin_mapping SET num_bytes=COALESCE((\
                   SELECT SUM(LENGTH(v.key)+LENGTH(v.value)) FROM values_mapping v \
                   WHERE v.context_origin=per_origin_mapping.context_origin),0)",
            )?;
            version = 5;
        }
        if version == 5 {
            if has_column(conn, "per_origin_mapping", "length")? {
                conn.execute_batch("ALTER TABLE per_origin_mapping DROP COLUMN length")?;
            }
            version = 6;
        }
        if version == CURRENT_VERSION {
            create_tables(conn, version)?;
            info!(from_version, to_version = version, "shared storage schema upgraded");
        }
        Ok(version == CURRENT_VERSION)
    }
}

fn has_column(conn: &Connection, table: &str, column: &str) -> StorageResult<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let names = stmt.query_map([], |row| row.get::<_, String>(1))?;
    for name in names {
        if name? == column {
            return Ok(true);
        }
    }
    Ok(false)
}
