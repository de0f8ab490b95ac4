//! Per-origin byte accounting and quota checks.
//!
//! `per_origin_mapping.num_bytes` is a cached total that still includes
//! expired rows until they are purged. Writes first consult that cache and
//! only fall back to a live recount when the cache says the quota is full.

use crate::error::StorageResult;
use crate::store::StoreContext;
use rusqlite::{OptionalExtension, params};
use tracing::debug;

/// Cached `(creation_time, num_bytes)` for one origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OriginAccount {
    pub creation_time: i64,
    pub num_bytes: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeStats {
    pub rows: usize,
    pub origins: usize,
}

#[derive(Clone, Copy)]
pub struct CapacityGuard<'a> {
    ctx: StoreContext<'a>,
}

impl<'a> CapacityGuard<'a> {
    pub fn new(ctx: StoreContext<'a>) -> Self {
        Self { ctx }
    }

    fn max_bytes(&self) -> i64 {
        self.ctx.config.max_bytes_per_origin as i64
    }

    pub fn account(&self, origin: &str) -> StorageResult<Option<OriginAccount>> {
        let account = self
            .ctx
            .conn()?
            .prepare_cached(
                "SELECT creation_time,num_bytes FROM per_origin_mapping \
                 WHERE context_origin=?1 LIMIT 1",
            )?
            .query_row([origin], |row| {
                Ok(OriginAccount {
                    creation_time: row.get(0)?,
                    num_bytes: row.get(1)?,
                })
            })
            .optional()?;
        Ok(account)
    }

    /// Cached total, expired rows included. Zero for unknown origins.
    pub fn bytes_including_expired(&self, origin: &str) -> StorageResult<i64> {
        Ok(self.account(origin)?.map_or(0, |a| a.num_bytes))
    }

    /// Recount over live rows only.
    pub fn live_bytes(&self, origin: &str) -> StorageResult<i64> {
        let total: Option<i64> = self
            .ctx
            .conn()?
            .prepare_cached(
                "SELECT SUM(LENGTH(key)+LENGTH(value)) FROM values_mapping \
                 WHERE context_origin=?1 AND last_used_time>=?2",
            )?
            .query_row(params![origin, self.ctx.stale_cutoff()], |row| row.get(0))?;
        Ok(total.unwrap_or(0))
    }

    pub fn live_entries(&self, origin: &str) -> StorageResult<i64> {
        let count = self
            .ctx
            .conn()?
            .prepare_cached(
                "SELECT COUNT(*) FROM values_mapping \
                 WHERE context_origin=?1 AND last_used_time>=?2",
            )?
            .query_row(params![origin, self.ctx.stale_cutoff()], |row| row.get(0))?;
        Ok(count)
    }

    /// O(1) check against the cached counter.
    pub fn fits_cached(&self, origin: &str, delta: i64) -> StorageResult<bool> {
        debug_assert!(delta > 0);
        Ok(self.bytes_including_expired(origin)?.saturating_add(delta) <= self.max_bytes())
    }

    /// Check against a live recount. A failure here is final.
    pub fn fits_live(&self, origin: &str, delta: i64) -> StorageResult<bool> {
        debug_assert!(delta > 0);
        Ok(self.live_bytes(origin)?.saturating_add(delta) <= self.max_bytes())
    }

    /// Deletes the origin's stale rows and rebuilds its cached total from
    /// what remains, dropping the account when nothing is left.
    pub fn purge_expired(&self, origin: &str) -> StorageResult<()> {
        let tx = self.ctx.db.begin()?;
        let conn = self.ctx.conn()?;
        let purged = conn
            .prepare_cached(
                "DELETE FROM values_mapping WHERE context_origin=?1 AND last_used_time<?2",
            )?
            .execute(params![origin, self.ctx.stale_cutoff()])?;
        let remaining: Option<i64> = conn
            .prepare_cached(
                "SELECT SUM(LENGTH(key)+LENGTH(value)) FROM values_mapping WHERE context_origin=?1",
            )?
            .query_row([origin], |row| row.get(0))?;
        let remaining = remaining.unwrap_or(0);
        if remaining == 0 {
            self.delete_account(origin)?;
        } else {
            conn.prepare_cached("UPDATE per_origin_mapping SET num_bytes=?1 WHERE context_origin=?2")?
                .execute(params![remaining, origin])?;
        }
        tx.commit()?;
        debug!(origin, purged, remaining, "purged expired values for origin");
        Ok(())
    }

    /// Applies a byte delta to the cached total, creating or deleting the
    /// account as needed. Callers hold a transaction.
    pub fn apply_delta(&self, origin: &str, delta: i64) -> StorageResult<()> {
        if delta == 0 {
            return Ok(());
        }
        match self.account(origin)? {
            Some(account) => {
                let num_bytes = account.num_bytes.saturating_add(delta);
                if num_bytes > 0 {
                    self.ctx
                        .conn()?
                        .prepare_cached(
                            "UPDATE per_origin_mapping SET creation_time=?1, num_bytes=?2 \
                             WHERE context_origin=?3",
                        )?
                        .execute(params![account.creation_time, num_bytes, origin])?;
                } else {
                    self.delete_account(origin)?;
                }
            }
            // Decreasing an account that does not exist is a no-op.
            None if delta < 0 => {}
            None => {
                self.ctx
                    .conn()?
                    .prepare_cached(
                        "INSERT INTO per_origin_mapping(context_origin,creation_time,num_bytes) \
                         VALUES(?1,?2,?3)",
                    )?
                    .execute(params![origin, self.ctx.now_micros(), delta])?;
            }
        }
        Ok(())
    }

    /// Subtracts every origin's stale bytes, deletes the stale rows and drops
    /// accounts left empty. Callers hold a transaction.
    pub fn purge_all_expired(&self) -> StorageResult<PurgeStats> {
        let conn = self.ctx.conn()?;
        let cutoff = self.ctx.stale_cutoff();
        conn.prepare_cached(
            "UPDATE per_origin_mapping SET num_bytes=num_bytes-expired.total_bytes \
             FROM (SELECT context_origin,SUM(LENGTH(key)+LENGTH(value)) AS total_bytes \
                   FROM values_mapping WHERE last_used_time<?1 GROUP BY context_origin) AS expired \
             WHERE per_origin_mapping.context_origin=expired.context_origin",
        )?
        .execute([cutoff])?;
        let rows = conn
            .prepare_cached("DELETE FROM values_mapping WHERE last_used_time<?1")?
            .execute([cutoff])?;
        let origins = conn
            .prepare_cached("DELETE FROM per_origin_mapping WHERE num_bytes<=0")?
            .execute([])?;
        Ok(PurgeStats { rows, origins })
    }

    /// All accounts ordered by origin.
    pub fn accounts(&self) -> StorageResult<Vec<(String, OriginAccount)>> {
        let conn = self.ctx.conn()?;
        let mut stmt = conn.prepare_cached(
            "SELECT context_origin,creation_time,num_bytes FROM per_origin_mapping \
             ORDER BY context_origin",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                OriginAccount {
                    creation_time: row.get(1)?,
                    num_bytes: row.get(2)?,
                },
            ))
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Returns whether an account existed.
    pub fn set_creation_time(&self, origin: &str, creation_time: i64) -> StorageResult<bool> {
        let updated = self
            .ctx
            .conn()?
            .prepare_cached("UPDATE per_origin_mapping SET creation_time=?1 WHERE context_origin=?2")?
            .execute(params![creation_time, origin])?;
        Ok(updated > 0)
    }

    pub fn delete_account(&self, origin: &str) -> StorageResult<()> {
        self.ctx
            .conn()?
            .prepare_cached("DELETE FROM per_origin_mapping WHERE context_origin=?1")?
            .execute([origin])?;
        Ok(())
    }
}
