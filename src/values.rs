use crate::capacity::CapacityGuard;
use crate::clock;
use crate::codec::{self, byte_cost};
use crate::error::StorageResult;
use crate::store::StoreContext;
use crate::types::{GetResult, OperationResult, SetBehavior};
use rusqlite::{OptionalExtension, params};

/// A stored row as read, expired or not.
#[derive(Debug, Clone)]
struct StoredValue {
    value: String,
    last_used_time: i64,
}

/// Key/value rows of one origin plus the byte bookkeeping that goes with
/// every mutation.
pub struct ValueStore<'a> {
    ctx: StoreContext<'a>,
}

impl<'a> ValueStore<'a> {
    pub fn new(ctx: StoreContext<'a>) -> Self {
        Self { ctx }
    }

    fn capacity(&self) -> CapacityGuard<'a> {
        CapacityGuard::new(self.ctx)
    }

    fn lookup(&self, origin: &str, key: &str) -> StorageResult<Option<StoredValue>> {
        let row = self
            .ctx
            .conn()?
            .prepare_cached(
                "SELECT value,last_used_time FROM values_mapping \
                 WHERE context_origin=?1 AND key=?2 LIMIT 1",
            )?
            .query_row(params![origin, codec::encode(key)], |row| {
                Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, i64>(1)?))
            })
            .optional()?;
        match row {
            Some((blob, last_used_time)) => Ok(Some(StoredValue {
                value: codec::decode(&blob)?,
                last_used_time,
            })),
            None => Ok(None),
        }
    }

    fn is_live(&self, stored: &StoredValue) -> bool {
        stored.last_used_time >= self.ctx.stale_cutoff()
    }

    pub fn get(&self, origin: &str, key: &str) -> StorageResult<GetResult> {
        let Some(stored) = self.lookup(origin, key)? else {
            return Ok(GetResult::status(OperationResult::NotFound));
        };
        let result = if self.is_live(&stored) {
            OperationResult::Success
        } else {
            OperationResult::Expired
        };
        Ok(GetResult {
            last_used_time: Some(clock::from_micros(stored.last_used_time)),
            value: Some(stored.value),
            result,
        })
    }

    pub fn set(
        &self,
        origin: &str,
        key: &str,
        value: &str,
        behavior: SetBehavior,
    ) -> StorageResult<OperationResult> {
        let previous = self.lookup(origin, key)?;
        if behavior == SetBehavior::IgnoreIfPresent
            && let Some(current) = previous.as_ref().filter(|p| self.is_live(p))
        {
            // Same bytes back in, only the timestamp moves.
            self.write(origin, key, &current.value, Some(&current.value))?;
            return Ok(OperationResult::Ignored);
        }
        self.set_or_append(origin, key, value, previous)
    }

    pub fn append(&self, origin: &str, key: &str, tail: &str) -> StorageResult<OperationResult> {
        let previous = self.lookup(origin, key)?;
        let new_value = match previous.as_ref() {
            Some(current) if self.is_live(current) => {
                let combined = codec::len16(&current.value) + codec::len16(tail);
                if combined > self.ctx.config.max_string_length() {
                    return Ok(OperationResult::InvalidAppend);
                }
                format!("{}{}", current.value, tail)
            }
            _ => tail.to_string(),
        };
        self.set_or_append(origin, key, &new_value, previous)
    }

    fn set_or_append(
        &self,
        origin: &str,
        key: &str,
        value: &str,
        previous: Option<StoredValue>,
    ) -> StorageResult<OperationResult> {
        let delta = byte_cost(value)
            + match previous.as_ref() {
                Some(p) => -byte_cost(&p.value),
                None => byte_cost(key),
            };
        let capacity = self.capacity();
        if delta <= 0 || capacity.fits_cached(origin, delta)? {
            self.write(origin, key, value, previous.as_ref().map(|p| p.value.as_str()))?;
            return Ok(OperationResult::Set);
        }

        // The recount skips an expired previous row and the purge below drops
        // it, so it is sized here as a fresh insert.
        let previous = previous.filter(|p| self.is_live(p));
        let live_delta = byte_cost(value)
            + match previous.as_ref() {
                Some(p) => -byte_cost(&p.value),
                None => byte_cost(key),
            };
        if !capacity.fits_live(origin, live_delta)? {
            return Ok(OperationResult::NoCapacity);
        }

        // Expired rows only inflate the cached counter; drop them and retry.
        capacity.purge_expired(origin)?;
        self.write(origin, key, value, previous.as_ref().map(|p| p.value.as_str()))?;
        Ok(OperationResult::Set)
    }

    /// Inserts or overwrites one row stamped with the current time and moves
    /// the origin's byte total by the difference, atomically.
    fn write(
        &self,
        origin: &str,
        key: &str,
        value: &str,
        previous: Option<&str>,
    ) -> StorageResult<()> {
        self.write_with_time(origin, key, value, self.ctx.now_micros(), previous)
    }

    fn write_with_time(
        &self,
        origin: &str,
        key: &str,
        value: &str,
        last_used_time: i64,
        previous: Option<&str>,
    ) -> StorageResult<()> {
        let tx = self.ctx.db.begin()?;
        let conn = self.ctx.conn()?;
        let delta = match previous {
            Some(previous) => {
                conn.prepare_cached(
                    "UPDATE values_mapping SET value=?1, last_used_time=?2 \
                     WHERE context_origin=?3 AND key=?4",
                )?
                .execute(params![
                    codec::encode(value),
                    last_used_time,
                    origin,
                    codec::encode(key)
                ])?;
                byte_cost(value) - byte_cost(previous)
            }
            None => {
                conn.prepare_cached(
                    "INSERT INTO values_mapping(context_origin,key,value,last_used_time) \
                     VALUES(?1,?2,?3,?4)",
                )?
                .execute(params![
                    origin,
                    codec::encode(key),
                    codec::encode(value),
                    last_used_time
                ])?;
                byte_cost(key) + byte_cost(value)
            }
        };
        self.capacity().apply_delta(origin, delta)?;
        tx.commit()
    }

    pub fn delete(&self, origin: &str, key: &str) -> StorageResult<OperationResult> {
        let tx = self.ctx.db.begin()?;
        let conn = self.ctx.conn()?;
        let removed: Option<i64> = conn
            .prepare_cached(
                "DELETE FROM values_mapping WHERE context_origin=?1 AND key=?2 \
                 RETURNING LENGTH(key)+LENGTH(value)",
            )?
            .query_row(params![origin, codec::encode(key)], |row| row.get(0))
            .optional()?;
        let Some(removed) = removed else {
            return Ok(OperationResult::Success);
        };
        self.capacity().apply_delta(origin, -removed)?;
        tx.commit()?;
        Ok(OperationResult::Success)
    }

    /// Removes every row and the account of `origin`.
    pub fn clear(&self, origin: &str) -> StorageResult<OperationResult> {
        let tx = self.ctx.db.begin()?;
        self.ctx
            .conn()?
            .prepare_cached("DELETE FROM values_mapping WHERE context_origin=?1")?
            .execute([origin])?;
        self.capacity().delete_account(origin)?;
        tx.commit()?;
        Ok(OperationResult::Success)
    }

    pub fn length(&self, origin: &str) -> StorageResult<i64> {
        self.capacity().live_entries(origin)
    }

    pub fn bytes_used(&self, origin: &str) -> StorageResult<i64> {
        self.capacity().live_bytes(origin)
    }

    pub fn bytes_used_include_expired(&self, origin: &str) -> StorageResult<i64> {
        self.capacity().bytes_including_expired(origin)
    }

    /// Live rows ordered by key. Undecodable blobs are replaced by a marker
    /// instead of failing the whole listing.
    pub fn entries_for_dev_tools(&self, origin: &str) -> StorageResult<Vec<(String, String)>> {
        let conn = self.ctx.conn()?;
        let mut stmt = conn.prepare_cached(
            "SELECT key,value FROM values_mapping \
             WHERE context_origin=?1 AND last_used_time>=?2 ORDER BY key",
        )?;
        let mut rows = stmt.query(params![origin, self.ctx.stale_cutoff()])?;
        let mut entries = Vec::new();
        while let Some(row) = rows.next()? {
            let key = codec::decode(&row.get::<_, Vec<u8>>(0)?)
                .unwrap_or_else(|_| "[[DATABASE_ERROR: unable to retrieve key]]".to_string());
            let value = codec::decode(&row.get::<_, Vec<u8>>(1)?)
                .unwrap_or_else(|_| "[[DATABASE_ERROR: unable to retrieve value]]".to_string());
            entries.push((key, value));
        }
        Ok(entries)
    }

    /// Distinct origins with a row last used inside `[begin, end]`.
    pub fn origins_used_between(&self, begin: i64, end: i64) -> StorageResult<Vec<String>> {
        let conn = self.ctx.conn()?;
        let mut stmt = conn.prepare_cached(
            "SELECT DISTINCT context_origin FROM values_mapping \
             WHERE last_used_time BETWEEN ?1 AND ?2",
        )?;
        let origins = stmt.query_map(params![begin, end], |row| row.get::<_, String>(0))?;
        Ok(origins.collect::<Result<Vec<_>, _>>()?)
    }

    /// Rewrites `last_used_time` without touching the value or byte totals.
    /// Returns whether a row was found.
    pub fn override_last_used_time(
        &self,
        origin: &str,
        key: &str,
        last_used_time: i64,
    ) -> StorageResult<bool> {
        let Some(stored) = self.lookup(origin, key)? else {
            return Ok(false);
        };
        self.write_with_time(origin, key, &stored.value, last_used_time, Some(&stored.value))?;
        Ok(true)
    }
}
