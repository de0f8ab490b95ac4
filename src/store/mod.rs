pub mod schema;

use crate::clock::{self, Clock};
use crate::config::SharedStorageConfig;
use crate::error::{StorageError, StorageResult};
use rusqlite::{Connection, OpenFlags};
use std::cell::Cell;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Suffixes SQLite may leave next to the main database file.
const SIDE_FILE_SUFFIXES: [&str; 3] = ["-journal", "-wal", "-shm"];

/// Owner of the single SQLite connection backing an engine.
///
/// The connection is absent until `open`/`open_existing` succeeds and after
/// `close`/`raze_and_close`; every statement helper then fails with
/// [`StorageError::Closed`].
pub struct Database {
    conn: Option<Connection>,
    path: Option<PathBuf>,
    page_size: u32,
    cache_size: u32,
    wal_mode: bool,
    depth: Cell<usize>,
}

impl Database {
    /// `None` keeps everything in memory; nothing ever touches disk.
    pub fn new(path: Option<PathBuf>, config: &SharedStorageConfig) -> Self {
        Self {
            conn: None,
            path,
            page_size: config.max_page_size,
            cache_size: config.max_cache_size,
            wal_mode: config.wal_mode,
            depth: Cell::new(0),
        }
    }

    pub fn is_filebacked(&self) -> bool {
        self.path.is_some()
    }

    pub fn is_open(&self) -> bool {
        self.conn.is_some()
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn transaction_depth(&self) -> usize {
        self.depth.get()
    }

    pub fn conn(&self) -> StorageResult<&Connection> {
        self.conn.as_ref().ok_or(StorageError::Closed)
    }

    /// Opens (creating if needed) the backing file or an in-memory database.
    /// A no-op when already open.
    pub fn open(&mut self) -> StorageResult<()> {
        if self.conn.is_some() {
            return Ok(());
        }
        let conn = match &self.path {
            Some(path) => {
                if let Some(parent) = path.parent()
                    && !parent.as_os_str().is_empty()
                {
                    fs::create_dir_all(parent)?;
                }
                Connection::open(path)?
            }
            None => Connection::open_in_memory()?,
        };
        self.configure(&conn)?;
        self.conn = Some(conn);
        self.depth.set(0);
        Ok(())
    }

    /// Opens the backing file only if it already holds at least one table.
    /// Never creates anything on disk.
    pub fn open_existing(&mut self) -> StorageResult<bool> {
        let Some(path) = self.path.as_ref() else {
            return Ok(false);
        };
        if !path.exists() {
            return Ok(false);
        }
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        let tables: i64 = conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type=?1",
            ["table"],
            |row| row.get(0),
        )?;
        if tables == 0 {
            return Ok(false);
        }
        self.configure(&conn)?;
        self.conn = Some(conn);
        self.depth.set(0);
        Ok(true)
    }

    fn configure(&self, conn: &Connection) -> StorageResult<()> {
        conn.pragma_update(None, "page_size", self.page_size)?;
        conn.pragma_update(None, "cache_size", self.cache_size)?;
        if self.wal_mode && self.is_filebacked() {
            // journal_mode answers with the resulting mode, so it is a query.
            let _mode: String =
                conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        }
        Ok(())
    }

    pub fn close(&mut self) {
        if let Some(conn) = self.conn.take()
            && let Err((_, err)) = conn.close()
        {
            warn!(error = %err, "closing shared storage database failed");
        }
        self.depth.set(0);
    }

    /// Drops every schema object, then closes. A file-backed database is
    /// additionally removed from disk.
    pub fn raze_and_close(&mut self) -> StorageResult<()> {
        if let Some(conn) = self.conn.as_ref() {
            let result = raze_schema(conn);
            if let Err(err) = &result {
                debug!(error = %err, "in-place raze failed, falling back to file removal");
            }
        }
        self.close();
        match self.path.clone() {
            Some(path) => delete_files(&path),
            None => Ok(()),
        }
    }

    /// Starts a transaction, or a savepoint when one is already active.
    pub fn begin(&self) -> StorageResult<Transaction<'_>> {
        let conn = self.conn()?;
        let depth = self.depth.get();
        if depth == 0 {
            conn.execute_batch("BEGIN IMMEDIATE")?;
        } else {
            conn.execute_batch(&format!("SAVEPOINT sp_{depth}"))?;
        }
        self.depth.set(depth + 1);
        Ok(Transaction {
            db: self,
            depth,
            done: false,
        })
    }

    /// Must run outside any transaction.
    pub fn vacuum(&self) -> StorageResult<()> {
        debug_assert_eq!(self.depth.get(), 0, "cannot vacuum inside a transaction");
        self.conn()?.execute_batch("VACUUM")?;
        Ok(())
    }

    pub fn trim_memory(&self) {
        if let Some(conn) = self.conn.as_ref() {
            if let Err(err) = conn.execute_batch("PRAGMA shrink_memory") {
                debug!(error = %err, "shrink_memory failed");
            }
            conn.flush_prepared_statement_cache();
        }
    }
}

fn raze_schema(conn: &Connection) -> StorageResult<()> {
    let tables = {
        let mut stmt = conn.prepare(
            "SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%'",
        )?;
        let names = stmt.query_map([], |row| row.get::<_, String>(0))?;
        names.collect::<Result<Vec<_>, _>>()?
    };
    for table in tables {
        conn.execute_batch(&format!("DROP TABLE IF EXISTS \"{}\"", table.replace('"', "\"\"")))?;
    }
    Ok(())
}

/// Borrowed view handed to every component for the duration of one call.
#[derive(Clone, Copy)]
pub struct StoreContext<'a> {
    pub db: &'a Database,
    pub config: &'a SharedStorageConfig,
    pub clock: &'a dyn Clock,
}

impl StoreContext<'_> {
    pub fn conn(&self) -> StorageResult<&Connection> {
        self.db.conn()
    }

    pub fn now_micros(&self) -> i64 {
        clock::to_micros(self.clock.now())
    }

    /// Rows last used strictly before this instant are stale.
    pub fn stale_cutoff(&self) -> i64 {
        clock::cutoff_micros(self.clock.now(), self.config.staleness_threshold())
    }

    pub fn budget_cutoff(&self) -> i64 {
        clock::cutoff_micros(self.clock.now(), self.config.budget_interval())
    }
}

/// Removes a database file and its journal side files. Missing files are fine.
pub fn delete_files(path: &Path) -> StorageResult<()> {
    let mut candidates = vec![path.to_path_buf()];
    for suffix in SIDE_FILE_SUFFIXES {
        let mut side = path.as_os_str().to_owned();
        side.push(suffix);
        candidates.push(PathBuf::from(side));
    }
    for candidate in candidates {
        match fs::remove_file(&candidate) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

/// Scope guard for [`Database::begin`]. Dropping without `commit` rolls back.
pub struct Transaction<'a> {
    db: &'a Database,
    depth: usize,
    done: bool,
}

impl Transaction<'_> {
    pub fn commit(mut self) -> StorageResult<()> {
        let sql = if self.depth == 0 {
            "COMMIT".to_string()
        } else {
            format!("RELEASE sp_{}", self.depth)
        };
        // On failure the guard stays armed and the drop rolls back.
        self.db.conn()?.execute_batch(&sql)?;
        self.finish();
        Ok(())
    }

    pub fn rollback(mut self) -> StorageResult<()> {
        let result = self.run_rollback();
        self.finish();
        result
    }

    fn run_rollback(&self) -> StorageResult<()> {
        let conn = self.db.conn()?;
        if self.depth == 0 {
            conn.execute_batch("ROLLBACK")?;
        } else {
            conn.execute_batch(&format!(
                "ROLLBACK TO sp_{d}; RELEASE sp_{d}",
                d = self.depth
            ))?;
        }
        Ok(())
    }

    fn finish(&mut self) {
        self.done = true;
        self.db.depth.set(self.depth);
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        if let Err(err) = self.run_rollback() {
            warn!(error = %err, depth = self.depth, "transaction rollback failed");
        }
        self.finish();
    }
}
