pub mod budget;
pub mod capacity;
pub mod clock;
pub mod codec;
pub mod config;
pub mod error;
#[cfg(test)]
mod lib_tests;
pub mod origin;
pub mod paginate;
pub mod store;
pub mod types;
pub mod values;
pub mod worker;

use crate::budget::BudgetLedger;
use crate::capacity::CapacityGuard;
use crate::clock::{Clock, SystemClock};
use crate::config::SharedStorageConfig;
use crate::error::{StorageError, StorageResult};
use crate::paginate::{EntriesBatch, EntriesListener, Projection, ResultPaginator};
use crate::store::schema::{
    self, COMPATIBLE_VERSION, CURRENT_VERSION, DEPRECATED_VERSION, SchemaUpgrade, StandardUpgrade,
};
use crate::store::{Database, StoreContext};
use crate::values::ValueStore;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, info, warn};

pub use crate::origin::{Origin, Site};
pub use crate::paginate::KeyAndOrValue;
pub use crate::types::{
    BatchUpdateResult, BudgetResult, DbCreationPolicy, EntriesResult, GetResult, InitStatus,
    MetadataResult, ModifierMethod, OperationResult, OriginUsage, SetBehavior, TimeResult,
};
pub use crate::worker::SharedStorageHandle;

/// Whether a file-backed store was found on disk before the first write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DbFileStatus {
    NotChecked,
    NoPreexistingFile,
    PreexistingFile,
}

/// Outcome of lazily bringing the store up for one call.
enum Access {
    Ready,
    /// Nothing on disk and the caller did not ask for creation.
    Absent,
    Failed,
}

/// Origin-scoped key/value storage with per-origin quotas, staleness expiry
/// and a per-site privacy budget, persisted in one SQLite database.
///
/// The store is created lazily: reads against a store that does not exist
/// answer empty results without creating it, the first write creates it.
/// An engine is bound to the thread that built it; see
/// [`SharedStorageHandle`] for use from other threads or async code.
pub struct SharedStorageDatabase {
    db: Database,
    config: SharedStorageConfig,
    clock: Arc<dyn Clock>,
    upgrader: Box<dyn SchemaUpgrade>,
    db_status: InitStatus,
    file_status: DbFileStatus,
    _single_sequence: PhantomData<*const ()>,
}

impl SharedStorageDatabase {
    /// `None` keeps all data in memory. Nothing is opened until first use.
    pub fn new(path: Option<PathBuf>, config: SharedStorageConfig) -> StorageResult<Self> {
        Self::with_clock(path, config, Arc::new(SystemClock))
    }

    pub fn in_memory(config: SharedStorageConfig) -> StorageResult<Self> {
        Self::new(None, config)
    }

    pub fn with_clock(
        path: Option<PathBuf>,
        config: SharedStorageConfig,
        clock: Arc<dyn Clock>,
    ) -> StorageResult<Self> {
        config.validate()?;
        info!(
            path = path.as_deref().map(|p| p.display().to_string()).unwrap_or_default(),
            in_memory = path.is_none(),
            max_bytes_per_origin = config.max_bytes_per_origin,
            max_init_tries = config.max_init_tries,
            max_iterator_batch_size = config.max_iterator_batch_size,
            bit_budget = config.bit_budget,
            budget_interval_secs = config.budget_interval_secs,
            staleness_threshold_secs = config.staleness_threshold_secs,
            max_page_size = config.max_page_size,
            max_cache_size = config.max_cache_size,
            wal_mode = config.wal_mode,
            "shared storage config"
        );
        let file_status = if path.is_some() {
            DbFileStatus::NotChecked
        } else {
            DbFileStatus::NoPreexistingFile
        };
        Ok(Self {
            db: Database::new(path, &config),
            config,
            clock,
            upgrader: Box::new(StandardUpgrade),
            db_status: InitStatus::Unattempted,
            file_status,
            _single_sequence: PhantomData,
        })
    }

    /// Replaces the routine used to bring older files up to date.
    pub fn with_schema_upgrade(mut self, upgrader: impl SchemaUpgrade + 'static) -> Self {
        self.upgrader = Box::new(upgrader);
        self
    }

    pub fn config(&self) -> &SharedStorageConfig {
        &self.config
    }

    pub fn path(&self) -> Option<&Path> {
        self.db.path()
    }

    pub fn is_filebacked(&self) -> bool {
        self.db.is_filebacked()
    }

    pub fn is_open(&self) -> bool {
        self.db.is_open()
    }

    pub fn db_status(&self) -> InitStatus {
        self.db_status
    }

    fn ctx(&self) -> StoreContext<'_> {
        StoreContext {
            db: &self.db,
            config: &self.config,
            clock: self.clock.as_ref(),
        }
    }

    fn values(&self) -> ValueStore<'_> {
        ValueStore::new(self.ctx())
    }

    fn capacity(&self) -> CapacityGuard<'_> {
        CapacityGuard::new(self.ctx())
    }

    fn budget(&self) -> BudgetLedger<'_> {
        BudgetLedger::new(self.ctx())
    }

    /// Keys are non-empty; keys and values hold at most `max_string_length`
    /// UTF-16 units.
    fn valid_key(&self, key: &str) -> bool {
        !key.is_empty() && codec::len16(key) <= self.config.max_string_length()
    }

    fn valid_value(&self, value: &str) -> bool {
        codec::len16(value) <= self.config.max_string_length()
    }

    fn reject(&self, op: &'static str) -> OperationResult {
        warn!(op, "rejected invalid argument");
        OperationResult::InvalidArgument
    }

    // ---- lifecycle -------------------------------------------------------

    /// Brings the store up once. Failures are sticky for the life of the
    /// engine unless a catastrophic error resets it.
    pub fn lazy_init(&mut self, policy: DbCreationPolicy) -> InitStatus {
        if self.db_status != InitStatus::Unattempted {
            return self.db_status;
        }
        if policy == DbCreationPolicy::IgnoreIfAbsent && !self.db_exists() {
            return InitStatus::Unattempted;
        }
        for attempt in 1..=self.config.max_init_tries {
            self.db_status = self.init_attempt();
            if self.db_status == InitStatus::Success {
                return self.db_status;
            }
            self.db.close();
            warn!(attempt, status = ?self.db_status, "shared storage initialization attempt failed");
            // Retrying cannot make a newer file readable.
            if self.db_status == InitStatus::TooNew {
                break;
            }
        }
        self.db_status
    }

    fn access(&mut self, policy: DbCreationPolicy) -> Access {
        match self.lazy_init(policy) {
            InitStatus::Success => Access::Ready,
            InitStatus::Unattempted => Access::Absent,
            _ => Access::Failed,
        }
    }

    fn db_exists(&mut self) -> bool {
        match self.file_status {
            DbFileStatus::NoPreexistingFile => false,
            DbFileStatus::PreexistingFile => true,
            DbFileStatus::NotChecked => match self.db.open_existing() {
                Ok(found) => {
                    self.file_status = if found {
                        DbFileStatus::PreexistingFile
                    } else {
                        DbFileStatus::NoPreexistingFile
                    };
                    found
                }
                Err(err) => {
                    // Something is on disk; let initialization deal with it.
                    warn!(error = %err, "probing existing shared storage database failed");
                    self.file_status = DbFileStatus::PreexistingFile;
                    true
                }
            },
        }
    }

    fn init_attempt(&mut self) -> InitStatus {
        if let Err(err) = self.db.open() {
            warn!(error = %err, "opening shared storage database failed");
            if err.is_catastrophic() {
                self.raze();
            }
            return InitStatus::Error;
        }
        match self.init_schema() {
            Ok(InitStatus::Success) => {
                self.log_init_summary();
                InitStatus::Success
            }
            Ok(InitStatus::TooNew) => {
                warn!("shared storage database is too new, leaving it untouched");
                InitStatus::TooNew
            }
            Ok(status) => {
                warn!(status = ?status, "shared storage database unusable, razing");
                self.raze();
                status
            }
            Err(err) => {
                warn!(error = %err, "shared storage initialization failed");
                if err.is_catastrophic() {
                    self.raze();
                }
                InitStatus::Error
            }
        }
    }

    /// Runs in one transaction so a failed attempt leaves nothing behind.
    fn init_schema(&self) -> StorageResult<InitStatus> {
        let tx = self.db.begin()?;
        let conn = self.db.conn()?;
        let meta = schema::init_meta(conn, CURRENT_VERSION, COMPATIBLE_VERSION)?;
        schema::create_tables(conn, meta.version)?;

        if meta.compatible_version > CURRENT_VERSION {
            return Ok(InitStatus::TooNew);
        }
        if meta.version <= DEPRECATED_VERSION {
            return Ok(InitStatus::TooOld);
        }
        if meta.version < CURRENT_VERSION {
            match self.upgrader.upgrade(conn, meta.version) {
                Ok(true) => schema::write_versions(conn, CURRENT_VERSION, COMPATIBLE_VERSION)?,
                Ok(false) => return Ok(InitStatus::UpgradeFailed),
                Err(err) => {
                    warn!(from_version = meta.version, error = %err, "schema upgrade failed");
                    return Ok(InitStatus::UpgradeFailed);
                }
            }
        }
        tx.commit()?;
        Ok(InitStatus::Success)
    }

    fn log_init_summary(&self) {
        let summary = self.capacity().accounts().and_then(|accounts| {
            Ok((accounts, self.budget().total_entry_count()?))
        });
        match summary {
            Ok((accounts, withdrawals)) => info!(
                origins = accounts.len(),
                total_bytes = accounts.iter().map(|(_, a)| a.num_bytes).sum::<i64>(),
                withdrawals,
                preexisting = self.file_status == DbFileStatus::PreexistingFile,
                "shared storage database initialized"
            ),
            Err(err) => debug!(error = %err, "collecting init summary failed"),
        }
    }

    fn raze(&mut self) {
        if let Err(err) = self.db.raze_and_close() {
            warn!(error = %err, "razing shared storage database failed");
        }
    }

    /// Erases all stored state, on disk included. Idempotent. The engine
    /// returns to its unattempted state and recreates the store on the next
    /// write.
    pub fn destroy(&mut self) -> bool {
        let result = if self.db.is_open() {
            self.db.raze_and_close()
        } else if let Some(path) = self.db.path() {
            store::delete_files(path)
        } else {
            Ok(())
        };
        self.db_status = InitStatus::Unattempted;
        self.file_status = if self.db.is_filebacked() {
            DbFileStatus::NotChecked
        } else {
            DbFileStatus::NoPreexistingFile
        };
        match result {
            Ok(()) => {
                info!(in_memory = !self.db.is_filebacked(), "shared storage database destroyed");
                true
            }
            Err(err) => {
                warn!(error = %err, "destroying shared storage database failed");
                false
            }
        }
    }

    /// Maps an internal error to the public taxonomy, destroying the store
    /// first when the file can no longer be trusted.
    fn settle<T>(&mut self, op: &'static str, result: StorageResult<T>) -> Result<T, OperationResult> {
        result.map_err(|err| {
            self.recover(op, &err);
            OperationResult::SqlError
        })
    }

    fn recover(&mut self, op: &'static str, err: &StorageError) {
        warn!(op, error = %err, code = err.code_str(), "shared storage operation failed");
        if err.is_catastrophic() {
            warn!(op, "catastrophic shared storage error, destroying database");
            self.destroy();
        }
    }

    pub fn trim_memory(&mut self) {
        self.db.trim_memory();
    }

    // ---- values ----------------------------------------------------------

    pub fn get(&mut self, origin: &Origin, key: &str) -> GetResult {
        if !self.valid_key(key) {
            return GetResult::status(self.reject("get"));
        }
        match self.access(DbCreationPolicy::IgnoreIfAbsent) {
            Access::Ready => {}
            Access::Absent => return GetResult::status(OperationResult::NotFound),
            Access::Failed => return GetResult::status(OperationResult::InitFailure),
        }
        let result = self.values().get(origin.as_str(), key);
        self.settle("get", result).unwrap_or_else(GetResult::status)
    }

    pub fn set(
        &mut self,
        origin: &Origin,
        key: &str,
        value: &str,
        behavior: SetBehavior,
    ) -> OperationResult {
        if !self.valid_key(key) || !self.valid_value(value) {
            return self.reject("set");
        }
        if !matches!(self.access(DbCreationPolicy::CreateIfAbsent), Access::Ready) {
            return OperationResult::InitFailure;
        }
        let result = self.values().set(origin.as_str(), key, value, behavior);
        self.settle("set", result).unwrap_or_else(|failed| failed)
    }

    pub fn append(&mut self, origin: &Origin, key: &str, tail: &str) -> OperationResult {
        if !self.valid_key(key) || !self.valid_value(tail) {
            return self.reject("append");
        }
        if !matches!(self.access(DbCreationPolicy::CreateIfAbsent), Access::Ready) {
            return OperationResult::InitFailure;
        }
        let result = self.values().append(origin.as_str(), key, tail);
        self.settle("append", result).unwrap_or_else(|failed| failed)
    }

    pub fn delete(&mut self, origin: &Origin, key: &str) -> OperationResult {
        if !self.valid_key(key) {
            return self.reject("delete");
        }
        match self.access(DbCreationPolicy::IgnoreIfAbsent) {
            Access::Ready => {}
            Access::Absent => return OperationResult::Success,
            Access::Failed => return OperationResult::InitFailure,
        }
        let result = self.values().delete(origin.as_str(), key);
        self.settle("delete", result).unwrap_or_else(|failed| failed)
    }

    pub fn clear(&mut self, origin: &Origin) -> OperationResult {
        match self.access(DbCreationPolicy::IgnoreIfAbsent) {
            Access::Ready => {}
            Access::Absent => return OperationResult::Success,
            Access::Failed => return OperationResult::InitFailure,
        }
        let result = self.values().clear(origin.as_str());
        self.settle("clear", result).unwrap_or_else(|failed| failed)
    }

    /// Live entries for `origin`; `-1` when the store is broken.
    pub fn length(&mut self, origin: &Origin) -> i64 {
        match self.access(DbCreationPolicy::IgnoreIfAbsent) {
            Access::Ready => {}
            Access::Absent => return 0,
            Access::Failed => return -1,
        }
        let result = self.values().length(origin.as_str());
        self.settle("length", result).unwrap_or(-1)
    }

    /// Live bytes for `origin`, recounted; `-1` when the store is broken.
    pub fn bytes_used(&mut self, origin: &Origin) -> i64 {
        match self.access(DbCreationPolicy::IgnoreIfAbsent) {
            Access::Ready => {}
            Access::Absent => return 0,
            Access::Failed => return -1,
        }
        let result = self.values().bytes_used(origin.as_str());
        self.settle("bytes_used", result).unwrap_or(-1)
    }

    /// The cached byte total, which still counts unpurged expired entries.
    pub fn bytes_used_include_expired(&mut self, origin: &Origin) -> i64 {
        match self.access(DbCreationPolicy::IgnoreIfAbsent) {
            Access::Ready => {}
            Access::Absent => return 0,
            Access::Failed => return -1,
        }
        let result = self.values().bytes_used_include_expired(origin.as_str());
        self.settle("bytes_used_include_expired", result)
            .unwrap_or(-1)
    }

    pub fn keys(&mut self, origin: &Origin, listener: &mut dyn EntriesListener) -> OperationResult {
        self.stream(origin, Projection::Keys, listener)
    }

    pub fn entries(
        &mut self,
        origin: &Origin,
        listener: &mut dyn EntriesListener,
    ) -> OperationResult {
        self.stream(origin, Projection::Entries, listener)
    }

    fn stream(
        &mut self,
        origin: &Origin,
        projection: Projection,
        listener: &mut dyn EntriesListener,
    ) -> OperationResult {
        match self.access(DbCreationPolicy::IgnoreIfAbsent) {
            Access::Ready => {}
            Access::Absent => {
                listener.did_read_entries(EntriesBatch::empty_success());
                return OperationResult::Success;
            }
            Access::Failed => {
                listener.did_read_entries(EntriesBatch::failure(
                    "SQL database had initialization failure.",
                    0,
                ));
                return OperationResult::InitFailure;
            }
        }
        let (result, err) =
            ResultPaginator::new(self.ctx()).stream(origin.as_str(), projection, listener);
        if let Some(err) = err {
            self.recover("stream", &err);
        }
        result
    }

    // ---- batch -------------------------------------------------------------

    /// Applies `methods` in order inside one transaction. The first method
    /// whose result is not acceptable stops the batch and nothing is kept.
    pub fn batch_update(&mut self, origin: &Origin, methods: &[ModifierMethod]) -> BatchUpdateResult {
        let valid = methods.iter().all(|method| match method {
            ModifierMethod::Set { key, value, .. } | ModifierMethod::Append { key, value } => {
                self.valid_key(key) && self.valid_value(value)
            }
            ModifierMethod::Delete { key } => self.valid_key(key),
            ModifierMethod::Clear => true,
        });
        if !valid {
            return BatchUpdateResult {
                overall_result: self.reject("batch_update"),
                inner_method_results: Vec::new(),
            };
        }
        if !matches!(self.access(DbCreationPolicy::CreateIfAbsent), Access::Ready) {
            return BatchUpdateResult {
                overall_result: OperationResult::InitFailure,
                inner_method_results: Vec::new(),
            };
        }
        let (outcome, err) = self.apply_batch(origin.as_str(), methods);
        if let Some(err) = err {
            self.recover("batch_update", &err);
        }
        outcome
    }

    fn apply_batch(
        &self,
        origin: &str,
        methods: &[ModifierMethod],
    ) -> (BatchUpdateResult, Option<StorageError>) {
        let outcome = |overall_result, inner_method_results| BatchUpdateResult {
            overall_result,
            inner_method_results,
        };
        let tx = match self.db.begin() {
            Ok(tx) => tx,
            Err(err) => return (outcome(OperationResult::SqlError, Vec::new()), Some(err)),
        };
        let values = self.values();
        let mut results = Vec::with_capacity(methods.len());
        for method in methods {
            let applied = match method {
                ModifierMethod::Set {
                    key,
                    value,
                    ignore_if_present,
                } => {
                    let behavior = if *ignore_if_present {
                        SetBehavior::IgnoreIfPresent
                    } else {
                        SetBehavior::Default
                    };
                    values.set(origin, key, value, behavior)
                }
                ModifierMethod::Append { key, value } => values.append(origin, key, value),
                ModifierMethod::Delete { key } => values.delete(origin, key),
                ModifierMethod::Clear => values.clear(origin),
            };
            match applied {
                Ok(result) => {
                    results.push(result);
                    if !method.accepts(result) {
                        return (outcome(result, results), None);
                    }
                }
                Err(err) => {
                    results.push(OperationResult::SqlError);
                    return (outcome(OperationResult::SqlError, results), Some(err));
                }
            }
        }
        match tx.commit() {
            Ok(()) => (outcome(OperationResult::Success, results), None),
            Err(err) => (outcome(OperationResult::SqlError, results), Some(err)),
        }
    }

    // ---- purges ------------------------------------------------------------

    /// Drops every expired entry and every withdrawal that left the budget
    /// window, in one transaction.
    pub fn purge_stale(&mut self) -> OperationResult {
        match self.access(DbCreationPolicy::IgnoreIfAbsent) {
            Access::Ready => {}
            Access::Absent => return OperationResult::Success,
            Access::Failed => return OperationResult::InitFailure,
        }
        let result = self.purge_stale_in_transaction();
        match self.settle("purge_stale", result) {
            Ok(()) => OperationResult::Success,
            Err(failed) => failed,
        }
    }

    fn purge_stale_in_transaction(&self) -> StorageResult<()> {
        let tx = self.db.begin()?;
        let stats = self.capacity().purge_all_expired()?;
        let withdrawals = self.budget().purge_expired()?;
        tx.commit()?;
        debug!(
            rows = stats.rows,
            origins = stats.origins,
            withdrawals,
            "purged stale shared storage data"
        );
        Ok(())
    }

    /// Clears every origin that used storage inside `[begin, end]` and that
    /// `matcher` accepts (all of them when `matcher` is `None`). With
    /// `perform_storage_cleanup` the file is vacuumed afterwards.
    pub fn purge_matching_origins(
        &mut self,
        matcher: Option<&dyn Fn(&Origin) -> bool>,
        begin: SystemTime,
        end: SystemTime,
        perform_storage_cleanup: bool,
    ) -> OperationResult {
        if begin > end {
            return self.reject("purge_matching_origins");
        }
        match self.access(DbCreationPolicy::IgnoreIfAbsent) {
            Access::Ready => {}
            Access::Absent => return OperationResult::Success,
            Access::Failed => return OperationResult::InitFailure,
        }
        let result = self.purge_matching_in_transaction(matcher, begin, end);
        let purged = match self.settle("purge_matching_origins", result) {
            Ok(purged) => purged,
            Err(failed) => return failed,
        };
        if purged > 0 && perform_storage_cleanup {
            let vacuumed = self.db.vacuum();
            if let Err(failed) = self.settle("vacuum", vacuumed) {
                return failed;
            }
        }
        OperationResult::Success
    }

    fn purge_matching_in_transaction(
        &self,
        matcher: Option<&dyn Fn(&Origin) -> bool>,
        begin: SystemTime,
        end: SystemTime,
    ) -> StorageResult<usize> {
        let values = self.values();
        let candidates =
            values.origins_used_between(clock::to_micros(begin), clock::to_micros(end))?;
        if candidates.is_empty() {
            return Ok(0);
        }
        let tx = self.db.begin()?;
        let mut purged = 0;
        for candidate in candidates {
            if let Some(matcher) = matcher {
                match Origin::parse(&candidate) {
                    Ok(origin) if matcher(&origin) => {}
                    Ok(_) => continue,
                    Err(err) => {
                        warn!(origin = %candidate, error = %err, "skipping unparsable stored origin");
                        continue;
                    }
                }
            }
            values.clear(&candidate)?;
            purged += 1;
        }
        tx.commit()?;
        Ok(purged)
    }

    // ---- origins & metadata ------------------------------------------------

    /// Every origin holding data, with its cached byte total.
    pub fn fetch_origins(&mut self) -> Vec<OriginUsage> {
        if !matches!(self.access(DbCreationPolicy::IgnoreIfAbsent), Access::Ready) {
            return Vec::new();
        }
        let result = self.capacity().accounts();
        self.settle("fetch_origins", result)
            .map(|accounts| {
                accounts
                    .into_iter()
                    .map(|(origin, account)| OriginUsage {
                        origin,
                        num_bytes: account.num_bytes,
                        creation_time: clock::from_micros(account.creation_time),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn get_creation_time(&mut self, origin: &Origin) -> TimeResult {
        let status = |result| TimeResult { time: None, result };
        match self.access(DbCreationPolicy::IgnoreIfAbsent) {
            Access::Ready => {}
            Access::Absent => return status(OperationResult::NotFound),
            Access::Failed => return status(OperationResult::InitFailure),
        }
        let result = self.capacity().account(origin.as_str());
        match self.settle("get_creation_time", result) {
            Ok(Some(account)) => TimeResult {
                time: Some(clock::from_micros(account.creation_time)),
                result: OperationResult::Success,
            },
            Ok(None) => status(OperationResult::NotFound),
            Err(failed) => status(failed),
        }
    }

    pub fn get_metadata(&mut self, origin: &Origin) -> MetadataResult {
        let length = self.length(origin);
        let bytes_used = self.bytes_used(origin);
        let time = self.get_creation_time(origin);
        let budget = self.get_remaining_budget(&origin.site());
        MetadataResult {
            length,
            bytes_used,
            remaining_budget: if budget.result == OperationResult::Success {
                budget.bits
            } else {
                0.0
            },
            creation_time: time.time,
            time_result: time.result,
            budget_result: budget.result,
        }
    }

    /// Live entries of `origin` in key order, for inspection tools.
    pub fn get_entries_for_dev_tools(&mut self, origin: &Origin) -> EntriesResult {
        let status = |result| EntriesResult {
            entries: Vec::new(),
            result,
        };
        match self.access(DbCreationPolicy::IgnoreIfAbsent) {
            Access::Ready => {}
            Access::Absent => return status(OperationResult::Success),
            Access::Failed => return status(OperationResult::InitFailure),
        }
        let result = self.values().entries_for_dev_tools(origin.as_str());
        match self.settle("get_entries_for_dev_tools", result) {
            Ok(entries) => EntriesResult {
                entries,
                result: OperationResult::Success,
            },
            Err(failed) => status(failed),
        }
    }

    // ---- budget ------------------------------------------------------------

    /// Records a debit of `bits_debit` against `site`. Debits must be
    /// positive and finite.
    pub fn make_budget_withdrawal(&mut self, site: &Site, bits_debit: f64) -> OperationResult {
        if !(bits_debit > 0.0 && bits_debit.is_finite()) {
            return self.reject("make_budget_withdrawal");
        }
        if !matches!(self.access(DbCreationPolicy::CreateIfAbsent), Access::Ready) {
            return OperationResult::InitFailure;
        }
        let result = self.budget().withdraw(site.as_str(), bits_debit);
        match self.settle("make_budget_withdrawal", result) {
            Ok(()) => OperationResult::Success,
            Err(failed) => failed,
        }
    }

    /// Remaining bits for `site` over the trailing budget interval. May be
    /// negative.
    pub fn get_remaining_budget(&mut self, site: &Site) -> BudgetResult {
        match self.access(DbCreationPolicy::IgnoreIfAbsent) {
            Access::Ready => {}
            Access::Absent => {
                return BudgetResult {
                    bits: self.config.bit_budget,
                    result: OperationResult::Success,
                };
            }
            Access::Failed => {
                return BudgetResult {
                    bits: 0.0,
                    result: OperationResult::InitFailure,
                };
            }
        }
        let result = self.budget().remaining(site.as_str());
        match self.settle("get_remaining_budget", result) {
            Ok(bits) => BudgetResult {
                bits,
                result: OperationResult::Success,
            },
            Err(failed) => BudgetResult {
                bits: 0.0,
                result: failed,
            },
        }
    }

    /// Forgets every withdrawal made by the site `origin` belongs to.
    pub fn reset_budget_for_dev_tools(&mut self, origin: &Origin) -> OperationResult {
        match self.access(DbCreationPolicy::IgnoreIfAbsent) {
            Access::Ready => {}
            Access::Absent => return OperationResult::Success,
            Access::Failed => return OperationResult::InitFailure,
        }
        let result = self.budget().reset_site(origin.site().as_str());
        match self.settle("reset_budget_for_dev_tools", result) {
            Ok(_) => OperationResult::Success,
            Err(failed) => failed,
        }
    }

    // ---- testing hooks -----------------------------------------------------

    /// Returns `false` only when the store is broken; unknown origins are
    /// left alone.
    pub fn override_creation_time_for_testing(&mut self, origin: &Origin, time: SystemTime) -> bool {
        if !matches!(self.access(DbCreationPolicy::IgnoreIfAbsent), Access::Ready) {
            return false;
        }
        let result = self
            .capacity()
            .set_creation_time(origin.as_str(), clock::to_micros(time));
        self.settle("override_creation_time_for_testing", result)
            .is_ok()
    }

    /// Returns `false` only when the store is broken; unknown keys are left
    /// alone.
    pub fn override_last_used_time_for_testing(
        &mut self,
        origin: &Origin,
        key: &str,
        time: SystemTime,
    ) -> bool {
        if !self.valid_key(key) {
            self.reject("override_last_used_time_for_testing");
            return false;
        }
        if !matches!(self.access(DbCreationPolicy::IgnoreIfAbsent), Access::Ready) {
            return false;
        }
        let result =
            self.values()
                .override_last_used_time(origin.as_str(), key, clock::to_micros(time));
        self.settle("override_last_used_time_for_testing", result)
            .is_ok()
    }

    /// Withdrawal rows recorded for `site`; `-1` when the store is broken.
    pub fn num_budget_entries_for_testing(&mut self, site: &Site) -> i64 {
        match self.access(DbCreationPolicy::IgnoreIfAbsent) {
            Access::Ready => {}
            Access::Absent => return 0,
            Access::Failed => return -1,
        }
        let result = self.budget().entry_count(site.as_str());
        self.settle("num_budget_entries_for_testing", result)
            .unwrap_or(-1)
    }

    pub fn total_num_budget_entries_for_testing(&mut self) -> i64 {
        match self.access(DbCreationPolicy::IgnoreIfAbsent) {
            Access::Ready => {}
            Access::Absent => return 0,
            Access::Failed => return -1,
        }
        let result = self.budget().total_entry_count();
        self.settle("total_num_budget_entries_for_testing", result)
            .unwrap_or(-1)
    }
}
