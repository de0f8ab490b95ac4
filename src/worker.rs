//! Runs a [`SharedStorageDatabase`] on its own thread.
//!
//! The engine is not `Send`, so it is built on the worker thread from a
//! factory and never leaves it. Jobs run one at a time, in the order they
//! were submitted.

use crate::config::SharedStorageConfig;
use crate::error::{StorageError, StorageResult};
use crate::paginate::EntriesBatch;
use crate::types::{
    BatchUpdateResult, BudgetResult, GetResult, MetadataResult, ModifierMethod, OperationResult,
    OriginUsage, SetBehavior,
};
use crate::{Origin, SharedStorageDatabase, Site};
use std::path::PathBuf;
use std::thread;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

type Job = Box<dyn FnOnce(&mut SharedStorageDatabase) + Send>;

/// Cheap to clone; every clone feeds the same worker. The worker exits once
/// the last clone is dropped.
#[derive(Clone)]
pub struct SharedStorageHandle {
    jobs: mpsc::UnboundedSender<Job>,
}

impl SharedStorageHandle {
    /// Validates `config` here so that the worker's own construction cannot
    /// fail on it.
    pub fn open(path: Option<PathBuf>, config: SharedStorageConfig) -> StorageResult<Self> {
        config.validate()?;
        Self::spawn(move || SharedStorageDatabase::new(path, config))
    }

    /// Builds the engine with `factory` on a fresh thread. If the factory
    /// fails, every later call reports [`StorageError::WorkerStopped`].
    pub fn spawn<F>(factory: F) -> StorageResult<Self>
    where
        F: FnOnce() -> StorageResult<SharedStorageDatabase> + Send + 'static,
    {
        let (jobs, mut queue) = mpsc::unbounded_channel::<Job>();
        thread::Builder::new()
            .name("shared-storage".into())
            .spawn(move || {
                let mut engine = match factory() {
                    Ok(engine) => engine,
                    Err(err) => {
                        warn!(error = %err, "shared storage worker failed to start");
                        return;
                    }
                };
                while let Some(job) = queue.blocking_recv() {
                    job(&mut engine);
                }
                debug!("shared storage worker stopped");
            })?;
        Ok(Self { jobs })
    }

    fn submit<R, F>(&self, f: F) -> StorageResult<oneshot::Receiver<R>>
    where
        F: FnOnce(&mut SharedStorageDatabase) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (reply, receiver) = oneshot::channel();
        self.jobs
            .send(Box::new(move |engine| {
                let _ = reply.send(f(engine));
            }))
            .map_err(|_| StorageError::WorkerStopped)?;
        Ok(receiver)
    }

    /// Runs `f` against the engine and waits for its result.
    pub async fn call<R, F>(&self, f: F) -> StorageResult<R>
    where
        F: FnOnce(&mut SharedStorageDatabase) -> R + Send + 'static,
        R: Send + 'static,
    {
        self.submit(f)?
            .await
            .map_err(|_| StorageError::WorkerStopped)
    }

    /// Like [`call`](Self::call) for synchronous callers. Must not be used
    /// from inside an async runtime.
    pub fn call_blocking<R, F>(&self, f: F) -> StorageResult<R>
    where
        F: FnOnce(&mut SharedStorageDatabase) -> R + Send + 'static,
        R: Send + 'static,
    {
        self.submit(f)?
            .blocking_recv()
            .map_err(|_| StorageError::WorkerStopped)
    }

    pub async fn get(&self, origin: Origin, key: String) -> StorageResult<GetResult> {
        self.call(move |db| db.get(&origin, &key)).await
    }

    pub async fn set(
        &self,
        origin: Origin,
        key: String,
        value: String,
        behavior: SetBehavior,
    ) -> StorageResult<OperationResult> {
        self.call(move |db| db.set(&origin, &key, &value, behavior))
            .await
    }

    pub async fn append(
        &self,
        origin: Origin,
        key: String,
        tail: String,
    ) -> StorageResult<OperationResult> {
        self.call(move |db| db.append(&origin, &key, &tail)).await
    }

    pub async fn delete(&self, origin: Origin, key: String) -> StorageResult<OperationResult> {
        self.call(move |db| db.delete(&origin, &key)).await
    }

    pub async fn clear(&self, origin: Origin) -> StorageResult<OperationResult> {
        self.call(move |db| db.clear(&origin)).await
    }

    pub async fn length(&self, origin: Origin) -> StorageResult<i64> {
        self.call(move |db| db.length(&origin)).await
    }

    pub async fn bytes_used(&self, origin: Origin) -> StorageResult<i64> {
        self.call(move |db| db.bytes_used(&origin)).await
    }

    /// Batches arrive on `listener` while the worker streams them.
    pub async fn keys(
        &self,
        origin: Origin,
        mut listener: mpsc::UnboundedSender<EntriesBatch>,
    ) -> StorageResult<OperationResult> {
        self.call(move |db| db.keys(&origin, &mut listener)).await
    }

    pub async fn entries(
        &self,
        origin: Origin,
        mut listener: mpsc::UnboundedSender<EntriesBatch>,
    ) -> StorageResult<OperationResult> {
        self.call(move |db| db.entries(&origin, &mut listener)).await
    }

    pub async fn batch_update(
        &self,
        origin: Origin,
        methods: Vec<ModifierMethod>,
    ) -> StorageResult<BatchUpdateResult> {
        self.call(move |db| db.batch_update(&origin, &methods))
            .await
    }

    pub async fn make_budget_withdrawal(
        &self,
        site: Site,
        bits_debit: f64,
    ) -> StorageResult<OperationResult> {
        self.call(move |db| db.make_budget_withdrawal(&site, bits_debit))
            .await
    }

    pub async fn get_remaining_budget(&self, site: Site) -> StorageResult<BudgetResult> {
        self.call(move |db| db.get_remaining_budget(&site)).await
    }

    pub async fn get_metadata(&self, origin: Origin) -> StorageResult<MetadataResult> {
        self.call(move |db| db.get_metadata(&origin)).await
    }

    pub async fn fetch_origins(&self) -> StorageResult<Vec<OriginUsage>> {
        self.call(|db| db.fetch_origins()).await
    }

    pub async fn purge_stale(&self) -> StorageResult<OperationResult> {
        self.call(|db| db.purge_stale()).await
    }

    pub async fn destroy(&self) -> StorageResult<bool> {
        self.call(|db| db.destroy()).await
    }

    pub async fn trim_memory(&self) -> StorageResult<()> {
        self.call(|db| db.trim_memory()).await
    }
}
