//! Streams an origin's live keys or entries to a listener in bounded batches.

use crate::capacity::CapacityGuard;
use crate::codec;
use crate::error::{StorageError, StorageResult};
use crate::store::StoreContext;
use crate::types::OperationResult;
use rusqlite::params;
use tokio::sync::mpsc::UnboundedSender;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyAndOrValue {
    pub key: String,
    /// `None` when only keys were requested.
    pub value: Option<String>,
}

/// One delivery to an [`EntriesListener`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntriesBatch {
    pub success: bool,
    pub error_message: Option<String>,
    pub entries: Vec<KeyAndOrValue>,
    pub has_more_entries: bool,
    /// Live rows counted before streaming started.
    pub total_queued_to_send: i32,
}

impl EntriesBatch {
    pub(crate) fn empty_success() -> Self {
        Self {
            success: true,
            error_message: None,
            entries: Vec::new(),
            has_more_entries: false,
            total_queued_to_send: 0,
        }
    }

    pub(crate) fn failure(message: &str, total_queued_to_send: i32) -> Self {
        Self {
            success: false,
            error_message: Some(message.to_string()),
            entries: Vec::new(),
            has_more_entries: false,
            total_queued_to_send,
        }
    }
}

/// Receives batches synchronously, in order, from `keys`/`entries`.
pub trait EntriesListener {
    fn did_read_entries(&mut self, batch: EntriesBatch);
}

impl EntriesListener for Vec<EntriesBatch> {
    fn did_read_entries(&mut self, batch: EntriesBatch) {
        self.push(batch);
    }
}

impl EntriesListener for UnboundedSender<EntriesBatch> {
    fn did_read_entries(&mut self, batch: EntriesBatch) {
        // A dropped receiver just stops listening.
        let _ = self.send(batch);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Projection {
    Keys,
    Entries,
}

impl Projection {
    fn noun(self) -> &'static str {
        match self {
            Projection::Keys => "keys",
            Projection::Entries => "entries",
        }
    }
}

pub struct ResultPaginator<'a> {
    ctx: StoreContext<'a>,
}

impl<'a> ResultPaginator<'a> {
    pub fn new(ctx: StoreContext<'a>) -> Self {
        Self { ctx }
    }

    /// Every failure is reported to the listener before it is returned. The
    /// underlying error, if any, is handed back for recovery.
    pub fn stream(
        &self,
        origin: &str,
        projection: Projection,
        listener: &mut dyn EntriesListener,
    ) -> (OperationResult, Option<StorageError>) {
        let count = match CapacityGuard::new(self.ctx).live_entries(origin) {
            Ok(count) => count,
            Err(err) => {
                warn!(origin, error = %err, "counting live {} failed", projection.noun());
                listener.did_read_entries(EntriesBatch::failure(
                    &format!("SQL database could not retrieve {} count.", projection.noun()),
                    0,
                ));
                return (OperationResult::SqlError, Some(err));
            }
        };
        let Ok(total) = i32::try_from(count) else {
            listener.did_read_entries(EntriesBatch::failure(
                &format!("Unexpectedly found more than i32::MAX {}.", projection.noun()),
                0,
            ));
            return (OperationResult::TooManyFound, None);
        };
        if total == 0 {
            listener.did_read_entries(EntriesBatch::empty_success());
            return (OperationResult::Success, None);
        }

        match self.send_batches(origin, projection, total, listener) {
            Ok(()) => (OperationResult::Success, None),
            Err(err) => {
                warn!(origin, error = %err, "streaming {} failed", projection.noun());
                listener.did_read_entries(EntriesBatch::failure(
                    &format!(
                        "SQL database encountered an error while retrieving {}.",
                        projection.noun()
                    ),
                    total,
                ));
                (OperationResult::SqlError, Some(err))
            }
        }
    }

    fn send_batches(
        &self,
        origin: &str,
        projection: Projection,
        total: i32,
        listener: &mut dyn EntriesListener,
    ) -> StorageResult<()> {
        let batch_size = self.ctx.config.max_iterator_batch_size;
        let conn = self.ctx.conn()?;
        let mut stmt = conn.prepare_cached(match projection {
            Projection::Keys => {
                "SELECT key FROM values_mapping \
                 WHERE context_origin=?1 AND last_used_time>=?2 ORDER BY key"
            }
            Projection::Entries => {
                "SELECT key,value FROM values_mapping \
                 WHERE context_origin=?1 AND last_used_time>=?2 ORDER BY key"
            }
        })?;
        let mut rows = stmt.query(params![origin, self.ctx.stale_cutoff()])?;

        // The row that overflowed the previous batch opens the next one.
        let mut carried: Option<KeyAndOrValue> = None;
        loop {
            let mut entries = Vec::with_capacity(batch_size.min(total as usize));
            entries.extend(carried.take());
            while let Some(row) = rows.next()? {
                let key = codec::decode(&row.get::<_, Vec<u8>>(0)?)?;
                let value = match projection {
                    Projection::Keys => None,
                    Projection::Entries => Some(codec::decode(&row.get::<_, Vec<u8>>(1)?)?),
                };
                let item = KeyAndOrValue { key, value };
                if entries.len() < batch_size {
                    entries.push(item);
                } else {
                    carried = Some(item);
                    break;
                }
            }
            let has_more_entries = carried.is_some();
            listener.did_read_entries(EntriesBatch {
                success: true,
                error_message: None,
                entries,
                has_more_entries,
                total_queued_to_send: total,
            });
            if !has_more_entries {
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sender_listener_forwards_batches() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut listener = tx;
        listener.did_read_entries(EntriesBatch::empty_success());
        let received = rx.try_recv().expect("batch");
        assert!(received.success);
        assert!(received.entries.is_empty());
    }

    #[test]
    fn failure_batches_carry_message_and_total() {
        let batch = EntriesBatch::failure("boom", 7);
        assert!(!batch.success);
        assert_eq!(batch.error_message.as_deref(), Some("boom"));
        assert_eq!(batch.total_queued_to_send, 7);
        assert!(!batch.has_more_entries);
    }
}
